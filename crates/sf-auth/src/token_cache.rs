//! Per-audience outbound identity-token cache.
//!
//! Every process that calls another internal service (ingestion →
//! orchestrator, a stage worker → the task queue) needs a freshly
//! minted identity token per call. Minting is cheap but not free, so a
//! small cache with a conservative 5-minute TTL is kept — short enough
//! that an expired/rotated credential is never used past its welcome.
//! This is the one acceptable piece of shared mutable cache state in the
//! system; unlike a module-level static, it is an explicitly constructed
//! resource owned by whichever `AppState` holds it.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Mints a bearer identity token scoped to `audience`. The concrete
/// implementation (a cloud metadata-server call, a workload-identity
/// federation exchange, ...) is an external collaborator; this trait is
/// the seam a real minter plugs into.
pub trait TokenMinter: Send + Sync {
    fn mint(&self, audience: &str) -> impl Future<Output = Result<String, TokenMintError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum TokenMintError {
    #[error("identity provider unreachable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// A fixed-token minter for local development and tests — never reaches
/// a real identity provider.
pub struct StaticTokenMinter(pub String);

impl TokenMinter for StaticTokenMinter {
    async fn mint(&self, _audience: &str) -> Result<String, TokenMintError> {
        Ok(self.0.clone())
    }
}

/// Mints identity tokens from the cloud instance metadata server, the
/// standard source for service identity on Cloud Run:
/// `GET .../identity?audience=<aud>` with the `Metadata-Flavor: Google`
/// header, no further credentials needed.
pub struct GcpMetadataTokenMinter {
    http: reqwest::Client,
    metadata_base: String,
}

impl GcpMetadataTokenMinter {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            metadata_base: "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/identity".to_string(),
        }
    }
}

impl TokenMinter for GcpMetadataTokenMinter {
    async fn mint(&self, audience: &str) -> Result<String, TokenMintError> {
        let response = self
            .http
            .get(&self.metadata_base)
            .query(&[("audience", audience)])
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| TokenMintError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TokenMintError::Unavailable(format!(
                "metadata server returned {}",
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| TokenMintError::Unavailable(e.to_string()))
    }
}

const CACHE_TTL_SECS: i64 = 300;

/// Wraps a `TokenMinter` with a per-audience cache. Concurrent
/// refreshers may race on a cache miss — both will mint and the last
/// write wins — which is fine since minting is idempotent from the
/// caller's perspective; the cache is an optimization, not a source of
/// truth.
pub struct IdentityTokenCache<M: TokenMinter> {
    minter: M,
    cache: Arc<RwLock<HashMap<String, CachedToken>>>,
}

impl<M: TokenMinter> IdentityTokenCache<M> {
    pub fn new(minter: M) -> Self {
        Self {
            minter,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns a cached token for `audience` if it has more than a
    /// minute of headroom left, otherwise mints a fresh one and caches
    /// it for `CACHE_TTL_SECS`.
    pub async fn get(&self, audience: &str) -> Result<String, TokenMintError> {
        let now = Utc::now();
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(audience) {
                if cached.expires_at - Duration::seconds(60) > now {
                    return Ok(cached.token.clone());
                }
            }
        }

        let token = self.minter.mint(audience).await?;
        let mut cache = self.cache.write().await;
        cache.insert(
            audience.to_string(),
            CachedToken {
                token: token.clone(),
                expires_at: now + Duration::seconds(CACHE_TTL_SECS),
            },
        );
        debug!(audience, "identity token minted and cached");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingMinter(AtomicUsize);

    impl TokenMinter for CountingMinter {
        async fn mint(&self, audience: &str) -> Result<String, TokenMintError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{audience}-token-{n}"))
        }
    }

    #[tokio::test]
    async fn second_call_within_ttl_reuses_cached_token() {
        let cache = IdentityTokenCache::new(CountingMinter(AtomicUsize::new(0)));
        let first = cache.get("aud-a").await.unwrap();
        let second = cache.get("aud-a").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn distinct_audiences_mint_independently() {
        let cache = IdentityTokenCache::new(CountingMinter(AtomicUsize::new(0)));
        let a = cache.get("aud-a").await.unwrap();
        let b = cache.get("aud-b").await.unwrap();
        assert_ne!(a, b);
    }
}
