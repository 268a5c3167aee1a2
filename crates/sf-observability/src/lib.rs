//! Structured logging, request context propagation, and minimal
//! metrics shared by every HTTP-facing service binary.

use axum::{
    extract::{Request, State},
    http::{header::HeaderValue, HeaderName, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, Instrument};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
/// Cloud Tasks / Pub/Sub delivery-attempt header.
pub const DELIVERY_ATTEMPT_HEADER: &str = "x-delivery-attempt";

#[derive(Clone, Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub correlation_id: String,
    pub delivery_attempt: u32,
    pub started_at: chrono::DateTime<Utc>,
}

impl RequestContext {
    pub fn new() -> Self {
        let id = generate_request_id();
        Self {
            request_id: id.clone(),
            correlation_id: id,
            delivery_attempt: 1,
            started_at: Utc::now(),
        }
    }

    pub fn from_headers(headers: &axum::http::HeaderMap) -> Self {
        let request_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_else(generate_request_id);

        let correlation_id = headers
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_else(|| request_id.clone());

        let delivery_attempt = headers
            .get(DELIVERY_ATTEMPT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Self {
            request_id,
            correlation_id,
            delivery_attempt,
            started_at: Utc::now(),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_request_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let random: u32 = rand::random();
    format!("req_{:x}{:08x}", timestamp, random)
}

/// Initializes the global tracing subscriber from `RUST_LOG`, falling
/// back to `<crate>=<level>,tower_http=<level>` when unset.
pub fn init_tracing(crate_name: &str, default_level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let default_filter = format!("{crate_name}={default_level},tower_http={default_level}");
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_success: AtomicU64,
    pub requests_client_error: AtomicU64,
    pub requests_server_error: AtomicU64,
    pub request_latency_us_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, status: StatusCode, latency_us: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.request_latency_us_total
            .fetch_add(latency_us, Ordering::Relaxed);

        if status.is_success() {
            self.requests_success.fetch_add(1, Ordering::Relaxed);
        } else if status.is_client_error() {
            self.requests_client_error.fetch_add(1, Ordering::Relaxed);
        } else if status.is_server_error() {
            self.requests_server_error.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.requests_total.load(Ordering::Relaxed);
        let latency_total = self.request_latency_us_total.load(Ordering::Relaxed);

        MetricsSnapshot {
            requests_total: total,
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_client_error: self.requests_client_error.load(Ordering::Relaxed),
            requests_server_error: self.requests_server_error.load(Ordering::Relaxed),
            avg_latency_ms: if total > 0 {
                (latency_total / total) as f64 / 1000.0
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_client_error: u64,
    pub requests_server_error: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub service: String,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub timestamp: String,
    pub http: MetricsSnapshot,
}

#[derive(Clone)]
pub struct MetricsState {
    pub service_name: &'static str,
    pub metrics: Arc<Metrics>,
    pub start_time: Instant,
}

pub async fn metrics_endpoint(State(state): State<MetricsState>) -> Json<MetricsResponse> {
    let uptime = state.start_time.elapsed().as_secs();

    Json(MetricsResponse {
        service: state.service_name.to_string(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: uptime,
        timestamp: Utc::now().to_rfc3339(),
        http: state.metrics.snapshot(),
    })
}

pub async fn request_context_middleware(mut request: Request, next: Next) -> Response {
    let start = Instant::now();
    let ctx = RequestContext::from_headers(request.headers());

    let span = info_span!(
        "http_request",
        request_id = %ctx.request_id,
        correlation_id = %ctx.correlation_id,
        delivery_attempt = ctx.delivery_attempt,
        method = %request.method(),
        uri = %request.uri(),
    );

    request.extensions_mut().insert(ctx.clone());

    let response = next.run(request).instrument(span.clone()).await;

    let latency = start.elapsed();
    let status = response.status();
    span.in_scope(|| {
        info!(status = %status.as_u16(), latency_ms = %latency.as_millis(), "request completed");
    });

    let mut response = response;
    if let Ok(header_value) = HeaderValue::from_str(&ctx.request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), header_value);
    }

    response
}

pub async fn metrics_middleware(
    State(metrics): State<Arc<Metrics>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let response = next.run(request).await;
    let latency_us = start.elapsed().as_micros() as u64;
    metrics.record_request(response.status(), latency_us);
    response
}

#[derive(Clone, Debug)]
pub struct ExtractRequestContext(pub RequestContext);

#[axum::async_trait]
impl<S> axum::extract::FromRequestParts<S> for ExtractRequestContext
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        let ctx = parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_else(RequestContext::new);
        Ok(ExtractRequestContext(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn request_id_generation_has_expected_prefix() {
        let id = generate_request_id();
        assert!(id.starts_with("req_"));
    }

    #[test]
    fn context_defaults_correlation_to_request_id() {
        let headers = HeaderMap::new();
        let ctx = RequestContext::from_headers(&headers);
        assert_eq!(ctx.request_id, ctx.correlation_id);
        assert_eq!(ctx.delivery_attempt, 1);
    }

    #[test]
    fn context_reads_delivery_attempt_header() {
        let mut headers = HeaderMap::new();
        headers.insert(DELIVERY_ATTEMPT_HEADER, "3".parse().unwrap());
        let ctx = RequestContext::from_headers(&headers);
        assert_eq!(ctx.delivery_attempt, 3);
    }

    #[test]
    fn metrics_snapshot_buckets_by_status_class() {
        let metrics = Metrics::new();
        metrics.record_request(StatusCode::OK, 1_000);
        metrics.record_request(StatusCode::NOT_FOUND, 500);
        metrics.record_request(StatusCode::INTERNAL_SERVER_ERROR, 2_000);

        let snap = metrics.snapshot();
        assert_eq!(snap.requests_total, 3);
        assert_eq!(snap.requests_success, 1);
        assert_eq!(snap.requests_client_error, 1);
        assert_eq!(snap.requests_server_error, 1);
    }
}
