//! Sanitized content previews for logging: raw transcript/PHI text must
//! never reach a log line. `sha256(content)[:12] + len` is the
//! stand-in logged in place of error text that might carry content —
//! the generic stage-task failure log in `sf-worker` and the audit
//! stage's in-call retry log both emit `ContentPreview` instead of the
//! raw error string.

use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentPreview {
    hash_prefix: String,
    len: usize,
}

impl ContentPreview {
    pub fn of(content: &str) -> Self {
        let digest = Sha256::digest(content.as_bytes());
        let hex = hex::encode(digest);
        Self {
            hash_prefix: hex[..12].to_string(),
            len: content.len(),
        }
    }
}

impl fmt::Display for ContentPreview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.hash_prefix, self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_hides_content_but_is_deterministic() {
        let a = ContentPreview::of("patient john doe, dob 1980-01-01");
        let b = ContentPreview::of("patient john doe, dob 1980-01-01");
        assert_eq!(a, b);
        assert_eq!(a.to_string().len(), 12 + 1 + a.len.to_string().len());
    }

    #[test]
    fn different_content_gives_different_preview() {
        let a = ContentPreview::of("alpha");
        let b = ContentPreview::of("beta");
        assert_ne!(a, b);
    }
}
