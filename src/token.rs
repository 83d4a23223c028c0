//! Short-lived signed tokens for resource downloads. A node answering a
//! find-resource request builds a URL whose query string carries the
//! resource id, an expiry timestamp, and a SHA-256 signature over the
//! node's secret; the serving side validates before returning bytes.

use sha2::{Digest, Sha256};

use crate::config::TOKEN_LIFETIME_SECS;
use crate::error::NetError;

/// Per-process signing secret. Generated once, never sent on the wire.
#[derive(Clone)]
pub struct TokenKey([u8; 32]);

impl TokenKey {
    pub fn generate() -> Self {
        Self(rand::random::<[u8; 32]>())
    }
}

fn sign(key: &TokenKey, resource: &str, expiry: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.0);
    hasher.update(resource.as_bytes());
    hasher.update(expiry.to_be_bytes());
    hex::encode(hasher.finalize())
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Build the server-relative download URL advertised for `resource`.
/// The path component is percent-escaped; the token is scoped to this
/// one resource and expires after [`TOKEN_LIFETIME_SECS`].
pub fn advertise_url(key: &TokenKey, resource: &str) -> String {
    let expiry = now_secs() + TOKEN_LIFETIME_SECS;
    let sig = sign(key, resource, expiry);
    format!(
        "/res/{}?rid={}&t={expiry}&sig={sig}",
        percent_escape(resource),
        percent_escape(resource),
    )
}

/// Server-side check of a presented token. Rejects bad signatures and
/// expired timestamps; the comparison is over hex strings of fixed
/// length, so length leaks nothing.
pub fn validate(key: &TokenKey, resource: &str, expiry: u64, sig: &str) -> Result<(), NetError> {
    if now_secs() > expiry {
        return Err(NetError::InvalidToken);
    }
    if sign(key, resource, expiry) != sig {
        return Err(NetError::InvalidToken);
    }
    Ok(())
}

/// Percent-escape a URL path or query component. Unreserved characters
/// pass through; everything else, including reserved URL characters and
/// non-ASCII bytes, is escaped.
pub fn percent_escape(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for byte in component.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                out.push(byte as char);
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_validate_roundtrip() {
        let key = TokenKey::generate();
        let expiry = now_secs() + 30;
        let sig = sign(&key, "media/a.mov", expiry);
        assert!(validate(&key, "media/a.mov", expiry, &sig).is_ok());
    }

    #[test]
    fn test_validate_rejects_other_resource() {
        let key = TokenKey::generate();
        let expiry = now_secs() + 30;
        let sig = sign(&key, "media/a.mov", expiry);
        assert!(matches!(
            validate(&key, "media/b.mov", expiry, &sig),
            Err(NetError::InvalidToken)
        ));
    }

    #[test]
    fn test_validate_rejects_expired() {
        let key = TokenKey::generate();
        let expiry = now_secs().saturating_sub(1);
        let sig = sign(&key, "media/a.mov", expiry);
        assert!(matches!(
            validate(&key, "media/a.mov", expiry, &sig),
            Err(NetError::InvalidToken)
        ));
    }

    #[test]
    fn test_validate_rejects_other_key() {
        let a = TokenKey::generate();
        let b = TokenKey::generate();
        let expiry = now_secs() + 30;
        let sig = sign(&a, "media/a.mov", expiry);
        assert!(validate(&b, "media/a.mov", expiry, &sig).is_err());
    }

    #[test]
    fn test_percent_escape_unreserved_passthrough() {
        assert_eq!(percent_escape("media/intro-01_v2.mov"), "media/intro-01_v2.mov");
    }

    #[test]
    fn test_percent_escape_reserved_and_utf8() {
        assert_eq!(percent_escape("a b"), "a%20b");
        assert_eq!(percent_escape("a&b=c"), "a%26b%3Dc");
        // two-byte UTF-8 sequence escapes byte-wise
        assert_eq!(percent_escape("ä"), "%C3%A4");
    }

    #[test]
    fn test_advertise_url_shape() {
        let key = TokenKey::generate();
        let url = advertise_url(&key, "media/a b.mov");
        assert!(url.starts_with("/res/media/a%20b.mov?rid="));
        assert!(url.contains("&t="));
        assert!(url.contains("&sig="));
    }
}
