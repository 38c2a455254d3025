//! Versioned ASCII armoring for pill bytes
//!
//! Envelopes are raw bytes; anywhere they travel inside JSON records or
//! terminal output they are wrapped in a version-prefixed base64url form:
//! - Free of whitespace (including newlines)
//! - Safe to embed in URLs
//! - Safe to pass unescaped in a POSIX shell

use crate::error::{ErrorCategory, ErrorKind, PillboxError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Magic prefix for all pillbox armor versions
const MAGIC_PREFIX: &str = "pillbox";

/// Version 1 magic marker
const V1_MAGIC: &str = "pillbox1:";

/// Wrap bytes in armor, returning the armored string
///
/// Format: pillbox1:{base64url-no-padding}
pub fn wrap(body: &[u8]) -> String {
    let encoded = URL_SAFE_NO_PAD.encode(body);
    format!("{}{}", V1_MAGIC, encoded)
}

/// Unwrap an armored string, returning the original bytes
pub fn unwrap(armored: &str) -> Result<Vec<u8>> {
    if armored.len() < V1_MAGIC.len() {
        return Err(PillboxError::with_kind(
            ErrorCategory::User,
            ErrorKind::ArmoringInvalid,
            "input shorter than the magic marker; likely truncated",
        ));
    }

    if let Some(encoded) = armored.strip_prefix(V1_MAGIC) {
        let body = URL_SAFE_NO_PAD.decode(encoded).map_err(|e| {
            PillboxError::with_kind_and_source(
                ErrorCategory::User,
                ErrorKind::ArmoringDecode,
                format!("base64 decoding failed: {}", e),
                e,
            )
        })?;
        Ok(body)
    } else if armored.starts_with(MAGIC_PREFIX) {
        Err(PillboxError::with_kind(
            ErrorCategory::User,
            ErrorKind::ArmoringFromFuture,
            "input claims to be a pill, but not a version we support",
        ))
    } else {
        Err(PillboxError::with_kind(
            ErrorCategory::User,
            ErrorKind::ArmoringInvalid,
            "input unrecognized as pillbox data",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        for body in [&b""[..], b"x", b"some pill bytes"] {
            let armored = wrap(body);
            assert_eq!(body, &unwrap(&armored).unwrap()[..]);
        }
    }

    #[test]
    fn test_all_byte_values_roundtrip() {
        let bytes: Vec<u8> = (0..=255).collect();
        let armored = wrap(&bytes);
        assert_eq!(bytes, unwrap(&armored).unwrap());
    }

    #[test]
    fn test_armor_is_clean_ascii() {
        // Bytes that would hit +, / and = in standard base64.
        let bytes = vec![0xFFu8; 100];
        let armored = wrap(&bytes);

        assert!(!armored.contains(' '));
        assert!(!armored.contains('\n'));
        assert!(!armored.contains('+'));
        assert!(!armored.contains('/'));
        assert!(!armored.contains('='));
    }

    #[test]
    fn test_truncated_input() {
        let err = unwrap("").expect_err("expected truncation error");
        assert_eq!(err.kind, Some(ErrorKind::ArmoringInvalid));
    }

    #[test]
    fn test_future_version() {
        let err = unwrap("pillbox9000:...").expect_err("expected version error");
        assert_eq!(err.kind, Some(ErrorKind::ArmoringFromFuture));
    }

    #[test]
    fn test_foreign_input() {
        let err = unwrap("not pill data at all").expect_err("expected rejection");
        assert_eq!(err.kind, Some(ErrorKind::ArmoringInvalid));
    }

    #[test]
    fn test_bad_base64() {
        let err = unwrap("pillbox1:$$$").expect_err("expected decode error");
        assert_eq!(err.kind, Some(ErrorKind::ArmoringDecode));
    }
}
