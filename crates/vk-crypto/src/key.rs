//! Session key: the 256-bit symmetric secret bound to one authenticated session.

use std::fmt;

use chacha20poly1305::aead::{KeyInit, OsRng};
use chacha20poly1305::XChaCha20Poly1305;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{decode_base64url, encode_base64url};

/// Size of a session key in bytes.
pub const KEY_SIZE: usize = 32;

/// A symmetric session key. Zeroized on drop; `Debug` never prints the bytes.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

/// Error returned when key material has the wrong shape.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("session key must be {KEY_SIZE} bytes, got {0}")]
    InvalidLength(usize),
    #[error("session key is not valid base64url")]
    InvalidEncoding,
}

impl SessionKey {
    /// Draw a fresh key from the OS random source.
    #[must_use]
    pub fn generate() -> Self {
        let key = XChaCha20Poly1305::generate_key(&mut OsRng);
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a key from a base64url string (the form handed to the browser).
    ///
    /// # Errors
    /// Returns [`KeyError`] if the string is not base64url or not 32 bytes.
    pub fn from_base64url(encoded: &str) -> Result<Self, KeyError> {
        let mut raw = decode_base64url(encoded).map_err(|_| KeyError::InvalidEncoding)?;
        let result = <[u8; KEY_SIZE]>::try_from(raw.as_slice())
            .map(Self)
            .map_err(|_| KeyError::InvalidLength(raw.len()));
        raw.zeroize();
        result
    }

    #[must_use]
    pub fn to_base64url(&self) -> String {
        encode_base64url(&self.0)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_differ() {
        assert_ne!(SessionKey::generate(), SessionKey::generate());
    }

    #[test]
    fn base64url_roundtrip() {
        let key = SessionKey::generate();
        let parsed = SessionKey::from_base64url(&key.to_base64url()).expect("parse");
        assert_eq!(parsed, key);
    }

    #[test]
    fn rejects_short_key() {
        let short = encode_base64url(&[1u8; 16]);
        assert!(matches!(
            SessionKey::from_base64url(&short),
            Err(KeyError::InvalidLength(16))
        ));
    }

    #[test]
    fn rejects_bad_encoding() {
        assert!(matches!(
            SessionKey::from_base64url("!!not base64!!"),
            Err(KeyError::InvalidEncoding)
        ));
    }

    #[test]
    fn debug_does_not_leak_bytes() {
        let key = SessionKey::from_bytes([0xAB; KEY_SIZE]);
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("171"));
        assert!(!rendered.to_lowercase().contains("ab"));
    }
}
