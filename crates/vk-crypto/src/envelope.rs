//! Exchange envelope: binary wire format for sealed request/response payloads.
//!
//! XChaCha20-Poly1305 only. Fixed layout:
//!
//! | Offset | Size | Field                         |
//! |--------|------|-------------------------------|
//! | 0      | 1    | version (0x01)                |
//! | 1      | 1    | alg_id (0x01)                 |
//! | 2      | 24   | nonce                         |
//! | 26     | N    | ciphertext                    |
//! | 26+N   | 16   | Poly1305 tag                  |
//!
//! The two header bytes are the AEAD associated data, so a downgrade of either
//! field breaks authentication rather than changing how the payload is read.
//! On the wire the whole envelope is base64url without padding.

use std::fmt;

use crate::{decode_base64url, encode_base64url};

/// Current envelope version.
const VERSION: u8 = 0x01;
/// Algorithm identifier for XChaCha20-Poly1305.
pub(crate) const ALG_XCHACHA20_POLY1305: u8 = 0x01;
/// Header size: version(1) + alg(1).
pub(crate) const HEADER_SIZE: usize = 2;
/// XChaCha20 nonce size.
pub const NONCE_SIZE: usize = 24;
/// Poly1305 tag size.
pub const TAG_SIZE: usize = 16;
/// Smallest valid envelope: header + nonce + tag around an empty plaintext.
const MIN_ENVELOPE_SIZE: usize = HEADER_SIZE + NONCE_SIZE + TAG_SIZE; // 42
/// Largest accepted envelope (1 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// A structurally valid exchange envelope.
///
/// Structural validity says nothing about authenticity: only
/// [`crate::decode`] with the right key proves the payload is genuine.
#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    raw: Vec<u8>,
}

/// Errors from envelope parsing or construction.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope is not valid base64url")]
    InvalidEncoding,
    #[error("envelope too small")]
    TooSmall,
    #[error("envelope too large")]
    TooLarge,
    #[error("unsupported envelope version")]
    UnsupportedVersion,
    #[error("unsupported envelope algorithm")]
    UnsupportedAlgorithm,
}

impl Envelope {
    /// Parse and validate raw envelope bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope is too small/large or carries an
    /// unknown version or algorithm tag.
    pub fn parse(bytes: Vec<u8>) -> Result<Self, EnvelopeError> {
        if bytes.len() < MIN_ENVELOPE_SIZE {
            return Err(EnvelopeError::TooSmall);
        }
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(EnvelopeError::TooLarge);
        }
        if bytes[0] != VERSION {
            return Err(EnvelopeError::UnsupportedVersion);
        }
        if bytes[1] != ALG_XCHACHA20_POLY1305 {
            return Err(EnvelopeError::UnsupportedAlgorithm);
        }
        Ok(Self { raw: bytes })
    }

    /// Parse the base64url transport form.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::InvalidEncoding`] for bad base64url, otherwise
    /// the same errors as [`Envelope::parse`].
    pub fn from_wire(encoded: &str) -> Result<Self, EnvelopeError> {
        // Reject before decoding so oversized bodies are never buffered twice.
        if encoded.len() > MAX_ENVELOPE_SIZE.div_ceil(3) * 4 {
            return Err(EnvelopeError::TooLarge);
        }
        let bytes = decode_base64url(encoded.trim()).map_err(|_| EnvelopeError::InvalidEncoding)?;
        Self::parse(bytes)
    }

    /// Assemble an envelope from a nonce and AEAD output (`ciphertext || tag`).
    ///
    /// # Errors
    ///
    /// Returns an error if the sealed payload is shorter than a tag or the
    /// result would exceed [`MAX_ENVELOPE_SIZE`].
    pub fn build(nonce: &[u8; NONCE_SIZE], sealed: &[u8]) -> Result<Self, EnvelopeError> {
        if sealed.len() < TAG_SIZE {
            return Err(EnvelopeError::TooSmall);
        }
        let total = HEADER_SIZE + NONCE_SIZE + sealed.len();
        if total > MAX_ENVELOPE_SIZE {
            return Err(EnvelopeError::TooLarge);
        }

        let mut raw = Vec::with_capacity(total);
        raw.extend_from_slice(&header());
        raw.extend_from_slice(nonce);
        raw.extend_from_slice(sealed);
        Ok(Self { raw })
    }

    /// The associated-data header (version, algorithm).
    #[must_use]
    pub fn header(&self) -> &[u8] {
        &self.raw[..HEADER_SIZE]
    }

    /// The algorithm tag.
    #[must_use]
    pub fn algorithm(&self) -> u8 {
        self.raw[1]
    }

    #[must_use]
    pub fn nonce(&self) -> &[u8] {
        &self.raw[HEADER_SIZE..HEADER_SIZE + NONCE_SIZE]
    }

    /// Ciphertext followed by the Poly1305 tag.
    #[must_use]
    pub fn sealed_payload(&self) -> &[u8] {
        &self.raw[HEADER_SIZE + NONCE_SIZE..]
    }

    /// The trailing integrity tag.
    #[must_use]
    pub fn tag(&self) -> &[u8] {
        &self.raw[self.raw.len() - TAG_SIZE..]
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Encode for transport in a request body or query parameter.
    #[must_use]
    pub fn to_wire(&self) -> String {
        encode_base64url(&self.raw)
    }
}

pub(crate) const fn header() -> [u8; HEADER_SIZE] {
    [VERSION, ALG_XCHACHA20_POLY1305]
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("version", &self.raw[0])
            .field("algorithm", &self.raw[1])
            .field("size", &self.raw.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed() -> Vec<u8> {
        vec![0xCC; TAG_SIZE + 8]
    }

    #[test]
    fn build_and_parse_roundtrip() {
        let nonce = [0xBB; NONCE_SIZE];
        let envelope = Envelope::build(&nonce, &sealed()).expect("build");
        assert_eq!(envelope.nonce(), &nonce);
        assert_eq!(envelope.sealed_payload(), sealed().as_slice());
        assert_eq!(envelope.tag(), &[0xCC; TAG_SIZE]);

        let parsed = Envelope::from_wire(&envelope.to_wire()).expect("parse");
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn parse_rejects_too_small() {
        assert_eq!(
            Envelope::parse(vec![VERSION, ALG_XCHACHA20_POLY1305, 0, 0]),
            Err(EnvelopeError::TooSmall)
        );
    }

    #[test]
    fn parse_rejects_too_large() {
        let mut raw = vec![0u8; MAX_ENVELOPE_SIZE + 1];
        raw[0] = VERSION;
        raw[1] = ALG_XCHACHA20_POLY1305;
        assert_eq!(Envelope::parse(raw), Err(EnvelopeError::TooLarge));
    }

    #[test]
    fn parse_rejects_wrong_version() {
        let mut raw = vec![0u8; MIN_ENVELOPE_SIZE];
        raw[0] = 0x02;
        raw[1] = ALG_XCHACHA20_POLY1305;
        assert_eq!(Envelope::parse(raw), Err(EnvelopeError::UnsupportedVersion));
    }

    #[test]
    fn parse_rejects_unknown_algorithm() {
        let mut raw = vec![0u8; MIN_ENVELOPE_SIZE];
        raw[0] = VERSION;
        raw[1] = 0x7F;
        assert_eq!(
            Envelope::parse(raw),
            Err(EnvelopeError::UnsupportedAlgorithm)
        );
    }

    #[test]
    fn from_wire_rejects_garbage() {
        assert_eq!(
            Envelope::from_wire("%%% definitely not base64 %%%"),
            Err(EnvelopeError::InvalidEncoding)
        );
    }

    #[test]
    fn build_rejects_missing_tag() {
        assert_eq!(
            Envelope::build(&[0; NONCE_SIZE], &[0u8; 4]),
            Err(EnvelopeError::TooSmall)
        );
    }
}
