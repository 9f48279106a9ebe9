//! Exchange codec: seal a structured payload under a session key, and open it again.
//!
//! The codec holds no state. Every call gets the key from the caller and
//! `encode` draws a fresh random 192-bit nonce, so nonces never repeat under
//! one key in practice.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::envelope::{header, Envelope, EnvelopeError, NONCE_SIZE};
use crate::SessionKey;

/// Decoding failures. Both variants are terminal for the request.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Wrong key, corrupted in transit, or tampered with.
    #[error("envelope authentication failed")]
    AuthenticationFailed,
    /// The wire structure (or the authenticated payload shape) is unusable.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

impl From<EnvelopeError> for DecodeError {
    fn from(err: EnvelopeError) -> Self {
        Self::MalformedEnvelope(err.to_string())
    }
}

/// Encoding failures.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("payload encryption failed")]
    Encryption,
    #[error("{0}")]
    Envelope(#[from] EnvelopeError),
}

/// Seal raw bytes under `key`.
///
/// # Errors
/// Returns [`EncodeError`] if encryption fails or the envelope would be too large.
pub fn seal(plaintext: &[u8], key: &SessionKey) -> Result<Envelope, EncodeError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let aad = header();

    let sealed = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| EncodeError::Encryption)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(&nonce);
    Ok(Envelope::build(&nonce_bytes, &sealed)?)
}

/// Open an envelope and return the authenticated plaintext bytes.
///
/// # Errors
/// Returns [`DecodeError::AuthenticationFailed`] if the tag does not verify.
pub fn open(envelope: &Envelope, key: &SessionKey) -> Result<Vec<u8>, DecodeError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = XNonce::from_slice(envelope.nonce());

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: envelope.sealed_payload(),
                aad: envelope.header(),
            },
        )
        .map_err(|_| DecodeError::AuthenticationFailed)
}

/// Serialize `payload` as JSON and seal it.
///
/// # Errors
/// Returns [`EncodeError`] if serialization or encryption fails.
pub fn encode<T: Serialize + ?Sized>(payload: &T, key: &SessionKey) -> Result<Envelope, EncodeError> {
    let bytes = serde_json::to_vec(payload)?;
    seal(&bytes, key)
}

/// Open an envelope and deserialize the JSON payload.
///
/// A payload that authenticates but does not have the expected shape is a
/// protocol violation and reported as [`DecodeError::MalformedEnvelope`].
///
/// # Errors
/// Returns [`DecodeError`] on authentication or shape failure.
pub fn decode<T: DeserializeOwned>(envelope: &Envelope, key: &SessionKey) -> Result<T, DecodeError> {
    let bytes = open(envelope, key)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| DecodeError::MalformedEnvelope(format!("payload: {e}")))
}

/// Decode straight from the base64url transport form.
///
/// # Errors
/// Returns [`DecodeError::MalformedEnvelope`] for unparseable input, otherwise
/// the same errors as [`decode`].
pub fn decode_wire<T: DeserializeOwned>(wire: &str, key: &SessionKey) -> Result<T, DecodeError> {
    let envelope = Envelope::from_wire(wire)?;
    decode(&envelope, key)
}

/// Encode straight to the base64url transport form.
///
/// # Errors
/// Returns [`EncodeError`] if serialization or encryption fails.
pub fn encode_wire<T: Serialize + ?Sized>(payload: &T, key: &SessionKey) -> Result<String, EncodeError> {
    encode(payload, key).map(|envelope| envelope.to_wire())
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// decode(encode(P, K), K) == P for arbitrary payloads
        #[test]
        fn roundtrip_arbitrary_payloads(
            payload in proptest::collection::vec(any::<u8>(), 0..256),
            text in ".{0,64}",
        ) {
            let key = SessionKey::generate();
            let value = serde_json::json!({"bytes": payload, "text": text});
            let envelope = encode(&value, &key).unwrap();
            let decoded: serde_json::Value = decode(&envelope, &key).unwrap();
            prop_assert_eq!(decoded, value);
        }

        /// decode(encode(P, K1), K2) fails with AuthenticationFailed for K1 != K2
        #[test]
        fn key_isolation(
            payload in proptest::collection::vec(any::<u8>(), 0..256),
            k1 in any::<[u8; 32]>(),
            k2 in any::<[u8; 32]>(),
        ) {
            prop_assume!(k1 != k2);
            let envelope = seal(&payload, &SessionKey::from_bytes(k1)).unwrap();
            prop_assert_eq!(
                open(&envelope, &SessionKey::from_bytes(k2)),
                Err(DecodeError::AuthenticationFailed)
            );
        }
    }
}
