//! Encrypted exchange primitives for `VaultKeep`
//!
//! This crate provides the envelope format and codec used by both the Rust
//! backend (as a native library) and the browser (compiled to WASM), so both
//! ends of the exchange run the same implementation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use wasm_bindgen::prelude::*;

mod codec;
pub use codec::{decode, decode_wire, encode, encode_wire, open, seal, DecodeError, EncodeError};

mod envelope;
pub use envelope::{Envelope, EnvelopeError, MAX_ENVELOPE_SIZE, NONCE_SIZE, TAG_SIZE};

mod key;
pub use key::{KeyError, SessionKey, KEY_SIZE};

/// Error type for base64url decoding failures
#[derive(Debug, thiserror::Error)]
#[error("invalid base64url encoding: {0}")]
pub struct Base64Error(#[from] base64::DecodeError);

/// Encode bytes as base64url (RFC 4648) without padding.
#[wasm_bindgen]
#[must_use]
pub fn encode_base64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode a base64url-encoded string (RFC 4648) to bytes (WASM binding).
///
/// For native Rust code, use [`decode_base64url`] instead.
///
/// # Errors
/// Returns `JsError` if the input is not valid base64url
#[wasm_bindgen(js_name = "decode_base64url")]
pub fn decode_base64url_js(encoded: &str) -> Result<Vec<u8>, JsError> {
    URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| JsError::new(&e.to_string()))
}

/// Decode a base64url-encoded string (RFC 4648) without padding to bytes.
///
/// # Errors
/// Returns `Base64Error` if the input is not valid base64url
pub fn decode_base64url(encoded: &str) -> Result<Vec<u8>, Base64Error> {
    URL_SAFE_NO_PAD.decode(encoded).map_err(Base64Error::from)
}

/// Seal a JSON document under a base64url session key (WASM binding).
///
/// The browser calls this before every command it posts.
///
/// # Errors
/// Returns `JsError` if the key or JSON is invalid.
#[wasm_bindgen]
pub fn encode_envelope(json: &str, key_b64: &str) -> Result<String, JsError> {
    let key = SessionKey::from_base64url(key_b64).map_err(|e| JsError::new(&e.to_string()))?;
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| JsError::new(&e.to_string()))?;
    encode_wire(&value, &key).map_err(|e| JsError::new(&e.to_string()))
}

/// Open a sealed server reply and return its JSON text (WASM binding).
///
/// # Errors
/// Returns `JsError` if the key is invalid or the envelope fails to decode.
#[wasm_bindgen]
pub fn decode_envelope(wire: &str, key_b64: &str) -> Result<String, JsError> {
    let key = SessionKey::from_base64url(key_b64).map_err(|e| JsError::new(&e.to_string()))?;
    let value: serde_json::Value =
        decode_wire(wire, &key).map_err(|e| JsError::new(&e.to_string()))?;
    Ok(value.to_string())
}
