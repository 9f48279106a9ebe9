//! HTTP utilities and middleware shared by the server and its tests.

pub mod security;

use serde::{Deserialize, Serialize};

pub use security::{build_security_headers, security_headers_middleware};

/// Plain JSON error body for responses that cannot be sealed.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
