//! Common test utilities for integration tests.
//!
//! - [`app_builder::TestAppBuilder`] builds an Axum app that mirrors main.rs
//!   wiring, with mock storage engine and settings store injected.
//! - [`factories`] builds command payloads and multipart upload bodies.
//!
//! ```ignore
//! use crate::common::app_builder::TestAppBuilder;
//!
//! #[tokio::test]
//! async fn test_with_app() {
//!     let app = TestAppBuilder::with_mocks().build();
//!     let session = app.open_session();
//!     let reply = app.command(&session, serde_json::json!({"type": "generate_password", "size": 12})).await;
//! }
//! ```

#![allow(dead_code)]

pub mod app_builder;
pub mod factories;

use axum::body::{to_bytes, Body};
use axum::response::Response;

/// Read a response body as JSON.
///
/// # Panics
///
/// Panics if the body cannot be read or is not JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}
