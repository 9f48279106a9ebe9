//! HTTP endpoints for the sealed command and upload channels.
//!
//! Every request names its session in the `X-Session-Id` header. Requests from
//! a session with no key get a plain 401; everything else is answered with a
//! sealed [`Reply`](super::Reply) under the session key, failures included.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        multipart::MultipartRejection,
        rejection::JsonRejection,
        DefaultBodyLimit, Extension, FromRequestParts, Multipart,
    },
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vk_crypto::SessionKey;

use super::command::{Command, UploadMeta};
use super::dispatch::{into_reply, Exchange};
use super::error::ExchangeError;
use super::reply::Reply;
use crate::http::ErrorResponse;
use crate::session::SessionId;

pub const SESSION_HEADER: &str = "x-session-id";

/// Room for the sealed `meta` field and multipart framing on top of a chunk.
const UPLOAD_OVERHEAD: usize = 64 * 1024;

/// Request and response body of both sealed channels.
#[derive(Debug, Serialize, Deserialize)]
pub struct SealedBody {
    pub data: String,
}

/// Development bootstrap response.
#[derive(Debug, Serialize, Deserialize)]
pub struct BootstrapResponse {
    pub session_id: String,
    pub key: String,
}

/// Caller session resolved from `X-Session-Id`, with its key.
pub struct SessionContext {
    pub id: SessionId,
    key: SessionKey,
}

fn auth_error(msg: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: msg.to_string(),
        }),
    )
        .into_response()
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "Internal server error".to_string(),
        }),
    )
        .into_response()
}

impl<S: Send + Sync> FromRequestParts<S> for SessionContext {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let exchange = parts
            .extensions
            .get::<Arc<Exchange>>()
            .ok_or_else(|| auth_error("Server misconfiguration"))?
            .clone();

        let raw = parts
            .headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| auth_error("Missing X-Session-Id header"))?;
        let id = SessionId::parse(raw).map_err(|_| auth_error("Invalid session id"))?;

        let key = exchange.sessions.lookup(&id).map_err(|e| {
            tracing::debug!(session = %id, error = %e, "rejected request without session key");
            auth_error("Unknown session")
        })?;

        Ok(Self { id, key })
    }
}

/// Size limit for `/api/upload` bodies given the configured chunk size.
#[must_use]
pub fn upload_body_limit(max_chunk_size: u64) -> usize {
    usize::try_from(max_chunk_size)
        .unwrap_or(usize::MAX)
        .saturating_add(UPLOAD_OVERHEAD)
}

/// Routes for the sealed channels. Requires an `Extension<Arc<Exchange>>` layer.
pub fn router(upload_limit: usize, bootstrap_enabled: bool) -> Router {
    let session = if bootstrap_enabled {
        tracing::warn!("development session bootstrap is enabled");
        delete(logout).post(bootstrap)
    } else {
        delete(logout)
    };

    Router::new()
        .route("/api/exchange", post(exchange))
        .route(
            "/api/upload",
            post(upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/session", session)
}

async fn exchange(
    Extension(exchange): Extension<Arc<Exchange>>,
    ctx: SessionContext,
    body: Result<Json<SealedBody>, JsonRejection>,
) -> Response {
    let result = match body
        .map_err(|e| ExchangeError::InvalidRequest(e.body_text()))
        .and_then(|Json(body)| decode_command(&body.data, &ctx.key))
    {
        Ok(command) => exchange.dispatch(&ctx.id, command).await,
        Err(e) => Err(e),
    };
    seal(&ctx, &into_reply(&ctx.id, result))
}

async fn upload(
    Extension(exchange): Extension<Arc<Exchange>>,
    ctx: SessionContext,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let read = match multipart {
        Ok(multipart) => read_upload(multipart, &ctx.key).await,
        Err(e) => Err(ExchangeError::InvalidRequest(e.body_text())),
    };
    let result = match read {
        Ok((meta, chunk)) => exchange.upload_chunk(&ctx.id, &meta, &chunk).await,
        Err(e) => Err(e),
    };
    seal(&ctx, &into_reply(&ctx.id, result))
}

async fn logout(Extension(exchange): Extension<Arc<Exchange>>, ctx: SessionContext) -> StatusCode {
    exchange.sessions.revoke(&ctx.id);
    tracing::info!(session = %ctx.id, "session key revoked");
    StatusCode::NO_CONTENT
}

async fn bootstrap(Extension(exchange): Extension<Arc<Exchange>>) -> Response {
    let id = SessionId::generate();
    match exchange.sessions.issue(&id) {
        Ok(key) => {
            tracing::info!(session = %id, "bootstrapped development session");
            (
                StatusCode::CREATED,
                Json(BootstrapResponse {
                    session_id: id.as_str().to_string(),
                    key: key.to_base64url(),
                }),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "session bootstrap failed");
            internal_error()
        }
    }
}

fn decode_command(wire: &str, key: &SessionKey) -> Result<Command, ExchangeError> {
    let value: Value = vk_crypto::decode_wire(wire, key)?;
    serde_json::from_value(value).map_err(|e| ExchangeError::InvalidRequest(e.to_string()))
}

async fn read_upload(
    mut multipart: Multipart,
    key: &SessionKey,
) -> Result<(UploadMeta, Bytes), ExchangeError> {
    let mut meta = None;
    let mut chunk = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ExchangeError::InvalidRequest(e.to_string()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("meta") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ExchangeError::InvalidRequest(e.to_string()))?;
                meta = Some(vk_crypto::decode_wire::<UploadMeta>(&text, key)?);
            }
            Some("chunk") => {
                chunk = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ExchangeError::InvalidRequest(e.to_string()))?,
                );
            }
            _ => {}
        }
    }

    let meta = meta.ok_or_else(|| ExchangeError::InvalidRequest("missing meta field".into()))?;
    let chunk = chunk.ok_or_else(|| ExchangeError::InvalidRequest("missing chunk field".into()))?;
    Ok((meta, chunk))
}

fn seal(ctx: &SessionContext, reply: &Reply) -> Response {
    match vk_crypto::encode_wire(reply, &ctx.key) {
        Ok(data) => Json(SealedBody { data }).into_response(),
        Err(e) => {
            tracing::error!(session = %ctx.id, error = %e, "failed to seal reply");
            internal_error()
        }
    }
}
