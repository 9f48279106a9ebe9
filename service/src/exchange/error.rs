//! Every failure a command can produce, and how it is reported to the caller.

use vk_crypto::DecodeError;

use super::reply::{Failure, FailureCategory};
use crate::operations::{OperationError, SettingsError};
use crate::session::SessionError;
use crate::tokens::TokenError;
use crate::upload::UploadError;

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    /// The storage engine reported an error; the message is its own.
    #[error("{0}")]
    StoreOperationFailed(String),
    /// The engine may or may not have completed.
    #[error("{0}")]
    OutcomeUnknown(String),
    #[error("setting '{0}' cannot be changed through this channel")]
    ForbiddenSetting(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ExchangeError {
    /// Stable identifier for client-side handling.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Decode(DecodeError::AuthenticationFailed) => "authentication_failed",
            Self::Decode(DecodeError::MalformedEnvelope(_)) => "malformed_envelope",
            Self::Session(SessionError::NotFound) => "session_unknown",
            Self::Session(SessionError::InvalidId) => "session_invalid",
            Self::Token(e) | Self::Upload(UploadError::TokenInvalid(e)) => token_code(e),
            Self::Upload(e) => upload_code(e),
            Self::Operation(e) => operation_code(e),
            Self::StoreOperationFailed(_) => "store_operation_failed",
            Self::OutcomeUnknown(_) => "outcome_unknown",
            Self::ForbiddenSetting(_) => "forbidden_setting",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Session(SessionError::Unavailable) | Self::Settings(_) => "internal_error",
        }
    }

    #[must_use]
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::StoreOperationFailed(_) | Self::OutcomeUnknown(_) => FailureCategory::Operation,
            _ if self.is_internal() => FailureCategory::Operation,
            _ => FailureCategory::Input,
        }
    }

    /// Faults on our side rather than the caller's. Their details stay in the log.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.code() == "internal_error"
    }

    #[must_use]
    pub fn message(&self) -> String {
        if self.is_internal() {
            "internal error".to_string()
        } else {
            self.to_string()
        }
    }

    #[must_use]
    pub fn to_failure(&self) -> Failure {
        Failure {
            category: self.category(),
            code: self.code().to_string(),
            message: self.message(),
        }
    }
}

const fn token_code(err: &TokenError) -> &'static str {
    match err {
        TokenError::InvalidPolicy(_) => "invalid_token_policy",
        TokenError::Expired => "token_expired",
        TokenError::WrongReason => "token_wrong_reason",
        TokenError::AlreadyConsumed => "token_already_consumed",
        TokenError::Unknown => "token_invalid",
        TokenError::Unavailable => "internal_error",
    }
}

const fn upload_code(err: &UploadError) -> &'static str {
    match err {
        UploadError::TokenInvalid(e) => token_code(e),
        UploadError::SizeTooLarge { .. } => "file_too_large",
        UploadError::DisallowedExtension(_) => "disallowed_extension",
        UploadError::InvalidRequest(_) => "invalid_request",
        UploadError::DuplicateChunk(_) => "duplicate_chunk",
        UploadError::SessionExpired => "upload_expired",
        UploadError::OutOfOrder { .. } => "out_of_order",
        UploadError::ChunkTooLarge { .. } => "chunk_too_large",
        UploadError::SizeExceeded => "size_exceeded",
        UploadError::ChunkDigestMismatch(_) => "chunk_digest_mismatch",
        UploadError::ShortUpload { .. } => "upload_size_short",
        UploadError::IncompleteUpload { .. } => "incomplete_upload",
        UploadError::UnknownSession => "unknown_upload",
        UploadError::Unavailable | UploadError::Io(_) => "internal_error",
    }
}

const fn operation_code(err: &OperationError) -> &'static str {
    match err {
        OperationError::ArtifactMissing => "artifact_missing",
        OperationError::PassphraseMissing => "passphrase_missing",
        OperationError::NotFound => "operation_not_found",
        OperationError::AlreadyFinished(_) => "operation_finished",
        OperationError::Passphrase(e) => token_code(e),
        OperationError::Settings(_) | OperationError::Unavailable => "internal_error",
    }
}
