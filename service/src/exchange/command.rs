//! Commands carried inside request envelopes.

use serde::{Deserialize, Serialize};

use crate::operations::OperationId;

/// A decoded request, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Dump the data store. Without a key one is generated.
    #[serde(rename = "onthefly_backup")]
    OnTheFlyBackup {
        #[serde(default, alias = "encryptionKey")]
        encryption_key: Option<String>,
    },
    /// Restore from a finalized upload.
    #[serde(rename = "onthefly_restore")]
    OnTheFlyRestore {
        #[serde(default, alias = "encryptionKey")]
        encryption_key: Option<String>,
        #[serde(alias = "backupFile")]
        backup_file: OperationId,
    },
    /// Mint a capability token.
    SaveToken {
        #[serde(default = "default_token_size")]
        size: usize,
        #[serde(default = "default_true")]
        capital: bool,
        #[serde(default = "default_true")]
        numeric: bool,
        #[serde(default)]
        ambiguous: bool,
        reason: String,
        duration: i64,
    },
    /// Draw a random backup key for the operator.
    GeneratePassword {
        size: usize,
        /// Lowercase letters are always part of the alphabet.
        #[serde(default = "default_true")]
        lowercase: bool,
        #[serde(default = "default_true")]
        numerals: bool,
        #[serde(default = "default_true")]
        capitalize: bool,
        #[serde(default)]
        symbols: bool,
        /// Enable every character class regardless of the other flags.
        #[serde(default)]
        secure: bool,
    },
    /// Change an allow-listed application setting.
    SaveOptionChange { field: String, value: String },
    OperationStatus { operation_id: OperationId },
    CancelOperation { operation_id: OperationId },
}

impl Command {
    /// Name for logs; never includes parameters.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::OnTheFlyBackup { .. } => "onthefly_backup",
            Self::OnTheFlyRestore { .. } => "onthefly_restore",
            Self::SaveToken { .. } => "save_token",
            Self::GeneratePassword { .. } => "generate_password",
            Self::SaveOptionChange { .. } => "save_option_change",
            Self::OperationStatus { .. } => "operation_status",
            Self::CancelOperation { .. } => "cancel_operation",
        }
    }
}

/// Metadata sealed alongside every upload chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMeta {
    pub token: String,
    pub declared_reason: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub total_size: u64,
    pub file_name: String,
    /// Hex SHA-256 of this chunk's bytes, binding them to the sealed metadata.
    pub sha256: String,
}

#[allow(clippy::missing_const_for_fn)]
fn default_token_size() -> usize {
    25
}

#[allow(clippy::missing_const_for_fn)]
fn default_true() -> bool {
    true
}
