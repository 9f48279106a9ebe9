//! Operation identifiers and the backup/restore state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier shared by an upload and the restore that consumes it, or by a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Backup,
    Restore,
}

/// Where an operation stands.
///
/// Backup: `BackupRequested -> KeyObtained -> StoreRunning -> BackupDone | BackupFailed`.
/// Restore: `RestoreRequested -> ArtifactReady -> StoreRunning -> RestoreDone | RestoreFailed`.
/// Either may end in `Cancelled` (before the store ran) or `OutcomeUnknown`
/// (cancelled while the store was running).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Idle,
    BackupRequested,
    KeyObtained,
    RestoreRequested,
    ArtifactReady,
    StoreRunning,
    BackupDone,
    BackupFailed,
    RestoreDone,
    RestoreFailed,
    Cancelled,
    OutcomeUnknown,
}

impl OperationState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::BackupDone
                | Self::BackupFailed
                | Self::RestoreDone
                | Self::RestoreFailed
                | Self::Cancelled
                | Self::OutcomeUnknown
        )
    }

    /// States from which a cancel discards the operation with no side effect.
    #[must_use]
    pub const fn is_before_store(self) -> bool {
        matches!(
            self,
            Self::Idle
                | Self::BackupRequested
                | Self::KeyObtained
                | Self::RestoreRequested
                | Self::ArtifactReady
        )
    }

    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(
            self,
            Self::BackupFailed | Self::RestoreFailed | Self::OutcomeUnknown
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::BackupRequested => "backup_requested",
            Self::KeyObtained => "key_obtained",
            Self::RestoreRequested => "restore_requested",
            Self::ArtifactReady => "artifact_ready",
            Self::StoreRunning => "store_running",
            Self::BackupDone => "backup_done",
            Self::BackupFailed => "backup_failed",
            Self::RestoreDone => "restore_done",
            Self::RestoreFailed => "restore_failed",
            Self::Cancelled => "cancelled",
            Self::OutcomeUnknown => "outcome_unknown",
        };
        f.write_str(name)
    }
}

/// Pollable view of an operation, returned by `operation_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub operation_id: OperationId,
    pub kind: OperationKind,
    pub state: OperationState,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Location of the produced dump, once a backup is done.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<String>,
    /// Storage engine error, verbatim, for failed operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set once a restore is done: existing sessions may no longer match the data.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub logout_required: bool,
}
