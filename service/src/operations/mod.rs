//! Backup and restore orchestration.
//!
//! The [`Orchestrator`] checks preconditions synchronously, then runs the
//! storage engine on a spawned task under an operation-level timeout. Callers
//! poll [`Orchestrator::status`] for the outcome.

pub mod settings;
pub mod storage;
mod state;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::AbortHandle;

pub use settings::{
    InMemorySettingsStore, JsonFileSettingsStore, SettingsError, SettingsStore,
    BACKUP_PASSPHRASE_KEY,
};
pub use state::{OperationId, OperationKind, OperationState, OperationStatus};
pub use storage::{ScriptStorageEngine, StorageEngine, StorageError, PASSPHRASE_ENV};

use crate::config::{OperationsConfig, TokenConfig};
use crate::session::SessionId;
use crate::tokens::{CharsetPolicy, TokenError, TokenIssuer};
use crate::upload::UploadPipeline;

#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("no finalized upload found for this restore")]
    ArtifactMissing,
    #[error("no passphrase supplied and none saved from a previous backup")]
    PassphraseMissing,
    #[error("unknown operation")]
    NotFound,
    #[error("operation already finished ({0})")]
    AlreadyFinished(OperationState),
    #[error("could not generate a passphrase: {0}")]
    Passphrase(#[from] TokenError),
    #[error("could not read saved passphrase: {0}")]
    Settings(#[from] SettingsError),
    #[error("operation registry unavailable")]
    Unavailable,
}

struct OperationRecord {
    kind: OperationKind,
    owner: SessionId,
    state: OperationState,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    finished_instant: Option<Instant>,
    download: Option<String>,
    error: Option<String>,
    /// Restore artifact on disk, released if the task is aborted.
    artifact_path: Option<PathBuf>,
    task: Option<AbortHandle>,
    done: watch::Sender<bool>,
}

impl OperationRecord {
    fn new(kind: OperationKind, owner: SessionId, state: OperationState) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            kind,
            owner,
            state,
            started_at: Utc::now(),
            finished_at: None,
            finished_instant: None,
            download: None,
            error: None,
            artifact_path: None,
            task: None,
            done,
        }
    }

    fn status(&self, operation_id: OperationId) -> OperationStatus {
        OperationStatus {
            operation_id,
            kind: self.kind,
            state: self.state,
            started_at: self.started_at,
            finished_at: self.finished_at,
            download: self.download.clone(),
            error: self.error.clone(),
            logout_required: self.state == OperationState::RestoreDone,
        }
    }

    fn finish(&mut self, state: OperationState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
        self.finished_instant = Some(Instant::now());
        self.task = None;
        self.done.send_replace(true);
    }
}

type Registry = Arc<Mutex<HashMap<OperationId, OperationRecord>>>;

/// Timing knobs for the orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorLimits {
    pub timeout: Duration,
    pub retention: Duration,
    pub password_length: usize,
}

impl OrchestratorLimits {
    #[must_use]
    pub const fn from_config(operations: &OperationsConfig, tokens: &TokenConfig) -> Self {
        Self {
            timeout: operations.timeout(),
            retention: operations.retention(),
            password_length: tokens.password_length,
        }
    }
}

pub struct Orchestrator {
    engine: Arc<dyn StorageEngine>,
    settings: Arc<dyn SettingsStore>,
    tokens: Arc<TokenIssuer>,
    uploads: Arc<UploadPipeline>,
    limits: OrchestratorLimits,
    operations: Registry,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        settings: Arc<dyn SettingsStore>,
        tokens: Arc<TokenIssuer>,
        uploads: Arc<UploadPipeline>,
        limits: OrchestratorLimits,
    ) -> Self {
        Self {
            engine,
            settings,
            tokens,
            uploads,
            limits,
            operations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a backup.
    ///
    /// Uses `passphrase` when given, otherwise draws one with the password
    /// policy. On success the passphrase is saved under
    /// [`BACKUP_PASSPHRASE_KEY`] exactly once.
    ///
    /// # Errors
    /// Returns [`OperationError::Passphrase`] if a passphrase cannot be generated.
    pub fn start_backup(
        &self,
        owner: &SessionId,
        passphrase: Option<String>,
    ) -> Result<OperationStatus, OperationError> {
        let operation_id = OperationId::new();
        self.insert(
            operation_id,
            OperationRecord::new(
                OperationKind::Backup,
                owner.clone(),
                OperationState::BackupRequested,
            ),
        )?;

        let passphrase = match passphrase.filter(|p| !p.trim().is_empty()) {
            Some(p) => p,
            None => match self
                .tokens
                .generate_secret(&CharsetPolicy::password(self.limits.password_length))
            {
                Ok(p) => p,
                Err(e) => {
                    self.update(operation_id, |r| {
                        r.error = Some(e.to_string());
                        r.finish(OperationState::BackupFailed);
                    });
                    return Err(e.into());
                }
            },
        };
        self.update(operation_id, |r| r.state = OperationState::KeyObtained);
        tracing::info!(operation_id = %operation_id, "backup key obtained");

        let engine = Arc::clone(&self.engine);
        let settings = Arc::clone(&self.settings);
        let operations = Arc::clone(&self.operations);
        let timeout = self.limits.timeout;

        let task = tokio::spawn(async move {
            if !begin_store(&operations, operation_id, OperationState::KeyObtained) {
                return;
            }

            let outcome = match tokio::time::timeout(timeout, engine.dump(&passphrase)).await {
                Ok(Ok(location)) => match settings.set(BACKUP_PASSPHRASE_KEY, &passphrase).await {
                    Ok(()) => Ok(location),
                    Err(e) => Err(format!(
                        "backup written to {location} but its passphrase could not be saved: {e}"
                    )),
                },
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("operation timed out after {}s", timeout.as_secs())),
            };

            finish_store(&operations, operation_id, |record| match outcome {
                Ok(location) => {
                    tracing::info!(operation_id = %operation_id, "backup done");
                    record.download = Some(location);
                    record.finish(OperationState::BackupDone);
                }
                Err(error) => {
                    tracing::error!(operation_id = %operation_id, error = %error, "backup failed");
                    record.error = Some(error);
                    record.finish(OperationState::BackupFailed);
                }
            });
        });
        self.attach(operation_id, task.abort_handle());

        self.status_unchecked(operation_id)
    }

    /// Start a restore from the upload finalized under `upload_id`.
    ///
    /// Without a passphrase the one saved by the last backup is used. The
    /// artifact is taken out of the upload registry, so it serves one restore only.
    ///
    /// # Errors
    /// Returns [`OperationError::ArtifactMissing`] (the engine is not touched)
    /// if no finalized upload exists for this session under `upload_id`, or
    /// [`OperationError::PassphraseMissing`]. The artifact is checked first.
    pub async fn start_restore(
        &self,
        owner: &SessionId,
        passphrase: Option<String>,
        upload_id: OperationId,
    ) -> Result<OperationStatus, OperationError> {
        if !self.uploads.has_artifact(upload_id, owner) {
            return Err(OperationError::ArtifactMissing);
        }

        let passphrase = match passphrase.filter(|p| !p.trim().is_empty()) {
            Some(p) => p,
            None => self
                .settings
                .get(BACKUP_PASSPHRASE_KEY)
                .await?
                .filter(|p| !p.is_empty())
                .ok_or(OperationError::PassphraseMissing)?,
        };

        let artifact = self
            .uploads
            .take_artifact(upload_id, owner)
            .ok_or(OperationError::ArtifactMissing)?;
        let operation_id = artifact.operation_id();

        let mut record = OperationRecord::new(
            OperationKind::Restore,
            owner.clone(),
            OperationState::RestoreRequested,
        );
        record.artifact_path = Some(artifact.path().to_path_buf());
        if let Err(e) = self.insert(operation_id, record) {
            artifact.release().await;
            return Err(e);
        }
        self.update(operation_id, |r| r.state = OperationState::ArtifactReady);
        tracing::info!(
            operation_id = %operation_id,
            size = artifact.size(),
            sha256 = %artifact.sha256(),
            "restore artifact ready"
        );

        let engine = Arc::clone(&self.engine);
        let operations = Arc::clone(&self.operations);
        let timeout = self.limits.timeout;

        let task = tokio::spawn(async move {
            if !begin_store(&operations, operation_id, OperationState::ArtifactReady) {
                artifact.release().await;
                return;
            }

            let outcome =
                match tokio::time::timeout(timeout, engine.restore(&passphrase, &artifact)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("operation timed out after {}s", timeout.as_secs())),
                };
            artifact.release().await;

            finish_store(&operations, operation_id, |record| match outcome {
                Ok(()) => {
                    tracing::info!(operation_id = %operation_id, "restore done");
                    record.finish(OperationState::RestoreDone);
                }
                Err(error) => {
                    tracing::error!(operation_id = %operation_id, error = %error, "restore failed");
                    record.error = Some(error);
                    record.finish(OperationState::RestoreFailed);
                }
            });
        });
        self.attach(operation_id, task.abort_handle());

        self.status_unchecked(operation_id)
    }

    /// Current state of an operation owned by `owner`.
    ///
    /// # Errors
    /// Returns [`OperationError::NotFound`] for unknown ids or other sessions' operations.
    pub fn status(
        &self,
        operation_id: OperationId,
        owner: &SessionId,
    ) -> Result<OperationStatus, OperationError> {
        let operations = self.operations.lock().map_err(|_| OperationError::Unavailable)?;
        operations
            .get(&operation_id)
            .filter(|r| r.owner == *owner)
            .map(|r| r.status(operation_id))
            .ok_or(OperationError::NotFound)
    }

    /// Cancel an operation.
    ///
    /// Before the store runs this discards the operation with no side effect
    /// (`Cancelled`). Once the store is running the waiting task is aborted and
    /// the outcome is reported as unknown (`OutcomeUnknown`).
    ///
    /// # Errors
    /// Returns [`OperationError::NotFound`] or [`OperationError::AlreadyFinished`].
    pub fn cancel(
        &self,
        operation_id: OperationId,
        owner: &SessionId,
    ) -> Result<OperationStatus, OperationError> {
        let mut operations = self.operations.lock().map_err(|_| OperationError::Unavailable)?;
        let record = operations
            .get_mut(&operation_id)
            .filter(|r| r.owner == *owner)
            .ok_or(OperationError::NotFound)?;

        if record.state.is_terminal() {
            return Err(OperationError::AlreadyFinished(record.state));
        }

        if record.state.is_before_store() {
            // The task sees Cancelled and exits before touching the engine
            record.finish(OperationState::Cancelled);
            tracing::info!(operation_id = %operation_id, "operation cancelled before store ran");
        } else {
            if let Some(task) = record.task.take() {
                task.abort();
            }
            record.error = Some("cancelled while the storage engine was running".to_string());
            record.finish(OperationState::OutcomeUnknown);
            if let Some(path) = record.artifact_path.take() {
                tokio::spawn(async move {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        tracing::warn!(path = %path.display(), error = %e, "failed to remove restore artifact");
                    }
                });
            }
            tracing::warn!(operation_id = %operation_id, "operation aborted while store running; outcome unknown");
        }
        Ok(record.status(operation_id))
    }

    /// Wait until the operation reaches a terminal state.
    ///
    /// Returns `None` if the operation is unknown or was purged while waiting.
    pub async fn wait(&self, operation_id: OperationId) -> Option<OperationStatus> {
        let mut done = {
            let operations = self.operations.lock().ok()?;
            operations.get(&operation_id)?.done.subscribe()
        };
        if done.wait_for(|finished| *finished).await.is_err() {
            // Sender dropped: the record was purged
            return None;
        }
        let operations = self.operations.lock().ok()?;
        operations.get(&operation_id).map(|r| r.status(operation_id))
    }

    /// Drop finished operation records older than the retention window.
    pub fn purge_finished(&self, now: Instant) -> usize {
        let Ok(mut operations) = self.operations.lock() else {
            return 0;
        };
        let before = operations.len();
        let retention = self.limits.retention;
        operations.retain(|_, r| {
            !matches!(r.finished_instant, Some(at) if now.saturating_duration_since(at) > retention)
        });
        before - operations.len()
    }

    fn insert(
        &self,
        operation_id: OperationId,
        record: OperationRecord,
    ) -> Result<(), OperationError> {
        self.operations
            .lock()
            .map_err(|_| OperationError::Unavailable)?
            .insert(operation_id, record);
        Ok(())
    }

    fn update(&self, operation_id: OperationId, f: impl FnOnce(&mut OperationRecord)) {
        if let Ok(mut operations) = self.operations.lock() {
            if let Some(record) = operations.get_mut(&operation_id) {
                f(record);
            }
        }
    }

    fn attach(&self, operation_id: OperationId, task: AbortHandle) {
        self.update(operation_id, |r| {
            if !r.state.is_terminal() {
                r.task = Some(task);
            }
        });
    }

    fn status_unchecked(&self, operation_id: OperationId) -> Result<OperationStatus, OperationError> {
        let operations = self.operations.lock().map_err(|_| OperationError::Unavailable)?;
        operations
            .get(&operation_id)
            .map(|r| r.status(operation_id))
            .ok_or(OperationError::NotFound)
    }
}

/// Move `expected -> StoreRunning`. False if the operation was cancelled meanwhile.
fn begin_store(operations: &Registry, operation_id: OperationId, expected: OperationState) -> bool {
    let Ok(mut operations) = operations.lock() else {
        return false;
    };
    match operations.get_mut(&operation_id) {
        Some(record) if record.state == expected => {
            record.state = OperationState::StoreRunning;
            true
        }
        _ => false,
    }
}

/// Record the store outcome unless a cancel already settled the operation.
fn finish_store(
    operations: &Registry,
    operation_id: OperationId,
    f: impl FnOnce(&mut OperationRecord),
) {
    if let Ok(mut operations) = operations.lock() {
        if let Some(record) = operations.get_mut(&operation_id) {
            if record.state == OperationState::StoreRunning {
                f(record);
            }
        }
    }
}
