//! Token-gated chunked upload pipeline.
//!
//! A restore dump arrives as numbered chunks. The first chunk presented with a
//! capability token opens an upload session; chunks may then arrive in any
//! order, each index exactly once. Every chunk is written to its own part file
//! under `<upload dir>/<operation id>/`. Once all chunks are present the parts
//! are concatenated in index order into `<upload dir>/<operation id>.<ext>`,
//! the token is consumed, and the artifact is parked until a restore takes it.

mod artifact;
mod session;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

pub use artifact::{RestoreArtifact, UploadSummary};
pub use session::ChunkProgress;
use session::UploadSession;

use crate::config::UploadConfig;
use crate::operations::OperationId;
use crate::session::SessionId;
use crate::tokens::{fingerprint, TokenError, TokenIssuer, TokenReason};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload token rejected: {0}")]
    TokenInvalid(TokenError),
    #[error("declared size {size} exceeds the maximum of {max} bytes")]
    SizeTooLarge { size: u64, max: u64 },
    #[error("file extension not allowed: '{0}'")]
    DisallowedExtension(String),
    #[error("invalid upload request: {0}")]
    InvalidRequest(String),
    #[error("chunk {0} was already received")]
    DuplicateChunk(u32),
    #[error("upload session expired")]
    SessionExpired,
    #[error("chunk index {index} outside 0..{total}")]
    OutOfOrder { index: u32, total: u32 },
    #[error("chunk of {size} bytes exceeds the maximum of {max} bytes")]
    ChunkTooLarge { size: u64, max: u64 },
    #[error("chunk would exceed the declared upload size")]
    SizeExceeded,
    #[error("chunk {0} does not match its declared SHA-256")]
    ChunkDigestMismatch(u32),
    #[error("last missing chunk leaves the upload {missing} bytes short of its declared size")]
    ShortUpload { missing: u64 },
    #[error("upload incomplete: {received_chunks} of {total_chunks} chunks received")]
    IncompleteUpload {
        received_chunks: u32,
        total_chunks: u32,
    },
    #[error("unknown upload session")]
    UnknownSession,
    #[error("upload registry unavailable")]
    Unavailable,
    #[error("upload storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lowercase hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Size, type and timing limits applied to every upload.
#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub max_file_size: u64,
    pub max_chunk_size: u64,
    pub allowed_extensions: Vec<String>,
    pub inactivity_timeout: Duration,
}

impl UploadLimits {
    #[must_use]
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_file_size: config.max_file_size_bytes(),
            max_chunk_size: config.max_chunk_size_bytes(),
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
            inactivity_timeout: config.inactivity_timeout(),
        }
    }
}

/// Parameters the uploader declares with every chunk.
#[derive(Debug, Clone, Copy)]
pub struct OpenRequest<'a> {
    pub owner: &'a SessionId,
    pub token_id: &'a str,
    pub declared_reason: &'a str,
    pub file_name: &'a str,
    pub total_size: u64,
    pub total_chunks: u32,
}

/// Result of handing one chunk to [`UploadPipeline::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Progress(ChunkProgress),
    Complete(UploadSummary),
}

type SharedSession = Arc<tokio::sync::Mutex<UploadSession>>;

#[derive(Default)]
struct Registry {
    sessions: HashMap<OperationId, SharedSession>,
    by_token: HashMap<String, OperationId>,
}

struct ParkedArtifact {
    owner: SessionId,
    artifact: RestoreArtifact,
    parked_at: Instant,
}

pub struct UploadPipeline {
    dir: PathBuf,
    limits: UploadLimits,
    tokens: Arc<TokenIssuer>,
    registry: Mutex<Registry>,
    artifacts: Mutex<HashMap<OperationId, ParkedArtifact>>,
}

impl UploadPipeline {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, limits: UploadLimits, tokens: Arc<TokenIssuer>) -> Self {
        Self {
            dir: dir.into(),
            limits,
            tokens,
            registry: Mutex::new(Registry::default()),
            artifacts: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn from_config(config: &UploadConfig, tokens: Arc<TokenIssuer>) -> Self {
        Self::new(&config.dir, UploadLimits::from_config(config), tokens)
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Open an upload session for a token, or return the one already open for it.
    ///
    /// The token is validated for `restore_db` and the declared file is checked
    /// against the size and extension limits before any byte is accepted.
    ///
    /// # Errors
    /// Returns [`UploadError::TokenInvalid`], [`UploadError::SizeTooLarge`],
    /// [`UploadError::DisallowedExtension`] or [`UploadError::InvalidRequest`].
    pub async fn open(&self, req: &OpenRequest<'_>) -> Result<OperationId, UploadError> {
        if let Some(existing) = self.find_by_token(req.token_id)? {
            let session = existing.lock().await;
            if session.closed {
                return Err(UploadError::SessionExpired);
            }
            if session.owner != *req.owner {
                return Err(UploadError::UnknownSession);
            }
            if session.token_expired(Utc::now()) {
                return Err(UploadError::TokenInvalid(TokenError::Expired));
            }
            if session.total_size != req.total_size || session.total_chunks != req.total_chunks {
                return Err(UploadError::InvalidRequest(
                    "upload parameters changed mid-transfer".to_string(),
                ));
            }
            return Ok(session.operation_id);
        }

        if req.declared_reason != TokenReason::RestoreDb.as_str() {
            return Err(UploadError::TokenInvalid(TokenError::WrongReason));
        }
        self.tokens
            .validate(req.token_id, TokenReason::RestoreDb)
            .map_err(UploadError::TokenInvalid)?;
        let token_expires_at = self
            .tokens
            .expires_at(req.token_id)
            .map_err(UploadError::TokenInvalid)?;
        let extension = self.check_declaration(req)?;

        let operation_id = OperationId::new();
        let dir = self.dir.join(operation_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let session = UploadSession {
            operation_id,
            token_id: req.token_id.to_string(),
            token_expires_at,
            owner: req.owner.clone(),
            file_name: req.file_name.to_string(),
            extension,
            received: BTreeSet::new(),
            total_chunks: req.total_chunks,
            total_size: req.total_size,
            received_bytes: 0,
            dir: dir.clone(),
            last_activity: Instant::now(),
            closed: false,
        };

        let raced = {
            let mut registry = self.registry.lock().map_err(|_| UploadError::Unavailable)?;
            if let Some(&existing) = registry.by_token.get(req.token_id) {
                Some(existing)
            } else {
                registry
                    .by_token
                    .insert(req.token_id.to_string(), operation_id);
                registry
                    .sessions
                    .insert(operation_id, Arc::new(tokio::sync::Mutex::new(session)));
                None
            }
        };

        if let Some(existing) = raced {
            // Another first chunk for the same token got there first
            remove_dir(&dir).await;
            return Ok(existing);
        }

        tracing::info!(
            operation_id = %operation_id,
            token = %fingerprint(req.token_id),
            total_size = req.total_size,
            total_chunks = req.total_chunks,
            "opened upload session"
        );
        Ok(operation_id)
    }

    /// Store one chunk.
    ///
    /// A duplicate index is rejected without touching the part already stored.
    /// The bytes must hash to `sha256` as declared in the sealed metadata. The
    /// last missing chunk must bring the total to exactly the declared size.
    /// Once the upload's token has expired every chunk is refused; the session
    /// lingers until the inactivity sweep removes it.
    ///
    /// # Errors
    /// Returns [`UploadError::TokenInvalid`], [`UploadError::DuplicateChunk`],
    /// [`UploadError::OutOfOrder`], [`UploadError::SessionExpired`],
    /// [`UploadError::ChunkTooLarge`], [`UploadError::ChunkDigestMismatch`],
    /// [`UploadError::SizeExceeded`], [`UploadError::ShortUpload`] or an I/O error.
    pub async fn accept_chunk(
        &self,
        operation_id: OperationId,
        owner: &SessionId,
        index: u32,
        bytes: &[u8],
        sha256: &str,
    ) -> Result<ChunkProgress, UploadError> {
        let shared = self.session(operation_id)?;
        let mut session = shared.lock().await;
        if session.closed {
            return Err(UploadError::SessionExpired);
        }
        if session.owner != *owner {
            return Err(UploadError::UnknownSession);
        }

        if session.token_expired(Utc::now()) {
            return Err(UploadError::TokenInvalid(TokenError::Expired));
        }

        let now = Instant::now();
        if session.is_idle(now, self.limits.inactivity_timeout) {
            self.discard(&mut session).await;
            tracing::info!(operation_id = %operation_id, "upload session expired");
            return Err(UploadError::SessionExpired);
        }

        if index >= session.total_chunks {
            return Err(UploadError::OutOfOrder {
                index,
                total: session.total_chunks,
            });
        }
        if session.received.contains(&index) {
            return Err(UploadError::DuplicateChunk(index));
        }

        let size = bytes.len() as u64;
        if size > self.limits.max_chunk_size {
            return Err(UploadError::ChunkTooLarge {
                size,
                max: self.limits.max_chunk_size,
            });
        }
        if !sha256_hex(bytes).eq_ignore_ascii_case(sha256.trim()) {
            return Err(UploadError::ChunkDigestMismatch(index));
        }
        let after = session.received_bytes.saturating_add(size);
        if after > session.total_size {
            return Err(UploadError::SizeExceeded);
        }
        if session.missing_chunks() == 1 && after < session.total_size {
            return Err(UploadError::ShortUpload {
                missing: session.total_size - after,
            });
        }

        tokio::fs::write(session.part_path(index), bytes).await?;
        session.received.insert(index);
        session.received_bytes += size;
        session.last_activity = now;

        tracing::debug!(
            operation_id = %operation_id,
            index,
            received = session.received.len(),
            total = session.total_chunks,
            "accepted chunk"
        );
        Ok(session.progress())
    }

    /// Assemble a complete upload and consume its token.
    ///
    /// # Errors
    /// Returns [`UploadError::IncompleteUpload`] (the session stays open) if
    /// chunks are missing or the assembled size is wrong, and
    /// [`UploadError::TokenInvalid`] if the token was consumed elsewhere, in
    /// which case the assembled file is discarded.
    pub async fn finalize(
        &self,
        operation_id: OperationId,
        owner: &SessionId,
    ) -> Result<UploadSummary, UploadError> {
        let shared = self.session(operation_id)?;
        let mut session = shared.lock().await;
        if session.closed {
            return Err(UploadError::SessionExpired);
        }
        if session.owner != *owner {
            return Err(UploadError::UnknownSession);
        }

        if session.token_expired(Utc::now()) {
            return Err(UploadError::TokenInvalid(TokenError::Expired));
        }
        if !session.is_complete() {
            return Err(session.incomplete());
        }

        let target = self
            .dir
            .join(format!("{operation_id}.{}", session.extension));
        let (size, sha256) = match assemble(&session, &target).await {
            Ok(assembled) => assembled,
            Err(e) => {
                remove_file(&target).await;
                return Err(e.into());
            }
        };
        if size != session.total_size {
            remove_file(&target).await;
            return Err(session.incomplete());
        }

        if let Err(e) = self.tokens.consume(&session.token_id) {
            tracing::warn!(
                operation_id = %operation_id,
                error = %e,
                "upload token could not be consumed; discarding artifact"
            );
            remove_file(&target).await;
            self.discard(&mut session).await;
            return Err(UploadError::TokenInvalid(e));
        }

        let artifact = RestoreArtifact::new(
            operation_id,
            target,
            session.file_name.clone(),
            size,
            sha256,
        );
        let summary = artifact.summary();
        let owner = session.owner.clone();
        self.discard(&mut session).await;

        self.artifacts
            .lock()
            .map_err(|_| UploadError::Unavailable)?
            .insert(
                operation_id,
                ParkedArtifact {
                    owner,
                    artifact,
                    parked_at: Instant::now(),
                },
            );

        tracing::info!(
            operation_id = %operation_id,
            size,
            sha256 = %summary.sha256,
            "upload finalized"
        );
        Ok(summary)
    }

    /// Open-or-resume, accept the chunk, and finalize once the last chunk lands.
    ///
    /// # Errors
    /// Any error from [`Self::open`], [`Self::accept_chunk`] or [`Self::finalize`].
    pub async fn receive(
        &self,
        req: &OpenRequest<'_>,
        index: u32,
        bytes: &[u8],
        sha256: &str,
    ) -> Result<ChunkOutcome, UploadError> {
        let operation_id = self.open(req).await?;
        let progress = self
            .accept_chunk(operation_id, req.owner, index, bytes, sha256)
            .await?;
        if progress.is_complete() {
            let summary = self.finalize(operation_id, req.owner).await?;
            Ok(ChunkOutcome::Complete(summary))
        } else {
            Ok(ChunkOutcome::Progress(progress))
        }
    }

    /// Whether `owner` has a finalized artifact parked under `operation_id`.
    #[must_use]
    pub fn has_artifact(&self, operation_id: OperationId, owner: &SessionId) -> bool {
        self.artifacts.lock().is_ok_and(|artifacts| {
            artifacts
                .get(&operation_id)
                .is_some_and(|parked| parked.owner == *owner)
        })
    }

    /// Move a finalized artifact out of the registry. Only the session that
    /// uploaded it can take it, and only once.
    #[must_use]
    pub fn take_artifact(
        &self,
        operation_id: OperationId,
        owner: &SessionId,
    ) -> Option<RestoreArtifact> {
        let mut artifacts = self.artifacts.lock().ok()?;
        if artifacts.get(&operation_id)?.owner != *owner {
            return None;
        }
        artifacts.remove(&operation_id).map(|parked| parked.artifact)
    }

    /// Discard upload sessions with no chunk inside the inactivity window, and
    /// finalized artifacts nobody restored within it. Returns how many were dropped.
    pub async fn expire_idle(&self, now: Instant) -> usize {
        let sessions: Vec<SharedSession> = match self.registry.lock() {
            Ok(registry) => registry.sessions.values().cloned().collect(),
            Err(_) => return 0,
        };

        let mut expired = 0;
        for shared in sessions {
            // A locked session is mid-chunk, so not idle
            let Ok(mut session) = shared.try_lock() else {
                continue;
            };
            if !session.closed && session.is_idle(now, self.limits.inactivity_timeout) {
                tracing::info!(operation_id = %session.operation_id, "expiring idle upload");
                self.discard(&mut session).await;
                expired += 1;
            }
        }

        let stale: Vec<RestoreArtifact> = match self.artifacts.lock() {
            Ok(mut artifacts) => {
                let ids: Vec<OperationId> = artifacts
                    .iter()
                    .filter(|(_, parked)| {
                        now.saturating_duration_since(parked.parked_at)
                            > self.limits.inactivity_timeout
                    })
                    .map(|(id, _)| *id)
                    .collect();
                ids.iter()
                    .filter_map(|id| artifacts.remove(id))
                    .map(|parked| parked.artifact)
                    .collect()
            }
            Err(_) => Vec::new(),
        };
        for artifact in stale {
            tracing::info!(operation_id = %artifact.operation_id(), "releasing unclaimed artifact");
            artifact.release().await;
            expired += 1;
        }

        expired
    }

    #[must_use]
    pub fn active_uploads(&self) -> usize {
        self.registry.lock().map_or(0, |r| r.sessions.len())
    }

    #[must_use]
    pub fn parked_artifacts(&self) -> usize {
        self.artifacts.lock().map_or(0, |a| a.len())
    }

    fn check_declaration(&self, req: &OpenRequest<'_>) -> Result<String, UploadError> {
        if req.total_size == 0 || req.total_chunks == 0 {
            return Err(UploadError::InvalidRequest(
                "total_size and total_chunks must be positive".to_string(),
            ));
        }
        if req.total_size > self.limits.max_file_size {
            return Err(UploadError::SizeTooLarge {
                size: req.total_size,
                max: self.limits.max_file_size,
            });
        }
        if u64::from(req.total_chunks) > req.total_size {
            return Err(UploadError::InvalidRequest(
                "more chunks than bytes".to_string(),
            ));
        }
        if req.total_size > u64::from(req.total_chunks).saturating_mul(self.limits.max_chunk_size)
        {
            return Err(UploadError::InvalidRequest(format!(
                "{} chunks cannot carry {} bytes at {} bytes per chunk",
                req.total_chunks, req.total_size, self.limits.max_chunk_size
            )));
        }

        let extension = req
            .file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if !self.limits.allowed_extensions.contains(&extension) {
            return Err(UploadError::DisallowedExtension(extension));
        }
        Ok(extension)
    }

    fn find_by_token(&self, token_id: &str) -> Result<Option<SharedSession>, UploadError> {
        let registry = self.registry.lock().map_err(|_| UploadError::Unavailable)?;
        Ok(registry
            .by_token
            .get(token_id)
            .and_then(|id| registry.sessions.get(id))
            .cloned())
    }

    fn session(&self, operation_id: OperationId) -> Result<SharedSession, UploadError> {
        let registry = self.registry.lock().map_err(|_| UploadError::Unavailable)?;
        registry
            .sessions
            .get(&operation_id)
            .cloned()
            .ok_or(UploadError::UnknownSession)
    }

    /// Close a session, unregister it and delete its part files.
    async fn discard(&self, session: &mut UploadSession) {
        session.closed = true;
        if let Ok(mut registry) = self.registry.lock() {
            registry.sessions.remove(&session.operation_id);
            registry.by_token.remove(&session.token_id);
        }
        remove_dir(&session.dir).await;
    }
}

/// Concatenate part files in index order, returning the size and hex SHA-256.
async fn assemble(session: &UploadSession, target: &Path) -> std::io::Result<(u64, String)> {
    let mut out = tokio::fs::File::create(target).await?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    for index in 0..session.total_chunks {
        let bytes = tokio::fs::read(session.part_path(index)).await?;
        hasher.update(&bytes);
        size += bytes.len() as u64;
        out.write_all(&bytes).await?;
    }
    out.flush().await?;
    out.sync_all().await?;
    Ok((size, format!("{:x}", hasher.finalize())))
}

async fn remove_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to remove upload directory");
        }
    }
}

async fn remove_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove file");
        }
    }
}
