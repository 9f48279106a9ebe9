//! Server-side state of one in-progress chunked transfer.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::operations::OperationId;
use crate::session::SessionId;

use super::UploadError;

#[derive(Debug)]
pub(crate) struct UploadSession {
    pub operation_id: OperationId,
    pub token_id: String,
    /// Copied from the token at open so expiry holds even after the token is purged.
    pub token_expires_at: DateTime<Utc>,
    pub owner: SessionId,
    pub file_name: String,
    pub extension: String,
    pub received: BTreeSet<u32>,
    pub total_chunks: u32,
    pub total_size: u64,
    pub received_bytes: u64,
    pub dir: PathBuf,
    pub last_activity: Instant,
    /// Set once the session is finalized, expired or discarded. A caller that
    /// was waiting on the lock must treat a closed session as gone.
    pub closed: bool,
}

impl UploadSession {
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }

    pub fn token_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.token_expires_at
    }

    pub fn is_complete(&self) -> bool {
        u32::try_from(self.received.len()).is_ok_and(|n| n == self.total_chunks)
            && self.received_bytes == self.total_size
    }

    pub fn missing_chunks(&self) -> u32 {
        self.total_chunks
            .saturating_sub(u32::try_from(self.received.len()).unwrap_or(u32::MAX))
    }

    pub fn part_path(&self, index: u32) -> PathBuf {
        part_path(&self.dir, index)
    }

    pub fn incomplete(&self) -> UploadError {
        UploadError::IncompleteUpload {
            received_chunks: self.progress().received_chunks,
            total_chunks: self.total_chunks,
        }
    }

    pub fn progress(&self) -> ChunkProgress {
        ChunkProgress {
            operation_id: self.operation_id,
            received_chunks: u32::try_from(self.received.len()).unwrap_or(u32::MAX),
            total_chunks: self.total_chunks,
            received_bytes: self.received_bytes,
            total_size: self.total_size,
        }
    }
}

pub(crate) fn part_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("{index:06}.part"))
}

/// Upload progress reported after each accepted chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkProgress {
    pub operation_id: OperationId,
    pub received_chunks: u32,
    pub total_chunks: u32,
    pub received_bytes: u64,
    pub total_size: u64,
}

impl ChunkProgress {
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.received_chunks == self.total_chunks && self.received_bytes == self.total_size
    }
}
