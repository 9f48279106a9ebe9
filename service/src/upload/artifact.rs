//! Reassembled restore artifacts.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::operations::OperationId;

/// A complete uploaded dump, ready to be restored.
///
/// Not `Clone`: the artifact is moved out of the pipeline registry into
/// exactly one restore operation, which releases the file when done.
#[derive(Debug)]
pub struct RestoreArtifact {
    operation_id: OperationId,
    path: PathBuf,
    file_name: String,
    size: u64,
    sha256: String,
}

impl RestoreArtifact {
    pub(crate) const fn new(
        operation_id: OperationId,
        path: PathBuf,
        file_name: String,
        size: u64,
        sha256: String,
    ) -> Self {
        Self {
            operation_id,
            path,
            file_name,
            size,
            sha256,
        }
    }

    #[must_use]
    pub const fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Lowercase hex SHA-256 of the assembled bytes.
    #[must_use]
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    #[must_use]
    pub fn summary(&self) -> UploadSummary {
        UploadSummary {
            operation_id: self.operation_id,
            size: self.size,
            sha256: self.sha256.clone(),
        }
    }

    /// Delete the artifact file.
    pub async fn release(self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    operation_id = %self.operation_id,
                    error = %e,
                    "failed to remove restore artifact"
                );
            }
        }
    }
}

/// What the uploader learns once the last chunk lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    pub operation_id: OperationId,
    pub size: u64,
    pub sha256: String,
}
