//! External storage engine: produces and restores data-store dumps.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;

use crate::config::StorageConfig;
use crate::upload::RestoreArtifact;

/// Environment variable carrying the passphrase to dump/restore commands.
pub const PASSPHRASE_ENV: &str = "VK_BACKUP_PASSPHRASE";

/// Longest stderr excerpt kept in an error.
const MAX_STDERR_CHARS: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("no {0} command configured")]
    NotConfigured(&'static str),
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("{command} exited with {}: {stderr}", describe_exit(.status))]
    Failed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("dump command printed no artifact location")]
    MissingLocation,
    #[error("{0}")]
    Engine(String),
}

fn describe_exit(status: &Option<i32>) -> String {
    status.map_or_else(|| "a signal".to_string(), |code| format!("status {code}"))
}

#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Produce an encrypted dump and return where it was written.
    async fn dump(&self, passphrase: &str) -> Result<String, StorageError>;

    /// Restore the data store from an uploaded dump.
    async fn restore(&self, passphrase: &str, artifact: &RestoreArtifact)
        -> Result<(), StorageError>;
}

/// Runs operator-configured programs.
///
/// Commands are split on whitespace and executed directly, without a shell.
/// The passphrase is passed through [`PASSPHRASE_ENV`], never as an argument.
/// The dump program must print the artifact location as the last line of
/// stdout; the restore program receives the artifact path as its last argument.
#[derive(Debug, Clone, Default)]
pub struct ScriptStorageEngine {
    dump_command: Option<String>,
    restore_command: Option<String>,
}

impl ScriptStorageEngine {
    #[must_use]
    pub const fn new(dump_command: Option<String>, restore_command: Option<String>) -> Self {
        Self {
            dump_command,
            restore_command,
        }
    }

    #[must_use]
    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.dump_command.clone(), config.restore_command.clone())
    }

    async fn run(
        kind: &'static str,
        command_line: Option<&str>,
        passphrase: &str,
        extra_arg: Option<PathBuf>,
    ) -> Result<String, StorageError> {
        let mut parts = command_line
            .map(str::split_whitespace)
            .ok_or(StorageError::NotConfigured(kind))?;
        let program = parts.next().ok_or(StorageError::NotConfigured(kind))?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(parts)
            .args(extra_arg)
            .env(PASSPHRASE_ENV, passphrase)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(command = program, "running {kind} command");
        let output = command.output().await.map_err(|source| StorageError::Spawn {
            command: program.to_string(),
            source,
        })?;

        if !output.status.success() {
            let stderr: String = String::from_utf8_lossy(&output.stderr)
                .trim()
                .chars()
                .take(MAX_STDERR_CHARS)
                .collect();
            return Err(StorageError::Failed {
                command: program.to_string(),
                status: output.status.code(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl StorageEngine for ScriptStorageEngine {
    async fn dump(&self, passphrase: &str) -> Result<String, StorageError> {
        let stdout = Self::run("dump", self.dump_command.as_deref(), passphrase, None).await?;
        stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or(StorageError::MissingLocation)
    }

    async fn restore(
        &self,
        passphrase: &str,
        artifact: &RestoreArtifact,
    ) -> Result<(), StorageError> {
        Self::run(
            "restore",
            self.restore_command.as_deref(),
            passphrase,
            Some(artifact.path().to_path_buf()),
        )
        .await
        .map(|_| ())
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[allow(clippy::expect_used)]
pub mod mock {
    //! Scriptable storage engine for orchestrator tests.

    use super::{async_trait, RestoreArtifact, StorageEngine, StorageError};
    use std::sync::Mutex;
    use std::time::Duration;

    /// One recorded `restore` call.
    #[derive(Debug, Clone)]
    pub struct RestoreCall {
        pub passphrase: String,
        pub contents: Vec<u8>,
    }

    /// Engine with preset results, recorded calls and an optional delay that
    /// keeps the operation in `StoreRunning`.
    #[derive(Default)]
    pub struct MockStorageEngine {
        pub dump_result: Mutex<Option<Result<String, StorageError>>>,
        pub restore_result: Mutex<Option<Result<(), StorageError>>>,
        pub dump_calls: Mutex<Vec<String>>,
        pub restore_calls: Mutex<Vec<RestoreCall>>,
        pub delay: Mutex<Option<Duration>>,
    }

    impl MockStorageEngine {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// # Panics
        ///
        /// Panics if the internal mutex is poisoned.
        pub fn set_dump_result(&self, result: Result<String, StorageError>) {
            *self.dump_result.lock().expect("lock poisoned") = Some(result);
        }

        /// # Panics
        ///
        /// Panics if the internal mutex is poisoned.
        pub fn set_restore_result(&self, result: Result<(), StorageError>) {
            *self.restore_result.lock().expect("lock poisoned") = Some(result);
        }

        /// Make every call sleep for `delay` before answering.
        ///
        /// # Panics
        ///
        /// Panics if the internal mutex is poisoned.
        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().expect("lock poisoned") = Some(delay);
        }

        /// Passphrases passed to `dump`, in order.
        ///
        /// # Panics
        ///
        /// Panics if the internal mutex is poisoned.
        #[must_use]
        pub fn dump_calls(&self) -> Vec<String> {
            self.dump_calls.lock().expect("lock poisoned").clone()
        }

        /// # Panics
        ///
        /// Panics if the internal mutex is poisoned.
        #[must_use]
        pub fn restore_calls(&self) -> Vec<RestoreCall> {
            self.restore_calls.lock().expect("lock poisoned").clone()
        }

        async fn pause(&self) {
            let delay = *self.delay.lock().expect("lock poisoned");
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }
    }

    #[async_trait]
    impl StorageEngine for MockStorageEngine {
        async fn dump(&self, passphrase: &str) -> Result<String, StorageError> {
            self.dump_calls
                .lock()
                .expect("lock poisoned")
                .push(passphrase.to_string());
            self.pause().await;
            self.dump_result
                .lock()
                .expect("lock poisoned")
                .take()
                .unwrap_or_else(|| Ok("/var/backups/mock.sql".to_string()))
        }

        async fn restore(
            &self,
            passphrase: &str,
            artifact: &RestoreArtifact,
        ) -> Result<(), StorageError> {
            let contents = tokio::fs::read(artifact.path()).await.unwrap_or_default();
            self.restore_calls
                .lock()
                .expect("lock poisoned")
                .push(RestoreCall {
                    passphrase: passphrase.to_string(),
                    contents,
                });
            self.pause().await;
            self.restore_result
                .lock()
                .expect("lock poisoned")
                .take()
                .unwrap_or(Ok(()))
        }
    }
}
