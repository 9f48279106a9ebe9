//! Routes decoded commands to the token issuer, upload pipeline, orchestrator
//! and settings store.

use std::sync::Arc;

use serde_json::{json, Value};

use super::command::{Command, UploadMeta};
use super::error::ExchangeError;
use super::reply::Reply;
use crate::operations::{
    OperationState, OperationStatus, Orchestrator, SettingsStore, BACKUP_PASSPHRASE_KEY,
};
use crate::session::{SessionId, SessionKeyStore};
use crate::tokens::{fingerprint, CharsetPolicy, TokenIssuer, TokenReason};
use crate::upload::{ChunkOutcome, OpenRequest, UploadPipeline};

/// Settings the command channel may write.
const WRITABLE_SETTINGS: &[&str] = &[BACKUP_PASSPHRASE_KEY];

/// Everything a sealed request can reach.
pub struct Exchange {
    pub sessions: Arc<SessionKeyStore>,
    pub tokens: Arc<TokenIssuer>,
    pub uploads: Arc<UploadPipeline>,
    pub orchestrator: Arc<Orchestrator>,
    pub settings: Arc<dyn SettingsStore>,
    /// Upper bound on `generate_password` length.
    pub password_length: usize,
}

impl Exchange {
    /// Execute one command on behalf of `session`.
    ///
    /// # Errors
    /// Any [`ExchangeError`]; the caller seals it as a failure reply.
    pub async fn dispatch(
        &self,
        session: &SessionId,
        command: Command,
    ) -> Result<Value, ExchangeError> {
        tracing::debug!(session = %session, command = command.name(), "dispatching command");

        match command {
            Command::OnTheFlyBackup { encryption_key } => {
                let status = self.orchestrator.start_backup(session, encryption_key)?;
                tracing::info!(operation_id = %status.operation_id, "backup started");
                to_value(&status)
            }
            Command::OnTheFlyRestore {
                encryption_key,
                backup_file,
            } => {
                let status = self
                    .orchestrator
                    .start_restore(session, encryption_key, backup_file)
                    .await?;
                tracing::info!(operation_id = %status.operation_id, "restore started");
                to_value(&status)
            }
            Command::SaveToken {
                size,
                capital,
                numeric,
                ambiguous,
                reason,
                duration,
            } => {
                let reason: TokenReason = reason.parse()?;
                let policy = CharsetPolicy {
                    length: size,
                    uppercase: capital,
                    digits: numeric,
                    symbols: false,
                    ambiguous,
                };
                let grant = self.tokens.mint(reason, duration, &policy)?;
                tracing::info!(
                    token = %fingerprint(&grant.token_id),
                    reason = %grant.reason,
                    expires_at = %grant.expires_at,
                    "token minted"
                );
                to_value(&grant)
            }
            Command::GeneratePassword {
                size,
                lowercase: _,
                numerals,
                capitalize,
                symbols,
                secure,
            } => {
                let policy = CharsetPolicy {
                    length: size.min(self.password_length),
                    uppercase: capitalize || secure,
                    digits: numerals || secure,
                    symbols: symbols || secure,
                    ambiguous: false,
                };
                let key = self.tokens.generate_secret(&policy)?;
                Ok(json!({ "key": key }))
            }
            Command::SaveOptionChange { field, value } => {
                if !WRITABLE_SETTINGS.contains(&field.as_str()) {
                    tracing::warn!(session = %session, field = %field, "refused setting change");
                    return Err(ExchangeError::ForbiddenSetting(field));
                }
                self.settings.set(&field, &value).await?;
                tracing::info!(field = %field, "setting saved");
                Ok(json!({ "field": field }))
            }
            Command::OperationStatus { operation_id } => {
                let status = self.orchestrator.status(operation_id, session)?;
                settled(status)
            }
            Command::CancelOperation { operation_id } => {
                let status = self.orchestrator.cancel(operation_id, session)?;
                settled(status)
            }
        }
    }

    /// Hand one upload chunk to the pipeline, finalizing on the last one.
    ///
    /// # Errors
    /// Any [`crate::upload::UploadError`], wrapped.
    pub async fn upload_chunk(
        &self,
        session: &SessionId,
        meta: &UploadMeta,
        bytes: &[u8],
    ) -> Result<Value, ExchangeError> {
        let req = OpenRequest {
            owner: session,
            token_id: &meta.token,
            declared_reason: &meta.declared_reason,
            file_name: &meta.file_name,
            total_size: meta.total_size,
            total_chunks: meta.total_chunks,
        };
        match self
            .uploads
            .receive(&req, meta.chunk_index, bytes, &meta.sha256)
            .await? {
            ChunkOutcome::Progress(progress) => {
                let mut value = to_value(&progress)?;
                value["complete"] = Value::Bool(false);
                Ok(value)
            }
            ChunkOutcome::Complete(summary) => {
                let mut value = to_value(&summary)?;
                value["complete"] = Value::Bool(true);
                Ok(value)
            }
        }
    }
}

/// Turn a handler result into a reply, logging what the caller will not see.
#[must_use]
pub fn into_reply(session: &SessionId, result: Result<Value, ExchangeError>) -> Reply {
    match result {
        Ok(value) => Reply::Success(value),
        Err(e) => {
            if e.is_internal() {
                tracing::error!(session = %session, error = %e, "exchange request failed");
            } else {
                tracing::info!(session = %session, code = e.code(), "exchange request rejected");
            }
            Reply::Failure(e.to_failure())
        }
    }
}

/// Failed and unknown outcomes are reported as operation failures, not results.
fn settled(status: OperationStatus) -> Result<Value, ExchangeError> {
    let error = status
        .error
        .clone()
        .unwrap_or_else(|| format!("operation ended in state {}", status.state));
    match status.state {
        OperationState::BackupFailed | OperationState::RestoreFailed => {
            Err(ExchangeError::StoreOperationFailed(error))
        }
        OperationState::OutcomeUnknown => Err(ExchangeError::OutcomeUnknown(error)),
        _ => to_value(&status),
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ExchangeError> {
    serde_json::to_value(value).map_err(|e| ExchangeError::InvalidRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::settings::mock::MockSettingsStore;
    use crate::operations::storage::mock::MockStorageEngine;
    use crate::operations::{OperationId, OrchestratorLimits, StorageError};
    use crate::upload::{sha256_hex, UploadLimits};
    use std::time::Duration;

    struct Fixture {
        _tmp: tempfile::TempDir,
        engine: Arc<MockStorageEngine>,
        settings: Arc<MockSettingsStore>,
        exchange: Exchange,
        session: SessionId,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(MockStorageEngine::new());
        let settings = Arc::new(MockSettingsStore::new());
        let sessions = Arc::new(SessionKeyStore::new(Duration::from_secs(60)));
        let tokens = Arc::new(TokenIssuer::new(60));
        let uploads = Arc::new(UploadPipeline::new(
            tmp.path(),
            UploadLimits {
                max_file_size: 4096,
                max_chunk_size: 1024,
                allowed_extensions: vec!["sql".to_string()],
                inactivity_timeout: Duration::from_secs(60),
            },
            Arc::clone(&tokens),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            engine.clone(),
            settings.clone(),
            Arc::clone(&tokens),
            Arc::clone(&uploads),
            OrchestratorLimits {
                timeout: Duration::from_secs(30),
                retention: Duration::from_secs(60),
                password_length: 40,
            },
        ));
        let exchange = Exchange {
            sessions,
            tokens,
            uploads,
            orchestrator,
            settings: settings.clone(),
            password_length: 40,
        };
        Fixture {
            _tmp: tmp,
            engine,
            settings,
            exchange,
            session: SessionId::generate(),
        }
    }

    impl Fixture {
        async fn run(&self, command: Command) -> Result<Value, ExchangeError> {
            self.exchange.dispatch(&self.session, command).await
        }

        async fn mint(&self) -> String {
            let grant = self
                .run(Command::SaveToken {
                    size: 25,
                    capital: true,
                    numeric: true,
                    ambiguous: false,
                    reason: "restore_db".to_string(),
                    duration: 10,
                })
                .await
                .expect("mint");
            grant["token_id"].as_str().expect("token id").to_string()
        }
    }

    #[tokio::test]
    async fn save_token_returns_grant() {
        let fx = fixture();
        let token = fx.mint().await;
        assert_eq!(token.len(), 25);
        assert!(fx.exchange.tokens.validate(&token, TokenReason::RestoreDb).is_ok());
    }

    #[tokio::test]
    async fn save_token_rejects_unknown_reason() {
        let fx = fixture();
        let err = fx
            .run(Command::SaveToken {
                size: 25,
                capital: true,
                numeric: true,
                ambiguous: false,
                reason: "drop_db".to_string(),
                duration: 10,
            })
            .await
            .expect_err("unknown reason");
        assert_eq!(err.code(), "invalid_token_policy");
    }

    #[tokio::test]
    async fn generate_password_is_capped() {
        let fx = fixture();
        let value = fx
            .run(Command::GeneratePassword {
                size: 500,
                lowercase: true,
                numerals: true,
                capitalize: true,
                symbols: false,
                secure: true,
            })
            .await
            .expect("password");
        assert_eq!(value["key"].as_str().expect("key").chars().count(), 40);
    }

    #[tokio::test]
    async fn only_allow_listed_settings_are_writable() {
        let fx = fixture();
        let err = fx
            .run(Command::SaveOptionChange {
                field: "admin_email".to_string(),
                value: "x".to_string(),
            })
            .await
            .expect_err("forbidden");
        assert_eq!(err.code(), "forbidden_setting");
        assert!(fx.settings.set_calls().is_empty());

        fx.run(Command::SaveOptionChange {
            field: BACKUP_PASSPHRASE_KEY.to_string(),
            value: "new key".to_string(),
        })
        .await
        .expect("allowed");
        assert_eq!(
            fx.settings.set_calls(),
            vec![(BACKUP_PASSPHRASE_KEY.to_string(), "new key".to_string())]
        );
    }

    #[tokio::test]
    async fn failed_backup_status_is_an_operation_failure() {
        let fx = fixture();
        fx.engine
            .set_dump_result(Err(StorageError::Engine("disk full".to_string())));
        let started = fx
            .run(Command::OnTheFlyBackup {
                encryption_key: Some("k".to_string()),
            })
            .await
            .expect("start");
        let id: OperationId =
            serde_json::from_value(started["operation_id"].clone()).expect("operation id");
        fx.exchange.orchestrator.wait(id).await;

        let err = fx
            .run(Command::OperationStatus { operation_id: id })
            .await
            .expect_err("failed");
        let failure = err.to_failure();
        assert_eq!(failure.code, "store_operation_failed");
        assert_eq!(failure.message, "disk full");
    }

    #[tokio::test]
    async fn restore_without_upload_is_artifact_missing() {
        let fx = fixture();
        let err = fx
            .run(Command::OnTheFlyRestore {
                encryption_key: Some("k".to_string()),
                backup_file: OperationId::new(),
            })
            .await
            .expect_err("missing");
        assert_eq!(err.code(), "artifact_missing");
        assert!(fx.engine.restore_calls().is_empty());
    }

    #[tokio::test]
    async fn single_chunk_upload_completes() {
        let fx = fixture();
        let token = fx.mint().await;
        let meta = UploadMeta {
            token,
            declared_reason: "restore_db".to_string(),
            chunk_index: 0,
            total_chunks: 1,
            total_size: 4,
            file_name: "dump.sql".to_string(),
            sha256: sha256_hex(b"data"),
        };
        let value = fx
            .exchange
            .upload_chunk(&fx.session, &meta, b"data")
            .await
            .expect("upload");
        assert_eq!(value["complete"], Value::Bool(true));
        assert_eq!(value["size"], json!(4));

        let again = fx
            .exchange
            .upload_chunk(&fx.session, &meta, b"data")
            .await
            .expect_err("token consumed");
        assert_eq!(again.code(), "token_already_consumed");
    }

    #[test]
    fn into_reply_seals_failures() {
        let session = SessionId::generate();
        let reply = into_reply(&session, Err(ExchangeError::ForbiddenSetting("x".into())));
        assert!(reply.is_error());
    }
}
