//! Test data factories for commands and uploads.
//!
//! ```ignore
//! use common::factories::{save_token, UploadFactory};
//!
//! let grant = app.command(&session, save_token(10)).await;
//! let body = UploadFactory::new(&token, data).chunk_size(100).chunk(&session, 2);
//! ```

mod upload;

pub use upload::{multipart_body, UploadFactory, MULTIPART_BOUNDARY};

use serde_json::{json, Value};

/// `save_token` for a restore, with the default token shape.
pub fn save_token(duration_minutes: i64) -> Value {
    json!({
        "type": "save_token",
        "size": 25,
        "capital": true,
        "numeric": true,
        "ambiguous": true,
        "reason": "restore_db",
        "duration": duration_minutes,
    })
}

pub fn backup(encryption_key: Option<&str>) -> Value {
    match encryption_key {
        Some(key) => json!({"type": "onthefly_backup", "encryptionKey": key}),
        None => json!({"type": "onthefly_backup"}),
    }
}

pub fn restore(backup_file: &str, encryption_key: Option<&str>) -> Value {
    let mut cmd = json!({"type": "onthefly_restore", "backupFile": backup_file});
    if let Some(key) = encryption_key {
        cmd["encryptionKey"] = json!(key);
    }
    cmd
}

pub fn operation_status(operation_id: &str) -> Value {
    json!({"type": "operation_status", "operation_id": operation_id})
}

pub fn cancel_operation(operation_id: &str) -> Value {
    json!({"type": "cancel_operation", "operation_id": operation_id})
}

/// Deterministic test file contents of `len` bytes.
pub fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + u8::try_from(i % 26).expect("fits")).collect()
}
