//! Application settings store (the host's configuration table).

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;

/// Setting holding the passphrase of the most recent backup.
pub const BACKUP_PASSPHRASE_KEY: &str = "bck_script_passkey";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings store unavailable")]
    Unavailable,
    #[error("settings file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, SettingsError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), SettingsError>;
}

/// Settings held in process memory only.
#[derive(Default)]
pub struct InMemorySettingsStore {
    values: RwLock<HashMap<String, String>>,
}

impl InMemorySettingsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        let values = self.values.read().map_err(|_| SettingsError::Unavailable)?;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        let mut values = self.values.write().map_err(|_| SettingsError::Unavailable)?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Settings persisted as a flat JSON object.
///
/// Writes go to a sibling temp file that is then renamed over the original.
pub struct JsonFileSettingsStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileSettingsStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, String>, SettingsError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SettingsStore for JsonFileSettingsStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        Ok(self.load().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        let _guard = self.write_lock.lock().await;
        let mut values = self.load().await?;
        values.insert(key.to_string(), value.to_string());

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&values)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[allow(clippy::expect_used)]
pub mod mock {
    //! Recording settings store for orchestrator tests.

    use super::{async_trait, SettingsError, SettingsStore};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory store that records every `set` call and can be told to fail.
    #[derive(Default)]
    pub struct MockSettingsStore {
        pub values: Mutex<HashMap<String, String>>,
        pub set_calls: Mutex<Vec<(String, String)>>,
        pub fail_next_set: Mutex<bool>,
    }

    impl MockSettingsStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Every `(key, value)` passed to `set`, in order.
        ///
        /// # Panics
        ///
        /// Panics if the internal mutex is poisoned.
        #[must_use]
        pub fn set_calls(&self) -> Vec<(String, String)> {
            self.set_calls.lock().expect("lock poisoned").clone()
        }

        /// Seed a value without recording a `set` call.
        ///
        /// # Panics
        ///
        /// Panics if the internal mutex is poisoned.
        pub fn seed(&self, key: &str, value: &str) {
            self.values
                .lock()
                .expect("lock poisoned")
                .insert(key.to_string(), value.to_string());
        }

        /// Make the next `set` fail with [`SettingsError::Unavailable`].
        ///
        /// # Panics
        ///
        /// Panics if the internal mutex is poisoned.
        pub fn fail_next_set(&self) {
            *self.fail_next_set.lock().expect("lock poisoned") = true;
        }
    }

    #[async_trait]
    impl SettingsStore for MockSettingsStore {
        async fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
            Ok(self.values.lock().expect("lock poisoned").get(key).cloned())
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
            self.set_calls
                .lock()
                .expect("lock poisoned")
                .push((key.to_string(), value.to_string()));
            if std::mem::take(&mut *self.fail_next_set.lock().expect("lock poisoned")) {
                return Err(SettingsError::Unavailable);
            }
            self.values
                .lock()
                .expect("lock poisoned")
                .insert(key.to_string(), value.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_get_set() {
        let store = InMemorySettingsStore::new();
        assert_eq!(store.get(BACKUP_PASSPHRASE_KEY).await.expect("get"), None);
        store.set(BACKUP_PASSPHRASE_KEY, "secret").await.expect("set");
        assert_eq!(
            store.get(BACKUP_PASSPHRASE_KEY).await.expect("get").as_deref(),
            Some("secret")
        );
    }

    #[tokio::test]
    async fn json_file_persists_across_instances() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("settings.json");

        let store = JsonFileSettingsStore::new(&path);
        assert_eq!(store.get("missing").await.expect("get"), None);
        store.set(BACKUP_PASSPHRASE_KEY, "one").await.expect("set");
        store.set("other", "two").await.expect("set");
        store.set(BACKUP_PASSPHRASE_KEY, "three").await.expect("set");

        let reopened = JsonFileSettingsStore::new(&path);
        assert_eq!(
            reopened.get(BACKUP_PASSPHRASE_KEY).await.expect("get").as_deref(),
            Some("three")
        );
        assert_eq!(reopened.get("other").await.expect("get").as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn json_file_rejects_corrupt_content() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("settings.json");
        tokio::fs::write(&path, b"not json").await.expect("write");

        let store = JsonFileSettingsStore::new(&path);
        assert!(matches!(
            store.get(BACKUP_PASSPHRASE_KEY).await,
            Err(SettingsError::Format(_))
        ));
    }
}
