//! In-memory implementation of Storage for testing.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::store::{Storage, StorageError};

/// In-memory implementation of [`Storage`].
///
/// Suitable for tests and single-process experiments. Nothing survives the
/// process; for real deployments use a durable backend like
/// [`RedisStorage`](crate::RedisStorage).
#[derive(Debug, Default)]
pub struct MemoryStorage {
    logs: Mutex<HashMap<String, Vec<String>>>,
    log_prefix: String,
}

impl MemoryStorage {
    /// Create an empty store recognizing keys under `log_prefix`.
    pub fn new(log_prefix: impl Into<String>) -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            log_prefix: log_prefix.into(),
        }
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.logs.lock().unwrap().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.logs.lock().unwrap().is_empty()
    }

    /// Drop every key.
    pub fn clear(&self) {
        self.logs.lock().unwrap().clear();
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn append_log(&self, log_id: &str, payload: String) -> Result<(), StorageError> {
        let mut logs = self.logs.lock().unwrap();
        logs.entry(log_id.to_string()).or_default().push(payload);
        Ok(())
    }

    async fn lookup(&self, log_id: &str) -> Result<Vec<String>, StorageError> {
        let logs = self.logs.lock().unwrap();
        Ok(logs.get(log_id).cloned().unwrap_or_default())
    }

    async fn last_log(&self, log_id: &str) -> Result<Option<String>, StorageError> {
        let logs = self.logs.lock().unwrap();
        Ok(logs.get(log_id).and_then(|entries| entries.last().cloned()))
    }

    async fn log_ids(&self) -> Result<Vec<String>, StorageError> {
        let logs = self.logs.lock().unwrap();
        Ok(logs
            .keys()
            .filter(|key| key.starts_with(&self.log_prefix))
            .cloned()
            .collect())
    }

    async fn cleanup(&self, log_id: &str) -> Result<(), StorageError> {
        let mut logs = self.logs.lock().unwrap();
        logs.remove(log_id);
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_preserves_order() {
        let store = MemoryStorage::new("saga");

        store.append_log("sagatx-1", "a".to_string()).await.unwrap();
        store.append_log("sagatx-1", "b".to_string()).await.unwrap();
        store.append_log("sagatx-1", "c".to_string()).await.unwrap();

        assert_eq!(store.lookup("sagatx-1").await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.last_log("sagatx-1").await.unwrap().as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn lookup_of_absent_key_is_empty() {
        let store = MemoryStorage::new("saga");
        assert!(store.lookup("sagamissing").await.unwrap().is_empty());
        assert!(store.last_log("sagamissing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn log_ids_filters_by_prefix() {
        let store = MemoryStorage::new("saga");
        store.append_log("sagatx-1", "a".to_string()).await.unwrap();
        store.append_log("sagatx-2", "b".to_string()).await.unwrap();
        store.append_log("other", "c".to_string()).await.unwrap();

        let mut ids = store.log_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["sagatx-1", "sagatx-2"]);
    }

    #[tokio::test]
    async fn cleanup_removes_the_whole_sequence() {
        let store = MemoryStorage::new("saga");
        store.append_log("sagatx-1", "a".to_string()).await.unwrap();

        store.cleanup("sagatx-1").await.unwrap();
        assert!(store.lookup("sagatx-1").await.unwrap().is_empty());
        assert!(store.is_empty());
    }
}
