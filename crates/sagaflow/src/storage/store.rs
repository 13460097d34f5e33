use async_trait::async_trait;

/// Error type for [`Storage`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("connection pool error: {0}")]
    Pool(String),
}

/// Append-only per-key log storage.
///
/// This is the durability seam of the coordinator: a payload accepted by
/// [`append_log`](Self::append_log) must survive process death, and reads of
/// the same key must observe every append that returned before them
/// (read-after-write per key). Concurrent appends to one key serialize to a
/// well-defined order at the backend; that order is the saga's history.
///
/// Payloads are opaque to the backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Append `payload` at the tail of the sequence stored under `log_id`,
    /// creating the sequence if absent. Durable by the time it returns.
    async fn append_log(&self, log_id: &str, payload: String) -> Result<(), StorageError>;

    /// All payloads under `log_id` in append order; empty if the key is absent.
    async fn lookup(&self, log_id: &str) -> Result<Vec<String>, StorageError>;

    /// The tail payload under `log_id`, or `None` if the key is absent.
    async fn last_log(&self, log_id: &str) -> Result<Option<String>, StorageError>;

    /// All keys whose names begin with the backend's configured log prefix.
    async fn log_ids(&self) -> Result<Vec<String>, StorageError>;

    /// Remove the sequence under `log_id` wholesale.
    async fn cleanup(&self, log_id: &str) -> Result<(), StorageError>;

    /// Release backend resources.
    async fn close(&self) -> Result<(), StorageError>;
}
