//! Redis-backed saga log storage.
//!
//! Maps the [`Storage`] contract onto Redis list primitives: `RPUSH` to
//! append, `LRANGE` to read, `DEL` to clean up. Connections come from a
//! deadpool pool; recycled connections are verified with `PING` before reuse.

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::{Connection, Pool, PoolConfig, Runtime};

use super::store::{Storage, StorageError};

/// Configuration for [`RedisStorage`].
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis endpoint, `host:port`.
    pub endpoint: String,
    /// Optional AUTH password.
    pub password: Option<String>,
    /// Database index.
    pub db: i64,
    /// Maximum pooled connections.
    pub pool_size: usize,
    /// Key prefix identifying saga logs.
    pub log_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:6379".to_string(),
            password: None,
            db: 0,
            pool_size: 10,
            log_prefix: "saga".to_string(),
        }
    }
}

impl RedisConfig {
    fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}/{}", password, self.endpoint, self.db),
            None => format!("redis://{}/{}", self.endpoint, self.db),
        }
    }
}

/// Redis list implementation of [`Storage`].
pub struct RedisStorage {
    pool: Pool,
    log_prefix: String,
}

impl RedisStorage {
    /// Build a connection pool from `config`.
    ///
    /// Connections are established lazily; a missing server surfaces on first
    /// use, not here.
    pub fn connect(config: RedisConfig) -> Result<Self, StorageError> {
        let mut pool_cfg = deadpool_redis::Config::from_url(config.url());
        pool_cfg.pool = Some(PoolConfig::new(config.pool_size));
        let pool = pool_cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|err| StorageError::Pool(err.to_string()))?;
        Ok(Self {
            pool,
            log_prefix: config.log_prefix,
        })
    }

    async fn conn(&self) -> Result<Connection, StorageError> {
        self.pool
            .get()
            .await
            .map_err(|err| StorageError::Pool(err.to_string()))
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn append_log(&self, log_id: &str, payload: String) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        let _: i64 = cmd("RPUSH")
            .arg(log_id)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        Ok(())
    }

    async fn lookup(&self, log_id: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.conn().await?;
        cmd("LRANGE")
            .arg(log_id)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))
    }

    async fn last_log(&self, log_id: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.conn().await?;
        let mut tail: Vec<String> = cmd("LRANGE")
            .arg(log_id)
            .arg(-1)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        Ok(tail.pop())
    }

    async fn log_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = cmd("KEYS")
            .arg("*")
            .query_async(&mut conn)
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        Ok(keys
            .into_iter()
            .filter(|key| key.starts_with(&self.log_prefix))
            .collect())
    }

    async fn cleanup(&self, log_id: &str) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        let _: i64 = cmd("DEL")
            .arg(log_id)
            .query_async(&mut conn)
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.pool.close();
        Ok(())
    }
}
