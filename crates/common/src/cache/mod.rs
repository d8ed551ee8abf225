//! Redis integration
//!
//! JSON documents plus set-based indexes over a multiplexed connection.
//! Sessions are the only documents persisted here; see [`keys`].

use crate::config::RedisConfig;
use crate::errors::{AppError, Result};
use redis::{aio::MultiplexedConnection, AsyncCommands, Client, RedisError};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

fn redis_error(action: &'static str, key: &str) -> impl FnOnce(RedisError) -> AppError {
    let key = key.to_string();
    move |e| AppError::CacheError {
        message: format!("Failed to {} '{}': {}", action, key, e),
    }
}

/// Prefixed JSON document access to Redis
#[derive(Clone)]
pub struct Cache {
    connection: MultiplexedConnection,
    key_prefix: String,
}

impl Cache {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str()).map_err(redis_error("open client for", &config.url))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(redis_error("connect to", &config.url))?;

        debug!(prefix = %config.key_prefix, "Redis connected");
        Ok(Self {
            connection,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    /// Read and decode a document; `None` when the key is absent
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let full_key = self.key(key);
        let raw: Option<String> = self
            .connection
            .clone()
            .get(&full_key)
            .await
            .map_err(redis_error("read", &full_key))?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| AppError::CacheError {
                message: format!("Corrupt document at '{}': {}", full_key, e),
            })
        })
        .transpose()
    }

    /// Overwrite a document
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let full_key = self.key(key);
        let json = serde_json::to_string(value)?;
        self.connection
            .clone()
            .set::<_, _, ()>(&full_key, json)
            .await
            .map_err(redis_error("write", &full_key))
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let full_key = self.key(key);
        self.connection
            .clone()
            .exists(&full_key)
            .await
            .map_err(redis_error("check", &full_key))
    }

    /// Add `member` to the index set at `key`
    pub async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let full_key = self.key(key);
        self.connection
            .clone()
            .sadd::<_, _, ()>(&full_key, member)
            .await
            .map_err(redis_error("index into", &full_key))
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let full_key = self.key(key);
        self.connection
            .clone()
            .smembers(&full_key)
            .await
            .map_err(redis_error("list", &full_key))
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(redis_error("ping", &self.key_prefix))
    }
}

/// Key layout, relative to the configured prefix
pub mod keys {
    use uuid::Uuid;

    /// A persisted research session
    pub fn session(session_id: Uuid) -> String {
        format!("session:{}", session_id)
    }

    /// Set of every persisted session id
    pub fn session_index() -> &'static str {
        "sessions"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let session_id = uuid::Uuid::new_v4();
        assert_eq!(keys::session(session_id), format!("session:{}", session_id));
        assert_eq!(keys::session_index(), "sessions");
    }
}
