//! Idempotency Store
//!
//! At-most-once execution for mutating HTTP requests. Two tiers: an
//! optional redis read-through cache and the authoritative Postgres rows.
//! A record is `in_progress` between reservation and finalization.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;

use crate::store;

const REDIS_KEY_PREFIX: &str = "idempotency";

/// How long a caller waits for a concurrent holder before giving up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug, Clone)]
pub enum IdempotencyError {
    #[error("idempotency key not found")]
    NotFound,

    /// Key reused with a different request body: a client bug.
    #[error("idempotency key body mismatch")]
    HashMismatch,

    #[error("idempotency key in progress")]
    InProgress,

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for IdempotencyError {
    fn from(e: sqlx::Error) -> Self {
        IdempotencyError::Database(e.to_string())
    }
}

/// A finalized (or replayed) idempotent response.
#[derive(Debug, Clone)]
pub struct Record {
    pub key: String,
    pub request_hash: String,
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: String,
    pub served_by: &'static str,
}

#[derive(Serialize, Deserialize)]
struct CacheEnvelope {
    key: String,
    hash: String,
    status: u16,
    body: Vec<u8>,
    content_type: String,
}

pub struct Store {
    redis: Option<ConnectionManager>,
    pool: PgPool,
    ttl: Duration,
}

impl Store {
    pub fn new(redis: Option<ConnectionManager>, pool: PgPool, ttl: Duration) -> Self {
        Self { redis, pool, ttl }
    }

    /// Look a key up, checking the request hash against the stored one.
    pub async fn lookup(&self, key: &str, request_hash: &str) -> Result<Record, IdempotencyError> {
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            match conn.get::<_, Option<String>>(redis_key(key)).await {
                Ok(Some(raw)) => {
                    if let Ok(env) = serde_json::from_str::<CacheEnvelope>(&raw) {
                        if env.hash != request_hash {
                            return Err(IdempotencyError::HashMismatch);
                        }
                        return Ok(Record {
                            key: env.key,
                            request_hash: env.hash,
                            status: env.status,
                            body: env.body,
                            content_type: env.content_type,
                            served_by: "redis",
                        });
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "redis idempotency lookup failed");
                }
            }
        }

        let mut conn = self.pool.acquire().await?;
        let row = store::get_idempotency_key(&mut *conn, key)
            .await?
            .ok_or(IdempotencyError::NotFound)?;

        if row.request_hash != request_hash {
            return Err(IdempotencyError::HashMismatch);
        }
        if row.in_progress {
            return Err(IdempotencyError::InProgress);
        }

        let record = Record {
            key: row.key,
            request_hash: row.request_hash,
            status: row.response_status.unwrap_or(200) as u16,
            body: row.response_body.unwrap_or_default(),
            content_type: row
                .content_type
                .unwrap_or_else(|| "application/json".to_string()),
            served_by: "postgres",
        };
        self.cache(&record).await;
        Ok(record)
    }

    /// Reserve a key for execution. `false` means a concurrent request won
    /// the race and holds the reservation.
    pub async fn reserve(
        &self,
        key: &str,
        request_hash: &str,
        method: &str,
        path: &str,
    ) -> Result<bool, IdempotencyError> {
        let mut conn = self.pool.acquire().await?;
        Ok(store::reserve_idempotency_key(&mut *conn, key, request_hash, method, path).await?)
    }

    /// Record the captured response and clear `in_progress`.
    pub async fn finalize(
        &self,
        key: &str,
        request_hash: &str,
        status: u16,
        body: &[u8],
        content_type: &str,
    ) -> Result<Record, IdempotencyError> {
        let mut conn = self.pool.acquire().await?;
        let row = store::finalize_idempotency_key(
            &mut *conn,
            key,
            request_hash,
            status as i32,
            body,
            content_type,
        )
        .await?
        .ok_or(IdempotencyError::NotFound)?;

        let record = Record {
            key: row.key,
            request_hash: row.request_hash,
            status: row.response_status.unwrap_or(status as i32) as u16,
            body: row.response_body.unwrap_or_default(),
            content_type: row
                .content_type
                .unwrap_or_else(|| content_type.to_string()),
            served_by: "postgres",
        };
        self.cache(&record).await;
        Ok(record)
    }

    /// Poll until the concurrent holder finalizes, the wait budget runs
    /// out, or a terminal error surfaces.
    pub async fn wait_for_completion(
        &self,
        key: &str,
        request_hash: &str,
    ) -> Result<Record, IdempotencyError> {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            match self.lookup(key, request_hash).await {
                Ok(record) => return Ok(record),
                Err(IdempotencyError::InProgress) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(IdempotencyError::InProgress);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn cache(&self, record: &Record) {
        let Some(redis) = &self.redis else {
            return;
        };
        let env = CacheEnvelope {
            key: record.key.clone(),
            hash: record.request_hash.clone(),
            status: record.status,
            body: record.body.clone(),
            content_type: record.content_type.clone(),
        };
        let payload = match serde_json::to_string(&env) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "marshal idempotency cache");
                return;
            }
        };
        let mut conn = redis.clone();
        if let Err(err) = conn
            .set_ex::<_, _, ()>(redis_key(&record.key), payload, self.ttl.as_secs())
            .await
        {
            tracing::warn!(error = %err, "redis idempotency cache set failed");
        }
    }
}

fn redis_key(key: &str) -> String {
    format!("{}:{}", REDIS_KEY_PREFIX, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_key_prefix() {
        assert_eq!(redis_key("abc"), "idempotency:abc");
    }

    #[test]
    fn test_cache_envelope_roundtrip() {
        let env = CacheEnvelope {
            key: "k1".into(),
            hash: "h1".into(),
            status: 201,
            body: b"{\"ok\":true}".to_vec(),
            content_type: "application/json".into(),
        };
        let raw = serde_json::to_string(&env).unwrap();
        let back: CacheEnvelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.key, "k1");
        assert_eq!(back.status, 201);
        assert_eq!(back.body, env.body);
    }
}
