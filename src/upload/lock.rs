//! Short-lived processing locks keyed by content id.
//!
//! A lock is a set-if-absent with a TTL. Callers treat a backend error as
//! "no locking available" and carry on.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock backend unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for LockError {
    fn from(e: sqlx::Error) -> Self {
        LockError::Unavailable(e.to_string())
    }
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// True when the lock was taken; false when someone else holds it.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError>;

    async fn release(&self, key: &str) -> Result<(), LockError>;
}

/// Always grants. For single-process deployments without a shared backend.
pub struct NoopLock;

#[async_trait]
impl DistributedLock for NoopLock {
    async fn acquire(&self, _key: &str, _ttl: Duration) -> Result<bool, LockError> {
        Ok(true)
    }

    async fn release(&self, _key: &str) -> Result<(), LockError> {
        Ok(())
    }
}

/// Process-local locks with expiry.
#[derive(Default)]
pub struct MemoryLock {
    held: Mutex<HashMap<String, Instant>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut held = self.held.lock().await;
        let now = Instant::now();
        match held.get(key) {
            Some(expires) if *expires > now => Ok(false),
            _ => {
                held.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<(), LockError> {
        self.held.lock().await.remove(key);
        Ok(())
    }
}

/// Locks shared across processes through the `processing_locks` table.
pub struct PgLock {
    pool: PgPool,
}

impl PgLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DistributedLock for PgLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        // An expired row is taken over; a live one leaves RETURNING empty.
        let taken = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO processing_locks (key, expires_at)
            VALUES ($1, now() + $2::bigint * interval '1 millisecond')
            ON CONFLICT (key) DO UPDATE SET expires_at = EXCLUDED.expires_at
            WHERE processing_locks.expires_at < now()
            RETURNING key
            "#,
        )
        .bind(key)
        .bind(ttl.as_millis() as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(taken.is_some())
    }

    async fn release(&self, key: &str) -> Result<(), LockError> {
        sqlx::query("DELETE FROM processing_locks WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
