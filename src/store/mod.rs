//! Counter store abstraction.
//!
//! Rate limit state lives entirely behind [`CounterStore`]: a shared,
//! TTL-capable key/value store with atomic increments and sorted sets,
//! shaped after the primitives Redis offers. The engine never keeps
//! counters of its own, so any number of engine instances sharing one
//! store enforce the same limits.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;

/// Errors raised by a counter store adapter.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt value at '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    pub(crate) fn corrupt(key: &str, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A shared counter store.
///
/// Implementations must be safe to call concurrently from many tasks.
/// Every write refreshes the key's TTL so idle keys expire on their own.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read a plain value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Overwrite a plain value and set its TTL.
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()>;

    /// Atomically increment an integer value (missing keys start at 0),
    /// refresh its TTL and return the new value.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<u64>;

    /// Add a member to a sorted set (replacing its score if present) and
    /// refresh the set's TTL.
    async fn zadd_with_ttl(
        &self,
        key: &str,
        score: f64,
        member: String,
        ttl: Duration,
    ) -> StoreResult<()>;

    /// Scores of all sorted-set members with `score >= min`, ascending.
    async fn zscores_since(&self, key: &str, min: f64) -> StoreResult<Vec<f64>>;

    /// Remove sorted-set members with `score < cutoff`; returns how many went.
    async fn zrem_before(&self, key: &str, cutoff: f64) -> StoreResult<u64>;

    /// Delete a key; returns whether it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Delete every key starting with `prefix`; returns how many went.
    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64>;
}
