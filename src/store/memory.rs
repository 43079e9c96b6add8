//! In-process counter store backed by a concurrent hash map.
//!
//! Useful for single-instance deployments, the CLI and tests. Expiry is lazy:
//! an expired entry is treated as absent on access and dropped on the next
//! read, write or [`MemoryStore::purge_expired`] call.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{CounterStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    /// Members kept sorted by ascending score.
    Sorted(Vec<(f64, String)>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// A [`CounterStore`] kept in local memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time left before `key` expires, if it is live.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.expires_at.saturating_duration_since(now))
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        trace!(removed, "Purged expired counter entries");
        removed
    }

    fn read<R>(&self, key: &str, f: impl FnOnce(&Value) -> R) -> Option<R> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                return Some(f(&entry.value));
            }
        }
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        None
    }

    fn write<R>(
        &self,
        key: &str,
        ttl: Duration,
        init: impl Fn() -> Value,
        f: impl FnOnce(&mut Value) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: init(),
                expires_at: now,
            });
        if entry.is_expired(now) {
            entry.value = init();
        }
        let result = f(&mut entry.value)?;
        entry.expires_at = now + ttl;
        Ok(result)
    }
}

fn wrong_type(key: &str, expected: &str) -> StoreError {
    StoreError::corrupt(key, format!("expected {expected}"))
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.read(key, |value| match value {
            Value::Text(text) => Ok(text.clone()),
            Value::Sorted(_) => Err(wrong_type(key, "a plain value")),
        })
        .transpose()
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        self.write(
            key,
            ttl,
            || Value::Text("0".to_string()),
            |value| match value {
                Value::Text(text) => {
                    let current: u64 = text
                        .parse()
                        .map_err(|_| wrong_type(key, "an integer"))?;
                    let next = current.saturating_add(1);
                    *text = next.to_string();
                    Ok(next)
                }
                Value::Sorted(_) => Err(wrong_type(key, "an integer")),
            },
        )
    }

    async fn zadd_with_ttl(
        &self,
        key: &str,
        score: f64,
        member: String,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.write(
            key,
            ttl,
            || Value::Sorted(Vec::new()),
            |value| match value {
                Value::Sorted(members) => {
                    members.retain(|(_, m)| *m != member);
                    let idx = members.partition_point(|(s, _)| *s <= score);
                    members.insert(idx, (score, member));
                    Ok(())
                }
                Value::Text(_) => Err(wrong_type(key, "a sorted set")),
            },
        )
    }

    async fn zscores_since(&self, key: &str, min: f64) -> StoreResult<Vec<f64>> {
        self.read(key, |value| match value {
            Value::Sorted(members) => Ok(members
                .iter()
                .filter(|(score, _)| *score >= min)
                .map(|(score, _)| *score)
                .collect()),
            Value::Text(_) => Err(wrong_type(key, "a sorted set")),
        })
        .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn zrem_before(&self, key: &str, cutoff: f64) -> StoreResult<u64> {
        let now = Instant::now();
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(0);
        };
        if entry.is_expired(now) {
            return Ok(0);
        }
        match &mut entry.value {
            Value::Sorted(members) => {
                let before = members.len();
                members.retain(|(score, _)| *score >= cutoff);
                Ok((before - members.len()) as u64)
            }
            Value::Text(_) => Err(wrong_type(key, "a sorted set")),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, e)| !e.is_expired(now)))
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let mut removed = 0u64;
        self.entries.retain(|key, _| {
            if key.starts_with(prefix) {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}
