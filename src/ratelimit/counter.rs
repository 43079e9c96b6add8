//! Counter state persistence.
//!
//! Maps each algorithm's state onto counter store primitives:
//!
//! | Algorithm      | Key                 | Primitive                         |
//! |----------------|---------------------|-----------------------------------|
//! | token bucket   | `{key}`             | JSON value, overwritten on commit |
//! | sliding window | `{key}`             | sorted set of event times         |
//! | fixed window   | `{key}:w{index}`    | atomic integer increment          |
//! | leaky bucket   | `{key}`             | JSON value, overwritten on commit |
//!
//! Every store call is bounded by a timeout. Every write refreshes the TTL.

use std::future::Future;
use std::time::Duration;

use tracing::trace;
use uuid::Uuid;

use super::algorithm::{
    window_index, CommitOp, CounterState, FixedWindowState, LeakyBucketState, SlidingWindowState,
    TokenBucketState,
};
use super::key::CounterKey;
use super::rules::{Algorithm, RateLimitRule};
use crate::store::{CounterStore, StoreError, StoreResult};

/// Run a store call, failing with [`StoreError::Timeout`] if it takes too long.
pub(crate) async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = StoreResult<T>>,
) -> StoreResult<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

/// Read the stored state a rule needs to make a decision at `now`.
///
/// Nothing is written: stale sliding-window entries are filtered out at
/// read time and only pruned on commit.
pub async fn load_state<S>(
    store: &S,
    rule: &RateLimitRule,
    key: &CounterKey,
    now: f64,
    timeout: Duration,
) -> StoreResult<Option<CounterState>>
where
    S: CounterStore + ?Sized,
{
    let state = match rule.algorithm {
        Algorithm::TokenBucket => bounded(timeout, store.get(key.as_str()))
            .await?
            .map(|raw| decode::<TokenBucketState>(key.as_str(), &raw))
            .transpose()?
            .map(CounterState::TokenBucket),
        Algorithm::LeakyBucket => bounded(timeout, store.get(key.as_str()))
            .await?
            .map(|raw| decode::<LeakyBucketState>(key.as_str(), &raw))
            .transpose()?
            .map(CounterState::LeakyBucket),
        Algorithm::SlidingWindow => {
            let lower_bound = now - rule.window_seconds as f64;
            let timestamps =
                bounded(timeout, store.zscores_since(key.as_str(), lower_bound)).await?;
            Some(CounterState::SlidingWindow(SlidingWindowState { timestamps }))
        }
        Algorithm::FixedWindow => {
            let index = window_index(now, rule.window_seconds);
            let window_key = key.for_window(index);
            let count = match bounded(timeout, store.get(&window_key)).await? {
                Some(raw) => raw
                    .parse::<u64>()
                    .map_err(|e| StoreError::corrupt(&window_key, e.to_string()))?,
                None => 0,
            };
            Some(CounterState::FixedWindow(FixedWindowState {
                window_index: index,
                count,
            }))
        }
    };

    trace!(key = %key, state = ?state, "Loaded counter state");
    Ok(state)
}

/// Apply the mutation that admits one request.
pub async fn commit<S>(
    store: &S,
    rule: &RateLimitRule,
    key: &CounterKey,
    op: CommitOp,
    ttl: Duration,
    timeout: Duration,
) -> StoreResult<()>
where
    S: CounterStore + ?Sized,
{
    match op {
        CommitOp::TokenBucket(state) => {
            let raw = encode(key.as_str(), &state)?;
            bounded(timeout, store.set_with_ttl(key.as_str(), raw, ttl)).await?;
        }
        CommitOp::LeakyBucket(state) => {
            let raw = encode(key.as_str(), &state)?;
            bounded(timeout, store.set_with_ttl(key.as_str(), raw, ttl)).await?;
        }
        CommitOp::SlidingWindow { at } => {
            // Members must be unique even when two requests share a timestamp.
            let member = format!("{at:.6}:{}", Uuid::new_v4());
            bounded(timeout, store.zadd_with_ttl(key.as_str(), at, member, ttl)).await?;
            let cutoff = at - rule.window_seconds as f64;
            bounded(timeout, store.zrem_before(key.as_str(), cutoff)).await?;
        }
        CommitOp::FixedWindow { window_index } => {
            let window_key = key.for_window(window_index);
            let count = bounded(timeout, store.incr_with_ttl(&window_key, ttl)).await?;
            trace!(key = %key, window_index, count, "Incremented fixed window");
        }
    }
    Ok(())
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, raw: &str) -> StoreResult<T> {
    serde_json::from_str(raw).map_err(|e| StoreError::corrupt(key, e.to_string()))
}

fn encode<T: serde::Serialize>(key: &str, value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::corrupt(key, e.to_string()))
}
