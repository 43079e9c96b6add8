//! Limiting algorithms.
//!
//! Each algorithm is a pure function of (rule, stored state, now). Checking
//! never mutates anything: it returns an [`Outcome`] carrying the
//! [`CommitOp`] to apply if the caller decides to let the request through.
//!
//! All time-weighted quantities are `f64` seconds and are clamped back into
//! range after every update so accumulated float error cannot drift below
//! zero or above capacity.

use serde::{Deserialize, Serialize};

use super::rules::{Algorithm, RateLimitRule};

/// Token bucket state: tokens available as of `last_refill_at`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucketState {
    pub tokens: f64,
    pub last_refill_at: f64,
}

/// Sliding window log state: event times inside the trailing window, ascending.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowState {
    pub timestamps: Vec<f64>,
}

/// Fixed window state: requests counted in window `window_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixedWindowState {
    pub window_index: i64,
    pub count: u64,
}

/// Leaky bucket state: queue depth as of `last_leak_at`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeakyBucketState {
    pub queue_size: f64,
    pub last_leak_at: f64,
}

/// Stored state for one (rule, key) pair, one shape per algorithm.
#[derive(Debug, Clone, PartialEq)]
pub enum CounterState {
    TokenBucket(TokenBucketState),
    SlidingWindow(SlidingWindowState),
    FixedWindow(FixedWindowState),
    LeakyBucket(LeakyBucketState),
}

/// The mutation that admits one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommitOp {
    /// Overwrite the bucket with its post-consumption state.
    TokenBucket(TokenBucketState),
    /// Record an event at `at` and prune entries older than the window.
    SlidingWindow { at: f64 },
    /// Increment the counter of `window_index`.
    FixedWindow { window_index: i64 },
    /// Overwrite the bucket with its post-enqueue state.
    LeakyBucket(LeakyBucketState),
}

/// Result of checking one rule.
///
/// `remaining` is the headroom left once this request is admitted, and is
/// zero for a rejection. Times are Unix seconds; `retry_after` is a
/// duration in seconds and is only set on rejection.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: f64,
    pub retry_after: Option<f64>,
    /// Requests (or consumed capacity) observed before this one
    pub observed: u64,
    /// Present only when `allowed`
    pub commit: Option<CommitOp>,
}

impl Algorithm {
    /// Check `rule` against `state` at `now`.
    ///
    /// A missing state, or one of the wrong shape, is a cold start.
    pub fn evaluate(
        &self,
        rule: &RateLimitRule,
        state: Option<&CounterState>,
        now: f64,
    ) -> Outcome {
        match self {
            Algorithm::TokenBucket => {
                let state = match state {
                    Some(CounterState::TokenBucket(s)) => Some(*s),
                    _ => None,
                };
                token_bucket(rule, state, now)
            }
            Algorithm::SlidingWindow => {
                let timestamps: &[f64] = match state {
                    Some(CounterState::SlidingWindow(s)) => s.timestamps.as_slice(),
                    _ => &[],
                };
                sliding_window(rule, timestamps, now)
            }
            Algorithm::FixedWindow => {
                let state = match state {
                    Some(CounterState::FixedWindow(s)) => Some(*s),
                    _ => None,
                };
                fixed_window(rule, state, now)
            }
            Algorithm::LeakyBucket => {
                let state = match state {
                    Some(CounterState::LeakyBucket(s)) => Some(*s),
                    _ => None,
                };
                leaky_bucket(rule, state, now)
            }
        }
    }
}

/// Index of the fixed window containing `now`.
pub fn window_index(now: f64, window_seconds: u64) -> i64 {
    (now / window_seconds as f64).floor() as i64
}

fn floor_u64(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.floor() as u64
    } else {
        0
    }
}

/// Absorbs float error from timestamp subtraction and non-representable
/// rates; at Unix-epoch magnitudes one ulp of `now` is roughly 2.4e-7 s.
const WHOLE_UNIT_TOLERANCE: f64 = 1e-6;

/// Round `value` to the nearest integer when it is within tolerance of it.
fn snap(value: f64) -> f64 {
    let nearest = value.round();
    if (value - nearest).abs() < WHOLE_UNIT_TOLERANCE {
        nearest
    } else {
        value
    }
}

fn ceil_u64(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.ceil() as u64
    } else {
        0
    }
}

fn token_bucket(rule: &RateLimitRule, state: Option<TokenBucketState>, now: f64) -> Outcome {
    let capacity = rule.effective_burst();
    let rate = rule.effective_refill_rate();

    let (stored, last_refill_at) = state.map_or((capacity, now), |s| (s.tokens, s.last_refill_at));
    let elapsed = (now - last_refill_at).max(0.0);
    let tokens = snap(stored + elapsed * rate).clamp(0.0, capacity);

    let limit = floor_u64(capacity);
    let observed = floor_u64(capacity - tokens.floor());

    if tokens >= 1.0 {
        let after = (tokens - 1.0).max(0.0);
        Outcome {
            allowed: true,
            limit,
            remaining: floor_u64(after),
            reset_at: now + (capacity - after) / rate,
            retry_after: None,
            observed,
            commit: Some(CommitOp::TokenBucket(TokenBucketState {
                tokens: after,
                last_refill_at: now,
            })),
        }
    } else {
        let retry_after = ceil_u64((1.0 - tokens) / rate) as f64;
        Outcome {
            allowed: false,
            limit,
            remaining: 0,
            reset_at: now + retry_after,
            retry_after: Some(retry_after),
            observed,
            commit: None,
        }
    }
}

fn sliding_window(rule: &RateLimitRule, timestamps: &[f64], now: f64) -> Outcome {
    let window = rule.window_seconds as f64;
    let lower_bound = now - window;

    let mut retained: Vec<f64> = timestamps.iter().copied().filter(|t| *t >= lower_bound).collect();
    retained.sort_by(f64::total_cmp);

    let count = retained.len() as u64;
    let reset_at = retained.first().map_or(now + window, |oldest| oldest + window);

    if count < rule.max_requests {
        Outcome {
            allowed: true,
            limit: rule.max_requests,
            remaining: rule.max_requests - count - 1,
            reset_at,
            retry_after: None,
            observed: count,
            commit: Some(CommitOp::SlidingWindow { at: now }),
        }
    } else {
        Outcome {
            allowed: false,
            limit: rule.max_requests,
            remaining: 0,
            reset_at,
            retry_after: Some((reset_at - now).max(0.0)),
            observed: count,
            commit: None,
        }
    }
}

// Known limitation: up to 2 * max_requests - 1 requests can pass across a
// window boundary (a full window's worth at the end of window n, then another
// at the start of window n + 1). This is inherent to the algorithm.
fn fixed_window(rule: &RateLimitRule, state: Option<FixedWindowState>, now: f64) -> Outcome {
    let index = window_index(now, rule.window_seconds);
    let count = state
        .filter(|s| s.window_index == index)
        .map_or(0, |s| s.count);
    let reset_at = ((index + 1) as f64) * rule.window_seconds as f64;

    if count < rule.max_requests {
        Outcome {
            allowed: true,
            limit: rule.max_requests,
            remaining: rule.max_requests - count - 1,
            reset_at,
            retry_after: None,
            observed: count,
            commit: Some(CommitOp::FixedWindow { window_index: index }),
        }
    } else {
        Outcome {
            allowed: false,
            limit: rule.max_requests,
            remaining: 0,
            reset_at,
            retry_after: Some((reset_at - now).max(0.0)),
            observed: count,
            commit: None,
        }
    }
}

fn leaky_bucket(rule: &RateLimitRule, state: Option<LeakyBucketState>, now: f64) -> Outcome {
    let capacity = rule.max_requests as f64;
    let rate = rule.leak_rate();

    let (stored, last_leak_at) = state.map_or((0.0, now), |s| (s.queue_size, s.last_leak_at));
    let elapsed = (now - last_leak_at).max(0.0);
    let queue = snap(stored - elapsed * rate).clamp(0.0, capacity);
    let observed = ceil_u64(queue);

    if queue < capacity {
        let after = (queue + 1.0).min(capacity);
        Outcome {
            allowed: true,
            limit: rule.max_requests,
            remaining: floor_u64(capacity - after),
            reset_at: now + after / rate,
            retry_after: None,
            observed,
            commit: Some(CommitOp::LeakyBucket(LeakyBucketState {
                queue_size: after,
                last_leak_at: now,
            })),
        }
    } else {
        let retry_after = ceil_u64((queue - capacity + 1.0) / rate) as f64;
        Outcome {
            allowed: false,
            limit: rule.max_requests,
            remaining: 0,
            reset_at: now + queue / rate,
            retry_after: Some(retry_after),
            observed,
            commit: None,
        }
    }
}

/// Apply a commit to a state value in memory.
///
/// Mirrors what the store-side commit does; used to model a sequence of
/// admitted requests without a store.
pub fn apply_commit(
    rule: &RateLimitRule,
    state: Option<CounterState>,
    op: CommitOp,
) -> CounterState {
    match op {
        CommitOp::TokenBucket(next) => CounterState::TokenBucket(next),
        CommitOp::LeakyBucket(next) => CounterState::LeakyBucket(next),
        CommitOp::SlidingWindow { at } => {
            let lower_bound = at - rule.window_seconds as f64;
            let mut timestamps = match state {
                Some(CounterState::SlidingWindow(s)) => s.timestamps,
                _ => Vec::new(),
            };
            timestamps.retain(|t| *t >= lower_bound);
            timestamps.push(at);
            timestamps.sort_by(f64::total_cmp);
            CounterState::SlidingWindow(SlidingWindowState { timestamps })
        }
        CommitOp::FixedWindow { window_index } => {
            let count = match state {
                Some(CounterState::FixedWindow(s)) if s.window_index == window_index => s.count,
                _ => 0,
            };
            CounterState::FixedWindow(FixedWindowState {
                window_index,
                count: count + 1,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::Scope;

    fn rule(algorithm: Algorithm, max_requests: u64, window_seconds: u64) -> RateLimitRule {
        RateLimitRule::new("r", Scope::Global, algorithm, max_requests, window_seconds)
    }

    /// Check then, if allowed, commit; returns the outcome.
    fn hit(rule: &RateLimitRule, state: &mut Option<CounterState>, now: f64) -> Outcome {
        let outcome = rule.algorithm.evaluate(rule, state.as_ref(), now);
        if let Some(op) = outcome.commit {
            *state = Some(apply_commit(rule, state.take(), op));
        }
        outcome
    }

    #[test]
    fn test_fixed_window_counts_down_then_rejects() {
        let rule = rule(Algorithm::FixedWindow, 5, 60);
        let mut state = None;
        let now = 1_000.0;

        let mut remaining = Vec::new();
        for _ in 0..5 {
            let outcome = hit(&rule, &mut state, now);
            assert!(outcome.allowed);
            remaining.push(outcome.remaining);
        }
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        let rejected = hit(&rule, &mut state, now);
        assert!(!rejected.allowed);
        assert_eq!(rejected.reset_at, 1_020.0);
        assert_eq!(rejected.retry_after, Some(20.0));
        assert_eq!(rejected.observed, 5);
    }

    #[test]
    fn test_fixed_window_boundary_burst_is_preserved() {
        let rule = rule(Algorithm::FixedWindow, 3, 10);
        let mut state = None;

        for _ in 0..3 {
            assert!(hit(&rule, &mut state, 9.9).allowed);
        }
        assert!(!hit(&rule, &mut state, 9.9).allowed);

        // A new window starts at t=10 with a fresh count.
        for _ in 0..3 {
            assert!(hit(&rule, &mut state, 10.0).allowed);
        }
        assert!(!hit(&rule, &mut state, 10.0).allowed);
    }

    #[test]
    fn test_token_bucket_cold_start_burst_then_refill() {
        let rule = rule(Algorithm::TokenBucket, 10, 10);
        let mut state = None;

        for i in 0..10 {
            let outcome = hit(&rule, &mut state, 0.0);
            assert!(outcome.allowed, "request {i} should pass");
            assert_eq!(outcome.remaining, 9 - i);
        }

        let rejected = hit(&rule, &mut state, 0.0);
        assert!(!rejected.allowed);
        assert_eq!(rejected.retry_after, Some(1.0));

        // refill rate is 1 token/s
        assert!(hit(&rule, &mut state, 1.0).allowed);
        assert!(!hit(&rule, &mut state, 1.0).allowed);
    }

    #[test]
    fn test_token_bucket_refills_after_one_over_rate_at_epoch_scale() {
        let start = 1_700_000_000.25;
        for (max_requests, window_seconds) in [(3, 10), (100, 60), (1, 49)] {
            let rule = rule(Algorithm::TokenBucket, max_requests, window_seconds);
            let mut state = None;
            for _ in 0..max_requests {
                assert!(hit(&rule, &mut state, start).allowed);
            }
            assert!(!hit(&rule, &mut state, start).allowed);

            let later = start + 1.0 / rule.effective_refill_rate();
            let outcome = hit(&rule, &mut state, later);
            assert!(outcome.allowed, "{max_requests}/{window_seconds}s rejected at {later}");
            assert_eq!(outcome.remaining, 0);
            assert!(!hit(&rule, &mut state, later).allowed);
        }
    }

    #[test]
    fn test_token_bucket_respects_burst_override() {
        let mut rule = rule(Algorithm::TokenBucket, 10, 10);
        rule.burst_size = Some(2);
        let mut state = None;

        assert!(hit(&rule, &mut state, 0.0).allowed);
        assert!(hit(&rule, &mut state, 0.0).allowed);
        assert!(!hit(&rule, &mut state, 0.0).allowed);

        // Long idle never overfills the bucket.
        let outcome = rule.algorithm.evaluate(&rule, state.as_ref(), 1_000.0);
        assert_eq!(outcome.remaining, 1);
        assert_eq!(outcome.limit, 2);
    }

    #[test]
    fn test_token_bucket_reset_when_full() {
        let rule = rule(Algorithm::TokenBucket, 10, 10);
        let outcome = rule.algorithm.evaluate(&rule, None, 50.0);
        // one token consumed, refilled after one second
        assert_eq!(outcome.reset_at, 51.0);
    }

    #[test]
    fn test_sliding_window_smooths_over_trailing_window() {
        let rule = rule(Algorithm::SlidingWindow, 5, 60);
        let mut state = None;

        for t in 0..5 {
            assert!(hit(&rule, &mut state, t as f64).allowed);
        }

        let rejected = hit(&rule, &mut state, 5.0);
        assert!(!rejected.allowed);
        assert_eq!(rejected.reset_at, 60.0);
        assert_eq!(rejected.retry_after, Some(55.0));

        // The first event (t=0) has left the window at t=61.
        let outcome = hit(&rule, &mut state, 61.0);
        assert!(outcome.allowed);
        assert_eq!(outcome.observed, 4);
    }

    #[test]
    fn test_sliding_window_empty_reset() {
        let rule = rule(Algorithm::SlidingWindow, 2, 30);
        let outcome = rule.algorithm.evaluate(&rule, None, 100.0);
        assert!(outcome.allowed);
        assert_eq!(outcome.reset_at, 130.0);
        assert_eq!(outcome.remaining, 1);
    }

    #[test]
    fn test_leaky_bucket_drains_at_constant_rate() {
        let rule = rule(Algorithm::LeakyBucket, 3, 3);
        let mut state = None;

        for _ in 0..3 {
            assert!(hit(&rule, &mut state, 0.0).allowed);
        }

        let rejected = hit(&rule, &mut state, 0.0);
        assert!(!rejected.allowed);
        assert_eq!(rejected.retry_after, Some(1.0));

        assert!(hit(&rule, &mut state, 1.0).allowed);
        assert!(!hit(&rule, &mut state, 1.0).allowed);
    }

    #[test]
    fn test_leaky_bucket_never_goes_negative() {
        let rule = rule(Algorithm::LeakyBucket, 3, 3);
        let state = Some(CounterState::LeakyBucket(LeakyBucketState {
            queue_size: 1.0,
            last_leak_at: 0.0,
        }));
        let outcome = rule.algorithm.evaluate(&rule, state.as_ref(), 500.0);
        assert!(outcome.allowed);
        assert_eq!(outcome.observed, 0);
        assert_eq!(outcome.remaining, 2);
    }

    #[test]
    fn test_clock_going_backwards_does_not_refill() {
        let rule = rule(Algorithm::TokenBucket, 2, 2);
        let state = Some(CounterState::TokenBucket(TokenBucketState {
            tokens: 0.0,
            last_refill_at: 100.0,
        }));
        let outcome = rule.algorithm.evaluate(&rule, state.as_ref(), 50.0);
        assert!(!outcome.allowed);
    }

    #[test]
    fn test_mismatched_state_is_cold_start() {
        let rule = rule(Algorithm::FixedWindow, 1, 60);
        let state = CounterState::LeakyBucket(LeakyBucketState {
            queue_size: 100.0,
            last_leak_at: 0.0,
        });
        assert!(rule.algorithm.evaluate(&rule, Some(&state), 0.0).allowed);
    }
}
