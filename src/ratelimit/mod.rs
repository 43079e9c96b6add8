//! Rate limiting rules, algorithms and the engine that combines them.

mod algorithm;
mod clock;
mod context;
mod counter;
mod key;
mod limiter;
mod result;
mod rules;
mod violation;

pub use algorithm::{
    apply_commit, window_index, CommitOp, CounterState, FixedWindowState, LeakyBucketState, Outcome,
    SlidingWindowState, TokenBucketState,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use context::RequestContext;
pub use counter::{commit, load_state};
pub use key::{normalize_endpoint, CounterKey};
pub use limiter::{Evaluation, PendingCommit, RateLimiter};
pub use result::{
    QuotaExceededBody, RateLimitResult, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET,
    HEADER_RETRY_AFTER, TOO_MANY_REQUESTS,
};
pub use rules::{match_rules, Algorithm, RateLimitRule, RuleFile, RuleSet, Scope};
pub use violation::{ChannelReporter, NoopReporter, TracingReporter, Violation, ViolationReporter};
