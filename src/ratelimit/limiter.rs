//! Core rate limiter implementation.
//!
//! A request is governed in two phases:
//!
//! 1. [`RateLimiter::check`] matches rules, reads each rule's counter state
//!    in priority order and decides. The first rejection stops evaluation;
//!    otherwise the most restrictive rule (smallest `remaining`) is reported.
//!    Nothing is written.
//! 2. [`RateLimiter::commit`] applies the pending mutation of every rule that
//!    allowed the request, once the caller has decided to let it through.
//!
//! Check and commit are not atomic with respect to other requests on the
//! same key, so concurrent requests can briefly exceed a limit. Fixed
//! window (atomic increment) and sliding window (sorted-set insert) commits
//! never lose updates; token and leaky bucket commits write back the state
//! computed at check time, so the last writer wins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, instrument, trace, warn};

use super::algorithm::CommitOp;
use super::clock::{Clock, MonotonicClock};
use super::context::RequestContext;
use super::counter;
use super::key::CounterKey;
use super::result::RateLimitResult;
use super::rules::{match_rules, RateLimitRule, RuleSet};
use super::violation::{NoopReporter, Violation, ViolationReporter};
use crate::config::{EngineConfig, FailMode};
use crate::error::Result;
use crate::store::{CounterStore, StoreError};

/// A mutation deferred until the caller commits.
#[derive(Debug, Clone)]
pub struct PendingCommit {
    pub rule: Arc<RateLimitRule>,
    pub key: CounterKey,
    pub op: CommitOp,
}

/// The outcome of [`RateLimiter::check`].
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub result: RateLimitResult,
    pending: Vec<PendingCommit>,
}

impl Evaluation {
    pub fn allowed(&self) -> bool {
        self.result.allowed
    }

    /// Commits that [`RateLimiter::commit`] would apply. Empty on rejection.
    pub fn pending(&self) -> &[PendingCommit] {
        &self.pending
    }

    fn decided(result: RateLimitResult) -> Self {
        Self {
            result,
            pending: Vec::new(),
        }
    }
}

/// The rate limiting engine.
///
/// Holds no rate limit state of its own: every counter lives in the store,
/// so one instance can be shared across tasks and many instances can share
/// one store.
pub struct RateLimiter<S: CounterStore> {
    store: Arc<S>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn ViolationReporter>,
    store_failures: AtomicU64,
}

impl<S: CounterStore> RateLimiter<S> {
    /// Create a limiter using the system clock and no violation reporting.
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(MonotonicClock::new()),
            reporter: Arc::new(NoopReporter),
            store_failures: AtomicU64::new(0),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ViolationReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Number of store failures absorbed since creation.
    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }

    /// Decide whether a request may proceed under an indexed rule set.
    #[instrument(
        skip_all,
        fields(endpoint = %ctx.endpoint, ip = %ctx.ip_address, tenant = ?ctx.tenant_id)
    )]
    pub async fn check(&self, rules: &RuleSet, ctx: &RequestContext) -> Evaluation {
        self.evaluate(rules.matching(ctx), ctx).await
    }

    /// Decide whether a request may proceed under a plain list of rules.
    #[instrument(
        skip_all,
        fields(endpoint = %ctx.endpoint, ip = %ctx.ip_address, tenant = ?ctx.tenant_id)
    )]
    pub async fn check_rules(&self, rules: &[RateLimitRule], ctx: &RequestContext) -> Evaluation {
        let matched = match_rules(rules, ctx)
            .into_iter()
            .map(|rule| Arc::new(rule.clone()))
            .collect();
        self.evaluate(matched, ctx).await
    }

    /// Apply the pending commits of an allowing evaluation.
    ///
    /// Distinct keys are committed concurrently. Failures are logged and
    /// counted, never returned. Returns how many commits succeeded.
    #[instrument(skip_all, fields(pending = evaluation.pending.len()))]
    pub async fn commit(&self, evaluation: &Evaluation) -> usize {
        if !evaluation.allowed() {
            return 0;
        }

        let timeout = self.config.store_timeout();
        let commits = evaluation.pending.iter().map(|pending| async move {
            let ttl = self.config.ttl_for(pending.rule.window_seconds);
            let result = counter::commit(
                self.store.as_ref(),
                &pending.rule,
                &pending.key,
                pending.op,
                ttl,
                timeout,
            )
            .await;
            (pending, result)
        });

        let mut committed = 0;
        for (pending, result) in join_all(commits).await {
            match result {
                Ok(()) => committed += 1,
                Err(e) => self.record_store_failure(&pending.rule, &pending.key, &e),
            }
        }
        committed
    }

    /// Check and, if allowed, commit in one step.
    pub async fn check_and_commit(&self, rules: &RuleSet, ctx: &RequestContext) -> RateLimitResult {
        let evaluation = self.check(rules, ctx).await;
        if evaluation.allowed() {
            self.commit(&evaluation).await;
        }
        evaluation.result
    }

    /// Administrative reset: forget every counter of `rule` for the actor
    /// identified by `ctx`. Returns how many keys were removed.
    pub async fn reset(&self, rule: &RateLimitRule, ctx: &RequestContext) -> Result<u64> {
        let key = CounterKey::derive(&self.config.namespace, rule, ctx);
        let timeout = self.config.store_timeout();

        let existed = counter::bounded(timeout, self.store.delete(key.as_str())).await?;
        let mut removed = u64::from(existed);
        removed += counter::bounded(timeout, self.store.delete_prefix(&key.prefix())).await?;

        debug!(key = %key, removed, "Reset rate limit counters");
        Ok(removed)
    }

    async fn evaluate(&self, matched: Vec<Arc<RateLimitRule>>, ctx: &RequestContext) -> Evaluation {
        let now = self.clock.now();
        if matched.is_empty() {
            trace!("No rate limit rules matched");
            return Evaluation::decided(RateLimitResult::unlimited(now));
        }

        let timeout = self.config.store_timeout();
        let mut most_restrictive: Option<RateLimitResult> = None;
        let mut pending = Vec::with_capacity(matched.len());

        for rule in matched {
            let key = CounterKey::derive(&self.config.namespace, &rule, ctx);

            let loaded =
                counter::load_state(self.store.as_ref(), &rule, &key, now, timeout).await;
            let state = match loaded {
                Ok(state) => state,
                Err(e) => {
                    self.record_store_failure(&rule, &key, &e);
                    match self.config.fail_mode {
                        FailMode::Open => continue,
                        FailMode::Closed => {
                            return Evaluation::decided(RateLimitResult::store_failure(rule, now));
                        }
                    }
                }
            };

            let outcome = rule.algorithm.evaluate(&rule, state.as_ref(), now);
            trace!(
                rule_id = %rule.id,
                key = %key,
                allowed = outcome.allowed,
                remaining = outcome.remaining,
                "Evaluated rule"
            );

            if !outcome.allowed {
                debug!(
                    rule_id = %rule.id,
                    key = %key,
                    observed = outcome.observed,
                    limit = outcome.limit,
                    "Rate limit exceeded"
                );
                self.reporter
                    .report(Violation::new(&rule, ctx, outcome.observed, now))
                    .await;
                return Evaluation::decided(RateLimitResult::from_outcome(&outcome, rule));
            }

            let result = RateLimitResult::from_outcome(&outcome, Arc::clone(&rule));
            if most_restrictive
                .as_ref()
                .map_or(true, |current| result.remaining < current.remaining)
            {
                most_restrictive = Some(result);
            }
            if let Some(op) = outcome.commit {
                pending.push(PendingCommit { rule, key, op });
            }
        }

        Evaluation {
            result: most_restrictive.unwrap_or_else(|| RateLimitResult::unlimited(now)),
            pending,
        }
    }

    fn record_store_failure(&self, rule: &RateLimitRule, key: &CounterKey, error: &StoreError) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            rule_id = %rule.id,
            key = %key,
            error = %error,
            fail_mode = ?self.config.fail_mode,
            "Counter store call failed"
        );
    }
}
