//! Rate limit decisions and their HTTP-facing renderings.

use std::sync::Arc;

use serde::Serialize;

use super::algorithm::Outcome;
use super::rules::RateLimitRule;

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// HTTP status used for quota exhaustion.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// The engine's decision for one request.
///
/// `reset_at` is in Unix seconds and `retry_after` in seconds, both rounded
/// up. `rule` names the rule responsible for the decision: the rejecting rule,
/// or the most restrictive one when everything allowed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<Arc<RateLimitRule>>,
}

impl RateLimitResult {
    /// Decision for a request no rule applies to.
    pub fn unlimited(now: f64) -> Self {
        Self {
            allowed: true,
            limit: u64::MAX,
            remaining: u64::MAX,
            reset_at: ceil_seconds(now),
            retry_after: None,
            rule: None,
        }
    }

    pub fn from_outcome(outcome: &Outcome, rule: Arc<RateLimitRule>) -> Self {
        Self {
            allowed: outcome.allowed,
            limit: outcome.limit,
            remaining: outcome.remaining,
            reset_at: ceil_seconds(outcome.reset_at),
            retry_after: outcome.retry_after.map(ceil_seconds),
            rule: Some(rule),
        }
    }

    /// Rejection produced when the counter store failed and the engine is
    /// configured to fail closed.
    pub(crate) fn store_failure(rule: Arc<RateLimitRule>, now: f64) -> Self {
        Self {
            allowed: false,
            limit: rule.max_requests,
            remaining: 0,
            reset_at: ceil_seconds(now + 1.0),
            retry_after: Some(1),
            rule: Some(rule),
        }
    }

    /// True when no rule governed the request.
    pub fn is_unlimited(&self) -> bool {
        self.rule.is_none()
    }

    pub fn rule_id(&self) -> Option<&str> {
        self.rule.as_deref().map(|r| r.id.as_str())
    }

    /// Response headers describing this decision.
    ///
    /// Empty for unlimited requests; `Retry-After` only on rejection.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        if self.is_unlimited() {
            return Vec::new();
        }

        let mut headers = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset_at.to_string()),
        ];
        if !self.allowed {
            headers.push((HEADER_RETRY_AFTER, self.retry_after.unwrap_or(0).to_string()));
        }
        headers
    }

    /// The 429 body for a rejected request, `None` when allowed.
    pub fn quota_exceeded(&self, default_message: &str) -> Option<QuotaExceededBody> {
        if self.allowed {
            return None;
        }

        let message = self
            .rule
            .as_deref()
            .and_then(|r| r.custom_message.clone())
            .unwrap_or_else(|| default_message.to_string());

        Some(QuotaExceededBody {
            status_code: TOO_MANY_REQUESTS,
            message,
            error: "Too Many Requests".to_string(),
            limit: self.limit,
            remaining: self.remaining,
            reset_at: self.reset_at,
            retry_after: self.retry_after.unwrap_or(0),
        })
    }
}

/// Error payload surfaced to clients as HTTP 429.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaExceededBody {
    pub status_code: u16,
    pub message: String,
    pub error: String,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: u64,
    pub retry_after: u64,
}

fn ceil_seconds(seconds: f64) -> u64 {
    if seconds.is_finite() && seconds > 0.0 {
        seconds.ceil() as u64
    } else {
        0
    }
}
