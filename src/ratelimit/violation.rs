//! Violation records and the reporter seam they are handed to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use super::context::RequestContext;
use super::rules::RateLimitRule;

/// One rejected request, as seen by the rule that rejected it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub id: Uuid,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub ip_address: String,
    pub endpoint: String,
    pub method: String,
    pub user_agent: Option<String>,
    pub rule_id: String,
    pub rule_name: String,
    /// Count observed by the rule when it rejected the request
    pub request_count: u64,
    pub limit_value: u64,
    pub window_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

impl Violation {
    pub fn new(rule: &RateLimitRule, ctx: &RequestContext, request_count: u64, now: f64) -> Self {
        let seconds = now.floor() as i64;
        let nanos = (now.fract() * 1e9) as u32;
        let timestamp = DateTime::<Utc>::from_timestamp(seconds, nanos).unwrap_or_else(Utc::now);

        Self {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id.clone(),
            user_id: ctx.user_id.clone(),
            ip_address: ctx.ip_address.clone(),
            endpoint: ctx.endpoint.clone(),
            method: ctx.method.clone(),
            user_agent: ctx.user_agent.clone(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            request_count,
            limit_value: rule.max_requests,
            window_seconds: rule.window_seconds,
            timestamp,
        }
    }
}

/// Receives a record for every rejected request.
///
/// Implementations sit on the request path and should hand the record off
/// quickly (queue it, log it) rather than do slow I/O inline.
#[async_trait]
pub trait ViolationReporter: Send + Sync {
    async fn report(&self, violation: Violation);
}

/// Discards violations.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

#[async_trait]
impl ViolationReporter for NoopReporter {
    async fn report(&self, _violation: Violation) {}
}

/// Logs each violation as a structured event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

#[async_trait]
impl ViolationReporter for TracingReporter {
    async fn report(&self, violation: Violation) {
        info!(
            violation_id = %violation.id,
            rule_id = %violation.rule_id,
            rule_name = %violation.rule_name,
            tenant_id = ?violation.tenant_id,
            user_id = ?violation.user_id,
            ip = %violation.ip_address,
            endpoint = %violation.endpoint,
            request_count = violation.request_count,
            limit = violation.limit_value,
            window_seconds = violation.window_seconds,
            "Rate limit violation"
        );
    }
}

/// Forwards violations to a bounded channel for an out-of-band consumer.
///
/// Never waits: when the channel is full or closed the record is dropped
/// with a warning.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    sender: mpsc::Sender<Violation>,
}

impl ChannelReporter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Violation>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ViolationReporter for ChannelReporter {
    async fn report(&self, violation: Violation) {
        if let Err(e) = self.sender.try_send(violation) {
            warn!(error = %e, "Dropping rate limit violation record");
        }
    }
}
