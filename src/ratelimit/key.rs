//! Counter key derivation.

use std::fmt;

use super::context::RequestContext;
use super::rules::{RateLimitRule, Scope};

/// Discriminator used when a scope's identity is absent from the request.
const ANONYMOUS: &str = "anonymous";

/// The storage key for one (rule, actor) pair.
///
/// Layout: `{namespace}:{rule id}:{scope}:{discriminator}`, followed by
/// `:ep:{endpoint}` when the rule carries an endpoint restriction. `%` and
/// `:` inside request-supplied segments are percent-encoded, so `:` only
/// ever appears as a delimiter and [`CounterKey::prefix`] cannot reach
/// another actor's keys. The
/// derivation is a pure function of the rule and the request, so repeated
/// requests from the same actor always land on the same counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey(String);

impl CounterKey {
    pub fn derive(namespace: &str, rule: &RateLimitRule, ctx: &RequestContext) -> Self {
        let discriminator = match rule.scope {
            Scope::Global => "all".to_string(),
            Scope::Tenant => identity(ctx.tenant_id.as_deref()),
            Scope::User => identity(ctx.user_id.as_deref()),
            Scope::Ip => identity(Some(ctx.ip_address.as_str())),
            Scope::Endpoint => escape(&normalize_endpoint(&ctx.endpoint)),
        };

        let mut key = format!(
            "{}:{}:{}:{}",
            namespace,
            rule.id,
            rule.scope.as_str(),
            discriminator
        );
        if rule.endpoint.is_some() {
            key.push_str(":ep:");
            key.push_str(&escape(&normalize_endpoint(&ctx.endpoint)));
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the fixed-window counter for `window_index`.
    pub fn for_window(&self, window_index: i64) -> String {
        format!("{}:w{}", self.0, window_index)
    }

    /// Prefix shared by every key stored for this (rule, actor) pair.
    pub fn prefix(&self) -> String {
        format!("{}:", self.0)
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn identity(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.is_empty() => escape(v),
        _ => ANONYMOUS.to_string(),
    }
}

fn escape(segment: &str) -> String {
    if !segment.contains(['%', ':']) {
        return segment.to_string();
    }
    segment.replace('%', "%25").replace(':', "%3A")
}

/// Normalize a request path for use in a key.
///
/// Drops the query string and fragment, collapses repeated slashes, removes a
/// trailing slash and guarantees a leading one.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let path = endpoint
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}
