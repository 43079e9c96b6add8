//! Rate limit rules configuration and matching.
//!
//! Rules are authored elsewhere and handed to the engine read-only. This
//! module validates them once at load time and selects, per request, the
//! enabled rules whose scope applies, ordered by descending priority.

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::context::RequestContext;
use crate::error::{Result, TollgateError};

/// The dimension a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    Global,
    Tenant,
    User,
    Ip,
    Endpoint,
}

impl Scope {
    /// Short lowercase label, used in counter keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Tenant => "tenant",
            Scope::User => "user",
            Scope::Ip => "ip",
            Scope::Endpoint => "endpoint",
        }
    }
}

/// Limiting algorithm applied by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Algorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
    LeakyBucket,
}

/// A single rate limit rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRule {
    pub id: String,
    pub name: String,
    /// Higher priorities are evaluated first
    #[serde(default)]
    pub priority: i32,
    pub scope: Scope,
    /// Identity the scope must equal (or endpoint prefix); unused for GLOBAL
    #[serde(default)]
    pub scope_value: Option<String>,
    /// Optional endpoint prefix narrowing any scope
    #[serde(default)]
    pub endpoint: Option<String>,
    pub algorithm: Algorithm,
    pub max_requests: u64,
    pub window_seconds: u64,
    /// Token bucket capacity, defaults to `max_requests`
    #[serde(default)]
    pub burst_size: Option<u64>,
    /// Token bucket refill in tokens/second, defaults to `max_requests / window_seconds`
    #[serde(default)]
    pub refill_rate: Option<f64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub custom_message: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl RateLimitRule {
    /// Create an enabled rule with no scope value, endpoint or overrides.
    pub fn new(
        id: impl Into<String>,
        scope: Scope,
        algorithm: Algorithm,
        max_requests: u64,
        window_seconds: u64,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            priority: 0,
            scope,
            scope_value: None,
            endpoint: None,
            algorithm,
            max_requests,
            window_seconds,
            burst_size: None,
            refill_rate: None,
            enabled: true,
            custom_message: None,
        }
    }

    pub fn with_scope_value(mut self, value: impl Into<String>) -> Self {
        self.scope_value = Some(value.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Token bucket capacity.
    pub fn effective_burst(&self) -> f64 {
        self.burst_size.unwrap_or(self.max_requests) as f64
    }

    /// Token bucket refill rate in tokens per second.
    pub fn effective_refill_rate(&self) -> f64 {
        self.refill_rate
            .unwrap_or(self.max_requests as f64 / self.window_seconds as f64)
    }

    /// Leaky bucket drain rate in requests per second.
    pub fn leak_rate(&self) -> f64 {
        self.max_requests as f64 / self.window_seconds as f64
    }

    /// Check the authoring-time invariants.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(TollgateError::invalid_rule("", "id must not be empty"));
        }
        if self.max_requests < 1 {
            return Err(TollgateError::invalid_rule(&self.id, "maxRequests must be at least 1"));
        }
        if self.window_seconds < 1 {
            return Err(TollgateError::invalid_rule(&self.id, "windowSeconds must be at least 1"));
        }
        if self.burst_size == Some(0) {
            return Err(TollgateError::invalid_rule(&self.id, "burstSize must be at least 1"));
        }
        if let Some(rate) = self.refill_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(TollgateError::invalid_rule(
                    &self.id,
                    "refillRate must be a positive number",
                ));
            }
        }
        if self.scope != Scope::Global && self.scope_value.as_deref().map_or(true, str::is_empty) {
            return Err(TollgateError::invalid_rule(
                &self.id,
                format!("scopeValue is required for {} scope", self.scope.as_str()),
            ));
        }
        Ok(())
    }

    /// Whether this rule governs the given request. Disabled rules never apply.
    pub fn applies_to(&self, ctx: &RequestContext) -> bool {
        if !self.enabled {
            return false;
        }

        let scope_matches = match self.scope {
            Scope::Global => true,
            Scope::Tenant => identity_matches(ctx.tenant_id.as_deref(), &self.scope_value),
            Scope::User => identity_matches(ctx.user_id.as_deref(), &self.scope_value),
            Scope::Ip => identity_matches(Some(ctx.ip_address.as_str()), &self.scope_value),
            Scope::Endpoint => self
                .scope_value
                .as_deref()
                .is_some_and(|prefix| ctx.endpoint.starts_with(prefix)),
        };

        scope_matches && self.endpoint_matches(ctx)
    }

    fn endpoint_matches(&self, ctx: &RequestContext) -> bool {
        self.endpoint
            .as_deref()
            .map_or(true, |prefix| ctx.endpoint.starts_with(prefix))
    }
}

fn identity_matches(actual: Option<&str>, expected: &Option<String>) -> bool {
    match (actual, expected.as_deref()) {
        (Some(actual), Some(expected)) => !actual.is_empty() && actual == expected,
        _ => false,
    }
}

/// Select the rules applying to `ctx`, highest priority first.
///
/// Equal priorities keep their input order.
pub fn match_rules<'a>(rules: &'a [RateLimitRule], ctx: &RequestContext) -> Vec<&'a RateLimitRule> {
    let mut matched: Vec<&RateLimitRule> = rules.iter().filter(|r| r.applies_to(ctx)).collect();
    matched.sort_by_key(|r| Reverse(r.priority));
    matched
}

fn parse_error(e: serde_yaml::Error) -> TollgateError {
    TollgateError::Config(format!("Failed to parse rate limit rules: {e}"))
}

/// On-disk rule file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
}

/// A validated, immutable set of rules with a lookup index.
///
/// Identity-scoped rules are indexed by (scope, value) so a request only
/// touches the rules that could apply to it; endpoint-scoped rules are
/// prefix-scanned. The result is identical to [`match_rules`] over the
/// same input.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Arc<RateLimitRule>>,
    global: Vec<usize>,
    by_identity: HashMap<(Scope, String), Vec<usize>>,
    by_endpoint: Vec<usize>,
}

impl RuleSet {
    /// Validate and index a list of rules.
    pub fn new(rules: Vec<RateLimitRule>) -> Result<Self> {
        let mut seen = HashSet::new();
        for rule in &rules {
            rule.validate()?;
            if !seen.insert(rule.id.as_str()) {
                return Err(TollgateError::invalid_rule(&rule.id, "duplicate rule id"));
            }
        }

        let mut set = RuleSet::default();
        for (idx, rule) in rules.into_iter().enumerate() {
            if rule.enabled {
                match (rule.scope, rule.scope_value.as_ref()) {
                    (Scope::Global, _) => set.global.push(idx),
                    (Scope::Endpoint, _) => set.by_endpoint.push(idx),
                    (scope, Some(value)) => set
                        .by_identity
                        .entry((scope, value.clone()))
                        .or_default()
                        .push(idx),
                    (_, None) => {}
                }
            }
            set.rules.push(Arc::new(rule));
        }

        debug!(
            rules = set.rules.len(),
            global = set.global.len(),
            identity_keys = set.by_identity.len(),
            endpoint = set.by_endpoint.len(),
            "Indexed rate limit rules"
        );
        Ok(set)
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    ///
    /// Accepts either a `rules:` document or a bare list of rules.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let document: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(parse_error)?;

        let rules = match document {
            serde_yaml::Value::Sequence(_) => {
                serde_yaml::from_value::<Vec<RateLimitRule>>(document).map_err(parse_error)?
            }
            serde_yaml::Value::Mapping(_) => {
                serde_yaml::from_value::<RuleFile>(document)
                    .map_err(parse_error)?
                    .rules
            }
            serde_yaml::Value::Null => Vec::new(),
            _ => {
                return Err(TollgateError::Config(
                    "rate limit rules must be a list or a `rules:` mapping".to_string(),
                ))
            }
        };
        Self::new(rules)
    }

    pub fn rules(&self) -> &[Arc<RateLimitRule>] {
        &self.rules
    }

    pub fn get(&self, id: &str) -> Option<&Arc<RateLimitRule>> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Select the rules applying to `ctx`, highest priority first.
    pub fn matching(&self, ctx: &RequestContext) -> Vec<Arc<RateLimitRule>> {
        let mut candidates: Vec<usize> = self.global.clone();

        let identities = [
            (Scope::Tenant, ctx.tenant_id.as_deref()),
            (Scope::User, ctx.user_id.as_deref()),
            (Scope::Ip, Some(ctx.ip_address.as_str())),
        ];
        for (scope, value) in identities {
            if let Some(value) = value {
                if let Some(indices) = self.by_identity.get(&(scope, value.to_string())) {
                    candidates.extend_from_slice(indices);
                }
            }
        }
        candidates.extend_from_slice(&self.by_endpoint);

        let mut matched: Vec<usize> = candidates
            .into_iter()
            .filter(|&idx| self.rules[idx].applies_to(ctx))
            .collect();
        matched.sort_by_key(|&idx| (Reverse(self.rules[idx].priority), idx));

        matched.into_iter().map(|idx| Arc::clone(&self.rules[idx])).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new("10.0.0.1", "/api/v1/search", "GET")
            .with_tenant("acme")
            .with_user("alice")
    }

    fn ids<R: std::ops::Deref<Target = RateLimitRule>>(rules: &[R]) -> Vec<String> {
        rules.iter().map(|r| r.id.clone()).collect()
    }

    fn sample_rules() -> Vec<RateLimitRule> {
        vec![
            RateLimitRule::new("global", Scope::Global, Algorithm::FixedWindow, 1000, 60),
            RateLimitRule::new("tenant", Scope::Tenant, Algorithm::TokenBucket, 100, 60)
                .with_scope_value("acme")
                .with_priority(10),
            RateLimitRule::new("other-tenant", Scope::Tenant, Algorithm::TokenBucket, 100, 60)
                .with_scope_value("globex")
                .with_priority(10),
            RateLimitRule::new("user", Scope::User, Algorithm::SlidingWindow, 10, 60)
                .with_scope_value("alice")
                .with_priority(20),
            RateLimitRule::new("ip", Scope::Ip, Algorithm::LeakyBucket, 5, 1)
                .with_scope_value("10.0.0.1"),
            RateLimitRule::new("search", Scope::Endpoint, Algorithm::FixedWindow, 50, 60)
                .with_scope_value("/api/v1/search")
                .with_priority(10),
        ]
    }

    #[test]
    fn test_parse_rules_document() {
        let yaml = r#"
rules:
  - id: free-tier
    name: Free tier
    priority: 10
    scope: TENANT
    scopeValue: acme
    algorithm: TOKEN_BUCKET
    maxRequests: 100
    windowSeconds: 60
    burstSize: 20
  - id: login
    name: Login throttle
    scope: IP
    scopeValue: 10.0.0.1
    endpoint: /auth/login
    algorithm: SLIDING_WINDOW
    maxRequests: 5
    windowSeconds: 300
    customMessage: Slow down
"#;
        let set = RuleSet::from_yaml(yaml).unwrap();
        assert_eq!(set.len(), 2);

        let free = set.get("free-tier").unwrap();
        assert_eq!(free.scope, Scope::Tenant);
        assert_eq!(free.algorithm, Algorithm::TokenBucket);
        assert_eq!(free.burst_size, Some(20));
        assert!(free.enabled);

        let login = set.get("login").unwrap();
        assert_eq!(login.endpoint.as_deref(), Some("/auth/login"));
        assert_eq!(login.custom_message.as_deref(), Some("Slow down"));
    }

    #[test]
    fn test_bundled_rules_file_is_valid() {
        let set = RuleSet::from_yaml(include_str!("../../config/rules.yaml")).unwrap();
        assert_eq!(set.len(), 4);

        let login = RequestContext::new("203.0.113.7", "/auth/login", "POST");
        let ids: Vec<String> = set.matching(&login).iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec!["login-per-ip", "global-cap"]);
    }

    #[test]
    fn test_bare_list_error_names_the_bad_field() {
        let yaml = r#"
- id: a
  name: A
  scope: GLOBAL
  algorithm: BOGUS
  maxRequests: 1
  windowSeconds: 1
"#;
        let message = RuleSet::from_yaml(yaml).unwrap_err().to_string();
        assert!(message.contains("BOGUS"), "{message}");
        assert!(!message.contains("RuleFile"), "{message}");
    }

    #[test]
    fn test_scalar_document_is_rejected() {
        assert!(matches!(RuleSet::from_yaml("42"), Err(TollgateError::Config(_))));
    }

    #[test]
    fn test_parse_bare_list() {
        let yaml = r#"
- id: everyone
  name: Everyone
  scope: GLOBAL
  algorithm: FIXED_WINDOW
  maxRequests: 10
  windowSeconds: 1
"#;
        let set = RuleSet::from_yaml(yaml).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_parse_rejects_invalid_rule() {
        let yaml = r#"
rules:
  - id: broken
    name: Broken
    scope: GLOBAL
    algorithm: FIXED_WINDOW
    maxRequests: 0
    windowSeconds: 60
"#;
        let err = RuleSet::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TollgateError::InvalidRule { ref id, .. } if id == "broken"));
    }

    #[test]
    fn test_validate() {
        let ok = RateLimitRule::new("r", Scope::Global, Algorithm::FixedWindow, 1, 1);
        assert!(ok.validate().is_ok());

        let zero_window = RateLimitRule::new("r", Scope::Global, Algorithm::FixedWindow, 1, 0);
        assert!(zero_window.validate().is_err());

        let missing_value = RateLimitRule::new("r", Scope::User, Algorithm::FixedWindow, 1, 1);
        assert!(missing_value.validate().is_err());

        let mut zero_burst = ok.clone();
        zero_burst.burst_size = Some(0);
        assert!(zero_burst.validate().is_err());

        let mut bad_refill = ok.clone();
        bad_refill.refill_rate = Some(f64::NAN);
        assert!(bad_refill.validate().is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let rules = vec![
            RateLimitRule::new("dup", Scope::Global, Algorithm::FixedWindow, 1, 1),
            RateLimitRule::new("dup", Scope::Global, Algorithm::FixedWindow, 1, 1),
        ];
        assert!(RuleSet::new(rules).is_err());
    }

    #[test]
    fn test_defaults_for_token_bucket() {
        let rule = RateLimitRule::new("r", Scope::Global, Algorithm::TokenBucket, 10, 20);
        assert_eq!(rule.effective_burst(), 10.0);
        assert_eq!(rule.effective_refill_rate(), 0.5);
        assert_eq!(rule.leak_rate(), 0.5);
    }

    #[test]
    fn test_scope_predicates() {
        let request = ctx();
        let rules = sample_rules();
        let matched = match_rules(&rules, &request);
        assert_eq!(ids(&matched), vec!["user", "tenant", "search", "global", "ip"]);
    }

    #[test]
    fn test_missing_identity_does_not_match() {
        let request = RequestContext::new("10.0.0.2", "/other", "GET");
        let rules = sample_rules();
        let matched = match_rules(&rules, &request);
        assert_eq!(ids(&matched), vec!["global"]);
    }

    #[test]
    fn test_endpoint_narrows_any_scope() {
        let rule = RateLimitRule::new("r", Scope::User, Algorithm::FixedWindow, 1, 1)
            .with_scope_value("alice")
            .with_endpoint("/api/v1/upload");
        assert!(!rule.applies_to(&ctx()));

        let mut upload = ctx();
        upload.endpoint = "/api/v1/upload/big".to_string();
        assert!(rule.applies_to(&upload));
    }

    #[test]
    fn test_disabled_rules_never_match() {
        let mut rule = RateLimitRule::new("r", Scope::Global, Algorithm::FixedWindow, 1, 1);
        rule.enabled = false;
        assert!(match_rules(&[rule], &ctx()).is_empty());
    }

    #[test]
    fn test_matching_is_idempotent() {
        let rules = sample_rules();
        let request = ctx();
        assert_eq!(ids(&match_rules(&rules, &request)), ids(&match_rules(&rules, &request)));

        let set = RuleSet::new(rules).unwrap();
        assert_eq!(ids(&set.matching(&request)), ids(&set.matching(&request)));
    }

    #[test]
    fn test_index_agrees_with_linear_scan() {
        let rules = sample_rules();
        let set = RuleSet::new(rules.clone()).unwrap();

        let requests = [
            ctx(),
            RequestContext::new("10.0.0.2", "/other", "GET"),
            RequestContext::new("10.0.0.1", "/api/v1/search?q=x", "GET").with_tenant("globex"),
            RequestContext::new("10.0.0.3", "/api", "POST").with_user("alice"),
        ];
        for request in &requests {
            assert_eq!(ids(&set.matching(request)), ids(&match_rules(&rules, request)));
        }
    }
}
