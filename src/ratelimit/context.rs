//! Per-request identity handed to the engine by the transport layer.

use serde::{Deserialize, Serialize};

/// Identity of one incoming request. Never persisted by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub ip_address: String,
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub user_agent: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl RequestContext {
    pub fn new(
        ip_address: impl Into<String>,
        endpoint: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: None,
            user_id: None,
            ip_address: ip_address.into(),
            endpoint: endpoint.into(),
            method: method.into(),
            user_agent: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}
