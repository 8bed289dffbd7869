//! Request-scoped audit context
//!
//! A `QueryContext` is established once per inbound request with
//! [`with_context`] and is visible to everything that future awaits,
//! without being threaded through intermediate calls. The context lives in
//! a tokio task-local, so two concurrently running requests never see each
//! other's value. Tasks spawned from inside a request do not inherit it;
//! wrap them in `with_context` again when they write through a tenant client.

use crate::types::AuditMetadata;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;

tokio::task_local! {
    static QUERY_CONTEXT: QueryContext;
}

/// Who is acting, for which tenant, from where
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryContext {
    pub tenant_id: String,
    pub actor_id: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl QueryContext {
    /// Create a context with a generated request id
    pub fn new(tenant_id: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            actor_id: actor_id.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Build a context from a message-pattern payload
    ///
    /// Tenant comes from `bu_code` then `tenant_id`; missing values fall
    /// back to `unknown` / `anonymous` and a fresh request id.
    pub fn from_rpc_payload(payload: &serde_json::Value) -> Self {
        let field = |key: &str| {
            payload
                .get(key)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Self {
            tenant_id: field("bu_code")
                .or_else(|| field("tenant_id"))
                .unwrap_or_else(|| "unknown".to_string()),
            actor_id: field("user_id").unwrap_or_else(|| "anonymous".to_string()),
            request_id: field("request_id").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            ip_address: field("ip_address"),
            user_agent: field("user_agent"),
        }
    }

    /// Build a context from HTTP request headers (lower-case names)
    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        let header = |key: &str| headers.get(key).filter(|s| !s.is_empty()).cloned();

        Self {
            tenant_id: header("x-tenant-id").unwrap_or_else(|| "unknown".to_string()),
            actor_id: header("x-user-id").unwrap_or_else(|| "anonymous".to_string()),
            request_id: header("x-request-id").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            ip_address: header("x-forwarded-for")
                .map(|v| v.split(',').next().unwrap_or_default().trim().to_string()),
            user_agent: header("user-agent"),
        }
    }

    /// Request metadata recorded alongside audit events
    pub fn metadata(&self) -> AuditMetadata {
        AuditMetadata {
            request_id: Some(self.request_id.clone()).filter(|s| !s.is_empty()),
            ip_address: self.ip_address.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

/// Run `fut` with `context` as the ambient query context
pub async fn with_context<F>(context: QueryContext, fut: F) -> F::Output
where
    F: Future,
{
    QUERY_CONTEXT.scope(context, fut).await
}

/// The context of the current request, if one was established
pub fn current_context() -> Option<QueryContext> {
    QUERY_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}
