// [[AXON]]/apps/kernel-server/src/tools/mod.rs
// Purpose: Tool registry. Providers contribute compiled-in operation catalogs.
// Architecture: Tool Layer
// Dependencies: async-trait, serde_json

pub mod providers;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::error::KernelError;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("authentication with upstream failed: {0}")]
    Auth(String),
    #[error("tool or operation not found: {0}")]
    NotFound(String),
    #[error("upstream call failed: {0}")]
    Upstream(String),
    #[error("upstream rate limited")]
    RateLimited,
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("internal tool error: {0}")]
    Internal(String),
}

impl From<ToolError> for KernelError {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::Auth(m) => KernelError::Unauthorized(m),
            ToolError::NotFound(m) => KernelError::NotFound(m),
            ToolError::Upstream(m) => KernelError::Upstream(m),
            ToolError::RateLimited => KernelError::RateLimited { retry_after_secs: 30 },
            ToolError::InvalidArgs(m) => KernelError::InvalidInput(m),
            ToolError::Internal(m) => KernelError::Internal(m),
        }
    }
}

/// One operation a provider exposes. Catalogs are compiled in: an operation
/// outside the provider's allow-list simply doesn't exist here, so there is
/// no runtime filtering layer to bypass.
#[derive(Debug, Clone)]
pub struct ToolOperation {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: fn() -> Value,
    pub output_schema: fn() -> Value,
}

impl ToolOperation {
    pub fn descriptor(&self, provider: &str) -> Value {
        serde_json::json!({
            "name": format!("{}.{}", provider, self.name),
            "description": self.description,
            "input_schema": (self.input_schema)(),
            "output_schema": (self.output_schema)(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ToolContext {
    pub tenant_id: Uuid,
    pub agent_id: String,
}

#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn operations(&self) -> &[ToolOperation];
    async fn invoke(&self, ctx: &ToolContext, operation: &str, args: Value)
        -> Result<Value, ToolError>;
}

/// Tenant-scoped lookup over all registered providers. Tool names on the
/// wire are `provider.operation`.
pub struct ToolRegistry {
    providers: HashMap<&'static str, Arc<dyn ToolProvider>>,
    /// tenant id -> enabled provider names; an absent tenant gets the
    /// default set (all providers).
    tenant_enablement: dashmap::DashMap<Uuid, Vec<String>>,
}

impl ToolRegistry {
    pub fn new(providers: Vec<Arc<dyn ToolProvider>>) -> Self {
        let mut map: HashMap<&'static str, Arc<dyn ToolProvider>> = HashMap::new();
        for p in providers {
            map.insert(p.name(), p);
        }
        ToolRegistry {
            providers: map,
            tenant_enablement: dashmap::DashMap::new(),
        }
    }

    pub fn set_tenant_enablement(&self, tenant_id: Uuid, providers: Vec<String>) {
        self.tenant_enablement.insert(tenant_id, providers);
    }

    fn enabled_for(&self, tenant_id: Uuid, provider: &str) -> bool {
        match self.tenant_enablement.get(&tenant_id) {
            Some(list) => list.iter().any(|p| p == provider),
            None => true,
        }
    }

    /// Catalog visible to one tenant.
    pub fn list(&self, tenant_id: Uuid) -> Vec<Value> {
        let mut out = Vec::new();
        let mut names: Vec<&&'static str> = self.providers.keys().collect();
        names.sort();
        for name in names {
            if !self.enabled_for(tenant_id, name) {
                continue;
            }
            if let Some(provider) = self.providers.get(*name) {
                for op in provider.operations() {
                    out.push(op.descriptor(name));
                }
            }
        }
        out
    }

    pub async fn call(
        &self,
        ctx: &ToolContext,
        tool: &str,
        args: Value,
    ) -> Result<Value, ToolError> {
        let (provider_name, operation) = tool
            .split_once('.')
            .ok_or_else(|| ToolError::InvalidArgs(format!("malformed tool name '{}'", tool)))?;
        let provider = self
            .providers
            .get(provider_name)
            .ok_or_else(|| ToolError::NotFound(format!("provider '{}'", provider_name)))?;
        if !self.enabled_for(ctx.tenant_id, provider_name) {
            return Err(ToolError::NotFound(format!(
                "provider '{}' not enabled for tenant",
                provider_name
            )));
        }
        if !provider.operations().iter().any(|op| op.name == operation) {
            return Err(ToolError::NotFound(format!(
                "operation '{}' on provider '{}'",
                operation, provider_name
            )));
        }
        let started = std::time::Instant::now();
        let result = provider.invoke(ctx, operation, args).await;
        metrics::histogram!(
            "tool_call_duration_seconds",
            "provider" => provider_name.to_string(),
            "status" => if result.is_ok() { "ok" } else { "error" }
        )
        .record(started.elapsed().as_secs_f64());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoProvider;

    fn empty_schema() -> Value {
        serde_json::json!({"type": "object"})
    }

    #[async_trait]
    impl ToolProvider for EchoProvider {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn operations(&self) -> &[ToolOperation] {
            const OPS: &[ToolOperation] = &[ToolOperation {
                name: "say",
                description: "echo the arguments back",
                input_schema: empty_schema,
                output_schema: empty_schema,
            }];
            OPS
        }

        async fn invoke(
            &self,
            _ctx: &ToolContext,
            operation: &str,
            args: Value,
        ) -> Result<Value, ToolError> {
            match operation {
                "say" => Ok(args),
                other => Err(ToolError::NotFound(other.to_string())),
            }
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            tenant_id: Uuid::new_v4(),
            agent_id: "a1".to_string(),
        }
    }

    #[tokio::test]
    async fn call_routes_to_provider_operation() {
        let registry = ToolRegistry::new(vec![Arc::new(EchoProvider)]);
        let out = registry
            .call(&ctx(), "echo.say", serde_json::json!({"hi": true}))
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!({"hi": true}));
    }

    #[tokio::test]
    async fn unknown_operation_is_not_found() {
        let registry = ToolRegistry::new(vec![Arc::new(EchoProvider)]);
        let err = registry
            .call(&ctx(), "echo.shout", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn disabled_provider_is_invisible_and_uncallable() {
        let registry = ToolRegistry::new(vec![Arc::new(EchoProvider)]);
        let tenant = Uuid::new_v4();
        registry.set_tenant_enablement(tenant, vec![]);

        assert!(registry.list(tenant).is_empty());
        let c = ToolContext {
            tenant_id: tenant,
            agent_id: "a1".to_string(),
        };
        let err = registry
            .call(&c, "echo.say", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn default_tenant_sees_catalog() {
        let registry = ToolRegistry::new(vec![Arc::new(EchoProvider)]);
        let listed = registry.list(Uuid::new_v4());
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["name"], "echo.say");
    }
}
