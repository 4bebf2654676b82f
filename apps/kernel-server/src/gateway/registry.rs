// [[AXON]]/apps/kernel-server/src/gateway/registry.rs
// Purpose: Method table: name -> (input schema, auth scope, handler).
// Architecture: Gateway Layer
// Dependencies: async-trait, serde_json

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::protocol::methods;

pub struct HandlerCtx {
    pub kernel: Arc<Kernel>,
    pub session_id: Uuid,
    pub principal: Principal,
}

#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(&self, ctx: &HandlerCtx, params: Value) -> KernelResult<Value>;
}

pub struct MethodSpec {
    /// Scope the principal must hold; "agent" is the base scope every
    /// authenticated client carries.
    pub scope: &'static str,
    /// Whether the method may only run once the session is Ready
    /// (initialize/initialized handshake completed).
    pub requires_ready: bool,
    pub input_schema: fn() -> Value,
    pub handler: Arc<dyn MethodHandler>,
}

pub struct HandlerRegistry {
    methods: HashMap<&'static str, MethodSpec>,
}

fn any_object_schema() -> Value {
    json!({"type": "object"})
}

impl HandlerRegistry {
    pub fn builtin() -> Self {
        use super::handlers as h;

        let mut methods: HashMap<&'static str, MethodSpec> = HashMap::new();
        let mut add = |name: &'static str,
                       scope: &'static str,
                       requires_ready: bool,
                       input_schema: fn() -> Value,
                       handler: Arc<dyn MethodHandler>| {
            methods.insert(
                name,
                MethodSpec {
                    scope,
                    requires_ready,
                    input_schema,
                    handler,
                },
            );
        };

        add(methods::INITIALIZE, "agent", false, any_object_schema, Arc::new(h::Initialize));
        add(methods::PING, "agent", false, any_object_schema, Arc::new(h::Ping));
        add(methods::SHUTDOWN, "agent", false, any_object_schema, Arc::new(h::Shutdown));

        add(methods::TOOLS_LIST, "agent", true, any_object_schema, Arc::new(h::ToolsList));
        add(methods::TOOLS_CALL, "agent", true, h::tools_call_schema, Arc::new(h::ToolsCall));
        add(methods::RESOURCES_LIST, "agent", true, any_object_schema, Arc::new(h::ResourcesList));
        add(methods::RESOURCES_READ, "agent", true, h::resources_read_schema, Arc::new(h::ResourcesRead));
        add(
            methods::RESOURCES_SUBSCRIBE,
            "agent",
            true,
            h::resources_subscribe_schema,
            Arc::new(h::ResourcesSubscribe),
        );
        add(methods::PROMPTS_LIST, "agent", true, any_object_schema, Arc::new(h::PromptsList));

        add(methods::TASK_CREATE, "agent", true, h::task_create_schema, Arc::new(h::TaskCreate));
        add(methods::TASK_STATUS, "agent", true, h::task_id_schema, Arc::new(h::TaskStatusQuery));
        add(methods::TASK_CANCEL, "agent", true, h::task_id_schema, Arc::new(h::TaskCancel));
        add(methods::TASK_LIST, "agent", true, any_object_schema, Arc::new(h::TaskList));

        add(
            methods::WORKFLOW_EXECUTE,
            "agent",
            true,
            h::workflow_execute_schema,
            Arc::new(h::WorkflowExecute),
        );
        add(methods::WORKFLOW_LIST, "agent", true, any_object_schema, Arc::new(h::WorkflowList));

        add(methods::CONTEXT_UPDATE, "agent", true, h::context_update_schema, Arc::new(h::ContextUpdate));
        add(methods::CONTEXT_GET, "agent", true, h::context_get_schema, Arc::new(h::ContextGet));
        add(methods::SEARCH_SEMANTIC, "agent", true, h::search_schema, Arc::new(h::SearchSemantic));

        HandlerRegistry { methods }
    }

    pub fn get(&self, method: &str) -> Option<&MethodSpec> {
        self.methods.get(method)
    }

    pub fn method_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.methods.keys().copied().collect();
        names.sort();
        names
    }

    /// Full dispatch: scope check, then the handler. Input validation
    /// happens inside handlers via typed parameter structs.
    pub async fn dispatch(
        &self,
        ctx: &HandlerCtx,
        method: &str,
        params: Value,
    ) -> KernelResult<Value> {
        let spec = self
            .get(method)
            .ok_or_else(|| KernelError::NotFound(format!("method '{}'", method)))?;
        if !ctx.principal.has_scope(spec.scope) {
            return Err(KernelError::Forbidden(format!(
                "method '{}' requires scope '{}'",
                method, spec.scope
            )));
        }
        spec.handler.handle(ctx, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_covers_the_method_table() {
        let registry = HandlerRegistry::builtin();
        for method in [
            methods::INITIALIZE,
            methods::PING,
            methods::SHUTDOWN,
            methods::TOOLS_LIST,
            methods::TOOLS_CALL,
            methods::RESOURCES_LIST,
            methods::RESOURCES_READ,
            methods::RESOURCES_SUBSCRIBE,
            methods::PROMPTS_LIST,
            methods::TASK_CREATE,
            methods::TASK_STATUS,
            methods::TASK_CANCEL,
            methods::TASK_LIST,
            methods::WORKFLOW_EXECUTE,
            methods::WORKFLOW_LIST,
            methods::CONTEXT_UPDATE,
            methods::CONTEXT_GET,
            methods::SEARCH_SEMANTIC,
        ] {
            assert!(registry.get(method).is_some(), "missing {}", method);
        }
    }

    #[test]
    fn control_methods_run_before_ready() {
        let registry = HandlerRegistry::builtin();
        assert!(!registry.get(methods::INITIALIZE).unwrap().requires_ready);
        assert!(!registry.get(methods::PING).unwrap().requires_ready);
        assert!(registry.get(methods::TOOLS_CALL).unwrap().requires_ready);
        assert!(registry.get(methods::TASK_CREATE).unwrap().requires_ready);
    }

    #[test]
    fn schemas_are_objects() {
        let registry = HandlerRegistry::builtin();
        for name in registry.method_names() {
            let schema = (registry.get(name).unwrap().input_schema)();
            assert_eq!(schema["type"], "object", "schema for {}", name);
        }
    }
}
