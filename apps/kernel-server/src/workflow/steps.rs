// [[AXON]]/apps/kernel-server/src/workflow/steps.rs
// Purpose: Individual step runners and the conditional predicate evaluator.
// Architecture: Domain Logic Layer
// Dependencies: reqwest, tokio, serde_json

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::KernelError;
use crate::resilience::BreakerError;

/// Provider-defined callable for script steps.
#[async_trait]
pub trait ScriptCallable: Send + Sync {
    async fn run(&self, params: Value) -> Result<Value, KernelError>;
}

pub struct ScriptRegistry {
    scripts: HashMap<String, Arc<dyn ScriptCallable>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        let mut registry = ScriptRegistry {
            scripts: HashMap::new(),
        };
        registry.register("noop", Arc::new(Noop));
        registry.register("context.merge", Arc::new(ContextMerge));
        registry
    }

    pub fn register(&mut self, name: &str, script: Arc<dyn ScriptCallable>) {
        self.scripts.insert(name.to_string(), script);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ScriptCallable>> {
        self.scripts.get(name).cloned()
    }
}

impl Default for ScriptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct Noop;

#[async_trait]
impl ScriptCallable for Noop {
    async fn run(&self, params: Value) -> Result<Value, KernelError> {
        Ok(params)
    }
}

/// Shallow-merges `params.patch` into `params.base`.
struct ContextMerge;

#[async_trait]
impl ScriptCallable for ContextMerge {
    async fn run(&self, params: Value) -> Result<Value, KernelError> {
        let mut base = params.get("base").cloned().unwrap_or(Value::Object(Default::default()));
        if let (Some(base_map), Some(patch)) = (
            base.as_object_mut(),
            params.get("patch").and_then(|p| p.as_object()),
        ) {
            for (k, v) in patch {
                base_map.insert(k.clone(), v.clone());
            }
        }
        Ok(base)
    }
}

/// Evaluate a conditional step's predicate over the accumulated execution
/// context. Config shape:
///   { "path": "build.status", "equals": "green" }   -> "true" | "false"
///   { "path": "build.status" }                       -> the string value itself
/// The returned token selects the branch from the step's `next` table.
pub fn evaluate_predicate(config: &Value, context: &Value) -> Result<String, KernelError> {
    let path = config
        .get("path")
        .and_then(|p| p.as_str())
        .ok_or_else(|| KernelError::InvalidInput("conditional step missing 'path'".into()))?;
    let actual = lookup_path(context, path);
    match config.get("equals") {
        Some(expected) => Ok(if actual.as_ref() == Some(expected) {
            "true".to_string()
        } else {
            "false".to_string()
        }),
        None => match actual {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Ok(other.to_string()),
            None => Ok("false".to_string()),
        },
    }
}

pub fn lookup_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

/// Set a value at a dot path, creating intermediate objects.
pub fn set_path(target: &mut Value, path: &str, new_value: Value) {
    let mut current = target;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        let Some(map) = current.as_object_mut() else {
            return;
        };
        if i == segments.len() - 1 {
            map.insert(segment.to_string(), new_value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
}

/// Issue the webhook step's HTTP request through the named circuit breaker.
pub async fn run_webhook(
    http: &reqwest::Client,
    breaker: &crate::resilience::CircuitBreaker,
    config: &Value,
    timeout: Duration,
) -> Result<Value, KernelError> {
    let url = config
        .get("url")
        .and_then(|u| u.as_str())
        .ok_or_else(|| KernelError::InvalidInput("webhook step missing 'url'".into()))?
        .to_string();
    let method: reqwest::Method = config
        .get("method")
        .and_then(|m| m.as_str())
        .unwrap_or("POST")
        .parse()
        .map_err(|_| KernelError::InvalidInput("webhook step has invalid method".into()))?;
    let body = config.get("body").cloned();

    let http = http.clone();
    let result = breaker
        .call(move || async move {
            let mut req = http.request(method, &url).timeout(timeout);
            if let Some(body) = body {
                req = req.json(&body);
            }
            let response = req.send().await?;
            let status = response.status();
            let body: Value = response.json().await.unwrap_or(Value::Null);
            Ok::<_, reqwest::Error>((status, body))
        })
        .await;

    match result {
        Ok((status, body)) if status.is_success() => Ok(serde_json::json!({
            "status": status.as_u16(),
            "body": body,
        })),
        Ok((status, _)) => Err(KernelError::Upstream(format!(
            "webhook returned {}",
            status
        ))),
        Err(BreakerError::Open(name)) => Err(KernelError::CircuitOpen(name)),
        Err(BreakerError::Inner(e)) => Err(KernelError::Upstream(format!("webhook: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn predicate_equals_yields_boolean_tokens() {
        let config = json!({"path": "build.status", "equals": "green"});
        let ctx = json!({"build": {"status": "green"}});
        assert_eq!(evaluate_predicate(&config, &ctx).unwrap(), "true");

        let ctx = json!({"build": {"status": "red"}});
        assert_eq!(evaluate_predicate(&config, &ctx).unwrap(), "false");
    }

    #[test]
    fn predicate_without_equals_yields_value_token() {
        let config = json!({"path": "env"});
        let ctx = json!({"env": "staging"});
        assert_eq!(evaluate_predicate(&config, &ctx).unwrap(), "staging");
    }

    #[test]
    fn predicate_missing_path_errors() {
        let err = evaluate_predicate(&json!({}), &json!({})).unwrap_err();
        assert_eq!(err.kind(), "invalid-input");
    }

    #[test]
    fn predicate_on_absent_value_is_false() {
        let config = json!({"path": "a.b.c"});
        assert_eq!(evaluate_predicate(&config, &json!({})).unwrap(), "false");
    }

    #[test]
    fn set_path_creates_intermediates() {
        let mut target = json!({});
        set_path(&mut target, "a.b.c", json!(7));
        assert_eq!(target, json!({"a": {"b": {"c": 7}}}));

        set_path(&mut target, "a.b.c", json!(8));
        assert_eq!(target["a"]["b"]["c"], 8);
    }

    #[tokio::test]
    async fn script_registry_resolves_builtins() {
        let registry = ScriptRegistry::new();
        let noop = registry.get("noop").unwrap();
        assert_eq!(noop.run(json!({"x": 1})).await.unwrap(), json!({"x": 1}));

        let merge = registry.get("context.merge").unwrap();
        let out = merge
            .run(json!({"base": {"a": 1}, "patch": {"b": 2}}))
            .await
            .unwrap();
        assert_eq!(out, json!({"a": 1, "b": 2}));

        assert!(registry.get("nope").is_none());
    }
}
