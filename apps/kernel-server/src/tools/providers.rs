// [[AXON]]/apps/kernel-server/src/tools/providers.rs
// Purpose: Built-in tool providers. Each embeds its developer-workflow allow-list.
// Architecture: Tool Layer
// Dependencies: reqwest, serde_json

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use std::env;
use std::sync::Arc;

use super::{ToolContext, ToolError, ToolOperation, ToolProvider};
use crate::resilience::{BreakerError, BreakerRegistry, CircuitBreaker};

/// How one operation maps onto the upstream REST surface.
type Route = fn(&Value) -> Result<(Method, String, Option<Value>), ToolError>;

struct OperationRoute {
    op: ToolOperation,
    route: Route,
}

fn arg_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidArgs(format!("missing string argument '{}'", key)))
}

fn object_schema(required: &[&str]) -> Value {
    json!({
        "type": "object",
        "required": required,
        "properties": required.iter().map(|r| (r.to_string(), json!({"type": "string"})))
            .collect::<serde_json::Map<String, Value>>(),
    })
}

fn result_schema() -> Value {
    json!({"type": "object"})
}

/// A REST-backed provider: catalog + route table + one circuit breaker per
/// upstream. The token comes from the environment; a missing token makes
/// every call fail with a typed auth error rather than hiding the provider.
pub struct RestProvider {
    name: &'static str,
    base_url: String,
    token: Option<String>,
    auth_header: &'static str,
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    routes: Vec<OperationRoute>,
    ops: Vec<ToolOperation>,
}

impl RestProvider {
    fn new(
        name: &'static str,
        default_base: &str,
        auth_header: &'static str,
        client: reqwest::Client,
        breakers: &BreakerRegistry,
        routes: Vec<OperationRoute>,
    ) -> Self {
        let env_prefix = name.to_ascii_uppercase();
        let base_url = env::var(format!("AXON_TOOL_{}_URL", env_prefix))
            .unwrap_or_else(|_| default_base.to_string());
        let token = env::var(format!("AXON_TOOL_{}_TOKEN", env_prefix)).ok();
        let ops = routes.iter().map(|r| r.op.clone()).collect();
        RestProvider {
            name,
            base_url,
            token,
            auth_header,
            client,
            breaker: breakers.get(name),
            routes,
            ops,
        }
    }
}

#[async_trait]
impl ToolProvider for RestProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn operations(&self) -> &[ToolOperation] {
        &self.ops
    }

    async fn invoke(
        &self,
        _ctx: &ToolContext,
        operation: &str,
        args: Value,
    ) -> Result<Value, ToolError> {
        let route = self
            .routes
            .iter()
            .find(|r| r.op.name == operation)
            .ok_or_else(|| ToolError::NotFound(operation.to_string()))?;
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| ToolError::Auth(format!("no credential configured for {}", self.name)))?;

        let (method, path, body) = (route.route)(&args)?;
        let url = format!("{}{}", self.base_url, path);

        let client = self.client.clone();
        let auth_header = self.auth_header;
        let token = token.clone();
        let response = self
            .breaker
            .call(move || async move {
                let mut req = client.request(method, &url).header(auth_header, token);
                if let Some(body) = body {
                    req = req.json(&body);
                }
                req.send().await
            })
            .await;

        let response = match response {
            Ok(r) => r,
            Err(BreakerError::Open(name)) => {
                return Err(ToolError::Upstream(format!("circuit open: {}", name)))
            }
            Err(BreakerError::Inner(e)) => return Err(ToolError::Upstream(e.to_string())),
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ToolError::Auth(format!("{} returned {}", self.name, status)));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ToolError::RateLimited);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ToolError::NotFound(format!("{} resource", self.name)));
        }
        if !status.is_success() {
            return Err(ToolError::Upstream(format!(
                "{} returned {}",
                self.name, status
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| ToolError::Upstream(format!("decode {} response: {}", self.name, e)))
    }
}

macro_rules! op {
    ($name:literal, $desc:literal, [$($req:literal),*], $route:expr) => {
        OperationRoute {
            op: ToolOperation {
                name: $name,
                description: $desc,
                input_schema: || object_schema(&[$($req),*]),
                output_schema: result_schema,
            },
            route: $route,
        }
    };
}

fn github(client: reqwest::Client, breakers: &BreakerRegistry) -> Arc<dyn ToolProvider> {
    // Developer-workflow subset only: repo browsing and pull-request flow.
    // Admin and org-management endpoints are deliberately absent.
    let routes = vec![
        op!("list_repos", "List repositories for the authenticated account", [], |_args| {
            Ok((Method::GET, "/user/repos".to_string(), None))
        }),
        op!("get_repo", "Fetch one repository", ["owner", "repo"], |args| {
            Ok((
                Method::GET,
                format!("/repos/{}/{}", arg_str(args, "owner")?, arg_str(args, "repo")?),
                None,
            ))
        }),
        op!("list_pull_requests", "List open pull requests", ["owner", "repo"], |args| {
            Ok((
                Method::GET,
                format!(
                    "/repos/{}/{}/pulls",
                    arg_str(args, "owner")?,
                    arg_str(args, "repo")?
                ),
                None,
            ))
        }),
        op!("create_issue", "Open an issue", ["owner", "repo", "title"], |args| {
            Ok((
                Method::POST,
                format!(
                    "/repos/{}/{}/issues",
                    arg_str(args, "owner")?,
                    arg_str(args, "repo")?
                ),
                Some(json!({
                    "title": arg_str(args, "title")?,
                    "body": args.get("body").and_then(|v| v.as_str()).unwrap_or(""),
                })),
            ))
        }),
    ];
    Arc::new(RestProvider::new(
        "github",
        "https://api.github.com",
        "Authorization",
        client,
        breakers,
        routes,
    ))
}

fn gitlab(client: reqwest::Client, breakers: &BreakerRegistry) -> Arc<dyn ToolProvider> {
    let routes = vec![
        op!("list_projects", "List projects visible to the token", [], |_args| {
            Ok((Method::GET, "/api/v4/projects?membership=true".to_string(), None))
        }),
        op!("list_merge_requests", "List open merge requests", ["project_id"], |args| {
            Ok((
                Method::GET,
                format!(
                    "/api/v4/projects/{}/merge_requests?state=opened",
                    arg_str(args, "project_id")?
                ),
                None,
            ))
        }),
        op!("trigger_pipeline", "Trigger a pipeline on a ref", ["project_id", "ref"], |args| {
            Ok((
                Method::POST,
                format!("/api/v4/projects/{}/pipeline", arg_str(args, "project_id")?),
                Some(json!({"ref": arg_str(args, "ref")?})),
            ))
        }),
    ];
    Arc::new(RestProvider::new(
        "gitlab",
        "https://gitlab.com",
        "PRIVATE-TOKEN",
        client,
        breakers,
        routes,
    ))
}

fn jira(client: reqwest::Client, breakers: &BreakerRegistry) -> Arc<dyn ToolProvider> {
    let routes = vec![
        op!("search_issues", "Search issues with JQL", ["jql"], |args| {
            Ok((
                Method::POST,
                "/rest/api/3/search".to_string(),
                Some(json!({"jql": arg_str(args, "jql")?, "maxResults": 50})),
            ))
        }),
        op!("get_issue", "Fetch one issue", ["key"], |args| {
            Ok((
                Method::GET,
                format!("/rest/api/3/issue/{}", arg_str(args, "key")?),
                None,
            ))
        }),
        op!("add_comment", "Comment on an issue", ["key", "body"], |args| {
            Ok((
                Method::POST,
                format!("/rest/api/3/issue/{}/comment", arg_str(args, "key")?),
                Some(json!({"body": arg_str(args, "body")?})),
            ))
        }),
        op!("transition_issue", "Move an issue through its workflow", ["key", "transition_id"], |args| {
            Ok((
                Method::POST,
                format!("/rest/api/3/issue/{}/transitions", arg_str(args, "key")?),
                Some(json!({"transition": {"id": arg_str(args, "transition_id")?}})),
            ))
        }),
    ];
    Arc::new(RestProvider::new(
        "jira",
        "https://jira.example.com",
        "Authorization",
        client,
        breakers,
        routes,
    ))
}

fn confluence(client: reqwest::Client, breakers: &BreakerRegistry) -> Arc<dyn ToolProvider> {
    let routes = vec![
        op!("search_pages", "Full-text page search", ["query"], |args| {
            Ok((
                Method::GET,
                format!(
                    "/wiki/rest/api/content/search?cql=text~\"{}\"",
                    arg_str(args, "query")?
                ),
                None,
            ))
        }),
        op!("get_page", "Fetch page content", ["page_id"], |args| {
            Ok((
                Method::GET,
                format!(
                    "/wiki/rest/api/content/{}?expand=body.storage",
                    arg_str(args, "page_id")?
                ),
                None,
            ))
        }),
    ];
    Arc::new(RestProvider::new(
        "confluence",
        "https://confluence.example.com",
        "Authorization",
        client,
        breakers,
        routes,
    ))
}

fn artifactory(client: reqwest::Client, breakers: &BreakerRegistry) -> Arc<dyn ToolProvider> {
    let routes = vec![
        op!("search_artifacts", "Search artifacts by name", ["name"], |args| {
            Ok((
                Method::GET,
                format!("/artifactory/api/search/artifact?name={}", arg_str(args, "name")?),
                None,
            ))
        }),
        op!("get_repositories", "List repositories", [], |_args| {
            Ok((Method::GET, "/artifactory/api/repositories".to_string(), None))
        }),
        op!("get_artifact_info", "Artifact metadata", ["repo", "path"], |args| {
            Ok((
                Method::GET,
                format!(
                    "/artifactory/api/storage/{}/{}",
                    arg_str(args, "repo")?,
                    arg_str(args, "path")?
                ),
                None,
            ))
        }),
    ];
    Arc::new(RestProvider::new(
        "artifactory",
        "https://artifactory.example.com",
        "Authorization",
        client,
        breakers,
        routes,
    ))
}

fn xray(client: reqwest::Client, breakers: &BreakerRegistry) -> Arc<dyn ToolProvider> {
    let routes = vec![
        op!("scan_status", "Status of a component scan", ["component"], |args| {
            Ok((
                Method::GET,
                format!("/api/v1/scan/status/{}", arg_str(args, "component")?),
                None,
            ))
        }),
        op!("component_vulnerabilities", "Known vulnerabilities for a component", ["component"], |args| {
            Ok((
                Method::POST,
                "/api/v1/summary/component".to_string(),
                Some(json!({"component_details": [{"component_id": arg_str(args, "component")?}]})),
            ))
        }),
    ];
    Arc::new(RestProvider::new(
        "xray",
        "https://xray.example.com",
        "Authorization",
        client,
        breakers,
        routes,
    ))
}

fn harness(client: reqwest::Client, breakers: &BreakerRegistry) -> Arc<dyn ToolProvider> {
    let routes = vec![
        op!("list_pipelines", "List pipelines in a project", ["org", "project"], |args| {
            Ok((
                Method::GET,
                format!(
                    "/pipeline/api/pipelines/list?orgIdentifier={}&projectIdentifier={}",
                    arg_str(args, "org")?,
                    arg_str(args, "project")?
                ),
                None,
            ))
        }),
        op!("execute_pipeline", "Start a pipeline execution", ["org", "project", "pipeline"], |args| {
            Ok((
                Method::POST,
                format!(
                    "/pipeline/api/pipeline/execute/{}?orgIdentifier={}&projectIdentifier={}",
                    arg_str(args, "pipeline")?,
                    arg_str(args, "org")?,
                    arg_str(args, "project")?
                ),
                Some(json!({})),
            ))
        }),
    ];
    Arc::new(RestProvider::new(
        "harness",
        "https://app.harness.io",
        "x-api-key",
        client,
        breakers,
        routes,
    ))
}

fn nexus(client: reqwest::Client, breakers: &BreakerRegistry) -> Arc<dyn ToolProvider> {
    let routes = vec![
        op!("search_components", "Search components", ["repository", "name"], |args| {
            Ok((
                Method::GET,
                format!(
                    "/service/rest/v1/search?repository={}&name={}",
                    arg_str(args, "repository")?,
                    arg_str(args, "name")?
                ),
                None,
            ))
        }),
        op!("list_repositories", "List hosted repositories", [], |_args| {
            Ok((Method::GET, "/service/rest/v1/repositories".to_string(), None))
        }),
    ];
    Arc::new(RestProvider::new(
        "nexus",
        "https://nexus.example.com",
        "Authorization",
        client,
        breakers,
        routes,
    ))
}

pub fn builtin_providers(
    client: reqwest::Client,
    breakers: &BreakerRegistry,
) -> Vec<Arc<dyn ToolProvider>> {
    vec![
        github(client.clone(), breakers),
        gitlab(client.clone(), breakers),
        jira(client.clone(), breakers),
        confluence(client.clone(), breakers),
        artifactory(client.clone(), breakers),
        xray(client.clone(), breakers),
        harness(client.clone(), breakers),
        nexus(client, breakers),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;

    fn providers() -> Vec<Arc<dyn ToolProvider>> {
        let breakers = BreakerRegistry::new(BreakerConfig::default());
        builtin_providers(reqwest::Client::new(), &breakers)
    }

    #[test]
    fn every_provider_has_a_nonempty_allow_list() {
        for provider in providers() {
            assert!(
                !provider.operations().is_empty(),
                "{} has no operations",
                provider.name()
            );
        }
    }

    #[test]
    fn github_allow_list_is_the_developer_subset() {
        let providers = providers();
        let github = providers.iter().find(|p| p.name() == "github").unwrap();
        let names: Vec<&str> = github.operations().iter().map(|o| o.name).collect();
        assert!(names.contains(&"list_pull_requests"));
        // No admin/org surface in the compiled-in catalog.
        assert!(!names.iter().any(|n| n.contains("admin") || n.contains("org")));
    }

    #[test]
    fn schemas_declare_required_arguments() {
        let providers = providers();
        let jira = providers.iter().find(|p| p.name() == "jira").unwrap();
        let op = jira.operations().iter().find(|o| o.name == "get_issue").unwrap();
        let schema = (op.input_schema)();
        assert_eq!(schema["required"][0], "key");
    }

    #[tokio::test]
    async fn missing_credential_is_a_typed_auth_error() {
        // None of the AXON_TOOL_*_TOKEN vars are set in the test environment.
        let providers = providers();
        let nexus = providers.iter().find(|p| p.name() == "nexus").unwrap();
        let ctx = ToolContext {
            tenant_id: uuid::Uuid::new_v4(),
            agent_id: "a1".to_string(),
        };
        let err = nexus
            .invoke(&ctx, "list_repositories", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Auth(_)));
    }
}
