// [[AXON]]/apps/kernel-server/src/auth.rs
// Purpose: Bearer-token authentication and client-mode detection.
// Architecture: Security Layer
// Dependencies: jsonwebtoken, axum, sha2

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::{AUTHORIZATION, USER_AGENT};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::KernelError;
use crate::models::SessionMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Agent id.
    pub sub: String,
    pub tenant_id: Uuid,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub exp: i64,
}

/// The authenticated identity attached to every request context. The
/// gateway injects the tenant id from here, never from client-supplied
/// parameters.
#[derive(Debug, Clone)]
pub struct Principal {
    pub agent_id: String,
    pub tenant_id: Uuid,
    pub scopes: Vec<String>,
}

impl Principal {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == "admin" || s == scope)
    }
}

pub struct Authenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    pub fn new(jwt_secret: &str) -> Self {
        Authenticator {
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify_bearer(&self, header_value: &str) -> Result<Principal, KernelError> {
        let token = header_value
            .strip_prefix("Bearer ")
            .ok_or_else(|| KernelError::Unauthorized("malformed authorization header".into()))?;
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| KernelError::Unauthorized(format!("invalid token: {}", e)))?;

        let agent_id = data.claims.sub;
        // Agent ids feed into keys and log lines; keep them to a safe alphabet.
        if agent_id.is_empty()
            || !agent_id
                .chars()
                .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            tracing::warn!("rejected token with unsafe agent id: {}", agent_id);
            return Err(KernelError::Unauthorized("invalid agent id".into()));
        }

        Ok(Principal {
            agent_id,
            tenant_id: data.claims.tenant_id,
            scopes: data.claims.scopes,
        })
    }

    pub fn authenticate_headers(&self, headers: &HeaderMap) -> Result<Principal, KernelError> {
        let value = headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| KernelError::Unauthorized("missing authorization header".into()))?;
        self.verify_bearer(value)
    }
}

/// Detect the client mode from the handshake headers. Explicit headers win
/// over user-agent sniffing; the fallback is `standard`.
pub fn detect_mode(headers: &HeaderMap) -> SessionMode {
    if headers.contains_key("x-claude-code-version") {
        return SessionMode::ClaudeCode;
    }
    if headers.contains_key("x-ide-name") {
        return SessionMode::Ide;
    }
    if let Some(agent_type) = headers.get("x-agent-type").and_then(|h| h.to_str().ok()) {
        match agent_type {
            "ide" => return SessionMode::Ide,
            "claude-code" => return SessionMode::ClaudeCode,
            _ => return SessionMode::Agent,
        }
    }
    if headers.contains_key("x-agent-id") {
        return SessionMode::Agent;
    }

    let ua = headers
        .get(USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    if ua.contains("claude-code") {
        SessionMode::ClaudeCode
    } else if ua.contains("vscode") || ua.contains("jetbrains") || ua.contains("intellij") {
        SessionMode::Ide
    } else if ua.contains("agent") {
        SessionMode::Agent
    } else {
        SessionMode::Standard
    }
}

pub fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extractor for the admin surface: authenticated principal from the
/// Authorization header, with an optional X-Tenant-Id override for admins.
pub struct AdminPrincipal(pub Principal);

#[async_trait]
impl<S> FromRequestParts<S> for AdminPrincipal
where
    S: Send + Sync,
    Arc<Authenticator>: axum::extract::FromRef<S>,
{
    type Rejection = KernelError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let authenticator: Arc<Authenticator> = axum::extract::FromRef::from_ref(state);
        let mut principal = authenticator.authenticate_headers(&parts.headers)?;

        if let Some(tenant) = parts
            .headers
            .get("x-tenant-id")
            .and_then(|h| h.to_str().ok())
        {
            let tenant: Uuid = tenant
                .parse()
                .map_err(|_| KernelError::InvalidInput("malformed X-Tenant-Id".into()))?;
            if tenant != principal.tenant_id {
                if !principal.has_scope("admin") {
                    return Err(KernelError::Forbidden(
                        "cross-tenant access requires admin scope".into(),
                    ));
                }
                principal.tenant_id = tenant;
            }
        }

        Ok(AdminPrincipal(principal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token_for(agent: &str, tenant: Uuid, secret: &str) -> String {
        let claims = Claims {
            sub: agent.to_string(),
            tenant_id: tenant,
            scopes: vec!["agent".to_string()],
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_principal_with_token_tenant() {
        let tenant = Uuid::new_v4();
        let auth = Authenticator::new("test-secret");
        let token = token_for("agent-1", tenant, "test-secret");
        let principal = auth.verify_bearer(&format!("Bearer {}", token)).unwrap();
        assert_eq!(principal.agent_id, "agent-1");
        assert_eq!(principal.tenant_id, tenant);
    }

    #[test]
    fn wrong_secret_rejected() {
        let auth = Authenticator::new("right-secret");
        let token = token_for("agent-1", Uuid::new_v4(), "wrong-secret");
        assert!(auth.verify_bearer(&format!("Bearer {}", token)).is_err());
    }

    #[test]
    fn unsafe_agent_id_rejected() {
        let auth = Authenticator::new("s");
        let token = token_for("../etc/passwd", Uuid::new_v4(), "s");
        assert!(auth.verify_bearer(&format!("Bearer {}", token)).is_err());
    }

    #[test]
    fn missing_bearer_prefix_rejected() {
        let auth = Authenticator::new("s");
        assert!(auth.verify_bearer("Basic abc").is_err());
    }

    #[test]
    fn mode_detection_prefers_explicit_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-claude-code-version", HeaderValue::from_static("1.2.3"));
        headers.insert(USER_AGENT, HeaderValue::from_static("vscode"));
        assert_eq!(detect_mode(&headers), SessionMode::ClaudeCode);

        let mut headers = HeaderMap::new();
        headers.insert("x-ide-name", HeaderValue::from_static("intellij"));
        assert_eq!(detect_mode(&headers), SessionMode::Ide);

        let mut headers = HeaderMap::new();
        headers.insert("x-agent-id", HeaderValue::from_static("worker-7"));
        assert_eq!(detect_mode(&headers), SessionMode::Agent);
    }

    #[test]
    fn mode_detection_sniffs_user_agent() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("claude-code/2.0"));
        assert_eq!(detect_mode(&headers), SessionMode::ClaudeCode);

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("curl/8.0"));
        assert_eq!(detect_mode(&headers), SessionMode::Standard);
    }

    #[test]
    fn refresh_token_hash_is_stable_hex() {
        let h = hash_refresh_token("abc");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_refresh_token("abc"));
        assert_ne!(h, hash_refresh_token("abd"));
    }
}
