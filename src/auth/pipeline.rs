//! The inbound authentication state machine.
//!
//! Every request gets exactly one outcome: a context with an attached
//! credential, a context with credentials deliberately cleared (ClaudeMem
//! and subagent traffic use the provider key upstream), an OAuth-passthrough
//! context, or a rejection.

use axum::http::{HeaderMap, Method, header};
use serde_json::Value;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::auth::markers;
use crate::config::Config;
use crate::context::{AuthType, RequestContext, mask_token};
use crate::error::ProxyError;
use crate::oauth::detector;
use crate::oauth::{OAuthClient, SharedTokenStore};
use crate::util::is_truthy;

/// Endpoints that never require authentication.
pub fn is_public_endpoint(method: &Method, path: &str) -> bool {
    method == Method::GET
        && (path == "/" || path == "/health" || path == "/version" || path.starts_with("/ui"))
}

/// A request is "thinking" when `body.thinking` is truthy or the model name
/// suggests a reasoning variant. Thinking requests keep client OAuth even
/// when they carry subagent markers.
pub fn is_thinking_request(body: &Value) -> bool {
    if body.get("thinking").is_some_and(is_truthy) {
        return true;
    }
    body.get("model")
        .and_then(Value::as_str)
        .map(str::to_lowercase)
        .is_some_and(|m| m.contains("think") || m.contains("reasoning"))
}

/// Run the four-priority state machine. `Err` carries the rejection.
pub async fn authenticate(
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    body: &Value,
    config: &Config,
    shared_tokens: &SharedTokenStore,
    oauth: &OAuthClient,
) -> Result<RequestContext, ProxyError> {
    let mut ctx = RequestContext::default();

    // Priority 1: OAuth passthrough skips inbound auth entirely.
    let detection = detector::detect(path, headers, body);
    if detection.is_passthrough() {
        ctx.is_oauth_passthrough = true;
        ctx.oauth_confidence = detection.confidence;
        ctx.oauth_request_type = detection.request_type;
        debug!(path, confidence = detection.confidence, "OAuth passthrough");
        return Ok(ctx);
    }
    ctx.oauth_confidence = detection.confidence;

    // Priority 2: public endpoints.
    if is_public_endpoint(method, path) {
        return Ok(ctx);
    }

    // Priority 3: ClaudeMem traffic always uses the provider key upstream.
    if markers::is_claude_mem_request(body) {
        debug!("ClaudeMem request detected, dropping client auth");
        ctx.clear_auth();
        return Ok(ctx);
    }

    // Priority 4: subagent markers in system[1] also force the provider
    // key, except for thinking requests which keep client OAuth.
    let found = markers::markers_from_body(body);
    if !found.is_empty() {
        ctx.subagent_markers = Some(found);
        if !is_thinking_request(body) {
            debug!("subagent marker detected, dropping client auth");
            ctx.clear_auth();
            return Ok(ctx);
        }
    }

    // Priority 5a: client bearer token.
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
    {
        ctx.auth_token = Some(token.to_string());
        ctx.auth_type = Some(AuthType::ClientOauth);
        debug!(token = %mask_token(token), "client OAuth attached");
        return Ok(ctx);
    }

    // Priority 5b: token published by the peer process, falling back to our
    // own stored credentials (refreshed on demand; a failed refresh reads
    // as "absent" and drops to the next priority).
    if let Some(shared) = shared_tokens.get().await {
        debug!(token = %mask_token(&shared.access_token), "shared OAuth token attached");
        ctx.auth_token = Some(shared.access_token);
        ctx.auth_type = Some(AuthType::CcrOauth);
        return Ok(ctx);
    }
    if let Some(token) = oauth.get_valid_access_token().await {
        debug!(token = %mask_token(&token), "stored OAuth credentials attached");
        ctx.auth_token = Some(token);
        ctx.auth_type = Some(AuthType::CcrOauth);
        return Ok(ctx);
    }

    // Priority 5c: configured server API key.
    if let Some(expected) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
        let provided = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .filter(|k| !k.is_empty());
        let Some(provided) = provided else {
            warn!(path, "request without x-api-key rejected");
            return Err(ProxyError::MissingApiKey);
        };
        if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
            warn!(path, key = %mask_token(provided), "invalid API key rejected");
            return Err(ProxyError::InvalidApiKey);
        }
        ctx.auth_token = Some(provided.to_string());
        ctx.auth_type = Some(AuthType::ApiKey);
        return Ok(ctx);
    }

    // Priority 5d: no key configured. The messages surface still demands
    // auth; everything else is limited to local origins.
    if path == "/v1/messages" || path == "/v1/chat" {
        warn!(path, "unauthenticated request rejected");
        return Err(ProxyError::AuthenticationRequired);
    }
    if let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        let allowed = [
            format!("http://127.0.0.1:{}", config.port),
            format!("http://localhost:{}", config.port),
        ];
        if !allowed.iter().any(|a| a == origin) {
            warn!(origin, "CORS rejection");
            return Err(ProxyError::CorsDenied);
        }
    }
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, SharedTokenStore, OAuthClient) {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedTokenStore::with_path(dir.path().join("shared-oauth-token.json"));
        let oauth = OAuthClient::with_paths(
            reqwest::Client::new(),
            dir.path().to_path_buf(),
            "http://127.0.0.1:9/unused".to_string(),
        );
        (dir, store, oauth)
    }

    fn config_with_key(key: Option<&str>) -> Config {
        Config {
            api_key: key.map(str::to_string),
            port: 3456,
            ..Default::default()
        }
    }

    fn bearer_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    async fn run(
        path: &str,
        headers: &HeaderMap,
        body: &Value,
        config: &Config,
        store: &SharedTokenStore,
        oauth: &OAuthClient,
    ) -> Result<RequestContext, ProxyError> {
        authenticate(&Method::POST, path, headers, body, config, store, oauth).await
    }

    #[tokio::test]
    async fn test_oauth_passthrough_skips_auth() {
        let (_dir, store, oauth) = store();
        let config = config_with_key(Some("K"));
        let body = json!({"grant_type": "authorization_code", "code": "c"});
        let ctx = run("/v1/oauth/token", &HeaderMap::new(), &body, &config, &store, &oauth)
            .await
            .unwrap();
        assert!(ctx.is_oauth_passthrough);
        assert!(ctx.auth_type.is_none());
    }

    #[tokio::test]
    async fn test_public_endpoint_needs_no_auth() {
        let (_dir, store, oauth) = store();
        let config = config_with_key(Some("K"));
        let ctx = authenticate(
            &Method::GET,
            "/health",
            &HeaderMap::new(),
            &Value::Null,
            &config,
            &store,
            &oauth,
        )
        .await
        .unwrap();
        assert!(ctx.auth_type.is_none());
        assert!(is_public_endpoint(&Method::GET, "/ui/index.html"));
        assert!(!is_public_endpoint(&Method::POST, "/health"));
    }

    #[tokio::test]
    async fn test_claude_mem_clears_client_bearer() {
        let (_dir, store, oauth) = store();
        let config = config_with_key(Some("K"));
        let body = json!({"messages": [{"role": "user", "content": "You are a Claude-Mem"}]});
        let ctx = run("/v1/messages", &bearer_headers("CLIENT"), &body, &config, &store, &oauth)
            .await
            .unwrap();
        assert!(ctx.auth_token.is_none());
        assert!(ctx.auth_type.is_none());
    }

    #[tokio::test]
    async fn test_subagent_marker_clears_auth() {
        let (_dir, store, oauth) = store();
        let config = config_with_key(None);
        let body = json!({"system": [
            {"type": "text", "text": "You are a helpful assistant"},
            {"type": "text", "text": "<CCR-SUBAGENT-ROUTER>frontend</CCR-SUBAGENT-ROUTER>"}
        ]});
        let ctx = run("/v1/messages", &bearer_headers("CLIENT"), &body, &config, &store, &oauth)
            .await
            .unwrap();
        assert!(ctx.auth_type.is_none());
        assert_eq!(
            ctx.subagent_markers.unwrap().router_name.as_deref(),
            Some("frontend")
        );
    }

    #[tokio::test]
    async fn test_thinking_request_keeps_client_oauth_despite_marker() {
        let (_dir, store, oauth) = store();
        let config = config_with_key(None);
        let body = json!({
            "thinking": {"type": "enabled"},
            "system": [
                {"type": "text", "text": "x"},
                {"type": "text", "text": "<CCR-SUBAGENT-MODEL>p,m</CCR-SUBAGENT-MODEL>"}
            ]
        });
        let ctx = run("/v1/messages", &bearer_headers("CLIENT"), &body, &config, &store, &oauth)
            .await
            .unwrap();
        assert_eq!(ctx.auth_type, Some(AuthType::ClientOauth));
        assert_eq!(ctx.auth_token.as_deref(), Some("CLIENT"));
        assert!(ctx.subagent_markers.is_some());
    }

    #[tokio::test]
    async fn test_bearer_attaches_client_oauth() {
        let (_dir, store, oauth) = store();
        let config = config_with_key(Some("K"));
        let ctx = run(
            "/v1/messages",
            &bearer_headers("tok-1"),
            &json!({"messages": []}),
            &config,
            &store,
            &oauth,
        )
        .await
        .unwrap();
        assert_eq!(ctx.auth_type, Some(AuthType::ClientOauth));
        assert_eq!(ctx.auth_token.as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn test_empty_and_lowercase_bearer_fall_through() {
        let (_dir, store, oauth) = store();
        let config = config_with_key(Some("K"));

        for value in ["Bearer ", "bearer tok"] {
            let mut headers = HeaderMap::new();
            headers.insert(header::AUTHORIZATION, value.parse().unwrap());
            headers.insert("x-api-key", "K".parse().unwrap());
            let ctx = run(
                "/v1/messages",
                &headers,
                &json!({"messages": []}),
                &config,
                &store,
                &oauth,
            )
            .await
            .unwrap();
            // fell past 5a/5b and matched the configured key
            assert_eq!(ctx.auth_type, Some(AuthType::ApiKey));
        }
    }

    #[tokio::test]
    async fn test_shared_token_attaches_ccr_oauth() {
        use crate::oauth::SharedToken;
        let (_dir, store, oauth) = store();
        store
            .put(
                &SharedToken {
                    access_token: "shared-tok".to_string(),
                    token_type: "Bearer".to_string(),
                    expires_at: None,
                },
                "peer",
            )
            .await
            .unwrap();

        let config = config_with_key(Some("K"));
        let ctx = run(
            "/v1/messages",
            &HeaderMap::new(),
            &json!({"messages": []}),
            &config,
            &store,
            &oauth,
        )
        .await
        .unwrap();
        assert_eq!(ctx.auth_type, Some(AuthType::CcrOauth));
        assert_eq!(ctx.auth_token.as_deref(), Some("shared-tok"));
    }

    #[tokio::test]
    async fn test_missing_and_wrong_api_key_reject() {
        let (_dir, store, oauth) = store();
        let config = config_with_key(Some("K"));

        let err = run(
            "/v1/messages",
            &HeaderMap::new(),
            &json!({"messages": []}),
            &config,
            &store,
            &oauth,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "x-api-key is missing");

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "WRONG".parse().unwrap());
        let err = run(
            "/v1/messages",
            &headers,
            &json!({"messages": []}),
            &config,
            &store,
            &oauth,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Invalid API key");
    }

    #[tokio::test]
    async fn test_empty_api_key_header_counts_as_missing() {
        let (_dir, store, oauth) = store();
        let config = config_with_key(Some("K"));
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "".parse().unwrap());
        let err = run(
            "/v1/messages",
            &headers,
            &json!({"messages": []}),
            &config,
            &store,
            &oauth,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "x-api-key is missing");
    }

    #[tokio::test]
    async fn test_no_key_configured_messages_requires_auth() {
        let (_dir, store, oauth) = store();
        let config = config_with_key(None);
        let err = run(
            "/v1/messages",
            &HeaderMap::new(),
            &json!({"messages": []}),
            &config,
            &store,
            &oauth,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Authentication required");
    }

    #[tokio::test]
    async fn test_no_key_configured_cors_enforced_elsewhere() {
        let (_dir, store, oauth) = store();
        let config = config_with_key(None);

        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, "http://evil.example".parse().unwrap());
        let err = run("/other", &headers, &json!({}), &config, &store, &oauth)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "CORS not allowed for this origin");

        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, "http://localhost:3456".parse().unwrap());
        assert!(run("/other", &headers, &json!({}), &config, &store, &oauth)
            .await
            .is_ok());
    }
}
