//! Per-request state threaded through the auth pipeline and resolver.

/// Where the inbound credential came from. Decides which header the
/// outbound builder emits (Bearer vs x-api-key).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    /// `Authorization: Bearer` supplied by the client
    ClientOauth,
    /// Token published by a peer process via the shared token store
    CcrOauth,
    /// Matched `x-api-key` against the configured server key
    ApiKey,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::ClientOauth => "client-oauth",
            AuthType::CcrOauth => "ccr-oauth",
            AuthType::ApiKey => "api-key",
        }
    }
}

/// Classification of an OAuth passthrough request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OauthRequestType {
    TokenExchange,
    TokenRefresh,
    UserInfo,
}

/// Routing overrides extracted from `system[1].text`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubagentMarkers {
    pub router_name: Option<String>,
    pub model_name: Option<String>,
}

impl SubagentMarkers {
    pub fn is_empty(&self) -> bool {
        self.router_name.is_none() && self.model_name.is_none()
    }
}

/// State attached to a request by the pipeline and consumed downstream.
/// One instance per request; all fields start empty.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub auth_token: Option<String>,
    pub auth_type: Option<AuthType>,
    pub session_id: Option<String>,
    /// Names of local agents allowed to contribute tools to this request
    pub agents: Vec<String>,
    pub subagent_markers: Option<SubagentMarkers>,
    pub selected_api_key: Option<String>,
    pub is_oauth_passthrough: bool,
    pub oauth_request_type: Option<OauthRequestType>,
    pub oauth_confidence: f64,
}

impl RequestContext {
    /// Drop any previously attached client credential so the outbound call
    /// falls back to the provider API key from config.
    pub fn clear_auth(&mut self) {
        self.auth_token = None;
        self.auth_type = None;
    }
}

/// Mask a credential for logging: first 8 characters followed by an ellipsis.
/// Raw tokens must never reach the log output.
pub fn mask_token(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{prefix}…")
}
