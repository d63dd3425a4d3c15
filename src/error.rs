use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("x-api-key is missing")]
    MissingApiKey,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("CORS not allowed for this origin")]
    CorsDenied,

    #[error("Upstream error: {0}")]
    UpstreamError(String),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("OAuth error: {0}")]
    OAuthError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProxyError {
    /// Plaintext response for the inbound auth surface. Claude Code matches
    /// on these exact bodies, so they stay bare strings rather than JSON.
    pub fn to_plain_response(&self) -> Response {
        let status = match self {
            ProxyError::MissingApiKey
            | ProxyError::InvalidApiKey
            | ProxyError::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            ProxyError::CorsDenied => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }

    /// Convert error to an Anthropic-compatible error envelope
    pub fn to_anthropic_response(&self) -> Response {
        let (status, error_type) = match self {
            ProxyError::MissingApiKey
            | ProxyError::InvalidApiKey
            | ProxyError::AuthenticationRequired => {
                (StatusCode::UNAUTHORIZED, "authentication_error")
            }
            ProxyError::CorsDenied => (StatusCode::FORBIDDEN, "permission_error"),
            ProxyError::OAuthError(_) | ProxyError::IoError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "api_error")
            }
            ProxyError::NetworkError(_)
            | ProxyError::UpstreamError(_)
            | ProxyError::ParseError(_) => (StatusCode::BAD_GATEWAY, "api_error"),
        };

        (
            status,
            Json(json!({
                "type": "error",
                "error": {
                    "type": error_type,
                    "message": self.to_string()
                }
            })),
        )
            .into_response()
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::MissingApiKey
            | ProxyError::InvalidApiKey
            | ProxyError::AuthenticationRequired
            | ProxyError::CorsDenied => self.to_plain_response(),
            _ => self.to_anthropic_response(),
        }
    }
}
