//! Classifies inbound requests as OAuth passthrough traffic.
//!
//! Three additive signals produce a confidence in [0,1]; at or above 0.3 the
//! request skips the inbound-auth state machine and is forwarded (or routed,
//! when it carries a subagent router marker).

use std::sync::LazyLock;

use axum::http::HeaderMap;
use regex::Regex;
use serde_json::Value;

use crate::context::OauthRequestType;

/// Confidence at or above which a request is treated as OAuth passthrough.
pub const PASSTHROUGH_THRESHOLD: f64 = 0.3;

static OAUTH_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/v[0-9]*/?oauth/(token|refresh|revoke|userinfo|introspect)")
        .expect("oauth path pattern")
});

const BODY_FIELDS: [&str; 7] = [
    "grant_type",
    "refresh_token",
    "client_id",
    "client_secret",
    "code",
    "redirect_uri",
    "scope",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub confidence: f64,
    pub request_type: Option<OauthRequestType>,
}

impl Detection {
    pub fn is_passthrough(&self) -> bool {
        self.confidence >= PASSTHROUGH_THRESHOLD
    }
}

pub fn detect(path: &str, headers: &HeaderMap, body: &Value) -> Detection {
    let mut confidence = 0.0;
    let mut request_type = None;

    if let Some(captures) = OAUTH_PATH.captures(path) {
        confidence += 0.6;
        request_type = match &captures[1] {
            "token" => Some(OauthRequestType::TokenExchange),
            "refresh" => Some(OauthRequestType::TokenRefresh),
            "userinfo" => Some(OauthRequestType::UserInfo),
            _ => None,
        };
    }

    let present = BODY_FIELDS
        .iter()
        .filter(|field| body.get(**field).is_some())
        .count();
    if present >= 2 {
        confidence += 0.3;
        if request_type.is_none() {
            request_type = match body.get("grant_type").and_then(Value::as_str) {
                Some("authorization_code") | Some("client_credentials") => {
                    Some(OauthRequestType::TokenExchange)
                }
                _ if body.get("refresh_token").is_some() => Some(OauthRequestType::TokenRefresh),
                _ => None,
            };
        }
    }

    if has_oauth_headers(headers) {
        confidence += 0.1;
    }

    Detection {
        confidence,
        request_type,
    }
}

fn has_oauth_headers(headers: &HeaderMap) -> bool {
    if headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Basic "))
    {
        return true;
    }
    headers.keys().any(|name| name.as_str().contains("oauth"))
}
