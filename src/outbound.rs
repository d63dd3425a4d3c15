//! Translate the per-request auth decision into upstream headers.
//!
//! Exactly one of `Authorization: Bearer` or `x-api-key` is emitted. A
//! request with no attached auth (ClaudeMem / subagent overrides) resolves
//! its credential from the shared token store or the provider's own keys.

use axum::http::{HeaderMap, HeaderValue, header};
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::context::{AuthType, RequestContext, mask_token};
use crate::oauth::SharedTokenStore;
use crate::router::select_key;

fn insert_bearer(headers: &mut HeaderMap, token: &str) {
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
        headers.insert(header::AUTHORIZATION, value);
    }
}

fn insert_api_key(headers: &mut HeaderMap, key: &str) {
    if let Ok(value) = HeaderValue::from_str(key) {
        headers.insert("x-api-key", value);
    }
}

/// Build the auth headers for the upstream call. `content-type` is always
/// present; the credential headers follow the attached `auth_type`, falling
/// back to the shared token and then the provider key when nothing is
/// attached.
pub async fn build_upstream_headers(
    ctx: &RequestContext,
    body: &Value,
    config: &Config,
    shared_tokens: &SharedTokenStore,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(
        "anthropic-version",
        HeaderValue::from_static(crate::constants::ANTHROPIC_VERSION),
    );

    match (ctx.auth_type, ctx.auth_token.as_deref()) {
        (Some(AuthType::ClientOauth | AuthType::CcrOauth), Some(token)) => {
            insert_bearer(&mut headers, token);
        }
        (Some(AuthType::ApiKey), Some(token)) => {
            insert_api_key(&mut headers, token);
        }
        _ => {
            if let Some(shared) = shared_tokens.get().await {
                debug!(token = %mask_token(&shared.access_token), "upstream auth from shared token");
                insert_bearer(&mut headers, &shared.access_token);
            } else if let Some(key) = provider_key(ctx, body, config) {
                debug!(key = %mask_token(&key), "upstream auth from provider key");
                insert_api_key(&mut headers, &key);
            }
        }
    }

    headers
}

/// The provider-key fallback: the key the resolver already picked, or a
/// fresh pick for the provider named by the resolved model.
fn provider_key(ctx: &RequestContext, body: &Value, config: &Config) -> Option<String> {
    if let Some(key) = &ctx.selected_api_key {
        return Some(key.clone());
    }
    let (provider_name, _) = body
        .get("model")
        .and_then(Value::as_str)
        .and_then(|m| m.split_once(','))?;
    select_key(config.find_provider(provider_name)?)
}
