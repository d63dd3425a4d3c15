//! The routed hot path: `/v1/messages` and its token-count sibling.

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::AppState;
use crate::agents::stream::{AgentStreamContext, agent_tool_stream, usage_tracking_stream};
use crate::auth::authenticate;
use crate::config::Config;
use crate::context::{AuthType, RequestContext};
use crate::error::ProxyError;
use crate::outbound::build_upstream_headers;
use crate::router::resolve;
use crate::session::SessionUsage;
use crate::token_count::estimate_body_tokens;

pub async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let config = state.config();
    let mut body = body;

    let mut ctx = match authenticate(
        &Method::POST,
        "/v1/messages",
        &headers,
        &body,
        &config,
        &state.shared_tokens,
        &state.oauth,
    )
    .await
    {
        Ok(ctx) => ctx,
        Err(err) => return err.to_plain_response(),
    };
    tracing::debug!(
        auth = ctx.auth_type.map(|t| t.as_str()).unwrap_or("none"),
        passthrough = ctx.is_oauth_passthrough,
        "inbound auth resolved"
    );

    // Pre-handler chain: local agents advertise their tools before routing
    // so the token count sees the full request.
    if !ctx.is_oauth_passthrough {
        state.agents.inject_tools(&mut body, &mut ctx);
    }

    resolve(&mut body, &mut ctx, &config, &state.session_usage).await;

    let stream = body
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let Some(upstream_url) = upstream_url(&body, &config, &ctx) else {
        return ProxyError::UpstreamError("no upstream provider resolved".to_string())
            .to_anthropic_response();
    };

    let upstream_headers = build_upstream_headers(&ctx, &body, &config, &state.shared_tokens).await;

    let response = match state
        .http_client
        .post(&upstream_url)
        .headers(upstream_headers)
        .json(&body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            return ProxyError::UpstreamError(format!("failed to contact upstream: {e}"))
                .to_anthropic_response();
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return (
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
            text,
        )
            .into_response();
    }

    if stream {
        let body_stream = response.bytes_stream();
        let out = if ctx.agents.is_empty() {
            // No agents in play: forward byte-for-byte, track usage only.
            Body::from_stream(usage_tracking_stream(
                body_stream,
                state.session_usage.clone(),
                ctx.session_id.clone(),
            ))
        } else {
            let project_dir = match &ctx.session_id {
                Some(sid) => state.session_projects.resolve(sid).await,
                None => None,
            };
            let actx = AgentStreamContext {
                registry: state.agents.clone(),
                config: config.clone(),
                http: state.http_client.clone(),
                loopback_url: format!("http://127.0.0.1:{}/v1/messages", config.port),
                followup_headers: followup_headers(&ctx, &config),
                usage: state.session_usage.clone(),
                session_id: ctx.session_id.clone(),
                project_dir,
                agents: ctx.agents.clone(),
                body: body.clone(),
            };
            Body::from_stream(agent_tool_stream(body_stream, actx))
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .body(out)
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    } else {
        let json_response: Value = match response.json().await {
            Ok(r) => r,
            Err(e) => {
                return ProxyError::ParseError(format!("failed to parse response: {e}"))
                    .to_anthropic_response();
            }
        };

        if let Some(sid) = &ctx.session_id
            && let Some(usage) = json_response.get("usage")
        {
            state
                .session_usage
                .put(
                    sid,
                    SessionUsage {
                        input_tokens: usage
                            .get("input_tokens")
                            .and_then(Value::as_u64)
                            .unwrap_or(0),
                        output_tokens: usage
                            .get("output_tokens")
                            .and_then(Value::as_u64)
                            .unwrap_or(0),
                    },
                )
                .await;
        }

        Json(json_response).into_response()
    }
}

/// Local token estimation; never routed upstream.
pub async fn count_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let config = state.config();
    if let Err(err) = authenticate(
        &Method::POST,
        "/v1/messages/count_tokens",
        &headers,
        &body,
        &config,
        &state.shared_tokens,
        &state.oauth,
    )
    .await
    {
        return err.to_plain_response();
    }

    Json(json!({ "input_tokens": estimate_body_tokens(&body) })).into_response()
}

/// Where the resolved request goes: the provider named by `body.model`,
/// falling back to the default route's provider for bare client models.
fn upstream_url(body: &Value, config: &Config, ctx: &RequestContext) -> Option<String> {
    let model = body.get("model").and_then(Value::as_str).unwrap_or_default();
    if let Some((provider_name, _)) = model.split_once(',')
        && let Some(provider) = config.find_provider(provider_name)
    {
        return Some(provider.base_url.clone());
    }
    if ctx.is_oauth_passthrough {
        let origin = config
            .oauth_upstream
            .clone()
            .unwrap_or_else(|| crate::constants::OAUTH_UPSTREAM_DEFAULT.to_string());
        return Some(format!("{origin}/v1/messages"));
    }
    let default_target = config.router.route("default")?;
    let (provider_name, _) = crate::router::pick_target(default_target).split_once(',').map(
        |(provider, model)| (provider.to_string(), model.to_string()),
    )?;
    config
        .find_provider(&provider_name)
        .map(|p| p.base_url.clone())
}

/// Headers for the subagent follow-up: inherit the parent request's auth or
/// fall back to the server's own key so the loopback passes its pipeline.
fn followup_headers(ctx: &RequestContext, config: &Config) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    match (ctx.auth_type, ctx.auth_token.as_deref()) {
        (Some(AuthType::ClientOauth | AuthType::CcrOauth), Some(token)) => {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(header::AUTHORIZATION, value);
            }
        }
        (Some(AuthType::ApiKey), Some(token)) => {
            if let Ok(value) = HeaderValue::from_str(token) {
                headers.insert("x-api-key", value);
            }
        }
        _ => {
            if let Some(key) = &config.api_key
                && let Ok(value) = HeaderValue::from_str(key)
            {
                headers.insert("x-api-key", value);
            }
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Provider, RouterConfig};

    fn config() -> Config {
        let mut router = RouterConfig::default();
        router.insert("default", "anthropic,claude-sonnet-4-5");
        Config {
            providers: vec![Provider {
                name: "anthropic".to_string(),
                api_key: Some("PK".to_string()),
                models: vec!["claude-sonnet-4-5".to_string()],
                base_url: "https://api.anthropic.com/v1/messages".to_string(),
                ..Default::default()
            }],
            router,
            ..Default::default()
        }
    }

    #[test]
    fn test_upstream_url_from_resolved_model() {
        let body = json!({"model": "anthropic,claude-sonnet-4-5"});
        let url = upstream_url(&body, &config(), &RequestContext::default()).unwrap();
        assert_eq!(url, "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn test_upstream_url_bare_model_uses_default_provider() {
        let body = json!({"model": "some-unknown-model"});
        let url = upstream_url(&body, &config(), &RequestContext::default()).unwrap();
        assert_eq!(url, "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn test_upstream_url_none_without_any_route() {
        let body = json!({"model": "bare"});
        assert!(upstream_url(&body, &Config::default(), &RequestContext::default()).is_none());
    }

    #[test]
    fn test_followup_headers_inherit_bearer() {
        let ctx = RequestContext {
            auth_token: Some("tok".to_string()),
            auth_type: Some(AuthType::ClientOauth),
            ..Default::default()
        };
        let headers = followup_headers(&ctx, &Config::default());
        assert_eq!(headers[header::AUTHORIZATION], "Bearer tok");
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_followup_headers_inject_server_key_when_cleared() {
        let config = Config {
            api_key: Some("SERVER-KEY".to_string()),
            ..Default::default()
        };
        let headers = followup_headers(&RequestContext::default(), &config);
        assert_eq!(headers["x-api-key"], "SERVER-KEY");
        assert!(headers.get(header::AUTHORIZATION).is_none());
    }
}
