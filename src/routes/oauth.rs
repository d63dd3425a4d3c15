//! Transparent passthrough for the OAuth token endpoints.

use axum::{
    Json,
    extract::{OriginalUri, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use std::sync::Arc;

use crate::AppState;
use crate::auth::authenticate;
use crate::constants::OAUTH_UPSTREAM_DEFAULT;
use crate::error::ProxyError;
use crate::outbound::build_upstream_headers;
use crate::router::resolve;

/// `/v1/oauth/*` and `/oauth/*` traffic. Forwarded as-is unless a subagent
/// router marker redirects it to a configured provider.
pub async fn passthrough(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let config = state.config();
    let path = uri.path().to_string();
    let mut body = body;

    let mut ctx = match authenticate(
        &Method::POST,
        &path,
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

    resolve(&mut body, &mut ctx, &config, &state.session_usage).await;

    // A router marker turned this into a normal routed request.
    let routed_provider = body
        .get("model")
        .and_then(Value::as_str)
        .and_then(|m| m.split_once(','))
        .and_then(|(provider, _)| config.find_provider(provider));

    let (url, upstream_headers) = if let Some(provider) = routed_provider {
        let upstream_headers =
            build_upstream_headers(&ctx, &body, &config, &state.shared_tokens).await;
        (provider.base_url.clone(), upstream_headers)
    } else {
        let origin = config
            .oauth_upstream
            .clone()
            .unwrap_or_else(|| OAUTH_UPSTREAM_DEFAULT.to_string());
        let mut upstream_headers = HeaderMap::new();
        upstream_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if let Some(auth) = headers.get(header::AUTHORIZATION) {
            upstream_headers.insert(header::AUTHORIZATION, auth.clone());
        }
        (format!("{origin}{path}"), upstream_headers)
    };

    let response = match state
        .http_client
        .post(&url)
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

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    let bytes = response.bytes().await.unwrap_or_default();

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(axum::body::Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}
