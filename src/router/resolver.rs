//! Route resolution for `/v1/messages`.
//!
//! Rewrites `body.model` to a concrete `"provider,model"` target, rewrites
//! the system prompt, strips routing markers from the outbound body, and
//! picks the upstream credential. OAuth passthrough requests without a
//! router marker are left untouched.

use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::auth::markers::{markers_from_body, strip_model_marker, strip_router_marker};
use crate::config::Config;
use crate::constants::LONG_CONTEXT_SESSION_FLOOR;
use crate::context::{RequestContext, SubagentMarkers, mask_token};
use crate::router::custom::run_custom_router;
use crate::router::keys::select_key;
use crate::session::{SessionUsageCache, session_id_from_user_id};
use crate::token_count::estimate_body_tokens;
use crate::util::is_truthy;

pub async fn resolve(
    body: &mut Value,
    ctx: &mut RequestContext,
    config: &Config,
    usage: &SessionUsageCache,
) {
    if let Some(user_id) = body
        .pointer("/metadata/user_id")
        .and_then(Value::as_str)
    {
        ctx.session_id = session_id_from_user_id(user_id);
    }

    let found = ctx
        .subagent_markers
        .clone()
        .unwrap_or_else(|| markers_from_body(body));

    // Transparent forward: passthrough traffic is only routed when it
    // carries a router marker that resolves against config.
    if ctx.is_oauth_passthrough {
        let routable = found
            .router_name
            .as_deref()
            .is_some_and(|name| config.router.route(name).is_some());
        if !routable {
            return;
        }
        ctx.subagent_markers = Some(found.clone());
    }

    rewrite_system_prompt(body, config);

    if let Some(model) = select_model(body, ctx, &found, config, usage).await {
        debug!(model = %model, "route resolved");
        body["model"] = Value::String(model);
    }

    attach_key(body, ctx, config);
}

/// Apply the selection rules in order; `None` keeps the client's model
/// value as-is.
async fn select_model(
    body: &mut Value,
    ctx: &RequestContext,
    found: &SubagentMarkers,
    config: &Config,
    usage: &SessionUsageCache,
) -> Option<String> {
    // The custom hook runs first and overrides every built-in rule.
    if let Some(path) = &config.custom_router_path
        && let Some(model) = run_custom_router(path, body, config).await
    {
        info!(model = %model, "custom router override");
        return Some(model);
    }

    // 1. Subagent router marker. The marker is stripped whether or not the
    // name resolves; an unknown name falls through.
    if let Some(name) = &found.router_name {
        edit_system1(body, |text| strip_router_marker(text));
        if let Some(target) = config.router.route(name) {
            edit_system1(body, |text| strip_model_marker(text));
            return Some(pick_target(target));
        }
        warn!(router = %name, "unknown router kind in subagent marker");
    }

    // 2. Client-specified "provider,model" is accepted whether or not it
    // validates; unknown pairs keep the client's literal value.
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if let Some((provider, model_name)) = model.split_once(',') {
        match config.find_provider(provider) {
            Some(p) if p.has_model(model_name) => return None,
            _ => {
                debug!(model = %model, "client model not in config, passing through");
                return None;
            }
        }
    }

    // 3. Long-context rule.
    let token_count = estimate_body_tokens(body);
    let threshold = config.router.long_context_threshold();
    let last_usage = match &ctx.session_id {
        Some(sid) => usage.get(sid).await,
        None => None,
    };
    let long_context = token_count > threshold
        || last_usage.is_some_and(|u| {
            u.input_tokens > threshold && token_count > LONG_CONTEXT_SESSION_FLOOR
        });
    if long_context && let Some(target) = config.router.route("longContext") {
        info!(token_count, threshold, "long-context route");
        return Some(pick_target(target));
    }

    // 4. Subagent model marker (never honored on passthrough traffic).
    if !ctx.is_oauth_passthrough
        && let Some(model_name) = &found.model_name
    {
        edit_system1(body, |text| strip_model_marker(text));
        return Some(pick_target(model_name));
    }

    // 5. Background rule.
    if model.contains("claude")
        && model.contains("haiku")
        && let Some(target) = config.router.route("background")
    {
        return Some(pick_target(target));
    }

    // 6. Web-search rule.
    if has_web_search_tool(body)
        && let Some(target) = config.router.route("webSearch")
    {
        return Some(pick_target(target));
    }

    // 7. Thinking rule.
    if body.get("thinking").is_some_and(is_truthy)
        && let Some(target) = config.router.route("think")
    {
        return Some(pick_target(target));
    }

    // 8. Default.
    config.router.route("default").map(pick_target)
}

/// Split a `;`-separated target list and pick one uniformly. A
/// single-alternative target returns the original string unchanged.
pub fn pick_target(target: &str) -> String {
    let parts: Vec<&str> = target
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() <= 1 {
        return target.to_string();
    }
    let index = rand::rng().random_range(0..parts.len());
    parts[index].to_string()
}

/// Resolve the provider named by the final model value and attach one of
/// its keys. The key never lands in `body.model` and is never logged raw.
fn attach_key(body: &Value, ctx: &mut RequestContext, config: &Config) {
    let Some((provider_name, _)) = body
        .get("model")
        .and_then(Value::as_str)
        .and_then(|m| m.split_once(','))
    else {
        return;
    };
    if let Some(provider) = config.find_provider(provider_name)
        && let Some(key) = select_key(provider)
    {
        debug!(provider = %provider.name, key = %mask_token(&key), "provider key selected");
        ctx.selected_api_key = Some(key);
    }
}

/// When configured and `system[1].text` contains `<env>`, replace it with
/// the rewrite file's contents followed by the request's own `<env>` tail.
fn rewrite_system_prompt(body: &mut Value, config: &Config) {
    let Some(path) = &config.rewrite_system_prompt else {
        return;
    };
    let contains_env = body
        .pointer("/system/1/text")
        .and_then(Value::as_str)
        .is_some_and(|t| t.contains("<env>"));
    if !contains_env {
        return;
    }
    let replacement = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!("cannot read rewrite_system_prompt file: {e}");
            return;
        }
    };
    edit_system1(body, |text| {
        let tail = text
            .rfind("<env>")
            .map(|idx| &text[idx + "<env>".len()..])
            .unwrap_or_default();
        format!("{replacement}<env>{tail}")
    });
}

/// Apply an edit to `system[1].text` in place. Other positions are never
/// touched.
fn edit_system1(body: &mut Value, edit: impl FnOnce(&str) -> String) {
    if let Some(block) = body
        .get_mut("system")
        .and_then(Value::as_array_mut)
        .and_then(|system| system.get_mut(1))
        && let Some(text) = block.get("text").and_then(Value::as_str)
    {
        let new_text = edit(text);
        block["text"] = Value::String(new_text);
    }
}

fn has_web_search_tool(body: &Value) -> bool {
    body.get("tools")
        .and_then(Value::as_array)
        .is_some_and(|tools| {
            tools.iter().any(|tool| {
                tool.get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|t| t.starts_with("web_search"))
            })
        })
}
