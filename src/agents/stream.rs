//! SSE rewrite loops for the response path.
//!
//! `agent_tool_stream` runs the tool-capture state machine: agent-owned
//! `tool_use` blocks are swallowed, executed locally, and the conversation
//! is continued through a follow-up call to the local loopback whose events
//! are spliced into the client's stream. `usage_tracking_stream` is the
//! plain path: bytes are forwarded untouched while usage counters are
//! scraped on the side.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::http::HeaderMap;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};
use tokio::time::interval;
use tracing::{debug, error, warn};

use crate::agents::{Agent, AgentContext, AgentRegistry};
use crate::config::Config;
use crate::constants::SUBAGENT_FOLLOWUP_TIMEOUT;
use crate::session::{SessionUsage, SessionUsageCache};
use crate::sse::{SseEvent, SseParser};
use crate::util::lenient_json;

/// Keep-alive interval for SSE streams (prevents proxy timeouts).
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// SSE keep-alive comment (ignored by clients but keeps the connection warm).
const KEEP_ALIVE_COMMENT: &str = ": keep-alive\n\n";

/// Everything the tool loop needs besides the upstream byte stream.
pub struct AgentStreamContext {
    pub registry: Arc<AgentRegistry>,
    pub config: Arc<Config>,
    pub http: reqwest::Client,
    /// Local `/v1/messages` endpoint for follow-up turns
    pub loopback_url: String,
    /// Auth inherited from the parent request, plus content-type
    pub followup_headers: HeaderMap,
    pub usage: Arc<SessionUsageCache>,
    pub session_id: Option<String>,
    pub project_dir: Option<std::path::PathBuf>,
    /// Agents allowed to run tools for this request
    pub agents: Vec<String>,
    /// The rewritten request body; follow-up turns are appended to it
    pub body: Value,
}

struct ToolCapture {
    agent: Arc<dyn Agent>,
    index: i64,
    name: String,
    id: String,
    args: String,
}

#[derive(Default)]
struct UsageAccumulator {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

impl UsageAccumulator {
    fn observe(&mut self, event_type: &str, data: &Value) {
        match event_type {
            "message_start" => {
                if let Some(tokens) = data
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_u64)
                {
                    self.input_tokens = Some(tokens);
                }
            }
            "message_delta" => {
                if let Some(tokens) = data.pointer("/usage/input_tokens").and_then(Value::as_u64)
                {
                    self.input_tokens = Some(tokens);
                }
                if let Some(tokens) = data
                    .pointer("/usage/output_tokens")
                    .and_then(Value::as_u64)
                {
                    self.output_tokens = Some(tokens);
                }
            }
            _ => {}
        }
    }

    async fn commit(self, usage: &SessionUsageCache, session_id: Option<&str>) {
        let Some(session_id) = session_id else {
            return;
        };
        if self.input_tokens.is_none() && self.output_tokens.is_none() {
            return;
        }
        usage
            .put(
                session_id,
                SessionUsage {
                    input_tokens: self.input_tokens.unwrap_or(0),
                    output_tokens: self.output_tokens.unwrap_or(0),
                },
            )
            .await;
    }
}

fn event_type<'a>(event: &'a SseEvent, data: &'a Value) -> &'a str {
    event
        .event
        .as_deref()
        .or_else(|| data.get("type").and_then(Value::as_str))
        .unwrap_or("")
}

fn append_turns(body: &mut Value, assistant: Vec<Value>, tools: Vec<Value>) {
    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        messages.push(json!({"role": "assistant", "content": assistant}));
        messages.push(json!({"role": "user", "content": tools}));
    }
}

/// The tool-capture state machine over the upstream SSE stream.
pub fn agent_tool_stream(
    upstream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    actx: AgentStreamContext,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    stream! {
        let mut parser = SseParser::new();
        let mut capture: Option<ToolCapture> = None;
        let mut assistant_messages: Vec<Value> = Vec::new();
        let mut tool_messages: Vec<Value> = Vec::new();
        let mut usage_acc = UsageAccumulator::default();
        let mut body = actx.body;

        let mut upstream = std::pin::pin!(upstream);
        while let Some(chunk_result) = upstream.next().await {
            let chunk = match chunk_result {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!("upstream stream ended with error: {e}");
                    yield Err(std::io::Error::other(e));
                    return;
                }
            };
            let Ok(text) = std::str::from_utf8(&chunk) else {
                // Not UTF-8: forward untouched, the capture machine only
                // cares about well-formed SSE.
                yield Ok(chunk);
                continue;
            };

            for event in parser.feed(text) {
                let data = event.json().unwrap_or(Value::Null);
                let etype = event_type(&event, &data).to_string();
                usage_acc.observe(&etype, &data);

                // Capture start: an agent-owned tool_use block.
                if etype == "content_block_start"
                    && capture.is_none()
                    && data.pointer("/content_block/type").and_then(Value::as_str)
                        == Some("tool_use")
                    && let Some(name) = data
                        .pointer("/content_block/name")
                        .and_then(Value::as_str)
                    && let Some(agent) = actx.registry.owner_of(&actx.agents, name)
                {
                    capture = Some(ToolCapture {
                        agent,
                        index: data.get("index").and_then(Value::as_i64).unwrap_or(-1),
                        name: name.to_string(),
                        id: data
                            .pointer("/content_block/id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        args: String::new(),
                    });
                    continue;
                }

                let captured_index = capture.as_ref().map(|c| c.index);
                if captured_index.is_some()
                    && data.get("index").and_then(Value::as_i64) == captured_index
                {
                    // Argument deltas for the captured block.
                    if data.pointer("/delta/type").and_then(Value::as_str)
                        == Some("input_json_delta")
                    {
                        if let Some(partial) = data
                            .pointer("/delta/partial_json")
                            .and_then(Value::as_str)
                            && let Some(active) = capture.as_mut()
                        {
                            active.args.push_str(partial);
                        }
                        continue;
                    }

                    // Block finished: run the tool.
                    if etype == "content_block_stop"
                        && let Some(done) = capture.take()
                    {
                        let agent_ctx = AgentContext {
                            config: actx.config.clone(),
                            session_id: actx.session_id.clone(),
                            project_dir: actx.project_dir.clone(),
                        };
                        match lenient_json(&done.args) {
                            Ok(input) => {
                                assistant_messages.push(json!({
                                    "type": "tool_use",
                                    "id": done.id,
                                    "name": done.name,
                                    "input": input,
                                }));
                                match done.agent.handle(&done.name, input.clone(), &agent_ctx).await
                                {
                                    Ok(result) => tool_messages.push(json!({
                                        "tool_use_id": done.id,
                                        "type": "tool_result",
                                        "content": result,
                                    })),
                                    Err(e) => tool_messages.push(json!({
                                        "tool_use_id": done.id,
                                        "type": "tool_result",
                                        "content": format!("Error: {e}"),
                                        "is_error": true,
                                    })),
                                }
                            }
                            Err(e) => {
                                warn!(tool = %done.name, "tool arguments did not parse: {e}");
                                assistant_messages.push(json!({
                                    "type": "tool_use",
                                    "id": done.id,
                                    "name": done.name,
                                    "input": {},
                                }));
                                tool_messages.push(json!({
                                    "tool_use_id": done.id,
                                    "type": "tool_result",
                                    "content": format!("Error: {e}"),
                                    "is_error": true,
                                }));
                            }
                        }
                        continue;
                    }
                }

                // Everything else is forwarded in source order.
                yield Ok(Bytes::from(event.serialize()));

                // After the triggering message_delta, continue the
                // conversation through the loopback and splice its events in.
                if etype == "message_delta" && !tool_messages.is_empty() {
                    append_turns(
                        &mut body,
                        std::mem::take(&mut assistant_messages),
                        std::mem::take(&mut tool_messages),
                    );

                    let deadline = tokio::time::Instant::now() + SUBAGENT_FOLLOWUP_TIMEOUT;
                    let send = actx
                        .http
                        .post(&actx.loopback_url)
                        .headers(actx.followup_headers.clone())
                        .json(&body)
                        .send();
                    let response = match tokio::time::timeout_at(deadline, send).await {
                        Err(_) => {
                            error!("subagent follow-up timed out");
                            continue;
                        }
                        Ok(Err(e)) => {
                            error!("subagent follow-up failed: {e}");
                            continue;
                        }
                        Ok(Ok(response)) if !response.status().is_success() => {
                            error!(status = %response.status(), "subagent follow-up rejected");
                            continue;
                        }
                        Ok(Ok(response)) => response,
                    };

                    let mut follow_parser = SseParser::new();
                    let mut follow_stream = std::pin::pin!(response.bytes_stream());
                    'follow: loop {
                        let chunk = match tokio::time::timeout_at(deadline, follow_stream.next())
                            .await
                        {
                            Err(_) => {
                                error!("subagent follow-up stream timed out");
                                break 'follow;
                            }
                            Ok(None) => break 'follow,
                            Ok(Some(Err(e))) => {
                                debug!("subagent follow-up stream closed: {e}");
                                break 'follow;
                            }
                            Ok(Some(Ok(chunk))) => chunk,
                        };
                        let Ok(text) = std::str::from_utf8(&chunk) else {
                            continue;
                        };
                        for follow_event in follow_parser.feed(text) {
                            let follow_data = follow_event.json().unwrap_or(Value::Null);
                            let ftype = event_type(&follow_event, &follow_data);
                            // The client already has a message envelope open.
                            if ftype == "message_start" || ftype == "message_stop" {
                                continue;
                            }
                            yield Ok(Bytes::from(follow_event.serialize()));
                        }
                    }
                }
            }
        }

        if !parser.remainder().is_empty() {
            yield Ok(Bytes::from(parser.remainder().to_string()));
        }
        usage_acc.commit(&actx.usage, actx.session_id.as_deref()).await;
    }
}

/// Byte-for-byte pass-through that scrapes usage counters on the side and
/// emits keep-alive comments while the upstream is quiet.
pub fn usage_tracking_stream(
    upstream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    usage: Arc<SessionUsageCache>,
    session_id: Option<String>,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    stream! {
        let mut parser = SseParser::new();
        let mut usage_acc = UsageAccumulator::default();
        let mut upstream = std::pin::pin!(upstream);
        let mut keep_alive = interval(KEEP_ALIVE_INTERVAL);
        keep_alive.reset();

        loop {
            tokio::select! {
                biased;

                chunk_opt = upstream.next() => {
                    let Some(chunk_result) = chunk_opt else {
                        break;
                    };
                    let chunk = match chunk_result {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            debug!("upstream stream ended with error: {e}");
                            yield Err(std::io::Error::other(e));
                            return;
                        }
                    };
                    if let Ok(text) = std::str::from_utf8(&chunk) {
                        for event in parser.feed(text) {
                            let data = event.json().unwrap_or(Value::Null);
                            let etype = event_type(&event, &data).to_string();
                            usage_acc.observe(&etype, &data);
                        }
                    }
                    yield Ok(chunk);
                }

                _ = keep_alive.tick() => {
                    yield Ok(Bytes::from(KEEP_ALIVE_COMMENT));
                }
            }
        }

        usage_acc.commit(&usage, session_id.as_deref()).await;
    }
}
