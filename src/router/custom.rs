//! External custom-router hook.
//!
//! The configured program receives `{request, config, event}` as JSON on
//! stdin and prints the chosen model string on stdout. Anything that goes
//! wrong (spawn failure, timeout, non-zero exit, empty output) falls back
//! to the built-in rules.

use std::path::Path;
use std::process::Stdio;

use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::config::Config;
use crate::constants::CUSTOM_ROUTER_TIMEOUT;

pub async fn run_custom_router(path: &Path, body: &Value, config: &Config) -> Option<String> {
    let payload = json!({
        "request": body,
        "config": config,
        "event": "route",
    });

    let result = tokio::time::timeout(CUSTOM_ROUTER_TIMEOUT, invoke(path, &payload)).await;
    match result {
        Ok(Ok(model)) if !model.is_empty() => Some(model),
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            warn!("custom router {} failed: {e}", path.display());
            None
        }
        Err(_) => {
            warn!("custom router {} timed out", path.display());
            None
        }
    }
}

async fn invoke(path: &Path, payload: &Value) -> std::io::Result<String> {
    let mut child = tokio::process::Command::new(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(payload.to_string().as_bytes()).await?;
        // Closing stdin lets the child see EOF
        drop(stdin);
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(std::io::Error::other(format!(
            "exit status {}",
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or("").trim().to_string())
}
