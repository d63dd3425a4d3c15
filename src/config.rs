//! Process configuration: JSON file at `~/.claude-router/config.json`,
//! env/CLI overrides, and hot reload.
//!
//! The config is treated as an immutable snapshot. The watcher publishes new
//! `Arc<Config>` values through a `tokio::sync::watch` channel and in-flight
//! requests keep the snapshot they started with.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use dotenvy::dotenv;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::DEFAULT_LONG_CONTEXT_THRESHOLD;

/// Debounce window for file system events.
const DEBOUNCE_MS: u64 = 400;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3456
}

/// One upstream provider. `api_keys` is semicolon-separated and takes
/// precedence over the single `api_key`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Provider {
    pub name: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_keys: Option<String>,
    #[serde(default)]
    pub key_weights: Option<Vec<f64>>,
    #[serde(default)]
    pub models: Vec<String>,
    pub base_url: String,
    /// Opaque transformer description, forwarded to logs only
    #[serde(default)]
    pub transformer: Option<Value>,
}

impl Provider {
    /// Case-insensitive membership test against the configured model list.
    pub fn has_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m.eq_ignore_ascii_case(model))
    }
}

/// The `router` table: named route kinds mapping to
/// `"provider,model[;provider,model…]"` target strings, plus the
/// long-context threshold.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouterConfig {
    #[serde(default, rename = "longContextThreshold")]
    pub long_context_threshold: Option<u64>,
    #[serde(flatten)]
    routes: HashMap<String, Value>,
}

impl RouterConfig {
    /// Look up a route kind (`default`, `think`, `longContext`, `background`,
    /// `webSearch`, or any user-named kind). Non-string entries are ignored.
    pub fn route(&self, kind: &str) -> Option<&str> {
        self.routes.get(kind)?.as_str().filter(|s| !s.is_empty())
    }

    pub fn long_context_threshold(&self) -> u64 {
        self.long_context_threshold
            .unwrap_or(DEFAULT_LONG_CONTEXT_THRESHOLD)
    }

    #[cfg(test)]
    pub fn insert(&mut self, kind: &str, target: &str) {
        self.routes
            .insert(kind.to_string(), Value::String(target.to_string()));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// When absent, the server refuses non-local origins and requires no key.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub router: RouterConfig,
    /// File whose contents are spliced into `system[1].text` before `<env>`
    #[serde(default)]
    pub rewrite_system_prompt: Option<PathBuf>,
    /// External program consulted before the built-in routing rules
    #[serde(default)]
    pub custom_router_path: Option<PathBuf>,
    #[serde(default)]
    pub log_level: Option<String>,
    /// Directory served under `/ui`
    #[serde(default)]
    pub ui_dir: Option<PathBuf>,
    /// Origin OAuth passthrough requests are forwarded to
    #[serde(default)]
    pub oauth_upstream: Option<String>,
}

impl Config {
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Fall back to defaults when the config file is missing; env overrides
    /// still apply so a file-less setup can run against a single provider.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Could not load config from {}: {e}", path.display());
                let mut config = Config {
                    host: default_host(),
                    port: default_port(),
                    ..Default::default()
                };
                config.apply_env_overrides();
                config
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        dotenv().ok();
        if let Ok(host) = env::var("CLAUDE_ROUTER_HOST") {
            self.host = host;
        }
        if let Ok(port) = env::var("CLAUDE_ROUTER_PORT")
            && let Ok(port) = port.parse()
        {
            self.port = port;
        }
        if let Ok(key) = env::var("CLAUDE_ROUTER_API_KEY")
            && !key.is_empty()
        {
            self.api_key = Some(key);
        }
    }

    /// Case-insensitive provider lookup.
    pub fn find_provider(&self, name: &str) -> Option<&Provider> {
        self.providers
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

/// Directory holding all persisted state (`config.json`, `oauth.json`, …).
pub fn app_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude-router")
}

pub fn config_path() -> PathBuf {
    app_dir().join("config.json")
}

/// Start watching the config file for changes. Returns a `watch::Receiver`
/// broadcasting new snapshots and a handle to the background task.
///
/// The watcher monitors the parent directory to handle editor
/// write-to-temp-then-rename patterns. Only events matching the config
/// filename trigger a reload attempt.
pub fn start_watching(
    config_path: &Path,
    initial: Arc<Config>,
) -> std::io::Result<(watch::Receiver<Arc<Config>>, JoinHandle<()>)> {
    let config_path = config_path.to_path_buf();
    let parent = config_path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| std::io::Error::other("config path has no parent directory"))?;
    let filename = config_path
        .file_name()
        .ok_or_else(|| std::io::Error::other("config path has no filename"))?
        .to_os_string();

    let (watch_tx, watch_rx) = watch::channel(initial);

    // Bridge notify's callback to a tokio mpsc so we can await events
    let (bridge_tx, mut bridge_rx) = tokio::sync::mpsc::channel(64);
    let mut watcher: RecommendedWatcher = Watcher::new(
        move |res| {
            let _ = bridge_tx.blocking_send(res);
        },
        notify::Config::default(),
    )
    .map_err(std::io::Error::other)?;
    watcher
        .watch(&parent, RecursiveMode::NonRecursive)
        .map_err(std::io::Error::other)?;

    let handle = tokio::spawn(async move {
        // Keep watcher alive for the duration of the task
        let _watcher = watcher;

        loop {
            let event = match bridge_rx.recv().await {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    warn!("config watcher error: {e}");
                    continue;
                }
                None => {
                    debug!("config watcher channel closed, stopping");
                    break;
                }
            };

            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                continue;
            }
            let is_our_file = event
                .paths
                .iter()
                .any(|p| p.file_name().is_some_and(|f| f == filename));
            if !is_our_file {
                continue;
            }

            // Debounce: wait for the write to settle, then drain queued events
            tokio::time::sleep(tokio::time::Duration::from_millis(DEBOUNCE_MS)).await;
            while bridge_rx.try_recv().is_ok() {}

            match Config::from_file(&config_path) {
                Ok(config) => {
                    info!("config reloaded from {}", config_path.display());
                    let _ = watch_tx.send(Arc::new(config));
                }
                Err(e) => {
                    warn!("config reload failed, keeping previous snapshot: {e}");
                }
            }
        }
    });

    Ok((watch_rx, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        serde_json::from_str(
            r#"{
                "api_key": "server-key",
                "providers": [
                    {
                        "name": "OpenRouter",
                        "api_keys": "k1;k2;k3",
                        "models": ["anthropic/claude-3.5-sonnet", "google/gemini-3-pro"],
                        "base_url": "https://openrouter.ai/api/v1/messages"
                    }
                ],
                "router": {
                    "default": "openrouter,anthropic/claude-3.5-sonnet",
                    "frontend": "openrouter,google/gemini-3-pro",
                    "longContextThreshold": 80000
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3456);
        assert!(config.api_key.is_none());
        assert_eq!(
            config.router.long_context_threshold(),
            DEFAULT_LONG_CONTEXT_THRESHOLD
        );
    }

    #[test]
    fn test_find_provider_case_insensitive() {
        let config = sample();
        assert!(config.find_provider("openrouter").is_some());
        assert!(config.find_provider("OPENROUTER").is_some());
        assert!(config.find_provider("missing").is_none());
    }

    #[test]
    fn test_provider_has_model_case_insensitive() {
        let config = sample();
        let provider = config.find_provider("openrouter").unwrap();
        assert!(provider.has_model("Google/Gemini-3-Pro"));
        assert!(!provider.has_model("gpt-4"));
    }

    #[test]
    fn test_router_route_lookup() {
        let config = sample();
        assert_eq!(
            config.router.route("frontend"),
            Some("openrouter,google/gemini-3-pro")
        );
        assert_eq!(config.router.route("missing"), None);
        assert_eq!(config.router.long_context_threshold(), 80000);
    }

    #[test]
    fn test_router_ignores_non_string_entries() {
        let router: RouterConfig =
            serde_json::from_str(r#"{"default": 42, "longContextThreshold": 1000}"#).unwrap();
        assert_eq!(router.route("default"), None);
        assert_eq!(router.long_context_threshold(), 1000);
    }
}
