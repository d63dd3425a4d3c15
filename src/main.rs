mod agents;
mod auth;
mod config;
mod constants;
mod context;
mod error;
mod oauth;
mod outbound;
mod router;
mod routes;
mod session;
mod sse;
mod token_count;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use agents::AgentRegistry;
use axum::ServiceExt;
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    routing::{get, post},
};
use clap::Parser;
use config::Config;
use oauth::{OAuthClient, SharedTokenStore};
use reqwest::Client;
use session::{SessionProjectResolver, SessionUsageCache};
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::normalize_path::NormalizePath;
use tower_http::services::ServeDir;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");
pub const BUILD_TIME: &str = env!("BUILD_TIME");

pub struct AppState {
    pub config_rx: watch::Receiver<Arc<Config>>,
    pub http_client: Client,
    pub shared_tokens: SharedTokenStore,
    pub oauth: OAuthClient,
    pub agents: Arc<AgentRegistry>,
    pub session_usage: Arc<SessionUsageCache>,
    pub session_projects: SessionProjectResolver,
}

impl AppState {
    /// Config snapshot for one request. In-flight requests keep the
    /// snapshot they started with across reloads.
    pub fn config(&self) -> Arc<Config> {
        self.config_rx.borrow().clone()
    }
}

#[derive(Parser)]
#[command(name = "claude-router")]
#[command(about = "Local reverse proxy and request router for Claude Code")]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, env = "CLAUDE_ROUTER_HOST")]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long, env = "CLAUDE_ROUTER_PORT")]
    port: Option<u16>,

    /// Config file (default: ~/.claude-router/config.json)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(config::config_path);
    let mut initial = Config::load_or_default(&config_path);
    if let Some(host) = args.host {
        initial.host = host;
    }
    if let Some(port) = args.port {
        initial.port = port;
    }

    let default_filter = initial
        .log_level
        .clone()
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let host = initial.host.clone();
    let port = initial.port;
    let ui_dir = initial
        .ui_dir
        .clone()
        .unwrap_or_else(|| config::app_dir().join("ui"));

    let initial = Arc::new(initial);
    let (config_rx, _watcher) = match config::start_watching(&config_path, initial.clone()) {
        Ok((rx, handle)) => (rx, Some(handle)),
        Err(e) => {
            warn!("config watcher disabled: {e}");
            let (tx, rx) = watch::channel(initial.clone());
            // No reloads will ever arrive; keep the sender so the channel
            // stays open for the process lifetime.
            std::mem::forget(tx);
            (rx, None)
        }
    };

    // Shared HTTP client with connection pooling
    let http_client = Client::builder()
        .timeout(Duration::from_secs(300))
        .pool_max_idle_per_host(10)
        .build()
        .expect("Failed to create HTTP client");

    let state = Arc::new(AppState {
        config_rx,
        http_client: http_client.clone(),
        shared_tokens: SharedTokenStore::new(),
        oauth: OAuthClient::new(http_client),
        agents: Arc::new(AgentRegistry::new()),
        session_usage: Arc::new(SessionUsageCache::new()),
        session_projects: SessionProjectResolver::new(),
    });

    // Browser preflight: local origins only. Non-local origins are also
    // rejected per-request by the auth pipeline when no API key is set.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let Ok(origin) = origin.to_str() else {
                return false;
            };
            let Ok(url) = url::Url::parse(origin) else {
                return false;
            };
            matches!(
                url.host_str(),
                Some("localhost") | Some("127.0.0.1") | Some("::1")
            )
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-api-key"),
            header::HeaderName::from_static("anthropic-version"),
        ]);

    let api_routes = Router::new()
        .route("/messages", post(routes::messages::messages))
        .route(
            "/messages/count_tokens",
            post(routes::messages::count_tokens),
        )
        .route("/oauth/token", post(routes::oauth::passthrough))
        .route("/oauth/refresh", post(routes::oauth::passthrough))
        .route("/oauth/userinfo", post(routes::oauth::passthrough));

    let oauth_routes = Router::new()
        .route("/oauth/token", post(routes::oauth::passthrough))
        .route("/oauth/refresh", post(routes::oauth::passthrough))
        .route("/oauth/userinfo", post(routes::oauth::passthrough));

    let app = NormalizePath::trim_trailing_slash(
        Router::new()
            .route("/", get(routes::health::root))
            .route("/health", get(routes::health::health))
            .route("/version", get(routes::health::version))
            .nest_service("/ui", ServeDir::new(ui_dir))
            .nest("/v1", api_routes)
            .merge(oauth_routes)
            .layer(cors)
            .with_state(state),
    );

    let addr: SocketAddr = format!("{host}:{port}").parse().expect("Invalid address");
    info!(
        "Starting claude-router v{}-{} (built {})",
        VERSION, GIT_HASH, BUILD_TIME
    );
    info!("Listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(
        listener,
        ServiceExt::<axum::extract::Request>::into_make_service(app),
    )
    .await
    .expect("Server error");
}
