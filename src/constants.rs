use std::time::Duration;

/// OAuth client ID registered for the Claude Code CLI.
pub const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Authorization endpoint for the PKCE flow
pub const OAUTH_AUTHORIZE_URL: &str = "https://claude.ai/oauth/authorize";

/// Token endpoint (code exchange and refresh)
pub const OAUTH_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";

/// Fixed redirect target for the authorization code
pub const OAUTH_REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";

/// Scopes requested during login
pub const OAUTH_SCOPES: &str = "org:create_api_key user:profile user:inference";

/// Default origin that OAuth passthrough requests are forwarded to
pub const OAUTH_UPSTREAM_DEFAULT: &str = "https://console.anthropic.com";

/// Anthropic API version header value
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Credentials within this buffer of expiry are treated as expired and refreshed.
pub const TOKEN_EXPIRY_BUFFER_MS: u64 = 5 * 60 * 1000;

/// A peer-published shared token older than this is stale and deleted on read.
pub const SHARED_TOKEN_MAX_AGE_MS: u64 = 5 * 60 * 1000;

/// PKCE login state is rejected when older than this.
pub const LOGIN_STATE_TTL_MS: u64 = 10 * 60 * 1000;

/// Token count above which the resolver prefers `router.longContext`.
pub const DEFAULT_LONG_CONTEXT_THRESHOLD: u64 = 60_000;

/// Secondary threshold for the long-context rule when the last observed
/// upstream usage for the session already crossed the primary threshold.
pub const LONG_CONTEXT_SESSION_FLOOR: u64 = 20_000;

/// Hard deadline for a subagent follow-up call to the local loopback.
pub const SUBAGENT_FOLLOWUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for the external custom-router program.
pub const CUSTOM_ROUTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Session-usage cache entries (long-context rule lookups)
pub const SESSION_USAGE_CAPACITY: usize = 100;

/// Session-to-project cache entries
pub const SESSION_PROJECT_CAPACITY: usize = 1000;

/// Session-to-project entries expire after this long.
pub const SESSION_PROJECT_TTL: Duration = Duration::from_secs(10 * 60);
