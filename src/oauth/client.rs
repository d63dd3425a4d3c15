//! PKCE authorization-code flow against the fixed authorization server.
//!
//! Owns the per-user credentials file and the ephemeral login state.
//! Refresh is serialized twice: an in-process singleflight mutex collapses
//! parallel callers, and an on-disk advisory lock serializes sibling
//! processes. After either lock is acquired the credentials are re-read, so
//! a refresh performed by someone else is absorbed without an HTTP call.

use std::fs::{self, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::app_dir;
use crate::constants::{
    LOGIN_STATE_TTL_MS, OAUTH_AUTHORIZE_URL, OAUTH_CLIENT_ID, OAUTH_REDIRECT_URI, OAUTH_SCOPES,
    OAUTH_TOKEN_URL, TOKEN_EXPIRY_BUFFER_MS,
};
use crate::context::mask_token;
use crate::error::ProxyError;
use crate::util::now_ms;

const FILE_LOCK_ATTEMPTS: u32 = 5;
const FILE_LOCK_RETRY_BASE_MS: u64 = 50;
const FILE_LOCK_RETRY_MAX_MS: u64 = 500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthCredentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at_ms: u64,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OAuthCredentials {
    /// Expired means "within the refresh buffer of expiry", not just past it.
    pub fn is_expired(&self) -> bool {
        now_ms() + TOKEN_EXPIRY_BUFFER_MS >= self.expires_at_ms
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LoginState {
    state: String,
    code_verifier: String,
    created_at_ms: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug)]
pub struct LoginUrl {
    pub url: String,
    pub state: String,
    pub code_verifier: String,
}

#[derive(Debug, Serialize)]
pub struct OAuthStatus {
    pub has_credentials: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_expired: Option<bool>,
}

pub struct OAuthClient {
    http: Client,
    creds_path: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
    token_url: String,
    refresh_flight: Mutex<()>,
}

impl OAuthClient {
    pub fn new(http: Client) -> Self {
        let dir = app_dir();
        Self::with_paths(http, dir, OAUTH_TOKEN_URL.to_string())
    }

    pub fn with_paths(http: Client, dir: PathBuf, token_url: String) -> Self {
        Self {
            http,
            creds_path: dir.join("oauth.json"),
            state_path: dir.join("oauth_state.json"),
            lock_path: dir.join("oauth.lock"),
            token_url,
            refresh_flight: Mutex::new(()),
        }
    }

    /// Build the authorization URL and persist the PKCE login state.
    pub fn generate_login_url(&self) -> Result<LoginUrl, ProxyError> {
        let mut rng = rand::rng();
        let state_bytes: [u8; 32] = rng.random();
        let state: String = state_bytes.iter().map(|b| format!("{b:02x}")).collect();
        let verifier_bytes: [u8; 32] = rng.random();
        let code_verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

        let mut hasher = Sha256::new();
        hasher.update(code_verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        self.write_secret_file(
            &self.state_path,
            &serde_json::to_string(&LoginState {
                state: state.clone(),
                code_verifier: code_verifier.clone(),
                created_at_ms: now_ms(),
            })
            .map_err(|e| ProxyError::OAuthError(e.to_string()))?,
        )?;

        let url = format!(
            "{}?code=true&client_id={}&response_type=code&redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256&state={}",
            OAUTH_AUTHORIZE_URL,
            OAUTH_CLIENT_ID,
            urlencoding::encode(OAUTH_REDIRECT_URI),
            urlencoding::encode(OAUTH_SCOPES),
            challenge,
            state
        );

        Ok(LoginUrl {
            url,
            state,
            code_verifier,
        })
    }

    /// Exchange an authorization code for credentials. Accepts a raw code,
    /// a `code#state` fragment, a query string, or the full callback URL.
    /// The login state file is consumed by the attempt, successful or not.
    pub async fn exchange_code(&self, input: &str) -> Result<OAuthCredentials, ProxyError> {
        let login_state: LoginState = {
            let content = fs::read_to_string(&self.state_path)
                .map_err(|_| ProxyError::OAuthError("no login in progress".to_string()))?;
            // One exchange attempt per login state, success or not
            let _ = fs::remove_file(&self.state_path);
            serde_json::from_str(&content)
                .map_err(|_| ProxyError::OAuthError("login state is corrupt".to_string()))?
        };

        if now_ms().saturating_sub(login_state.created_at_ms) > LOGIN_STATE_TTL_MS {
            return Err(ProxyError::OAuthError("login state has expired".to_string()));
        }

        let (code, returned_state) = parse_callback_input(input);
        let code =
            code.ok_or_else(|| ProxyError::OAuthError("no authorization code".to_string()))?;
        match returned_state {
            Some(state) if state == login_state.state => {}
            _ => {
                return Err(ProxyError::OAuthError(
                    "state mismatch, rejecting authorization code".to_string(),
                ));
            }
        }

        let body = json!({
            "code": code,
            "state": login_state.state,
            "grant_type": "authorization_code",
            "client_id": OAUTH_CLIENT_ID,
            "redirect_uri": OAUTH_REDIRECT_URI,
            "code_verifier": login_state.code_verifier,
        });

        let creds = self.request_token(&body).await?;
        if creds.refresh_token.is_empty() {
            return Err(ProxyError::OAuthError(
                "token response missing refresh_token".to_string(),
            ));
        }
        let lock_file = self.acquire_file_lock().await;
        let saved = self.save_credentials(&creds).await;
        if let Some(file) = lock_file {
            let _ = fs2::FileExt::unlock(&file);
        }
        saved?;
        info!(token = %mask_token(&creds.access_token), "OAuth code exchanged");
        Ok(creds)
    }

    /// Refresh the given credentials. The old refresh token is reused when
    /// the response omits one.
    pub async fn refresh(&self, creds: &OAuthCredentials) -> Result<OAuthCredentials, ProxyError> {
        let body = json!({
            "grant_type": "refresh_token",
            "refresh_token": creds.refresh_token,
            "client_id": OAUTH_CLIENT_ID,
        });
        let mut refreshed = self.request_token(&body).await?;
        if refreshed.refresh_token.is_empty() {
            refreshed.refresh_token = creds.refresh_token.clone();
        }
        Ok(refreshed)
    }

    /// Load credentials and hand out the access token, refreshing first when
    /// it is inside the expiry buffer. Returns `None` when there are no
    /// credentials or the refresh fails.
    pub async fn get_valid_access_token(&self) -> Option<String> {
        let creds = self.load_credentials()?;
        if !creds.is_expired() {
            return Some(creds.access_token);
        }

        // In-process singleflight: the first caller refreshes, the rest
        // re-read what it saved.
        let _flight = self.refresh_flight.lock().await;
        if let Some(creds) = self.load_credentials()
            && !creds.is_expired()
        {
            return Some(creds.access_token);
        }

        let lock_file = self.acquire_file_lock().await;
        if lock_file.is_none() {
            warn!("OAuth lock file contended, refreshing without cross-process serialization");
        }

        // Re-read under the lock: a sibling process may have refreshed.
        let creds = self.load_credentials()?;
        if !creds.is_expired() {
            return Some(creds.access_token);
        }

        let result = match self.refresh(&creds).await {
            Ok(refreshed) => {
                if let Err(e) = self.save_credentials(&refreshed).await {
                    warn!("failed to persist refreshed credentials: {e}");
                }
                Some(refreshed.access_token)
            }
            Err(e) => {
                warn!("OAuth token refresh failed: {e}");
                None
            }
        };

        if let Some(file) = lock_file {
            let _ = fs2::FileExt::unlock(&file);
        }
        result
    }

    pub fn get_status(&self) -> OAuthStatus {
        match self.load_credentials() {
            Some(creds) => OAuthStatus {
                has_credentials: true,
                expires_at: Some(creds.expires_at_ms),
                is_expired: Some(creds.is_expired()),
            },
            None => OAuthStatus {
                has_credentials: false,
                expires_at: None,
                is_expired: None,
            },
        }
    }

    /// Destroy credentials and any pending login state.
    pub fn logout(&self) {
        let _ = fs::remove_file(&self.creds_path);
        let _ = fs::remove_file(&self.state_path);
    }

    async fn request_token(&self, body: &serde_json::Value) -> Result<OAuthCredentials, ProxyError> {
        let response = self
            .http
            .post(&self.token_url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ProxyError::OAuthError(format!(
                "token endpoint returned {status}: {text}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProxyError::OAuthError(format!("invalid token response: {e}")))?;

        if token.access_token.is_empty() {
            return Err(ProxyError::OAuthError(
                "token response missing access_token".to_string(),
            ));
        }

        Ok(OAuthCredentials {
            access_token: token.access_token,
            refresh_token: token.refresh_token.unwrap_or_default(),
            expires_at_ms: now_ms() + token.expires_in * 1000,
            scopes: token
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }

    fn load_credentials(&self) -> Option<OAuthCredentials> {
        if !self.creds_path.exists() {
            return None;
        }
        // Shared lock so a mid-refresh writer never hands us a torn file.
        // Non-blocking on purpose: the refresh path re-reads while holding
        // the exclusive lock itself, and a blocking acquire here would
        // deadlock against our own fd.
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .ok();
        let locked = lock_file
            .as_ref()
            .is_some_and(|file| fs2::FileExt::try_lock_shared(file).is_ok());

        let content = fs::read_to_string(&self.creds_path).ok();

        if locked
            && let Some(file) = &lock_file
        {
            let _ = fs2::FileExt::unlock(file);
        }

        match serde_json::from_str(&content?) {
            Ok(creds) => Some(creds),
            Err(e) => {
                warn!("credentials file is corrupt: {e}");
                None
            }
        }
    }

    async fn save_credentials(&self, creds: &OAuthCredentials) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(creds)
            .map_err(|e| ProxyError::OAuthError(e.to_string()))?;
        self.write_secret_file(&self.creds_path, &content)?;
        Ok(())
    }

    fn write_secret_file(&self, path: &PathBuf, content: &str) -> Result<(), ProxyError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
        }
        fs::write(path, content)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }

    /// Exclusive advisory lock with bounded retry. `None` when the budget is
    /// exhausted; the caller falls back to in-process-only serialization.
    async fn acquire_file_lock(&self) -> Option<fs::File> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .ok()?;
        for attempt in 0..FILE_LOCK_ATTEMPTS {
            if fs2::FileExt::try_lock_exclusive(&file).is_ok() {
                return Some(file);
            }
            let backoff =
                (FILE_LOCK_RETRY_BASE_MS * (attempt as u64 + 1)).min(FILE_LOCK_RETRY_MAX_MS);
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
        debug!("OAuth file lock not acquired after {FILE_LOCK_ATTEMPTS} attempts");
        None
    }
}

/// Split a callback input into `(code, state)`. Accepted shapes: a full
/// callback URL, a bare query string, a `code#state` fragment, or a raw
/// code (which carries no state and will fail the CSRF check).
fn parse_callback_input(input: &str) -> (Option<String>, Option<String>) {
    let input = input.trim();

    if input.contains("://")
        && let Ok(url) = url::Url::parse(input)
    {
        let mut code = None;
        let mut state = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                _ => {}
            }
        }
        return (code, state);
    }

    if input.contains('=') {
        let query = input.strip_prefix('?').unwrap_or(input);
        let mut code = None;
        let mut state = None;
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                _ => {}
            }
        }
        return (code, state);
    }

    if let Some((code, state)) = input.split_once('#') {
        let state = if state.is_empty() {
            None
        } else {
            Some(state.to_string())
        };
        return (Some(code.to_string()), state);
    }

    if input.is_empty() {
        (None, None)
    } else {
        (Some(input.to_string()), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(dir: &tempfile::TempDir, token_url: String) -> OAuthClient {
        OAuthClient::with_paths(Client::new(), dir.path().to_path_buf(), token_url)
    }

    fn write_creds(dir: &tempfile::TempDir, expires_at_ms: u64) {
        let creds = OAuthCredentials {
            access_token: "old-access".to_string(),
            refresh_token: "refresh-1".to_string(),
            expires_at_ms,
            scopes: vec!["user:inference".to_string()],
        };
        std::fs::write(
            dir.path().join("oauth.json"),
            serde_json::to_string(&creds).unwrap(),
        )
        .unwrap();
    }

    fn token_response(access: &str) -> serde_json::Value {
        json!({
            "access_token": access,
            "refresh_token": "refresh-2",
            "expires_in": 3600,
            "scope": "org:create_api_key user:profile user:inference"
        })
    }

    #[test]
    fn test_parse_callback_input_shapes() {
        assert_eq!(
            parse_callback_input("rawcode"),
            (Some("rawcode".to_string()), None)
        );
        assert_eq!(
            parse_callback_input("code123#state456"),
            (Some("code123".to_string()), Some("state456".to_string()))
        );
        assert_eq!(
            parse_callback_input("?code=c&state=s"),
            (Some("c".to_string()), Some("s".to_string()))
        );
        assert_eq!(
            parse_callback_input("https://console.anthropic.com/oauth/code/callback?code=c&state=s"),
            (Some("c".to_string()), Some("s".to_string()))
        );
        assert_eq!(parse_callback_input(""), (None, None));
    }

    #[test]
    fn test_generate_login_url_writes_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let oauth = client(&dir, "http://unused".to_string());
        let login = oauth.generate_login_url().unwrap();

        assert!(login.url.starts_with(OAUTH_AUTHORIZE_URL));
        assert!(login.url.contains("code_challenge_method=S256"));
        assert!(login.url.contains(&format!("state={}", login.state)));
        assert_eq!(login.state.len(), 64);

        let state_path = dir.path().join("oauth_state.json");
        let mode = std::fs::metadata(&state_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&state_path).unwrap()).unwrap();
        assert_eq!(saved["state"], login.state.as_str());
        assert_eq!(saved["code_verifier"], login.code_verifier.as_str());
    }

    #[tokio::test]
    async fn test_exchange_code_rejects_state_mismatch_without_http() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_response("a")))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let oauth = client(&dir, format!("{}/token", server.uri()));
        oauth.generate_login_url().unwrap();

        let result = oauth.exchange_code("?code=c&state=WRONG").await;
        assert!(result.is_err());
        assert!(!dir.path().join("oauth_state.json").exists());
    }

    #[tokio::test]
    async fn test_exchange_code_rejects_missing_state() {
        let dir = tempfile::tempdir().unwrap();
        let oauth = client(&dir, "http://unused".to_string());
        oauth.generate_login_url().unwrap();
        assert!(oauth.exchange_code("bare-code-no-state").await.is_err());
        assert!(!dir.path().join("oauth_state.json").exists());
    }

    #[tokio::test]
    async fn test_exchange_code_rejects_expired_state() {
        let dir = tempfile::tempdir().unwrap();
        let oauth = client(&dir, "http://unused".to_string());
        let login = oauth.generate_login_url().unwrap();

        let stale = LoginState {
            state: login.state.clone(),
            code_verifier: login.code_verifier.clone(),
            created_at_ms: now_ms() - LOGIN_STATE_TTL_MS - 1,
        };
        std::fs::write(
            dir.path().join("oauth_state.json"),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        let input = format!("?code=c&state={}", login.state);
        assert!(oauth.exchange_code(&input).await.is_err());
    }

    #[tokio::test]
    async fn test_exchange_code_success_persists_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_response("new-access")))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let oauth = client(&dir, format!("{}/token", server.uri()));
        let login = oauth.generate_login_url().unwrap();

        let creds = oauth
            .exchange_code(&format!("?code=c&state={}", login.state))
            .await
            .unwrap();
        assert_eq!(creds.access_token, "new-access");
        assert_eq!(creds.scopes.len(), 3);

        let mode = std::fs::metadata(dir.path().join("oauth.json"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn test_fresh_token_returned_without_http() {
        let dir = tempfile::tempdir().unwrap();
        let oauth = client(&dir, "http://localhost:9/unreachable".to_string());
        write_creds(&dir, now_ms() + TOKEN_EXPIRY_BUFFER_MS + 60_000);
        assert_eq!(
            oauth.get_valid_access_token().await.as_deref(),
            Some("old-access")
        );
    }

    #[tokio::test]
    async fn test_refresh_reuses_old_refresh_token_when_omitted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-access",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let oauth = client(&dir, format!("{}/token", server.uri()));
        let old = OAuthCredentials {
            access_token: "old".to_string(),
            refresh_token: "keep-me".to_string(),
            expires_at_ms: 0,
            scopes: vec![],
        };
        let refreshed = oauth.refresh(&old).await.unwrap();
        assert_eq!(refreshed.refresh_token, "keep-me");
        assert_eq!(refreshed.access_token, "new-access");
    }

    #[tokio::test]
    async fn test_concurrent_refresh_issues_one_http_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_response("refreshed-access"))
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let oauth = std::sync::Arc::new(client(&dir, format!("{}/token", server.uri())));
        write_creds(&dir, now_ms());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let oauth = oauth.clone();
            handles.push(tokio::spawn(
                async move { oauth.get_valid_access_token().await },
            ));
        }
        for handle in handles {
            assert_eq!(
                handle.await.unwrap().as_deref(),
                Some("refreshed-access")
            );
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let oauth = client(&dir, format!("{}/token", server.uri()));
        write_creds(&dir, now_ms());
        assert!(oauth.get_valid_access_token().await.is_none());
    }

    #[test]
    fn test_status_reports_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let oauth = client(&dir, "http://unused".to_string());
        assert!(!oauth.get_status().has_credentials);

        write_creds(&dir, now_ms() + TOKEN_EXPIRY_BUFFER_MS + 60_000);
        let status = oauth.get_status();
        assert!(status.has_credentials);
        assert_eq!(status.is_expired, Some(false));
    }
}
