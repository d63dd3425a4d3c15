//! File-backed cache of an OAuth access token published by a peer process.
//!
//! This system only ever reads the file; the single mutation it performs is
//! deleting it when the contents are stale. Reads take a shared advisory
//! lock with a short bounded retry so a concurrent writer never hands us a
//! torn token. Every failure degrades to `None` (fail-closed).

use std::fs::{self, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::app_dir;
use crate::constants::SHARED_TOKEN_MAX_AGE_MS;
use crate::context::mask_token;
use crate::util::now_ms;

const LOCK_ATTEMPTS: u32 = 3;
const LOCK_RETRY_BASE_MS: u64 = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SharedToken {
    pub access_token: String,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SharedTokenFile {
    token: SharedToken,
    timestamp_ms: u64,
    source: String,
}

pub struct SharedTokenStore {
    path: PathBuf,
}

impl SharedTokenStore {
    pub fn new() -> Self {
        Self {
            path: app_dir().join("shared-oauth-token.json"),
        }
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read the peer-published token. `None` on any failure: missing file,
    /// malformed JSON, stale contents, unenforceable permissions, or a lock
    /// that stays contended past the retry budget.
    pub async fn get(&self) -> Option<SharedToken> {
        if !self.path.exists() {
            return None;
        }
        if !self.enforce_permissions() {
            return None;
        }

        let content = self.read_locked().await?;

        let parsed: SharedTokenFile = match serde_json::from_str(&content) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("shared token file is malformed, removing: {e}");
                self.clear();
                return None;
            }
        };

        if let Some(reason) = staleness(&parsed) {
            debug!("shared token is stale ({reason}), removing");
            self.clear();
            return None;
        }

        debug!(
            token = %mask_token(&parsed.token.access_token),
            source = %parsed.source,
            "shared token loaded"
        );
        Some(parsed.token)
    }

    /// Publish a token: parent dir 0700, file 0600, written under the
    /// exclusive lock readers contend on.
    pub async fn put(&self, token: &SharedToken, source: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;

        let mut locked = false;
        for attempt in 0..LOCK_ATTEMPTS {
            if fs2::FileExt::try_lock_exclusive(&file).is_ok() {
                locked = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(
                LOCK_RETRY_BASE_MS * (attempt as u64 + 1),
            ))
            .await;
        }
        if !locked {
            return Err(std::io::Error::other("shared token file lock contended"));
        }

        let payload = SharedTokenFile {
            token: token.clone(),
            timestamp_ms: now_ms(),
            source: source.to_string(),
        };
        let content = serde_json::to_string_pretty(&payload)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        file.set_len(0)?;
        std::io::Write::write_all(&mut &file, content.as_bytes())?;
        let _ = fs2::FileExt::unlock(&file);
        Ok(())
    }

    /// Unlink the file; a missing file is success.
    pub fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove shared token file: {e}"),
        }
    }

    /// chmod-on-mismatch; a chmod failure rejects the token.
    fn enforce_permissions(&self) -> bool {
        let metadata = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(_) => return false,
        };
        if metadata.permissions().mode() & 0o777 == 0o600 {
            return true;
        }
        match fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600)) {
            Ok(()) => true,
            Err(e) => {
                warn!("cannot restrict shared token file permissions: {e}");
                false
            }
        }
    }

    async fn read_locked(&self) -> Option<String> {
        let file = OpenOptions::new().read(true).open(&self.path).ok()?;
        for attempt in 0..LOCK_ATTEMPTS {
            if fs2::FileExt::try_lock_shared(&file).is_ok() {
                let content = fs::read_to_string(&self.path).ok();
                let _ = fs2::FileExt::unlock(&file);
                return content;
            }
            tokio::time::sleep(Duration::from_millis(
                LOCK_RETRY_BASE_MS * (attempt as u64 + 1),
            ))
            .await;
        }
        debug!("shared token file lock contended, skipping read");
        None
    }
}

impl Default for SharedTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

fn staleness(parsed: &SharedTokenFile) -> Option<&'static str> {
    let now = now_ms();
    if parsed.token.access_token.trim().is_empty() {
        return Some("empty access token");
    }
    if now.saturating_sub(parsed.timestamp_ms) > SHARED_TOKEN_MAX_AGE_MS {
        return Some("older than the wall-age limit");
    }
    if let Some(expires_at) = parsed.token.expires_at
        && expires_at <= now
    {
        return Some("past expires_at");
    }
    None
}
