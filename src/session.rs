//! Session-scoped caches: last-observed upstream usage (long-context rule)
//! and session→project directory resolution.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use crate::constants::{SESSION_PROJECT_CAPACITY, SESSION_PROJECT_TTL, SESSION_USAGE_CAPACITY};

/// Extract the session id from `metadata.user_id`: everything after the
/// first `_session_`.
pub fn session_id_from_user_id(user_id: &str) -> Option<String> {
    user_id
        .split_once("_session_")
        .map(|(_, sid)| sid.to_string())
        .filter(|sid| !sid.is_empty())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Bounded LRU of session-id → last-observed upstream usage counters.
/// Both `get` and `put` refresh recency.
pub struct SessionUsageCache {
    inner: Mutex<LruCache<String, SessionUsage>>,
}

impl SessionUsageCache {
    pub fn new() -> Self {
        Self::with_capacity(SESSION_USAGE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionUsage> {
        self.inner.lock().await.get(session_id).copied()
    }

    pub async fn put(&self, session_id: &str, usage: SessionUsage) {
        self.inner.lock().await.put(session_id.to_string(), usage);
    }
}

impl Default for SessionUsageCache {
    fn default() -> Self {
        Self::new()
    }
}

struct ProjectEntry {
    dir: Option<PathBuf>,
    cached_at: Instant,
}

/// Resolves a session id to its project directory by probing the on-disk
/// Claude Code layout: `~/.claude/projects/<encoded-dir>/<session-id>.jsonl`.
/// Misses are cached as `None` so the filesystem is not re-scanned on every
/// request.
pub struct SessionProjectResolver {
    projects_root: PathBuf,
    ttl: Duration,
    cache: Mutex<LruCache<String, ProjectEntry>>,
}

impl SessionProjectResolver {
    pub fn new() -> Self {
        let root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude")
            .join("projects");
        Self::with_root(root, SESSION_PROJECT_TTL)
    }

    pub fn with_root(projects_root: PathBuf, ttl: Duration) -> Self {
        Self {
            projects_root,
            ttl,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(SESSION_PROJECT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub async fn resolve(&self, session_id: &str) -> Option<PathBuf> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(entry) = cache.get(session_id) {
                if entry.cached_at.elapsed() < self.ttl {
                    return entry.dir.clone();
                }
                cache.pop(session_id);
            }
        }

        let dir = self.probe(session_id).await;
        debug!(session_id, found = dir.is_some(), "session project probe");
        self.cache.lock().await.put(
            session_id.to_string(),
            ProjectEntry {
                dir: dir.clone(),
                cached_at: Instant::now(),
            },
        );
        dir
    }

    async fn probe(&self, session_id: &str) -> Option<PathBuf> {
        let filename = format!("{session_id}.jsonl");
        let mut entries = tokio::fs::read_dir(&self.projects_root).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let candidate = entry.path().join(&filename);
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                let encoded = entry.file_name();
                return Some(decode_project_dir(&encoded.to_string_lossy()));
            }
        }
        None
    }
}

impl Default for SessionProjectResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode an encoded project directory name (`-Users-foo-my-project`) into a
/// filesystem path, treating every `-` as a separator. Hyphenated directory
/// names are ambiguous under this scheme; best effort is enough here.
fn decode_project_dir(encoded: &str) -> PathBuf {
    let name = encoded.strip_prefix('-').unwrap_or(encoded);
    let mut path = PathBuf::from(Path::new("/"));
    for segment in name.split('-').filter(|s| !s.is_empty()) {
        path.push(segment);
    }
    path
}
