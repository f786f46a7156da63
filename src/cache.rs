//! Read-through cache for provider responses.
//!
//! The backend is chosen once at startup ([`open_backend`]); callers only ever
//! see `Arc<dyn CacheBackend>`. A disabled cache is just [`NoopCache`], which
//! always misses.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use parking_lot::RwLock;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::video_id::VideoId;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Single-language caption keys cleared by `DELETE /youtube/cache/clear`.
pub const COMMON_CAPTION_LANGUAGES: [&str; 8] = ["en", "es", "fr", "de", "pt", "ja", "ko", "zh"];

pub fn metadata_key(id: &VideoId) -> String {
    format!("youtube:metadata:{id}")
}

pub fn captions_key(id: &VideoId, languages: &str) -> String {
    format!("youtube:captions:{id}:{languages}")
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// A cached payload plus the Unix time (milliseconds) it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Value,
    pub timestamp: i64,
}

impl CacheEntry {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            timestamp: now_millis(),
        }
    }

    /// Whole seconds elapsed since the entry was written.
    pub fn age_secs(&self) -> u64 {
        u64::try_from((now_millis() - self.timestamp) / 1000).unwrap_or(0)
    }
}

pub trait CacheBackend: Send + Sync {
    /// Short label reported by the stats endpoint.
    fn backend_name(&self) -> &'static str;

    fn is_enabled(&self) -> bool {
        true
    }

    /// Returns the entry unless it is missing or older than its TTL.
    fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    fn put(&self, key: &str, data: Value, ttl: Duration) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;
}

/// Cache used when none is configured.
#[derive(Debug, Default)]
pub struct NoopCache;

impl CacheBackend for NoopCache {
    fn backend_name(&self) -> &'static str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn get(&self, _key: &str) -> Result<Option<CacheEntry>> {
        Ok(None)
    }

    fn put(&self, _key: &str, _data: Value, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

struct MemorySlot {
    entry: CacheEntry,
    expires_at: i64,
}

/// Process-local cache. Contents vanish on restart.
#[derive(Default)]
pub struct MemoryCache {
    slots: RwLock<HashMap<String, MemorySlot>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

impl CacheBackend for MemoryCache {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let now = now_millis();
        {
            let slots = self.slots.read();
            match slots.get(key) {
                None => return Ok(None),
                Some(slot) if slot.expires_at > now => return Ok(Some(slot.entry.clone())),
                Some(_) => {}
            }
        }

        // Expired: evict unless a writer refreshed it in the meantime.
        let mut slots = self.slots.write();
        if slots.get(key).is_some_and(|slot| slot.expires_at <= now) {
            slots.remove(key);
        }
        Ok(None)
    }

    fn put(&self, key: &str, data: Value, ttl: Duration) -> Result<()> {
        let entry = CacheEntry::new(data);
        let expires_at = entry.timestamp.saturating_add(ttl_millis(ttl));
        self.slots
            .write()
            .insert(key.to_owned(), MemorySlot { entry, expires_at });
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.slots.write().remove(key);
        Ok(())
    }
}

/// Cache persisted in its own SQLite file so entries survive restarts.
#[derive(Debug, Clone)]
pub struct SqliteCache {
    db_path: PathBuf,
}

impl SqliteCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating cache directory {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("opening cache DB {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode for cache DB")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                written_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at
                ON cache_entries(expires_at);
            "#,
        )
        .context("creating cache schema")?;

        Ok(Self {
            db_path: path.to_path_buf(),
        })
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("opening cache DB {}", self.db_path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        f(&conn)
    }
}

impl CacheBackend for SqliteCache {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let now = now_millis();
        self.with_connection(|conn| {
            let row: Option<(String, i64, i64)> = conn
                .query_row(
                    "SELECT payload, written_at, expires_at FROM cache_entries WHERE key = ?1",
                    [key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let Some((payload, written_at, expires_at)) = row else {
                return Ok(None);
            };
            if expires_at <= now {
                conn.execute(
                    "DELETE FROM cache_entries WHERE key = ?1 AND expires_at <= ?2",
                    params![key, now],
                )?;
                return Ok(None);
            }

            let data: Value =
                serde_json::from_str(&payload).context("parsing cached payload JSON")?;
            Ok(Some(CacheEntry {
                data,
                timestamp: written_at,
            }))
        })
    }

    fn put(&self, key: &str, data: Value, ttl: Duration) -> Result<()> {
        let entry = CacheEntry::new(data);
        let payload = serde_json::to_string(&entry.data).context("serializing cache payload")?;
        let expires_at = entry.timestamp.saturating_add(ttl_millis(ttl));

        self.with_connection(|conn| {
            conn.execute(
                r#"
                INSERT INTO cache_entries (key, payload, written_at, expires_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(key) DO UPDATE SET
                    payload = excluded.payload,
                    written_at = excluded.written_at,
                    expires_at = excluded.expires_at
                "#,
                params![key, payload, entry.timestamp, expires_at],
            )?;
            conn.execute(
                "DELETE FROM cache_entries WHERE expires_at <= ?1",
                [entry.timestamp],
            )?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM cache_entries WHERE key = ?1", [key])?;
            Ok(())
        })
    }
}

/// Which backend `open_backend` should build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Disabled,
    Memory,
    Sqlite,
}

impl FromStr for CacheKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" | "disabled" => Ok(Self::Disabled),
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => bail!("unknown cache backend {other:?} (expected none, memory or sqlite)"),
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disabled => "none",
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
        })
    }
}

pub fn open_backend(kind: CacheKind, sqlite_path: &Path) -> Result<Arc<dyn CacheBackend>> {
    Ok(match kind {
        CacheKind::Disabled => Arc::new(NoopCache),
        CacheKind::Memory => Arc::new(MemoryCache::new()),
        CacheKind::Sqlite => Arc::new(SqliteCache::open(sqlite_path)?),
    })
}
