//! SQLite-backed reply cache.
//!
//! Epistemic foundation:
//! - K_i: Key = SHA-256 of (source id, prompt); deterministic and collision-resistant
//! - K_i: Every operation is a single keyed statement → no multi-step transactions
//! - B_i: Entries are fresh until `expires_at` → expired rows are removed lazily on read or by sweep
//! - I^B: The database file may be unreadable → Result, callers run uncached

use crate::models::{AugurError, CacheConfig, RawReply, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS reply_cache (
        key TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        prompt_hash TEXT NOT NULL,
        reply TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_reply_cache_expires ON reply_cache(expires_at);
    CREATE INDEX IF NOT EXISTS idx_reply_cache_source ON reply_cache(source_id);
    CREATE INDEX IF NOT EXISTS idx_reply_cache_prompt ON reply_cache(prompt_hash);
";

/// Length of the prompt fingerprint stored for `similar` lookups.
const PROMPT_HASH_LEN: usize = 16;

/// Cache key for a (source, prompt) pair.
///
/// The source id is length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
pub fn cache_key(source_id: &str, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((source_id.len() as u64).to_le_bytes());
    hasher.update(source_id.as_bytes());
    hasher.update(prompt.as_bytes());
    hex::encode(hasher.finalize())
}

fn prompt_hash(prompt: &str) -> String {
    let digest = hex::encode(Sha256::digest(prompt.as_bytes()));
    digest[..PROMPT_HASH_LEN].to_string()
}

/// Cache occupancy summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub active_entries: usize,
    pub expired_entries: usize,
    /// Active entries per source
    pub sources: BTreeMap<String, usize>,
    pub database_bytes: u64,
}

/// A cached reply for a prompt, from any source.
#[derive(Debug, Clone)]
pub struct CachedReply {
    pub source_id: String,
    pub reply: RawReply,
    pub created_at: i64,
}

/// Persistent reply cache shared by all queries of a batch.
pub struct ReplyStore {
    conn: Mutex<Connection>,
    ttl: Duration,
}

impl ReplyStore {
    /// Open (or create) the cache database at `path`.
    pub fn open(path: &Path, ttl: Duration) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| AugurError::io(format!("creating {}", parent.display()), e))?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, ttl)
    }

    /// Cache living only as long as this value.
    pub fn in_memory(ttl: Duration) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, ttl)
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        Self::open(&config.path, Duration::from_secs(config.ttl_hours * 3600))
    }

    fn with_connection(conn: Connection, ttl: Duration) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            ttl,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AugurError::Internal("reply cache lock poisoned".to_string()))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh cached reply for (source, prompt). Expired entries are deleted.
    pub fn get(&self, source_id: &str, prompt: &str) -> Result<Option<RawReply>> {
        let key = cache_key(source_id, prompt);
        let conn = self.conn()?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT reply, expires_at FROM reply_cache WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((reply, expires_at)) = row else {
            return Ok(None);
        };
        if expires_at <= Utc::now().timestamp() {
            conn.execute("DELETE FROM reply_cache WHERE key = ?1", params![key])?;
            debug!(source = source_id, "Dropped expired cache entry");
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&reply)?))
    }

    /// Store a reply with the default TTL.
    pub fn put(&self, source_id: &str, prompt: &str, reply: &RawReply) -> Result<()> {
        self.put_with_ttl(source_id, prompt, reply, self.ttl)
    }

    pub fn put_with_ttl(
        &self,
        source_id: &str,
        prompt: &str,
        reply: &RawReply,
        ttl: Duration,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let expires_at = now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX));
        let json = serde_json::to_string(reply)?;

        self.conn()?.execute(
            "INSERT OR REPLACE INTO reply_cache
                 (key, source_id, prompt_hash, reply, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                cache_key(source_id, prompt),
                source_id,
                prompt_hash(prompt),
                json,
                now,
                expires_at
            ],
        )?;
        Ok(())
    }

    /// Delete every expired entry. Returns the number removed.
    pub fn sweep_expired(&self) -> Result<usize> {
        let removed = self.conn()?.execute(
            "DELETE FROM reply_cache WHERE expires_at <= ?1",
            params![Utc::now().timestamp()],
        )?;
        if removed > 0 {
            info!(removed, "Swept expired cache entries");
        }
        Ok(removed)
    }

    /// Fresh replies to the same prompt from any source, newest first.
    pub fn similar(&self, prompt: &str) -> Result<Vec<CachedReply>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT source_id, reply, created_at FROM reply_cache
             WHERE prompt_hash = ?1 AND expires_at > ?2
             ORDER BY created_at DESC, source_id",
        )?;
        let rows = stmt.query_map(params![prompt_hash(prompt), Utc::now().timestamp()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (source_id, reply, created_at) = row?;
            out.push(CachedReply {
                source_id,
                reply: serde_json::from_str(&reply)?,
                created_at,
            });
        }
        Ok(out)
    }

    pub fn statistics(&self) -> Result<CacheStats> {
        let conn = self.conn()?;
        let now = Utc::now().timestamp();

        let (total, active): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN expires_at > ?1 THEN 1 ELSE 0 END), 0)
             FROM reply_cache",
            params![now],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stmt = conn.prepare(
            "SELECT source_id, COUNT(*) FROM reply_cache WHERE expires_at > ?1 GROUP BY source_id",
        )?;
        let sources = stmt
            .query_map(params![now], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;

        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        Ok(CacheStats {
            total_entries: total as usize,
            active_entries: active as usize,
            expired_entries: (total - active) as usize,
            sources,
            database_bytes: (page_count * page_size).max(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

    #[test]
    fn test_key_is_deterministic_and_separates_fields() {
        assert_eq!(cache_key("a/model", "prompt"), cache_key("a/model", "prompt"));
        assert_ne!(cache_key("ab", "c"), cache_key("a", "bc"));
        assert_ne!(cache_key("a/model", "prompt"), cache_key("b/model", "prompt"));
        assert_eq!(cache_key("x", "y").len(), 64);
    }

    #[test]
    fn test_put_get_round_trip_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/replies.db");
        let reply = RawReply::text("PROGNOSE: 42%");

        {
            let store = ReplyStore::open(&path, WEEK).unwrap();
            assert!(store.get("a/model", "Will it rain?").unwrap().is_none());
            store.put("a/model", "Will it rain?", &reply).unwrap();
        }

        let store = ReplyStore::open(&path, WEEK).unwrap();
        assert_eq!(store.get("a/model", "Will it rain?").unwrap(), Some(reply));
        assert!(store.get("a/model", "Will it snow?").unwrap().is_none());
        assert!(store.get("b/model", "Will it rain?").unwrap().is_none());
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let store = ReplyStore::in_memory(WEEK).unwrap();
        store
            .put_with_ttl("old", "p", &RawReply::text("stale"), Duration::ZERO)
            .unwrap();
        store.put("fresh", "p", &RawReply::text("ok")).unwrap();

        let stats = store.statistics().unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.active_entries, 1);
        assert_eq!(stats.expired_entries, 1);

        assert!(store.get("old", "p").unwrap().is_none());
        assert_eq!(store.statistics().unwrap().total_entries, 1);
    }

    #[test]
    fn test_sweep_expired() {
        let store = ReplyStore::in_memory(WEEK).unwrap();
        for source in ["a", "b", "c"] {
            store
                .put_with_ttl(source, "p", &RawReply::text("x"), Duration::ZERO)
                .unwrap();
        }
        store.put("d", "p", &RawReply::text("x")).unwrap();

        assert_eq!(store.sweep_expired().unwrap(), 3);
        assert_eq!(store.sweep_expired().unwrap(), 0);
        assert_eq!(store.statistics().unwrap().total_entries, 1);
    }

    #[test]
    fn test_similar_and_statistics() {
        let store = ReplyStore::in_memory(WEEK).unwrap();
        store.put("a/model", "question", &RawReply::text("PROGNOSE: 30%")).unwrap();
        store.put("b/model", "question", &RawReply::text("PROGNOSE: 35%")).unwrap();
        store.put("a/model", "other", &RawReply::text("PROGNOSE: 90%")).unwrap();

        let similar = store.similar("question").unwrap();
        let mut sources: Vec<&str> = similar.iter().map(|c| c.source_id.as_str()).collect();
        sources.sort_unstable();
        assert_eq!(sources, vec!["a/model", "b/model"]);

        let stats = store.statistics().unwrap();
        assert_eq!(stats.active_entries, 3);
        assert_eq!(stats.sources["a/model"], 2);
        assert!(stats.database_bytes > 0);
    }

    #[test]
    fn test_put_replaces_existing() {
        let store = ReplyStore::in_memory(WEEK).unwrap();
        store.put("a", "p", &RawReply::text("first")).unwrap();
        store.put("a", "p", &RawReply::text("second")).unwrap();
        assert_eq!(
            store.get("a", "p").unwrap().and_then(|r| r.text).as_deref(),
            Some("second")
        );
        assert_eq!(store.statistics().unwrap().total_entries, 1);
    }
}
