//! SQLite-backed blob tier.
//!
//! Blobs survive restarts and are bounded by total bytes. Recency is a
//! monotonic access sequence stored per row; eviction removes the lowest
//! sequences until the new blob fits, and runs in the same transaction as
//! the insert so the database never holds more than the capacity.

use super::key::CacheKey;
use super::types::{CacheEntry, Payload, TierStats};
use crate::error::{FalconError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

struct State {
    conn: Connection,
    stats: TierStats,
    next_seq: i64,
}

pub(crate) struct BlobTier {
    state: Mutex<State>,
    capacity: u64,
    ttl: Option<Duration>,
}

impl std::fmt::Debug for BlobTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobTier")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

impl BlobTier {
    /// Open or create the blob database at `db_path`.
    pub fn open(db_path: &Path, capacity: u64, ttl: Option<Duration>) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FalconError::io_with_path(e, parent))?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn, capacity, ttl)
    }

    /// Blob tier backed by an in-memory database.
    pub fn in_memory(capacity: u64, ttl: Option<Duration>) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, capacity, ttl)
    }

    fn with_connection(conn: Connection, capacity: u64, ttl: Option<Duration>) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS blobs (
                key TEXT PRIMARY KEY,
                site_id TEXT NOT NULL,
                item_id TEXT NOT NULL,
                variant TEXT NOT NULL,
                data BLOB NOT NULL,
                sha256 TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                last_access_at TEXT NOT NULL,
                access_seq INTEGER NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0
            );

            -- LRU eviction order
            CREATE INDEX IF NOT EXISTS idx_blobs_access ON blobs(access_seq);

            -- Per-site invalidation
            CREATE INDEX IF NOT EXISTS idx_blobs_site ON blobs(site_id);
            "#,
        )?;

        let next_seq: i64 = conn.query_row("SELECT COALESCE(MAX(access_seq), 0) + 1 FROM blobs", [], |row| row.get(0))?;

        let tier = Self {
            state: Mutex::new(State {
                conn,
                stats: TierStats {
                    capacity,
                    ..TierStats::default()
                },
                next_seq,
            }),
            capacity,
            ttl,
        };

        {
            let mut state = tier.lock()?;
            // A lowered capacity takes effect at open.
            let trimmed = evict_until(&mut state, capacity)?;
            if trimmed > 0 {
                info!("Trimmed {} blob(s) to fit capacity {}", trimmed, capacity);
            }
            refresh_totals(&mut state)?;
        }

        Ok(tier)
    }

    /// Counted lookup; on hit bumps recency and hit count.
    pub fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let mut state = self.lock()?;
        let found = self.lookup(&mut state, key)?;
        match &found {
            Some(_) => state.stats.hits += 1,
            None => state.stats.misses += 1,
        }
        Ok(found)
    }

    /// Lookup that leaves the hit and miss counters alone.
    pub fn find(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let mut state = self.lock()?;
        self.lookup(&mut state, key)
    }

    pub fn record_coalesced(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.stats.misses += 1;
        state.stats.coalesced += 1;
        Ok(())
    }

    /// Store a blob whose digest was computed by the caller.
    ///
    /// Returns the entry and whether it was persisted; blobs larger than the
    /// whole tier are handed back without being stored.
    pub fn put(&self, key: &CacheKey, data: Bytes, sha256: &str) -> Result<(CacheEntry, bool)> {
        let entry = CacheEntry::new(key.clone(), Payload::Blob(data.clone()), self.ttl);
        let size = data.len() as u64;
        if size > self.capacity {
            debug!("Blob {} ({} bytes) exceeds cache capacity, not cached", key, size);
            return Ok((entry, false));
        }

        let mut state = self.lock()?;
        let seq = state.next_seq;
        let now = entry.created_at.to_rfc3339();

        let tx = state.conn.transaction()?;
        let existing: u64 = tx
            .query_row("SELECT size_bytes FROM blobs WHERE key = ?1", params![key.digest()], |row| {
                row.get::<_, i64>(0)
            })
            .optional()?
            .unwrap_or(0) as u64;
        let mut total = total_size(&tx)?.saturating_sub(existing);

        let evicted = evict_lru(&tx, &mut total, self.capacity - size, key.digest())?;

        tx.execute(
            r#"
            INSERT OR REPLACE INTO blobs
            (key, site_id, item_id, variant, data, sha256, size_bytes, created_at, last_access_at, access_seq, hit_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9, 0)
            "#,
            params![
                key.digest(),
                key.site_id,
                key.item_id,
                key.variant.as_str(),
                data.as_ref(),
                sha256,
                size as i64,
                now,
                seq,
            ],
        )?;
        tx.commit()?;

        state.next_seq += 1;
        state.stats.eviction_count += evicted;
        state.stats.current_size = total + size;
        refresh_entry_count(&mut state)?;
        if evicted > 0 {
            debug!("Evicted {} blob(s) to store {}", evicted, key);
        }
        Ok((entry, true))
    }

    pub fn remove(&self, key: &CacheKey) -> Result<bool> {
        let mut state = self.lock()?;
        let deleted = state.conn.execute("DELETE FROM blobs WHERE key = ?1", params![key.digest()])?;
        refresh_totals(&mut state)?;
        Ok(deleted > 0)
    }

    pub fn remove_site(&self, site_id: &str) -> Result<usize> {
        let mut state = self.lock()?;
        let deleted = state.conn.execute("DELETE FROM blobs WHERE site_id = ?1", params![site_id])?;
        refresh_totals(&mut state)?;
        Ok(deleted)
    }

    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.conn.execute("DELETE FROM blobs", [])?;
        refresh_totals(&mut state)?;
        Ok(())
    }

    pub fn stats(&self) -> TierStats {
        self.lock().map(|state| state.stats).unwrap_or_default()
    }

    fn lookup(&self, state: &mut State, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let row: Option<(Vec<u8>, i64, String, i64)> = state
            .conn
            .query_row(
                "SELECT data, size_bytes, created_at, hit_count FROM blobs WHERE key = ?1",
                params![key.digest()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((data, size_bytes, created_at, hit_count)) = row else {
            return Ok(None);
        };

        let now = Utc::now();
        let created_at = parse_time(&created_at, now);
        let mut entry = CacheEntry {
            key: key.clone(),
            payload: Payload::Blob(Bytes::from(data)),
            size_bytes: size_bytes as u64,
            created_at,
            last_access_at: now,
            hit_count: hit_count as u64,
            ttl: self.ttl,
        };

        if entry.is_expired_at(now) {
            state.conn.execute("DELETE FROM blobs WHERE key = ?1", params![key.digest()])?;
            refresh_totals(state)?;
            return Ok(None);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.conn.execute(
            "UPDATE blobs SET access_seq = ?1, last_access_at = ?2, hit_count = hit_count + 1 WHERE key = ?3",
            params![seq, now.to_rfc3339(), key.digest()],
        )?;
        entry.hit_count += 1;
        Ok(Some(entry))
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| FalconError::Other("blob cache lock poisoned".to_string()))
    }

    /// Hold the tier lock for `hold`, as a slow disk would. Signals `locked`
    /// once the lock is taken.
    #[cfg(test)]
    pub(super) fn stall(&self, hold: std::time::Duration, locked: std::sync::mpsc::Sender<()>) {
        let _state = self.lock();
        let _ = locked.send(());
        std::thread::sleep(hold);
    }
}

/// Delete least recently used rows until the total is at most `limit`.
fn evict_until(state: &mut State, limit: u64) -> Result<u64> {
    let tx = state.conn.transaction()?;
    let mut total = total_size(&tx)?;
    let evicted = evict_lru(&tx, &mut total, limit, "")?;
    tx.commit()?;
    state.stats.eviction_count += evicted;
    Ok(evicted)
}

/// Evict by ascending access sequence inside `tx` until `total <= target`,
/// never touching `keep`.
fn evict_lru(tx: &Transaction<'_>, total: &mut u64, target: u64, keep: &str) -> Result<u64> {
    let mut evicted = 0;
    while *total > target {
        let victim: Option<(String, i64)> = tx
            .query_row(
                "SELECT key, size_bytes FROM blobs WHERE key != ?1 ORDER BY access_seq ASC LIMIT 1",
                params![keep],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((victim_key, victim_size)) = victim else {
            break;
        };
        tx.execute("DELETE FROM blobs WHERE key = ?1", params![victim_key])?;
        *total = total.saturating_sub(victim_size as u64);
        evicted += 1;
    }
    Ok(evicted)
}

fn total_size(conn: &Connection) -> Result<u64> {
    let total: i64 = conn.query_row("SELECT COALESCE(SUM(size_bytes), 0) FROM blobs", [], |row| row.get(0))?;
    Ok(total as u64)
}

fn refresh_totals(state: &mut State) -> Result<()> {
    let (count, size): (i64, i64) = state.conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM blobs",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    state.stats.entries = count as u64;
    state.stats.current_size = size as u64;
    Ok(())
}

fn refresh_entry_count(state: &mut State) -> Result<()> {
    let count: i64 = state.conn.query_row("SELECT COUNT(*) FROM blobs", [], |row| row.get(0))?;
    state.stats.entries = count as u64;
    Ok(())
}

fn parse_time(value: &str, fallback: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(fallback)
}
