//! SQLite persistence for collections.

use crate::error::{FalconError, Result};
use crate::site::{ItemRef, SearchResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// A named, ordered list of item references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub items: Vec<ItemRef>,
}

/// Collection listing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSummary {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub item_count: usize,
}

/// Favorites database handle.
pub struct FavoritesStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for FavoritesStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FavoritesStore").finish_non_exhaustive()
    }
}

impl FavoritesStore {
    /// Open or create the favorites database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FalconError::io_with_path(e, parent))?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self::with_connection(conn)?;
        info!("Opened favorites database at {}", db_path.display());
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS collections (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                seq INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS collection_items (
                collection_id TEXT NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
                site_id TEXT NOT NULL,
                item_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                added_at TEXT NOT NULL,
                PRIMARY KEY (collection_id, site_id, item_id)
            );

            CREATE INDEX IF NOT EXISTS idx_collection_items_item
                ON collection_items(site_id, item_id);

            -- Every item reference ever returned by a search
            CREATE TABLE IF NOT EXISTS observed_items (
                site_id TEXT NOT NULL,
                item_id TEXT NOT NULL,
                first_seen_at TEXT NOT NULL,
                PRIMARY KEY (site_id, item_id)
            );

            CREATE TABLE IF NOT EXISTS search_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                site_id TEXT NOT NULL,
                tags TEXT NOT NULL,
                searched_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_search_history_site
                ON search_history(site_id, id);
            "#,
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| FalconError::Database {
            message: "favorites connection poisoned".to_string(),
        })
    }

    /// Remember that these items were returned by a site.
    pub fn record_observed(&self, results: &[SearchResult]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO observed_items (site_id, item_id, first_seen_at) VALUES (?1, ?2, ?3)",
            )?;
            for result in results {
                stmt.execute(params![result.site_id, result.item_id, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn is_observed(&self, item: &ItemRef) -> Result<bool> {
        let conn = self.lock()?;
        Ok(exists(
            &conn,
            "SELECT 1 FROM observed_items WHERE site_id = ?1 AND item_id = ?2",
            params![item.site_id, item.item_id],
        )?)
    }

    /// Create an empty collection. Names need not be unique.
    pub fn create_collection(&self, name: &str) -> Result<String> {
        let name = validate_name(name)?;
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.lock()?;
        insert_collection(&conn, &id, name, Utc::now())?;
        debug!("Created collection {} ({})", name, id);
        Ok(id)
    }

    pub fn rename_collection(&self, collection_id: &str, name: &str) -> Result<()> {
        let name = validate_name(name)?;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE collections SET name = ?1 WHERE id = ?2",
            params![name, collection_id],
        )?;
        if changed == 0 {
            return Err(FalconError::CollectionNotFound(collection_id.to_string()));
        }
        Ok(())
    }

    /// Delete a collection and its item references.
    pub fn delete_collection(&self, collection_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM collections WHERE id = ?1", params![collection_id])?;
        if changed == 0 {
            return Err(FalconError::CollectionNotFound(collection_id.to_string()));
        }
        info!("Deleted collection {}", collection_id);
        Ok(())
    }

    /// All collections in creation order.
    pub fn collections(&self) -> Result<Vec<CollectionSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT c.id, c.name, c.created_at,
                   (SELECT COUNT(*) FROM collection_items i WHERE i.collection_id = c.id)
            FROM collections c
            ORDER BY c.seq
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CollectionSummary {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: parse_time(&row.get::<_, String>(2)?),
                item_count: row.get::<_, i64>(3)? as usize,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// One collection with its items in insertion order.
    pub fn collection(&self, collection_id: &str) -> Result<Collection> {
        let conn = self.lock()?;
        load_collection(&conn, collection_id)
    }

    /// Add `item` to a collection. Returns `false` if it was already there.
    ///
    /// Fails with [`FalconError::UnknownItem`] for references never observed
    /// in a search result.
    pub fn add_favorite(&self, collection_id: &str, item: &ItemRef) -> Result<bool> {
        let conn = self.lock()?;
        require_collection(&conn, collection_id)?;
        if !exists(
            &conn,
            "SELECT 1 FROM observed_items WHERE site_id = ?1 AND item_id = ?2",
            params![item.site_id, item.item_id],
        )? {
            return Err(FalconError::UnknownItem {
                site_id: item.site_id.clone(),
                item_id: item.item_id.clone(),
            });
        }
        let added = append_item(&conn, collection_id, item)?;
        if added {
            debug!("Favorited {} in {}", item, collection_id);
        }
        Ok(added)
    }

    /// Remove `item` from a collection. Returns `false` if it was absent.
    pub fn remove_favorite(&self, collection_id: &str, item: &ItemRef) -> Result<bool> {
        let conn = self.lock()?;
        require_collection(&conn, collection_id)?;
        let removed = conn.execute(
            "DELETE FROM collection_items WHERE collection_id = ?1 AND site_id = ?2 AND item_id = ?3",
            params![collection_id, item.site_id, item.item_id],
        )?;
        Ok(removed > 0)
    }

    /// Whether `item` is in any collection.
    pub fn is_favorited(&self, item: &ItemRef) -> Result<bool> {
        let conn = self.lock()?;
        Ok(exists(
            &conn,
            "SELECT 1 FROM collection_items WHERE site_id = ?1 AND item_id = ?2",
            params![item.site_id, item.item_id],
        )?)
    }
}

fn validate_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(FalconError::Validation {
            field: "name".to_string(),
            message: "collection name must not be empty".to_string(),
        });
    }
    Ok(trimmed)
}

fn exists(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> rusqlite::Result<bool> {
    Ok(conn.query_row(sql, params, |_| Ok(())).optional()?.is_some())
}

fn require_collection(conn: &Connection, collection_id: &str) -> Result<()> {
    if exists(conn, "SELECT 1 FROM collections WHERE id = ?1", params![collection_id])? {
        Ok(())
    } else {
        Err(FalconError::CollectionNotFound(collection_id.to_string()))
    }
}

pub(crate) fn insert_collection(conn: &Connection, id: &str, name: &str, created_at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO collections (id, name, created_at, seq)
        VALUES (?1, ?2, ?3, (SELECT COALESCE(MAX(seq), 0) + 1 FROM collections))
        "#,
        params![id, name, created_at.to_rfc3339()],
    )?;
    Ok(())
}

/// Append at the end of the collection; no-op if already present.
pub(crate) fn append_item(conn: &Connection, collection_id: &str, item: &ItemRef) -> Result<bool> {
    let inserted = conn.execute(
        r#"
        INSERT OR IGNORE INTO collection_items (collection_id, site_id, item_id, position, added_at)
        VALUES (?1, ?2, ?3,
                (SELECT COALESCE(MAX(position), 0) + 1 FROM collection_items WHERE collection_id = ?1),
                ?4)
        "#,
        params![collection_id, item.site_id, item.item_id, Utc::now().to_rfc3339()],
    )?;
    Ok(inserted > 0)
}

pub(crate) fn load_collection(conn: &Connection, collection_id: &str) -> Result<Collection> {
    let header = conn
        .query_row(
            "SELECT name, created_at FROM collections WHERE id = ?1",
            params![collection_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    let Some((name, created_at)) = header else {
        return Err(FalconError::CollectionNotFound(collection_id.to_string()));
    };

    let mut stmt = conn.prepare_cached(
        "SELECT site_id, item_id FROM collection_items WHERE collection_id = ?1 ORDER BY position",
    )?;
    let items = stmt
        .query_map(params![collection_id], |row| {
            Ok(ItemRef::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Collection {
        id: collection_id.to_string(),
        name,
        created_at: parse_time(&created_at),
        items,
    })
}

pub(crate) fn collection_ids(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM collections ORDER BY seq")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub(crate) fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
