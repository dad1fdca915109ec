//! Search history, kept alongside favorites.

use super::store::{parse_time, FavoritesStore};
use crate::error::Result;
use crate::site::SearchQuery;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

const MAX_HISTORY_ROWS: i64 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHistoryEntry {
    pub site_id: String,
    pub tags: String,
    pub searched_at: DateTime<Utc>,
}

impl FavoritesStore {
    /// Record a search. Repeating a search moves it to the top instead of
    /// adding a duplicate row.
    pub fn record_search(&self, query: &SearchQuery) -> Result<()> {
        let tags = query.tag_string();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM search_history WHERE site_id = ?1 AND tags = ?2",
            params![query.site_id, tags],
        )?;
        tx.execute(
            "INSERT INTO search_history (site_id, tags, searched_at) VALUES (?1, ?2, ?3)",
            params![query.site_id, tags, Utc::now().to_rfc3339()],
        )?;
        tx.execute(
            r#"
            DELETE FROM search_history WHERE id NOT IN (
                SELECT id FROM search_history ORDER BY id DESC LIMIT ?1
            )
            "#,
            params![MAX_HISTORY_ROWS],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Most recent searches first, optionally for one site.
    pub fn search_history(&self, site_id: Option<&str>, limit: usize) -> Result<Vec<SearchHistoryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT site_id, tags, searched_at FROM search_history
            WHERE ?1 IS NULL OR site_id = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![site_id, limit as i64], |row| {
            Ok(SearchHistoryEntry {
                site_id: row.get(0)?,
                tags: row.get(1)?,
                searched_at: parse_time(&row.get::<_, String>(2)?),
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Clear history for one site, or all of it. Returns rows removed.
    pub fn clear_search_history(&self, site_id: Option<&str>) -> Result<usize> {
        let conn = self.lock()?;
        let removed = match site_id {
            Some(site) => conn.execute("DELETE FROM search_history WHERE site_id = ?1", params![site])?,
            None => conn.execute("DELETE FROM search_history", [])?,
        };
        Ok(removed)
    }
}
