//! Export and import of favorites.
//!
//! A snapshot is a versioned JSON document holding every collection and its
//! item references in order. Import validates the whole document before
//! touching the database and applies it in one transaction.

use super::store::{append_item, collection_ids, insert_collection, load_collection, FavoritesStore};
use crate::error::{FalconError, Result};
use crate::persist::atomic_write_json;
use crate::site::ItemRef;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotCollection {
    pub id: String,
    pub name: String,
    pub items: Vec<ItemRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub collections: Vec<SnapshotCollection>,
}

/// How an import combines with existing collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Drop every existing collection first.
    Replace,
    /// Keep existing collections; collections with a matching id gain the
    /// imported items they lack, others are created.
    Union,
}

impl std::str::FromStr for MergeStrategy {
    type Err = FalconError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "replace" => Ok(MergeStrategy::Replace),
            "union" | "merge" => Ok(MergeStrategy::Union),
            other => Err(FalconError::Validation {
                field: "merge_strategy".to_string(),
                message: format!("expected replace or union, got {}", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub collections_created: usize,
    pub items_added: usize,
}

impl Snapshot {
    /// Reject anything an import could only partially apply.
    pub fn validate(&self) -> Result<()> {
        if self.version != SNAPSHOT_VERSION {
            return Err(import_error(format!(
                "unsupported snapshot version {} (expected {})",
                self.version, SNAPSHOT_VERSION
            )));
        }

        let mut ids = HashSet::new();
        for collection in &self.collections {
            if collection.id.trim().is_empty() {
                return Err(import_error("collection with empty id".to_string()));
            }
            if collection.name.trim().is_empty() {
                return Err(import_error(format!("collection {} has an empty name", collection.id)));
            }
            if !ids.insert(collection.id.as_str()) {
                return Err(import_error(format!("duplicate collection id {}", collection.id)));
            }

            let mut seen = HashSet::new();
            for item in &collection.items {
                if item.site_id.trim().is_empty() || item.item_id.trim().is_empty() {
                    return Err(import_error(format!("empty item reference in {}", collection.id)));
                }
                if !seen.insert(item) {
                    return Err(import_error(format!("{} appears twice in {}", item, collection.id)));
                }
            }
        }
        Ok(())
    }

    pub fn item_count(&self) -> usize {
        self.collections.iter().map(|c| c.items.len()).sum()
    }
}

fn import_error(message: String) -> FalconError {
    FalconError::Import { message }
}

impl FavoritesStore {
    /// Snapshot of every collection in creation order.
    pub fn export(&self) -> Result<Snapshot> {
        let conn = self.lock()?;
        let mut collections = Vec::new();
        for id in collection_ids(&conn)? {
            let collection = load_collection(&conn, &id)?;
            collections.push(SnapshotCollection {
                id: collection.id,
                name: collection.name,
                items: collection.items,
            });
        }
        Ok(Snapshot {
            version: SNAPSHOT_VERSION,
            exported_at: Utc::now(),
            collections,
        })
    }

    /// Apply `snapshot`. All-or-nothing: a malformed snapshot or a storage
    /// failure leaves the prior state untouched. Imported references count
    /// as observed.
    pub fn import(&self, snapshot: &Snapshot, strategy: MergeStrategy) -> Result<ImportSummary> {
        snapshot.validate()?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut summary = ImportSummary::default();

        if strategy == MergeStrategy::Replace {
            tx.execute("DELETE FROM collections", [])?;
        }

        let now = Utc::now();
        for collection in &snapshot.collections {
            let exists = tx
                .query_row("SELECT 1 FROM collections WHERE id = ?1", params![collection.id], |_| Ok(()))
                .optional()?
                .is_some();
            if !exists {
                insert_collection(&tx, &collection.id, collection.name.trim(), now)?;
                summary.collections_created += 1;
            }

            for item in &collection.items {
                tx.execute(
                    "INSERT OR IGNORE INTO observed_items (site_id, item_id, first_seen_at) VALUES (?1, ?2, ?3)",
                    params![item.site_id, item.item_id, now.to_rfc3339()],
                )?;
                if append_item(&tx, &collection.id, item)? {
                    summary.items_added += 1;
                }
            }
        }

        tx.commit()?;
        info!(
            "Imported {} collection(s), {} item(s) ({:?})",
            summary.collections_created, summary.items_added, strategy
        );
        Ok(summary)
    }

    /// Write a snapshot of every collection to `path`.
    pub fn export_to_file(&self, path: &Path) -> Result<Snapshot> {
        let snapshot = self.export()?;
        atomic_write_json(path, &snapshot, false)?;
        info!(
            "Exported {} collection(s) to {}",
            snapshot.collections.len(),
            path.display()
        );
        Ok(snapshot)
    }

    /// Read a snapshot from `path` and import it. Unreadable or malformed
    /// files are import errors.
    pub fn import_from_file(&self, path: &Path, strategy: MergeStrategy) -> Result<ImportSummary> {
        let content = std::fs::read_to_string(path).map_err(|e| FalconError::io_with_path(e, path))?;
        let snapshot: Snapshot = serde_json::from_str(&content)
            .map_err(|e| import_error(format!("malformed snapshot {}: {}", path.display(), e)))?;
        self.import(&snapshot, strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::SearchResult;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn seed(store: &FavoritesStore) -> Vec<String> {
        let results: Vec<SearchResult> = (1..=4)
            .map(|n| SearchResult {
                item_id: n.to_string(),
                site_id: "yandere".into(),
                thumbnail_ref: String::new(),
                full_ref: format!("https://yande.re/{}.jpg", n),
                metadata: BTreeMap::new(),
            })
            .collect();
        store.record_observed(&results).unwrap();

        let a = store.create_collection("Sky").unwrap();
        let b = store.create_collection("Sea").unwrap();
        for n in ["3", "1"] {
            store.add_favorite(&a, &ItemRef::new("yandere", n)).unwrap();
        }
        store.add_favorite(&b, &ItemRef::new("yandere", "4")).unwrap();
        vec![a, b]
    }

    fn shape(snapshot: &Snapshot) -> Vec<(String, String, Vec<ItemRef>)> {
        snapshot
            .collections
            .iter()
            .map(|c| (c.id.clone(), c.name.clone(), c.items.clone()))
            .collect()
    }

    #[test]
    fn test_export_import_replace_round_trip() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("favorites.json");
        let source = FavoritesStore::in_memory().unwrap();
        seed(&source);
        let exported = source.export_to_file(&file).unwrap();

        let target = FavoritesStore::in_memory().unwrap();
        target.create_collection("Stale").unwrap();
        target.import_from_file(&file, MergeStrategy::Replace).unwrap();

        assert_eq!(shape(&target.export().unwrap()), shape(&exported));
    }

    #[test]
    fn test_union_does_not_duplicate() {
        let store = FavoritesStore::in_memory().unwrap();
        let ids = seed(&store);
        let mut snapshot = store.export().unwrap();
        snapshot.collections[0].items.push(ItemRef::new("yandere", "2"));

        let summary = store.import(&snapshot, MergeStrategy::Union).unwrap();
        assert_eq!(summary.collections_created, 0);
        assert_eq!(summary.items_added, 1);

        let items: Vec<_> = store.collection(&ids[0]).unwrap().items.into_iter().map(|i| i.item_id).collect();
        assert_eq!(items, vec!["3", "1", "2"]);
    }

    #[test]
    fn test_malformed_import_leaves_state_untouched() {
        let store = FavoritesStore::in_memory().unwrap();
        seed(&store);
        let before = shape(&store.export().unwrap());

        let mut snapshot = store.export().unwrap();
        snapshot.collections.push(SnapshotCollection {
            id: snapshot.collections[0].id.clone(),
            name: "dup".into(),
            items: vec![],
        });
        let err = store.import(&snapshot, MergeStrategy::Replace).unwrap_err();
        assert!(matches!(err, FalconError::Import { .. }));

        snapshot.collections.pop();
        snapshot.version = 99;
        assert!(store.import(&snapshot, MergeStrategy::Replace).is_err());

        assert_eq!(shape(&store.export().unwrap()), before);
    }

    #[test]
    fn test_garbage_file_is_import_error() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("broken.json");
        std::fs::write(&file, "{\"version\": 1, \"collections\": [").unwrap();

        let store = FavoritesStore::in_memory().unwrap();
        let err = store.import_from_file(&file, MergeStrategy::Union).unwrap_err();
        assert!(matches!(err, FalconError::Import { .. }));
    }

    #[test]
    fn test_imported_items_become_observed() {
        let store = FavoritesStore::in_memory().unwrap();
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            exported_at: Utc::now(),
            collections: vec![SnapshotCollection {
                id: "c1".into(),
                name: "Imported".into(),
                items: vec![ItemRef::new("danbooru", "77")],
            }],
        };
        store.import(&snapshot, MergeStrategy::Union).unwrap();
        assert!(store.is_observed(&ItemRef::new("danbooru", "77")).unwrap());
        assert_eq!("union".parse::<MergeStrategy>().unwrap(), MergeStrategy::Union);
    }
}
