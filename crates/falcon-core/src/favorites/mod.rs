//! User-curated favorite collections.
//!
//! Collections and their item references live in SQLite and are independent
//! of the cache: evicting a thumbnail or losing a session never touches
//! them. Only items that were observed in a search result can be favorited.

mod history;
mod snapshot;
mod store;

pub use history::SearchHistoryEntry;
pub use snapshot::{ImportSummary, MergeStrategy, Snapshot, SnapshotCollection, SNAPSHOT_VERSION};
pub use store::{Collection, CollectionSummary, FavoritesStore};
