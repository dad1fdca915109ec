//! In-memory metadata tier.
//!
//! Holds one entry per search result, bounded by count and evicted least
//! recently used first. Search pages are indexed separately: a page entry
//! lists the item keys it produced and is served only while every one of
//! those items is still cached. Entries, page index and counters share one
//! lock so statistics never drift from contents.

use super::key::{CacheKey, QueryKey};
use super::types::{CacheEntry, Payload, TierStats};
use crate::error::{FalconError, Result};
use crate::site::{SearchPage, SearchResult};
use chrono::{DateTime, Utc};
use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
struct PageEntry {
    site_id: String,
    page: u32,
    items: Vec<CacheKey>,
    has_more: bool,
    total: Option<u64>,
    created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct State {
    items: LruCache<CacheKey, CacheEntry>,
    pages: LruCache<QueryKey, PageEntry>,
    stats: TierStats,
}

#[derive(Debug)]
pub(crate) struct MetadataTier {
    state: Mutex<State>,
    capacity: usize,
    ttl: Option<Duration>,
}

impl MetadataTier {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        // A zero capacity stores nothing; the caches still need a bound.
        let bound = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(State {
                items: LruCache::new(bound),
                pages: LruCache::new(bound),
                stats: TierStats {
                    capacity: capacity as u64,
                    ..TierStats::default()
                },
            }),
            capacity,
            ttl,
        }
    }

    /// Counted lookup; touches the entry on hit. Expired entries are dropped
    /// and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let found = lookup(&mut state, key, now);
        match &found {
            Some(_) => state.stats.hits += 1,
            None => state.stats.misses += 1,
        }
        sync_size(&mut state);
        Ok(found)
    }

    /// Counted page lookup. A page whose items were evicted or expired is
    /// dropped and counted as a miss.
    pub fn get_page(&self, query: &QueryKey) -> Result<Option<SearchPage>> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let page = lookup_page(&mut state, query, self.ttl, now);
        match &page {
            Some(_) => state.stats.hits += 1,
            None => state.stats.misses += 1,
        }
        sync_size(&mut state);
        Ok(page)
    }

    /// Record a caller that joined an in-flight fetch.
    pub fn record_coalesced(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.stats.misses += 1;
        state.stats.coalesced += 1;
        Ok(())
    }

    /// Upsert one result, evicting as needed.
    pub fn insert(&self, key: CacheKey, result: Arc<SearchResult>) -> Result<CacheEntry> {
        let mut state = self.lock()?;
        let entry = CacheEntry::new(key.clone(), Payload::Metadata(result), self.ttl);
        self.insert_locked(&mut state, key, entry.clone());
        sync_size(&mut state);
        Ok(entry)
    }

    /// Store every item of `page` and index the page under `query`.
    pub fn insert_page(&self, query: QueryKey, page: &SearchPage) -> Result<()> {
        let mut state = self.lock()?;
        let mut keys = Vec::with_capacity(page.items.len());
        for item in &page.items {
            let key = CacheKey::metadata(&item.item_ref());
            let entry = CacheEntry::new(key.clone(), Payload::Metadata(Arc::new(item.clone())), self.ttl);
            self.insert_locked(&mut state, key.clone(), entry);
            keys.push(key);
        }

        state.pages.put(
            query,
            PageEntry {
                site_id: page.site_id.clone(),
                page: page.page,
                items: keys,
                has_more: page.has_more,
                total: page.total,
                created_at: Utc::now(),
            },
        );
        sync_size(&mut state);
        Ok(())
    }

    pub fn remove(&self, key: &CacheKey) -> Result<bool> {
        let mut state = self.lock()?;
        let removed = state.items.pop(key).is_some();
        sync_size(&mut state);
        Ok(removed)
    }

    pub fn remove_site(&self, site_id: &str) -> Result<usize> {
        let mut state = self.lock()?;
        let removed = drain_where(&mut state.items, |k| k.site_id == site_id);
        drain_where(&mut state.pages, |k| k.site_id == site_id);
        sync_size(&mut state);
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.items.clear();
        state.pages.clear();
        sync_size(&mut state);
        Ok(())
    }

    pub fn stats(&self) -> TierStats {
        self.lock().map(|state| state.stats).unwrap_or_default()
    }

    fn insert_locked(&self, state: &mut State, key: CacheKey, entry: CacheEntry) {
        if self.capacity == 0 {
            return;
        }
        // `push` hands back either the replaced value of `key` or the
        // least recently used entry it evicted.
        if let Some((evicted, _)) = state.items.push(key.clone(), entry) {
            if evicted != key {
                state.stats.eviction_count += 1;
                debug!("Evicted metadata {}", evicted);
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| FalconError::Other("metadata cache lock poisoned".to_string()))
    }
}

fn lookup(state: &mut State, key: &CacheKey, now: DateTime<Utc>) -> Option<CacheEntry> {
    let expired = state.items.peek(key)?.is_expired_at(now);
    if expired {
        state.items.pop(key);
        return None;
    }
    let entry = state.items.get_mut(key)?;
    entry.touch(now);
    Some(entry.clone())
}

fn lookup_page(state: &mut State, query: &QueryKey, ttl: Option<Duration>, now: DateTime<Utc>) -> Option<SearchPage> {
    let page = state.pages.peek(query)?.clone();

    let page_expired = ttl
        .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
        .is_some_and(|ttl| now >= page.created_at + ttl);
    let complete = page.items.iter().all(|key| {
        state
            .items
            .peek(key)
            .is_some_and(|entry| !entry.is_expired_at(now))
    });
    if page_expired || !complete {
        state.pages.pop(query);
        return None;
    }

    let mut items = Vec::with_capacity(page.items.len());
    for key in &page.items {
        let entry = state.items.get_mut(key)?;
        entry.touch(now);
        if let Some(result) = entry.metadata() {
            items.push(result.clone());
        }
    }
    state.pages.promote(query);

    Some(SearchPage {
        site_id: page.site_id,
        page: page.page,
        items,
        has_more: page.has_more,
        total: page.total,
    })
}

/// Remove every entry whose key matches, returning how many went.
fn drain_where<K: Hash + Eq + Clone, V>(cache: &mut LruCache<K, V>, matches: impl Fn(&K) -> bool) -> usize {
    let doomed: Vec<K> = cache.iter().map(|(k, _)| k).filter(|k| matches(k)).cloned().collect();
    for key in &doomed {
        cache.pop(key);
    }
    doomed.len()
}

fn sync_size(state: &mut State) {
    state.stats.entries = state.items.len() as u64;
    state.stats.current_size = state.stats.entries;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::SearchQuery;
    use std::collections::BTreeMap;

    fn result(id: u32) -> SearchResult {
        SearchResult {
            item_id: id.to_string(),
            site_id: "s".to_string(),
            thumbnail_ref: format!("https://s.example/t/{}.jpg", id),
            full_ref: format!("https://s.example/f/{}.png", id),
            metadata: BTreeMap::new(),
        }
    }

    fn key(id: u32) -> CacheKey {
        CacheKey::metadata(&result(id).item_ref())
    }

    fn page(ids: std::ops::Range<u32>) -> SearchPage {
        SearchPage {
            site_id: "s".to_string(),
            page: 1,
            items: ids.map(result).collect(),
            has_more: true,
            total: None,
        }
    }

    #[test]
    fn test_capacity_bound_and_lru_order() {
        let tier = MetadataTier::new(3, None);
        for id in 0..3 {
            tier.insert(key(id), Arc::new(result(id))).unwrap();
        }
        // Touch 0 so 1 becomes the oldest.
        assert!(tier.get(&key(0)).unwrap().is_some());
        tier.insert(key(3), Arc::new(result(3))).unwrap();

        assert!(tier.get(&key(1)).unwrap().is_none());
        assert!(tier.get(&key(0)).unwrap().is_some());
        let stats = tier.stats();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.eviction_count, 1);
        assert!(stats.current_size <= stats.capacity);
    }

    #[test]
    fn test_upsert_resets_hit_count() {
        let tier = MetadataTier::new(2, None);
        tier.insert(key(1), Arc::new(result(1))).unwrap();
        let hit = tier.get(&key(1)).unwrap().unwrap();
        assert_eq!(hit.hit_count, 1);

        tier.insert(key(1), Arc::new(result(1))).unwrap();
        assert_eq!(tier.get(&key(1)).unwrap().unwrap().hit_count, 1);
        assert_eq!(tier.stats().entries, 1);
    }

    #[test]
    fn test_page_hit_requires_all_items() {
        let tier = MetadataTier::new(20, None);
        let query = QueryKey::new(&SearchQuery::new("s", &["x"], 1));
        tier.insert_page(query.clone(), &page(0..20)).unwrap();
        assert_eq!(tier.stats().entries, 20);

        let cached = tier.get_page(&query).unwrap().unwrap();
        assert_eq!(cached.items.len(), 20);
        assert_eq!(cached.items[0].item_id, "0");

        tier.remove(&key(5)).unwrap();
        assert!(tier.get_page(&query).unwrap().is_none());

        let stats = tier.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_expired_entry_is_miss() {
        let tier = MetadataTier::new(4, Some(Duration::from_millis(0)));
        tier.insert(key(1), Arc::new(result(1))).unwrap();
        assert!(tier.get(&key(1)).unwrap().is_none());
        assert_eq!(tier.stats().entries, 0);
    }

    #[test]
    fn test_remove_site() {
        let tier = MetadataTier::new(10, None);
        tier.insert(key(1), Arc::new(result(1))).unwrap();
        let other = CacheKey::new("t", "1", super::super::Variant::Metadata);
        tier.insert(other.clone(), Arc::new(result(1))).unwrap();

        assert_eq!(tier.remove_site("s").unwrap(), 1);
        assert!(tier.get(&other).unwrap().is_some());
    }
}
