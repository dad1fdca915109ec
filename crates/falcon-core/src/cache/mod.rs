//! Two-tier cache for search metadata and image blobs.
//!
//! - Metadata tier: in-memory, bounded by entry count, holds search results
//!   and the page index built from them.
//! - Blob tier: SQLite-backed, bounded by total bytes, holds thumbnails and
//!   full images and survives restarts.
//!
//! Both tiers evict least recently used first. Concurrent misses on one key
//! share a single fetch; the fetch runs on its own task so a caller that
//! gives up does not cancel it for the others.
//!
//! Every site carries a generation that [`CacheManager::invalidate_site`]
//! and [`CacheManager::clear`] advance. A fetch stores its result only if
//! the generation it started under is still current, so a response fetched
//! with a stale session never lands in the cache after a login or logout.

mod disk;
mod flight;
mod key;
mod memory;
mod types;

pub use flight::{Flight, FlightGroup, Leader, Waiter};
pub use key::{CacheKey, QueryKey, Variant};
pub use types::{CacheEntry, CacheStats, Payload, TierStats};

use crate::config::{AppPaths, CacheSettings};
use crate::error::{FalconError, Result};
use crate::hashing::sha256_hex;
use crate::site::{SearchPage, SearchQuery, SearchResult};
use bytes::Bytes;
use disk::BlobTier;
use memory::MetadataTier;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Invalidation stamp of one site. Compared, never ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    epoch: u64,
    site: u64,
}

#[derive(Debug, Default)]
struct Generations {
    /// Advanced by `clear`.
    epoch: u64,
    sites: HashMap<String, u64>,
}

impl Generations {
    fn current(&self, site_id: &str) -> Generation {
        Generation {
            epoch: self.epoch,
            site: self.sites.get(site_id).copied().unwrap_or(0),
        }
    }
}

struct CacheInner {
    metadata: MetadataTier,
    blobs: BlobTier,
    generations: Mutex<Generations>,
    entry_flights: FlightGroup<CacheEntry>,
    page_flights: FlightGroup<SearchPage>,
}

impl CacheInner {
    fn generations(&self) -> Result<MutexGuard<'_, Generations>> {
        self.generations
            .lock()
            .map_err(|_| FalconError::Other("cache generation lock poisoned".to_string()))
    }

    fn generation(&self, site_id: &str) -> Result<Generation> {
        Ok(self.generations()?.current(site_id))
    }

    fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        if key.variant.is_blob() {
            self.blobs.get(key)
        } else {
            self.metadata.get(key)
        }
    }

    fn record_coalesced(&self, variant: Variant) -> Result<()> {
        if variant.is_blob() {
            self.blobs.record_coalesced()
        } else {
            self.metadata.record_coalesced()
        }
    }
}

/// Process-wide cache handle. Cheap to clone.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("stats", &self.stats())
            .finish()
    }
}

impl CacheManager {
    /// Open the cache under `paths`, creating the blob database if needed.
    pub fn open(paths: &AppPaths, settings: &CacheSettings) -> Result<Self> {
        paths.ensure_dirs()?;
        let blobs = BlobTier::open(&paths.blob_db(), settings.blob_capacity_bytes, blob_ttl(settings))?;
        info!(
            "Cache opened: {} metadata entries, {} blob bytes",
            settings.metadata_capacity, settings.blob_capacity_bytes
        );
        Ok(Self::from_tiers(settings, blobs))
    }

    /// Cache whose blob tier lives in an in-memory database.
    pub fn in_memory(settings: &CacheSettings) -> Result<Self> {
        let blobs = BlobTier::in_memory(settings.blob_capacity_bytes, blob_ttl(settings))?;
        Ok(Self::from_tiers(settings, blobs))
    }

    fn from_tiers(settings: &CacheSettings, blobs: BlobTier) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                metadata: MetadataTier::new(
                    settings.metadata_capacity,
                    settings.metadata_ttl_secs.map(Duration::from_secs),
                ),
                blobs,
                generations: Mutex::new(Generations::default()),
                entry_flights: FlightGroup::new(),
                page_flights: FlightGroup::new(),
            }),
        }
    }

    /// Counted lookup without fetching.
    pub fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        self.inner.lookup(key)
    }

    /// Current invalidation stamp of `site_id`.
    pub fn generation(&self, site_id: &str) -> Result<Generation> {
        self.inner.generation(site_id)
    }

    /// Return the entry for `key`, running `fetch` on a miss.
    ///
    /// At most one fetch per key is in flight. Callers arriving while it
    /// runs receive its result, success or failure, and are counted as
    /// coalesced misses. Failures are never cached, and neither is a result
    /// whose site was invalidated while it was being fetched.
    pub async fn get_or_fetch<F, Fut, P>(&self, key: CacheKey, fetch: F) -> Result<CacheEntry>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<P>> + Send + 'static,
        P: Into<Payload> + Send + 'static,
    {
        let inner = &self.inner;
        let generation = inner.generation(&key.site_id)?;
        let is_blob = key.variant.is_blob();

        // SQLite reads stay off the flight lock.
        if is_blob {
            let lookup_key = key.clone();
            if let Some(entry) = blocking(inner, move |inner| inner.blobs.get(&lookup_key)).await? {
                return Ok(entry);
            }
        }

        let flight = inner.entry_flights.join(&flight_key(key.digest(), generation), || {
            if is_blob {
                Ok(None)
            } else {
                inner.metadata.get(&key)
            }
        })?;

        match flight {
            Flight::Ready(entry) => Ok(entry),
            Flight::Wait(waiter) => {
                inner.record_coalesced(key.variant)?;
                debug!("Joined in-flight fetch for {}", key);
                waiter.wait().await
            }
            Flight::Lead(leader) => {
                let waiter = leader.waiter();
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    if is_blob {
                        // a flight that finished between the read above and
                        // the join has already stored the blob
                        let key = key.clone();
                        match blocking(&inner, move |inner| inner.blobs.find(&key)).await {
                            Ok(Some(entry)) => return leader.complete(Ok(entry)),
                            Ok(None) => {}
                            Err(e) => return leader.complete(Err(e)),
                        }
                    }
                    let result = match fetch().await {
                        Ok(payload) => store(&inner, generation, key, payload.into()).await,
                        Err(e) => {
                            warn!("Fetch for {} failed: {}", key, e);
                            Err(e)
                        }
                    };
                    leader.complete(result);
                });
                waiter.wait().await
            }
        }
    }

    /// Counted page lookup.
    pub fn get_page(&self, query: &SearchQuery) -> Result<Option<SearchPage>> {
        self.inner.metadata.get_page(&QueryKey::new(query))
    }

    /// Return the page for `query`, running `fetch` on a miss. Items of a
    /// fetched page are stored individually in the metadata tier.
    pub async fn get_or_fetch_page<F, Fut>(&self, query: &SearchQuery, fetch: F) -> Result<SearchPage>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<SearchPage>> + Send + 'static,
    {
        let inner = &self.inner;
        let query_key = QueryKey::new(query);
        let site_id = query.site_id.clone();
        let generation = inner.generation(&site_id)?;
        let flight = inner
            .page_flights
            .join(&flight_key(query_key.digest(), generation), || {
                inner.metadata.get_page(&query_key)
            })?;

        match flight {
            Flight::Ready(page) => Ok(page),
            Flight::Wait(waiter) => {
                inner.metadata.record_coalesced()?;
                waiter.wait().await
            }
            Flight::Lead(leader) => {
                let waiter = leader.waiter();
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    let result = match fetch().await {
                        Ok(page) => store_page(&inner, generation, &site_id, query_key, page),
                        Err(e) => Err(e),
                    };
                    leader.complete(result);
                });
                waiter.wait().await
            }
        }
    }

    /// Store one search result.
    pub fn put_metadata(&self, result: SearchResult) -> Result<CacheEntry> {
        let key = CacheKey::metadata(&result.item_ref());
        self.inner.metadata.insert(key, Arc::new(result))
    }

    /// Store one search result fetched under `generation`. Returns the entry
    /// uncached when its site has been invalidated since.
    pub fn put_metadata_since(&self, result: SearchResult, generation: Generation) -> Result<CacheEntry> {
        let key = CacheKey::metadata(&result.item_ref());
        store_metadata(&self.inner, generation, key, Arc::new(result))
    }

    /// Store a blob under a thumbnail or full-image key.
    pub async fn put_blob(&self, key: CacheKey, data: Bytes) -> Result<CacheEntry> {
        let generation = self.inner.generation(&key.site_id)?;
        store(&self.inner, generation, key, Payload::Blob(data)).await
    }

    pub fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        if key.variant.is_blob() {
            self.inner.blobs.remove(key)
        } else {
            self.inner.metadata.remove(key)
        }
    }

    /// Drop every entry and page belonging to `site_id` and advance its
    /// generation, so fetches already running for it are not cached.
    pub fn invalidate_site(&self, site_id: &str) -> Result<usize> {
        let mut generations = self.inner.generations()?;
        *generations.sites.entry(site_id.to_string()).or_insert(0) += 1;
        let removed = self.inner.metadata.remove_site(site_id)? + self.inner.blobs.remove_site(site_id)?;
        drop(generations);
        if removed > 0 {
            info!("Invalidated {} cache entries for {}", removed, site_id);
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        let mut generations = self.inner.generations()?;
        generations.epoch += 1;
        self.inner.metadata.clear()?;
        self.inner.blobs.clear()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            metadata: self.inner.metadata.stats(),
            blob: self.inner.blobs.stats(),
        }
    }
}

fn blob_ttl(settings: &CacheSettings) -> Option<Duration> {
    settings.blob_ttl_secs.map(Duration::from_secs)
}

fn flight_key(digest: &str, generation: Generation) -> String {
    format!("{}@{}.{}", digest, generation.epoch, generation.site)
}

async fn blocking<T, F>(inner: &Arc<CacheInner>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&CacheInner) -> Result<T> + Send + 'static,
{
    let inner = inner.clone();
    tokio::task::spawn_blocking(move || op(&inner))
        .await
        .map_err(|e| FalconError::Other(format!("Blob cache task failed: {}", e)))?
}

/// Store `payload` unless the key's site moved past `generation`, in which
/// case the entry is returned without being cached.
async fn store(inner: &Arc<CacheInner>, generation: Generation, key: CacheKey, payload: Payload) -> Result<CacheEntry> {
    match payload {
        Payload::Metadata(result) if !key.variant.is_blob() => store_metadata(inner, generation, key, result),
        Payload::Blob(data) if key.variant.is_blob() => {
            blocking(inner, move |inner| {
                let digest = sha256_hex(&data);
                let generations = inner.generations()?;
                if generations.current(&key.site_id) != generation {
                    debug!("Not caching {}: site invalidated during fetch", key);
                    return Ok(CacheEntry::new(key, Payload::Blob(data), None));
                }
                inner.blobs.put(&key, data, &digest).map(|(entry, _)| entry)
            })
            .await
        }
        _ => Err(FalconError::Validation {
            field: "payload".to_string(),
            message: format!("payload does not match {} key", key.variant),
        }),
    }
}

fn store_metadata(
    inner: &CacheInner,
    generation: Generation,
    key: CacheKey,
    result: Arc<SearchResult>,
) -> Result<CacheEntry> {
    let generations = inner.generations()?;
    if generations.current(&key.site_id) != generation {
        debug!("Not caching {}: site invalidated during fetch", key);
        return Ok(CacheEntry::new(key, Payload::Metadata(result), None));
    }
    inner.metadata.insert(key, result)
}

fn store_page(
    inner: &CacheInner,
    generation: Generation,
    site_id: &str,
    query_key: QueryKey,
    page: SearchPage,
) -> Result<SearchPage> {
    let generations = inner.generations()?;
    if generations.current(site_id) != generation {
        debug!("Not caching page {} of {}: site invalidated during fetch", page.page, page.site_id);
        return Ok(page);
    }
    inner.metadata.insert_page(query_key, &page)?;
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::ItemRef;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings() -> CacheSettings {
        CacheSettings {
            metadata_capacity: 100,
            metadata_ttl_secs: None,
            blob_capacity_bytes: 1024 * 1024,
            blob_ttl_secs: None,
        }
    }

    fn result(id: u32) -> SearchResult {
        SearchResult {
            item_id: id.to_string(),
            site_id: "danbooru".into(),
            thumbnail_ref: format!("https://x/t/{}.jpg", id),
            full_ref: format!("https://x/f/{}.jpg", id),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_share_one_fetch() {
        let cache = CacheManager::in_memory(&settings()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::thumbnail(&ItemRef::new("danbooru", "7"));

        let tasks = (0..10).map(|_| {
            let calls = calls.clone();
            cache.get_or_fetch(key.clone(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Bytes::from_static(b"thumb"))
            })
        });
        let results = futures::future::join_all(tasks).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for entry in results {
            assert_eq!(entry.unwrap().blob().unwrap().as_ref(), b"thumb");
        }
        let stats = cache.stats().blob;
        assert_eq!(stats.misses, 10);
        assert_eq!(stats.coalesced, 9);

        let again = cache.get(&key).unwrap();
        assert!(again.is_some());
        assert_eq!(cache.stats().blob.hits, 1);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter_and_is_not_cached() {
        let cache = CacheManager::in_memory(&settings()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::full(&ItemRef::new("danbooru", "9"));

        let fetch = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err::<Bytes, _>(FalconError::Network {
                    message: "connection refused".into(),
                    cause: None,
                })
            }
        };

        let (a, b) = tokio::join!(
            cache.get_or_fetch(key.clone(), fetch(calls.clone())),
            cache.get_or_fetch(key.clone(), fetch(calls.clone())),
        );
        assert!(matches!(a, Err(FalconError::Network { .. })));
        assert!(matches!(b, Err(FalconError::Network { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let _ = cache.get_or_fetch(key.clone(), fetch(calls.clone())).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_cancel_fetch() {
        let cache = CacheManager::in_memory(&settings()).unwrap();
        let key = CacheKey::full(&ItemRef::new("yandere", "3"));

        let gave_up = tokio::time::timeout(
            Duration::from_millis(10),
            cache.get_or_fetch(key.clone(), || async {
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok(Bytes::from_static(b"full"))
            }),
        )
        .await;
        assert!(gave_up.is_err());

        tokio::time::sleep(Duration::from_millis(150)).await;
        let entry = cache.get(&key).unwrap().expect("fetch should have completed");
        assert_eq!(entry.size_bytes, 4);
    }

    #[tokio::test]
    async fn test_payload_must_match_variant() {
        let cache = CacheManager::in_memory(&settings()).unwrap();
        let key = CacheKey::metadata(&ItemRef::new("danbooru", "1"));
        let err = cache
            .get_or_fetch(key, || async { Ok(Bytes::from_static(b"nope")) })
            .await
            .unwrap_err();
        assert!(matches!(err, FalconError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_page_fetch_then_hit() {
        let cache = CacheManager::in_memory(&settings()).unwrap();
        let query = SearchQuery::new("danbooru", &["cat"], 1);
        let page = SearchPage {
            site_id: "danbooru".into(),
            page: 1,
            items: (0..20).map(result).collect(),
            has_more: true,
            total: None,
        };

        let fetched = {
            let page = page.clone();
            cache.get_or_fetch_page(&query, move || async move { Ok(page) }).await.unwrap()
        };
        assert_eq!(fetched.items.len(), 20);
        let stats = cache.stats().metadata;
        assert_eq!((stats.hits, stats.misses), (0, 1));

        let cached = cache
            .get_or_fetch_page(&query, || async {
                Err(FalconError::Other("page should be cached".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(cached, page);
        let stats = cache.stats().metadata;
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.entries, 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fetch_straddling_invalidation_is_not_cached() {
        let cache = CacheManager::in_memory(&settings()).unwrap();
        let query = SearchQuery::new("danbooru", &["cat"], 1);
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = |calls: Arc<AtomicUsize>, delay: u64| {
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) as u32;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(SearchPage {
                    site_id: "danbooru".into(),
                    page: 1,
                    items: vec![result(n)],
                    has_more: false,
                    total: None,
                })
            }
        };

        let stale = {
            let cache = cache.clone();
            let query = query.clone();
            let fetch = fetch(calls.clone(), 150);
            tokio::spawn(async move { cache.get_or_fetch_page(&query, fetch).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.invalidate_site("danbooru").unwrap();

        // Arrives while the stale fetch is still running but must not join it.
        let fresh = cache.get_or_fetch_page(&query, fetch(calls.clone(), 0)).await.unwrap();
        assert_eq!(fresh.items[0].item_id, "1");

        let stale = stale.await.unwrap().unwrap();
        assert_eq!(stale.items[0].item_id, "0");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // The cache holds the post-invalidation page, never the stale one.
        let cached = cache.get_page(&query).unwrap().unwrap();
        assert_eq!(cached.items[0].item_id, "1");
        assert!(cache.get(&CacheKey::metadata(&ItemRef::new("danbooru", "0"))).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blob_stored_after_invalidation_is_dropped() {
        let cache = CacheManager::in_memory(&settings()).unwrap();
        let key = CacheKey::thumbnail(&ItemRef::new("danbooru", "4"));

        let pending = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(key, || async {
                        tokio::time::sleep(Duration::from_millis(60)).await;
                        Ok(Bytes::from_static(b"old"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.invalidate_site("danbooru").unwrap();

        let entry = pending.await.unwrap().unwrap();
        assert_eq!(entry.blob().unwrap().as_ref(), b"old");
        assert!(cache.get(&key).unwrap().is_none());
        assert_eq!(cache.stats().blob.entries, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_blob_store_does_not_block_other_keys() {
        let cache = CacheManager::in_memory(&settings()).unwrap();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let stalled = cache.clone();
        let staller = std::thread::spawn(move || stalled.inner.blobs.stall(Duration::from_millis(400), locked_tx));
        locked_rx.recv().unwrap();

        let blob = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(CacheKey::full(&ItemRef::new("danbooru", "1")), || async {
                        Ok(Bytes::from_static(b"img"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The blob caller is parked on the disk; metadata keys keep flowing.
        let entry = tokio::time::timeout(
            Duration::from_millis(150),
            cache.get_or_fetch(CacheKey::metadata(&ItemRef::new("danbooru", "2")), || async { Ok(result(2)) }),
        )
        .await
        .expect("metadata fetch waited on the blob tier")
        .unwrap();
        assert_eq!(entry.metadata().unwrap().item_id, "2");

        staller.join().unwrap();
        assert_eq!(blob.await.unwrap().unwrap().size_bytes, 3);
    }

    #[tokio::test]
    async fn test_invalidate_site_clears_both_tiers() {
        let cache = CacheManager::in_memory(&settings()).unwrap();
        cache.put_metadata(result(1)).unwrap();
        cache
            .put_blob(CacheKey::thumbnail(&ItemRef::new("danbooru", "1")), Bytes::from_static(b"t"))
            .await
            .unwrap();

        assert_eq!(cache.invalidate_site("danbooru").unwrap(), 2);
        let stats = cache.stats();
        assert_eq!(stats.metadata.entries, 0);
        assert_eq!(stats.blob.entries, 0);
    }
}
