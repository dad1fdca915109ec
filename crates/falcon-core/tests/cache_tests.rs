//! Capacity and eviction order through the public cache API.

use bytes::Bytes;
use falcon_core::cache::{CacheKey, CacheManager};
use falcon_core::config::{AppPaths, CacheSettings};
use falcon_core::site::{ItemRef, SearchResult};
use std::collections::BTreeMap;
use tempfile::TempDir;

fn settings(metadata_capacity: usize, blob_capacity_bytes: u64) -> CacheSettings {
    CacheSettings {
        metadata_capacity,
        metadata_ttl_secs: None,
        blob_capacity_bytes,
        blob_ttl_secs: None,
    }
}

fn result(id: u32) -> SearchResult {
    SearchResult {
        item_id: id.to_string(),
        site_id: "konachan".into(),
        thumbnail_ref: String::new(),
        full_ref: String::new(),
        metadata: BTreeMap::new(),
    }
}

fn thumb(id: u32) -> CacheKey {
    CacheKey::thumbnail(&ItemRef::new("konachan", id.to_string()))
}

#[test]
fn test_metadata_tier_evicts_least_recently_used() {
    let cache = CacheManager::in_memory(&settings(3, 1024)).unwrap();
    for id in 0..3 {
        cache.put_metadata(result(id)).unwrap();
    }
    let first = CacheKey::metadata(&ItemRef::new("konachan", "0"));
    assert!(cache.get(&first).unwrap().is_some());

    cache.put_metadata(result(3)).unwrap();

    let stats = cache.stats().metadata;
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.eviction_count, 1);
    assert!(cache.get(&first).unwrap().is_some());
    assert!(cache.get(&CacheKey::metadata(&ItemRef::new("konachan", "1"))).unwrap().is_none());
}

#[tokio::test]
async fn test_blob_tier_never_exceeds_capacity() {
    let cache = CacheManager::in_memory(&settings(10, 100)).unwrap();
    for id in 0..3 {
        cache.put_blob(thumb(id), Bytes::from(vec![0u8; 30])).await.unwrap();
    }
    assert!(cache.get(&thumb(0)).unwrap().is_some());

    cache.put_blob(thumb(3), Bytes::from(vec![0u8; 30])).await.unwrap();
    let stats = cache.stats().blob;
    assert!(stats.current_size <= 100);
    assert_eq!(stats.entries, 3);
    assert!(cache.get(&thumb(1)).unwrap().is_none());
    assert!(cache.get(&thumb(0)).unwrap().is_some());

    // Larger than the whole tier: handed back, not stored.
    let huge = cache.put_blob(thumb(9), Bytes::from(vec![0u8; 500])).await.unwrap();
    assert_eq!(huge.size_bytes, 500);
    assert!(cache.stats().blob.current_size <= 100);
}

#[tokio::test]
async fn test_blob_tier_survives_restart() {
    let temp = TempDir::new().unwrap();
    let paths = AppPaths::new(temp.path());
    {
        let cache = CacheManager::open(&paths, &settings(10, 1024)).unwrap();
        cache.put_blob(thumb(1), Bytes::from_static(b"png")).await.unwrap();
    }

    let cache = CacheManager::open(&paths, &settings(10, 1024)).unwrap();
    let entry = cache.get(&thumb(1)).unwrap().expect("blob should persist");
    assert_eq!(entry.blob().unwrap().as_ref(), b"png");
}
