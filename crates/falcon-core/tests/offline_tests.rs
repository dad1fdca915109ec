//! Network failure paths, exercised against a closed local port.

mod common;

use common::{build_core, MockSite};
use falcon_core::error::{ErrorKind, FalconError};
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_simultaneous_offline_downloads_share_one_error() {
    let temp = TempDir::new().unwrap();
    let site = Arc::new(MockSite::new("mock"));
    let core = build_core(temp.path(), site.clone());
    let result = site.result(7);

    let (a, b) = tokio::join!(core.download(&result), core.download(&result));
    let (a, b) = (a.unwrap_err(), b.unwrap_err());

    assert_eq!(a.kind(), ErrorKind::Download);
    assert!(matches!(a, FalconError::Download { attempts: 2, .. }));
    assert_eq!(a.to_string(), b.to_string());

    let target_dir = core.downloads().target_dir().join("mock");
    let leftovers: Vec<_> = std::fs::read_dir(&target_dir)
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "unexpected files: {:?}", leftovers);
}

#[tokio::test]
async fn test_offline_thumbnail_is_not_cached() {
    let temp = TempDir::new().unwrap();
    let site = Arc::new(MockSite::new("mock"));
    let core = build_core(temp.path(), site.clone());
    let result = site.result(3);

    let err = core.thumbnail(&result).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Download);

    let stats = core.cache_stats().blob;
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.current_size, 0);
}
