//! Integration tests for the `falcon` binary.
//!
//! Each test runs the binary against a fresh data root and only uses
//! commands that stay offline.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Output;
use tempfile::TempDir;

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_falcon"))
}

async fn falcon(root: &Path, args: &[&str]) -> Output {
    tokio::process::Command::new(binary())
        .arg("--root")
        .arg(root)
        .args(args)
        .output()
        .await
        .expect("failed to spawn falcon")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}): {}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

#[tokio::test]
async fn test_sites_lists_defaults() {
    let root = TempDir::new().unwrap();
    let output = falcon(root.path(), &["sites"]).await;
    assert!(output.status.success());

    let sites = stdout_json(&output);
    let ids: Vec<&str> = sites
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|s| s["id"].as_str())
        .collect();
    assert!(ids.contains(&"danbooru"));
    assert!(root.path().join("config.json").exists());
}

#[tokio::test]
async fn test_collection_lifecycle() {
    let root = TempDir::new().unwrap();

    let created = falcon(root.path(), &["favorites", "create", "Wallpapers"]).await;
    assert!(created.status.success());
    let id = String::from_utf8(created.stdout).unwrap().trim().to_string();
    assert!(!id.is_empty());

    let listed = falcon(root.path(), &["favorites", "list"]).await;
    assert!(listed.status.success());
    let collections = stdout_json(&listed);
    assert_eq!(collections[0]["id"], id.as_str());
    assert_eq!(collections[0]["name"], "Wallpapers");
    assert_eq!(collections[0]["item_count"], 0);

    let renamed = falcon(root.path(), &["favorites", "rename", &id, "Backgrounds"]).await;
    assert!(renamed.status.success());
    let shown = falcon(root.path(), &["favorites", "list", &id]).await;
    assert_eq!(stdout_json(&shown)["name"], "Backgrounds");
}

#[tokio::test]
async fn test_favoriting_unseen_item_fails() {
    let root = TempDir::new().unwrap();
    let created = falcon(root.path(), &["favorites", "create", "Misc"]).await;
    let id = String::from_utf8(created.stdout).unwrap().trim().to_string();

    let added = falcon(root.path(), &["favorites", "add", &id, "danbooru", "12345"]).await;
    assert!(!added.status.success());
    let stderr = String::from_utf8_lossy(&added.stderr);
    assert!(stderr.contains("never observed"), "stderr: {stderr}");
}

#[tokio::test]
async fn test_export_import_round_trip() {
    let root = TempDir::new().unwrap();
    let other = TempDir::new().unwrap();
    let snapshot = root.path().join("favorites.json");

    falcon(root.path(), &["favorites", "create", "Keep"]).await;
    let exported = falcon(root.path(), &["favorites", "export", snapshot.to_str().unwrap()]).await;
    assert!(exported.status.success());
    assert!(snapshot.exists());

    let imported = falcon(
        other.path(),
        &["favorites", "import", snapshot.to_str().unwrap(), "--strategy", "replace"],
    )
    .await;
    assert!(imported.status.success());
    assert_eq!(stdout_json(&imported)["collections_created"], 1);

    let listed = falcon(other.path(), &["favorites", "list"]).await;
    assert_eq!(stdout_json(&listed)[0]["name"], "Keep");
}

#[tokio::test]
async fn test_cache_stats_start_empty() {
    let root = TempDir::new().unwrap();
    let output = falcon(root.path(), &["cache", "stats"]).await;
    assert!(output.status.success());

    let stats = stdout_json(&output);
    assert_eq!(stats["metadata"]["entries"], 0);
    assert_eq!(stats["blob"]["current_size"], 0);
}

#[tokio::test]
async fn test_unknown_site_is_rejected() {
    let root = TempDir::new().unwrap();
    let output = falcon(root.path(), &["logout", "nosuchsite"]).await;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Unknown site"));
}

#[tokio::test]
async fn test_tags_with_blank_prefix_stays_offline() {
    let root = TempDir::new().unwrap();
    let output = falcon(root.path(), &["tags", "danbooru", " "]).await;
    assert!(output.status.success());
    assert_eq!(stdout_json(&output), serde_json::json!([]));

    let sites = stdout_json(&falcon(root.path(), &["sites"]).await);
    let danbooru = sites
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["id"] == "danbooru")
        .unwrap();
    assert!(danbooru["capabilities"]
        .as_array()
        .unwrap()
        .iter()
        .any(|c| c == "search_tags"));
}
