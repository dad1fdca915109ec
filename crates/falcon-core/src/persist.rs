//! Crash-safe JSON persistence.
//!
//! Writes go to a sibling temp file named with the writer's PID and thread,
//! are synced to disk, and then renamed over the target. A reader therefore
//! sees either the old document or the new one, never a torn write.

use crate::error::{FalconError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Read and parse a JSON file.
///
/// Returns `None` if the file doesn't exist, or an error if parsing fails.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(FalconError::io_with_path(e, path)),
    };

    let data = serde_json::from_str(&contents).map_err(|e| FalconError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
    })?;

    Ok(Some(data))
}

/// Write `data` to `path` atomically as pretty JSON.
///
/// With `keep_backup`, the previous file is copied to `<name>.bak` first.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T, keep_backup: bool) -> Result<()> {
    let serialized = serde_json::to_string_pretty(data)?;
    atomic_write_bytes(path, serialized.as_bytes(), keep_backup)?;
    debug!("Atomically wrote {}", path.display());
    Ok(())
}

/// Write raw bytes to `path` atomically.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8], keep_backup: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| FalconError::io_with_path(e, parent))?;
        }
    }

    let temp_path = temp_path_for(path);

    let written = (|| -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(FalconError::io_with_path(e, &temp_path));
    }

    if keep_backup && path.exists() {
        let backup = backup_path_for(path);
        if let Err(e) = fs::copy(path, &backup) {
            // A missing backup never blocks the write itself.
            warn!("Failed to create backup {}: {}", backup.display(), e);
        }
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        FalconError::io_with_path(e, path)
    })
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FalconError::io_with_path(e, path)),
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        "{}.{}.{}.tmp",
        name,
        std::process::id(),
        thread_tag()
    ))
}

fn backup_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}.bak", name))
}

fn thread_tag() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}
