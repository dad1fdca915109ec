//! On-disk session records.
//!
//! `sessions.json` holds one record per site. Every secret field is sealed
//! with the session [`SecretBox`](super::SecretBox) before it reaches this
//! module, so the file never contains plaintext credentials or tokens.

use crate::error::Result;
use crate::persist::{atomic_read_json, atomic_write_json, remove_if_exists};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const STORE_VERSION: u32 = 1;

/// One authenticated session. Secret fields are sealed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub site_id: String,
    /// Sealed JSON of the login credentials.
    pub credential_blob: String,
    /// Sealed access token.
    pub token: String,
    /// Sealed refresh token, if the site issued one.
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("site_id", &self.site_id)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("refreshable", &self.refresh_token.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    sessions: BTreeMap<String, Session>,
}

/// Persistence for session records; `None` path keeps them in memory only.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: Option<PathBuf>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn in_memory() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn load(&self) -> Result<BTreeMap<String, Session>> {
        let Some(path) = &self.path else {
            return Ok(BTreeMap::new());
        };
        let file: Option<StoreFile> = atomic_read_json(path)?;
        Ok(file.map(|f| f.sessions).unwrap_or_default())
    }

    /// Replace the stored set. An empty set removes the file.
    pub fn save(&self, sessions: &BTreeMap<String, Session>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if sessions.is_empty() {
            remove_if_exists(path)?;
            debug!("Removed empty session store {}", path.display());
            return Ok(());
        }
        // No backup: a .bak would keep logged-out material on disk.
        atomic_write_json(
            path,
            &StoreFile {
                version: STORE_VERSION,
                sessions: sessions.clone(),
            },
            false,
        )
    }
}
