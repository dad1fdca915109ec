//! Per-site sessions.
//!
//! The [`SessionManager`] owns every session: it logs in through the site
//! registry, seals credentials and tokens with a [`SecretBox`], persists them
//! through a [`SessionStore`], and hands out short-lived [`AuthContext`]s for
//! outbound calls. Refreshes run in one exclusive region so a token is never
//! renewed twice at once.

mod crypto;
mod store;

pub use crypto::SecretBox;
pub use store::{Session, SessionStore};

use crate::config::{AppPaths, SessionSettings};
use crate::error::{FalconError, Result};
use crate::site::{AuthContext, AuthGrant, Capability, Credentials, SiteRegistry};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Owner of all per-site sessions.
pub struct SessionManager {
    registry: Arc<SiteRegistry>,
    store: SessionStore,
    secrets: SecretBox,
    settings: SessionSettings,
    sessions: Mutex<BTreeMap<String, Session>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("store", &self.store)
            .field("active_sites", &self.active_sites())
            .finish()
    }
}

impl SessionManager {
    /// Open the persisted session store under `paths`, purging expired
    /// sessions.
    pub fn open(paths: &AppPaths, registry: Arc<SiteRegistry>, settings: SessionSettings) -> Result<Self> {
        let secrets = SecretBox::load_or_create(&paths.session_key())?;
        Self::with_store(SessionStore::new(paths.session_store()), secrets, registry, settings)
    }

    /// Sessions kept in memory only, sealed with a throwaway key.
    pub fn in_memory(registry: Arc<SiteRegistry>, settings: SessionSettings) -> Result<Self> {
        Self::with_store(SessionStore::in_memory(), SecretBox::ephemeral()?, registry, settings)
    }

    pub fn with_store(
        store: SessionStore,
        secrets: SecretBox,
        registry: Arc<SiteRegistry>,
        settings: SessionSettings,
    ) -> Result<Self> {
        let loaded = store.load()?;
        let manager = Self {
            registry,
            store,
            secrets,
            settings,
            sessions: Mutex::new(loaded),
            refresh_lock: tokio::sync::Mutex::new(()),
        };

        let purged = manager.purge_expired()?;
        if purged > 0 {
            info!("Purged {} expired session(s)", purged);
        }
        Ok(manager)
    }

    /// Authenticate with a site and store the resulting session, replacing
    /// any previous one for that site.
    pub async fn login(&self, site: &str, credentials: &Credentials) -> Result<Session> {
        let site_id = self.registry.canonical_id(site)?;
        let grant = self.registry.authenticate(&site_id, credentials).await?;

        let session = self.build_session(&site_id, credentials, &grant)?;
        self.mutate(|sessions| {
            sessions.insert(site_id.clone(), session.clone());
        })?;

        info!("Logged in to {} (expires {})", site_id, session.expires_at);
        Ok(session)
    }

    /// Drop the session for `site`, purging it from disk immediately.
    /// Returns whether a session existed.
    pub fn logout(&self, site: &str) -> Result<bool> {
        let site_id = self.registry.canonical_id(site)?;
        let removed = self.mutate(|sessions| sessions.remove(&site_id).is_some())?;
        if removed {
            info!("Logged out of {}", site_id);
        }
        Ok(removed)
    }

    /// Drop every session. Returns the ids that were logged out.
    pub fn logout_all(&self) -> Result<Vec<String>> {
        let ids = self.mutate(|sessions| {
            let ids: Vec<String> = sessions.keys().cloned().collect();
            sessions.clear();
            ids
        })?;
        info!("Logged out of {} site(s)", ids.len());
        Ok(ids)
    }

    /// The stored session for `site`, if any. Secrets remain sealed.
    pub fn session(&self, site: &str) -> Result<Option<Session>> {
        let site_id = self.registry.canonical_id(site)?;
        Ok(self.lock()?.get(&site_id).cloned())
    }

    /// Sites with a live session.
    pub fn active_sites(&self) -> Vec<String> {
        let now = Utc::now();
        self.lock()
            .map(|sessions| {
                sessions
                    .values()
                    .filter(|s| !s.is_expired_at(now))
                    .map(|s| s.site_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove sessions past `expires_at`. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        self.mutate(|sessions| {
            let before = sessions.len();
            sessions.retain(|_, s| !s.is_expired_at(now));
            before - sessions.len()
        })
    }

    /// Auth material for an outbound call to `site`.
    ///
    /// Fails with `NoSession` when not logged in and `SessionExpired` when
    /// the session is past, or within the refresh margin of, `expires_at`
    /// and cannot be silently refreshed.
    pub async fn auth_context(&self, site: &str) -> Result<AuthContext> {
        let site_id = self.registry.canonical_id(site)?;
        let session = self
            .lock()?
            .get(&site_id)
            .cloned()
            .ok_or_else(|| FalconError::NoSession {
                site: site_id.clone(),
            })?;

        let session = if self.needs_refresh(&session, Utc::now()) {
            self.refresh(&site_id).await?
        } else {
            session
        };

        self.open_context(&session)
    }

    /// Like [`auth_context`](Self::auth_context), but a missing session is
    /// `Ok(None)` unless the site requires authentication.
    pub async fn optional_auth(&self, site: &str) -> Result<Option<AuthContext>> {
        match self.auth_context(site).await {
            Ok(ctx) => Ok(Some(ctx)),
            Err(FalconError::NoSession { site }) => {
                if self.registry.site(&site)?.requires_auth {
                    Err(FalconError::NoSession { site })
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(e),
        }
    }

    fn needs_refresh(&self, session: &Session, now: DateTime<Utc>) -> bool {
        now + chrono_duration(Duration::from_secs(self.settings.refresh_margin_secs)) >= session.expires_at
    }

    /// Renew the session for `site_id` inside the refresh region.
    async fn refresh(&self, site_id: &str) -> Result<Session> {
        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed or removed it while we waited.
        let current = self.lock()?.get(site_id).cloned();
        let Some(session) = current else {
            return Err(FalconError::SessionExpired {
                site: site_id.to_string(),
            });
        };
        let now = Utc::now();
        if !self.needs_refresh(&session, now) {
            return Ok(session);
        }

        let refreshable = self.registry.supports(site_id, Capability::Refresh)?;
        let renewed = match (&session.refresh_token, refreshable) {
            (Some(sealed), true) => {
                let refresh_token = String::from_utf8(self.secrets.open(sealed)?).map_err(|_| FalconError::Crypto {
                    message: "refresh token is not UTF-8".to_string(),
                })?;
                match self.registry.refresh(site_id, &refresh_token).await {
                    Ok(grant) => Some(grant),
                    Err(e) => {
                        warn!("Refresh for {} failed: {}", site_id, e);
                        None
                    }
                }
            }
            _ => None,
        };

        let Some(grant) = renewed else {
            self.mutate(|sessions| {
                sessions.remove(site_id);
            })?;
            debug!("Session for {} expired", site_id);
            return Err(FalconError::SessionExpired {
                site: site_id.to_string(),
            });
        };

        let credentials: Credentials = self.secrets.open_json(&session.credential_blob)?;
        let renewed = self.build_session(site_id, &credentials, &grant)?;
        self.mutate(|sessions| {
            sessions.insert(site_id.to_string(), renewed.clone());
        })?;
        info!("Refreshed session for {}", site_id);
        Ok(renewed)
    }

    fn build_session(&self, site_id: &str, credentials: &Credentials, grant: &AuthGrant) -> Result<Session> {
        let ttl = grant.expires_in.unwrap_or_else(|| {
            if credentials.remember {
                Duration::from_secs(self.settings.remember_ttl_days * 86_400)
            } else {
                Duration::from_secs(self.settings.default_ttl_hours * 3600)
            }
        });
        let issued_at = Utc::now();

        Ok(Session {
            site_id: site_id.to_string(),
            credential_blob: self.secrets.seal_json(credentials)?,
            token: self.secrets.seal(grant.token.as_bytes())?,
            refresh_token: grant
                .refresh_token
                .as_ref()
                .map(|t| self.secrets.seal(t.as_bytes()))
                .transpose()?,
            issued_at,
            expires_at: issued_at + chrono_duration(ttl),
        })
    }

    fn open_context(&self, session: &Session) -> Result<AuthContext> {
        let credentials: Credentials = self.secrets.open_json(&session.credential_blob)?;
        let token = String::from_utf8(self.secrets.open(&session.token)?).map_err(|_| FalconError::Crypto {
            message: "token is not UTF-8".to_string(),
        })?;
        Ok(AuthContext {
            site_id: session.site_id.clone(),
            username: credentials.username,
            token,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Session>>> {
        self.sessions
            .lock()
            .map_err(|_| FalconError::Other("session lock poisoned".to_string()))
    }

    /// Apply `f` and persist the result while still holding the lock, so the
    /// file always reflects the latest in-memory state.
    fn mutate<T>(&self, f: impl FnOnce(&mut BTreeMap<String, Session>) -> T) -> Result<T> {
        let mut sessions = self.lock()?;
        let out = f(&mut sessions);
        self.store.save(&sessions)?;
        Ok(out)
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::{SearchPage, SearchQuery, Site, SiteClient};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct KeySite {
        site: Site,
        ttl: Option<Duration>,
        refreshes: AtomicU32,
    }

    #[async_trait]
    impl SiteClient for KeySite {
        fn site(&self) -> &Site {
            &self.site
        }

        async fn search(&self, _query: &SearchQuery, _auth: Option<&AuthContext>) -> Result<SearchPage> {
            unreachable!("not used")
        }

        async fn authenticate(&self, credentials: &Credentials) -> Result<AuthGrant> {
            if credentials.secret == "bad" {
                return Err(FalconError::Auth {
                    site: self.site.id.clone(),
                    message: "invalid api key".to_string(),
                });
            }
            Ok(AuthGrant {
                token: format!("token-for-{}", credentials.username),
                refresh_token: Some("refresh-1".to_string()),
                expires_in: self.ttl,
            })
        }

        async fn refresh(&self, refresh_token: &str) -> Result<AuthGrant> {
            assert_eq!(refresh_token, "refresh-1");
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(AuthGrant {
                token: "refreshed".to_string(),
                refresh_token: Some("refresh-1".to_string()),
                expires_in: Some(Duration::from_secs(3600)),
            })
        }
    }

    fn registry(capabilities: &[Capability], ttl: Option<Duration>) -> (Arc<SiteRegistry>, Arc<KeySite>) {
        let site = Arc::new(KeySite {
            site: Site::new("keysite", "https://keysite.example", capabilities.iter().copied()),
            ttl,
            refreshes: AtomicU32::new(0),
        });
        let mut registry = SiteRegistry::new();
        registry
            .register_with_aliases(site.clone(), &["ks".to_string()])
            .unwrap();
        (Arc::new(registry), site)
    }

    fn no_margin() -> SessionSettings {
        SessionSettings {
            refresh_margin_secs: 0,
            ..SessionSettings::default()
        }
    }

    #[tokio::test]
    async fn test_login_builds_auth_context() {
        let (registry, _) = registry(&[Capability::Search, Capability::Authenticate], None);
        let manager = SessionManager::in_memory(registry, SessionSettings::default()).unwrap();

        let session = manager.login("KS", &Credentials::new("alice", "key")).await.unwrap();
        assert_eq!(session.site_id, "keysite");
        assert!(session.expires_at - session.issued_at >= chrono::Duration::hours(23));

        let ctx = manager.auth_context("keysite").await.unwrap();
        assert_eq!(ctx.username, "alice");
        assert_eq!(ctx.token, "token-for-alice");
    }

    #[tokio::test]
    async fn test_remember_extends_default_ttl() {
        let (registry, _) = registry(&[Capability::Authenticate], None);
        let manager = SessionManager::in_memory(registry, SessionSettings::default()).unwrap();
        let session = manager
            .login("keysite", &Credentials::new("a", "k").remember(true))
            .await
            .unwrap();
        assert!(session.expires_at - session.issued_at >= chrono::Duration::days(29));
    }

    #[tokio::test]
    async fn test_failed_login_keeps_previous_session() {
        let (registry, _) = registry(&[Capability::Authenticate], None);
        let manager = SessionManager::in_memory(registry, SessionSettings::default()).unwrap();
        manager.login("keysite", &Credentials::new("a", "k")).await.unwrap();

        let err = manager.login("keysite", &Credentials::new("a", "bad")).await.unwrap_err();
        assert!(matches!(err, FalconError::Auth { .. }));
        assert_eq!(manager.auth_context("keysite").await.unwrap().token, "token-for-a");
    }

    #[tokio::test]
    async fn test_no_session() {
        let (registry, _) = registry(&[Capability::Authenticate], None);
        let manager = SessionManager::in_memory(registry, SessionSettings::default()).unwrap();
        assert!(matches!(
            manager.auth_context("keysite").await,
            Err(FalconError::NoSession { .. })
        ));
        assert!(manager.optional_auth("keysite").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_session_surfaces_session_expired() {
        let (registry, _) = registry(&[Capability::Authenticate], Some(Duration::from_millis(50)));
        let manager = SessionManager::in_memory(registry, no_margin()).unwrap();
        manager.login("keysite", &Credentials::new("a", "k")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            manager.auth_context("keysite").await,
            Err(FalconError::SessionExpired { .. })
        ));
        assert!(manager.session("keysite").unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_refresh_runs_once_for_concurrent_callers() {
        let (registry, site) = registry(
            &[Capability::Authenticate, Capability::Refresh],
            Some(Duration::from_secs(5)),
        );
        // Margin larger than the grant lifetime forces a refresh.
        let settings = SessionSettings {
            refresh_margin_secs: 60,
            ..SessionSettings::default()
        };
        let manager = Arc::new(SessionManager::in_memory(registry, settings).unwrap());
        manager.login("keysite", &Credentials::new("a", "k")).await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.auth_context("keysite").await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().token, "refreshed");
        }
        assert_eq!(site.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persisted_store_is_sealed_and_logout_purges() {
        let temp = TempDir::new().unwrap();
        let paths = AppPaths::new(temp.path());
        let (registry, _) = registry(&[Capability::Authenticate], None);

        let manager = SessionManager::open(&paths, registry.clone(), SessionSettings::default()).unwrap();
        manager.login("keysite", &Credentials::new("alice", "s3cret-key")).await.unwrap();

        let on_disk = std::fs::read_to_string(paths.session_store()).unwrap();
        assert!(!on_disk.contains("s3cret-key"));
        assert!(!on_disk.contains("token-for-alice"));
        assert!(!on_disk.contains("alice"));

        // A second manager with the same key sees the session.
        let reopened = SessionManager::open(&paths, registry.clone(), SessionSettings::default()).unwrap();
        assert_eq!(reopened.active_sites(), vec!["keysite".to_string()]);

        assert!(reopened.logout("keysite").unwrap());
        assert!(!paths.session_store().exists());
        assert!(!reopened.logout("keysite").unwrap());
    }

    #[tokio::test]
    async fn test_expired_sessions_purged_on_load() {
        let temp = TempDir::new().unwrap();
        let paths = AppPaths::new(temp.path());
        let (registry, _) = registry(&[Capability::Authenticate], Some(Duration::from_millis(10)));

        let manager = SessionManager::open(&paths, registry.clone(), no_margin()).unwrap();
        manager.login("keysite", &Credentials::new("a", "k")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let reopened = SessionManager::open(&paths, registry, no_margin()).unwrap();
        assert!(reopened.session("keysite").unwrap().is_none());
        assert!(reopened.active_sites().is_empty());
    }
}
