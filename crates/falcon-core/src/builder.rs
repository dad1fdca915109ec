//! Builder for [`FalconCore`].

use crate::cache::CacheManager;
use crate::config::{AppPaths, Settings};
use crate::download::DownloadCoordinator;
use crate::error::{FalconError, Result};
use crate::favorites::FavoritesStore;
use crate::network::{HttpClient, HttpClientOptions};
use crate::session::SessionManager;
use crate::site::{DynSiteClient, SiteRegistry};
use crate::FalconCore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Configures and assembles a [`FalconCore`].
pub struct FalconCoreBuilder {
    root: PathBuf,
    settings: Option<Settings>,
    configured_sites: bool,
    extra_sites: Vec<(DynSiteClient, Vec<String>)>,
    persistent: bool,
}

impl FalconCoreBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            settings: None,
            configured_sites: true,
            extra_sites: Vec::new(),
            persistent: true,
        }
    }

    /// Use these settings instead of `<root>/config.json`.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Whether to register an HTTP client for each site in the settings.
    ///
    /// Default: `true`
    pub fn configured_sites(mut self, enable: bool) -> Self {
        self.configured_sites = enable;
        self
    }

    /// Register an additional site client after the configured ones.
    pub fn with_site(self, client: DynSiteClient) -> Self {
        self.with_site_aliases(client, &[])
    }

    pub fn with_site_aliases(mut self, client: DynSiteClient, aliases: &[&str]) -> Self {
        self.extra_sites
            .push((client, aliases.iter().map(|a| a.to_string()).collect()));
        self
    }

    /// Keep sessions and blobs in memory instead of under the root.
    /// Favorites and downloads still live under the root.
    ///
    /// Default: `false`
    pub fn ephemeral(mut self, enable: bool) -> Self {
        self.persistent = !enable;
        self
    }

    pub fn build(self) -> Result<FalconCore> {
        let paths = AppPaths::new(self.root);
        paths.ensure_dirs()?;

        let settings = match self.settings {
            Some(settings) => settings,
            None => Settings::load_or_create(&paths.config_file())?,
        };
        settings.validate()?;

        let http = Arc::new(HttpClient::with_options(HttpClientOptions::from(&settings.network))?);

        let mut registry = if self.configured_sites {
            SiteRegistry::from_settings(&settings, http.clone())?
        } else {
            SiteRegistry::new()
        };
        for (client, aliases) in self.extra_sites {
            registry.register_with_aliases(client, &aliases)?;
        }
        if registry.is_empty() {
            return Err(FalconError::Config {
                message: "no sites registered".to_string(),
            });
        }
        let registry = Arc::new(registry);

        let (sessions, cache) = if self.persistent {
            (
                SessionManager::open(&paths, registry.clone(), settings.session.clone())?,
                CacheManager::open(&paths, &settings.cache)?,
            )
        } else {
            (
                SessionManager::in_memory(registry.clone(), settings.session.clone())?,
                CacheManager::in_memory(&settings.cache)?,
            )
        };

        let downloads = DownloadCoordinator::new(
            http.clone(),
            &settings.network,
            &settings.download,
            settings.download_dir(&paths),
        )?;
        let favorites = FavoritesStore::open(&paths.favorites_db())?;

        info!(
            "Falcon core ready at {} with {} site(s)",
            paths.root().display(),
            registry.len()
        );

        Ok(FalconCore {
            paths,
            settings,
            http,
            registry,
            sessions: Arc::new(sessions),
            cache,
            downloads,
            favorites: Arc::new(favorites),
        })
    }
}
