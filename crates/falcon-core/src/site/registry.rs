//! Registry of configured site clients.

use super::http::HttpSiteClient;
use super::types::{
    AuthContext, AuthGrant, Capability, Credentials, SearchPage, SearchQuery, SearchResult, Site, TagSuggestion,
};
use super::DynSiteClient;
use crate::config::Settings;
use crate::error::{FalconError, Result};
use crate::network::{HttpClient, RetryConfig};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Per-site result of a fan-out search.
#[derive(Debug)]
pub struct SiteOutcome {
    pub site_id: String,
    pub result: Result<SearchPage>,
}

/// Set of registered site clients, in registration order.
///
/// Lookups are case-insensitive and accept per-site aliases. Capabilities
/// are checked here before any client is invoked.
pub struct SiteRegistry {
    clients: Vec<DynSiteClient>,
    /// Lowercased id or alias to index in `clients`.
    names: HashMap<String, usize>,
    active: RwLock<Option<String>>,
}

impl std::fmt::Debug for SiteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteRegistry")
            .field("sites", &self.site_ids())
            .finish()
    }
}

impl Default for SiteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self {
            clients: Vec::new(),
            names: HashMap::new(),
            active: RwLock::new(None),
        }
    }

    /// Build an [`HttpSiteClient`] for every enabled site in `settings`.
    pub fn from_settings(settings: &Settings, http: Arc<HttpClient>) -> Result<Self> {
        let retry = RetryConfig::new().with_max_attempts(settings.network.max_retries.max(1));
        let mut registry = Self::new();

        for config in settings.sites.iter().filter(|s| s.enabled) {
            let aliases = config.aliases.clone();
            let client = HttpSiteClient::new(config.clone(), http.clone())
                .with_retry(retry.clone())
                .with_session_settings(&settings.session);
            registry.register_with_aliases(Arc::new(client), &aliases)?;
        }

        info!("Registered {} site(s)", registry.len());
        Ok(registry)
    }

    pub fn register(&mut self, client: DynSiteClient) -> Result<()> {
        self.register_with_aliases(client, &[])
    }

    /// Register a client. Duplicate ids or aliases are rejected.
    pub fn register_with_aliases(&mut self, client: DynSiteClient, aliases: &[String]) -> Result<()> {
        let id = client.site().id.clone();
        let index = self.clients.len();

        let mut keys = vec![id.to_lowercase()];
        keys.extend(aliases.iter().map(|a| a.to_lowercase()));
        for key in &keys {
            if self.names.contains_key(key) {
                return Err(FalconError::Config {
                    message: format!("Site name '{}' is already registered", key),
                });
            }
        }

        for key in keys {
            self.names.insert(key, index);
        }
        self.clients.push(client);
        debug!("Registered site {}", id);

        let mut active = self.active.write().map_err(|_| lock_poisoned())?;
        if active.is_none() {
            *active = Some(id);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Resolve an id or alias to its client.
    pub fn resolve(&self, name: &str) -> Result<DynSiteClient> {
        self.names
            .get(&name.trim().to_lowercase())
            .map(|&i| self.clients[i].clone())
            .ok_or_else(|| FalconError::SiteNotFound(name.to_string()))
    }

    /// Canonical id for an id or alias.
    pub fn canonical_id(&self, name: &str) -> Result<String> {
        Ok(self.resolve(name)?.site().id.clone())
    }

    pub fn site(&self, name: &str) -> Result<Site> {
        Ok(self.resolve(name)?.site().clone())
    }

    pub fn sites(&self) -> Vec<Site> {
        self.clients.iter().map(|c| c.site().clone()).collect()
    }

    pub fn site_ids(&self) -> Vec<String> {
        self.clients.iter().map(|c| c.site().id.clone()).collect()
    }

    pub fn supports(&self, name: &str, capability: Capability) -> Result<bool> {
        Ok(self.resolve(name)?.site().supports(capability))
    }

    /// Make `name` the active site.
    pub fn set_active(&self, name: &str) -> Result<()> {
        let id = self.canonical_id(name)?;
        *self.active.write().map_err(|_| lock_poisoned())? = Some(id);
        Ok(())
    }

    /// The active site, defaulting to the first registered one.
    pub fn active(&self) -> Result<DynSiteClient> {
        let active = self.active.read().map_err(|_| lock_poisoned())?.clone();
        match active {
            Some(id) => self.resolve(&id),
            None => Err(FalconError::SiteNotFound("<none registered>".to_string())),
        }
    }

    pub async fn search(&self, query: &SearchQuery, auth: Option<&AuthContext>) -> Result<SearchPage> {
        let client = self.resolve(&query.site_id)?;
        let site = client.site();
        site.require(Capability::Search)?;
        if query.page > 1 {
            site.require(Capability::Paginate)?;
        }
        client.search(query, auth).await
    }

    pub async fn fetch_detail(
        &self,
        site_id: &str,
        item_id: &str,
        auth: Option<&AuthContext>,
    ) -> Result<SearchResult> {
        let client = self.resolve(site_id)?;
        client.site().require(Capability::FetchDetail)?;
        client.fetch_detail(item_id, auth).await
    }

    pub async fn authenticate(&self, site_id: &str, credentials: &Credentials) -> Result<AuthGrant> {
        let client = self.resolve(site_id)?;
        client.site().require(Capability::Authenticate)?;
        client.authenticate(credentials).await
    }

    pub async fn refresh(&self, site_id: &str, refresh_token: &str) -> Result<AuthGrant> {
        let client = self.resolve(site_id)?;
        client.site().require(Capability::Refresh)?;
        client.refresh(refresh_token).await
    }

    pub async fn search_tags(
        &self,
        site_id: &str,
        prefix: &str,
        limit: u32,
        auth: Option<&AuthContext>,
    ) -> Result<Vec<TagSuggestion>> {
        let client = self.resolve(site_id)?;
        client.site().require(Capability::SearchTags)?;
        client.search_tags(prefix, limit, auth).await
    }
}

fn lock_poisoned() -> FalconError {
    FalconError::Other("site registry lock poisoned".to_string())
}
