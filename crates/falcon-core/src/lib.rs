//! Falcon Core - headless library behind the Falcon multi-site image browser.
//!
//! The crate owns everything below the UI: site clients and their registry,
//! per-site sessions, the two-tier cache, download coordination and
//! favorites. A UI or CLI builds one [`FalconCore`] at startup and calls
//! into it; the core never calls back.
//!
//! # Example
//!
//! ```rust,ignore
//! use falcon_core::FalconCore;
//!
//! #[tokio::main]
//! async fn main() -> falcon_core::Result<()> {
//!     let core = FalconCore::builder("/home/me/.falcon").build()?;
//!
//!     let page = core.search("danbooru", &["scenery"], 1).await?;
//!     println!("{} results, more: {}", page.items.len(), page.has_more);
//!
//!     let thumb = core.thumbnail(&page.items[0]).await?;
//!     println!("thumbnail is {} bytes", thumb.len());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cancel;
pub mod config;
pub mod download;
pub mod error;
pub mod favorites;
pub mod hashing;
pub mod network;
pub mod persist;
pub mod session;
pub mod site;

mod builder;

pub use builder::FalconCoreBuilder;
pub use cache::{CacheEntry, CacheKey, CacheManager, CacheStats, TierStats, Variant};
pub use cancel::{CancellationToken, CancelledError};
pub use config::{AppPaths, Settings};
pub use download::{DownloadCoordinator, DownloadRequest, FilenameTemplate};
pub use error::{ErrorKind, FalconError, Result};
pub use favorites::{Collection, FavoritesStore, MergeStrategy, Snapshot};
pub use network::HttpClient;
pub use session::{Session, SessionManager};
pub use site::{
    Capability, Credentials, DynSiteClient, ItemRef, SearchPage, SearchQuery, SearchResult, Site,
    SiteClient, SiteOutcome, SiteRegistry, TagSuggestion,
};

use bytes::Bytes;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// The assembled core: one per process, shared by reference.
pub struct FalconCore {
    paths: AppPaths,
    settings: Settings,
    http: Arc<HttpClient>,
    registry: Arc<SiteRegistry>,
    sessions: Arc<SessionManager>,
    cache: CacheManager,
    downloads: DownloadCoordinator,
    favorites: Arc<FavoritesStore>,
}

impl std::fmt::Debug for FalconCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FalconCore")
            .field("root", &self.paths.root())
            .field("sites", &self.registry.site_ids())
            .finish_non_exhaustive()
    }
}

impl FalconCore {
    /// Start configuring a core rooted at `root`.
    ///
    /// ```rust,ignore
    /// let core = FalconCore::builder(AppPaths::default_root()?)
    ///     .with_site(my_client)
    ///     .build()?;
    /// ```
    pub fn builder(root: impl Into<PathBuf>) -> FalconCoreBuilder {
        FalconCoreBuilder::new(root)
    }

    /// Search one site. Pages are served from the metadata tier when every
    /// item of a previously fetched page is still cached.
    ///
    /// The session is read inside the fetch, after the cache has stamped the
    /// site's generation; a login racing the fetch therefore either supplies
    /// the token or keeps the anonymous page out of the cache.
    pub async fn search<S: AsRef<str>>(&self, site: &str, tags: &[S], page: u32) -> Result<SearchPage> {
        let site_id = self.registry.canonical_id(site)?;
        let query = SearchQuery::new(site_id.as_str(), tags, page);

        let registry = self.registry.clone();
        let sessions = self.sessions.clone();
        let fetch_query = query.clone();
        let page = self
            .cache
            .get_or_fetch_page(&query, move || async move {
                let auth = sessions.optional_auth(&fetch_query.site_id).await?;
                registry.search(&fetch_query, auth.as_ref()).await
            })
            .await?;

        self.favorites.record_observed(&page.items)?;
        if let Err(e) = self.favorites.record_search(&query) {
            warn!("Failed to record search history: {}", e);
        }
        debug!(
            "Search {} [{}] page {}: {} item(s)",
            query.site_id,
            query.tag_string(),
            query.page,
            page.items.len()
        );
        Ok(page)
    }

    /// Search every search-capable site concurrently. Each site succeeds or
    /// fails on its own.
    pub async fn search_all<S: AsRef<str>>(&self, tags: &[S], page: u32) -> Vec<SiteOutcome> {
        let searches = self
            .registry
            .sites()
            .into_iter()
            .filter(|site| site.supports(Capability::Search))
            .map(|site| async move {
                let result = self.search(&site.id, tags, page).await;
                SiteOutcome {
                    site_id: site.id,
                    result,
                }
            });
        join_all(searches).await
    }

    /// Up to `limit` tags of `site` starting with `prefix`, in the order the
    /// site ranks them. Suggestions are not cached.
    pub async fn search_tags(&self, site: &str, prefix: &str, limit: u32) -> Result<Vec<TagSuggestion>> {
        let site_id = self.registry.canonical_id(site)?;
        let auth = self.sessions.optional_auth(&site_id).await?;
        self.registry
            .search_tags(&site_id, prefix, limit, auth.as_ref())
            .await
    }

    /// Fetch full metadata for one item from its site and refresh the
    /// cached copy.
    pub async fn fetch_detail(&self, item: &ItemRef) -> Result<SearchResult> {
        let site_id = self.registry.canonical_id(&item.site_id)?;
        let generation = self.cache.generation(&site_id)?;
        let auth = self.sessions.optional_auth(&site_id).await?;
        let result = self
            .registry
            .fetch_detail(&site_id, &item.item_id, auth.as_ref())
            .await?;

        self.cache.put_metadata_since(result.clone(), generation)?;
        self.favorites.record_observed(std::slice::from_ref(&result))?;
        Ok(result)
    }

    /// Cached metadata for `item`, fetching the detail on a miss. Concurrent
    /// lookups of one uncached item share a single detail request.
    pub async fn lookup(&self, item: &ItemRef) -> Result<SearchResult> {
        let site_id = self.registry.canonical_id(&item.site_id)?;
        let key = CacheKey::metadata(&ItemRef::new(site_id.as_str(), item.item_id.as_str()));

        let registry = self.registry.clone();
        let sessions = self.sessions.clone();
        let favorites = self.favorites.clone();
        let item_id = item.item_id.clone();
        let entry = self
            .cache
            .get_or_fetch(key, move || async move {
                let auth = sessions.optional_auth(&site_id).await?;
                let result = registry.fetch_detail(&site_id, &item_id, auth.as_ref()).await?;
                favorites.record_observed(std::slice::from_ref(&result))?;
                Ok(result)
            })
            .await?;

        entry
            .metadata()
            .cloned()
            .ok_or_else(|| FalconError::Other(format!("cache entry {} holds no metadata", entry.key)))
    }

    /// Thumbnail bytes, from the blob tier or the network.
    pub async fn thumbnail(&self, result: &SearchResult) -> Result<Bytes> {
        self.blob(CacheKey::thumbnail(&result.item_ref()), &result.thumbnail_ref)
            .await
    }

    /// Full image bytes, from the blob tier or the network.
    pub async fn full_image(&self, result: &SearchResult) -> Result<Bytes> {
        self.blob(CacheKey::full(&result.item_ref()), &result.full_ref).await
    }

    async fn blob(&self, key: CacheKey, url: &str) -> Result<Bytes> {
        let downloads = self.downloads.clone();
        let url = url.to_string();
        let entry = self
            .cache
            .get_or_fetch(key, move || async move { downloads.fetch_bytes(&url).await })
            .await?;
        entry.blob().cloned().ok_or_else(|| {
            FalconError::Other(format!("cache entry {} holds no blob", entry.key))
        })
    }

    /// Save the full image of `result` to the download directory.
    pub async fn download(&self, result: &SearchResult) -> Result<PathBuf> {
        self.downloads.fetch(&DownloadRequest::for_result(result)).await
    }

    /// Log in to a site. Cached content for the site is dropped since what
    /// it shows may depend on the account.
    pub async fn login(&self, site: &str, credentials: &Credentials) -> Result<Session> {
        let session = self.sessions.login(site, credentials).await?;
        self.cache.invalidate_site(&session.site_id)?;
        Ok(session)
    }

    /// Log out of a site and drop its cached content.
    pub fn logout(&self, site: &str) -> Result<bool> {
        let site_id = self.registry.canonical_id(site)?;
        let removed = self.sessions.logout(&site_id)?;
        self.cache.invalidate_site(&site_id)?;
        Ok(removed)
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn http(&self) -> &Arc<HttpClient> {
        &self.http
    }

    pub fn registry(&self) -> &Arc<SiteRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn downloads(&self) -> &DownloadCoordinator {
        &self.downloads
    }

    pub fn favorites(&self) -> &Arc<FavoritesStore> {
        &self.favorites
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
