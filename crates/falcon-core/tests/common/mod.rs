//! Shared fixtures: an in-process site and a core built around it.

#![allow(dead_code)]

use async_trait::async_trait;
use falcon_core::config::Settings;
use falcon_core::error::{FalconError, Result};
use falcon_core::site::{
    AuthContext, AuthGrant, Capability, Credentials, SearchPage, SearchQuery, SearchResult, Site, SiteClient,
    TagSuggestion,
};
use falcon_core::FalconCore;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PAGE_SIZE: usize = 20;
pub const OFFLINE_BASE: &str = "http://127.0.0.1:1";

/// Site that serves generated results from memory.
pub struct MockSite {
    site: Site,
    pub search_calls: AtomicUsize,
    pub detail_calls: AtomicUsize,
    pub delay: Duration,
    pub grant_ttl: Option<Duration>,
    pub seen_tokens: Mutex<Vec<Option<String>>>,
}

impl MockSite {
    pub fn new(id: &str) -> Self {
        Self {
            site: Site::new(
                id,
                format!("https://{}.example", id),
                [
                    Capability::Search,
                    Capability::Paginate,
                    Capability::FetchDetail,
                    Capability::Authenticate,
                    Capability::SearchTags,
                ],
            ),
            search_calls: AtomicUsize::new(0),
            detail_calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            grant_ttl: None,
            seen_tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_grant_ttl(mut self, ttl: Duration) -> Self {
        self.grant_ttl = Some(ttl);
        self
    }

    pub fn calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }

    pub fn result(&self, id: usize) -> SearchResult {
        SearchResult {
            item_id: id.to_string(),
            site_id: self.site.id.clone(),
            thumbnail_ref: format!("{}/thumb/{}.jpg", OFFLINE_BASE, id),
            full_ref: format!("{}/full/{}.png", OFFLINE_BASE, id),
            metadata: BTreeMap::from([("title".to_string(), format!("item {}", id))]),
        }
    }
}

#[async_trait]
impl SiteClient for MockSite {
    fn site(&self) -> &Site {
        &self.site
    }

    async fn search(&self, query: &SearchQuery, auth: Option<&AuthContext>) -> Result<SearchPage> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut tokens) = self.seen_tokens.lock() {
            tokens.push(auth.map(|a| a.token.clone()));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let start = (query.page as usize - 1) * PAGE_SIZE;
        Ok(SearchPage {
            site_id: self.site.id.clone(),
            page: query.page,
            items: (start..start + PAGE_SIZE).map(|id| self.result(id)).collect(),
            has_more: true,
            total: None,
        })
    }

    async fn fetch_detail(&self, item_id: &str, _auth: Option<&AuthContext>) -> Result<SearchResult> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let id: usize = item_id.parse().map_err(|_| FalconError::Parse {
            site: self.site.id.clone(),
            message: format!("bad id {}", item_id),
        })?;
        Ok(self.result(id))
    }

    async fn search_tags(&self, prefix: &str, limit: u32, _auth: Option<&AuthContext>) -> Result<Vec<TagSuggestion>> {
        Ok(["ears", "tail", "girl"]
            .iter()
            .enumerate()
            .map(|(i, suffix)| TagSuggestion {
                name: format!("{}_{}", prefix, suffix),
                post_count: 1000 / (i as u64 + 1),
                kind: None,
            })
            .take(limit as usize)
            .collect())
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthGrant> {
        if credentials.secret != "hunter2" {
            return Err(FalconError::Auth {
                site: self.site.id.clone(),
                message: "invalid api key".to_string(),
            });
        }
        Ok(AuthGrant {
            token: format!("token-for-{}", credentials.username),
            refresh_token: None,
            expires_in: self.grant_ttl,
        })
    }
}

/// Settings that keep tests fast and local.
pub fn test_settings(root: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.sites.clear();
    settings.network.max_retries = 2;
    settings.network.timeout_secs = 5;
    settings.download.path = root.join("downloads").to_string_lossy().into_owned();
    settings.cache.metadata_capacity = 100;
    settings.cache.blob_capacity_bytes = 64 * 1024;
    settings
}

pub fn build_core(root: &Path, site: Arc<MockSite>) -> FalconCore {
    FalconCore::builder(root)
        .with_settings(test_settings(root))
        .configured_sites(false)
        .with_site_aliases(site, &["mock.example"])
        .ephemeral(true)
        .build()
        .expect("core should build")
}
