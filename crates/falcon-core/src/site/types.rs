//! Value types shared by every site integration.

use crate::config::SiteConfig;
use crate::error::{FalconError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// An operation a site integration may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Search,
    Paginate,
    Authenticate,
    FetchDetail,
    /// Auth grants carry a refresh token usable for silent renewal.
    Refresh,
    /// Tag names can be looked up by prefix.
    SearchTags,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Search => "search",
            Capability::Paginate => "paginate",
            Capability::Authenticate => "authenticate",
            Capability::FetchDetail => "fetch_detail",
            Capability::Refresh => "refresh",
            Capability::SearchTags => "search_tags",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A known tag offered while the user types a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSuggestion {
    pub name: String,
    pub post_count: u64,
    /// Site-specific category (artist, character, ...), when reported.
    pub kind: Option<String>,
}

/// How credentials are attached to outbound requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    #[default]
    None,
    /// HTTP basic auth with username and API key.
    Basic,
    /// `Authorization: Bearer <token>`, token obtained from the verify endpoint.
    Bearer,
    /// `login` and `api_key` query parameters.
    Query,
}

/// Immutable description of a registered site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub capabilities: BTreeSet<Capability>,
    pub requires_auth: bool,
}

impl Site {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            base_url: base_url.into(),
            capabilities: capabilities.into_iter().collect(),
            requires_auth: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_requires_auth(mut self, requires_auth: bool) -> Self {
        self.requires_auth = requires_auth;
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Fail fast with `UnsupportedCapability` when `capability` is missing.
    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(FalconError::UnsupportedCapability {
                site: self.id.clone(),
                capability: capability.to_string(),
            })
        }
    }
}

impl From<&SiteConfig> for Site {
    fn from(config: &SiteConfig) -> Self {
        let name = if config.name.is_empty() {
            config.id.clone()
        } else {
            config.name.clone()
        };
        Site {
            id: config.id.clone(),
            name,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            capabilities: config.capabilities.iter().copied().collect(),
            requires_auth: config.requires_auth,
        }
    }
}

/// A tag search against one site. Pages are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchQuery {
    pub site_id: String,
    pub tags: Vec<String>,
    pub page: u32,
}

impl SearchQuery {
    /// Build a query; blank tags are dropped and page 0 becomes page 1.
    pub fn new<S: AsRef<str>>(site_id: impl Into<String>, tags: &[S], page: u32) -> Self {
        Self {
            site_id: site_id.into(),
            tags: tags
                .iter()
                .map(|t| t.as_ref().trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            page: page.max(1),
        }
    }

    pub fn with_page(&self, page: u32) -> Self {
        Self {
            page: page.max(1),
            ..self.clone()
        }
    }

    /// Tags as one space-separated parameter, order preserved.
    pub fn tag_string(&self) -> String {
        self.tags.join(" ")
    }
}

/// Globally unique reference to one item: `(site_id, item_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemRef {
    pub site_id: String,
    pub item_id: String,
}

impl ItemRef {
    pub fn new(site_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            item_id: item_id.into(),
        }
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.site_id, self.item_id)
    }
}

/// One item as returned by a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub item_id: String,
    pub site_id: String,
    pub thumbnail_ref: String,
    pub full_ref: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl SearchResult {
    pub fn item_ref(&self) -> ItemRef {
        ItemRef::new(&self.site_id, &self.item_id)
    }

    pub fn title(&self) -> Option<&str> {
        self.metadata.get("title").map(String::as_str)
    }
}

/// One normalized page of search results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPage {
    pub site_id: String,
    pub page: u32,
    pub items: Vec<SearchResult>,
    pub has_more: bool,
    /// Total matches when the site reports it.
    pub total: Option<u64>,
}

/// User-supplied login material. `secret` is a password or API key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
    #[serde(default)]
    pub remember: bool,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
            remember: false,
        }
    }

    pub fn remember(mut self, remember: bool) -> Self {
        self.remember = remember;
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("remember", &self.remember)
            .finish()
    }
}

/// Result of a successful authentication or refresh.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthGrant {
    pub token: String,
    pub refresh_token: Option<String>,
    /// Lifetime of `token`; `None` falls back to the configured default.
    pub expires_in: Option<Duration>,
}

impl fmt::Debug for AuthGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGrant")
            .field("token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Decrypted auth material for one outbound call. Never persisted.
#[derive(Clone)]
pub struct AuthContext {
    pub site_id: String,
    pub username: String,
    pub token: String,
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("site_id", &self.site_id)
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}
