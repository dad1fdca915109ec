//! Centralized configuration for Falcon Core.
//!
//! Compile-time defaults live in the constant holder structs below. Runtime
//! settings are a [`Settings`] document persisted as JSON under the data root,
//! created with defaults on first run and filled in field-by-field when older
//! files lack newer keys.

use crate::download::FilenameTemplate;
use crate::error::{FalconError, Result};
use crate::persist::{atomic_read_json, atomic_write_json};
use crate::site::{AuthScheme, Capability, FieldMap};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Application-level configuration.
pub struct AppConfig;

impl AppConfig {
    pub const APP_NAME: &'static str = "Falcon";
    pub const USER_AGENT: &'static str = "falcon/0.3";
}

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const MAX_RETRIES: u32 = 3;
    pub const CONCURRENT_DOWNLOADS: usize = 5;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(3);
    pub const RETRY_EXPONENTIAL_BASE: f64 = 1.5;
    pub const DOWNLOAD_TEMP_SUFFIX: &'static str = ".part";
    pub const THROTTLE_DELAY: Duration = Duration::from_millis(500);
}

/// Cache tier defaults.
pub struct CacheDefaults;

impl CacheDefaults {
    pub const METADATA_CAPACITY: usize = 2_000;
    pub const METADATA_TTL_SECS: u64 = 600;
    pub const BLOB_CAPACITY_BYTES: u64 = 1_000 * 1024 * 1024; // 1000MB
}

/// Session lifetime defaults.
pub struct SessionConfig;

impl SessionConfig {
    pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);
    pub const DEFAULT_TTL_HOURS: u64 = 24;
    pub const REMEMBER_TTL_DAYS: u64 = 30;
}

/// Shared directory and path configurations.
pub struct PathsConfig;

impl PathsConfig {
    pub const DATA_DIR_NAME: &'static str = ".falcon";
    pub const CONFIG_FILENAME: &'static str = "config.json";
    pub const SESSIONS_FILENAME: &'static str = "sessions.json";
    pub const SESSION_KEY_FILENAME: &'static str = "session.key";
    pub const CACHE_DIR_NAME: &'static str = "cache";
    pub const BLOB_DB_FILENAME: &'static str = "blobs.sqlite";
    pub const FAVORITES_DB_FILENAME: &'static str = "favorites.sqlite";
    pub const DOWNLOADS_DIR_NAME: &'static str = "downloads";
}

/// Resolved on-disk layout under one data root.
#[derive(Debug, Clone)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.falcon`, the default data root.
    pub fn default_root() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| FalconError::Config {
            message: "Could not determine home directory".to_string(),
        })?;
        Ok(home.join(PathsConfig::DATA_DIR_NAME))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(PathsConfig::CONFIG_FILENAME)
    }

    pub fn session_store(&self) -> PathBuf {
        self.root.join(PathsConfig::SESSIONS_FILENAME)
    }

    pub fn session_key(&self) -> PathBuf {
        self.root.join(PathsConfig::SESSION_KEY_FILENAME)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(PathsConfig::CACHE_DIR_NAME)
    }

    pub fn blob_db(&self) -> PathBuf {
        self.cache_dir().join(PathsConfig::BLOB_DB_FILENAME)
    }

    pub fn favorites_db(&self) -> PathBuf {
        self.root.join(PathsConfig::FAVORITES_DB_FILENAME)
    }

    pub fn default_download_dir(&self) -> PathBuf {
        self.root.join(PathsConfig::DOWNLOADS_DIR_NAME)
    }

    /// Create the root and cache directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.root.clone(), self.cache_dir()] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir).map_err(|e| FalconError::io_with_path(e, &dir))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowSettings {
    pub width: u32,
    pub height: u32,
    pub maximized: bool,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            width: 1200,
            height: 800,
            maximized: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppearanceSettings {
    pub theme: String,
    pub font: String,
    pub language: String,
}

impl Default for AppearanceSettings {
    fn default() -> Self {
        Self {
            theme: "dark".to_string(),
            font: "Sans Serif,11".to_string(),
            language: "en_US".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl ProxySettings {
    /// Proxy URL when the proxy is enabled and fully specified.
    pub fn url(&self) -> Option<String> {
        if self.enabled && !self.host.is_empty() && self.port > 0 {
            Some(format!("http://{}:{}", self.host, self.port))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub concurrent_downloads: usize,
    pub proxy: ProxySettings,
}

impl NetworkSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            timeout_secs: NetworkConfig::REQUEST_TIMEOUT.as_secs(),
            max_retries: NetworkConfig::MAX_RETRIES,
            concurrent_downloads: NetworkConfig::CONCURRENT_DOWNLOADS,
            proxy: ProxySettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// Target directory; empty means `<root>/downloads`.
    pub path: String,
    pub create_subfolder: bool,
    pub filename_format: String,
    pub save_metadata: bool,
    /// Per-file size ceiling in MB, 0 = unlimited.
    pub max_file_size_mb: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            path: String::new(),
            create_subfolder: true,
            filename_format: "{site}_{id}".to_string(),
            save_metadata: false,
            max_file_size_mb: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub metadata_capacity: usize,
    pub metadata_ttl_secs: Option<u64>,
    pub blob_capacity_bytes: u64,
    pub blob_ttl_secs: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            metadata_capacity: CacheDefaults::METADATA_CAPACITY,
            metadata_ttl_secs: Some(CacheDefaults::METADATA_TTL_SECS),
            blob_capacity_bytes: CacheDefaults::BLOB_CAPACITY_BYTES,
            blob_ttl_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub refresh_margin_secs: u64,
    pub default_ttl_hours: u64,
    pub remember_ttl_days: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            refresh_margin_secs: SessionConfig::REFRESH_MARGIN.as_secs(),
            default_ttl_hours: SessionConfig::DEFAULT_TTL_HOURS,
            remember_ttl_days: SessionConfig::REMEMBER_TTL_DAYS,
        }
    }
}

/// Endpoint layout of a JSON site API, relative to `base_url`.
///
/// `{id}` in `detail` is replaced with the item id. Tag searches send the
/// prefix followed by `*` in `tag_name_param`, plus the fixed `tag_params`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteEndpoints {
    pub search: String,
    pub detail: Option<String>,
    pub verify: Option<String>,
    pub refresh: Option<String>,
    pub count: Option<String>,
    pub tag_search: Option<String>,
    pub tags_param: String,
    pub page_param: String,
    pub limit_param: String,
    pub tag_name_param: String,
    pub tag_params: BTreeMap<String, String>,
}

impl Default for SiteEndpoints {
    fn default() -> Self {
        Self {
            search: "/posts.json".to_string(),
            detail: None,
            verify: None,
            refresh: None,
            count: None,
            tag_search: None,
            tags_param: "tags".to_string(),
            page_param: "page".to_string(),
            limit_param: "limit".to_string(),
            tag_name_param: "name".to_string(),
            tag_params: BTreeMap::new(),
        }
    }
}

/// Declarative description of one external site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default)]
    pub auth_scheme: AuthScheme,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub endpoints: SiteEndpoints,
    #[serde(default)]
    pub fields: FieldMap,
}

fn default_true() -> bool {
    true
}

fn default_page_size() -> u32 {
    20
}

impl SiteConfig {
    fn danbooru() -> Self {
        Self {
            id: "danbooru".to_string(),
            name: "Danbooru".to_string(),
            base_url: "https://danbooru.donmai.us".to_string(),
            aliases: Vec::new(),
            enabled: true,
            capabilities: vec![
                Capability::Search,
                Capability::Paginate,
                Capability::Authenticate,
                Capability::FetchDetail,
                Capability::SearchTags,
            ],
            requires_auth: false,
            auth_scheme: AuthScheme::Basic,
            page_size: 20,
            endpoints: SiteEndpoints {
                search: "/posts.json".to_string(),
                detail: Some("/posts/{id}.json".to_string()),
                verify: Some("/profile.json".to_string()),
                refresh: None,
                count: Some("/counts/posts.json".to_string()),
                tag_search: Some("/tags.json".to_string()),
                tag_name_param: "search[name_matches]".to_string(),
                tag_params: BTreeMap::from([
                    ("search[order]".to_string(), "count".to_string()),
                    ("search[hide_empty]".to_string(), "true".to_string()),
                ]),
                ..SiteEndpoints::default()
            },
            fields: FieldMap {
                thumbnail: "/preview_file_url".to_string(),
                full: "/file_url".to_string(),
                tags: Some("/tag_string".to_string()),
                count: Some("/counts/posts".to_string()),
                tag_count: "/post_count".to_string(),
                tag_kind: Some("/category".to_string()),
                ..FieldMap::default()
            },
        }
    }

    fn moebooru(id: &str, name: &str, base_url: &str, aliases: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            base_url: base_url.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            enabled: true,
            capabilities: vec![
                Capability::Search,
                Capability::Paginate,
                Capability::FetchDetail,
                Capability::SearchTags,
            ],
            requires_auth: false,
            auth_scheme: AuthScheme::Query,
            page_size: 20,
            endpoints: SiteEndpoints {
                search: "/post.json".to_string(),
                detail: Some("/post.json?tags=id:{id}".to_string()),
                tag_search: Some("/tag.json".to_string()),
                tag_params: BTreeMap::from([("order".to_string(), "name".to_string())]),
                ..SiteEndpoints::default()
            },
            fields: FieldMap {
                thumbnail: "/preview_url".to_string(),
                full: "/file_url".to_string(),
                tags: Some("/tags".to_string()),
                ..FieldMap::default()
            },
        }
    }
}

/// Persisted runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub window: WindowSettings,
    pub appearance: AppearanceSettings,
    pub network: NetworkSettings,
    pub download: DownloadSettings,
    pub cache: CacheSettings,
    pub session: SessionSettings,
    pub sites: Vec<SiteConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            window: WindowSettings::default(),
            appearance: AppearanceSettings::default(),
            network: NetworkSettings::default(),
            download: DownloadSettings::default(),
            cache: CacheSettings::default(),
            session: SessionSettings::default(),
            sites: vec![
                SiteConfig::danbooru(),
                SiteConfig::moebooru("konachan", "Konachan", "https://konachan.net", &[]),
                SiteConfig::moebooru("yandere", "Yande.re", "https://yande.re", &["yande.re", "yande"]),
            ],
        }
    }
}

impl Settings {
    /// Load settings from `path`, creating the file with defaults if missing.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        match atomic_read_json::<Settings>(path)? {
            Some(settings) => {
                settings.validate()?;
                debug!("Loaded settings from {}", path.display());
                Ok(settings)
            }
            None => {
                let settings = Settings::default();
                settings.save(path)?;
                info!("Created default settings at {}", path.display());
                Ok(settings)
            }
        }
    }

    /// Persist settings atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        atomic_write_json(path, self, true)
    }

    /// Reject settings that would fail later at use sites.
    pub fn validate(&self) -> Result<()> {
        FilenameTemplate::parse(&self.download.filename_format)?;

        if self.network.proxy.enabled && (self.network.proxy.host.is_empty() || self.network.proxy.port == 0) {
            return Err(FalconError::Config {
                message: "Proxy is enabled but host or port is missing".to_string(),
            });
        }

        if self.network.concurrent_downloads == 0 {
            return Err(FalconError::Validation {
                field: "network.concurrent_downloads".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for site in &self.sites {
            if site.id.trim().is_empty() {
                return Err(FalconError::Validation {
                    field: "sites.id".to_string(),
                    message: "site id must not be empty".to_string(),
                });
            }
            if !seen.insert(site.id.to_lowercase()) {
                return Err(FalconError::Config {
                    message: format!("Duplicate site id: {}", site.id),
                });
            }
            url::Url::parse(&site.base_url).map_err(|e| FalconError::Config {
                message: format!("Invalid base_url for {}: {}", site.id, e),
            })?;
        }

        Ok(())
    }

    /// Resolved download directory.
    pub fn download_dir(&self, paths: &AppPaths) -> PathBuf {
        if self.download.path.trim().is_empty() {
            paths.default_download_dir()
        } else {
            PathBuf::from(&self.download.path)
        }
    }

    pub fn metadata_ttl(&self) -> Option<Duration> {
        self.cache.metadata_ttl_secs.map(Duration::from_secs)
    }

    pub fn blob_ttl(&self) -> Option<Duration> {
        self.cache.blob_ttl_secs.map(Duration::from_secs)
    }
}
