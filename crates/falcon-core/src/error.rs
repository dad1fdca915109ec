//! Error types for Falcon Core.
//!
//! Every failure that crosses a component boundary is expressed as a
//! [`FalconError`]. Transport and storage errors from `reqwest`, `rusqlite`,
//! `serde_json` and `std::io` are converted into message-carrying variants so
//! that callers see a stable [`ErrorKind`] plus a readable cause, never the raw
//! library error.
//!
//! The type is `Clone` because a single failed fetch is fanned out to every
//! caller waiting on the same key.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for Falcon Core.
#[derive(Debug, Clone, Error)]
pub enum FalconError {
    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited by {service}, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        service: String,
        retry_after_secs: Option<u64>,
    },

    // Authentication errors
    #[error("Authentication failed for {site}: {message}")]
    Auth { site: String, message: String },

    #[error("No session for {site}")]
    NoSession { site: String },

    #[error("Session expired for {site}, please log in again")]
    SessionExpired { site: String },

    // Site protocol errors
    #[error("Failed to parse response from {site}: {message}")]
    Parse { site: String, message: String },

    #[error("Site {site} does not support {capability}")]
    UnsupportedCapability { site: String, capability: String },

    #[error("Unknown site: {0}")]
    SiteNotFound(String),

    // Download errors
    #[error("Download failed for {url} after {attempts} attempt(s): {cause}")]
    Download {
        url: String,
        attempts: u32,
        cause: String,
    },

    #[error("Download cancelled")]
    Cancelled,

    // Favorites errors
    #[error("Import failed: {message}")]
    Import { message: String },

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Item {site_id}/{item_id} was never observed in a search result")]
    UnknownItem { site_id: String, item_id: String },

    // Storage errors
    #[error("Database error: {message}")]
    Database { message: String },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    #[error("JSON error: {message}")]
    Json { message: String },

    #[error("Secret store error: {message}")]
    Crypto { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Falcon operations.
pub type Result<T> = std::result::Result<T, FalconError>;

/// Stable classification of a [`FalconError`], suitable for UI collaborators
/// that need to branch on the failure without matching message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Timeout,
    Auth,
    NoSession,
    SessionExpired,
    RateLimited,
    Parse,
    UnsupportedCapability,
    Download,
    Import,
    NotFound,
    Storage,
    Config,
    Validation,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Auth => "auth",
            ErrorKind::NoSession => "no_session",
            ErrorKind::SessionExpired => "session_expired",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Parse => "parse",
            ErrorKind::UnsupportedCapability => "unsupported_capability",
            ErrorKind::Download => "download",
            ErrorKind::Import => "import",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Storage => "storage",
            ErrorKind::Config => "config",
            ErrorKind::Validation => "validation",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Conversion implementations for common error types

impl From<std::io::Error> for FalconError {
    fn from(err: std::io::Error) -> Self {
        FalconError::Io {
            message: err.to_string(),
            path: None,
        }
    }
}

impl From<serde_json::Error> for FalconError {
    fn from(err: serde_json::Error) -> Self {
        FalconError::Json {
            message: err.to_string(),
        }
    }
}

impl From<rusqlite::Error> for FalconError {
    fn from(err: rusqlite::Error) -> Self {
        FalconError::Database {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for FalconError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FalconError::Timeout(Duration::from_secs(0))
        } else {
            FalconError::Network {
                message: err.to_string(),
                cause: std::error::Error::source(&err).map(|s| s.to_string()),
            }
        }
    }
}

impl FalconError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        FalconError::Io {
            message: err.to_string(),
            path: Some(path.into()),
        }
    }

    /// Stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FalconError::Network { .. } | FalconError::Http { .. } => ErrorKind::Network,
            FalconError::Timeout(_) => ErrorKind::Timeout,
            FalconError::RateLimited { .. } => ErrorKind::RateLimited,
            FalconError::Auth { .. } => ErrorKind::Auth,
            FalconError::NoSession { .. } => ErrorKind::NoSession,
            FalconError::SessionExpired { .. } => ErrorKind::SessionExpired,
            FalconError::Parse { .. } => ErrorKind::Parse,
            FalconError::UnsupportedCapability { .. } => ErrorKind::UnsupportedCapability,
            FalconError::Download { .. } => ErrorKind::Download,
            FalconError::Cancelled => ErrorKind::Cancelled,
            FalconError::Import { .. } => ErrorKind::Import,
            FalconError::SiteNotFound(_)
            | FalconError::CollectionNotFound(_)
            | FalconError::UnknownItem { .. } => ErrorKind::NotFound,
            FalconError::Database { .. }
            | FalconError::Io { .. }
            | FalconError::Json { .. }
            | FalconError::Crypto { .. } => ErrorKind::Storage,
            FalconError::Config { .. } => ErrorKind::Config,
            FalconError::Validation { .. } => ErrorKind::Validation,
            FalconError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error should trigger a retry.
    ///
    /// HTTP status failures are retryable only for 408, 429 and 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            FalconError::Network { .. } | FalconError::Timeout(_) | FalconError::RateLimited { .. } => {
                true
            }
            FalconError::Http { status, .. } => matches!(*status, 408 | 429 | 500..=599),
            _ => false,
        }
    }

    /// Server-requested delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FalconError::RateLimited {
                retry_after_secs: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    /// Whether the UI collaborator must prompt the user to log in again.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            FalconError::Auth { .. } | FalconError::NoSession { .. } | FalconError::SessionExpired { .. }
        )
    }
}
