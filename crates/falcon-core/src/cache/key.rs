//! Content-addressed cache keys.

use crate::hashing::sha256_parts;
use crate::site::{ItemRef, SearchQuery};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which representation of an item an entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Metadata,
    Thumbnail,
    Full,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Metadata => "metadata",
            Variant::Thumbnail => "thumbnail",
            Variant::Full => "full",
        }
    }

    pub fn is_blob(&self) -> bool {
        !matches!(self, Variant::Metadata)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one cache entry: SHA-256 of `(site_id, item_id, variant)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub site_id: String,
    pub item_id: String,
    pub variant: Variant,
    digest: String,
}

impl CacheKey {
    pub fn new(site_id: impl Into<String>, item_id: impl Into<String>, variant: Variant) -> Self {
        let site_id = site_id.into();
        let item_id = item_id.into();
        let digest = sha256_parts([site_id.as_str(), item_id.as_str(), variant.as_str()]);
        Self {
            site_id,
            item_id,
            variant,
            digest,
        }
    }

    pub fn metadata(item: &ItemRef) -> Self {
        Self::new(&item.site_id, &item.item_id, Variant::Metadata)
    }

    pub fn thumbnail(item: &ItemRef) -> Self {
        Self::new(&item.site_id, &item.item_id, Variant::Thumbnail)
    }

    pub fn full(item: &ItemRef) -> Self {
        Self::new(&item.site_id, &item.item_id, Variant::Full)
    }

    /// Hex digest used as the storage key.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn item_ref(&self) -> ItemRef {
        ItemRef::new(&self.site_id, &self.item_id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.site_id, self.item_id, self.variant)
    }
}

/// Identity of one search page: SHA-256 of site, page and ordered tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub site_id: String,
    digest: String,
}

impl QueryKey {
    pub fn new(query: &SearchQuery) -> Self {
        let page = query.page.to_string();
        let parts = [query.site_id.as_str(), page.as_str()]
            .into_iter()
            .chain(query.tags.iter().map(String::as_str));
        Self {
            site_id: query.site_id.clone(),
            digest: sha256_parts(parts),
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}
