//! Cache entries and statistics.

use super::key::CacheKey;
use crate::site::SearchResult;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// What an entry holds.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Metadata(Arc<SearchResult>),
    Blob(Bytes),
}

impl Payload {
    /// Size charged against a tier. Metadata entries are counted, not sized,
    /// so this is only meaningful for blobs.
    pub fn size_bytes(&self) -> u64 {
        match self {
            Payload::Metadata(_) => 0,
            Payload::Blob(bytes) => bytes.len() as u64,
        }
    }
}

impl From<SearchResult> for Payload {
    fn from(result: SearchResult) -> Self {
        Payload::Metadata(Arc::new(result))
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Blob(bytes)
    }
}

/// One cached value with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: Payload,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub hit_count: u64,
    pub ttl: Option<Duration>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, payload: Payload, ttl: Option<Duration>) -> Self {
        let now = Utc::now();
        Self {
            key,
            size_bytes: payload.size_bytes(),
            payload,
            created_at: now,
            last_access_at: now,
            hit_count: 0,
            ttl,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok()) {
            Some(ttl) => now >= self.created_at + ttl,
            None => false,
        }
    }

    pub fn metadata(&self) -> Option<&SearchResult> {
        match &self.payload {
            Payload::Metadata(result) => Some(result.as_ref()),
            Payload::Blob(_) => None,
        }
    }

    pub fn blob(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Blob(bytes) => Some(bytes),
            Payload::Metadata(_) => None,
        }
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.last_access_at = now;
        self.hit_count += 1;
    }
}

/// Counters for one tier.
///
/// `current_size` is an entry count for the metadata tier and bytes for the
/// blob tier; `capacity` uses the same unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub eviction_count: u64,
    pub current_size: u64,
    pub capacity: u64,
    pub entries: u64,
    /// Callers that joined an in-flight fetch instead of starting one.
    pub coalesced: u64,
}

impl TierStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Snapshot of both tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub metadata: TierStats,
    pub blob: TierStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Variant;

    #[test]
    fn test_ttl_expiry() {
        let key = CacheKey::new("s", "1", Variant::Full);
        let entry = CacheEntry::new(key, Payload::Blob(Bytes::from_static(b"x")), Some(Duration::from_secs(10)));
        assert!(!entry.is_expired_at(entry.created_at));
        assert!(entry.is_expired_at(entry.created_at + chrono::Duration::seconds(10)));

        let forever = CacheEntry { ttl: None, ..entry };
        assert!(!forever.is_expired_at(Utc::now() + chrono::Duration::days(365)));
    }

    #[test]
    fn test_hit_rate() {
        let stats = TierStats {
            hits: 3,
            misses: 1,
            ..TierStats::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(TierStats::default().hit_rate(), 0.0);
    }
}
