use std::time::{Duration, Instant};

use moka::future::Cache;
use moka::Expiry;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CacheError;

/// A cached value with its own time-to-live.
#[derive(Debug, Clone)]
struct Entry {
    json: String,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, entry: &Entry, _created: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _updated: Instant,
        _current: Option<Duration>,
    ) -> Option<Duration> {
        // Overwrites restart the clock with the new entry's TTL.
        Some(entry.ttl)
    }
}

/// In-memory TTL cache backed by moka.
///
/// Values are stored as JSON strings with a per-entry TTL; expired entries
/// are evicted by moka's expiry policy. Writes overwrite unconditionally.
pub struct TtlCache {
    inner: Cache<String, Entry>,
}

impl TtlCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(PerEntryTtl)
                .build(),
        }
    }

    /// Get a typed value by key. `None` on miss or expiry.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.inner.get(key).await {
            Some(entry) => Ok(Some(serde_json::from_str(&entry.json)?)),
            None => Ok(None),
        }
    }

    /// Insert or overwrite a value with the given TTL.
    pub async fn insert<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let json = serde_json::to_string(value)?;
        self.inner.insert(key.to_string(), Entry { json, ttl }).await;
        Ok(())
    }

    pub async fn invalidate(&self, key: &str) {
        self.inner.invalidate(key).await;
    }
}
