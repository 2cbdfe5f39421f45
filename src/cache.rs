//! In-memory response cache keyed by request signature.
//!
//! Entries are bounded by a freshness window rather than evicted: a stale
//! entry stays around so its revalidation token can be sent back with the
//! next conditional read, and so a failed revalidation never loses data.

use crate::types::TimestampMs;
use dashmap::DashMap;
use http::Method;
use std::time::Duration;

/// Request signature: HTTP method plus endpoint path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: Method,
    pub path: String,
}

impl CacheKey {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Only idempotent reads may be cached.
    pub fn is_cacheable(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub payload: serde_json::Value,
    /// Opaque server version (ETag). Empty when the server sent none.
    pub revalidation_token: String,
    /// Local time the request that produced or last confirmed this payload
    /// was issued. The server state it reflects is at least this recent.
    pub fetched_at_ms: TimestampMs,
}

pub struct ResponseCache {
    entries: DashMap<CacheKey, CacheEntry>,
    freshness_window: Duration,
}

impl ResponseCache {
    pub fn new(freshness_window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            freshness_window,
        }
    }

    pub fn freshness_window(&self) -> Duration {
        self.freshness_window
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// Store a freshly fetched payload, replacing any previous entry.
    /// Ignored for mutating requests.
    pub fn put(
        &self,
        key: CacheKey,
        payload: serde_json::Value,
        token: impl Into<String>,
        now_ms: TimestampMs,
    ) {
        if !key.is_cacheable() {
            tracing::debug!("[CACHE] refusing to cache {} {}", key.method, key.path);
            return;
        }

        self.entries.insert(
            key,
            CacheEntry {
                payload,
                revalidation_token: token.into(),
                fetched_at_ms: now_ms,
            },
        );
    }

    /// Bump the timestamp of an entry the server confirmed as unchanged.
    /// Returns the updated entry, or `None` if it is gone.
    pub fn touch(&self, key: &CacheKey, now_ms: TimestampMs) -> Option<CacheEntry> {
        self.entries.get_mut(key).map(|mut entry| {
            entry.fetched_at_ms = now_ms;
            entry.clone()
        })
    }

    /// Returns the entry if a fresh one exists for `key`.
    pub fn get_fresh(&self, key: &CacheKey, now_ms: TimestampMs) -> Option<CacheEntry> {
        let entry = self.entries.get(key)?;
        if Self::is_fresh(&entry, now_ms, self.freshness_window.as_millis() as i64) {
            Some(entry.clone())
        } else {
            None
        }
    }

    pub fn is_fresh(entry: &CacheEntry, now_ms: TimestampMs, freshness_window_ms: i64) -> bool {
        let age = now_ms.saturating_sub(entry.fetched_at_ms);
        age >= 0 && age < freshness_window_ms
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
