//! TTL response cache
//!
//! Entries are never swept. Expiry is checked on read, and expired entries are
//! kept so they can still be served as a stale fallback.

use dashmap::DashMap;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub data: Value,
    pub timestamp: Instant,
    pub ttl: Duration,
}

impl CachedResponse {
    pub fn is_fresh(&self) -> bool {
        self.timestamp.elapsed() < self.ttl
    }
}

#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: DashMap<String, CachedResponse>,
}

pub fn cache_key(method: &str, params: &Value) -> String {
    format!("{}:{}", method, params)
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: String, data: Value, ttl: Duration) {
        self.entries.insert(
            key,
            CachedResponse {
                data,
                timestamp: Instant::now(),
                ttl,
            },
        );
    }

    pub fn get_fresh(&self, key: &str) -> Option<Value> {
        self.entries
            .get(key)
            .filter(|entry| entry.is_fresh())
            .map(|entry| entry.data.clone())
    }

    /// Any entry for `key`, with its age
    pub fn get_stale(&self, key: &str) -> Option<(Value, Duration)> {
        self.entries
            .get(key)
            .map(|entry| (entry.data.clone(), entry.timestamp.elapsed()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
