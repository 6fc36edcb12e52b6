//! In-process TTL cache of finished query results.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use lumen_core::config::CacheConfig;
use lumen_core::traits::QueryCache;
use lumen_core::types::{CacheStats, QueryResult};

struct CacheEntry {
    value: QueryResult,
    expires_at: Instant,
    /// Serialized size, used for the memory estimate.
    size: usize,
}

pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: config.max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &str) -> Option<QueryResult> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return None,
                Some(e) if e.expires_at > now => return Some(e.value.clone()),
                Some(_) => {}
            }
        }
        // Expired: drop it unless a writer refreshed it in between.
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(key);
        }
        None
    }

    fn make_room(&self, entries: &mut HashMap<String, CacheEntry>) {
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        while entries.len() >= self.max_entries {
            let Some(oldest) = entries.iter().min_by_key(|(_, e)| e.expires_at).map(|(k, _)| k.clone()) else {
                break;
            };
            entries.remove(&oldest);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %oldest, "cache eviction");
        }
    }
}

#[async_trait]
impl QueryCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<QueryResult> {
        let found = self.lookup(key);
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    async fn set(&self, key: &str, value: QueryResult, ttl: Duration) {
        let size = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0) + key.len();
        let entry = CacheEntry { value, expires_at: Instant::now() + ttl, size };
        let mut entries = self.entries.write();
        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            self.make_room(&mut entries);
        }
        entries.insert(key.to_string(), entry);
    }

    fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let lookups = hits + self.misses.load(Ordering::Relaxed);
        let entries = self.entries.read();
        CacheStats {
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
            total_keys: entries.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
            memory_usage: entries.values().map(|e| e.size).sum(),
        }
    }
}
