//! Tool-result cache for idempotent reads
//!
//! Keyed by `tool(k=v,...)` with sorted keys. Entries expire by TTL, are evicted
//! least-recently-used past capacity, and are dropped when a path they depend on
//! is modified. Safe for concurrent reads and invalidation; writes are last-writer-wins.

use dashmap::DashMap;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub entries: usize,
}

struct CacheEntry {
    value: Value,
    inserted: Instant,
    last_access: AtomicU64,
    deps: Vec<PathBuf>,
}

/// Canonical cache key: tool name plus parameters in sorted key order
pub fn cache_key(tool: &str, params: &Map<String, Value>) -> String {
    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort();
    let parts: Vec<String> = keys
        .into_iter()
        .map(|k| format!("{k}={}", params[k]))
        .collect();
    format!("{tool}({})", parts.join(","))
}

pub struct ToolResultCache {
    entries: DashMap<String, CacheEntry>,
    config: CacheConfig,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl ToolResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.inserted.elapsed() <= self.config.ttl => {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit: {key}");
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a value with the paths it was read from
    pub fn put(&self, key: String, value: Value, deps: Vec<PathBuf>) {
        if self.config.capacity == 0 {
            return;
        }
        let entry = CacheEntry {
            value,
            inserted: Instant::now(),
            last_access: AtomicU64::new(self.tick()),
            deps,
        };
        self.entries.insert(key, entry);
        while self.entries.len() > self.config.capacity {
            if !self.evict_lru() {
                break;
            }
        }
    }

    fn evict_lru(&self) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by_key(|e| e.value().last_access.load(Ordering::Relaxed))
            .map(|e| e.key().clone());
        match victim {
            Some(key) => {
                self.entries.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Drop every entry that depends on `path`, on a directory containing it, or on a path inside it
    pub fn invalidate_path(&self, path: &Path) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            !entry
                .deps
                .iter()
                .any(|dep| dep == path || path.starts_with(dep) || dep.starts_with(path))
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
            debug!("Invalidated {removed} cache entries for {}", path.display());
        }
        removed
    }

    pub fn invalidate_all(&self) {
        let n = self.entries.len();
        self.entries.clear();
        self.invalidations.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

impl Default for ToolResultCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_key_sorted_and_stable() {
        let a = cache_key("readFile", &params(json!({"path": "a.ts", "endLine": 3})));
        let b = cache_key("readFile", &params(json!({"endLine": 3, "path": "a.ts"})));
        assert_eq!(a, b);
        assert_eq!(a, "readFile(endLine=3,path=\"a.ts\")");
    }

    #[test]
    fn test_hit_and_miss_counts() {
        let cache = ToolResultCache::default();
        assert!(cache.get("k").is_none());
        cache.put("k".into(), json!(1), vec![]);
        assert_eq!(cache.get("k"), Some(json!(1)));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = ToolResultCache::new(CacheConfig {
            capacity: 10,
            ttl: Duration::from_millis(0),
        });
        cache.put("k".into(), json!(1), vec![]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ToolResultCache::new(CacheConfig {
            capacity: 2,
            ttl: Duration::from_secs(60),
        });
        cache.put("a".into(), json!("a"), vec![]);
        cache.put("b".into(), json!("b"), vec![]);
        assert!(cache.get("a").is_some());
        cache.put("c".into(), json!("c"), vec![]);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_path_invalidation() {
        let cache = ToolResultCache::default();
        cache.put("read".into(), json!(1), vec![PathBuf::from("/w/src/a.rs")]);
        cache.put("other".into(), json!(2), vec![PathBuf::from("/w/src/b.rs")]);
        cache.put("list".into(), json!(3), vec![PathBuf::from("/w/src")]);

        assert_eq!(cache.invalidate_path(Path::new("/w/src/a.rs")), 2);
        assert!(cache.get("other").is_some());
        assert!(cache.get("read").is_none());
        assert!(cache.get("list").is_none());
    }
}
