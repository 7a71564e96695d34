//! Two-tier content-addressed result cache (spec §4.F).
//!
//! An in-memory index of [`CacheEntry`] metadata backs an on-disk payload
//! store laid out as `cache_dir/<first two hex chars>/<full key>.bin`. The
//! key is a SHA-256 digest of `code || template || language`; see §9 for the
//! documented one-level fan-out scaling limit this crate inherits from the
//! Python reference rather than silently changing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::instrument;

use crate::config::CacheConfig;
use crate::error::Result;

/// Derive the content-addressed cache key for one analysis: SHA-256 of
/// `code || template || language` (spec §3 `CacheEntry`).
pub fn cache_key(code: &str, template: &str, language: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hasher.update(b"\0");
    hasher.update(template.as_bytes());
    hasher.update(b"\0");
    hasher.update(language.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// In-memory metadata for one cached payload. The payload itself lives on
/// disk and is loaded on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub file_dependencies: HashMap<String, String>,
    pub size_bytes: u64,
    pub metadata: HashMap<String, String>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Cumulative hit/miss/eviction counters for the ambient stats surface (§10.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub entry_count: usize,
    pub disk_bytes: u64,
}

struct Inner {
    index: HashMap<String, CacheEntry>,
    stats: CacheStats,
}

/// The Result Cache: content-addressed, two-tier, size- and TTL-bounded.
pub struct ResultCache {
    config: CacheConfig,
    inner: Arc<RwLock<Inner>>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Arc::new(RwLock::new(Inner {
                index: HashMap::new(),
                stats: CacheStats::default(),
            })),
        }
    }

    fn payload_path(&self, key: &str) -> PathBuf {
        let shard = &key[..key.len().min(2)];
        Path::new(&self.config.cache_dir).join(shard).join(format!("{key}.bin"))
    }

    /// Look up a cached payload by key. A hit requires the entry to be
    /// unexpired AND every dependency file's current content hash to match
    /// the stored one; either failure evicts the entry and reports a miss.
    /// `current_file_contents` supplies the live content of each dependency
    /// path the caller already has in hand (callers typically do, since
    /// they just loaded the unit under analysis).
    #[instrument(skip(self, current_file_contents), fields(key = %key))]
    pub async fn get(&self, key: &str, current_file_contents: &HashMap<String, String>) -> Option<String> {
        let now = Utc::now();
        let entry = {
            let guard = self.inner.read().await;
            guard.index.get(key).cloned()
        };

        let Some(mut entry) = entry else {
            self.inner.write().await.stats.misses += 1;
            return None;
        };

        let stale = entry.is_expired(now)
            || entry.file_dependencies.iter().any(|(path, hash)| {
                current_file_contents
                    .get(path)
                    .map(|content| &content_hash(content) != hash)
                    .unwrap_or(false)
            });

        if stale {
            self.invalidate(Some(key)).await;
            self.inner.write().await.stats.misses += 1;
            return None;
        }

        let payload = match tokio::fs::read_to_string(self.payload_path(key)).await {
            Ok(p) => p,
            Err(_) => {
                self.invalidate(Some(key)).await;
                self.inner.write().await.stats.misses += 1;
                return None;
            }
        };

        entry.last_accessed = now;
        let mut guard = self.inner.write().await;
        guard.index.insert(key.to_string(), entry);
        guard.stats.hits += 1;
        Some(payload)
    }

    /// Store a payload under `key`, writing both the disk file and the
    /// in-memory metadata entry, and recording content hashes for every
    /// dependency path so future `get`s can detect staleness.
    #[instrument(skip(self, payload, file_dependencies, metadata), fields(key = %key))]
    pub async fn put(
        &self,
        key: &str,
        payload: &str,
        file_dependencies: &HashMap<String, String>,
        ttl_hours: Option<u64>,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let now = Utc::now();
        let path = self.payload_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, payload.as_bytes()).await?;

        let dependency_hashes: HashMap<String, String> = file_dependencies
            .iter()
            .map(|(path, content)| (path.clone(), content_hash(content)))
            .collect();

        let entry = CacheEntry {
            key: key.to_string(),
            created_at: now,
            last_accessed: now,
            expires_at: now + Duration::hours(ttl_hours.unwrap_or(self.config.ttl_hours) as i64),
            file_dependencies: dependency_hashes,
            size_bytes: payload.len() as u64,
            metadata,
        };

        let mut guard = self.inner.write().await;
        guard.stats.disk_bytes += entry.size_bytes;
        guard.index.insert(key.to_string(), entry);
        guard.stats.entry_count = guard.index.len();
        drop(guard);

        self.maybe_evict().await?;
        Ok(())
    }

    /// Remove one entry by key, or every entry if `key` is `None`.
    pub async fn invalidate(&self, key: Option<&str>) -> usize {
        let mut guard = self.inner.write().await;
        let (removed, paths_to_remove) = match key {
            Some(key) => {
                if let Some(entry) = guard.index.remove(key) {
                    guard.stats.disk_bytes = guard.stats.disk_bytes.saturating_sub(entry.size_bytes);
                    (1, vec![self.payload_path(key)])
                } else {
                    (0, Vec::new())
                }
            }
            None => {
                let count = guard.index.len();
                let paths = guard.index.keys().map(|key| self.payload_path(key)).collect();
                guard.index.clear();
                guard.stats.disk_bytes = 0;
                (count, paths)
            }
        };
        guard.stats.invalidations += removed as u64;
        guard.stats.entry_count = guard.index.len();
        drop(guard);

        for path in paths_to_remove {
            let _ = tokio::fs::remove_file(path).await;
        }
        removed
    }

    /// Invalidate every entry that depends on any of `changed_paths`.
    pub async fn invalidate_by_file_changes(&self, changed_paths: &[String]) -> usize {
        let stale_keys: Vec<String> = {
            let guard = self.inner.read().await;
            guard
                .index
                .iter()
                .filter(|(_, entry)| entry.file_dependencies.keys().any(|p| changed_paths.contains(p)))
                .map(|(key, _)| key.clone())
                .collect()
        };

        let mut removed = 0;
        for key in stale_keys {
            removed += self.invalidate(Some(&key)).await;
        }
        removed
    }

    /// Evict entries by ascending `last_accessed` until disk usage is back
    /// to `eviction_target_fraction` of `max_size_bytes`.
    async fn maybe_evict(&self) -> Result<()> {
        let mut guard = self.inner.write().await;
        if guard.stats.disk_bytes <= self.config.max_size_bytes {
            return Ok(());
        }

        let target = (self.config.max_size_bytes as f64 * self.config.eviction_target_fraction) as u64;
        let mut by_access: Vec<(String, DateTime<Utc>, u64)> = guard
            .index
            .iter()
            .map(|(key, entry)| (key.clone(), entry.last_accessed, entry.size_bytes))
            .collect();
        by_access.sort_by_key(|(_, accessed, _)| *accessed);

        let mut paths_to_remove = Vec::new();
        for (key, _, size) in by_access {
            if guard.stats.disk_bytes <= target {
                break;
            }
            guard.index.remove(&key);
            guard.stats.disk_bytes = guard.stats.disk_bytes.saturating_sub(size);
            guard.stats.evictions += 1;
            paths_to_remove.push(self.payload_path(&key));
        }
        guard.stats.entry_count = guard.index.len();
        drop(guard);

        for path in paths_to_remove {
            let _ = tokio::fs::remove_file(path).await;
        }

        Ok(())
    }

    pub async fn stats(&self) -> CacheStats {
        self.inner.read().await.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &Path) -> CacheConfig {
        CacheConfig {
            cache_dir: dir.to_string_lossy().to_string(),
            max_size_bytes: 1_000_000,
            ttl_hours: 24,
            eviction_target_fraction: 0.8,
        }
    }

    #[tokio::test]
    async fn put_then_get_is_a_hit() {
        let dir = tempdir().unwrap();
        let cache = ResultCache::new(config(dir.path()));
        let deps = HashMap::from([("a.py".to_string(), "print(1)".to_string())]);
        cache.put("key1", "payload", &deps, None, HashMap::new()).await.unwrap();

        let hit = cache.get("key1", &deps).await;
        assert_eq!(hit, Some("payload".to_string()));
        assert_eq!(cache.stats().await.hits, 1);
    }

    #[tokio::test]
    async fn missing_key_is_a_miss() {
        let dir = tempdir().unwrap();
        let cache = ResultCache::new(config(dir.path()));
        let hit = cache.get("missing", &HashMap::new()).await;
        assert!(hit.is_none());
        assert_eq!(cache.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn changed_dependency_content_invalidates_entry() {
        let dir = tempdir().unwrap();
        let cache = ResultCache::new(config(dir.path()));
        let deps = HashMap::from([("a.py".to_string(), "print(1)".to_string())]);
        cache.put("key1", "payload", &deps, None, HashMap::new()).await.unwrap();

        let changed_deps = HashMap::from([("a.py".to_string(), "print(2)".to_string())]);
        let hit = cache.get("key1", &changed_deps).await;
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn invalidate_by_file_changes_removes_dependents() {
        let dir = tempdir().unwrap();
        let cache = ResultCache::new(config(dir.path()));
        let deps = HashMap::from([("a.py".to_string(), "print(1)".to_string())]);
        cache.put("key1", "payload", &deps, None, HashMap::new()).await.unwrap();

        let removed = cache.invalidate_by_file_changes(&["a.py".to_string()]).await;
        assert_eq!(removed, 1);
        assert_eq!(cache.stats().await.entry_count, 0);
    }

    #[tokio::test]
    async fn eviction_reclaims_to_target_fraction() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_size_bytes = 20;
        cfg.eviction_target_fraction = 0.5;
        let cache = ResultCache::new(cfg);

        cache.put("key1", "0123456789", &HashMap::new(), None, HashMap::new()).await.unwrap();
        cache.put("key2", "0123456789", &HashMap::new(), None, HashMap::new()).await.unwrap();
        cache.put("key3", "0123456789", &HashMap::new(), None, HashMap::new()).await.unwrap();

        let stats = cache.stats().await;
        assert!(stats.disk_bytes <= 20);
    }

    #[test]
    fn cache_key_is_deterministic_and_sensitive_to_inputs() {
        let a = cache_key("code", "template", "python");
        let b = cache_key("code", "template", "python");
        let c = cache_key("different code", "template", "python");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
