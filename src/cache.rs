//! Time-to-live key/value cache fronting the vault transport.
//!
//! Entries are never served past their `expires_at`. Expired entries are
//! dropped lazily when read and in bulk by [`TtlCache::sweep`], which the
//! engine runs on an interval. With `max_entries` set, inserting past the
//! bound evicts the least recently used entry.
//!
//! All state sits behind one mutex, so a reader sees either the previous
//! value or the complete new one, never a partial write. When a disk path is
//! configured the cache is loaded at startup and written back atomically
//! (temp file + rename) after sweeps and clears.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// A single cached value as persisted on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// Base64 of the raw bytes.
    pub value: String,
    /// Unix epoch milliseconds.
    pub expires_at: i64,
}

#[derive(Debug)]
struct Slot {
    value: Vec<u8>,
    expires_at: i64,
    last_used: u64,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Slot>,
    bytes: usize,
    tick: u64,
}

impl State {
    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(slot) => {
                self.bytes -= slot.value.len();
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entries: usize,
    pub bytes: usize,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug)]
pub struct TtlCache {
    state: Mutex<State>,
    max_entries: Option<usize>,
    disk_path: Option<PathBuf>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl TtlCache {
    pub fn new(max_entries: Option<usize>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_entries,
            disk_path: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Create a disk-backed cache, loading any unexpired entries from `path`.
    ///
    /// A missing file is not an error. A corrupt file is logged and ignored.
    pub fn with_disk(max_entries: Option<usize>, path: &Path) -> Self {
        let mut cache = Self::new(max_entries);
        cache.disk_path = Some(path.to_path_buf());
        match cache.load() {
            Ok(n) => tracing::debug!(path = %path.display(), loaded = n, "cache loaded"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable cache file"),
        }
        cache
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut state = self.lock();
        state.tick += 1;
        let tick = state.tick;
        let now = now_ms();

        let (value, expired) = match state.entries.get_mut(key) {
            Some(slot) if now < slot.expires_at => {
                slot.last_used = tick;
                (Some(slot.value.clone()), false)
            }
            Some(_) => (None, true),
            None => (None, false),
        };

        if expired {
            state.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    pub fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let expires_at = now_ms().saturating_add(ttl.as_millis() as i64);
        let mut state = self.lock();
        state.tick += 1;
        let tick = state.tick;
        state.remove(key);
        state.bytes += value.len();
        state.entries.insert(
            key.to_string(),
            Slot {
                value,
                expires_at,
                last_used: tick,
            },
        );

        if let Some(max) = self.max_entries {
            while state.entries.len() > max.max(1) {
                let victim = state
                    .entries
                    .iter()
                    .min_by_key(|(_, slot)| (slot.expires_at > now_ms(), slot.last_used))
                    .map(|(k, _)| k.clone());
                match victim {
                    Some(k) => {
                        state.remove(&k);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                }
            }
        }
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key)?;
        match serde_json::from_slice(&bytes) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(key, error = %e, "dropping undecodable cache entry");
                self.remove(key);
                None
            }
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.set(key, bytes, ttl),
            Err(e) => tracing::warn!(key, error = %e, "value not cacheable"),
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key)
    }

    /// Drop everything, including the on-disk copy.
    pub fn clear(&self) -> usize {
        let cleared = {
            let mut state = self.lock();
            let n = state.entries.len();
            state.entries.clear();
            state.bytes = 0;
            n
        };
        if let Err(e) = self.persist() {
            tracing::warn!(error = %e, "failed to persist cleared cache");
        }
        cleared
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = now_ms();
        let removed = {
            let mut state = self.lock();
            let expired: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, slot)| now >= slot.expires_at)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired {
                state.remove(key);
            }
            expired.len()
        };
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        if let Err(e) = self.persist() {
            tracing::warn!(error = %e, "failed to persist cache after sweep");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, bytes) = {
            let state = self.lock();
            (state.entries.len(), state.bytes)
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            entries,
            bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Write unexpired entries to the configured disk path, if any.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.disk_path else {
            return Ok(());
        };
        let now = now_ms();
        let records: Vec<CacheEntry> = {
            let state = self.lock();
            state
                .entries
                .iter()
                .filter(|(_, slot)| now < slot.expires_at)
                .map(|(key, slot)| CacheEntry {
                    key: key.clone(),
                    value: BASE64.encode(&slot.value),
                    expires_at: slot.expires_at,
                })
                .collect()
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(&records)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    fn load(&self) -> Result<usize> {
        let Some(path) = &self.disk_path else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }
        let raw = std::fs::read(path)
            .with_context(|| format!("Failed to read cache file {}", path.display()))?;
        let records: Vec<CacheEntry> = serde_json::from_slice(&raw)?;
        let now = now_ms();
        let mut state = self.lock();
        let mut loaded = 0;
        for record in records {
            if now >= record.expires_at {
                continue;
            }
            let Ok(value) = BASE64.decode(record.value.as_bytes()) else {
                continue;
            };
            state.tick += 1;
            let tick = state.tick;
            state.bytes += value.len();
            if let Some(old) = state.entries.insert(
                record.key,
                Slot {
                    value,
                    expires_at: record.expires_at,
                    last_used: tick,
                },
            ) {
                state.bytes -= old.value.len();
            }
            loaded += 1;
        }
        Ok(loaded)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_hit_and_miss() {
        let cache = TtlCache::new(None);
        assert!(cache.get("k").is_none());
        cache.set("k", b"value".to_vec(), MINUTE);
        assert_eq!(cache.get("k").unwrap(), b"value");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
        assert_eq!(stats.bytes, 5);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_never_served_after_expiry() {
        let cache = TtlCache::new(None);
        cache.set("k", b"v".to_vec(), Duration::ZERO);
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_overwrite_updates_bytes() {
        let cache = TtlCache::new(None);
        cache.set("k", vec![0; 10], MINUTE);
        cache.set("k", vec![0; 3], MINUTE);
        assert_eq!(cache.stats().bytes, 3);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = TtlCache::new(Some(2));
        cache.set("a", b"1".to_vec(), MINUTE);
        cache.set("b", b"2".to_vec(), MINUTE);
        assert!(cache.get("a").is_some());
        cache.set("c", b"3".to_vec(), MINUTE);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_sweep_and_clear() {
        let cache = TtlCache::new(None);
        cache.set("dead", b"x".to_vec(), Duration::ZERO);
        cache.set("live", b"y".to_vec(), MINUTE);
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.clear(), 1);
        assert_eq!(cache.stats().bytes, 0);
    }

    #[test]
    fn test_json_helpers() {
        let cache = TtlCache::new(None);
        cache.set_json("list", &vec!["a.md", "b/"], MINUTE);
        let back: Vec<String> = cache.get_json("list").unwrap();
        assert_eq!(back, vec!["a.md", "b/"]);
    }

    #[test]
    fn test_disk_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("cache").join("vault.json");
        {
            let cache = TtlCache::with_disk(None, &path);
            cache.set("keep", b"hello".to_vec(), MINUTE);
            cache.set("drop", b"bye".to_vec(), Duration::ZERO);
            cache.persist().unwrap();
        }
        let reloaded = TtlCache::with_disk(None, &path);
        assert_eq!(reloaded.get("keep").unwrap(), b"hello");
        assert!(reloaded.get("drop").is_none());
    }

    #[test]
    fn test_corrupt_disk_file_ignored() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("vault.json");
        std::fs::write(&path, b"not json").unwrap();
        let cache = TtlCache::with_disk(None, &path);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let cache = Arc::new(TtlCache::new(Some(64)));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("k{}", i % 32);
                        let value = vec![t as u8; 16];
                        cache.set(&key, value, MINUTE);
                        if let Some(v) = cache.get(&key) {
                            assert_eq!(v.len(), 16);
                            assert!(v.iter().all(|b| *b == v[0]));
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = cache.stats();
        assert!(stats.entries <= 64);
        assert_eq!(stats.bytes, stats.entries * 16);
    }
}
