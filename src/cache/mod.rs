//! Two-tier content-addressed cache crossed on the request hot path.
//!
//! The **pattern map** holds compiled regexes by name and never expires.
//! The **result map** holds detector results keyed by
//! `(sha256(input), detector_id)` with per-entry TTLs, a hard entry bound
//! with evict-on-write, and a periodic sweep for expired entries.
//!
//! Reads are lock-free sharded-map lookups; writes briefly contend on one
//! shard. Two requests racing on the same key is benign: results are
//! referentially transparent for a fixed pattern catalogue, so
//! last-writer-wins is correct.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::config::CachingConfig;
use crate::detectors::DetectorResult;

/// SHA-256 of `input`, rendered as 64 lowercase hex characters.
///
/// This is the canonical result-cache key component for an input text.
#[must_use]
pub fn hash_input(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

// ── CacheStats ─────────────────────────────────────────────────────────

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    /// Entries in the pattern map.
    pub pattern_count: usize,
    /// Live entries in the result map (expired-but-unswept included).
    pub result_count: usize,
    /// Pattern map hits.
    pub pattern_hits: u64,
    /// Pattern map misses.
    pub pattern_misses: u64,
    /// Result map hits.
    pub result_hits: u64,
    /// Result map misses (including expired lookups).
    pub result_misses: u64,
    /// `(pattern_hits + result_hits) / total lookups`, 0.0 when idle.
    pub hit_rate: f64,
}

// ── GuardCache ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct CachedResult {
    result: DetectorResult,
    expires_at: Instant,
}

/// Process-scoped concurrent cache for compiled patterns and detector
/// results.
///
/// Create once at startup ([`LlmGuard::new`](crate::LlmGuard::new) does
/// this when caching is enabled) and share by `Arc`.
pub struct GuardCache {
    patterns: DashMap<String, Arc<Regex>>,
    results: DashMap<(String, String), CachedResult>,
    max_entries: usize,
    default_ttl: Duration,
    pattern_hits: AtomicU64,
    pattern_misses: AtomicU64,
    result_hits: AtomicU64,
    result_misses: AtomicU64,
}

impl std::fmt::Debug for GuardCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardCache")
            .field("pattern_count", &self.patterns.len())
            .field("result_count", &self.results.len())
            .field("max_entries", &self.max_entries)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl GuardCache {
    /// Build a cache from the caching section of the guard config.
    #[must_use]
    pub fn new(config: &CachingConfig) -> Self {
        Self {
            patterns: DashMap::new(),
            results: DashMap::new(),
            max_entries: config.max_cache_entries,
            default_ttl: Duration::from_secs(config.result_ttl_seconds),
            pattern_hits: AtomicU64::new(0),
            pattern_misses: AtomicU64::new(0),
            result_hits: AtomicU64::new(0),
            result_misses: AtomicU64::new(0),
        }
    }

    // ── Pattern map ────────────────────────────────────────────────

    /// Store a compiled regex under `pattern_id`. Never expires.
    pub fn put_pattern(&self, pattern_id: impl Into<String>, regex: Arc<Regex>) {
        self.patterns.insert(pattern_id.into(), regex);
    }

    /// Fetch a compiled regex, counting the hit or miss.
    #[must_use]
    pub fn get_pattern(&self, pattern_id: &str) -> Option<Arc<Regex>> {
        match self.patterns.get(pattern_id) {
            Some(entry) => {
                self.pattern_hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(entry.value()))
            }
            None => {
                self.pattern_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    // ── Result map ─────────────────────────────────────────────────

    /// Store a detector result under `(input_hash, detector_id)`.
    ///
    /// `ttl` defaults to the configured result TTL. A TTL of zero expires
    /// the entry immediately. The write is visible to every thread as
    /// soon as this call returns. When the map is at capacity, the entry
    /// with the soonest expiry is evicted first.
    pub fn put_result(
        &self,
        input_hash: &str,
        detector_id: &str,
        result: DetectorResult,
        ttl: Option<Duration>,
    ) {
        let key = (input_hash.to_string(), detector_id.to_string());
        if self.results.len() >= self.max_entries && !self.results.contains_key(&key) {
            self.evict_soonest();
        }
        let expires_at = Instant::now() + ttl.unwrap_or(self.default_ttl);
        self.results.insert(key, CachedResult { result, expires_at });
    }

    /// Fetch a cached result; expired entries are removed and count as
    /// misses.
    #[must_use]
    pub fn get_result(&self, input_hash: &str, detector_id: &str) -> Option<DetectorResult> {
        let key = (input_hash.to_string(), detector_id.to_string());

        let expired = match self.results.get(&key) {
            None => {
                self.result_misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => {
                if Instant::now() < entry.expires_at {
                    self.result_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.result.clone());
                }
                true
            }
        };

        // The read guard is dropped before removal to avoid deadlocking
        // the shard.
        if expired {
            self.results.remove(&key);
            self.result_misses.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Drop the entry with the smallest `expires_at`.
    fn evict_soonest(&self) {
        let victim = self
            .results
            .iter()
            .min_by_key(|entry| entry.value().expires_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = victim {
            self.results.remove(&key);
        }
    }

    // ── Maintenance ────────────────────────────────────────────────

    /// Synchronously remove every expired result entry, returning how
    /// many were dropped.
    pub fn trigger_cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.results.len();
        self.results.retain(|_, entry| now < entry.expires_at);
        before - self.results.len()
    }

    /// Spawn a background task sweeping expired entries every `interval`.
    ///
    /// The returned handle should be aborted at shutdown; the task holds
    /// only a weak-ish shared reference via `Arc`, so aborting it releases
    /// the cache.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.trigger_cleanup();
                if removed > 0 {
                    tracing::debug!(removed, "cache cleanup swept expired results");
                }
            }
        })
    }

    /// Clear the result map only.
    pub fn clear_results(&self) {
        self.results.clear();
    }

    /// Clear both maps.
    pub fn clear_all(&self) {
        self.patterns.clear();
        self.results.clear();
    }

    /// Current statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let pattern_hits = self.pattern_hits.load(Ordering::Relaxed);
        let pattern_misses = self.pattern_misses.load(Ordering::Relaxed);
        let result_hits = self.result_hits.load(Ordering::Relaxed);
        let result_misses = self.result_misses.load(Ordering::Relaxed);
        let total = pattern_hits + pattern_misses + result_hits + result_misses;

        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if total == 0 {
            0.0
        } else {
            (pattern_hits + result_hits) as f64 / total as f64
        };

        CacheStats {
            pattern_count: self.patterns.len(),
            result_count: self.results.len(),
            pattern_hits,
            pattern_misses,
            result_hits,
            result_misses,
            hit_rate,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::DetectorOutcome;

    fn config(max_entries: usize, ttl_seconds: u64) -> CachingConfig {
        CachingConfig {
            enabled: true,
            pattern_cache: true,
            result_cache: true,
            result_ttl_seconds: ttl_seconds,
            max_cache_entries: max_entries,
            cleanup_interval_seconds: 60,
        }
    }

    fn result(detector_id: &str) -> DetectorResult {
        DetectorResult {
            detector_id: detector_id.to_string(),
            outcome: DetectorOutcome::Safe {
                metadata: serde_json::Map::new(),
            },
            duration: Duration::from_micros(120),
            duration_ms: 0,
        }
    }

    #[test]
    fn hash_is_64_lowercase_hex_and_deterministic() {
        let h1 = hash_input("hello");
        let h2 = hash_input("hello");
        let h3 = hash_input("hello!");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = GuardCache::new(&config(10, 300));
        let h = hash_input("some input");
        cache.put_result(&h, "prompt_injection", result("prompt_injection"), None);

        let fetched = cache.get_result(&h, "prompt_injection").unwrap();
        assert_eq!(fetched.detector_id, "prompt_injection");

        assert!(cache.get_result(&h, "jailbreak").is_none());
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let cache = GuardCache::new(&config(10, 300));
        let h = hash_input("x");
        cache.put_result(&h, "d", result("d"), Some(Duration::ZERO));
        assert!(cache.get_result(&h, "d").is_none());
        // The expired entry was removed on read.
        assert_eq!(cache.stats().result_count, 0);
    }

    #[test]
    fn positive_ttl_hit_until_expiry() {
        let cache = GuardCache::new(&config(10, 300));
        let h = hash_input("y");
        cache.put_result(&h, "d", result("d"), Some(Duration::from_secs(60)));
        assert!(cache.get_result(&h, "d").is_some());
    }

    #[test]
    fn eviction_drops_soonest_expiry_first() {
        let cache = GuardCache::new(&config(2, 300));
        let h = hash_input("z");
        cache.put_result(&h, "a", result("a"), Some(Duration::from_secs(10)));
        cache.put_result(&h, "b", result("b"), Some(Duration::from_secs(600)));
        // Map is full; inserting "c" must evict "a" (soonest expiry).
        cache.put_result(&h, "c", result("c"), Some(Duration::from_secs(300)));

        assert_eq!(cache.stats().result_count, 2);
        assert!(cache.get_result(&h, "a").is_none());
        assert!(cache.get_result(&h, "b").is_some());
        assert!(cache.get_result(&h, "c").is_some());
    }

    #[test]
    fn overwriting_existing_key_does_not_evict() {
        let cache = GuardCache::new(&config(2, 300));
        let h = hash_input("w");
        cache.put_result(&h, "a", result("a"), Some(Duration::from_secs(10)));
        cache.put_result(&h, "b", result("b"), Some(Duration::from_secs(20)));
        cache.put_result(&h, "a", result("a"), Some(Duration::from_secs(30)));

        assert_eq!(cache.stats().result_count, 2);
        assert!(cache.get_result(&h, "a").is_some());
        assert!(cache.get_result(&h, "b").is_some());
    }

    #[test]
    fn trigger_cleanup_removes_only_expired() {
        let cache = GuardCache::new(&config(10, 300));
        let h = hash_input("sweep");
        cache.put_result(&h, "gone", result("gone"), Some(Duration::ZERO));
        cache.put_result(&h, "kept", result("kept"), Some(Duration::from_secs(60)));

        let removed = cache.trigger_cleanup();
        assert_eq!(removed, 1);
        assert_eq!(cache.stats().result_count, 1);
        assert!(cache.get_result(&h, "kept").is_some());
    }

    #[test]
    fn pattern_map_round_trips_and_counts() {
        let cache = GuardCache::new(&config(10, 300));
        cache.put_pattern("greeting", Arc::new(Regex::new("hello").unwrap()));

        assert!(cache.get_pattern("greeting").is_some());
        assert!(cache.get_pattern("absent").is_none());

        let stats = cache.stats();
        assert_eq!(stats.pattern_count, 1);
        assert_eq!(stats.pattern_hits, 1);
        assert_eq!(stats.pattern_misses, 1);
    }

    #[test]
    fn stats_hit_rate() {
        let cache = GuardCache::new(&config(10, 300));
        assert_eq!(cache.stats().hit_rate, 0.0);

        let h = hash_input("rate");
        cache.put_result(&h, "d", result("d"), Some(Duration::from_secs(60)));
        assert!(cache.get_result(&h, "d").is_some()); // hit
        assert!(cache.get_result(&h, "other").is_none()); // miss

        let stats = cache.stats();
        assert_eq!(stats.result_hits, 1);
        assert_eq!(stats.result_misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn clear_results_keeps_patterns() {
        let cache = GuardCache::new(&config(10, 300));
        cache.put_pattern("p", Arc::new(Regex::new("x").unwrap()));
        let h = hash_input("c");
        cache.put_result(&h, "d", result("d"), None);

        cache.clear_results();
        let stats = cache.stats();
        assert_eq!(stats.result_count, 0);
        assert_eq!(stats.pattern_count, 1);

        cache.clear_all();
        assert_eq!(cache.stats().pattern_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_sweeps_on_interval() {
        let cache = Arc::new(GuardCache::new(&config(10, 300)));
        let h = hash_input("task");
        cache.put_result(&h, "d", result("d"), Some(Duration::ZERO));

        let handle = cache.spawn_cleanup(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert_eq!(cache.stats().result_count, 0);
        handle.abort();
    }
}
