//! Classification-aware suggestion cache.
//!
//! Entries are keyed by a deterministic fingerprint over the semantic
//! request fields and written only when their quality score clears the
//! category's threshold; TTLs are per-category. Reads never return an
//! expired entry. An optional Redis backend sits behind the same API for
//! horizontally scaled deployments; the in-memory DashMap store is the
//! default.
//!
//! Expired entries are reaped two ways: lazily on lookup, and by a
//! background sweep task spawned once per process via
//! [`SuggestionCache::spawn_eviction_loop`].

use crate::classify::RequestCategory;
use crate::config::{CacheConfig, CachePolicy};
use crate::tier::ExecutionTier;
use crate::{SuggestionCandidate, SuggestionType};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::debug;
#[cfg(feature = "redis-cache")]
use tracing::warn;

/// The semantic request fields a cache key is derived from.
///
/// Two requests with identical fields produce the same key regardless of
/// arrival order; changing any field changes the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FingerprintInput<'a> {
    /// The conversation context text.
    pub text: &'a str,
    /// What kind of suggestion was asked for.
    pub suggestion_type: SuggestionType,
    /// The requested tone.
    pub tone: &'a str,
    /// The tier the request was routed to.
    pub tier: ExecutionTier,
    /// Whether the request carried media.
    pub has_media: bool,
}

/// Compute the deterministic cache key for a request.
///
/// # Panics
///
/// This function never panics.
pub fn fingerprint(input: &FingerprintInput<'_>) -> String {
    use std::collections::hash_map::DefaultHasher;

    let mut hasher = DefaultHasher::new();
    input.text.hash(&mut hasher);
    input.suggestion_type.as_str().hash(&mut hasher);
    input.tone.hash(&mut hasher);
    input.tier.as_str().hash(&mut hasher);
    input.has_media.hash(&mut hasher);
    format!("suggest:{:x}", hasher.finish())
}

/// A cached generation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSuggestion {
    /// The generated candidates.
    pub candidates: Vec<SuggestionCandidate>,
    /// Quality score the result carried when written.
    pub quality_score: f64,
    /// The tier that produced the result.
    pub tier: ExecutionTier,
    created_at: SystemTime,
    ttl: Duration,
}

impl CachedSuggestion {
    fn is_expired(&self, now: SystemTime) -> bool {
        match now.duration_since(self.created_at) {
            Ok(age) => age >= self.ttl,
            // Clock went backwards; treat the entry as fresh.
            Err(_) => false,
        }
    }
}

#[derive(Clone)]
enum CacheStore {
    Memory(Arc<MemoryStore>),
    #[cfg(feature = "redis-cache")]
    Redis(Arc<RedisStore>),
}

struct MemoryStore {
    store: DashMap<String, CachedSuggestion>,
    max_entries: usize,
}

#[cfg(feature = "redis-cache")]
struct RedisStore {
    client: redis::Client,
}

/// The classification-aware cache manager.
///
/// Cloning is cheap; all clones share the same store.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Clone)]
pub struct SuggestionCache {
    backend: CacheStore,
    config: CacheConfig,
}

impl SuggestionCache {
    /// Create an in-memory cache.
    pub fn new_memory(config: CacheConfig) -> Self {
        Self {
            backend: CacheStore::Memory(Arc::new(MemoryStore {
                store: DashMap::new(),
                max_entries: config.max_entries,
            })),
            config,
        }
    }

    /// Create a Redis-backed cache.
    ///
    /// # Errors
    ///
    /// Returns the underlying error if the connection test fails.
    #[cfg(feature = "redis-cache")]
    pub async fn new_redis(redis_url: &str, config: CacheConfig) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;

        // Test connection
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;

        Ok(Self {
            backend: CacheStore::Redis(Arc::new(RedisStore { client })),
            config,
        })
    }

    /// The write policy for a category.
    pub fn policy(&self, category: RequestCategory) -> CachePolicy {
        self.config.policies.for_category(category)
    }

    /// Look up an entry, returning `None` on miss or expiry.
    ///
    /// Expired entries are removed on the way out. A miss is not an error.
    pub async fn lookup(&self, key: &str) -> Option<CachedSuggestion> {
        match &self.backend {
            CacheStore::Memory(store) => {
                if let Some(entry) = store.store.get(key) {
                    if !entry.is_expired(SystemTime::now()) {
                        debug!(key = key, "cache hit (memory)");
                        return Some(entry.clone());
                    }
                    // Expired
                    drop(entry);
                    store.store.remove(key);
                    debug!(key = key, "cache expired");
                }
                debug!(key = key, "cache miss (memory)");
                None
            }
            #[cfg(feature = "redis-cache")]
            CacheStore::Redis(store) => match store.get_redis(key).await {
                Ok(Some(raw)) => match serde_json::from_str::<CachedSuggestion>(&raw) {
                    Ok(entry) => {
                        debug!(key = key, "cache hit (redis)");
                        Some(entry)
                    }
                    Err(e) => {
                        warn!(key = key, error = %e, "redis entry failed to decode");
                        None
                    }
                },
                Ok(None) => {
                    debug!(key = key, "cache miss (redis)");
                    None
                }
                Err(e) => {
                    warn!(key = key, error = ?e, "redis get error");
                    None
                }
            },
        }
    }

    /// Write a result if its quality clears the category's threshold.
    ///
    /// Returns `true` if the entry was stored, `false` if it was skipped.
    /// A skip is not an error; low-quality results simply are not worth
    /// replaying.
    pub async fn write(
        &self,
        key: &str,
        candidates: &[SuggestionCandidate],
        quality_score: f64,
        tier: ExecutionTier,
        category: RequestCategory,
    ) -> bool {
        let policy = self.policy(category);
        if quality_score < policy.min_quality {
            debug!(
                key = key,
                quality = quality_score,
                threshold = policy.min_quality,
                category = category.as_str(),
                "cache write skipped: below quality threshold"
            );
            return false;
        }

        let entry = CachedSuggestion {
            candidates: candidates.to_vec(),
            quality_score,
            tier,
            created_at: SystemTime::now(),
            ttl: Duration::from_secs(policy.ttl_secs),
        };

        match &self.backend {
            CacheStore::Memory(store) => {
                // Evict if at capacity
                if store.max_entries > 0 && store.store.len() >= store.max_entries {
                    // Collect key first to release all DashMap read-guards
                    // before calling remove (avoids shard deadlock).
                    let evict_key = store.store.iter().next().map(|e| e.key().clone());
                    if let Some(key_to_evict) = evict_key {
                        store.store.remove(&key_to_evict);
                    }
                }
                store.store.insert(key.to_string(), entry);
                debug!(
                    key = key,
                    ttl_secs = policy.ttl_secs,
                    category = category.as_str(),
                    "cached (memory)"
                );
                true
            }
            #[cfg(feature = "redis-cache")]
            CacheStore::Redis(store) => {
                let raw = match serde_json::to_string(&entry) {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!(key = key, error = %e, "cache entry failed to encode");
                        return false;
                    }
                };
                if let Err(e) = store.set_redis(key, &raw, policy.ttl_secs).await {
                    warn!(key = key, error = ?e, "redis set error");
                    false
                } else {
                    debug!(key = key, ttl_secs = policy.ttl_secs, "cached (redis)");
                    true
                }
            }
        }
    }

    /// Remove every expired entry from the in-memory store.
    ///
    /// Returns the number of entries removed. No-op for Redis, which
    /// expires keys server-side.
    pub fn evict_expired(&self) -> usize {
        match &self.backend {
            CacheStore::Memory(store) => {
                let now = SystemTime::now();
                let before = store.store.len();
                store.store.retain(|_, entry| !entry.is_expired(now));
                let removed = before - store.store.len();
                if removed > 0 {
                    debug!(removed = removed, "evicted expired cache entries");
                }
                removed
            }
            #[cfg(feature = "redis-cache")]
            CacheStore::Redis(_) => 0,
        }
    }

    /// Spawn the background eviction task.
    ///
    /// Runs for the process lifetime, sweeping expired entries on the
    /// configured interval independent of request traffic. The handle can
    /// be used to abort the loop on shutdown.
    pub fn spawn_eviction_loop(&self) -> JoinHandle<()> {
        let cache = self.clone();
        let interval = Duration::from_secs(self.config.eviction_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.evict_expired();
            }
        })
    }

    /// Current store statistics.
    pub fn stats(&self) -> CacheStats {
        match &self.backend {
            CacheStore::Memory(store) => CacheStats {
                entries: store.store.len(),
                backend: "memory",
            },
            #[cfg(feature = "redis-cache")]
            CacheStore::Redis(_) => CacheStats {
                entries: 0, // Would need a separate DBSIZE call
                backend: "redis",
            },
        }
    }
}

#[cfg(feature = "redis-cache")]
impl RedisStore {
    async fn get_redis(&self, key: &str) -> Result<Option<String>, redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("GET").arg(key).query_async(&mut conn).await
    }

    async fn set_redis(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(value)
            .query_async(&mut conn)
            .await
    }
}

/// Cache store statistics for health snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Number of entries currently held.
    pub entries: usize,
    /// Name of the storage backend in use.
    pub backend: &'static str,
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CachePolicyTable;

    fn cache() -> SuggestionCache {
        SuggestionCache::new_memory(CacheConfig::default())
    }

    fn candidates() -> Vec<SuggestionCandidate> {
        vec![
            SuggestionCandidate::new("How was your weekend?", 0.9),
            SuggestionCandidate::new("Tell me something surprising about you!", 0.85),
        ]
    }

    fn input<'a>(text: &'a str, tone: &'a str) -> FingerprintInput<'a> {
        FingerprintInput {
            text,
            suggestion_type: SuggestionType::Reply,
            tone,
            tier: ExecutionTier::Balanced,
            has_media: false,
        }
    }

    // -- fingerprint ------------------------------------------------------

    #[test]
    fn test_fingerprint_deterministic() {
        let a = fingerprint(&input("hello", "playful"));
        let b = fingerprint(&input("hello", "playful"));
        assert_eq!(a, b, "identical inputs must yield identical keys");
    }

    #[test]
    fn test_fingerprint_differs_per_field() {
        let base = fingerprint(&input("hello", "playful"));

        assert_ne!(base, fingerprint(&input("hello!", "playful")), "text");
        assert_ne!(base, fingerprint(&input("hello", "witty")), "tone");

        let mut other = input("hello", "playful");
        other.suggestion_type = SuggestionType::Opener;
        assert_ne!(base, fingerprint(&other), "suggestion_type");

        let mut other = input("hello", "playful");
        other.tier = ExecutionTier::Fast;
        assert_ne!(base, fingerprint(&other), "tier");

        let mut other = input("hello", "playful");
        other.has_media = true;
        assert_ne!(base, fingerprint(&other), "has_media");
    }

    #[test]
    fn test_fingerprint_property_sample_no_collisions() {
        use std::collections::HashSet;
        let mut keys = HashSet::new();
        let tones = ["playful", "witty", "sincere"];
        for i in 0..50 {
            for tone in tones {
                for has_media in [false, true] {
                    let text = format!("context number {i}");
                    let mut inp = input(&text, tone);
                    inp.has_media = has_media;
                    keys.insert(fingerprint(&inp));
                }
            }
        }
        assert_eq!(keys.len(), 50 * 3 * 2, "sampled inputs must not collide");
    }

    #[test]
    fn test_fingerprint_key_prefix() {
        assert!(fingerprint(&input("x", "y")).starts_with("suggest:"));
    }

    // -- lookup / write ---------------------------------------------------

    #[tokio::test]
    async fn test_write_and_lookup_roundtrip() {
        let cache = cache();
        let wrote = cache
            .write("k1", &candidates(), 0.9, ExecutionTier::Balanced, RequestCategory::Standard)
            .await;
        assert!(wrote);

        let hit = cache.lookup("k1").await;
        let entry = hit.unwrap_or_else(|| std::panic::panic_any("test: expected hit"));
        assert_eq!(entry.candidates.len(), 2);
        assert!((entry.quality_score - 0.9).abs() < f64::EPSILON);
        assert_eq!(entry.tier, ExecutionTier::Balanced);
    }

    #[tokio::test]
    async fn test_lookup_miss_returns_none() {
        assert!(cache().lookup("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_write_below_threshold_is_skipped() {
        let cache = cache();
        // complex threshold is 0.85
        let wrote = cache
            .write("k1", &candidates(), 0.84, ExecutionTier::Comprehensive, RequestCategory::Complex)
            .await;
        assert!(!wrote, "0.84 < 0.85 must skip the write");
        assert!(cache.lookup("k1").await.is_none());
    }

    #[tokio::test]
    async fn test_write_at_threshold_is_accepted() {
        let cache = cache();
        let wrote = cache
            .write("k1", &candidates(), 0.85, ExecutionTier::Comprehensive, RequestCategory::Complex)
            .await;
        assert!(wrote, "quality equal to the threshold must be stored");
    }

    #[tokio::test]
    async fn test_thresholds_vary_by_category() {
        let cache = cache();
        // 0.76 clears standard (0.75) but not simple (0.80)
        assert!(
            cache
                .write("std", &candidates(), 0.76, ExecutionTier::Balanced, RequestCategory::Standard)
                .await
        );
        assert!(
            !cache
                .write("simp", &candidates(), 0.76, ExecutionTier::Fast, RequestCategory::Simple)
                .await
        );
    }

    // -- expiry -----------------------------------------------------------

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let mut config = CacheConfig::default();
        config.policies = CachePolicyTable {
            simple: CachePolicy {
                ttl_secs: 1,
                min_quality: 0.5,
            },
            ..config.policies
        };
        let cache = SuggestionCache::new_memory(config);

        cache
            .write("k", &candidates(), 0.9, ExecutionTier::Fast, RequestCategory::Simple)
            .await;
        assert!(
            cache.lookup("k").await.is_some(),
            "entry must be readable before TTL"
        );

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(
            cache.lookup("k").await.is_none(),
            "entry must be gone after TTL"
        );
    }

    #[tokio::test]
    async fn test_evict_expired_sweeps_only_stale_entries() {
        let mut config = CacheConfig::default();
        config.policies = CachePolicyTable {
            simple: CachePolicy {
                ttl_secs: 1,
                min_quality: 0.5,
            },
            ..config.policies
        };
        let cache = SuggestionCache::new_memory(config);

        cache
            .write("stale", &candidates(), 0.9, ExecutionTier::Fast, RequestCategory::Simple)
            .await;
        cache
            .write("fresh", &candidates(), 0.9, ExecutionTier::Balanced, RequestCategory::Standard)
            .await;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let removed = cache.evict_expired();
        assert_eq!(removed, 1, "only the short-TTL entry should be swept");
        assert_eq!(cache.stats().entries, 1);
        assert!(cache.lookup("fresh").await.is_some());
    }

    // -- capacity ---------------------------------------------------------

    #[tokio::test]
    async fn test_capacity_eviction_bounds_store() {
        let config = CacheConfig {
            max_entries: 3,
            ..CacheConfig::default()
        };
        let cache = SuggestionCache::new_memory(config);

        for i in 0..4 {
            cache
                .write(
                    &format!("k{i}"),
                    &candidates(),
                    0.9,
                    ExecutionTier::Balanced,
                    RequestCategory::Standard,
                )
                .await;
        }
        assert_eq!(
            cache.stats().entries,
            3,
            "store must not exceed capacity after eviction"
        );
        assert!(cache.lookup("k3").await.is_some(), "newest entry must survive");
    }

    #[tokio::test]
    async fn test_overwrite_existing_key() {
        let cache = cache();
        cache
            .write("k", &candidates(), 0.9, ExecutionTier::Balanced, RequestCategory::Standard)
            .await;
        let newer = vec![SuggestionCandidate::new("fresh take", 0.95)];
        cache
            .write("k", &newer, 0.95, ExecutionTier::Comprehensive, RequestCategory::Standard)
            .await;

        let entry = cache
            .lookup("k")
            .await
            .unwrap_or_else(|| std::panic::panic_any("test: expected hit"));
        assert_eq!(entry.candidates.len(), 1);
        assert_eq!(entry.tier, ExecutionTier::Comprehensive);
    }

    #[tokio::test]
    async fn test_concurrent_access_no_corruption() {
        let cache = SuggestionCache::new_memory(CacheConfig {
            max_entries: 1000,
            ..CacheConfig::default()
        });

        let mut handles = Vec::new();
        for i in 0..10 {
            let c = cache.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..50 {
                    c.write(
                        &format!("task-{i}-key-{j}"),
                        &[SuggestionCandidate::new("v", 0.9)],
                        0.9,
                        ExecutionTier::Fast,
                        RequestCategory::Standard,
                    )
                    .await;
                    let _ = c.lookup(&format!("task-{i}-key-{j}")).await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap_or(());
        }

        let stats = cache.stats();
        assert!(stats.entries <= 1000);
        assert_eq!(stats.backend, "memory");
    }

    #[tokio::test]
    async fn test_eviction_loop_task_spawns_and_aborts() {
        let cache = cache();
        let handle = cache.spawn_eviction_loop();
        assert!(!handle.is_finished(), "loop must keep running");
        handle.abort();
    }
}
