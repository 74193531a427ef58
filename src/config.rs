//! Engine configuration types.
//!
//! Provides [`OrchestratorConfig`] for tuning tier descriptors, admission
//! ceilings, cache policy, quality-score weights, and streaming cadence.
//! All fields have sensible defaults and are (de)serialisable via serde for
//! TOML/JSON config files.

use crate::classify::RequestCategory;
use crate::tier::ExecutionTier;
use crate::OrchestratorError;
use serde::{Deserialize, Serialize};

// ── Default value functions ────────────────────────────────────────────

/// Default global concurrency ceiling across all tiers.
fn default_max_concurrent_total() -> usize {
    8
}

/// Default per-tier concurrency ceiling.
fn default_max_concurrent_per_tier() -> usize {
    3
}

/// Default floor for the retry-wait hint handed to rejected callers.
fn default_min_wait_hint_ms() -> u64 {
    1000
}

/// Default global-load ratio above which tier3-bound requests downgrade.
fn default_load_downgrade_threshold() -> f64 {
    0.8
}

/// Default complexity score above which requests route to the deep tier.
fn default_complexity_ceiling() -> f64 {
    0.7
}

/// Default cache capacity in entries.
fn default_cache_max_entries() -> usize {
    1000
}

/// Default interval between background expired-entry sweeps.
fn default_eviction_interval_secs() -> u64 {
    60
}

/// Default per-category cache policy table.
fn default_cache_policies() -> CachePolicyTable {
    CachePolicyTable {
        simple: CachePolicy {
            ttl_secs: 3600,
            min_quality: 0.80,
        },
        standard: CachePolicy {
            ttl_secs: 1800,
            min_quality: 0.75,
        },
        complex: CachePolicy {
            ttl_secs: 900,
            min_quality: 0.85,
        },
    }
}

fn default_weight_confidence() -> f64 {
    0.3
}

fn default_weight_uniqueness() -> f64 {
    0.25
}

fn default_weight_engagement() -> f64 {
    0.25
}

fn default_weight_length_fit() -> f64 {
    0.1
}

fn default_weight_relevance() -> f64 {
    0.1
}

/// Default lower bound for the adaptive chunk delay.
fn default_min_chunk_delay_ms() -> u64 {
    50
}

/// Default upper bound for the adaptive chunk delay.
fn default_max_chunk_delay_ms() -> u64 {
    200
}

/// Default minimum confidence for a candidate to be streamed.
fn default_stream_quality_threshold() -> f64 {
    0.7
}

/// Default hard timeout after which a stream session is force-cleaned.
fn default_stream_timeout_secs() -> u64 {
    30
}

/// Default interval between stale-session sweeps.
fn default_sweep_interval_secs() -> u64 {
    60
}

/// Default inactivity window after which a session counts as abandoned.
fn default_stale_after_secs() -> u64 {
    300
}

fn default_fast_tier() -> TierDescriptor {
    TierDescriptor {
        target_latency_ms: 1000,
        primary_backend: "grok-4-fast-non-reasoning".to_string(),
        fallback_backend: "grok-3-mini".to_string(),
        affinity: vec!["fast_path".to_string(), "short_context".to_string()],
    }
}

fn default_balanced_tier() -> TierDescriptor {
    TierDescriptor {
        target_latency_ms: 3000,
        primary_backend: "grok-4-fast-reasoning".to_string(),
        fallback_backend: "grok-4-fast-non-reasoning".to_string(),
        affinity: vec!["personalized".to_string()],
    }
}

fn default_comprehensive_tier() -> TierDescriptor {
    TierDescriptor {
        target_latency_ms: 5000,
        primary_backend: "grok-4".to_string(),
        fallback_backend: "grok-4-fast-reasoning".to_string(),
        affinity: vec![
            "has_image".to_string(),
            "long_context".to_string(),
            "references_history".to_string(),
        ],
    }
}

// ── Tier configuration ─────────────────────────────────────────────────

/// Static configuration for one execution tier.
///
/// Read-only after startup; the selector and executor hold a shared copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierDescriptor {
    /// Latency target for the tier. Backend calls time out at twice this.
    pub target_latency_ms: u64,
    /// Identifier of the backend the executor calls first.
    pub primary_backend: String,
    /// Identifier of the backend used by the legacy fallback path.
    pub fallback_backend: String,
    /// Request characteristics this tier is a natural fit for.
    #[serde(default)]
    pub affinity: Vec<String>,
}

/// The full three-tier table plus routing thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierSettings {
    /// Fast tier (tier1): cheap, non-reasoning backend.
    #[serde(default = "default_fast_tier")]
    pub fast: TierDescriptor,

    /// Balanced tier (tier2): reasoning backend.
    #[serde(default = "default_balanced_tier")]
    pub balanced: TierDescriptor,

    /// Comprehensive tier (tier3): the heaviest backend, used for images
    /// and long/history-laden contexts.
    #[serde(default = "default_comprehensive_tier")]
    pub comprehensive: TierDescriptor,

    /// Global-load ratio above which comprehensive-bound requests are
    /// downgraded to the balanced tier.
    #[serde(default = "default_load_downgrade_threshold")]
    pub load_downgrade_threshold: f64,

    /// Complexity score above which a request routes to the comprehensive
    /// tier regardless of its category.
    #[serde(default = "default_complexity_ceiling")]
    pub complexity_ceiling: f64,
}

impl TierSettings {
    /// Look up the descriptor for a tier.
    pub fn descriptor(&self, tier: ExecutionTier) -> &TierDescriptor {
        match tier {
            ExecutionTier::Fast => &self.fast,
            ExecutionTier::Balanced => &self.balanced,
            ExecutionTier::Comprehensive => &self.comprehensive,
        }
    }
}

impl Default for TierSettings {
    fn default() -> Self {
        Self {
            fast: default_fast_tier(),
            balanced: default_balanced_tier(),
            comprehensive: default_comprehensive_tier(),
            load_downgrade_threshold: default_load_downgrade_threshold(),
            complexity_ceiling: default_complexity_ceiling(),
        }
    }
}

// ── Admission configuration ────────────────────────────────────────────

/// Concurrency ceilings for the admission controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdmissionConfig {
    /// Maximum in-flight requests across all tiers.
    #[serde(default = "default_max_concurrent_total")]
    pub max_concurrent_total: usize,

    /// Maximum in-flight requests per tier.
    #[serde(default = "default_max_concurrent_per_tier")]
    pub max_concurrent_per_tier: usize,

    /// Floor for the retry-wait hint returned on rejection.
    #[serde(default = "default_min_wait_hint_ms")]
    pub min_wait_hint_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_total: default_max_concurrent_total(),
            max_concurrent_per_tier: default_max_concurrent_per_tier(),
            min_wait_hint_ms: default_min_wait_hint_ms(),
        }
    }
}

// ── Cache configuration ────────────────────────────────────────────────

/// TTL and write-eligibility for one classification category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CachePolicy {
    /// How long a written entry stays valid.
    pub ttl_secs: u64,
    /// Minimum quality score for a write to be accepted.
    pub min_quality: f64,
}

/// Per-category cache policy table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CachePolicyTable {
    /// Policy for `simple` requests: long TTL, results age well.
    pub simple: CachePolicy,
    /// Policy for `standard` requests.
    pub standard: CachePolicy,
    /// Policy for `complex` requests: short TTL, high quality bar.
    pub complex: CachePolicy,
}

impl CachePolicyTable {
    /// Look up the policy for a category.
    pub fn for_category(&self, category: RequestCategory) -> CachePolicy {
        match category {
            RequestCategory::Simple => self.simple,
            RequestCategory::Standard => self.standard,
            RequestCategory::Complex => self.complex,
        }
    }
}

/// Cache store and eviction settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Capacity bound on the in-memory store.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    /// Interval between background expired-entry sweeps.
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,

    /// Per-category TTL and quality thresholds.
    #[serde(default = "default_cache_policies")]
    pub policies: CachePolicyTable,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            eviction_interval_secs: default_eviction_interval_secs(),
            policies: default_cache_policies(),
        }
    }
}

// ── Quality weights ────────────────────────────────────────────────────

/// Weights for the executor's quality-score blend.
///
/// These are policy, not structure: the blend shape is fixed, the values
/// are tunable. Defaults come from production tuning of the ancestral
/// system; they are not guaranteed optimal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct QualityWeights {
    /// Weight of backend-reported confidence.
    #[serde(default = "default_weight_confidence")]
    pub confidence: f64,
    /// Weight of vocabulary uniqueness across candidates.
    #[serde(default = "default_weight_uniqueness")]
    pub uniqueness: f64,
    /// Weight of engagement signals (questions, exclamations).
    #[serde(default = "default_weight_engagement")]
    pub engagement: f64,
    /// Weight of length appropriateness.
    #[serde(default = "default_weight_length_fit")]
    pub length_fit: f64,
    /// Weight of topical/tone alignment with the request.
    #[serde(default = "default_weight_relevance")]
    pub relevance: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            confidence: default_weight_confidence(),
            uniqueness: default_weight_uniqueness(),
            engagement: default_weight_engagement(),
            length_fit: default_weight_length_fit(),
            relevance: default_weight_relevance(),
        }
    }
}

impl QualityWeights {
    /// Sum of all weights; a valid blend sums to 1.0.
    pub fn total(&self) -> f64 {
        self.confidence + self.uniqueness + self.engagement + self.length_fit + self.relevance
    }
}

// ── Streaming configuration ────────────────────────────────────────────

/// Progressive-delivery cadence and lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamingConfig {
    /// Lower bound on the adaptive chunk delay.
    #[serde(default = "default_min_chunk_delay_ms")]
    pub min_chunk_delay_ms: u64,

    /// Upper bound on the adaptive chunk delay.
    #[serde(default = "default_max_chunk_delay_ms")]
    pub max_chunk_delay_ms: u64,

    /// Candidates below this confidence are not streamed.
    #[serde(default = "default_stream_quality_threshold")]
    pub quality_threshold: f64,

    /// Hard timeout after which an active session is force-cleaned as stale.
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,

    /// Interval between stale-session sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Inactivity window after which a session counts as abandoned.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            min_chunk_delay_ms: default_min_chunk_delay_ms(),
            max_chunk_delay_ms: default_max_chunk_delay_ms(),
            quality_threshold: default_stream_quality_threshold(),
            stream_timeout_secs: default_stream_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

// ── OrchestratorConfig ─────────────────────────────────────────────────

/// Top-level engine configuration.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OrchestratorConfig {
    /// Tier table and routing thresholds.
    #[serde(default)]
    pub tiers: TierSettings,

    /// Admission ceilings.
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Cache store and policy table.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Quality-score blend weights.
    #[serde(default)]
    pub quality: QualityWeights,

    /// Streaming cadence and lifecycle.
    #[serde(default)]
    pub streaming: StreamingConfig,
}

impl OrchestratorConfig {
    /// Parse a configuration from a TOML document, applying defaults for
    /// every missing field.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::ConfigError`] on malformed TOML or on
    /// validation failure.
    pub fn from_toml_str(raw: &str) -> Result<Self, OrchestratorError> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| OrchestratorError::ConfigError(format!("invalid TOML: {e}")))?;
        let errors = validate(&config);
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(OrchestratorError::ConfigError(errors.join("; ")))
        }
    }
}

/// Validate an [`OrchestratorConfig`], returning a list of human-readable errors.
///
/// # Returns
///
/// An empty `Vec` on success, or one error string per violated constraint.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &OrchestratorConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if config.admission.max_concurrent_total == 0 {
        errors.push("admission.max_concurrent_total must be > 0".to_string());
    }

    if config.admission.max_concurrent_per_tier == 0 {
        errors.push("admission.max_concurrent_per_tier must be > 0".to_string());
    }

    if config.admission.max_concurrent_per_tier > config.admission.max_concurrent_total {
        errors.push(format!(
            "admission.max_concurrent_per_tier ({}) must be <= max_concurrent_total ({})",
            config.admission.max_concurrent_per_tier, config.admission.max_concurrent_total
        ));
    }

    if config.tiers.load_downgrade_threshold <= 0.0 || config.tiers.load_downgrade_threshold > 1.0 {
        errors.push(format!(
            "tiers.load_downgrade_threshold must be in (0.0, 1.0], got {}",
            config.tiers.load_downgrade_threshold
        ));
    }

    if config.tiers.complexity_ceiling < 0.0 || config.tiers.complexity_ceiling > 1.0 {
        errors.push(format!(
            "tiers.complexity_ceiling must be in [0.0, 1.0], got {}",
            config.tiers.complexity_ceiling
        ));
    }

    for (name, descriptor) in [
        ("fast", &config.tiers.fast),
        ("balanced", &config.tiers.balanced),
        ("comprehensive", &config.tiers.comprehensive),
    ] {
        if descriptor.target_latency_ms == 0 {
            errors.push(format!("tiers.{name}.target_latency_ms must be > 0"));
        }
        if descriptor.primary_backend.is_empty() {
            errors.push(format!("tiers.{name}.primary_backend must not be empty"));
        }
        if descriptor.fallback_backend.is_empty() {
            errors.push(format!("tiers.{name}.fallback_backend must not be empty"));
        }
    }

    for (name, policy) in [
        ("simple", config.cache.policies.simple),
        ("standard", config.cache.policies.standard),
        ("complex", config.cache.policies.complex),
    ] {
        if policy.ttl_secs == 0 {
            errors.push(format!("cache.policies.{name}.ttl_secs must be > 0"));
        }
        if policy.min_quality < 0.0 || policy.min_quality > 1.0 {
            errors.push(format!(
                "cache.policies.{name}.min_quality must be in [0.0, 1.0], got {}",
                policy.min_quality
            ));
        }
    }

    if config.cache.eviction_interval_secs == 0 {
        errors.push("cache.eviction_interval_secs must be > 0".to_string());
    }

    let total = config.quality.total();
    if (total - 1.0).abs() > 0.01 {
        errors.push(format!("quality weights must sum to 1.0, got {total}"));
    }

    if config.streaming.min_chunk_delay_ms > config.streaming.max_chunk_delay_ms {
        errors.push(format!(
            "streaming.min_chunk_delay_ms ({}) must be <= max_chunk_delay_ms ({})",
            config.streaming.min_chunk_delay_ms, config.streaming.max_chunk_delay_ms
        ));
    }

    if config.streaming.quality_threshold < 0.0 || config.streaming.quality_threshold > 1.0 {
        errors.push(format!(
            "streaming.quality_threshold must be in [0.0, 1.0], got {}",
            config.streaming.quality_threshold
        ));
    }

    if config.streaming.stream_timeout_secs == 0 {
        errors.push("streaming.stream_timeout_secs must be > 0".to_string());
    }

    errors
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // -- defaults --------------------------------------------------------

    #[test]
    fn test_default_admission_ceilings() {
        let cfg = AdmissionConfig::default();
        assert_eq!(cfg.max_concurrent_total, 8);
        assert_eq!(cfg.max_concurrent_per_tier, 3);
        assert_eq!(cfg.min_wait_hint_ms, 1000);
    }

    #[test]
    fn test_default_tier_latency_targets() {
        let tiers = TierSettings::default();
        assert_eq!(tiers.fast.target_latency_ms, 1000);
        assert_eq!(tiers.balanced.target_latency_ms, 3000);
        assert_eq!(tiers.comprehensive.target_latency_ms, 5000);
    }

    #[test]
    fn test_default_load_downgrade_threshold_is_0_8() {
        let tiers = TierSettings::default();
        assert!((tiers.load_downgrade_threshold - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_default_cache_policy_table() {
        let table = default_cache_policies();
        assert_eq!(table.simple.ttl_secs, 3600);
        assert!((table.simple.min_quality - 0.80).abs() < f64::EPSILON);
        assert_eq!(table.standard.ttl_secs, 1800);
        assert!((table.standard.min_quality - 0.75).abs() < f64::EPSILON);
        assert_eq!(table.complex.ttl_secs, 900);
        assert!((table.complex.min_quality - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn test_default_quality_weights_sum_to_one() {
        let w = QualityWeights::default();
        assert!(
            (w.total() - 1.0).abs() < 1e-9,
            "weights must sum to 1.0, got {}",
            w.total()
        );
    }

    #[test]
    fn test_default_streaming_window() {
        let s = StreamingConfig::default();
        assert_eq!(s.min_chunk_delay_ms, 50);
        assert_eq!(s.max_chunk_delay_ms, 200);
        assert!((s.quality_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(s.stream_timeout_secs, 30);
        assert_eq!(s.sweep_interval_secs, 60);
        assert_eq!(s.stale_after_secs, 300);
    }

    #[test]
    fn test_policy_table_lookup_by_category() {
        let table = default_cache_policies();
        assert_eq!(
            table.for_category(RequestCategory::Complex).ttl_secs,
            table.complex.ttl_secs
        );
        assert_eq!(
            table.for_category(RequestCategory::Simple).ttl_secs,
            table.simple.ttl_secs
        );
    }

    // -- serde -----------------------------------------------------------

    #[test]
    fn test_config_toml_roundtrip() {
        let cfg = OrchestratorConfig::default();
        let toml_str = toml::to_string_pretty(&cfg)
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: serialize: {e}")));
        let parsed: OrchestratorConfig = toml::from_str(&toml_str)
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: deserialize: {e}")));
        assert_eq!(cfg, parsed);
    }

    #[test]
    fn test_config_empty_toml_yields_defaults() {
        let cfg = OrchestratorConfig::from_toml_str("")
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: parse: {e}")));
        assert_eq!(cfg, OrchestratorConfig::default());
    }

    #[test]
    fn test_config_partial_toml_overrides_one_field() {
        let raw = r#"
[admission]
max_concurrent_total = 16
"#;
        let cfg = OrchestratorConfig::from_toml_str(raw)
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: parse: {e}")));
        assert_eq!(cfg.admission.max_concurrent_total, 16);
        assert_eq!(cfg.admission.max_concurrent_per_tier, 3);
    }

    #[test]
    fn test_config_malformed_toml_is_config_error() {
        let result = OrchestratorConfig::from_toml_str("not = [valid");
        assert!(matches!(
            result,
            Err(crate::OrchestratorError::ConfigError(_))
        ));
    }

    // -- validation ------------------------------------------------------

    #[test]
    fn test_validate_default_config_passes() {
        let errors = validate(&OrchestratorConfig::default());
        assert!(errors.is_empty(), "expected no errors, got: {errors:?}");
    }

    #[test]
    fn test_validate_zero_global_ceiling_fails() {
        let mut cfg = OrchestratorConfig::default();
        cfg.admission.max_concurrent_total = 0;
        let errors = validate(&cfg);
        assert!(errors.iter().any(|e| e.contains("max_concurrent_total")));
    }

    #[test]
    fn test_validate_per_tier_above_global_fails() {
        let mut cfg = OrchestratorConfig::default();
        cfg.admission.max_concurrent_per_tier = 20;
        let errors = validate(&cfg);
        assert!(errors
            .iter()
            .any(|e| e.contains("max_concurrent_per_tier") && e.contains("<=")));
    }

    #[test]
    fn test_validate_downgrade_threshold_bounds() {
        let mut cfg = OrchestratorConfig::default();
        cfg.tiers.load_downgrade_threshold = 1.5;
        assert!(validate(&cfg)
            .iter()
            .any(|e| e.contains("load_downgrade_threshold")));

        cfg.tiers.load_downgrade_threshold = 0.0;
        assert!(validate(&cfg)
            .iter()
            .any(|e| e.contains("load_downgrade_threshold")));
    }

    #[test]
    fn test_validate_empty_backend_id_fails() {
        let mut cfg = OrchestratorConfig::default();
        cfg.tiers.balanced.primary_backend = String::new();
        let errors = validate(&cfg);
        assert!(errors
            .iter()
            .any(|e| e.contains("tiers.balanced.primary_backend")));
    }

    #[test]
    fn test_validate_cache_quality_out_of_range_fails() {
        let mut cfg = OrchestratorConfig::default();
        cfg.cache.policies.complex.min_quality = 1.2;
        let errors = validate(&cfg);
        assert!(errors
            .iter()
            .any(|e| e.contains("cache.policies.complex.min_quality")));
    }

    #[test]
    fn test_validate_quality_weights_must_sum_to_one() {
        let mut cfg = OrchestratorConfig::default();
        cfg.quality.confidence = 0.9;
        let errors = validate(&cfg);
        assert!(errors.iter().any(|e| e.contains("sum to 1.0")));
    }

    #[test]
    fn test_validate_inverted_delay_window_fails() {
        let mut cfg = OrchestratorConfig::default();
        cfg.streaming.min_chunk_delay_ms = 300;
        let errors = validate(&cfg);
        assert!(errors.iter().any(|e| e.contains("min_chunk_delay_ms")));
    }

    #[test]
    fn test_validate_collects_multiple_errors() {
        let mut cfg = OrchestratorConfig::default();
        cfg.admission.max_concurrent_total = 0;
        cfg.admission.max_concurrent_per_tier = 0;
        cfg.tiers.fast.target_latency_ms = 0;
        cfg.streaming.stream_timeout_secs = 0;
        let errors = validate(&cfg);
        assert!(errors.len() >= 4, "expected >=4 errors, got {errors:?}");
    }
}
