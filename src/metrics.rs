//! Prometheus metrics and per-tier bookkeeping.
//!
//! One [`EngineMetrics`] bundle is constructed per engine and injected into
//! the components that record to it — there is no process-global registry.
//! Construct it once, share it via `Arc`, and expose [`EngineMetrics::gather`]
//! from whatever surface embeds the engine.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `suggestion_requests_total` | Counter | `tier`, `outcome` |
//! | `suggestion_cache_events_total` | Counter | `event` |
//! | `suggestion_admission_rejections_total` | Counter | `tier` |
//! | `suggestion_fallback_total` | Counter | `depth` |
//! | `suggestion_request_duration_seconds` | Histogram | `tier` |
//! | `suggestion_in_flight` | Gauge | `tier` |
//!
//! Alongside the Prometheus bundle, a per-tier moving-average latency
//! ([`TierStats`], EMA `0.9·old + 0.1·new`) feeds the health snapshot.

use crate::tier::ExecutionTier;
use crate::OrchestratorError;
use dashmap::DashMap;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use serde::Serialize;
use std::time::Duration;

/// Smoothing factor for the latency EMA: weight of the previous average.
const EMA_ALPHA: f64 = 0.9;

/// Per-tier execution statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierStats {
    /// Exponential moving average of execution latency.
    pub ema_latency_ms: f64,
    /// Number of successful executions.
    pub success_count: u64,
    /// Number of failed executions.
    pub failure_count: u64,
}

impl TierStats {
    /// Success ratio over all recorded executions, or 1.0 before any.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }
}

/// All metrics for one engine instance, bundled so a single `Arc` can be
/// handed to every component that records.
///
/// # Panics
///
/// This type and its methods never panic.
pub struct EngineMetrics {
    registry: Registry,
    requests_total: CounterVec,
    cache_events: CounterVec,
    admission_rejections: CounterVec,
    fallback_total: CounterVec,
    request_duration: HistogramVec,
    in_flight: IntGaugeVec,
    tier_stats: DashMap<ExecutionTier, TierStats>,
}

impl EngineMetrics {
    /// Construct and register all metric descriptors.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Other`] if metric construction or
    /// registry registration fails (e.g., duplicate descriptor names).
    pub fn new() -> Result<Self, OrchestratorError> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("suggestion_requests_total", "Requests handled"),
            &["tier", "outcome"],
        )
        .map_err(|e| OrchestratorError::Other(format!("metrics init failed: {e}")))?;
        registry
            .register(Box::new(requests_total.clone()))
            .map_err(|e| OrchestratorError::Other(format!("metrics registration failed: {e}")))?;

        let cache_events = CounterVec::new(
            Opts::new("suggestion_cache_events_total", "Cache hits/misses/writes/skips"),
            &["event"],
        )
        .map_err(|e| OrchestratorError::Other(format!("metrics init failed: {e}")))?;
        registry
            .register(Box::new(cache_events.clone()))
            .map_err(|e| OrchestratorError::Other(format!("metrics registration failed: {e}")))?;

        let admission_rejections = CounterVec::new(
            Opts::new(
                "suggestion_admission_rejections_total",
                "Requests refused at admission",
            ),
            &["tier"],
        )
        .map_err(|e| OrchestratorError::Other(format!("metrics init failed: {e}")))?;
        registry
            .register(Box::new(admission_rejections.clone()))
            .map_err(|e| OrchestratorError::Other(format!("metrics registration failed: {e}")))?;

        let fallback_total = CounterVec::new(
            Opts::new(
                "suggestion_fallback_total",
                "Fallback resolutions by chain depth",
            ),
            &["depth"],
        )
        .map_err(|e| OrchestratorError::Other(format!("metrics init failed: {e}")))?;
        registry
            .register(Box::new(fallback_total.clone()))
            .map_err(|e| OrchestratorError::Other(format!("metrics registration failed: {e}")))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "suggestion_request_duration_seconds",
                "End-to-end handling duration",
            ),
            &["tier"],
        )
        .map_err(|e| OrchestratorError::Other(format!("metrics init failed: {e}")))?;
        registry
            .register(Box::new(request_duration.clone()))
            .map_err(|e| OrchestratorError::Other(format!("metrics registration failed: {e}")))?;

        let in_flight = IntGaugeVec::new(
            Opts::new("suggestion_in_flight", "In-flight requests per tier"),
            &["tier"],
        )
        .map_err(|e| OrchestratorError::Other(format!("metrics init failed: {e}")))?;
        registry
            .register(Box::new(in_flight.clone()))
            .map_err(|e| OrchestratorError::Other(format!("metrics registration failed: {e}")))?;

        Ok(Self {
            registry,
            requests_total,
            cache_events,
            admission_rejections,
            fallback_total,
            request_duration,
            in_flight,
            tier_stats: DashMap::new(),
        })
    }

    // ── Recording ──────────────────────────────────────────────────────

    /// Count one handled request with its outcome label
    /// (`served`, `degraded`, `cache_hit`, `rejected`).
    pub fn inc_request(&self, tier: ExecutionTier, outcome: &str) {
        if let Ok(c) = self
            .requests_total
            .get_metric_with_label_values(&[tier.as_str(), outcome])
        {
            c.inc();
        }
    }

    /// Count one cache event (`hit`, `miss`, `write`, `skip`).
    pub fn inc_cache_event(&self, event: &str) {
        if let Ok(c) = self.cache_events.get_metric_with_label_values(&[event]) {
            c.inc();
        }
    }

    /// Count one admission rejection.
    pub fn inc_rejection(&self, tier: ExecutionTier) {
        if let Ok(c) = self
            .admission_rejections
            .get_metric_with_label_values(&[tier.as_str()])
        {
            c.inc();
        }
    }

    /// Count one fallback resolution at the given chain depth.
    pub fn inc_fallback(&self, depth: usize) {
        if let Ok(c) = self
            .fallback_total
            .get_metric_with_label_values(&[&depth.to_string()])
        {
            c.inc();
        }
    }

    /// Record an end-to-end handling duration.
    pub fn observe_duration(&self, tier: ExecutionTier, d: Duration) {
        if let Ok(h) = self
            .request_duration
            .get_metric_with_label_values(&[tier.as_str()])
        {
            h.observe(d.as_secs_f64());
        }
    }

    /// Set the in-flight gauge for a tier.
    pub fn set_in_flight(&self, tier: ExecutionTier, depth: i64) {
        if let Ok(g) = self.in_flight.get_metric_with_label_values(&[tier.as_str()]) {
            g.set(depth);
        }
    }

    /// Fold one tier execution into the moving averages.
    ///
    /// The first observation seeds the EMA; later ones blend in at
    /// `0.9·old + 0.1·new`.
    pub fn record_tier_outcome(&self, tier: ExecutionTier, latency: Duration, success: bool) {
        let latency_ms = latency.as_millis() as f64;
        let mut stats = self.tier_stats.entry(tier).or_default();
        if stats.success_count + stats.failure_count == 0 {
            stats.ema_latency_ms = latency_ms;
        } else {
            stats.ema_latency_ms = EMA_ALPHA * stats.ema_latency_ms + (1.0 - EMA_ALPHA) * latency_ms;
        }
        if success {
            stats.success_count += 1;
        } else {
            stats.failure_count += 1;
        }
    }

    // ── Reading ────────────────────────────────────────────────────────

    /// Snapshot of one tier's stats (zeroed if nothing recorded yet).
    pub fn tier_stats(&self, tier: ExecutionTier) -> TierStats {
        self.tier_stats
            .get(&tier)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Stats for every tier, including tiers with nothing recorded yet.
    pub fn snapshot(&self) -> Vec<(ExecutionTier, TierStats)> {
        ExecutionTier::ALL
            .iter()
            .map(|&tier| (tier, self.tier_stats(tier)))
            .collect()
    }

    /// Gather and encode all metrics in the Prometheus text exposition
    /// format. Returns an empty string if encoding fails; observability
    /// degrades gracefully rather than erroring.
    pub fn gather(&self) -> String {
        let families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
