//! The orchestrator: wires every stage into one request pipeline.
//!
//! [`Orchestrator::handle`] runs the full flow for one request: classify,
//! select a tier under current load, admit against concurrency ceilings,
//! consult the cache, execute on the tier's backend (streaming progressively
//! when asked), absorb failures through the fallback chain, write the cache,
//! and record metrics. Every collaborator is constructed explicitly and
//! injected; nothing here reaches for process-global state, so tests can
//! stand up as many isolated engines as they like.

use crate::admission::{AdmissionController, AdmissionDecision};
use crate::cache::{fingerprint, FingerprintInput, SuggestionCache};
use crate::classify::Classifier;
use crate::config::{validate, OrchestratorConfig};
use crate::delivery::{DeliveryChannel, StreamHandle, SubscriberTransport};
use crate::executor::{TierExecutor, CANDIDATE_COUNT};
use crate::fallback::FallbackChain;
use crate::metrics::{EngineMetrics, TierStats};
use crate::tier::{ExecutionTier, TierSelector};
use crate::{
    BackendClient, OrchestratorError, SuggestionRequest, SuggestionResponse,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

/// Point-in-time operational view of one engine, for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Global load ratio: in-flight / global ceiling.
    pub load: f64,
    /// In-flight requests across all tiers.
    pub in_flight_total: usize,
    /// Entries currently held by the cache.
    pub cache_entries: usize,
    /// Cache storage backend in use.
    pub cache_backend: &'static str,
    /// Stream sessions currently tracked.
    pub active_streams: usize,
    /// Per-tier occupancy and latency statistics.
    pub tiers: Vec<TierHealth>,
}

/// One tier's slice of the health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TierHealth {
    /// The tier.
    pub tier: ExecutionTier,
    /// In-flight requests on this tier.
    pub in_flight: usize,
    /// Moving-average latency and success/failure counts.
    pub stats: TierStats,
}

/// The assembled engine.
///
/// # Panics
///
/// This type and its methods never panic.
pub struct Orchestrator {
    classifier: Classifier,
    selector: TierSelector,
    admission: AdmissionController,
    cache: SuggestionCache,
    executor: TierExecutor,
    fallback: FallbackChain,
    delivery: DeliveryChannel,
    metrics: Arc<EngineMetrics>,
    maintenance: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Assemble an engine from a validated configuration, a set of backend
    /// clients, and a delivery transport.
    ///
    /// Spawns the cache eviction loop and the stale-stream sweep; both are
    /// aborted when the engine is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::ConfigError`] when the configuration
    /// fails validation, or [`OrchestratorError::Other`] if the metrics
    /// bundle cannot be built.
    pub fn new(
        config: OrchestratorConfig,
        backends: Vec<Arc<dyn BackendClient>>,
        transport: Arc<dyn SubscriberTransport>,
    ) -> Result<Self, OrchestratorError> {
        let errors = validate(&config);
        if !errors.is_empty() {
            return Err(OrchestratorError::ConfigError(errors.join("; ")));
        }

        let metrics = Arc::new(EngineMetrics::new()?);
        let admission = AdmissionController::new(config.admission.clone());
        let cache = SuggestionCache::new_memory(config.cache.clone());
        let delivery = DeliveryChannel::new(transport, config.streaming.clone());

        let mut executor = TierExecutor::new(config.tiers.clone(), config.quality);
        for backend in backends {
            executor.register_backend(backend);
        }

        let maintenance = vec![cache.spawn_eviction_loop(), delivery.spawn_sweep_loop()];

        Ok(Self {
            classifier: Classifier::new(),
            selector: TierSelector::new(config.tiers),
            admission,
            cache,
            executor,
            fallback: FallbackChain::new(),
            delivery,
            metrics,
            maintenance,
        })
    }

    /// Handle one request end to end.
    ///
    /// The only error a caller sees is [`OrchestratorError::AdmissionRejected`];
    /// backend failures are absorbed by the fallback chain and surface as a
    /// degraded response instead.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::AdmissionRejected`] with a retry hint
    /// when concurrency ceilings are full.
    pub async fn handle(
        &self,
        request: SuggestionRequest,
    ) -> Result<SuggestionResponse, OrchestratorError> {
        let span = info_span!("handle_request", request_id = %request.request_id);
        self.handle_inner(request).instrument(span).await
    }

    async fn handle_inner(
        &self,
        request: SuggestionRequest,
    ) -> Result<SuggestionResponse, OrchestratorError> {
        let started = Instant::now();
        let profile = self.classifier.classify(&request);
        let choice = self
            .selector
            .select(&profile, &request, self.admission.load());

        let ticket = match self.admission.try_admit(&request.request_id, choice.tier) {
            AdmissionDecision::Admitted(ticket) => ticket,
            AdmissionDecision::Rejected {
                queue_position,
                estimated_wait,
            } => {
                self.metrics.inc_rejection(choice.tier);
                self.metrics.inc_request(choice.tier, "rejected");
                return Err(OrchestratorError::AdmissionRejected {
                    tier: choice.tier,
                    queue_position,
                    estimated_wait_ms: estimated_wait.as_millis() as u64,
                });
            }
        };
        self.metrics
            .set_in_flight(choice.tier, self.admission.in_flight(choice.tier) as i64);

        let key = fingerprint(&FingerprintInput {
            text: &request.context,
            suggestion_type: request.suggestion_type,
            tone: &request.tone,
            tier: choice.tier,
            has_media: request.has_image,
        });

        if let Some(hit) = self.cache.lookup(&key).await {
            self.metrics.inc_cache_event("hit");
            self.metrics.inc_request(choice.tier, "cache_hit");

            // A subscriber still gets a full, terminated stream on a cache
            // hit: Started, the cached candidates as one batch, Completed.
            if let Some(channel) = &request.stream_to {
                let handle = self
                    .delivery
                    .start(&request.request_id, channel.clone(), hit.candidates.len())
                    .await;
                let batch: Vec<(String, f64)> = hit
                    .candidates
                    .iter()
                    .map(|c| (c.text.clone(), c.confidence))
                    .collect();
                handle.send_batch(&batch, &request.tone).await;
                handle.complete().await;
            }

            let latency_ms = started.elapsed().as_millis() as u64;
            info!(
                request_id = %request.request_id,
                tier = choice.tier.as_str(),
                outcome = "cache_hit",
                duration_ms = latency_ms,
                "request handled"
            );
            drop(ticket);
            self.metrics
                .set_in_flight(choice.tier, self.admission.in_flight(choice.tier) as i64);
            return Ok(SuggestionResponse {
                request_id: request.request_id,
                candidates: hit.candidates,
                tier: hit.tier,
                category: profile.primary,
                from_cache: true,
                degraded: false,
                fallback_depth: None,
                quality_score: hit.quality_score,
                latency_ms,
            });
        }
        self.metrics.inc_cache_event("miss");

        let stream: Option<StreamHandle> = match &request.stream_to {
            Some(channel) => Some(
                self.delivery
                    .start(&request.request_id, channel.clone(), CANDIDATE_COUNT)
                    .await,
            ),
            None => None,
        };

        let exec_started = Instant::now();
        let (result, fallback_depth) = match self
            .executor
            .execute(choice.tier, &profile, &request, stream.as_ref())
            .await
        {
            Ok(result) => {
                self.metrics
                    .record_tier_outcome(choice.tier, exec_started.elapsed(), true);
                (result, None)
            }
            Err(error) => {
                self.metrics
                    .record_tier_outcome(choice.tier, exec_started.elapsed(), false);
                warn!(
                    request_id = %request.request_id,
                    tier = choice.tier.as_str(),
                    kind = error.kind(),
                    "tier execution failed, entering fallback chain"
                );
                let outcome = self
                    .fallback
                    .run(&self.executor, choice.tier, &profile, &request)
                    .await;
                self.metrics.inc_fallback(outcome.depth);
                (outcome.result, Some(outcome.depth))
            }
        };

        let wrote = self
            .cache
            .write(
                &key,
                &result.candidates,
                result.quality_score,
                result.tier,
                profile.primary,
            )
            .await;
        self.metrics
            .inc_cache_event(if wrote { "write" } else { "skip" });

        if let Some(handle) = stream {
            // The executor streams its own candidates; fallback results
            // arrive here unstreamed and go out as one batch.
            if fallback_depth.is_some() {
                let batch: Vec<(String, f64)> = result
                    .candidates
                    .iter()
                    .map(|c| (c.text.clone(), c.confidence))
                    .collect();
                handle.send_batch(&batch, &request.tone).await;
            }
            handle.complete().await;
        }

        let degraded = fallback_depth.is_some() || choice.downgraded;
        let outcome_label = if fallback_depth.is_some() {
            "degraded"
        } else {
            "served"
        };
        self.metrics.inc_request(result.tier, outcome_label);
        self.metrics.observe_duration(result.tier, started.elapsed());

        drop(ticket);
        self.metrics
            .set_in_flight(choice.tier, self.admission.in_flight(choice.tier) as i64);

        let latency_ms = started.elapsed().as_millis() as u64;
        info!(
            request_id = %request.request_id,
            tier = result.tier.as_str(),
            outcome = outcome_label,
            duration_ms = latency_ms,
            "request handled"
        );

        Ok(SuggestionResponse {
            request_id: request.request_id,
            candidates: result.candidates,
            tier: result.tier,
            category: profile.primary,
            from_cache: false,
            degraded,
            fallback_depth,
            quality_score: result.quality_score,
            latency_ms,
        })
    }

    /// Point-in-time operational snapshot.
    pub fn health(&self) -> HealthSnapshot {
        let cache_stats = self.cache.stats();
        HealthSnapshot {
            load: self.admission.load(),
            in_flight_total: self.admission.in_flight_total(),
            cache_entries: cache_stats.entries,
            cache_backend: cache_stats.backend,
            active_streams: self.delivery.session_count(),
            tiers: ExecutionTier::ALL
                .iter()
                .map(|&tier| TierHealth {
                    tier,
                    in_flight: self.admission.in_flight(tier),
                    stats: self.metrics.tier_stats(tier),
                })
                .collect(),
        }
    }

    /// Prometheus text exposition for this engine's metrics.
    pub fn metrics_text(&self) -> String {
        self.metrics.gather()
    }

    /// The admission controller, for callers that probe load directly.
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// The shared metrics bundle.
    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        for handle in &self.maintenance {
            handle.abort();
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
