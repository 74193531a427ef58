//! Tier execution: prompt assembly, backend dispatch, quality scoring.
//!
//! The executor owns the backend registry. Given a tier and a classified
//! request it shapes generation parameters (token budget by category,
//! temperature by tone), calls the tier's primary backend under a hard
//! timeout of twice the tier's latency target, scores what comes back, and
//! optionally streams accepted candidates through a [`StreamHandle`].
//!
//! Quality is a weighted blend of five signals per candidate; the weights
//! live in [`QualityWeights`] so deployments can retune them without code
//! changes.

use crate::backend::{BackendClient, BackendError, GenerationRequest};
use crate::classify::{ClassificationProfile, RequestCategory};
use crate::config::{QualityWeights, TierSettings};
use crate::delivery::StreamHandle;
use crate::tier::ExecutionTier;
use crate::{SuggestionCandidate, SuggestionRequest};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Candidates requested from a backend per call.
pub const CANDIDATE_COUNT: usize = 3;

/// Base sampling temperature before tone adjustment.
const BASE_TEMPERATURE: f64 = 0.8;

/// Token budget for the legacy minimal path.
const MINIMAL_MAX_TOKENS: u32 = 400;

/// One successful tier execution.
#[derive(Debug, Clone)]
pub struct TierResult {
    /// Scored candidates, input order preserved.
    pub candidates: Vec<SuggestionCandidate>,
    /// Tier that produced the result.
    pub tier: ExecutionTier,
    /// Backend that produced the result.
    pub backend_id: String,
    /// Wall-clock execution latency.
    pub latency_ms: u64,
    /// Mean blended quality across candidates.
    pub quality_score: f64,
}

/// Dispatches classified requests to tier backends.
///
/// # Panics
///
/// This type and its methods never panic.
pub struct TierExecutor {
    backends: HashMap<String, Arc<dyn BackendClient>>,
    settings: TierSettings,
    weights: QualityWeights,
}

impl TierExecutor {
    /// Create an executor with an empty backend registry.
    pub fn new(settings: TierSettings, weights: QualityWeights) -> Self {
        Self {
            backends: HashMap::new(),
            settings,
            weights,
        }
    }

    /// Register a backend client under its own id.
    pub fn register_backend(&mut self, client: Arc<dyn BackendClient>) {
        self.backends.insert(client.id().to_string(), client);
    }

    /// Ids of all registered backends.
    pub fn backend_ids(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// The tier table this executor dispatches against.
    pub fn settings(&self) -> &TierSettings {
        &self.settings
    }

    /// Execute a request on a tier's primary backend.
    ///
    /// Accepted candidates are pushed through `stream` as they are scored,
    /// when a handle is provided.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Unavailable`] when the backend is missing
    /// from the registry or the call exceeds twice the tier's latency
    /// target, or whatever error the backend itself reports.
    pub async fn execute(
        &self,
        tier: ExecutionTier,
        profile: &ClassificationProfile,
        request: &SuggestionRequest,
        stream: Option<&StreamHandle>,
    ) -> Result<TierResult, BackendError> {
        let descriptor = self.settings.descriptor(tier);
        let generation = GenerationRequest {
            prompt: build_prompt(request, CANDIDATE_COUNT),
            max_tokens: max_tokens_for(profile.primary),
            temperature: temperature_for(profile.primary, &request.tone),
            candidate_count: CANDIDATE_COUNT,
        };
        self.dispatch(tier, &descriptor.primary_backend, descriptor.target_latency_ms, &generation, request, stream)
            .await
    }

    /// Execute the legacy minimal path: a bare prompt with a fixed budget
    /// against an explicitly named backend. Used as the last generation
    /// attempt before emergency candidates.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`TierExecutor::execute`].
    pub async fn execute_minimal(
        &self,
        backend_id: &str,
        request: &SuggestionRequest,
    ) -> Result<TierResult, BackendError> {
        let generation = GenerationRequest {
            prompt: format!(
                "Suggest a short {} message for this conversation: {}",
                request.suggestion_type.as_str(),
                request.context
            ),
            max_tokens: MINIMAL_MAX_TOKENS,
            temperature: 0.7,
            candidate_count: 2,
        };
        let target = self.settings.fast.target_latency_ms;
        self.dispatch(ExecutionTier::Fast, backend_id, target, &generation, request, None)
            .await
    }

    async fn dispatch(
        &self,
        tier: ExecutionTier,
        backend_id: &str,
        target_latency_ms: u64,
        generation: &GenerationRequest,
        request: &SuggestionRequest,
        stream: Option<&StreamHandle>,
    ) -> Result<TierResult, BackendError> {
        let backend = self.backends.get(backend_id).ok_or_else(|| {
            BackendError::Unavailable(format!("backend {backend_id} is not registered"))
        })?;

        let deadline = Duration::from_millis(target_latency_ms.saturating_mul(2));
        let started = Instant::now();
        let outcome = match tokio::time::timeout(deadline, backend.generate(generation)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    backend = backend_id,
                    tier = tier.as_str(),
                    deadline_ms = deadline.as_millis() as u64,
                    "backend call exceeded tier deadline"
                );
                return Err(BackendError::Unavailable(format!(
                    "{backend_id}: exceeded {}ms deadline",
                    deadline.as_millis()
                )));
            }
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let mut candidates = Vec::with_capacity(outcome.candidates.len());
        let mut quality_sum = 0.0;
        for text in outcome.candidates {
            let score = score_candidate(&self.weights, &text, outcome.backend_confidence, request);
            quality_sum += score;
            if let Some(handle) = stream {
                handle.send_chunk(&text, score, &request.tone).await;
            }
            candidates.push(SuggestionCandidate::new(text, score));
        }
        let quality_score = if candidates.is_empty() {
            0.0
        } else {
            quality_sum / candidates.len() as f64
        };

        debug!(
            backend = backend_id,
            tier = tier.as_str(),
            count = candidates.len(),
            quality = quality_score,
            latency_ms = latency_ms,
            "tier execution complete"
        );

        Ok(TierResult {
            candidates,
            tier,
            backend_id: backend_id.to_string(),
            latency_ms,
            quality_score,
        })
    }
}

// ── Parameter shaping ──────────────────────────────────────────────────

/// Token budget per classification category.
pub fn max_tokens_for(category: RequestCategory) -> u32 {
    match category {
        RequestCategory::Simple => 800,
        RequestCategory::Standard => 1200,
        RequestCategory::Complex => 1500,
    }
}

/// Sampling temperature for a category and tone.
///
/// Creative tones run hotter, simple requests run cooler; the result is
/// clamped to `[0.1, 1.2]`.
pub fn temperature_for(category: RequestCategory, tone: &str) -> f64 {
    let mut temperature = BASE_TEMPERATURE;
    if matches!(tone, "playful" | "witty" | "flirty") {
        temperature += 0.1;
    }
    if category == RequestCategory::Simple {
        temperature -= 0.1;
    }
    temperature.clamp(0.1, 1.2)
}

fn build_prompt(request: &SuggestionRequest, count: usize) -> String {
    format!(
        "Generate {count} {} suggestions with a {} tone for this conversation:\n{}",
        request.suggestion_type.as_str(),
        request.tone,
        request.context
    )
}

// ── Quality scoring ────────────────────────────────────────────────────

/// Blend the five quality signals for one candidate.
pub fn score_candidate(
    weights: &QualityWeights,
    text: &str,
    backend_confidence: f64,
    request: &SuggestionRequest,
) -> f64 {
    let blended = weights.confidence * backend_confidence.clamp(0.0, 1.0)
        + weights.uniqueness * uniqueness_signal(text)
        + weights.engagement * engagement_signal(text)
        + weights.length_fit * length_fit_signal(text)
        + weights.relevance * relevance_signal(text, request);
    blended.clamp(0.0, 1.0)
}

/// Distinct-word ratio: repetitive candidates score low.
fn uniqueness_signal(text: &str) -> f64 {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }
    let distinct: HashSet<String> = words.iter().map(|w| w.to_lowercase()).collect();
    distinct.len() as f64 / words.len() as f64
}

/// Questions invite replies, exclamations carry energy, flat statements
/// score lowest.
fn engagement_signal(text: &str) -> f64 {
    if text.contains('?') {
        1.0
    } else if text.contains('!') {
        0.8
    } else {
        0.4
    }
}

/// Full marks inside the 10..=280 character window; linear falloff outside.
fn length_fit_signal(text: &str) -> f64 {
    let len = text.chars().count();
    if len < 10 {
        len as f64 / 10.0
    } else if len > 280 {
        280.0 / len as f64
    } else {
        1.0
    }
}

/// Fraction of candidate words that echo the conversation context or the
/// requested tone. A neutral 0.5 when there is no context to align with.
fn relevance_signal(text: &str, request: &SuggestionRequest) -> f64 {
    let candidate_words: Vec<String> = text
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect();
    if candidate_words.is_empty() {
        return 0.0;
    }
    let mut reference: HashSet<String> = request
        .context
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect();
    reference.insert(request.tone.to_lowercase());
    if reference.is_empty() {
        return 0.5;
    }
    let shared = candidate_words
        .iter()
        .filter(|w| reference.contains(*w))
        .count();
    (shared as f64 / candidate_words.len() as f64).clamp(0.0, 1.0)
}

// ── Tests ──────────────────────────────────────────────────────────────
