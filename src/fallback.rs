//! Graceful degradation when a tier execution fails.
//!
//! The chain walks four steps of decreasing ambition and never comes back
//! empty-handed:
//!
//! 1. Retry one tier lower than the original.
//! 2. Retry on the fast tier, if it has not been tried yet.
//! 3. Legacy minimal path: a bare prompt against the fast tier's fallback
//!    backend.
//! 4. Emergency candidates: hand-authored texts per suggestion type.
//!
//! Step 4 is terminal and infallible, so callers always get candidates;
//! the response is marked degraded and carries the depth that resolved it.

use crate::backend::BackendError;
use crate::classify::ClassificationProfile;
use crate::executor::{TierExecutor, TierResult};
use crate::tier::ExecutionTier;
use crate::{SuggestionCandidate, SuggestionRequest, SuggestionType};
use tracing::{info, warn};

/// Confidence assigned to emergency candidates. Low enough that they are
/// never cached and never streamed.
const EMERGENCY_CONFIDENCE: f64 = 0.5;

/// How a degraded request was resolved.
#[derive(Debug)]
pub struct FallbackOutcome {
    /// The result that resolved the chain.
    pub result: TierResult,
    /// Chain step that produced it (1 through 4).
    pub depth: usize,
    /// Always `true`; any fallback resolution is a degraded response.
    pub degraded: bool,
}

/// The degradation chain.
///
/// Stateless; holds no backends of its own and drives the executor.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackChain;

impl FallbackChain {
    /// Create the chain.
    pub fn new() -> Self {
        Self
    }

    /// Resolve a failed execution on `original_tier`.
    ///
    /// Walks the steps in order and returns at the first success; step 4
    /// cannot fail, so this function always produces an outcome.
    pub async fn run(
        &self,
        executor: &TierExecutor,
        original_tier: ExecutionTier,
        profile: &ClassificationProfile,
        request: &SuggestionRequest,
    ) -> FallbackOutcome {
        let mut tried_fast = original_tier == ExecutionTier::Fast;

        // Step 1: one tier lower.
        if let Some(lower) = original_tier.next_lower() {
            match executor.execute(lower, profile, request, None).await {
                Ok(result) => return resolved(request, 1, result),
                Err(e) => log_step_failure(request, 1, lower.as_str(), &e),
            }
            tried_fast = tried_fast || lower == ExecutionTier::Fast;
        }

        // Step 2: the fast tier, unless already attempted.
        if !tried_fast {
            match executor
                .execute(ExecutionTier::Fast, profile, request, None)
                .await
            {
                Ok(result) => return resolved(request, 2, result),
                Err(e) => log_step_failure(request, 2, ExecutionTier::Fast.as_str(), &e),
            }
        }

        // Step 3: legacy minimal path on the fast tier's fallback backend.
        let legacy_backend = executor.settings().fast.fallback_backend.clone();
        match executor.execute_minimal(&legacy_backend, request).await {
            Ok(result) => return resolved(request, 3, result),
            Err(e) => log_step_failure(request, 3, &legacy_backend, &e),
        }

        // Step 4: emergency candidates. Terminal.
        warn!(
            request_id = %request.request_id,
            "all generation paths exhausted, serving emergency candidates"
        );
        resolved(request, 4, emergency_result(request.suggestion_type))
    }
}

fn resolved(request: &SuggestionRequest, depth: usize, result: TierResult) -> FallbackOutcome {
    info!(
        request_id = %request.request_id,
        depth = depth,
        tier = result.tier.as_str(),
        backend = %result.backend_id,
        "fallback chain resolved"
    );
    FallbackOutcome {
        result,
        depth,
        degraded: true,
    }
}

fn log_step_failure(request: &SuggestionRequest, depth: usize, target: &str, error: &BackendError) {
    warn!(
        request_id = %request.request_id,
        depth = depth,
        target = target,
        kind = error.kind(),
        "fallback step failed"
    );
}

/// Hand-authored candidates per suggestion type, served when every
/// generation path is down.
fn emergency_candidates(suggestion_type: SuggestionType) -> Vec<&'static str> {
    match suggestion_type {
        SuggestionType::Opener => vec![
            "Hey! How's your week going?",
            "Hi there! What's been keeping you busy lately?",
            "Hey :) what's something good that happened today?",
        ],
        SuggestionType::Reply => vec![
            "That's really interesting, tell me more!",
            "Haha, I love that. What happened next?",
            "I was just thinking about that too!",
        ],
        SuggestionType::Enhancement => vec![
            "Sounds great to me!",
            "That works, looking forward to it!",
            "Love it!",
        ],
    }
}

fn emergency_result(suggestion_type: SuggestionType) -> TierResult {
    let candidates = emergency_candidates(suggestion_type)
        .into_iter()
        .map(|text| SuggestionCandidate::new(text, EMERGENCY_CONFIDENCE))
        .collect();
    TierResult {
        candidates,
        tier: ExecutionTier::Fast,
        backend_id: "emergency".to_string(),
        latency_ms: 0,
        quality_score: EMERGENCY_CONFIDENCE,
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
