//! # suggestion-orchestrator
//!
//! A tiered dispatch engine for conversational-suggestion generation over Tokio.
//!
//! ## Architecture
//!
//! Request flow through the engine:
//! ```text
//! SuggestionRequest → Classify → Select tier → Admit → Cache check
//!                   → Execute (streaming optional) → Score → Cache write → Respond
//!                                      ↓ on failure
//!                               Fallback chain (4 steps, terminal emergency)
//! ```

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod admission;
pub mod backend;
pub mod cache;
pub mod classify;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod executor;
pub mod fallback;
pub mod metrics;
pub mod tier;

// Re-exports for convenience
pub use admission::{AdmissionController, AdmissionDecision, AdmissionTicket};
pub use backend::{BackendClient, BackendError, GenerationOutcome, GenerationRequest};
pub use cache::{fingerprint, SuggestionCache};
pub use classify::{ClassificationProfile, Classifier, RequestCategory};
pub use config::OrchestratorConfig;
pub use delivery::{ChannelTransport, DeliveryChannel, StreamEvent, SubscriberTransport};
pub use engine::{HealthSnapshot, Orchestrator};
pub use executor::{TierExecutor, TierResult};
pub use fallback::{FallbackChain, FallbackOutcome};
pub use metrics::EngineMetrics;
pub use tier::{ExecutionTier, TierSelector};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
///   (Datadog, Grafana Loki, etc.)
/// - anything else (including unset) — human-readable pretty output
///   for local development
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), OrchestratorError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| OrchestratorError::Other(format!("tracing init failed: {e}")))
}

/// Top-level orchestrator errors.
///
/// Every error surface in the engine is mapped to a variant here.
/// All variants implement `std::error::Error` via [`thiserror`].
///
/// Backend failures carry their own taxonomy ([`BackendError`]) because the
/// fallback chain dispatches on the failure kind; by the time a request
/// surfaces an error to the caller, backend failures have already been
/// absorbed into a degraded-but-successful response.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The admission controller refused the request: concurrency ceilings
    /// are full. Carries a retry hint rather than consuming resources.
    #[error("admission rejected for tier {tier}: queue position {queue_position}, retry in ~{estimated_wait_ms}ms")]
    AdmissionRejected {
        /// The tier that was full.
        tier: ExecutionTier,
        /// Estimated position if the caller were queued (1-based).
        queue_position: usize,
        /// Suggested wait before retrying, in milliseconds.
        estimated_wait_ms: u64,
    },

    /// A backend call failed in a way the fallback chain could not absorb.
    ///
    /// The terminal emergency strategy makes this practically unreachable
    /// from [`engine::Orchestrator::handle`]; it exists for direct executor use.
    #[error("backend failure: {0}")]
    Backend(#[from] BackendError),

    /// A delivery channel closed unexpectedly, indicating subscriber shutdown.
    #[error("channel closed unexpectedly")]
    ChannelClosed,

    /// A configuration value is missing or invalid.
    ///
    /// This is returned at construction time so that misconfiguration
    /// surfaces immediately rather than at the first request.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// What kind of suggestion the caller wants generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionType {
    /// A conversation opener for a fresh match.
    Opener,
    /// A reply continuing an existing conversation.
    Reply,
    /// A rewrite/polish of a message the user drafted.
    Enhancement,
}

impl SuggestionType {
    /// Stable lowercase name, used in cache keys and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opener => "opener",
            Self::Reply => "reply",
            Self::Enhancement => "enhancement",
        }
    }
}

/// A generation request submitted by a client.
///
/// Construct with [`SuggestionRequest::new`] and refine with the `with_*`
/// builders; only the id, user, and context are mandatory.
#[derive(Debug, Clone)]
pub struct SuggestionRequest {
    /// Unique identifier for this request, used for trace correlation
    /// and admission-ticket accounting.
    pub request_id: String,
    /// The user/session the request belongs to.
    pub user_id: String,
    /// Free-text conversation context the suggestions should fit.
    pub context: String,
    /// What to generate.
    pub suggestion_type: SuggestionType,
    /// Requested tone (e.g. `"playful"`, `"witty"`, `"sincere"`).
    pub tone: String,
    /// Fast-path flag set by latency-critical clients (keyboard extensions).
    pub fast_path: bool,
    /// Whether the request carries an image/screenshot payload.
    pub has_image: bool,
    /// Whether user personalization data accompanies the request.
    pub personalized: bool,
    /// Caller asked for speed over depth without being on the fast path.
    pub fast_mode: bool,
    /// Explicit tier override; bypasses the selector's decision table.
    pub forced_tier: Option<ExecutionTier>,
    /// Subscriber to stream partial results to, if progressive delivery
    /// is wanted.
    pub stream_to: Option<String>,
}

impl SuggestionRequest {
    /// Create a request with defaults: reply type, friendly tone, no flags.
    pub fn new(
        request_id: impl Into<String>,
        user_id: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            user_id: user_id.into(),
            context: context.into(),
            suggestion_type: SuggestionType::Reply,
            tone: "friendly".to_string(),
            fast_path: false,
            has_image: false,
            personalized: false,
            fast_mode: false,
            forced_tier: None,
            stream_to: None,
        }
    }

    /// Create a request with a freshly minted UUID request id.
    ///
    /// Convenience for callers that do not carry their own correlation ids.
    pub fn generate(user_id: impl Into<String>, context: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), user_id, context)
    }

    /// Set the suggestion type.
    pub fn with_type(mut self, suggestion_type: SuggestionType) -> Self {
        self.suggestion_type = suggestion_type;
        self
    }

    /// Set the requested tone.
    pub fn with_tone(mut self, tone: impl Into<String>) -> Self {
        self.tone = tone.into();
        self
    }

    /// Mark the request as coming from a latency-critical fast path.
    pub fn with_fast_path(mut self, fast_path: bool) -> Self {
        self.fast_path = fast_path;
        self
    }

    /// Mark the request as carrying an image payload.
    pub fn with_image(mut self, has_image: bool) -> Self {
        self.has_image = has_image;
        self
    }

    /// Mark the request as carrying personalization data.
    pub fn with_personalization(mut self, personalized: bool) -> Self {
        self.personalized = personalized;
        self
    }

    /// Ask for speed over depth without the fast-path flag.
    pub fn with_fast_mode(mut self, fast_mode: bool) -> Self {
        self.fast_mode = fast_mode;
        self
    }

    /// Force a specific execution tier, bypassing the decision table.
    pub fn with_forced_tier(mut self, tier: ExecutionTier) -> Self {
        self.forced_tier = Some(tier);
        self
    }

    /// Stream partial results to the given subscriber.
    pub fn with_stream_to(mut self, subscriber_id: impl Into<String>) -> Self {
        self.stream_to = Some(subscriber_id.into());
        self
    }
}

/// One generated suggestion with the backend's confidence in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionCandidate {
    /// The suggestion text.
    pub text: String,
    /// Backend-reported confidence in `[0.0, 1.0]`.
    pub confidence: f64,
}

impl SuggestionCandidate {
    /// Create a candidate, clamping confidence into `[0.0, 1.0]`.
    pub fn new(text: impl Into<String>, confidence: f64) -> Self {
        Self {
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// The engine's answer to a [`SuggestionRequest`].
///
/// Always a success shape: backend failures are absorbed by the fallback
/// chain, surfacing here as `degraded = true` with the depth recorded.
#[derive(Debug, Clone, Serialize)]
pub struct SuggestionResponse {
    /// Request id this response answers.
    pub request_id: String,
    /// The generated (or cached, or emergency) candidates.
    pub candidates: Vec<SuggestionCandidate>,
    /// The tier that produced the result.
    pub tier: ExecutionTier,
    /// Classification category the request was assigned.
    pub category: RequestCategory,
    /// Whether the result was served from cache.
    pub from_cache: bool,
    /// Whether any fallback strategy was used.
    pub degraded: bool,
    /// Which fallback step produced the result (1-based), if any.
    pub fallback_depth: Option<usize>,
    /// Computed quality score of the result in `[0.0, 1.0]`.
    pub quality_score: f64,
    /// End-to-end handling latency in milliseconds.
    pub latency_ms: u64,
}
