//! Backend clients for candidate generation.
//!
//! Each execution tier targets a named backend through the [`BackendClient`]
//! trait; the executor looks clients up by id from the tier table. Two HTTP
//! clients are provided (Grok via the xAI API, Gemini via the Google API)
//! plus a canned [`StaticBackend`] for demos and a [`ScriptedBackend`] that
//! replays a queue of outcomes for failure-injection tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors a backend can surface to the executor and fallback chain.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached, timed out, or returned a server
    /// error. Retryable on a lower tier.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The backend responded but the payload could not be interpreted.
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
    /// The backend refused the request for quota or rate-limit reasons.
    #[error("backend quota exceeded: {0}")]
    QuotaExceeded(String),
}

impl BackendError {
    /// Stable lowercase kind, used in logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::InvalidResponse(_) => "invalid_response",
            Self::QuotaExceeded(_) => "quota_exceeded",
        }
    }
}

/// What the executor asks a backend for.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    /// Fully assembled prompt text.
    pub prompt: String,
    /// Token budget for the completion.
    pub max_tokens: u32,
    /// Sampling temperature, already clamped by the executor.
    pub temperature: f64,
    /// How many candidates to request.
    pub candidate_count: usize,
}

/// What a backend returns.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    /// Candidate texts, best first as ordered by the backend.
    pub candidates: Vec<String>,
    /// Wall-clock generation latency.
    pub latency_ms: u64,
    /// The backend's own confidence in the batch, if it reports one.
    /// Defaults to 0.7 when the API gives no signal.
    pub backend_confidence: f64,
}

/// A client for one generation backend.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Stable identifier matched against the tier table's backend names.
    fn id(&self) -> &str;

    /// Generate candidates for a prompt.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] describing why generation failed.
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutcome, BackendError>;
}

// ── Grok (xAI) ─────────────────────────────────────────────────────────

const XAI_API_URL: &str = "https://api.x.ai/v1/chat/completions";

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f64,
    n: usize,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Client for xAI's chat completions API.
///
/// One instance serves one model id; the engine registers an instance per
/// distinct model named in the tier table.
pub struct GrokBackend {
    id: String,
    model: String,
    api_key: String,
    api_url: String,
    client: reqwest::Client,
}

impl GrokBackend {
    /// Build a client for `model`, reading the key from `XAI_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::OrchestratorError::ConfigError`] when the key is
    /// unset or empty.
    pub fn from_env(model: impl Into<String>) -> Result<Self, crate::OrchestratorError> {
        let api_key = std::env::var("XAI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                crate::OrchestratorError::ConfigError("XAI_API_KEY is not set".into())
            })?;
        let model = model.into();
        Ok(Self {
            id: model.clone(),
            model,
            api_key,
            api_url: XAI_API_URL.to_string(),
            client: reqwest::Client::new(),
        })
    }

    /// Override the API endpoint (test servers, proxies).
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    /// Override the client id the tier table matches against.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

#[async_trait]
impl BackendClient for GrokBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutcome, BackendError> {
        let started = Instant::now();
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            n: request.candidate_count,
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(format!("{}: {e}", self.model)))?;

        let status = response.status();
        if status.as_u16() == 429 {
            warn!(backend = %self.id, "rate limited");
            return Err(BackendError::QuotaExceeded(self.model.clone()));
        }
        if !status.is_success() {
            return Err(BackendError::Unavailable(format!(
                "{}: HTTP {status}",
                self.model
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("{}: {e}", self.model)))?;

        let candidates: Vec<String> = parsed
            .choices
            .into_iter()
            .map(|c| c.message.content.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if candidates.is_empty() {
            return Err(BackendError::InvalidResponse(format!(
                "{}: no candidates in response",
                self.model
            )));
        }

        debug!(backend = %self.id, count = candidates.len(), "generated candidates");
        Ok(GenerationOutcome {
            candidates,
            latency_ms: started.elapsed().as_millis() as u64,
            backend_confidence: 0.7,
        })
    }
}

// ── Gemini ─────────────────────────────────────────────────────────────

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    temperature: f64,
    #[serde(rename = "candidateCount")]
    candidate_count: usize,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiResponseContent,
}

#[derive(Deserialize)]
struct GeminiResponseContent {
    parts: Vec<GeminiResponsePart>,
}

#[derive(Deserialize)]
struct GeminiResponsePart {
    text: String,
}

/// Client for Google's Gemini generateContent API.
pub struct GeminiBackend {
    id: String,
    model: String,
    api_key: String,
    api_url: String,
    client: reqwest::Client,
}

impl GeminiBackend {
    /// Build a client for `model`, reading the key from `GEMINI_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::OrchestratorError::ConfigError`] when the key is
    /// unset or empty.
    pub fn from_env(model: impl Into<String>) -> Result<Self, crate::OrchestratorError> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                crate::OrchestratorError::ConfigError("GEMINI_API_KEY is not set".into())
            })?;
        let model = model.into();
        Ok(Self {
            id: model.clone(),
            model,
            api_key,
            api_url: GEMINI_API_URL.to_string(),
            client: reqwest::Client::new(),
        })
    }

    /// Override the API endpoint.
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    /// Override the client id the tier table matches against.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

#[async_trait]
impl BackendClient for GeminiBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutcome, BackendError> {
        let started = Instant::now();
        let url = format!(
            "{}/{}:generateContent?key={}",
            self.api_url, self.model, self.api_key
        );
        let body = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart {
                    text: &request.prompt,
                }],
            }],
            generation_config: GeminiGenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
                candidate_count: request.candidate_count,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(format!("{}: {e}", self.model)))?;

        let status = response.status();
        if status.as_u16() == 429 {
            warn!(backend = %self.id, "rate limited");
            return Err(BackendError::QuotaExceeded(self.model.clone()));
        }
        if !status.is_success() {
            return Err(BackendError::Unavailable(format!(
                "{}: HTTP {status}",
                self.model
            )));
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("{}: {e}", self.model)))?;

        let candidates: Vec<String> = parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content.parts.into_iter().next())
            .map(|p| p.text.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if candidates.is_empty() {
            return Err(BackendError::InvalidResponse(format!(
                "{}: no candidates in response",
                self.model
            )));
        }

        Ok(GenerationOutcome {
            candidates,
            latency_ms: started.elapsed().as_millis() as u64,
            backend_confidence: 0.7,
        })
    }
}

// ── Static ─────────────────────────────────────────────────────────────

/// A backend that returns canned candidates after a fixed delay.
///
/// Useful for demos and local runs without API keys.
pub struct StaticBackend {
    id: String,
    candidates: Vec<String>,
    delay: Duration,
    confidence: f64,
}

impl StaticBackend {
    /// Create a canned backend with the given id and candidate texts.
    pub fn new(id: impl Into<String>, candidates: Vec<String>) -> Self {
        Self {
            id: id.into(),
            candidates,
            delay: Duration::from_millis(50),
            confidence: 0.85,
        }
    }

    /// Set the artificial generation delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the reported backend confidence.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

#[async_trait]
impl BackendClient for StaticBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutcome, BackendError> {
        tokio::time::sleep(self.delay).await;
        let mut candidates = self.candidates.clone();
        candidates.truncate(request.candidate_count.max(1));
        if candidates.is_empty() {
            return Err(BackendError::InvalidResponse(format!(
                "{}: no canned candidates configured",
                self.id
            )));
        }
        Ok(GenerationOutcome {
            candidates,
            latency_ms: self.delay.as_millis() as u64,
            backend_confidence: self.confidence,
        })
    }
}

// ── Scripted ───────────────────────────────────────────────────────────

type ScriptedResult = Result<Vec<String>, BackendError>;

/// A backend that replays a queue of scripted outcomes, then falls back to
/// a default. Built for failure-injection tests.
pub struct ScriptedBackend {
    id: String,
    script: Mutex<VecDeque<ScriptedResult>>,
    default: Option<Vec<String>>,
    delay: Duration,
}

impl ScriptedBackend {
    /// Create a scripted backend whose queue starts empty and whose
    /// default outcome is `candidates`.
    pub fn new(id: impl Into<String>, candidates: Vec<String>) -> Self {
        Self {
            id: id.into(),
            script: Mutex::new(VecDeque::new()),
            default: Some(candidates),
            delay: Duration::ZERO,
        }
    }

    /// Create a scripted backend that always fails with `Unavailable`
    /// once its queue is exhausted.
    pub fn always_failing(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: Mutex::new(VecDeque::new()),
            default: None,
            delay: Duration::ZERO,
        }
    }

    /// Queue one outcome to be replayed before the default kicks in.
    pub fn push(&self, outcome: ScriptedResult) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    /// Set an artificial per-call delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl BackendClient for ScriptedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<GenerationOutcome, BackendError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let candidates = match scripted {
            Some(Ok(candidates)) => candidates,
            Some(Err(e)) => return Err(e),
            None => match &self.default {
                Some(candidates) => candidates.clone(),
                None => {
                    return Err(BackendError::Unavailable(format!(
                        "{}: scripted outage",
                        self.id
                    )))
                }
            },
        };
        Ok(GenerationOutcome {
            candidates,
            latency_ms: self.delay.as_millis() as u64,
            backend_confidence: 0.8,
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
