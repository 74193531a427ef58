//! Progressive delivery of candidates over subscriber channels.
//!
//! Instead of holding the response until every candidate is scored, the
//! executor pushes each accepted candidate through a [`StreamHandle`] as it
//! clears the quality bar. Events flow through a [`SubscriberTransport`];
//! the in-process [`ChannelTransport`] backs them with bounded tokio mpsc
//! channels, and a websocket or SSE edge can implement the same trait.
//!
//! Pacing is adaptive: longer texts and shakier confidence slow the cadence
//! so the reader is not buried, high-confidence short texts speed it up.
//! Sessions are lifecycle-managed: a hard per-session timeout force-cleans
//! streams whose producer stalled, and a background sweep removes sessions
//! with no activity inside the staleness window.

use crate::config::StreamingConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Delay adjustment for texts longer than 100 characters.
const LONG_TEXT_PENALTY_MS: u64 = 50;
/// Additional delay for texts longer than 200 characters.
const VERY_LONG_TEXT_PENALTY_MS: u64 = 100;
/// Speed-up for candidates with confidence above 0.9.
const HIGH_CONFIDENCE_BONUS_MS: u64 = 20;
/// Slow-down for candidates with confidence below 0.7.
const LOW_CONFIDENCE_PENALTY_MS: u64 = 30;
/// Slow-down for tones whose candidates reward a beat of reading time.
const DELIBERATE_TONE_PENALTY_MS: u64 = 25;

/// Delivery progress carried on every chunk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StreamProgress {
    /// Candidates delivered so far, this chunk included.
    pub delivered: usize,
    /// Estimated total candidates for the session.
    pub estimated: usize,
    /// `delivered / estimated` as a percentage, capped at 100.
    pub percentage: f64,
}

/// One event on a delivery stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The session opened; candidates will follow.
    Started {
        /// Request this stream belongs to.
        request_id: String,
        /// How many candidates the producer expects to deliver.
        estimated_total: usize,
    },
    /// One candidate cleared the quality bar.
    Chunk {
        /// Zero-based delivery index.
        index: usize,
        /// Candidate text.
        text: String,
        /// Candidate confidence.
        confidence: f64,
        /// Session progress after this chunk.
        progress: StreamProgress,
    },
    /// The session finished normally.
    Completed {
        /// Candidates delivered in total.
        delivered: usize,
        /// End-to-end session latency.
        total_latency_ms: u64,
    },
    /// The session ended abnormally.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

/// Where stream events go.
///
/// `publish` returns `false` when the subscriber is gone; producers treat
/// that as a closed stream and stop sending.
#[async_trait]
pub trait SubscriberTransport: Send + Sync {
    /// Deliver one event to the named channel.
    async fn publish(&self, channel: &str, event: StreamEvent) -> bool;
}

// ── In-process transport ───────────────────────────────────────────────

/// Bounded mpsc fan-out keyed by channel name.
///
/// Slow subscribers shed events rather than stall the producer: a full
/// buffer drops the event with a warning, only a closed receiver reports
/// the channel as gone.
#[derive(Clone, Default)]
pub struct ChannelTransport {
    channels: Arc<DashMap<String, mpsc::Sender<StreamEvent>>>,
}

impl ChannelTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a subscription for `channel`, replacing any previous one.
    pub fn subscribe(&self, channel: impl Into<String>, capacity: usize) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.channels.insert(channel.into(), tx);
        rx
    }

    /// Drop the subscription for `channel`.
    pub fn unsubscribe(&self, channel: &str) {
        self.channels.remove(channel);
    }
}

#[async_trait]
impl SubscriberTransport for ChannelTransport {
    async fn publish(&self, channel: &str, event: StreamEvent) -> bool {
        let sender = match self.channels.get(channel) {
            Some(entry) => entry.value().clone(),
            None => return false,
        };
        match sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(channel = channel, "subscriber buffer full, shedding event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.channels.remove(channel);
                false
            }
        }
    }
}

// ── Sessions ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Active,
    Completed,
    TimedOut,
    Failed,
}

struct StreamSession {
    channel: String,
    started_at: Instant,
    last_activity: Instant,
    delivered: usize,
    estimated_total: usize,
    status: SessionStatus,
}

/// Manages stream sessions over a transport.
///
/// Cheap to clone; all clones share the session table.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Clone)]
pub struct DeliveryChannel {
    sessions: Arc<DashMap<String, StreamSession>>,
    transport: Arc<dyn SubscriberTransport>,
    config: StreamingConfig,
}

impl DeliveryChannel {
    /// Create a delivery channel over a transport.
    pub fn new(transport: Arc<dyn SubscriberTransport>, config: StreamingConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            transport,
            config,
        }
    }

    /// Open a session for `request_id` on `channel` and emit
    /// [`StreamEvent::Started`].
    ///
    /// A watchdog task force-cleans the session if it is still active when
    /// the configured stream timeout elapses.
    pub async fn start(
        &self,
        request_id: impl Into<String>,
        channel: impl Into<String>,
        estimated_total: usize,
    ) -> StreamHandle {
        let request_id = request_id.into();
        let channel = channel.into();
        let now = Instant::now();
        self.sessions.insert(
            request_id.clone(),
            StreamSession {
                channel: channel.clone(),
                started_at: now,
                last_activity: now,
                delivered: 0,
                estimated_total,
                status: SessionStatus::Active,
            },
        );

        self.transport
            .publish(
                &channel,
                StreamEvent::Started {
                    request_id: request_id.clone(),
                    estimated_total,
                },
            )
            .await;

        let watchdog = {
            let delivery = self.clone();
            let request_id = request_id.clone();
            let timeout = Duration::from_secs(self.config.stream_timeout_secs);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                delivery.force_timeout(&request_id).await;
            })
        };

        StreamHandle {
            request_id,
            channel,
            delivery: self.clone(),
            index: AtomicUsize::new(0),
            watchdog,
        }
    }

    /// Spawn the background stale-session sweep. The returned handle can be
    /// aborted on shutdown.
    pub fn spawn_sweep_loop(&self) -> tokio::task::JoinHandle<()> {
        let delivery = self.clone();
        let interval = Duration::from_secs(self.config.sweep_interval_secs);
        let stale_after = Duration::from_secs(self.config.stale_after_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = delivery.sweep_stale(stale_after);
                if removed > 0 {
                    info!(removed = removed, "swept stale stream sessions");
                }
            }
        })
    }

    /// Remove sessions idle longer than `stale_after`. Returns how many
    /// were removed.
    pub fn sweep_stale(&self, stale_after: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.last_activity.elapsed() < stale_after);
        before - self.sessions.len()
    }

    /// Number of tracked sessions, any status.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether a session for `request_id` is currently tracked.
    pub fn has_session(&self, request_id: &str) -> bool {
        self.sessions.contains_key(request_id)
    }

    async fn force_timeout(&self, request_id: &str) {
        let channel = match self.sessions.get_mut(request_id) {
            Some(mut session) if session.status == SessionStatus::Active => {
                session.status = SessionStatus::TimedOut;
                session.channel.clone()
            }
            _ => return,
        };
        warn!(request_id = request_id, "stream session timed out, force-cleaning");
        self.transport
            .publish(
                &channel,
                StreamEvent::Error {
                    message: "stream timed out".to_string(),
                },
            )
            .await;
        self.sessions.remove(request_id);
    }

    fn record_chunk(&self, request_id: &str) -> Option<(usize, usize)> {
        let mut session = self.sessions.get_mut(request_id)?;
        if session.status != SessionStatus::Active {
            return None;
        }
        session.delivered += 1;
        session.last_activity = Instant::now();
        Some((session.delivered, session.estimated_total))
    }

    fn close_session(&self, request_id: &str, status: SessionStatus) -> Option<(String, usize, u64)> {
        let closed = {
            let mut session = self.sessions.get_mut(request_id)?;
            if session.status != SessionStatus::Active {
                return None;
            }
            session.status = status;
            (
                session.channel.clone(),
                session.delivered,
                session.started_at.elapsed().as_millis() as u64,
            )
        };
        self.sessions.remove(request_id);
        Some(closed)
    }
}

// ── Stream handle ──────────────────────────────────────────────────────

/// Producer-side handle for one stream session.
///
/// Dropping the handle without calling [`StreamHandle::complete`] or
/// [`StreamHandle::error`] leaves cleanup to the session watchdog.
pub struct StreamHandle {
    request_id: String,
    channel: String,
    delivery: DeliveryChannel,
    index: AtomicUsize,
    watchdog: tokio::task::JoinHandle<()>,
}

impl StreamHandle {
    /// The request this stream belongs to.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Deliver one candidate if it clears the quality bar.
    ///
    /// Sleeps the adaptive pacing delay before publishing. Returns `true`
    /// when the chunk was sent, `false` when it was filtered or the
    /// session/subscriber is gone.
    pub async fn send_chunk(&self, text: &str, confidence: f64, tone: &str) -> bool {
        if confidence < self.delivery.config.quality_threshold {
            debug!(
                request_id = %self.request_id,
                confidence = confidence,
                "candidate below stream quality threshold, not streamed"
            );
            return false;
        }

        let delay = adaptive_delay(&self.delivery.config, text.len(), confidence, tone);
        tokio::time::sleep(delay).await;

        let (delivered, estimated) = match self.delivery.record_chunk(&self.request_id) {
            Some(progress) => progress,
            None => return false,
        };
        let percentage = if estimated == 0 {
            100.0
        } else {
            (delivered as f64 / estimated as f64 * 100.0).min(100.0)
        };
        let index = self.index.fetch_add(1, Ordering::Relaxed);

        self.delivery
            .transport
            .publish(
                &self.channel,
                StreamEvent::Chunk {
                    index,
                    text: text.to_string(),
                    confidence,
                    progress: StreamProgress {
                        delivered,
                        estimated,
                        percentage,
                    },
                },
            )
            .await
    }

    /// Deliver a batch of `(text, confidence)` candidates in order.
    /// Returns how many were actually sent.
    pub async fn send_batch(&self, candidates: &[(String, f64)], tone: &str) -> usize {
        let mut sent = 0;
        for (text, confidence) in candidates {
            if self.send_chunk(text, *confidence, tone).await {
                sent += 1;
            }
        }
        sent
    }

    /// Close the session normally and emit [`StreamEvent::Completed`].
    pub async fn complete(self) {
        self.watchdog.abort();
        if let Some((channel, delivered, total_latency_ms)) = self
            .delivery
            .close_session(&self.request_id, SessionStatus::Completed)
        {
            self.delivery
                .transport
                .publish(
                    &channel,
                    StreamEvent::Completed {
                        delivered,
                        total_latency_ms,
                    },
                )
                .await;
        }
    }

    /// Close the session abnormally and emit [`StreamEvent::Error`].
    pub async fn error(self, message: impl Into<String>) {
        self.watchdog.abort();
        if let Some((channel, _, _)) = self
            .delivery
            .close_session(&self.request_id, SessionStatus::Failed)
        {
            self.delivery
                .transport
                .publish(
                    &channel,
                    StreamEvent::Error {
                        message: message.into(),
                    },
                )
                .await;
        }
    }
}

// ── Pacing ─────────────────────────────────────────────────────────────

/// Compute the pacing delay before a chunk is published.
///
/// Starts from the configured minimum, slows for long texts, low
/// confidence, and deliberate tones, speeds up for high confidence, and
/// clamps to the configured window.
pub fn adaptive_delay(config: &StreamingConfig, text_len: usize, confidence: f64, tone: &str) -> Duration {
    let mut delay_ms = config.min_chunk_delay_ms;

    if text_len > 100 {
        delay_ms += LONG_TEXT_PENALTY_MS;
    }
    if text_len > 200 {
        delay_ms += VERY_LONG_TEXT_PENALTY_MS;
    }

    if confidence > 0.9 {
        delay_ms = delay_ms.saturating_sub(HIGH_CONFIDENCE_BONUS_MS);
    } else if confidence < 0.7 {
        delay_ms += LOW_CONFIDENCE_PENALTY_MS;
    }

    if matches!(tone, "witty" | "intellectual" | "sophisticated") {
        delay_ms += DELIBERATE_TONE_PENALTY_MS;
    }

    Duration::from_millis(delay_ms.clamp(config.min_chunk_delay_ms, config.max_chunk_delay_ms))
}

// ── Tests ──────────────────────────────────────────────────────────────
