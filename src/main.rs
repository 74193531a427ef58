//! Demo binary for suggestion-orchestrator
//!
//! Assembles the engine with canned backends and runs a handful of
//! representative requests, including one streamed progressively.
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json` — structured JSON output (production)
//! - `RUST_LOG=info` — log level filter (default: info)

use std::sync::Arc;
use std::time::Duration;
use suggestion_orchestrator::{
    init_tracing, BackendClient, ChannelTransport, ExecutionTier, Orchestrator,
    OrchestratorConfig, StreamEvent, SuggestionRequest, SuggestionType,
};
use suggestion_orchestrator::backend::StaticBackend;
use tracing::{info, warn};

fn demo_backend(id: &str, delay_ms: u64, candidates: &[&str]) -> Arc<dyn BackendClient> {
    Arc::new(
        StaticBackend::new(id, candidates.iter().map(|c| c.to_string()).collect())
            .with_delay(Duration::from_millis(delay_ms)),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = init_tracing();

    info!("Starting suggestion-orchestrator demo");

    let config = OrchestratorConfig::default();

    // Canned stand-ins registered under the default tier table's backend ids.
    let backends = vec![
        demo_backend(
            "grok-4-fast-non-reasoning",
            40,
            &["Hey! How's your day going?", "What's up? Anything fun happening?"],
        ),
        demo_backend(
            "grok-3-mini",
            20,
            &["Hey there!", "Hi! How's it going?"],
        ),
        demo_backend(
            "grok-4-fast-reasoning",
            120,
            &[
                "Any big weekend plans, or keeping it low-key?",
                "So what does a perfect weekend look like for you?",
                "Weekend's coming up! What are you into?",
            ],
        ),
        demo_backend(
            "grok-4",
            300,
            &[
                "That photo says a lot! Where was it taken?",
                "I have so many questions about this picture, starting with: when?",
                "Okay, this deserves a proper story. What's the context?",
            ],
        ),
    ];

    let transport = ChannelTransport::new();
    let engine = Orchestrator::new(config, backends, Arc::new(transport.clone()))?;

    // Consume stream events for the progressive request.
    let mut stream_rx = transport.subscribe("subscriber-demo", 32);
    let consumer = tokio::spawn(async move {
        while let Some(event) = stream_rx.recv().await {
            match event {
                StreamEvent::Started { request_id, estimated_total } => {
                    info!(request_id = %request_id, estimated = estimated_total, "stream started");
                }
                StreamEvent::Chunk { index, text, progress, .. } => {
                    info!(index = index, pct = progress.percentage, text = %text, "stream chunk");
                }
                StreamEvent::Completed { delivered, total_latency_ms } => {
                    info!(delivered = delivered, latency_ms = total_latency_ms, "stream completed");
                    break;
                }
                StreamEvent::Error { message } => {
                    warn!(message = %message, "stream error");
                    break;
                }
            }
        }
    });

    let demo_requests = vec![
        SuggestionRequest::new("demo-000", "user-1", "hey what's up")
            .with_type(SuggestionType::Opener)
            .with_fast_path(true),
        SuggestionRequest::new("demo-001", "user-2", "any plans this weekend?")
            .with_tone("playful"),
        SuggestionRequest::new("demo-002", "user-3", "what do you make of this?")
            .with_image(true)
            .with_tone("witty"),
        SuggestionRequest::new("demo-003", "user-2", "any plans this weekend?")
            .with_tone("playful"),
        SuggestionRequest::new("demo-004", "user-4", "so what kind of music are you into?")
            .with_stream_to("subscriber-demo"),
    ];

    for request in demo_requests {
        let request_id = request.request_id.clone();
        match engine.handle(request).await {
            Ok(response) => {
                info!(
                    request_id = %request_id,
                    tier = %response.tier,
                    category = %response.category,
                    from_cache = response.from_cache,
                    degraded = response.degraded,
                    quality = response.quality_score,
                    latency_ms = response.latency_ms,
                    "response"
                );
                for candidate in &response.candidates {
                    info!(confidence = candidate.confidence, text = %candidate.text, "  candidate");
                }
            }
            Err(e) => warn!(request_id = %request_id, error = %e, "request refused"),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let _ = tokio::time::timeout(Duration::from_secs(2), consumer).await;

    let health = engine.health();
    info!(
        load = health.load,
        cache_entries = health.cache_entries,
        active_streams = health.active_streams,
        "engine health"
    );
    for tier in &health.tiers {
        info!(
            tier = %tier.tier,
            in_flight = tier.in_flight,
            ema_latency_ms = tier.stats.ema_latency_ms,
            successes = tier.stats.success_count,
            "tier stats"
        );
    }

    // Exercise the forced-tier override once for the demo log.
    let forced = engine
        .handle(
            SuggestionRequest::generate("user-5", "hey")
                .with_forced_tier(ExecutionTier::Comprehensive),
        )
        .await?;
    info!(tier = %forced.tier, "forced-tier response");

    println!("{}", engine.metrics_text());

    info!("Demo complete - shutting down");
    Ok(())
}
