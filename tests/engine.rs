//! # End-to-End Engine Behavior
//!
//! Integration tests driving the assembled orchestrator: a concurrency
//! burst against the admission ceilings, progressive delivery over a
//! subscriber channel, and full-outage degradation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use suggestion_orchestrator::backend::{ScriptedBackend, StaticBackend};
use suggestion_orchestrator::{
    BackendClient, ChannelTransport, ExecutionTier, Orchestrator, OrchestratorConfig,
    OrchestratorError, StreamEvent, SuggestionRequest,
};

/// Config whose three tiers all point at one backend id, with snappy
/// streaming delays so tests stay fast.
fn single_backend_config(backend_id: &str) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    for descriptor in [
        &mut config.tiers.fast,
        &mut config.tiers.balanced,
        &mut config.tiers.comprehensive,
    ] {
        descriptor.primary_backend = backend_id.to_string();
        descriptor.fallback_backend = backend_id.to_string();
    }
    config.streaming.min_chunk_delay_ms = 1;
    config.streaming.max_chunk_delay_ms = 5;
    config
}

fn engine(
    config: OrchestratorConfig,
    backends: Vec<Arc<dyn BackendClient>>,
    transport: ChannelTransport,
) -> Arc<Orchestrator> {
    Arc::new(
        Orchestrator::new(config, backends, Arc::new(transport))
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: engine: {e}"))),
    )
}

// ── Admission burst ────────────────────────────────────────────────────

/// Nine simultaneous fast-tier requests against a per-tier ceiling of 3:
/// exactly three run, six are refused with distinct queue positions, and
/// every slot is released afterwards.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_burst_of_9_same_tier_admits_3_rejects_6() {
    let backend: Arc<dyn BackendClient> = Arc::new(
        StaticBackend::new("canned", vec!["Hey! How's it going?".into()])
            .with_delay(Duration::from_millis(300)),
    );
    let config = single_backend_config("canned");
    let engine = engine(config, vec![backend], ChannelTransport::new());

    let mut tasks = Vec::new();
    for i in 0..9 {
        let engine = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move {
            engine
                .handle(
                    SuggestionRequest::new(
                        format!("burst-{i}"),
                        format!("user-{i}"),
                        format!("hey hey number {i}"),
                    )
                    .with_fast_path(true),
                )
                .await
        }));
    }

    let mut served = 0;
    let mut positions = Vec::new();
    for task in tasks {
        let outcome = task
            .await
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: join: {e}")));
        match outcome {
            Ok(response) => {
                assert_eq!(response.tier, ExecutionTier::Fast);
                served += 1;
            }
            Err(OrchestratorError::AdmissionRejected {
                tier,
                queue_position,
                estimated_wait_ms,
            }) => {
                assert_eq!(tier, ExecutionTier::Fast);
                assert!(estimated_wait_ms >= 1000, "wait hint honors the 1s floor");
                positions.push(queue_position);
            }
            Err(other) => std::panic::panic_any(format!("test: unexpected error: {other}")),
        }
    }

    assert_eq!(served, 3, "per-tier ceiling admits exactly three");
    assert_eq!(positions.len(), 6);
    let distinct: HashSet<usize> = positions.iter().copied().collect();
    assert_eq!(distinct.len(), 6, "queue positions are distinct: {positions:?}");

    assert_eq!(engine.admission().in_flight_total(), 0, "all tickets released");
    assert!(engine.admission().load().abs() < f64::EPSILON);
}

/// After a burst drains, the tier admits again immediately.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slots_are_reusable_after_burst_drains() {
    let backend: Arc<dyn BackendClient> = Arc::new(
        StaticBackend::new("canned", vec!["Hey!".into()]).with_delay(Duration::from_millis(50)),
    );
    let engine = engine(
        single_backend_config("canned"),
        vec![backend],
        ChannelTransport::new(),
    );

    for round in 0..3 {
        let mut tasks = Vec::new();
        for i in 0..3 {
            let engine = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move {
                engine
                    .handle(
                        SuggestionRequest::new(
                            format!("round{round}-{i}"),
                            "user-1",
                            format!("yo round {round} msg {i}"),
                        )
                        .with_fast_path(true),
                    )
                    .await
            }));
        }
        for task in tasks {
            let outcome = task
                .await
                .unwrap_or_else(|e| std::panic::panic_any(format!("test: join: {e}")));
            assert!(outcome.is_ok(), "a drained tier admits a full new batch");
        }
    }
}

// ── Progressive delivery ───────────────────────────────────────────────

/// A streamed request emits Started, then chunks with monotonic indices
/// and growing progress, then Completed.
#[tokio::test]
async fn test_streamed_request_emits_ordered_event_sequence() {
    let backend: Arc<dyn BackendClient> = Arc::new(
        StaticBackend::new(
            "canned",
            vec![
                "Any big weekend plans?".into(),
                "What are your plans looking like?".into(),
                "Got anything fun lined up for the weekend?".into(),
            ],
        )
        .with_delay(Duration::ZERO)
        .with_confidence(0.9),
    );
    let transport = ChannelTransport::new();
    let mut rx = transport.subscribe("sub-1", 32);
    let engine = engine(
        single_backend_config("canned"),
        vec![backend],
        transport,
    );

    let response = engine
        .handle(
            SuggestionRequest::new("stream-1", "user-1", "any plans this weekend?")
                .with_stream_to("sub-1"),
        )
        .await
        .unwrap_or_else(|e| std::panic::panic_any(format!("test: handle: {e}")));
    assert_eq!(response.candidates.len(), 3);

    let mut saw_started = false;
    let mut chunk_indices = Vec::new();
    let mut last_percentage = 0.0;
    loop {
        match rx.recv().await {
            Some(StreamEvent::Started { request_id, .. }) => {
                assert_eq!(request_id, "stream-1");
                saw_started = true;
            }
            Some(StreamEvent::Chunk { index, progress, .. }) => {
                assert!(saw_started, "chunks only after Started");
                chunk_indices.push(index);
                assert!(progress.percentage >= last_percentage, "progress never regresses");
                last_percentage = progress.percentage;
            }
            Some(StreamEvent::Completed { delivered, .. }) => {
                assert_eq!(delivered, chunk_indices.len());
                break;
            }
            other => std::panic::panic_any(format!("test: unexpected event: {other:?}")),
        }
    }
    assert!(!chunk_indices.is_empty(), "confident candidates are streamed");
    for (expected, actual) in chunk_indices.iter().enumerate() {
        assert_eq!(*actual, expected, "indices are contiguous from zero");
    }
}

/// A cache hit still gives the subscriber a complete, terminated stream:
/// Started, the cached candidates, Completed.
#[tokio::test]
async fn test_cache_hit_streams_cached_candidates() {
    let backend: Arc<dyn BackendClient> = Arc::new(
        StaticBackend::new(
            "canned",
            vec![
                "Any big weekend plans?".into(),
                "What are your plans looking like?".into(),
            ],
        )
        .with_delay(Duration::ZERO)
        .with_confidence(0.9),
    );
    let transport = ChannelTransport::new();
    let mut rx = transport.subscribe("sub-1", 32);
    let engine = engine(
        single_backend_config("canned"),
        vec![backend],
        transport,
    );

    // Prime the cache without streaming.
    let first = engine
        .handle(SuggestionRequest::new("warm-1", "user-1", "any plans this weekend?"))
        .await
        .unwrap_or_else(|e| std::panic::panic_any(format!("test: handle: {e}")));
    assert!(!first.from_cache);

    let replay = engine
        .handle(
            SuggestionRequest::new("warm-2", "user-2", "any plans this weekend?")
                .with_stream_to("sub-1"),
        )
        .await
        .unwrap_or_else(|e| std::panic::panic_any(format!("test: handle: {e}")));
    assert!(replay.from_cache);

    match rx.recv().await {
        Some(StreamEvent::Started { request_id, .. }) => assert_eq!(request_id, "warm-2"),
        other => std::panic::panic_any(format!("test: expected Started, got {other:?}")),
    }
    let mut chunks = 0;
    loop {
        match rx.recv().await {
            Some(StreamEvent::Chunk { .. }) => chunks += 1,
            Some(StreamEvent::Completed { delivered, .. }) => {
                assert_eq!(delivered, chunks);
                break;
            }
            other => std::panic::panic_any(format!("test: unexpected event: {other:?}")),
        }
    }
    assert!(chunks >= 1, "cached candidates above the threshold are replayed");
}

/// A dropped subscriber must not fail the request itself.
#[tokio::test]
async fn test_closed_subscriber_does_not_fail_the_request() {
    let backend: Arc<dyn BackendClient> = Arc::new(
        StaticBackend::new("canned", vec!["Hey! What's new?".into()]).with_delay(Duration::ZERO),
    );
    let transport = ChannelTransport::new();
    let rx = transport.subscribe("sub-1", 4);
    drop(rx);
    let engine = engine(
        single_backend_config("canned"),
        vec![backend],
        transport,
    );

    let response = engine
        .handle(
            SuggestionRequest::new("stream-1", "user-1", "any plans this weekend?")
                .with_stream_to("sub-1"),
        )
        .await
        .unwrap_or_else(|e| std::panic::panic_any(format!("test: handle: {e}")));
    assert!(!response.candidates.is_empty());
}

// ── Degradation ────────────────────────────────────────────────────────

/// With the balanced primary down and the rest of the chain alive, the
/// engine serves a degraded response at depth 1 and keeps its slots clean.
#[tokio::test]
async fn test_partial_outage_degrades_one_step() {
    let backend = Arc::new(ScriptedBackend::new("canned", vec!["A quick one!".into()]));
    backend.push(Err(
        suggestion_orchestrator::BackendError::Unavailable("blip".into()),
    ));
    let engine = engine(
        single_backend_config("canned"),
        vec![backend],
        ChannelTransport::new(),
    );

    let response = engine
        .handle(SuggestionRequest::new("r1", "u1", "any plans this weekend?"))
        .await
        .unwrap_or_else(|e| std::panic::panic_any(format!("test: handle: {e}")));
    assert!(response.degraded);
    assert_eq!(response.fallback_depth, Some(1));
    assert_eq!(engine.admission().in_flight_total(), 0);
}

/// A total outage still answers every request, at terminal depth 4, and
/// the health snapshot stays coherent.
#[tokio::test]
async fn test_total_outage_always_answers() {
    let backend: Arc<dyn BackendClient> = Arc::new(ScriptedBackend::always_failing("dead"));
    let engine = engine(
        single_backend_config("dead"),
        vec![backend],
        ChannelTransport::new(),
    );

    for i in 0..5 {
        let response = engine
            .handle(SuggestionRequest::new(
                format!("r{i}"),
                "u1",
                format!("message number {i} about the weekend"),
            ))
            .await
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: handle: {e}")));
        assert!(response.degraded);
        assert_eq!(response.fallback_depth, Some(4));
        assert!(!response.candidates.is_empty());
    }

    let health = engine.health();
    assert_eq!(health.in_flight_total, 0);
    assert_eq!(
        health.cache_entries, 0,
        "emergency results never pass the write threshold"
    );
}

/// The fallback counter in the metrics exposition reflects the depth that
/// resolved each degraded request.
#[tokio::test]
async fn test_metrics_record_fallback_depth() {
    let backend: Arc<dyn BackendClient> = Arc::new(ScriptedBackend::always_failing("dead"));
    let engine = engine(
        single_backend_config("dead"),
        vec![backend],
        ChannelTransport::new(),
    );
    let _ = engine
        .handle(SuggestionRequest::new("r1", "u1", "hello there"))
        .await;
    let text = engine.metrics_text();
    assert!(
        text.contains("suggestion_fallback_total") && text.contains(r#"depth="4""#),
        "exposition must carry the fallback depth: {text}"
    );
}

// ── Cache behavior through the engine ──────────────────────────────────

/// Identical semantic requests replay from cache; changing the tone does not.
#[tokio::test]
async fn test_cache_replays_by_semantic_fingerprint() {
    let backend: Arc<dyn BackendClient> = Arc::new(
        StaticBackend::new(
            "canned",
            vec!["Any big weekend plans?".into(), "What are your plans?".into()],
        )
        .with_delay(Duration::ZERO),
    );
    let engine = engine(
        single_backend_config("canned"),
        vec![backend],
        ChannelTransport::new(),
    );

    let first = engine
        .handle(SuggestionRequest::new("r1", "u1", "any plans this weekend?"))
        .await
        .unwrap_or_else(|e| std::panic::panic_any(format!("test: handle: {e}")));
    assert!(!first.from_cache);

    let replay = engine
        .handle(SuggestionRequest::new("r2", "u9", "any plans this weekend?"))
        .await
        .unwrap_or_else(|e| std::panic::panic_any(format!("test: handle: {e}")));
    assert!(replay.from_cache, "same context/type/tone/tier replays");

    let other_tone = engine
        .handle(
            SuggestionRequest::new("r3", "u1", "any plans this weekend?").with_tone("witty"),
        )
        .await
        .unwrap_or_else(|e| std::panic::panic_any(format!("test: handle: {e}")));
    assert!(!other_tone.from_cache, "tone participates in the fingerprint");
}
