//! Load-balancing admission control.
//!
//! Tracks in-flight work per tier and globally, accepting or rejecting
//! requests against concurrency ceilings (defaults: 8 global, 3 per tier).
//! There is no internal queue: a rejected caller gets a queue-position and
//! wait estimate as a retry hint and is expected to come back.
//!
//! Admission is modelled as scoped-resource acquisition: a successful
//! [`AdmissionController::try_admit`] hands back an [`AdmissionTicket`]
//! whose `Drop` releases the slot. Every exit path of a request — success,
//! failure, timeout, task panic — releases exactly once.

use crate::config::AdmissionConfig;
use crate::tier::ExecutionTier;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One in-flight request's claim on a tier's concurrency budget.
struct ActiveRequest {
    tier: ExecutionTier,
    started_at: Instant,
}

struct AdmissionInner {
    /// Diagnostic record of admitted requests, read by the wait estimator.
    /// The authoritative occupancy lives in the atomic counters below.
    tickets: DashMap<String, ActiveRequest>,
    /// Global slots currently claimed. Claimed with a compare-exchange
    /// before a ticket is inserted, so concurrent admits cannot overshoot
    /// the ceiling.
    total_count: AtomicUsize,
    /// Per-tier slots currently claimed, indexed by tier rank.
    tier_counts: [AtomicUsize; 3],
    /// Rejections per tier since that tier last admitted; drives the
    /// queue-position hint handed to rejected callers.
    rejected_streak: [AtomicUsize; 3],
    config: AdmissionConfig,
}

/// The outcome of an admission attempt.
#[derive(Debug)]
pub enum AdmissionDecision {
    /// The request may proceed; hold the ticket for its lifetime.
    Admitted(AdmissionTicket),
    /// Ceilings are full; retry after the estimated wait.
    Rejected {
        /// Estimated position if the caller were queued (1-based).
        queue_position: usize,
        /// Suggested wait before retrying.
        estimated_wait: Duration,
    },
}

impl AdmissionDecision {
    /// Whether the request was admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }
}

/// Tracks in-flight requests against global and per-tier ceilings.
///
/// Cloning is cheap; all clones share the same ticket map.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<AdmissionInner>,
}

impl AdmissionController {
    /// Create a controller with the given ceilings.
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            inner: Arc::new(AdmissionInner {
                tickets: DashMap::new(),
                total_count: AtomicUsize::new(0),
                tier_counts: [
                    AtomicUsize::new(0),
                    AtomicUsize::new(0),
                    AtomicUsize::new(0),
                ],
                rejected_streak: [
                    AtomicUsize::new(0),
                    AtomicUsize::new(0),
                    AtomicUsize::new(0),
                ],
                config,
            }),
        }
    }

    /// Try to admit a request onto a tier.
    ///
    /// Rejects when the global in-flight count has reached the global
    /// ceiling or the tier's count has reached the per-tier ceiling;
    /// otherwise registers a ticket and returns it.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn try_admit(&self, request_id: &str, tier: ExecutionTier) -> AdmissionDecision {
        let max_total = self.inner.config.max_concurrent_total;
        let max_per_tier = self.inner.config.max_concurrent_per_tier;

        // Claim the global slot, then the tier slot. Each claim is a
        // compare-exchange against the ceiling, so concurrent callers
        // cannot all pass a stale check and overshoot; a failed tier claim
        // hands the global slot back.
        let admitted = self
            .inner
            .total_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max_total).then_some(n + 1)
            })
            .is_ok()
            && {
                let tier_claimed = self.inner.tier_counts[tier.rank()]
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < max_per_tier).then_some(n + 1)
                    })
                    .is_ok();
                if !tier_claimed {
                    self.inner.total_count.fetch_sub(1, Ordering::SeqCst);
                }
                tier_claimed
            };

        if !admitted {
            let queue_position =
                self.inner.rejected_streak[tier.rank()].fetch_add(1, Ordering::SeqCst) + 1;
            let estimated_wait = self.estimate_wait(tier);
            warn!(
                request_id = request_id,
                tier = tier.as_str(),
                in_flight_total = self.in_flight_total(),
                in_flight_tier = self.in_flight(tier),
                queue_position = queue_position,
                estimated_wait_ms = estimated_wait.as_millis() as u64,
                "admission rejected"
            );
            return AdmissionDecision::Rejected {
                queue_position,
                estimated_wait,
            };
        }

        self.inner.tickets.insert(
            request_id.to_string(),
            ActiveRequest {
                tier,
                started_at: Instant::now(),
            },
        );
        // The tier has capacity again; reset its queue-position counter.
        self.inner.rejected_streak[tier.rank()].store(0, Ordering::SeqCst);

        debug!(
            request_id = request_id,
            tier = tier.as_str(),
            in_flight_total = self.in_flight_total(),
            "admitted"
        );

        AdmissionDecision::Admitted(AdmissionTicket {
            inner: Arc::clone(&self.inner),
            request_id: request_id.to_string(),
            tier,
        })
    }

    /// Current global load ratio: in-flight / global ceiling.
    ///
    /// Read by the tier selector for the load-downgrade override.
    pub fn load(&self) -> f64 {
        self.in_flight_total() as f64 / self.inner.config.max_concurrent_total as f64
    }

    /// Number of in-flight requests on one tier.
    pub fn in_flight(&self, tier: ExecutionTier) -> usize {
        self.inner.tier_counts[tier.rank()].load(Ordering::SeqCst)
    }

    /// Total in-flight requests across all tiers.
    pub fn in_flight_total(&self) -> usize {
        self.inner.total_count.load(Ordering::SeqCst)
    }

    /// Wait hint for a rejected caller: half the mean elapsed time of the
    /// tier's active requests, floored at the configured minimum.
    fn estimate_wait(&self, tier: ExecutionTier) -> Duration {
        let now = Instant::now();
        let elapsed: Vec<u128> = self
            .inner
            .tickets
            .iter()
            .filter(|entry| entry.value().tier == tier)
            .map(|entry| now.duration_since(entry.value().started_at).as_millis())
            .collect();

        let floor = Duration::from_millis(self.inner.config.min_wait_hint_ms);
        if elapsed.is_empty() {
            return floor;
        }
        let mean_ms = elapsed.iter().sum::<u128>() / elapsed.len() as u128;
        floor.max(Duration::from_millis((mean_ms / 2) as u64))
    }
}

/// RAII guard over one admitted request's slot.
///
/// Dropping the ticket releases the slot unconditionally; it cannot be
/// released twice and cannot leak as long as the guard itself is not leaked.
pub struct AdmissionTicket {
    inner: Arc<AdmissionInner>,
    request_id: String,
    tier: ExecutionTier,
}

impl AdmissionTicket {
    /// The request this ticket belongs to.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The tier whose budget this ticket occupies.
    pub fn tier(&self) -> ExecutionTier {
        self.tier
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if let Some((_, active)) = self.inner.tickets.remove(&self.request_id) {
            self.inner.tier_counts[self.tier.rank()].fetch_sub(1, Ordering::SeqCst);
            self.inner.total_count.fetch_sub(1, Ordering::SeqCst);
            debug!(
                request_id = %self.request_id,
                tier = self.tier.as_str(),
                held_ms = active.started_at.elapsed().as_millis() as u64,
                "ticket released"
            );
        }
    }
}

impl std::fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("request_id", &self.request_id)
            .field("tier", &self.tier)
            .finish()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> AdmissionController {
        AdmissionController::new(AdmissionConfig::default())
    }

    #[test]
    fn test_admit_within_ceilings_succeeds() {
        let ctrl = controller();
        let decision = ctrl.try_admit("r1", ExecutionTier::Fast);
        assert!(decision.is_admitted());
        assert_eq!(ctrl.in_flight(ExecutionTier::Fast), 1);
    }

    #[test]
    fn test_per_tier_ceiling_rejects_fourth_request() {
        let ctrl = controller();
        let _t1 = ctrl.try_admit("r1", ExecutionTier::Fast);
        let _t2 = ctrl.try_admit("r2", ExecutionTier::Fast);
        let _t3 = ctrl.try_admit("r3", ExecutionTier::Fast);
        let decision = ctrl.try_admit("r4", ExecutionTier::Fast);
        assert!(
            !decision.is_admitted(),
            "per-tier ceiling of 3 must reject the fourth"
        );
    }

    #[test]
    fn test_other_tier_still_has_capacity() {
        let ctrl = controller();
        let _t1 = ctrl.try_admit("r1", ExecutionTier::Fast);
        let _t2 = ctrl.try_admit("r2", ExecutionTier::Fast);
        let _t3 = ctrl.try_admit("r3", ExecutionTier::Fast);
        let decision = ctrl.try_admit("r4", ExecutionTier::Balanced);
        assert!(
            decision.is_admitted(),
            "per-tier ceilings are independent below the global ceiling"
        );
    }

    #[test]
    fn test_global_ceiling_rejects_ninth_request() {
        let ctrl = controller();
        let mut tickets = Vec::new();
        // 3 + 3 + 2 = 8 across tiers
        for (i, tier) in [
            ExecutionTier::Fast,
            ExecutionTier::Fast,
            ExecutionTier::Fast,
            ExecutionTier::Balanced,
            ExecutionTier::Balanced,
            ExecutionTier::Balanced,
            ExecutionTier::Comprehensive,
            ExecutionTier::Comprehensive,
        ]
        .iter()
        .enumerate()
        {
            match ctrl.try_admit(&format!("r{i}"), *tier) {
                AdmissionDecision::Admitted(t) => tickets.push(t),
                AdmissionDecision::Rejected { .. } => {
                    std::panic::panic_any(format!("test: request r{i} should admit"))
                }
            }
        }
        assert_eq!(ctrl.in_flight_total(), 8);

        let decision = ctrl.try_admit("r9", ExecutionTier::Comprehensive);
        assert!(
            !decision.is_admitted(),
            "global ceiling of 8 must reject the ninth even with per-tier room"
        );
    }

    #[test]
    fn test_drop_releases_slot() {
        let ctrl = controller();
        {
            let _ticket = ctrl.try_admit("r1", ExecutionTier::Fast);
            assert_eq!(ctrl.in_flight_total(), 1);
        }
        assert_eq!(ctrl.in_flight_total(), 0, "drop must release the slot");
        assert!(ctrl.load().abs() < f64::EPSILON);
    }

    #[test]
    fn test_released_slot_can_be_reacquired() {
        let ctrl = controller();
        let t1 = ctrl.try_admit("r1", ExecutionTier::Fast);
        let _t2 = ctrl.try_admit("r2", ExecutionTier::Fast);
        let _t3 = ctrl.try_admit("r3", ExecutionTier::Fast);
        assert!(!ctrl.try_admit("r4", ExecutionTier::Fast).is_admitted());

        drop(t1);
        assert!(
            ctrl.try_admit("r5", ExecutionTier::Fast).is_admitted(),
            "released capacity must be reusable"
        );
    }

    #[test]
    fn test_queue_positions_increase_across_rejections() {
        let ctrl = controller();
        let _t1 = ctrl.try_admit("r1", ExecutionTier::Fast);
        let _t2 = ctrl.try_admit("r2", ExecutionTier::Fast);
        let _t3 = ctrl.try_admit("r3", ExecutionTier::Fast);

        let mut positions = Vec::new();
        for i in 4..=9 {
            if let AdmissionDecision::Rejected { queue_position, .. } =
                ctrl.try_admit(&format!("r{i}"), ExecutionTier::Fast)
            {
                positions.push(queue_position);
            }
        }
        assert_eq!(positions, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_queue_position_resets_after_successful_admit() {
        let ctrl = controller();
        let t1 = ctrl.try_admit("r1", ExecutionTier::Fast);
        let _t2 = ctrl.try_admit("r2", ExecutionTier::Fast);
        let _t3 = ctrl.try_admit("r3", ExecutionTier::Fast);

        // Two rejections build up a streak
        let _ = ctrl.try_admit("r4", ExecutionTier::Fast);
        let _ = ctrl.try_admit("r5", ExecutionTier::Fast);

        drop(t1);
        let _t6 = ctrl.try_admit("r6", ExecutionTier::Fast);

        // Tier is full again; the streak restarted
        if let AdmissionDecision::Rejected { queue_position, .. } =
            ctrl.try_admit("r7", ExecutionTier::Fast)
        {
            assert_eq!(queue_position, 1, "streak must reset after an admit");
        } else {
            std::panic::panic_any("test: r7 should be rejected");
        }
    }

    #[test]
    fn test_wait_estimate_floored_at_minimum() {
        let ctrl = controller();
        let _t1 = ctrl.try_admit("r1", ExecutionTier::Fast);
        let _t2 = ctrl.try_admit("r2", ExecutionTier::Fast);
        let _t3 = ctrl.try_admit("r3", ExecutionTier::Fast);

        // Tickets were just created, so mean elapsed ≈ 0; the floor applies.
        if let AdmissionDecision::Rejected { estimated_wait, .. } =
            ctrl.try_admit("r4", ExecutionTier::Fast)
        {
            assert_eq!(estimated_wait, Duration::from_millis(1000));
        } else {
            std::panic::panic_any("test: r4 should be rejected");
        }
    }

    #[test]
    fn test_load_ratio() {
        let ctrl = controller();
        let _t1 = ctrl.try_admit("r1", ExecutionTier::Fast);
        let _t2 = ctrl.try_admit("r2", ExecutionTier::Balanced);
        assert!((ctrl.load() - 0.25).abs() < f64::EPSILON, "2/8 = 0.25");
    }

    #[test]
    fn test_concurrent_admits_never_exceed_ceilings() {
        // Twelve threads hammer one tier and record the highest occupancy
        // any admitted thread ever observes while holding its ticket.
        let ctrl = controller();
        let max_tier_seen = Arc::new(AtomicUsize::new(0));
        let max_total_seen = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..12)
            .map(|i| {
                let ctrl = ctrl.clone();
                let max_tier_seen = Arc::clone(&max_tier_seen);
                let max_total_seen = Arc::clone(&max_total_seen);
                std::thread::spawn(move || {
                    for round in 0..200 {
                        if let AdmissionDecision::Admitted(ticket) =
                            ctrl.try_admit(&format!("t{i}-{round}"), ExecutionTier::Fast)
                        {
                            max_tier_seen
                                .fetch_max(ctrl.in_flight(ExecutionTier::Fast), Ordering::SeqCst);
                            max_total_seen.fetch_max(ctrl.in_flight_total(), Ordering::SeqCst);
                            std::thread::yield_now();
                            drop(ticket);
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread
                .join()
                .unwrap_or_else(|_| std::panic::panic_any("test: worker thread panicked"));
        }

        let tier_peak = max_tier_seen.load(Ordering::SeqCst);
        let total_peak = max_total_seen.load(Ordering::SeqCst);
        assert!(
            tier_peak <= 3,
            "per-tier ceiling must hold under contention, observed {tier_peak}"
        );
        assert!(
            total_peak <= 8,
            "global ceiling must hold under contention, observed {total_peak}"
        );
        assert_eq!(ctrl.in_flight_total(), 0, "every ticket released");
        assert_eq!(ctrl.in_flight(ExecutionTier::Fast), 0);
    }

    #[test]
    fn test_tight_config_single_slot() {
        let ctrl = AdmissionController::new(AdmissionConfig {
            max_concurrent_total: 1,
            max_concurrent_per_tier: 1,
            min_wait_hint_ms: 500,
        });
        let _t1 = ctrl.try_admit("r1", ExecutionTier::Balanced);
        assert!(!ctrl.try_admit("r2", ExecutionTier::Fast).is_admitted());
    }
}
