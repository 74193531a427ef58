//! Execution tiers and tier selection.
//!
//! Maps a [`ClassificationProfile`](crate::ClassificationProfile) plus the
//! current global load to one of three ordered tiers:
//!
//! | Signal | Tier |
//! |--------|------|
//! | `simple`, fast-path flag, or fast-mode | Fast |
//! | `complex`, complexity > 0.7, or image present | Comprehensive |
//! | everything else | Balanced |
//!
//! Back-pressure escape valve: when global load exceeds the configured
//! threshold (default 0.8) a Comprehensive decision downgrades to Balanced,
//! trading quality for latency under load. A caller-forced tier bypasses
//! the table entirely, including the load override.

use crate::classify::{ClassificationProfile, RequestCategory};
use crate::config::TierSettings;
use crate::SuggestionRequest;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One latency/quality class of execution.
///
/// Ordered: `Fast < Balanced < Comprehensive`. The fallback chain descends
/// this ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTier {
    /// Tier 1: cheap, non-reasoning backend, ~1s target.
    Fast,
    /// Tier 2: reasoning backend, ~3s target.
    Balanced,
    /// Tier 3: the heaviest backend, ~5s target.
    Comprehensive,
}

impl ExecutionTier {
    /// All tiers, lowest first.
    pub const ALL: [ExecutionTier; 3] = [Self::Fast, Self::Balanced, Self::Comprehensive];

    /// Stable lowercase name, used in metrics labels and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Comprehensive => "comprehensive",
        }
    }

    /// Zero-based position in the tier ordering.
    pub fn rank(&self) -> usize {
        match self {
            Self::Fast => 0,
            Self::Balanced => 1,
            Self::Comprehensive => 2,
        }
    }

    /// The next cheaper tier, or `None` from [`ExecutionTier::Fast`].
    pub fn next_lower(&self) -> Option<ExecutionTier> {
        match self {
            Self::Fast => None,
            Self::Balanced => Some(Self::Fast),
            Self::Comprehensive => Some(Self::Balanced),
        }
    }
}

impl std::fmt::Display for ExecutionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The selector's verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierChoice {
    /// The tier to execute on.
    pub tier: ExecutionTier,
    /// Whether the load override demoted a Comprehensive decision.
    pub downgraded: bool,
    /// Whether the caller forced the tier, bypassing the table.
    pub forced: bool,
}

/// Deterministic classification-to-tier mapping with a load override.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Clone)]
pub struct TierSelector {
    settings: TierSettings,
}

impl TierSelector {
    /// Create a selector over a tier table.
    pub fn new(settings: TierSettings) -> Self {
        Self { settings }
    }

    /// The tier table this selector consults.
    pub fn settings(&self) -> &TierSettings {
        &self.settings
    }

    /// Pick the tier for a classified request.
    ///
    /// # Arguments
    ///
    /// * `profile` — The request's classification.
    /// * `request` — The raw request (for fast-mode/forced-tier flags).
    /// * `load` — Current global load ratio from the admission controller,
    ///   `in_flight / max_concurrent_total`.
    pub fn select(
        &self,
        profile: &ClassificationProfile,
        request: &SuggestionRequest,
        load: f64,
    ) -> TierChoice {
        if let Some(tier) = request.forced_tier {
            debug!(tier = tier.as_str(), "caller forced tier");
            return TierChoice {
                tier,
                downgraded: false,
                forced: true,
            };
        }

        let table_choice = if profile.primary == RequestCategory::Simple
            || request.fast_path
            || request.fast_mode
        {
            ExecutionTier::Fast
        } else if profile.primary == RequestCategory::Complex
            || profile.complexity > self.settings.complexity_ceiling
            || request.has_image
        {
            ExecutionTier::Comprehensive
        } else {
            ExecutionTier::Balanced
        };

        if table_choice == ExecutionTier::Comprehensive
            && load > self.settings.load_downgrade_threshold
        {
            debug!(
                load = load,
                threshold = self.settings.load_downgrade_threshold,
                "load override: downgrading comprehensive to balanced"
            );
            return TierChoice {
                tier: ExecutionTier::Balanced,
                downgraded: true,
                forced: false,
            };
        }

        TierChoice {
            tier: table_choice,
            downgraded: false,
            forced: false,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
