//! Request classification.
//!
//! Analyses a suggestion request and produces a [`ClassificationProfile`]
//! that every downstream decision consumes. Each category accumulates a
//! score from three sources:
//!
//! 1. **Anchored patterns** — text openings characteristic of the category,
//!    weighted 0.3 each.
//! 2. **Keyword substrings** — weighted 0.2 each.
//! 3. **Context complexity** — a sub-score from text length, sentence count,
//!    and history references, folded into the `complex` category.
//!
//! Special modifiers: a fast-path flag boosts `simple` (+0.5), an image
//! payload boosts `complex` (+0.4), personalization data boosts `standard`
//! (+0.2).
//!
//! Primary category is the argmax; confidence is `max / (max + 0.1)`. The
//! classifier never fails: when all scores are zero it degrades to
//! `standard` with zero confidence.

use crate::SuggestionRequest;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Weight of one anchored pattern match.
const PATTERN_WEIGHT: f64 = 0.3;
/// Weight of one keyword substring match.
const KEYWORD_WEIGHT: f64 = 0.2;
/// Confidence smoothing term: confidence = max / (max + EPSILON).
const CONFIDENCE_EPSILON: f64 = 0.1;
/// Tokens budgeted for the fixed prompt scaffolding around the context.
const BASE_PROMPT_TOKENS: u32 = 300;
/// Tokens budgeted for an attached image.
const IMAGE_TOKENS: u32 = 1000;

/// The category a request is assigned before routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestCategory {
    /// Quick reactions, greetings, short exchanges.
    Simple,
    /// Ordinary conversation needing some thought.
    Standard,
    /// Long, history-laden, or image-bearing requests.
    Complex,
}

impl RequestCategory {
    /// Stable lowercase name, used in cache keys and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Standard => "standard",
            Self::Complex => "complex",
        }
    }
}

impl std::fmt::Display for RequestCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable per-request classification, computed once and never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationProfile {
    /// The winning category.
    pub primary: RequestCategory,
    /// The runner-up category, if it scored above zero.
    pub secondary: Option<RequestCategory>,
    /// Raw accumulated score per category.
    pub scores: HashMap<RequestCategory, f64>,
    /// `max / (max + 0.1)` — how decisively the winner won.
    pub confidence: f64,
    /// Context-complexity sub-score in `[0.0, 1.0]`.
    pub complexity: f64,
    /// Which signals fired (`fast_path`, `has_image`, `long_context`, …).
    pub characteristics: BTreeSet<String>,
    /// Rough token estimate for the generation call.
    pub estimated_tokens: u32,
}

/// The request classifier.
///
/// Stateless and cheap to construct. All analysis runs in O(n) over the
/// context length with no heap allocations beyond the input scan.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Clone, Default)]
pub struct Classifier;

impl Classifier {
    /// Create a new classifier.
    pub fn new() -> Self {
        Self
    }

    /// Classify a request.
    ///
    /// Always produces a profile; an all-zero score degrades to
    /// [`RequestCategory::Standard`] with zero confidence.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn classify(&self, request: &SuggestionRequest) -> ClassificationProfile {
        let text = request.context.as_str();
        let lower = text.to_lowercase();

        let mut scores: HashMap<RequestCategory, f64> = HashMap::new();
        let mut characteristics = BTreeSet::new();

        for category in [
            RequestCategory::Simple,
            RequestCategory::Standard,
            RequestCategory::Complex,
        ] {
            let patterns = Self::pattern_hits(category, &lower);
            let keywords = Self::keyword_hits(category, &lower);
            scores.insert(
                category,
                patterns as f64 * PATTERN_WEIGHT + keywords as f64 * KEYWORD_WEIGHT,
            );
        }

        let complexity = Self::context_complexity(text, &lower, &mut characteristics);
        if let Some(score) = scores.get_mut(&RequestCategory::Complex) {
            *score += complexity;
        }

        // Request-shape modifiers
        if request.fast_path {
            characteristics.insert("fast_path".to_string());
            if let Some(score) = scores.get_mut(&RequestCategory::Simple) {
                *score += 0.5;
            }
        }
        if request.has_image {
            characteristics.insert("has_image".to_string());
            if let Some(score) = scores.get_mut(&RequestCategory::Complex) {
                *score += 0.4;
            }
        }
        if request.personalized {
            characteristics.insert("personalized".to_string());
            if let Some(score) = scores.get_mut(&RequestCategory::Standard) {
                *score += 0.2;
            }
        }

        let mut ranked: Vec<(RequestCategory, f64)> =
            scores.iter().map(|(c, s)| (*c, *s)).collect();
        // Category order breaks score ties (simple before standard before
        // complex), so tied inputs classify the same way on every call
        // instead of following map iteration order.
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        let (primary, confidence, secondary) = match ranked.first() {
            Some(&(winner, max)) if max > 0.0 => {
                let secondary = ranked
                    .get(1)
                    .filter(|(_, score)| *score > 0.0)
                    .map(|(category, _)| *category);
                (winner, max / (max + CONFIDENCE_EPSILON), secondary)
            }
            _ => {
                debug!("all category scores zero, degrading to standard");
                (RequestCategory::Standard, 0.0, None)
            }
        };

        let estimated_tokens = Self::estimate_tokens(text, request.has_image);

        ClassificationProfile {
            primary,
            secondary,
            scores,
            confidence,
            complexity,
            characteristics,
            estimated_tokens,
        }
    }

    // ── Individual signals ─────────────────────────────────────────────

    /// Count anchored opening patterns for a category.
    fn pattern_hits(category: RequestCategory, lower: &str) -> usize {
        let trimmed = lower.trim_start();
        let prefixes: &[&str] = match category {
            RequestCategory::Simple => &[
                "hi",
                "hey",
                "hello",
                "yo ",
                "sup",
                "what's up",
                "whats up",
                "good morning",
                "good night",
            ],
            RequestCategory::Standard => &[
                "tell me",
                "what do you think",
                "how was",
                "do you",
                "have you",
                "so what",
            ],
            RequestCategory::Complex => &[
                "i've been thinking",
                "ive been thinking",
                "let me explain",
                "to be honest",
                "i need to talk",
            ],
        };
        prefixes.iter().filter(|p| trimmed.starts_with(*p)).count()
    }

    /// Count keyword substrings for a category.
    fn keyword_hits(category: RequestCategory, lower: &str) -> usize {
        let keywords: &[&str] = match category {
            RequestCategory::Simple => &["haha", "lol", "nice", "cool", "thanks", "omg"],
            RequestCategory::Standard => &[
                "weekend", "plans", "movie", "music", "travel", "food", "work", "hobby", "hobbies",
            ],
            RequestCategory::Complex => &[
                "relationship",
                "feelings",
                "serious",
                "future",
                "meaningful",
                "philosophy",
            ],
        };
        keywords.iter().filter(|k| lower.contains(*k)).count()
    }

    /// Context-complexity sub-score in `[0.0, 1.0]`.
    ///
    /// Length: >1000 chars +0.3, >500 +0.2. Sentences: >10 +0.2.
    /// History references (+0.25) and sophisticated vocabulary (+0.1 each,
    /// capped at +0.3) round it out.
    fn context_complexity(text: &str, lower: &str, characteristics: &mut BTreeSet<String>) -> f64 {
        let mut score = 0.0_f64;

        let len = text.chars().count();
        if len > 1000 {
            score += 0.3;
            characteristics.insert("long_context".to_string());
        } else if len > 500 {
            score += 0.2;
            characteristics.insert("long_context".to_string());
        }

        let sentences = text
            .split(['.', '!', '?'])
            .filter(|s| !s.trim().is_empty())
            .count();
        if sentences > 10 {
            score += 0.2;
            characteristics.insert("many_sentences".to_string());
        }

        let history_markers = [
            "previous",
            "last time",
            "earlier",
            "we talked",
            "you said",
            "remember when",
        ];
        if history_markers.iter().any(|m| lower.contains(m)) {
            score += 0.25;
            characteristics.insert("references_history".to_string());
        }

        let sophisticated = [
            "nevertheless",
            "furthermore",
            "consequently",
            "albeit",
            "profound",
            "nuanced",
        ];
        let hits = sophisticated.iter().filter(|w| lower.contains(*w)).count();
        if hits > 0 {
            score += (hits as f64 * 0.1).min(0.3);
            characteristics.insert("sophisticated_vocabulary".to_string());
        }

        score.clamp(0.0, 1.0)
    }

    /// Estimate the token budget the generation call will need.
    ///
    /// Roughly 4 characters per token, plus a fixed scaffolding budget and
    /// an image allowance.
    fn estimate_tokens(text: &str, has_image: bool) -> u32 {
        let context_tokens = (text.chars().count() as u32).div_ceil(4);
        let image_tokens = if has_image { IMAGE_TOKENS } else { 0 };
        context_tokens + image_tokens + BASE_PROMPT_TOKENS
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
