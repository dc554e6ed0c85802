use crate::store::Gallery;
use crate::types::{Embedding, ScoreError};
use serde::Serialize;

/// Default cosine similarity a probe must exceed to be accepted.
pub const DEFAULT_THRESHOLD: f32 = 0.60;

/// Why a probe was not matched. Both are expected outcomes, not faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchReason {
    EmptyDatabase,
    BelowThreshold,
}

impl NoMatchReason {
    pub fn code(&self) -> &'static str {
        match self {
            NoMatchReason::EmptyDatabase => "empty_database",
            NoMatchReason::BelowThreshold => "below_threshold",
        }
    }
}

/// Result of matching a probe embedding against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Match {
        identity: String,
        score: f32,
    },
    NoMatch {
        reason: NoMatchReason,
        /// Best similarity seen, absent when the store was empty.
        best_score: Option<f32>,
    },
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Match { .. })
    }

    pub fn identity(&self) -> Option<&str> {
        match self {
            MatchResult::Match { identity, .. } => Some(identity),
            MatchResult::NoMatch { .. } => None,
        }
    }
}

/// Nearest-neighbour matcher with a strict acceptance threshold.
///
/// Linear scan over every stored embedding; per-install galleries are small.
#[derive(Debug, Clone, Copy)]
pub struct MatchEngine {
    threshold: f32,
}

impl Default for MatchEngine {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl MatchEngine {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Find the best identity for `probe`.
    ///
    /// Ties keep the first identity seen in gallery order. A score equal to
    /// the threshold is rejected.
    pub fn match_probe(&self, probe: &Embedding, gallery: &Gallery) -> Result<MatchResult, ScoreError> {
        if gallery.is_empty() {
            return Ok(MatchResult::NoMatch {
                reason: NoMatchReason::EmptyDatabase,
                best_score: None,
            });
        }

        let mut best: Option<(&str, f32)> = None;
        for (identity, embeddings) in gallery.iter() {
            for stored in embeddings {
                let sim = probe.similarity(stored)?;
                if best.map_or(true, |(_, s)| sim > s) {
                    best = Some((identity, sim));
                }
            }
        }

        tracing::debug!(
            best_identity = best.map(|(name, _)| name),
            best_score = best.map(|(_, s)| s),
            threshold = self.threshold,
            "probe scored"
        );

        Ok(match best {
            Some((identity, score)) if score > self.threshold => MatchResult::Match {
                identity: identity.to_string(),
                score,
            },
            Some((_, score)) => MatchResult::NoMatch {
                reason: NoMatchReason::BelowThreshold,
                best_score: Some(score),
            },
            None => MatchResult::NoMatch {
                reason: NoMatchReason::EmptyDatabase,
                best_score: None,
            },
        })
    }
}
