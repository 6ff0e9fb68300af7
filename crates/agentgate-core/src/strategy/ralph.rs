//! Ralph loop strategy (§4.7): detects convergence by rolling similarity
//! over the last `window_size` snapshots against a threshold; stops once
//! similarity reaches the threshold and `iteration >= min_iterations`.
//!
//! The distilled spec leaves "rolling similarity" undefined. This crate
//! resolves the open question (SPEC_FULL.md §4.7) with a normalized
//! line-level Jaccard similarity between the current snapshot's diff text
//! and each of the last `window_size` prior snapshots' diff text
//! (`intersection / union` over the set of changed lines) — a cheap,
//! dependency-free convergence heuristic appropriate for diff text.

use std::collections::HashSet;

use async_trait::async_trait;

use super::{Decision, LoopStrategy, SnapshotView, StrategyContext};

#[derive(Debug, Clone, Copy)]
pub struct RalphStrategy {
    pub window_size: usize,
    pub similarity_threshold: f64,
    pub min_iterations: u32,
}

impl RalphStrategy {
    pub fn new(window_size: usize, similarity_threshold: f64, min_iterations: u32) -> Self {
        Self {
            window_size,
            similarity_threshold,
            min_iterations,
        }
    }
}

/// Jaccard similarity over the set of lines in each diff: `|A ∩ B| / |A ∪ B|`.
/// Two empty diffs are defined as perfectly similar (both made no change).
fn line_jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<&str> = a.lines().collect();
    let set_b: HashSet<&str> = b.lines().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 1.0;
    }
    intersection as f64 / union as f64
}

/// Rolling similarity: the average pairwise Jaccard similarity between
/// `current` and each of the last `window_size` entries in `history`.
fn rolling_similarity(current: &SnapshotView, history: &[SnapshotView], window_size: usize) -> Option<f64> {
    if history.is_empty() {
        return None;
    }
    let window = &history[history.len().saturating_sub(window_size)..];
    if window.is_empty() {
        return None;
    }
    let total: f64 = window
        .iter()
        .map(|snap| line_jaccard(&current.diff_text, &snap.diff_text))
        .sum();
    Some(total / window.len() as f64)
}

#[async_trait]
impl LoopStrategy for RalphStrategy {
    fn name(&self) -> &str {
        "ralph"
    }

    async fn should_continue(&self, ctx: &StrategyContext) -> Decision {
        let verification_failed = ctx
            .current_verification
            .as_ref()
            .map(|v| !v.passed)
            .unwrap_or(true);
        if !verification_failed {
            return Decision::stop("verification passed");
        }

        let Some(current) = ctx.current_snapshot.as_ref() else {
            return Decision::continue_with("no snapshot yet to measure convergence against");
        };

        let similarity = rolling_similarity(current, &ctx.state.history, self.window_size);
        match similarity {
            Some(sim) if sim >= self.similarity_threshold && ctx.state.iteration >= self.min_iterations => {
                Decision::stop(format!(
                    "converged: rolling similarity {sim:.3} >= threshold {:.3} at iteration {}",
                    self.similarity_threshold, ctx.state.iteration
                ))
            }
            _ => Decision::continue_with("not yet converged"),
        }
    }
}
