//! Critique rubric and score arithmetic.
//!
//! The rubric is data, not code: dimension names and the per-dimension scale
//! are configurable, while the invariants (total = sum of dimensions, accept
//! = total >= threshold, non-accepting results always carry at least one
//! difference statement) are enforced by the constructors here. A
//! [`CritiqueResult`] can only be built through [`Rubric::score`] or
//! [`Rubric::synthetic_failure`], so no caller can produce a record that
//! violates them.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Scoring rubric applied to every critique in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rubric {
    /// Dimension names in scoring order.
    pub dimensions: Vec<String>,
    /// Maximum score per dimension (inclusive); every dimension uses the
    /// same discrete scale.
    pub scale_max: u32,
}

impl Default for Rubric {
    fn default() -> Self {
        Self {
            dimensions: [
                "shape",
                "proportions",
                "materials",
                "composition",
                "prompt_fidelity",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            scale_max: 2,
        }
    }
}

impl Rubric {
    pub fn max_total(&self) -> u32 {
        self.dimensions.len() as u32 * self.scale_max
    }

    /// Minimum total at which a critique accepts: 80% of the maximum,
    /// rounded up (8/10 for the default rubric).
    pub fn pass_threshold(&self) -> u32 {
        (self.max_total() * 4).div_ceil(5)
    }

    /// Build a critique from per-dimension scores, clamping each to the
    /// scale and deriving `total` and `accept`.
    ///
    /// `differences` may be empty only for an accepting result; otherwise a
    /// fallback statement is substituted so the refinement loop always has
    /// something to act on.
    pub fn score(
        &self,
        scores: Vec<u32>,
        differences: Vec<String>,
        summary: String,
    ) -> Result<CritiqueResult> {
        if scores.len() != self.dimensions.len() {
            bail!(
                "expected {} dimension scores, got {}",
                self.dimensions.len(),
                scores.len()
            );
        }

        let scores: Vec<DimensionScore> = self
            .dimensions
            .iter()
            .zip(scores)
            .map(|(name, score)| DimensionScore {
                name: name.clone(),
                score: score.min(self.scale_max),
            })
            .collect();
        let total: u32 = scores.iter().map(|d| d.score).sum();
        let accept = total >= self.pass_threshold();

        let mut differences: Vec<String> = differences
            .into_iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();
        if !accept && differences.is_empty() {
            differences.push(format!(
                "scored {total}/{} but no specific differences were reported; \
                 re-examine the render against the target",
                self.max_total()
            ));
        }

        Ok(CritiqueResult {
            scores,
            total,
            accept,
            differences,
            summary,
        })
    }

    /// Zero-score critique recorded for an iteration that never produced
    /// evidence to judge (execution, render, or critique failure).
    pub fn synthetic_failure(&self, reason: &str) -> CritiqueResult {
        CritiqueResult {
            scores: self
                .dimensions
                .iter()
                .map(|name| DimensionScore {
                    name: name.clone(),
                    score: 0,
                })
                .collect(),
            total: 0,
            accept: false,
            differences: vec![reason.to_string()],
            summary: "iteration failed before critique".to_string(),
        }
    }
}

/// Score for a single rubric dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionScore {
    pub name: String,
    pub score: u32,
}

/// Sealed critique record for one iteration.
///
/// Immutable once produced; `total` always equals the sum of dimension
/// scores and `accept` is always derived from the rubric threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CritiqueResult {
    pub scores: Vec<DimensionScore>,
    pub total: u32,
    pub accept: bool,
    /// Remaining differences between the render and the target. Never empty
    /// when `accept` is false.
    pub differences: Vec<String>,
    pub summary: String,
}

impl CritiqueResult {
    /// Feedback block threaded into the next generation attempt.
    pub fn feedback(&self) -> String {
        let mut lines = vec![self.summary.clone()];
        for diff in &self.differences {
            lines.push(format!("- {diff}"));
        }
        lines.join("\n")
    }
}
