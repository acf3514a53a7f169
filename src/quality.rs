//! Quality gate evaluation.
//!
//! A story can run to completion and still fail its gate. The two outcomes
//! are kept apart: execution status says whether the work ran, the gate
//! verdict says whether it counts as a success for dependents.

use crate::epic::{finite_score, FailureReason, GateVerdict};

/// The result of checking one story's score against the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct GateResult {
    pub verdict: GateVerdict,
    pub score: Option<f64>,
    pub threshold: Option<f64>,
}

impl GateResult {
    pub fn passed(&self) -> bool {
        self.verdict != GateVerdict::Failed
    }

    /// The failure to record when the gate did not pass.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match (self.verdict, self.threshold) {
            (GateVerdict::Failed, Some(threshold)) => Some(FailureReason::QualityGate {
                score: self.score,
                threshold,
            }),
            _ => None,
        }
    }
}

/// Minimum-score gate applied to every story of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QualityGate {
    threshold: Option<f64>,
}

impl QualityGate {
    pub fn new(threshold: Option<f64>) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> Option<f64> {
        self.threshold
    }

    /// Scores at or above the threshold pass. When a threshold is enforced a
    /// missing or non-finite score fails. Non-finite scores are reported as
    /// missing.
    pub fn evaluate(&self, score: Option<f64>) -> GateResult {
        let score = finite_score(score);
        let verdict = match self.threshold {
            None => GateVerdict::NotEnforced,
            Some(threshold) => match score {
                Some(score) if score >= threshold => GateVerdict::Passed,
                _ => GateVerdict::Failed,
            },
        };
        GateResult {
            verdict,
            score,
            threshold: self.threshold,
        }
    }
}
