//! Candidate scoring
//!
//! Pure functions turning a health snapshot, an agent's cost and the task's
//! urgency into sub-scores in [0, 1], and combining them with a weight vector.

use crate::health::{HealthSnapshot, LoadLevel};
use crate::learning::{PredictionBasis, SuccessPrediction};
use crate::routing::task::{Complexity, TaskContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Relative importance of each scoring dimension
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub reliability: f64,
    pub performance: f64,
    pub cost: f64,
    pub load: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            reliability: 0.40,
            performance: 0.25,
            cost: 0.20,
            load: 0.15,
        }
    }
}

impl ScoringWeights {
    pub fn as_array(&self) -> [f64; 4] {
        [self.reliability, self.performance, self.cost, self.load]
    }

    pub fn from_array(values: [f64; 4]) -> Self {
        Self {
            reliability: values[0],
            performance: values[1],
            cost: values[2],
            load: values[3],
        }
    }

    pub fn sum(&self) -> f64 {
        self.as_array().iter().sum()
    }

    /// All weights finite and non-negative, with a positive sum
    pub fn validate(&self) -> Result<(), String> {
        let values = self.as_array();
        if values.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err("weights must be finite and non-negative".to_string());
        }
        if self.sum() <= 0.0 {
            return Err("weights must not sum to zero".to_string());
        }
        Ok(())
    }

    /// Scale to sum 1.0. Callers guarantee a positive sum.
    pub fn normalized(&self) -> Self {
        let sum = self.sum();
        let values = self.as_array().map(|w| w / sum);
        Self::from_array(values)
    }
}

/// Sub-scores of a single candidate, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub reliability: f64,
    pub performance: f64,
    pub cost: f64,
    pub load: f64,
}

impl SubScores {
    fn as_array(&self) -> [f64; 4] {
        [self.reliability, self.performance, self.cost, self.load]
    }
}

/// Multiplier applied to the reliability weight by task complexity
pub fn complexity_reliability_factor(complexity: Complexity) -> f64 {
    match complexity {
        Complexity::Simple => 0.8,
        Complexity::Moderate => 1.0,
        Complexity::Complex => 1.25,
        Complexity::Critical => 1.6,
    }
}

/// Load level mapped to a score, idle agents scoring highest
pub fn load_score(level: LoadLevel) -> f64 {
    match level {
        LoadLevel::Idle => 1.0,
        LoadLevel::Low => 0.8,
        LoadLevel::Moderate => 0.55,
        LoadLevel::High => 0.25,
        LoadLevel::Saturated => 0.0,
    }
}

/// Cost sub-score: 1.0 for free agents, 0.5 at the reference cost
pub fn cost_score(cost_cents: u64, reference_cents: u64) -> f64 {
    let reference = reference_cents.max(1) as f64;
    reference / (reference + cost_cents as f64)
}

/// Latency budget for a task: time left to the deadline, else a priority-scaled target
pub fn latency_budget_ms(task: &TaskContext, latency_target_ms: u64, now: DateTime<Utc>) -> f64 {
    if let Some(deadline) = task.deadline {
        let remaining = (deadline - now).num_milliseconds();
        return remaining.max(1) as f64;
    }
    let factor = 1.5 - 0.1 * f64::from(task.priority);
    (latency_target_ms as f64 * factor).max(1.0)
}

/// Performance sub-score: budget / (budget + p95); 1.0 without latency data
pub fn performance_score(snapshot: &HealthSnapshot, budget_ms: f64) -> f64 {
    if snapshot.sample_size == 0 || snapshot.p95_latency_ms <= 0.0 {
        return 1.0;
    }
    budget_ms / (budget_ms + snapshot.p95_latency_ms)
}

/// Reliability sub-score, optionally blended with a history-backed prediction
pub fn reliability_score(snapshot: &HealthSnapshot, prediction: Option<&SuccessPrediction>) -> f64 {
    let observed = (snapshot.success_rate * (1.0 - 0.5 * snapshot.failure_score)).clamp(0.0, 1.0);
    match prediction {
        Some(p) if p.basis != PredictionBasis::Prior => {
            (0.5 * observed + 0.5 * p.predicted_success_rate).clamp(0.0, 1.0)
        }
        _ => observed,
    }
}

/// Weights adjusted for the task: reliability by complexity, cost by priority
pub fn effective_weights(base: &ScoringWeights, task: &TaskContext) -> ScoringWeights {
    let priority_cost_factor = (11.0 - f64::from(task.priority)) / 10.0;
    ScoringWeights {
        reliability: base.reliability * complexity_reliability_factor(task.complexity),
        performance: base.performance,
        cost: base.cost * priority_cost_factor,
        load: base.load,
    }
}

/// Weighted mean of the sub-scores, in [0, 1]
pub fn composite_score(scores: &SubScores, weights: &ScoringWeights) -> f64 {
    let total = weights.sum();
    if total <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = scores
        .as_array()
        .iter()
        .zip(weights.as_array().iter())
        .map(|(s, w)| s * w)
        .sum();
    (weighted / total).clamp(0.0, 1.0)
}
