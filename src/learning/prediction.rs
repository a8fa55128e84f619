//! Success prediction from aggregated outcome history

use crate::outcome::ExecutionOutcome;
use crate::routing::task::Complexity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Recent results kept per aggregate for the trend check
const TREND_WINDOW: usize = 20;
const MIN_TREND_SAMPLES: usize = 4;

pub const PRIOR_SUCCESS_RATE: f64 = 0.5;
pub const LOW_SUCCESS_RATE: f64 = 0.7;
pub const HIGH_ERROR_COUNT: f64 = 1.0;
pub const LOW_QUALITY: f64 = 0.6;
pub const LOW_SATISFACTION: f64 = 2.5;
pub const DECLINE_THRESHOLD: f64 = 0.1;

/// Which aggregation level a prediction came from, narrowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionBasis {
    AgentTaskType,
    AgentComplexity,
    AgentOverall,
    Prior,
}

impl PredictionBasis {
    /// Interval width grows as the basis gets less specific
    pub fn z_score(self) -> f64 {
        match self {
            PredictionBasis::AgentTaskType => 1.96,
            PredictionBasis::AgentComplexity => 2.58,
            PredictionBasis::AgentOverall | PredictionBasis::Prior => 3.29,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    NoHistory,
    InsufficientSamples,
    LowSuccessRate,
    HighErrorCount,
    LowQuality,
    LowSatisfaction,
    DecliningTrend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessPrediction {
    pub agent_id: String,
    pub task_type: String,
    pub complexity: Complexity,
    pub predicted_success_rate: f64,
    /// (lower, upper), both within [0, 1]
    pub confidence_interval: (f64, f64),
    pub risk_factors: Vec<RiskFactor>,
    pub sample_size: usize,
    pub basis: PredictionBasis,
    /// Weight vector version current when the prediction was made
    pub model_version: u64,
    pub generated_at: DateTime<Utc>,
}

/// Running aggregate over a set of outcomes
#[derive(Debug, Clone, Default)]
pub struct OutcomeStats {
    pub samples: usize,
    pub successes: usize,
    error_total: u64,
    quality_sum: f64,
    quality_count: usize,
    satisfaction_sum: f64,
    satisfaction_count: usize,
    recent: VecDeque<bool>,
}

impl OutcomeStats {
    pub fn add(&mut self, outcome: &ExecutionOutcome) {
        self.samples += 1;
        if outcome.success {
            self.successes += 1;
        }
        self.error_total += u64::from(outcome.error_count);
        if let Some(quality) = outcome.mean_quality().filter(|q| q.is_finite()) {
            self.quality_sum += quality;
            self.quality_count += 1;
        }
        if let Some(satisfaction) = outcome.user_satisfaction.filter(|s| s.is_finite()) {
            self.satisfaction_sum += satisfaction;
            self.satisfaction_count += 1;
        }
        self.recent.push_back(outcome.success);
        while self.recent.len() > TREND_WINDOW {
            self.recent.pop_front();
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.successes as f64 / self.samples as f64
    }

    pub fn mean_errors(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.error_total as f64 / self.samples as f64
    }

    pub fn mean_quality(&self) -> Option<f64> {
        (self.quality_count > 0).then(|| self.quality_sum / self.quality_count as f64)
    }

    pub fn mean_satisfaction(&self) -> Option<f64> {
        (self.satisfaction_count > 0).then(|| self.satisfaction_sum / self.satisfaction_count as f64)
    }

    /// Success rate of the older half of recent results minus the newer half
    pub fn decline(&self) -> f64 {
        if self.recent.len() < MIN_TREND_SAMPLES {
            return 0.0;
        }
        let len = self.recent.len();
        let mid = len / 2;
        let older = self.recent.iter().take(mid).filter(|ok| **ok).count() as f64 / mid as f64;
        let newer =
            self.recent.iter().skip(mid).filter(|ok| **ok).count() as f64 / (len - mid) as f64;
        older - newer
    }

    fn risk_factors(&self) -> Vec<RiskFactor> {
        let mut risks = Vec::new();
        if self.success_rate() < LOW_SUCCESS_RATE {
            risks.push(RiskFactor::LowSuccessRate);
        }
        if self.mean_errors() >= HIGH_ERROR_COUNT {
            risks.push(RiskFactor::HighErrorCount);
        }
        if self.mean_quality().is_some_and(|q| q < LOW_QUALITY) {
            risks.push(RiskFactor::LowQuality);
        }
        if self.mean_satisfaction().is_some_and(|s| s < LOW_SATISFACTION) {
            risks.push(RiskFactor::LowSatisfaction);
        }
        if self.decline() > DECLINE_THRESHOLD {
            risks.push(RiskFactor::DecliningTrend);
        }
        risks
    }
}

/// Outcome aggregates at the three prediction levels
#[derive(Debug, Default)]
pub struct StatsIndex {
    by_task_type: HashMap<(String, String), OutcomeStats>,
    by_complexity: HashMap<(String, Complexity), OutcomeStats>,
    by_agent: HashMap<String, OutcomeStats>,
}

impl StatsIndex {
    pub fn add(&mut self, outcome: &ExecutionOutcome) {
        self.by_task_type
            .entry((outcome.agent_id.clone(), outcome.task_type.clone()))
            .or_default()
            .add(outcome);
        self.by_complexity
            .entry((outcome.agent_id.clone(), outcome.complexity))
            .or_default()
            .add(outcome);
        self.by_agent
            .entry(outcome.agent_id.clone())
            .or_default()
            .add(outcome);
    }

    pub fn agent(&self, agent_id: &str) -> Option<&OutcomeStats> {
        self.by_agent.get(agent_id)
    }

    pub fn clear(&mut self) {
        self.by_task_type.clear();
        self.by_complexity.clear();
        self.by_agent.clear();
    }

    /// Predict with the narrowest level holding at least `min_samples` outcomes
    pub fn predict(
        &self,
        agent_id: &str,
        task_type: &str,
        complexity: Complexity,
        min_samples: usize,
        model_version: u64,
        now: DateTime<Utc>,
    ) -> SuccessPrediction {
        let levels = [
            (
                PredictionBasis::AgentTaskType,
                self.by_task_type
                    .get(&(agent_id.to_string(), task_type.to_string())),
            ),
            (
                PredictionBasis::AgentComplexity,
                self.by_complexity.get(&(agent_id.to_string(), complexity)),
            ),
            (PredictionBasis::AgentOverall, self.by_agent.get(agent_id)),
        ];

        let chosen = levels
            .iter()
            .find_map(|(basis, stats)| stats.filter(|s| s.samples >= min_samples).map(|s| (*basis, s)));

        let (basis, rate, interval, risks, sample_size) = match chosen {
            Some((basis, stats)) => {
                let p = stats.success_rate();
                (
                    basis,
                    p,
                    wald_interval(p, stats.samples, basis.z_score()),
                    stats.risk_factors(),
                    stats.samples,
                )
            }
            None => {
                let seen = self.by_agent.get(agent_id).map_or(0, |s| s.samples);
                let risk = if seen == 0 {
                    RiskFactor::NoHistory
                } else {
                    RiskFactor::InsufficientSamples
                };
                (
                    PredictionBasis::Prior,
                    PRIOR_SUCCESS_RATE,
                    (0.0, 1.0),
                    vec![risk],
                    seen,
                )
            }
        };

        SuccessPrediction {
            agent_id: agent_id.to_string(),
            task_type: task_type.to_string(),
            complexity,
            predicted_success_rate: rate,
            confidence_interval: interval,
            risk_factors: risks,
            sample_size,
            basis,
            model_version,
            generated_at: now,
        }
    }
}

/// Normal approximation interval `p ± z·sqrt(p(1−p)/n)`, clamped to [0, 1]
pub fn wald_interval(p: f64, n: usize, z: f64) -> (f64, f64) {
    if n == 0 {
        return (0.0, 1.0);
    }
    let margin = z * (p * (1.0 - p) / n as f64).sqrt();
    ((p - margin).clamp(0.0, 1.0), (p + margin).clamp(0.0, 1.0))
}
