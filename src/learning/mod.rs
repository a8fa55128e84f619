//! Learning engine
//!
//! Consumes execution outcomes from the recorder's queue, keeps per-agent
//! aggregates for success prediction and a bounded history for weight
//! recomputation, and publishes new weight vectors without blocking selection.

pub mod prediction;
pub mod weights;

pub use prediction::{PredictionBasis, RiskFactor, SuccessPrediction};
pub use weights::{WeightStore, WeightVector};

use crate::clock::Clock;
use crate::config::LearningConfig;
use crate::learning_span;
use crate::observability::MetricsCollector;
use crate::outcome::ExecutionOutcome;
use crate::routing::scoring::{cost_score, load_score, ScoringWeights};
use crate::routing::task::Complexity;
use parking_lot::{Mutex, RwLock};
use prediction::StatsIndex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};
use weights::{adjust_weights, FeatureSample};

/// Reference points for turning raw outcome values into features
#[derive(Debug, Clone, Copy)]
pub struct FeatureScale {
    pub latency_target_ms: u64,
    pub cost_reference_cents: u64,
}

#[derive(Debug)]
pub struct LearningEngine {
    config: LearningConfig,
    baseline: ScoringWeights,
    scale: FeatureScale,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    weights: WeightStore,
    stats: RwLock<StatsIndex>,
    history: Mutex<VecDeque<ExecutionOutcome>>,
    queue_tx: UnboundedSender<ExecutionOutcome>,
    queue_rx: Mutex<UnboundedReceiver<ExecutionOutcome>>,
}

impl LearningEngine {
    pub fn new(
        config: LearningConfig,
        baseline: ScoringWeights,
        scale: FeatureScale,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let weights = WeightStore::new(baseline, clock.now());
        Self {
            config,
            baseline,
            scale,
            clock,
            metrics,
            weights,
            stats: RwLock::new(StatsIndex::default()),
            history: Mutex::new(VecDeque::new()),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
        }
    }

    /// Sending half of the outcome queue, handed to the recorder
    pub fn sender(&self) -> UnboundedSender<ExecutionOutcome> {
        self.queue_tx.clone()
    }

    /// Ingest everything currently queued. Returns the number of outcomes taken.
    pub fn drain_queue(&self) -> usize {
        let mut rx = self.queue_rx.lock();
        let mut drained = 0;
        loop {
            match rx.try_recv() {
                Ok(outcome) => {
                    self.ingest(&outcome);
                    drained += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        drained
    }

    pub fn ingest(&self, outcome: &ExecutionOutcome) {
        self.stats.write().add(outcome);
        let mut history = self.history.lock();
        history.push_back(outcome.clone());
        while history.len() > self.config.history_size {
            history.pop_front();
        }
    }

    pub fn current_weights(&self) -> Arc<WeightVector> {
        self.weights.current()
    }

    /// Read-only over the aggregates. Queued outcomes count once a drain has
    /// ingested them.
    pub fn predict_success(
        &self,
        agent_id: &str,
        task_type: &str,
        complexity: Complexity,
    ) -> SuccessPrediction {
        self.stats.read().predict(
            agent_id,
            task_type,
            complexity,
            self.config.min_samples,
            self.weights.current().version,
            self.clock.now(),
        )
    }

    fn features(&self, outcome: &ExecutionOutcome, stats: &StatsIndex) -> FeatureSample {
        let reliability = stats.agent(&outcome.agent_id).map(|s| s.success_rate());
        let target = self.scale.latency_target_ms.max(1) as f64;
        let performance = target / (target + outcome.completion_time_ms as f64);
        let cost = cost_score(outcome.cost_cents, self.scale.cost_reference_cents);
        let load = outcome.load_level_at_dispatch.map(load_score);
        FeatureSample {
            success: outcome.success,
            features: [reliability, Some(performance), Some(cost), load],
        }
    }

    fn samples(&self) -> Vec<FeatureSample> {
        let stats = self.stats.read();
        self.history
            .lock()
            .iter()
            .map(|o| self.features(o, &stats))
            .collect()
    }

    /// One learning step from the current weights over the recent history.
    /// Below `min_samples` of history the current vector is returned unchanged.
    pub fn recompute_weights(&self) -> Arc<WeightVector> {
        let _span = learning_span!(kind = "recompute").entered();
        self.drain_queue();

        let samples = self.samples();
        if samples.len() < self.config.min_samples {
            debug!(
                history = samples.len(),
                min_samples = self.config.min_samples,
                "Not enough history to recompute weights"
            );
            return self.weights.current();
        }

        let current = self.weights.current();
        let next = adjust_weights(&current.weights, &samples, &self.config);
        self.publish(next, samples.len())
    }

    fn publish(&self, weights: ScoringWeights, history: usize) -> Arc<WeightVector> {
        let published = self.weights.publish(weights, self.clock.now());
        self.metrics.weights_recomputed(published.version);
        info!(
            version = published.version,
            history,
            reliability = published.weights.reliability,
            performance = published.weights.performance,
            cost = published.weights.cost,
            load = published.weights.load,
            "Published scoring weights"
        );
        published
    }

    /// Rebuild aggregates and history from an outcome log, then take one
    /// learning step from the baseline weights
    pub fn replay(&self, outcomes: &[ExecutionOutcome]) -> Arc<WeightVector> {
        let _span = learning_span!(kind = "replay", outcomes = outcomes.len()).entered();
        self.drain_queue();
        self.stats.write().clear();
        self.history.lock().clear();

        let mut ordered: Vec<&ExecutionOutcome> = outcomes.iter().collect();
        ordered.sort_by_key(|o| o.recorded_at);
        for outcome in ordered {
            self.ingest(outcome);
        }

        let samples = self.samples();
        let next = if samples.len() < self.config.min_samples {
            self.baseline.normalized()
        } else {
            adjust_weights(&self.baseline.normalized(), &samples, &self.config)
        };
        self.publish(next, samples.len())
    }
}
