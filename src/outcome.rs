//! Execution outcomes and the outcome recorder
//!
//! Outcomes are the single source of truth for learning. The recorder applies
//! each outcome once: breaker, health window, learning queue, then the store.
//! A store failure never loses an outcome; it is buffered and flushed later.

use crate::circuit_breaker::CircuitBreaker;
use crate::config::RecorderConfig;
use crate::error::{RouterResult, RoutingError};
use crate::health::{HealthMonitor, LoadLevel};
use crate::observability::MetricsCollector;
use crate::outcome_span;
use crate::routing::task::Complexity;
use crate::storage::RoutingStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn, Instrument};

const FLUSH_BACKOFF_BASE_MS: u64 = 50;

/// Result of one dispatch as reported by the executing side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Caller supplied idempotence key
    pub correlation_id: String,
    pub agent_id: String,
    pub task_type: String,
    pub complexity: Complexity,
    pub success: bool,
    pub completion_time_ms: u64,
    /// Named quality measures, each in [0, 1]
    #[serde(default)]
    pub quality_metrics: Option<BTreeMap<String, f64>>,
    /// 0 to 5
    #[serde(default)]
    pub user_satisfaction: Option<f64>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub cost_cents: u64,
    /// Load level of the agent when the request was sent
    #[serde(default)]
    pub load_level_at_dispatch: Option<LoadLevel>,
    pub recorded_at: DateTime<Utc>,
}

impl ExecutionOutcome {
    pub fn new<C, A, T>(
        correlation_id: C,
        agent_id: A,
        task_type: T,
        success: bool,
        recorded_at: DateTime<Utc>,
    ) -> Self
    where
        C: Into<String>,
        A: Into<String>,
        T: Into<String>,
    {
        Self {
            correlation_id: correlation_id.into(),
            agent_id: agent_id.into(),
            task_type: task_type.into(),
            complexity: Complexity::Moderate,
            success,
            completion_time_ms: 0,
            quality_metrics: None,
            user_satisfaction: None,
            error_count: if success { 0 } else { 1 },
            cost_cents: 0,
            load_level_at_dispatch: None,
            recorded_at,
        }
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_completion_time(mut self, completion_time_ms: u64) -> Self {
        self.completion_time_ms = completion_time_ms;
        self
    }

    pub fn with_error_count(mut self, error_count: u32) -> Self {
        self.error_count = error_count;
        self
    }

    pub fn with_cost(mut self, cost_cents: u64) -> Self {
        self.cost_cents = cost_cents;
        self
    }

    pub fn with_quality<S: Into<String>>(mut self, name: S, value: f64) -> Self {
        self.quality_metrics
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value);
        self
    }

    pub fn with_satisfaction(mut self, satisfaction: f64) -> Self {
        self.user_satisfaction = Some(satisfaction);
        self
    }

    pub fn with_load_level(mut self, level: LoadLevel) -> Self {
        self.load_level_at_dispatch = Some(level);
        self
    }

    /// Mean of the quality metrics, if any were reported
    pub fn mean_quality(&self) -> Option<f64> {
        let metrics = self.quality_metrics.as_ref()?;
        if metrics.is_empty() {
            return None;
        }
        Some(metrics.values().sum::<f64>() / metrics.len() as f64)
    }

    pub fn validate(&self) -> RouterResult<()> {
        if self.correlation_id.trim().is_empty() {
            return Err(RoutingError::invalid_input("correlation_id must not be empty"));
        }
        if self.agent_id.trim().is_empty() {
            return Err(RoutingError::invalid_input("agent_id must not be empty"));
        }
        if let Some(satisfaction) = self.user_satisfaction {
            if !(0.0..=5.0).contains(&satisfaction) {
                return Err(RoutingError::invalid_input(format!(
                    "user_satisfaction must be between 0 and 5, got {satisfaction}"
                )));
            }
        }
        if let Some(metrics) = &self.quality_metrics {
            if let Some((name, value)) = metrics.iter().find(|(_, v)| !(0.0..=1.0).contains(*v)) {
                return Err(RoutingError::invalid_input(format!(
                    "quality metric '{name}' must be between 0 and 1, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Acknowledgement returned by [`OutcomeRecorder::record`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordAck {
    pub correlation_id: String,
    /// The correlation id was seen before; nothing was applied
    pub duplicate: bool,
    /// The outcome reached the store during this call
    pub persisted: bool,
}

/// Bounded set of remembered correlation ids, oldest evicted first
#[derive(Debug)]
struct DedupeSet {
    capacity: usize,
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupeSet {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns false if the id was already present
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }
}

/// Applies outcomes exactly once and persists them
#[derive(Debug)]
pub struct OutcomeRecorder {
    config: RecorderConfig,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthMonitor>,
    store: Arc<dyn RoutingStore>,
    learning_queue: UnboundedSender<ExecutionOutcome>,
    metrics: Arc<MetricsCollector>,
    seen: Mutex<DedupeSet>,
    pending: Mutex<VecDeque<ExecutionOutcome>>,
}

impl OutcomeRecorder {
    pub fn new(
        config: RecorderConfig,
        breaker: Arc<CircuitBreaker>,
        health: Arc<HealthMonitor>,
        store: Arc<dyn RoutingStore>,
        learning_queue: UnboundedSender<ExecutionOutcome>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let seen = Mutex::new(DedupeSet::new(config.dedupe_capacity));
        Self {
            config,
            breaker,
            health,
            store,
            learning_queue,
            metrics,
            seen,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Remember correlation ids already in the log so a restart keeps idempotence
    pub fn seed_seen<'a, I: IntoIterator<Item = &'a str>>(&self, correlation_ids: I) {
        let mut seen = self.seen.lock();
        for id in correlation_ids {
            seen.insert(id);
        }
    }

    pub async fn record(&self, outcome: ExecutionOutcome) -> RouterResult<RecordAck> {
        let span = outcome_span!(
            correlation_id = %outcome.correlation_id,
            agent_id = %outcome.agent_id,
            success = outcome.success
        );
        self.record_inner(outcome).instrument(span).await
    }

    async fn record_inner(&self, outcome: ExecutionOutcome) -> RouterResult<RecordAck> {
        outcome.validate()?;

        if !self.seen.lock().insert(&outcome.correlation_id) {
            self.metrics.outcome_duplicate();
            debug!("Duplicate outcome ignored");
            return Ok(RecordAck {
                correlation_id: outcome.correlation_id,
                duplicate: true,
                persisted: false,
            });
        }

        let transition = if outcome.success {
            self.breaker.record_success(&outcome.agent_id, &outcome.correlation_id)
        } else {
            self.breaker.record_failure(&outcome.agent_id, &outcome.correlation_id)
        };
        self.health.observe(&outcome);
        if self.learning_queue.send(outcome.clone()).is_err() {
            debug!("Learning queue closed, outcome not queued for learning");
        }
        self.metrics.outcome_recorded();

        let persisted = match self.store.append_outcome(&outcome).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to persist outcome, buffering for retry");
                self.metrics.persistence_failure();
                self.buffer(outcome.clone());
                false
            }
        };

        if transition.is_some() {
            let state = self.breaker.state(&outcome.agent_id);
            if let Err(e) = self.store.save_breaker_state(&state).await {
                warn!(error = %e, "Failed to persist circuit breaker state");
            }
        }

        Ok(RecordAck {
            correlation_id: outcome.correlation_id,
            duplicate: false,
            persisted,
        })
    }

    fn buffer(&self, outcome: ExecutionOutcome) {
        let mut pending = self.pending.lock();
        pending.push_back(outcome);
        while pending.len() > self.config.pending_capacity {
            if let Some(dropped) = pending.pop_front() {
                warn!(
                    correlation_id = %dropped.correlation_id,
                    "Pending outcome buffer full, dropping oldest outcome"
                );
            }
        }
        self.metrics.set_pending_outcomes(pending.len());
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Retry buffered outcomes in order. Stops at the first outcome that still
    /// fails after `flush_retries` attempts and keeps it and the rest buffered.
    pub async fn flush_pending(&self) -> usize {
        let mut flushed = 0;

        loop {
            let Some(outcome) = self.pending.lock().pop_front() else {
                break;
            };

            let mut stored = false;
            for attempt in 0..=self.config.flush_retries {
                if attempt > 0 {
                    let delay = FLUSH_BACKOFF_BASE_MS.saturating_mul(1 << (attempt - 1).min(10));
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                match self.store.append_outcome(&outcome).await {
                    Ok(()) => {
                        stored = true;
                        break;
                    }
                    Err(e) => debug!(attempt, error = %e, "Flush attempt failed"),
                }
            }

            if !stored {
                warn!(
                    correlation_id = %outcome.correlation_id,
                    "Store still unavailable, keeping outcomes buffered"
                );
                let mut pending = self.pending.lock();
                pending.push_front(outcome);
                self.metrics.set_pending_outcomes(pending.len());
                break;
            }
            flushed += 1;
        }

        if flushed > 0 {
            debug!(flushed, "Flushed buffered outcomes");
        }
        self.metrics.set_pending_outcomes(self.pending_count());
        flushed
    }
}
