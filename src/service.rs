//! Routing service facade
//!
//! Builds every component from one [`RouterConfig`], seeds state from the
//! store, and exposes the operations callers use. Constructed once and shared
//! by `Arc`.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerState};
use crate::clock::Clock;
use crate::config::{validate_agent_id, RouterConfig};
use crate::error::{RouterResult, RoutingError};
use crate::health::{percentile, HealthMonitor, HealthSnapshot};
use crate::learning::{FeatureScale, LearningEngine, SuccessPrediction, WeightVector};
use crate::observability::{MetricsCollector, MetricsSnapshot};
use crate::orchestrator::{Dispatcher, RoutingOrchestrator};
use crate::outcome::{ExecutionOutcome, OutcomeRecorder, RecordAck};
use crate::registry::{Agent, AgentRegistry};
use crate::routing::selection::SelectionEngine;
use crate::routing::task::{Complexity, RoutingResult, TaskContext};
use crate::storage::RoutingStore;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Aggregates of one slice of the outcome log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakdownStats {
    pub total: usize,
    pub successes: usize,
    pub success_rate: f64,
    pub mean_completion_ms: f64,
    pub total_cost_cents: u64,
}

impl BreakdownStats {
    fn from_outcomes<'a, I: IntoIterator<Item = &'a ExecutionOutcome>>(outcomes: I) -> Self {
        let mut stats = Self::default();
        let mut completion_total = 0u64;
        for outcome in outcomes {
            stats.total += 1;
            if outcome.success {
                stats.successes += 1;
            }
            completion_total = completion_total.saturating_add(outcome.completion_time_ms);
            stats.total_cost_cents = stats.total_cost_cents.saturating_add(outcome.cost_cents);
        }
        if stats.total > 0 {
            stats.success_rate = stats.successes as f64 / stats.total as f64;
            stats.mean_completion_ms = completion_total as f64 / stats.total as f64;
        }
        stats
    }
}

/// Routing performance over a time window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_outcomes: usize,
    pub successes: usize,
    pub failures: usize,
    pub success_rate: f64,
    pub mean_completion_ms: f64,
    pub p95_completion_ms: f64,
    pub total_cost_cents: u64,
    pub mean_user_satisfaction: Option<f64>,
    pub by_agent: BTreeMap<String, BreakdownStats>,
    pub by_task_type: BTreeMap<String, BreakdownStats>,
    pub weights: WeightVector,
    pub open_circuits: Vec<String>,
}

impl AnalyticsReport {
    /// Summarize outcomes that fall inside the window
    pub fn build(
        outcomes: &[ExecutionOutcome],
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        weights: WeightVector,
        open_circuits: Vec<String>,
    ) -> Self {
        let in_window: Vec<&ExecutionOutcome> = outcomes
            .iter()
            .filter(|o| o.recorded_at >= window_start && o.recorded_at <= window_end)
            .collect();
        let overall = BreakdownStats::from_outcomes(in_window.iter().copied());

        let mut latencies: Vec<u64> = in_window.iter().map(|o| o.completion_time_ms).collect();
        latencies.sort_unstable();

        let satisfaction: Vec<f64> = in_window.iter().filter_map(|o| o.user_satisfaction).collect();
        let mean_user_satisfaction = if satisfaction.is_empty() {
            None
        } else {
            Some(satisfaction.iter().sum::<f64>() / satisfaction.len() as f64)
        };

        let mut agents: BTreeMap<&str, Vec<&ExecutionOutcome>> = BTreeMap::new();
        let mut task_types: BTreeMap<&str, Vec<&ExecutionOutcome>> = BTreeMap::new();
        for outcome in &in_window {
            agents.entry(outcome.agent_id.as_str()).or_default().push(outcome);
            task_types.entry(outcome.task_type.as_str()).or_default().push(outcome);
        }

        Self {
            window_start,
            window_end,
            total_outcomes: overall.total,
            successes: overall.successes,
            failures: overall.total - overall.successes,
            success_rate: overall.success_rate,
            mean_completion_ms: overall.mean_completion_ms,
            p95_completion_ms: percentile(&latencies, 95.0),
            total_cost_cents: overall.total_cost_cents,
            mean_user_satisfaction,
            by_agent: agents
                .into_iter()
                .map(|(id, list)| (id.to_string(), BreakdownStats::from_outcomes(list)))
                .collect(),
            by_task_type: task_types
                .into_iter()
                .map(|(t, list)| (t.to_string(), BreakdownStats::from_outcomes(list)))
                .collect(),
            weights,
            open_circuits,
        }
    }
}

#[derive(Debug)]
pub struct RoutingService {
    config: RouterConfig,
    registry: AgentRegistry,
    store: Arc<dyn RoutingStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    health: Arc<HealthMonitor>,
    breaker: Arc<CircuitBreaker>,
    learning: Arc<LearningEngine>,
    selection: Arc<SelectionEngine>,
    recorder: Arc<OutcomeRecorder>,
    orchestrator: RoutingOrchestrator,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RoutingService {
    /// Build all components and restore agents, breakers and outcome history
    /// from the store
    pub async fn new(
        config: RouterConfig,
        store: Arc<dyn RoutingStore>,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> RouterResult<Self> {
        config.validate()?;
        compact_store(store.as_ref(), clock.now() - config.storage.snapshot_retention()).await;

        let metrics = Arc::new(MetricsCollector::new());
        let registry = AgentRegistry::with_agents(config.agents.iter().cloned());
        for agent in store.load_agents().await? {
            registry.register_agent(agent);
        }

        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            registry.clone(),
            clock.clone(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        breaker.restore(store.load_breaker_states().await?);

        let learning = Arc::new(LearningEngine::new(
            config.learning.clone(),
            config.selection.baseline_weights,
            FeatureScale {
                latency_target_ms: config.health.latency_target_ms,
                cost_reference_cents: config.selection.cost_reference_cents,
            },
            clock.clone(),
            metrics.clone(),
        ));
        let selection = Arc::new(SelectionEngine::new(
            config.selection.clone(),
            config.health.latency_target_ms,
            registry.clone(),
            health.clone(),
            breaker.clone(),
            learning.clone(),
            clock.clone(),
        ));
        let recorder = Arc::new(OutcomeRecorder::new(
            config.recorder.clone(),
            breaker.clone(),
            health.clone(),
            store.clone(),
            learning.sender(),
            metrics.clone(),
        ));

        let outcomes = store.load_outcomes().await?;
        if !outcomes.is_empty() {
            recorder.seed_seen(outcomes.iter().map(|o| o.correlation_id.as_str()));
            health.replay(&outcomes);
            learning.replay(&outcomes);
            info!(outcomes = outcomes.len(), "Rebuilt routing state from outcome log");
        }

        let orchestrator = RoutingOrchestrator::new(
            config.orchestrator.clone(),
            registry.clone(),
            selection.clone(),
            breaker.clone(),
            health.clone(),
            recorder.clone(),
            dispatcher,
            clock.clone(),
            metrics.clone(),
        );

        info!(
            service = %config.service.name,
            agents = registry.agent_count(),
            "Routing service initialized"
        );

        Ok(Self {
            config,
            registry,
            store,
            clock,
            metrics,
            health,
            breaker,
            learning,
            selection,
            recorder,
            orchestrator,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.get_metrics()
    }

    pub fn metrics_collector(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    /// Decide only; nothing is dispatched
    pub fn select_agent(&self, task: &TaskContext) -> RoutingResult {
        let started = Instant::now();
        let selection = self.selection.select(task);
        let elapsed = started.elapsed();
        self.metrics.decision_time(elapsed);
        let routing_time_ms = elapsed.as_secs_f64() * 1000.0;

        match selection {
            Ok(selection) => RoutingResult::selected(task.task_id, selection, routing_time_ms),
            Err(e) => {
                if matches!(e, RoutingError::NoEligibleAgent { .. }) {
                    self.metrics.no_eligible_agent();
                }
                debug!(error = %e, "Selection failed");
                RoutingResult::failed(task.task_id, &e, routing_time_ms)
            }
        }
    }

    /// Select and execute through the dispatcher, falling back as needed
    pub async fn route(
        &self,
        task: &TaskContext,
        preferred_override: Option<&[String]>,
    ) -> RoutingResult {
        self.orchestrator.route(task, preferred_override).await
    }

    pub async fn record_outcome(&self, outcome: ExecutionOutcome) -> RouterResult<RecordAck> {
        self.recorder.record(outcome).await
    }

    /// Fresh snapshot of one agent, or of every registered agent
    pub fn get_health(&self, agent_id: Option<&str>) -> RouterResult<Vec<HealthSnapshot>> {
        match agent_id {
            Some(id) => Ok(vec![self.health.sample(id)?]),
            None => Ok(self.health.monitor_all()),
        }
    }

    /// Historical snapshots persisted by the background sampler
    pub async fn health_history(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> RouterResult<Vec<HealthSnapshot>> {
        self.registry.get_agent(agent_id)?;
        self.store.query_snapshots(agent_id, since).await
    }

    pub async fn get_analytics(&self, window: Duration) -> RouterResult<AnalyticsReport> {
        if window <= Duration::zero() {
            return Err(RoutingError::invalid_input("analytics window must be positive"));
        }
        let window_end = self.clock.now();
        let window_start = window_end - window;
        let outcomes = self
            .store
            .query_recent_outcomes(None, window_start, usize::MAX)
            .await?;

        Ok(AnalyticsReport::build(
            &outcomes,
            window_start,
            window_end,
            self.learning.current_weights().as_ref().clone(),
            self.breaker.open_circuits(),
        ))
    }

    /// Administrative override to CLOSED
    pub async fn reset_circuit_breaker(&self, agent_id: &str) -> RouterResult<CircuitBreakerState> {
        self.registry.get_agent(agent_id)?;
        let state = self.breaker.reset(agent_id);
        info!(agent_id = %agent_id, "Circuit breaker reset by operator");
        if let Err(e) = self.store.save_breaker_state(&state).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to persist reset breaker state");
        }
        Ok(state)
    }

    /// Fold queued outcomes into the learning aggregates now instead of
    /// waiting for the background loop. Returns the number ingested.
    pub fn process_learning_queue(&self) -> usize {
        self.learning.drain_queue()
    }

    pub fn predict_success(
        &self,
        agent_id: &str,
        task_type: &str,
        complexity: Complexity,
    ) -> RouterResult<SuccessPrediction> {
        self.registry.get_agent(agent_id)?;
        Ok(self.learning.predict_success(agent_id, task_type, complexity))
    }

    fn check_agent(agent: &Agent) -> RouterResult<()> {
        validate_agent_id(&agent.id).map_err(|e| RoutingError::invalid_input(e.to_string()))?;
        if agent.capacity == 0 {
            return Err(RoutingError::invalid_input(format!(
                "agent '{}' must declare a capacity of at least 1",
                agent.id
            )));
        }
        Ok(())
    }

    /// Register or replace an agent and persist it
    pub async fn register_agent(&self, agent: Agent) -> RouterResult<()> {
        Self::check_agent(&agent)?;
        self.store.save_agent(&agent).await?;
        info!(agent_id = %agent.id, "Agent registered");
        self.registry.register_agent(agent);
        Ok(())
    }

    pub async fn update_agent(&self, agent: Agent) -> RouterResult<()> {
        Self::check_agent(&agent)?;
        self.registry.get_agent(&agent.id)?;
        self.store.save_agent(&agent).await?;
        self.registry.update_agent(agent)
    }

    /// Remove an agent and every piece of live state held for it
    pub async fn remove_agent(&self, agent_id: &str) -> RouterResult<Agent> {
        let removed = self.registry.remove_agent(agent_id)?;
        self.health.forget(agent_id);
        self.breaker.remove(agent_id);
        match self.store.remove_agent(agent_id).await {
            // Agents seeded from configuration were never persisted
            Ok(()) | Err(RoutingError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        info!(agent_id = %agent_id, "Agent removed");
        Ok(removed)
    }

    pub fn circuit_states(&self) -> Vec<CircuitBreakerState> {
        self.breaker.snapshot_all()
    }

    pub fn current_weights(&self) -> Arc<WeightVector> {
        self.learning.current_weights()
    }

    /// Outcomes buffered while the store was unavailable
    pub fn pending_outcomes(&self) -> usize {
        self.recorder.pending_count()
    }

    /// Spawn the health sampler, learning loop and pending flush. A second
    /// call while tasks are running does nothing.
    pub fn start_background_tasks(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            debug!("Background tasks already running");
            return;
        }

        let health = self.health.clone();
        let store = self.store.clone();
        let sample_interval = self.config.health.sample_interval();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(sample_interval);
            interval.tick().await; // First tick completes immediately, skip it
            loop {
                interval.tick().await;
                for snapshot in health.monitor_all() {
                    if let Err(e) = store.save_snapshot(&snapshot).await {
                        warn!(agent_id = %snapshot.agent_id, error = %e, "Failed to persist health snapshot");
                    }
                }
            }
        }));

        let learning = self.learning.clone();
        let ingest_interval = self.config.learning.ingest_interval();
        let recompute_interval = self.config.learning.recompute_interval();
        tasks.push(tokio::spawn(async move {
            let mut ingest = tokio::time::interval(ingest_interval);
            let mut recompute = tokio::time::interval(recompute_interval);
            ingest.tick().await;
            recompute.tick().await;
            loop {
                tokio::select! {
                    _ = ingest.tick() => {
                        let ingested = learning.drain_queue();
                        if ingested > 0 {
                            debug!(ingested, "Ingested queued outcomes");
                        }
                    }
                    _ = recompute.tick() => {
                        learning.recompute_weights();
                    }
                }
            }
        }));

        let recorder = self.recorder.clone();
        let flush_interval = self.config.recorder.flush_interval();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if recorder.pending_count() > 0 {
                    recorder.flush_pending().await;
                }
            }
        }));

        info!(
            sample_interval_secs = sample_interval.as_secs(),
            ingest_interval_ms = ingest_interval.as_millis() as u64,
            recompute_interval_secs = recompute_interval.as_secs(),
            flush_interval_secs = flush_interval.as_secs(),
            "Background tasks started"
        );
    }

    /// Stop background work, flush buffered outcomes and persist breaker state
    pub async fn shutdown(&self) {
        info!("Shutting down routing service");
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }

        let flushed = self.recorder.flush_pending().await;
        let remaining = self.recorder.pending_count();
        if remaining > 0 {
            error!(flushed, remaining, "Outcomes still buffered at shutdown");
        }

        for state in self.breaker.snapshot_all() {
            if let Err(e) = self.store.save_breaker_state(&state).await {
                warn!(agent_id = %state.agent_id, error = %e, "Failed to persist breaker state");
            }
        }
        let cutoff = self.clock.now() - self.config.storage.snapshot_retention();
        compact_store(self.store.as_ref(), cutoff).await;
        info!("Routing service stopped");
    }
}

// A failed compaction leaves the previous files in place
async fn compact_store(store: &dyn RoutingStore, snapshot_cutoff: DateTime<Utc>) {
    if let Err(e) = store.compact(snapshot_cutoff).await {
        warn!(error = %e, "Store compaction failed");
    }
}
