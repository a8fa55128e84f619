//! Routing orchestrator
//!
//! Selects an agent, then walks the primary and its fallbacks until one
//! dispatch succeeds or the attempt budget runs out. Every executed attempt
//! produces exactly one recorded outcome. The task deadline bounds each
//! dispatch with the time left, so a missed deadline still records the attempt.

use crate::circuit_breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::error::RoutingError;
use crate::health::HealthMonitor;
use crate::observability::MetricsCollector;
use crate::outcome::{ExecutionOutcome, OutcomeRecorder};
use crate::registry::{Agent, AgentRegistry};
use crate::route_span;
use crate::routing::selection::SelectionEngine;
use crate::routing::task::{AgentSelection, RouteAttempt, RoutingResult, TaskContext};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};

/// What an agent reports back after executing a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchReport {
    #[serde(default)]
    pub quality_metrics: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub user_satisfaction: Option<f64>,
    /// Actual cost when it differs from the agent's declared cost
    #[serde(default)]
    pub cost_cents: Option<u64>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

/// Dispatch failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    #[error("Agent unavailable: {0}")]
    Unavailable(String),
    #[error("Dispatch timed out: {0}")]
    Timeout(String),
    #[error("Agent rejected task: {0}")]
    Rejected(String),
    #[error("Task execution failed: {0}")]
    Failed(String),
}

impl DispatchError {
    /// Unavailable and timed-out agents may recover; the next attempt backs off
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchError::Unavailable(_) | DispatchError::Timeout(_))
    }
}

/// Executes a task on a concrete agent
#[async_trait]
pub trait Dispatcher: Send + Sync + Debug {
    async fn dispatch(
        &self,
        agent: &Agent,
        task: &TaskContext,
    ) -> Result<DispatchReport, DispatchError>;
}

/// Releases a claimed half-open probe unless the attempt's outcome was recorded
struct ProbeClaim<'a> {
    breaker: &'a CircuitBreaker,
    agent_id: &'a str,
    attempt_id: &'a str,
    armed: bool,
}

impl ProbeClaim<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_probe(self.agent_id, self.attempt_id);
        }
    }
}

/// How a single dispatch ended
struct AttemptEnd {
    attempt: RouteAttempt,
    transient: bool,
    /// The dispatch was cut off by the task deadline
    deadline_hit: bool,
}

#[derive(Debug)]
pub struct RoutingOrchestrator {
    config: OrchestratorConfig,
    registry: AgentRegistry,
    selection: Arc<SelectionEngine>,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthMonitor>,
    recorder: Arc<OutcomeRecorder>,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
}

impl RoutingOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        registry: AgentRegistry,
        selection: Arc<SelectionEngine>,
        breaker: Arc<CircuitBreaker>,
        health: Arc<HealthMonitor>,
        recorder: Arc<OutcomeRecorder>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config,
            registry,
            selection,
            breaker,
            health,
            recorder,
            dispatcher,
            clock,
            metrics,
        }
    }

    /// Select and execute. Never fails; every failure is a `RoutingResult`.
    pub async fn route(
        &self,
        task: &TaskContext,
        preferred_override: Option<&[String]>,
    ) -> RoutingResult {
        self.metrics.route_requested();
        let span = route_span!(task_id = %task.task_id, task_type = %task.task_type);
        let started = Instant::now();

        if let Err(deadline) = self.remaining(task.deadline) {
            warn!(task_id = %task.task_id, %deadline, "Task deadline passed before selection");
            self.metrics.route_timed_out();
            let error = RoutingError::DecisionTimeout { deadline };
            return RoutingResult::failed(task.task_id, &error, elapsed_ms(started));
        }

        self.route_inner(task, preferred_override).instrument(span).await
    }

    /// Time left before `deadline`, `Ok(None)` without one, `Err` once it has passed
    fn remaining(&self, deadline: Option<DateTime<Utc>>) -> Result<Option<Duration>, DateTime<Utc>> {
        let Some(deadline) = deadline else {
            return Ok(None);
        };
        match (deadline - self.clock.now()).to_std() {
            Ok(left) if !left.is_zero() => Ok(Some(left)),
            _ => Err(deadline),
        }
    }

    async fn route_inner(
        &self,
        task: &TaskContext,
        preferred_override: Option<&[String]>,
    ) -> RoutingResult {
        let decision_started = Instant::now();
        let selection = self.selection.select_preferring(task, preferred_override);
        let decision_time = decision_started.elapsed();
        self.metrics.decision_time(decision_time);
        let routing_time_ms = decision_time.as_secs_f64() * 1000.0;

        let selection = match selection {
            Ok(selection) => selection,
            Err(e) => {
                if matches!(e, RoutingError::NoEligibleAgent { .. }) {
                    self.metrics.no_eligible_agent();
                }
                warn!(error = %e, "Selection failed");
                self.metrics.route_failed();
                return RoutingResult::failed(task.task_id, &e, routing_time_ms);
            }
        };

        self.execute(task, selection, routing_time_ms).await
    }

    async fn execute(
        &self,
        task: &TaskContext,
        selection: AgentSelection,
        routing_time_ms: f64,
    ) -> RoutingResult {
        let mut result = RoutingResult::selected(task.task_id, selection.clone(), routing_time_ms);
        let request_id = result.request_id.to_string();
        let chain: Vec<String> = std::iter::once(selection.agent_id.clone())
            .chain(selection.fallback_agents.iter().cloned())
            .collect();

        let mut last_error: Option<RoutingError> = None;
        for agent_id in &chain {
            if result.attempts.len() >= self.config.max_attempts {
                break;
            }
            let budget = match self.remaining(task.deadline) {
                Ok(budget) => budget,
                Err(deadline) => return self.deadline_missed(result, deadline),
            };

            let agent = match self.registry.get_agent(agent_id) {
                Ok(agent) => agent,
                Err(e) => {
                    debug!(agent_id = %agent_id, error = %e, "Skipping agent removed after selection");
                    continue;
                }
            };
            let attempt_id = format!("{request_id}:{}", result.attempts.len());
            if !self.breaker.allow_request(agent_id, &attempt_id) {
                debug!(agent_id = %agent_id, "Circuit refused dispatch, trying next agent");
                self.metrics.dispatch_skipped(agent_id);
                last_error.get_or_insert(RoutingError::CircuitOpen {
                    agent_id: agent_id.clone(),
                });
                continue;
            }

            let end = self.attempt(task, &agent, &attempt_id, budget).await;
            let success = end.attempt.success;
            if let Some(error) = &end.attempt.error {
                last_error = Some(RoutingError::dispatch(agent_id, error));
            }
            result.attempts.push(end.attempt);

            if success {
                result.executed_agent_id = Some(agent_id.clone());
                result.fallback_used = agent_id != &selection.agent_id;
                result.retry_count = (result.attempts.len() - 1) as u32;
                self.metrics.route_succeeded(result.fallback_used);
                info!(
                    agent_id = %agent_id,
                    retry_count = result.retry_count,
                    fallback_used = result.fallback_used,
                    "Task routed"
                );
                return result;
            }
            if end.deadline_hit {
                if let Some(deadline) = task.deadline {
                    return self.deadline_missed(result, deadline);
                }
            }

            let more = result.attempts.len() < self.config.max_attempts;
            if end.transient && more {
                let delay = self.config.backoff_delay(result.attempts.len() as u32 - 1);
                debug!(delay_ms = delay.as_millis() as u64, "Backing off before next attempt");
                tokio::time::sleep(delay).await;
            }
        }

        self.exhausted(result, last_error)
    }

    /// One dispatch with its outcome recorded, bounded by `budget` when the
    /// task has a deadline
    async fn attempt(
        &self,
        task: &TaskContext,
        agent: &Agent,
        attempt_id: &str,
        budget: Option<Duration>,
    ) -> AttemptEnd {
        let claim = ProbeClaim {
            breaker: &self.breaker,
            agent_id: &agent.id,
            attempt_id,
            armed: true,
        };
        let load_level = self.health.load_level(&agent.id);
        let guard = self.health.begin_request(&agent.id);
        let started = Instant::now();
        let (dispatched, deadline_hit) = match budget {
            Some(budget) => {
                match tokio::time::timeout(budget, self.dispatcher.dispatch(agent, task)).await {
                    Ok(dispatched) => (dispatched, false),
                    Err(_) => (
                        Err(DispatchError::Timeout(format!(
                            "no response within the {} ms left before the task deadline",
                            budget.as_millis()
                        ))),
                        true,
                    ),
                }
            }
            None => (self.dispatcher.dispatch(agent, task).await, false),
        };
        let elapsed = started.elapsed();
        drop(guard);

        let completion_time_ms = elapsed.as_millis() as u64;
        let success = dispatched.is_ok();
        self.metrics.dispatch_completed(&agent.id, elapsed, success);

        let mut outcome = ExecutionOutcome::new(
            attempt_id,
            &agent.id,
            &task.task_type,
            success,
            self.clock.now(),
        )
        .with_complexity(task.complexity)
        .with_completion_time(completion_time_ms)
        .with_cost(agent.cost_cents())
        .with_load_level(load_level);

        let (error, transient) = match &dispatched {
            Ok(report) => {
                if let Some(cost) = report.cost_cents {
                    outcome = outcome.with_cost(cost);
                }
                outcome.quality_metrics = report.quality_metrics.clone();
                outcome.user_satisfaction = report.user_satisfaction;
                (None, false)
            }
            Err(e) => {
                warn!(agent_id = %agent.id, error = %e, "Dispatch failed");
                (Some(e.to_string()), e.is_transient())
            }
        };

        match self.recorder.record(outcome).await {
            Ok(_) => claim.disarm(),
            Err(e) => warn!(agent_id = %agent.id, error = %e, "Failed to record attempt outcome"),
        }

        AttemptEnd {
            attempt: RouteAttempt {
                agent_id: agent.id.clone(),
                success,
                error,
                completion_time_ms,
            },
            transient,
            deadline_hit,
        }
    }

    /// The deadline passed mid-chain; keep the selection and attempts made so far
    fn deadline_missed(&self, mut result: RoutingResult, deadline: DateTime<Utc>) -> RoutingResult {
        let executed = result.attempts.len();
        warn!(%deadline, attempts = executed, "Routing missed task deadline");
        self.metrics.route_timed_out();

        let error = RoutingError::DecisionTimeout { deadline };
        result.success = false;
        result.retry_count = executed.saturating_sub(1) as u32;
        result.fallback_used = executed > 1;
        result.error_message = Some(error.public_message());
        result.error_kind = Some(error.kind().to_string());
        result
    }

    fn exhausted(&self, mut result: RoutingResult, last_error: Option<RoutingError>) -> RoutingResult {
        let executed = result.attempts.len();
        let message = match &last_error {
            Some(error) if executed > 0 => format!(
                "all {executed} attempted agent(s) failed; last error: {}",
                error.public_message()
            ),
            Some(error) => format!("no agent in the fallback chain accepted the task: {}", error.public_message()),
            None => "no agent in the fallback chain could be dispatched".to_string(),
        };

        warn!(attempts = executed, "Routing exhausted the fallback chain");
        self.metrics.route_failed();

        result.success = false;
        result.retry_count = executed.saturating_sub(1) as u32;
        result.fallback_used = executed > 1;
        result.error_message = Some(message);
        result.error_kind = Some(
            last_error
                .as_ref()
                .map(RoutingError::kind)
                .unwrap_or("dispatch")
                .to_string(),
        );
        result
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CircuitBreakerConfig, HealthConfig, LearningConfig, RecorderConfig, SelectionConfig,
    };
    use crate::learning::{FeatureScale, LearningEngine};
    use crate::routing::scoring::ScoringWeights;
    use crate::storage::{MemoryStore, RoutingStore};
    use crate::testing::mocks::MockDispatcher;
    use crate::testing::ManualClock;

    struct Fixture {
        orchestrator: RoutingOrchestrator,
        dispatcher: Arc<MockDispatcher>,
        breaker: Arc<CircuitBreaker>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture(agents: Vec<Agent>, dispatcher: MockDispatcher) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let metrics = Arc::new(MetricsCollector::new());
        let registry = AgentRegistry::with_agents(agents);
        let store = Arc::new(MemoryStore::new());
        let health = Arc::new(HealthMonitor::new(
            HealthConfig::default(),
            registry.clone(),
            clock.clone(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::default(),
            clock.clone(),
            metrics.clone(),
        ));
        let learning = Arc::new(LearningEngine::new(
            LearningConfig::default(),
            ScoringWeights::default(),
            FeatureScale {
                latency_target_ms: 5_000,
                cost_reference_cents: 10,
            },
            clock.clone(),
            metrics.clone(),
        ));
        let selection = Arc::new(SelectionEngine::new(
            SelectionConfig::default(),
            5_000,
            registry.clone(),
            health.clone(),
            breaker.clone(),
            learning.clone(),
            clock.clone(),
        ));
        let recorder = Arc::new(OutcomeRecorder::new(
            RecorderConfig::default(),
            breaker.clone(),
            health.clone(),
            store.clone() as Arc<dyn RoutingStore>,
            learning.sender(),
            metrics.clone(),
        ));
        let dispatcher = Arc::new(dispatcher);
        let orchestrator = RoutingOrchestrator::new(
            OrchestratorConfig {
                max_attempts: 3,
                backoff_base_ms: 1,
                backoff_max_ms: 5,
            },
            registry,
            selection,
            breaker.clone(),
            health,
            recorder,
            dispatcher.clone(),
            clock.clone(),
            metrics,
        );
        Fixture {
            orchestrator,
            dispatcher,
            breaker,
            store,
            clock,
        }
    }

    fn agents(ids: &[&str]) -> Vec<Agent> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| {
                Agent::new(*id, id.to_uppercase())
                    .with_capabilities(["analysis"])
                    .with_cost(i as u64)
            })
            .collect()
    }

    fn task() -> TaskContext {
        TaskContext::builder("code_analysis")
            .require("analysis")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_primary_success() {
        let f = fixture(agents(&["a", "b"]), MockDispatcher::new());
        let result = f.orchestrator.route(&task(), None).await;

        assert!(result.success);
        assert_eq!(result.executed_agent_id.as_deref(), Some("a"));
        assert_eq!(result.retry_count, 0);
        assert!(!result.fallback_used);
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(f.store.outcome_count(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_after_primary_failure() {
        let dispatcher = MockDispatcher::new()
            .fail_agent("a", DispatchError::Unavailable("down".to_string()));
        let f = fixture(agents(&["a", "b", "c"]), dispatcher);

        let result = f.orchestrator.route(&task(), None).await;
        assert!(result.success);
        assert_eq!(result.executed_agent_id.as_deref(), Some("b"));
        assert_eq!(result.retry_count, 1);
        assert!(result.fallback_used);
        assert!(!result.attempts[0].success);
        assert_eq!(f.store.outcome_count(), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_every_attempt() {
        let dispatcher = MockDispatcher::new()
            .fail_agent("a", DispatchError::Failed("boom".to_string()))
            .fail_agent("b", DispatchError::Failed("boom".to_string()))
            .fail_agent("c", DispatchError::Failed("boom".to_string()));
        let f = fixture(agents(&["a", "b", "c"]), dispatcher);

        let result = f.orchestrator.route(&task(), None).await;
        assert!(!result.success);
        assert_eq!(result.retry_count, 2);
        assert_eq!(result.attempts.len(), 3);
        assert_eq!(result.error_kind.as_deref(), Some("dispatch"));
        assert!(result.error_message.unwrap().contains("all 3 attempted agent(s) failed"));
        assert_eq!(f.store.outcome_count(), 3);
    }

    #[tokio::test]
    async fn test_no_eligible_agent_is_failed_result() {
        let f = fixture(vec![], MockDispatcher::new());
        let result = f.orchestrator.route(&task(), None).await;
        assert!(!result.success);
        assert!(result.selection.is_none());
        assert_eq!(result.retry_count, 0);
        assert_eq!(result.error_kind.as_deref(), Some("no_eligible_agent"));
        assert_eq!(f.dispatcher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_missed_deadline_is_decision_timeout() {
        let dispatcher = MockDispatcher::new().with_latency(Duration::from_millis(500));
        let f = fixture(agents(&["a", "b"]), dispatcher);
        let urgent = TaskContext::builder("code_analysis")
            .require("analysis")
            .deadline(f.clock.now() + chrono::Duration::milliseconds(30))
            .build()
            .unwrap();

        let result = f.orchestrator.route(&urgent, None).await;
        assert!(!result.success);
        assert_eq!(result.error_kind.as_deref(), Some("decision_timeout"));
        assert!(result.selection.is_some());

        // The cut-off dispatch is still an executed attempt with a recorded outcome
        assert_eq!(f.dispatcher.call_count(), 1);
        assert_eq!(result.attempts.len(), 1);
        assert!(!result.attempts[0].success);
        assert_eq!(result.retry_count, 0);
        assert_eq!(f.store.outcome_count(), f.dispatcher.call_count());
        assert_eq!(f.breaker.state("a").failure_count, 1);
    }

    #[tokio::test]
    async fn test_deadline_cut_off_trial_reopens_circuit() {
        let dispatcher = MockDispatcher::new().with_latency(Duration::from_millis(500));
        let f = fixture(agents(&["a"]), dispatcher);
        for _ in 0..5 {
            f.breaker.record_failure("a", "warmup");
        }
        f.clock.advance(chrono::Duration::seconds(61));
        let urgent = TaskContext::builder("code_analysis")
            .require("analysis")
            .deadline(f.clock.now() + chrono::Duration::milliseconds(30))
            .build()
            .unwrap();

        let result = f.orchestrator.route(&urgent, None).await;
        assert_eq!(result.error_kind.as_deref(), Some("decision_timeout"));
        // The timed-out attempt was the half-open trial and its failure reopens the circuit
        assert_eq!(
            f.breaker.state("a").state,
            crate::circuit_breaker::CircuitState::Open
        );
    }

    #[tokio::test]
    async fn test_past_deadline_never_dispatches() {
        let f = fixture(agents(&["a"]), MockDispatcher::new());
        let late = TaskContext::builder("code_analysis")
            .require("analysis")
            .deadline(f.clock.now() - chrono::Duration::seconds(1))
            .build()
            .unwrap();

        let result = f.orchestrator.route(&late, None).await;
        assert_eq!(result.error_kind.as_deref(), Some("decision_timeout"));
        assert_eq!(f.dispatcher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_probe_claimed_once() {
        let f = fixture(agents(&["a"]), MockDispatcher::new());
        for _ in 0..5 {
            f.breaker.record_failure("a", "warmup");
        }
        f.clock.advance(chrono::Duration::seconds(61));

        let result = f.orchestrator.route(&task(), None).await;
        assert!(result.success);
        assert_eq!(
            f.breaker.state("a").state,
            crate::circuit_breaker::CircuitState::Closed
        );
    }

    #[test]
    fn test_dispatch_error_transience() {
        assert!(DispatchError::Unavailable("x".into()).is_transient());
        assert!(DispatchError::Timeout("x".into()).is_transient());
        assert!(!DispatchError::Rejected("x".into()).is_transient());
        assert!(!DispatchError::Failed("x".into()).is_transient());
    }
}
