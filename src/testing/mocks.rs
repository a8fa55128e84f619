//! Mock implementations for testing
//!
//! Provides a scriptable Dispatcher and a store whose writes can be made to
//! fail, so routing can be exercised without real agents or disks.

use crate::circuit_breaker::CircuitBreakerState;
use crate::error::{RouterResult, RoutingError};
use crate::health::HealthSnapshot;
use crate::orchestrator::{DispatchError, DispatchReport, Dispatcher};
use crate::outcome::ExecutionOutcome;
use crate::registry::Agent;
use crate::routing::task::TaskContext;
use crate::storage::{MemoryStore, RoutingStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
struct FailurePlan {
    error: DispatchError,
    /// `None` fails forever
    remaining: Option<usize>,
}

/// Mock dispatcher for testing
///
/// Succeeds for every agent unless told otherwise. Records the id of every
/// agent it was asked to dispatch to, in call order.
#[derive(Debug, Default)]
pub struct MockDispatcher {
    failures: Mutex<HashMap<String, FailurePlan>>,
    reports: HashMap<String, DispatchReport>,
    latency: Duration,
    calls: Mutex<Vec<String>>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dispatch to `agent_id` fails with `error`
    pub fn fail_agent<S: Into<String>>(self, agent_id: S, error: DispatchError) -> Self {
        self.failures.lock().insert(
            agent_id.into(),
            FailurePlan {
                error,
                remaining: None,
            },
        );
        self
    }

    /// The next `times` dispatches to `agent_id` fail, later ones succeed
    pub fn fail_times<S: Into<String>>(self, agent_id: S, times: usize, error: DispatchError) -> Self {
        self.failures.lock().insert(
            agent_id.into(),
            FailurePlan {
                error,
                remaining: Some(times),
            },
        );
        self
    }

    /// Report returned by successful dispatches to `agent_id`
    pub fn with_report<S: Into<String>>(mut self, agent_id: S, report: DispatchReport) -> Self {
        self.reports.insert(agent_id.into(), report);
        self
    }

    /// Delay applied to every dispatch
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Change an agent's behavior while the mock is shared
    pub fn set_failing(&self, agent_id: &str, error: Option<DispatchError>) {
        let mut failures = self.failures.lock();
        match error {
            Some(error) => {
                failures.insert(
                    agent_id.to_string(),
                    FailurePlan {
                        error,
                        remaining: None,
                    },
                );
            }
            None => {
                failures.remove(agent_id);
            }
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, agent_id: &str) -> usize {
        self.calls.lock().iter().filter(|id| *id == agent_id).count()
    }

    fn next_failure(&self, agent_id: &str) -> Option<DispatchError> {
        let mut failures = self.failures.lock();
        let plan = failures.get_mut(agent_id)?;
        match plan.remaining {
            None => Some(plan.error.clone()),
            Some(0) => None,
            Some(n) => {
                plan.remaining = Some(n - 1);
                Some(plan.error.clone())
            }
        }
    }
}

#[async_trait]
impl Dispatcher for MockDispatcher {
    async fn dispatch(
        &self,
        agent: &Agent,
        _task: &TaskContext,
    ) -> Result<DispatchReport, DispatchError> {
        self.calls.lock().push(agent.id.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.next_failure(&agent.id) {
            Some(error) => Err(error),
            None => Ok(self.reports.get(&agent.id).cloned().unwrap_or_default()),
        }
    }
}

/// Store whose writes fail while `failing` is set. Reads always succeed.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn outcome_count(&self) -> usize {
        self.inner.outcome_count()
    }

    fn check(&self) -> RouterResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(RoutingError::persistence("store unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RoutingStore for FlakyStore {
    async fn save_agent(&self, agent: &Agent) -> RouterResult<()> {
        self.check()?;
        self.inner.save_agent(agent).await
    }

    async fn remove_agent(&self, agent_id: &str) -> RouterResult<()> {
        self.check()?;
        self.inner.remove_agent(agent_id).await
    }

    async fn load_agents(&self) -> RouterResult<Vec<Agent>> {
        self.inner.load_agents().await
    }

    async fn save_breaker_state(&self, state: &CircuitBreakerState) -> RouterResult<()> {
        self.check()?;
        self.inner.save_breaker_state(state).await
    }

    async fn load_breaker_states(&self) -> RouterResult<Vec<CircuitBreakerState>> {
        self.inner.load_breaker_states().await
    }

    async fn append_outcome(&self, outcome: &ExecutionOutcome) -> RouterResult<()> {
        self.check()?;
        self.inner.append_outcome(outcome).await
    }

    async fn query_recent_outcomes(
        &self,
        agent_id: Option<&str>,
        since: DateTime<Utc>,
        limit: usize,
    ) -> RouterResult<Vec<ExecutionOutcome>> {
        self.inner.query_recent_outcomes(agent_id, since, limit).await
    }

    async fn load_outcomes(&self) -> RouterResult<Vec<ExecutionOutcome>> {
        self.inner.load_outcomes().await
    }

    async fn save_snapshot(&self, snapshot: &HealthSnapshot) -> RouterResult<()> {
        self.check()?;
        self.inner.save_snapshot(snapshot).await
    }

    async fn query_snapshots(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> RouterResult<Vec<HealthSnapshot>> {
        self.inner.query_snapshots(agent_id, since).await
    }

    async fn compact(&self, snapshot_cutoff: DateTime<Utc>) -> RouterResult<()> {
        self.check()?;
        self.inner.compact(snapshot_cutoff).await
    }
}
