//! Persistence interface
//!
//! The routing core only ever talks to a [`RoutingStore`]. Two implementations ship:
//! [`MemoryStore`] for tests and development, and [`JsonlStore`], a directory of
//! JSON-lines files used in production.

pub mod jsonl;
pub mod memory;

pub use jsonl::{read_outcome_log, JsonlStore};
pub use memory::MemoryStore;

use crate::circuit_breaker::CircuitBreakerState;
use crate::config::{StorageBackend, StorageConfig};
use crate::error::RouterResult;
use crate::health::HealthSnapshot;
use crate::outcome::ExecutionOutcome;
use crate::registry::Agent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Narrow persistence interface used by the router
#[async_trait]
pub trait RoutingStore: Send + Sync + std::fmt::Debug {
    async fn save_agent(&self, agent: &Agent) -> RouterResult<()>;

    async fn remove_agent(&self, agent_id: &str) -> RouterResult<()>;

    /// All persisted agents, ordered by id
    async fn load_agents(&self) -> RouterResult<Vec<Agent>>;

    async fn save_breaker_state(&self, state: &CircuitBreakerState) -> RouterResult<()>;

    /// Latest state per agent, ordered by agent id
    async fn load_breaker_states(&self) -> RouterResult<Vec<CircuitBreakerState>>;

    async fn append_outcome(&self, outcome: &ExecutionOutcome) -> RouterResult<()>;

    /// Outcomes recorded at or after `since`, oldest first, keeping the newest `limit`
    async fn query_recent_outcomes(
        &self,
        agent_id: Option<&str>,
        since: DateTime<Utc>,
        limit: usize,
    ) -> RouterResult<Vec<ExecutionOutcome>>;

    /// The full outcome log in append order
    async fn load_outcomes(&self) -> RouterResult<Vec<ExecutionOutcome>>;

    async fn save_snapshot(&self, snapshot: &HealthSnapshot) -> RouterResult<()>;

    /// Historical snapshots of one agent sampled at or after `since`, oldest first
    async fn query_snapshots(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> RouterResult<Vec<HealthSnapshot>>;

    /// Drop superseded records and health snapshots sampled before
    /// `snapshot_cutoff`. The outcome log is never compacted.
    async fn compact(&self, snapshot_cutoff: DateTime<Utc>) -> RouterResult<()>;
}

/// Build the store selected by configuration
pub async fn open_store(config: &StorageConfig) -> RouterResult<Arc<dyn RoutingStore>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Jsonl => Ok(Arc::new(JsonlStore::open(&config.path).await?)),
    }
}

/// Keep outcomes matching the filter, then the newest `limit` of them
pub(crate) fn filter_recent(
    outcomes: impl Iterator<Item = ExecutionOutcome>,
    agent_id: Option<&str>,
    since: DateTime<Utc>,
    limit: usize,
) -> Vec<ExecutionOutcome> {
    let mut matching: Vec<ExecutionOutcome> = outcomes
        .filter(|o| o.recorded_at >= since)
        .filter(|o| agent_id.map_or(true, |id| o.agent_id == id))
        .collect();
    matching.sort_by_key(|o| o.recorded_at);
    if matching.len() > limit {
        matching.drain(..matching.len() - limit);
    }
    matching
}
