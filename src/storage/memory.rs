//! In-memory store for tests and development

use super::{filter_recent, RoutingStore};
use crate::circuit_breaker::CircuitBreakerState;
use crate::error::{RouterResult, RoutingError};
use crate::health::HealthSnapshot;
use crate::outcome::ExecutionOutcome;
use crate::registry::Agent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct MemoryInner {
    agents: BTreeMap<String, Agent>,
    breakers: BTreeMap<String, CircuitBreakerState>,
    outcomes: Vec<ExecutionOutcome>,
    snapshots: Vec<HealthSnapshot>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcome_count(&self) -> usize {
        self.inner.read().outcomes.len()
    }
}

#[async_trait]
impl RoutingStore for MemoryStore {
    async fn save_agent(&self, agent: &Agent) -> RouterResult<()> {
        self.inner
            .write()
            .agents
            .insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn remove_agent(&self, agent_id: &str) -> RouterResult<()> {
        self.inner
            .write()
            .agents
            .remove(agent_id)
            .map(|_| ())
            .ok_or_else(|| RoutingError::agent_not_found(agent_id))
    }

    async fn load_agents(&self) -> RouterResult<Vec<Agent>> {
        Ok(self.inner.read().agents.values().cloned().collect())
    }

    async fn save_breaker_state(&self, state: &CircuitBreakerState) -> RouterResult<()> {
        self.inner
            .write()
            .breakers
            .insert(state.agent_id.clone(), state.clone());
        Ok(())
    }

    async fn load_breaker_states(&self) -> RouterResult<Vec<CircuitBreakerState>> {
        Ok(self.inner.read().breakers.values().cloned().collect())
    }

    async fn append_outcome(&self, outcome: &ExecutionOutcome) -> RouterResult<()> {
        self.inner.write().outcomes.push(outcome.clone());
        Ok(())
    }

    async fn query_recent_outcomes(
        &self,
        agent_id: Option<&str>,
        since: DateTime<Utc>,
        limit: usize,
    ) -> RouterResult<Vec<ExecutionOutcome>> {
        let inner = self.inner.read();
        Ok(filter_recent(
            inner.outcomes.iter().cloned(),
            agent_id,
            since,
            limit,
        ))
    }

    async fn load_outcomes(&self) -> RouterResult<Vec<ExecutionOutcome>> {
        Ok(self.inner.read().outcomes.clone())
    }

    async fn save_snapshot(&self, snapshot: &HealthSnapshot) -> RouterResult<()> {
        self.inner.write().snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn query_snapshots(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> RouterResult<Vec<HealthSnapshot>> {
        let inner = self.inner.read();
        let mut snapshots: Vec<HealthSnapshot> = inner
            .snapshots
            .iter()
            .filter(|s| s.agent_id == agent_id && s.sampled_at >= since)
            .cloned()
            .collect();
        snapshots.sort_by_key(|s| s.sampled_at);
        Ok(snapshots)
    }

    async fn compact(&self, snapshot_cutoff: DateTime<Utc>) -> RouterResult<()> {
        self.inner
            .write()
            .snapshots
            .retain(|s| s.sampled_at >= snapshot_cutoff);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::task::Complexity;
    use chrono::Duration;

    fn outcome(id: &str, agent: &str, at: DateTime<Utc>) -> ExecutionOutcome {
        ExecutionOutcome::new(id, agent, "code_analysis", true, at)
            .with_complexity(Complexity::Simple)
            .with_completion_time(120)
    }

    #[tokio::test]
    async fn test_agent_roundtrip_and_remove() {
        let store = MemoryStore::new();
        store
            .save_agent(&Agent::new("b", "B").with_cost(4))
            .await
            .unwrap();
        store.save_agent(&Agent::new("a", "A")).await.unwrap();

        let agents = store.load_agents().await.unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].id, "a");
        assert_eq!(agents[1].cost_cents(), 4);

        store.remove_agent("a").await.unwrap();
        assert!(store.remove_agent("a").await.is_err());
        assert_eq!(store.load_agents().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_query_recent_outcomes_filters_and_limits() {
        let store = MemoryStore::new();
        let start = Utc::now();

        for i in 0..5 {
            let agent = if i % 2 == 0 { "a" } else { "b" };
            store
                .append_outcome(&outcome(&format!("c{i}"), agent, start + Duration::seconds(i)))
                .await
                .unwrap();
        }

        let all_a = store
            .query_recent_outcomes(Some("a"), start, 10)
            .await
            .unwrap();
        assert_eq!(all_a.len(), 3);

        let newest_two = store.query_recent_outcomes(None, start, 2).await.unwrap();
        let ids: Vec<&str> = newest_two.iter().map(|o| o.correlation_id.as_str()).collect();
        assert_eq!(ids, vec!["c3", "c4"]);

        let late = store
            .query_recent_outcomes(None, start + Duration::seconds(4), 10)
            .await
            .unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(store.outcome_count(), 5);
    }

    #[tokio::test]
    async fn test_snapshot_history() {
        let store = MemoryStore::new();
        let start = Utc::now();

        store
            .save_snapshot(&HealthSnapshot::neutral("a", 0, start))
            .await
            .unwrap();
        store
            .save_snapshot(&HealthSnapshot::neutral("a", 1, start + Duration::seconds(30)))
            .await
            .unwrap();
        store
            .save_snapshot(&HealthSnapshot::neutral("b", 0, start))
            .await
            .unwrap();

        let history = store
            .query_snapshots("a", start + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].active_requests, 1);
    }
}
