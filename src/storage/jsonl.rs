//! JSON-lines file store
//!
//! One append-only file per entity kind inside a directory. Agent and breaker
//! files are replayed last-write-wins on load; agent removals are tombstone
//! records. A torn trailing line (crash during append) is skipped with a warning.
//! Compaction rewrites the agent and breaker files to their current state and
//! trims the snapshot file to a retention window.

use super::{filter_recent, RoutingStore};
use crate::circuit_breaker::CircuitBreakerState;
use crate::error::{RouterResult, RoutingError};
use crate::health::HealthSnapshot;
use crate::outcome::ExecutionOutcome;
use crate::registry::Agent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

const AGENTS_FILE: &str = "agents.jsonl";
const BREAKERS_FILE: &str = "breakers.jsonl";
const OUTCOMES_FILE: &str = "outcomes.jsonl";
const SNAPSHOTS_FILE: &str = "snapshots.jsonl";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum AgentRecord {
    Upsert { agent: Agent },
    Remove { agent_id: String },
}

fn io_error(path: &Path, error: std::io::Error) -> RoutingError {
    RoutingError::persistence(format!("{}: {error}", path.display()))
}

/// Parse a JSON-lines file, skipping unreadable lines. A missing file reads
/// as empty when `missing_ok` is set.
async fn read_records<T: DeserializeOwned + Send>(
    path: &Path,
    missing_ok: bool,
) -> RouterResult<Vec<T>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if missing_ok && e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(path, e)),
    };

    let mut records = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                file = %path.display(),
                line = line_no + 1,
                error = %e,
                "Skipping unreadable record"
            ),
        }
    }
    Ok(records)
}

/// Read an exported outcome log, one `ExecutionOutcome` per line
pub async fn read_outcome_log<P: AsRef<Path>>(path: P) -> RouterResult<Vec<ExecutionOutcome>> {
    read_records(path.as_ref(), false).await
}

#[derive(Debug)]
pub struct JsonlStore {
    dir: PathBuf,
    // Serializes appends so lines from concurrent writers never interleave
    write_lock: Mutex<()>,
}

impl JsonlStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub async fn open<P: AsRef<Path>>(dir: P) -> RouterResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;
        info!(path = %dir.display(), "Opened JSON-lines store");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    async fn append<T: Serialize + Sync>(&self, name: &str, record: &T) -> RouterResult<()> {
        let path = self.file(name);
        let mut line = serde_json::to_string(record)
            .map_err(|e| RoutingError::persistence(format!("serialize {name}: {e}")))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| io_error(&path, e))?;
        file.flush().await.map_err(|e| io_error(&path, e))?;
        Ok(())
    }

    async fn read_all<T: DeserializeOwned + Send>(&self, name: &str) -> RouterResult<Vec<T>> {
        read_records(&self.file(name), true).await
    }

    async fn rewrite<T: Serialize + Sync>(&self, name: &str, records: &[T]) -> RouterResult<()> {
        let path = self.file(name);
        let tmp = self.file(&format!("{name}.tmp"));

        let mut content = String::new();
        for record in records {
            let line = serde_json::to_string(record)
                .map_err(|e| RoutingError::persistence(format!("serialize {name}: {e}")))?;
            content.push_str(&line);
            content.push('\n');
        }

        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;
        Ok(())
    }

    async fn current_agents(&self) -> RouterResult<BTreeMap<String, Agent>> {
        let mut agents = BTreeMap::new();
        for record in self.read_all::<AgentRecord>(AGENTS_FILE).await? {
            match record {
                AgentRecord::Upsert { agent } => {
                    agents.insert(agent.id.clone(), agent);
                }
                AgentRecord::Remove { agent_id } => {
                    agents.remove(&agent_id);
                }
            }
        }
        Ok(agents)
    }

    async fn current_breakers(&self) -> RouterResult<BTreeMap<String, CircuitBreakerState>> {
        let mut breakers = BTreeMap::new();
        for state in self.read_all::<CircuitBreakerState>(BREAKERS_FILE).await? {
            breakers.insert(state.agent_id.clone(), state);
        }
        Ok(breakers)
    }

    async fn compact_files(&self, snapshot_cutoff: DateTime<Utc>) -> RouterResult<()> {
        let _guard = self.write_lock.lock().await;
        let agents: Vec<AgentRecord> = self
            .current_agents()
            .await?
            .into_values()
            .map(|agent| AgentRecord::Upsert { agent })
            .collect();
        let breakers: Vec<CircuitBreakerState> =
            self.current_breakers().await?.into_values().collect();
        let snapshots = self.read_all::<HealthSnapshot>(SNAPSHOTS_FILE).await?;
        let before = snapshots.len();
        let retained: Vec<HealthSnapshot> = snapshots
            .into_iter()
            .filter(|s| s.sampled_at >= snapshot_cutoff)
            .collect();

        self.rewrite(AGENTS_FILE, &agents).await?;
        self.rewrite(BREAKERS_FILE, &breakers).await?;
        self.rewrite(SNAPSHOTS_FILE, &retained).await?;
        info!(
            agents = agents.len(),
            breakers = breakers.len(),
            snapshots = retained.len(),
            snapshots_dropped = before - retained.len(),
            "Compacted JSON-lines store"
        );
        Ok(())
    }
}

#[async_trait]
impl RoutingStore for JsonlStore {
    async fn save_agent(&self, agent: &Agent) -> RouterResult<()> {
        self.append(
            AGENTS_FILE,
            &AgentRecord::Upsert {
                agent: agent.clone(),
            },
        )
        .await
    }

    async fn remove_agent(&self, agent_id: &str) -> RouterResult<()> {
        if !self.current_agents().await?.contains_key(agent_id) {
            return Err(RoutingError::agent_not_found(agent_id));
        }
        self.append(
            AGENTS_FILE,
            &AgentRecord::Remove {
                agent_id: agent_id.to_string(),
            },
        )
        .await
    }

    async fn load_agents(&self) -> RouterResult<Vec<Agent>> {
        Ok(self.current_agents().await?.into_values().collect())
    }

    async fn save_breaker_state(&self, state: &CircuitBreakerState) -> RouterResult<()> {
        self.append(BREAKERS_FILE, state).await
    }

    async fn load_breaker_states(&self) -> RouterResult<Vec<CircuitBreakerState>> {
        Ok(self.current_breakers().await?.into_values().collect())
    }

    async fn append_outcome(&self, outcome: &ExecutionOutcome) -> RouterResult<()> {
        self.append(OUTCOMES_FILE, outcome).await
    }

    async fn query_recent_outcomes(
        &self,
        agent_id: Option<&str>,
        since: DateTime<Utc>,
        limit: usize,
    ) -> RouterResult<Vec<ExecutionOutcome>> {
        let outcomes = self.read_all::<ExecutionOutcome>(OUTCOMES_FILE).await?;
        Ok(filter_recent(outcomes.into_iter(), agent_id, since, limit))
    }

    async fn load_outcomes(&self) -> RouterResult<Vec<ExecutionOutcome>> {
        self.read_all(OUTCOMES_FILE).await
    }

    async fn save_snapshot(&self, snapshot: &HealthSnapshot) -> RouterResult<()> {
        self.append(SNAPSHOTS_FILE, snapshot).await
    }

    async fn query_snapshots(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> RouterResult<Vec<HealthSnapshot>> {
        let mut snapshots: Vec<HealthSnapshot> = self
            .read_all::<HealthSnapshot>(SNAPSHOTS_FILE)
            .await?
            .into_iter()
            .filter(|s| s.agent_id == agent_id && s.sampled_at >= since)
            .collect();
        snapshots.sort_by_key(|s| s.sampled_at);
        Ok(snapshots)
    }

    async fn compact(&self, snapshot_cutoff: DateTime<Utc>) -> RouterResult<()> {
        self.compact_files(snapshot_cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::registry::TrustTier;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_files_load_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonlStore::open(dir.path()).await.unwrap();
        assert!(store.load_agents().await.unwrap().is_empty());
        assert!(store.load_outcomes().await.unwrap().is_empty());
        assert!(store.load_breaker_states().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_agents_last_write_wins_and_tombstones() {
        let dir = TempDir::new().unwrap();
        let store = JsonlStore::open(dir.path()).await.unwrap();

        store.save_agent(&Agent::new("a", "A")).await.unwrap();
        store
            .save_agent(
                &Agent::new("a", "A v2")
                    .with_trust_tier(TrustTier::Elevated)
                    .with_capabilities(["x"]),
            )
            .await
            .unwrap();
        store.save_agent(&Agent::new("b", "B")).await.unwrap();
        store.remove_agent("b").await.unwrap();

        let agents = store.load_agents().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].name, "A v2");
        assert!(agents[0].is_trusted());

        assert!(store.remove_agent("b").await.is_err());
    }

    #[tokio::test]
    async fn test_breaker_states_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let state = CircuitBreakerState {
            agent_id: "a".to_string(),
            state: CircuitState::Open,
            failure_count: 5,
            success_count: 0,
            last_transition_time: Utc::now(),
            probe_in_flight: false,
            recent_outcomes: vec![false; 5],
        };

        {
            let store = JsonlStore::open(dir.path()).await.unwrap();
            store.save_breaker_state(&state).await.unwrap();
        }

        let reopened = JsonlStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.load_breaker_states().await.unwrap(), vec![state]);
    }

    #[tokio::test]
    async fn test_torn_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = JsonlStore::open(dir.path()).await.unwrap();
        let outcome = ExecutionOutcome::new("c1", "a", "t", true, Utc::now());
        store.append_outcome(&outcome).await.unwrap();

        let path = dir.path().join(OUTCOMES_FILE);
        let mut content = tokio::fs::read_to_string(&path).await.unwrap();
        content.push_str("{\"correlation_id\": \"c2\", \"agen");
        tokio::fs::write(&path, content).await.unwrap();

        let outcomes = store.load_outcomes().await.unwrap();
        assert_eq!(outcomes, vec![outcome]);
    }

    async fn line_count(dir: &TempDir, name: &str) -> usize {
        tokio::fs::read_to_string(dir.path().join(name))
            .await
            .unwrap()
            .lines()
            .count()
    }

    #[tokio::test]
    async fn test_compact_keeps_current_state() {
        let dir = TempDir::new().unwrap();
        let store = JsonlStore::open(dir.path()).await.unwrap();
        for i in 0..5 {
            store
                .save_agent(&Agent::new("a", format!("A{i}")))
                .await
                .unwrap();
        }
        store.save_agent(&Agent::new("b", "B")).await.unwrap();
        store.remove_agent("b").await.unwrap();
        store.compact(Utc::now()).await.unwrap();

        assert_eq!(line_count(&dir, AGENTS_FILE).await, 1);
        let agents = store.load_agents().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].name, "A4");
    }

    #[tokio::test]
    async fn test_compact_collapses_breakers_and_trims_snapshots() {
        let dir = TempDir::new().unwrap();
        let store = JsonlStore::open(dir.path()).await.unwrap();
        let now = Utc::now();

        for (i, state) in [CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
            .into_iter()
            .enumerate()
        {
            store
                .save_breaker_state(&CircuitBreakerState {
                    agent_id: "a".to_string(),
                    state,
                    failure_count: 0,
                    success_count: 0,
                    last_transition_time: now + chrono::Duration::seconds(i as i64),
                    probe_in_flight: false,
                    recent_outcomes: Vec::new(),
                })
                .await
                .unwrap();
        }
        for hours_ago in [200, 100, 1] {
            let sampled_at = now - chrono::Duration::hours(hours_ago);
            store
                .save_snapshot(&HealthSnapshot::neutral("a", 0, sampled_at))
                .await
                .unwrap();
        }
        assert_eq!(line_count(&dir, BREAKERS_FILE).await, 3);
        assert_eq!(line_count(&dir, SNAPSHOTS_FILE).await, 3);

        store
            .compact(now - chrono::Duration::hours(168))
            .await
            .unwrap();

        assert_eq!(line_count(&dir, BREAKERS_FILE).await, 1);
        assert_eq!(
            store.load_breaker_states().await.unwrap()[0].state,
            CircuitState::Closed
        );
        assert_eq!(line_count(&dir, SNAPSHOTS_FILE).await, 2);
        let kept = store
            .query_snapshots("a", now - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|s| s.sampled_at >= now - chrono::Duration::hours(168)));
    }
}
