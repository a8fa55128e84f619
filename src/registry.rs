//! Agent Registry
//!
//! Read-mostly catalog of execution agents with an inverted capability index.
//! The index (lowercased capability -> agent ids) is rebuilt on every mutation so
//! lookups stay O(1) amortized while the registry is being read concurrently.

use crate::error::{RouterResult, RoutingError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

fn default_capacity() -> u32 {
    10
}

/// Cost of sending one request to an agent, in currency-agnostic cents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostModel {
    pub cost_per_request_cents: u64,
}

/// Trust tier required before an agent may see sensitive data
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    Standard,
    Elevated,
}

/// A registered execution worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent identifier
    pub id: String,
    /// Human readable name
    pub name: String,
    /// Declared capabilities (e.g. "code_analysis", "security_audit")
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(flatten)]
    pub cost: CostModel,
    /// Maximum concurrent requests, used to derive load level
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// Agents without a tier never receive sensitive tasks
    #[serde(default)]
    pub trust_tier: Option<TrustTier>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Agent {
    /// Create an agent with no capabilities, zero cost and default capacity
    pub fn new<I: Into<String>, N: Into<String>>(id: I, name: N) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capabilities: BTreeSet::new(),
            cost: CostModel::default(),
            capacity: default_capacity(),
            trust_tier: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cost(mut self, cost_per_request_cents: u64) -> Self {
        self.cost = CostModel {
            cost_per_request_cents,
        };
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_trust_tier(mut self, tier: TrustTier) -> Self {
        self.trust_tier = Some(tier);
        self
    }

    pub fn cost_cents(&self) -> u64 {
        self.cost.cost_per_request_cents
    }

    /// Check if agent declares a capability (case-insensitive)
    pub fn has_capability(&self, capability: &str) -> bool {
        let wanted = capability.to_lowercase();
        self.capabilities.iter().any(|c| c.to_lowercase() == wanted)
    }

    /// Whether the agent may receive tasks flagged as sensitive
    pub fn is_trusted(&self) -> bool {
        self.trust_tier.is_some()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    agents: HashMap<String, Agent>,
    capability_index: HashMap<String, BTreeSet<String>>,
}

impl RegistryInner {
    fn rebuild_index(&mut self) {
        let mut index: HashMap<String, BTreeSet<String>> = HashMap::new();
        for agent in self.agents.values() {
            for capability in &agent.capabilities {
                index
                    .entry(capability.to_lowercase())
                    .or_default()
                    .insert(agent.id.clone());
            }
        }
        self.capability_index = index;
    }
}

/// Thread-safe registry of agents
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl AgentRegistry {
    /// Create a new empty agent registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-populated with agents
    pub fn with_agents<I: IntoIterator<Item = Agent>>(agents: I) -> Self {
        let registry = Self::new();
        {
            let mut inner = registry.inner.write();
            for agent in agents {
                inner.agents.insert(agent.id.clone(), agent);
            }
            inner.rebuild_index();
        }
        registry
    }

    /// Register or replace an agent
    pub fn register_agent(&self, agent: Agent) {
        let agent_id = agent.id.clone();
        let mut inner = self.inner.write();
        let is_new = inner.agents.insert(agent_id.clone(), agent).is_none();
        inner.rebuild_index();

        if is_new {
            info!(agent_id = %agent_id, "Registered new agent");
        } else {
            debug!(agent_id = %agent_id, "Replaced agent definition");
        }
    }

    /// Administrative update of an existing agent
    pub fn update_agent(&self, agent: Agent) -> RouterResult<()> {
        let mut inner = self.inner.write();
        if !inner.agents.contains_key(&agent.id) {
            return Err(RoutingError::agent_not_found(agent.id));
        }
        debug!(agent_id = %agent.id, "Updated agent definition");
        inner.agents.insert(agent.id.clone(), agent);
        inner.rebuild_index();
        Ok(())
    }

    /// Remove an agent from the registry
    pub fn remove_agent(&self, agent_id: &str) -> RouterResult<Agent> {
        let mut inner = self.inner.write();
        let removed = inner
            .agents
            .remove(agent_id)
            .ok_or_else(|| RoutingError::agent_not_found(agent_id))?;
        inner.rebuild_index();
        info!(agent_id = %agent_id, "Removed agent");
        Ok(removed)
    }

    /// Get agent by id
    pub fn get_agent(&self, agent_id: &str) -> RouterResult<Agent> {
        self.inner
            .read()
            .agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| RoutingError::agent_not_found(agent_id))
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.inner.read().agents.contains_key(agent_id)
    }

    /// All agents, ordered by id
    pub fn list_agents(&self) -> Vec<Agent> {
        let inner = self.inner.read();
        let mut agents: Vec<Agent> = inner.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Agents declaring a capability, ordered by id. Empty when nothing matches.
    pub fn agents_with_capability(&self, capability: &str) -> Vec<Agent> {
        let inner = self.inner.read();
        inner
            .capability_index
            .get(&capability.to_lowercase())
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.agents.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Agents declaring every capability in the set, ordered by id.
    /// An empty requirement matches every agent.
    pub fn agents_with_all_capabilities(&self, capabilities: &BTreeSet<String>) -> Vec<Agent> {
        if capabilities.is_empty() {
            return self.list_agents();
        }

        let inner = self.inner.read();
        let mut matching: Option<BTreeSet<String>> = None;

        for capability in capabilities {
            let ids = match inner.capability_index.get(&capability.to_lowercase()) {
                Some(ids) => ids,
                None => return Vec::new(),
            };
            matching = Some(match matching {
                None => ids.clone(),
                Some(current) => current.intersection(ids).cloned().collect(),
            });
        }

        matching
            .unwrap_or_default()
            .iter()
            .filter_map(|id| inner.agents.get(id).cloned())
            .collect()
    }

    pub fn agent_count(&self) -> usize {
        self.inner.read().agents.len()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.list_agents().into_iter().map(|a| a.id).collect()
    }
}
