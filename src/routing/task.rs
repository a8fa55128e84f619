//! Routing request and decision types

use crate::error::{RouterResult, RoutingError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use uuid::Uuid;

/// How demanding a task is; drives the reliability weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
    Critical,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Complexity::Simple => "simple",
            Complexity::Moderate => "moderate",
            Complexity::Complex => "complex",
            Complexity::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// The unit of work being routed. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub task_type: String,
    pub complexity: Complexity,
    /// 1 (lowest) to 10 (highest)
    pub priority: u8,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    /// Advisory, in caller preference order
    #[serde(default)]
    pub preferred_agents: Vec<String>,
    /// Advisory, in caller preference order
    #[serde(default)]
    pub fallback_agents: Vec<String>,
    /// Restricts routing to agents holding a trust tier
    #[serde(default)]
    pub sensitive_data: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TaskContext {
    pub fn builder<S: Into<String>>(task_type: S) -> TaskContextBuilder {
        TaskContextBuilder::new(task_type)
    }

    /// Reject contexts that could not have come from the builder
    pub fn validate(&self) -> RouterResult<()> {
        if self.task_type.trim().is_empty() {
            return Err(RoutingError::invalid_input("task_type must not be empty"));
        }
        if !(1..=10).contains(&self.priority) {
            return Err(RoutingError::invalid_input(format!(
                "priority must be between 1 and 10, got {}",
                self.priority
            )));
        }
        Ok(())
    }
}

/// Builder for [`TaskContext`]
#[derive(Debug, Clone)]
pub struct TaskContextBuilder {
    task: TaskContext,
}

impl TaskContextBuilder {
    fn new<S: Into<String>>(task_type: S) -> Self {
        Self {
            task: TaskContext {
                task_id: Uuid::new_v4(),
                task_type: task_type.into(),
                complexity: Complexity::Moderate,
                priority: 5,
                deadline: None,
                project_id: None,
                user_id: None,
                required_capabilities: BTreeSet::new(),
                preferred_agents: Vec::new(),
                fallback_agents: Vec::new(),
                sensitive_data: false,
                metadata: HashMap::new(),
            },
        }
    }

    pub fn task_id(mut self, task_id: Uuid) -> Self {
        self.task.task_id = task_id;
        self
    }

    pub fn complexity(mut self, complexity: Complexity) -> Self {
        self.task.complexity = complexity;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.task.deadline = Some(deadline);
        self
    }

    pub fn project_id<S: Into<String>>(mut self, project_id: S) -> Self {
        self.task.project_id = Some(project_id.into());
        self
    }

    pub fn user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.task.user_id = Some(user_id.into());
        self
    }

    pub fn require<S: Into<String>>(mut self, capability: S) -> Self {
        self.task.required_capabilities.insert(capability.into());
        self
    }

    pub fn prefer<S: Into<String>>(mut self, agent_id: S) -> Self {
        self.task.preferred_agents.push(agent_id.into());
        self
    }

    pub fn fallback<S: Into<String>>(mut self, agent_id: S) -> Self {
        self.task.fallback_agents.push(agent_id.into());
        self
    }

    pub fn sensitive(mut self, sensitive: bool) -> Self {
        self.task.sensitive_data = sensitive;
        self
    }

    pub fn metadata<K: Into<String>>(mut self, key: K, value: serde_json::Value) -> Self {
        self.task.metadata.insert(key.into(), value);
        self
    }

    pub fn build(self) -> RouterResult<TaskContext> {
        self.task.validate()?;
        Ok(self.task)
    }
}

/// The selection engine's decision for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSelection {
    pub agent_id: String,
    pub agent_name: String,
    pub confidence_score: f64,
    pub selection_reason: String,
    /// Next-best agents, best first
    pub fallback_agents: Vec<String>,
    pub estimated_completion_ms: u64,
    pub cost_estimate_cents: u64,
    #[serde(default)]
    pub selection_metadata: serde_json::Map<String, serde_json::Value>,
}

/// One executed dispatch attempt within a route call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteAttempt {
    pub agent_id: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub completion_time_ms: u64,
}

/// Outcome of a routing call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingResult {
    pub request_id: Uuid,
    pub task_id: Uuid,
    pub selection: Option<AgentSelection>,
    pub success: bool,
    /// Time spent deciding, dispatch time excluded
    pub routing_time_ms: f64,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Stable label of the failure, see `RoutingError::kind`
    #[serde(default)]
    pub error_kind: Option<String>,
    pub fallback_used: bool,
    pub retry_count: u32,
    /// Agent whose attempt succeeded
    #[serde(default)]
    pub executed_agent_id: Option<String>,
    #[serde(default)]
    pub attempts: Vec<RouteAttempt>,
}

impl RoutingResult {
    /// Result of a decision-only call
    pub fn selected(task_id: Uuid, selection: AgentSelection, routing_time_ms: f64) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            task_id,
            selection: Some(selection),
            success: true,
            routing_time_ms,
            error_message: None,
            error_kind: None,
            fallback_used: false,
            retry_count: 0,
            executed_agent_id: None,
            attempts: Vec::new(),
        }
    }

    /// Failed result carrying a sanitized error
    pub fn failed(task_id: Uuid, error: &RoutingError, routing_time_ms: f64) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            task_id,
            selection: None,
            success: false,
            routing_time_ms,
            error_message: Some(error.public_message()),
            error_kind: Some(error.kind().to_string()),
            fallback_used: false,
            retry_count: 0,
            executed_agent_id: None,
            attempts: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let task = TaskContext::builder("code_analysis").build().unwrap();
        assert_eq!(task.complexity, Complexity::Moderate);
        assert_eq!(task.priority, 5);
        assert!(task.required_capabilities.is_empty());
        assert!(!task.sensitive_data);
    }

    #[test]
    fn test_builder_rejects_out_of_range_priority() {
        assert!(TaskContext::builder("x").priority(0).build().is_err());
        assert!(TaskContext::builder("x").priority(11).build().is_err());
        assert!(TaskContext::builder("x").priority(10).build().is_ok());
    }

    #[test]
    fn test_builder_rejects_blank_task_type() {
        let result = TaskContext::builder("  ").build();
        assert!(matches!(result, Err(RoutingError::InvalidInput { .. })));
    }

    #[test]
    fn test_complexity_serde_is_snake_case() {
        assert_eq!(
            serde_json::to_string(&Complexity::Critical).unwrap(),
            "\"critical\""
        );
        assert_eq!(Complexity::Complex.to_string(), "complex");
    }

    #[test]
    fn test_failed_result_carries_kind() {
        let task = TaskContext::builder("x").build().unwrap();
        let error = RoutingError::no_eligible_agent("x", "no agents registered");
        let result = RoutingResult::failed(task.task_id, &error, 0.4);
        assert!(!result.success);
        assert_eq!(result.error_kind.as_deref(), Some("no_eligible_agent"));
        assert!(result.error_message.unwrap().contains("no agents registered"));
        assert_eq!(result.retry_count, 0);
    }
}
