//! Error types for the routing core
//!
//! Structural failures (unknown agent, nothing eligible) are returned as typed
//! variants so callers can tell "nothing available" apart from "system broken".
//! Transient failures (persistence, dispatch) are flagged by [`RoutingError::is_transient`]
//! and retried with bounded backoff by the orchestrator and recorder.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Main error type for routing operations
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("No eligible agent for task type '{task_type}': {reason}")]
    NoEligibleAgent { task_type: String, reason: String },

    #[error("Circuit open for agent '{agent_id}'")]
    CircuitOpen { agent_id: String },

    #[error("Routing decision missed deadline {deadline}")]
    DecisionTimeout { deadline: DateTime<Utc> },

    #[error("Persistence failure: {message}")]
    PersistenceFailure { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Dispatch to agent '{agent_id}' failed: {message}")]
    Dispatch { agent_id: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RoutingError {
    /// Create agent not found error
    pub fn agent_not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound {
            kind: "agent",
            id: id.into(),
        }
    }

    /// Create no eligible agent error
    pub fn no_eligible_agent<T: Into<String>, R: Into<String>>(task_type: T, reason: R) -> Self {
        Self::NoEligibleAgent {
            task_type: task_type.into(),
            reason: reason.into(),
        }
    }

    /// Create persistence failure error
    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::PersistenceFailure {
            message: message.into(),
        }
    }

    /// Create invalid input error
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create dispatch error
    pub fn dispatch<A: Into<String>, M: Into<String>>(agent_id: A, message: M) -> Self {
        Self::Dispatch {
            agent_id: agent_id.into(),
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RoutingError::PersistenceFailure { .. }
                | RoutingError::DecisionTimeout { .. }
                | RoutingError::Dispatch { .. }
        )
    }

    /// Stable snake_case label for serialization and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RoutingError::NotFound { .. } => "not_found",
            RoutingError::NoEligibleAgent { .. } => "no_eligible_agent",
            RoutingError::CircuitOpen { .. } => "circuit_open",
            RoutingError::DecisionTimeout { .. } => "decision_timeout",
            RoutingError::PersistenceFailure { .. } => "persistence_failure",
            RoutingError::InvalidInput { .. } => "invalid_input",
            RoutingError::Dispatch { .. } => "dispatch",
            RoutingError::Config(_) => "config",
            RoutingError::Internal { .. } => "internal",
        }
    }

    /// Caller-facing message with secrets and sensitive paths removed
    pub fn public_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Strip credentials and sensitive file paths, then cap the length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }

    if let Some(pattern) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();
    }

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for routing operations
pub type RouterResult<T> = Result<T, RoutingError>;
