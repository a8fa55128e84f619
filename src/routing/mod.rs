//! Routing decisions
//!
//! - `task`: the routed unit of work and the decision/result types
//! - `scoring`: pure sub-score and weighting functions
//! - `selection`: eligibility filtering, ranking and fallback chains

pub mod scoring;
pub mod selection;
pub mod task;

pub use scoring::{ScoringWeights, SubScores};
pub use selection::{ScoredCandidate, SelectionEngine};
pub use task::{
    AgentSelection, Complexity, RouteAttempt, RoutingResult, TaskContext, TaskContextBuilder,
};
