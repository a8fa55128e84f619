//! Betty Router
//!
//! Context-aware agent routing: among a pool of heterogeneous worker agents,
//! pick the one best suited to a task from cost, latency, reliability and
//! capability signals, with fallback chains, per-agent circuit breakers,
//! health tracking and continuous learning from execution outcomes.
//!
//! # Overview
//!
//! - [`registry`]: agents and their capabilities
//! - [`health`]: rolling health snapshots per agent
//! - [`circuit_breaker`]: per-agent failure isolation
//! - [`routing`]: task context, scoring and selection
//! - [`outcome`]: idempotent outcome recording
//! - [`learning`]: success prediction and learned scoring weights
//! - [`orchestrator`]: select, dispatch, fall back
//! - [`service`]: the facade wiring it all together
//!
//! # Quick Start
//!
//! ```rust
//! use betty_router::routing::{Complexity, TaskContext};
//!
//! let task = TaskContext::builder("code_analysis")
//!     .complexity(Complexity::Complex)
//!     .priority(8)
//!     .require("rust")
//!     .prefer("reviewer-1")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(task.priority, 8);
//! assert!(task.required_capabilities.contains("rust"));
//! ```

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod learning;
pub mod observability;
pub mod orchestrator;
pub mod outcome;
pub mod registry;
pub mod routing;
pub mod service;
pub mod storage;
pub mod testing;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, RouterConfig};
pub use error::{RouterResult, RoutingError};
pub use health::{HealthMonitor, HealthSnapshot, LoadLevel};
pub use learning::{LearningEngine, PredictionBasis, RiskFactor, SuccessPrediction, WeightVector};
pub use orchestrator::{DispatchError, DispatchReport, Dispatcher, RoutingOrchestrator};
pub use outcome::{ExecutionOutcome, OutcomeRecorder, RecordAck};
pub use registry::{Agent, AgentRegistry, TrustTier};
pub use routing::{AgentSelection, Complexity, RouteAttempt, RoutingResult, TaskContext};
pub use service::{AnalyticsReport, RoutingService};
pub use storage::{JsonlStore, MemoryStore, RoutingStore};
