//! Agent selection
//!
//! Filters the registry down to eligible candidates (capabilities, trust,
//! circuit state), scores each from its health snapshot and optional success
//! prediction, and returns the best agent with an ordered fallback chain.

use crate::circuit_breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::config::SelectionConfig;
use crate::error::{RouterResult, RoutingError};
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::learning::{LearningEngine, SuccessPrediction};
use crate::registry::{Agent, AgentRegistry};
use crate::routing::scoring::{
    composite_score, cost_score, effective_weights, latency_budget_ms, load_score,
    performance_score, reliability_score, SubScores,
};
use crate::routing::task::{AgentSelection, TaskContext};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One eligible agent with its scores
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub agent: Agent,
    pub snapshot: HealthSnapshot,
    pub scores: SubScores,
    pub composite: f64,
}

impl ScoredCandidate {
    fn to_json(&self) -> Value {
        json!({
            "agent_id": self.agent.id,
            "composite": self.composite,
            "reliability": self.scores.reliability,
            "performance": self.scores.performance,
            "cost": self.scores.cost,
            "load": self.scores.load,
        })
    }
}

/// Highest composite first, then cheaper, then by id
fn rank(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.composite
        .total_cmp(&a.composite)
        .then_with(|| a.agent.cost_cents().cmp(&b.agent.cost_cents()))
        .then_with(|| a.agent.id.cmp(&b.agent.id))
}

#[derive(Debug)]
pub struct SelectionEngine {
    config: SelectionConfig,
    latency_target_ms: u64,
    registry: AgentRegistry,
    health: Arc<HealthMonitor>,
    breaker: Arc<CircuitBreaker>,
    learning: Arc<LearningEngine>,
    clock: Arc<dyn Clock>,
}

impl SelectionEngine {
    pub fn new(
        config: SelectionConfig,
        latency_target_ms: u64,
        registry: AgentRegistry,
        health: Arc<HealthMonitor>,
        breaker: Arc<CircuitBreaker>,
        learning: Arc<LearningEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            latency_target_ms,
            registry,
            health,
            breaker,
            learning,
            clock,
        }
    }

    /// Select using the learning engine's predictions when enabled
    pub fn select(&self, task: &TaskContext) -> RouterResult<AgentSelection> {
        self.select_preferring(task, None)
    }

    /// Like [`select`](Self::select), with `preferred_override` replacing the
    /// task's own preferred agents when given
    pub fn select_preferring(
        &self,
        task: &TaskContext,
        preferred_override: Option<&[String]>,
    ) -> RouterResult<AgentSelection> {
        let predictions = if self.config.use_predictions {
            self.predictions_for(task)
        } else {
            HashMap::new()
        };
        self.decide(task, &predictions, preferred_override)
    }

    /// Select with caller-supplied predictions keyed by agent id
    pub fn select_with_predictions(
        &self,
        task: &TaskContext,
        predictions: &HashMap<String, SuccessPrediction>,
    ) -> RouterResult<AgentSelection> {
        self.decide(task, predictions, None)
    }

    fn predictions_for(&self, task: &TaskContext) -> HashMap<String, SuccessPrediction> {
        self.registry
            .agents_with_all_capabilities(&task.required_capabilities)
            .into_iter()
            .map(|agent| {
                let prediction =
                    self.learning
                        .predict_success(&agent.id, &task.task_type, task.complexity);
                (agent.id, prediction)
            })
            .collect()
    }

    /// Eligible agents plus the ids excluded only because their circuit is open
    fn eligible(&self, task: &TaskContext) -> RouterResult<(Vec<Agent>, Vec<String>)> {
        let capable = self
            .registry
            .agents_with_all_capabilities(&task.required_capabilities);
        if capable.is_empty() {
            let reason = if self.registry.agent_count() == 0 {
                "no agents registered".to_string()
            } else {
                format!(
                    "no agent has all required capabilities {:?}",
                    task.required_capabilities
                )
            };
            return Err(RoutingError::no_eligible_agent(&task.task_type, reason));
        }

        let trusted: Vec<Agent> = if task.sensitive_data {
            capable.into_iter().filter(Agent::is_trusted).collect()
        } else {
            capable
        };
        if trusted.is_empty() {
            return Err(RoutingError::no_eligible_agent(
                &task.task_type,
                "no capable agent holds a trust tier for sensitive data",
            ));
        }

        let (accepting, open): (Vec<Agent>, Vec<Agent>) = trusted
            .into_iter()
            .partition(|agent| self.breaker.can_accept(&agent.id));
        let circuit_open: Vec<String> = open.into_iter().map(|a| a.id).collect();

        if accepting.is_empty() {
            return Err(RoutingError::no_eligible_agent(
                &task.task_type,
                format!("circuits open for every candidate: {}", circuit_open.join(", ")),
            ));
        }
        Ok((accepting, circuit_open))
    }

    /// Score eligible candidates and return them ranked best first
    pub fn rank_candidates(
        &self,
        task: &TaskContext,
        candidates: Vec<Agent>,
        predictions: &HashMap<String, SuccessPrediction>,
    ) -> Vec<ScoredCandidate> {
        let weights = self.learning.current_weights();
        let effective = effective_weights(&weights.weights, task);
        let budget = latency_budget_ms(task, self.latency_target_ms, self.clock.now());

        let mut ranked: Vec<ScoredCandidate> = candidates
            .into_iter()
            .filter_map(|agent| {
                let snapshot = match self.health.assess(&agent.id) {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        // Removed between the registry read and sampling
                        debug!(agent_id = %agent.id, error = %e, "Skipping candidate without health");
                        return None;
                    }
                };
                let scores = SubScores {
                    reliability: reliability_score(&snapshot, predictions.get(&agent.id)),
                    performance: performance_score(&snapshot, budget),
                    cost: cost_score(agent.cost_cents(), self.config.cost_reference_cents),
                    load: load_score(snapshot.load_level),
                };
                let composite = composite_score(&scores, &effective);
                debug!(
                    agent_id = %agent.id,
                    composite,
                    reliability = scores.reliability,
                    performance = scores.performance,
                    cost = scores.cost,
                    load = scores.load,
                    "Scored candidate"
                );
                Some(ScoredCandidate {
                    agent,
                    snapshot,
                    scores,
                    composite,
                })
            })
            .collect();

        ranked.sort_by(rank);
        ranked
    }

    fn decide(
        &self,
        task: &TaskContext,
        predictions: &HashMap<String, SuccessPrediction>,
        preferred_override: Option<&[String]>,
    ) -> RouterResult<AgentSelection> {
        task.validate()?;

        let (candidates, circuit_open) = self.eligible(task)?;
        let mut ranked = self.rank_candidates(task, candidates, predictions);
        if ranked.is_empty() {
            return Err(RoutingError::no_eligible_agent(
                &task.task_type,
                "every candidate disappeared during scoring",
            ));
        }

        let preferred = preferred_override.unwrap_or(task.preferred_agents.as_slice());
        let preference = self.apply_preference(&mut ranked, preferred);
        let displaced = preference.as_ref().and_then(|p| p.displaced.clone());

        let primary = &ranked[0];
        let fallback_agents = self.fallback_chain(task, &ranked, displaced.as_deref());

        let weight_version = self.learning.current_weights().version;
        let selection_reason = match &preference {
            Some(p) if p.displaced.is_some() => format!(
                "preferred agent within {:.0}% of top score ({:.3})",
                self.config.preference_tolerance * 100.0,
                primary.composite
            ),
            Some(_) => format!("preferred agent with top score ({:.3})", primary.composite),
            None => format!(
                "highest composite score ({:.3}) among {} candidate(s)",
                primary.composite,
                ranked.len()
            ),
        };

        let estimated_completion_ms = if primary.snapshot.sample_size > 0 {
            primary.snapshot.p95_latency_ms.round() as u64
        } else {
            self.latency_target_ms
        };

        let mut selection_metadata = serde_json::Map::new();
        selection_metadata.insert("weight_version".to_string(), json!(weight_version));
        selection_metadata.insert(
            "candidate_scores".to_string(),
            Value::Array(ranked.iter().map(ScoredCandidate::to_json).collect()),
        );
        selection_metadata.insert("circuit_open".to_string(), json!(circuit_open));
        selection_metadata.insert(
            "preference_applied".to_string(),
            json!(preference.as_ref().map(|p| p.agent_id.clone())),
        );
        if let Some(prediction) = predictions.get(&primary.agent.id) {
            selection_metadata.insert("prediction_basis".to_string(), json!(prediction.basis));
        }

        if !circuit_open.is_empty() {
            warn!(
                task_type = %task.task_type,
                excluded = ?circuit_open,
                "Agents excluded from selection by open circuits"
            );
        }
        info!(
            task_id = %task.task_id,
            task_type = %task.task_type,
            agent_id = %primary.agent.id,
            confidence = primary.composite,
            fallbacks = fallback_agents.len(),
            "Selected agent"
        );

        Ok(AgentSelection {
            agent_id: primary.agent.id.clone(),
            agent_name: primary.agent.name.clone(),
            confidence_score: primary.composite,
            selection_reason,
            fallback_agents,
            estimated_completion_ms,
            cost_estimate_cents: primary.agent.cost_cents(),
            selection_metadata,
        })
    }

    /// Move the first eligible preferred agent within tolerance of the top
    /// score to the front
    fn apply_preference(
        &self,
        ranked: &mut Vec<ScoredCandidate>,
        preferred: &[String],
    ) -> Option<AppliedPreference> {
        let top = ranked.first()?.composite;
        let floor = top * (1.0 - self.config.preference_tolerance);

        for agent_id in preferred {
            let Some(index) = ranked.iter().position(|c| &c.agent.id == agent_id) else {
                continue;
            };
            if ranked[index].composite + 1e-12 < floor {
                debug!(
                    agent_id = %agent_id,
                    score = ranked[index].composite,
                    top,
                    "Preferred agent outside tolerance"
                );
                continue;
            }
            if index == 0 {
                return Some(AppliedPreference {
                    agent_id: agent_id.clone(),
                    displaced: None,
                });
            }
            let displaced = ranked[0].agent.id.clone();
            let chosen = ranked.remove(index);
            ranked.insert(0, chosen);
            return Some(AppliedPreference {
                agent_id: agent_id.clone(),
                displaced: Some(displaced),
            });
        }
        None
    }

    /// Displaced top pick first, then eligible caller fallbacks in caller
    /// order, then the next-best candidates
    fn fallback_chain(
        &self,
        task: &TaskContext,
        ranked: &[ScoredCandidate],
        displaced: Option<&str>,
    ) -> Vec<String> {
        let primary = ranked[0].agent.id.as_str();
        let eligible = |id: &str| ranked.iter().any(|c| c.agent.id == id);

        let ordered = displaced
            .into_iter()
            .chain(task.fallback_agents.iter().map(String::as_str).filter(|id| eligible(*id)))
            .chain(ranked.iter().skip(1).map(|c| c.agent.id.as_str()));

        let mut chain: Vec<String> = Vec::new();
        for id in ordered {
            if chain.len() >= self.config.max_fallbacks {
                break;
            }
            if id != primary && !chain.iter().any(|c| c == id) {
                chain.push(id.to_string());
            }
        }
        chain
    }
}

#[derive(Debug, Clone)]
struct AppliedPreference {
    agent_id: String,
    displaced: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{CircuitBreakerConfig, HealthConfig, LearningConfig};
    use crate::health::LoadLevel;
    use crate::learning::{FeatureScale, PredictionBasis};
    use crate::observability::MetricsCollector;
    use crate::outcome::ExecutionOutcome;
    use crate::registry::TrustTier;
    use crate::routing::scoring::ScoringWeights;
    use crate::routing::task::Complexity;

    struct Fixture {
        engine: SelectionEngine,
        registry: AgentRegistry,
        health: Arc<HealthMonitor>,
        breaker: Arc<CircuitBreaker>,
        learning: Arc<LearningEngine>,
        clock: Arc<ManualClock>,
    }

    fn fixture(agents: Vec<Agent>, config: SelectionConfig) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let metrics = Arc::new(MetricsCollector::new());
        let registry = AgentRegistry::with_agents(agents);
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
            metrics,
        ));
        let engine = SelectionEngine::new(
            config,
            5_000,
            registry.clone(),
            health.clone(),
            breaker.clone(),
            learning.clone(),
            clock.clone(),
        );
        Fixture {
            engine,
            registry,
            health,
            breaker,
            learning,
            clock,
        }
    }

    fn agent(id: &str, cost: u64) -> Agent {
        Agent::new(id, id.to_uppercase())
            .with_capabilities(["analysis"])
            .with_cost(cost)
    }

    fn task() -> TaskContext {
        TaskContext::builder("code_analysis")
            .require("analysis")
            .build()
            .unwrap()
    }

    fn feed(f: &Fixture, agent_id: &str, successes: usize, failures: usize, ms: u64) {
        for i in 0..(successes + failures) {
            let outcome = ExecutionOutcome::new(
                format!("{agent_id}-{i}"),
                agent_id,
                "code_analysis",
                i < successes,
                f.clock.now(),
            )
            .with_completion_time(ms);
            f.health.observe(&outcome);
        }
    }

    #[test]
    fn test_empty_registry_is_typed_error() {
        let f = fixture(vec![], SelectionConfig::default());
        let err = f.engine.select(&task()).unwrap_err();
        assert!(matches!(err, RoutingError::NoEligibleAgent { .. }));
        assert!(err.to_string().contains("no agents registered"));
    }

    #[test]
    fn test_missing_capability_is_not_eligible() {
        let f = fixture(
            vec![Agent::new("a", "A").with_capabilities(["search"])],
            SelectionConfig::default(),
        );
        let err = f.engine.select(&task()).unwrap_err();
        assert_eq!(err.kind(), "no_eligible_agent");
    }

    #[test]
    fn test_sensitive_task_requires_trust_tier() {
        let f = fixture(
            vec![
                agent("open", 1),
                agent("vault", 50).with_trust_tier(TrustTier::Elevated),
            ],
            SelectionConfig::default(),
        );
        let sensitive = TaskContext::builder("code_analysis")
            .require("analysis")
            .sensitive(true)
            .build()
            .unwrap();
        let selection = f.engine.select(&sensitive).unwrap();
        assert_eq!(selection.agent_id, "vault");
        assert!(selection.fallback_agents.is_empty());

        f.registry.remove_agent("vault").unwrap();
        assert!(f.engine.select(&sensitive).is_err());
    }

    #[test]
    fn test_cheaper_agent_wins_when_otherwise_equal() {
        let f = fixture(vec![agent("a", 20), agent("b", 2)], SelectionConfig::default());
        let selection = f.engine.select(&task()).unwrap();
        assert_eq!(selection.agent_id, "b");
        assert_eq!(selection.fallback_agents, vec!["a".to_string()]);
        assert_eq!(selection.cost_estimate_cents, 2);
        assert_eq!(selection.estimated_completion_ms, 5_000);
    }

    #[test]
    fn test_ties_break_by_id() {
        let f = fixture(vec![agent("b", 5), agent("a", 5)], SelectionConfig::default());
        assert_eq!(f.engine.select(&task()).unwrap().agent_id, "a");
    }

    #[test]
    fn test_open_circuit_excluded_and_reported() {
        let f = fixture(vec![agent("a", 1), agent("b", 5)], SelectionConfig::default());
        for _ in 0..5 {
            f.breaker.record_failure("a", "warmup");
        }

        let selection = f.engine.select(&task()).unwrap();
        assert_eq!(selection.agent_id, "b");
        assert!(!selection.fallback_agents.contains(&"a".to_string()));
        assert_eq!(selection.selection_metadata["circuit_open"], json!(["a"]));

        for _ in 0..5 {
            f.breaker.record_failure("b", "warmup");
        }
        let err = f.engine.select(&task()).unwrap_err();
        assert!(err.to_string().contains("circuits open"));
    }

    #[test]
    fn test_half_open_agent_is_selectable_after_cooldown() {
        let f = fixture(vec![agent("a", 1)], SelectionConfig::default());
        for _ in 0..5 {
            f.breaker.record_failure("a", "warmup");
        }
        assert!(f.engine.select(&task()).is_err());

        f.clock.advance(chrono::Duration::seconds(61));
        assert_eq!(f.engine.select(&task()).unwrap().agent_id, "a");
    }

    #[test]
    fn test_unreliable_agent_ranks_below_reliable_one() {
        let f = fixture(vec![agent("flaky", 1), agent("steady", 1)], SelectionConfig::default());
        feed(&f, "flaky", 2, 2, 100);
        feed(&f, "steady", 4, 0, 100);

        let selection = f.engine.select(&task()).unwrap();
        assert_eq!(selection.agent_id, "steady");
        assert!(selection.confidence_score > 0.0 && selection.confidence_score <= 1.0);
        assert_eq!(selection.estimated_completion_ms, 100);
    }

    #[test]
    fn test_preference_within_tolerance_takes_primary() {
        let f = fixture(vec![agent("a", 9), agent("b", 10)], SelectionConfig::default());
        let preferred = TaskContext::builder("code_analysis")
            .require("analysis")
            .prefer("b")
            .build()
            .unwrap();

        let selection = f.engine.select(&preferred).unwrap();
        assert_eq!(selection.agent_id, "b");
        assert_eq!(selection.fallback_agents[0], "a");
        assert_eq!(selection.selection_metadata["preference_applied"], json!("b"));
    }

    #[test]
    fn test_preference_outside_tolerance_is_ignored() {
        let f = fixture(vec![agent("a", 0), agent("b", 100)], SelectionConfig::default());
        let preferred = TaskContext::builder("code_analysis")
            .require("analysis")
            .prefer("b")
            .build()
            .unwrap();

        let selection = f.engine.select(&preferred).unwrap();
        assert_eq!(selection.agent_id, "a");
        assert_eq!(selection.selection_metadata["preference_applied"], Value::Null);
    }

    #[test]
    fn test_override_replaces_task_preferences() {
        let f = fixture(vec![agent("a", 9), agent("b", 10)], SelectionConfig::default());
        let preferred = TaskContext::builder("code_analysis")
            .require("analysis")
            .prefer("a")
            .build()
            .unwrap();
        let override_list = vec!["b".to_string()];

        let selection = f
            .engine
            .select_preferring(&preferred, Some(&override_list))
            .unwrap();
        assert_eq!(selection.agent_id, "b");
    }

    #[test]
    fn test_fallbacks_honor_caller_order_and_bound() {
        let agents = (0..6).map(|i| agent(&format!("agent-{i}"), i)).collect();
        let f = fixture(agents, SelectionConfig::default());
        let with_fallbacks = TaskContext::builder("code_analysis")
            .require("analysis")
            .fallback("agent-5")
            .fallback("unknown")
            .build()
            .unwrap();

        let selection = f.engine.select(&with_fallbacks).unwrap();
        assert_eq!(selection.agent_id, "agent-0");
        assert_eq!(
            selection.fallback_agents,
            vec!["agent-5", "agent-1", "agent-2"]
        );
    }

    #[test]
    fn test_predictions_blend_into_reliability() {
        let f = fixture(vec![agent("a", 5), agent("b", 5)], SelectionConfig::default());
        let now = f.clock.now();
        let prediction = |agent_id: &str, rate: f64| SuccessPrediction {
            agent_id: agent_id.to_string(),
            task_type: "code_analysis".to_string(),
            complexity: Complexity::Moderate,
            predicted_success_rate: rate,
            confidence_interval: (rate - 0.1, rate + 0.1),
            risk_factors: Vec::new(),
            sample_size: 50,
            basis: PredictionBasis::AgentTaskType,
            model_version: 0,
            generated_at: now,
        };
        let predictions = HashMap::from([
            ("a".to_string(), prediction("a", 0.2)),
            ("b".to_string(), prediction("b", 0.95)),
        ]);

        let selection = f.engine.select_with_predictions(&task(), &predictions).unwrap();
        assert_eq!(selection.agent_id, "b");
        assert_eq!(
            selection.selection_metadata["prediction_basis"],
            json!("agent_task_type")
        );
    }

    #[test]
    fn test_busy_agent_loses_on_load() {
        let f = fixture(
            vec![agent("busy", 5).with_capacity(2), agent("idle", 5)],
            SelectionConfig::default(),
        );
        let _g1 = f.health.begin_request("busy");
        let _g2 = f.health.begin_request("busy");
        assert_eq!(f.health.load_level("busy"), LoadLevel::Saturated);

        assert_eq!(f.engine.select(&task()).unwrap().agent_id, "idle");
    }

    #[test]
    fn test_select_leaves_learning_queue_to_background() {
        let f = fixture(vec![agent("a", 5), agent("b", 5)], SelectionConfig::default());
        let tx = f.learning.sender();
        for i in 0..1_000 {
            let outcome = ExecutionOutcome::new(
                format!("queued-{i}"),
                if i % 2 == 0 { "a" } else { "b" },
                "code_analysis",
                true,
                f.clock.now(),
            );
            tx.send(outcome).unwrap();
        }

        f.engine.select(&task()).unwrap();
        assert_eq!(f.learning.drain_queue(), 1_000);
    }

    #[test]
    fn test_select_does_not_publish_health() {
        let f = fixture(vec![agent("a", 5), agent("b", 7)], SelectionConfig::default());
        feed(&f, "a", 3, 1, 200);

        let selection = f.engine.select(&task()).unwrap();
        assert_eq!(selection.fallback_agents.len(), 1);
        assert!(f.health.latest("a").is_none());
        assert!(f.health.latest("b").is_none());
    }
}
