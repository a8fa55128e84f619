//! Per-agent circuit breakers
//!
//! Each agent gets its own breaker behind its own lock, so one agent's transition
//! never contends with another's. OPEN to HALF_OPEN is evaluated lazily against
//! the injected clock whenever the breaker is touched.

use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;
use crate::observability::MetricsCollector;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(label)
    }
}

/// Serializable view of one agent's breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub agent_id: String,
    pub state: CircuitState,
    /// Failures within the trailing window
    pub failure_count: u32,
    /// Successes since the last transition
    pub success_count: u32,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default)]
    pub probe_in_flight: bool,
    /// Trailing attempt results, oldest first, `true` for success
    #[serde(default)]
    pub recent_outcomes: Vec<bool>,
}

/// A state change made by a breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitTransition {
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    recent: VecDeque<bool>,
    success_count: u32,
    last_transition_time: DateTime<Utc>,
    /// Attempt id holding the half-open probe
    probe: Option<String>,
}

impl Breaker {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            recent: VecDeque::new(),
            success_count: 0,
            last_transition_time: now,
            probe: None,
        }
    }

    fn from_state(state: &CircuitBreakerState) -> Self {
        Self {
            state: state.state,
            recent: state.recent_outcomes.iter().copied().collect(),
            success_count: state.success_count,
            last_transition_time: state.last_transition_time,
            // A probe cannot survive a restart
            probe: None,
        }
    }

    fn failure_count(&self) -> u32 {
        self.recent.iter().filter(|ok| !**ok).count() as u32
    }

    fn cooldown_elapsed(&self, now: DateTime<Utc>, cooldown: chrono::Duration) -> bool {
        now - self.last_transition_time >= cooldown
    }

    fn transition(&mut self, to: CircuitState, now: DateTime<Utc>) -> CircuitTransition {
        let from = self.state;
        self.state = to;
        self.last_transition_time = now;
        self.success_count = 0;
        self.probe = None;
        if to == CircuitState::Closed {
            self.recent.clear();
        }
        CircuitTransition { from, to }
    }

    fn refresh(&mut self, now: DateTime<Utc>, cooldown: chrono::Duration) -> Option<CircuitTransition> {
        if self.state == CircuitState::Open && self.cooldown_elapsed(now, cooldown) {
            Some(self.transition(CircuitState::HalfOpen, now))
        } else {
            None
        }
    }

    fn holds_probe(&self, attempt_id: &str) -> bool {
        self.probe.as_deref() == Some(attempt_id)
    }

    fn push(&mut self, success: bool, window_size: usize) {
        self.recent.push_back(success);
        while self.recent.len() > window_size {
            self.recent.pop_front();
        }
    }

    fn to_state(&self, agent_id: &str) -> CircuitBreakerState {
        CircuitBreakerState {
            agent_id: agent_id.to_string(),
            state: self.state,
            failure_count: self.failure_count(),
            success_count: self.success_count,
            last_transition_time: self.last_transition_time,
            probe_in_flight: self.probe.is_some(),
            recent_outcomes: self.recent.iter().copied().collect(),
        }
    }
}

/// Registry of per-agent breakers
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    breakers: DashMap<String, Arc<Mutex<Breaker>>>,
}

impl CircuitBreaker {
    pub fn new(
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config,
            clock,
            metrics,
            breakers: DashMap::new(),
        }
    }

    // The shard guard is released before the breaker lock is taken
    fn breaker(&self, agent_id: &str) -> Arc<Mutex<Breaker>> {
        if let Some(existing) = self.breakers.get(agent_id) {
            return Arc::clone(existing.value());
        }
        let now = self.clock.now();
        Arc::clone(
            self.breakers
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Breaker::new(now))))
                .value(),
        )
    }

    fn note(&self, agent_id: &str, transition: Option<CircuitTransition>, failures: u32) {
        let Some(t) = transition else {
            return;
        };
        self.metrics.circuit_transition(t.from, t.to);
        match t.to {
            CircuitState::Open => warn!(
                agent_id = %agent_id,
                from = %t.from,
                failure_count = failures,
                cooldown_secs = self.config.cooldown_secs,
                "Circuit opened"
            ),
            CircuitState::HalfOpen => info!(
                agent_id = %agent_id,
                "Circuit half-open, next request is a probe"
            ),
            CircuitState::Closed => info!(agent_id = %agent_id, from = %t.from, "Circuit closed"),
        }
    }

    /// Whether a dispatch may proceed. In HALF_OPEN exactly one caller gets the
    /// probe, owned by `attempt_id` until its result is recorded or released.
    pub fn allow_request(&self, agent_id: &str, attempt_id: &str) -> bool {
        let breaker = self.breaker(agent_id);
        let (allowed, transition, failures) = {
            let mut b = breaker.lock();
            let transition = b.refresh(self.clock.now(), self.config.cooldown());
            let allowed = match b.state {
                CircuitState::Closed => true,
                CircuitState::Open => false,
                CircuitState::HalfOpen => {
                    if b.probe.is_some() {
                        false
                    } else {
                        b.probe = Some(attempt_id.to_string());
                        true
                    }
                }
            };
            (allowed, transition, b.failure_count())
        };
        self.note(agent_id, transition, failures);
        allowed
    }

    /// Read-only check used during selection; never claims the probe
    pub fn can_accept(&self, agent_id: &str) -> bool {
        let Some(breaker) = self.breakers.get(agent_id).map(|b| Arc::clone(b.value())) else {
            return true;
        };
        let b = breaker.lock();
        match b.state {
            CircuitState::Closed => true,
            CircuitState::Open => b.cooldown_elapsed(self.clock.now(), self.config.cooldown()),
            CircuitState::HalfOpen => b.probe.is_none(),
        }
    }

    /// Record a successful attempt. In HALF_OPEN only the probe's own attempt
    /// closes the circuit.
    pub fn record_success(&self, agent_id: &str, attempt_id: &str) -> Option<CircuitTransition> {
        let breaker = self.breaker(agent_id);
        let (transition, failures) = {
            let mut b = breaker.lock();
            let now = self.clock.now();
            let lazy = b.refresh(now, self.config.cooldown());
            let state = b.state;
            let transition = match state {
                CircuitState::HalfOpen if b.holds_probe(attempt_id) => {
                    Some(b.transition(CircuitState::Closed, now))
                }
                CircuitState::Closed => {
                    b.push(true, self.config.window_size as usize);
                    b.success_count = b.success_count.saturating_add(1);
                    None
                }
                // Late result, or one from an attempt that does not hold the probe
                CircuitState::Open | CircuitState::HalfOpen => {
                    b.success_count = b.success_count.saturating_add(1);
                    None
                }
            };
            if let Some(t) = lazy {
                self.note(agent_id, Some(t), b.failure_count());
            }
            (transition, b.failure_count())
        };
        self.note(agent_id, transition, failures);
        transition
    }

    /// Record a failed attempt. In HALF_OPEN only the probe's own attempt
    /// reopens the circuit.
    pub fn record_failure(&self, agent_id: &str, attempt_id: &str) -> Option<CircuitTransition> {
        let breaker = self.breaker(agent_id);
        let (transition, failures) = {
            let mut b = breaker.lock();
            let now = self.clock.now();
            let lazy = b.refresh(now, self.config.cooldown());
            let state = b.state;
            let transition = match state {
                CircuitState::Closed => {
                    b.push(false, self.config.window_size as usize);
                    if b.failure_count() >= self.config.failure_threshold {
                        Some(b.transition(CircuitState::Open, now))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen if b.holds_probe(attempt_id) => {
                    Some(b.transition(CircuitState::Open, now))
                }
                CircuitState::Open | CircuitState::HalfOpen => None,
            };
            if let Some(t) = lazy {
                self.note(agent_id, Some(t), b.failure_count());
            }
            (transition, b.failure_count())
        };
        self.note(agent_id, transition, failures);
        transition
    }

    /// Release a claimed probe without a result, e.g. when the dispatch was cancelled
    pub fn release_probe(&self, agent_id: &str, attempt_id: &str) {
        if let Some(breaker) = self.breakers.get(agent_id).map(|b| Arc::clone(b.value())) {
            let mut b = breaker.lock();
            if b.state == CircuitState::HalfOpen && b.holds_probe(attempt_id) {
                b.probe = None;
            }
        }
    }

    /// Administrative override back to CLOSED with cleared counters
    pub fn reset(&self, agent_id: &str) -> CircuitBreakerState {
        let breaker = self.breaker(agent_id);
        let state = {
            let mut b = breaker.lock();
            let from = b.state;
            b.transition(CircuitState::Closed, self.clock.now());
            if from != CircuitState::Closed {
                self.metrics.circuit_transition(from, CircuitState::Closed);
            }
            b.to_state(agent_id)
        };
        info!(agent_id = %agent_id, "Circuit breaker reset");
        state
    }

    pub fn state(&self, agent_id: &str) -> CircuitBreakerState {
        let breaker = self.breaker(agent_id);
        let (state, transition) = {
            let mut b = breaker.lock();
            let transition = b.refresh(self.clock.now(), self.config.cooldown());
            (b.to_state(agent_id), transition)
        };
        self.note(agent_id, transition, state.failure_count);
        state
    }

    /// Every known breaker, ordered by agent id
    pub fn snapshot_all(&self) -> Vec<CircuitBreakerState> {
        let mut ids: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids.iter().map(|id| self.state(id)).collect()
    }

    /// Agents whose breaker currently refuses selection
    pub fn open_circuits(&self) -> Vec<String> {
        self.snapshot_all()
            .into_iter()
            .filter(|s| s.state == CircuitState::Open)
            .map(|s| s.agent_id)
            .collect()
    }

    /// Load persisted states, replacing any in-memory breaker for the same agent
    pub fn restore(&self, states: Vec<CircuitBreakerState>) {
        let count = states.len();
        for state in states {
            self.breakers.insert(
                state.agent_id.clone(),
                Arc::new(Mutex::new(Breaker::from_state(&state))),
            );
        }
        info!(breakers = count, "Restored circuit breaker states");
    }

    pub fn remove(&self, agent_id: &str) {
        self.breakers.remove(agent_id);
    }
}
