//! Health monitor
//!
//! Keeps a bounded outcome window per agent plus an in-flight request counter, and
//! derives [`HealthSnapshot`]s from them. The last published snapshot per agent is
//! the last-known-good value selection reads when sampling falls behind.

use super::{percentile, HealthSnapshot, LoadLevel};
use crate::clock::Clock;
use crate::config::HealthConfig;
use crate::error::RouterResult;
use crate::outcome::ExecutionOutcome;
use crate::registry::AgentRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Minimum window size before an error trend is computed
const MIN_TREND_SAMPLES: usize = 4;

#[derive(Debug, Clone)]
struct WindowEntry {
    success: bool,
    errored: bool,
    completion_time_ms: u64,
    recorded_at: DateTime<Utc>,
}

impl From<&ExecutionOutcome> for WindowEntry {
    fn from(outcome: &ExecutionOutcome) -> Self {
        Self {
            success: outcome.success,
            errored: !outcome.success || outcome.error_count > 0,
            completion_time_ms: outcome.completion_time_ms,
            recorded_at: outcome.recorded_at,
        }
    }
}

/// Decrements the agent's in-flight counter when dropped
#[derive(Debug)]
pub struct InFlightGuard {
    agent_id: String,
    counter: Arc<AtomicU32>,
}

impl InFlightGuard {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let _ = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            });
    }
}

/// Tracks recent outcomes and concurrent load per agent
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    registry: AgentRegistry,
    clock: Arc<dyn Clock>,
    windows: DashMap<String, VecDeque<WindowEntry>>,
    in_flight: DashMap<String, Arc<AtomicU32>>,
    snapshots: DashMap<String, Arc<HealthSnapshot>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, registry: AgentRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            registry,
            clock,
            windows: DashMap::new(),
            in_flight: DashMap::new(),
            snapshots: DashMap::new(),
        }
    }

    /// Feed an outcome into the agent's window and republish its snapshot
    pub fn observe(&self, outcome: &ExecutionOutcome) {
        self.push_entry(outcome);
        if self.registry.contains(&outcome.agent_id) {
            // The agent was registered a moment ago, a race with removal only skips a publish
            let _ = self.sample(&outcome.agent_id);
        }
    }

    fn push_entry(&self, outcome: &ExecutionOutcome) {
        let mut window = self.windows.entry(outcome.agent_id.clone()).or_default();
        window.push_back(WindowEntry::from(outcome));
        while window.len() > self.config.window_size {
            window.pop_front();
        }
    }

    /// Mark a request as in flight until the returned guard is dropped
    pub fn begin_request(&self, agent_id: &str) -> InFlightGuard {
        let counter = self
            .in_flight
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            agent_id: agent_id.to_string(),
            counter,
        }
    }

    pub fn active_requests(&self, agent_id: &str) -> u32 {
        self.in_flight
            .get(agent_id)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Current load level from in-flight requests and declared capacity
    pub fn load_level(&self, agent_id: &str) -> LoadLevel {
        let capacity = self
            .registry
            .get_agent(agent_id)
            .map(|a| a.capacity)
            .unwrap_or(1);
        LoadLevel::from_utilization(self.active_requests(agent_id), capacity)
    }

    pub fn sample(&self, agent_id: &str) -> RouterResult<HealthSnapshot> {
        self.sample_at(agent_id, self.clock.now())
    }

    /// Compute and publish a snapshot as of `now`
    pub fn sample_at(&self, agent_id: &str, now: DateTime<Utc>) -> RouterResult<HealthSnapshot> {
        let snapshot = self.assess_at(agent_id, now)?;
        trace!(
            agent_id = %agent_id,
            success_rate = snapshot.success_rate,
            failure_score = snapshot.failure_score,
            sample_size = snapshot.sample_size,
            "Sampled agent health"
        );
        self.snapshots
            .insert(agent_id.to_string(), Arc::new(snapshot.clone()));
        Ok(snapshot)
    }

    /// Compute a snapshot from the live window without publishing it
    pub fn assess(&self, agent_id: &str) -> RouterResult<HealthSnapshot> {
        self.assess_at(agent_id, self.clock.now())
    }

    pub fn assess_at(&self, agent_id: &str, now: DateTime<Utc>) -> RouterResult<HealthSnapshot> {
        let agent = self.registry.get_agent(agent_id)?;
        let cutoff = now - self.config.window_duration();

        let mut entries: Vec<WindowEntry> = self
            .windows
            .get(agent_id)
            .map(|window| {
                window
                    .iter()
                    .filter(|e| e.recorded_at >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by_key(|e| e.recorded_at);

        Ok(compute_snapshot(
            agent_id,
            &entries,
            self.active_requests(agent_id),
            agent.capacity,
            self.config.latency_target_ms,
            now,
        ))
    }

    /// Last published snapshot for the agent
    pub fn latest(&self, agent_id: &str) -> Option<Arc<HealthSnapshot>> {
        self.snapshots.get(agent_id).map(|s| Arc::clone(s.value()))
    }

    /// Last published snapshot, sampling on demand if none exists yet
    pub fn current(&self, agent_id: &str) -> RouterResult<Arc<HealthSnapshot>> {
        match self.latest(agent_id) {
            Some(snapshot) => Ok(snapshot),
            None => self.sample(agent_id).map(Arc::new),
        }
    }

    /// Sample every registered agent, ordered by agent id
    pub fn monitor_all(&self) -> Vec<HealthSnapshot> {
        let now = self.clock.now();
        let snapshots: Vec<HealthSnapshot> = self
            .registry
            .agent_ids()
            .iter()
            .filter_map(|id| self.sample_at(id, now).ok())
            .collect();
        debug!(agents = snapshots.len(), "Sampled health of all agents");
        snapshots
    }

    /// Drop all state held for a removed agent
    pub fn forget(&self, agent_id: &str) {
        self.windows.remove(agent_id);
        self.snapshots.remove(agent_id);
    }

    /// Rebuild every window from an outcome log and republish all snapshots
    pub fn replay(&self, outcomes: &[ExecutionOutcome]) -> Vec<HealthSnapshot> {
        self.windows.clear();
        self.snapshots.clear();

        let mut ordered: Vec<&ExecutionOutcome> = outcomes.iter().collect();
        ordered.sort_by_key(|o| o.recorded_at);
        for outcome in ordered {
            self.push_entry(outcome);
        }

        debug!(outcomes = outcomes.len(), "Replayed outcomes into health windows");
        self.monitor_all()
    }
}

/// Pure snapshot computation over a window ordered oldest first
fn compute_snapshot(
    agent_id: &str,
    entries: &[WindowEntry],
    active_requests: u32,
    capacity: u32,
    latency_target_ms: u64,
    now: DateTime<Utc>,
) -> HealthSnapshot {
    let load_level = LoadLevel::from_utilization(active_requests, capacity);

    if entries.is_empty() {
        let mut neutral = HealthSnapshot::neutral(agent_id, active_requests, now);
        neutral.load_level = load_level;
        return neutral;
    }

    let n = entries.len();
    let successes = entries.iter().filter(|e| e.success).count();
    let success_rate = successes as f64 / n as f64;
    let error_rate = errored_fraction(entries);

    let mut latencies: Vec<u64> = entries.iter().map(|e| e.completion_time_ms).collect();
    latencies.sort_unstable();
    let p50 = percentile(&latencies, 50.0);
    let p95 = percentile(&latencies, 95.0);

    let error_trend = if n >= MIN_TREND_SAMPLES {
        let (older, newer) = entries.split_at(n / 2);
        errored_fraction(newer) - errored_fraction(older)
    } else {
        0.0
    };

    let target = latency_target_ms.max(1) as f64;
    let overshoot = ((p95 - target) / target).clamp(0.0, 1.0);
    let failure_score =
        (0.5 * (1.0 - success_rate) + 0.3 * overshoot + 0.2 * error_trend.max(0.0)).clamp(0.0, 1.0);

    HealthSnapshot {
        agent_id: agent_id.to_string(),
        p50_latency_ms: p50,
        p95_latency_ms: p95,
        success_rate,
        error_rate,
        active_requests,
        load_level,
        failure_score,
        error_trend,
        sample_size: n,
        sampled_at: now,
    }
}

fn errored_fraction(entries: &[WindowEntry]) -> f64 {
    if entries.is_empty() {
        return 0.0;
    }
    entries.iter().filter(|e| e.errored).count() as f64 / entries.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::Agent;
    use crate::routing::task::Complexity;
    use chrono::Duration;

    fn monitor_with(clock: Arc<ManualClock>, window_size: usize) -> HealthMonitor {
        let registry = AgentRegistry::with_agents(vec![
            Agent::new("a", "A").with_capacity(4),
            Agent::new("b", "B"),
        ]);
        let config = HealthConfig {
            window_size,
            ..HealthConfig::default()
        };
        HealthMonitor::new(config, registry, clock)
    }

    fn outcome(agent: &str, success: bool, ms: u64, at: DateTime<Utc>) -> ExecutionOutcome {
        ExecutionOutcome::new(uuid::Uuid::new_v4().to_string(), agent, "code_analysis", success, at)
            .with_complexity(Complexity::Moderate)
            .with_completion_time(ms)
    }

    #[test]
    fn test_no_data_is_neutral() {
        let clock = Arc::new(ManualClock::default());
        let monitor = monitor_with(clock, 100);

        let snapshot = monitor.sample("a").unwrap();
        assert_eq!(snapshot.success_rate, 1.0);
        assert_eq!(snapshot.error_rate, 0.0);
        assert_eq!(snapshot.load_level, LoadLevel::Idle);
        assert_eq!(snapshot.failure_score, 0.0);
    }

    #[test]
    fn test_no_data_with_in_flight_requests_reports_load() {
        let clock = Arc::new(ManualClock::default());
        let monitor = monitor_with(clock, 100);

        let _g1 = monitor.begin_request("a");
        let _g2 = monitor.begin_request("a");
        let snapshot = monitor.sample("a").unwrap();
        assert_eq!(snapshot.active_requests, 2);
        assert_eq!(snapshot.load_level, LoadLevel::Moderate);
        assert_eq!(snapshot.success_rate, 1.0);
    }

    #[test]
    fn test_in_flight_guard_decrements_on_drop() {
        let clock = Arc::new(ManualClock::default());
        let monitor = monitor_with(clock, 100);

        {
            let guard = monitor.begin_request("b");
            assert_eq!(guard.agent_id(), "b");
            assert_eq!(monitor.active_requests("b"), 1);
        }
        assert_eq!(monitor.active_requests("b"), 0);
    }

    #[test]
    fn test_success_rate_and_failure_score() {
        let clock = Arc::new(ManualClock::default());
        let monitor = monitor_with(clock.clone(), 100);
        let now = clock.now();

        for i in 0..10 {
            monitor.observe(&outcome("a", i != 0, 1000, now));
        }

        let snapshot = monitor.latest("a").unwrap();
        assert!((snapshot.success_rate - 0.9).abs() < 1e-9);
        assert!((snapshot.error_rate - 0.1).abs() < 1e-9);
        assert_eq!(snapshot.sample_size, 10);
        assert!(snapshot.failure_score > 0.0);
        assert!(snapshot.failure_score <= 1.0);
    }

    #[test]
    fn test_window_keeps_last_n() {
        let clock = Arc::new(ManualClock::default());
        let monitor = monitor_with(clock.clone(), 5);
        let now = clock.now();

        for _ in 0..5 {
            monitor.observe(&outcome("a", false, 100, now));
        }
        for _ in 0..5 {
            monitor.observe(&outcome("a", true, 100, now));
        }

        let snapshot = monitor.sample("a").unwrap();
        assert_eq!(snapshot.sample_size, 5);
        assert_eq!(snapshot.success_rate, 1.0);
    }

    #[test]
    fn test_window_drops_old_outcomes() {
        let clock = Arc::new(ManualClock::default());
        let monitor = monitor_with(clock.clone(), 100);
        let start = clock.now();

        monitor.observe(&outcome("a", false, 100, start));
        clock.advance(Duration::minutes(16));
        monitor.observe(&outcome("a", true, 100, clock.now()));

        let snapshot = monitor.sample("a").unwrap();
        assert_eq!(snapshot.sample_size, 1);
        assert_eq!(snapshot.success_rate, 1.0);
    }

    #[test]
    fn test_rising_errors_produce_positive_trend() {
        let clock = Arc::new(ManualClock::default());
        let monitor = monitor_with(clock.clone(), 100);
        let start = clock.now();

        for i in 0..10 {
            let at = start + Duration::seconds(i);
            monitor.observe(&outcome("a", i < 5, 100, at));
        }

        let snapshot = monitor.sample_at("a", start + Duration::seconds(10)).unwrap();
        assert!((snapshot.error_trend - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_latency_overshoot_raises_failure_score() {
        let clock = Arc::new(ManualClock::default());
        let monitor = monitor_with(clock.clone(), 100);
        let now = clock.now();

        for _ in 0..10 {
            monitor.observe(&outcome("a", true, 1_000, now));
            monitor.observe(&outcome("b", true, 20_000, now));
        }

        let fast = monitor.latest("a").unwrap();
        let slow = monitor.latest("b").unwrap();
        assert_eq!(fast.failure_score, 0.0);
        assert!((slow.failure_score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_agent_is_not_found() {
        let clock = Arc::new(ManualClock::default());
        let monitor = monitor_with(clock, 100);
        assert!(monitor.sample("ghost").is_err());
        assert!(monitor.assess("ghost").is_err());
    }

    #[test]
    fn test_assess_does_not_publish() {
        let clock = Arc::new(ManualClock::default());
        let monitor = monitor_with(clock.clone(), 100);
        monitor.observe(&outcome("a", false, 100, clock.now()));

        let assessed = monitor.assess("a").unwrap();
        assert_eq!(assessed.sample_size, 1);
        assert!(monitor.latest("a").is_none());

        let sampled = monitor.sample("a").unwrap();
        assert_eq!(sampled, assessed);
        assert_eq!(monitor.latest("a").unwrap().sample_size, 1);
    }

    #[test]
    fn test_replay_rebuilds_windows() {
        let clock = Arc::new(ManualClock::default());
        let monitor = monitor_with(clock.clone(), 100);
        let now = clock.now();

        let log = vec![
            outcome("a", true, 100, now),
            outcome("a", false, 100, now),
            outcome("b", true, 100, now),
        ];
        monitor.observe(&outcome("a", false, 100, now));

        let snapshots = monitor.replay(&log);
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].agent_id, "a");
        assert_eq!(snapshots[0].sample_size, 2);
        assert!((snapshots[0].success_rate - 0.5).abs() < 1e-9);
    }
}
