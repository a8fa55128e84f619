//! Thread-safe metrics collection
//!
//! Atomic counters for high-frequency routing events and mutex-protected
//! collections for timing data and per-agent statistics. The collector is owned
//! by the routing service and shared by `Arc`; there is no global instance.

use crate::circuit_breaker::CircuitState;
use crate::health::percentile;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Bound on retained timing samples
const MAX_TIMING_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
#[derive(Debug)]
pub struct MetricsCollector {
    // Routing metrics (atomic for high frequency)
    routes_requested: AtomicU64,
    routes_succeeded: AtomicU64,
    routes_failed: AtomicU64,
    routes_timed_out: AtomicU64,
    no_eligible_agent: AtomicU64,
    fallbacks_used: AtomicU64,

    // Outcome metrics
    outcomes_recorded: AtomicU64,
    outcomes_duplicate: AtomicU64,
    persistence_failures: AtomicU64,
    pending_outcomes: AtomicU64,

    // Learning metrics
    weight_recomputations: AtomicU64,
    weight_version: AtomicU64,

    // Decision times in microseconds (mutex protected for complex operations)
    decision_times_us: Mutex<Vec<u64>>,

    // Per-agent dispatch statistics
    dispatch_stats: Mutex<HashMap<String, DispatchStats>>,

    // Circuit transitions keyed by "from->to"
    circuit_transitions: Mutex<BTreeMap<String, u64>>,

    started_at: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            routes_requested: AtomicU64::new(0),
            routes_succeeded: AtomicU64::new(0),
            routes_failed: AtomicU64::new(0),
            routes_timed_out: AtomicU64::new(0),
            no_eligible_agent: AtomicU64::new(0),
            fallbacks_used: AtomicU64::new(0),
            outcomes_recorded: AtomicU64::new(0),
            outcomes_duplicate: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            pending_outcomes: AtomicU64::new(0),
            weight_recomputations: AtomicU64::new(0),
            weight_version: AtomicU64::new(0),
            decision_times_us: Mutex::new(Vec::new()),
            dispatch_stats: Mutex::new(HashMap::new()),
            circuit_transitions: Mutex::new(BTreeMap::new()),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    // Routing metrics
    pub fn route_requested(&self) {
        self.routes_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn route_succeeded(&self, fallback_used: bool) {
        self.routes_succeeded.fetch_add(1, Ordering::Relaxed);
        if fallback_used {
            self.fallbacks_used.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn route_failed(&self) {
        self.routes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn route_timed_out(&self) {
        self.routes_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn no_eligible_agent(&self) {
        self.no_eligible_agent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent deciding, dispatch excluded
    pub fn decision_time(&self, duration: Duration) {
        if let Ok(mut times) = self.decision_times_us.lock() {
            times.push(duration.as_micros() as u64);

            if times.len() > MAX_TIMING_SAMPLES {
                times.remove(0);
            }
        }
    }

    // Dispatch metrics
    pub fn dispatch_completed(&self, agent_id: &str, duration: Duration, success: bool) {
        if let Ok(mut stats) = self.dispatch_stats.lock() {
            let entry = stats
                .entry(agent_id.to_string())
                .or_insert_with(|| DispatchStats::new(agent_id));
            entry.dispatches += 1;
            if !success {
                entry.failures += 1;
            }
            entry.dispatch_times.push(duration.as_millis() as u64);
            if entry.dispatch_times.len() > MAX_TIMING_SAMPLES {
                entry.dispatch_times.remove(0);
            }
            entry.last_dispatch = current_timestamp();
        }
    }

    pub fn dispatch_skipped(&self, agent_id: &str) {
        if let Ok(mut stats) = self.dispatch_stats.lock() {
            stats
                .entry(agent_id.to_string())
                .or_insert_with(|| DispatchStats::new(agent_id))
                .skipped += 1;
        }
    }

    // Circuit metrics
    pub fn circuit_transition(&self, from: CircuitState, to: CircuitState) {
        if let Ok(mut transitions) = self.circuit_transitions.lock() {
            *transitions.entry(format!("{from}->{to}")).or_insert(0) += 1;
        }
    }

    // Outcome metrics
    pub fn outcome_recorded(&self) {
        self.outcomes_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outcome_duplicate(&self) {
        self.outcomes_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_pending_outcomes(&self, pending: usize) {
        self.pending_outcomes.store(pending as u64, Ordering::Relaxed);
    }

    // Learning metrics
    pub fn weights_recomputed(&self, version: u64) {
        self.weight_recomputations.fetch_add(1, Ordering::Relaxed);
        self.weight_version.store(version, Ordering::Relaxed);
    }

    fn decision_time_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.decision_times_us.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted = times.clone();
        sorted.sort_unstable();

        let to_ms = |us: f64| us / 1000.0;
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            to_ms(avg),
            to_ms(percentile(&sorted, 50.0)),
            to_ms(percentile(&sorted, 95.0)),
            to_ms(percentile(&sorted, 99.0)),
        )
    }

    fn dispatch_snapshots(&self) -> BTreeMap<String, DispatchStatsSnapshot> {
        let Ok(stats) = self.dispatch_stats.lock() else {
            return BTreeMap::new();
        };
        stats
            .iter()
            .map(|(id, s)| (id.clone(), s.snapshot()))
            .collect()
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95, p99) = self.decision_time_statistics();
        let circuit_transitions = self
            .circuit_transitions
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default();

        MetricsSnapshot {
            routing: RoutingMetrics {
                routes_requested: self.routes_requested.load(Ordering::Relaxed),
                routes_succeeded: self.routes_succeeded.load(Ordering::Relaxed),
                routes_failed: self.routes_failed.load(Ordering::Relaxed),
                routes_timed_out: self.routes_timed_out.load(Ordering::Relaxed),
                no_eligible_agent: self.no_eligible_agent.load(Ordering::Relaxed),
                fallbacks_used: self.fallbacks_used.load(Ordering::Relaxed),
                avg_decision_time_ms: avg,
                decision_time_p50_ms: p50,
                decision_time_p95_ms: p95,
                decision_time_p99_ms: p99,
            },
            outcomes: OutcomeMetrics {
                recorded: self.outcomes_recorded.load(Ordering::Relaxed),
                duplicates: self.outcomes_duplicate.load(Ordering::Relaxed),
                persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
                pending: self.pending_outcomes.load(Ordering::Relaxed),
            },
            learning: LearningMetrics {
                weight_recomputations: self.weight_recomputations.load(Ordering::Relaxed),
                weight_version: self.weight_version.load(Ordering::Relaxed),
            },
            agents: self.dispatch_snapshots(),
            circuit_transitions,
            uptime_seconds: now.saturating_sub(self.started_at.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.routes_requested,
            &self.routes_succeeded,
            &self.routes_failed,
            &self.routes_timed_out,
            &self.no_eligible_agent,
            &self.fallbacks_used,
            &self.outcomes_recorded,
            &self.outcomes_duplicate,
            &self.persistence_failures,
            &self.pending_outcomes,
            &self.weight_recomputations,
            &self.weight_version,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        if let Ok(mut times) = self.decision_times_us.lock() {
            times.clear();
        }
        if let Ok(mut stats) = self.dispatch_stats.lock() {
            stats.clear();
        }
        if let Ok(mut transitions) = self.circuit_transitions.lock() {
            transitions.clear();
        }
        self.started_at.store(current_timestamp(), Ordering::Relaxed);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Internal dispatch statistics (with timing data)
#[derive(Debug)]
struct DispatchStats {
    agent_id: String,
    dispatches: u64,
    failures: u64,
    skipped: u64,
    dispatch_times: Vec<u64>, // milliseconds
    last_dispatch: u64,
}

impl DispatchStats {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            dispatches: 0,
            failures: 0,
            skipped: 0,
            dispatch_times: Vec::new(),
            last_dispatch: 0,
        }
    }

    fn snapshot(&self) -> DispatchStatsSnapshot {
        let avg_dispatch_time_ms = if self.dispatch_times.is_empty() {
            0.0
        } else {
            self.dispatch_times.iter().sum::<u64>() as f64 / self.dispatch_times.len() as f64
        };

        let success_rate = if self.dispatches == 0 {
            0.0
        } else {
            (self.dispatches - self.failures) as f64 / self.dispatches as f64
        };

        DispatchStatsSnapshot {
            agent_id: self.agent_id.clone(),
            dispatches: self.dispatches,
            failures: self.failures,
            skipped: self.skipped,
            avg_dispatch_time_ms,
            last_dispatch: self.last_dispatch,
            success_rate,
        }
    }
}

// Public metrics structures
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub routing: RoutingMetrics,
    pub outcomes: OutcomeMetrics,
    pub learning: LearningMetrics,
    pub agents: BTreeMap<String, DispatchStatsSnapshot>,
    pub circuit_transitions: BTreeMap<String, u64>,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingMetrics {
    pub routes_requested: u64,
    pub routes_succeeded: u64,
    pub routes_failed: u64,
    pub routes_timed_out: u64,
    pub no_eligible_agent: u64,
    pub fallbacks_used: u64,
    pub avg_decision_time_ms: f64,
    pub decision_time_p50_ms: f64,
    pub decision_time_p95_ms: f64,
    pub decision_time_p99_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutcomeMetrics {
    pub recorded: u64,
    pub duplicates: u64,
    pub persistence_failures: u64,
    pub pending: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LearningMetrics {
    pub weight_recomputations: u64,
    pub weight_version: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchStatsSnapshot {
    pub agent_id: String,
    pub dispatches: u64,
    pub failures: u64,
    pub skipped: u64,
    pub avg_dispatch_time_ms: f64,
    pub last_dispatch: u64,
    pub success_rate: f64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_routing_metrics() {
        let collector = MetricsCollector::new();

        collector.route_requested();
        collector.route_requested();
        collector.route_succeeded(true);
        collector.route_failed();
        collector.decision_time(Duration::from_micros(1500));

        let metrics = collector.get_metrics();
        assert_eq!(metrics.routing.routes_requested, 2);
        assert_eq!(metrics.routing.routes_succeeded, 1);
        assert_eq!(metrics.routing.routes_failed, 1);
        assert_eq!(metrics.routing.fallbacks_used, 1);
        assert!((metrics.routing.avg_decision_time_ms - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_dispatch_stats() {
        let collector = MetricsCollector::new();

        collector.dispatch_completed("a", Duration::from_millis(500), true);
        collector.dispatch_completed("a", Duration::from_millis(300), false);
        collector.dispatch_skipped("a");

        let metrics = collector.get_metrics();
        let stats = metrics.agents.get("a").unwrap();
        assert_eq!(stats.dispatches, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.success_rate, 0.5);
        assert_eq!(stats.avg_dispatch_time_ms, 400.0);
    }

    #[test]
    fn test_circuit_transitions_counted() {
        let collector = MetricsCollector::new();

        collector.circuit_transition(CircuitState::Closed, CircuitState::Open);
        collector.circuit_transition(CircuitState::Closed, CircuitState::Open);
        collector.circuit_transition(CircuitState::Open, CircuitState::HalfOpen);

        let metrics = collector.get_metrics();
        assert_eq!(metrics.circuit_transitions.get("closed->open"), Some(&2));
        assert_eq!(metrics.circuit_transitions.get("open->half_open"), Some(&1));
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let mut handles = vec![];

        for _ in 0..10 {
            let collector_clone = Arc::clone(&collector);
            let handle = thread::spawn(move || {
                for _ in 0..100 {
                    collector_clone.route_requested();
                    collector_clone.outcome_recorded();
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.routing.routes_requested, 1000);
        assert_eq!(metrics.outcomes.recorded, 1000);
    }

    #[test]
    fn test_decision_times_are_bounded() {
        let collector = MetricsCollector::new();

        for i in 0..1500 {
            collector.decision_time(Duration::from_micros(i));
        }

        let len = collector.decision_times_us.lock().unwrap().len();
        assert_eq!(len, MAX_TIMING_SAMPLES);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.route_requested();
        collector.weights_recomputed(4);
        collector.dispatch_completed("a", Duration::from_millis(100), true);

        assert_eq!(collector.get_metrics().learning.weight_version, 4);

        collector.reset();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.routing.routes_requested, 0);
        assert_eq!(metrics.learning.weight_version, 0);
        assert!(metrics.agents.is_empty());
    }
}
