//! Agent health tracking
//!
//! Snapshots are derived from each agent's recent outcome window and published by
//! replacing an `Arc`, so readers always see a fully formed snapshot.

pub mod monitor;

pub use monitor::{HealthMonitor, InFlightGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discretized utilization relative to declared capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadLevel {
    Idle,
    Low,
    Moderate,
    High,
    Saturated,
}

/// Utilization below which an agent is `Low`
pub const LOW_LOAD_THRESHOLD: f64 = 0.25;
/// Utilization below which an agent is `Moderate`
pub const MODERATE_LOAD_THRESHOLD: f64 = 0.60;
/// Utilization below which an agent is `High`; at or above it is `Saturated`
pub const HIGH_LOAD_THRESHOLD: f64 = 0.90;

impl LoadLevel {
    /// Map active requests over capacity onto the five buckets
    pub fn from_utilization(active_requests: u32, capacity: u32) -> Self {
        if active_requests == 0 {
            return LoadLevel::Idle;
        }
        let ratio = f64::from(active_requests) / f64::from(capacity.max(1));
        if ratio < LOW_LOAD_THRESHOLD {
            LoadLevel::Low
        } else if ratio < MODERATE_LOAD_THRESHOLD {
            LoadLevel::Moderate
        } else if ratio < HIGH_LOAD_THRESHOLD {
            LoadLevel::High
        } else {
            LoadLevel::Saturated
        }
    }
}

/// Point-in-time health measurement for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub agent_id: String,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub active_requests: u32,
    pub load_level: LoadLevel,
    /// 0.0 to 1.0, higher means more likely to fail soon
    pub failure_score: f64,
    /// Error rate of the newer half of the window minus the older half
    pub error_trend: f64,
    /// Outcomes the snapshot was computed from
    pub sample_size: usize,
    pub sampled_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Snapshot for an agent without recent outcomes
    pub fn neutral<S: Into<String>>(agent_id: S, active_requests: u32, now: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.into(),
            p50_latency_ms: 0.0,
            p95_latency_ms: 0.0,
            success_rate: 1.0,
            error_rate: 0.0,
            active_requests,
            load_level: LoadLevel::Idle,
            failure_score: 0.0,
            error_trend: 0.0,
            sample_size: 0,
            sampled_at: now,
        }
    }
}

/// Interpolated percentile over ascending data; 0.0 for empty input
pub fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
