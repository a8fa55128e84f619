//! Health and metrics probe server
//!
//! Small HTTP surface for operators and container orchestration: overall
//! status, per-agent health, circuit states, metrics and the usual
//! readiness/liveness probes.

use crate::circuit_breaker::CircuitState;
use crate::service::RoutingService;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::http::StatusCode;
use warp::Filter;

/// HTTP probe server over a running routing service
#[derive(Debug)]
pub struct HealthServer {
    service: Arc<RoutingService>,
    port: u16,
    ready: AtomicBool,
}

impl HealthServer {
    pub fn new(service: Arc<RoutingService>, port: u16) -> Self {
        Self {
            service,
            port,
            ready: AtomicBool::new(false),
        }
    }

    /// Flip readiness once startup has finished, or back during shutdown
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed) && self.service.registry().agent_count() > 0
    }

    /// All probe routes, usable with `warp::serve` or `warp::test`
    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let with_server = {
            let server = Arc::clone(self);
            warp::any().map(move || Arc::clone(&server))
        };

        // GET /health - overall status with individual checks
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .and_then(|server: Arc<HealthServer>| async move {
                let status = server.health_status();
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            });

        // GET /health/agents - fresh snapshot per registered agent
        let agents_route = warp::path!("health" / "agents")
            .and(warp::get())
            .and(with_server.clone())
            .and_then(|server: Arc<HealthServer>| async move {
                let reply = match server.service.get_health(None) {
                    Ok(snapshots) => {
                        warp::reply::with_status(warp::reply::json(&snapshots), StatusCode::OK)
                    }
                    Err(e) => warp::reply::with_status(
                        warp::reply::json(&ErrorResponse {
                            error: e.public_message(),
                            timestamp: current_timestamp(),
                        }),
                        StatusCode::INTERNAL_SERVER_ERROR,
                    ),
                };
                Ok::<_, Infallible>(reply)
            });

        // GET /circuits - breaker state per agent
        let circuits_route = warp::path("circuits")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .and_then(|server: Arc<HealthServer>| async move {
                Ok::<_, Infallible>(warp::reply::json(&server.service.circuit_states()))
            });

        // GET /metrics - counters, decision latency and learning state
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .and_then(|server: Arc<HealthServer>| async move {
                Ok::<_, Infallible>(warp::reply::json(&server.service.metrics()))
            });

        // GET /ready - readiness probe
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .and_then(|server: Arc<HealthServer>| async move {
                let ready = server.is_ready();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
            });

        // GET /live - liveness probe
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(|| async move {
                Ok::<_, Infallible>(warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                }))
            });

        // GET / - endpoint listing
        let root_route = warp::path::end().and(warp::get()).and_then(|| async move {
            let endpoints: BTreeMap<&str, &str> = [
                ("/health", "Overall status with individual checks"),
                ("/health/agents", "Health snapshot per registered agent"),
                ("/circuits", "Circuit breaker state per agent"),
                ("/metrics", "Routing, outcome and learning metrics"),
                ("/ready", "Readiness probe"),
                ("/live", "Liveness probe"),
            ]
            .into_iter()
            .collect();
            Ok::<_, Infallible>(warp::reply::json(&endpoints))
        });

        agents_route
            .or(health_route)
            .or(circuits_route)
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route)
    }

    /// Serve until the task is aborted
    pub async fn start(self: Arc<Self>) {
        let routes = self.routes();
        tracing::info!(port = self.port, "Starting health server");
        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;
    }

    fn health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let mut checks = BTreeMap::new();

        let agent_count = self.service.registry().agent_count();
        checks.insert(
            "agents".to_string(),
            if agent_count > 0 {
                HealthCheck::healthy(format!("{agent_count} agent(s) registered"), now)
            } else {
                HealthCheck::unhealthy("no agents registered".to_string(), now)
            },
        );

        let circuits = self.service.circuit_states();
        let open = circuits
            .iter()
            .filter(|c| c.state == CircuitState::Open)
            .count();
        checks.insert(
            "circuits".to_string(),
            if agent_count > 0 && open >= agent_count {
                HealthCheck::unhealthy(format!("all {open} circuit(s) open"), now)
            } else {
                HealthCheck::healthy(format!("{open} circuit(s) open"), now)
            },
        );

        let pending = self.service.pending_outcomes();
        checks.insert(
            "outcome_store".to_string(),
            if pending == 0 {
                HealthCheck::healthy("all outcomes persisted".to_string(), now)
            } else {
                HealthCheck::unhealthy(format!("{pending} outcome(s) awaiting persistence"), now)
            },
        );

        let healthy = checks.values().all(|check| check.status == "healthy");
        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            service: self.service.config().service.name.clone(),
            uptime_seconds: self.service.metrics().uptime_seconds,
            checks,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    fn healthy(message: String, now: u64) -> Self {
        Self {
            status: "healthy".to_string(),
            message: Some(message),
            last_check: now,
        }
    }

    fn unhealthy(message: String, now: u64) -> Self {
        Self {
            status: "unhealthy".to_string(),
            message: Some(message),
            last_check: now,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    service: String,
    uptime_seconds: u64,
    checks: BTreeMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
