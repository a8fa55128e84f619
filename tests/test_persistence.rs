//! Persistence and restart behavior
//!
//! Uses a JSON-lines store in a temporary directory to check that agents,
//! breaker states and the outcome log survive a restart, that outcomes
//! written while the store is down are buffered and flushed later, and that
//! the append-only files are compacted across restarts.


use betty_router::circuit_breaker::CircuitState;
use betty_router::health::HealthSnapshot;
use betty_router::storage::{read_outcome_log, JsonlStore, RoutingStore};
use betty_router::testing::{FlakyStore, ManualClock, MockDispatcher};
use betty_router::{Agent, Clock, ExecutionOutcome};
use std::sync::Arc;
use tempfile::TempDir;
use test_helpers::*;

async fn jsonl_store(dir: &TempDir) -> Arc<JsonlStore> {
    Arc::new(JsonlStore::open(dir.path()).await.unwrap())
}

#[tokio::test]
async fn test_jsonl_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());

    {
        let service = build_service(
            test_config(vec![analyzer("agent-a", 5)]),
            jsonl_store(&dir).await,
            clock.clone(),
            Arc::new(MockDispatcher::new()),
        )
        .await;
        service
            .register_agent(analyzer("agent-z", 3))
            .await
            .unwrap();
        record_history(&service, &clock, "agent-z", 2, 5).await;
        service.shutdown().await;
    }

    let store = jsonl_store(&dir).await;
    assert_eq!(store.load_outcomes().await.unwrap().len(), 7);

    let restarted = build_service(
        test_config(vec![analyzer("agent-a", 5)]),
        store,
        clock.clone(),
        Arc::new(MockDispatcher::new()),
    )
    .await;

    // Runtime registration was persisted, config agent was seeded again
    assert_eq!(restarted.registry().agent_count(), 2);
    assert_eq!(restarted.registry().get_agent("agent-z").unwrap().cost_cents(), 3);

    let states = restarted.circuit_states();
    let z = states.iter().find(|s| s.agent_id == "agent-z").unwrap();
    assert_eq!(z.state, CircuitState::Open);

    let health = restarted.get_health(Some("agent-z")).unwrap();
    assert_eq!(health[0].sample_size, 7);

    // Selection avoids the agent whose circuit was open before the restart
    let selection = restarted.select_agent(&code_analysis_task()).selection.unwrap();
    assert_eq!(selection.agent_id, "agent-a");
}

#[tokio::test]
async fn test_outcome_log_is_readable_for_replay() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let service = build_service(
        test_config(vec![analyzer("agent-a", 5)]),
        jsonl_store(&dir).await,
        clock.clone(),
        Arc::new(MockDispatcher::new()),
    )
    .await;

    let result = service.route(&code_analysis_task(), None).await;
    assert!(result.success);
    record_history(&service, &clock, "agent-a", 1, 1).await;

    let outcomes = read_outcome_log(dir.path().join("outcomes.jsonl")).await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert_eq!(
        outcomes[0].correlation_id,
        format!("{}:0", result.request_id)
    );
    assert!(outcomes[0].success);
    assert!(!outcomes[2].success);

    assert!(read_outcome_log(dir.path().join("missing.jsonl")).await.is_err());
}

#[tokio::test]
async fn test_outcomes_buffer_while_store_is_down() {
    let store = Arc::new(FlakyStore::new());
    let clock = Arc::new(ManualClock::default());
    let service = build_service(
        test_config(vec![analyzer("agent-a", 5)]),
        store.clone(),
        clock.clone(),
        Arc::new(MockDispatcher::new()),
    )
    .await;

    store.set_failing(true);
    let outcome = ExecutionOutcome::new("down-1", "agent-a", "code_analysis", false, clock.now());
    let ack = service.record_outcome(outcome).await.unwrap();
    assert!(!ack.duplicate);
    assert!(!ack.persisted);
    assert_eq!(service.pending_outcomes(), 1);
    assert_eq!(store.outcome_count(), 0);

    // Live state already reflects the outcome
    assert_eq!(service.get_health(Some("agent-a")).unwrap()[0].sample_size, 1);

    store.set_failing(false);
    service.shutdown().await;
    assert_eq!(service.pending_outcomes(), 0);
    assert_eq!(store.outcome_count(), 1);
}

#[tokio::test]
async fn test_removed_agent_stays_removed() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    {
        let service = build_service(
            test_config(Vec::new()),
            jsonl_store(&dir).await,
            clock.clone(),
            Arc::new(MockDispatcher::new()),
        )
        .await;
        service
            .register_agent(Agent::new("temp", "Temporary").with_capabilities(["search"]))
            .await
            .unwrap();
        service.remove_agent("temp").await.unwrap();
    }

    let restarted = build_service(
        test_config(Vec::new()),
        jsonl_store(&dir).await,
        clock,
        Arc::new(MockDispatcher::new()),
    )
    .await;
    assert_eq!(restarted.registry().agent_count(), 0);
}

async fn line_count(dir: &TempDir, name: &str) -> usize {
    tokio::fs::read_to_string(dir.path().join(name))
        .await
        .unwrap()
        .lines()
        .count()
}

#[tokio::test]
async fn test_breaker_file_is_compacted_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let service = build_service(
        test_config(vec![analyzer("agent-a", 5), analyzer("agent-b", 9)]),
        jsonl_store(&dir).await,
        clock.clone(),
        Arc::new(MockDispatcher::new()),
    )
    .await;

    for _ in 0..3 {
        record_history(&service, &clock, "agent-a", 0, 5).await;
        service.reset_circuit_breaker("agent-a").await.unwrap();
    }
    record_history(&service, &clock, "agent-b", 1, 0).await;
    assert!(line_count(&dir, "breakers.jsonl").await > 2);

    service.shutdown().await;

    // One current state per agent, outcome log untouched
    assert_eq!(line_count(&dir, "breakers.jsonl").await, 2);
    assert_eq!(line_count(&dir, "outcomes.jsonl").await, 16);
    let states = jsonl_store(&dir).await.load_breaker_states().await.unwrap();
    assert!(states.iter().all(|s| s.state == CircuitState::Closed));
}

#[tokio::test]
async fn test_stale_snapshots_are_dropped_on_startup() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let now = clock.now();
    let store = jsonl_store(&dir).await;
    store
        .save_snapshot(&HealthSnapshot::neutral("agent-a", 0, now - chrono::Duration::days(30)))
        .await
        .unwrap();
    store
        .save_snapshot(&HealthSnapshot::neutral("agent-a", 0, now - chrono::Duration::hours(2)))
        .await
        .unwrap();

    let mut config = test_config(vec![analyzer("agent-a", 5)]);
    config.storage.snapshot_retention_hours = 24;
    let service = build_service(config, store, clock.clone(), Arc::new(MockDispatcher::new())).await;

    assert_eq!(line_count(&dir, "snapshots.jsonl").await, 1);
    let history = service
        .health_history("agent-a", now - chrono::Duration::days(60))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].sampled_at, now - chrono::Duration::hours(2));
}
