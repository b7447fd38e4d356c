//! Metrics collector against the live coordinator.

mod common;

use std::time::Duration;

use apiary::domain::models::{AgentSpec, AgentStatus, AgentType, TaskSpec, TaskStatus};

use common::{build_harness, test_config, wait_until, AgentBehavior};

#[tokio::test]
async fn samples_reflect_coordinator_counts() {
    let h = build_harness(AgentBehavior::Echo { complete_after_ms: 30 }, test_config()).await;

    let agent_id = h
        .coordinator
        .register_agent(AgentSpec::new(AgentType::General))
        .await
        .expect("register");
    assert!(
        wait_until(Duration::from_secs(2), || async {
            h.coordinator.get_agent(agent_id).await.unwrap().status == AgentStatus::Idle
        })
        .await
    );

    let sample = h.collector.sample_once().await;
    assert_eq!(sample.active_agents, 1);
    assert_eq!(sample.idle_agents, 1);
    assert_eq!(sample.queue_len, 0);
    assert_eq!(h.ring.len().await, 1);

    // Completed work shows up in latency and error-rate derivations.
    let task_id = h
        .coordinator
        .submit_task(TaskSpec::new("echo", "measured"))
        .await
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(3), || async {
            h.coordinator.get_task(task_id).await.unwrap().status == TaskStatus::Completed
        })
        .await
    );

    let sample = h.collector.sample_once().await;
    assert_eq!(sample.queue_len, 0);
    assert!(sample.error_rate_pct.abs() < f64::EPSILON);
    assert_eq!(h.ring.len().await, 2);

    // Samples arrive in non-decreasing timestamp order.
    let snapshot = h.ring.snapshot().await;
    assert!(snapshot.windows(2).all(|w| w[0].ts <= w[1].ts));
}

#[tokio::test]
async fn queue_length_counts_pending_and_running() {
    let h = build_harness(AgentBehavior::Echo { complete_after_ms: 0 }, test_config()).await;

    // No agents: everything queues.
    for i in 0..3 {
        h.coordinator
            .submit_task(TaskSpec::new("echo", format!("queued {i}")))
            .await
            .unwrap();
    }
    let sample = h.collector.sample_once().await;
    assert_eq!(sample.queue_len, 3);
    assert_eq!(sample.active_agents, 0);
}
