//! Supervision scenarios: crash requeue, idempotent stop, heartbeat
//! loss.

mod common;

use std::time::Duration;

use apiary::domain::models::{AgentSpec, AgentStatus, AgentType, TaskSpec, TaskStatus};
use apiary::services::EventPayload;

use common::{build_harness, test_config, wait_until, AgentBehavior};

#[tokio::test]
async fn crash_mid_task_requeues_with_higher_attempt_count() {
    let mut config = test_config();
    config.process.restart_on_crash = true;
    config.process.max_restarts = 5;
    config.coordinator.max_task_retries = 3;
    let h = build_harness(AgentBehavior::CrashOnTask, config).await;

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

    let task_id = h
        .coordinator
        .submit_task(TaskSpec::new("echo", "doomed work"))
        .await
        .unwrap();

    // Every attempt crashes the agent; the restart policy brings it
    // back until the task's retry budget runs out.
    assert!(
        wait_until(Duration::from_secs(10), || async {
            h.coordinator.get_task(task_id).await.unwrap().is_terminal()
        })
        .await,
        "task never reached a terminal state"
    );

    let task = h.coordinator.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(
        task.attempt_count >= 2,
        "expected at least two attempts, saw {}",
        task.attempt_count
    );
    // The same agent was respawned at least once.
    assert!(h.runner.spawn_count() >= 2);
}

#[tokio::test]
async fn stop_agent_is_idempotent() {
    let h = build_harness(AgentBehavior::Echo { complete_after_ms: 0 }, test_config()).await;
    let mut events = h.bus.subscribe();

    let agent_id = h
        .coordinator
        .register_agent(AgentSpec::new(AgentType::Tester))
        .await
        .expect("register");
    assert!(
        wait_until(Duration::from_secs(2), || async {
            h.coordinator.get_agent(agent_id).await.unwrap().status == AgentStatus::Idle
        })
        .await
    );

    // Both calls succeed regardless of how far the first has progressed.
    h.coordinator.stop_agent(agent_id, true, None).await.expect("first stop");
    h.coordinator.stop_agent(agent_id, true, None).await.expect("second stop");

    assert!(
        wait_until(Duration::from_secs(2), || async {
            h.coordinator.get_agent(agent_id).await.unwrap().status == AgentStatus::Stopped
        })
        .await
    );
    let agent = h.coordinator.get_agent(agent_id).await.unwrap();
    assert_eq!(agent.pid, None);

    // A stop after full shutdown is still a success.
    h.coordinator.stop_agent(agent_id, true, None).await.expect("third stop");

    // Exactly one stopped transition was observed.
    let mut stopped_events = 0;
    while let Ok(event) = events.try_recv() {
        if let EventPayload::AgentStatusChanged { agent_id: id, to: AgentStatus::Stopped, .. } =
            event.payload
        {
            if id == agent_id {
                stopped_events += 1;
            }
        }
    }
    assert_eq!(stopped_events, 1);
}

#[tokio::test]
async fn silent_agent_is_reaped_after_grace_window() {
    let mut config = test_config();
    config.process.start_grace_ms = 200;
    config.process.restart_on_crash = false;
    let h = build_harness(AgentBehavior::Silent, config).await;

    let agent_id = h
        .coordinator
        .register_agent(AgentSpec::new(AgentType::Monitor))
        .await
        .expect("register");

    // No heartbeat ever arrives; the watcher kills the process after
    // the grace window and the agent is retired.
    assert!(
        wait_until(Duration::from_secs(3), || async {
            h.coordinator.get_agent(agent_id).await.unwrap().status == AgentStatus::Stopped
        })
        .await,
        "silent agent was never reaped"
    );
    let agent = h.coordinator.get_agent(agent_id).await.unwrap();
    assert_eq!(agent.pid, None);
    assert!(agent.assigned_tasks.is_empty());
}

#[tokio::test]
async fn crashed_agent_restarts_and_recovers() {
    let mut config = test_config();
    config.process.restart_on_crash = true;
    config.process.max_restarts = 3;
    let h = build_harness(AgentBehavior::CrashOnTask, config).await;

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

    h.coordinator
        .submit_task(TaskSpec::new("echo", "trigger crash"))
        .await
        .unwrap();

    // After the crash the same agent record comes back through
    // starting into idle with its restart counted.
    assert!(
        wait_until(Duration::from_secs(5), || async {
            let agent = h.coordinator.get_agent(agent_id).await.unwrap();
            agent.restart_count >= 1 && h.runner.spawn_count() >= 2
        })
        .await,
        "agent never restarted"
    );
}
