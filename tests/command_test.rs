//! Command-port contract: every console command maps to control-plane
//! effects and stable error codes.

mod common;

use std::time::Duration;

use serde_json::json;

use apiary::domain::models::{AgentStatus, TaskStatus};
use apiary::domain::ports::CommandExecutor;

use common::{build_harness, test_config, wait_until, AgentBehavior};

#[tokio::test]
async fn agent_commands_full_cycle() {
    let h = build_harness(AgentBehavior::Echo { complete_after_ms: 0 }, test_config()).await;

    let spawned = h
        .executor
        .execute("agent spawn --type coder --name builder --cap rust")
        .await
        .expect("spawn");
    let agent_id = spawned["agent_id"].as_str().unwrap().parse().unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || async {
            h.coordinator.get_agent(agent_id).await.unwrap().status == AgentStatus::Idle
        })
        .await
    );

    let listed = h.executor.execute("agent list --type coder").await.unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["name"], "builder");

    let empty = h.executor.execute("agent list --type tester").await.unwrap();
    assert!(empty.as_array().unwrap().is_empty());

    h.executor
        .execute(&format!("agent stop {agent_id}"))
        .await
        .expect("stop");
    assert!(
        wait_until(Duration::from_secs(2), || async {
            h.coordinator.get_agent(agent_id).await.unwrap().status == AgentStatus::Stopped
        })
        .await
    );

    h.executor
        .execute(&format!("agent remove {agent_id}"))
        .await
        .expect("remove");
    assert!(h.coordinator.get_agent(agent_id).await.is_none());

    let err = h
        .executor
        .execute(&format!("agent stop {agent_id}"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn invalid_agent_type_is_rejected() {
    let h = build_harness(AgentBehavior::Echo { complete_after_ms: 0 }, test_config()).await;
    let err = h
        .executor
        .execute("agent spawn --type warlock")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid");
}

#[tokio::test]
async fn task_commands_full_cycle() {
    let h = build_harness(AgentBehavior::Echo { complete_after_ms: 20 }, test_config()).await;
    h.executor
        .execute("agent spawn --type general")
        .await
        .expect("spawn");

    let submitted = h
        .executor
        .execute(r#"task submit --type echo --description 'integration work' --priority 7 --input '"ping"'"#)
        .await
        .expect("submit");
    let task_id: uuid::Uuid = submitted["task_id"].as_str().unwrap().parse().unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || async {
            h.coordinator.get_task(task_id).await.unwrap().status == TaskStatus::Completed
        })
        .await
    );

    let shown = h
        .executor
        .execute(&format!("task show {task_id}"))
        .await
        .unwrap();
    assert_eq!(shown["priority"], 7);
    assert_eq!(shown["result"], json!("ping"));

    let completed = h
        .executor
        .execute("task list --status completed")
        .await
        .unwrap();
    assert_eq!(completed.as_array().unwrap().len(), 1);

    // Cancelling a terminal task surfaces the conflict code.
    let err = h
        .executor
        .execute(&format!("task cancel {task_id}"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_transition");
}

#[tokio::test]
async fn swarm_commands() {
    let h = build_harness(AgentBehavior::Echo { complete_after_ms: 0 }, test_config()).await;

    let created = h
        .executor
        .execute("swarm create --name hive --agents 2 --mode mesh --strategy auto")
        .await
        .expect("create");
    let swarm_id = created["swarm_id"].as_str().unwrap();

    let status = h
        .executor
        .execute(&format!("swarm status {swarm_id}"))
        .await
        .unwrap();
    assert_eq!(status["name"], "hive");
    assert_eq!(status["mode"], "mesh");
    assert_eq!(status["agent_ids"].as_array().unwrap().len(), 2);

    let err = h
        .executor
        .execute(&format!("swarm status {}", uuid::Uuid::new_v4()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");

    let scaled = h
        .executor
        .execute(&format!("swarm scale {swarm_id} --target 3"))
        .await
        .expect("scale");
    assert_eq!(scaled["to"], 3);
}

#[tokio::test]
async fn scale_policy_and_manual_scaling() {
    let h = build_harness(AgentBehavior::Echo { complete_after_ms: 0 }, test_config()).await;

    h.executor
        .execute("scale policy set --name ops --min 1 --max 4 --target 70 --up 85 --down 50 --cooldown 120")
        .await
        .expect("policy set");
    let policy = h.executor.execute("scale policy").await.unwrap();
    assert_eq!(policy["name"], "ops");
    assert_eq!(policy["max_agents"], 4);

    // Thresholds violating the hysteresis band never get adopted.
    let err = h
        .executor
        .execute("scale policy set --down 90")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_policy");

    h.executor.execute("scale up 2").await.expect("scale up");
    assert_eq!(h.coordinator.active_agent_count().await, 2);

    let actions = h.executor.execute("scale actions").await.unwrap();
    assert_eq!(actions.as_array().unwrap().len(), 2);

    let status = h.executor.execute("status").await.unwrap();
    assert_eq!(status["agents_total"], 2);
}

#[tokio::test]
async fn memory_commands() {
    let h = build_harness(AgentBehavior::Echo { complete_after_ms: 0 }, test_config()).await;

    h.executor
        .execute(r#"memory store greeting '"hello world"'"#)
        .await
        .expect("store");
    h.executor
        .execute("memory store counter 41 --namespace metrics")
        .await
        .expect("store namespaced");

    let found = h.executor.execute("memory query greet").await.unwrap();
    assert_eq!(found.as_array().unwrap().len(), 1);
    assert_eq!(found[0]["value"], json!("hello world"));

    // Namespaces are isolated.
    let empty = h.executor.execute("memory query counter").await.unwrap();
    assert!(empty.as_array().unwrap().is_empty());
    let metrics = h
        .executor
        .execute("memory query counter --namespace metrics")
        .await
        .unwrap();
    assert_eq!(metrics[0]["value"], json!(41));

    let deleted = h.executor.execute("memory delete greeting").await.unwrap();
    assert_eq!(deleted["deleted"], true);
    let deleted = h.executor.execute("memory delete greeting").await.unwrap();
    assert_eq!(deleted["deleted"], false);
}

#[tokio::test]
async fn unknown_commands_are_invalid() {
    let h = build_harness(AgentBehavior::Echo { complete_after_ms: 0 }, test_config()).await;
    let err = h.executor.execute("frobnicate now").await.unwrap_err();
    assert_eq!(err.code(), "invalid");
    let err = h.executor.execute("").await.unwrap_err();
    assert_eq!(err.code(), "invalid");
}
