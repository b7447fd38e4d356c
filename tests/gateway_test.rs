//! Console gateway round-trips over a real WebSocket plus the HTTP
//! surface.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message;

use apiary::gateway::{ConnectionRegistry, ConsoleGateway, GatewayState};

use common::{build_harness, test_config, wait_until, AgentBehavior, Harness};

struct GatewayFixture {
    harness: Harness,
    addr: std::net::SocketAddr,
    state: Arc<GatewayState>,
    _gateway: Arc<ConsoleGateway>,
}

async fn start_gateway(auth_token: Option<&str>, max_connections: usize) -> GatewayFixture {
    let harness = build_harness(AgentBehavior::Echo { complete_after_ms: 0 }, test_config()).await;

    let state = Arc::new(GatewayState {
        executor: harness.executor.clone(),
        registry: Arc::new(ConnectionRegistry::new(max_connections)),
        bus: harness.bus.clone(),
        coordinator: harness.coordinator.clone(),
        clock: harness.clock.clone(),
        auth_token: auth_token.map(ToString::to_string),
        command_timeout: Duration::from_secs(5),
        started_at: chrono::Utc::now(),
    });
    let gateway = Arc::new(ConsoleGateway::new(Arc::clone(&state)));

    let (bound_tx, bound_rx) = tokio::sync::oneshot::channel();
    {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            let _ = gateway.serve("127.0.0.1:0", Some(bound_tx)).await;
        });
    }
    let addr = bound_rx.await.expect("gateway bound");

    GatewayFixture {
        harness,
        addr,
        state,
        _gateway: gateway,
    }
}

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(addr: std::net::SocketAddr) -> WsClient {
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("websocket connect");
    socket
}

async fn next_json(socket: &mut WsClient) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).expect("json frame"),
            Message::Close(_) => panic!("connection closed while waiting for frame"),
            _ => continue,
        }
    }
}

async fn send_json(socket: &mut WsClient, value: Value) {
    socket
        .send(Message::Text(value.to_string()))
        .await
        .expect("send frame");
}

#[tokio::test]
async fn command_round_trip_with_authentication() {
    let fixture = start_gateway(Some("secret"), 8).await;
    let mut socket = connect(fixture.addr).await;

    let welcome = next_json(&mut socket).await;
    assert_eq!(welcome["type"], "welcome");
    assert_eq!(welcome["authenticated"], false);

    // Commands before authentication are rejected and execute nothing.
    send_json(
        &mut socket,
        json!({"type": "execute_command", "id": 1, "command": "agent spawn --type coder"}),
    )
    .await;
    let rejected = next_json(&mut socket).await;
    assert_eq!(rejected["type"], "command_error");
    assert_eq!(rejected["error"]["code"], "auth_required");
    assert!(fixture
        .harness
        .coordinator
        .list_agents(&Default::default())
        .await
        .is_empty());

    // Wrong token fails, right token succeeds.
    send_json(&mut socket, json!({"type": "authenticate", "token": "nope"})).await;
    assert_eq!(next_json(&mut socket).await["type"], "auth_failed");

    send_json(&mut socket, json!({"type": "authenticate", "token": "secret"})).await;
    assert_eq!(next_json(&mut socket).await["type"], "auth_success");

    send_json(&mut socket, json!({"type": "ping"})).await;
    let pong = next_json(&mut socket).await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["ts"].is_string());

    send_json(
        &mut socket,
        json!({"type": "execute_command", "id": 42, "command": "agent list"}),
    )
    .await;
    let result = next_json(&mut socket).await;
    assert_eq!(result["type"], "command_result");
    assert_eq!(result["id"], 42);
    assert!(result["result"].as_array().is_some());
}

#[tokio::test]
async fn auth_disabled_marks_clients_authenticated_on_connect() {
    let fixture = start_gateway(None, 8).await;
    let mut socket = connect(fixture.addr).await;

    let welcome = next_json(&mut socket).await;
    assert_eq!(welcome["authenticated"], true);

    send_json(
        &mut socket,
        json!({"type": "execute_command", "id": "a", "command": "status"}),
    )
    .await;
    let result = next_json(&mut socket).await;
    assert_eq!(result["type"], "command_result");
    assert_eq!(result["id"], "a");
}

#[tokio::test]
async fn connection_cap_gets_welcome_then_policy_close() {
    let fixture = start_gateway(None, 1).await;

    let mut first = connect(fixture.addr).await;
    assert_eq!(next_json(&mut first).await["type"], "welcome");

    let mut second = connect(fixture.addr).await;
    // Welcome still arrives, then the server closes with a policy code.
    let welcome = tokio::time::timeout(Duration::from_secs(5), second.next())
        .await
        .expect("timeout")
        .expect("stream ended")
        .expect("ws error");
    match welcome {
        Message::Text(text) => {
            let value: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["type"], "welcome");
        }
        other => panic!("expected welcome, got {other:?}"),
    }
    let close = tokio::time::timeout(Duration::from_secs(5), second.next())
        .await
        .expect("timeout")
        .expect("stream ended")
        .expect("ws error");
    match close {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 1008);
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn subscribed_clients_receive_domain_events() {
    let fixture = start_gateway(None, 8).await;
    let mut socket = connect(fixture.addr).await;
    assert_eq!(next_json(&mut socket).await["type"], "welcome");

    send_json(&mut socket, json!({"type": "subscribe", "events": ["task"]})).await;
    assert_eq!(next_json(&mut socket).await["type"], "subscribed");

    // A submission on the control plane shows up as an event frame.
    send_json(
        &mut socket,
        json!({"type": "execute_command", "id": 7, "command": "task submit --type echo --description 'demo work'"}),
    )
    .await;

    let mut saw_result = false;
    let mut saw_task_event = false;
    for _ in 0..10 {
        let frame = next_json(&mut socket).await;
        match frame["type"].as_str() {
            Some("command_result") => saw_result = true,
            Some("event") => {
                if frame["event"]["category"] == "task" {
                    saw_task_event = true;
                }
            }
            _ => {}
        }
        if saw_result && saw_task_event {
            break;
        }
    }
    assert!(saw_result, "no command result received");
    assert!(saw_task_event, "no task event received");
}

#[tokio::test]
async fn disconnect_cancels_outstanding_command_and_frees_slot() {
    let fixture = start_gateway(None, 8).await;
    let mut socket = connect(fixture.addr).await;
    assert_eq!(next_json(&mut socket).await["type"], "welcome");
    assert!(
        wait_until(Duration::from_secs(2), || async {
            fixture.state.registry.count().await == 1
        })
        .await
    );

    send_json(
        &mut socket,
        json!({"type": "execute_command", "id": 1, "command": "agent list"}),
    )
    .await;
    drop(socket);

    // The server notices the disconnect, aborts the command worker,
    // and releases the connection slot.
    assert!(
        wait_until(Duration::from_secs(3), || async {
            fixture.state.registry.count().await == 0
        })
        .await,
        "connection slot never freed"
    );
}

#[tokio::test]
async fn http_health_endpoint_reports_connections() {
    let fixture = start_gateway(None, 8).await;
    let _socket = connect(fixture.addr).await;

    let mut stream = tokio::net::TcpStream::connect(fixture.addr)
        .await
        .expect("tcp connect");
    let request = format!(
        "GET /health HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        fixture.addr
    );
    stream.write_all(request.as_bytes()).await.expect("write");

    let mut response = String::new();
    stream.read_to_string(&mut response).await.expect("read");
    assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");

    let start = response.find('{').expect("json body start");
    let end = response.rfind('}').expect("json body end");
    let value: Value = serde_json::from_str(&response[start..=end]).expect("json body");
    assert_eq!(value["status"], "ok");
    assert!(value["connections"].as_u64().unwrap() >= 1);
}
