//! Console gateway: HTTP endpoints plus the bidirectional WebSocket
//! channel.
//!
//! Each connection runs one reader loop (this task), one writer task,
//! one serial command worker, and one event forwarder; there is no
//! cross-connection locking. A client disconnect aborts its command
//! worker, cancelling any in-flight command.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::coordinator::SwarmCoordinator;
use crate::domain::errors::{DomainError, ErrorKind};
use crate::domain::ports::{Clock, CommandExecutor};
use crate::gateway::connection::ConnectionRegistry;
use crate::gateway::protocol::{ClientFrame, ErrorBody, ServerFrame};
use crate::services::event_bus::{EventBus, EventPayload};

/// Shared state behind every handler.
pub struct GatewayState {
    pub executor: Arc<dyn CommandExecutor>,
    pub registry: Arc<ConnectionRegistry>,
    pub bus: Arc<EventBus>,
    pub coordinator: Arc<SwarmCoordinator>,
    pub clock: Arc<dyn Clock>,
    pub auth_token: Option<String>,
    pub command_timeout: Duration,
    pub started_at: DateTime<Utc>,
}

/// The console gateway server.
pub struct ConsoleGateway {
    state: Arc<GatewayState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ConsoleGateway {
    pub fn new(state: Arc<GatewayState>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { state, shutdown_tx }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/status", get(status))
            .route("/execute", post(execute))
            .route("/connections", get(connections))
            .route("/ws", get(ws_upgrade))
            .with_state(Arc::clone(&self.state))
    }

    /// Bind and serve until shutdown is signalled. Returns the bound
    /// local address through `bound_tx` once listening.
    pub async fn serve(
        &self,
        bind_addr: &str,
        bound_tx: Option<tokio::sync::oneshot::Sender<std::net::SocketAddr>>,
    ) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        let local = listener.local_addr()?;
        if let Some(tx) = bound_tx {
            let _ = tx.send(local);
        }
        info!(addr = %local, "Console gateway listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

// ========================
// HTTP handlers
// ========================

async fn health(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let uptime_ms = state
        .clock
        .now()
        .signed_duration_since(state.started_at)
        .num_milliseconds()
        .max(0);
    Json(json!({
        "status": "ok",
        "uptime_ms": uptime_ms,
        "connections": state.registry.count().await,
    }))
}

async fn status(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let report = state.coordinator.get_status().await;
    Json(json!({
        "server_time": state.clock.now(),
        "connections": state.registry.count().await,
        "swarm": report,
    }))
}

async fn connections(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let list = state.registry.list().await;
    Json(serde_json::to_value(list).unwrap_or(Value::Null))
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    command: String,
}

async fn execute(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(request): Json<ExecuteRequest>,
) -> Response {
    if let Some(expected) = &state.auth_token {
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": { "code": "auth_failed", "message": "missing or invalid token" } })),
            )
                .into_response();
        }
    }

    match tokio::time::timeout(state.command_timeout, state.executor.execute(&request.command))
        .await
    {
        Ok(Ok(result)) => Json(json!({ "result": result })).into_response(),
        Ok(Err(e)) => {
            let status = status_for(&e);
            (
                status,
                Json(json!({ "error": { "code": e.code(), "message": e.to_string() } })),
            )
                .into_response()
        }
        Err(_) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({ "error": { "code": "deadline_exceeded", "message": "command deadline exceeded" } })),
        )
            .into_response(),
    }
}

fn status_for(error: &DomainError) -> StatusCode {
    match error.kind() {
        ErrorKind::Invalid => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Exhausted => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ========================
// WebSocket channel
// ========================

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<GatewayState>, socket: WebSocket) {
    let connection_id = Uuid::new_v4();
    let now = state.clock.now();
    // With auth disabled every client is authenticated on connect.
    let pre_authenticated = state.auth_token.is_none();

    let (mut sink, mut stream) = socket.split();

    let welcome = ServerFrame::Welcome {
        connection_id,
        server_time: now,
        authenticated: pre_authenticated,
    };
    if sink.send(Message::Text(welcome.to_json())).await.is_err() {
        return;
    }

    // Welcome is sent even to over-cap clients, then the socket closes
    // with a policy violation.
    if !state
        .registry
        .register(connection_id, pre_authenticated, None, now)
        .await
    {
        warn!(connection_id = %connection_id, "Connection cap reached, refusing client");
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "max connections reached".into(),
            })))
            .await;
        return;
    }
    state
        .bus
        .publish(EventPayload::ConnectionOpened { connection_id }, now);
    info!(connection_id = %connection_id, "Console client connected");

    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(64);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(Message::Text(frame.to_json())).await.is_err() {
                break;
            }
        }
    });

    // Serial command worker: one outstanding execute per client, the
    // channel queues the rest in order.
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<(Value, String)>(16);
    let worker = {
        let state = Arc::clone(&state);
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some((id, command)) = cmd_rx.recv().await {
                let frame = run_command(&state, id, &command).await;
                if out_tx.send(frame).await.is_err() {
                    break;
                }
            }
        })
    };

    // Forward subscribed domain events.
    let forwarder = {
        let state = Arc::clone(&state);
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let mut events = state.bus.subscribe();
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let topic = event.category.as_str();
                        if state.registry.wants_event(connection_id, topic).await
                            && out_tx.send(ServerFrame::Event { event }).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(connection_id = %connection_id, skipped, "Event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                handle_frame(&state, connection_id, &text, &out_tx, &cmd_tx).await;
            }
            Message::Close(_) => break,
            // Transport-level pings are answered by axum itself.
            _ => {}
        }
    }

    // Disconnect cancels the client's in-flight command.
    worker.abort();
    forwarder.abort();
    writer.abort();
    state.registry.remove(connection_id).await;
    state.bus.publish(
        EventPayload::ConnectionClosed { connection_id },
        state.clock.now(),
    );
    info!(connection_id = %connection_id, "Console client disconnected");
}

async fn handle_frame(
    state: &Arc<GatewayState>,
    connection_id: Uuid,
    text: &str,
    out_tx: &mpsc::Sender<ServerFrame>,
    cmd_tx: &mpsc::Sender<(Value, String)>,
) {
    let now = state.clock.now();
    state.registry.touch(connection_id, now).await;

    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(_) => {
            debug!(connection_id = %connection_id, "Dropping unrecognized client frame");
            return;
        }
    };

    match frame {
        ClientFrame::Authenticate { token } => {
            let accepted = match &state.auth_token {
                None => true,
                Some(expected) => &token == expected,
            };
            state
                .registry
                .set_authenticated(connection_id, accepted, now)
                .await;
            let reply = if accepted {
                ServerFrame::AuthSuccess
            } else {
                warn!(connection_id = %connection_id, "Authentication failed");
                ServerFrame::AuthFailed {
                    reason: "invalid token".to_string(),
                }
            };
            let _ = out_tx.send(reply).await;
        }
        ClientFrame::Ping => {
            let _ = out_tx.send(ServerFrame::Pong { ts: now }).await;
        }
        ClientFrame::Subscribe { events } => {
            state.registry.subscribe(connection_id, &events, now).await;
            let _ = out_tx.send(ServerFrame::Subscribed { events }).await;
        }
        ClientFrame::ExecuteCommand { id, command } => {
            if !state.registry.is_authenticated(connection_id).await {
                let _ = out_tx
                    .send(ServerFrame::CommandError {
                        id,
                        error: ErrorBody {
                            code: "auth_required".to_string(),
                            message: "authenticate before executing commands".to_string(),
                        },
                    })
                    .await;
                return;
            }
            // The bounded queue preserves order; overflow sheds load.
            if let Err(mpsc::error::TrySendError::Full((id, _))) =
                cmd_tx.try_send((id, command))
            {
                let _ = out_tx
                    .send(ServerFrame::CommandError {
                        id,
                        error: ErrorBody {
                            code: "exhausted".to_string(),
                            message: "command queue full".to_string(),
                        },
                    })
                    .await;
            }
        }
    }
}

async fn run_command(state: &Arc<GatewayState>, id: Value, command: &str) -> ServerFrame {
    match tokio::time::timeout(state.command_timeout, state.executor.execute(command)).await {
        Ok(Ok(result)) => ServerFrame::CommandResult { id, result },
        Ok(Err(e)) => ServerFrame::CommandError {
            id,
            error: ErrorBody {
                code: e.code().to_string(),
                message: e.to_string(),
            },
        },
        Err(_) => ServerFrame::CommandError {
            id,
            error: ErrorBody {
                code: "deadline_exceeded".to_string(),
                message: "command deadline exceeded".to_string(),
            },
        },
    }
}
