//! Console wire protocol: JSON frames over the WebSocket channel.
//!
//! Every frame carries a `type` tag. Unknown client frame types are
//! logged and dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::services::event_bus::Event;

/// Frames accepted from clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Authenticate {
        token: String,
    },
    Ping,
    Subscribe {
        events: Vec<String>,
    },
    ExecuteCommand {
        /// Echoed back verbatim in the matching result or error frame.
        id: Value,
        command: String,
    },
}

/// Machine-readable error body on the command channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Frames emitted by the server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        connection_id: Uuid,
        server_time: DateTime<Utc>,
        authenticated: bool,
    },
    AuthSuccess,
    AuthFailed {
        reason: String,
    },
    Pong {
        ts: DateTime<Utc>,
    },
    Subscribed {
        events: Vec<String>,
    },
    CommandResult {
        id: Value,
        result: Value,
    },
    CommandError {
        id: Value,
        error: ErrorBody,
    },
    Event {
        event: Event,
    },
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"command_error","id":null,"error":{"code":"internal","message":"frame encoding failed"}}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_parsing() {
        let auth: ClientFrame =
            serde_json::from_str(r#"{"type":"authenticate","token":"secret"}"#).unwrap();
        assert!(matches!(auth, ClientFrame::Authenticate { token } if token == "secret"));

        let ping: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientFrame::Ping));

        let exec: ClientFrame = serde_json::from_str(
            r#"{"type":"execute_command","id":42,"command":"agent list"}"#,
        )
        .unwrap();
        match exec {
            ClientFrame::ExecuteCommand { id, command } => {
                assert_eq!(id, serde_json::json!(42));
                assert_eq!(command, "agent list");
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        // Unknown frame types do not parse; the reader drops them.
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"gossip"}"#).is_err());
    }

    #[test]
    fn test_server_frame_encoding() {
        let frame = ServerFrame::Welcome {
            connection_id: Uuid::new_v4(),
            server_time: Utc::now(),
            authenticated: true,
        };
        let encoded = frame.to_json();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "welcome");
        assert_eq!(value["authenticated"], true);
    }

    #[test]
    fn test_command_error_shape() {
        let frame = ServerFrame::CommandError {
            id: serde_json::json!(7),
            error: ErrorBody {
                code: "not_found".to_string(),
                message: "no such agent".to_string(),
            },
        };
        let value: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["error"]["code"], "not_found");
    }
}
