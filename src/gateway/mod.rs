//! Console gateway: HTTP + WebSocket surface over the control plane.

pub mod connection;
pub mod protocol;
pub mod server;

pub use connection::{Connection, ConnectionRegistry};
pub use protocol::{ClientFrame, ErrorBody, ServerFrame};
pub use server::{ConsoleGateway, GatewayState};
