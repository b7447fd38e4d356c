//! Apiary — agent orchestration control plane.
//!
//! A long-running control plane that supervises a fleet of worker
//! agent subprocesses:
//! - Swarm coordinator with a dependency-aware priority task queue
//! - Agent process manager with per-agent supervision and resource caps
//! - Closed-loop auto-scaler with hysteresis and cooldown
//! - SQLite persistence behind narrow repository ports
//! - Console gateway (HTTP + WebSocket) for remote clients

pub mod application;
pub mod domain;
pub mod gateway;
pub mod infrastructure;
pub mod services;
