//! Command-execution port.
//!
//! The console gateway invokes control-plane operations only through
//! this seam; the adapter over the coordinator, process manager, and
//! auto-scaler lives in the application layer.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::DomainResult;

/// Executes one command string (e.g. `"agent spawn --type coder"`) and
/// returns its JSON result.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str) -> DomainResult<Value>;
}
