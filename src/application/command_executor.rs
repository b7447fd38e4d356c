//! Command executor adapter.
//!
//! Parses command strings from the console surface and dispatches them
//! to the coordinator, auto-scaler, and memory store. Every failure
//! maps to a stable string code plus a human message at the gateway.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::application::auto_scaler::AutoScaler;
use crate::application::coordinator::SwarmCoordinator;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    AgentSpec, AgentStatus, AgentType, MemoryEntry, PolicyType, ResourceCaps, ScalingKind,
    ScalingPolicy, SwarmMode, SwarmStrategy, TaskSpec, TaskStatus,
};
use crate::domain::ports::{
    AgentFilter, Clock, CommandExecutor, IdSource, MemoryRepository, TaskFilter,
};

/// Executes console commands against the control plane.
pub struct ControlCommandExecutor {
    coordinator: Arc<SwarmCoordinator>,
    scaler: Arc<AutoScaler>,
    memory: Arc<dyn MemoryRepository>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
}

impl ControlCommandExecutor {
    pub fn new(
        coordinator: Arc<SwarmCoordinator>,
        scaler: Arc<AutoScaler>,
        memory: Arc<dyn MemoryRepository>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdSource>,
    ) -> Self {
        Self {
            coordinator,
            scaler,
            memory,
            clock,
            ids,
        }
    }

    async fn agent_spawn(&self, args: &ParsedArgs) -> DomainResult<Value> {
        let type_str = args.flag("type").unwrap_or("general");
        let agent_type = AgentType::parse_str(type_str).ok_or_else(|| {
            DomainError::ValidationFailed(format!("unknown agent type: {type_str}"))
        })?;

        let mut spec = AgentSpec::new(agent_type);
        if let Some(name) = args.flag("name") {
            spec = spec.with_name(name);
        }
        for cap in args.flags("cap") {
            spec = spec.with_capability(cap);
        }
        let mut caps = ResourceCaps::default();
        if let Some(mem) = args.flag("max-memory-bytes") {
            caps.max_memory_bytes = parse_number(mem, "max-memory-bytes")?;
        }
        if let Some(concurrent) = args.flag("max-concurrent") {
            caps.max_concurrent_tasks = parse_number(concurrent, "max-concurrent")?;
        }
        if let Some(timeout) = args.flag("timeout-ms") {
            caps.wall_timeout_ms = parse_number(timeout, "timeout-ms")?;
        }
        spec = spec.with_caps(caps);

        let agent_id = self.coordinator.register_agent(spec).await?;
        Ok(json!({ "agent_id": agent_id }))
    }

    async fn agent_list(&self, args: &ParsedArgs) -> DomainResult<Value> {
        let mut filter = AgentFilter::default();
        if let Some(status) = args.flag("status") {
            filter.status = Some(AgentStatus::parse_str(status).ok_or_else(|| {
                DomainError::ValidationFailed(format!("unknown agent status: {status}"))
            })?);
        }
        if let Some(type_str) = args.flag("type") {
            filter.agent_type = Some(AgentType::parse_str(type_str).ok_or_else(|| {
                DomainError::ValidationFailed(format!("unknown agent type: {type_str}"))
            })?);
        }
        let agents = self.coordinator.list_agents(&filter).await;
        Ok(serde_json::to_value(agents).unwrap_or(Value::Null))
    }

    async fn agent_stop(&self, args: &ParsedArgs) -> DomainResult<Value> {
        let id = args.positional_uuid(0)?;
        let force = args.has_flag("force");
        self.coordinator.stop_agent(id, !force, None).await?;
        Ok(json!({ "stopped": id }))
    }

    async fn agent_remove(&self, args: &ParsedArgs) -> DomainResult<Value> {
        let id = args.positional_uuid(0)?;
        let force = args.has_flag("force");
        self.coordinator.remove_agent(id, force).await?;
        Ok(json!({ "removed": id }))
    }

    async fn task_submit(&self, args: &ParsedArgs) -> DomainResult<Value> {
        let task_type = args.flag("type").unwrap_or("general");
        let description = args
            .flag("description")
            .map(ToString::to_string)
            .or_else(|| args.positional(0).map(ToString::to_string))
            .ok_or_else(|| {
                DomainError::ValidationFailed("task description is required".to_string())
            })?;

        let mut spec = TaskSpec::new(task_type, description);
        if let Some(priority) = args.flag("priority") {
            spec.priority = parse_number(priority, "priority")?;
        }
        for dep in args.flags("dep") {
            let dep_id = dep.parse::<Uuid>().map_err(|_| {
                DomainError::ValidationFailed(format!("invalid dependency id: {dep}"))
            })?;
            spec = spec.with_dependency(dep_id);
        }
        for cap in args.flags("cap") {
            spec = spec.with_required_cap(cap);
        }
        if let Some(input) = args.flag("input") {
            let value: Value = serde_json::from_str(input)
                .unwrap_or_else(|_| Value::String(input.to_string()));
            spec = spec.with_input(value);
        }

        let task_id = self.coordinator.submit_task(spec).await?;
        Ok(json!({ "task_id": task_id }))
    }

    async fn task_list(&self, args: &ParsedArgs) -> DomainResult<Value> {
        let mut filter = TaskFilter::default();
        if let Some(status) = args.flag("status") {
            filter.status = Some(TaskStatus::parse_str(status).ok_or_else(|| {
                DomainError::ValidationFailed(format!("unknown task status: {status}"))
            })?);
        }
        if let Some(limit) = args.flag("limit") {
            filter.limit = Some(parse_number(limit, "limit")?);
        }
        let tasks = self.coordinator.list_tasks(&filter).await;
        Ok(serde_json::to_value(tasks).unwrap_or(Value::Null))
    }

    async fn task_show(&self, args: &ParsedArgs) -> DomainResult<Value> {
        let id = args.positional_uuid(0)?;
        let task = self
            .coordinator
            .get_task(id)
            .await
            .ok_or(DomainError::TaskNotFound(id))?;
        Ok(serde_json::to_value(task).unwrap_or(Value::Null))
    }

    async fn task_cancel(&self, args: &ParsedArgs) -> DomainResult<Value> {
        let id = args.positional_uuid(0)?;
        let reason = args.flag("reason").unwrap_or("cancelled by operator");
        self.coordinator.cancel_task(id, reason).await?;
        Ok(json!({ "cancelled": id }))
    }

    async fn swarm_create(&self, args: &ParsedArgs) -> DomainResult<Value> {
        let name = args
            .flag("name")
            .or_else(|| args.positional(0))
            .ok_or_else(|| DomainError::ValidationFailed("swarm name is required".to_string()))?;
        let agent_count: usize = args
            .flag("agents")
            .map(|v| parse_number(v, "agents"))
            .transpose()?
            .unwrap_or(1);
        let mode = args
            .flag("mode")
            .map(|m| {
                SwarmMode::parse_str(m).ok_or_else(|| {
                    DomainError::ValidationFailed(format!("unknown swarm mode: {m}"))
                })
            })
            .transpose()?
            .unwrap_or_default();
        let strategy = args
            .flag("strategy")
            .map(|s| {
                SwarmStrategy::parse_str(s).ok_or_else(|| {
                    DomainError::ValidationFailed(format!("unknown swarm strategy: {s}"))
                })
            })
            .transpose()?
            .unwrap_or_default();

        let swarm_id = self
            .coordinator
            .create_swarm(name, agent_count, mode, strategy)
            .await?;
        Ok(json!({ "swarm_id": swarm_id }))
    }

    async fn swarm_status(&self, args: &ParsedArgs) -> DomainResult<Value> {
        let id = args.positional_uuid(0)?;
        let swarm = self
            .coordinator
            .get_swarm(id)
            .await
            .ok_or(DomainError::SwarmNotFound(id))?;
        Ok(serde_json::to_value(swarm).unwrap_or(Value::Null))
    }

    async fn swarm_scale(&self, args: &ParsedArgs) -> DomainResult<Value> {
        let id = args.positional_uuid(0)?;
        let target: usize = args
            .flag("target")
            .map(|v| parse_number(v, "target"))
            .transpose()?
            .ok_or_else(|| DomainError::ValidationFailed("--target is required".to_string()))?;
        let (from, to) = self.coordinator.scale_swarm(id, target).await?;
        Ok(json!({ "swarm_id": id, "from": from, "to": to }))
    }

    async fn scale_manual(&self, kind: ScalingKind, args: &ParsedArgs) -> DomainResult<Value> {
        let n: u32 = args
            .positional(0)
            .map(|v| parse_number(v, "count"))
            .transpose()?
            .unwrap_or(1);
        let actions = self.scaler.manual_scale(kind, n).await?;
        Ok(json!({
            "kind": kind.as_str(),
            "actions": actions.iter().map(|a| a.id).collect::<Vec<_>>(),
        }))
    }

    async fn scale_policy_set(&self, args: &ParsedArgs) -> DomainResult<Value> {
        let mut policy = match self.scaler.current_policy().await? {
            Some(existing) => existing,
            None => ScalingPolicy::new(self.ids.new_id(), "default"),
        };
        if let Some(name) = args.flag("name") {
            policy.name = name.to_string();
        }
        if let Some(policy_type) = args.flag("type") {
            policy.policy_type = PolicyType::parse_str(policy_type).ok_or_else(|| {
                DomainError::InvalidPolicy(format!("unknown policy type: {policy_type}"))
            })?;
        }
        if let Some(min) = args.flag("min") {
            policy.min_agents = parse_number(min, "min")?;
        }
        if let Some(max) = args.flag("max") {
            policy.max_agents = parse_number(max, "max")?;
        }
        if let Some(target) = args.flag("target") {
            policy.target_utilization = parse_float(target, "target")?;
        }
        if let Some(up) = args.flag("up") {
            policy.scale_up_threshold = parse_float(up, "up")?;
        }
        if let Some(down) = args.flag("down") {
            policy.scale_down_threshold = parse_float(down, "down")?;
        }
        if let Some(cooldown) = args.flag("cooldown") {
            policy.cooldown_seconds = parse_number(cooldown, "cooldown")?;
        }
        policy.enabled = !args.has_flag("disabled");

        self.scaler.set_policy(policy.clone()).await?;
        Ok(json!({ "policy_id": policy.id, "name": policy.name }))
    }

    async fn scale_actions(&self, args: &ParsedArgs) -> DomainResult<Value> {
        let limit: usize = args
            .flag("limit")
            .map(|v| parse_number(v, "limit"))
            .transpose()?
            .unwrap_or(20);
        let actions = self.scaler.list_actions(limit).await?;
        Ok(serde_json::to_value(actions).unwrap_or(Value::Null))
    }

    async fn memory_store(&self, args: &ParsedArgs) -> DomainResult<Value> {
        let key = args
            .positional(0)
            .ok_or_else(|| DomainError::ValidationFailed("memory key is required".to_string()))?;
        let raw = args
            .positional(1)
            .ok_or_else(|| DomainError::ValidationFailed("memory value is required".to_string()))?;
        let value: Value =
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        let namespace = args.flag("namespace").unwrap_or("default");

        let now = self.clock.now();
        let entry = match self.memory.get(namespace, key).await? {
            Some(mut existing) => {
                existing.value = value;
                existing.updated_at = now;
                existing
            }
            None => MemoryEntry::new(namespace, key, value, now),
        };
        self.memory.put(&entry).await?;
        Ok(json!({ "namespace": namespace, "key": key }))
    }

    async fn memory_query(&self, args: &ParsedArgs) -> DomainResult<Value> {
        let search = args.positional(0).unwrap_or("");
        let namespace = args.flag("namespace").unwrap_or("default");
        let entries = self.memory.query(namespace, search).await?;
        Ok(serde_json::to_value(entries).unwrap_or(Value::Null))
    }

    async fn memory_delete(&self, args: &ParsedArgs) -> DomainResult<Value> {
        let key = args
            .positional(0)
            .ok_or_else(|| DomainError::ValidationFailed("memory key is required".to_string()))?;
        let namespace = args.flag("namespace").unwrap_or("default");
        let deleted = self.memory.delete(namespace, key).await?;
        Ok(json!({ "deleted": deleted }))
    }
}

#[async_trait]
impl CommandExecutor for ControlCommandExecutor {
    async fn execute(&self, command: &str) -> DomainResult<Value> {
        let tokens = tokenize(command);
        let mut words = tokens.iter().map(String::as_str);
        let noun = words.next().unwrap_or("");
        let verb = words.next().unwrap_or("");
        let rest: Vec<&str> = words.collect();
        let args = ParsedArgs::parse(&rest);

        match (noun, verb) {
            ("agent", "spawn") => self.agent_spawn(&args).await,
            ("agent", "list") => self.agent_list(&args).await,
            ("agent", "stop") => self.agent_stop(&args).await,
            ("agent", "remove") => self.agent_remove(&args).await,
            ("task", "submit") => self.task_submit(&args).await,
            ("task", "list") => self.task_list(&args).await,
            ("task", "show") => self.task_show(&args).await,
            ("task", "cancel") => self.task_cancel(&args).await,
            ("swarm", "create") => self.swarm_create(&args).await,
            ("swarm", "status") => self.swarm_status(&args).await,
            ("swarm", "scale") => self.swarm_scale(&args).await,
            ("scale", "up") => self.scale_manual(ScalingKind::Up, &args).await,
            ("scale", "down") => self.scale_manual(ScalingKind::Down, &args).await,
            ("scale", "policy") => match args.positional(0) {
                Some("set") => {
                    let rest: Vec<&str> = rest.iter().skip(1).copied().collect();
                    self.scale_policy_set(&ParsedArgs::parse(&rest)).await
                }
                _ => {
                    let policy = self.scaler.current_policy().await?;
                    Ok(serde_json::to_value(policy).unwrap_or(Value::Null))
                }
            },
            ("scale", "actions") => self.scale_actions(&args).await,
            ("memory", "store") => self.memory_store(&args).await,
            ("memory", "query") => self.memory_query(&args).await,
            ("memory", "delete") => self.memory_delete(&args).await,
            ("status", "") => {
                let report = self.coordinator.get_status().await;
                Ok(serde_json::to_value(report).unwrap_or(Value::Null))
            }
            _ => Err(DomainError::ValidationFailed(format!(
                "unknown command: {command}"
            ))),
        }
    }
}

/// Flags (`--key value`, repeatable, bare `--flag` booleans) plus
/// positional arguments.
struct ParsedArgs {
    flags: Vec<(String, Option<String>)>,
    positionals: Vec<String>,
}

impl ParsedArgs {
    fn parse(tokens: &[&str]) -> Self {
        let mut flags = Vec::new();
        let mut positionals = Vec::new();
        let mut iter = tokens.iter().peekable();
        while let Some(token) = iter.next() {
            if let Some(name) = token.strip_prefix("--") {
                let value = match iter.peek() {
                    Some(next) if !next.starts_with("--") => {
                        iter.next().map(|v| (*v).to_string())
                    }
                    _ => None,
                };
                flags.push((name.to_string(), value));
            } else {
                positionals.push((*token).to_string());
            }
        }
        Self { flags, positionals }
    }

    fn flag(&self, name: &str) -> Option<&str> {
        self.flags
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    fn flags(&self, name: &str) -> Vec<&str> {
        self.flags
            .iter()
            .filter(|(n, _)| n == name)
            .filter_map(|(_, v)| v.as_deref())
            .collect()
    }

    fn has_flag(&self, name: &str) -> bool {
        self.flags.iter().any(|(n, _)| n == name)
    }

    fn positional(&self, index: usize) -> Option<&str> {
        self.positionals.get(index).map(String::as_str)
    }

    fn positional_uuid(&self, index: usize) -> DomainResult<Uuid> {
        let raw = self.positional(index).ok_or_else(|| {
            DomainError::ValidationFailed("an id argument is required".to_string())
        })?;
        raw.parse::<Uuid>()
            .map_err(|_| DomainError::ValidationFailed(format!("invalid id: {raw}")))
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str, name: &str) -> DomainResult<T> {
    raw.parse::<T>()
        .map_err(|_| DomainError::ValidationFailed(format!("invalid {name}: {raw}")))
}

fn parse_float(raw: &str, name: &str) -> DomainResult<f64> {
    raw.parse::<f64>()
        .map_err(|_| DomainError::ValidationFailed(format!("invalid {name}: {raw}")))
}

/// Split a command line on whitespace, honoring single and double
/// quotes.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '"' | '\'' => quote = Some(c),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
