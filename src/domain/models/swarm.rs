//! Swarm domain model.
//!
//! A swarm is a named logical grouping of agents and tasks under one
//! coordination strategy. It references members by id; it does not own
//! them, and an agent belongs to at most one swarm at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topology under which swarm members coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmMode {
    Hierarchical,
    Mesh,
    Centralized,
}

impl Default for SwarmMode {
    fn default() -> Self {
        Self::Centralized
    }
}

impl SwarmMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hierarchical => "hierarchical",
            Self::Mesh => "mesh",
            Self::Centralized => "centralized",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hierarchical" => Some(Self::Hierarchical),
            "mesh" => Some(Self::Mesh),
            "centralized" => Some(Self::Centralized),
            _ => None,
        }
    }
}

/// How work is distributed inside a swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmStrategy {
    Auto,
    Manual,
    Hybrid,
}

impl Default for SwarmStrategy {
    fn default() -> Self {
        Self::Auto
    }
}

impl SwarmStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
            Self::Hybrid => "hybrid",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmStatus {
    Active,
    Paused,
    Stopped,
}

impl Default for SwarmStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl SwarmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// A named grouping of agents and tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Swarm {
    pub id: Uuid,
    pub name: String,
    pub mode: SwarmMode,
    pub strategy: SwarmStrategy,
    pub agent_ids: Vec<Uuid>,
    pub task_ids: Vec<Uuid>,
    pub status: SwarmStatus,
    pub created_at: DateTime<Utc>,
}

impl Swarm {
    pub fn new(
        id: Uuid,
        name: impl Into<String>,
        mode: SwarmMode,
        strategy: SwarmStrategy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            mode,
            strategy,
            agent_ids: Vec::new(),
            task_ids: Vec::new(),
            status: SwarmStatus::Active,
            created_at: now,
        }
    }

    pub fn add_agent(&mut self, agent_id: Uuid) {
        if !self.agent_ids.contains(&agent_id) {
            self.agent_ids.push(agent_id);
        }
    }

    pub fn remove_agent(&mut self, agent_id: Uuid) {
        self.agent_ids.retain(|a| *a != agent_id);
    }

    pub fn add_task(&mut self, task_id: Uuid) {
        if !self.task_ids.contains(&task_id) {
            self.task_ids.push(task_id);
        }
    }

    pub fn agent_count(&self) -> usize {
        self.agent_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trip() {
        for m in [SwarmMode::Hierarchical, SwarmMode::Mesh, SwarmMode::Centralized] {
            assert_eq!(SwarmMode::parse_str(m.as_str()), Some(m));
        }
        assert_eq!(SwarmMode::parse_str("ring"), None);
    }

    #[test]
    fn test_membership_is_deduplicated() {
        let mut swarm = Swarm::new(
            Uuid::new_v4(),
            "alpha",
            SwarmMode::Mesh,
            SwarmStrategy::Auto,
            Utc::now(),
        );
        let agent = Uuid::new_v4();
        swarm.add_agent(agent);
        swarm.add_agent(agent);
        assert_eq!(swarm.agent_count(), 1);

        swarm.remove_agent(agent);
        assert_eq!(swarm.agent_count(), 0);
    }
}
