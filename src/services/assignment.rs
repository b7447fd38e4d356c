//! The assignment pass: matching ready tasks to eligible agents.
//!
//! Kept as a pure function over snapshots so that determinism and
//! priority ordering are testable without the coordinator runtime.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Ready-task view consumed by one pass.
#[derive(Debug, Clone)]
pub struct ReadyTask {
    pub id: Uuid,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub required_caps: Vec<String>,
}

/// Eligible-agent view consumed by one pass.
#[derive(Debug, Clone)]
pub struct EligibleAgent {
    pub id: Uuid,
    pub capabilities: Vec<String>,
    pub current_task_count: u32,
    pub max_concurrent_tasks: u32,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

impl EligibleAgent {
    fn has_capacity(&self) -> bool {
        self.current_task_count < self.max_concurrent_tasks
    }

    fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            1.0
        } else {
            self.tasks_completed as f64 / total as f64
        }
    }
}

/// One task-to-agent pairing decided by a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub task_id: Uuid,
    pub agent_id: Uuid,
}

/// Fraction of required capabilities the agent carries. Tasks without
/// requirements score every agent at 1.0.
fn capability_match(required: &[String], capabilities: &[String]) -> f64 {
    if required.is_empty() {
        return 1.0;
    }
    let matched = required
        .iter()
        .filter(|cap| capabilities.iter().any(|c| c == *cap))
        .count();
    matched as f64 / required.len() as f64
}

/// Score of one candidate agent for one task: capability match primary,
/// least-loaded secondary, success rate tertiary. Ties break on agent id
/// so identical inputs always produce identical pairings.
fn score(task: &ReadyTask, agent: &EligibleAgent) -> (f64, f64, f64) {
    (
        capability_match(&task.required_caps, &agent.capabilities),
        1.0 / f64::from(agent.current_task_count + 1),
        agent.success_rate(),
    )
}

fn compare_candidates(
    task: &ReadyTask,
    a: &EligibleAgent,
    b: &EligibleAgent,
) -> Ordering {
    let sa = score(task, a);
    let sb = score(task, b);
    sa.partial_cmp(&sb)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.id.cmp(&a.id))
}

/// Run one assignment pass.
///
/// Tasks are considered in `(priority desc, created_at asc, id asc)`
/// order; each picks its best-scoring agent with remaining capacity.
/// Capacity is decremented in-pass so one agent can absorb several tasks
/// only up to its concurrency cap.
pub fn plan_assignments(ready: &[ReadyTask], agents: &[EligibleAgent]) -> Vec<Assignment> {
    let mut queue: Vec<&ReadyTask> = ready.iter().collect();
    queue.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut pool: Vec<EligibleAgent> = agents.to_vec();
    let mut out = Vec::new();

    for task in queue {
        let best = pool
            .iter()
            .enumerate()
            .filter(|(_, a)| a.has_capacity())
            .max_by(|(_, a), (_, b)| compare_candidates(task, a, b))
            .map(|(i, _)| i);

        let Some(idx) = best else {
            // No capacity anywhere; later tasks cannot do better.
            if pool.iter().all(|a| !a.has_capacity()) {
                break;
            }
            continue;
        };

        out.push(Assignment {
            task_id: task.id,
            agent_id: pool[idx].id,
        });
        pool[idx].current_task_count += 1;
    }

    out
}
