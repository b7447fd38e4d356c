//! Dependency resolution and cycle detection for the task queue.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Task, TaskStatus};

/// Service for validating task dependency graphs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyResolver;

// Standalone DFS helper (no self needed).
fn detect_cycle_util(
    node: Uuid,
    graph: &HashMap<Uuid, Vec<Uuid>>,
    visited: &mut HashSet<Uuid>,
    rec_stack: &mut HashSet<Uuid>,
    path: &mut Vec<Uuid>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(neighbors) = graph.get(&node) {
        for &neighbor in neighbors {
            if !visited.contains(&neighbor) {
                if detect_cycle_util(neighbor, graph, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(&neighbor) {
                if let Some(cycle_start) = path.iter().position(|&id| id == neighbor) {
                    path.drain(0..cycle_start);
                    return true;
                }
            }
        }
    }

    rec_stack.remove(&node);
    path.pop();
    false
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Reject a submission whose dependencies would close a cycle or point
    /// at itself. `existing` is the current task set; `candidate_id` and
    /// `candidate_deps` describe the task being submitted.
    pub fn check_submission(
        &self,
        candidate_id: Uuid,
        candidate_deps: &[Uuid],
        existing: &HashMap<Uuid, Task>,
    ) -> DomainResult<()> {
        if candidate_deps.contains(&candidate_id) {
            return Err(DomainError::DependencyCycle(candidate_id));
        }

        // Adjacency over existing tasks plus the candidate.
        let mut graph: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for task in existing.values() {
            graph.insert(task.id, task.dependencies.clone());
        }
        graph.insert(candidate_id, candidate_deps.to_vec());

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        if detect_cycle_util(candidate_id, &graph, &mut visited, &mut rec_stack, &mut path) {
            return Err(DomainError::DependencyCycle(
                path.first().copied().unwrap_or(candidate_id),
            ));
        }
        Ok(())
    }

    /// Whether every dependency of `task` is completed.
    pub fn dependencies_met(&self, task: &Task, all: &HashMap<Uuid, Task>) -> bool {
        task.dependencies.iter().all(|dep| {
            all.get(dep)
                .is_some_and(|d| d.status == TaskStatus::Completed)
        })
    }

    /// Whether any dependency of `task` has terminally failed or been
    /// cancelled, making the task unrunnable.
    pub fn dependencies_doomed(&self, task: &Task, all: &HashMap<Uuid, Task>) -> bool {
        task.dependencies.iter().any(|dep| match all.get(dep) {
            Some(d) => matches!(d.status, TaskStatus::Failed | TaskStatus::Cancelled),
            // Unknown dependency id can never complete.
            None => true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::TaskSpec;
    use chrono::Utc;

    fn make_task(deps: Vec<Uuid>) -> Task {
        let mut spec = TaskSpec::new("echo", "test");
        spec.dependencies = deps;
        Task::from_spec(Uuid::new_v4(), &spec, 3, Utc::now())
    }

    fn index(tasks: &[Task]) -> HashMap<Uuid, Task> {
        tasks.iter().map(|t| (t.id, t.clone())).collect()
    }

    #[test]
    fn test_self_dependency_rejected() {
        let resolver = DependencyResolver::new();
        let id = Uuid::new_v4();
        let err = resolver
            .check_submission(id, &[id], &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, DomainError::DependencyCycle(_)));
    }

    #[test]
    fn test_chain_is_accepted() {
        let resolver = DependencyResolver::new();
        let a = make_task(vec![]);
        let b = make_task(vec![a.id]);
        let all = index(&[a, b.clone()]);
        assert!(resolver
            .check_submission(Uuid::new_v4(), &[b.id], &all)
            .is_ok());
    }

    #[test]
    fn test_cycle_through_existing_rejected() {
        let resolver = DependencyResolver::new();
        let candidate_id = Uuid::new_v4();
        // Existing task depends on the candidate; candidate depending on it
        // closes the loop.
        let existing = make_task(vec![candidate_id]);
        let all = index(&[existing.clone()]);
        let err = resolver
            .check_submission(candidate_id, &[existing.id], &all)
            .unwrap_err();
        assert!(matches!(err, DomainError::DependencyCycle(_)));
    }

    #[test]
    fn test_dependencies_met() {
        let resolver = DependencyResolver::new();
        let mut dep = make_task(vec![]);
        let task = make_task(vec![dep.id]);

        let all = index(&[dep.clone(), task.clone()]);
        assert!(!resolver.dependencies_met(&task, &all));

        let now = Utc::now();
        dep.transition_to(TaskStatus::Assigned, now).unwrap();
        dep.transition_to(TaskStatus::Running, now).unwrap();
        dep.transition_to(TaskStatus::Completed, now).unwrap();
        let all = index(&[dep, task.clone()]);
        assert!(resolver.dependencies_met(&task, &all));
    }

    #[test]
    fn test_doomed_dependencies() {
        let resolver = DependencyResolver::new();
        let mut dep = make_task(vec![]);
        dep.force_status(TaskStatus::Failed, Utc::now(), "test setup");
        let task = make_task(vec![dep.id]);
        let all = index(&[dep, task.clone()]);
        assert!(resolver.dependencies_doomed(&task, &all));

        let orphan = make_task(vec![Uuid::new_v4()]);
        assert!(resolver.dependencies_doomed(&orphan, &HashMap::new()));
    }
}
