//! Deterministic selection and ordering of pending tasks.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use super::types::{OrderingStrategy, Task};

/// True if `task` may be picked up by the runner.
///
/// A task is eligible when it is `todo`/`backlog` and carries no unresolved
/// question or blocker comment.
pub fn is_eligible(task: &Task) -> bool {
    task.status.is_pending() && !task.has_unresolved_blocker()
}

/// Return eligible tasks ordered by `strategy`.
///
/// `all` is the full task list (needed to resolve dependency status).
pub fn order_pending(all: &[Task], strategy: OrderingStrategy) -> Vec<Task> {
    let mut pending: Vec<&Task> = all.iter().filter(|t| is_eligible(t)).collect();
    pending.sort_by(|a, b| fifo_key(a).cmp(&fifo_key(b)));

    match strategy {
        OrderingStrategy::Fifo => pending.into_iter().cloned().collect(),
        OrderingStrategy::Priority => {
            // Stable sort keeps FIFO order within a priority.
            pending.sort_by(|a, b| b.priority.cmp(&a.priority));
            pending.into_iter().cloned().collect()
        }
        OrderingStrategy::Dependency => dependency_order(all, &pending),
    }
}

fn fifo_key(task: &Task) -> (chrono::DateTime<chrono::Utc>, &str) {
    (task.created_at, task.id.as_str())
}

/// Topological order over pending tasks (Kahn's algorithm, FIFO tie-break).
///
/// Dependencies on tasks already in `review`/`done` are satisfied. A pending
/// task is excluded if any dependency is missing, failed, blocked, or part of
/// a cycle.
fn dependency_order(all: &[Task], pending: &[&Task]) -> Vec<Task> {
    let by_id: HashMap<&str, &Task> = all.iter().map(|t| (t.id.as_str(), t)).collect();
    let pending_ids: HashSet<&str> = pending.iter().map(|t| t.id.as_str()).collect();
    let position: HashMap<&str, usize> = pending
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();

    // Drop tasks whose dependencies can never be satisfied in this run.
    let mut viable: HashSet<&str> = pending_ids.clone();
    loop {
        let snapshot = viable.clone();
        viable.retain(|id| {
            by_id[id].depends_on.iter().all(|dep| {
                snapshot.contains(dep.as_str())
                    || by_id
                        .get(dep.as_str())
                        .is_some_and(|t| t.status.satisfies_dependency())
            })
        });
        if viable.len() == snapshot.len() {
            break;
        }
    }

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for id in &viable {
        let deps: Vec<&str> = by_id[id]
            .depends_on
            .iter()
            .map(String::as_str)
            .filter(|dep| viable.contains(dep))
            .collect();
        in_degree.insert(id, deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(id);
        }
    }

    // BTreeMap keyed by FIFO position gives a deterministic ready queue.
    let mut ready: BTreeMap<usize, &str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| (position[id], *id))
        .collect();
    let mut ordered = VecDeque::new();
    while let Some((_, id)) = ready.pop_first() {
        ordered.push_back(id);
        if let Some(children) = dependents.get(id) {
            for child in children {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(position[child], child);
                    }
                }
            }
        }
    }

    ordered.into_iter().map(|id| by_id[id].clone()).collect()
}
