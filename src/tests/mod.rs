//! End-to-end scenarios exercising the queue, context memory and
//! supervisor together.

mod invariants;

use crate::{
    models::{Task, TaskState, TaskType},
    queue::TaskQueue,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Once;

static TRACING: Once = Once::new();

/// Route test logs through the env filter (`RUST_LOG=coscientist_core=debug`).
pub(crate) fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub(crate) fn payload(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

pub(crate) fn task_with(task_type: TaskType, priority: u8, goal: &str) -> Task {
    Task::new(task_type, priority, payload(&[("goal", json!(goal))])).unwrap()
}

/// Check the structural invariants that must hold after every queue API
/// call.
pub(crate) async fn assert_queue_invariants(queue: &TaskQueue) {
    let st = queue.state.lock().await;

    // Pending tasks sit in exactly one band, exactly once, unassigned
    let mut band_occurrences: HashMap<&String, usize> = HashMap::new();
    for band in &st.bands {
        for task_id in band {
            *band_occurrences.entry(task_id).or_insert(0) += 1;
        }
    }
    for (task_id, state) in &st.task_states {
        if *state == TaskState::Pending {
            assert_eq!(
                band_occurrences.get(task_id).copied().unwrap_or(0),
                1,
                "pending task {task_id} must appear exactly once in one band"
            );
            let task = &st.tasks[task_id];
            assert!(
                task.assigned_to.is_none(),
                "pending task {task_id} must be unassigned"
            );
        }
    }
    for (task_id, count) in &band_occurrences {
        assert_eq!(*count, 1, "task {task_id} queued more than once");
        assert_eq!(
            st.task_states.get(*task_id),
            Some(&TaskState::Pending),
            "queued task {task_id} must be pending"
        );
    }

    // Executing tasks hold exactly one live assignment and an active worker
    for (task_id, state) in &st.task_states {
        if *state != TaskState::Executing {
            continue;
        }
        let holders: Vec<&String> = st
            .assignment_to_task
            .iter()
            .filter(|(_, tid)| *tid == task_id)
            .map(|(aid, _)| aid)
            .collect();
        assert_eq!(
            holders.len(),
            1,
            "executing task {task_id} must have exactly one assignment"
        );
        let worker_id = &st.assignment_to_worker[holders[0]];
        let worker = &st.workers[worker_id];
        assert_eq!(worker.assigned_task.as_ref(), Some(task_id));
        assert!(st.active_workers.contains(worker_id));
    }

    // Lease tables stay in sync: no dangling entries in any direction
    assert_eq!(st.assignments.len(), st.assignment_to_task.len());
    assert_eq!(st.assignments.len(), st.assignment_to_worker.len());
    for assignment_id in st.assignments.keys() {
        assert!(st.assignment_to_task.contains_key(assignment_id));
        assert!(st.assignment_to_worker.contains_key(assignment_id));
    }

    // Dead-lettered tasks are failed and out of every band
    for task_id in &st.dead_letter_queue {
        assert_eq!(st.task_states.get(task_id), Some(&TaskState::Failed));
        assert!(!band_occurrences.contains_key(task_id));
    }

    // Accounting: every live record is pending-in-a-band, leased, or
    // terminal
    let leased = st.assignment_to_task.len();
    let terminal = st
        .task_states
        .values()
        .filter(|state| matches!(state, TaskState::Completed | TaskState::Failed))
        .count();
    assert_eq!(
        st.total_size() + leased + terminal,
        st.tasks.len(),
        "band contents, leases and terminal tasks must account for every record"
    );
}
