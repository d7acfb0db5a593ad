use crate::{
    models::{AgentType, FailureReason, FailureRecord, Task, TaskError, TaskState},
    queue::worker::{WorkerInfo, WorkerState},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};

/// A worker's time-bounded claim on a dequeued task
///
/// Carries a value copy of the task; workers never touch queue state
/// directly, progress flows back through `heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task: Task,
    pub assignment_id: String,
    pub worker_id: String,
    /// Hard lease expiry. Exceeding it is treated like worker death.
    pub deadline: DateTime<Utc>,
    /// Shorter window within which the worker must acknowledge.
    pub acknowledgment_required_by: DateTime<Utc>,
}

/// Why a task landed in the dead-letter queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    RetryExhaustion,
    NonRetryableError,
}

impl DlqReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqReason::RetryExhaustion => "retry_exhaustion",
            DlqReason::NonRetryableError => "non_retryable_error",
        }
    }
}

/// Metadata recorded alongside a dead-lettered task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub reason: DlqReason,
    pub error: TaskError,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

pub(crate) fn band_name(priority: u8) -> &'static str {
    match priority {
        1 => "low",
        2 => "medium",
        3 => "high",
        _ => "unknown",
    }
}

/// Everything the queue tracks, guarded by a single mutex
///
/// Tasks, workers and assignments reference each other by id through the
/// tables below; queue operations keep the tables consistent, no entry may
/// dangle.
#[derive(Debug)]
pub(crate) struct QueueState {
    /// FIFO bands indexed by priority - 1 (1=low, 2=medium, 3=high).
    pub(crate) bands: [VecDeque<String>; 3],

    pub(crate) tasks: HashMap<String, Task>,
    pub(crate) task_states: HashMap<String, TaskState>,
    pub(crate) task_retry_counts: HashMap<String, u32>,
    pub(crate) task_failure_history: HashMap<String, Vec<FailureRecord>>,
    pub(crate) task_enqueue_times: HashMap<String, DateTime<Utc>>,
    pub(crate) task_boost_levels: HashMap<String, f64>,
    pub(crate) task_progress: HashMap<String, Map<String, Value>>,

    pub(crate) workers: HashMap<String, WorkerInfo>,
    /// Derived set of workers currently holding a task; never persisted.
    pub(crate) active_workers: HashSet<String>,

    pub(crate) assignments: HashMap<String, TaskAssignment>,
    pub(crate) assignment_to_task: HashMap<String, String>,
    pub(crate) assignment_to_worker: HashMap<String, String>,

    pub(crate) capability_matching_enabled: bool,

    pub(crate) dead_letter_queue: VecDeque<String>,
    pub(crate) dlq_metadata: HashMap<String, DlqEntry>,

    pub(crate) displaced_tasks: u64,
    pub(crate) displacement_by_priority: HashMap<String, u64>,
}

impl QueueState {
    pub(crate) fn new() -> Self {
        let mut displacement_by_priority = HashMap::new();
        for band in ["low", "medium", "high"] {
            displacement_by_priority.insert(band.to_string(), 0);
        }

        Self {
            bands: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            tasks: HashMap::new(),
            task_states: HashMap::new(),
            task_retry_counts: HashMap::new(),
            task_failure_history: HashMap::new(),
            task_enqueue_times: HashMap::new(),
            task_boost_levels: HashMap::new(),
            task_progress: HashMap::new(),
            workers: HashMap::new(),
            active_workers: HashSet::new(),
            assignments: HashMap::new(),
            assignment_to_task: HashMap::new(),
            assignment_to_worker: HashMap::new(),
            capability_matching_enabled: false,
            dead_letter_queue: VecDeque::new(),
            dlq_metadata: HashMap::new(),
            displaced_tasks: 0,
            displacement_by_priority,
        }
    }

    pub(crate) fn band(&self, priority: u8) -> Option<&VecDeque<String>> {
        match priority {
            1..=3 => Some(&self.bands[priority as usize - 1]),
            _ => None,
        }
    }

    pub(crate) fn band_mut(&mut self, priority: u8) -> Option<&mut VecDeque<String>> {
        match priority {
            1..=3 => Some(&mut self.bands[priority as usize - 1]),
            _ => None,
        }
    }

    pub(crate) fn total_size(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }

    /// Remove the oldest task from the lowest non-empty band strictly below
    /// `incoming_priority`, dropping its record entirely. Returns true if a
    /// task was displaced.
    pub(crate) fn displace_lower_priority(&mut self, incoming_priority: u8) -> bool {
        for priority in 1..incoming_priority.min(3) {
            let band = &mut self.bands[priority as usize - 1];
            let Some(displaced_id) = band.pop_front() else {
                continue;
            };

            self.tasks.remove(&displaced_id);
            self.task_states.remove(&displaced_id);
            self.task_enqueue_times.remove(&displaced_id);
            self.task_boost_levels.remove(&displaced_id);

            self.displaced_tasks += 1;
            *self
                .displacement_by_priority
                .entry(band_name(priority).to_string())
                .or_insert(0) += 1;

            return true;
        }

        false
    }

    /// Recompute starvation boosts for every pending task
    ///
    /// The boost is derived lazily from the wait time; it only ever grows
    /// while the task stays pending.
    pub(crate) fn apply_priority_boosts(&mut self, boost_interval: u64, boost_amount: f64) {
        if boost_interval == 0 {
            return;
        }

        let now = Utc::now();
        for (task_id, enqueue_time) in &self.task_enqueue_times {
            if self.task_states.get(task_id) != Some(&TaskState::Pending) {
                continue;
            }

            let waited = (now - *enqueue_time).num_seconds().max(0) as u64;
            let intervals_passed = waited / boost_interval;
            if intervals_passed == 0 {
                continue;
            }

            let new_boost = intervals_passed as f64 * boost_amount;
            let current = self.task_boost_levels.entry(task_id.clone()).or_insert(0.0);
            if new_boost > *current {
                *current = new_boost;
            }
        }
    }

    pub(crate) fn effective_priority(&self, task_id: &str, priority: u8) -> f64 {
        priority as f64 + self.task_boost_levels.get(task_id).copied().unwrap_or(0.0)
    }

    /// Whether the worker's capability set covers the task's required agent
    /// role. Always true while capability matching is disabled.
    pub(crate) fn worker_can_handle(&self, worker_id: &str, task: &Task) -> bool {
        if !self.capability_matching_enabled {
            return true;
        }

        let Some(worker) = self.workers.get(worker_id) else {
            return false;
        };

        let required: AgentType = task.task_type.required_agent();
        worker.capabilities.agent_types.contains(&required)
    }

    /// Tear down the assignment tables for a task, returning the worker that
    /// held it.
    pub(crate) fn remove_assignment_for_task(&mut self, task_id: &str) -> Option<String> {
        let assignment_id = self
            .assignment_to_task
            .iter()
            .find(|(_, tid)| tid.as_str() == task_id)
            .map(|(aid, _)| aid.clone())?;

        self.assignments.remove(&assignment_id);
        self.assignment_to_task.remove(&assignment_id);
        self.assignment_to_worker.remove(&assignment_id)
    }

    /// Return a worker to idle after its task reached a resolution.
    pub(crate) fn release_worker(&mut self, worker_id: &str) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            if worker.state == WorkerState::Active {
                worker.state = WorkerState::Idle;
            }
            worker.assigned_task = None;
        }
        self.active_workers.remove(worker_id);
    }

    /// Reset a task to pending and put it back in its band.
    ///
    /// Worker-death reclamation inserts at the front so the task is served
    /// next; acknowledgement timeouts and retries append at the tail.
    pub(crate) fn requeue_pending(&mut self, task_id: &str, front: bool) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.state = TaskState::Pending;
            task.assigned_to = None;
            task.assigned_at = None;

            let priority = task.priority;
            self.task_states
                .insert(task_id.to_string(), TaskState::Pending);
            if let Some(band) = self.band_mut(priority) {
                if front {
                    band.push_front(task_id.to_string());
                } else {
                    band.push_back(task_id.to_string());
                }
            }
        }
    }

    pub(crate) fn record_failure(
        &mut self,
        task_id: &str,
        worker_id: &str,
        reason: FailureReason,
        error: Option<TaskError>,
    ) {
        self.task_failure_history
            .entry(task_id.to_string())
            .or_default()
            .push(FailureRecord {
                worker_id: worker_id.to_string(),
                reason,
                error,
                timestamp: Utc::now(),
            });
    }

    /// Count of worker-failure reassignments, derived from the failure
    /// history rather than stored.
    pub(crate) fn reassignment_count(&self, task_id: &str) -> usize {
        self.task_failure_history
            .get(task_id)
            .map(|history| {
                history
                    .iter()
                    .filter(|record| record.reason == FailureReason::WorkerFailure)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Mark a worker failed and reclaim any task it holds
    ///
    /// The task is recorded as a `worker_failure` in its history and goes
    /// back to the *front* of its band for quick reassignment.
    pub(crate) fn mark_worker_failed(&mut self, worker_id: &str) -> Vec<String> {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return Vec::new();
        };
        worker.state = WorkerState::Failed;
        self.active_workers.remove(worker_id);

        let held: Vec<String> = self
            .assignment_to_worker
            .iter()
            .filter(|(_, wid)| wid.as_str() == worker_id)
            .map(|(aid, _)| aid.clone())
            .collect();

        let mut reassigned = Vec::new();
        for assignment_id in held {
            let Some(task_id) = self.assignment_to_task.get(&assignment_id).cloned() else {
                continue;
            };

            self.record_failure(&task_id, worker_id, FailureReason::WorkerFailure, None);
            self.requeue_pending(&task_id, true);

            self.assignments.remove(&assignment_id);
            self.assignment_to_task.remove(&assignment_id);
            self.assignment_to_worker.remove(&assignment_id);

            reassigned.push(task_id);
        }

        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.assigned_task = None;
        }

        reassigned
    }

    /// Wipe every table. Used by snapshot import before rehydration.
    pub(crate) fn clear(&mut self) {
        self.bands = [VecDeque::new(), VecDeque::new(), VecDeque::new()];
        self.tasks.clear();
        self.task_states.clear();
        self.task_retry_counts.clear();
        self.task_failure_history.clear();
        self.task_enqueue_times.clear();
        self.task_boost_levels.clear();
        self.task_progress.clear();
        self.workers.clear();
        self.active_workers.clear();
        self.assignments.clear();
        self.assignment_to_task.clear();
        self.assignment_to_worker.clear();
        self.dead_letter_queue.clear();
        self.dlq_metadata.clear();
        self.displaced_tasks = 0;
        for counter in self.displacement_by_priority.values_mut() {
            *counter = 0;
        }
    }
}
