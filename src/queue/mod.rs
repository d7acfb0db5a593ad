use crate::{
    config::{OverflowStrategy, QueueConfig},
    models::{FailureReason, Task, TaskError, TaskState},
    CoScientistError, Result,
};
use chrono::{Duration, Utc};
use serde_json::{Map, Value};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

mod dlq;
mod monitor;
mod persistence;
mod state;
mod statistics;
mod worker;

#[cfg(test)]
mod tests;

pub use persistence::{QueueSnapshot, SnapshotQueues};
pub use state::{DlqEntry, DlqReason, TaskAssignment};
pub use statistics::{
    AgentTypeMetrics, BandCapacity, BandCounts, CapacityStatistics, CapacityStatus,
    CapacityWarnings, DetailedMetrics, DlqStatistics, HeartbeatMetrics, OldestWaitingTask,
    OverflowStatistics, QueueStatistics, RetryStatistics, StarvationStatistics, TaskInfo,
    TaskStateCounts, ThroughputMetrics, WaitTimeStatistics, WorkerCounts,
};
pub use worker::{WorkerCapabilities, WorkerInfo, WorkerState, WorkerStatus};

use state::{band_name, QueueState};

/// Priority task queue coordinating every agent in the system
///
/// Three FIFO bands with per-band quotas and overflow displacement, worker
/// leases with acknowledgement deadlines, retry policy with a dead-letter
/// queue, starvation boosting, and an atomic JSON snapshot. All mutations
/// serialise under one internal mutex; background monitors take it briefly
/// each tick.
#[derive(Clone)]
pub struct TaskQueue {
    pub(crate) config: Arc<QueueConfig>,
    pub(crate) state: Arc<Mutex<QueueState>>,

    pub(crate) monitoring_stopped: Arc<AtomicBool>,
    pub(crate) ack_monitoring_stopped: Arc<AtomicBool>,
    pub(crate) persistence_stopped: Arc<AtomicBool>,
    pub(crate) monitoring_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    pub(crate) ack_monitoring_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    pub(crate) persistence_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    initialized: Arc<AtomicBool>,
}

impl TaskQueue {
    /// Create a queue with the given configuration
    ///
    /// Fails with a configuration error if the capacity or quota settings
    /// are inconsistent.
    pub fn new(config: QueueConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(QueueState::new())),
            monitoring_stopped: Arc::new(AtomicBool::new(false)),
            ack_monitoring_stopped: Arc::new(AtomicBool::new(false)),
            persistence_stopped: Arc::new(AtomicBool::new(false)),
            monitoring_handle: Arc::new(Mutex::new(None)),
            ack_monitoring_handle: Arc::new(Mutex::new(None)),
            persistence_handle: Arc::new(Mutex::new(None)),
            initialized: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// One-time startup: optional snapshot recovery plus the configured
    /// background loops
    ///
    /// A missing snapshot is benign and a corrupted one starts the queue
    /// empty with a logged warning; only an incompatible snapshot version
    /// fails initialization.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.config.auto_recovery && self.config.persistence_path.is_some() {
            match self.load_state().await {
                Ok(()) => {}
                Err(e @ CoScientistError::VersionMismatch { .. }) => return Err(e),
                Err(e) => {
                    warn!("Could not recover queue state, starting empty: {}", e);
                }
            }
        }

        if self.config.auto_start_persistence {
            self.start_persistence().await;
        }

        if self.config.auto_start_monitoring {
            self.start_monitoring().await;
            self.start_ack_monitoring().await;
        }

        Ok(())
    }

    /// Total number of pending tasks across all bands
    pub async fn size(&self) -> usize {
        self.state.lock().await.total_size()
    }

    /// Number of pending tasks in one band ("high", "medium" or "low")
    pub async fn size_by_priority(&self, band: &str) -> usize {
        let priority = match band {
            "high" => 3,
            "medium" => 2,
            "low" => 1,
            _ => return 0,
        };
        let st = self.state.lock().await;
        st.band(priority).map(|queue| queue.len()).unwrap_or(0)
    }

    pub async fn active_workers(&self) -> usize {
        self.state.lock().await.active_workers.len()
    }

    pub async fn idle_workers(&self) -> usize {
        let st = self.state.lock().await;
        st.workers.len() - st.active_workers.len()
    }

    /// Add a task to its priority band
    ///
    /// At total capacity a strictly higher-priority task may displace the
    /// oldest task of a lower band; otherwise the enqueue fails with
    /// `QueueFull` / `BandFull`.
    pub async fn enqueue(&self, mut task: Task) -> Result<String> {
        if !(1..=3).contains(&task.priority) {
            return Err(CoScientistError::InvalidArgument(format!(
                "Invalid priority: {}",
                task.priority
            )));
        }
        let band = band_name(task.priority);

        let mut st = self.state.lock().await;

        let mut displaced_for_capacity = false;
        if st.total_size() >= self.config.max_queue_size {
            let can_displace = self.config.overflow_strategy
                == OverflowStrategy::DisplaceOldestLowPriority
                && task.priority > 1;
            if !(can_displace && st.displace_lower_priority(task.priority)) {
                return Err(CoScientistError::QueueFull);
            }
            displaced_for_capacity = true;
        }

        // The band quota only needs checking when displacement did not just
        // free total capacity; displacing for quota leaves this band allowed
        // to exceed its share while a lower band shrank.
        let band_len = st.band(task.priority).map(|queue| queue.len()).unwrap_or(0);
        if !displaced_for_capacity && band_len >= self.config.quota_for(band) {
            let can_displace = task.priority > 1
                && self.config.overflow_strategy == OverflowStrategy::DisplaceOldestLowPriority;
            if !(can_displace && st.displace_lower_priority(task.priority)) {
                return Err(CoScientistError::BandFull { band });
            }
        }

        task.state = TaskState::Pending;
        let task_id = task.id.to_string();
        let priority = task.priority;
        let now = Utc::now();

        st.task_states.insert(task_id.clone(), TaskState::Pending);
        st.task_enqueue_times.insert(task_id.clone(), now);
        st.task_boost_levels.insert(task_id.clone(), 0.0);
        st.tasks.insert(task_id.clone(), task);
        if let Some(queue) = st.band_mut(priority) {
            queue.push_back(task_id.clone());
        }

        debug!("Task {} enqueued to {} band", task_id, band);
        Ok(task_id)
    }

    /// Hand the best matching pending task to a worker
    ///
    /// Unknown workers are auto-registered with empty capabilities.
    /// Starvation boosts are recomputed first; candidates are ordered by
    /// effective priority with FIFO tie-breaking. Returns `None` when no
    /// pending task matches the worker's capabilities.
    pub async fn dequeue(&self, worker_id: &str) -> Result<Option<TaskAssignment>> {
        let mut st = self.state.lock().await;

        if !st.workers.contains_key(worker_id) {
            st.workers.insert(
                worker_id.to_string(),
                WorkerInfo::new(worker_id, WorkerCapabilities::default()),
            );
            debug!("Auto-registered worker {} on dequeue", worker_id);
        }

        st.apply_priority_boosts(
            self.config.priority_boost_interval,
            self.config.priority_boost_amount,
        );

        let mut candidates: Vec<(String, u8, f64)> = Vec::new();
        for priority in [3u8, 2, 1] {
            let Some(queue) = st.band(priority) else {
                continue;
            };
            for task_id in queue {
                let Some(task) = st.tasks.get(task_id) else {
                    continue;
                };
                if st.worker_can_handle(worker_id, task) {
                    candidates.push((
                        task_id.clone(),
                        priority,
                        st.effective_priority(task_id, task.priority),
                    ));
                }
            }
        }

        // Stable sort keeps band order and FIFO order for equal effective
        // priorities.
        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let Some((task_id, priority, _)) = candidates.into_iter().next() else {
            return Ok(None);
        };

        if let Some(queue) = st.band_mut(priority) {
            if let Some(pos) = queue.iter().position(|id| *id == task_id) {
                queue.remove(pos);
            }
        }

        let now = Utc::now();
        let task_copy = {
            let task = st
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| CoScientistError::UnknownTask(task_id.clone()))?;
            task.assign(worker_id)?;
            task.clone()
        };
        st.task_states.insert(task_id.clone(), TaskState::Assigned);
        st.active_workers.insert(worker_id.to_string());

        if let Some(worker) = st.workers.get_mut(worker_id) {
            worker.state = WorkerState::Active;
            worker.assigned_task = Some(task_id.clone());
            worker.last_heartbeat = now;
        }

        let assignment = TaskAssignment {
            task: task_copy,
            assignment_id: Uuid::new_v4().to_string(),
            worker_id: worker_id.to_string(),
            deadline: now + Duration::seconds(self.config.worker_timeout as i64),
            acknowledgment_required_by: now
                + Duration::seconds(self.config.acknowledgment_timeout as i64),
        };

        st.assignments
            .insert(assignment.assignment_id.clone(), assignment.clone());
        st.assignment_to_task
            .insert(assignment.assignment_id.clone(), task_id.clone());
        st.assignment_to_worker
            .insert(assignment.assignment_id.clone(), worker_id.to_string());

        debug!("Task {} assigned to worker {}", task_id, worker_id);
        Ok(Some(assignment))
    }

    /// Head task of the highest non-empty band, without mutation
    pub async fn peek(&self) -> Option<Task> {
        let st = self.state.lock().await;
        for priority in [3u8, 2, 1] {
            if let Some(task_id) = st.band(priority).and_then(|queue| queue.front()) {
                return st.tasks.get(task_id).cloned();
            }
        }
        None
    }

    pub async fn get_task_state(&self, task_id: &str) -> Option<TaskState> {
        self.state.lock().await.task_states.get(task_id).copied()
    }

    /// Acknowledge an assignment, transitioning the task to executing
    ///
    /// Returns false when the assignment no longer exists (e.g. the
    /// acknowledgement window elapsed), belongs to a different worker, or
    /// the task already left the assigned state.
    pub async fn acknowledge_task(&self, worker_id: &str, assignment_id: &str) -> bool {
        let mut st = self.state.lock().await;

        if st.assignment_to_worker.get(assignment_id).map(String::as_str) != Some(worker_id) {
            return false;
        }
        let Some(task_id) = st.assignment_to_task.get(assignment_id).cloned() else {
            return false;
        };
        if st.task_states.get(&task_id) != Some(&TaskState::Assigned) {
            return false;
        }

        let Some(task) = st.tasks.get_mut(&task_id) else {
            return false;
        };
        if task.start_execution().is_err() {
            return false;
        }
        st.task_states.insert(task_id, TaskState::Executing);
        true
    }

    /// Record a successful completion
    ///
    /// Returns false if the task is not owned by `worker_id` or already
    /// terminal. The assignment is destroyed and the worker returns to idle.
    pub async fn complete_task(
        &self,
        worker_id: &str,
        task_id: &str,
        result: Map<String, Value>,
    ) -> bool {
        let mut st = self.state.lock().await;

        let owned = st
            .tasks
            .get(task_id)
            .map(|task| task.assigned_to.as_deref() == Some(worker_id))
            .unwrap_or(false);
        if !owned {
            return false;
        }
        if matches!(
            st.task_states.get(task_id),
            Some(TaskState::Completed | TaskState::Failed)
        ) {
            return false;
        }

        let now = Utc::now();
        if let Some(task) = st.tasks.get_mut(task_id) {
            task.state = TaskState::Completed;
            task.result = Some(result);
            task.completed_at = Some(now);
        }
        st.task_states
            .insert(task_id.to_string(), TaskState::Completed);

        st.remove_assignment_for_task(task_id);
        st.release_worker(worker_id);

        info!("Task {} completed by worker {}", task_id, worker_id);
        true
    }

    /// Record a failure and apply the retry policy
    ///
    /// A retryable failure below the attempt limit re-queues the task at the
    /// tail of its band; otherwise the task is failed and, if configured,
    /// dead-lettered with the appropriate reason.
    pub async fn fail_task(&self, worker_id: &str, task_id: &str, error: TaskError) -> bool {
        let mut st = self.state.lock().await;

        let owned = st
            .tasks
            .get(task_id)
            .map(|task| task.assigned_to.as_deref() == Some(worker_id))
            .unwrap_or(false);
        if !owned {
            return false;
        }
        if matches!(
            st.task_states.get(task_id),
            Some(TaskState::Completed | TaskState::Failed)
        ) {
            return false;
        }

        st.record_failure(
            task_id,
            worker_id,
            FailureReason::TaskFailed,
            Some(error.clone()),
        );
        st.remove_assignment_for_task(task_id);
        st.release_worker(worker_id);

        let retry_count = st.task_retry_counts.get(task_id).copied().unwrap_or(0);
        let policy = &self.config.retry_policy;

        if error.retryable && retry_count < policy.max_attempts.saturating_sub(1) {
            st.task_retry_counts
                .insert(task_id.to_string(), retry_count + 1);
            st.requeue_pending(task_id, false);
            info!(
                "Task {} failed (attempt {}), re-queued for retry",
                task_id,
                retry_count + 1
            );
        } else {
            let now = Utc::now();
            if let Some(task) = st.tasks.get_mut(task_id) {
                task.state = TaskState::Failed;
                task.error = Some(error.message.clone());
                task.completed_at = Some(now);
            }
            st.task_states.insert(task_id.to_string(), TaskState::Failed);

            if policy.send_to_dlq {
                let reason = if !error.retryable {
                    DlqReason::NonRetryableError
                } else {
                    DlqReason::RetryExhaustion
                };
                st.dead_letter_queue.push_back(task_id.to_string());
                st.dlq_metadata.insert(
                    task_id.to_string(),
                    DlqEntry {
                        reason,
                        error,
                        retry_count: retry_count + 1,
                        timestamp: now,
                    },
                );
                warn!("Task {} dead-lettered ({})", task_id, reason.as_str());
            } else {
                warn!("Task {} permanently failed", task_id);
            }
        }

        true
    }

    pub async fn enable_capability_matching(&self) {
        self.state.lock().await.capability_matching_enabled = true;
    }

    pub async fn disable_capability_matching(&self) {
        self.state.lock().await.capability_matching_enabled = false;
    }

    pub async fn capability_matching_enabled(&self) -> bool {
        self.state.lock().await.capability_matching_enabled
    }
}
