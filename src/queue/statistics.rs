use crate::{
    models::{AgentType, FailureRecord, TaskState},
    queue::{state::band_name, worker::WorkerState, TaskQueue},
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Per-band counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BandCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

/// Task counts per lifecycle state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskStateCounts {
    pub pending: usize,
    pub assigned: usize,
    pub executing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Worker counts per registry state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerCounts {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub failed: usize,
}

/// How close the queue is to its configured capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityStatus {
    Normal,
    Warning,
    Critical,
    Full,
}

/// Overall queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatistics {
    pub total_tasks: usize,
    pub depth_by_priority: BandCounts,
    pub task_states: TaskStateCounts,
    pub worker_stats: WorkerCounts,
    pub active_assignments: usize,
    pub capacity_percentage: f64,
    pub capacity_status: CapacityStatus,
    pub displaced_tasks: u64,
}

/// Completion throughput over recent windows
#[derive(Debug, Clone, Serialize)]
pub struct ThroughputMetrics {
    pub completed_last_minute: usize,
    pub completed_last_hour: usize,
    pub throughput_per_minute: usize,
    pub active_tasks: usize,
}

/// Average time tasks waited before assignment
#[derive(Debug, Clone, Serialize)]
pub struct WaitTimeStatistics {
    pub average_overall_secs: f64,
    pub average_by_priority: HashMap<String, f64>,
    pub sample_size: usize,
}

/// Retry counters across all tasks
#[derive(Debug, Clone, Serialize)]
pub struct RetryStatistics {
    pub total_retries: u64,
    pub tasks_with_retries: usize,
    pub max_retry_count: u32,
    pub retry_by_task_type: HashMap<String, u64>,
}

/// Per-band capacity usage
#[derive(Debug, Clone, Serialize)]
pub struct BandCapacity {
    pub used: usize,
    pub limit: usize,
    pub utilization_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapacityWarnings {
    pub near_capacity: bool,
    pub at_capacity: bool,
    pub priority_at_limit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapacityStatistics {
    pub max_capacity: usize,
    pub current_size: usize,
    pub utilization_percent: f64,
    pub capacity_by_priority: HashMap<String, BandCapacity>,
    pub warnings: CapacityWarnings,
}

/// The longest-waiting pending task
#[derive(Debug, Clone, Serialize)]
pub struct OldestWaitingTask {
    pub task_id: String,
    pub priority: &'static str,
    pub wait_time_secs: f64,
}

/// How starved the pending population currently is
#[derive(Debug, Clone, Serialize)]
pub struct StarvationStatistics {
    pub starved_tasks: usize,
    pub starved_task_ids: Vec<String>,
    pub oldest_waiting_task: Option<OldestWaitingTask>,
    pub starvation_threshold_secs: u64,
    pub tasks_boosted: usize,
    pub max_wait_time_secs: f64,
}

/// Worker heartbeat health
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatMetrics {
    pub total_workers: usize,
    pub healthy_workers: usize,
    pub failed_workers: usize,
    pub average_heartbeat_age_secs: f64,
}

/// Displacement counters
#[derive(Debug, Clone, Serialize)]
pub struct OverflowStatistics {
    pub total_displaced: u64,
    pub displacement_by_priority: HashMap<String, u64>,
}

/// Dead-letter queue summary
#[derive(Debug, Clone, Serialize)]
pub struct DlqStatistics {
    pub total_tasks: usize,
    pub by_reason: HashMap<String, u64>,
}

/// Task and worker counts for one agent role
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentTypeMetrics {
    pub pending_tasks: usize,
    pub executing_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub capable_workers: usize,
}

/// Everything the statistics suite offers, in one value
#[derive(Debug, Clone, Serialize)]
pub struct DetailedMetrics {
    pub queue_statistics: QueueStatistics,
    pub throughput_metrics: ThroughputMetrics,
    pub wait_time_statistics: WaitTimeStatistics,
    pub retry_statistics: RetryStatistics,
    pub capacity_statistics: CapacityStatistics,
    pub starvation_statistics: StarvationStatistics,
    pub heartbeat_metrics: HeartbeatMetrics,
    pub timestamp: DateTime<Utc>,
}

/// Detailed view of one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub task_type: String,
    pub state: TaskState,
    pub priority: u8,
    pub effective_priority: f64,
    pub wait_time_secs: f64,
    pub retry_count: u32,
    pub reassignment_count: usize,
    pub previous_workers: Vec<String>,
    /// Scheduling hint: the task was previously reclaimed from a failed
    /// worker. The dequeue algorithm does not act on it.
    pub prefer_different_worker: bool,
    pub failure_history: Vec<FailureRecord>,
    pub progress: Map<String, Value>,
    pub assigned_to: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
}

fn seconds(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1000.0
}

impl TaskQueue {
    /// Overall queue statistics
    pub async fn get_queue_statistics(&self) -> QueueStatistics {
        let st = self.state.lock().await;

        let depth_by_priority = BandCounts {
            high: st.bands[2].len(),
            medium: st.bands[1].len(),
            low: st.bands[0].len(),
        };

        let mut task_states = TaskStateCounts::default();
        for state in st.task_states.values() {
            match state {
                TaskState::Pending => task_states.pending += 1,
                TaskState::Assigned => task_states.assigned += 1,
                TaskState::Executing => task_states.executing += 1,
                TaskState::Completed => task_states.completed += 1,
                TaskState::Failed => task_states.failed += 1,
            }
        }

        let failed_workers = st
            .workers
            .values()
            .filter(|w| w.state == WorkerState::Failed)
            .count();
        let worker_stats = WorkerCounts {
            total: st.workers.len(),
            idle: st.workers.len() - st.active_workers.len(),
            active: st.active_workers.len(),
            failed: failed_workers,
        };

        let current_size = st.total_size();
        let capacity_percentage = if self.config.max_queue_size > 0 {
            current_size as f64 / self.config.max_queue_size as f64 * 100.0
        } else {
            0.0
        };
        let capacity_status = if capacity_percentage >= 100.0 {
            CapacityStatus::Full
        } else if capacity_percentage >= 95.0 {
            CapacityStatus::Critical
        } else if capacity_percentage >= 80.0 {
            CapacityStatus::Warning
        } else {
            CapacityStatus::Normal
        };

        QueueStatistics {
            total_tasks: current_size,
            depth_by_priority,
            task_states,
            worker_stats,
            active_assignments: st.assignments.len(),
            capacity_percentage,
            capacity_status,
            displaced_tasks: st.displaced_tasks,
        }
    }

    /// Completion throughput over the last minute and hour
    pub async fn get_throughput_metrics(&self) -> ThroughputMetrics {
        let st = self.state.lock().await;
        let now = Utc::now();
        let one_minute_ago = now - Duration::minutes(1);
        let one_hour_ago = now - Duration::hours(1);

        let mut completed_last_minute = 0;
        let mut completed_last_hour = 0;
        for task in st.tasks.values() {
            if task.state != TaskState::Completed {
                continue;
            }
            if let Some(completed_at) = task.completed_at {
                if completed_at >= one_minute_ago {
                    completed_last_minute += 1;
                }
                if completed_at >= one_hour_ago {
                    completed_last_hour += 1;
                }
            }
        }

        ThroughputMetrics {
            completed_last_minute,
            completed_last_hour,
            throughput_per_minute: completed_last_minute,
            active_tasks: st.assignments.len(),
        }
    }

    /// Average wait between enqueue and assignment
    pub async fn get_wait_time_statistics(&self) -> WaitTimeStatistics {
        let st = self.state.lock().await;

        let mut wait_times = Vec::new();
        let mut by_priority: HashMap<String, Vec<f64>> = HashMap::new();
        for (task_id, task) in &st.tasks {
            let (Some(assigned_at), Some(enqueued_at)) =
                (task.assigned_at, st.task_enqueue_times.get(task_id))
            else {
                continue;
            };
            let wait = seconds(assigned_at - *enqueued_at);
            wait_times.push(wait);
            by_priority
                .entry(band_name(task.priority).to_string())
                .or_default()
                .push(wait);
        }

        let average = |values: &[f64]| {
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        };

        let mut average_by_priority = HashMap::new();
        for band in ["high", "medium", "low"] {
            let values = by_priority.remove(band).unwrap_or_default();
            average_by_priority.insert(band.to_string(), average(&values));
        }

        WaitTimeStatistics {
            average_overall_secs: average(&wait_times),
            average_by_priority,
            sample_size: wait_times.len(),
        }
    }

    /// Retry counters, including a per-task-type breakdown
    pub async fn get_retry_statistics(&self) -> RetryStatistics {
        let st = self.state.lock().await;

        let total_retries = st.task_retry_counts.values().map(|c| *c as u64).sum();
        let max_retry_count = st.task_retry_counts.values().copied().max().unwrap_or(0);

        let mut retry_by_task_type: HashMap<String, u64> = HashMap::new();
        for (task_id, count) in &st.task_retry_counts {
            if let Some(task) = st.tasks.get(task_id) {
                *retry_by_task_type
                    .entry(task.task_type.as_str().to_string())
                    .or_insert(0) += *count as u64;
            }
        }

        RetryStatistics {
            total_retries,
            tasks_with_retries: st.task_retry_counts.len(),
            max_retry_count,
            retry_by_task_type,
        }
    }

    /// Capacity usage against the configured total and per-band quotas
    pub async fn get_capacity_statistics(&self) -> CapacityStatistics {
        let st = self.state.lock().await;

        let current_size = st.total_size();
        let max_capacity = self.config.max_queue_size;
        let utilization_percent = if max_capacity > 0 {
            current_size as f64 / max_capacity as f64 * 100.0
        } else {
            0.0
        };

        let mut capacity_by_priority = HashMap::new();
        for priority in [3u8, 2, 1] {
            let band = band_name(priority);
            let used = st.bands[priority as usize - 1].len();
            let limit = self.config.quota_for(band);
            capacity_by_priority.insert(
                band.to_string(),
                BandCapacity {
                    used,
                    limit,
                    utilization_percent: if limit > 0 {
                        used as f64 / limit as f64 * 100.0
                    } else {
                        0.0
                    },
                },
            );
        }

        let priority_at_limit = capacity_by_priority
            .values()
            .any(|band| band.utilization_percent >= 100.0);

        CapacityStatistics {
            max_capacity,
            current_size,
            utilization_percent,
            capacity_by_priority,
            warnings: CapacityWarnings {
                near_capacity: utilization_percent >= 80.0,
                at_capacity: utilization_percent >= 100.0,
                priority_at_limit,
            },
        }
    }

    /// Starvation picture for the pending population
    ///
    /// Wait times are measured from the enqueue time, the same clock that
    /// drives priority boosting.
    pub async fn get_starvation_statistics(&self) -> StarvationStatistics {
        let st = self.state.lock().await;
        let now = Utc::now();
        let threshold = Duration::seconds(self.config.starvation_threshold as i64);

        let mut starved_task_ids = Vec::new();
        let mut oldest: Option<OldestWaitingTask> = None;
        let mut tasks_boosted = 0;
        let mut max_wait = 0.0f64;

        for priority in [1u8, 2, 3] {
            for task_id in &st.bands[priority as usize - 1] {
                let Some(enqueued_at) = st.task_enqueue_times.get(task_id) else {
                    continue;
                };
                let waited = now - *enqueued_at;
                let waited_secs = seconds(waited);

                if waited > threshold {
                    starved_task_ids.push(task_id.clone());
                }
                if st.task_boost_levels.get(task_id).copied().unwrap_or(0.0) > 0.0 {
                    tasks_boosted += 1;
                }
                if waited_secs > max_wait {
                    max_wait = waited_secs;
                    oldest = Some(OldestWaitingTask {
                        task_id: task_id.clone(),
                        priority: band_name(priority),
                        wait_time_secs: waited_secs,
                    });
                }
            }
        }

        StarvationStatistics {
            starved_tasks: starved_task_ids.len(),
            starved_task_ids,
            oldest_waiting_task: oldest,
            starvation_threshold_secs: self.config.starvation_threshold,
            tasks_boosted,
            max_wait_time_secs: max_wait,
        }
    }

    /// Worker heartbeat health summary
    pub async fn get_heartbeat_metrics(&self) -> HeartbeatMetrics {
        let st = self.state.lock().await;
        let now = Utc::now();

        let total_workers = st.workers.len();
        let failed_workers = st
            .workers
            .values()
            .filter(|w| w.state == WorkerState::Failed)
            .count();

        let ages: Vec<f64> = st
            .workers
            .values()
            .filter(|w| w.state != WorkerState::Failed)
            .map(|w| seconds(now - w.last_heartbeat))
            .collect();
        let average_heartbeat_age_secs = if ages.is_empty() {
            0.0
        } else {
            ages.iter().sum::<f64>() / ages.len() as f64
        };

        HeartbeatMetrics {
            total_workers,
            healthy_workers: total_workers - failed_workers,
            failed_workers,
            average_heartbeat_age_secs,
        }
    }

    /// Displacement counters
    pub async fn get_overflow_statistics(&self) -> OverflowStatistics {
        let st = self.state.lock().await;
        OverflowStatistics {
            total_displaced: st.displaced_tasks,
            displacement_by_priority: st.displacement_by_priority.clone(),
        }
    }

    /// Task and worker counts broken down by agent role
    pub async fn get_metrics_by_agent_type(&self) -> HashMap<AgentType, AgentTypeMetrics> {
        let st = self.state.lock().await;

        let mut metrics: HashMap<AgentType, AgentTypeMetrics> = AgentType::ALL
            .into_iter()
            .map(|agent| (agent, AgentTypeMetrics::default()))
            .collect();

        for (task_id, task) in &st.tasks {
            let entry = metrics.entry(task.task_type.required_agent()).or_default();
            match st.task_states.get(task_id).copied().unwrap_or(task.state) {
                TaskState::Pending => entry.pending_tasks += 1,
                TaskState::Executing => entry.executing_tasks += 1,
                TaskState::Completed => entry.completed_tasks += 1,
                TaskState::Failed => entry.failed_tasks += 1,
                TaskState::Assigned => {}
            }
        }

        for worker in st.workers.values() {
            for agent in &worker.capabilities.agent_types {
                if let Some(entry) = metrics.get_mut(agent) {
                    entry.capable_workers += 1;
                }
            }
        }

        metrics
    }

    /// All statistics in one linearisable-ish read (each section takes the
    /// lock separately)
    pub async fn get_detailed_metrics(&self) -> DetailedMetrics {
        DetailedMetrics {
            queue_statistics: self.get_queue_statistics().await,
            throughput_metrics: self.get_throughput_metrics().await,
            wait_time_statistics: self.get_wait_time_statistics().await,
            retry_statistics: self.get_retry_statistics().await,
            capacity_statistics: self.get_capacity_statistics().await,
            starvation_statistics: self.get_starvation_statistics().await,
            heartbeat_metrics: self.get_heartbeat_metrics().await,
            timestamp: Utc::now(),
        }
    }

    /// Detailed view of one task, or `None` if it is unknown
    pub async fn get_task_info(&self, task_id: &str) -> Option<TaskInfo> {
        let st = self.state.lock().await;
        let task = st.tasks.get(task_id)?;

        let wait_time_secs = match (st.task_enqueue_times.get(task_id), task.assigned_at) {
            (Some(enqueued_at), Some(assigned_at)) => seconds(assigned_at - *enqueued_at),
            (Some(enqueued_at), None) => seconds(Utc::now() - *enqueued_at),
            (None, _) => 0.0,
        };

        let reassignment_count = st.reassignment_count(task_id);
        let previous_workers: Vec<String> = st
            .task_failure_history
            .get(task_id)
            .map(|history| {
                history
                    .iter()
                    .filter(|record| record.reason == crate::models::FailureReason::WorkerFailure)
                    .map(|record| record.worker_id.clone())
                    .collect()
            })
            .unwrap_or_default();

        Some(TaskInfo {
            task_id: task_id.to_string(),
            task_type: task.task_type.as_str().to_string(),
            state: st.task_states.get(task_id).copied().unwrap_or(task.state),
            priority: task.priority,
            effective_priority: st.effective_priority(task_id, task.priority),
            wait_time_secs,
            retry_count: st.task_retry_counts.get(task_id).copied().unwrap_or(0),
            reassignment_count,
            previous_workers,
            prefer_different_worker: reassignment_count > 0,
            failure_history: st.task_failure_history.get(task_id).cloned().unwrap_or_default(),
            progress: st.task_progress.get(task_id).cloned().unwrap_or_default(),
            assigned_to: task.assigned_to.clone(),
            assigned_at: task.assigned_at,
        })
    }
}
