use crate::{
    models::TaskState,
    queue::{worker::WorkerState, TaskQueue},
};
use chrono::{Duration, Utc};
use std::{collections::HashSet, sync::atomic::Ordering};
use tracing::{info, warn};

impl TaskQueue {
    /// Workers whose heartbeat is older than the timeout
    ///
    /// Workers already marked failed are not re-reported.
    pub async fn check_dead_workers(&self) -> HashSet<String> {
        let st = self.state.lock().await;
        let now = Utc::now();
        let timeout = Duration::seconds(self.config.heartbeat_timeout as i64);

        st.workers
            .iter()
            .filter(|(_, info)| {
                info.state != WorkerState::Failed && now - info.last_heartbeat > timeout
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// One heartbeat-monitor tick: fail every dead worker and reclaim its
    /// task
    pub async fn process_dead_workers(&self) {
        let mut st = self.state.lock().await;
        let now = Utc::now();
        let timeout = Duration::seconds(self.config.heartbeat_timeout as i64);

        let dead: Vec<String> = st
            .workers
            .iter()
            .filter(|(_, info)| {
                info.state != WorkerState::Failed && now - info.last_heartbeat > timeout
            })
            .map(|(id, _)| id.clone())
            .collect();

        for worker_id in dead {
            let reassigned = st.mark_worker_failed(&worker_id);
            warn!(
                "Worker {} missed heartbeats, marked failed ({} task(s) re-queued)",
                worker_id,
                reassigned.len()
            );
        }

        // An expired lease deadline counts as worker death, even if the
        // worker still heartbeats.
        let expired: Vec<String> = st
            .assignments
            .values()
            .filter(|assignment| assignment.deadline < now)
            .map(|assignment| assignment.worker_id.clone())
            .collect();
        for worker_id in expired {
            let reassigned = st.mark_worker_failed(&worker_id);
            warn!(
                "Worker {} exceeded its lease deadline, marked failed ({} task(s) re-queued)",
                worker_id,
                reassigned.len()
            );
        }
    }

    /// One ack-monitor tick: return unacknowledged assignments to the
    /// pending band
    ///
    /// Timed-out tasks go to the *tail* of their band so a silent worker is
    /// not immediately handed the same task again.
    pub async fn check_assignment_timeouts(&self) {
        let mut st = self.state.lock().await;
        let now = Utc::now();

        let timed_out: Vec<(String, String)> = st
            .assignments
            .iter()
            .filter(|(_, assignment)| assignment.acknowledgment_required_by < now)
            .filter_map(|(assignment_id, _)| {
                let task_id = st.assignment_to_task.get(assignment_id)?;
                (st.task_states.get(task_id) == Some(&TaskState::Assigned))
                    .then(|| (assignment_id.clone(), task_id.clone()))
            })
            .collect();

        for (assignment_id, task_id) in timed_out {
            st.requeue_pending(&task_id, false);

            let worker_id = st.assignment_to_worker.get(&assignment_id).cloned();
            st.assignments.remove(&assignment_id);
            st.assignment_to_task.remove(&assignment_id);
            st.assignment_to_worker.remove(&assignment_id);

            if let Some(worker_id) = worker_id {
                st.release_worker(&worker_id);
                warn!(
                    "Assignment {} for task {} not acknowledged by {}, re-queued",
                    assignment_id, task_id, worker_id
                );
            }
        }
    }

    /// Start the background heartbeat monitor
    ///
    /// Runs one tick every `heartbeat_check_interval` seconds until
    /// [`TaskQueue::stop_monitoring`] is called. The lock is only held per
    /// tick, never across the sleep.
    pub async fn start_monitoring(&self) {
        let mut handle_guard = self.monitoring_handle.lock().await;
        if handle_guard.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        self.monitoring_stopped.store(false, Ordering::SeqCst);
        let queue = self.clone();
        let interval = self.config.heartbeat_check_interval;

        *handle_guard = Some(tokio::spawn(async move {
            info!("Heartbeat monitoring started ({}s interval)", interval);
            while !queue.monitoring_stopped.load(Ordering::SeqCst) {
                queue.process_dead_workers().await;
                tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
            }
            info!("Heartbeat monitoring stopped");
        }));
    }

    /// Signal the heartbeat monitor to stop at its next tick
    pub fn stop_monitoring(&self) {
        self.monitoring_stopped.store(true, Ordering::SeqCst);
    }

    /// Start the background acknowledgement-timeout monitor
    ///
    /// Same cadence mechanism as the heartbeat monitor.
    pub async fn start_ack_monitoring(&self) {
        let mut handle_guard = self.ack_monitoring_handle.lock().await;
        if handle_guard.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        self.ack_monitoring_stopped.store(false, Ordering::SeqCst);
        let queue = self.clone();
        let interval = self.config.heartbeat_check_interval;

        *handle_guard = Some(tokio::spawn(async move {
            info!("Acknowledgement monitoring started ({}s interval)", interval);
            while !queue.ack_monitoring_stopped.load(Ordering::SeqCst) {
                queue.check_assignment_timeouts().await;
                tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
            }
            info!("Acknowledgement monitoring stopped");
        }));
    }

    /// Signal the acknowledgement monitor to stop at its next tick
    pub fn stop_ack_monitoring(&self) {
        self.ack_monitoring_stopped.store(true, Ordering::SeqCst);
    }
}
