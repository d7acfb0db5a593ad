use crate::{
    models::TaskState,
    queue::{DlqEntry, TaskQueue},
};
use std::collections::HashMap;
use tracing::{info, warn};

impl TaskQueue {
    /// Task ids currently in the dead-letter queue, oldest first
    pub async fn dlq_tasks(&self) -> Vec<String> {
        let st = self.state.lock().await;
        st.dead_letter_queue.iter().cloned().collect()
    }

    /// Metadata for one dead-lettered task
    pub async fn dlq_entry(&self, task_id: &str) -> Option<DlqEntry> {
        self.state.lock().await.dlq_metadata.get(task_id).cloned()
    }

    /// Counts of dead-lettered tasks grouped by reason
    pub async fn dlq_statistics(&self) -> crate::queue::DlqStatistics {
        let st = self.state.lock().await;
        let mut by_reason: HashMap<String, u64> = HashMap::new();
        for entry in st.dlq_metadata.values() {
            *by_reason.entry(entry.reason.as_str().to_string()).or_insert(0) += 1;
        }

        crate::queue::DlqStatistics {
            total_tasks: st.dead_letter_queue.len(),
            by_reason,
        }
    }

    /// Replay a dead-lettered task
    ///
    /// Removes it from the DLQ, resets retry count and state (the failure
    /// history is preserved as an audit trail) and re-appends the task to
    /// the tail of its band. Returns false if the task is not in the DLQ.
    pub async fn replay_from_dlq(&self, task_id: &str) -> bool {
        let mut st = self.state.lock().await;

        if !st.dlq_metadata.contains_key(task_id) {
            warn!("Replay requested for task {} not in DLQ", task_id);
            return false;
        }

        let Some(pos) = st.dead_letter_queue.iter().position(|id| id == task_id) else {
            return false;
        };
        st.dead_letter_queue.remove(pos);

        if !st.tasks.contains_key(task_id) {
            st.dlq_metadata.remove(task_id);
            warn!("Dead-lettered task {} no longer exists", task_id);
            return false;
        }

        st.task_retry_counts.insert(task_id.to_string(), 0);
        if let Some(task) = st.tasks.get_mut(task_id) {
            task.error = None;
            task.completed_at = None;
            task.state = TaskState::Pending;
        }
        st.requeue_pending(task_id, false);
        st.dlq_metadata.remove(task_id);

        info!("Task {} replayed from DLQ", task_id);
        true
    }
}
