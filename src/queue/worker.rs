use crate::{
    models::AgentType,
    queue::TaskQueue,
    CoScientistError, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{hash_map::Entry, HashSet};
use tracing::{debug, info};

/// Lifecycle states of a registered worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Active,
    Failed,
}

/// What a worker declares it can do
///
/// The agent-type tags drive capability matching; anything else a worker
/// wants to advertise goes through the same set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    #[serde(default)]
    pub agent_types: HashSet<AgentType>,
}

impl WorkerCapabilities {
    pub fn for_agents(agents: impl IntoIterator<Item = AgentType>) -> Self {
        Self {
            agent_types: agents.into_iter().collect(),
        }
    }
}

/// Registry record for one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub capabilities: WorkerCapabilities,
    pub state: WorkerState,
    pub last_heartbeat: DateTime<Utc>,
    pub assigned_task: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerInfo {
    pub fn new(id: &str, capabilities: WorkerCapabilities) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            capabilities,
            state: WorkerState::Idle,
            last_heartbeat: now,
            assigned_task: None,
            registered_at: now,
        }
    }
}

/// Point-in-time view of a worker, for status queries
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub id: String,
    pub state: WorkerState,
    pub capabilities: WorkerCapabilities,
    pub last_heartbeat: DateTime<Utc>,
    pub time_since_heartbeat_secs: f64,
    pub assigned_task: Option<String>,
    pub registered_at: DateTime<Utc>,
    /// Set to `heartbeat_timeout` when the failure was a missed heartbeat.
    pub failure_reason: Option<String>,
}

impl TaskQueue {
    /// Register a worker, or refresh an existing registration
    ///
    /// Re-registering preserves an active worker's state and assigned task;
    /// only the capabilities and heartbeat are refreshed.
    pub async fn register_worker(&self, worker_id: &str, capabilities: WorkerCapabilities) {
        let mut st = self.state.lock().await;

        match st.workers.entry(worker_id.to_string()) {
            Entry::Occupied(mut existing) => {
                let worker = existing.get_mut();
                worker.capabilities = capabilities;
                worker.last_heartbeat = Utc::now();
                if worker.state != WorkerState::Active {
                    worker.state = WorkerState::Idle;
                }
                debug!("Worker {} re-registered", worker_id);
            }
            Entry::Vacant(slot) => {
                slot.insert(WorkerInfo::new(worker_id, capabilities));
                info!("Worker {} registered", worker_id);
            }
        }
    }

    /// Remove a worker from the registry
    ///
    /// Any task the worker holds is left to the heartbeat monitor, which
    /// reclaims it on timeout. Returns false for unknown workers.
    pub async fn unregister_worker(&self, worker_id: &str) -> bool {
        let mut st = self.state.lock().await;
        if st.workers.remove(worker_id).is_none() {
            return false;
        }
        st.active_workers.remove(worker_id);
        info!("Worker {} unregistered", worker_id);
        true
    }

    pub async fn is_worker_registered(&self, worker_id: &str) -> bool {
        self.state.lock().await.workers.contains_key(worker_id)
    }

    pub async fn registered_workers(&self) -> HashSet<String> {
        self.state.lock().await.workers.keys().cloned().collect()
    }

    /// Record a worker heartbeat
    ///
    /// Fails with `UnknownWorker` for unregistered ids. A failed worker that
    /// heartbeats again is restored to idle. A supplied progress map is
    /// recorded against the worker's assigned task.
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        progress: Option<Map<String, Value>>,
    ) -> Result<()> {
        let mut st = self.state.lock().await;

        let assigned_task = {
            let worker = st
                .workers
                .get_mut(worker_id)
                .ok_or_else(|| CoScientistError::UnknownWorker(worker_id.to_string()))?;

            worker.last_heartbeat = Utc::now();
            if worker.state == WorkerState::Failed {
                worker.state = WorkerState::Idle;
                info!("Worker {} recovered via heartbeat", worker_id);
            }
            worker.assigned_task.clone()
        };

        if let (Some(progress), Some(task_id)) = (progress, assigned_task) {
            st.task_progress.insert(task_id, progress);
        }

        Ok(())
    }

    /// Workers currently in the given state
    pub async fn get_workers_by_state(&self, state: WorkerState) -> HashSet<String> {
        let st = self.state.lock().await;
        st.workers
            .iter()
            .filter(|(_, info)| info.state == state)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Workers advertising the given agent-type capability
    pub async fn get_workers_by_capability(&self, capability: AgentType) -> HashSet<String> {
        let st = self.state.lock().await;
        st.workers
            .iter()
            .filter(|(_, info)| info.capabilities.agent_types.contains(&capability))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Detailed status for one worker, or `None` if unknown
    pub async fn get_worker_status(&self, worker_id: &str) -> Option<WorkerStatus> {
        let st = self.state.lock().await;
        let worker = st.workers.get(worker_id)?;

        let now = Utc::now();
        let age = (now - worker.last_heartbeat).num_milliseconds() as f64 / 1000.0;
        let failure_reason = if worker.state == WorkerState::Failed
            && age > self.config.heartbeat_timeout as f64
        {
            Some("heartbeat_timeout".to_string())
        } else {
            None
        };

        Some(WorkerStatus {
            id: worker.id.clone(),
            state: worker.state,
            capabilities: worker.capabilities.clone(),
            last_heartbeat: worker.last_heartbeat,
            time_since_heartbeat_secs: age,
            assigned_task: worker.assigned_task.clone(),
            registered_at: worker.registered_at,
            failure_reason,
        })
    }

    /// Mark a worker as failed and reclaim its task
    ///
    /// Used by the heartbeat monitor and by callers that detect a crash
    /// directly. The reclaimed task gains a `worker_failure` history entry
    /// and goes to the front of its band.
    pub async fn mark_worker_failed(&self, worker_id: &str, reason: &str) {
        let mut st = self.state.lock().await;
        let reassigned = st.mark_worker_failed(worker_id);
        if !reassigned.is_empty() {
            info!(
                "Worker {} failed ({}); re-queued tasks: {:?}",
                worker_id, reason, reassigned
            );
        } else {
            info!("Worker {} marked failed ({})", worker_id, reason);
        }
    }
}
