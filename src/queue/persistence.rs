use crate::{
    constants::SNAPSHOT_VERSION,
    models::{FailureRecord, Task, TaskState},
    queue::{
        state::{DlqEntry, TaskAssignment},
        worker::{WorkerInfo, WorkerState},
        TaskQueue,
    },
    CoScientistError, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{HashMap, VecDeque},
    fs,
    path::Path,
    sync::atomic::Ordering,
};
use tracing::{debug, error, info, warn};

/// Per-band task-id lists inside a snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotQueues {
    pub high: Vec<String>,
    pub medium: Vec<String>,
    pub low: Vec<String>,
}

/// Complete serialisable queue state
///
/// A single JSON document; consumers outside the core treat everything but
/// `version` as opaque. Only the major version component must match on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub queues: SnapshotQueues,
    pub tasks: HashMap<String, Task>,
    pub task_states: HashMap<String, TaskState>,
    pub task_retry_counts: HashMap<String, u32>,
    pub task_failure_history: HashMap<String, Vec<FailureRecord>>,
    pub task_progress: HashMap<String, Map<String, Value>>,
    pub task_enqueue_times: HashMap<String, DateTime<Utc>>,
    pub task_boost_levels: HashMap<String, f64>,
    pub workers: HashMap<String, WorkerInfo>,
    pub assignments: HashMap<String, TaskAssignment>,
    pub capability_matching_enabled: bool,
    pub dead_letter_queue: Vec<String>,
    pub dlq_metadata: HashMap<String, DlqEntry>,
    pub displaced_tasks: u64,
    pub displacement_by_priority: HashMap<String, u64>,
}

fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

impl TaskQueue {
    /// Export the complete queue state as a snapshot value
    ///
    /// Linearisable with respect to queue mutations: the whole state is
    /// cloned under the lock.
    pub async fn export_state(&self) -> QueueSnapshot {
        let st = self.state.lock().await;

        QueueSnapshot {
            version: SNAPSHOT_VERSION.to_string(),
            timestamp: Utc::now(),
            queues: SnapshotQueues {
                high: st.bands[2].iter().cloned().collect(),
                medium: st.bands[1].iter().cloned().collect(),
                low: st.bands[0].iter().cloned().collect(),
            },
            tasks: st.tasks.clone(),
            task_states: st.task_states.clone(),
            task_retry_counts: st.task_retry_counts.clone(),
            task_failure_history: st.task_failure_history.clone(),
            task_progress: st.task_progress.clone(),
            task_enqueue_times: st.task_enqueue_times.clone(),
            task_boost_levels: st.task_boost_levels.clone(),
            workers: st.workers.clone(),
            assignments: st.assignments.clone(),
            capability_matching_enabled: st.capability_matching_enabled,
            dead_letter_queue: st.dead_letter_queue.iter().cloned().collect(),
            dlq_metadata: st.dlq_metadata.clone(),
            displaced_tasks: st.displaced_tasks,
            displacement_by_priority: st.displacement_by_priority.clone(),
        }
    }

    /// Replace the in-memory state with a snapshot
    ///
    /// Fails with `VersionMismatch` when the major version differs. Band
    /// entries without a task record and assignments referencing missing
    /// tasks or workers are dropped with a warning; the active-worker set is
    /// re-derived rather than restored.
    pub async fn import_state(&self, snapshot: QueueSnapshot) -> Result<()> {
        if major_version(&snapshot.version) != major_version(SNAPSHOT_VERSION) {
            return Err(CoScientistError::VersionMismatch {
                found: snapshot.version,
                expected: major_version(SNAPSHOT_VERSION).to_string(),
            });
        }

        let mut st = self.state.lock().await;
        st.clear();

        st.tasks = snapshot.tasks;
        st.task_states = snapshot.task_states;
        st.task_retry_counts = snapshot.task_retry_counts;
        st.task_failure_history = snapshot.task_failure_history;
        st.task_progress = snapshot.task_progress;
        st.task_enqueue_times = snapshot.task_enqueue_times;
        st.task_boost_levels = snapshot.task_boost_levels;

        for (band_index, ids) in [
            (0usize, snapshot.queues.low),
            (1, snapshot.queues.medium),
            (2, snapshot.queues.high),
        ] {
            let mut queue = VecDeque::new();
            for task_id in ids {
                if st.tasks.contains_key(&task_id) {
                    queue.push_back(task_id);
                } else {
                    warn!("Dropping queued id {} without a task record", task_id);
                }
            }
            st.bands[band_index] = queue;
        }

        for (worker_id, worker) in snapshot.workers {
            if worker.state == WorkerState::Active && worker.assigned_task.is_some() {
                st.active_workers.insert(worker_id.clone());
            }
            st.workers.insert(worker_id, worker);
        }

        for (assignment_id, assignment) in snapshot.assignments {
            let task_id = assignment.task.id.to_string();
            if !st.tasks.contains_key(&task_id) || !st.workers.contains_key(&assignment.worker_id)
            {
                warn!(
                    "Dropping assignment {} referencing a missing task or worker",
                    assignment_id
                );
                continue;
            }
            st.assignment_to_task
                .insert(assignment_id.clone(), task_id);
            st.assignment_to_worker
                .insert(assignment_id.clone(), assignment.worker_id.clone());
            st.assignments.insert(assignment_id, assignment);
        }

        st.capability_matching_enabled = snapshot.capability_matching_enabled;
        st.dead_letter_queue = snapshot.dead_letter_queue.into();
        st.dlq_metadata = snapshot.dlq_metadata;
        st.displaced_tasks = snapshot.displaced_tasks;
        for (band, count) in snapshot.displacement_by_priority {
            st.displacement_by_priority.insert(band, count);
        }

        info!(
            "Queue state imported: {} pending task(s), {} worker(s)",
            st.total_size(),
            st.workers.len()
        );
        Ok(())
    }

    /// Write the snapshot to the configured path
    ///
    /// Serialisation happens under the lock, file I/O outside it. The write
    /// is atomic: `<path>.tmp` then rename. A queue without a persistence
    /// path silently does nothing.
    pub async fn save_state(&self) -> Result<()> {
        let Some(path) = self.config.persistence_path.clone() else {
            return Ok(());
        };

        let snapshot = self.export_state().await;
        let serialized = serde_json::to_string_pretty(&snapshot)?;

        write_atomically(&path, &serialized)?;
        debug!("Queue state saved to {}", path.display());
        Ok(())
    }

    /// Load the snapshot from the configured path
    ///
    /// A missing file is benign. A corrupt file surfaces as a parse error,
    /// an incompatible schema as `VersionMismatch`.
    pub async fn load_state(&self) -> Result<()> {
        let Some(path) = self.config.persistence_path.clone() else {
            return Ok(());
        };

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No snapshot at {}, starting empty", path.display());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: QueueSnapshot = serde_json::from_str(&contents)?;
        self.import_state(snapshot).await?;
        info!("Queue state loaded from {}", path.display());
        Ok(())
    }

    /// Start the autosave loop
    ///
    /// Saves every `persistence_interval` seconds; failures are logged and
    /// never stop the loop. Does nothing without a persistence path.
    pub async fn start_persistence(&self) {
        if self.config.persistence_path.is_none() {
            return;
        }

        let mut handle_guard = self.persistence_handle.lock().await;
        if handle_guard.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        self.persistence_stopped.store(false, Ordering::SeqCst);
        let queue = self.clone();
        let interval = self.config.persistence_interval;

        *handle_guard = Some(tokio::spawn(async move {
            info!("Automatic persistence started ({}s interval)", interval);
            while !queue.persistence_stopped.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
                if queue.persistence_stopped.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = queue.save_state().await {
                    error!("Automatic persistence failed: {}", e);
                }
            }
            info!("Automatic persistence stopped");
        }));
    }

    /// Stop the autosave loop
    pub async fn stop_persistence(&self) {
        self.persistence_stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.persistence_handle.lock().await.take() {
            handle.abort();
        }
    }
}

fn write_atomically(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_path);

    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
