use crate::{
    config::MemoryConfig,
    models::AgentType,
    CoScientistError, Result,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod archive;
mod types;

pub use types::{
    AgentOutput, AggregateEntry, AggregateQuery, DataIntegrity, IterationInfo, IterationStatus,
    RecoveryState, RetrievedState, StateUpdate, StorageResult, UpdateType,
};

const ITERATIONS_DIR: &str = "iterations";
const AGGREGATES_DIR: &str = "aggregates";
const ARCHIVE_DIR: &str = "archive";
const CHECKPOINTS_DIR: &str = "checkpoints";
const CHECKPOINT_INDEX_FILE: &str = "index.json";
const ITERATION_SUMMARY_FILE: &str = "iteration_summary.json";

#[derive(Debug, Clone)]
struct IterationMeta {
    status: IterationStatus,
    summary: Option<Value>,
}

#[derive(Debug, Default)]
struct MemoryIndex {
    /// Currently active iteration number; 0 when none has been started.
    current_iteration: u32,
    iterations: BTreeMap<u32, IterationMeta>,
    component_index: HashMap<AgentType, Vec<PathBuf>>,
    checkpoints: HashMap<String, PathBuf>,
    bytes_used: u64,
    latest_state: Option<(DateTime<Utc>, PathBuf)>,
}

/// Iteration-scoped, versioned store for supervisor-level state
///
/// Owns its directory tree exclusively: numbered iteration directories with
/// state updates, agent outputs and checkpoints, plus aggregate buckets and
/// a tar.gz archive of old iterations. Concurrent writers at the same
/// logical timestamp are disambiguated through filenames, never overwritten.
#[derive(Clone)]
pub struct ContextMemory {
    storage_path: PathBuf,
    config: MemoryConfig,
    index: Arc<Mutex<MemoryIndex>>,
}

impl ContextMemory {
    pub fn new(storage_path: impl Into<PathBuf>, config: MemoryConfig) -> Self {
        Self {
            storage_path: storage_path.into(),
            config,
            index: Arc::new(Mutex::new(MemoryIndex::default())),
        }
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    fn iterations_dir(&self) -> PathBuf {
        self.storage_path.join(ITERATIONS_DIR)
    }

    fn aggregates_dir(&self) -> PathBuf {
        self.storage_path.join(AGGREGATES_DIR)
    }

    fn archive_dir(&self) -> PathBuf {
        self.storage_path.join(ARCHIVE_DIR)
    }

    fn checkpoints_dir(&self) -> PathBuf {
        self.storage_path.join(CHECKPOINTS_DIR)
    }

    fn iteration_dir(&self, number: u32) -> PathBuf {
        self.iterations_dir().join(format!("iteration_{number:03}"))
    }

    /// Create the directory layout and rebuild the in-memory index from
    /// whatever is already on disk
    pub async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(self.iterations_dir())?;
        fs::create_dir_all(self.aggregates_dir())?;
        fs::create_dir_all(self.archive_dir())?;
        fs::create_dir_all(self.checkpoints_dir())?;

        let mut index = self.index.lock().await;
        index.iterations.clear();
        index.component_index.clear();

        for entry in fs::read_dir(self.iterations_dir())? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(number) = parse_iteration_number(&entry.file_name().to_string_lossy()) else {
                continue;
            };

            let meta = read_iteration_meta(&entry.path());
            index.iterations.insert(number, meta);
            self.scan_iteration_files(&mut index, &entry.path());
        }

        index.current_iteration = index
            .iterations
            .iter()
            .rev()
            .find(|(_, meta)| meta.status == IterationStatus::Active)
            .map(|(n, _)| *n)
            .unwrap_or(0);

        let checkpoint_index_path = self.checkpoints_dir().join(CHECKPOINT_INDEX_FILE);
        if let Ok(contents) = fs::read_to_string(&checkpoint_index_path) {
            match serde_json::from_str::<HashMap<String, PathBuf>>(&contents) {
                Ok(checkpoints) => index.checkpoints = checkpoints,
                Err(e) => warn!("Ignoring unreadable checkpoint index: {}", e),
            }
        }

        index.bytes_used = self.compute_bytes_used();

        info!(
            "Context memory initialized at {} ({} iteration(s), {} byte(s) used)",
            self.storage_path.display(),
            index.iterations.len(),
            index.bytes_used
        );
        Ok(())
    }

    fn scan_iteration_files(&self, index: &mut MemoryIndex, dir: &Path) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.starts_with("system_state_") && name.ends_with(".json") {
                if let Some(timestamp) = read_timestamp_field(&path) {
                    if index
                        .latest_state
                        .as_ref()
                        .map(|(latest, _)| timestamp > *latest)
                        .unwrap_or(true)
                    {
                        index.latest_state = Some((timestamp, path.clone()));
                    }
                }
            } else if name.starts_with("agent_output_") && name.ends_with(".json") {
                let stem = name.trim_end_matches(".json");
                if let Some(agent) = stem
                    .trim_start_matches("agent_output_")
                    .split('_')
                    .nth(1)
                    .and_then(|tag| AgentType::from_str(tag).ok())
                {
                    index.component_index.entry(agent).or_default().push(path);
                }
            }
        }
    }

    /// Open a new iteration, completing the previous one if still active
    pub async fn start_new_iteration(&self) -> Result<u32> {
        let mut index = self.index.lock().await;
        self.start_iteration_locked(&mut index)
    }

    fn start_iteration_locked(&self, index: &mut MemoryIndex) -> Result<u32> {
        let previous = index.current_iteration;
        if previous != 0 {
            let still_active = index
                .iterations
                .get(&previous)
                .map(|meta| meta.status == IterationStatus::Active)
                .unwrap_or(false);
            if still_active {
                self.write_iteration_summary(previous, &json!({}))?;
                if let Some(meta) = index.iterations.get_mut(&previous) {
                    meta.status = IterationStatus::Completed;
                }
            }
        }

        let number = index.iterations.keys().next_back().copied().unwrap_or(0) + 1;
        fs::create_dir_all(self.iteration_dir(number))?;
        index.iterations.insert(
            number,
            IterationMeta {
                status: IterationStatus::Active,
                summary: None,
            },
        );
        index.current_iteration = number;

        info!("Started iteration {:03}", number);
        Ok(number)
    }

    fn ensure_active_iteration(&self, index: &mut MemoryIndex) -> Result<u32> {
        if index.current_iteration == 0 {
            self.start_iteration_locked(index)
        } else {
            Ok(index.current_iteration)
        }
    }

    fn write_iteration_summary(&self, number: u32, summary: &Value) -> Result<()> {
        let marker = json!({
            "iteration": number,
            "status": "completed",
            "summary": summary,
            "completed_at": Utc::now(),
        });
        let path = self.iteration_dir(number).join(ITERATION_SUMMARY_FILE);
        fs::write(path, serde_json::to_string_pretty(&marker)?)?;
        Ok(())
    }

    /// Mark an iteration complete with a summary
    pub async fn complete_iteration(&self, number: u32, summary: Value) -> Result<()> {
        let mut index = self.index.lock().await;
        if !index.iterations.contains_key(&number) {
            return Err(CoScientistError::InvalidArgument(format!(
                "Unknown iteration: {number}"
            )));
        }

        self.write_iteration_summary(number, &summary)?;
        if let Some(meta) = index.iterations.get_mut(&number) {
            meta.status = IterationStatus::Completed;
            meta.summary = Some(summary);
        }
        if index.current_iteration == number {
            index.current_iteration = 0;
        }

        info!("Completed iteration {:03}", number);
        Ok(())
    }

    pub async fn get_iteration_info(&self, number: u32) -> Result<IterationInfo> {
        let index = self.index.lock().await;
        let meta = index.iterations.get(&number).ok_or_else(|| {
            CoScientistError::InvalidArgument(format!("Unknown iteration: {number}"))
        })?;

        Ok(IterationInfo {
            number,
            status: meta.status,
            summary: meta.summary.clone(),
            path: self.iteration_dir(number),
        })
    }

    pub async fn list_iterations(&self) -> Vec<IterationInfo> {
        let index = self.index.lock().await;
        index
            .iterations
            .iter()
            .map(|(number, meta)| IterationInfo {
                number: *number,
                status: meta.status,
                summary: meta.summary.clone(),
                path: self.iteration_dir(*number),
            })
            .collect()
    }

    /// Write a state update into the active iteration
    ///
    /// The filename embeds the timestamp and the writer id, so concurrent
    /// writers at the same logical timestamp all succeed; a remaining
    /// collision gains a numeric suffix. Writes beyond the storage cap
    /// soft-fail without touching existing data.
    pub async fn store_state_update(&self, update: StateUpdate) -> Result<StorageResult> {
        let mut index = self.index.lock().await;
        let iteration = self.ensure_active_iteration(&mut index)?;

        let contents = serde_json::to_string_pretty(&update)?;
        if index.bytes_used + contents.len() as u64 > self.config.max_storage_bytes {
            debug!("State update rejected: storage limit reached");
            return Ok(StorageResult::rejected("storage limit reached"));
        }

        let base = format!(
            "system_state_{}_{}",
            timestamp_slug(&update.timestamp),
            sanitize_filename(&update.writer_id)
        );
        let path = unique_path(&self.iteration_dir(iteration), &base, "json");
        fs::write(&path, &contents)?;

        index.bytes_used += contents.len() as u64;
        let is_newest = index
            .latest_state
            .as_ref()
            .map(|(latest, _)| update.timestamp >= *latest)
            .unwrap_or(true);
        if is_newest {
            index.latest_state = Some((update.timestamp, path.clone()));
        }

        debug!("Stored state update at {}", path.display());
        Ok(StorageResult::stored(path))
    }

    /// Read back the most recent state update across all iterations
    ///
    /// Only the `"latest"` request type is supported.
    pub async fn retrieve_state(&self, request_type: &str) -> Result<RetrievedState> {
        if request_type != "latest" {
            return Err(CoScientistError::InvalidArgument(format!(
                "Unsupported state request: {request_type}"
            )));
        }

        let index = self.index.lock().await;
        let (timestamp, path) = index.latest_state.clone().ok_or_else(|| {
            CoScientistError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no state updates stored yet",
            ))
        })?;
        drop(index);

        let contents = fs::read_to_string(&path)?;
        let content: Value = serde_json::from_str(&contents)?;

        Ok(RetrievedState {
            request_type: request_type.to_string(),
            content,
            storage_path: path,
            timestamp,
        })
    }

    /// Persist a checkpoint and return its id
    ///
    /// The update is stored with `update_type = checkpoint`; the id is
    /// resolvable after a restart through the on-disk checkpoint index.
    pub async fn create_checkpoint(&self, update: StateUpdate) -> Result<String> {
        let mut index = self.index.lock().await;
        let iteration = self.ensure_active_iteration(&mut index)?;

        let mut update = update;
        update.update_type = UpdateType::Checkpoint;

        let contents = serde_json::to_string_pretty(&update)?;
        if index.bytes_used + contents.len() as u64 > self.config.max_storage_bytes {
            return Err(CoScientistError::Io(std::io::Error::other(
                "storage limit reached, checkpoint not written",
            )));
        }

        let uuid = Uuid::new_v4().simple().to_string();
        let checkpoint_id = format!("ckpt_{}", &uuid[..8]);
        let path = self
            .iteration_dir(iteration)
            .join(format!("checkpoint_{checkpoint_id}.json"));
        fs::write(&path, &contents)?;
        index.bytes_used += contents.len() as u64;

        index.checkpoints.insert(checkpoint_id.clone(), path);
        let serialized_index = serde_json::to_string_pretty(&index.checkpoints)?;
        fs::write(
            self.checkpoints_dir().join(CHECKPOINT_INDEX_FILE),
            serialized_index,
        )?;

        info!("Created checkpoint {}", checkpoint_id);
        Ok(checkpoint_id)
    }

    /// Load a checkpoint and expose the state needed to resume
    pub async fn recover_from_checkpoint(&self, checkpoint_id: &str) -> Result<RecoveryState> {
        let index = self.index.lock().await;
        let path = index.checkpoints.get(checkpoint_id).cloned().ok_or_else(|| {
            CoScientistError::InvalidArgument(format!("Unknown checkpoint: {checkpoint_id}"))
        })?;
        drop(index);

        let contents = fs::read_to_string(&path)?;
        let update: StateUpdate = match serde_json::from_str(&contents) {
            Ok(update) => update,
            Err(e) => {
                return Ok(RecoveryState {
                    checkpoint_id: checkpoint_id.to_string(),
                    active_tasks: Vec::new(),
                    system_configuration: Map::new(),
                    checkpoint_data: Map::new(),
                    data_integrity: DataIntegrity {
                        valid: false,
                        error: Some(e.to_string()),
                    },
                })
            }
        };

        let checkpoint_data = update.checkpoint_data.unwrap_or_default();
        let active_tasks = checkpoint_data
            .get("in_flight_tasks")
            .or_else(|| checkpoint_data.get("active_tasks"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(RecoveryState {
            checkpoint_id: checkpoint_id.to_string(),
            active_tasks,
            system_configuration: update.system_state,
            data_integrity: DataIntegrity {
                valid: !checkpoint_data.is_empty(),
                error: None,
            },
            checkpoint_data,
        })
    }

    /// Write an agent output under the active iteration and index it by
    /// agent type
    pub async fn store_agent_output(&self, output: AgentOutput) -> Result<StorageResult> {
        let mut index = self.index.lock().await;
        let iteration = self.ensure_active_iteration(&mut index)?;

        let contents = serde_json::to_string_pretty(&output)?;
        if index.bytes_used + contents.len() as u64 > self.config.max_storage_bytes {
            debug!("Agent output rejected: storage limit reached");
            return Ok(StorageResult::rejected("storage limit reached"));
        }

        let base = format!(
            "agent_output_{}_{}",
            timestamp_slug(&output.timestamp),
            output.agent_type.as_str()
        );
        let path = unique_path(&self.iteration_dir(iteration), &base, "json");
        fs::write(&path, &contents)?;

        index.bytes_used += contents.len() as u64;
        index
            .component_index
            .entry(output.agent_type)
            .or_default()
            .push(path.clone());

        Ok(StorageResult::stored(path))
    }

    /// Number of indexed outputs for one agent type
    pub async fn component_output_count(&self, agent_type: AgentType) -> usize {
        let index = self.index.lock().await;
        index
            .component_index
            .get(&agent_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Paths of indexed outputs per agent type
    pub async fn component_index(&self) -> HashMap<AgentType, Vec<PathBuf>> {
        self.index.lock().await.component_index.clone()
    }

    /// Append an entry to a named aggregate bucket
    pub async fn store_aggregate(
        &self,
        aggregate_type: &str,
        data: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<StorageResult> {
        let mut index = self.index.lock().await;

        let record = json!({
            "aggregate_type": aggregate_type,
            "timestamp": timestamp,
            "data": data,
        });
        let contents = serde_json::to_string_pretty(&record)?;
        if index.bytes_used + contents.len() as u64 > self.config.max_storage_bytes {
            debug!("Aggregate entry rejected: storage limit reached");
            return Ok(StorageResult::rejected("storage limit reached"));
        }

        let dir = self.aggregates_dir().join(sanitize_filename(aggregate_type));
        fs::create_dir_all(&dir)?;
        let path = unique_path(&dir, &timestamp_slug(&timestamp), "json");
        fs::write(&path, &contents)?;
        index.bytes_used += contents.len() as u64;

        Ok(StorageResult::stored(path))
    }

    /// Query a named aggregate bucket
    ///
    /// `Latest` returns at most one entry; `Range` returns every entry with
    /// a timestamp inside the inclusive bounds, oldest first.
    pub async fn retrieve_aggregate(
        &self,
        aggregate_type: &str,
        query: AggregateQuery,
    ) -> Result<Vec<AggregateEntry>> {
        let dir = self.aggregates_dir().join(sanitize_filename(aggregate_type));
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect();
        paths.sort();

        let mut entries = Vec::new();
        for path in paths {
            let contents = fs::read_to_string(&path)?;
            let record: Value = serde_json::from_str(&contents)?;
            let Some(timestamp) = record
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|parsed| parsed.with_timezone(&Utc))
            else {
                warn!("Skipping aggregate entry without timestamp: {}", path.display());
                continue;
            };

            let keep = match query {
                AggregateQuery::Latest => true,
                AggregateQuery::Range { start, end } => timestamp >= start && timestamp <= end,
            };
            if keep {
                entries.push(AggregateEntry {
                    timestamp,
                    data: record.get("data").cloned().unwrap_or(Value::Null),
                    path,
                });
            }
        }

        entries.sort_by_key(|entry| entry.timestamp);
        if matches!(query, AggregateQuery::Latest) {
            if let Some(latest) = entries.pop() {
                return Ok(vec![latest]);
            }
            return Ok(Vec::new());
        }
        Ok(entries)
    }

    pub(crate) fn compute_bytes_used(&self) -> u64 {
        [
            self.iterations_dir(),
            self.aggregates_dir(),
            self.checkpoints_dir(),
        ]
        .iter()
        .map(|dir| dir_size(dir))
        .sum()
    }
}

fn parse_iteration_number(name: &str) -> Option<u32> {
    let suffix = name.strip_prefix("iteration_")?;
    (!suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()))
        .then(|| suffix.parse().ok())
        .flatten()
}

fn read_iteration_meta(dir: &Path) -> IterationMeta {
    let summary_path = dir.join(ITERATION_SUMMARY_FILE);
    match fs::read_to_string(summary_path) {
        Ok(contents) => match serde_json::from_str::<Value>(&contents) {
            Ok(marker) => IterationMeta {
                status: IterationStatus::Completed,
                summary: marker.get("summary").cloned(),
            },
            Err(_) => IterationMeta {
                status: IterationStatus::Completed,
                summary: None,
            },
        },
        Err(_) => IterationMeta {
            status: IterationStatus::Active,
            summary: None,
        },
    }
}

/// Read the `completed_at` stamp from an iteration completion marker.
fn read_timestamp_marker(path: &Path) -> Option<DateTime<Utc>> {
    let contents = fs::read_to_string(path).ok()?;
    let value: Value = serde_json::from_str(&contents).ok()?;
    value
        .get("completed_at")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn read_timestamp_field(path: &Path) -> Option<DateTime<Utc>> {
    let contents = fs::read_to_string(path).ok()?;
    let value: Value = serde_json::from_str(&contents).ok()?;
    value
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn timestamp_slug(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y%m%dT%H%M%S%6fZ").to_string()
}

fn sanitize_filename(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn unique_path(dir: &Path, base: &str, extension: &str) -> PathBuf {
    let candidate = dir.join(format!("{base}.{extension}"));
    if !candidate.exists() {
        return candidate;
    }

    let mut counter = 1;
    loop {
        let candidate = dir.join(format!("{base}_{counter}.{extension}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                dir_size(&path)
            } else {
                entry.metadata().map(|meta| meta.len()).unwrap_or(0)
            }
        })
        .sum()
}
