use crate::models::AgentType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Kinds of state update written to context memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    Periodic,
    Checkpoint,
}

/// One versioned snapshot of supervisor-level system state
///
/// Serialised verbatim as the content of a `system_state_*.json` file.
/// Checkpoint updates additionally carry `checkpoint_data` with enough state
/// to resume work (typically including an exported queue snapshot).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateUpdate {
    pub timestamp: DateTime<Utc>,
    pub update_type: UpdateType,
    #[serde(default = "default_writer_id")]
    pub writer_id: String,
    #[serde(default)]
    pub statistics: Map<String, Value>,
    #[serde(default)]
    pub system_state: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_data: Option<Map<String, Value>>,
}

fn default_writer_id() -> String {
    "system".to_string()
}

impl StateUpdate {
    pub fn periodic(statistics: Map<String, Value>, system_state: Map<String, Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            update_type: UpdateType::Periodic,
            writer_id: default_writer_id(),
            statistics,
            system_state,
            checkpoint_data: None,
        }
    }

    pub fn checkpoint(
        statistics: Map<String, Value>,
        system_state: Map<String, Value>,
        checkpoint_data: Map<String, Value>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            update_type: UpdateType::Checkpoint,
            writer_id: default_writer_id(),
            statistics,
            system_state,
            checkpoint_data: Some(checkpoint_data),
        }
    }

    pub fn with_writer(mut self, writer_id: impl Into<String>) -> Self {
        self.writer_id = writer_id.into();
        self
    }
}

/// Structured record of one agent's output, indexed by agent type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent_type: AgentType,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub results: Map<String, Value>,
    #[serde(default)]
    pub state_data: Map<String, Value>,
}

/// Outcome of a context-memory write
///
/// Writes that would exceed the storage cap soft-fail with `success = false`
/// and leave existing data untouched.
#[derive(Debug, Clone, Serialize)]
pub struct StorageResult {
    pub success: bool,
    pub storage_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl StorageResult {
    pub(crate) fn stored(path: PathBuf) -> Self {
        Self {
            success: true,
            storage_path: Some(path),
            error: None,
        }
    }

    pub(crate) fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            storage_path: None,
            error: Some(error.into()),
        }
    }
}

/// A state file read back from disk, with its metadata
#[derive(Debug, Clone)]
pub struct RetrievedState {
    pub request_type: String,
    pub content: Value,
    pub storage_path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

/// Validity verdict attached to a recovered checkpoint
#[derive(Debug, Clone, Serialize)]
pub struct DataIntegrity {
    pub valid: bool,
    pub error: Option<String>,
}

/// Everything needed to resume work from a checkpoint
#[derive(Debug, Clone)]
pub struct RecoveryState {
    pub checkpoint_id: String,
    pub active_tasks: Vec<Value>,
    pub system_configuration: Map<String, Value>,
    pub checkpoint_data: Map<String, Value>,
    pub data_integrity: DataIntegrity,
}

/// Lifecycle of one iteration directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Active,
    Completed,
}

/// Metadata for one iteration
#[derive(Debug, Clone, Serialize)]
pub struct IterationInfo {
    pub number: u32,
    pub status: IterationStatus,
    pub summary: Option<Value>,
    pub path: PathBuf,
}

/// How to select aggregate entries
#[derive(Debug, Clone, Copy)]
pub enum AggregateQuery {
    /// The single most recent entry.
    Latest,
    /// All entries with a timestamp inside the inclusive range.
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// One time-ordered entry of a named aggregate bucket
#[derive(Debug, Clone)]
pub struct AggregateEntry {
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    pub path: PathBuf,
}
