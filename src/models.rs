use crate::{CoScientistError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Represents a unit of work flowing through the queue
///
/// Tasks are the fundamental unit of coordination in the system. Each task
/// carries a type that maps to one agent role, a numeric priority, an opaque
/// payload, and the full lifecycle timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub priority: u8,
    pub state: TaskState,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub assigned_to: Option<String>,
    pub result: Option<Map<String, Value>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Types of tasks the queue recognises
///
/// This is a closed set; each task type maps to exactly one agent role
/// (see [`AgentType`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    GenerateHypothesis,
    ReflectOnHypothesis,
    RankHypotheses,
    EvolveHypothesis,
    FindSimilarHypotheses,
    MetaReview,
}

/// Agent roles in the system
///
/// Doubles as the worker capability tag and the supervisor's sampling
/// dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentType {
    Generation,
    Reflection,
    Ranking,
    Evolution,
    Proximity,
    MetaReview,
}

/// Task execution states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Assigned,
    Executing,
    Completed,
    Failed,
}

/// Structured error reported by a worker when failing a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
    pub retryable: bool,
}

/// Why a failure history entry was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    TaskFailed,
    WorkerFailure,
}

/// One entry in a task's failure history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub worker_id: String,
    pub reason: FailureReason,
    pub error: Option<TaskError>,
    pub timestamp: DateTime<Utc>,
}

impl Task {
    /// Creates a new pending task
    ///
    /// Fails with `InvalidArgument` if the priority is not positive.
    pub fn new(task_type: TaskType, priority: u8, payload: Map<String, Value>) -> Result<Self> {
        if priority == 0 {
            return Err(CoScientistError::InvalidArgument(
                "Priority must be positive".to_string(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            task_type,
            priority,
            state: TaskState::Pending,
            payload,
            assigned_to: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            assigned_at: None,
            completed_at: None,
        })
    }

    /// Assign the task to a worker
    ///
    /// Fails with `InvalidState` unless the task is pending.
    pub fn assign(&mut self, worker_id: &str) -> Result<()> {
        if self.state != TaskState::Pending {
            if let Some(current) = &self.assigned_to {
                return Err(CoScientistError::InvalidState(format!(
                    "Task already assigned to {current}"
                )));
            }
            return Err(CoScientistError::InvalidState(format!(
                "Cannot assign task in state {}",
                self.state
            )));
        }

        self.assigned_to = Some(worker_id.to_string());
        self.assigned_at = Some(Utc::now());
        self.state = TaskState::Assigned;
        Ok(())
    }

    /// Mark the task as executing after acknowledgement
    ///
    /// Fails with `InvalidState` unless the task is assigned.
    pub fn start_execution(&mut self) -> Result<()> {
        if self.state != TaskState::Assigned {
            return Err(CoScientistError::InvalidState(format!(
                "Cannot start execution for task in state {}",
                self.state
            )));
        }

        self.state = TaskState::Executing;
        Ok(())
    }

    /// Mark the task as completed with its result
    ///
    /// Fails with `InvalidState` unless the task is executing.
    pub fn complete(&mut self, result: Map<String, Value>) -> Result<()> {
        if self.state != TaskState::Executing {
            return Err(CoScientistError::InvalidState(format!(
                "Cannot complete task in state {}",
                self.state
            )));
        }

        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        self.state = TaskState::Completed;
        Ok(())
    }

    /// Mark the task as failed with an error message
    ///
    /// Allowed from any non-terminal state.
    pub fn fail(&mut self, error: &str) -> Result<()> {
        if self.is_terminal() {
            return Err(CoScientistError::InvalidState(format!(
                "Cannot fail task in terminal state {}",
                self.state
            )));
        }

        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
        self.state = TaskState::Failed;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TaskState::Completed | TaskState::Failed)
    }
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::GenerateHypothesis,
        TaskType::ReflectOnHypothesis,
        TaskType::RankHypotheses,
        TaskType::EvolveHypothesis,
        TaskType::FindSimilarHypotheses,
        TaskType::MetaReview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::GenerateHypothesis => "generate_hypothesis",
            TaskType::ReflectOnHypothesis => "reflect_on_hypothesis",
            TaskType::RankHypotheses => "rank_hypotheses",
            TaskType::EvolveHypothesis => "evolve_hypothesis",
            TaskType::FindSimilarHypotheses => "find_similar_hypotheses",
            TaskType::MetaReview => "meta_review",
        }
    }

    /// The agent role required to execute this task type
    pub fn required_agent(&self) -> AgentType {
        match self {
            TaskType::GenerateHypothesis => AgentType::Generation,
            TaskType::ReflectOnHypothesis => AgentType::Reflection,
            TaskType::RankHypotheses => AgentType::Ranking,
            TaskType::EvolveHypothesis => AgentType::Evolution,
            TaskType::FindSimilarHypotheses => AgentType::Proximity,
            TaskType::MetaReview => AgentType::MetaReview,
        }
    }
}

impl AgentType {
    pub const ALL: [AgentType; 6] = [
        AgentType::Generation,
        AgentType::Reflection,
        AgentType::Ranking,
        AgentType::Evolution,
        AgentType::Proximity,
        AgentType::MetaReview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Generation => "Generation",
            AgentType::Reflection => "Reflection",
            AgentType::Ranking => "Ranking",
            AgentType::Evolution => "Evolution",
            AgentType::Proximity => "Proximity",
            AgentType::MetaReview => "MetaReview",
        }
    }

    /// The task type this agent role executes
    pub fn task_type(&self) -> TaskType {
        match self {
            AgentType::Generation => TaskType::GenerateHypothesis,
            AgentType::Reflection => TaskType::ReflectOnHypothesis,
            AgentType::Ranking => TaskType::RankHypotheses,
            AgentType::Evolution => TaskType::EvolveHypothesis,
            AgentType::Proximity => TaskType::FindSimilarHypotheses,
            AgentType::MetaReview => TaskType::MetaReview,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            TaskState::Pending => "pending",
            TaskState::Assigned => "assigned",
            TaskState::Executing => "executing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        };
        f.write_str(tag)
    }
}

impl FromStr for AgentType {
    type Err = CoScientistError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "generation" => Ok(AgentType::Generation),
            "reflection" => Ok(AgentType::Reflection),
            "ranking" => Ok(AgentType::Ranking),
            "evolution" => Ok(AgentType::Evolution),
            "proximity" => Ok(AgentType::Proximity),
            "metareview" | "meta_review" => Ok(AgentType::MetaReview),
            _ => Err(CoScientistError::InvalidArgument(format!(
                "Unknown agent type: {s}"
            ))),
        }
    }
}

impl FromStr for TaskType {
    type Err = CoScientistError;

    fn from_str(s: &str) -> Result<Self> {
        TaskType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| CoScientistError::InvalidArgument(format!("Unknown task type: {s}")))
    }
}

impl TaskError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}
