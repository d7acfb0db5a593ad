use crate::{
    config::ResourceConfig,
    constants,
    memory::ContextMemory,
    models::{AgentType, Task},
    queue::TaskQueue,
    CoScientistError, Result,
};
use chrono::{DateTime, Duration, Utc};
use rand::{distributions::WeightedIndex, prelude::*};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Resources granted to one task
#[derive(Debug, Clone, Serialize)]
pub struct ResourceAllocation {
    pub task_id: String,
    pub compute_budget: f64,
    pub memory_mb: u64,
    pub timeout_secs: u64,
    pub allocated_at: DateTime<Utc>,
}

/// Task complexity classes used when sizing an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Low,
    Normal,
    High,
}

impl TaskComplexity {
    fn multiplier(&self) -> f64 {
        match self {
            TaskComplexity::Low => 0.5,
            TaskComplexity::Normal => 1.0,
            TaskComplexity::High => 2.0,
        }
    }
}

/// Result of a finished task as seen by the supervisor's tuner
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub agent_type: AgentType,
    pub success: bool,
    pub quality_score: f64,
}

/// Current system metrics assembled from the queue and context memory
#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub hypothesis_count: usize,
    pub review_count: usize,
    pub task_completion_rate: f64,
    pub resource_utilization: f64,
    pub active_tasks: usize,
    pub pending_tasks: usize,
    pub agent_effectiveness: HashMap<AgentType, f64>,
}

/// The five termination signals, evaluated together
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TerminationConditions {
    pub goal_achieved: bool,
    pub resource_exhausted: bool,
    pub time_limit: bool,
    pub quality_threshold: bool,
    pub convergence: bool,
}

impl TerminationConditions {
    /// Fraction of signals currently true
    pub fn probability(&self) -> f64 {
        let met = [
            self.goal_achieved,
            self.resource_exhausted,
            self.time_limit,
            self.quality_threshold,
            self.convergence,
        ]
        .iter()
        .filter(|signal| **signal)
        .count();
        met as f64 / 5.0
    }

    /// Whether any critical signal fires
    pub fn should_terminate(&self) -> bool {
        self.goal_achieved || self.resource_exhausted || self.time_limit
    }
}

/// The supervisor's parsed view of the latest stored system state
#[derive(Debug, Clone, Default, Deserialize)]
struct SystemStateView {
    #[serde(default)]
    research_goal: Option<String>,
    #[serde(default)]
    current_iteration: u64,
    #[serde(default)]
    current_focus_area: Option<String>,
    #[serde(default)]
    pending_review_hypotheses: Vec<String>,
    #[serde(default)]
    tournament_candidates: Vec<String>,
    #[serde(default)]
    top_hypothesis_id: Option<String>,
    #[serde(default)]
    all_hypothesis_ids: Vec<String>,
    #[serde(default)]
    research_goal_achieved: bool,
    #[serde(default)]
    high_quality_hypotheses: u64,
    #[serde(default)]
    no_improvement_iterations: u64,
}

#[derive(Debug)]
struct SupervisorState {
    agent_weights: HashMap<AgentType, f64>,
    agent_effectiveness: HashMap<AgentType, f64>,
    resource_consumed: f64,
    active_allocations: HashMap<String, ResourceAllocation>,
    termination_probability: f64,
    recent_outcomes: Vec<TaskOutcome>,
}

/// Central orchestrator of the agent population
///
/// Creates tasks through weighted role sampling, manages the compute and
/// memory budget, tracks per-role effectiveness and evaluates when the run
/// should stop. Its own bookkeeping is transient; everything durable lives
/// in the queue snapshot and the context memory.
#[derive(Clone)]
pub struct SupervisorAgent {
    task_queue: Arc<TaskQueue>,
    context_memory: Arc<ContextMemory>,
    resource_config: ResourceConfig,
    state: Arc<Mutex<SupervisorState>>,
    started_at: DateTime<Utc>,
}

fn default_weights() -> HashMap<AgentType, f64> {
    HashMap::from([
        (AgentType::Generation, 0.3),
        (AgentType::Reflection, 0.2),
        (AgentType::Ranking, 0.15),
        (AgentType::Evolution, 0.15),
        (AgentType::Proximity, 0.1),
        (AgentType::MetaReview, 0.1),
    ])
}

fn validate_weights(weights: &HashMap<AgentType, f64>) -> Result<()> {
    let total: f64 = weights.values().sum();
    if (total - 1.0).abs() > constants::WEIGHT_SUM_TOLERANCE {
        return Err(CoScientistError::InvalidArgument(format!(
            "Agent weights must sum to 1.0, got {total}"
        )));
    }
    Ok(())
}

/// Base allocation per agent role: (compute, memory MB, timeout seconds).
fn base_allocation(agent_type: AgentType) -> (f64, u64, u64) {
    match agent_type {
        AgentType::Generation => (30.0, 256, 300),
        AgentType::Reflection => (20.0, 128, 180),
        AgentType::Ranking => (15.0, 128, 120),
        AgentType::Evolution => (25.0, 256, 240),
        AgentType::Proximity => (10.0, 256, 120),
        AgentType::MetaReview => (40.0, 512, 600),
    }
}

impl SupervisorAgent {
    pub fn new(
        task_queue: Arc<TaskQueue>,
        context_memory: Arc<ContextMemory>,
        agent_weights: Option<HashMap<AgentType, f64>>,
        resource_config: Option<ResourceConfig>,
    ) -> Result<Self> {
        let agent_weights = match agent_weights {
            Some(weights) => {
                validate_weights(&weights)?;
                weights
            }
            None => default_weights(),
        };

        let agent_effectiveness = agent_weights.keys().map(|agent| (*agent, 0.5)).collect();

        Ok(Self {
            task_queue,
            context_memory,
            resource_config: resource_config.unwrap_or_default(),
            state: Arc::new(Mutex::new(SupervisorState {
                agent_weights,
                agent_effectiveness,
                resource_consumed: 0.0,
                active_allocations: HashMap::new(),
                termination_probability: 0.0,
                recent_outcomes: Vec::new(),
            })),
            started_at: Utc::now(),
        })
    }

    /// Create and enqueue a task for the given agent role
    pub async fn create_task(
        &self,
        agent_type: AgentType,
        priority: u8,
        parameters: Map<String, Value>,
    ) -> Result<Task> {
        let task = Task::new(agent_type.task_type(), priority, parameters)?;
        self.task_queue.enqueue(task.clone()).await?;

        info!("Created task {} for {} agent", task.id, agent_type);
        Ok(task)
    }

    /// Weighted random sample over the current role weights
    pub async fn select_next_agent(&self) -> Result<AgentType> {
        let state = self.state.lock().await;

        let (agents, weights): (Vec<AgentType>, Vec<f64>) =
            state.agent_weights.iter().map(|(a, w)| (*a, *w)).unzip();
        let distribution = WeightedIndex::new(&weights)
            .map_err(|e| anyhow::anyhow!("Agent weight vector is degenerate: {e}"))?;

        let selected = agents[distribution.sample(&mut thread_rng())];
        debug!("Selected {} agent for activation", selected);
        Ok(selected)
    }

    /// Create a batch of tasks, one weighted role sample each
    ///
    /// Parameters are filled in from the latest stored system state with a
    /// deterministic switch per role.
    pub async fn distribute_tasks(&self, batch_size: usize) -> Result<Vec<Task>> {
        let view = self.system_state_view().await;

        let mut tasks = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let agent_type = self.select_next_agent().await?;
            let parameters = generate_task_parameters(agent_type, &view);
            let task = self
                .create_task(agent_type, constants::PRIORITY_MEDIUM, parameters)
                .await?;
            tasks.push(task);
        }

        Ok(tasks)
    }

    /// Reserve resources for a task
    ///
    /// The grant scales with the role's base allocation, the complexity
    /// class and the current load; it is recorded against the task id so it
    /// can be reclaimed later. Fails with `InsufficientResources` when less
    /// than the minimum compute remains.
    pub async fn allocate_resources(
        &self,
        task_id: &str,
        agent_type: AgentType,
        complexity: TaskComplexity,
    ) -> Result<ResourceAllocation> {
        let mut state = self.state.lock().await;

        let available = self.resource_config.compute_budget - state.resource_consumed;
        if available < constants::MIN_COMPUTE_ALLOCATION {
            return Err(CoScientistError::InsufficientResources {
                message: format!("only {available:.1} compute units remain"),
            });
        }

        let utilization = state.resource_consumed / self.resource_config.compute_budget;
        let load_factor = if utilization > constants::HIGH_LOAD_UTILIZATION {
            0.5
        } else {
            1.0
        };

        let (base_compute, base_memory, base_timeout) = base_allocation(agent_type);
        let multiplier = complexity.multiplier();

        let allocation = ResourceAllocation {
            task_id: task_id.to_string(),
            compute_budget: (base_compute * multiplier * load_factor).min(available),
            memory_mb: (base_memory as f64 * multiplier) as u64,
            timeout_secs: (base_timeout as f64 * multiplier) as u64,
            allocated_at: Utc::now(),
        };

        state.resource_consumed += allocation.compute_budget;
        state
            .active_allocations
            .insert(task_id.to_string(), allocation.clone());

        debug!(
            "Allocated {:.1} compute units to task {} ({} agent)",
            allocation.compute_budget, task_id, agent_type
        );
        Ok(allocation)
    }

    /// Return a task's resources to the pool; idempotent
    pub async fn reclaim_resources(&self, task_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(allocation) = state.active_allocations.remove(task_id) {
            state.resource_consumed =
                (state.resource_consumed - allocation.compute_budget).max(0.0);
            info!(
                "Reclaimed {:.1} compute units from task {}",
                allocation.compute_budget, task_id
            );
        }
    }

    /// Assemble current system metrics from the queue and context memory
    pub async fn calculate_system_metrics(&self) -> SystemMetrics {
        let queue_stats = self.task_queue.get_queue_statistics().await;
        let hypothesis_count = self
            .context_memory
            .component_output_count(AgentType::Generation)
            .await;
        let review_count = self
            .context_memory
            .component_output_count(AgentType::Reflection)
            .await;

        let terminal =
            queue_stats.task_states.completed + queue_stats.task_states.failed;
        let task_completion_rate = if terminal > 0 {
            queue_stats.task_states.completed as f64 / terminal as f64
        } else {
            0.0
        };

        let state = self.state.lock().await;
        SystemMetrics {
            hypothesis_count,
            review_count,
            task_completion_rate,
            resource_utilization: state.resource_consumed / self.resource_config.compute_budget,
            active_tasks: queue_stats.task_states.executing,
            pending_tasks: queue_stats.task_states.pending,
            agent_effectiveness: state.agent_effectiveness.clone(),
        }
    }

    /// Evaluate all five termination signals without deciding
    pub async fn evaluate_termination(&self) -> TerminationConditions {
        let view = self.system_state_view().await;
        let mut state = self.state.lock().await;

        let conditions = TerminationConditions {
            goal_achieved: view.research_goal_achieved,
            resource_exhausted: state.resource_consumed
                >= self.resource_config.compute_budget * constants::RESOURCE_EXHAUSTION_FRACTION,
            time_limit: Utc::now() - self.started_at
                >= Duration::hours(self.resource_config.time_limit_hours as i64),
            quality_threshold: view.high_quality_hypotheses
                >= constants::QUALITY_THRESHOLD_HYPOTHESES,
            convergence: view.no_improvement_iterations >= constants::CONVERGENCE_ITERATIONS,
        };

        state.termination_probability = conditions.probability();
        conditions
    }

    /// Whether the run should stop now
    ///
    /// Terminates on goal achievement, resource exhaustion or the time
    /// limit; the remaining signals only contribute to the termination
    /// probability.
    pub async fn check_termination_conditions(&self) -> bool {
        let conditions = self.evaluate_termination().await;
        if conditions.should_terminate() {
            info!("Termination conditions met: {:?}", conditions);
        }
        conditions.should_terminate()
    }

    /// Fraction of termination signals true at the last evaluation
    pub async fn termination_probability(&self) -> f64 {
        self.state.lock().await.termination_probability
    }

    /// Feed one finished task into the effectiveness tuner
    pub async fn record_task_result(&self, outcome: TaskOutcome) {
        self.state.lock().await.recent_outcomes.push(outcome);
    }

    /// Fold recorded task results into per-role effectiveness
    ///
    /// Scores are grouped by agent type, averaged, and blended into the
    /// stored effectiveness with an exponential moving average.
    pub async fn update_agent_effectiveness(&self) {
        let mut state = self.state.lock().await;

        let mut grouped: HashMap<AgentType, Vec<f64>> = HashMap::new();
        for outcome in state.recent_outcomes.drain(..) {
            let score = if outcome.success {
                outcome.quality_score.clamp(0.0, 1.0)
            } else {
                0.0
            };
            grouped.entry(outcome.agent_type).or_default().push(score);
        }

        let alpha = constants::EFFECTIVENESS_LEARNING_RATE;
        for (agent_type, scores) in grouped {
            if scores.is_empty() {
                continue;
            }
            let observed = scores.iter().sum::<f64>() / scores.len() as f64;
            let entry = state.agent_effectiveness.entry(agent_type).or_insert(0.5);
            *entry = alpha * observed + (1.0 - alpha) * *entry;
        }
    }

    /// Re-weight role sampling by normalised effectiveness
    ///
    /// Blended with the current weights under momentum, then renormalised
    /// so the vector sums to 1.
    pub async fn adjust_agent_weights(&self) {
        let mut state = self.state.lock().await;

        let total_effectiveness: f64 = state.agent_effectiveness.values().sum();
        if total_effectiveness == 0.0 {
            return;
        }

        let momentum = constants::WEIGHT_MOMENTUM;
        let effectiveness = state.agent_effectiveness.clone();
        for (agent_type, weight) in state.agent_weights.iter_mut() {
            let effectiveness_weight =
                effectiveness.get(agent_type).copied().unwrap_or(0.0) / total_effectiveness;
            *weight = momentum * *weight + (1.0 - momentum) * effectiveness_weight;
        }

        let total_weight: f64 = state.agent_weights.values().sum();
        for weight in state.agent_weights.values_mut() {
            *weight /= total_weight;
        }

        info!("Adjusted agent weights: {:?}", state.agent_weights);
    }

    pub async fn agent_weights(&self) -> HashMap<AgentType, f64> {
        self.state.lock().await.agent_weights.clone()
    }

    pub async fn agent_effectiveness(&self) -> HashMap<AgentType, f64> {
        self.state.lock().await.agent_effectiveness.clone()
    }

    pub async fn resource_consumed(&self) -> f64 {
        self.state.lock().await.resource_consumed
    }

    async fn system_state_view(&self) -> SystemStateView {
        let Ok(retrieved) = self.context_memory.retrieve_state("latest").await else {
            return SystemStateView::default();
        };
        retrieved
            .content
            .get("system_state")
            .cloned()
            .map(|value| serde_json::from_value(value).unwrap_or_default())
            .unwrap_or_default()
    }
}

/// Fill task parameters for one role from the current system state.
fn generate_task_parameters(agent_type: AgentType, view: &SystemStateView) -> Map<String, Value> {
    let mut rng = thread_rng();
    let mut parameters = Map::new();
    parameters.insert(
        "goal".to_string(),
        json!(view
            .research_goal
            .clone()
            .unwrap_or_else(|| "Unknown goal".to_string())),
    );
    parameters.insert("iteration".to_string(), json!(view.current_iteration));

    match agent_type {
        AgentType::Generation => {
            let methods = ["literature_based", "debate", "assumptions", "expansion"];
            parameters.insert(
                "generation_method".to_string(),
                json!(methods.choose(&mut rng).copied().unwrap_or("literature_based")),
            );
            if let Some(focus_area) = &view.current_focus_area {
                parameters.insert("focus_area".to_string(), json!(focus_area));
            }
        }
        AgentType::Reflection => {
            if let Some(hypothesis_id) = view.pending_review_hypotheses.first() {
                parameters.insert("hypothesis_id".to_string(), json!(hypothesis_id));
                let review_types = ["initial", "deep_verification", "simulation"];
                parameters.insert(
                    "review_type".to_string(),
                    json!(review_types.choose(&mut rng).copied().unwrap_or("initial")),
                );
            }
        }
        AgentType::Ranking => {
            let candidates: Vec<&String> = view.tournament_candidates.iter().take(10).collect();
            parameters.insert("hypothesis_ids".to_string(), json!(candidates));
        }
        AgentType::Evolution => {
            if let Some(top) = &view.top_hypothesis_id {
                parameters.insert("hypothesis_id".to_string(), json!(top));
            }
            let strategies = ["refine", "combine", "simplify", "paradigm_shift"];
            parameters.insert(
                "strategy".to_string(),
                json!(strategies.choose(&mut rng).copied().unwrap_or("refine")),
            );
        }
        AgentType::Proximity => {
            let ids: Vec<&String> = view.all_hypothesis_ids.iter().take(50).collect();
            parameters.insert("hypothesis_ids".to_string(), json!(ids));
        }
        AgentType::MetaReview => {
            let focuses = ["methodology", "assumptions", "themes"];
            parameters.insert(
                "focus".to_string(),
                json!(focuses.choose(&mut rng).copied().unwrap_or("themes")),
            );
        }
    }

    parameters
}
