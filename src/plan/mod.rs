//! Plan data model: steps, dependency DAG, validation, and roll-ups.
//!
//! A [`Plan`] is what the plan parser produces from `[PLAN]` blocks and
//! what the workflow engine executes once the user approves it. Unknown
//! tool and agent names are kept verbatim on the step; [`Plan::validate`]
//! flags them rather than the parser dropping information.

mod parser;

pub use parser::parse_plan;

use crate::executor::{ToolResult, ToolSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Not yet attempted.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully; result is immutable from here.
    Completed,
    /// Retries exhausted.
    Failed,
    /// Skipped because the plan was cancelled first.
    Skipped,
}

/// Lifecycle of a whole plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    /// Parsed but not yet approved.
    Draft,
    /// Approved by the user, ready to run.
    Approved,
    /// Executing.
    Running,
    /// All steps completed.
    Completed,
    /// A step exhausted its retries.
    Failed,
    /// Cancelled by the user.
    Cancelled,
}

/// One node in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Stable identifier, assigned at parse time.
    pub id: Uuid,
    /// Position the author gave the step; breaks topological ties.
    pub order_hint: u32,
    /// Human-readable description.
    pub description: String,
    /// Agent the step is attributed to. Kept verbatim even when unknown.
    pub agent_id: String,
    /// Tool name. Kept verbatim even when unknown.
    pub tool: String,
    /// Tool arguments as a JSON object.
    pub arguments: serde_json::Value,
    /// Steps that must complete first.
    pub dependencies: Vec<Uuid>,
    /// Author's time estimate.
    pub estimated_seconds: u64,
    /// Current status.
    pub status: StepStatus,
    /// Execution attempts so far.
    pub attempts: u32,
    /// Result of the completed or failed attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
    /// When the step started running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PlanStep {
    /// Build a pending step with a fresh id.
    pub fn new(
        order_hint: u32,
        description: impl Into<String>,
        agent_id: impl Into<String>,
        tool: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_hint,
            description: description.into(),
            agent_id: agent_id.into(),
            tool: tool.into(),
            arguments,
            dependencies: Vec::new(),
            estimated_seconds: 0,
            status: StepStatus::Pending,
            attempts: 0,
            result: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// The step's tool as a spec, when the name is known.
    pub fn tool_spec(&self) -> Option<ToolSpec> {
        self.tool.parse().ok()
    }
}

/// Per-agent pricing inputs for [`Plan::estimated_cost`].
#[derive(Debug, Clone, Copy)]
pub struct AgentCost {
    /// Default token estimate for one step by this agent.
    pub estimated_tokens: u64,
    /// Price per thousand tokens.
    pub cost_per_1k: f64,
}

impl Default for AgentCost {
    fn default() -> Self {
        Self {
            estimated_tokens: 2000,
            cost_per_1k: 0.0,
        }
    }
}

/// Pricing catalogue keyed by agent name, with a fallback.
#[derive(Debug, Clone, Default)]
pub struct CostModel {
    /// Known agents and their pricing.
    pub per_agent: HashMap<String, AgentCost>,
    /// Used for agents absent from the map.
    pub default: AgentCost,
}

impl CostModel {
    fn for_agent(&self, agent_id: &str) -> AgentCost {
        self.per_agent.get(agent_id).copied().unwrap_or(self.default)
    }
}

/// A validated-or-not multi-step workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Stable identifier.
    pub id: Uuid,
    /// Workflow name from the plan header.
    pub name: String,
    /// Free-text description.
    pub description: String,
    /// Steps in authored order.
    pub steps: Vec<PlanStep>,
    /// Whether the user approved execution.
    pub approved: bool,
    /// When the plan was parsed.
    pub created_at: DateTime<Utc>,
    /// Current status.
    pub status: PlanStatus,
}

impl Plan {
    /// Build an empty draft.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            steps: Vec::new(),
            approved: false,
            created_at: Utc::now(),
            status: PlanStatus::Draft,
        }
    }

    /// Look up a step by id.
    pub fn step(&self, id: Uuid) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Mutable step lookup.
    pub fn step_mut(&mut self, id: Uuid) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Check the plan against the runtime catalogue.
    ///
    /// Returns every problem found: missing dependency ids, dependency
    /// cycles, agents outside `agent_catalogue`, and tools outside the
    /// closed tool set. An empty list means the plan may execute.
    pub fn validate(&self, agent_catalogue: &[String]) -> Vec<String> {
        let mut errors = Vec::new();

        if self.steps.is_empty() {
            errors.push("plan has no steps".to_string());
        }

        let known: HashSet<Uuid> = self.steps.iter().map(|s| s.id).collect();
        for step in &self.steps {
            for dep in &step.dependencies {
                if !known.contains(dep) {
                    errors.push(format!(
                        "step '{}' references missing dependency {}",
                        step.description, dep
                    ));
                }
            }
            if step.tool.parse::<ToolSpec>().is_err() {
                errors.push(format!(
                    "step '{}' names unknown tool '{}'",
                    step.description, step.tool
                ));
            }
            if !agent_catalogue.iter().any(|a| a == &step.agent_id) {
                errors.push(format!(
                    "step '{}' names unknown agent '{}'",
                    step.description, step.agent_id
                ));
            }
        }

        if let Some(cycle_step) = self.find_cycle() {
            errors.push(format!(
                "dependency cycle detected involving step '{}'",
                cycle_step
            ));
        }

        errors
    }

    /// DFS with back-edge detection. Returns a step description on the
    /// first cycle found.
    fn find_cycle(&self) -> Option<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }

        let index: HashMap<Uuid, usize> =
            self.steps.iter().enumerate().map(|(i, s)| (s.id, i)).collect();
        let mut marks = vec![Mark::White; self.steps.len()];

        fn visit(
            steps: &[PlanStep],
            index: &HashMap<Uuid, usize>,
            marks: &mut [Mark],
            at: usize,
        ) -> Option<usize> {
            marks[at] = Mark::Grey;
            for dep in &steps[at].dependencies {
                let Some(&next) = index.get(dep) else { continue };
                match marks[next] {
                    Mark::Grey => return Some(next),
                    Mark::White => {
                        if let Some(found) = visit(steps, index, marks, next) {
                            return Some(found);
                        }
                    }
                    Mark::Black => {}
                }
            }
            marks[at] = Mark::Black;
            None
        }

        for start in 0..self.steps.len() {
            if marks[start] == Mark::White {
                if let Some(found) = visit(&self.steps, &index, &mut marks, start) {
                    return Some(self.steps[found].description.clone());
                }
            }
        }
        None
    }

    /// Linear execution order: Kahn's algorithm over the dependency DAG,
    /// ties broken by `order_hint` ascending.
    ///
    /// Fails with a cycle message when no topological order exists. Call
    /// [`Plan::validate`] first for the full error list.
    pub fn execution_order(&self) -> Result<Vec<Uuid>, String> {
        let index: HashMap<Uuid, usize> =
            self.steps.iter().enumerate().map(|(i, s)| (s.id, i)).collect();

        // duplicate dependency entries count once
        let deps: Vec<HashSet<Uuid>> = self
            .steps
            .iter()
            .map(|step| {
                step.dependencies
                    .iter()
                    .filter(|dep| index.contains_key(dep))
                    .copied()
                    .collect()
            })
            .collect();
        let mut indegree: Vec<usize> = deps.iter().map(HashSet::len).collect();

        let mut order = Vec::with_capacity(self.steps.len());
        let mut placed = vec![false; self.steps.len()];

        while order.len() < self.steps.len() {
            let next = (0..self.steps.len())
                .filter(|&i| !placed[i] && indegree[i] == 0)
                .min_by_key(|&i| (self.steps[i].order_hint, i));

            let Some(at) = next else {
                return Err("dependency cycle prevents execution ordering".to_string());
            };

            placed[at] = true;
            order.push(self.steps[at].id);

            let done = self.steps[at].id;
            for (i, step_deps) in deps.iter().enumerate() {
                if !placed[i] && step_deps.contains(&done) {
                    indegree[i] -= 1;
                }
            }
        }

        Ok(order)
    }

    /// Fraction of steps completed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let completed = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        completed as f64 / self.steps.len() as f64
    }

    /// Sum of the steps' time estimates.
    pub fn total_estimated_seconds(&self) -> u64 {
        self.steps.iter().map(|s| s.estimated_seconds).sum()
    }

    /// Estimated dollar cost: per-step default tokens times the agent's
    /// per-1k price.
    pub fn estimated_cost(&self, costs: &CostModel) -> f64 {
        self.steps
            .iter()
            .map(|s| {
                let cost = costs.for_agent(&s.agent_id);
                cost.estimated_tokens as f64 * cost.cost_per_1k / 1000.0
            })
            .sum()
    }

    /// Convert to the stable portable form.
    pub fn to_portable(&self) -> PortablePlan {
        PortablePlan {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            approved: self.approved,
            status: self.status,
            created_at: self.created_at,
            steps: self
                .steps
                .iter()
                .map(|s| PortableStep {
                    id: s.id,
                    description: s.description.clone(),
                    agent_id: s.agent_id.clone(),
                    tool: s.tool.clone(),
                    arguments: s.arguments.clone(),
                    dependencies: s.dependencies.clone(),
                    estimated_seconds: s.estimated_seconds,
                    status: s.status,
                    attempts: s.attempts,
                })
                .collect(),
        }
    }

    /// Reconstruct a plan from its portable form.
    ///
    /// Step order hints are recovered from position; transient fields
    /// (results, timestamps) start empty.
    pub fn from_portable(portable: PortablePlan) -> Self {
        Self {
            id: portable.id,
            name: portable.name,
            description: portable.description,
            approved: portable.approved,
            status: portable.status,
            created_at: portable.created_at,
            steps: portable
                .steps
                .into_iter()
                .enumerate()
                .map(|(i, s)| PlanStep {
                    id: s.id,
                    order_hint: i as u32 + 1,
                    description: s.description,
                    agent_id: s.agent_id,
                    tool: s.tool,
                    arguments: s.arguments,
                    dependencies: s.dependencies,
                    estimated_seconds: s.estimated_seconds,
                    status: s.status,
                    attempts: s.attempts,
                    result: None,
                    started_at: None,
                    finished_at: None,
                })
                .collect(),
        }
    }
}

/// Stable serialised form of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortablePlan {
    /// Plan id.
    pub id: Uuid,
    /// Workflow name.
    pub name: String,
    /// Free-text description.
    pub description: String,
    /// Approval flag.
    pub approved: bool,
    /// Plan status.
    pub status: PlanStatus,
    /// Steps in authored order.
    pub steps: Vec<PortableStep>,
    /// Parse timestamp.
    pub created_at: DateTime<Utc>,
}

/// Stable serialised form of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableStep {
    /// Step id.
    pub id: Uuid,
    /// Description.
    pub description: String,
    /// Agent name, verbatim.
    pub agent_id: String,
    /// Tool name, verbatim.
    pub tool: String,
    /// Tool arguments.
    pub arguments: serde_json::Value,
    /// Dependency step ids.
    pub dependencies: Vec<Uuid>,
    /// Time estimate.
    pub estimated_seconds: u64,
    /// Step status.
    pub status: StepStatus,
    /// Attempt count.
    pub attempts: u32,
}
