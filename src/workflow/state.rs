//! Persistable workflow state.

use super::Checkpoint;
use crate::plan::{PortablePlan, StepStatus};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Everything needed to resume a plan after a process restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    /// The plan in its portable form.
    pub plan: PortablePlan,
    /// Outstanding checkpoints, oldest first.
    pub checkpoints: Vec<Checkpoint>,
    /// Step currently (or last) being executed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<Uuid>,
    /// Whether execution is paused.
    pub paused: bool,
    /// Whether cancellation was requested.
    pub cancel_requested: bool,
}

impl WorkflowState {
    /// Serialise to a state file as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create state directory: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("state serialisation failed")?;
        std::fs::write(path, json)
            .with_context(|| format!("cannot write state file: {}", path.display()))
    }

    /// Load from a state file.
    ///
    /// Steps recorded as running are reset to pending; they will re-run
    /// when execution resumes.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read state file: {}", path.display()))?;
        let mut state: WorkflowState =
            serde_json::from_str(&raw).context("state deserialisation failed")?;

        for step in &mut state.plan.steps {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Pending;
            }
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Plan, PlanStep};

    #[test]
    fn round_trips_and_resets_running_steps() {
        let mut plan = Plan::new("persisted", "");
        let mut step = PlanStep::new(
            1,
            "only step",
            "main",
            "list_files_tool",
            serde_json::json!({"directory": "."}),
        );
        step.status = StepStatus::Running;
        let step_id = step.id;
        plan.steps.push(step);

        let state = WorkflowState {
            plan: plan.to_portable(),
            checkpoints: Vec::new(),
            current_step_id: Some(step_id),
            paused: true,
            cancel_requested: false,
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/workflow.json");
        state.save(&path).unwrap();

        let loaded = WorkflowState::load(&path).unwrap();
        assert_eq!(loaded.plan.id, plan.id);
        assert_eq!(loaded.current_step_id, Some(step_id));
        assert!(loaded.paused);
        // running resets to pending so the step re-runs
        assert_eq!(loaded.plan.steps[0].status, StepStatus::Pending);
    }
}
