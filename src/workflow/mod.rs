//! Workflow engine: serial DAG execution with retries, checkpoints, and
//! rollback.
//!
//! [`WorkflowEngine::execute`] runs an approved, valid plan step by step
//! in topological order. Before any step that can mutate state it
//! snapshots the files the step declares; a failed step is retried with
//! exponential back-off, and exhausted retries (or a cancellation) roll
//! every checkpoint back in reverse order. Pause, resume, and cancel are
//! flags consulted at step boundaries only; the running step always
//! finishes first.

mod checkpoint;
mod state;

pub use checkpoint::{Checkpoint, FileSnapshot};
pub use state::WorkflowState;

use crate::config::WorkflowSettings;
use crate::executor::ToolExecutor;
use crate::observability::Logger;
use crate::plan::{Plan, PlanStatus, StepStatus};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Fixed number of attempts per step.
const MAX_STEP_ATTEMPTS: u32 = 3;

/// Upper bound on retry back-off.
const BACKOFF_CAP_SECS: u64 = 10;

/// What a progress event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    /// A checkpoint was captured before a mutating step.
    CheckpointCreated,
    /// A step began its first attempt.
    StepStarted,
    /// A step finished successfully.
    StepCompleted,
    /// A step exhausted its retries.
    StepFailed,
    /// A failed attempt will be retried.
    StepRetried,
    /// Every step completed.
    PlanCompleted,
    /// The plan failed or was cancelled.
    PlanFailed,
    /// Rollback began.
    RollbackStarted,
    /// Rollback finished.
    RollbackCompleted,
}

impl std::fmt::Display for ProgressKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProgressKind::CheckpointCreated => "checkpoint_created",
            ProgressKind::StepStarted => "step_started",
            ProgressKind::StepCompleted => "step_completed",
            ProgressKind::StepFailed => "step_failed",
            ProgressKind::StepRetried => "step_retried",
            ProgressKind::PlanCompleted => "plan_completed",
            ProgressKind::PlanFailed => "plan_failed",
            ProgressKind::RollbackStarted => "rollback_started",
            ProgressKind::RollbackCompleted => "rollback_completed",
        };
        write!(f, "{}", name)
    }
}

/// One progress notification.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Plan the event belongs to.
    pub plan_id: Uuid,
    /// Step the event concerns, when step-scoped.
    pub step_id: Option<Uuid>,
    /// What happened.
    pub kind: ProgressKind,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
}

/// Caller-supplied progress receiver.
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// The workflow engine.
pub struct WorkflowEngine {
    executor: Arc<ToolExecutor>,
    logger: Arc<Logger>,
    state_path: PathBuf,
    paused: watch::Sender<bool>,
    cancel: AtomicBool,
    callback: Mutex<Option<ProgressCallback>>,
    state: Mutex<Option<WorkflowState>>,
}

impl WorkflowEngine {
    /// Build an engine.
    ///
    /// # Arguments
    /// * `executor` - Tool executor every step runs through.
    /// * `logger` - Session logger for workflow events.
    /// * `settings` - Persistence location; defaults to the user data
    ///   directory when unset.
    pub fn new(executor: Arc<ToolExecutor>, logger: Arc<Logger>, settings: &WorkflowSettings) -> Self {
        let state_path = settings.state_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("hivekit")
                .join("workflow_state.json")
        });

        let (paused, _) = watch::channel(false);

        Self {
            executor,
            logger,
            state_path,
            paused,
            cancel: AtomicBool::new(false),
            callback: Mutex::new(None),
            state: Mutex::new(None),
        }
    }

    /// Register the progress callback. Replaces any previous one.
    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        *self.callback.lock().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    /// Pause execution at the next step boundary.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Resume a paused execution.
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Request cancellation. The running step completes; the next one is
    /// skipped and checkpoints roll back.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// A copy of the live workflow state, when a plan is or was running.
    pub fn snapshot_state(&self) -> Option<WorkflowState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Persist the live workflow state to the configured location.
    pub fn save_state(&self) -> anyhow::Result<()> {
        match self.snapshot_state() {
            Some(state) => state.save(&self.state_path),
            None => Err(anyhow::anyhow!("no workflow state to save")),
        }
    }

    /// Load previously persisted workflow state. Running steps come back
    /// pending and will re-run under [`WorkflowEngine::execute`].
    pub fn load_state(&self) -> anyhow::Result<WorkflowState> {
        WorkflowState::load(&self.state_path)
    }

    fn emit(&self, plan_id: Uuid, step_id: Option<Uuid>, kind: ProgressKind) {
        let event = ProgressEvent {
            plan_id,
            step_id,
            kind,
            timestamp: Utc::now(),
        };
        let _ = self
            .logger
            .log_workflow_event(&plan_id.to_string(), &kind.to_string());
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    fn sync_state(&self, plan: &Plan, checkpoints: &[Checkpoint], current: Option<Uuid>) {
        let state = WorkflowState {
            plan: plan.to_portable(),
            checkpoints: checkpoints.to_vec(),
            current_step_id: current,
            paused: *self.paused.borrow(),
            cancel_requested: self.cancel.load(Ordering::SeqCst),
        };
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state);
    }

    async fn wait_while_paused(&self) {
        let mut rx = self.paused.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn rollback(&self, plan_id: Uuid, checkpoints: &[Checkpoint]) {
        self.emit(plan_id, None, ProgressKind::RollbackStarted);
        for checkpoint in checkpoints.iter().rev() {
            if let Err(e) = checkpoint.restore().await {
                // a failed restore must not mask the plan failure
                let _ = self.logger.log_error(
                    &format!("rollback of checkpoint {} failed: {e}", checkpoint.id),
                    Some("workflow rollback"),
                );
            }
        }
        self.emit(plan_id, None, ProgressKind::RollbackCompleted);
    }

    /// Execute an approved plan to completion, failure, or cancellation.
    ///
    /// # Arguments
    /// * `plan` - The plan; must be approved and pass validation against
    ///   `agent_catalogue`.
    /// * `agent_catalogue` - Names of agents the runtime currently knows.
    ///
    /// # Returns
    /// `(true, message)` when every step completed; `(false, message)`
    /// after validation failure, step failure (rolled back), or
    /// cancellation (rolled back).
    pub async fn execute(&self, mut plan: Plan, agent_catalogue: &[String]) -> (bool, String) {
        if !plan.approved {
            return (false, "plan is not approved".to_string());
        }
        let errors = plan.validate(agent_catalogue);
        if !errors.is_empty() {
            return (false, format!("validation failed: {}", errors.join("; ")));
        }
        let order = match plan.execution_order() {
            Ok(order) => order,
            Err(e) => return (false, format!("validation failed: {e}")),
        };

        self.cancel.store(false, Ordering::SeqCst);
        plan.status = PlanStatus::Running;
        let plan_id = plan.id;

        let mut checkpoints: Vec<Checkpoint> = Vec::new();
        self.sync_state(&plan, &checkpoints, None);

        let mut failure: Option<String> = None;
        let mut cancelled = false;

        for step_id in order {
            // resume path: completed steps stay done
            if plan.step(step_id).map(|s| s.status) == Some(StepStatus::Completed) {
                continue;
            }

            if self.cancel.load(Ordering::SeqCst) {
                if let Some(step) = plan.step_mut(step_id) {
                    step.status = StepStatus::Skipped;
                }
                cancelled = true;
                break;
            }

            self.wait_while_paused().await;

            let (tool, arguments, description) = match plan.step(step_id) {
                Some(step) => match step.tool_spec() {
                    Some(tool) => (tool, step.arguments.clone(), step.description.clone()),
                    None => {
                        failure = Some(format!("step '{}' has no runnable tool", step.description));
                        break;
                    }
                },
                None => continue,
            };

            // checkpoint before the first attempt of a mutating step
            if tool.is_mutating(&arguments) {
                let mut paths = Vec::new();
                for raw in tool.touched_paths(&arguments) {
                    match self.executor.resolve_path(&raw) {
                        Ok(path) => paths.push(path),
                        Err(e) => {
                            let _ = self.logger.log_warn(&format!(
                                "not snapshotting '{raw}': {e}; the tool call will reject it"
                            ));
                        }
                    }
                }
                match Checkpoint::capture(plan_id, step_id, &paths).await {
                    Ok(checkpoint) => {
                        checkpoints.push(checkpoint);
                        self.emit(plan_id, Some(step_id), ProgressKind::CheckpointCreated);
                    }
                    Err(e) => {
                        failure = Some(format!("checkpoint before '{description}' failed: {e}"));
                        break;
                    }
                }
            }

            if let Some(step) = plan.step_mut(step_id) {
                step.status = StepStatus::Running;
                step.started_at = Some(Utc::now());
            }
            self.sync_state(&plan, &checkpoints, Some(step_id));
            self.emit(plan_id, Some(step_id), ProgressKind::StepStarted);

            // bounded retries; the checkpoint above covers every attempt
            loop {
                let attempts = match plan.step_mut(step_id) {
                    Some(step) => {
                        step.attempts += 1;
                        step.attempts
                    }
                    None => break,
                };

                let result = self.executor.dispatch(tool, &arguments).await;
                let _ = self.logger.log_tool_invocation(
                    &format!("step '{description}'"),
                    &tool.to_string(),
                    result.success,
                    result.duration_ms,
                );

                if result.success {
                    if let Some(step) = plan.step_mut(step_id) {
                        step.status = StepStatus::Completed;
                        step.result = Some(result);
                        step.finished_at = Some(Utc::now());
                    }
                    self.emit(plan_id, Some(step_id), ProgressKind::StepCompleted);
                    break;
                }

                if attempts < MAX_STEP_ATTEMPTS {
                    self.emit(plan_id, Some(step_id), ProgressKind::StepRetried);
                    let backoff = 2u64.pow(attempts - 1).min(BACKOFF_CAP_SECS);
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    continue;
                }

                let reason = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "tool failed".to_string());
                if let Some(step) = plan.step_mut(step_id) {
                    step.status = StepStatus::Failed;
                    step.result = Some(result);
                    step.finished_at = Some(Utc::now());
                }
                self.emit(plan_id, Some(step_id), ProgressKind::StepFailed);
                failure = Some(format!(
                    "step '{description}' failed after {attempts} attempts: {reason}"
                ));
                break;
            }

            self.sync_state(&plan, &checkpoints, Some(step_id));
            if failure.is_some() {
                break;
            }
        }

        if cancelled || failure.is_some() {
            self.rollback(plan_id, &checkpoints).await;
            checkpoints.clear();
            plan.status = if cancelled {
                PlanStatus::Cancelled
            } else {
                PlanStatus::Failed
            };
            self.sync_state(&plan, &checkpoints, None);
            self.emit(plan_id, None, ProgressKind::PlanFailed);

            let message = if cancelled {
                "plan cancelled".to_string()
            } else {
                failure.unwrap_or_else(|| "plan failed".to_string())
            };
            return (false, message);
        }

        plan.status = PlanStatus::Completed;
        checkpoints.clear();
        self.sync_state(&plan, &checkpoints, None);
        self.emit(plan_id, None, ProgressKind::PlanCompleted);
        // nothing left to resume
        let _ = std::fs::remove_file(&self.state_path);

        (true, "plan completed".to_string())
    }
}
