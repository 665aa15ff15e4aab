//! Wiring facade: one object a front-end drives.
//!
//! The orchestrator constructs and connects the runtime from settings:
//! agent manager, tool executor, workflow engine, logger. A CLI (or any
//! driver) feeds it user lines and plan decisions; streamed output goes to
//! the [`OutputSink`](crate::sink::OutputSink) the driver supplied.
//!
//! Conventional process exit codes for drivers: 0 for a normal shutdown,
//! 2 for a configuration error at startup, 3 for a fatal runtime error.

use crate::agent::{AgentId, AgentRole};
use crate::config::{SecretStore, Settings};
use crate::error::OrchestratorError;
use crate::executor::ToolExecutor;
use crate::manager::{AgentInfo, AgentManager, ProviderFactory};
use crate::observability::Logger;
use crate::plan::{parse_plan, AgentCost, CostModel, Plan, PlanStatus};
use crate::sink::OutputSink;
use crate::workflow::{ProgressCallback, WorkflowEngine};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// What one user line produced.
#[derive(Debug, Default)]
pub struct LineOutcome {
    /// Response text from the addressed agent.
    pub response_text: String,
    /// Agents auto-spawned by keyword scan.
    pub auto_spawned: Vec<AgentId>,
    /// Plans lifted out of the response, stored as drafts.
    pub submitted_plans: Vec<Uuid>,
}

/// Session counters for `stats`.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Agents ever registered.
    pub agents_total: usize,
    /// Agents currently active.
    pub agents_active: usize,
    /// Completion requests issued.
    pub requests: u32,
    /// Tokens used or estimated.
    pub estimated_tokens: u64,
    /// Dollar estimate from per-role pricing.
    pub estimated_cost: f64,
    /// Plans submitted this session.
    pub plans_submitted: u64,
    /// Plans that ran to completion.
    pub plans_completed: u64,
    /// Plans that failed or were cancelled.
    pub plans_failed: u64,
}

/// The assembled runtime.
pub struct Orchestrator {
    manager: Arc<AgentManager>,
    engine: Arc<WorkflowEngine>,
    logger: Arc<Logger>,
    cost_model: CostModel,
    pending_plans: Mutex<HashMap<Uuid, Plan>>,
    plans_submitted: AtomicU64,
    plans_completed: AtomicU64,
    plans_failed: AtomicU64,
}

impl Orchestrator {
    /// Assemble the runtime with the stock OpenAI-compatible provider.
    pub fn new(
        settings: Settings,
        secrets: SecretStore,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Self, OrchestratorError> {
        let factory = AgentManager::openai_factory(settings.llm.clone());
        Self::with_provider_factory(settings, secrets, sink, factory)
    }

    /// Assemble the runtime with a custom provider factory.
    ///
    /// Embedding callers and tests use this to substitute providers
    /// without touching the wiring.
    pub fn with_provider_factory(
        settings: Settings,
        secrets: SecretStore,
        sink: Arc<dyn OutputSink>,
        provider_factory: ProviderFactory,
    ) -> Result<Self, OrchestratorError> {
        settings.validate()?;
        let profiles = settings.build_profiles(&secrets)?;

        let logger = Arc::new(
            Logger::new(
                settings.logging.log_file.as_deref(),
                Some(&settings.logging.log_level),
            )
            .map_err(|e| OrchestratorError::Configuration(e.to_string()))?,
        );

        let working_dir = settings
            .working_dir
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        let executor = Arc::new(ToolExecutor::new(
            settings.file_ops.clone(),
            settings.tool_policy.clone(),
            &working_dir,
        ));

        let cost_model = CostModel {
            per_agent: profiles
                .values()
                .map(|p| {
                    (
                        p.role.to_string(),
                        AgentCost {
                            estimated_tokens: p.estimated_task_tokens,
                            cost_per_1k: p.cost_per_1k_tokens.unwrap_or(0.0),
                        },
                    )
                })
                .collect(),
            default: AgentCost::default(),
        };

        let manager = Arc::new(AgentManager::new(
            profiles,
            settings.max_concurrent_agents,
            settings.auto_spawn_on_keywords,
            settings.plan_mode,
            provider_factory,
            executor.clone(),
            sink,
            logger.clone(),
        )?);

        let engine = Arc::new(WorkflowEngine::new(
            executor,
            logger.clone(),
            &settings.workflow,
        ));

        let _ = logger.log_session_start(&format!(
            "max_concurrent_agents: {}, plan_mode: {}, auto_spawn: {}",
            settings.max_concurrent_agents, settings.plan_mode, settings.auto_spawn_on_keywords
        ));

        Ok(Self {
            manager,
            engine,
            logger,
            cost_model,
            pending_plans: Mutex::new(HashMap::new()),
            plans_submitted: AtomicU64::new(0),
            plans_completed: AtomicU64::new(0),
            plans_failed: AtomicU64::new(0),
        })
    }

    /// Handle one user line.
    ///
    /// `@agent-id text` routes directly to that agent; anything else goes
    /// to the main agent after the auto-spawn keyword scan. Plans emitted
    /// during the turn are parsed and stored as drafts awaiting
    /// [`Orchestrator::approve`].
    pub async fn handle_user_line(&self, text: &str) -> Result<LineOutcome, OrchestratorError> {
        let mut outcome = LineOutcome::default();

        let (target, payload) = match parse_at_route(text) {
            Some((id, rest)) => (id, rest),
            None => {
                outcome.auto_spawned = self.manager.check_and_auto_spawn(text);
                (AgentId::main(), text.to_string())
            }
        };

        let turn = self.manager.route_direct(&target, &payload).await?;
        outcome.response_text = turn.response_text;

        for plan_text in &turn.plans {
            match parse_plan(plan_text) {
                Some(plan) => outcome.submitted_plans.push(self.submit_plan(plan)),
                None => {
                    let _ = self
                        .logger
                        .log_warn("agent emitted a [PLAN] block that does not parse; ignored");
                }
            }
        }

        Ok(outcome)
    }

    /// Spawn a sub-agent under main.
    pub fn spawn(&self, role: AgentRole, task: &str) -> Result<AgentId, OrchestratorError> {
        self.manager.spawn(role, task, &AgentId::main())
    }

    /// Terminate an agent.
    pub fn terminate(&self, id: &AgentId) -> Result<(), OrchestratorError> {
        self.manager.terminate(id)
    }

    /// Snapshot of all agents.
    pub fn list_agents(&self) -> Vec<AgentInfo> {
        self.manager.list()
    }

    /// Store a draft plan awaiting approval. Returns its id.
    pub fn submit_plan(&self, plan: Plan) -> Uuid {
        let id = plan.id;
        let _ = self.logger.log_workflow_event(
            &id.to_string(),
            &format!("plan '{}' submitted ({} steps)", plan.name, plan.steps.len()),
        );
        self.pending_plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, plan);
        self.plans_submitted.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Drafts awaiting a decision, with progress and cost roll-ups.
    pub fn pending_plans(&self) -> Vec<(Uuid, String, usize, f64)> {
        self.pending_plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|plan| {
                (
                    plan.id,
                    plan.name.clone(),
                    plan.steps.len(),
                    plan.estimated_cost(&self.cost_model),
                )
            })
            .collect()
    }

    /// Approve a draft and execute it to completion.
    ///
    /// Validation failures leave the draft in place (the user is expected
    /// to modify and resubmit) and surface as
    /// [`OrchestratorError::Validation`].
    pub async fn approve(&self, plan_id: Uuid) -> Result<(bool, String), OrchestratorError> {
        let mut plan = {
            let pending = self.pending_plans.lock().unwrap_or_else(|e| e.into_inner());
            pending
                .get(&plan_id)
                .cloned()
                .ok_or_else(|| OrchestratorError::UnknownPlan(plan_id.to_string()))?
        };

        let catalogue = self.manager.agent_catalogue();
        let errors = plan.validate(&catalogue);
        if !errors.is_empty() {
            return Err(OrchestratorError::Validation(errors));
        }

        plan.approved = true;
        plan.status = PlanStatus::Approved;
        self.pending_plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&plan_id);

        let (ok, message) = self.engine.execute(plan, &catalogue).await;
        if ok {
            self.plans_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.plans_failed.fetch_add(1, Ordering::Relaxed);
        }
        Ok((ok, message))
    }

    /// Discard a draft plan.
    pub fn reject(&self, plan_id: Uuid) -> Result<(), OrchestratorError> {
        let removed = self
            .pending_plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&plan_id);
        match removed {
            Some(plan) => {
                let _ = self
                    .logger
                    .log_workflow_event(&plan_id.to_string(), &format!("plan '{}' rejected", plan.name));
                Ok(())
            }
            None => Err(OrchestratorError::UnknownPlan(plan_id.to_string())),
        }
    }

    /// Request cancellation of the running workflow.
    pub fn cancel_workflow(&self) {
        self.engine.cancel();
    }

    /// Pause the running workflow at the next step boundary.
    pub fn pause_workflow(&self) {
        self.engine.pause();
    }

    /// Resume a paused workflow.
    pub fn resume_workflow(&self) {
        self.engine.resume();
    }

    /// Register a workflow progress callback.
    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        self.engine.set_progress_callback(callback);
    }

    /// Persist the live workflow state.
    pub fn save_workflow_state(&self) -> anyhow::Result<()> {
        self.engine.save_state()
    }

    /// Per-agent request and token counters.
    pub async fn agent_usage(&self) -> Vec<(AgentId, crate::agent::AgentUsage)> {
        self.manager.usage_by_agent().await
    }

    /// Session counters.
    pub async fn stats(&self) -> SessionStats {
        let agents = self.manager.list();
        let (requests, tokens, cost) = self.manager.total_usage().await;

        SessionStats {
            agents_total: agents.len(),
            agents_active: agents.iter().filter(|a| a.status.is_active()).count(),
            requests,
            estimated_tokens: tokens,
            estimated_cost: cost,
            plans_submitted: self.plans_submitted.load(Ordering::Relaxed),
            plans_completed: self.plans_completed.load(Ordering::Relaxed),
            plans_failed: self.plans_failed.load(Ordering::Relaxed),
        }
    }
}

/// Split an `@agent-id rest-of-line` route, if that is what the line is.
fn parse_at_route(text: &str) -> Option<(AgentId, String)> {
    let rest = text.strip_prefix('@')?;
    let (id, payload) = rest.split_once(char::is_whitespace)?;
    if id.is_empty() || payload.trim().is_empty() {
        return None;
    }
    Some((AgentId::from(id), payload.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentProfile;
    use crate::provider::ChatProvider;
    use crate::test_utils::{CollectingSink, ScriptedProvider};
    use std::collections::VecDeque;
    use tempfile::TempDir;

    /// Factory that replays whole-session scripts in spawn order.
    fn session_factory(scripts: Vec<Vec<String>>) -> ProviderFactory {
        let scripts = Mutex::new(VecDeque::from(scripts));
        Box::new(move |_profile: &AgentProfile| {
            let script = scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            Ok(ScriptedProvider::new(script) as Arc<dyn ChatProvider>)
        })
    }

    fn test_settings(dir: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.logging.log_file = Some(dir.path().join("log.md"));
        settings.logging.log_level = "ERROR".to_string();
        settings.working_dir = Some(dir.path().to_path_buf());
        settings.workflow.state_path = Some(dir.path().join("state.json"));
        for role in ["researcher", "reviewer", "implementer"] {
            settings
                .agents
                .insert(role.to_string(), crate::config::RoleSettings::default());
        }
        settings
    }

    fn orchestrator_with(dir: &TempDir, scripts: Vec<Vec<String>>) -> Orchestrator {
        Orchestrator::with_provider_factory(
            test_settings(dir),
            SecretStore::empty(),
            Arc::new(CollectingSink::default()),
            session_factory(scripts),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn user_line_round_trips_through_main() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(&dir, vec![vec!["sure thing".to_string()]]);

        let outcome = orchestrator.handle_user_line("do something").await.unwrap();
        assert_eq!(outcome.response_text, "sure thing");
        assert!(outcome.submitted_plans.is_empty());

        let stats = orchestrator.stats().await;
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.agents_total, 1);
    }

    #[tokio::test]
    async fn emitted_plan_becomes_a_pending_draft() {
        let dir = TempDir::new().unwrap();
        let plan_response = "[PLAN]\n\
            ## Workflow: touch a file\n\
            ### Step 1: create it\n\
            - Agent: main\n\
            - Tool: write_file_tool\n\
            - Arguments: {\"path\": \"made.txt\", \"content\": \"done\"}\n\
            - Dependencies: none\n\
            [/PLAN]"
            .to_string();
        let orchestrator = orchestrator_with(&dir, vec![vec![plan_response]]);

        let outcome = orchestrator.handle_user_line("plan the work").await.unwrap();
        assert_eq!(outcome.submitted_plans.len(), 1);
        assert_eq!(orchestrator.pending_plans().len(), 1);

        let stats = orchestrator.stats().await;
        assert_eq!(stats.plans_submitted, 1);
    }

    #[tokio::test]
    async fn approve_executes_and_reject_discards() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(&dir, vec![vec![]]);

        let mut plan = Plan::new("write it", "");
        plan.steps.push(crate::plan::PlanStep::new(
            1,
            "write the file",
            "main",
            "write_file_tool",
            serde_json::json!({"path": "approved.txt", "content": "yes"}),
        ));
        let plan_id = orchestrator.submit_plan(plan.clone());

        let (ok, message) = orchestrator.approve(plan_id).await.unwrap();
        assert!(ok, "{message}");
        assert!(dir.path().join("approved.txt").exists());
        assert!(orchestrator.pending_plans().is_empty());

        let stats = orchestrator.stats().await;
        assert_eq!(stats.plans_completed, 1);

        // a second approval of the same id no longer finds it
        assert!(matches!(
            orchestrator.approve(plan_id).await,
            Err(OrchestratorError::UnknownPlan(_))
        ));

        let other_id = orchestrator.submit_plan(plan);
        orchestrator.reject(other_id).unwrap();
        assert!(orchestrator.reject(other_id).is_err());
    }

    #[tokio::test]
    async fn invalid_plan_is_refused_but_kept_for_editing() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(&dir, vec![vec![]]);

        let mut plan = Plan::new("broken", "");
        plan.steps.push(crate::plan::PlanStep::new(
            1,
            "impossible",
            "stranger",
            "teleport_tool",
            serde_json::json!({}),
        ));
        let plan_id = orchestrator.submit_plan(plan);

        let err = orchestrator.approve(plan_id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        // still pending so the user can modify and resubmit
        assert_eq!(orchestrator.pending_plans().len(), 1);
    }

    #[tokio::test]
    async fn at_routing_reaches_a_spawned_agent() {
        let dir = TempDir::new().unwrap();
        // script order: main first (constructed by the manager), then the sub-agent
        let orchestrator = orchestrator_with(
            &dir,
            vec![
                vec![],
                vec![
                    "[SUMMARY]first pass done[/SUMMARY]".to_string(),
                    "direct answer".to_string(),
                ],
            ],
        );

        let id = orchestrator
            .spawn(AgentRole::Researcher, "dig into the logs")
            .unwrap();

        // wait until the spawned task settles
        for _ in 0..200 {
            let done = orchestrator
                .list_agents()
                .into_iter()
                .any(|a| a.id == id && !a.status.is_active());
            if done {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let line = format!("@{} anything new?", id);
        let err = orchestrator.handle_user_line(&line).await;
        // a completed one-shot agent refuses further input
        assert!(matches!(err, Err(OrchestratorError::Execution(_))));
    }

    #[test]
    fn at_route_parsing() {
        let (id, rest) = parse_at_route("@reviewer-12ab look again").unwrap();
        assert_eq!(id.as_str(), "reviewer-12ab");
        assert_eq!(rest, "look again");

        assert!(parse_at_route("plain line").is_none());
        assert!(parse_at_route("@loner").is_none());
    }

    #[tokio::test]
    async fn workflow_controls_delegate_to_the_engine() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(&dir, vec![vec![]]);

        // none of these panic without a running workflow
        orchestrator.pause_workflow();
        orchestrator.resume_workflow();
        orchestrator.cancel_workflow();
        assert!(orchestrator.save_workflow_state().is_err());
    }
}
