//! Agent registry and lifecycle management.
//!
//! The manager owns every agent in the process. Sub-agents spawn as
//! independent tokio tasks that run their seeded task to stream close and
//! then hand their summary back to the parent; the main agent is driven
//! turn by turn through [`AgentManager::route_direct`]. The registry is
//! the only shared-mutable structure: a std `RwLock` held for short,
//! await-free sections. Conversation history stays inside each agent's
//! mutex, and summary delivery is the single cross-task hand-off (taken
//! under the child's lock, appended under the parent's).

use crate::agent::{
    Agent, AgentId, AgentProfile, AgentRole, AgentStatus, AgentUsage, ConversationMessage,
    TurnOutcome,
};
use crate::config::LlmSettings;
use crate::error::OrchestratorError;
use crate::executor::ToolExecutor;
use crate::observability::Logger;
use crate::provider::{ChatProvider, OpenAiProvider};
use crate::sink::{OutputSink, StreamEvent, StreamKind};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Builds a provider for a profile at spawn time.
pub type ProviderFactory =
    Box<dyn Fn(&AgentProfile) -> Result<Arc<dyn ChatProvider>, OrchestratorError> + Send + Sync>;

/// One row of [`AgentManager::list`].
#[derive(Debug, Clone)]
pub struct AgentInfo {
    /// Agent id.
    pub id: AgentId,
    /// Agent role.
    pub role: AgentRole,
    /// Current status.
    pub status: AgentStatus,
    /// Spawn time.
    pub started_at: DateTime<Utc>,
}

/// Status cell readable without the agent's own lock.
///
/// A running turn holds the agent mutex for its whole duration, so
/// listing and capacity checks read this shadow instead. The owning task
/// keeps the two in step.
#[derive(Debug)]
struct StatusCell(Mutex<AgentStatus>);

impl StatusCell {
    fn new(status: AgentStatus) -> Arc<Self> {
        Arc::new(Self(Mutex::new(status)))
    }

    fn get(&self) -> AgentStatus {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advance if the machine admits it; terminated always wins.
    fn advance(&self, next: AgentStatus) -> bool {
        let mut current = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if current.can_transition_to(next) {
            *current = next;
            true
        } else {
            false
        }
    }
}

struct AgentEntry {
    agent: Arc<tokio::sync::Mutex<Agent>>,
    status: Arc<StatusCell>,
    cancel: CancellationToken,
    role: AgentRole,
    started_at: DateTime<Utc>,
}

/// Process-wide agent registry.
pub struct AgentManager {
    registry: RwLock<HashMap<AgentId, AgentEntry>>,
    profiles: HashMap<AgentRole, AgentProfile>,
    max_concurrent: usize,
    auto_spawn: bool,
    plan_mode: bool,
    provider_factory: ProviderFactory,
    executor: Arc<ToolExecutor>,
    sink: Arc<dyn OutputSink>,
    logger: Arc<Logger>,
}

impl AgentManager {
    /// Build a manager and register the main agent.
    ///
    /// # Arguments
    /// * `profiles` - Resolved role profiles; must include main.
    /// * `max_concurrent` - Active-agent cap, main included.
    /// * `auto_spawn` - Scan user input for role keywords.
    /// * `plan_mode` - Queue main-agent file ops as suggestions.
    /// * `provider_factory` - Provider construction per profile.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        profiles: HashMap<AgentRole, AgentProfile>,
        max_concurrent: usize,
        auto_spawn: bool,
        plan_mode: bool,
        provider_factory: ProviderFactory,
        executor: Arc<ToolExecutor>,
        sink: Arc<dyn OutputSink>,
        logger: Arc<Logger>,
    ) -> Result<Self, OrchestratorError> {
        let manager = Self {
            registry: RwLock::new(HashMap::new()),
            profiles,
            max_concurrent,
            auto_spawn,
            plan_mode,
            provider_factory,
            executor,
            sink,
            logger,
        };

        let main_profile = manager
            .profiles
            .get(&AgentRole::Main)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::Configuration("no profile configured for main".to_string())
            })?;
        let provider = (manager.provider_factory)(&main_profile)?;
        let main = Agent::new(
            AgentId::main(),
            main_profile,
            None,
            manager.plan_mode,
            provider,
            manager.executor.clone(),
            manager.sink.clone(),
            manager.logger.clone(),
        );

        manager.insert_entry(main, AgentRole::Main);
        Ok(manager)
    }

    /// The stock factory: an OpenAI-compatible client per profile, with
    /// the configured HTTP timeouts.
    pub fn openai_factory(llm: LlmSettings) -> ProviderFactory {
        Box::new(move |profile: &AgentProfile| {
            let provider = OpenAiProvider::with_timeouts(
                profile.base_url.clone(),
                profile.api_key.clone(),
                Duration::from_secs(llm.request_timeout_seconds),
                Duration::from_secs(llm.read_idle_timeout_seconds),
            )?;
            Ok(Arc::new(provider) as Arc<dyn ChatProvider>)
        })
    }

    fn insert_entry(&self, agent: Agent, role: AgentRole) {
        let id = agent.id().clone();
        let entry = AgentEntry {
            agent: Arc::new(tokio::sync::Mutex::new(agent)),
            status: StatusCell::new(AgentStatus::Initializing),
            cancel: CancellationToken::new(),
            role,
            started_at: Utc::now(),
        };
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, entry);
    }

    fn active_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|entry| entry.status.get().is_active())
            .count()
    }

    fn entry_handles(
        &self,
        id: &AgentId,
    ) -> Option<(Arc<tokio::sync::Mutex<Agent>>, Arc<StatusCell>, CancellationToken)> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        registry
            .get(id)
            .map(|entry| (entry.agent.clone(), entry.status.clone(), entry.cancel.clone()))
    }

    /// Names the plan validator accepts as step agents: every live agent
    /// id plus every configured role name.
    pub fn agent_catalogue(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .map(|id| id.to_string())
            .collect();
        names.extend(self.profiles.keys().map(|role| role.to_string()));
        names.sort();
        names.dedup();
        names
    }

    /// Spawn a sub-agent and start its task concurrently.
    ///
    /// # Arguments
    /// * `role` - Sub-agent role; main is reserved.
    /// * `task` - First user turn seeded into the agent.
    /// * `parent_id` - Receiver of the summary; usually main.
    ///
    /// # Returns
    /// The new agent's id, or [`OrchestratorError::Capacity`] when the
    /// active count is at the limit.
    pub fn spawn(
        &self,
        role: AgentRole,
        task: &str,
        parent_id: &AgentId,
    ) -> Result<AgentId, OrchestratorError> {
        if role == AgentRole::Main {
            return Err(OrchestratorError::Configuration(
                "main is reserved and cannot be spawned".to_string(),
            ));
        }
        let profile = self.profiles.get(&role).cloned().ok_or_else(|| {
            OrchestratorError::Configuration(format!("no profile configured for role {role}"))
        })?;

        let active = self.active_count();
        if active >= self.max_concurrent {
            return Err(OrchestratorError::Capacity {
                active,
                limit: self.max_concurrent,
            });
        }

        let provider = (self.provider_factory)(&profile)?;
        let id = AgentId::fresh(role);
        let mut agent = Agent::new(
            id.clone(),
            profile.clone(),
            Some(parent_id.clone()),
            self.plan_mode,
            provider,
            self.executor.clone(),
            self.sink.clone(),
            self.logger.clone(),
        );
        agent.set_task_description(task);

        if profile.inherit_parent_history {
            match self.entry_handles(parent_id) {
                Some((parent, _, _)) => match parent.try_lock() {
                    Ok(parent_agent) => agent.inherit_history(parent_agent.history()),
                    Err(_) => {
                        let _ = self.logger.log_warn(&format!(
                            "{id}: parent {parent_id} busy, spawning without inherited history"
                        ));
                    }
                },
                None => {
                    return Err(OrchestratorError::UnknownAgent(parent_id.to_string()));
                }
            }
        }

        let _ = self
            .logger
            .log_agent_spawned(id.as_str(), &role.to_string(), task);
        self.insert_entry(agent, role);
        self.start_task(id.clone(), parent_id.clone(), task.to_string());
        Ok(id)
    }

    /// Drive one spawned agent to completion and deliver its summary.
    fn start_task(&self, id: AgentId, parent_id: AgentId, task: String) {
        let Some((agent, status, cancel)) = self.entry_handles(&id) else {
            return;
        };
        let parent_handles = self.entry_handles(&parent_id);
        let sink = self.sink.clone();
        let logger = self.logger.clone();

        tokio::spawn(async move {
            let mut guard = agent.lock().await;
            status.advance(AgentStatus::Working);
            let _ = guard.transition(AgentStatus::Working);

            let result = guard.send_user_turn(&task, &cancel).await;

            let (next_status, summary, error) = match result {
                Ok(outcome) if outcome.cancelled => (AgentStatus::Terminated, None, None),
                Ok(_) => {
                    let next = if guard.profile().persistent {
                        AgentStatus::Idle
                    } else {
                        AgentStatus::Completed
                    };
                    (next, guard.take_pending_summary(), None)
                }
                Err(e) => (AgentStatus::Error, None, Some(e.to_string())),
            };

            let role = guard.role();
            if next_status == AgentStatus::Terminated {
                guard.mark_terminated();
            } else {
                let _ = guard.transition(next_status);
            }
            drop(guard);
            status.advance(next_status);

            // single cross-task hand-off: child lock released, parent
            // lock taken fresh
            if let Some((parent, _, _)) = parent_handles {
                if let Some(summary) = summary {
                    let mut parent_agent = parent.lock().await;
                    parent_agent.receive_summary(role, &summary.text);
                    sink.emit(StreamEvent {
                        agent_id: id.clone(),
                        role,
                        kind: StreamKind::System,
                        text: format!("summary delivered to {parent_id}"),
                    });
                } else if let Some(error) = error {
                    let mut parent_agent = parent.lock().await;
                    parent_agent.receive_error(role, &error);
                    let _ = logger.log_error(
                        &format!("agent {id} failed: {error}"),
                        Some("sub-agent task"),
                    );
                }
            }
        });
    }

    /// Cancel an agent's in-flight stream and mark it terminated.
    pub fn terminate(&self, id: &AgentId) -> Result<(), OrchestratorError> {
        let Some((_, status, cancel)) = self.entry_handles(id) else {
            return Err(OrchestratorError::UnknownAgent(id.to_string()));
        };
        cancel.cancel();
        status.advance(AgentStatus::Terminated);
        let _ = self.logger.log_agent_status(id.as_str(), "terminated");
        Ok(())
    }

    /// Snapshot of every registered agent, oldest first.
    pub fn list(&self) -> Vec<AgentInfo> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        let mut infos: Vec<AgentInfo> = registry
            .iter()
            .map(|(id, entry)| AgentInfo {
                id: id.clone(),
                role: entry.role,
                status: entry.status.get(),
                started_at: entry.started_at,
            })
            .collect();
        infos.sort_by_key(|info| info.started_at);
        infos
    }

    /// Deliver a pending summary by hand.
    ///
    /// The spawned-task path does this automatically on stream close;
    /// this entry point serves drivers that poll.
    pub async fn deliver_summary(
        &self,
        from_id: &AgentId,
        to_id: &AgentId,
    ) -> Result<bool, OrchestratorError> {
        let Some((from_agent, _, _)) = self.entry_handles(from_id) else {
            return Err(OrchestratorError::UnknownAgent(from_id.to_string()));
        };
        let Some((to_agent, _, _)) = self.entry_handles(to_id) else {
            return Err(OrchestratorError::UnknownAgent(to_id.to_string()));
        };

        let (role, summary) = {
            let mut guard = from_agent.lock().await;
            (guard.role(), guard.take_pending_summary())
        };

        match summary {
            Some(summary) => {
                to_agent.lock().await.receive_summary(role, &summary.text);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Send a user line straight to one agent and run its turn.
    ///
    /// Used for the main agent's conversation and for `@agent` routing.
    /// An agent already mid-turn (or completed/terminated) refuses input
    /// rather than queueing it.
    pub async fn route_direct(
        &self,
        to_id: &AgentId,
        text: &str,
    ) -> Result<TurnOutcome, OrchestratorError> {
        let Some((agent, status, cancel)) = self.entry_handles(to_id) else {
            return Err(OrchestratorError::UnknownAgent(to_id.to_string()));
        };

        // recover a persistent agent that errored on a previous turn
        if status.get() == AgentStatus::Error {
            status.advance(AgentStatus::Idle);
        }
        if !status.advance(AgentStatus::Working) {
            return Err(OrchestratorError::Execution(format!(
                "agent {to_id} is {} and cannot take input",
                status.get()
            )));
        }

        let mut guard = agent.lock().await;
        if guard.status() == AgentStatus::Error {
            let _ = guard.transition(AgentStatus::Idle);
        }
        let _ = guard.transition(AgentStatus::Working);

        let result = guard.send_user_turn(text, &cancel).await;

        match result {
            Ok(outcome) => {
                let next = if outcome.cancelled {
                    AgentStatus::Terminated
                } else if guard.profile().persistent {
                    AgentStatus::Idle
                } else {
                    AgentStatus::Completed
                };
                if next == AgentStatus::Terminated {
                    guard.mark_terminated();
                } else {
                    let _ = guard.transition(next);
                }
                drop(guard);
                status.advance(next);
                Ok(outcome)
            }
            Err(e) => {
                let _ = guard.transition(AgentStatus::Error);
                drop(guard);
                status.advance(AgentStatus::Error);
                Err(OrchestratorError::Upstream(e))
            }
        }
    }

    /// Scan a user line for role keywords and spawn each first-matching
    /// role with the line as its task.
    ///
    /// Capacity rejections are logged and skipped, not surfaced.
    pub fn check_and_auto_spawn(&self, user_text: &str) -> Vec<AgentId> {
        if !self.auto_spawn {
            return Vec::new();
        }

        let tokens: Vec<String> = user_text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        let mut spawned = Vec::new();
        for (role, profile) in &self.profiles {
            if *role == AgentRole::Main {
                continue;
            }
            let hit = profile
                .spawn_keywords
                .iter()
                .any(|keyword| tokens.iter().any(|t| t == &keyword.to_lowercase()));
            if !hit {
                continue;
            }
            match self.spawn(*role, user_text, &AgentId::main()) {
                Ok(id) => spawned.push(id),
                Err(e) => {
                    let _ = self
                        .logger
                        .log_warn(&format!("auto-spawn of {role} skipped: {e}"));
                }
            }
        }
        spawned
    }

    /// Copy of an agent's conversation history.
    pub async fn history_of(
        &self,
        id: &AgentId,
    ) -> Result<Vec<ConversationMessage>, OrchestratorError> {
        let Some((agent, _, _)) = self.entry_handles(id) else {
            return Err(OrchestratorError::UnknownAgent(id.to_string()));
        };
        let history = agent.lock().await.history().to_vec();
        Ok(history)
    }

    /// Clear an agent's history down to its system prompt.
    pub async fn reset_history(&self, id: &AgentId) -> Result<(), OrchestratorError> {
        let Some((agent, _, _)) = self.entry_handles(id) else {
            return Err(OrchestratorError::UnknownAgent(id.to_string()));
        };
        agent.lock().await.reset_history();
        Ok(())
    }

    /// Per-agent usage counters.
    pub async fn usage_by_agent(&self) -> Vec<(AgentId, AgentUsage)> {
        let handles: Vec<_> = {
            let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
            registry
                .iter()
                .map(|(id, e)| (id.clone(), e.agent.clone()))
                .collect()
        };
        let mut usage = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            usage.push((id, handle.lock().await.usage()));
        }
        usage
    }

    /// Aggregate usage across every agent: requests, tokens, and the
    /// estimated dollar cost from each role's per-1k price.
    pub async fn total_usage(&self) -> (u32, u64, f64) {
        let handles: Vec<_> = {
            let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
            registry.values().map(|e| e.agent.clone()).collect()
        };
        let mut requests = 0u32;
        let mut tokens = 0u64;
        let mut cost = 0.0f64;
        for handle in handles {
            let guard = handle.lock().await;
            let usage = guard.usage();
            requests += usage.request_count;
            tokens += usage.tokens_used;
            if let Some(per_1k) = guard.profile().cost_per_1k_tokens {
                cost += usage.tokens_used as f64 / 1000.0 * per_1k;
            }
        }
        (requests, tokens, cost)
    }
}
