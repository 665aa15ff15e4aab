//! Agent identity, roles, status machine, and profiles.

use crate::provider::MessageRole;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque agent identifier, unique within a process lifetime.
///
/// `main` is reserved for the primary agent; every other id is derived from
/// the role plus a random suffix at spawn time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// The reserved id of the primary agent.
    pub fn main() -> Self {
        Self("main".to_string())
    }

    /// Mint a fresh id for a spawned sub-agent.
    pub fn fresh(role: AgentRole) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", role, &suffix[..8]))
    }

    /// Whether this is the primary agent's id.
    pub fn is_main(&self) -> bool {
        self.0 == "main"
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Closed set of agent specialisations.
///
/// A role is configuration-only: a system prompt, a model choice, sampling
/// parameters, and spawn keywords. Adding behaviour means adding config,
/// not code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// The primary, user-facing agent.
    Main,
    /// Code and plan review.
    Reviewer,
    /// Information gathering.
    Researcher,
    /// Writing code and files.
    Implementer,
    /// Exercising and verifying behaviour.
    Tester,
    /// Performance and simplification passes.
    Optimizer,
}

impl AgentRole {
    /// All roles, for catalogue iteration.
    pub fn all() -> [AgentRole; 6] {
        [
            AgentRole::Main,
            AgentRole::Reviewer,
            AgentRole::Researcher,
            AgentRole::Implementer,
            AgentRole::Tester,
            AgentRole::Optimizer,
        ]
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentRole::Main => "main",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Researcher => "researcher",
            AgentRole::Implementer => "implementer",
            AgentRole::Tester => "tester",
            AgentRole::Optimizer => "optimizer",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for AgentRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "main" => Ok(AgentRole::Main),
            "reviewer" => Ok(AgentRole::Reviewer),
            "researcher" => Ok(AgentRole::Researcher),
            "implementer" => Ok(AgentRole::Implementer),
            "tester" => Ok(AgentRole::Tester),
            "optimizer" => Ok(AgentRole::Optimizer),
            _ => Err(anyhow::anyhow!("unknown agent role: {}", s)),
        }
    }
}

/// Agent lifecycle state.
///
/// Advances monotonically through initializing → idle/working →
/// completed/error, with terminated reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Constructed but not yet streaming.
    Initializing,
    /// Between turns; accepts new input.
    Idle,
    /// A completion stream is in flight.
    Working,
    /// One-shot agent finished its task.
    Completed,
    /// Upstream or parse failure ended the agent's run.
    Error,
    /// Explicitly terminated.
    Terminated,
}

impl AgentStatus {
    /// Whether the agent counts against the concurrency cap.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AgentStatus::Initializing | AgentStatus::Idle | AgentStatus::Working
        )
    }

    /// Whether this state admits a transition to `next`.
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        if next == AgentStatus::Terminated {
            return true;
        }
        match self {
            AgentStatus::Initializing => {
                matches!(next, AgentStatus::Idle | AgentStatus::Working)
            }
            AgentStatus::Idle => matches!(next, AgentStatus::Working),
            AgentStatus::Working => matches!(
                next,
                AgentStatus::Idle | AgentStatus::Completed | AgentStatus::Error
            ),
            // reset: a persistent agent that hit an upstream error returns
            // to idle and keeps taking turns
            AgentStatus::Error => matches!(next, AgentStatus::Idle),
            AgentStatus::Completed | AgentStatus::Terminated => false,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentStatus::Initializing => "initializing",
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Completed => "completed",
            AgentStatus::Error => "error",
            AgentStatus::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

/// Immutable per-role agent configuration, resolved at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Provider label, for logging.
    pub provider: String,
    /// Chat-completions endpoint base URL.
    pub base_url: String,
    /// Model identifier sent upstream.
    pub model_id: String,
    /// Bearer token, resolved from the secret store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Role this profile backs.
    pub role: AgentRole,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token cap per request.
    pub max_tokens: u32,
    /// Whether completions stream.
    pub stream_enabled: bool,
    /// System prompt seeded into every conversation.
    pub system_prompt: String,
    /// Keywords that auto-spawn this role from user input.
    #[serde(default)]
    pub spawn_keywords: Vec<String>,
    /// Price per thousand tokens, for cost estimates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_per_1k_tokens: Option<f64>,
    /// Default token estimate for one task by this role.
    pub estimated_task_tokens: u64,
    /// Whether the agent survives across turns (main) or completes after
    /// its task (sub-agents).
    pub persistent: bool,
    /// Seed spawned agents with the parent's history in addition to the
    /// task turn.
    pub inherit_parent_history: bool,
}

/// One turn of conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Turn role.
    pub role: MessageRole,
    /// Turn content.
    pub content: String,
    /// When the turn was appended.
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    /// Build a turn stamped with the current time.
    pub fn now(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Text a sub-agent emitted between `[SUMMARY]` markers, awaiting delivery
/// to its parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredSummary {
    /// Agent that produced the summary.
    pub source_agent_id: AgentId,
    /// The task the agent was spawned with.
    pub task_description: String,
    /// Summary text, verbatim.
    pub text: String,
    /// When the summary was captured.
    pub created_at: DateTime<Utc>,
}
