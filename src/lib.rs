//! hivekit - Concurrent multi-agent orchestration runtime
//!
//! hivekit runs a *main* LLM-backed agent that converses with a user and can
//! spawn role-specialised sub-agents, each streaming against its own model
//! with an isolated conversation history. Structured tags embedded in model
//! output (`[THINKING]`, `[SUMMARY]`, `[PLAN]`, `[FILE_READ|WRITE|EDIT]`) are
//! lifted out of the token stream by an incremental parser; file operations
//! run through a sandboxed tool executor, sub-agent summaries flow back to
//! the parent as single user turns, and emitted plans are validated and
//! executed by a checkpointing workflow engine with rollback.
//!
//! The crate is front-end agnostic: a CLI (or any other driver) talks to
//! [`orchestrator::Orchestrator`] and receives streamed output through the
//! [`sink::OutputSink`] trait.
//!
//! # Example
//!
//! ```no_run
//! use hivekit::config::{SecretStore, Settings};
//! use hivekit::orchestrator::Orchestrator;
//! use hivekit::sink::NullSink;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let settings = Settings::load(std::path::Path::new("hivekit.toml"))?;
//! let secrets = SecretStore::load(std::path::Path::new("secrets.toml"))?;
//! let orchestrator = Orchestrator::new(settings, secrets, Arc::new(NullSink))?;
//! orchestrator.handle_user_line("review the parser module").await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Agent conversation state and the streaming turn loop
pub mod agent;

/// Typed configuration, role profiles, and the secret store
pub mod config;

/// Error taxonomy surfaced by the public API
pub mod error;

/// Sandboxed shell, script, and file tools
pub mod executor;

/// Agent registry, lifecycle, and summary routing
pub mod manager;

/// Session transcript logging
pub mod observability;

/// Wiring facade exposed to front-ends
pub mod orchestrator;

/// Streaming tag parser over model output
pub mod parser;

/// Plan data model and the plan text parser
pub mod plan;

/// Streaming chat-completion client
pub mod provider;

/// Output sink collaborator interface
pub mod sink;

/// Workflow engine: checkpointed DAG execution
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::agent::{AgentId, AgentProfile, AgentRole, AgentStatus};
    pub use crate::config::{SecretStore, Settings};
    pub use crate::error::OrchestratorError;
    pub use crate::executor::{ToolExecutor, ToolResult, ToolSpec};
    pub use crate::orchestrator::Orchestrator;
    pub use crate::plan::Plan;
    pub use crate::sink::{OutputSink, StreamEvent};
    pub use crate::workflow::WorkflowEngine;
}
