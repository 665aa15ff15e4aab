//! Output sink collaborator interface.
//!
//! The runtime never prints to a terminal itself. Every text fragment an
//! agent produces is handed to an [`OutputSink`] tagged with the producing
//! agent's id, role, and channel; the front-end decides how to render it.
//! Events from a single agent arrive in production order. Delivery is
//! synchronous from the streaming task, so a sink that keeps up with the
//! stream naturally back-pressures the producer.

use crate::agent::{AgentId, AgentRole};

/// Which channel of agent output a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Text inside a `[THINKING]` block.
    Thinking,
    /// Ordinary response text.
    Response,
    /// Runtime-generated notices (spawn, errors, workflow progress).
    System,
}

/// One fragment of streamed output.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// Agent that produced the fragment.
    pub agent_id: AgentId,
    /// Role of the producing agent.
    pub role: AgentRole,
    /// Output channel.
    pub kind: StreamKind,
    /// The text fragment itself.
    pub text: String,
}

/// Receiver for streamed agent output.
pub trait OutputSink: Send + Sync {
    /// Deliver one fragment. Implementations should return quickly; slow
    /// sinks stall the producing agent's stream.
    fn emit(&self, event: StreamEvent);
}

/// Sink that discards everything. Useful for headless runs and tests.
pub struct NullSink;

impl OutputSink for NullSink {
    fn emit(&self, _event: StreamEvent) {}
}
