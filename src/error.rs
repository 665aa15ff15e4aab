//! Error taxonomy for the orchestration runtime.
//!
//! Layers absorb what they know how to absorb: tool failures become
//! [`ToolResult`](crate::executor::ToolResult) values in conversation, step
//! failures become retries inside the workflow engine. Everything else
//! surfaces as a structured [`OrchestratorError`] on the owning layer's
//! public API. Only configuration errors are fatal at startup.

use thiserror::Error;

/// Errors surfaced by the runtime's public API.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed configuration, missing required secret, or unknown role
    /// keyword. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Spawn rejected because the active agent count is at the configured
    /// limit. Surfaced to the caller of spawn; never fatal.
    #[error("capacity: {active} active agents at limit {limit}")]
    Capacity {
        /// Number of currently active agents.
        active: usize,
        /// Configured `max_concurrent_agents`.
        limit: usize,
    },

    /// HTTP 4xx/5xx, connection refused, or malformed SSE from the model
    /// provider.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// A plan failed validation and was rejected before execution.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Step retries exhausted or rollback required during a workflow run.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The named agent is not present in the registry.
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    /// The named plan is not present in the pending set.
    #[error("unknown plan: {0}")]
    UnknownPlan(String),

    /// Internal cancellation signal. Not surfaced to users.
    #[error("cancelled")]
    Cancelled,
}

/// Failures talking to the chat-completion endpoint.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Could not reach the endpoint at all.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The endpoint answered with a non-success status; the body is
    /// surfaced verbatim for the caller to show.
    #[error("HTTP {status}: {body}")]
    Http {
        /// Status code returned by the provider.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The SSE stream carried a payload that does not parse; the stream is
    /// aborted.
    #[error("malformed stream: {0}")]
    MalformedStream(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            UpstreamError::Connect(err.to_string())
        } else {
            UpstreamError::MalformedStream(err.to_string())
        }
    }
}
