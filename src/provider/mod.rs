//! LLM provider abstraction.
//!
//! The runtime talks to models through the [`ChatProvider`] trait so that
//! agents are testable against scripted providers and so that different
//! OpenAI-compatible endpoints (per-role models, local inference servers)
//! plug in behind one interface. The shipped implementation is
//! [`OpenAiProvider`].

pub mod openai;
pub mod sse;
pub mod types;

pub use openai::OpenAiProvider;
pub use types::{ChatMessage, ChatOutcome, ChatRequest, MessageRole, Usage};

use crate::error::UpstreamError;
use futures_util::Stream;
use std::pin::Pin;

/// Stream of assistant content deltas in arrival order.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, UpstreamError>> + Send>>;

/// Interface to a chat-completion backend.
///
/// Implementations perform no retries; transport failures surface as
/// [`UpstreamError`] and the agent layer decides how to react.
#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    /// Run a non-streaming completion and return the assembled content.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatOutcome, UpstreamError>;

    /// Run a streaming completion.
    ///
    /// Deltas are yielded in production order; the stream ends when the
    /// provider closes it. Back-pressure is inherent: the producer only
    /// advances while the returned stream is being polled.
    async fn complete_stream(&self, request: &ChatRequest) -> Result<DeltaStream, UpstreamError>;

    /// Provider identifier for logging.
    fn provider_name(&self) -> &str;
}

/// Estimate a token count for text when the provider reports no usage.
///
/// The usual chars/4 heuristic; good enough for cost roll-ups and stats.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
