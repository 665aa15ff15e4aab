//! Wire types for OpenAI-compatible chat completions.
//!
//! Field names match the Chat Completions API. Only the subset the runtime
//! uses is modelled: message roles, the request body, the non-streaming
//! response, and streaming chunks carrying `choices[0].delta.content`.

use serde::{Deserialize, Serialize};

/// Role of a conversation message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System prompt.
    System,
    /// User (or runtime-synthesised) turn.
    User,
    /// Model output.
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// One message in a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message role.
    pub role: MessageRole,
    /// Message content.
    pub content: String,
}

impl ChatMessage {
    /// Build a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// Build a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Build an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Chat completion request body.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// Model identifier.
    pub model: String,
    /// Conversation history, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token cap.
    pub max_tokens: u32,
    /// Whether to stream the response as SSE.
    pub stream: bool,
}

/// Token usage block returned by the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    #[serde(default)]
    pub prompt_tokens: u64,
    /// Tokens in the completion.
    #[serde(default)]
    pub completion_tokens: u64,
    /// Total tokens billed.
    #[serde(default)]
    pub total_tokens: u64,
}

/// Non-streaming chat completion response body.
#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    /// Response choices; the runtime reads the first.
    pub choices: Vec<ResponseChoice>,
    /// Usage block, when the provider reports one.
    pub usage: Option<Usage>,
}

/// One choice in a non-streaming response.
#[derive(Debug, Deserialize)]
pub struct ResponseChoice {
    /// The assistant message.
    pub message: ResponseMessage,
}

/// Assistant message inside a response choice.
#[derive(Debug, Deserialize)]
pub struct ResponseMessage {
    /// Message content; null for pure tool-call replies.
    pub content: Option<String>,
}

/// One SSE chunk of a streaming response.
#[derive(Debug, Deserialize)]
pub struct StreamChunk {
    /// Chunk choices; the runtime reads the first delta.
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    /// Usage block, present on the final chunk for some providers.
    pub usage: Option<Usage>,
}

/// One choice in a streaming chunk.
#[derive(Debug, Deserialize)]
pub struct StreamChoice {
    /// Incremental content delta.
    pub delta: StreamDelta,
    /// Finish reason, set on the last content chunk.
    #[allow(dead_code)]
    pub finish_reason: Option<String>,
}

/// Delta payload of a streaming choice.
#[derive(Debug, Deserialize)]
pub struct StreamDelta {
    /// Text fragment, absent on role-only or usage-only chunks.
    pub content: Option<String>,
}

/// Assembled outcome of one completion request.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// Full assistant content.
    pub content: String,
    /// Provider-reported usage, when available. Callers estimate otherwise.
    pub usage: Option<Usage>,
}
