//! Shared fixtures: a scripted chat provider and a collecting sink.

use crate::agent::{Agent, AgentId, AgentProfile, AgentRole};
use crate::config::{FileOpsPolicy, ToolPolicy};
use crate::error::UpstreamError;
use crate::executor::ToolExecutor;
use crate::observability::Logger;
use crate::provider::{ChatOutcome, ChatProvider, ChatRequest, DeltaStream};
use crate::sink::{OutputSink, StreamEvent, StreamKind};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Provider that replays scripted responses instead of calling a model.
///
/// Streaming responses are chopped into small chunks so incremental
/// parsing is actually exercised. An exhausted script yields empty
/// content.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
        })
    }

    fn next_response(&self) -> String {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ChatProvider for ScriptedProvider {
    async fn complete(&self, _request: &ChatRequest) -> Result<ChatOutcome, UpstreamError> {
        Ok(ChatOutcome {
            content: self.next_response(),
            usage: None,
        })
    }

    async fn complete_stream(&self, _request: &ChatRequest) -> Result<DeltaStream, UpstreamError> {
        let content = self.next_response();
        let chunks: Vec<Result<String, UpstreamError>> = content
            .chars()
            .collect::<Vec<_>>()
            .chunks(5)
            .map(|chunk| Ok(chunk.iter().collect::<String>()))
            .collect();
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }
}

/// Sink that records every event for later assertions.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<StreamEvent>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn text_of(&self, kind: StreamKind) -> String {
        self.events()
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.text.as_str())
            .collect()
    }

    pub fn response_text(&self) -> String {
        self.text_of(StreamKind::Response)
    }

    pub fn thinking_text(&self) -> String {
        self.text_of(StreamKind::Thinking)
    }

    pub fn system_text(&self) -> String {
        self.text_of(StreamKind::System)
    }
}

impl OutputSink for CollectingSink {
    fn emit(&self, event: StreamEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

/// A profile pointed at nothing in particular; scripted providers never
/// dial the base URL.
pub fn test_profile(role: AgentRole) -> AgentProfile {
    AgentProfile {
        provider: "scripted".to_string(),
        base_url: "http://127.0.0.1:0".to_string(),
        model_id: "test-model".to_string(),
        api_key: None,
        role,
        temperature: 0.0,
        max_tokens: 256,
        stream_enabled: true,
        system_prompt: format!("You are the {role} test agent."),
        spawn_keywords: Vec::new(),
        cost_per_1k_tokens: None,
        estimated_task_tokens: 100,
        persistent: role == AgentRole::Main,
        inherit_parent_history: false,
    }
}

/// Executor policy for tests: everything contained in the temp dir.
pub fn test_executor(dir: &TempDir) -> Arc<ToolExecutor> {
    Arc::new(ToolExecutor::new(
        FileOpsPolicy::default(),
        ToolPolicy::default(),
        dir.path(),
    ))
}

/// Quiet logger writing inside the temp dir.
pub fn test_logger(dir: &TempDir) -> Arc<Logger> {
    Arc::new(Logger::new(Some(&dir.path().join("session.md")), Some("ERROR")).unwrap())
}

/// Assemble an agent around a scripted provider.
pub fn test_agent(
    dir: &TempDir,
    role: AgentRole,
    provider: Arc<ScriptedProvider>,
    sink: Arc<CollectingSink>,
    plan_mode: bool,
) -> Agent {
    let id = if role == AgentRole::Main {
        AgentId::main()
    } else {
        AgentId::fresh(role)
    };
    Agent::new(
        id,
        test_profile(role),
        None,
        plan_mode,
        provider,
        test_executor(dir),
        sink,
        test_logger(dir),
    )
}
