//! Agent conversation state and the streaming turn loop.
//!
//! An [`Agent`] composes a chat provider, the tag parser, and a
//! tool-executor handle. One call to [`Agent::send_user_turn`] appends the
//! user turn, streams the completion through the parser, forwards text to
//! the output sink, and dispatches whatever the stream embedded: file
//! operations run through the executor and their results loop back into
//! the conversation as `[TOOL RESULT]` turns (re-issuing the completion so
//! the model can react), summaries become the pending summary the manager
//! delivers, and plan bodies are collected for the caller to parse and
//! submit.

mod profile;

pub use profile::{
    AgentId, AgentProfile, AgentRole, AgentStatus, ConversationMessage, StructuredSummary,
};

use crate::error::UpstreamError;
use crate::executor::{ToolExecutor, ToolResult};
use crate::observability::Logger;
use crate::parser::{FileOperation, ParseEvent, ResponseParser, TextChannel};
use crate::provider::{estimate_tokens, ChatMessage, ChatProvider, ChatRequest, MessageRole};
use crate::sink::{OutputSink, StreamEvent, StreamKind};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Cap on tool-loop iterations inside one user turn.
const MAX_TOOL_ITERATIONS: u32 = 8;

/// What one user turn produced.
#[derive(Debug, Default)]
pub struct TurnOutcome {
    /// Concatenated response-channel text across the turn.
    pub response_text: String,
    /// Plan bodies the model emitted, in order.
    pub plans: Vec<String>,
    /// File operations executed through the tool loop.
    pub executed_ops: u32,
    /// File operations queued as suggestions under plan mode.
    pub queued_suggestions: u32,
    /// Whether the turn ended by cancellation.
    pub cancelled: bool,
}

/// Per-agent usage counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentUsage {
    /// Completion requests issued.
    pub request_count: u32,
    /// Tokens used: provider-reported when available, estimated otherwise.
    pub tokens_used: u64,
}

/// A runtime agent: one conversation against one model.
pub struct Agent {
    id: AgentId,
    profile: AgentProfile,
    status: AgentStatus,
    history: Vec<ConversationMessage>,
    pending_summary: Option<StructuredSummary>,
    parent_id: Option<AgentId>,
    spawn_time: DateTime<Utc>,
    task_description: String,
    queued_file_ops: Vec<FileOperation>,
    usage: AgentUsage,
    plan_mode: bool,
    provider: Arc<dyn ChatProvider>,
    executor: Arc<ToolExecutor>,
    sink: Arc<dyn OutputSink>,
    logger: Arc<Logger>,
}

impl Agent {
    /// Build an agent with its system prompt seeded into history.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: AgentId,
        profile: AgentProfile,
        parent_id: Option<AgentId>,
        plan_mode: bool,
        provider: Arc<dyn ChatProvider>,
        executor: Arc<ToolExecutor>,
        sink: Arc<dyn OutputSink>,
        logger: Arc<Logger>,
    ) -> Self {
        let history = vec![ConversationMessage::now(
            MessageRole::System,
            profile.system_prompt.clone(),
        )];

        Self {
            id,
            profile,
            status: AgentStatus::Initializing,
            history,
            pending_summary: None,
            parent_id,
            spawn_time: Utc::now(),
            task_description: String::new(),
            queued_file_ops: Vec::new(),
            usage: AgentUsage::default(),
            plan_mode,
            provider,
            executor,
            sink,
            logger,
        }
    }

    /// The agent's id.
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// The agent's role.
    pub fn role(&self) -> AgentRole {
        self.profile.role
    }

    /// The agent's profile.
    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    /// Current lifecycle state.
    pub fn status(&self) -> AgentStatus {
        self.status
    }

    /// The parent agent, absent only for main.
    pub fn parent_id(&self) -> Option<&AgentId> {
        self.parent_id.as_ref()
    }

    /// When the agent was spawned.
    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    /// The task the agent was spawned with.
    pub fn task_description(&self) -> &str {
        &self.task_description
    }

    /// Record the spawn task.
    pub fn set_task_description(&mut self, task: impl Into<String>) {
        self.task_description = task.into();
    }

    /// Usage counters.
    pub fn usage(&self) -> AgentUsage {
        self.usage
    }

    /// Advance the status machine.
    ///
    /// Rejects transitions the machine does not admit; terminated is
    /// always reachable.
    pub fn transition(&mut self, next: AgentStatus) -> anyhow::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(anyhow::anyhow!(
                "invalid status transition {} -> {} for agent {}",
                self.status,
                next,
                self.id
            ));
        }
        self.status = next;
        let _ = self
            .logger
            .log_agent_status(self.id.as_str(), &next.to_string());
        Ok(())
    }

    /// Force the terminated state, valid from anywhere.
    pub fn mark_terminated(&mut self) {
        self.status = AgentStatus::Terminated;
        let _ = self.logger.log_agent_status(self.id.as_str(), "terminated");
    }

    /// Read-only view of the conversation.
    pub fn history(&self) -> &[ConversationMessage] {
        &self.history
    }

    /// Copy another agent's history (minus its system prompt) into this
    /// one, for spawn-time context inheritance.
    pub fn inherit_history(&mut self, parent_history: &[ConversationMessage]) {
        for message in parent_history {
            if message.role != MessageRole::System {
                self.history.push(message.clone());
            }
        }
    }

    /// Append an inter-agent message without triggering a completion.
    pub fn receive_message(&mut self, from: &AgentId, text: &str) {
        self.history.push(ConversationMessage::now(
            MessageRole::User,
            format!("[FROM {}] {}", from, text),
        ));
    }

    /// Append a delivered sub-agent summary as a single user turn.
    pub fn receive_summary(&mut self, from_role: AgentRole, text: &str) {
        self.history.push(ConversationMessage::now(
            MessageRole::User,
            format!("[SUMMARY from {}] {}", from_role, text),
        ));
    }

    /// Append a sub-agent failure notice as a single user turn.
    pub fn receive_error(&mut self, from_role: AgentRole, text: &str) {
        self.history.push(ConversationMessage::now(
            MessageRole::User,
            format!("[ERROR from {}] {}", from_role, text),
        ));
    }

    /// Clear history down to the system prompt.
    pub fn reset_history(&mut self) {
        self.history.retain(|m| m.role == MessageRole::System);
        self.queued_file_ops.clear();
    }

    /// Take the pending summary, if the last stream produced one.
    pub fn take_pending_summary(&mut self) -> Option<StructuredSummary> {
        self.pending_summary.take()
    }

    /// Take the file-operation suggestions queued under plan mode.
    pub fn take_queued_file_ops(&mut self) -> Vec<FileOperation> {
        std::mem::take(&mut self.queued_file_ops)
    }

    /// Run one user turn to stream close.
    ///
    /// Appends the user turn, issues the completion, and loops while the
    /// model keeps embedding executable file operations (bounded). Returns
    /// when the final stream closes or the token cancels.
    pub async fn send_user_turn(
        &mut self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, UpstreamError> {
        self.history
            .push(ConversationMessage::now(MessageRole::User, text));

        let mut outcome = TurnOutcome::default();

        for _ in 0..MAX_TOOL_ITERATIONS {
            let Some((raw, events)) = self.run_completion(cancel).await? else {
                outcome.cancelled = true;
                break;
            };

            self.history
                .push(ConversationMessage::now(MessageRole::Assistant, raw));

            let mut file_ops = Vec::new();
            for event in events {
                match event {
                    ParseEvent::Text { channel, chunk } => {
                        if channel == TextChannel::Response {
                            outcome.response_text.push_str(&chunk);
                        }
                    }
                    ParseEvent::Summary(text) => {
                        // most recent summary wins
                        self.pending_summary = Some(StructuredSummary {
                            source_agent_id: self.id.clone(),
                            task_description: self.task_description.clone(),
                            text,
                            created_at: Utc::now(),
                        });
                    }
                    ParseEvent::Plan(text) => outcome.plans.push(text),
                    ParseEvent::FileOp(op) => file_ops.push(op),
                }
            }

            if file_ops.is_empty() {
                break;
            }

            if self.id.is_main() && self.plan_mode {
                outcome.queued_suggestions += file_ops.len() as u32;
                self.emit_system(format!(
                    "plan mode: queued {} file operation suggestion(s); approve a plan to apply changes",
                    file_ops.len()
                ));
                self.queued_file_ops.extend(file_ops);
                break;
            }

            for op in file_ops {
                let summary = describe_op(&op);
                let result = self.execute_file_op(op).await;
                let _ = self.logger.log_tool_invocation(
                    self.id.as_str(),
                    &summary,
                    result.success,
                    result.duration_ms,
                );
                outcome.executed_ops += 1;
                self.history.push(ConversationMessage::now(
                    MessageRole::User,
                    render_tool_result(&summary, &result),
                ));
            }
            // loop: re-issue the completion so the model sees the results
        }

        Ok(outcome)
    }

    /// Issue one completion and parse the output.
    ///
    /// Returns `None` when cancelled mid-stream. Text events reach the
    /// sink as they arrive; all events are returned for dispatch.
    async fn run_completion(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<(String, Vec<ParseEvent>)>, UpstreamError> {
        let request = self.build_request();
        let prompt_chars: usize = request.messages.iter().map(|m| m.content.len()).sum();

        let mut parser = ResponseParser::new();
        let mut raw = String::new();
        let mut events = Vec::new();
        let mut reported_usage = None;

        if self.profile.stream_enabled {
            let mut stream = self.provider.complete_stream(&request).await?;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(None),
                    delta = stream.next() => match delta {
                        Some(Ok(chunk)) => {
                            raw.push_str(&chunk);
                            for event in parser.feed(&chunk) {
                                self.forward_text(&event);
                                events.push(event);
                            }
                        }
                        Some(Err(e)) => return Err(e),
                        None => break,
                    }
                }
            }
        } else {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                outcome = self.provider.complete(&request) => outcome?,
            };
            raw = outcome.content;
            reported_usage = outcome.usage;
            for event in parser.feed(&raw) {
                self.forward_text(&event);
                events.push(event);
            }
        }

        for event in parser.finish() {
            self.forward_text(&event);
            events.push(event);
        }

        self.usage.request_count += 1;
        self.usage.tokens_used += match reported_usage {
            Some(usage) if usage.total_tokens > 0 => usage.total_tokens,
            _ => estimate_tokens(&raw) + (prompt_chars as u64).div_ceil(4),
        };
        let _ = self.logger.log_llm_exchange(
            self.id.as_str(),
            &self.profile.model_id,
            request.messages.len(),
            raw.len(),
        );

        Ok(Some((raw, events)))
    }

    fn build_request(&self) -> ChatRequest {
        ChatRequest {
            model: self.profile.model_id.clone(),
            messages: self
                .history
                .iter()
                .map(|m| ChatMessage {
                    role: m.role,
                    content: m.content.clone(),
                })
                .collect(),
            temperature: self.profile.temperature,
            max_tokens: self.profile.max_tokens,
            stream: self.profile.stream_enabled,
        }
    }

    fn forward_text(&self, event: &ParseEvent) {
        if let ParseEvent::Text { channel, chunk } = event {
            self.sink.emit(StreamEvent {
                agent_id: self.id.clone(),
                role: self.profile.role,
                kind: match channel {
                    TextChannel::Thinking => StreamKind::Thinking,
                    TextChannel::Response => StreamKind::Response,
                },
                text: chunk.clone(),
            });
        }
    }

    fn emit_system(&self, text: String) {
        self.sink.emit(StreamEvent {
            agent_id: self.id.clone(),
            role: self.profile.role,
            kind: StreamKind::System,
            text,
        });
    }

    async fn execute_file_op(&self, op: FileOperation) -> ToolResult {
        match op {
            FileOperation::Read { path } => self.executor.read_file(&path).await,
            FileOperation::Write { path, content } => {
                self.executor.write_file(&path, &content, true).await
            }
            FileOperation::Edit {
                path,
                find,
                replace,
            } => self.executor.edit_file(&path, &find, &replace).await,
        }
    }
}

/// Short label for a file operation, for logs and tool-result turns.
fn describe_op(op: &FileOperation) -> String {
    match op {
        FileOperation::Read { path } => format!("read {}", path),
        FileOperation::Write { path, .. } => format!("write {}", path),
        FileOperation::Edit { path, .. } => format!("edit {}", path),
    }
}

/// Render a tool result as the user-role turn fed back to the model.
fn render_tool_result(summary: &str, result: &ToolResult) -> String {
    if result.success {
        let mut text = format!("[TOOL RESULT] {}: success", summary);
        if let Some(stdout) = result.stdout.as_deref().filter(|s| !s.is_empty()) {
            text.push('\n');
            text.push_str(stdout);
        }
        if let Some(stderr) = result.stderr.as_deref().filter(|s| !s.is_empty()) {
            text.push('\n');
            text.push_str(stderr);
        }
        text
    } else {
        format!(
            "[TOOL RESULT] {}: error: {}",
            summary,
            result.error.as_deref().unwrap_or("unknown failure")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_agent, CollectingSink, ScriptedProvider};
    use tempfile::TempDir;

    #[tokio::test]
    async fn plain_turn_appends_history_and_streams_response() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec!["hello back".to_string()]);
        let sink = Arc::new(CollectingSink::default());
        let mut agent = test_agent(&dir, AgentRole::Main, provider, sink.clone(), false);

        let outcome = agent
            .send_user_turn("hello", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.response_text, "hello back");
        assert!(!outcome.cancelled);
        // system + user + assistant
        assert_eq!(agent.history().len(), 3);
        assert_eq!(agent.history()[2].content, "hello back");
        assert_eq!(sink.response_text(), "hello back");
        assert_eq!(agent.usage().request_count, 1);
        assert!(agent.usage().tokens_used > 0);
    }

    #[tokio::test]
    async fn thinking_text_reaches_the_sink_on_its_own_channel() {
        let dir = TempDir::new().unwrap();
        let provider =
            ScriptedProvider::new(vec!["[THINKING]mull it over[/THINKING]done".to_string()]);
        let sink = Arc::new(CollectingSink::default());
        let mut agent = test_agent(&dir, AgentRole::Main, provider, sink.clone(), false);

        agent
            .send_user_turn("go", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.thinking_text(), "mull it over");
        assert_eq!(sink.response_text(), "done");
    }

    #[tokio::test]
    async fn tool_loop_executes_file_op_and_reissues_completion() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec![
            "[FILE_WRITE] path: note.txt content: ```\nremember\n``` [/FILE_WRITE]".to_string(),
            "the file is written".to_string(),
        ]);
        let sink = Arc::new(CollectingSink::default());
        let mut agent = test_agent(&dir, AgentRole::Implementer, provider, sink, false);

        let outcome = agent
            .send_user_turn("write the note", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.executed_ops, 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("note.txt")).unwrap(),
            "remember"
        );
        // the tool result flows back as a user turn before the second request
        let tool_turn = agent
            .history()
            .iter()
            .find(|m| m.content.starts_with("[TOOL RESULT]"))
            .unwrap();
        assert!(tool_turn.content.contains("write note.txt"));
        assert!(tool_turn.content.contains("success"));
        assert_eq!(agent.usage().request_count, 2);
        assert_eq!(outcome.response_text, "the file is written");
    }

    #[tokio::test]
    async fn failed_file_op_feeds_the_error_back() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec![
            "[FILE_EDIT]\npath: missing.txt\nfind: |a\nreplace: |b\n[/FILE_EDIT]".to_string(),
            "understood".to_string(),
        ]);
        let sink = Arc::new(CollectingSink::default());
        let mut agent = test_agent(&dir, AgentRole::Implementer, provider, sink, false);

        agent
            .send_user_turn("edit it", &CancellationToken::new())
            .await
            .unwrap();

        let tool_turn = agent
            .history()
            .iter()
            .find(|m| m.content.starts_with("[TOOL RESULT]"))
            .unwrap();
        assert!(tool_turn.content.contains("error"));
        assert!(tool_turn.content.contains("file does not exist"));
    }

    #[tokio::test]
    async fn plan_mode_queues_main_agent_file_ops() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec![
            "[FILE_WRITE] path: risky.txt content: x [/FILE_WRITE]".to_string(),
        ]);
        let sink = Arc::new(CollectingSink::default());
        let mut agent = test_agent(&dir, AgentRole::Main, provider, sink, true);

        let outcome = agent
            .send_user_turn("write something", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.queued_suggestions, 1);
        assert_eq!(outcome.executed_ops, 0);
        assert!(!dir.path().join("risky.txt").exists());
        assert_eq!(agent.take_queued_file_ops().len(), 1);
        // only one request: queuing does not re-issue the completion
        assert_eq!(agent.usage().request_count, 1);
    }

    #[tokio::test]
    async fn summary_is_captured_as_pending() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec![
            "work done [SUMMARY]first[/SUMMARY] more [SUMMARY]second[/SUMMARY]".to_string(),
        ]);
        let sink = Arc::new(CollectingSink::default());
        let mut agent = test_agent(&dir, AgentRole::Reviewer, provider, sink, false);
        agent.set_task_description("review the diff");

        agent
            .send_user_turn("review", &CancellationToken::new())
            .await
            .unwrap();

        let summary = agent.take_pending_summary().unwrap();
        assert_eq!(summary.text, "second");
        assert_eq!(summary.task_description, "review the diff");
        assert!(agent.take_pending_summary().is_none());
    }

    #[tokio::test]
    async fn plan_bodies_are_collected_not_executed() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec![
            "[PLAN]\n## Workflow: w\n### Step 1: s\n- Agent: main\n- Tool: list_files_tool\n- Arguments: {}\n[/PLAN]".to_string(),
        ]);
        let sink = Arc::new(CollectingSink::default());
        let mut agent = test_agent(&dir, AgentRole::Main, provider, sink, false);

        let outcome = agent
            .send_user_turn("plan it", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.plans.len(), 1);
        assert!(outcome.plans[0].contains("## Workflow: w"));
    }

    #[test]
    fn receive_message_prefixes_the_sender() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec![]);
        let sink = Arc::new(CollectingSink::default());
        let mut agent = test_agent(&dir, AgentRole::Main, provider, sink, false);

        agent.receive_message(&AgentId::from("reviewer-ab12"), "looks fine");
        assert_eq!(
            agent.history().last().unwrap().content,
            "[FROM reviewer-ab12] looks fine"
        );

        agent.receive_summary(AgentRole::Reviewer, "all good");
        assert_eq!(
            agent.history().last().unwrap().content,
            "[SUMMARY from reviewer] all good"
        );
    }

    #[test]
    fn reset_keeps_only_the_system_prompt() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec![]);
        let sink = Arc::new(CollectingSink::default());
        let mut agent = test_agent(&dir, AgentRole::Main, provider, sink, false);

        agent.receive_message(&AgentId::from("x"), "one");
        agent.receive_message(&AgentId::from("x"), "two");
        assert_eq!(agent.history().len(), 3);

        agent.reset_history();
        assert_eq!(agent.history().len(), 1);
        assert_eq!(agent.history()[0].role, MessageRole::System);
    }

    #[tokio::test]
    async fn cancellation_ends_the_turn() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec!["never seen".to_string()]);
        let sink = Arc::new(CollectingSink::default());
        let mut agent = test_agent(&dir, AgentRole::Main, provider, sink, false);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = agent.send_user_turn("hello", &cancel).await.unwrap();
        assert!(outcome.cancelled);
    }
}
