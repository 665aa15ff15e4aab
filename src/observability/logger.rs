//! Markdown session logger.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Log severity, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Normal operation.
    Info,
    /// Something odd but survivable.
    Warn,
    /// A failure worth reading later.
    Error,
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            _ => Err(anyhow::anyhow!("unknown log level: {}", s)),
        }
    }
}

/// Logger for agent sessions.
///
/// Creates a markdown-formatted transcript covering spawns, exchanges,
/// tool runs, and workflow events.
#[derive(Debug)]
pub struct Logger {
    log_file: PathBuf,
    level: LogLevel,
}

impl Logger {
    /// Initialize the logger.
    ///
    /// # Arguments
    /// * `log_file` - Transcript path. If None, creates a timestamped file
    ///   in the temp directory.
    /// * `level` - Minimum level written (defaults to INFO).
    pub fn new(log_file: Option<&Path>, level: Option<&str>) -> Result<Self> {
        let log_file = match log_file {
            Some(p) => p.to_path_buf(),
            None => {
                let mut dir = std::env::temp_dir();
                dir.push("hivekit-logs");
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
                dir.join(format!(
                    "session_{}_{}.md",
                    Utc::now().timestamp_millis(),
                    std::process::id()
                ))
            }
        };

        let level = match level {
            Some(raw) => raw.parse()?,
            None => LogLevel::Info,
        };

        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }

        let logger = Self { log_file, level };
        if !logger.log_file.exists() {
            logger.initialize_log_file()?;
        }

        Ok(logger)
    }

    /// The transcript file path.
    pub fn path(&self) -> &Path {
        &self.log_file
    }

    fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level
    }

    fn initialize_log_file(&self) -> Result<()> {
        let mut file = File::create(&self.log_file)
            .with_context(|| format!("Failed to create log file: {}", self.log_file.display()))?;

        let now: DateTime<Utc> = Utc::now();
        writeln!(file, "# Session Log\n")?;
        writeln!(file, "Log started: {}\n", now.to_rfc3339())?;
        writeln!(file, "---\n")?;
        Ok(())
    }

    fn append(&self, content: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .with_context(|| format!("Failed to open log file: {}", self.log_file.display()))?;
        write!(file, "{}", content).context("Failed to write to log file")?;
        Ok(())
    }

    fn entry(&self, level: LogLevel, heading: &str, body: &str) -> Result<()> {
        if !self.enabled(level) {
            return Ok(());
        }
        let now: DateTime<Utc> = Utc::now();
        self.append(&format!(
            "## {} - {}\n\n{}\n\n",
            heading,
            now.to_rfc3339(),
            body
        ))
    }

    /// Log session start with a configuration summary.
    pub fn log_session_start(&self, summary: &str) -> Result<()> {
        self.entry(LogLevel::Info, "Session Started", summary)
    }

    /// Log an agent spawn.
    pub fn log_agent_spawned(&self, agent_id: &str, role: &str, task: &str) -> Result<()> {
        self.entry(
            LogLevel::Info,
            "Agent Spawned",
            &format!("**Agent:** {} ({})\n**Task:** {}", agent_id, role, task),
        )
    }

    /// Log an agent status change.
    pub fn log_agent_status(&self, agent_id: &str, status: &str) -> Result<()> {
        self.entry(
            LogLevel::Debug,
            "Agent Status",
            &format!("**Agent:** {}\n**Status:** {}", agent_id, status),
        )
    }

    /// Log one LLM exchange.
    ///
    /// # Arguments
    /// * `agent_id` - Requesting agent.
    /// * `model` - Model the request went to.
    /// * `message_count` - History length sent.
    /// * `response_chars` - Size of the assembled response.
    pub fn log_llm_exchange(
        &self,
        agent_id: &str,
        model: &str,
        message_count: usize,
        response_chars: usize,
    ) -> Result<()> {
        self.entry(
            LogLevel::Info,
            "LLM Exchange",
            &format!(
                "**Agent:** {}\n**Model:** {}\n**Messages sent:** {}\n**Response:** {} chars",
                agent_id, model, message_count, response_chars
            ),
        )
    }

    /// Log a tool invocation and its outcome.
    pub fn log_tool_invocation(
        &self,
        origin: &str,
        tool: &str,
        success: bool,
        duration_ms: u64,
    ) -> Result<()> {
        self.entry(
            LogLevel::Info,
            "Tool Invocation",
            &format!(
                "**Origin:** {}\n**Tool:** {}\n**Outcome:** {}\n**Duration:** {} ms",
                origin,
                tool,
                if success { "success" } else { "failure" },
                duration_ms
            ),
        )
    }

    /// Log a workflow progress event.
    pub fn log_workflow_event(&self, plan_id: &str, event: &str) -> Result<()> {
        self.entry(
            LogLevel::Info,
            "Workflow",
            &format!("**Plan:** {}\n**Event:** {}", plan_id, event),
        )
    }

    /// Log a debug message.
    pub fn log_debug(&self, message: &str) -> Result<()> {
        self.entry(LogLevel::Debug, "Debug", message)
    }

    /// Log an informational message.
    pub fn log_info(&self, message: &str) -> Result<()> {
        self.entry(LogLevel::Info, "Info", message)
    }

    /// Log a warning.
    pub fn log_warn(&self, message: &str) -> Result<()> {
        self.entry(LogLevel::Warn, "Warning", message)
    }

    /// Log an error with optional context.
    pub fn log_error(&self, message: &str, context: Option<&str>) -> Result<()> {
        let body = match context {
            Some(ctx) => format!("{}\n\n**Context:** {}", message, ctx),
            None => message.to_string(),
        };
        self.entry(LogLevel::Error, "Error", &body)
    }
}
