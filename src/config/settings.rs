//! TOML/JSON configuration parsing and profile resolution.

use crate::agent::{AgentProfile, AgentRole};
use crate::error::OrchestratorError;
use crate::config::SecretStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

fn default_max_concurrent_agents() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_max_file_size_kb() -> u64 {
    1024
}

fn default_safe_commands() -> Vec<String> {
    ["echo", "ls", "cat", "grep", "find", "wc", "head", "tail", "pwd", "which"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_denied_commands() -> Vec<String> {
    ["rm", "sudo", "dd", "mkfs", "shutdown", "reboot", "kill"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_tool_timeout() -> u64 {
    120
}

fn default_request_timeout() -> u64 {
    600
}

fn default_read_idle_timeout() -> u64 {
    120
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_estimated_task_tokens() -> u64 {
    2000
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Upper bound on concurrently active agents.
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: usize,
    /// Scan user input for role spawn keywords.
    #[serde(default)]
    pub auto_spawn_on_keywords: bool,
    /// When true, file operations from the main agent must arrive through
    /// an approved plan; direct ones are queued as suggestions.
    #[serde(default)]
    pub plan_mode: bool,
    /// Tool executor working directory. Defaults to the process cwd.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// File operation policy.
    #[serde(default)]
    pub file_ops: FileOpsPolicy,
    /// Shell command policy.
    #[serde(default)]
    pub tool_policy: ToolPolicy,
    /// Upstream HTTP behaviour.
    #[serde(default)]
    pub llm: LlmSettings,
    /// Session logging.
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Workflow engine behaviour.
    #[serde(default)]
    pub workflow: WorkflowSettings,
    /// Per-role agent settings, keyed by role name.
    #[serde(default)]
    pub agents: HashMap<String, RoleSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut agents = HashMap::new();
        agents.insert("main".to_string(), RoleSettings::default());
        Self {
            max_concurrent_agents: default_max_concurrent_agents(),
            auto_spawn_on_keywords: false,
            plan_mode: false,
            working_dir: None,
            file_ops: FileOpsPolicy::default(),
            tool_policy: ToolPolicy::default(),
            llm: LlmSettings::default(),
            logging: LoggingSettings::default(),
            workflow: WorkflowSettings::default(),
            agents,
        }
    }
}

/// File operation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOpsPolicy {
    /// Permit `read_file_tool`.
    #[serde(default = "default_true")]
    pub allow_read: bool,
    /// Permit `write_file_tool`.
    #[serde(default = "default_true")]
    pub allow_write: bool,
    /// Permit `edit_file_tool`.
    #[serde(default = "default_true")]
    pub allow_edit: bool,
    /// Size cap for reads and written content.
    #[serde(default = "default_max_file_size_kb")]
    pub max_file_size_kb: u64,
    /// Directories file operations may touch. An empty list means "only
    /// the executor's working directory".
    #[serde(default)]
    pub allowed_directories: Vec<PathBuf>,
    /// Copy `<path>` to `<path>.backup` before an edit rewrites it.
    #[serde(default = "default_true")]
    pub backup_before_edit: bool,
    /// Attach a warning to results that overwrite an existing file.
    #[serde(default = "default_true")]
    pub overwrite_warning: bool,
}

impl Default for FileOpsPolicy {
    fn default() -> Self {
        Self {
            allow_read: true,
            allow_write: true,
            allow_edit: true,
            max_file_size_kb: default_max_file_size_kb(),
            allowed_directories: Vec::new(),
            backup_before_edit: true,
            overwrite_warning: true,
        }
    }
}

/// Shell command policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPolicy {
    /// First token of a command must be in this set.
    #[serde(default = "default_safe_commands")]
    pub safe_commands: Vec<String>,
    /// Any token in this set rejects the command, even if the first token
    /// is safe.
    #[serde(default = "default_denied_commands")]
    pub denied_commands: Vec<String>,
    /// Default timeout for tool executions.
    #[serde(default = "default_tool_timeout")]
    pub default_timeout_seconds: u64,
    /// Commands allowed to carry shell metacharacters. Off by default.
    #[serde(default)]
    pub metachar_allowed_commands: Vec<String>,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            safe_commands: default_safe_commands(),
            denied_commands: default_denied_commands(),
            default_timeout_seconds: default_tool_timeout(),
            metachar_allowed_commands: Vec::new(),
        }
    }
}

/// Upstream HTTP behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Wall-clock cap for one completion request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Allowed gap between stream reads.
    #[serde(default = "default_read_idle_timeout")]
    pub read_idle_timeout_seconds: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout(),
            read_idle_timeout_seconds: default_read_idle_timeout(),
        }
    }
}

/// Session logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Transcript file path. A timestamped temp file when unset.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Minimum level written: DEBUG, INFO, WARN, or ERROR.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_file: None,
            log_level: default_log_level(),
        }
    }
}

/// Workflow engine settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Where workflow state persists. Defaults to the user data directory.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

/// Per-role agent settings as they appear in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSettings {
    /// Provider label.
    #[serde(default = "RoleSettings::default_provider")]
    pub provider: String,
    /// Chat-completions endpoint base URL.
    #[serde(default = "RoleSettings::default_base_url")]
    pub base_url: String,
    /// Model identifier.
    #[serde(default = "RoleSettings::default_model")]
    pub model: String,
    /// Name of the API key in the secret store. No auth header when unset.
    #[serde(default)]
    pub api_key_secret: Option<String>,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Completion token cap.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Stream completions.
    #[serde(default = "default_true")]
    pub stream: bool,
    /// System prompt. Falls back to a role-appropriate default.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Keywords that auto-spawn this role.
    #[serde(default)]
    pub spawn_keywords: Vec<String>,
    /// Price per thousand tokens.
    #[serde(default)]
    pub cost_per_1k_tokens: Option<f64>,
    /// Default token estimate for one task.
    #[serde(default = "default_estimated_task_tokens")]
    pub estimated_task_tokens: u64,
    /// Override for turn persistence. Defaults true for main, false for
    /// sub-agents.
    #[serde(default)]
    pub persistent: Option<bool>,
    /// Seed spawned agents with the parent's history.
    #[serde(default)]
    pub inherit_parent_history: bool,
}

impl RoleSettings {
    fn default_provider() -> String {
        "openai".to_string()
    }

    fn default_base_url() -> String {
        "https://api.openai.com/v1".to_string()
    }

    fn default_model() -> String {
        "gpt-4o-mini".to_string()
    }
}

impl Default for RoleSettings {
    fn default() -> Self {
        Self {
            provider: Self::default_provider(),
            base_url: Self::default_base_url(),
            model: Self::default_model(),
            api_key_secret: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            stream: true,
            system_prompt: None,
            spawn_keywords: Vec::new(),
            cost_per_1k_tokens: None,
            estimated_task_tokens: default_estimated_task_tokens(),
            persistent: None,
            inherit_parent_history: false,
        }
    }
}

/// Built-in system prompt for a role, used when the config carries none.
fn default_system_prompt(role: AgentRole) -> String {
    let specialty = match role {
        AgentRole::Main => {
            return "You are the primary orchestration agent. Answer the user directly, \
                    and delegate specialised work to sub-agents when it helps. Wrap \
                    private reasoning in [THINKING]...[/THINKING]. Propose multi-step \
                    work as a plan inside [PLAN]...[/PLAN]."
                .to_string();
        }
        AgentRole::Reviewer => "reviewing code and plans for defects",
        AgentRole::Researcher => "gathering and condensing information",
        AgentRole::Implementer => "writing code and files",
        AgentRole::Tester => "exercising behaviour and verifying results",
        AgentRole::Optimizer => "improving performance and simplifying code",
    };
    format!(
        "You are a {role} agent specialised in {specialty}. Work the task you are \
         given, then finish with your findings inside [SUMMARY]...[/SUMMARY]."
    )
}

impl Settings {
    /// Load settings from a TOML or JSON file, selected by extension.
    pub fn load(path: &Path) -> Result<Self, OrchestratorError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;

        let settings: Settings = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw).map_err(|e| {
                OrchestratorError::Configuration(format!("bad JSON in {}: {e}", path.display()))
            })?,
            _ => toml::from_str(&raw).map_err(|e| {
                OrchestratorError::Configuration(format!("bad TOML in {}: {e}", path.display()))
            })?,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Check structural constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.max_concurrent_agents < 1 {
            return Err(OrchestratorError::Configuration(
                "max_concurrent_agents must be at least 1".to_string(),
            ));
        }
        if !self.agents.contains_key("main") {
            return Err(OrchestratorError::Configuration(
                "missing [agents.main] section".to_string(),
            ));
        }
        for name in self.agents.keys() {
            if name.parse::<AgentRole>().is_err() {
                return Err(OrchestratorError::Configuration(format!(
                    "unknown role keyword: {name}"
                )));
            }
        }
        match self.logging.log_level.to_uppercase().as_str() {
            "DEBUG" | "INFO" | "WARN" | "ERROR" => {}
            other => {
                return Err(OrchestratorError::Configuration(format!(
                    "unknown log level: {other}"
                )))
            }
        }
        Ok(())
    }

    /// Resolve the configured roles into runnable [`AgentProfile`]s,
    /// pulling API keys from the secret store.
    ///
    /// A role naming an `api_key_secret` that the store cannot supply is a
    /// fatal configuration error.
    pub fn build_profiles(
        &self,
        secrets: &SecretStore,
    ) -> Result<HashMap<AgentRole, AgentProfile>, OrchestratorError> {
        let mut profiles = HashMap::new();

        for (name, rs) in &self.agents {
            let role: AgentRole = name.parse().map_err(|_| {
                OrchestratorError::Configuration(format!("unknown role keyword: {name}"))
            })?;

            let api_key = match &rs.api_key_secret {
                Some(secret_name) => Some(
                    secrets
                        .get(secret_name)
                        .ok_or_else(|| {
                            OrchestratorError::Configuration(format!(
                                "missing required secret: {secret_name}"
                            ))
                        })?
                        .to_string(),
                ),
                None => None,
            };

            profiles.insert(
                role,
                AgentProfile {
                    provider: rs.provider.clone(),
                    base_url: rs.base_url.clone(),
                    model_id: rs.model.clone(),
                    api_key,
                    role,
                    temperature: rs.temperature,
                    max_tokens: rs.max_tokens,
                    stream_enabled: rs.stream,
                    system_prompt: rs
                        .system_prompt
                        .clone()
                        .unwrap_or_else(|| default_system_prompt(role)),
                    spawn_keywords: rs.spawn_keywords.clone(),
                    cost_per_1k_tokens: rs.cost_per_1k_tokens,
                    estimated_task_tokens: rs.estimated_task_tokens,
                    persistent: rs.persistent.unwrap_or(role == AgentRole::Main),
                    inherit_parent_history: rs.inherit_parent_history,
                },
            );
        }

        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        max_concurrent_agents = 3
        auto_spawn_on_keywords = true
        plan_mode = true

        [file_ops]
        allowed_directories = ["./work"]
        max_file_size_kb = 64

        [tool_policy]
        safe_commands = ["echo", "ls"]
        denied_commands = ["rm"]
        default_timeout_seconds = 30

        [agents.main]
        model = "gpt-4o"
        api_key_secret = "openai_key"

        [agents.reviewer]
        model = "gpt-4o-mini"
        spawn_keywords = ["review", "audit"]
    "#;

    #[test]
    fn parses_sample_toml() {
        let settings: Settings = toml::from_str(SAMPLE).unwrap();
        settings.validate().unwrap();

        assert_eq!(settings.max_concurrent_agents, 3);
        assert!(settings.plan_mode);
        assert_eq!(settings.file_ops.max_file_size_kb, 64);
        assert_eq!(settings.tool_policy.safe_commands, vec!["echo", "ls"]);
        // untouched sections fall back to defaults
        assert_eq!(settings.llm.request_timeout_seconds, 600);
        assert_eq!(settings.logging.log_level, "INFO");
    }

    #[test]
    fn missing_main_section_is_rejected() {
        let settings: Settings = toml::from_str("[agents.reviewer]\n").unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn unknown_role_keyword_is_fatal() {
        let settings: Settings =
            toml::from_str("[agents.main]\n[agents.janitor]\n").unwrap();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("unknown role keyword"));
    }

    #[test]
    fn profiles_resolve_secrets_by_name() {
        let settings: Settings = toml::from_str(SAMPLE).unwrap();
        let mut secrets = SecretStore::empty();
        secrets.insert("openai_key", "sk-test");

        let profiles = settings.build_profiles(&secrets).unwrap();
        let main = &profiles[&AgentRole::Main];
        assert_eq!(main.api_key.as_deref(), Some("sk-test"));
        assert!(main.persistent);

        let reviewer = &profiles[&AgentRole::Reviewer];
        assert!(reviewer.api_key.is_none());
        assert!(!reviewer.persistent);
        assert_eq!(reviewer.spawn_keywords, vec!["review", "audit"]);
    }

    #[test]
    fn missing_required_secret_is_fatal() {
        let settings: Settings = toml::from_str(SAMPLE).unwrap();
        let err = settings.build_profiles(&SecretStore::empty()).unwrap_err();
        assert!(err.to_string().contains("missing required secret"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let settings: Settings =
            toml::from_str("max_concurrent_agents = 0\n[agents.main]\n").unwrap();
        assert!(settings.validate().is_err());
    }
}
