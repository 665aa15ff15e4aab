//! Typed configuration and secret resolution.
//!
//! One [`Settings`] record drives the whole runtime: concurrency caps,
//! plan mode, file and shell policies, upstream timeouts, logging, and a
//! per-role agent section that [`Settings::build_profiles`] resolves into
//! [`AgentProfile`](crate::agent::AgentProfile)s using a [`SecretStore`].

mod secrets;
mod settings;

pub use secrets::SecretStore;
pub use settings::{
    FileOpsPolicy, LlmSettings, LoggingSettings, RoleSettings, Settings, ToolPolicy,
    WorkflowSettings,
};
