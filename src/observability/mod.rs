//! Session transcript logging.
//!
//! The durable record of a session: agent lifecycles, LLM exchanges, tool
//! invocations, and workflow progress land in one markdown file. Streamed
//! user-facing output goes through [`crate::sink::OutputSink`] instead;
//! the logger is for what happened, not for rendering.

mod logger;

pub use logger::{LogLevel, Logger};
