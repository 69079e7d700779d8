//! Shared test utilities, mocks, and fixtures for Triagent crates.

pub mod agents;
pub mod fixtures;
pub mod tools;

pub use agents::{ScriptedAgent, Step};
pub use fixtures::fast_config;
pub use tools::{RecordingTool, ToolCall};
