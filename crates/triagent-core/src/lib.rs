pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::OrchestratorConfig;
pub use error::{Result, TriagentError};
pub use event::EventBus;
pub use types::*;
