pub mod builtin;
pub mod registry;

pub use builtin::{DryRunTool, HttpActionTool};
pub use registry::ActionToolRegistry;
