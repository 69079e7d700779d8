pub mod dry_run;
pub mod http;

pub use dry_run::DryRunTool;
pub use http::HttpActionTool;
