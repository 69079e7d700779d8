pub mod action_store;
pub mod checkpoint;
pub mod dag;
pub mod graph;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod remote;
pub mod router;
pub mod run_log;

pub use action_store::{ActionStore, MemoryActionStore, SqliteActionStore};
pub use checkpoint::{replay, CheckpointLog, CheckpointRecorder, CheckpointStore, ReplaySummary};
pub use dag::DagBuilder;
pub use graph::{Edge, ExecutionGraph, TaskNode, TriggerRule};
pub use orchestrator::{CancelHandle, ExecutionReport, NodeSignal, Orchestrator};
pub use pipeline::{Pipeline, PipelineOutcome};
pub use pool::WorkerPool;
pub use registry::{AgentRegistry, FallbackExecutor};
pub use remote::HttpAgentExecutor;
pub use router::{decide, ActionRouter, REVIEW_QUEUE_ACTION};
pub use run_log::RunLogger;
