use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use triagent_core::config::OrchestratorConfig;
use triagent_core::error::{Result, TriagentError};
use triagent_core::types::{ActionRecord, CancelReason, Email, ExecutionId, TriageHint};
use triagent_tools::ActionToolRegistry;

use crate::action_store::ActionStore;
use crate::checkpoint::CheckpointRecorder;
use crate::dag::DagBuilder;
use crate::graph::ExecutionGraph;
use crate::orchestrator::{CancelHandle, ExecutionReport, Orchestrator};
use crate::pool::WorkerPool;
use crate::registry::AgentRegistry;
use crate::router::ActionRouter;

/// Result of processing one email end to end.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub report: ExecutionReport,
    /// Empty unless the execution succeeded.
    pub actions: Vec<ActionRecord>,
    #[serde(skip)]
    pub graph: Arc<ExecutionGraph>,
}

/// Build, execute and route, one email at a time per call.
///
/// Email ids already accepted are remembered; a repeat submission still gets
/// its own execution but is cancelled before any node runs.
pub struct Pipeline {
    builder: DagBuilder,
    orchestrator: Orchestrator,
    router: ActionRouter,
    seen: Mutex<HashSet<String>>,
}

impl Pipeline {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        registry: Arc<AgentRegistry>,
        tools: Arc<ActionToolRegistry>,
        store: Arc<dyn ActionStore>,
        recorder: CheckpointRecorder,
    ) -> Result<Self> {
        let builder = DagBuilder::new(&config.orchestrator)?;
        let pool = Arc::new(WorkerPool::from_config(&config.orchestrator));
        let router = ActionRouter::new(config.router.clone(), tools, store, Some(recorder.clone()))?;
        let orchestrator = Orchestrator::new(config, registry, pool, recorder);
        Ok(Self {
            builder,
            orchestrator,
            router,
            seen: Mutex::new(HashSet::new()),
        })
    }

    pub fn builder(&self) -> &DagBuilder {
        &self.builder
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn router(&self) -> &ActionRouter {
        &self.router
    }

    pub async fn process(&self, email: &Email, hint: Option<&TriageHint>) -> Result<PipelineOutcome> {
        self.process_with_cancel(email, hint, CancelHandle::new()).await
    }

    /// Process an email under a caller-held cancel handle.
    ///
    /// Errors are `GraphConstruction` for rejected emails and
    /// `CriticalNodeFailure` when the Context stage fails. Cancelled runs
    /// return their report with no actions.
    pub async fn process_with_cancel(
        &self,
        email: &Email,
        hint: Option<&TriageHint>,
        cancel: CancelHandle,
    ) -> Result<PipelineOutcome> {
        let graph = Arc::new(self.builder.build(ExecutionId::new(), email, hint)?);

        if !self.remember(&email.id)? {
            warn!(execution_id = %graph.id(), email_id = %email.id, "Duplicate email, cancelling execution");
            cancel.cancel(CancelReason::DuplicateEmail {
                email_id: email.id.clone(),
            });
        }

        let report = self.orchestrator.execute(email, graph.clone(), cancel).await?;

        let actions = if report.is_success() {
            self.router.route(&graph).await?
        } else {
            if let Some(err) = report.timeout_error() {
                warn!(execution_id = %report.execution_id, error = %err, "Execution timed out");
            }
            Vec::new()
        };

        info!(
            execution_id = %report.execution_id,
            status = %report.status,
            actions = actions.len(),
            elapsed_ms = report.elapsed_ms,
            "Email processed"
        );
        Ok(PipelineOutcome {
            report,
            actions,
            graph,
        })
    }

    /// Returns false when the email id was already accepted.
    fn remember(&self, email_id: &str) -> Result<bool> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|e| TriagentError::GraphConstruction(format!("email registry poisoned: {}", e)))?;
        Ok(seen.insert(email_id.to_string()))
    }
}
