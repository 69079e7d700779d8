//! Orchestrator: runs one execution graph to a terminal status.
//!
//! Ready nodes are spawned onto a `JoinSet` and draw a permit from the shared
//! `WorkerPool` before calling their executor. Each node owns its retry loop
//! and per-attempt timeout. The supervising loop applies completions, watches
//! the SLA and reacts to cancellation.
//!
//! Failures of non-critical nodes are absorbed: the node is marked failed, a
//! flagged-absent output is recorded and downstream nodes still run. A failure
//! of the critical Context node fails the whole execution and is returned as
//! `TriagentError::CriticalNodeFailure`.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use triagent_core::config::{NodePolicy, OrchestratorConfig};
use triagent_core::error::{Result, TriagentError};
use triagent_core::traits::AgentExecutor;
use triagent_core::types::{
    AgentInput, AgentOutput, AgentType, CancelReason, CheckpointEvent, CheckpointEventType, Email,
    ExecutionId, GraphStatus, NodeStatus,
};

use crate::checkpoint::CheckpointRecorder;
use crate::graph::{ExecutionGraph, TaskNode};
use crate::pool::WorkerPool;
use crate::registry::AgentRegistry;

/// Cancels a running execution. The first reason given wins.
#[derive(Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns false if the execution was already cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        {
            let mut slot = match self.reason.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        self.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        match self.reason.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

/// Outcome of a node as delivered to the orchestrator.
#[derive(Debug, Clone)]
pub enum NodeSignal {
    Succeeded(AgentOutput),
    Failed { error: String, duration_ms: u64 },
}

/// What an execution ended as.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub execution_id: ExecutionId,
    pub email_id: String,
    pub status: GraphStatus,
    pub node_statuses: BTreeMap<String, NodeStatus>,
    pub start_order: Vec<String>,
    pub completion_order: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_output: Option<AgentOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    pub elapsed_ms: u64,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.status == GraphStatus::Success
    }

    /// The SLA error, when the execution was cancelled for exceeding it.
    pub fn timeout_error(&self) -> Option<TriagentError> {
        match &self.cancel_reason {
            Some(CancelReason::SlaExceeded { sla_secs }) => Some(TriagentError::OrchestrationTimeout {
                execution_id: self.execution_id.to_string(),
                sla_secs: *sla_secs,
            }),
            _ => None,
        }
    }
}

struct NodeCompletion {
    node_id: String,
    /// `None` when the node task stopped because the execution was cancelled.
    signal: Option<NodeSignal>,
}

pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    registry: Arc<AgentRegistry>,
    pool: Arc<WorkerPool>,
    recorder: CheckpointRecorder,
}

impl Orchestrator {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        registry: Arc<AgentRegistry>,
        pool: Arc<WorkerPool>,
        recorder: CheckpointRecorder,
    ) -> Self {
        Self {
            config,
            registry,
            pool,
            recorder,
        }
    }

    pub fn recorder(&self) -> &CheckpointRecorder {
        &self.recorder
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Run `graph` for `email` until it succeeds, fails or is cancelled.
    ///
    /// Returns the report for succeeded and cancelled executions, and
    /// `CriticalNodeFailure` when the Context node fails.
    pub async fn execute(
        &self,
        email: &Email,
        graph: Arc<ExecutionGraph>,
        cancel: CancelHandle,
    ) -> Result<ExecutionReport> {
        if graph.email_id() != email.id {
            return Err(TriagentError::GraphConstruction(format!(
                "graph {} was built for email {}, not {}",
                graph.id(),
                graph.email_id(),
                email.id
            )));
        }
        if !graph.transition(GraphStatus::Pending, GraphStatus::Running) {
            return Err(TriagentError::GraphConstruction(format!(
                "execution {} was already submitted",
                graph.id()
            )));
        }

        let started = Instant::now();
        let sla_secs = self.config.orchestrator.sla_secs;
        info!(execution_id = %graph.id(), email_id = %email.id, nodes = graph.len(), sla_secs, "Execution started");
        self.emit_graph(
            &graph,
            CheckpointEventType::GraphStarted,
            json!({"nodes": graph.len(), "sla_secs": sla_secs}),
            serde_json::to_value(graph.snapshot()).unwrap_or_default(),
        );

        let stop = cancel.child_token();
        let mut in_flight: JoinSet<NodeCompletion> = JoinSet::new();
        let sla = tokio::time::sleep(self.config.orchestrator.sla());
        tokio::pin!(sla);

        loop {
            if cancel.is_cancelled() {
                return Ok(self.finish_cancelled(&graph, &cancel, &stop, in_flight, started).await);
            }
            self.dispatch_ready(&graph, email, &stop, &mut in_flight);
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = &mut sla => {
                    warn!(execution_id = %graph.id(), sla_secs, "SLA exceeded, cancelling execution");
                    cancel.cancel(CancelReason::SlaExceeded { sla_secs });
                }
                joined = in_flight.join_next() => match joined {
                    Some(Ok(completion)) => {
                        if let Some(signal) = completion.signal {
                            self.deliver_completion(&graph, &completion.node_id, signal);
                        }
                        if let Some((node_id, reason)) = critical_failure(&graph) {
                            return Err(self.finish_critical(&graph, node_id, reason, &stop, in_flight, started).await);
                        }
                    }
                    Some(Err(e)) => error!(execution_id = %graph.id(), error = %e, "Node task aborted"),
                    None => {}
                },
            }
        }

        match graph.context_node().map(|n| n.status()) {
            Some(NodeStatus::Success) => Ok(self.finish_success(&graph, started)),
            _ => {
                let node_id = graph
                    .context_node()
                    .map(|n| n.id.clone())
                    .unwrap_or_else(|| AgentType::Context.to_string());
                let reason = "context node never completed".to_string();
                Err(self.finish_critical(&graph, node_id, reason, &stop, in_flight, started).await)
            }
        }
    }

    /// Apply a node completion. Returns false when the node was no longer
    /// running, which makes repeated or late deliveries no-ops.
    pub fn deliver_completion(&self, graph: &ExecutionGraph, node_id: &str, signal: NodeSignal) -> bool {
        let Some(node) = graph.node(node_id) else {
            warn!(execution_id = %graph.id(), node_id, "Completion for unknown node");
            return false;
        };

        match signal {
            NodeSignal::Succeeded(output) => {
                let metrics = json!({
                    "duration_ms": output.duration_ms,
                    "confidence": output.confidence,
                    "model": output.model_used,
                    "retries_used": node.retries_used(),
                });
                let findings = serde_json::Value::Object(output.findings.clone());
                if !graph.complete_node(node, output) {
                    debug!(execution_id = %graph.id(), node_id, status = %node.status(), "Ignored completion for settled node");
                    return false;
                }
                info!(execution_id = %graph.id(), node_id, confidence = metrics["confidence"].as_f64().unwrap_or_default(), "Node succeeded");
                self.emit_node(graph, node, CheckpointEventType::NodeSucceeded, metrics, findings);
            }
            NodeSignal::Failed { error, duration_ms } => {
                let flagged = AgentOutput::failed(node.agent_type, error.clone(), duration_ms);
                if !graph.fail_node(node, flagged) {
                    debug!(execution_id = %graph.id(), node_id, status = %node.status(), "Ignored failure for settled node");
                    return false;
                }
                if node.critical {
                    error!(execution_id = %graph.id(), node_id, error = %error, "Critical node failed");
                } else {
                    warn!(execution_id = %graph.id(), node_id, error = %error, "Node failed, downstream input flagged absent");
                }
                self.emit_node(
                    graph,
                    node,
                    CheckpointEventType::NodeFailed,
                    json!({"duration_ms": duration_ms, "retries_used": node.retries_used()}),
                    json!({"error": error}),
                );
            }
        }
        true
    }

    fn dispatch_ready(
        &self,
        graph: &Arc<ExecutionGraph>,
        email: &Email,
        stop: &CancellationToken,
        in_flight: &mut JoinSet<NodeCompletion>,
    ) {
        loop {
            let mut skipped = false;
            for node in graph.ready_nodes() {
                if !node.trigger.should_run(&graph.dependency_statuses(node)) {
                    if graph.skip_node(node) {
                        debug!(execution_id = %graph.id(), node_id = %node.id, "Skipping node, a dependency did not succeed");
                        self.emit_node(
                            graph,
                            node,
                            CheckpointEventType::NodeSkipped,
                            json!({}),
                            json!({"reason": "dependency did not succeed"}),
                        );
                        skipped = true;
                    }
                    continue;
                }
                if !graph.start_node(node) {
                    continue;
                }

                let policy = self.config.agents.policy(node.agent_type).clone();
                let input = build_input(graph, node, email, &policy);
                self.emit_node(
                    graph,
                    node,
                    CheckpointEventType::NodeStarted,
                    json!({
                        "timeout_ms": policy.timeout_ms,
                        "max_retries": if node.critical { 0 } else { policy.max_retries },
                        "resource_class": node.agent_type.resource_class(),
                    }),
                    json!({
                        "dependencies": node.dependencies,
                        "flagged_absent": input.flagged_absent,
                    }),
                );
                debug!(execution_id = %graph.id(), node_id = %node.id, "Dispatching node");

                let task = NodeTask {
                    graph: graph.clone(),
                    node_id: node.id.clone(),
                    agent_type: node.agent_type,
                    critical: node.critical,
                    executor: self.registry.resolve(node.agent_type, policy.model.as_deref()),
                    policy,
                    input,
                    pool: self.pool.clone(),
                    stop: stop.clone(),
                    recorder: self.recorder.clone(),
                };
                in_flight.spawn(task.run());
            }
            if !skipped {
                break;
            }
        }
    }

    fn finish_success(&self, graph: &ExecutionGraph, started: Instant) -> ExecutionReport {
        graph.transition(GraphStatus::Running, GraphStatus::Success);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let retries: u32 = graph.nodes().iter().map(|n| n.retries_used()).sum();
        let failed = graph
            .nodes()
            .iter()
            .filter(|n| n.status() == NodeStatus::Failed)
            .count();
        info!(execution_id = %graph.id(), elapsed_ms, retries, failed_nodes = failed, "Execution succeeded");
        self.emit_graph(
            graph,
            CheckpointEventType::GraphSucceeded,
            json!({"elapsed_ms": elapsed_ms, "retries": retries, "failed_nodes": failed}),
            serde_json::Value::Null,
        );
        report(graph, started, None)
    }

    async fn finish_critical(
        &self,
        graph: &ExecutionGraph,
        node_id: String,
        reason: String,
        stop: &CancellationToken,
        mut in_flight: JoinSet<NodeCompletion>,
        started: Instant,
    ) -> TriagentError {
        graph.transition(GraphStatus::Running, GraphStatus::Failed);
        stop.cancel();

        while let Some(joined) = in_flight.join_next().await {
            if let Ok(NodeCompletion {
                node_id,
                signal: Some(signal),
            }) = joined
            {
                self.deliver_completion(graph, &node_id, signal);
            }
        }
        self.skip_unfinished(graph, "critical node failed");

        let elapsed_ms = started.elapsed().as_millis() as u64;
        error!(execution_id = %graph.id(), node_id = %node_id, reason = %reason, elapsed_ms, "Execution failed on critical node");
        if let Some(node) = graph.node(&node_id) {
            self.emit_node(
                graph,
                node,
                CheckpointEventType::CriticalFailure,
                json!({"elapsed_ms": elapsed_ms}),
                json!({"reason": reason}),
            );
        }
        self.emit_graph(
            graph,
            CheckpointEventType::GraphFailed,
            json!({"elapsed_ms": elapsed_ms}),
            json!({"node_id": node_id, "reason": reason}),
        );

        TriagentError::CriticalNodeFailure {
            execution_id: graph.id().to_string(),
            node_id,
            reason,
        }
    }

    async fn finish_cancelled(
        &self,
        graph: &ExecutionGraph,
        cancel: &CancelHandle,
        stop: &CancellationToken,
        mut in_flight: JoinSet<NodeCompletion>,
        started: Instant,
    ) -> ExecutionReport {
        stop.cancel();
        let reason = cancel.reason().unwrap_or(CancelReason::Requested {
            by: "unknown".into(),
        });
        self.skip_unfinished(graph, &reason.to_string());

        // In-flight calls are drained before the graph counts as cancelled.
        while let Some(joined) = in_flight.join_next().await {
            if let Ok(NodeCompletion {
                node_id,
                signal: Some(signal),
            }) = joined
            {
                self.deliver_completion(graph, &node_id, signal);
            }
        }

        graph.transition(GraphStatus::Running, GraphStatus::Cancelled);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        warn!(execution_id = %graph.id(), reason = %reason, elapsed_ms, "Execution cancelled");
        self.emit_graph(
            graph,
            CheckpointEventType::GraphCancelled,
            json!({"elapsed_ms": elapsed_ms}),
            serde_json::to_value(&reason).unwrap_or_default(),
        );
        report(graph, started, Some(reason))
    }

    fn skip_unfinished(&self, graph: &ExecutionGraph, reason: &str) {
        for node in graph.nodes() {
            if !node.status().is_terminal() && graph.skip_node(node) {
                self.emit_node(
                    graph,
                    node,
                    CheckpointEventType::NodeSkipped,
                    json!({}),
                    json!({"reason": reason}),
                );
            }
        }
    }

    fn emit_node(
        &self,
        graph: &ExecutionGraph,
        node: &TaskNode,
        event_type: CheckpointEventType,
        metrics: serde_json::Value,
        snapshot: serde_json::Value,
    ) {
        self.recorder.record(
            CheckpointEvent::new(graph.id().clone(), Some(node.id.clone()), event_type, node.next_sequence())
                .with_metrics(metrics)
                .with_snapshot(snapshot),
        );
    }

    fn emit_graph(
        &self,
        graph: &ExecutionGraph,
        event_type: CheckpointEventType,
        metrics: serde_json::Value,
        snapshot: serde_json::Value,
    ) {
        self.recorder.record(
            CheckpointEvent::new(graph.id().clone(), None, event_type, graph.next_sequence())
                .with_metrics(metrics)
                .with_snapshot(snapshot),
        );
    }
}

fn critical_failure(graph: &ExecutionGraph) -> Option<(String, String)> {
    graph
        .nodes()
        .iter()
        .find(|n| n.critical && n.status() == NodeStatus::Failed)
        .map(|n| {
            let reason = n
                .output()
                .and_then(|o| o.error.clone())
                .unwrap_or_else(|| "failed".into());
            (n.id.clone(), reason)
        })
}

fn report(graph: &ExecutionGraph, started: Instant, cancel_reason: Option<CancelReason>) -> ExecutionReport {
    ExecutionReport {
        execution_id: graph.id().clone(),
        email_id: graph.email_id().to_string(),
        status: graph.status(),
        node_statuses: graph.node_statuses(),
        start_order: graph.start_order(),
        completion_order: graph.completion_order(),
        context_output: graph
            .context_node()
            .filter(|n| n.status() == NodeStatus::Success)
            .and_then(|n| n.output().cloned()),
        cancel_reason,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

/// Collect dependency outputs. Failed or skipped dependencies are listed as
/// flagged absent; failed ones still pass their flagged output along.
fn build_input(graph: &ExecutionGraph, node: &TaskNode, email: &Email, policy: &NodePolicy) -> AgentInput {
    let mut upstream_outputs = BTreeMap::new();
    let mut flagged_absent = Vec::new();
    for dep_id in &node.dependencies {
        let Some(dep) = graph.node(dep_id) else {
            continue;
        };
        if dep.status() != NodeStatus::Success {
            flagged_absent.push(dep_id.clone());
        }
        if let Some(output) = dep.output() {
            upstream_outputs.insert(dep_id.clone(), output.clone());
        }
    }

    AgentInput {
        email_id: email.id.clone(),
        execution_id: graph.id().clone(),
        upstream_outputs,
        flagged_absent,
        email: email.clone(),
        model_variant: policy.model.clone(),
        attempt: 0,
    }
}

/// One node's run: permit, attempts, timeouts and backoff.
struct NodeTask {
    graph: Arc<ExecutionGraph>,
    node_id: String,
    agent_type: AgentType,
    critical: bool,
    executor: Result<Arc<dyn AgentExecutor>>,
    policy: NodePolicy,
    input: AgentInput,
    pool: Arc<WorkerPool>,
    stop: CancellationToken,
    recorder: CheckpointRecorder,
}

impl NodeTask {
    async fn run(self) -> NodeCompletion {
        let node_id = self.node_id.clone();
        let signal = self.drive().await;
        NodeCompletion { node_id, signal }
    }

    async fn drive(self) -> Option<NodeSignal> {
        let started = Instant::now();
        let executor = match self.executor {
            Ok(executor) => executor,
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "No executor for node");
                return Some(failure(&e, started));
            }
        };

        let _permit = tokio::select! {
            _ = self.stop.cancelled() => return None,
            permit = self.pool.acquire(self.agent_type.resource_class()) => match permit {
                Ok(permit) => permit,
                Err(e) => return Some(failure(&e, started)),
            },
        };

        // The critical node is never retried.
        let max_retries = if self.critical { 0 } else { self.policy.max_retries };
        let agent = self.agent_type.to_string();
        let mut attempt = 0u32;

        loop {
            let mut input = self.input.clone();
            input.attempt = attempt;
            let call = AssertUnwindSafe(executor.execute(input)).catch_unwind();

            let outcome = tokio::select! {
                _ = self.stop.cancelled() => return None,
                outcome = tokio::time::timeout(self.policy.timeout(), call) => outcome,
            };

            let err = match outcome {
                Ok(Ok(Ok(output))) if output.agent_type == self.agent_type => {
                    let duration_ms = elapsed_ms(started);
                    return Some(NodeSignal::Succeeded(output.clamped().with_duration(duration_ms)));
                }
                Ok(Ok(Ok(output))) => TriagentError::AgentExecution {
                    agent: agent.clone(),
                    message: format!("executor returned output for {}", output.agent_type),
                },
                Ok(Ok(Err(e))) => e,
                Ok(Err(_)) => TriagentError::AgentExecution {
                    agent: agent.clone(),
                    message: "executor panicked".into(),
                },
                Err(_) => TriagentError::NodeTimeout {
                    node_id: self.node_id.clone(),
                    timeout_ms: self.policy.timeout_ms,
                },
            };

            if !err.is_retryable() || attempt >= max_retries {
                let err = if attempt > 0 && err.is_retryable() {
                    TriagentError::NodeRetryExhausted {
                        node_id: self.node_id.clone(),
                        attempts: attempt + 1,
                        last_error: err.to_string(),
                    }
                } else {
                    err
                };
                return Some(failure(&err, started));
            }

            let backoff = jittered(self.policy.backoff_for(attempt));
            if let Some(node) = self.graph.node(&self.node_id) {
                let retries_used = node.record_retry();
                self.recorder.record(
                    CheckpointEvent::new(
                        self.graph.id().clone(),
                        Some(self.node_id.clone()),
                        CheckpointEventType::NodeRetrying,
                        node.next_sequence(),
                    )
                    .with_metrics(json!({
                        "attempt": attempt + 1,
                        "retries_used": retries_used,
                        "backoff_ms": backoff.as_millis() as u64,
                    }))
                    .with_snapshot(json!({"error": err.to_string()})),
                );
            }
            warn!(
                node_id = %self.node_id,
                attempt = attempt + 1,
                max_retries,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Retrying node"
            );

            tokio::select! {
                _ = self.stop.cancelled() => return None,
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
        }
    }
}

fn failure(err: &TriagentError, started: Instant) -> NodeSignal {
    NodeSignal::Failed {
        error: err.to_string(),
        duration_ms: elapsed_ms(started),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn jittered(base: Duration) -> Duration {
    // 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((base.as_millis() as f64 * jitter) as u64)
}
