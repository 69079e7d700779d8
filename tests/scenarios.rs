//! End-to-end behaviour of the orchestration core: graph shape, critical
//! failure, routing gates, completion dedup and replay.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use triagent_agent::{
    decide, replay, ActionStore, AgentRegistry, CancelHandle, CheckpointRecorder, CheckpointStore,
    DagBuilder, ExecutionGraph, MemoryActionStore, NodeSignal, Orchestrator, Pipeline,
    SqliteActionStore, WorkerPool,
};
use triagent_core::config::{OrchestratorConfig, RouterConfig};
use triagent_core::event::EventBus;
use triagent_core::types::{
    clamp_confidence, ActionDecision, AgentType, CheckpointEvent, CheckpointEventType, ExecutionId,
    GraphStatus, NodeStatus, RiskLevel,
};
use triagent_core::TriagentError;
use triagent_test_utils::fixtures::{context_output, email, hint, invoice_email, recommendation, shift_question};
use triagent_test_utils::{fast_config, RecordingTool, ScriptedAgent, Step, ToolCall};
use triagent_tools::ActionToolRegistry;

fn context_recommending(confidence: f64, risk: &str) -> ScriptedAgent {
    let out = context_output(vec![recommendation("create_task", confidence, risk)], confidence);
    ScriptedAgent::with_findings(AgentType::Context, confidence, serde_json::Value::Object(out.findings))
}

fn registry_with(context: ScriptedAgent) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    for agent_type in [AgentType::Triage, AgentType::Vision, AgentType::Deadline, AgentType::Task] {
        registry.register(ScriptedAgent::succeeding(agent_type, 0.8));
    }
    registry.register(context);
    registry
}

struct Setup {
    pipeline: Pipeline,
    store: Arc<dyn ActionStore>,
    calls: Arc<Mutex<Vec<ToolCall>>>,
    recorder: CheckpointRecorder,
}

fn setup(config: OrchestratorConfig, registry: AgentRegistry, store: Arc<dyn ActionStore>) -> Setup {
    let tool = RecordingTool::succeeding(&["create_task"]);
    let calls = tool.calls();
    let mut tools = ActionToolRegistry::new();
    tools.register(tool);
    let (recorder, _) = CheckpointRecorder::spawn(Arc::new(EventBus::default()), None);
    let pipeline = Pipeline::new(
        Arc::new(config),
        Arc::new(registry),
        Arc::new(tools),
        store.clone(),
        recorder.clone(),
    )
    .unwrap();
    Setup {
        pipeline,
        store,
        calls,
        recorder,
    }
}

fn node_ids(graph: &ExecutionGraph) -> Vec<&str> {
    graph.nodes().iter().map(|n| n.id.as_str()).collect()
}

#[tokio::test]
async fn scenario_plain_email_has_no_vision() {
    let s = setup(fast_config(), registry_with(context_recommending(0.92, "low")), Arc::new(MemoryActionStore::new()));
    let outcome = s.pipeline.process(&shift_question(), None).await.unwrap();

    assert_eq!(node_ids(&outcome.graph), vec!["triage", "deadline", "task", "context"]);
    assert_eq!(outcome.report.status, GraphStatus::Success);
    assert!(outcome.report.node_statuses.values().all(|s| *s == NodeStatus::Success));
}

#[tokio::test]
async fn scenario_invoice_runs_vision_alongside_other_stages() {
    let mut registry = AgentRegistry::new();
    registry.register(ScriptedAgent::succeeding(AgentType::Triage, 0.8));
    for agent_type in [AgentType::Vision, AgentType::Deadline, AgentType::Task] {
        registry.register(ScriptedAgent::new(
            agent_type,
            vec![],
            Step::Delay(Duration::from_millis(40)),
        ));
    }
    registry.register(context_recommending(0.92, "low"));
    let s = setup(fast_config(), registry, Arc::new(MemoryActionStore::new()));

    let outcome = s.pipeline.process(&invoice_email(), None).await.unwrap();
    assert_eq!(node_ids(&outcome.graph), vec!["triage", "vision", "deadline", "task", "context"]);
    assert_eq!(outcome.report.status, GraphStatus::Success);

    let context = outcome.graph.context_node().unwrap();
    let deps: Vec<&str> = context.dependencies.iter().map(String::as_str).collect();
    assert_eq!(deps, vec!["deadline", "task", "triage", "vision"]);
    assert_eq!(outcome.report.completion_order.last().map(String::as_str), Some("context"));

    // Vision, Deadline and Task all started before any of them finished.
    s.recorder.flush().await;
    let events = s.recorder.events(&outcome.report.execution_id);
    let position = |node: &str, event_type: CheckpointEventType| {
        events
            .iter()
            .position(|e| e.node_id.as_deref() == Some(node) && e.event_type == event_type)
            .unwrap()
    };
    let last_start = ["vision", "deadline", "task"]
        .iter()
        .map(|n| position(n, CheckpointEventType::NodeStarted))
        .max()
        .unwrap();
    let first_finish = ["vision", "deadline", "task"]
        .iter()
        .map(|n| position(n, CheckpointEventType::NodeSucceeded))
        .min()
        .unwrap();
    assert!(last_start < first_finish);
}

#[tokio::test]
async fn scenario_context_unavailable_is_critical() {
    let config = Arc::new(fast_config());
    let context = ScriptedAgent::unavailable(AgentType::Context, "model overloaded");
    let context_calls = context.calls();
    let (recorder, _) = CheckpointRecorder::spawn(Arc::new(EventBus::default()), None);
    let orchestrator = Orchestrator::new(
        config.clone(),
        Arc::new(registry_with(context)),
        Arc::new(WorkerPool::from_config(&config.orchestrator)),
        recorder.clone(),
    );
    let email = shift_question();
    let graph = Arc::new(
        DagBuilder::new(&config.orchestrator)
            .unwrap()
            .build(ExecutionId::new(), &email, None)
            .unwrap(),
    );

    let err = orchestrator
        .execute(&email, graph.clone(), CancelHandle::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TriagentError::CriticalNodeFailure { ref node_id, .. } if node_id == "context"));
    assert_eq!(graph.status(), GraphStatus::Failed);
    assert_eq!(context_calls.load(Ordering::SeqCst), 1);

    recorder.flush().await;
    let events = recorder.events(graph.id());
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event_type == CheckpointEventType::CriticalFailure)
            .count(),
        1
    );
    assert!(events.iter().all(|e| e.event_type != CheckpointEventType::NodeRetrying));
}

#[tokio::test]
async fn context_failure_routes_nothing() {
    let store: Arc<dyn ActionStore> = Arc::new(MemoryActionStore::new());
    let s = setup(
        fast_config(),
        registry_with(ScriptedAgent::failing(AgentType::Context, "bad synthesis")),
        store,
    );

    let err = s.pipeline.process(&invoice_email(), None).await.unwrap_err();
    assert!(err.is_critical());
    assert!(s.calls.lock().unwrap().is_empty());

    s.recorder.flush().await;
    let ids = s.recorder.log().execution_ids();
    assert_eq!(ids.len(), 1);
    assert!(s.store.list(&ids[0]).unwrap().is_empty());
    let summary = replay(&s.recorder.events(&ids[0]));
    assert_eq!(summary.graph_status, Some(GraphStatus::Failed));
    assert_eq!(summary.actions_routed, 0);
}

#[tokio::test]
async fn scenario_confident_low_risk_auto_executes_once() {
    let s = setup(fast_config(), registry_with(context_recommending(0.92, "low")), Arc::new(MemoryActionStore::new()));
    let outcome = s.pipeline.process(&shift_question(), None).await.unwrap();

    assert_eq!(outcome.actions.len(), 1);
    assert_eq!(outcome.actions[0].decision, ActionDecision::AutoExecuted);

    // Routing the same execution again reuses the stored record.
    let again = s.pipeline.router().route(&outcome.graph).await.unwrap();
    assert_eq!(again, outcome.actions);
    let calls = s.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].idempotency_key, format!("{}:0", outcome.report.execution_id));
}

#[tokio::test]
async fn scenario_confident_high_risk_goes_to_manual_review() {
    let s = setup(fast_config(), registry_with(context_recommending(0.92, "high")), Arc::new(MemoryActionStore::new()));
    let outcome = s.pipeline.process(&shift_question(), None).await.unwrap();

    assert_eq!(outcome.actions.len(), 1);
    assert_eq!(outcome.actions[0].decision, ActionDecision::ManualReview);
    assert!(s.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn scenario_duplicate_completion_is_a_noop() {
    let s = setup(fast_config(), registry_with(context_recommending(0.92, "low")), Arc::new(MemoryActionStore::new()));
    let outcome = s.pipeline.process(&shift_question(), None).await.unwrap();
    let graph = &outcome.graph;
    let triage = graph.node("triage").unwrap();
    let recorded = triage.output().cloned().unwrap();

    let mut replacement = recorded.clone();
    replacement.confidence = 0.1;
    let applied = s
        .pipeline
        .orchestrator()
        .deliver_completion(graph, "triage", NodeSignal::Succeeded(replacement));
    assert!(!applied);
    assert_eq!(triage.status(), NodeStatus::Success);
    assert_eq!(triage.output(), Some(&recorded));

    // The same checkpoint delivered twice is retained once.
    s.recorder.flush().await;
    let events = s.recorder.events(graph.id());
    let succeeded = events
        .iter()
        .find(|e| e.node_id.as_deref() == Some("triage") && e.event_type == CheckpointEventType::NodeSucceeded)
        .cloned()
        .unwrap();
    s.recorder.record(succeeded);
    s.recorder.flush().await;
    let after = s.recorder.events(graph.id());
    assert_eq!(after.len(), events.len());
    assert_eq!(
        after
            .iter()
            .filter(|e| e.node_id.as_deref() == Some("triage") && e.event_type == CheckpointEventType::NodeSucceeded)
            .count(),
        1
    );
}

#[test]
fn context_depends_on_every_other_node() {
    let subjects = ["Shift question", "Invoice #123 due", "Receipt attached", "Billing cycle"];
    for triage_first in [false, true] {
        let mut config = OrchestratorConfig::default();
        config.orchestrator.triage_first = triage_first;
        let builder = DagBuilder::new(&config.orchestrator).unwrap();
        for subject in subjects {
            for has_attachments in [false, true] {
                for requires_vision in [None, Some(false), Some(true)] {
                    let mail = email("msg-prop", subject, has_attachments);
                    let h = requires_vision.map(hint);
                    let graph = builder.build(ExecutionId::new(), &mail, h.as_ref()).unwrap();

                    let context = graph.context_node().unwrap();
                    let others: Vec<&str> = graph
                        .nodes()
                        .iter()
                        .filter(|n| !n.critical)
                        .map(|n| n.id.as_str())
                        .collect();
                    assert_eq!(context.dependencies.len(), others.len());
                    assert!(others.iter().all(|id| context.dependencies.contains(*id)));

                    let has_vision = graph.contains(AgentType::Vision);
                    if !has_attachments {
                        assert!(!has_vision, "{subject}: vision without attachments");
                    }
                    if has_attachments && requires_vision == Some(true) {
                        assert!(has_vision, "{subject}: hinted vision missing");
                    }
                }
            }
        }
    }
}

#[test]
fn high_risk_never_auto_executes_below_threshold() {
    let config = RouterConfig::default();
    for confidence in [0.0, 0.5, 0.9, 0.94, 0.949_999, 1.7, f64::NAN] {
        let clamped = clamp_confidence(confidence);
        assert!((0.0..=1.0).contains(&clamped));
        if clamped < config.high_risk_threshold {
            assert_ne!(decide(clamped, RiskLevel::High, &config), ActionDecision::AutoExecuted);
        }
    }
    assert_eq!(decide(0.96, RiskLevel::High, &config), ActionDecision::AutoExecuted);
}

#[tokio::test]
async fn replay_from_store_matches_live_run() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("triagent.db");
    let checkpoints = Arc::new(CheckpointStore::open(&db).unwrap());
    let store: Arc<dyn ActionStore> = Arc::new(SqliteActionStore::open(&db).unwrap());

    let config = Arc::new(fast_config());
    let mut tools = ActionToolRegistry::new();
    tools.register(RecordingTool::succeeding(&["create_task"]));
    let (recorder, _) = CheckpointRecorder::spawn(Arc::new(EventBus::default()), Some(checkpoints.clone()));
    let pipeline = Pipeline::new(
        config,
        Arc::new(registry_with(context_recommending(0.92, "low"))),
        Arc::new(tools),
        store,
        recorder.clone(),
    )
    .unwrap();

    let outcome = pipeline.process(&invoice_email(), None).await.unwrap();
    recorder.flush().await;

    let stored = checkpoints.load(&outcome.report.execution_id).unwrap();
    let summary = replay(&stored);
    assert_eq!(summary.graph_status, Some(GraphStatus::Success));
    assert_eq!(summary.start_order, outcome.report.start_order);
    assert_eq!(summary.completion_order, outcome.report.completion_order);
    assert_eq!(summary.node_statuses, outcome.report.node_statuses);
    assert_eq!(summary.actions_routed, 1);

    // Replaying a stream with every event delivered twice changes nothing but the drop count.
    let doubled: Vec<CheckpointEvent> = stored.iter().chain(stored.iter()).cloned().collect();
    let again = replay(&doubled);
    assert_eq!(again.duplicates_dropped, stored.len());
    assert_eq!(again.start_order, summary.start_order);
    assert_eq!(again.completion_order, summary.completion_order);
    assert_eq!(again.node_statuses, summary.node_statuses);

    // Re-persisting the same events is absorbed by the dedup key.
    for event in &stored {
        assert!(!checkpoints.append(event).unwrap());
    }
}

#[tokio::test]
async fn duplicate_email_is_cancelled_without_alert() {
    let s = setup(fast_config(), registry_with(context_recommending(0.92, "low")), Arc::new(MemoryActionStore::new()));
    let email = invoice_email();
    let first = s.pipeline.process(&email, None).await.unwrap();
    let second = s.pipeline.process(&email, None).await.unwrap();

    assert_eq!(first.report.status, GraphStatus::Success);
    assert_eq!(second.report.status, GraphStatus::Cancelled);
    assert_ne!(first.report.execution_id, second.report.execution_id);
    assert!(second.report.node_statuses.values().all(|s| *s == NodeStatus::Skipped));

    s.recorder.flush().await;
    let events = s.recorder.events(&second.report.execution_id);
    assert!(events.iter().any(|e| e.event_type == CheckpointEventType::GraphCancelled));
    assert!(events.iter().all(|e| e.event_type != CheckpointEventType::CriticalFailure));
}

#[tokio::test]
async fn sla_breach_cancels_with_timeout() {
    let mut config = fast_config();
    config.orchestrator.sla_secs = 1;
    for agent_type in AgentType::ALL {
        config.agents.policy_mut(agent_type).timeout_ms = 5_000;
    }
    let mut registry = registry_with(context_recommending(0.92, "low"));
    registry.register(ScriptedAgent::hanging(AgentType::Deadline));
    let s = setup(config, registry, Arc::new(MemoryActionStore::new()));

    let outcome = s.pipeline.process(&shift_question(), None).await.unwrap();
    assert_eq!(outcome.report.status, GraphStatus::Cancelled);
    assert!(matches!(
        outcome.report.timeout_error(),
        Some(TriagentError::OrchestrationTimeout { sla_secs: 1, .. })
    ));
    assert_eq!(outcome.graph.node("deadline").unwrap().status(), NodeStatus::Skipped);
    assert!(outcome.actions.is_empty());
}

#[tokio::test]
async fn long_running_pipeline_keeps_checkpoints_out_of_memory() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("triagent.db");
    let checkpoints = Arc::new(CheckpointStore::open(&db).unwrap());
    let mut tools = ActionToolRegistry::new();
    tools.register(RecordingTool::succeeding(&["create_task"]));
    let (recorder, _) = CheckpointRecorder::spawn(Arc::new(EventBus::default()), Some(checkpoints.clone()));
    let pipeline = Pipeline::new(
        Arc::new(fast_config()),
        Arc::new(registry_with(context_recommending(0.92, "low"))),
        Arc::new(tools),
        Arc::new(MemoryActionStore::new()),
        recorder.clone(),
    )
    .unwrap();

    let mut last = None;
    for i in 0..20 {
        let mut mail = shift_question();
        mail.id = format!("msg-shift-{}", i);
        last = Some(pipeline.process(&mail, None).await.unwrap());
    }
    recorder.flush().await;

    assert!(recorder.log().is_empty());
    assert_eq!(checkpoints.executions().unwrap().len(), 20);
    let last = last.unwrap();
    let summary = replay(&recorder.events(&last.report.execution_id));
    assert_eq!(summary.completion_order, last.report.completion_order);
}

#[tokio::test]
async fn in_memory_checkpoints_are_bounded_and_forgettable() {
    let mut tools = ActionToolRegistry::new();
    tools.register(RecordingTool::succeeding(&["create_task"]));
    let (recorder, _) = CheckpointRecorder::spawn_with_retention(Arc::new(EventBus::default()), None, 5);
    let pipeline = Pipeline::new(
        Arc::new(fast_config()),
        Arc::new(registry_with(context_recommending(0.92, "low"))),
        Arc::new(tools),
        Arc::new(MemoryActionStore::new()),
        recorder.clone(),
    )
    .unwrap();

    let mut ids = Vec::new();
    for i in 0..20 {
        let mut mail = shift_question();
        mail.id = format!("msg-shift-{}", i);
        ids.push(pipeline.process(&mail, None).await.unwrap().report.execution_id);
    }
    recorder.flush().await;
    assert_eq!(recorder.log().execution_ids().len(), 5);
    assert!(recorder.events(&ids[0]).is_empty());

    for id in &ids {
        recorder.forget(id);
    }
    recorder.flush().await;
    assert!(recorder.log().is_empty());
}
