use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::{Result, TriagentError};

/// Unique identifier of one email processing attempt (and its graph).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Email ───────────────────────────────────────────────────────

/// Attachment metadata carried with an email. Content is never loaded here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub size: u64,
}

/// An inbound email. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub id: String,
    pub subject: String,
    #[serde(default)]
    pub sender: String,
    pub body: String,
    pub has_attachments: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub arrival_time: DateTime<Utc>,
}

impl Email {
    /// Reject input that must never reach the orchestrator.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(TriagentError::GraphConstruction(
                "email id must not be empty".into(),
            ));
        }
        if self.subject.trim().is_empty() && self.body.trim().is_empty() {
            return Err(TriagentError::GraphConstruction(format!(
                "email {} has neither subject nor body",
                self.id
            )));
        }
        if !self.has_attachments && !self.attachments.is_empty() {
            return Err(TriagentError::GraphConstruction(format!(
                "email {} lists {} attachments but has_attachments is false",
                self.id,
                self.attachments.len()
            )));
        }
        Ok(())
    }
}

/// Cheap pre-classification available before the graph is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriageHint {
    #[serde(default)]
    pub requires_vision: bool,
    #[serde(default)]
    pub category: Option<String>,
}

// ── Agents ──────────────────────────────────────────────────────

/// The analysis stages an execution graph is built from.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Triage,
    Vision,
    Deadline,
    Task,
    Context,
}

impl AgentType {
    pub const ALL: [AgentType; 5] = [
        AgentType::Triage,
        AgentType::Vision,
        AgentType::Deadline,
        AgentType::Task,
        AgentType::Context,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Triage => "triage",
            AgentType::Vision => "vision",
            AgentType::Deadline => "deadline",
            AgentType::Task => "task",
            AgentType::Context => "context",
        }
    }

    /// Worker pool an agent of this type runs in.
    pub fn resource_class(&self) -> ResourceClass {
        match self {
            AgentType::Vision => ResourceClass::Gpu,
            _ => ResourceClass::Cpu,
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentType {
    type Err = TriagentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "triage" => Ok(AgentType::Triage),
            "vision" => Ok(AgentType::Vision),
            "deadline" => Ok(AgentType::Deadline),
            "task" => Ok(AgentType::Task),
            "context" => Ok(AgentType::Context),
            other => Err(TriagentError::Config(format!("unknown agent type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Cpu,
    Gpu,
}

// ── Statuses ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum NodeStatus {
    Pending = 0,
    Running = 1,
    Success = 2,
    Failed = 3,
    Skipped = 4,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Failed | NodeStatus::Skipped
        )
    }

    /// Whether `self -> next` moves forward. Terminal statuses never move.
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        match self {
            NodeStatus::Pending => next != NodeStatus::Pending,
            NodeStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => NodeStatus::Pending,
            1 => NodeStatus::Running,
            2 => NodeStatus::Success,
            3 => NodeStatus::Failed,
            _ => NodeStatus::Skipped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Success => "success",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum GraphStatus {
    Pending = 0,
    Running = 1,
    Success = 2,
    Failed = 3,
    Cancelled = 4,
}

impl GraphStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GraphStatus::Success | GraphStatus::Failed | GraphStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: GraphStatus) -> bool {
        match self {
            GraphStatus::Pending => next != GraphStatus::Pending,
            GraphStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => GraphStatus::Pending,
            1 => GraphStatus::Running,
            2 => GraphStatus::Success,
            3 => GraphStatus::Failed,
            _ => GraphStatus::Cancelled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GraphStatus::Pending => "pending",
            GraphStatus::Running => "running",
            GraphStatus::Success => "success",
            GraphStatus::Failed => "failed",
            GraphStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an execution was cancelled. Cancellation is never a critical failure.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CancelReason {
    SlaExceeded { sla_secs: u64 },
    DuplicateEmail { email_id: String },
    Requested { by: String },
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::SlaExceeded { sla_secs } => write!(f, "SLA of {}s exceeded", sla_secs),
            CancelReason::DuplicateEmail { email_id } => write!(f, "duplicate email {}", email_id),
            CancelReason::Requested { by } => write!(f, "cancelled by {}", by),
        }
    }
}

// ── Agent contract payloads ─────────────────────────────────────

/// Clamp a confidence score into [0, 1]. NaN becomes 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn deserialize_confidence<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    Ok(clamp_confidence(raw))
}

/// Result of one analysis stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent_type: AgentType,
    #[serde(default)]
    pub findings: serde_json::Map<String, serde_json::Value>,
    #[serde(deserialize_with = "deserialize_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub model_used: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentOutput {
    pub fn new(
        agent_type: AgentType,
        findings: serde_json::Map<String, serde_json::Value>,
        confidence: f64,
        model_used: impl Into<String>,
    ) -> Self {
        Self {
            agent_type,
            findings,
            confidence: clamp_confidence(confidence),
            model_used: model_used.into(),
            duration_ms: 0,
            error: None,
        }
    }

    /// A flagged-absent output recorded for a node that failed.
    pub fn failed(agent_type: AgentType, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            agent_type,
            findings: serde_json::Map::new(),
            confidence: 0.0,
            model_used: String::new(),
            duration_ms,
            error: Some(error.into()),
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Re-apply the confidence bound after an executor built the value by hand.
    pub fn clamped(mut self) -> Self {
        self.confidence = clamp_confidence(self.confidence);
        self
    }

    pub fn is_flagged_absent(&self) -> bool {
        self.error.is_some()
    }
}

/// Request passed to every analysis stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInput {
    pub email_id: String,
    pub execution_id: ExecutionId,
    /// Outputs of the node's dependencies, keyed by node id.
    #[serde(default)]
    pub upstream_outputs: BTreeMap<String, AgentOutput>,
    /// Dependencies that failed and are present only as flagged outputs.
    #[serde(default)]
    pub flagged_absent: Vec<String>,
    pub email: Email,
    #[serde(default)]
    pub model_variant: Option<String>,
    #[serde(default)]
    pub attempt: u32,
}

// ── Actions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    High,
}

impl<'de> Deserialize<'de> for RiskLevel {
    /// Anything other than "low" is treated as high risk.
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(RiskLevel::parse(&raw))
    }
}

impl RiskLevel {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("low") {
            RiskLevel::Low
        } else {
            RiskLevel::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::High => "high",
        }
    }
}

/// One recommended action synthesized by the Context stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecommendation {
    #[serde(rename = "type", alias = "action_type")]
    pub action_type: String,
    #[serde(default, alias = "data")]
    pub payload: serde_json::Value,
    pub confidence: f64,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionDecision {
    AutoExecuted,
    PendingConfirmation,
    ManualReview,
}

impl ActionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionDecision::AutoExecuted => "auto_executed",
            ActionDecision::PendingConfirmation => "pending_confirmation",
            ActionDecision::ManualReview => "manual_review",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "auto_executed" => Some(ActionDecision::AutoExecuted),
            "pending_confirmation" => Some(ActionDecision::PendingConfirmation),
            "manual_review" => Some(ActionDecision::ManualReview),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a routed recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// Not sent to any tool (awaiting confirmation or review).
    NotExecuted,
    Executed { external_id: Option<String> },
    Failed { error: String },
}

/// Result of the action-tool contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(external_id: impl Into<String>) -> Self {
        Self {
            success: true,
            external_id: Some(external_id.into()),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            external_id: None,
            error: Some(msg.into()),
        }
    }
}

/// The persisted routing result for one recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub execution_id: ExecutionId,
    pub recommendation_index: usize,
    pub action_type: String,
    pub decision: ActionDecision,
    pub outcome: ActionOutcome,
    pub confidence: f64,
    pub risk_level: RiskLevel,
    pub created_at: DateTime<Utc>,
}

impl ActionRecord {
    /// The key handed to action tools so retries never duplicate side effects.
    pub fn idempotency_key(execution_id: &ExecutionId, recommendation_index: usize) -> String {
        format!("{}:{}", execution_id, recommendation_index)
    }
}

// ── Checkpoints ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointEventType {
    GraphStarted,
    GraphSucceeded,
    GraphFailed,
    GraphCancelled,
    NodeStarted,
    NodeRetrying,
    NodeSucceeded,
    NodeFailed,
    NodeSkipped,
    CriticalFailure,
    ActionRouted,
}

impl CheckpointEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointEventType::GraphStarted => "graph_started",
            CheckpointEventType::GraphSucceeded => "graph_succeeded",
            CheckpointEventType::GraphFailed => "graph_failed",
            CheckpointEventType::GraphCancelled => "graph_cancelled",
            CheckpointEventType::NodeStarted => "node_started",
            CheckpointEventType::NodeRetrying => "node_retrying",
            CheckpointEventType::NodeSucceeded => "node_succeeded",
            CheckpointEventType::NodeFailed => "node_failed",
            CheckpointEventType::NodeSkipped => "node_skipped",
            CheckpointEventType::CriticalFailure => "critical_failure",
            CheckpointEventType::ActionRouted => "action_routed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let all = [
            CheckpointEventType::GraphStarted,
            CheckpointEventType::GraphSucceeded,
            CheckpointEventType::GraphFailed,
            CheckpointEventType::GraphCancelled,
            CheckpointEventType::NodeStarted,
            CheckpointEventType::NodeRetrying,
            CheckpointEventType::NodeSucceeded,
            CheckpointEventType::NodeFailed,
            CheckpointEventType::NodeSkipped,
            CheckpointEventType::CriticalFailure,
            CheckpointEventType::ActionRouted,
        ];
        all.into_iter().find(|t| t.as_str() == raw)
    }

    /// The node status this event moves a node into, if any.
    pub fn node_status(&self) -> Option<NodeStatus> {
        match self {
            CheckpointEventType::NodeStarted => Some(NodeStatus::Running),
            CheckpointEventType::NodeSucceeded => Some(NodeStatus::Success),
            CheckpointEventType::NodeFailed => Some(NodeStatus::Failed),
            CheckpointEventType::NodeSkipped => Some(NodeStatus::Skipped),
            _ => None,
        }
    }

    pub fn graph_status(&self) -> Option<GraphStatus> {
        match self {
            CheckpointEventType::GraphStarted => Some(GraphStatus::Running),
            CheckpointEventType::GraphSucceeded => Some(GraphStatus::Success),
            CheckpointEventType::GraphFailed => Some(GraphStatus::Failed),
            CheckpointEventType::GraphCancelled => Some(GraphStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for CheckpointEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEvent {
    pub execution_id: ExecutionId,
    #[serde(default)]
    pub node_id: Option<String>,
    pub event_type: CheckpointEventType,
    pub timestamp: DateTime<Utc>,
    /// Monotonic per node (per execution for graph-level events).
    pub sequence: u64,
    #[serde(default)]
    pub metrics: serde_json::Value,
    #[serde(default)]
    pub data_snapshot: serde_json::Value,
}

/// Identity used to drop duplicate deliveries of the same event.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct DedupKey {
    pub execution_id: ExecutionId,
    pub node_id: Option<String>,
    pub event_type: CheckpointEventType,
    pub sequence: u64,
}

impl CheckpointEvent {
    pub fn new(
        execution_id: ExecutionId,
        node_id: Option<String>,
        event_type: CheckpointEventType,
        sequence: u64,
    ) -> Self {
        Self {
            execution_id,
            node_id,
            event_type,
            timestamp: Utc::now(),
            sequence,
            metrics: serde_json::Value::Null,
            data_snapshot: serde_json::Value::Null,
        }
    }

    pub fn with_metrics(mut self, metrics: serde_json::Value) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_snapshot(mut self, snapshot: serde_json::Value) -> Self {
        self.data_snapshot = snapshot;
        self
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            execution_id: self.execution_id.clone(),
            node_id: self.node_id.clone(),
            event_type: self.event_type,
            sequence: self.sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(has_attachments: bool, attachments: Vec<Attachment>) -> Email {
        Email {
            id: "m-1".into(),
            subject: "Shift question".into(),
            sender: "gm@example.com".into(),
            body: "Can I swap Friday?".into(),
            has_attachments,
            attachments,
            arrival_time: Utc::now(),
        }
    }

    #[test]
    fn test_email_validation() {
        assert!(email(false, vec![]).validate().is_ok());

        let mut blank = email(false, vec![]);
        blank.id = "  ".into();
        assert!(matches!(
            blank.validate(),
            Err(TriagentError::GraphConstruction(_))
        ));

        let inconsistent = email(
            false,
            vec![Attachment {
                filename: "a.pdf".into(),
                content_type: "application/pdf".into(),
                size: 10,
            }],
        );
        assert!(inconsistent.validate().is_err());
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(clamp_confidence(1.7), 1.0);
        assert_eq!(clamp_confidence(-0.2), 0.0);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);

        let out: AgentOutput = serde_json::from_value(serde_json::json!({
            "agent_type": "triage",
            "confidence": 3.5,
        }))
        .unwrap();
        assert_eq!(out.confidence, 1.0);

        let built = AgentOutput::new(AgentType::Task, serde_json::Map::new(), -4.0, "m");
        assert_eq!(built.confidence, 0.0);
    }

    #[test]
    fn test_node_status_forward_only() {
        assert!(NodeStatus::Pending.can_transition_to(NodeStatus::Running));
        assert!(NodeStatus::Pending.can_transition_to(NodeStatus::Skipped));
        assert!(NodeStatus::Running.can_transition_to(NodeStatus::Success));
        assert!(!NodeStatus::Running.can_transition_to(NodeStatus::Pending));
        assert!(!NodeStatus::Success.can_transition_to(NodeStatus::Failed));
        assert!(!NodeStatus::Skipped.can_transition_to(NodeStatus::Running));
        assert!(!GraphStatus::Cancelled.can_transition_to(GraphStatus::Failed));
    }

    #[test]
    fn test_risk_level_parse() {
        let rec: ActionRecommendation = serde_json::from_value(serde_json::json!({
            "type": "create_task",
            "payload": {"title": "Order napkins"},
            "confidence": 0.8,
            "risk_level": "critical",
        }))
        .unwrap();
        assert_eq!(rec.risk_level, RiskLevel::High);
        assert_eq!(RiskLevel::parse("LOW"), RiskLevel::Low);
    }

    #[test]
    fn test_event_type_roundtrip_names() {
        for name in ["node_started", "graph_cancelled", "action_routed"] {
            let parsed = CheckpointEventType::parse(name).unwrap();
            assert_eq!(parsed.as_str(), name);
        }
        assert!(CheckpointEventType::parse("bogus").is_none());
    }
}
