//! Action router: gates the Context stage's recommendations.
//!
//! Each recommendation is sorted into one of three buckets: executed now,
//! held for confirmation, or sent to manual review. High risk overrides raw
//! confidence. Only auto-executed actions reach an action tool, and every
//! recommendation is persisted as an `ActionRecord` keyed by
//! `(execution_id, recommendation_index)` so routing an execution again never
//! repeats a side effect.
//!
//! When a tool is registered for `manual_review`, newly stored manual-review
//! records are also forwarded to it as a review queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use triagent_core::config::RouterConfig;
use triagent_core::error::{Result, TriagentError};
use triagent_core::types::{
    clamp_confidence, ActionDecision, ActionOutcome, ActionRecommendation, ActionRecord,
    AgentOutput, CheckpointEvent, CheckpointEventType, ExecutionId, GraphStatus, NodeStatus,
    RiskLevel,
};
use triagent_tools::ActionToolRegistry;

use crate::action_store::ActionStore;
use crate::checkpoint::CheckpointRecorder;
use crate::graph::ExecutionGraph;

/// Action type of the optional review-queue tool.
pub const REVIEW_QUEUE_ACTION: &str = "manual_review";

/// The gate. Pure: same inputs, same decision.
pub fn decide(confidence: f64, risk_level: RiskLevel, config: &RouterConfig) -> ActionDecision {
    match risk_level {
        RiskLevel::High if confidence >= config.high_risk_threshold => ActionDecision::AutoExecuted,
        RiskLevel::High => ActionDecision::ManualReview,
        RiskLevel::Low if confidence >= config.auto_threshold => ActionDecision::AutoExecuted,
        RiskLevel::Low if confidence >= config.confirm_threshold => ActionDecision::PendingConfirmation,
        RiskLevel::Low => ActionDecision::ManualReview,
    }
}

#[derive(Deserialize)]
struct RawRecommendation {
    #[serde(default, rename = "type", alias = "action_type")]
    action_type: Option<String>,
    #[serde(default, alias = "data")]
    payload: serde_json::Value,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    risk_level: Option<String>,
}

/// A recommendation as read from the Context output. `None` marks an entry
/// that could not be read; it keeps its index and goes to manual review.
pub type ParsedRecommendation = Option<ActionRecommendation>;

/// Read `findings.recommendations`. Missing confidence inherits the output's
/// confidence; missing or unrecognised risk is high.
pub fn parse_recommendations(output: &AgentOutput) -> Vec<ParsedRecommendation> {
    let Some(items) = output.findings.get("recommendations").and_then(|r| r.as_array()) else {
        return Vec::new();
    };

    items
        .iter()
        .map(|item| {
            let raw: RawRecommendation = serde_json::from_value(item.clone()).ok()?;
            let action_type = raw.action_type.filter(|t| !t.trim().is_empty())?;
            Some(ActionRecommendation {
                action_type,
                payload: raw.payload,
                confidence: clamp_confidence(raw.confidence.unwrap_or(output.confidence)),
                risk_level: raw
                    .risk_level
                    .as_deref()
                    .map(RiskLevel::parse)
                    .unwrap_or(RiskLevel::High),
            })
        })
        .collect()
}

pub struct ActionRouter {
    config: RouterConfig,
    tools: Arc<ActionToolRegistry>,
    store: Arc<dyn ActionStore>,
    recorder: Option<CheckpointRecorder>,
    high_risk: Option<Regex>,
    locks: Mutex<HashMap<ExecutionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ActionRouter {
    pub fn new(
        config: RouterConfig,
        tools: Arc<ActionToolRegistry>,
        store: Arc<dyn ActionStore>,
        recorder: Option<CheckpointRecorder>,
    ) -> Result<Self> {
        let keywords: Vec<String> = config
            .high_risk_keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(regex::escape)
            .collect();
        let high_risk = if keywords.is_empty() {
            None
        } else {
            let pattern = format!(r"(?i)\b(?:{})\b", keywords.join("|"));
            Some(Regex::new(&pattern).map_err(|e| {
                TriagentError::Config(format!("invalid high-risk keyword pattern: {}", e))
            })?)
        };

        Ok(Self {
            config,
            tools,
            store,
            recorder,
            high_risk,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Route the recommendations of a succeeded execution.
    ///
    /// Failed and cancelled executions are refused with `NotRoutable`.
    pub async fn route(&self, graph: &ExecutionGraph) -> Result<Vec<ActionRecord>> {
        let status = graph.status();
        let not_routable = || TriagentError::NotRoutable {
            execution_id: graph.id().to_string(),
            status: status.to_string(),
        };
        if status != GraphStatus::Success {
            return Err(not_routable());
        }
        let output = graph
            .context_node()
            .filter(|n| n.status() == NodeStatus::Success)
            .and_then(|n| n.output())
            .ok_or_else(not_routable)?;

        let lock = self.execution_lock(graph.id());
        let records = {
            let _guard = lock.lock().await;
            self.route_output(graph.id(), output).await
        };
        self.release_lock(graph.id(), lock);
        records
    }

    /// Previously stored records for an execution.
    pub fn records(&self, execution_id: &ExecutionId) -> Result<Vec<ActionRecord>> {
        self.store.list(execution_id)
    }

    async fn route_output(&self, execution_id: &ExecutionId, output: &AgentOutput) -> Result<Vec<ActionRecord>> {
        let synthesis_escalates = output
            .findings
            .get("synthesis")
            .and_then(|s| s.as_str())
            .is_some_and(|s| self.mentions_high_risk(s));

        let recommendations = parse_recommendations(output);
        let mut records = Vec::with_capacity(recommendations.len());

        for (index, recommendation) in recommendations.into_iter().enumerate() {
            if let Some(prior) = self.store.get(execution_id, index)? {
                debug!(execution_id = %execution_id, index, decision = %prior.decision, "Recommendation already routed");
                records.push(prior);
                continue;
            }

            let (record, payload) = match recommendation {
                Some(rec) => {
                    let escalated = synthesis_escalates || self.mentions_high_risk(&rec.payload.to_string());
                    let risk_level = if escalated { RiskLevel::High } else { rec.risk_level };
                    let payload = rec.payload.clone();
                    (self.route_one(execution_id, index, rec, risk_level).await, payload)
                }
                None => {
                    warn!(execution_id = %execution_id, index, "Unreadable recommendation sent to manual review");
                    let record = ActionRecord {
                        execution_id: execution_id.clone(),
                        recommendation_index: index,
                        action_type: "unknown".into(),
                        decision: ActionDecision::ManualReview,
                        outcome: ActionOutcome::NotExecuted,
                        confidence: 0.0,
                        risk_level: RiskLevel::High,
                        created_at: Utc::now(),
                    };
                    (record, serde_json::Value::Null)
                }
            };

            if !self.store.put(&record)? {
                // Another router stored this key first; its record stands.
                if let Some(prior) = self.store.get(execution_id, index)? {
                    records.push(prior);
                    continue;
                }
            }
            self.record_checkpoint(&record);
            if record.decision == ActionDecision::ManualReview {
                self.send_to_review(&record, payload).await;
            }
            records.push(record);
        }
        Ok(records)
    }

    async fn route_one(
        &self,
        execution_id: &ExecutionId,
        index: usize,
        rec: ActionRecommendation,
        risk_level: RiskLevel,
    ) -> ActionRecord {
        let decision = decide(rec.confidence, risk_level, &self.config);
        let (decision, outcome) = match decision {
            ActionDecision::AutoExecuted => {
                let key = ActionRecord::idempotency_key(execution_id, index);
                match self.tools.execute(&rec.action_type, rec.payload.clone(), key).await {
                    Ok(result) if result.success => (
                        ActionDecision::AutoExecuted,
                        ActionOutcome::Executed {
                            external_id: result.external_id,
                        },
                    ),
                    Ok(result) => {
                        let error = result.error.unwrap_or_else(|| "tool reported failure".into());
                        warn!(execution_id = %execution_id, index, action_type = %rec.action_type, error = %error, "Action tool failed, sending to manual review");
                        (ActionDecision::ManualReview, ActionOutcome::Failed { error })
                    }
                    Err(e) => {
                        warn!(execution_id = %execution_id, index, action_type = %rec.action_type, error = %e, "Action tool failed, sending to manual review");
                        (
                            ActionDecision::ManualReview,
                            ActionOutcome::Failed {
                                error: e.to_string(),
                            },
                        )
                    }
                }
            }
            other => (other, ActionOutcome::NotExecuted),
        };

        info!(
            execution_id = %execution_id,
            index,
            action_type = %rec.action_type,
            confidence = rec.confidence,
            risk = risk_level.as_str(),
            decision = %decision,
            "Routed recommendation"
        );

        ActionRecord {
            execution_id: execution_id.clone(),
            recommendation_index: index,
            action_type: rec.action_type,
            decision,
            outcome,
            confidence: rec.confidence,
            risk_level,
            created_at: Utc::now(),
        }
    }

    /// Forward a manual-review record to the review queue, if one is registered.
    /// Queue failures are logged; the stored record is unaffected.
    async fn send_to_review(&self, record: &ActionRecord, payload: serde_json::Value) {
        if self.tools.get(REVIEW_QUEUE_ACTION).is_none() {
            return;
        }
        let key = format!(
            "{}:review",
            ActionRecord::idempotency_key(&record.execution_id, record.recommendation_index)
        );
        let item = json!({
            "record": record,
            "payload": payload,
        });
        match self.tools.execute(REVIEW_QUEUE_ACTION, item, key).await {
            Ok(result) if result.success => {
                debug!(execution_id = %record.execution_id, index = record.recommendation_index, "Queued for manual review");
            }
            Ok(result) => {
                warn!(
                    execution_id = %record.execution_id,
                    index = record.recommendation_index,
                    error = result.error.as_deref().unwrap_or("review queue reported failure"),
                    "Review queue rejected item"
                );
            }
            Err(e) => {
                warn!(execution_id = %record.execution_id, index = record.recommendation_index, error = %e, "Review queue unavailable");
            }
        }
    }

    fn mentions_high_risk(&self, text: &str) -> bool {
        self.high_risk.as_ref().is_some_and(|re| re.is_match(text))
    }

    fn record_checkpoint(&self, record: &ActionRecord) {
        let Some(recorder) = &self.recorder else {
            return;
        };
        recorder.record(
            CheckpointEvent::new(
                record.execution_id.clone(),
                None,
                CheckpointEventType::ActionRouted,
                record.recommendation_index as u64,
            )
            .with_metrics(json!({
                "decision": record.decision,
                "confidence": record.confidence,
                "risk_level": record.risk_level,
            }))
            .with_snapshot(serde_json::to_value(record).unwrap_or_default()),
        );
    }

    fn execution_lock(&self, execution_id: &ExecutionId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(execution_id.clone()).or_default().clone()
    }

    fn release_lock(&self, execution_id: &ExecutionId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // One reference in the map, one held here: nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(execution_id);
        }
    }
}
