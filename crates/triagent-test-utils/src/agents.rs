use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use triagent_core::error::{Result, TriagentError};
use triagent_core::traits::AgentExecutor;
use triagent_core::types::{AgentInput, AgentOutput, AgentType};

/// One scripted response of a `ScriptedAgent`.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return an output with this confidence and findings.
    Succeed {
        confidence: f64,
        findings: serde_json::Value,
    },
    /// Sleep, then succeed with confidence 0.9.
    Delay(Duration),
    /// Return a retryable execution error.
    Fail(String),
    /// Return an explicit unavailability error.
    Unavailable(String),
    /// Never return (exercises timeouts and cancellation).
    Hang,
}

impl Step {
    pub fn ok(confidence: f64) -> Self {
        Step::Succeed {
            confidence,
            findings: serde_json::json!({}),
        }
    }

    pub fn with_findings(confidence: f64, findings: serde_json::Value) -> Self {
        Step::Succeed {
            confidence,
            findings,
        }
    }
}

/// Agent executor that plays back a script, then repeats its fallback step.
pub struct ScriptedAgent {
    agent_type: AgentType,
    model: String,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: Arc<AtomicUsize>,
    inputs: Arc<Mutex<Vec<AgentInput>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl ScriptedAgent {
    pub fn new(agent_type: AgentType, script: Vec<Step>, fallback: Step) -> Self {
        Self {
            agent_type,
            model: format!("scripted-{}", agent_type),
            script: Mutex::new(script.into()),
            fallback,
            calls: Arc::new(AtomicUsize::new(0)),
            inputs: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Always succeeds with the given confidence.
    pub fn succeeding(agent_type: AgentType, confidence: f64) -> Self {
        Self::new(agent_type, vec![], Step::ok(confidence))
    }

    /// Always succeeds with the given findings.
    pub fn with_findings(agent_type: AgentType, confidence: f64, findings: serde_json::Value) -> Self {
        Self::new(agent_type, vec![], Step::with_findings(confidence, findings))
    }

    /// Always fails with a retryable error.
    pub fn failing(agent_type: AgentType, msg: &str) -> Self {
        Self::new(agent_type, vec![], Step::Fail(msg.to_string()))
    }

    /// Always reports unavailability.
    pub fn unavailable(agent_type: AgentType, msg: &str) -> Self {
        Self::new(agent_type, vec![], Step::Unavailable(msg.to_string()))
    }

    /// Never returns.
    pub fn hanging(agent_type: AgentType) -> Self {
        Self::new(agent_type, vec![], Step::Hang)
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Shared call counter (survives moving the agent into a registry).
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Shared log of received inputs.
    pub fn inputs(&self) -> Arc<Mutex<Vec<AgentInput>>> {
        self.inputs.clone()
    }

    /// Highest number of simultaneously running calls observed.
    pub fn max_in_flight(&self) -> Arc<AtomicUsize> {
        self.max_in_flight.clone()
    }

    fn next_step(&self) -> Step {
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AgentExecutor for ScriptedAgent {
    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn execute(&self, input: AgentInput) -> BoxFuture<'_, Result<AgentOutput>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs.lock().expect("inputs lock").push(input);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlightGuard(self.in_flight.clone());

            let agent = self.agent_type.to_string();
            match self.next_step() {
                Step::Succeed {
                    confidence,
                    findings,
                } => {
                    let findings = findings.as_object().cloned().unwrap_or_default();
                    Ok(AgentOutput::new(self.agent_type, findings, confidence, &self.model))
                }
                Step::Delay(d) => {
                    tokio::time::sleep(d).await;
                    Ok(AgentOutput::new(
                        self.agent_type,
                        serde_json::Map::new(),
                        0.9,
                        &self.model,
                    ))
                }
                Step::Fail(message) => Err(TriagentError::AgentExecution { agent, message }),
                Step::Unavailable(reason) => Err(TriagentError::AgentUnavailable { agent, reason }),
                Step::Hang => futures::future::pending::<Result<AgentOutput>>().await,
            }
        })
    }
}
