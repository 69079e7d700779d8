use futures::future::BoxFuture;
use tracing::debug;

use triagent_core::error::{Result, TriagentError};
use triagent_core::traits::AgentExecutor;
use triagent_core::types::{AgentInput, AgentOutput, AgentType};

/// Runs one analysis stage on a remote model service.
///
/// The service receives the `AgentInput` as JSON and answers with an
/// `AgentOutput`. HTTP 503 means the model cannot serve the request and is
/// reported as unavailability, which is never retried. Request timeouts are
/// left to the orchestrator's per-node timeout.
pub struct HttpAgentExecutor {
    agent_type: AgentType,
    endpoint: String,
    model: String,
    client: reqwest::Client,
}

impl HttpAgentExecutor {
    pub fn new(agent_type: AgentType, endpoint: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TriagentError::Http(e.to_string()))?;
        Ok(Self {
            agent_type,
            endpoint: endpoint.into(),
            model: model.into(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Map a response status and body into the executor contract.
fn into_agent_output(
    agent_type: AgentType,
    model: &str,
    status: u16,
    body: &str,
) -> Result<AgentOutput> {
    let agent = agent_type.to_string();
    match status {
        200..=299 => {}
        503 => {
            return Err(TriagentError::AgentUnavailable {
                agent,
                reason: format!("model {} unavailable: {}", model, truncate(body)),
            })
        }
        _ => {
            return Err(TriagentError::AgentExecution {
                agent,
                message: format!("HTTP {}: {}", status, truncate(body)),
            })
        }
    }

    let mut output: AgentOutput = serde_json::from_str(body).map_err(|e| TriagentError::AgentExecution {
        agent: agent.clone(),
        message: format!("invalid output: {}", e),
    })?;

    if output.agent_type != agent_type {
        return Err(TriagentError::AgentExecution {
            agent,
            message: format!("service answered as {}", output.agent_type),
        });
    }
    if output.model_used.is_empty() {
        output.model_used = model.to_string();
    }
    Ok(output.clamped())
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

impl AgentExecutor for HttpAgentExecutor {
    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn execute(&self, input: AgentInput) -> BoxFuture<'_, Result<AgentOutput>> {
        Box::pin(async move {
            debug!(agent = %self.agent_type, endpoint = %self.endpoint, attempt = input.attempt, "Calling remote stage");
            let response = self
                .client
                .post(&self.endpoint)
                .json(&input)
                .send()
                .await
                .map_err(|e| TriagentError::Http(e.to_string()))?;

            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| TriagentError::Http(e.to_string()))?;
            into_agent_output(self.agent_type, &self.model, status, &body)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_unavailable_is_not_retryable() {
        let err = into_agent_output(AgentType::Vision, "vision-v2", 503, "overloaded").unwrap_err();
        assert!(err.is_unavailable());
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_error_is_retryable() {
        let err = into_agent_output(AgentType::Task, "task-v1", 500, "").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn decodes_and_clamps_output() {
        let body = r#"{"agent_type":"deadline","findings":{"due":"2026-03-06"},"confidence":1.4}"#;
        let out = into_agent_output(AgentType::Deadline, "deadline-v1", 200, body).unwrap();
        assert_eq!(out.confidence, 1.0);
        assert_eq!(out.model_used, "deadline-v1");
        assert_eq!(out.findings["due"], "2026-03-06");
    }

    #[test]
    fn rejects_output_for_another_stage() {
        let body = r#"{"agent_type":"task","confidence":0.5}"#;
        assert!(into_agent_output(AgentType::Deadline, "m", 200, body).is_err());
    }
}
