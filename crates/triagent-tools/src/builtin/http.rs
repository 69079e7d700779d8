use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use triagent_core::error::{Result, TriagentError};
use triagent_core::traits::ActionTool;
use triagent_core::types::ToolResult;

/// Forwards one action type to an HTTP endpoint.
///
/// The idempotency key is sent both in the body and as an `Idempotency-Key`
/// header so the receiving service can drop repeats.
pub struct HttpActionTool {
    name: String,
    action_type: String,
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ActionRequest<'a> {
    action_type: &'a str,
    payload: &'a serde_json::Value,
    idempotency_key: &'a str,
}

#[derive(Deserialize)]
struct ActionResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default, alias = "id")]
    external_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpActionTool {
    pub fn new(action_type: impl Into<String>, endpoint: impl Into<String>) -> Result<Self> {
        let action_type = action_type.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TriagentError::Http(e.to_string()))?;
        Ok(Self {
            name: format!("http:{}", action_type),
            action_type,
            endpoint: endpoint.into(),
            client,
        })
    }
}

/// Map an HTTP status and decoded body into the action-tool contract.
fn into_tool_result(status: u16, body: Option<ActionResponse>) -> ToolResult {
    let ok_status = (200..300).contains(&status);
    match body {
        Some(resp) => {
            let success = resp.success.unwrap_or(ok_status) && ok_status;
            ToolResult {
                success,
                external_id: if success { resp.external_id } else { None },
                error: if success {
                    None
                } else {
                    Some(resp.error.unwrap_or_else(|| format!("HTTP {}", status)))
                },
            }
        }
        None if ok_status => ToolResult {
            success: true,
            external_id: None,
            error: None,
        },
        None => ToolResult::error(format!("HTTP {}", status)),
    }
}

impl ActionTool for HttpActionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn action_types(&self) -> Vec<String> {
        vec![self.action_type.clone()]
    }

    fn execute(
        &self,
        action_type: &str,
        payload: serde_json::Value,
        idempotency_key: String,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        let action_type = action_type.to_string();
        Box::pin(async move {
            let request = ActionRequest {
                action_type: &action_type,
                payload: &payload,
                idempotency_key: &idempotency_key,
            };

            let response = self
                .client
                .post(&self.endpoint)
                .header("Idempotency-Key", &idempotency_key)
                .json(&request)
                .send()
                .await
                .map_err(|e| TriagentError::ActionExecution {
                    action_type: action_type.clone(),
                    message: e.to_string(),
                })?;

            let status = response.status().as_u16();
            let body = response.json::<ActionResponse>().await.ok();
            let result = into_tool_result(status, body);

            if result.success {
                debug!(action_type = %action_type, status, "Action tool call succeeded");
            } else {
                warn!(action_type = %action_type, status, error = ?result.error, "Action tool call failed");
            }
            Ok(result)
        })
    }
}
