use futures::future::BoxFuture;
use tracing::info;

use triagent_core::error::Result;
use triagent_core::traits::ActionTool;
use triagent_core::types::ToolResult;

/// Logs the action and reports success without any side effect.
///
/// The external id is derived from the idempotency key, so repeated calls
/// for the same recommendation report the same id.
pub struct DryRunTool {
    action_types: Vec<String>,
}

impl DryRunTool {
    pub fn new(action_types: Vec<String>) -> Self {
        Self { action_types }
    }

    /// Handles the action types the context stage emits by default.
    pub fn standard() -> Self {
        Self::new(
            ["create_task", "schedule_event", "send_notification"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

impl ActionTool for DryRunTool {
    fn name(&self) -> &str {
        "dry_run"
    }

    fn action_types(&self) -> Vec<String> {
        self.action_types.clone()
    }

    fn execute(
        &self,
        action_type: &str,
        payload: serde_json::Value,
        idempotency_key: String,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        let action_type = action_type.to_string();
        Box::pin(async move {
            info!(
                action_type = %action_type,
                idempotency_key = %idempotency_key,
                payload = %payload,
                "Dry-run action"
            );
            Ok(ToolResult::ok(format!("dry-run:{}", idempotency_key)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn external_id_is_stable() {
        let tool = DryRunTool::standard();
        let a = tool
            .execute("create_task", serde_json::json!({}), "e1:2".into())
            .await
            .unwrap();
        let b = tool
            .execute("create_task", serde_json::json!({}), "e1:2".into())
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.external_id.as_deref(), Some("dry-run:e1:2"));
    }
}
