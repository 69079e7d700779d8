use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use triagent_core::config::ToolsConfig;
use triagent_core::error::{Result, TriagentError};
use triagent_core::traits::ActionTool;
use triagent_core::types::ToolResult;

use crate::builtin::{DryRunTool, HttpActionTool};

/// Registry of action tools, keyed by the action type they handle.
pub struct ActionToolRegistry {
    tools: HashMap<String, Arc<dyn ActionTool>>,
}

impl ActionToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool for every action type it declares.
    pub fn register(&mut self, tool: impl ActionTool) {
        let tool: Arc<dyn ActionTool> = Arc::new(tool);
        for action_type in tool.action_types() {
            debug!(tool = tool.name(), action_type = %action_type, "Registered action tool");
            self.tools.insert(action_type, tool.clone());
        }
    }

    /// Unregister the tool for an action type.
    pub fn unregister(&mut self, action_type: &str) -> bool {
        self.tools.remove(action_type).is_some()
    }

    /// Get the tool for an action type.
    pub fn get(&self, action_type: &str) -> Option<Arc<dyn ActionTool>> {
        self.tools.get(action_type).cloned()
    }

    /// List all action types with a tool.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// Execute the tool registered for `action_type`, bounded by the tool's timeout.
    pub async fn execute(
        &self,
        action_type: &str,
        payload: serde_json::Value,
        idempotency_key: String,
    ) -> Result<ToolResult> {
        let tool = self
            .get(action_type)
            .ok_or_else(|| TriagentError::ToolNotFound(action_type.to_string()))?;

        let timeout = std::time::Duration::from_secs(tool.timeout_secs());

        match tokio::time::timeout(timeout, tool.execute(action_type, payload, idempotency_key))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(TriagentError::ActionExecution {
                action_type: action_type.to_string(),
                message: format!("tool {} timed out after {}s", tool.name(), tool.timeout_secs()),
            }),
        }
    }

    /// Build a registry from configuration: one HTTP tool per configured
    /// endpoint, plus a dry-run tool for the standard action types when enabled.
    pub fn from_config(config: &ToolsConfig) -> Result<Self> {
        let mut registry = Self::new();

        if config.dry_run {
            registry.register(DryRunTool::standard());
        }

        let mut endpoints: Vec<(&String, &String)> = config.endpoints.iter().collect();
        endpoints.sort();
        for (action_type, endpoint) in endpoints {
            registry.register(HttpActionTool::new(action_type.clone(), endpoint.clone())?);
        }

        Ok(registry)
    }
}

impl Default for ActionToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triagent_test_utils::RecordingTool;

    #[tokio::test]
    async fn execute_routes_by_action_type() {
        let tool = RecordingTool::succeeding(&["create_task"]);
        let calls = tool.calls();
        let mut registry = ActionToolRegistry::new();
        registry.register(tool);

        let result = registry
            .execute("create_task", serde_json::json!({"title": "x"}), "e1:0".into())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(calls.lock().unwrap()[0].idempotency_key, "e1:0");
    }

    #[tokio::test]
    async fn missing_tool_is_error() {
        let registry = ActionToolRegistry::new();
        let result = registry
            .execute("schedule_event", serde_json::json!({}), "e1:0".into())
            .await;
        assert!(matches!(result, Err(TriagentError::ToolNotFound(_))));
    }

    #[test]
    fn from_config_registers_dry_run_and_endpoints() {
        let mut config = ToolsConfig::default();
        config.dry_run = true;
        config
            .endpoints
            .insert("send_notification".into(), "http://localhost:9/notify".into());
        let registry = ActionToolRegistry::from_config(&config).unwrap();
        assert!(registry.get("create_task").is_some());
        assert_eq!(
            registry.get("send_notification").unwrap().name(),
            "http:send_notification"
        );
    }
}
