use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use triagent_core::config::AgentsConfig;
use triagent_core::error::{Result, TriagentError};
use triagent_core::traits::AgentExecutor;
use triagent_core::types::{AgentInput, AgentOutput, AgentType};

use crate::remote::HttpAgentExecutor;

/// One registered executor for an agent type.
#[derive(Clone)]
pub struct RegistryEntry {
    pub executor: Arc<dyn AgentExecutor>,
    /// Model variant this executor serves; `None` is the default for its type.
    pub variant: Option<String>,
    pub fallback_allowed: bool,
}

/// Maps agent types to executors.
///
/// Whether a stage may be served by anything other than the executor that was
/// asked for is a per-type flag. When it is off, the registry reports the stage
/// unavailable instead of substituting.
pub struct AgentRegistry {
    entries: HashMap<AgentType, Vec<RegistryEntry>>,
    fallback_allowed: HashMap<AgentType, bool>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        let fallback_allowed = AgentType::ALL
            .into_iter()
            .map(|t| (t, t != AgentType::Context))
            .collect();
        Self {
            entries: HashMap::new(),
            fallback_allowed,
        }
    }

    /// Start from the per-type `fallback_allowed` flags in configuration.
    pub fn with_policies(agents: &AgentsConfig) -> Self {
        let mut registry = Self::new();
        for agent_type in AgentType::ALL {
            registry.set_fallback_allowed(agent_type, agents.policy(agent_type).fallback_allowed);
        }
        registry
    }

    /// Build HTTP executors for every agent type with a configured endpoint.
    pub fn from_config(agents: &AgentsConfig) -> Result<Self> {
        let mut registry = Self::with_policies(agents);
        for agent_type in AgentType::ALL {
            let policy = agents.policy(agent_type);
            if let Some(endpoint) = &policy.endpoint {
                let model = policy.model.clone().unwrap_or_else(|| agent_type.to_string());
                registry.register(HttpAgentExecutor::new(agent_type, endpoint.clone(), model)?);
            }
        }
        Ok(registry)
    }

    pub fn fallback_allowed(&self, agent_type: AgentType) -> bool {
        self.fallback_allowed.get(&agent_type).copied().unwrap_or(false)
    }

    pub fn set_fallback_allowed(&mut self, agent_type: AgentType, allowed: bool) {
        self.fallback_allowed.insert(agent_type, allowed);
        if let Some(entries) = self.entries.get_mut(&agent_type) {
            for entry in entries {
                entry.fallback_allowed = allowed;
            }
        }
    }

    /// Register the default executor for its agent type, replacing any previous default.
    pub fn register(&mut self, executor: impl AgentExecutor) {
        self.insert(Arc::new(executor), None);
    }

    /// Register an executor for a specific model variant.
    pub fn register_variant(&mut self, variant: impl Into<String>, executor: impl AgentExecutor) {
        self.insert(Arc::new(executor), Some(variant.into()));
    }

    /// Register a primary executor with ordered fallbacks behind it.
    pub fn register_with_fallbacks(
        &mut self,
        primary: Arc<dyn AgentExecutor>,
        fallbacks: Vec<Arc<dyn AgentExecutor>>,
    ) {
        let agent_type = primary.agent_type();
        let executor = FallbackExecutor::new(primary, fallbacks, self.fallback_allowed(agent_type));
        self.insert(Arc::new(executor), None);
    }

    fn insert(&mut self, executor: Arc<dyn AgentExecutor>, variant: Option<String>) {
        let agent_type = executor.agent_type();
        debug!(
            agent = %agent_type,
            model = executor.model(),
            variant = variant.as_deref().unwrap_or("default"),
            "Registered agent executor"
        );
        let entry = RegistryEntry {
            executor,
            variant,
            fallback_allowed: self.fallback_allowed(agent_type),
        };
        let entries = self.entries.entry(agent_type).or_default();
        entries.retain(|e| e.variant != entry.variant);
        entries.push(entry);
    }

    /// Find the executor for a stage, optionally for a specific model variant.
    ///
    /// A variant matches an entry registered under that name or an executor
    /// serving that model. A missing variant is served by the default executor
    /// only when fallback is allowed for the type.
    pub fn resolve(&self, agent_type: AgentType, variant: Option<&str>) -> Result<Arc<dyn AgentExecutor>> {
        let entries = self
            .entries
            .get(&agent_type)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| TriagentError::AgentNotRegistered(agent_type.to_string()))?;

        let default = entries.iter().find(|e| e.variant.is_none());
        let Some(wanted) = variant else {
            return default
                .or_else(|| entries.first())
                .map(|e| e.executor.clone())
                .ok_or_else(|| TriagentError::AgentNotRegistered(agent_type.to_string()));
        };

        if let Some(exact) = entries
            .iter()
            .find(|e| e.variant.as_deref() == Some(wanted) || e.executor.model() == wanted)
        {
            return Ok(exact.executor.clone());
        }

        match default {
            Some(entry) if entry.fallback_allowed => {
                warn!(agent = %agent_type, variant = wanted, model = entry.executor.model(), "Model variant not registered, using default executor");
                Ok(entry.executor.clone())
            }
            _ => Err(TriagentError::AgentUnavailable {
                agent: agent_type.to_string(),
                reason: format!("model variant {} is not registered and fallback is not allowed", wanted),
            }),
        }
    }

    pub fn registered_types(&self) -> Vec<AgentType> {
        let mut types: Vec<AgentType> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.is_empty())
            .map(|(t, _)| *t)
            .collect();
        types.sort();
        types
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// An executor that falls back to alternative executors when the primary is
/// unavailable.
///
/// With `fallback_allowed` off, primary unavailability is reported as is and
/// no fallback is called.
pub struct FallbackExecutor {
    agent_type: AgentType,
    primary: Arc<dyn AgentExecutor>,
    fallbacks: Vec<Arc<dyn AgentExecutor>>,
    fallback_allowed: bool,
}

impl FallbackExecutor {
    pub fn new(
        primary: Arc<dyn AgentExecutor>,
        fallbacks: Vec<Arc<dyn AgentExecutor>>,
        fallback_allowed: bool,
    ) -> Self {
        Self {
            agent_type: primary.agent_type(),
            primary,
            fallbacks,
            fallback_allowed,
        }
    }
}

impl AgentExecutor for FallbackExecutor {
    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    fn model(&self) -> &str {
        self.primary.model()
    }

    fn execute(&self, input: AgentInput) -> BoxFuture<'_, Result<AgentOutput>> {
        Box::pin(async move {
            let err = match self.primary.execute(input.clone()).await {
                Ok(output) => return Ok(output),
                Err(e) => e,
            };

            // Other errors are left to the caller's retry policy.
            if !err.is_unavailable() || self.fallbacks.is_empty() {
                return Err(err);
            }
            if !self.fallback_allowed {
                warn!(agent = %self.agent_type, model = self.primary.model(), error = %err, "Primary executor unavailable; fallback not allowed");
                return Err(TriagentError::AgentUnavailable {
                    agent: self.agent_type.to_string(),
                    reason: format!(
                        "{} unavailable and fallback is not allowed: {}",
                        self.primary.model(),
                        err
                    ),
                });
            }

            info!(agent = %self.agent_type, error = %err, "Primary executor unavailable, trying fallbacks");
            let mut last_err = err;
            for fallback in &self.fallbacks {
                match fallback.execute(input.clone()).await {
                    Ok(output) => {
                        info!(agent = %self.agent_type, model = fallback.model(), "Fell back to alternative executor");
                        return Ok(output);
                    }
                    Err(e) => {
                        warn!(agent = %self.agent_type, model = fallback.model(), error = %e, "Fallback executor also failed");
                        last_err = e;
                    }
                }
            }
            Err(last_err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use triagent_core::types::ExecutionId;
    use triagent_test_utils::fixtures::shift_question;
    use triagent_test_utils::ScriptedAgent;

    fn input() -> AgentInput {
        AgentInput {
            email_id: "msg-shift".into(),
            execution_id: ExecutionId::from_str("e1"),
            upstream_outputs: Default::default(),
            flagged_absent: vec![],
            email: shift_question(),
            model_variant: None,
            attempt: 0,
        }
    }

    #[test]
    fn resolves_default_and_variants() {
        let mut registry = AgentRegistry::new();
        registry.register(ScriptedAgent::succeeding(AgentType::Triage, 0.8));
        registry.register_variant(
            "triage-large",
            ScriptedAgent::succeeding(AgentType::Triage, 0.9).with_model("triage-large"),
        );

        let exec = registry.resolve(AgentType::Triage, Some("triage-large")).unwrap();
        assert_eq!(exec.model(), "triage-large");
        let exec = registry.resolve(AgentType::Triage, None).unwrap();
        assert_eq!(exec.model(), "scripted-triage");

        let err = registry.resolve(AgentType::Task, None).err().unwrap();
        assert!(err.is_unavailable());
    }

    #[test]
    fn missing_variant_respects_fallback_flag() {
        let mut registry = AgentRegistry::new();
        registry.register(ScriptedAgent::succeeding(AgentType::Deadline, 0.8));
        registry.register(ScriptedAgent::succeeding(AgentType::Context, 0.8));

        assert!(registry.resolve(AgentType::Deadline, Some("deadline-xl")).is_ok());

        let err = registry.resolve(AgentType::Context, Some("context-xl")).err().unwrap();
        assert!(matches!(err, TriagentError::AgentUnavailable { .. }));

        // The default executor answers for the model it serves.
        let exec = registry.resolve(AgentType::Context, Some("scripted-context")).unwrap();
        assert_eq!(exec.model(), "scripted-context");
    }

    #[test]
    fn policies_come_from_config() {
        let mut agents = AgentsConfig::default();
        agents.vision.fallback_allowed = false;
        let registry = AgentRegistry::with_policies(&agents);
        assert!(!registry.fallback_allowed(AgentType::Vision));
        assert!(!registry.fallback_allowed(AgentType::Context));
        assert!(registry.fallback_allowed(AgentType::Triage));
    }

    #[tokio::test]
    async fn fallback_serves_when_allowed() {
        let primary = ScriptedAgent::unavailable(AgentType::Vision, "gpu offline");
        let fallback = ScriptedAgent::succeeding(AgentType::Vision, 0.7).with_model("vision-small");
        let fallback_calls = fallback.calls();

        let exec = FallbackExecutor::new(Arc::new(primary), vec![Arc::new(fallback)], true);
        let out = exec.execute(input()).await.unwrap();
        assert_eq!(out.model_used, "vision-small");
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_disallowed_reports_unavailable() {
        let mut registry = AgentRegistry::new();
        let primary = ScriptedAgent::unavailable(AgentType::Context, "model overloaded");
        let fallback = ScriptedAgent::succeeding(AgentType::Context, 0.9);
        let fallback_calls = fallback.calls();
        registry.register_with_fallbacks(Arc::new(primary), vec![Arc::new(fallback)]);

        let exec = registry.resolve(AgentType::Context, None).unwrap();
        let err = exec.execute(input()).await.unwrap_err();
        assert!(matches!(err, TriagentError::AgentUnavailable { .. }));
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transient_errors_do_not_trigger_fallback() {
        let fallback = ScriptedAgent::succeeding(AgentType::Task, 0.9);
        let fallback_calls = fallback.calls();
        let exec = FallbackExecutor::new(
            Arc::new(ScriptedAgent::failing(AgentType::Task, "bad json")),
            vec![Arc::new(fallback)],
            true,
        );
        let err = exec.execute(input()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);
    }
}
