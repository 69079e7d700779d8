use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::{Result, TriagentError};
use crate::types::AgentType;

/// Top-level Triagent configuration. Built once and passed around behind an `Arc`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub orchestrator: ExecutionConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

/// Graph-wide execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Overall per-email SLA. Exceeding it cancels the execution.
    #[serde(default = "default_sla_secs")]
    pub sla_secs: u64,
    #[serde(default = "default_cpu_workers")]
    pub cpu_workers: usize,
    #[serde(default = "default_gpu_workers")]
    pub gpu_workers: usize,
    /// Run Triage before Vision, Deadline and Task instead of alongside them.
    #[serde(default)]
    pub triage_first: bool,
    /// Subject keywords that make an email with attachments eligible for Vision.
    #[serde(default = "default_vision_keywords")]
    pub vision_keywords: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            sla_secs: default_sla_secs(),
            cpu_workers: default_cpu_workers(),
            gpu_workers: default_gpu_workers(),
            triage_first: false,
            vision_keywords: default_vision_keywords(),
        }
    }
}

impl ExecutionConfig {
    pub fn sla(&self) -> Duration {
        Duration::from_secs(self.sla_secs)
    }
}

fn default_sla_secs() -> u64 { 300 }
fn default_cpu_workers() -> usize { 8 }
fn default_gpu_workers() -> usize { 2 }
fn default_vision_keywords() -> Vec<String> {
    ["invoice", "receipt", "bill", "statement", "remittance", "purchase order"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Timeout, retry and model settings for one agent type.
#[derive(Debug, Clone, Serialize)]
pub struct NodePolicy {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub model: Option<String>,
    pub fallback_allowed: bool,
    /// Remote endpoint for the HTTP stage adapter.
    pub endpoint: Option<String>,
}

fn default_backoff_ms() -> u64 { 500 }

/// An `[agents.<type>]` section as written. Fields left out keep the
/// agent type's default policy.
#[derive(Deserialize)]
struct PolicySection {
    timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    backoff_ms: Option<u64>,
    model: Option<String>,
    fallback_allowed: Option<bool>,
    endpoint: Option<String>,
}

impl PolicySection {
    fn over(self, base: NodePolicy) -> NodePolicy {
        NodePolicy {
            timeout_ms: self.timeout_ms.unwrap_or(base.timeout_ms),
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            backoff_ms: self.backoff_ms.unwrap_or(base.backoff_ms),
            model: self.model.or(base.model),
            fallback_allowed: self.fallback_allowed.unwrap_or(base.fallback_allowed),
            endpoint: self.endpoint.or(base.endpoint),
        }
    }
}

fn policy_over<'de, D>(deserializer: D, base: fn() -> NodePolicy) -> std::result::Result<NodePolicy, D::Error>
where
    D: Deserializer<'de>,
{
    PolicySection::deserialize(deserializer).map(|section| section.over(base()))
}

fn triage_section<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<NodePolicy, D::Error> {
    policy_over(d, default_triage_policy)
}
fn vision_section<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<NodePolicy, D::Error> {
    policy_over(d, default_vision_policy)
}
fn deadline_section<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<NodePolicy, D::Error> {
    policy_over(d, default_deadline_policy)
}
fn task_section<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<NodePolicy, D::Error> {
    policy_over(d, default_task_policy)
}
fn context_section<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<NodePolicy, D::Error> {
    policy_over(d, default_context_policy)
}

impl NodePolicy {
    pub fn new(timeout_ms: u64, max_retries: u32) -> Self {
        Self {
            timeout_ms,
            max_retries,
            backoff_ms: default_backoff_ms(),
            model: None,
            fallback_allowed: true,
            endpoint: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Exponential backoff before retry `attempt` (0-based), capped at 30s.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let ms = self
            .backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(30_000);
        Duration::from_millis(ms)
    }
}

/// Per-agent-type policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_triage_policy", deserialize_with = "triage_section")]
    pub triage: NodePolicy,
    #[serde(default = "default_vision_policy", deserialize_with = "vision_section")]
    pub vision: NodePolicy,
    #[serde(default = "default_deadline_policy", deserialize_with = "deadline_section")]
    pub deadline: NodePolicy,
    #[serde(default = "default_task_policy", deserialize_with = "task_section")]
    pub task: NodePolicy,
    #[serde(default = "default_context_policy", deserialize_with = "context_section")]
    pub context: NodePolicy,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            triage: default_triage_policy(),
            vision: default_vision_policy(),
            deadline: default_deadline_policy(),
            task: default_task_policy(),
            context: default_context_policy(),
        }
    }
}

impl AgentsConfig {
    pub fn policy(&self, agent_type: AgentType) -> &NodePolicy {
        match agent_type {
            AgentType::Triage => &self.triage,
            AgentType::Vision => &self.vision,
            AgentType::Deadline => &self.deadline,
            AgentType::Task => &self.task,
            AgentType::Context => &self.context,
        }
    }

    pub fn policy_mut(&mut self, agent_type: AgentType) -> &mut NodePolicy {
        match agent_type {
            AgentType::Triage => &mut self.triage,
            AgentType::Vision => &mut self.vision,
            AgentType::Deadline => &mut self.deadline,
            AgentType::Task => &mut self.task,
            AgentType::Context => &mut self.context,
        }
    }
}

fn default_triage_policy() -> NodePolicy { NodePolicy::new(15_000, 3) }
fn default_vision_policy() -> NodePolicy { NodePolicy::new(30_000, 2) }
fn default_deadline_policy() -> NodePolicy { NodePolicy::new(15_000, 3) }
fn default_task_policy() -> NodePolicy { NodePolicy::new(15_000, 3) }
fn default_context_policy() -> NodePolicy {
    NodePolicy {
        fallback_allowed: false,
        ..NodePolicy::new(30_000, 0)
    }
}

/// Confidence/risk gate thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_auto_threshold")]
    pub auto_threshold: f64,
    #[serde(default = "default_confirm_threshold")]
    pub confirm_threshold: f64,
    #[serde(default = "default_high_risk_threshold")]
    pub high_risk_threshold: f64,
    /// Keywords in the synthesis or payload that escalate a recommendation to high risk.
    #[serde(default = "default_high_risk_keywords")]
    pub high_risk_keywords: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            auto_threshold: default_auto_threshold(),
            confirm_threshold: default_confirm_threshold(),
            high_risk_threshold: default_high_risk_threshold(),
            high_risk_keywords: default_high_risk_keywords(),
        }
    }
}

fn default_auto_threshold() -> f64 { 0.90 }
fn default_confirm_threshold() -> f64 { 0.70 }
fn default_high_risk_threshold() -> f64 { 0.95 }
fn default_high_risk_keywords() -> Vec<String> {
    ["fire", "lawsuit", "inspection", "overdue"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Action tool endpoints keyed by action type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    /// Register a dry-run tool for action types without an endpoint.
    #[serde(default)]
    pub dry_run: bool,
}

/// Checkpoint persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_enabled")]
    pub enabled: bool,
    /// SQLite database for checkpoints and action records.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Executions kept in memory when checkpoints are not persisted.
    #[serde(default = "default_retain_executions")]
    pub retain_executions: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: default_db_path(),
            retain_executions: default_retain_executions(),
        }
    }
}

fn default_checkpoint_enabled() -> bool { true }
fn default_db_path() -> String { "triagent.db".to_string() }
fn default_retain_executions() -> usize { 64 }

/// JSONL checkpoint log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: default_log_dir(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "logs".to_string() }

impl LogConfig {
    pub fn dir(&self) -> PathBuf {
        PathBuf::from(&self.log_dir)
    }
}

impl OrchestratorConfig {
    /// Load, expand `${ENV_VAR}` references, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TriagentError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| TriagentError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.router;
        for (name, value) in [
            ("auto_threshold", r.auto_threshold),
            ("confirm_threshold", r.confirm_threshold),
            ("high_risk_threshold", r.high_risk_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(TriagentError::Config(format!(
                    "router.{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if r.confirm_threshold > r.auto_threshold {
            return Err(TriagentError::Config(format!(
                "router.confirm_threshold ({}) must not exceed auto_threshold ({})",
                r.confirm_threshold, r.auto_threshold
            )));
        }

        let context = &self.agents.context;
        if context.max_retries > 0 {
            return Err(TriagentError::Config(
                "agents.context.max_retries must be 0: the context node is never retried".into(),
            ));
        }
        if context.fallback_allowed {
            return Err(TriagentError::Config(
                "agents.context.fallback_allowed must be false".into(),
            ));
        }

        for agent_type in AgentType::ALL {
            if self.agents.policy(agent_type).timeout_ms == 0 {
                return Err(TriagentError::Config(format!(
                    "agents.{}.timeout_ms must be greater than 0",
                    agent_type
                )));
            }
        }

        let o = &self.orchestrator;
        if o.cpu_workers == 0 || o.gpu_workers == 0 {
            return Err(TriagentError::Config(
                "orchestrator worker capacity must be at least 1 per pool".into(),
            ));
        }
        if o.sla_secs == 0 {
            return Err(TriagentError::Config(
                "orchestrator.sla_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    warn!(var = %var_name, "Environment variable not set, leaving reference unexpanded");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
