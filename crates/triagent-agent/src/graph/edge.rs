use serde::{Deserialize, Serialize};

use triagent_core::types::NodeStatus;

/// A dependency edge: `to` may not start before `from` is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// When a node becomes eligible once all of its dependencies are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRule {
    /// Run regardless of how dependencies ended. Failed inputs arrive flagged absent.
    AllDone,
    /// Run only if every dependency succeeded; otherwise the node is skipped.
    AllSuccess,
}

impl TriggerRule {
    /// Whether a node whose dependencies all ended in `statuses` should run.
    pub fn should_run(&self, statuses: &[NodeStatus]) -> bool {
        match self {
            TriggerRule::AllDone => true,
            TriggerRule::AllSuccess => statuses.iter().all(|s| *s == NodeStatus::Success),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_done_runs_after_failures() {
        let statuses = [NodeStatus::Success, NodeStatus::Failed];
        assert!(TriggerRule::AllDone.should_run(&statuses));
        assert!(!TriggerRule::AllSuccess.should_run(&statuses));
        assert!(TriggerRule::AllSuccess.should_run(&[NodeStatus::Success]));
    }
}
