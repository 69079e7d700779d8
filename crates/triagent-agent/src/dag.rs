use regex::Regex;
use tracing::debug;

use triagent_core::config::ExecutionConfig;
use triagent_core::error::{Result, TriagentError};
use triagent_core::types::{AgentType, Email, ExecutionId, TriageHint};

use crate::graph::{ExecutionGraph, TaskNode};

/// Builds the execution graph for one email.
///
/// Triage, Deadline, Task and Context are always present. Vision is added
/// only when the email carries attachments and either the hint asks for it
/// or the subject names a document type. Context depends on every other node.
///
/// The build is a pure function of its inputs: the same email, hint and
/// execution id always yield the same graph.
pub struct DagBuilder {
    triage_first: bool,
    vision_subject: Option<Regex>,
}

impl DagBuilder {
    pub fn new(config: &ExecutionConfig) -> Result<Self> {
        let keywords: Vec<String> = config
            .vision_keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(regex::escape)
            .collect();

        let vision_subject = if keywords.is_empty() {
            None
        } else {
            let pattern = format!(r"(?i)\b(?:{})\b", keywords.join("|"));
            Some(Regex::new(&pattern).map_err(|e| {
                TriagentError::Config(format!("invalid vision keyword pattern: {}", e))
            })?)
        };

        Ok(Self {
            triage_first: config.triage_first,
            vision_subject,
        })
    }

    /// Whether the Vision stage belongs in this email's graph.
    pub fn requires_vision(&self, email: &Email, hint: Option<&TriageHint>) -> bool {
        if !email.has_attachments {
            return false;
        }
        hint.is_some_and(|h| h.requires_vision) || self.subject_names_document(&email.subject)
    }

    fn subject_names_document(&self, subject: &str) -> bool {
        self.vision_subject
            .as_ref()
            .is_some_and(|re| re.is_match(subject))
    }

    pub fn build(
        &self,
        execution_id: ExecutionId,
        email: &Email,
        hint: Option<&TriageHint>,
    ) -> Result<ExecutionGraph> {
        email.validate()?;

        let mut stages = vec![AgentType::Triage];
        if self.requires_vision(email, hint) {
            stages.push(AgentType::Vision);
        }
        stages.push(AgentType::Deadline);
        stages.push(AgentType::Task);

        let mut nodes: Vec<TaskNode> = stages
            .iter()
            .map(|&agent_type| {
                let node = TaskNode::new(agent_type);
                if self.triage_first && agent_type != AgentType::Triage {
                    node.depends_on([AgentType::Triage.as_str()])
                } else {
                    node
                }
            })
            .collect();

        let context = TaskNode::new(AgentType::Context)
            .depends_on(nodes.iter().map(|n| n.id.clone()).collect::<Vec<_>>())
            .critical();
        nodes.push(context);

        debug!(
            execution_id = %execution_id,
            email_id = %email.id,
            nodes = nodes.len(),
            vision = stages.contains(&AgentType::Vision),
            "Built execution graph"
        );

        ExecutionGraph::new(execution_id, email.id.clone(), nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triagent_core::types::{GraphStatus, NodeStatus};
    use triagent_test_utils::fixtures::{email, hint, invoice_email, shift_question};

    fn builder() -> DagBuilder {
        DagBuilder::new(&ExecutionConfig::default()).unwrap()
    }

    fn ids(graph: &ExecutionGraph) -> Vec<&str> {
        graph.nodes().iter().map(|n| n.id.as_str()).collect()
    }

    #[test]
    fn plain_email_gets_four_nodes() {
        let graph = builder()
            .build(ExecutionId::from_str("e1"), &shift_question(), Some(&hint(false)))
            .unwrap();
        assert_eq!(ids(&graph), vec!["triage", "deadline", "task", "context"]);
        let context = graph.context_node().unwrap();
        assert!(context.critical);
        assert_eq!(context.dependencies.len(), 3);
        assert_eq!(graph.status(), GraphStatus::Pending);
        assert!(graph.nodes().iter().all(|n| n.status() == NodeStatus::Pending));
    }

    #[test]
    fn invoice_with_attachment_gets_vision() {
        let graph = builder()
            .build(ExecutionId::from_str("e2"), &invoice_email(), Some(&hint(true)))
            .unwrap();
        assert_eq!(ids(&graph), vec!["triage", "vision", "deadline", "task", "context"]);
        assert_eq!(graph.context_node().unwrap().dependencies.len(), 4);
    }

    #[test]
    fn subject_keyword_triggers_vision_without_hint() {
        let b = builder();
        assert!(b.requires_vision(&invoice_email(), None));
        assert!(b.requires_vision(&email("m", "Your RECEIPT is attached", true), None));
        assert!(!b.requires_vision(&email("m", "Billing cycle", true), None));
    }

    #[test]
    fn vision_needs_attachments() {
        let b = builder();
        let no_attachment = email("m", "Invoice #9", false);
        assert!(!b.requires_vision(&no_attachment, Some(&hint(true))));
        assert!(b.requires_vision(&email("m", "Photos", true), Some(&hint(true))));
    }

    #[test]
    fn triage_first_adds_edges() {
        let mut config = ExecutionConfig::default();
        config.triage_first = true;
        let b = DagBuilder::new(&config).unwrap();
        let graph = b
            .build(ExecutionId::from_str("e3"), &shift_question(), None)
            .unwrap();
        assert!(graph.node("deadline").unwrap().dependencies.contains("triage"));
        assert!(graph.node("task").unwrap().dependencies.contains("triage"));
        let ready: Vec<&str> = graph.ready_nodes().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ready, vec!["triage"]);
    }

    #[test]
    fn build_is_deterministic() {
        let b = builder();
        let a = b
            .build(ExecutionId::from_str("same"), &invoice_email(), Some(&hint(true)))
            .unwrap();
        let c = b
            .build(ExecutionId::from_str("same"), &invoice_email(), Some(&hint(true)))
            .unwrap();
        assert_eq!(a.snapshot(), c.snapshot());
    }

    #[test]
    fn malformed_email_is_rejected() {
        let mut bad = shift_question();
        bad.id = String::new();
        let err = builder()
            .build(ExecutionId::from_str("e4"), &bad, None)
            .unwrap_err();
        assert!(matches!(err, TriagentError::GraphConstruction(_)));
    }
}
