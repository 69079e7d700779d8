//! Execution graphs: one DAG of analysis stages per email.
//!
//! An `ExecutionGraph` owns its `TaskNode`s and the edges derived from their
//! dependency sets. Node and graph statuses live in atomic cells that only
//! move forward, so a completion signal delivered twice, or after the graph
//! was cancelled, changes nothing.
//!
//! Every graph must contain exactly one critical Context node that depends
//! on every other node. Construction rejects anything else.

pub mod edge;
pub mod node;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::Serialize;

use triagent_core::error::{Result, TriagentError};
use triagent_core::types::{AgentOutput, AgentType, ExecutionId, GraphStatus, NodeStatus};

pub use edge::{Edge, TriggerRule};
pub use node::{AtomicStatus, Lifecycle, NodeSnapshot, TaskNode};

/// The per-email task graph.
#[derive(Debug)]
pub struct ExecutionGraph {
    id: ExecutionId,
    email_id: String,
    nodes: Vec<TaskNode>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    status: AtomicStatus<GraphStatus>,
    next_sequence: AtomicU64,
    start_order: Mutex<Vec<String>>,
    completion_order: Mutex<Vec<String>>,
}

impl ExecutionGraph {
    /// Assemble and validate a graph. Node order is kept as given.
    pub fn new(id: ExecutionId, email_id: impl Into<String>, nodes: Vec<TaskNode>) -> Result<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(TriagentError::GraphConstruction(format!(
                    "duplicate node id: {}",
                    node.id
                )));
            }
        }

        let mut edges = Vec::new();
        for node in &nodes {
            for dep in &node.dependencies {
                if !index.contains_key(dep) {
                    return Err(TriagentError::GraphConstruction(format!(
                        "node {} depends on unknown node {}",
                        node.id, dep
                    )));
                }
                edges.push(Edge::new(dep.clone(), node.id.clone()));
            }
        }

        let graph = Self {
            id,
            email_id: email_id.into(),
            nodes,
            index,
            edges,
            status: AtomicStatus::new(GraphStatus::Pending),
            next_sequence: AtomicU64::new(0),
            start_order: Mutex::new(Vec::new()),
            completion_order: Mutex::new(Vec::new()),
        };
        graph.validate()?;
        Ok(graph)
    }

    fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(TriagentError::GraphConstruction("graph has no nodes".into()));
        }
        self.topological_order()?;

        let contexts: Vec<&TaskNode> = self
            .nodes
            .iter()
            .filter(|n| n.agent_type == AgentType::Context)
            .collect();
        let context = match contexts.as_slice() {
            [one] => *one,
            _ => {
                return Err(TriagentError::GraphConstruction(format!(
                    "graph must contain exactly one context node, found {}",
                    contexts.len()
                )))
            }
        };

        if !context.critical || context.trigger != TriggerRule::AllDone {
            return Err(TriagentError::GraphConstruction(
                "context node must be critical and fire once all inputs are done".into(),
            ));
        }
        if let Some(other) = self.nodes.iter().find(|n| n.critical && n.id != context.id) {
            return Err(TriagentError::GraphConstruction(format!(
                "only the context node may be critical, found {}",
                other.id
            )));
        }

        let others: HashSet<&str> = self
            .nodes
            .iter()
            .filter(|n| n.id != context.id)
            .map(|n| n.id.as_str())
            .collect();
        let deps: HashSet<&str> = context.dependencies.iter().map(|d| d.as_str()).collect();
        if deps != others {
            return Err(TriagentError::GraphConstruction(format!(
                "context node must depend on every other node; missing {:?}",
                others.difference(&deps).collect::<Vec<_>>()
            )));
        }
        Ok(())
    }

    /// Node ids in a dependency-respecting order. Fails on cycles.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut dag: DiGraph<&str, ()> = DiGraph::new();
        let indices: Vec<_> = self.nodes.iter().map(|n| dag.add_node(n.id.as_str())).collect();
        for edge in &self.edges {
            dag.add_edge(indices[self.index[&edge.from]], indices[self.index[&edge.to]], ());
        }
        toposort(&dag, None)
            .map(|order| order.into_iter().map(|i| dag[i].to_string()).collect())
            .map_err(|cycle| {
                TriagentError::GraphConstruction(format!(
                    "dependency cycle through node {}",
                    dag[cycle.node_id()]
                ))
            })
    }

    pub fn id(&self) -> &ExecutionId {
        &self.id
    }

    pub fn email_id(&self) -> &str {
        &self.email_id
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, agent_type: AgentType) -> bool {
        self.node(agent_type.as_str()).is_some()
    }

    pub fn context_node(&self) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| n.critical)
    }

    pub fn status(&self) -> GraphStatus {
        self.status.load()
    }

    pub(crate) fn transition(&self, from: GraphStatus, to: GraphStatus) -> bool {
        self.status.transition(from, to)
    }

    /// Sequence number for the next graph-level checkpoint event.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn start_node(&self, node: &TaskNode) -> bool {
        let started = node.start();
        if started {
            push(&self.start_order, &node.id);
        }
        started
    }

    /// Record a node's output. False if the node is no longer running.
    pub(crate) fn complete_node(&self, node: &TaskNode, output: AgentOutput) -> bool {
        let applied = node.complete(output);
        if applied {
            push(&self.completion_order, &node.id);
        }
        applied
    }

    pub(crate) fn fail_node(&self, node: &TaskNode, flagged: AgentOutput) -> bool {
        let applied = node.fail(flagged);
        if applied {
            push(&self.completion_order, &node.id);
        }
        applied
    }

    pub(crate) fn skip_node(&self, node: &TaskNode) -> bool {
        let applied = node.skip();
        if applied {
            push(&self.completion_order, &node.id);
        }
        applied
    }

    /// Node ids in the order they started running.
    pub fn start_order(&self) -> Vec<String> {
        read(&self.start_order)
    }

    /// Node ids in the order they reached a terminal status.
    pub fn completion_order(&self) -> Vec<String> {
        read(&self.completion_order)
    }

    /// Pending nodes whose dependencies are all terminal.
    pub fn ready_nodes(&self) -> Vec<&TaskNode> {
        self.nodes
            .iter()
            .filter(|n| n.status() == NodeStatus::Pending)
            .filter(|n| {
                n.dependencies
                    .iter()
                    .all(|d| self.node(d).is_some_and(|dep| dep.status().is_terminal()))
            })
            .collect()
    }

    pub fn dependency_statuses(&self, node: &TaskNode) -> Vec<NodeStatus> {
        node.dependencies
            .iter()
            .filter_map(|d| self.node(d))
            .map(|d| d.status())
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.nodes.iter().all(|n| n.status().is_terminal())
    }

    pub fn node_statuses(&self) -> BTreeMap<String, NodeStatus> {
        self.nodes.iter().map(|n| (n.id.clone(), n.status())).collect()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            execution_id: self.id.clone(),
            email_id: self.email_id.clone(),
            status: self.status(),
            nodes: self.nodes.iter().map(|n| n.snapshot()).collect(),
            edges: self.edges.clone(),
        }
    }
}

fn push(order: &Mutex<Vec<String>>, id: &str) {
    match order.lock() {
        Ok(mut guard) => guard.push(id.to_string()),
        Err(poisoned) => poisoned.into_inner().push(id.to_string()),
    }
}

fn read(order: &Mutex<Vec<String>>) -> Vec<String> {
    match order.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Serializable view of a whole graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphSnapshot {
    pub execution_id: ExecutionId,
    pub email_id: String,
    pub status: GraphStatus,
    pub nodes: Vec<NodeSnapshot>,
    pub edges: Vec<Edge>,
}
