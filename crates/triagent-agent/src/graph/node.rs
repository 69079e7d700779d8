use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

use triagent_core::types::{AgentOutput, AgentType, GraphStatus, NodeStatus};

use super::edge::TriggerRule;

/// A status enum that can live in an atomic cell.
pub trait Lifecycle: Copy + Eq {
    fn to_u8(self) -> u8;
    fn from_u8(v: u8) -> Self;
    fn can_transition_to(&self, next: Self) -> bool;
}

impl Lifecycle for NodeStatus {
    fn to_u8(self) -> u8 {
        self as u8
    }
    fn from_u8(v: u8) -> Self {
        NodeStatus::from_u8(v)
    }
    fn can_transition_to(&self, next: Self) -> bool {
        NodeStatus::can_transition_to(self, next)
    }
}

impl Lifecycle for GraphStatus {
    fn to_u8(self) -> u8 {
        self as u8
    }
    fn from_u8(v: u8) -> Self {
        GraphStatus::from_u8(v)
    }
    fn can_transition_to(&self, next: Self) -> bool {
        GraphStatus::can_transition_to(self, next)
    }
}

/// Forward-only status cell. A transition succeeds only if the cell still
/// holds `from`, so concurrent or repeated deliveries apply at most once.
#[derive(Debug)]
pub struct AtomicStatus<S> {
    raw: AtomicU8,
    _marker: std::marker::PhantomData<S>,
}

impl<S: Lifecycle> AtomicStatus<S> {
    pub fn new(initial: S) -> Self {
        Self {
            raw: AtomicU8::new(initial.to_u8()),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn load(&self) -> S {
        S::from_u8(self.raw.load(Ordering::Acquire))
    }

    pub fn transition(&self, from: S, to: S) -> bool {
        if !from.can_transition_to(to) {
            return false;
        }
        self.raw
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// One analysis stage inside an execution graph.
#[derive(Debug)]
pub struct TaskNode {
    pub id: String,
    pub agent_type: AgentType,
    pub dependencies: BTreeSet<String>,
    pub trigger: TriggerRule,
    /// Failure of a critical node fails the whole graph.
    pub critical: bool,
    status: AtomicStatus<NodeStatus>,
    retries_used: AtomicU32,
    output: OnceLock<AgentOutput>,
    next_sequence: AtomicU64,
}

impl TaskNode {
    /// Node ids are the agent type names; a graph holds at most one node per type.
    pub fn new(agent_type: AgentType) -> Self {
        Self {
            id: agent_type.as_str().to_string(),
            agent_type,
            dependencies: BTreeSet::new(),
            trigger: TriggerRule::AllDone,
            critical: false,
            status: AtomicStatus::new(NodeStatus::Pending),
            retries_used: AtomicU32::new(0),
            output: OnceLock::new(),
            next_sequence: AtomicU64::new(0),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerRule) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn status(&self) -> NodeStatus {
        self.status.load()
    }

    pub fn retries_used(&self) -> u32 {
        self.retries_used.load(Ordering::Acquire)
    }

    pub fn output(&self) -> Option<&AgentOutput> {
        self.output.get()
    }

    /// Sequence number for the next checkpoint event about this node.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn start(&self) -> bool {
        self.status.transition(NodeStatus::Pending, NodeStatus::Running)
    }

    pub(crate) fn record_retry(&self) -> u32 {
        self.retries_used.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Running -> Success, storing the output. A second completion is a no-op.
    pub(crate) fn complete(&self, output: AgentOutput) -> bool {
        if !self.status.transition(NodeStatus::Running, NodeStatus::Success) {
            return false;
        }
        let _ = self.output.set(output);
        true
    }

    /// Running -> Failed, storing the flagged-absent output.
    pub(crate) fn fail(&self, flagged: AgentOutput) -> bool {
        if !self.status.transition(NodeStatus::Running, NodeStatus::Failed) {
            return false;
        }
        let _ = self.output.set(flagged);
        true
    }

    /// Pending or Running -> Skipped.
    pub(crate) fn skip(&self) -> bool {
        self.status.transition(NodeStatus::Pending, NodeStatus::Skipped)
            || self.status.transition(NodeStatus::Running, NodeStatus::Skipped)
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id.clone(),
            agent_type: self.agent_type,
            dependencies: self.dependencies.iter().cloned().collect(),
            trigger: self.trigger,
            critical: self.critical,
            status: self.status(),
            retries_used: self.retries_used(),
            output: self.output().cloned(),
        }
    }
}

/// Serializable view of a node at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub agent_type: AgentType,
    pub dependencies: Vec<String>,
    pub trigger: TriggerRule,
    pub critical: bool,
    pub status: NodeStatus,
    pub retries_used: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<AgentOutput>,
}
