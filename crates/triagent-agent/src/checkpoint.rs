//! Checkpoint recording: an append-only log of lifecycle transitions.
//!
//! The orchestrator and router hand events to a `CheckpointRecorder`, which
//! never blocks them: events go onto an unbounded channel and a background
//! worker deduplicates, appends, persists and publishes. Duplicate deliveries
//! are identified by `(execution_id, node_id, event_type, sequence)` and dropped.
//!
//! `replay` folds a recorded event stream back into per-node statuses and the
//! order in which nodes settled. Replaying a stream containing duplicates
//! gives the same result as replaying it without them.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use triagent_core::error::{Result, TriagentError};
use triagent_core::event::EventBus;
use triagent_core::types::{
    CheckpointEvent, CheckpointEventType, DedupKey, ExecutionId, GraphStatus, NodeStatus,
};

// ── In-memory log ───────────────────────────────────────────────

/// Executions an in-memory log keeps before evicting the oldest.
pub const DEFAULT_RETAINED_EXECUTIONS: usize = 64;

#[derive(Default)]
struct ExecutionEntries {
    seen: HashSet<DedupKey>,
    events: Vec<CheckpointEvent>,
}

struct LogInner {
    executions: HashMap<ExecutionId, ExecutionEntries>,
    /// Execution ids in first-seen order, oldest first.
    order: VecDeque<ExecutionId>,
    capacity: usize,
}

/// Append-only, deduplicating event log holding the most recent executions.
pub struct CheckpointLog {
    inner: Mutex<LogInner>,
}

impl Default for CheckpointLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RETAINED_EXECUTIONS)
    }
}

impl CheckpointLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` executions; older ones are evicted whole.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                executions: HashMap::new(),
                order: VecDeque::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append unless an event with the same dedup key was already recorded.
    pub fn append(&self, event: CheckpointEvent) -> bool {
        let mut inner = self.lock();
        if !inner.executions.contains_key(&event.execution_id) {
            inner.order.push_back(event.execution_id.clone());
            while inner.order.len() > inner.capacity {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.executions.remove(&evicted);
                    debug!(execution_id = %evicted, "Evicted checkpoints from memory");
                }
            }
        }
        let entries = inner.executions.entry(event.execution_id.clone()).or_default();
        if !entries.seen.insert(event.dedup_key()) {
            return false;
        }
        entries.events.push(event);
        true
    }

    pub fn events(&self, execution_id: &ExecutionId) -> Vec<CheckpointEvent> {
        self.lock()
            .executions
            .get(execution_id)
            .map(|e| e.events.clone())
            .unwrap_or_default()
    }

    pub fn execution_ids(&self) -> Vec<ExecutionId> {
        let mut ids: Vec<ExecutionId> = self.lock().executions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop every event and dedup key of one execution. Returns the number of
    /// events removed.
    pub fn forget(&self, execution_id: &ExecutionId) -> usize {
        let mut inner = self.lock();
        inner.order.retain(|id| id != execution_id);
        inner
            .executions
            .remove(execution_id)
            .map(|e| e.events.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().executions.is_empty()
    }
}

// ── SQLite store ────────────────────────────────────────────────

/// Persistent checkpoint store backed by SQLite.
pub struct CheckpointStore {
    conn: Mutex<Connection>,
}

impl CheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| TriagentError::Database(format!("Failed to open checkpoint store: {}", e)))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TriagentError::Database(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS checkpoint_events (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 execution_id TEXT NOT NULL,
                 node_id TEXT NOT NULL DEFAULT '',
                 event_type TEXT NOT NULL,
                 sequence INTEGER NOT NULL,
                 timestamp TEXT NOT NULL,
                 metrics_json TEXT NOT NULL,
                 snapshot_json TEXT NOT NULL,
                 UNIQUE(execution_id, node_id, event_type, sequence)
             );

             CREATE INDEX IF NOT EXISTS idx_cp_execution
                 ON checkpoint_events(execution_id, id);",
        )
        .map_err(|e| TriagentError::Database(format!("Failed to initialize checkpoint schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert an event. Returns false when its dedup key is already stored.
    pub fn append(&self, event: &CheckpointEvent) -> Result<bool> {
        let conn = self.conn.lock().map_err(|e| TriagentError::Database(e.to_string()))?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO checkpoint_events
                 (execution_id, node_id, event_type, sequence, timestamp, metrics_json, snapshot_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.execution_id.as_str(),
                    event.node_id.as_deref().unwrap_or(""),
                    event.event_type.as_str(),
                    event.sequence as i64,
                    event.timestamp.to_rfc3339(),
                    event.metrics.to_string(),
                    event.data_snapshot.to_string(),
                ],
            )
            .map_err(|e| TriagentError::Database(format!("Failed to append checkpoint: {}", e)))?;
        Ok(inserted == 1)
    }

    /// All events of one execution in append order.
    pub fn load(&self, execution_id: &ExecutionId) -> Result<Vec<CheckpointEvent>> {
        let conn = self.conn.lock().map_err(|e| TriagentError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT node_id, event_type, sequence, timestamp, metrics_json, snapshot_json
                 FROM checkpoint_events
                 WHERE execution_id = ?1
                 ORDER BY id ASC",
            )
            .map_err(|e| TriagentError::Database(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![execution_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(|e| TriagentError::Database(format!("Failed to load checkpoints: {}", e)))?;

        let mut events = Vec::new();
        for row in rows {
            let (node_id, event_type, sequence, ts, metrics, snapshot) =
                row.map_err(|e| TriagentError::Database(e.to_string()))?;
            let Some(event_type) = CheckpointEventType::parse(&event_type) else {
                warn!(event_type = %event_type, "Skipping checkpoint with unknown event type");
                continue;
            };
            let timestamp = DateTime::parse_from_rfc3339(&ts)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            events.push(CheckpointEvent {
                execution_id: execution_id.clone(),
                node_id: if node_id.is_empty() { None } else { Some(node_id) },
                event_type,
                timestamp,
                sequence: sequence as u64,
                metrics: serde_json::from_str(&metrics)?,
                data_snapshot: serde_json::from_str(&snapshot)?,
            });
        }
        Ok(events)
    }

    /// Execution ids with at least one stored event, newest first.
    pub fn executions(&self) -> Result<Vec<ExecutionId>> {
        let conn = self.conn.lock().map_err(|e| TriagentError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT execution_id FROM checkpoint_events
                 GROUP BY execution_id
                 ORDER BY MAX(id) DESC",
            )
            .map_err(|e| TriagentError::Database(e.to_string()))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| TriagentError::Database(e.to_string()))?
            .filter_map(|r| r.ok())
            .map(ExecutionId)
            .collect();
        Ok(ids)
    }
}

// ── Recorder ────────────────────────────────────────────────────

enum RecorderMessage {
    Event(CheckpointEvent),
    Forget(ExecutionId),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget handle for recording checkpoint events.
///
/// With a `CheckpointStore` attached the store is the log: it deduplicates
/// on insert and nothing is retained in memory. Without one, the most recent
/// executions are kept in a bounded `CheckpointLog`.
#[derive(Clone)]
pub struct CheckpointRecorder {
    tx: mpsc::UnboundedSender<RecorderMessage>,
    log: Arc<CheckpointLog>,
    store: Option<Arc<CheckpointStore>>,
}

impl CheckpointRecorder {
    /// Spawn the background worker. New events are persisted to `store` when
    /// one is given, otherwise kept in memory, then published on `bus`.
    pub fn spawn(bus: Arc<EventBus>, store: Option<Arc<CheckpointStore>>) -> (Self, JoinHandle<()>) {
        Self::spawn_with_retention(bus, store, DEFAULT_RETAINED_EXECUTIONS)
    }

    /// Like `spawn`, keeping at most `retained` executions in memory.
    pub fn spawn_with_retention(
        bus: Arc<EventBus>,
        store: Option<Arc<CheckpointStore>>,
        retained: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let log = Arc::new(CheckpointLog::with_capacity(retained));
        let worker_log = log.clone();
        let worker_store = store.clone();

        let handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    RecorderMessage::Event(event) => {
                        let fresh = match &worker_store {
                            Some(store) => match store.append(&event) {
                                Ok(inserted) => inserted,
                                Err(e) => {
                                    warn!(error = %e, execution_id = %event.execution_id, "Failed to persist checkpoint, keeping it in memory");
                                    worker_log.append(event.clone())
                                }
                            },
                            None => worker_log.append(event.clone()),
                        };
                        if !fresh {
                            debug!(
                                execution_id = %event.execution_id,
                                event_type = %event.event_type,
                                sequence = event.sequence,
                                "Dropped duplicate checkpoint"
                            );
                            continue;
                        }
                        bus.publish(event);
                    }
                    RecorderMessage::Forget(execution_id) => {
                        let removed = worker_log.forget(&execution_id);
                        debug!(execution_id = %execution_id, removed, "Forgot checkpoints");
                    }
                    RecorderMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Checkpoint recorder stopped");
        });

        (Self { tx, log, store }, handle)
    }

    /// Hand an event to the recorder. Never blocks and never fails the caller.
    pub fn record(&self, event: CheckpointEvent) {
        if self.tx.send(RecorderMessage::Event(event)).is_err() {
            warn!("Checkpoint recorder is gone, event dropped");
        }
    }

    /// Release the in-memory events of an execution once every event recorded
    /// before this call has been handled. Persisted checkpoints are kept.
    pub fn forget(&self, execution_id: &ExecutionId) {
        if self.tx.send(RecorderMessage::Forget(execution_id.clone())).is_err() {
            warn!("Checkpoint recorder is gone, forget dropped");
        }
    }

    /// Wait until every event recorded before this call has been processed.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(RecorderMessage::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    pub fn log(&self) -> Arc<CheckpointLog> {
        self.log.clone()
    }

    /// Recorded events of one execution, from the store when one is attached.
    pub fn events(&self, execution_id: &ExecutionId) -> Vec<CheckpointEvent> {
        let Some(store) = &self.store else {
            return self.log.events(execution_id);
        };
        match store.load(execution_id) {
            Ok(mut events) => {
                events.extend(self.log.events(execution_id));
                events
            }
            Err(e) => {
                warn!(error = %e, execution_id = %execution_id, "Failed to load checkpoints");
                self.log.events(execution_id)
            }
        }
    }
}

// ── Replay ──────────────────────────────────────────────────────

/// State reconstructed from a checkpoint stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub graph_status: Option<GraphStatus>,
    pub node_statuses: BTreeMap<String, NodeStatus>,
    /// Nodes in the order they started running.
    pub start_order: Vec<String>,
    /// Nodes in the order they reached a terminal status.
    pub completion_order: Vec<String>,
    pub retries: BTreeMap<String, u32>,
    pub critical_failure: Option<String>,
    pub actions_routed: usize,
    pub duplicates_dropped: usize,
}

/// Fold events into statuses. Transitions that would move a status backwards
/// are ignored, as are duplicate deliveries.
pub fn replay(events: &[CheckpointEvent]) -> ReplaySummary {
    let mut summary = ReplaySummary::default();
    let mut seen = HashSet::new();

    for event in events {
        if !seen.insert(event.dedup_key()) {
            summary.duplicates_dropped += 1;
            continue;
        }

        if let Some(next) = event.event_type.graph_status() {
            let current = summary.graph_status.unwrap_or(GraphStatus::Pending);
            if current.can_transition_to(next) {
                summary.graph_status = Some(next);
            }
        }

        match event.event_type {
            CheckpointEventType::NodeRetrying => {
                if let Some(node) = &event.node_id {
                    *summary.retries.entry(node.clone()).or_default() += 1;
                }
            }
            CheckpointEventType::CriticalFailure => {
                summary.critical_failure = event.node_id.clone();
            }
            CheckpointEventType::ActionRouted => summary.actions_routed += 1,
            _ => {}
        }

        let (Some(node), Some(next)) = (&event.node_id, event.event_type.node_status()) else {
            continue;
        };
        let current = summary
            .node_statuses
            .get(node)
            .copied()
            .unwrap_or(NodeStatus::Pending);
        if !current.can_transition_to(next) {
            continue;
        }
        summary.node_statuses.insert(node.clone(), next);
        if next == NodeStatus::Running {
            summary.start_order.push(node.clone());
        } else if next.is_terminal() {
            summary.completion_order.push(node.clone());
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(node: Option<&str>, event_type: CheckpointEventType, sequence: u64) -> CheckpointEvent {
        CheckpointEvent::new(
            ExecutionId::from_str("exec-1"),
            node.map(String::from),
            event_type,
            sequence,
        )
    }

    fn stream() -> Vec<CheckpointEvent> {
        use CheckpointEventType::*;
        vec![
            event(None, GraphStarted, 0),
            event(Some("triage"), NodeStarted, 0),
            event(Some("task"), NodeStarted, 0),
            event(Some("task"), NodeRetrying, 1),
            event(Some("task"), NodeSucceeded, 2),
            event(Some("triage"), NodeFailed, 1),
            event(Some("context"), NodeStarted, 0),
            event(Some("context"), NodeSucceeded, 1),
            event(None, GraphSucceeded, 1),
        ]
    }

    #[test]
    fn log_drops_duplicates() {
        let log = CheckpointLog::new();
        let e = event(Some("triage"), CheckpointEventType::NodeStarted, 0);
        assert!(log.append(e.clone()));
        assert!(!log.append(e));
        assert!(log.append(event(Some("triage"), CheckpointEventType::NodeSucceeded, 1)));
        assert_eq!(log.events(&ExecutionId::from_str("exec-1")).len(), 2);
    }

    #[test]
    fn log_forgets_an_execution() {
        let log = CheckpointLog::new();
        for e in stream() {
            log.append(e);
        }
        let id = ExecutionId::from_str("exec-1");
        assert_eq!(log.forget(&id), stream().len());
        assert!(log.is_empty());
        assert!(log.events(&id).is_empty());
        assert_eq!(log.forget(&id), 0);
    }

    #[test]
    fn log_evicts_oldest_execution_past_capacity() {
        let log = CheckpointLog::with_capacity(2);
        for name in ["exec-a", "exec-b", "exec-c"] {
            log.append(CheckpointEvent::new(
                ExecutionId::from_str(name),
                None,
                CheckpointEventType::GraphStarted,
                0,
            ));
        }
        assert_eq!(
            log.execution_ids(),
            vec![ExecutionId::from_str("exec-b"), ExecutionId::from_str("exec-c")]
        );
    }

    #[test]
    fn replay_reconstructs_order_and_statuses() {
        let summary = replay(&stream());
        assert_eq!(summary.graph_status, Some(GraphStatus::Success));
        assert_eq!(summary.completion_order, vec!["task", "triage", "context"]);
        assert_eq!(summary.start_order, vec!["triage", "task", "context"]);
        assert_eq!(summary.node_statuses["triage"], NodeStatus::Failed);
        assert_eq!(summary.retries["task"], 1);
        assert_eq!(summary.duplicates_dropped, 0);
    }

    #[test]
    fn replay_is_idempotent_under_duplicates() {
        let clean = stream();
        let mut noisy = Vec::new();
        for e in &clean {
            noisy.push(e.clone());
            noisy.push(e.clone());
        }
        let a = replay(&clean);
        let b = replay(&noisy);
        assert_eq!(a.node_statuses, b.node_statuses);
        assert_eq!(a.completion_order, b.completion_order);
        assert_eq!(a.graph_status, b.graph_status);
        assert_eq!(b.duplicates_dropped, clean.len());
    }

    #[test]
    fn replay_ignores_backward_transitions() {
        use CheckpointEventType::*;
        let events = vec![
            event(Some("task"), NodeSucceeded, 1),
            event(Some("task"), NodeStarted, 0),
            event(Some("task"), NodeFailed, 2),
        ];
        let summary = replay(&events);
        assert_eq!(summary.node_statuses["task"], NodeStatus::Success);
        assert_eq!(summary.completion_order, vec!["task"]);
        assert!(summary.start_order.is_empty());
    }

    #[test]
    fn store_ignores_duplicate_keys() {
        let store = CheckpointStore::open_in_memory().unwrap();
        let e = event(Some("triage"), CheckpointEventType::NodeStarted, 0)
            .with_metrics(serde_json::json!({"attempt": 0}));
        assert!(store.append(&e).unwrap());
        assert!(!store.append(&e).unwrap());
        assert!(store
            .append(&event(None, CheckpointEventType::GraphStarted, 0))
            .unwrap());

        let loaded = store.load(&ExecutionId::from_str("exec-1")).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].node_id.as_deref(), Some("triage"));
        assert_eq!(loaded[0].metrics["attempt"], 0);
        assert!(loaded[1].node_id.is_none());
        assert_eq!(store.executions().unwrap(), vec![ExecutionId::from_str("exec-1")]);
    }

    #[test]
    fn store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.db");
        {
            let store = CheckpointStore::open(&path).unwrap();
            for e in stream() {
                store.append(&e).unwrap();
            }
        }
        let store = CheckpointStore::open(&path).unwrap();
        let loaded = store.load(&ExecutionId::from_str("exec-1")).unwrap();
        assert_eq!(replay(&loaded).completion_order, vec!["task", "triage", "context"]);
    }

    #[tokio::test]
    async fn recorder_dedups_persists_and_publishes() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let store = Arc::new(CheckpointStore::open_in_memory().unwrap());
        let (recorder, _worker) = CheckpointRecorder::spawn(bus.clone(), Some(store.clone()));

        let e = event(Some("triage"), CheckpointEventType::NodeStarted, 0);
        recorder.record(e.clone());
        recorder.record(e);
        recorder.flush().await;

        let id = ExecutionId::from_str("exec-1");
        assert_eq!(recorder.events(&id).len(), 1);
        assert_eq!(store.load(&id).unwrap().len(), 1);
        assert!(recorder.log().is_empty());
        assert_eq!(rx.recv().await.unwrap().event_type, CheckpointEventType::NodeStarted);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn recorder_forget_releases_memory_after_pending_events() {
        let (recorder, _worker) = CheckpointRecorder::spawn(Arc::new(EventBus::default()), None);
        for e in stream() {
            recorder.record(e);
        }
        let id = ExecutionId::from_str("exec-1");
        recorder.forget(&id);
        recorder.flush().await;

        assert!(recorder.log().is_empty());
        assert!(recorder.events(&id).is_empty());
    }

    #[tokio::test]
    async fn recorder_memory_stays_bounded() {
        let (recorder, _worker) =
            CheckpointRecorder::spawn_with_retention(Arc::new(EventBus::default()), None, 3);
        for i in 0..50 {
            recorder.record(CheckpointEvent::new(
                ExecutionId::from_str(&format!("exec-{:02}", i)),
                None,
                CheckpointEventType::GraphStarted,
                0,
            ));
        }
        recorder.flush().await;
        assert_eq!(
            recorder.log().execution_ids(),
            vec![
                ExecutionId::from_str("exec-47"),
                ExecutionId::from_str("exec-48"),
                ExecutionId::from_str("exec-49"),
            ]
        );
    }
}
