use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use triagent_core::error::{Result, TriagentError};
use triagent_core::types::{ActionDecision, ActionOutcome, ActionRecord, ExecutionId, RiskLevel};

/// Persistence for routed actions, keyed by `(execution_id, recommendation_index)`.
///
/// `put` never overwrites: the first record stored for a key is the record.
pub trait ActionStore: Send + Sync + 'static {
    fn get(&self, execution_id: &ExecutionId, index: usize) -> Result<Option<ActionRecord>>;

    /// Store a record unless one exists for its key. Returns whether it was inserted.
    fn put(&self, record: &ActionRecord) -> Result<bool>;

    fn list(&self, execution_id: &ExecutionId) -> Result<Vec<ActionRecord>>;
}

#[derive(Default)]
pub struct MemoryActionStore {
    records: Mutex<BTreeMap<(ExecutionId, usize), ActionRecord>>,
}

impl MemoryActionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ActionStore for MemoryActionStore {
    fn get(&self, execution_id: &ExecutionId, index: usize) -> Result<Option<ActionRecord>> {
        let records = self.records.lock().map_err(|e| TriagentError::Database(e.to_string()))?;
        Ok(records.get(&(execution_id.clone(), index)).cloned())
    }

    fn put(&self, record: &ActionRecord) -> Result<bool> {
        let mut records = self.records.lock().map_err(|e| TriagentError::Database(e.to_string()))?;
        let key = (record.execution_id.clone(), record.recommendation_index);
        if records.contains_key(&key) {
            return Ok(false);
        }
        records.insert(key, record.clone());
        Ok(true)
    }

    fn list(&self, execution_id: &ExecutionId) -> Result<Vec<ActionRecord>> {
        let records = self.records.lock().map_err(|e| TriagentError::Database(e.to_string()))?;
        Ok(records
            .iter()
            .filter(|((id, _), _)| id == execution_id)
            .map(|(_, r)| r.clone())
            .collect())
    }
}

/// Action records in SQLite. Shares a database file with the checkpoint store.
pub struct SqliteActionStore {
    conn: Mutex<Connection>,
}

impl SqliteActionStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| TriagentError::Database(format!("Failed to open action store: {}", e)))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| TriagentError::Database(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;

             CREATE TABLE IF NOT EXISTS action_records (
                 execution_id TEXT NOT NULL,
                 recommendation_index INTEGER NOT NULL,
                 action_type TEXT NOT NULL,
                 decision TEXT NOT NULL,
                 outcome_json TEXT NOT NULL,
                 confidence REAL NOT NULL,
                 risk_level TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 PRIMARY KEY (execution_id, recommendation_index)
             );",
        )
        .map_err(|e| TriagentError::Database(format!("Failed to initialize action schema: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT execution_id, recommendation_index, action_type, decision, outcome_json, confidence, risk_level, created_at FROM action_records";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActionRecord> {
    let decision: String = row.get(3)?;
    let outcome: String = row.get(4)?;
    let risk: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(ActionRecord {
        execution_id: ExecutionId(row.get(0)?),
        recommendation_index: row.get::<_, i64>(1)? as usize,
        action_type: row.get(2)?,
        decision: ActionDecision::parse(&decision).unwrap_or(ActionDecision::ManualReview),
        outcome: serde_json::from_str(&outcome).unwrap_or(ActionOutcome::Failed {
            error: format!("unreadable outcome: {}", outcome),
        }),
        confidence: row.get(5)?,
        risk_level: RiskLevel::parse(&risk),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

impl ActionStore for SqliteActionStore {
    fn get(&self, execution_id: &ExecutionId, index: usize) -> Result<Option<ActionRecord>> {
        let conn = self.conn.lock().map_err(|e| TriagentError::Database(e.to_string()))?;
        conn.query_row(
            &format!("{} WHERE execution_id = ?1 AND recommendation_index = ?2", SELECT_COLUMNS),
            params![execution_id.as_str(), index as i64],
            row_to_record,
        )
        .optional()
        .map_err(|e| TriagentError::Database(e.to_string()))
    }

    fn put(&self, record: &ActionRecord) -> Result<bool> {
        let conn = self.conn.lock().map_err(|e| TriagentError::Database(e.to_string()))?;
        let outcome = serde_json::to_string(&record.outcome)?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO action_records
                 (execution_id, recommendation_index, action_type, decision, outcome_json, confidence, risk_level, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.execution_id.as_str(),
                    record.recommendation_index as i64,
                    record.action_type,
                    record.decision.as_str(),
                    outcome,
                    record.confidence,
                    record.risk_level.as_str(),
                    record.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| TriagentError::Database(format!("Failed to store action record: {}", e)))?;
        Ok(inserted == 1)
    }

    fn list(&self, execution_id: &ExecutionId) -> Result<Vec<ActionRecord>> {
        let conn = self.conn.lock().map_err(|e| TriagentError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(&format!(
                "{} WHERE execution_id = ?1 ORDER BY recommendation_index ASC",
                SELECT_COLUMNS
            ))
            .map_err(|e| TriagentError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![execution_id.as_str()], row_to_record)
            .map_err(|e| TriagentError::Database(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| TriagentError::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: usize, decision: ActionDecision) -> ActionRecord {
        ActionRecord {
            execution_id: ExecutionId::from_str("exec-7"),
            recommendation_index: index,
            action_type: "create_task".into(),
            decision,
            outcome: ActionOutcome::Executed {
                external_id: Some("task-1".into()),
            },
            confidence: 0.93,
            risk_level: RiskLevel::Low,
            created_at: Utc::now(),
        }
    }

    fn exercise(store: &dyn ActionStore) {
        let id = ExecutionId::from_str("exec-7");
        assert!(store.get(&id, 0).unwrap().is_none());
        assert!(store.put(&record(0, ActionDecision::AutoExecuted)).unwrap());
        assert!(!store.put(&record(0, ActionDecision::ManualReview)).unwrap());
        assert!(store.put(&record(1, ActionDecision::PendingConfirmation)).unwrap());

        let first = store.get(&id, 0).unwrap().unwrap();
        assert_eq!(first.decision, ActionDecision::AutoExecuted);
        assert_eq!(
            first.outcome,
            ActionOutcome::Executed {
                external_id: Some("task-1".into())
            }
        );
        let all = store.list(&id).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].recommendation_index, 1);
        assert!(store.list(&ExecutionId::from_str("other")).unwrap().is_empty());
    }

    #[test]
    fn memory_store_keeps_first_record() {
        exercise(&MemoryActionStore::new());
    }

    #[test]
    fn sqlite_store_keeps_first_record() {
        exercise(&SqliteActionStore::open_in_memory().unwrap());
    }

    #[test]
    fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.db");
        SqliteActionStore::open(&path)
            .unwrap()
            .put(&record(0, ActionDecision::AutoExecuted))
            .unwrap();
        let store = SqliteActionStore::open(&path).unwrap();
        assert!(store.get(&ExecutionId::from_str("exec-7"), 0).unwrap().is_some());
    }
}
