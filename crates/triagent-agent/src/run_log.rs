use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use triagent_core::event::EventBus;
use triagent_core::types::{CheckpointEvent, ExecutionId};

/// JSONL checkpoint logger.
///
/// Subscribes to the EventBus and appends every checkpoint event to
/// `{log_dir}/{execution_id}.jsonl`, one JSON object per line. Lines are
/// flushed as they are written, so a crash loses at most the event in flight.
pub struct RunLogger {
    log_dir: PathBuf,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn path_for(log_dir: &Path, execution_id: &ExecutionId) -> PathBuf {
        log_dir.join(format!("{}.jsonl", execution_id))
    }

    /// Subscribe to the bus and spawn the logger until cancelled or the bus
    /// closes. Events published after this returns are all logged.
    ///
    /// The logger does not keep the bus alive: once every owner drops it,
    /// buffered events are drained and the logger stops.
    pub fn spawn(self, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    async fn run(self, mut rx: broadcast::Receiver<CheckpointEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, dir = %self.log_dir.display(), "Failed to create log directory");
            return;
        }
        info!(dir = %self.log_dir.display(), "RunLogger started");

        let mut writers: HashMap<ExecutionId, BufWriter<tokio::fs::File>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => self.write(&mut writers, &event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        for (_, mut writer) in writers {
            writer.flush().await.ok();
        }
        debug!("RunLogger finished");
    }

    async fn write(
        &self,
        writers: &mut HashMap<ExecutionId, BufWriter<tokio::fs::File>>,
        event: &CheckpointEvent,
    ) {
        let line = match serde_json::to_string(event) {
            Ok(json) => format!("{}\n", json),
            Err(e) => {
                error!(error = %e, "Failed to serialize checkpoint");
                return;
            }
        };

        if !writers.contains_key(&event.execution_id) {
            let path = Self::path_for(&self.log_dir, &event.execution_id);
            let file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    error!(error = %e, path = %path.display(), "Failed to open log file");
                    return;
                }
            };
            writers.insert(event.execution_id.clone(), BufWriter::new(file));
        }
        let Some(writer) = writers.get_mut(&event.execution_id) else {
            return;
        };

        if let Err(e) = writer.write_all(line.as_bytes()).await {
            error!(error = %e, execution_id = %event.execution_id, "Failed to write log entry");
            writers.remove(&event.execution_id);
            return;
        }
        // Flush after each entry for crash resilience
        if let Err(e) = writer.flush().await {
            error!(error = %e, "Failed to flush log");
        }
    }
}

/// Read a JSONL checkpoint log back. Unparseable lines are skipped.
pub async fn read_log(path: &Path) -> std::io::Result<Vec<CheckpointEvent>> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use triagent_core::types::CheckpointEventType;

    #[tokio::test]
    async fn writes_one_file_per_execution() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let cancel = CancellationToken::new();
        let logger = RunLogger::new(dir.path().to_path_buf());
        let handle = logger.spawn(&bus, cancel.clone());

        let a = ExecutionId::from_str("exec-a");
        let b = ExecutionId::from_str("exec-b");
        bus.publish(CheckpointEvent::new(a.clone(), None, CheckpointEventType::GraphStarted, 0));
        bus.publish(CheckpointEvent::new(
            a.clone(),
            Some("triage".into()),
            CheckpointEventType::NodeStarted,
            0,
        ));
        bus.publish(CheckpointEvent::new(b.clone(), None, CheckpointEventType::GraphStarted, 0));

        let path_a = RunLogger::path_for(dir.path(), &a);
        for _ in 0..100 {
            if read_log(&path_a).await.map(|e| e.len()).unwrap_or(0) == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        let events = read_log(&path_a).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].node_id.as_deref(), Some("triage"));
        let events_b = read_log(&RunLogger::path_for(dir.path(), &b)).await.unwrap();
        assert_eq!(events_b.len(), 1);
    }

    #[tokio::test]
    async fn drains_buffered_events_when_bus_closes() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let logger = RunLogger::new(dir.path().join("nested"));
        let handle = logger.spawn(&bus, CancellationToken::new());

        let id = ExecutionId::from_str("exec-c");
        for seq in 0..3 {
            bus.publish(CheckpointEvent::new(
                id.clone(),
                Some("task".into()),
                CheckpointEventType::NodeRetrying,
                seq,
            ));
        }
        drop(bus);
        handle.await.unwrap();

        let events = read_log(&RunLogger::path_for(&dir.path().join("nested"), &id)).await.unwrap();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }
}
