//! In-process event bus with append-only coordination-log persistence.
//!
//! `emit` fans out synchronously to subscribers in the order the caller
//! emits, then best-effort appends a single ndjson line to the log file.
//! Subscriber failures (a closed receiver) never propagate to the emitter.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub agent_id: Option<String>,
    pub ts: chrono::DateTime<chrono::Utc>,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, agent_id: Option<String>, data: serde_json::Value) -> Self {
        Event {
            event_type: event_type.into(),
            agent_id,
            ts: chrono::Utc::now(),
            data,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    log_writer: Arc<Mutex<Option<tokio::fs::File>>>,
    log_path: Option<PathBuf>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        EventBus {
            sender,
            log_writer: Arc::new(Mutex::new(None)),
            log_path: None,
        }
    }

    pub fn with_log_file(log_path: PathBuf) -> Self {
        let mut bus = Self::new();
        bus.log_path = Some(log_path);
        bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Fans out synchronously, then best-effort appends to the coordination
    /// log (no fsync; readers must tolerate a partial last line on crash).
    pub async fn emit(&self, event: Event) {
        let _ = self.sender.send(event.clone());

        let Some(log_path) = &self.log_path else {
            return;
        };

        if let Err(e) = self.append_line(log_path, &event).await {
            warn!("failed to append event to coordination log: {}", e);
        }
    }

    async fn append_line(&self, log_path: &PathBuf, event: &Event) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut guard = self.log_writer.lock().await;
        if guard.is_none() {
            if let Some(parent) = log_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .await?;
            *guard = Some(file);
        }

        let line = serde_json::to_string(event).unwrap_or_default();
        if let Some(file) = guard.as_mut() {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the coordination log, tolerating a truncated last line.
pub async fn read_coordination_log(log_path: &PathBuf) -> std::io::Result<Vec<Event>> {
    let content = match tokio::fs::read_to_string(log_path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
