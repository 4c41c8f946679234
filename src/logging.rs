//! Message trace log.
//!
//! Every message that enters or leaves the router is appended to a JSONL file
//! for the connection it belongs to:
//!
//! ```text
//! {trace-dir}/
//!   {YYYY-MM-DD}/
//!     {uuid}/
//!       session.json   ← metadata
//!       stage0.jsonl   ← the client
//!       stage1.jsonl   ← first proxy (or the agent)
//!       ...
//! ```
//!
//! Entries are `{"dir": "←" | "→", "ts": ..., "msg": ...}`, where `←` is a
//! message the router received from that stage and `→` one it sent. Logging
//! is best effort: when the writer falls behind, entries are dropped.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use acp_proto::JsonRpcMessage;
use anyhow::Context as _;
use futures::{StreamExt as _, channel::mpsc};
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt as _};
use uuid::Uuid;

use crate::conductor::SourceIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received by the router from the stage.
    Incoming,
    /// Sent by the router to the stage.
    Outgoing,
}

impl Direction {
    fn arrow(self) -> &'static str {
        match self {
            Direction::Incoming => "←",
            Direction::Outgoing => "→",
        }
    }
}

#[derive(Debug)]
struct TraceMessage {
    stage: SourceIndex,
    direction: Direction,
    timestamp: String,
    message: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TraceEntry {
    pub dir: String,
    pub ts: String,
    pub msg: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceMetadata {
    pub trace_id: String,
    pub start_time: String,
    pub working_directory: String,
    pub conductor_version: String,
}

/// Handle for appending to a trace. Clones share one writer.
#[derive(Clone, Debug)]
pub struct TraceLog {
    session_dir: PathBuf,
    trace_tx: mpsc::Sender<TraceMessage>,
}

impl TraceLog {
    /// Create a fresh trace directory under `root` and start its writer.
    pub async fn create(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let trace_id = Uuid::new_v4().to_string();
        let date = chrono::Local::now().format("%Y-%m-%d").to_string();
        let session_dir = root.as_ref().join(date).join(&trace_id);
        fs::create_dir_all(&session_dir)
            .await
            .with_context(|| format!("failed to create {}", session_dir.display()))?;

        let working_directory = std::env::current_dir()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();
        let metadata = TraceMetadata {
            trace_id,
            start_time: chrono::Utc::now().to_rfc3339(),
            working_directory,
            conductor_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        fs::write(
            session_dir.join("session.json"),
            serde_json::to_string_pretty(&metadata)?,
        )
        .await
        .context("failed to write session.json")?;

        let (trace_tx, trace_rx) = mpsc::channel(1024);
        tokio::spawn(TraceWriter::new(session_dir.clone(), trace_rx).run());

        tracing::info!(dir = %session_dir.display(), "writing message trace");
        Ok(Self {
            session_dir,
            trace_tx,
        })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn record(&self, stage: SourceIndex, direction: Direction, message: &JsonRpcMessage) {
        let Ok(message) = serde_json::to_value(message) else {
            return;
        };
        let entry = TraceMessage {
            stage,
            direction,
            timestamp: chrono::Utc::now().to_rfc3339(),
            message,
        };
        // Full or closed: drop the entry.
        let _ = self.trace_tx.clone().try_send(entry);
    }
}

struct TraceWriter {
    session_dir: PathBuf,
    trace_rx: mpsc::Receiver<TraceMessage>,
    stage_files: HashMap<SourceIndex, fs::File>,
}

impl TraceWriter {
    fn new(session_dir: PathBuf, trace_rx: mpsc::Receiver<TraceMessage>) -> Self {
        Self {
            session_dir,
            trace_rx,
            stage_files: HashMap::new(),
        }
    }

    async fn run(mut self) {
        while let Some(message) = self.trace_rx.next().await {
            if let Err(error) = self.write(message).await {
                tracing::error!(%error, "failed to write trace entry");
            }
        }
        for (_, mut file) in self.stage_files.drain() {
            let _ = file.flush().await;
        }
    }

    async fn write(&mut self, message: TraceMessage) -> anyhow::Result<()> {
        let file = match self.stage_files.entry(message.stage) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let path = self.session_dir.join(format!("stage{}.jsonl", message.stage));
                let file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                    .with_context(|| format!("failed to open {}", path.display()))?;
                entry.insert(file)
            }
        };

        let entry = TraceEntry {
            dir: message.direction.arrow().to_string(),
            ts: message.timestamp,
            msg: message.message,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
