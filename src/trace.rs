//! Stage lifecycle events as JSON lines.
//!
//! The orchestrator emits a [`StageTrace`] when a stage call is dispatched,
//! succeeds, fails, or is skipped. [`JsonlTraceSink`] forwards events over a
//! channel to a writer thread so recording never blocks the async runtime.

use std::fs::OpenOptions;
use std::io::{LineWriter, Write};
use std::path::Path;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::gateway::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageEventKind {
    Dispatched,
    Succeeded,
    Failed,
    /// Never dispatched: cancelled first, or nothing upstream to refine.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTrace {
    pub at: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub stage: String,
    pub stage_index: usize,
    pub variant: usize,
    pub event: StageEventKind,
    pub backend: Option<String>,
    pub model: Option<String>,
    pub attempts: u32,
    pub tokens: u32,
    pub latency_ms: u64,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
}

impl StageTrace {
    pub fn new(
        correlation_id: Uuid,
        stage: impl Into<String>,
        stage_index: usize,
        variant: usize,
        event: StageEventKind,
    ) -> Self {
        Self {
            at: Utc::now(),
            correlation_id,
            stage: stage.into(),
            stage_index,
            variant,
            event,
            backend: None,
            model: None,
            attempts: 0,
            tokens: 0,
            latency_ms: 0,
            failure: None,
            error: None,
        }
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn failed(mut self, kind: FailureKind, error: impl Into<String>) -> Self {
        self.failure = Some(kind);
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("trace file: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode trace event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("trace writer has stopped")]
    Closed,
    #[error("trace writer panicked")]
    WriterPanicked,
}

/// Recording is synchronous and must not block on I/O.
pub trait TraceSink: Send + Sync {
    fn record(&self, event: StageTrace) -> Result<(), TraceError>;
}

/// Appends one JSON object per event to a file.
#[derive(Clone)]
pub struct JsonlTraceSink {
    tx: Sender<StageTrace>,
}

/// Handle on the writer thread behind a [`JsonlTraceSink`].
pub struct TraceWorker {
    thread: JoinHandle<Result<(), TraceError>>,
}

impl TraceWorker {
    /// Block until every queued event is on disk. Only returns once all
    /// sink clones (including those held by an orchestrator) are dropped.
    pub fn join(self) -> Result<(), TraceError> {
        self.thread.join().map_err(|_| TraceError::WriterPanicked)?
    }
}

impl JsonlTraceSink {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (tx, rx) = channel();
        let thread = std::thread::Builder::new()
            .name("alembic-trace".into())
            .spawn(move || drain(LineWriter::new(file), rx))?;
        Ok((Self { tx }, TraceWorker { thread }))
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, event: StageTrace) -> Result<(), TraceError> {
        self.tx.send(event).map_err(|_| TraceError::Closed)
    }
}

fn drain<W: Write>(mut out: W, rx: Receiver<StageTrace>) -> Result<(), TraceError> {
    while let Ok(event) = rx.recv() {
        serde_json::to_writer(&mut out, &event)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}
