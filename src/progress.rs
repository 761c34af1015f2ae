//! Knowledge base progress publishing, plus logging helpers that keep
//! progress bars pinned while log lines scroll.

use crate::meta::{KbStatus, KnowledgeBase};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::fmt::MakeWriter;

/// Snapshot of a project's knowledge base build.
///
/// Subscribers should treat each update as the current level, not as an
/// edge: updates may be dropped or arrive more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub project_id: i64,
    pub stage: String,
    pub progress: u8,
    pub status: KbStatus,
    pub error: Option<String>,
}

impl ProgressUpdate {
    /// Snapshot the stored row. Returns `None` for a row with an unreadable status.
    pub fn from_kb(kb: &KnowledgeBase) -> Option<Self> {
        let status = kb.get_status().ok()?;
        Some(Self {
            project_id: kb.project_id,
            stage: kb.stage.clone(),
            progress: kb.progress.clamp(0, 100) as u8,
            status,
            error: kb.last_error.clone(),
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status != KbStatus::Building
    }
}

/// Outbound port for build progress. Publishing never fails the caller.
pub trait ProgressReporter: Send + Sync {
    fn publish(&self, update: &ProgressUpdate);
}

/// Publishes updates on a tokio broadcast channel
#[derive(Clone)]
pub struct BroadcastReporter {
    tx: broadcast::Sender<ProgressUpdate>,
}

impl BroadcastReporter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.tx.subscribe()
    }
}

impl ProgressReporter for BroadcastReporter {
    fn publish(&self, update: &ProgressUpdate) {
        // No subscribers is fine
        let _ = self.tx.send(update.clone());
    }
}

/// Logs every update
#[derive(Default, Clone)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn publish(&self, update: &ProgressUpdate) {
        match &update.error {
            Some(err) if update.status == KbStatus::Failed => warn!(
                project_id = update.project_id,
                stage = %update.stage,
                "Knowledge base build failed: {}",
                err
            ),
            _ => info!(
                project_id = update.project_id,
                stage = %update.stage,
                progress = update.progress,
                status = %update.status,
                "Knowledge base progress"
            ),
        }
    }
}

/// Forwards every update to several reporters
#[derive(Default, Clone)]
pub struct FanoutReporter {
    reporters: Vec<Arc<dyn ProgressReporter>>,
}

impl FanoutReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }
}

impl ProgressReporter for FanoutReporter {
    fn publish(&self, update: &ProgressUpdate) {
        for reporter in &self.reporters {
            reporter.publish(update);
        }
    }
}

// ===== Terminal output =====

static MULTI_PROGRESS: OnceLock<MultiProgress> = OnceLock::new();

fn multi_progress() -> &'static MultiProgress {
    MULTI_PROGRESS.get_or_init(|| {
        let mp = MultiProgress::new();
        mp.set_draw_target(ProgressDrawTarget::stderr_with_hz(10));
        mp
    })
}

/// Bar from 0 to 100 showing one project's build stage
pub fn kb_progress_bar(project_id: i64) -> ProgressBar {
    let bar = multi_progress().add(ProgressBar::new(100));
    if let Ok(style) = ProgressStyle::with_template("{prefix} [{bar:40}] {pos:>3}% {msg}") {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.set_prefix(format!("project {}", project_id));
    bar
}

/// Reflect an update on a terminal bar
pub fn apply_to_bar(bar: &ProgressBar, update: &ProgressUpdate) {
    bar.set_position(u64::from(update.progress));
    bar.set_message(update.stage.clone());
}

#[derive(Default, Clone)]
pub struct LogWriterFactory;

pub struct LogWriter {
    buffer: String,
}

impl LogWriter {
    fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    fn emit(line: &str) {
        let line = line.trim_end_matches('\r');
        let _ = multi_progress().println(line.to_string());
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.push_str(&String::from_utf8_lossy(buf));

        while let Some(idx) = self.buffer.find('\n') {
            Self::emit(&self.buffer[..idx]);
            self.buffer.drain(..idx + 1);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            Self::emit(self.buffer.trim_end_matches('\n'));
            self.buffer.clear();
        }
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl<'a> MakeWriter<'a> for LogWriterFactory {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter::new()
    }
}
