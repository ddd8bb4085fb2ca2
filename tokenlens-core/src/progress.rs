//! Progress reporting from attribution runs.
//!
//! Runs never touch presentation state; they push [`ProgressEvent`]s into a
//! channel that the caller drains on its own schedule.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Coarse phase of a run, mirrored in status lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Tokenizing,
    Baseline,
    Analyzing,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RunStage::Tokenizing => "tokenizing",
            RunStage::Baseline => "baseline",
            RunStage::Analyzing => "analyzing",
            RunStage::Completed => "completed",
            RunStage::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One progress update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: Uuid,
    pub stage: RunStage,
    /// 0.0 to 100.0.
    pub percent: f64,
    pub message: String,
}

/// Sending half of a progress channel. Cheap to clone; sends never block.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    /// A sink that drops every event.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    /// Create a connected sink and the receiver that observes it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Bind this sink to one run.
    pub fn for_run(&self, run_id: Uuid) -> RunProgress {
        RunProgress {
            sink: self.clone(),
            run_id,
        }
    }

    fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            // A dropped receiver only means nobody is watching.
            let _ = tx.send(event);
        }
    }
}

/// A sink bound to a single run id.
#[derive(Debug, Clone)]
pub struct RunProgress {
    sink: ProgressSink,
    run_id: Uuid,
}

impl RunProgress {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn stage(&self, stage: RunStage, percent: f64, message: impl Into<String>) {
        self.sink.send(ProgressEvent {
            run_id: self.run_id,
            stage,
            percent: percent.clamp(0.0, 100.0),
            message: message.into(),
        });
    }

    /// Report `completed` of `total` planned iterations.
    pub fn iteration(&self, completed: usize, total: usize) {
        self.stage(
            RunStage::Analyzing,
            percent_complete(completed, total),
            format!("{completed}/{total}"),
        );
    }
}

/// `completed / total * 100`, with an empty plan counting as done.
pub fn percent_complete(completed: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        (completed as f64 / total as f64 * 100.0).min(100.0)
    }
}
