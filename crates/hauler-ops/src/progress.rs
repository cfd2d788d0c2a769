//! Progress reporting and result types for script execution.

use std::path::PathBuf;

use hauler_core::{OperationError, Script};
use serde::{Deserialize, Serialize};

use crate::decision::DecisionRequest;

/// Message sent from a running script to its front end.
#[derive(Debug)]
pub enum ScriptEvent {
    /// A new operation started.
    Operation(OperationStarted),
    /// Updated progress counters; dropped when the receiver lags.
    Progress(ScriptProgress),
    /// The script waits for an operator decision.
    Ask(DecisionRequest),
}

/// The operation now being executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStarted {
    pub index: usize,
    /// Verb describing the operation ("Copying", "Deleting", ...).
    pub verb: String,
    pub source: PathBuf,
    pub target: PathBuf,
}

/// Progress of a running script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptProgress {
    /// Index of the current operation.
    pub operation_index: usize,
    /// Number of operations in the script.
    pub operation_count: usize,
    /// Progress units done within the current operation.
    pub operation_done: u64,
    /// Weight of the current operation.
    pub operation_size: u64,
    /// Progress units done in the whole script.
    pub summary_done: u64,
    /// Weight of the whole script.
    pub summary_total: u64,
    /// Bytes per second of file data.
    pub transfer_speed: u64,
    /// Progress units per second.
    pub progress_speed: u64,
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (done.min(total) as f64 / total as f64) * 100.0
}

impl ScriptProgress {
    /// Progress of the current operation (0.0 to 100.0).
    pub fn operation_percentage(&self) -> f64 {
        percent(self.operation_done, self.operation_size)
    }

    /// Progress of the whole script (0.0 to 100.0).
    pub fn summary_percentage(&self) -> f64 {
        percent(self.summary_done, self.summary_total)
    }
}

/// How a script ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptOutcome {
    Finished,
    Cancelled,
    /// Aborted by an unrecoverable error.
    Failed(String),
}

/// Result of a finished script.
///
/// The script itself is handed back so the caller owns it again once the
/// job task is gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptReport {
    pub script: Script,
    pub outcome: ScriptOutcome,
    /// Operations completed.
    pub succeeded: usize,
    /// Operations skipped on operator request.
    pub skipped: usize,
    /// File bytes written.
    pub bytes_transferred: u64,
    /// Totals found by count-size operations.
    pub counted_sizes: Vec<(PathBuf, u64)>,
    /// Why operations were skipped.
    pub errors: Vec<OperationError>,
}

impl ScriptReport {
    /// Check if every operation completed.
    pub fn is_success(&self) -> bool {
        self.outcome == ScriptOutcome::Finished && self.skipped == 0
    }

    /// Get a human-readable summary of the run.
    pub fn summary(&self) -> String {
        let action = if self.script.settings.is_copy {
            "Processed"
        } else {
            "Moved"
        };
        let mut text = match &self.outcome {
            ScriptOutcome::Finished => format!("{} {} items", action, self.succeeded),
            ScriptOutcome::Cancelled => {
                format!("Cancelled after {} items", self.succeeded)
            }
            ScriptOutcome::Failed(message) => {
                format!("Failed after {} items: {}", self.succeeded, message)
            }
        };
        if self.skipped > 0 {
            text.push_str(&format!(", {} skipped", self.skipped));
        }
        text
    }
}
