//! State shared by the operations of one running script.

use std::fmt::Display;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hauler_core::{ChangeAttrsData, ConvertData, EngineConfig, EngineError, OperationError, ScriptSettings};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::control::JobControl;
use crate::decision::{Decision, DecisionRequest, ErrorCategory, Resolution, RunPolicy};
use crate::fs::FileSystem;
use crate::progress::{OperationStarted, ScriptEvent, ScriptProgress};
use crate::status::OperationStatus;

/// Longest file name accepted on a target.
pub const MAX_NAME_LEN: usize = 255;

/// How one operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    /// Abandoned on operator request (or by a "skip all" answer).
    Skipped,
}

/// Result of [`RunContext::attempt`].
#[derive(Debug)]
pub(crate) enum Attempt<T> {
    Done(T),
    /// Failed, and the operator chose to go on anyway.
    Ignored,
    /// Failed, and the operation is abandoned.
    Skipped,
}

/// Check a target name; trailing spaces and dots are rejected because
/// several file systems silently strip them.
pub fn check_name(path: &Path) -> Option<ErrorCategory> {
    let Some(name) = path.file_name() else {
        return Some(ErrorCategory::InvalidName);
    };
    let name = name.to_string_lossy();
    if name.len() > MAX_NAME_LEN {
        return Some(ErrorCategory::NameTooLong);
    }
    if name.is_empty() || name.ends_with(' ') || name.ends_with('.') || name.contains('\0') {
        return Some(ErrorCategory::InvalidName);
    }
    None
}

#[derive(Debug, Clone, Copy, Default)]
struct CurrentOperation {
    index: usize,
    start_progress: u64,
    size: u64,
}

/// Everything an operation needs while it runs.
#[derive(Debug)]
pub struct RunContext {
    pub fs: Arc<dyn FileSystem>,
    pub status: Arc<OperationStatus>,
    pub config: Arc<EngineConfig>,
    pub settings: ScriptSettings,
    pub change_attrs: Option<ChangeAttrsData>,
    pub convert: Option<ConvertData>,
    pub policy: RunPolicy,
    pub control: JobControl,
    events: mpsc::Sender<ScriptEvent>,
    operation_count: usize,
    summary_total: u64,
    current: CurrentOperation,
    last_progress_ms: Option<u64>,
    /// Why operations were skipped.
    pub errors: Vec<OperationError>,
    /// Results of count-size operations.
    pub counted_sizes: Vec<(PathBuf, u64)>,
}

impl RunContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fs: Arc<dyn FileSystem>,
        status: Arc<OperationStatus>,
        config: Arc<EngineConfig>,
        settings: ScriptSettings,
        control: JobControl,
        events: mpsc::Sender<ScriptEvent>,
        operation_count: usize,
        summary_total: u64,
    ) -> Self {
        let policy = RunPolicy::new(settings.overwrite_all, settings.overwrite_older);
        Self {
            fs,
            status,
            config,
            settings,
            change_attrs: None,
            convert: None,
            policy,
            control,
            events,
            operation_count,
            summary_total,
            current: CurrentOperation::default(),
            last_progress_ms: None,
            errors: Vec::new(),
            counted_sizes: Vec::new(),
        }
    }

    /// Ask the operator how to handle a failure.
    ///
    /// Earlier "for all" answers are applied without asking. A Cancel answer
    /// (or a front end that went away) becomes [`EngineError::Cancelled`].
    pub async fn ask(
        &mut self,
        category: ErrorCategory,
        source: Option<&Path>,
        target: Option<&Path>,
        error: &(dyn Display + Sync),
    ) -> Result<Resolution, EngineError> {
        if let Some(resolution) = self.policy.auto_answer(category) {
            debug!(%category, ?resolution, error = %error, "answered by earlier decision");
            return Ok(resolution);
        }
        self.control.checkpoint().await?;

        let (request, reply) = DecisionRequest::new(
            category,
            source.map(Path::to_path_buf),
            target.map(Path::to_path_buf),
            error.to_string(),
        );
        if self.events.send(ScriptEvent::Ask(request)).await.is_err() {
            return Err(EngineError::Cancelled);
        }
        let decision = tokio::select! {
            answer = reply => answer.unwrap_or(Decision::Cancel),
            _ = self.control.token().cancelled() => Decision::Cancel,
        };
        debug!(%category, %decision, "operator decision");
        self.policy.record(category, decision);
        match decision.resolution() {
            Resolution::Cancel => Err(EngineError::Cancelled),
            resolution => Ok(resolution),
        }
    }

    /// Run `f` until it succeeds or the operator gives up on it.
    ///
    /// Retry runs it again, Ignore moves on as if it had worked and Skip
    /// records the failure against `target` (or `source`).
    pub(crate) async fn attempt<T, F>(
        &mut self,
        category: ErrorCategory,
        source: Option<&Path>,
        target: Option<&Path>,
        mut f: F,
    ) -> Result<Attempt<T>, EngineError>
    where
        F: FnMut(&dyn FileSystem) -> io::Result<T>,
    {
        loop {
            let error = match f(self.fs.as_ref()) {
                Ok(value) => return Ok(Attempt::Done(value)),
                Err(e) => e,
            };
            match self.ask(category, source, target, &error).await? {
                Resolution::Retry => continue,
                Resolution::Proceed => {
                    warn!(%category, error = %error, "ignored");
                    return Ok(Attempt::Ignored);
                }
                Resolution::Skip | Resolution::Cancel => {
                    let path = target.or(source).unwrap_or(Path::new(""));
                    self.skipped(path, &error);
                    return Ok(Attempt::Skipped);
                }
            }
        }
    }

    /// Record why an operation was skipped.
    pub fn skipped(&mut self, path: &Path, error: &(dyn Display + Sync)) -> StepOutcome {
        warn!(path = %path.display(), error = %error, "skipped");
        self.errors
            .push(OperationError::new(path.to_path_buf(), error.to_string()));
        StepOutcome::Skipped
    }

    /// Sleep owed to the speed limit, cut short by cancellation.
    pub async fn throttle(&self, sleep: Duration) {
        if sleep.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = self.control.token().cancelled() => {}
        }
    }

    /// Announce the operation at `index`, waiting while the job is paused.
    ///
    /// Fails with [`EngineError::Cancelled`] when the job was cancelled or
    /// the front end went away.
    pub(crate) async fn begin_operation(
        &mut self,
        started: OperationStarted,
        size: u64,
    ) -> Result<(), EngineError> {
        self.control.checkpoint().await?;
        let (_, progress) = self.status.transferred_and_progress();
        self.current = CurrentOperation {
            index: started.index,
            start_progress: progress,
            size,
        };
        self.events
            .send(ScriptEvent::Operation(started))
            .await
            .map_err(|_| EngineError::Cancelled)
    }

    /// Progress counter at the start of the current operation.
    pub(crate) fn operation_start(&self) -> u64 {
        self.current.start_progress
    }

    /// Current progress, ready to send.
    pub fn progress(&self) -> ScriptProgress {
        let snapshot = self.status.get_status();
        ScriptProgress {
            operation_index: self.current.index,
            operation_count: self.operation_count,
            operation_done: snapshot
                .progress_size
                .saturating_sub(self.current.start_progress)
                .min(self.current.size),
            operation_size: self.current.size,
            summary_done: snapshot.progress_size.min(self.summary_total),
            summary_total: self.summary_total,
            transfer_speed: snapshot.transfer_speed,
            progress_speed: snapshot.progress_speed,
        }
    }

    /// Send a progress update unless one went out recently; `force` ignores
    /// the interval. Updates are dropped when the front end lags.
    pub fn report_progress(&mut self, force: bool) {
        let now = self.status.now_ms();
        let due = self
            .last_progress_ms
            .is_none_or(|last| now.saturating_sub(last) >= self.config.progress_interval_ms);
        if !force && !due {
            return;
        }
        self.last_progress_ms = Some(now);
        let _ = self.events.try_send(ScriptEvent::Progress(self.progress()));
    }

    /// Clear the read-only attribute so `path` can be replaced or removed.
    pub(crate) fn clear_readonly(&self, path: &Path) -> bool {
        match self.fs.symlink_metadata(path) {
            Ok(meta) if meta.readonly => self.fs.set_readonly(path, false).is_ok(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::fs::MemFs;

    fn context() -> (RunContext, mpsc::Receiver<ScriptEvent>) {
        let (tx, rx) = mpsc::channel(4);
        let status = Arc::new(OperationStatus::new(Arc::new(SystemClock::new()), None));
        let ctx = RunContext::new(
            Arc::new(MemFs::new()),
            status,
            Arc::new(EngineConfig::default()),
            ScriptSettings::default(),
            JobControl::new(),
            tx,
            1,
            100,
        );
        (ctx, rx)
    }

    #[test]
    fn test_check_name() {
        assert_eq!(check_name(Path::new("/a/ok.txt")), None);
        assert_eq!(
            check_name(Path::new("/a/bad.")),
            Some(ErrorCategory::InvalidName)
        );
        assert_eq!(
            check_name(Path::new("/a/bad ")),
            Some(ErrorCategory::InvalidName)
        );
        let long = format!("/a/{}", "x".repeat(MAX_NAME_LEN + 1));
        assert_eq!(
            check_name(Path::new(&long)),
            Some(ErrorCategory::NameTooLong)
        );
    }

    #[tokio::test]
    async fn test_ask_roundtrip_and_skip_all() {
        let (mut ctx, mut rx) = context();
        let answerer = tokio::spawn(async move {
            if let Some(ScriptEvent::Ask(request)) = rx.recv().await {
                assert_eq!(request.category, ErrorCategory::Read);
                request.answer(Decision::SkipAll);
            }
            rx
        });
        let resolution = ctx
            .ask(ErrorCategory::Read, Some(Path::new("/a")), None, &"boom")
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Skip);
        let _rx = answerer.await.unwrap();

        // Remembered: no second question.
        let resolution = ctx
            .ask(ErrorCategory::Read, Some(Path::new("/b")), None, &"boom")
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Skip);
    }

    #[tokio::test]
    async fn test_ask_without_front_end_cancels() {
        let (mut ctx, rx) = context();
        drop(rx);
        let result = ctx
            .ask(ErrorCategory::Write, None, Some(Path::new("/t")), &"full")
            .await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[test]
    fn test_skipped_records_error() {
        let (mut ctx, _rx) = context();
        assert_eq!(
            ctx.skipped(Path::new("/x"), &"denied"),
            StepOutcome::Skipped
        );
        assert_eq!(ctx.errors.len(), 1);
        assert_eq!(ctx.errors[0].message, "denied");
    }

    fn started(index: usize) -> OperationStarted {
        OperationStarted {
            index,
            verb: "Deleting".to_string(),
            source: PathBuf::from("/x"),
            target: PathBuf::new(),
        }
    }

    #[tokio::test]
    async fn test_begin_operation_stops_when_cancelled() {
        let (mut ctx, _rx) = context();
        ctx.control.cancel();
        let result = ctx.begin_operation(started(0), 10).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_begin_operation_without_front_end_cancels() {
        let (mut ctx, rx) = context();
        drop(rx);
        let result = ctx.begin_operation(started(0), 10).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
