//! Script driver: runs the operations of a script one after another on a
//! tokio task and reports to a front end through [`ScriptEvent`]s.

use std::sync::Arc;

use hauler_core::{EngineConfig, EngineError, OpCode, Operation, Script};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::attrs::{change_attrs, copy_dir_time, count_size};
use crate::clock::{Clock, SystemClock};
use crate::context::{RunContext, StepOutcome};
use crate::control::JobControl;
use crate::convert::convert_file;
use crate::copy::copy_file;
use crate::create::create_dir;
use crate::decision::{Decision, DecisionRequest, ErrorCategory};
use crate::delete::{delete_dir, delete_dir_link, delete_file};
use crate::fs::FileSystem;
use crate::move_op::{move_dir, move_file};
use crate::progress::{OperationStarted, ScriptEvent, ScriptOutcome, ScriptReport};
use crate::status::OperationStatus;

/// A script together with everything needed to run it.
#[derive(Debug)]
pub struct Job {
    pub script: Script,
    pub fs: Arc<dyn FileSystem>,
    pub config: Arc<EngineConfig>,
    pub control: JobControl,
    pub clock: Arc<dyn Clock>,
}

impl Job {
    /// Create a job with the default configuration and the system clock.
    pub fn new(script: Script, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            script,
            fs,
            config: Arc::new(EngineConfig::default()),
            control: JobControl::new(),
            clock: Arc::new(SystemClock::new()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Use an existing control, e.g. one handed out by a [`JobQueue`](crate::JobQueue).
    pub fn with_control(mut self, control: JobControl) -> Self {
        self.control = control;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Handle to a running script.
#[derive(Debug)]
pub struct ScriptHandle {
    /// Events from the script; questions must be answered to make progress.
    pub events: mpsc::Receiver<ScriptEvent>,
    pub control: JobControl,
    /// Live counters and speeds.
    pub status: Arc<OperationStatus>,
    /// Resolves to the final report.
    pub task: JoinHandle<ScriptReport>,
}

impl ScriptHandle {
    /// Drain the events, answering every question with `answer`, and wait
    /// for the report.
    pub async fn run_with<F>(mut self, mut answer: F) -> Result<ScriptReport, EngineError>
    where
        F: FnMut(&DecisionRequest) -> Decision,
    {
        while let Some(event) = self.events.recv().await {
            if let ScriptEvent::Ask(request) = event {
                let decision = answer(&request);
                request.answer(decision);
            }
        }
        self.task
            .await
            .map_err(|e| EngineError::fatal(format!("script task failed: {e}")))
    }
}

/// Start executing `job` on a new task.
///
/// Must be called from within a tokio runtime.
pub fn start_script(job: Job) -> ScriptHandle {
    let (tx, rx) = mpsc::channel(job.config.event_channel_size.max(1));
    let status = Arc::new(OperationStatus::new(
        Arc::clone(&job.clock),
        job.script.settings.speed_limit,
    ));
    let control = job.control.clone();

    let task_status = Arc::clone(&status);
    let task = tokio::spawn(async move { run_script(job, task_status, tx).await });

    ScriptHandle {
        events: rx,
        control,
        status,
        task,
    }
}

/// Counters kept while the operations run.
#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    skipped: usize,
}

async fn run_script(
    job: Job,
    status: Arc<OperationStatus>,
    events: mpsc::Sender<ScriptEvent>,
) -> ScriptReport {
    let Job {
        script,
        fs,
        config,
        control,
        ..
    } = job;
    info!(
        operations = script.len(),
        bytes = script.totals.total_file_size,
        "script started"
    );

    let mut ctx = RunContext::new(
        fs,
        Arc::clone(&status),
        config,
        script.settings.clone(),
        control,
        events,
        script.len(),
        script.totals.total_size,
    );
    ctx.change_attrs = script.change_attrs;
    ctx.convert = script.convert.clone();
    status.init_speed_meters(false);

    let mut tally = Tally::default();
    let outcome = match execute(&mut ctx, &script, &mut tally).await {
        Ok(()) => ScriptOutcome::Finished,
        Err(EngineError::Cancelled) => ScriptOutcome::Cancelled,
        Err(e) => ScriptOutcome::Failed(e.to_string()),
    };
    ctx.report_progress(true);

    let (bytes_transferred, _) = status.transferred_and_progress();
    info!(
        outcome = ?outcome,
        succeeded = tally.succeeded,
        skipped = tally.skipped,
        bytes = bytes_transferred,
        "script finished"
    );
    ScriptReport {
        script,
        outcome,
        succeeded: tally.succeeded,
        skipped: tally.skipped,
        bytes_transferred,
        counted_sizes: std::mem::take(&mut ctx.counted_sizes),
        errors: std::mem::take(&mut ctx.errors),
    }
}

/// Ask once whether to start although the target looks too small.
async fn check_free_space(ctx: &mut RunContext, script: &Script) -> Result<(), EngineError> {
    let Some(free) = script.totals.free_space else {
        return Ok(());
    };
    let required = script
        .totals
        .occupied_space
        .max(script.totals.total_file_size);
    if required <= free {
        return Ok(());
    }
    let target = script
        .operations
        .iter()
        .find(|op| !op.target.as_os_str().is_empty())
        .map(|op| op.target.clone());
    let message = format!("{required} bytes are needed but only {free} bytes are free");
    ctx.ask(
        ErrorCategory::InsufficientSpace,
        None,
        target.as_deref(),
        &message,
    )
    .await?;
    Ok(())
}

async fn execute(
    ctx: &mut RunContext,
    script: &Script,
    tally: &mut Tally,
) -> Result<(), EngineError> {
    check_free_space(ctx, script).await?;

    let mut index = 0;
    while index < script.operations.len() {
        let op = &script.operations[index];
        if let OpCode::SkipLabel { .. } = op.opcode {
            index += 1;
            continue;
        }

        ctx.begin_operation(
            OperationStarted {
                index,
                verb: op.opcode.verb().to_string(),
                source: op.source.clone(),
                target: op.target.clone(),
            },
            op.size,
        )
        .await?;
        let start = ctx.operation_start();

        let outcome = run_operation(ctx, op).await?;
        let mut progress = start + op.size;
        let mut next = index + 1;
        match outcome {
            StepOutcome::Done => tally.succeeded += 1,
            StepOutcome::Skipped => {
                tally.skipped += 1;
                if op.opcode == OpCode::CreateDir {
                    if let Some((label, skipped_size)) = script.skip_label_for(index) {
                        debug!(
                            path = %op.target.display(),
                            skipped = label - index - 1,
                            "directory skipped with its contents"
                        );
                        progress += skipped_size;
                        next = label + 1;
                    }
                }
            }
        }
        ctx.status.set_progress(progress);
        ctx.report_progress(true);
        index = next;
    }
    Ok(())
}

async fn run_operation(ctx: &mut RunContext, op: &Operation) -> Result<StepOutcome, EngineError> {
    match &op.opcode {
        OpCode::CopyFile => copy_file(ctx, op, false).await,
        OpCode::MoveFile => move_file(ctx, op).await,
        OpCode::MoveDir => move_dir(ctx, op).await,
        OpCode::CreateDir => create_dir(ctx, op).await,
        OpCode::DeleteFile => delete_file(ctx, op).await,
        OpCode::DeleteDir => delete_dir(ctx, op).await,
        OpCode::DeleteDirLink => delete_dir_link(ctx, op).await,
        OpCode::ChangeAttrs { attributes } => change_attrs(ctx, op, *attributes).await,
        OpCode::Convert => convert_file(ctx, op).await,
        OpCode::CountSize => count_size(ctx, op).await,
        OpCode::CopyDirTime { modified } => copy_dir_time(ctx, op, *modified).await,
        OpCode::SkipLabel { .. } => Ok(StepOutcome::Done),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use hauler_core::{OperationFlags, ScriptSettings};

    use super::*;
    use crate::fs::MemFs;

    #[tokio::test]
    async fn test_empty_script_finishes() {
        let job = Job::new(Script::default(), Arc::new(MemFs::new()));
        let report = start_script(job)
            .run_with(|_| Decision::Cancel)
            .await
            .unwrap();
        assert_eq!(report.outcome, ScriptOutcome::Finished);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_copy_reaches_full_progress() {
        let fs = MemFs::new();
        fs.add_file("/s/a", vec![3; 10_000]);
        fs.add_dir("/t");
        let mut script = Script::new(ScriptSettings::default());
        script.push(Operation::copy_file("/s/a", "/t/a", 10_000).with_flags(OperationFlags {
            source_is_fast: true,
            target_is_fast: true,
            ..Default::default()
        }));
        let total = script.totals.total_size;

        let handle = start_script(Job::new(script, Arc::new(fs.clone())));
        let status = Arc::clone(&handle.status);
        let report = handle.run_with(|_| Decision::Cancel).await.unwrap();

        assert!(report.is_success(), "{}", report.summary());
        assert_eq!(report.bytes_transferred, 10_000);
        assert_eq!(status.transferred_and_progress().1, total);
        assert_eq!(fs.get_data(Path::new("/t/a")), Some(vec![3; 10_000]));
    }

    #[tokio::test]
    async fn test_skipped_dir_jumps_to_label() {
        let fs = MemFs::new();
        fs.add_file("/t/d", b"in the way".to_vec());
        fs.add_file("/s/d/a", vec![1; 100]);
        let mut script = Script::default();
        let dir = script.push(Operation::create_dir("/t/d"));
        script.push(Operation::copy_file("/s/d/a", "/t/d/a", 100));
        let skipped_size = script.operations[1].size;
        script.push(Operation::new(
            OpCode::SkipLabel {
                create_dir_index: dir,
                skipped_size,
            },
            "",
            "",
            0,
        ));
        let total = script.totals.total_size;

        let handle = start_script(Job::new(script, Arc::new(fs.clone())));
        let status = Arc::clone(&handle.status);
        let report = handle.run_with(|_| Decision::Skip).await.unwrap();

        assert_eq!(report.outcome, ScriptOutcome::Finished);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.succeeded, 0);
        assert_eq!(status.transferred_and_progress().1, total);
        assert!(fs.get_data(Path::new("/t/d/a")).is_none());
    }

    #[tokio::test]
    async fn test_cancel_answer_cancels_script() {
        let fs = MemFs::new();
        let mut script = Script::default();
        script.push(Operation::copy_file("/missing", "/t/a", 10));

        let report = start_script(Job::new(script, Arc::new(fs)))
            .run_with(|_| Decision::Cancel)
            .await
            .unwrap();
        assert_eq!(report.outcome, ScriptOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_job_leaves_files_alone() {
        let fs = MemFs::new();
        let mut script = Script::default();
        for name in ["/d/a", "/d/b", "/d/c"] {
            fs.add_file(name, vec![1; 10]);
            script.push(Operation::delete_file(name));
        }
        let control = JobControl::new();
        control.cancel();

        let job = Job::new(script, Arc::new(fs.clone())).with_control(control);
        let report = start_script(job)
            .run_with(|_| Decision::Cancel)
            .await
            .unwrap();

        assert_eq!(report.outcome, ScriptOutcome::Cancelled);
        assert_eq!(report.succeeded, 0);
        for name in ["/d/a", "/d/b", "/d/c"] {
            assert!(fs.get_data(Path::new(name)).is_some(), "{name} was deleted");
        }
    }
}
