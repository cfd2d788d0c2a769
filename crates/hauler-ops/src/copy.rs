//! Copying a single file, also used for moves across volumes.

use std::io;
use std::path::Path;
use std::sync::Arc;

use hauler_core::{EngineError, Operation};
use tracing::{debug, warn};

use crate::context::{check_name, Attempt, RunContext, StepOutcome};
use crate::decision::{ErrorCategory, Resolution};
use crate::fs::{
    begin_read, begin_write, disk_full, read_full_at, write_full_at, FileHandle, FileMeta,
    FileSystem, OpenMode,
};
use crate::pipeline::{IoSide, Pipeline, PipelineError};

/// Buffer used for alternate streams.
const STREAM_BUFFER: usize = 64 * 1024;

/// Why a data-copy attempt stopped.
#[derive(Debug)]
enum CopyFailure {
    Io {
        category: ErrorCategory,
        error: io::Error,
    },
    /// The pipeline cannot run; copy synchronously instead.
    FallBack,
    Cancelled,
    Fatal(String),
}

impl CopyFailure {
    fn side(side: IoSide, error: io::Error) -> Self {
        let category = match side {
            IoSide::Source => ErrorCategory::Read,
            IoSide::Target => ErrorCategory::Write,
        };
        Self::Io { category, error }
    }

    fn read(error: io::Error) -> Self {
        Self::side(IoSide::Source, error)
    }

    fn write(error: io::Error) -> Self {
        Self::side(IoSide::Target, error)
    }
}

/// Ask about a failed precondition; the only way on is to skip.
pub(crate) async fn precondition(
    ctx: &mut RunContext,
    category: ErrorCategory,
    op: &Operation,
    message: String,
) -> Result<StepOutcome, EngineError> {
    let source = (!op.source.as_os_str().is_empty()).then_some(op.source.as_path());
    let target = (!op.target.as_os_str().is_empty()).then_some(op.target.as_path());
    ctx.ask(category, source, target, &message).await?;
    Ok(ctx.skipped(op.display_path(), &message))
}

/// Copy `op.source` to `op.target`; with `is_move` the source is deleted
/// afterwards.
pub(crate) async fn copy_file(
    ctx: &mut RunContext,
    op: &Operation,
    is_move: bool,
) -> Result<StepOutcome, EngineError> {
    let source = op.source.as_path();
    let target = op.target.as_path();

    if !op.flags.ignore_invalid_name {
        if let Some(category) = check_name(target) {
            let message = format!("{} cannot be used as a file name", target.display());
            return precondition(ctx, category, op, message).await;
        }
    }

    let src_meta = match ctx
        .attempt(ErrorCategory::SourceOpen, Some(source), None, |fs| {
            fs.metadata(source)
        })
        .await?
    {
        Attempt::Done(meta) => meta,
        _ => return Ok(StepOutcome::Skipped),
    };

    if let Ok(dst_meta) = ctx.fs.metadata(target) {
        if dst_meta.same_file(&src_meta) {
            let message = format!("cannot copy {} onto itself", source.display());
            return precondition(ctx, ErrorCategory::CopyOntoSelf, op, message).await;
        }
        if dst_meta.is_dir() {
            let message = format!("{} is a directory", target.display());
            return precondition(ctx, ErrorCategory::ClassMismatch, op, message).await;
        }
        if let Some(outcome) = confirm_overwrite(ctx, op, &src_meta, &dst_meta).await? {
            return Ok(outcome);
        }
        ctx.clear_readonly(target);
    }

    if copy_data(ctx, op, src_meta.len).await? == StepOutcome::Skipped {
        return Ok(StepOutcome::Skipped);
    }
    if finish_attributes(ctx, op, &src_meta).await? == StepOutcome::Skipped {
        return Ok(StepOutcome::Skipped);
    }

    if is_move {
        ctx.clear_readonly(source);
        if let Attempt::Skipped = ctx
            .attempt(ErrorCategory::FileDelete, Some(source), None, |fs| {
                fs.remove_file(source)
            })
            .await?
        {
            return Ok(StepOutcome::Skipped);
        }
    }
    Ok(StepOutcome::Done)
}

/// Decide about an existing target; `Some` ends the operation.
pub(crate) async fn confirm_overwrite(
    ctx: &mut RunContext,
    op: &Operation,
    src_meta: &FileMeta,
    dst_meta: &FileMeta,
) -> Result<Option<StepOutcome>, EngineError> {
    if op.flags.overwrite_older_tested {
        return Ok(None);
    }
    if ctx.policy.overwrite_older {
        if src_meta.modified > dst_meta.modified {
            return Ok(None);
        }
        debug!(path = %op.target.display(), "target is not older, skipped");
        return Ok(Some(StepOutcome::Skipped));
    }
    let message = format!("{} already exists", op.target.display());
    match ctx
        .ask(
            ErrorCategory::Overwrite,
            Some(&op.source),
            Some(&op.target),
            &message,
        )
        .await?
    {
        Resolution::Proceed => Ok(None),
        _ => Ok(Some(ctx.skipped(&op.target, &message))),
    }
}

/// Remove a partially written target.
fn discard_target(fs: &dyn FileSystem, target: &Path) {
    match fs.remove_file(target) {
        Ok(()) => debug!(path = %target.display(), "removed partial target"),
        Err(e) => warn!(path = %target.display(), error = %e, "cannot remove partial target"),
    }
}

/// Copy the file content, retrying and resuming on operator request.
async fn copy_data(
    ctx: &mut RunContext,
    op: &Operation,
    len: u64,
) -> Result<StepOutcome, EngineError> {
    let source = op.source.as_path();
    let target = op.target.as_path();

    let sync_buffer = ctx
        .config
        .sync_buffer(!op.flags.both_sides_fast_or_network());
    let mut pipelined = ctx.config.use_async_copy && len > 0 && op.flags.prefers_pipelined();
    let mut buffer = if pipelined {
        ctx.config.async_buffer_for(len)
    } else {
        sync_buffer
    };
    debug!(
        path = %source.display(),
        bytes = len,
        buffer,
        pipelined,
        "copy strategy"
    );

    let network = op.flags.source_is_network || op.flags.target_is_network;
    ctx.status.enable_progress_buffer_limit(!pipelined && network);
    ctx.status.set_file_start_params();
    let (start_transferred, start_progress) = ctx.status.transferred_and_progress();

    let mut pipeline: Option<Pipeline> = None;
    let mut touched = false;
    loop {
        if let Err(e) = ctx.control.checkpoint().await {
            if touched {
                discard_target(ctx.fs.as_ref(), target);
            }
            return Err(e);
        }

        let resume = pipeline.as_ref().is_some_and(|p| p.durable() > 0);
        let src = match ctx
            .attempt(ErrorCategory::SourceOpen, Some(source), None, |fs| {
                fs.open_read(source)
            })
            .await
        {
            Ok(Attempt::Done(handle)) => handle,
            Ok(_) => {
                if touched {
                    discard_target(ctx.fs.as_ref(), target);
                }
                return Ok(StepOutcome::Skipped);
            }
            Err(e) => {
                if touched {
                    discard_target(ctx.fs.as_ref(), target);
                }
                return Err(e);
            }
        };
        let mode = if resume {
            OpenMode::Existing
        } else {
            OpenMode::Truncate
        };
        let dst = match ctx
            .attempt(ErrorCategory::TargetCreate, Some(source), Some(target), |fs| {
                fs.open_write(target, mode)
            })
            .await
        {
            Ok(Attempt::Done(handle)) => handle,
            Ok(_) => {
                if touched {
                    discard_target(ctx.fs.as_ref(), target);
                }
                return Ok(StepOutcome::Skipped);
            }
            Err(e) => {
                if touched {
                    discard_target(ctx.fs.as_ref(), target);
                }
                return Err(e);
            }
        };
        touched = true;

        let result = match preallocate(ctx, &dst, len, resume) {
            Err(e) => Err(CopyFailure::write(e)),
            Ok(()) if pipelined => {
                run_pipelined(ctx, &mut pipeline, src, dst, buffer, target, len).await
            }
            Ok(()) => run_sync(ctx, src, dst, buffer, target).await,
        };

        let (category, error) = match result {
            Ok(written) => {
                debug!(path = %target.display(), bytes = written, "data copied");
                return Ok(StepOutcome::Done);
            }
            Err(CopyFailure::FallBack) => {
                debug!(path = %target.display(), "asynchronous copy unavailable, copying synchronously");
                pipelined = false;
                pipeline = None;
                buffer = sync_buffer;
                ctx.status.rollback_to(start_transferred, start_progress);
                continue;
            }
            Err(CopyFailure::Cancelled) => {
                discard_target(ctx.fs.as_ref(), target);
                return Err(EngineError::Cancelled);
            }
            Err(CopyFailure::Fatal(message)) => {
                discard_target(ctx.fs.as_ref(), target);
                return Err(EngineError::fatal(message));
            }
            Err(CopyFailure::Io { category, error }) => (category, error),
        };

        match ctx
            .ask(category, Some(source), Some(target), &error)
            .await
        {
            Ok(Resolution::Retry) => {
                if pipeline.is_none() {
                    // Synchronous copies start over.
                    ctx.status.rollback_to(start_transferred, start_progress);
                }
                let transferred = ctx.status.reset_transfer_speed_if_needed();
                debug!(path = %target.display(), transferred, "retrying copy");
            }
            Ok(_) => {
                discard_target(ctx.fs.as_ref(), target);
                return Ok(ctx.skipped(target, &error));
            }
            Err(e) => {
                discard_target(ctx.fs.as_ref(), target);
                return Err(e);
            }
        }
    }
}

/// Reserve the target's final length up front.
fn preallocate(
    ctx: &mut RunContext,
    dst: &Arc<dyn FileHandle>,
    len: u64,
    resume: bool,
) -> io::Result<()> {
    if resume || len < ctx.config.preallocate_min_size || ctx.policy.preallocation_disabled {
        return Ok(());
    }
    match dst.set_len(len) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::StorageFull => Err(e),
        Err(e) => {
            warn!(error = %e, "preallocation failed, disabled for this run");
            ctx.policy.preallocation_disabled = true;
            Ok(())
        }
    }
}

/// Cut the target to the bytes written (the source may have shrunk below a
/// preallocated length) and make it durable.
fn finish_target(dst: &dyn FileHandle, written: u64) -> io::Result<()> {
    if dst.size()? != written {
        dst.set_len(written)?;
    }
    dst.flush()
}

/// Whether the `tail` bytes before `end` are the same in both files.
fn tail_matches(
    src: &dyn FileHandle,
    dst: &dyn FileHandle,
    end: u64,
    tail: usize,
) -> io::Result<bool> {
    let len = usize::try_from(end).map_or(tail, |end| end.min(tail));
    if len == 0 {
        return Ok(true);
    }
    let start = end - len as u64;
    let mut expected = vec![0; len];
    let mut actual = vec![0; len];
    let read_src = read_full_at(src, &mut expected, start)?;
    let read_dst = read_full_at(dst, &mut actual, start)?;
    Ok(read_src == len && read_dst == len && expected == actual)
}

async fn run_pipelined(
    ctx: &mut RunContext,
    slot: &mut Option<Pipeline>,
    src: Arc<dyn FileHandle>,
    dst: Arc<dyn FileHandle>,
    buffer: usize,
    target: &Path,
    len: u64,
) -> Result<u64, CopyFailure> {
    let resumed = slot.is_some();
    if !resumed {
        let pipeline = Pipeline::new(
            Arc::clone(&src),
            Arc::clone(&dst),
            target,
            Arc::clone(&ctx.status),
            buffer,
        )
        .map_err(|e| match e {
            PipelineError::Io { side, source, .. } => CopyFailure::side(side, source),
            PipelineError::Cancelled => CopyFailure::Cancelled,
            PipelineError::Allocation => CopyFailure::FallBack,
        })?;
        *slot = Some(pipeline);
    }
    let Some(pipeline) = slot.as_mut() else {
        return Err(CopyFailure::FallBack);
    };

    if resumed {
        pipeline.resume(Arc::clone(&src), Arc::clone(&dst));
        let end = pipeline.durable();
        let verified = tail_matches(src.as_ref(), dst.as_ref(), end, ctx.config.tail_verify_size)
            .map_err(|error| CopyFailure::Io {
                category: ErrorCategory::TailMismatch,
                error,
            })?;
        if verified {
            debug!(path = %target.display(), offset = end, "resuming copy");
        } else {
            warn!(path = %target.display(), offset = end, "target differs before resume point, starting over");
            let (transferred, progress) = ctx.status.transferred_and_progress();
            ctx.status
                .rollback_to(transferred.saturating_sub(end), progress.saturating_sub(end));
            pipeline.restart();
        }
    }

    let written = match pipeline.run(&ctx.control).await {
        Ok(written) => written,
        Err(PipelineError::Io { side, source, .. }) => return Err(CopyFailure::side(side, source)),
        Err(PipelineError::Cancelled) => return Err(CopyFailure::Cancelled),
        Err(PipelineError::Allocation) => return Err(CopyFailure::FallBack),
    };
    if written != len {
        debug!(path = %target.display(), expected = len, written, "source changed size during copy");
    }
    finish_target(dst.as_ref(), written).map_err(CopyFailure::write)?;
    Ok(written)
}

async fn run_sync(
    ctx: &mut RunContext,
    src: Arc<dyn FileHandle>,
    dst: Arc<dyn FileHandle>,
    buffer: usize,
    target: &Path,
) -> Result<u64, CopyFailure> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(buffer)
        .map_err(|_| CopyFailure::Fatal("not enough memory for the copy buffer".to_string()))?;
    let mut chunk = ctx.status.chunk_size(buffer);
    let mut offset = 0u64;

    loop {
        if ctx.control.checkpoint().await.is_err() {
            return Err(CopyFailure::Cancelled);
        }
        let done = begin_read(&src, std::mem::take(&mut buf), chunk, offset)
            .wait()
            .await;
        buf = done.buf;
        let read = done.result.map_err(CopyFailure::read)?;
        if read == 0 {
            break;
        }

        let done = begin_write(&dst, std::mem::take(&mut buf), read, offset)
            .wait()
            .await;
        buf = done.buf;
        let written = done.result.map_err(CopyFailure::write)?;
        if written < read {
            return Err(CopyFailure::write(disk_full(target)));
        }

        offset += read as u64;
        let sleep = ctx
            .status
            .add_bytes(read as u64, false, buffer, Some(&mut chunk), buffer);
        ctx.report_progress(false);
        ctx.throttle(sleep).await;
    }

    finish_target(dst.as_ref(), offset).map_err(CopyFailure::write)?;
    Ok(offset)
}

/// Copy every alternate stream of `source` onto `target`.
pub(crate) fn copy_streams(fs: &dyn FileSystem, source: &Path, target: &Path) -> io::Result<()> {
    let mut buf = vec![0; STREAM_BUFFER];
    for name in fs.list_streams(source)? {
        let from = fs.open_stream_read(source, &name)?;
        let to = fs.create_stream(target, &name)?;
        let mut offset = 0u64;
        loop {
            let read = read_full_at(from.as_ref(), &mut buf, offset)?;
            if read == 0 {
                break;
            }
            if write_full_at(to.as_ref(), &buf[..read], offset)? < read {
                return Err(disk_full(target));
            }
            offset += read as u64;
        }
        to.flush()?;
    }
    Ok(())
}

/// Carry streams, attributes, security and times over to a copied file.
async fn finish_attributes(
    ctx: &mut RunContext,
    op: &Operation,
    src_meta: &FileMeta,
) -> Result<StepOutcome, EngineError> {
    let source = op.source.as_path();
    let target = op.target.as_path();
    let (s, t) = (Some(source), Some(target));

    if op.flags.copy_streams {
        ctx.attempt(ErrorCategory::Streams, s, t, |fs| {
            copy_streams(fs, source, target)
        })
        .await?;
    }

    if ctx.settings.preserve_attrs && src_meta.compressed {
        if let Attempt::Skipped = ctx
            .attempt(ErrorCategory::CompressionLoss, s, t, |fs| {
                fs.set_compressed(target, true)
            })
            .await?
        {
            discard_target(ctx.fs.as_ref(), target);
            return Ok(StepOutcome::Skipped);
        }
    }

    if (ctx.settings.preserve_attrs && src_meta.encrypted) || op.flags.as_encrypted {
        if let Attempt::Skipped = ctx
            .attempt(ErrorCategory::EncryptionLoss, s, t, |fs| {
                fs.set_encrypted(target, true)
            })
            .await?
        {
            discard_target(ctx.fs.as_ref(), target);
            return Ok(StepOutcome::Skipped);
        }
    }

    if ctx.settings.preserve_security {
        ctx.attempt(ErrorCategory::Security, s, t, |fs| {
            copy_security(fs, source, target)
        })
        .await?;
    }

    let times = src_meta.times();
    ctx.attempt(ErrorCategory::FileTime, s, t, |fs| fs.set_times(target, times))
        .await?;

    if src_meta.readonly && !ctx.settings.clear_readonly {
        ctx.attempt(ErrorCategory::Attributes, s, t, |fs| {
            fs.set_readonly(target, true)
        })
        .await?;
    }
    Ok(StepOutcome::Done)
}

/// Copy permissions and ownership; a partial copy is an error.
pub(crate) fn copy_security(fs: &dyn FileSystem, source: &Path, target: &Path) -> io::Result<()> {
    let security = fs.security(source)?;
    let applied = fs.set_security(target, &security)?;
    if applied.is_complete() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "owner and group could not be copied",
        ))
    }
}
