//! Directory creation.

use std::io;

use hauler_core::{EngineError, Operation};
use tracing::debug;

use crate::context::{check_name, Attempt, RunContext, StepOutcome};
use crate::copy::{copy_security, copy_streams, precondition};
use crate::decision::{ErrorCategory, Resolution};

/// Create `op.target`; an existing directory is merged into.
///
/// When the operation carries a source directory, its streams, security and
/// encryption are carried over as well.
pub(crate) async fn create_dir(
    ctx: &mut RunContext,
    op: &Operation,
) -> Result<StepOutcome, EngineError> {
    let target = op.target.as_path();
    let source = (!op.source.as_os_str().is_empty()).then_some(op.source.as_path());

    if !op.flags.ignore_invalid_name {
        if let Some(category) = check_name(target) {
            let message = format!("{} cannot be used as a directory name", target.display());
            return precondition(ctx, category, op, message).await;
        }
    }

    loop {
        match ctx.fs.symlink_metadata(target) {
            Ok(meta) if meta.is_dir() => {
                debug!(path = %target.display(), "directory exists, merging");
                return Ok(StepOutcome::Done);
            }
            Ok(_) => {
                let error = io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a directory", target.display()),
                );
                match ctx
                    .ask(ErrorCategory::DirCreate, source, Some(target), &error)
                    .await?
                {
                    Resolution::Retry => continue,
                    _ => return Ok(ctx.skipped(target, &error)),
                }
            }
            Err(_) => break,
        }
    }

    match ctx
        .attempt(ErrorCategory::DirCreate, source, Some(target), |fs| {
            fs.create_dir(target)
        })
        .await?
    {
        Attempt::Done(()) => {}
        Attempt::Ignored => return Ok(StepOutcome::Done),
        Attempt::Skipped => return Ok(StepOutcome::Skipped),
    }

    let Some(source) = source else {
        return Ok(StepOutcome::Done);
    };
    let (s, t) = (Some(source), Some(target));

    if ctx.settings.preserve_security {
        ctx.attempt(ErrorCategory::Security, s, t, |fs| {
            copy_security(fs, source, target)
        })
        .await?;
    }
    if op.flags.copy_streams {
        ctx.attempt(ErrorCategory::Streams, s, t, |fs| {
            copy_streams(fs, source, target)
        })
        .await?;
    }
    if op.flags.as_encrypted {
        if let Attempt::Skipped = ctx
            .attempt(ErrorCategory::EncryptionLoss, s, t, |fs| {
                fs.set_encrypted(target, true)
            })
            .await?
        {
            return Ok(StepOutcome::Skipped);
        }
    }
    Ok(StepOutcome::Done)
}
