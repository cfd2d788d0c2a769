//! Moving files and directories within a volume.

use std::io;
use std::path::{Path, PathBuf};

use hauler_core::{EngineError, Operation};
use tracing::debug;

use crate::context::{check_name, Attempt, RunContext, StepOutcome};
use crate::copy::{confirm_overwrite, copy_file, precondition};
use crate::decision::{ErrorCategory, Resolution};
use crate::fs::FileSystem;

/// Generate an unused sibling name for `path`.
///
/// For "file.txt", tries "file.txt.1.tmp", "file.txt.2.tmp", etc.
pub(crate) fn temp_sibling(fs: &dyn FileSystem, path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or(Path::new(""));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    for i in 1..1000 {
        let candidate = parent.join(format!("{name}.{i}.tmp"));
        if !fs.exists(&candidate) {
            return candidate;
        }
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    parent.join(format!("{name}.{timestamp}.tmp"))
}

/// Whether `source` and the place `target` will be created share a volume.
pub(crate) fn same_volume(fs: &dyn FileSystem, source: &Path, target: &Path) -> bool {
    let target_dir = target.parent().unwrap_or(target);
    match (fs.volume_info(source), fs.volume_info(target_dir)) {
        (Ok(a), Ok(b)) => a.id == b.id,
        _ => false,
    }
}

/// Rename through a temporary name, for targets that are another name of
/// the source (case-only renames, short-name aliases).
fn rename_via_temp(fs: &dyn FileSystem, source: &Path, target: &Path) -> io::Result<()> {
    let temp = temp_sibling(fs, source);
    fs.rename(source, &temp)?;
    if let Err(e) = fs.rename(&temp, target) {
        let _ = fs.rename(&temp, source);
        return Err(e);
    }
    Ok(())
}

/// How a rename attempt ended.
enum Renamed {
    Done(StepOutcome),
    /// The target lies on another volume.
    CrossesDevices,
}

/// Rename `op.source` to `op.target`, clearing read-only once on access
/// denial and asking the operator about other failures.
async fn rename_entry(
    ctx: &mut RunContext,
    op: &Operation,
    via_temp: bool,
) -> Result<Renamed, EngineError> {
    let source = op.source.as_path();
    let target = op.target.as_path();
    let mut cleared_readonly = false;

    loop {
        let result = if via_temp {
            rename_via_temp(ctx.fs.as_ref(), source, target)
        } else {
            ctx.fs.rename(source, target)
        };
        let error = match result {
            Ok(()) => {
                if cleared_readonly {
                    let _ = ctx.fs.set_readonly(target, true);
                }
                return Ok(Renamed::Done(StepOutcome::Done));
            }
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                if cleared_readonly {
                    let _ = ctx.fs.set_readonly(source, true);
                }
                return Ok(Renamed::CrossesDevices);
            }
            Err(e) => e,
        };

        if error.kind() == io::ErrorKind::PermissionDenied
            && !cleared_readonly
            && ctx.clear_readonly(source)
        {
            debug!(path = %source.display(), "cleared read-only to rename");
            cleared_readonly = true;
            continue;
        }

        match ctx
            .ask(ErrorCategory::Move, Some(source), Some(target), &error)
            .await
        {
            Ok(Resolution::Retry) => continue,
            other => {
                if cleared_readonly {
                    let _ = ctx.fs.set_readonly(source, true);
                }
                other?;
                return Ok(Renamed::Done(ctx.skipped(source, &error)));
            }
        }
    }
}

/// Move a file: rename within a volume, copy and delete across volumes.
pub(crate) async fn move_file(
    ctx: &mut RunContext,
    op: &Operation,
) -> Result<StepOutcome, EngineError> {
    let source = op.source.as_path();
    let target = op.target.as_path();

    if !same_volume(ctx.fs.as_ref(), source, target) {
        return copy_file(ctx, op, true).await;
    }
    if !op.flags.ignore_invalid_name {
        if let Some(category) = check_name(target) {
            let message = format!("{} cannot be used as a file name", target.display());
            return precondition(ctx, category, op, message).await;
        }
    }

    let src_meta = match ctx
        .attempt(ErrorCategory::SourceOpen, Some(source), None, |fs| {
            fs.symlink_metadata(source)
        })
        .await?
    {
        Attempt::Done(meta) => meta,
        _ => return Ok(StepOutcome::Skipped),
    };

    let mut via_temp = false;
    if let Ok(dst_meta) = ctx.fs.symlink_metadata(target) {
        if dst_meta.same_file(&src_meta) {
            via_temp = true;
        } else if dst_meta.is_dir() {
            let message = format!("{} is a directory", target.display());
            return precondition(ctx, ErrorCategory::ClassMismatch, op, message).await;
        } else {
            if let Some(outcome) = confirm_overwrite(ctx, op, &src_meta, &dst_meta).await? {
                return Ok(outcome);
            }
            ctx.clear_readonly(target);
            if let Attempt::Skipped = ctx
                .attempt(ErrorCategory::FileDelete, Some(source), Some(target), |fs| {
                    fs.remove_file(target)
                })
                .await?
            {
                return Ok(StepOutcome::Skipped);
            }
        }
    }

    match rename_entry(ctx, op, via_temp).await? {
        Renamed::Done(outcome) => Ok(outcome),
        Renamed::CrossesDevices => {
            debug!(path = %source.display(), "rename crosses volumes, copying");
            copy_file(ctx, op, true).await
        }
    }
}

/// Move a whole directory by renaming it.
pub(crate) async fn move_dir(
    ctx: &mut RunContext,
    op: &Operation,
) -> Result<StepOutcome, EngineError> {
    let source = op.source.as_path();
    let target = op.target.as_path();

    if !op.flags.ignore_invalid_name {
        if let Some(category) = check_name(target) {
            let message = format!("{} cannot be used as a directory name", target.display());
            return precondition(ctx, category, op, message).await;
        }
    }
    if target.starts_with(source) {
        let message = format!("cannot move {} into itself", source.display());
        return precondition(ctx, ErrorCategory::CopyOntoSelf, op, message).await;
    }

    let src_meta = match ctx
        .attempt(ErrorCategory::SourceOpen, Some(source), None, |fs| {
            fs.symlink_metadata(source)
        })
        .await?
    {
        Attempt::Done(meta) => meta,
        _ => return Ok(StepOutcome::Skipped),
    };

    let mut via_temp = false;
    if let Ok(dst_meta) = ctx.fs.symlink_metadata(target) {
        if dst_meta.same_file(&src_meta) {
            via_temp = true;
        } else {
            let message = format!("{} already exists", target.display());
            return precondition(ctx, ErrorCategory::ClassMismatch, op, message).await;
        }
    }

    match rename_entry(ctx, op, via_temp).await? {
        Renamed::Done(StepOutcome::Done) => {}
        Renamed::Done(outcome) => return Ok(outcome),
        Renamed::CrossesDevices => {
            let error = io::Error::new(
                io::ErrorKind::CrossesDevices,
                "directories can only be renamed within a volume",
            );
            ctx.ask(ErrorCategory::Move, Some(source), Some(target), &error)
                .await?;
            return Ok(ctx.skipped(source, &error));
        }
    }

    if ctx.settings.preserve_dir_time {
        let moved = ctx.fs.symlink_metadata(target).ok();
        if moved.is_some_and(|m| m.modified != src_meta.modified) {
            debug!(path = %target.display(), "restoring directory time after rename");
            let times = src_meta.times();
            ctx.attempt(ErrorCategory::FileTime, Some(source), Some(target), |fs| {
                fs.set_times(target, times)
            })
            .await?;
        }
    }
    Ok(StepOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{MemFs, VolumeKind, VolumeSpec};

    #[test]
    fn test_temp_sibling_is_unused() {
        let fs = MemFs::new();
        fs.add_file("/d/file.txt", b"x".to_vec());
        fs.add_file("/d/file.txt.1.tmp", b"x".to_vec());
        assert_eq!(
            temp_sibling(&fs, Path::new("/d/file.txt")),
            PathBuf::from("/d/file.txt.2.tmp")
        );
    }

    #[test]
    fn test_same_volume() {
        let fs = MemFs::new();
        fs.add_volume(VolumeSpec::new("/net", VolumeKind::Network));
        fs.add_file("/a/f", b"x".to_vec());
        fs.add_dir("/net");
        assert!(same_volume(&fs, Path::new("/a/f"), Path::new("/a/g")));
        assert!(!same_volume(&fs, Path::new("/a/f"), Path::new("/net/f")));
    }

    #[test]
    fn test_rename_via_temp() {
        let fs = MemFs::new();
        fs.add_file("/d/Name", b"x".to_vec());
        rename_via_temp(&fs, Path::new("/d/Name"), Path::new("/d/name")).unwrap();
        assert_eq!(fs.get_data(Path::new("/d/name")), Some(b"x".to_vec()));
        assert!(!fs.exists(Path::new("/d/Name")));
    }
}
