//! Attribute and timestamp changes, directory times and size counting.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use hauler_core::{EngineError, FileAttributes, Operation};
use tracing::debug;

use crate::context::{Attempt, RunContext, StepOutcome};
use crate::decision::ErrorCategory;
use crate::fs::{EntryKind, FileSystem, FileTimes};

/// One change-attrs step; `false` means the operation was skipped.
async fn apply<F>(
    ctx: &mut RunContext,
    path: &Path,
    f: F,
) -> Result<bool, EngineError>
where
    F: FnMut(&dyn FileSystem) -> io::Result<()>,
{
    let result = ctx
        .attempt(ErrorCategory::ChangeAttrs, Some(path), None, f)
        .await?;
    Ok(!matches!(result, Attempt::Skipped))
}

/// Apply `attributes` and the script's attribute/time changes to `op.source`.
pub(crate) async fn change_attrs(
    ctx: &mut RunContext,
    op: &Operation,
    attributes: FileAttributes,
) -> Result<StepOutcome, EngineError> {
    let path = op.source.as_path();
    let data = ctx.change_attrs.unwrap_or_default();

    // Read-only would block the other changes; it is set last.
    ctx.clear_readonly(path);

    if data.change_compression
        && !apply(ctx, path, |fs| fs.set_compressed(path, attributes.compressed)).await?
    {
        return Ok(StepOutcome::Skipped);
    }
    if data.change_encryption
        && !apply(ctx, path, |fs| fs.set_encrypted(path, attributes.encrypted)).await?
    {
        return Ok(StepOutcome::Skipped);
    }
    if data.changes_times() {
        let times = FileTimes {
            modified: data.modified,
            accessed: data.accessed,
            created: data.created,
        };
        if !apply(ctx, path, |fs| fs.set_times(path, times)).await? {
            return Ok(StepOutcome::Skipped);
        }
    }
    if !apply(ctx, path, |fs| fs.set_readonly(path, attributes.readonly)).await? {
        return Ok(StepOutcome::Skipped);
    }
    Ok(StepOutcome::Done)
}

/// Give a copied directory the modification time its source had.
pub(crate) async fn copy_dir_time(
    ctx: &mut RunContext,
    op: &Operation,
    modified: SystemTime,
) -> Result<StepOutcome, EngineError> {
    let path = if op.target.as_os_str().is_empty() {
        op.source.as_path()
    } else {
        op.target.as_path()
    };
    let times = FileTimes {
        modified: Some(modified),
        ..Default::default()
    };
    let result = ctx
        .attempt(ErrorCategory::FileTime, None, Some(path), |fs| {
            fs.set_times(path, times)
        })
        .await?;
    Ok(match result {
        Attempt::Skipped => StepOutcome::Skipped,
        _ => StepOutcome::Done,
    })
}

/// Total size of the alternate streams of `path`; unreadable streams count
/// as empty.
fn streams_size(fs: &dyn FileSystem, path: &Path) -> u64 {
    let Ok(names) = fs.list_streams(path) else {
        return 0;
    };
    names
        .iter()
        .filter_map(|name| fs.open_stream_read(path, name).ok())
        .filter_map(|handle| handle.size().ok())
        .sum()
}

/// Sum the sizes of all files (and their streams) below `op.source`.
pub(crate) async fn count_size(
    ctx: &mut RunContext,
    op: &Operation,
) -> Result<StepOutcome, EngineError> {
    let root = op.source.as_path();
    let mut total = 0u64;
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        ctx.control.checkpoint().await?;
        let entries = match ctx
            .attempt(ErrorCategory::CountSize, Some(dir.as_path()), None, |fs| {
                fs.read_dir(&dir)
            })
            .await?
        {
            Attempt::Done(entries) => entries,
            Attempt::Ignored => continue,
            Attempt::Skipped => return Ok(StepOutcome::Skipped),
        };
        for entry in entries {
            let path = dir.join(&entry.name);
            match entry.meta.kind {
                EntryKind::Dir => pending.push(path),
                EntryKind::File => {
                    total += entry.meta.len + streams_size(ctx.fs.as_ref(), &path);
                }
                EntryKind::Symlink { .. } => {}
            }
        }
    }

    debug!(path = %root.display(), bytes = total, "counted");
    ctx.counted_sizes.push((root.to_path_buf(), total));
    Ok(StepOutcome::Done)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use hauler_core::{ChangeAttrsData, EngineConfig, OpCode, ScriptSettings, CHATTRS_FILE_SIZE};
    use tokio::sync::mpsc;

    use super::*;
    use crate::clock::SystemClock;
    use crate::control::JobControl;
    use crate::fs::{MemFs, VolumeKind, VolumeSpec};
    use crate::progress::ScriptEvent;
    use crate::status::OperationStatus;

    fn context(fs: &MemFs) -> (RunContext, mpsc::Receiver<ScriptEvent>) {
        let (tx, rx) = mpsc::channel(4);
        let ctx = RunContext::new(
            Arc::new(fs.clone()),
            Arc::new(OperationStatus::new(Arc::new(SystemClock::new()), None)),
            Arc::new(EngineConfig::default()),
            ScriptSettings::default(),
            JobControl::new(),
            tx,
            1,
            0,
        );
        (ctx, rx)
    }

    fn chattrs(path: &str, attributes: FileAttributes) -> Operation {
        Operation::new(
            OpCode::ChangeAttrs { attributes },
            path,
            "",
            CHATTRS_FILE_SIZE,
        )
    }

    #[tokio::test]
    async fn test_change_attrs_sets_time_and_readonly() {
        let fs = MemFs::new();
        fs.add_volume(VolumeSpec::new("/c", VolumeKind::Fast).compression(true));
        fs.add_file("/c/f", b"x".to_vec());
        let (mut ctx, _rx) = context(&fs);
        let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        ctx.change_attrs = Some(ChangeAttrsData {
            change_compression: true,
            modified: Some(stamp),
            ..Default::default()
        });

        let attributes = FileAttributes {
            readonly: true,
            compressed: true,
            encrypted: false,
        };
        let outcome = change_attrs(&mut ctx, &chattrs("/c/f", attributes), attributes)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Done);

        let meta = fs.metadata(Path::new("/c/f")).unwrap();
        assert!(meta.readonly);
        assert!(meta.compressed);
        assert_eq!(meta.modified, stamp);
    }

    #[tokio::test]
    async fn test_copy_dir_time() {
        let fs = MemFs::new();
        fs.add_dir("/t/d");
        let (mut ctx, _rx) = context(&fs);
        let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(42);
        let op = Operation::new(OpCode::CopyDirTime { modified: stamp }, "/s/d", "/t/d", 0);

        copy_dir_time(&mut ctx, &op, stamp).await.unwrap();
        assert_eq!(fs.metadata(Path::new("/t/d")).unwrap().modified, stamp);
    }

    #[tokio::test]
    async fn test_count_size_includes_streams() {
        let fs = MemFs::new();
        fs.add_file("/d/a", vec![0; 100]);
        fs.add_file("/d/sub/b", vec![0; 50]);
        fs.add_stream(Path::new("/d/a"), "s", vec![0; 7]).unwrap();
        fs.add_symlink("/d/link", "/elsewhere", false);
        let (mut ctx, _rx) = context(&fs);

        let op = Operation::new(OpCode::CountSize, "/d", "", 0);
        count_size(&mut ctx, &op).await.unwrap();
        assert_eq!(ctx.counted_sizes, vec![(PathBuf::from("/d"), 157)]);
    }
}
