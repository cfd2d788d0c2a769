//! Removal of files, empty directories and directory links.

use std::io;
use std::path::Path;

use hauler_core::{EngineError, Operation};
use tracing::debug;

use crate::context::{Attempt, RunContext, StepOutcome};
use crate::decision::ErrorCategory;
use crate::fs::FileSystem;

/// Run `remove`, treating an entry that is already gone as removed.
async fn remove_with<F>(
    ctx: &mut RunContext,
    category: ErrorCategory,
    path: &Path,
    remove: F,
) -> Result<StepOutcome, EngineError>
where
    F: Fn(&dyn FileSystem, &Path) -> io::Result<()>,
{
    let result = ctx
        .attempt(category, Some(path), None, |fs| match remove(fs, path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "already gone");
                Ok(())
            }
            other => other,
        })
        .await?;
    Ok(match result {
        Attempt::Skipped => StepOutcome::Skipped,
        Attempt::Done(()) | Attempt::Ignored => StepOutcome::Done,
    })
}

/// Delete a file, to the trash when the settings ask for it.
pub(crate) async fn delete_file(
    ctx: &mut RunContext,
    op: &Operation,
) -> Result<StepOutcome, EngineError> {
    let path = op.source.as_path();
    ctx.clear_readonly(path);
    let to_trash = ctx.settings.effective_trash();
    debug!(path = %path.display(), to_trash, "deleting file");
    remove_with(ctx, ErrorCategory::FileDelete, path, |fs, p| {
        if to_trash {
            fs.remove_file_to_trash(p)
        } else {
            fs.remove_file(p)
        }
    })
    .await
}

/// Delete an empty directory.
pub(crate) async fn delete_dir(
    ctx: &mut RunContext,
    op: &Operation,
) -> Result<StepOutcome, EngineError> {
    let path = op.source.as_path();
    ctx.clear_readonly(path);
    remove_with(ctx, ErrorCategory::DirDelete, path, |fs, p| fs.remove_dir(p)).await
}

/// Delete a directory link, leaving what it points at alone.
pub(crate) async fn delete_dir_link(
    ctx: &mut RunContext,
    op: &Operation,
) -> Result<StepOutcome, EngineError> {
    let path = op.source.as_path();
    remove_with(ctx, ErrorCategory::LinkDelete, path, |fs, p| {
        fs.remove_dir_link(p)
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use hauler_core::{EngineConfig, OpCode, ScriptSettings, DELETE_DIRLINK_SIZE};
    use tokio::sync::mpsc;

    use super::*;
    use crate::clock::SystemClock;
    use crate::control::JobControl;
    use crate::decision::Decision;
    use crate::fs::MemFs;
    use crate::progress::ScriptEvent;
    use crate::status::OperationStatus;

    fn context(fs: &MemFs, settings: ScriptSettings) -> (RunContext, mpsc::Receiver<ScriptEvent>) {
        let (tx, rx) = mpsc::channel(4);
        let ctx = RunContext::new(
            Arc::new(fs.clone()),
            Arc::new(OperationStatus::new(Arc::new(SystemClock::new()), None)),
            Arc::new(EngineConfig::default()),
            settings,
            JobControl::new(),
            tx,
            1,
            0,
        );
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_delete_readonly_file() {
        let fs = MemFs::new();
        fs.add_file("/d/f", b"x".to_vec());
        fs.set_readonly(Path::new("/d/f"), true).unwrap();
        let (mut ctx, _rx) = context(&fs, ScriptSettings::default());

        let outcome = delete_file(&mut ctx, &Operation::delete_file("/d/f"))
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Done);
        assert!(!fs.exists(Path::new("/d/f")));
        assert!(fs.trashed().is_empty());
    }

    #[tokio::test]
    async fn test_delete_to_trash() {
        let fs = MemFs::new();
        fs.add_file("/d/f", b"x".to_vec());
        let settings = ScriptSettings {
            use_trash: true,
            ..Default::default()
        };
        let (mut ctx, _rx) = context(&fs, settings);

        delete_file(&mut ctx, &Operation::delete_file("/d/f"))
            .await
            .unwrap();
        assert_eq!(fs.trashed(), vec![PathBuf::from("/d/f")]);
    }

    #[tokio::test]
    async fn test_delete_missing_file_is_done() {
        let fs = MemFs::new();
        let (mut ctx, _rx) = context(&fs, ScriptSettings::default());
        let outcome = delete_file(&mut ctx, &Operation::delete_file("/nope"))
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Done);
    }

    #[tokio::test]
    async fn test_non_empty_dir_asks() {
        let fs = MemFs::new();
        fs.add_file("/d/f", b"x".to_vec());
        let (mut ctx, mut rx) = context(&fs, ScriptSettings::default());
        let answerer = tokio::spawn(async move {
            if let Some(ScriptEvent::Ask(request)) = rx.recv().await {
                assert_eq!(request.category, ErrorCategory::DirDelete);
                request.answer(Decision::Skip);
            }
        });

        let outcome = delete_dir(&mut ctx, &Operation::delete_dir("/d"))
            .await
            .unwrap();
        answerer.await.unwrap();
        assert_eq!(outcome, StepOutcome::Skipped);
        assert!(fs.exists(Path::new("/d/f")));
        assert_eq!(ctx.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_dir_link_keeps_target() {
        let fs = MemFs::new();
        fs.add_file("/real/f", b"x".to_vec());
        fs.add_symlink("/link", "/real", true);
        let (mut ctx, _rx) = context(&fs, ScriptSettings::default());

        let op = Operation::new(OpCode::DeleteDirLink, "/link", "", DELETE_DIRLINK_SIZE);
        assert_eq!(
            delete_dir_link(&mut ctx, &op).await.unwrap(),
            StepOutcome::Done
        );
        assert!(!fs.exists(Path::new("/link")));
        assert!(fs.exists(Path::new("/real/f")));
    }
}
