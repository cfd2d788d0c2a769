//! Building scripts from a user request.
//!
//! Directories are expanded here, before the driver starts: a copy becomes
//! a pre-order list of create-dir and file operations closed by skip
//! labels, a delete becomes a post-order list of removals.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use hauler_core::{
    ChangeAttrsData, ConvertData, EngineError, FileAttributes, OpCode, Operation,
    OperationFlags, Script, ScriptSettings, CHATTRS_FILE_SIZE, CONVERT_MIN_FILE_SIZE,
    DELETE_DIRLINK_SIZE, DELETE_DIR_SIZE, MOVE_DIR_SIZE,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fs::{EntryKind, FileMeta, FileSystem, VolumeInfo, VolumeKind};

/// Cluster size used to estimate the space copied files occupy.
const CLUSTER_SIZE: u64 = 4096;

/// What a plan does with its sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum PlanKind {
    Copy,
    Move,
    Delete,
    ChangeAttrs,
    Convert,
    CountSize,
}

/// A request to turn into a [`Script`].
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub kind: PlanKind,
    pub sources: Vec<PathBuf>,
    /// Directory receiving copies and moves.
    pub destination: Option<PathBuf>,
    pub settings: ScriptSettings,
    /// Glob patterns; matching entries are left out.
    pub excludes: Vec<String>,
    /// Target attributes of a change-attrs plan.
    pub attributes: FileAttributes,
    pub change_attrs: Option<ChangeAttrsData>,
    pub convert: Option<ConvertData>,
}

impl PlanRequest {
    pub fn new(kind: PlanKind, sources: Vec<PathBuf>) -> Self {
        Self {
            kind,
            sources,
            destination: None,
            settings: ScriptSettings::default(),
            excludes: Vec::new(),
            attributes: FileAttributes::default(),
            change_attrs: None,
            convert: None,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_settings(mut self, settings: ScriptSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_excludes(mut self, excludes: Vec<String>) -> Self {
        self.excludes = excludes;
        self
    }
}

fn build_excludes(patterns: &[String]) -> Result<Option<GlobSet>, EngineError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| EngineError::InvalidConfig {
            message: format!("bad exclude pattern {pattern:?}: {e}"),
        })?;
        builder.add(glob);
    }
    let set = builder.build().map_err(|e| EngineError::InvalidConfig {
        message: format!("bad exclude patterns: {e}"),
    })?;
    Ok(Some(set))
}

/// Where the target side of a copy or move lives.
#[derive(Debug, Clone, Copy)]
struct TargetSide {
    volume: VolumeInfo,
}

struct Planner<'a> {
    fs: &'a dyn FileSystem,
    request: &'a PlanRequest,
    excludes: Option<GlobSet>,
    script: Script,
}

impl<'a> Planner<'a> {
    fn excluded(&self, path: &Path) -> bool {
        let Some(set) = &self.excludes else {
            return false;
        };
        set.is_match(path) || path.file_name().is_some_and(|name| set.is_match(name))
    }

    fn meta(&self, path: &Path) -> Result<FileMeta, EngineError> {
        self.fs
            .symlink_metadata(path)
            .map_err(|e| EngineError::io(path, e))
    }

    fn children(&self, dir: &Path) -> Result<Vec<(PathBuf, FileMeta)>, EngineError> {
        let entries = self.fs.read_dir(dir).map_err(|e| EngineError::io(dir, e))?;
        Ok(entries
            .into_iter()
            .map(|entry| (dir.join(&entry.name), entry.meta))
            .filter(|(path, _)| {
                let skip = self.excluded(path);
                if skip {
                    debug!(path = %path.display(), "excluded");
                }
                !skip
            })
            .collect())
    }

    fn flags(&self, source: &VolumeInfo, target: &TargetSide) -> OperationFlags {
        OperationFlags {
            source_is_network: source.kind == VolumeKind::Network,
            source_is_fast: source.kind == VolumeKind::Fast,
            target_is_network: target.volume.kind == VolumeKind::Network,
            target_is_fast: target.volume.kind == VolumeKind::Fast,
            copy_streams: self.request.settings.copy_streams
                && source.supports_streams
                && target.volume.supports_streams,
            ..Default::default()
        }
    }

    fn volume(&self, path: &Path) -> Result<VolumeInfo, EngineError> {
        self.fs
            .volume_info(path)
            .map_err(|e| EngineError::io(path, e))
    }

    fn plan(mut self) -> Result<Script, EngineError> {
        let request = self.request;
        match request.kind {
            PlanKind::Copy | PlanKind::Move => {
                let destination = request.destination.as_deref().ok_or_else(|| {
                    EngineError::plan("", format!("{} needs a destination", request.kind))
                })?;
                let dest_meta = self
                    .fs
                    .metadata(destination)
                    .map_err(|e| EngineError::io(destination, e))?;
                if !dest_meta.is_dir() {
                    return Err(EngineError::plan(destination, "not a directory"));
                }
                let target = TargetSide {
                    volume: self.volume(destination)?,
                };
                self.script.totals.free_space = target.volume.free_space;
                for source in &request.sources {
                    self.plan_transfer(source, destination, &target)?;
                }
            }
            PlanKind::Delete => {
                for source in &request.sources {
                    let meta = self.meta(source)?;
                    self.plan_delete(source, &meta)?;
                }
            }
            PlanKind::ChangeAttrs => {
                self.script.change_attrs = request.change_attrs;
                for source in &request.sources {
                    let meta = self.meta(source)?;
                    self.plan_change_attrs(source, &meta)?;
                }
            }
            PlanKind::Convert => {
                self.script.convert = Some(request.convert.clone().unwrap_or_default());
                for source in &request.sources {
                    let meta = self.meta(source)?;
                    self.plan_convert(source, &meta)?;
                }
            }
            PlanKind::CountSize => {
                for source in &request.sources {
                    if !self.meta(source)?.is_dir() {
                        return Err(EngineError::plan(source, "not a directory"));
                    }
                    self.script
                        .push(Operation::new(OpCode::CountSize, source, "", 0));
                }
            }
        }
        Ok(self.script)
    }

    fn plan_transfer(
        &mut self,
        source: &Path,
        destination: &Path,
        target: &TargetSide,
    ) -> Result<(), EngineError> {
        let name = source
            .file_name()
            .ok_or_else(|| EngineError::plan(source, "has no file name"))?;
        let target_path = destination.join(name);
        if target_path == source || destination.starts_with(source) {
            return Err(EngineError::plan(source, "cannot copy onto itself"));
        }
        let meta = self.meta(source)?;
        let source_volume = self.volume(source)?;
        let is_move = self.request.kind == PlanKind::Move;

        if is_move && source_volume.id == target.volume.id {
            let op = if meta.is_dir() {
                Operation::new(OpCode::MoveDir, source, &target_path, MOVE_DIR_SIZE)
            } else {
                Operation::move_file(source, &target_path, meta.len, true)
            };
            self.script.push(op);
            return Ok(());
        }

        match meta.kind {
            EntryKind::Dir => self.plan_dir(source, &target_path, &meta, &source_volume, target),
            _ => {
                self.plan_file(source, &target_path, &source_volume, target)?;
                Ok(())
            }
        }
    }

    fn plan_file(
        &mut self,
        source: &Path,
        target_path: &Path,
        source_volume: &VolumeInfo,
        target: &TargetSide,
    ) -> Result<(), EngineError> {
        // Links to files are copied as the file they point at.
        let meta = self
            .fs
            .metadata(source)
            .map_err(|e| EngineError::io(source, e))?;
        let mut flags = self.flags(source_volume, target);

        if self.request.settings.overwrite_older {
            if let Ok(existing) = self.fs.metadata(target_path) {
                if meta.modified <= existing.modified {
                    debug!(path = %target_path.display(), "target is not older, left out");
                    return Ok(());
                }
                flags.overwrite_older_tested = true;
            }
        }

        let op = if self.request.kind == PlanKind::Move {
            Operation::move_file(source, target_path, meta.len, false)
        } else {
            Operation::copy_file(source, target_path, meta.len)
        };
        let totals = &mut self.script.totals;
        totals.occupied_space += meta.len.div_ceil(CLUSTER_SIZE) * CLUSTER_SIZE;
        if meta.compressed {
            totals.compressed_size += meta.len;
        }
        self.script.push(op.with_flags(flags));
        Ok(())
    }

    fn plan_dir(
        &mut self,
        source: &Path,
        target_path: &Path,
        meta: &FileMeta,
        source_volume: &VolumeInfo,
        target: &TargetSide,
    ) -> Result<(), EngineError> {
        let mut create = Operation::create_dir(target_path);
        create.source = source.to_path_buf();
        create.flags = self.flags(source_volume, target);
        let create_index = self.script.push(create);
        let before = self.script.totals.total_size;

        for (child, child_meta) in self.children(source)? {
            let Some(name) = child.file_name() else {
                continue;
            };
            let child_target = target_path.join(name);
            match child_meta.kind {
                EntryKind::Dir => {
                    self.plan_dir(&child, &child_target, &child_meta, source_volume, target)?
                }
                EntryKind::File | EntryKind::Symlink { to_dir: false } => {
                    self.plan_file(&child, &child_target, source_volume, target)?
                }
                EntryKind::Symlink { to_dir: true } => {
                    warn!(path = %child.display(), "directory link not copied");
                }
            }
        }

        if self.request.settings.preserve_dir_time {
            self.script.push(Operation::new(
                OpCode::CopyDirTime {
                    modified: meta.modified,
                },
                source,
                target_path,
                0,
            ));
        }
        if self.request.kind == PlanKind::Move {
            self.script.push(Operation::delete_dir(source));
        }

        let skipped_size = self.script.totals.total_size - before;
        self.script.push(Operation::new(
            OpCode::SkipLabel {
                create_dir_index: create_index,
                skipped_size,
            },
            "",
            "",
            0,
        ));
        Ok(())
    }

    /// Returns whether everything below `path` is scheduled for removal.
    fn plan_delete(&mut self, path: &Path, meta: &FileMeta) -> Result<bool, EngineError> {
        match meta.kind {
            EntryKind::Symlink { to_dir: true } => {
                self.script.push(Operation::new(
                    OpCode::DeleteDirLink,
                    path,
                    "",
                    DELETE_DIRLINK_SIZE,
                ));
                Ok(true)
            }
            EntryKind::File | EntryKind::Symlink { to_dir: false } => {
                self.script.push(Operation::delete_file(path));
                Ok(true)
            }
            EntryKind::Dir => {
                let entries = self.fs.read_dir(path).map_err(|e| EngineError::io(path, e))?;
                let mut complete = true;
                for entry in entries {
                    let child = path.join(&entry.name);
                    if self.excluded(&child) {
                        debug!(path = %child.display(), "excluded, keeping parent");
                        complete = false;
                        continue;
                    }
                    complete &= self.plan_delete(&child, &entry.meta)?;
                }
                if complete {
                    self.script.push(Operation::new(
                        OpCode::DeleteDir,
                        path,
                        "",
                        DELETE_DIR_SIZE,
                    ));
                }
                Ok(complete)
            }
        }
    }

    fn plan_change_attrs(&mut self, path: &Path, meta: &FileMeta) -> Result<(), EngineError> {
        if meta.is_symlink() {
            return Ok(());
        }
        self.script.push(Operation::new(
            OpCode::ChangeAttrs {
                attributes: self.request.attributes,
            },
            path,
            "",
            CHATTRS_FILE_SIZE,
        ));
        if meta.is_dir() {
            for (child, child_meta) in self.children(path)? {
                self.plan_change_attrs(&child, &child_meta)?;
            }
        }
        Ok(())
    }

    fn plan_convert(&mut self, path: &Path, meta: &FileMeta) -> Result<(), EngineError> {
        match meta.kind {
            EntryKind::File => {
                let mut op = Operation::new(
                    OpCode::Convert,
                    path,
                    "",
                    meta.len.max(CONVERT_MIN_FILE_SIZE),
                );
                op.file_size = meta.len;
                self.script.push(op);
            }
            EntryKind::Dir => {
                for (child, child_meta) in self.children(path)? {
                    self.plan_convert(&child, &child_meta)?;
                }
            }
            EntryKind::Symlink { .. } => {}
        }
        Ok(())
    }
}

/// Build the script for `request`.
pub fn plan_script(fs: &dyn FileSystem, request: &PlanRequest) -> Result<Script, EngineError> {
    if request.sources.is_empty() {
        return Err(EngineError::plan("", "nothing to do"));
    }
    let mut settings = request.settings.clone();
    settings.is_copy = request.kind != PlanKind::Move;
    let planner = Planner {
        fs,
        request,
        excludes: build_excludes(&request.excludes)?,
        script: Script::new(settings),
    };
    let script = planner.plan()?;
    debug!(
        kind = %request.kind,
        operations = script.len(),
        bytes = script.totals.total_file_size,
        "script planned"
    );
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{MemFs, VolumeSpec};

    fn opcodes(script: &Script) -> Vec<&'static str> {
        script
            .operations
            .iter()
            .map(|op| match op.opcode {
                OpCode::CreateDir => "mkdir",
                OpCode::CopyFile => "copy",
                OpCode::MoveFile => "move",
                OpCode::MoveDir => "movedir",
                OpCode::DeleteFile => "rm",
                OpCode::DeleteDir => "rmdir",
                OpCode::DeleteDirLink => "rmlink",
                OpCode::SkipLabel { .. } => "label",
                OpCode::CopyDirTime { .. } => "dirtime",
                _ => "other",
            })
            .collect()
    }

    #[test]
    fn test_copy_tree_is_preorder_with_labels() {
        let fs = MemFs::new();
        fs.add_file("/s/d/a", vec![0; 10]);
        fs.add_file("/s/d/sub/b", vec![0; 20]);
        fs.add_dir("/t");

        let request = PlanRequest::new(PlanKind::Copy, vec!["/s/d".into()]).with_destination("/t");
        let script = plan_script(&fs, &request).unwrap();
        assert_eq!(
            opcodes(&script),
            ["mkdir", "copy", "mkdir", "copy", "label", "label"]
        );
        assert_eq!(script.operations[3].target, PathBuf::from("/t/d/sub/b"));
        assert_eq!(script.skip_label_for(2).map(|(i, _)| i), Some(4));
        assert_eq!(script.totals.total_file_size, 30);
        assert!(script.settings.is_copy);
    }

    #[test]
    fn test_move_within_volume_is_one_rename() {
        let fs = MemFs::new();
        fs.add_file("/s/d/a", vec![0; 10]);
        fs.add_dir("/t");
        let request = PlanRequest::new(PlanKind::Move, vec!["/s/d".into()]).with_destination("/t");
        let script = plan_script(&fs, &request).unwrap();
        assert_eq!(opcodes(&script), ["movedir"]);
        assert!(!script.settings.is_copy);
    }

    #[test]
    fn test_move_across_volumes_deletes_source_dirs() {
        let fs = MemFs::new();
        fs.add_volume(VolumeSpec::new("/net", VolumeKind::Network));
        fs.add_file("/s/d/a", vec![0; 10]);
        fs.add_dir("/net/t");
        let request =
            PlanRequest::new(PlanKind::Move, vec!["/s/d".into()]).with_destination("/net/t");
        let script = plan_script(&fs, &request).unwrap();
        assert_eq!(opcodes(&script), ["mkdir", "move", "rmdir", "label"]);
        assert!(script.operations[1].flags.target_is_network);
        assert!(script.operations[1].flags.source_is_fast);
    }

    #[test]
    fn test_delete_is_postorder_and_respects_excludes() {
        let fs = MemFs::new();
        fs.add_file("/d/a", b"x".to_vec());
        fs.add_file("/d/keep.log", b"x".to_vec());
        fs.add_file("/e/sub/b", b"x".to_vec());
        fs.add_symlink("/e/link", "/d", true);

        let request = PlanRequest::new(PlanKind::Delete, vec!["/d".into(), "/e".into()])
            .with_excludes(vec!["*.log".to_string()]);
        let script = plan_script(&fs, &request).unwrap();
        // /d keeps its excluded file, so it is not removed.
        assert_eq!(opcodes(&script), ["rm", "rmlink", "rm", "rmdir", "rmdir"]);
    }

    #[test]
    fn test_copy_onto_itself_rejected() {
        let fs = MemFs::new();
        fs.add_dir("/s/d/inner");
        let request =
            PlanRequest::new(PlanKind::Copy, vec!["/s/d".into()]).with_destination("/s/d/inner");
        assert!(matches!(
            plan_script(&fs, &request),
            Err(EngineError::Plan { .. })
        ));
    }

    #[test]
    fn test_overwrite_older_leaves_out_newer_targets() {
        let fs = MemFs::new();
        fs.add_file("/s/a", b"old".to_vec());
        fs.add_file("/t/a", b"new".to_vec());
        let settings = ScriptSettings {
            overwrite_older: true,
            ..Default::default()
        };
        let request = PlanRequest::new(PlanKind::Copy, vec!["/s/a".into()])
            .with_destination("/t")
            .with_settings(settings);
        let script = plan_script(&fs, &request).unwrap();
        assert!(script.is_empty());
    }

    #[test]
    fn test_bad_exclude_pattern() {
        let fs = MemFs::new();
        fs.add_dir("/d");
        let request = PlanRequest::new(PlanKind::Delete, vec!["/d".into()])
            .with_excludes(vec!["a[".to_string()]);
        assert!(matches!(
            plan_script(&fs, &request),
            Err(EngineError::InvalidConfig { .. })
        ));
    }
}
