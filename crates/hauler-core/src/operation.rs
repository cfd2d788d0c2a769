//! Script operation types.

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Progress weight of a directory creation.
pub const CREATE_DIR_SIZE: u64 = 4096;
/// Progress weight of a same-volume directory move.
pub const MOVE_DIR_SIZE: u64 = 5050;
/// Progress weight of a directory removal.
pub const DELETE_DIR_SIZE: u64 = 2400;
/// Progress weight of a directory link removal.
pub const DELETE_DIRLINK_SIZE: u64 = 2400;
/// Progress weight of a same-volume file move.
pub const MOVE_FILE_SIZE: u64 = 6500;
/// Minimum progress weight of a copied file (so empty files still move the bar).
pub const COPY_MIN_FILE_SIZE: u64 = 4096;
/// Minimum progress weight of a converted file.
pub const CONVERT_MIN_FILE_SIZE: u64 = 4096;
/// Progress weight of a file removal.
pub const DELETE_FILE_SIZE: u64 = 2300;
/// Progress weight of an attribute change.
pub const CHATTRS_FILE_SIZE: u64 = 500;

/// Desired attributes for a change-attrs operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub readonly: bool,
    pub compressed: bool,
    pub encrypted: bool,
}

/// What a single script step does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum OpCode {
    CopyFile,
    MoveFile,
    MoveDir,
    CreateDir,
    DeleteFile,
    DeleteDir,
    DeleteDirLink,
    /// Apply `attributes` (plus the script's [`ChangeAttrsData`](crate::ChangeAttrsData)).
    ChangeAttrs { attributes: FileAttributes },
    Convert,
    CountSize,
    /// Restore a directory's modification time recorded at plan time.
    CopyDirTime { modified: SystemTime },
    /// Jump target for a skipped create-dir.
    ///
    /// `create_dir_index` is the script index of the matching create-dir and
    /// `skipped_size` the progress weight of everything between the two.
    SkipLabel {
        create_dir_index: usize,
        skipped_size: u64,
    },
}

impl OpCode {
    /// Short verb used in logs and progress displays.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::CopyFile => "Copying",
            Self::MoveFile | Self::MoveDir => "Moving",
            Self::CreateDir => "Creating",
            Self::DeleteFile | Self::DeleteDir | Self::DeleteDirLink => "Deleting",
            Self::ChangeAttrs { .. } => "Changing attributes",
            Self::Convert => "Converting",
            Self::CountSize => "Counting",
            Self::CopyDirTime { .. } => "Setting time",
            Self::SkipLabel { .. } => "",
        }
    }

    /// Whether this opcode moves file bytes through the transfer meter.
    pub fn transfers_bytes(&self) -> bool {
        matches!(self, Self::CopyFile | Self::MoveFile | Self::Convert)
    }
}

/// Per-operation flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFlags {
    /// Overwrite-older was already evaluated when the script was built.
    #[serde(default)]
    pub overwrite_older_tested: bool,
    /// Create the target encrypted.
    #[serde(default)]
    pub as_encrypted: bool,
    /// Copy alternate data streams.
    #[serde(default)]
    pub copy_streams: bool,
    #[serde(default)]
    pub source_is_network: bool,
    #[serde(default)]
    pub source_is_fast: bool,
    #[serde(default)]
    pub target_is_network: bool,
    #[serde(default)]
    pub target_is_fast: bool,
    /// Do not reject target names that fail validation.
    #[serde(default)]
    pub ignore_invalid_name: bool,
}

impl OperationFlags {
    /// Neither side is slow removable media.
    pub fn both_sides_fast_or_network(&self) -> bool {
        (self.source_is_network || self.source_is_fast)
            && (self.target_is_network || self.target_is_fast)
    }

    /// Pairing that benefits from overlapped I/O: one side on the network,
    /// the other on the network or on fast local media.
    pub fn prefers_pipelined(&self) -> bool {
        (self.source_is_network && (self.target_is_network || self.target_is_fast))
            || (self.target_is_network && (self.source_is_network || self.source_is_fast))
    }
}

/// A single step of a [`Script`](crate::Script).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub opcode: OpCode,
    pub source: PathBuf,
    /// Target path (empty for opcodes that act on `source` only).
    #[serde(default)]
    pub target: PathBuf,
    /// Progress weight of this step.
    pub size: u64,
    /// Byte length of the file being transferred.
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub flags: OperationFlags,
}

impl Operation {
    /// Create an operation with default flags.
    pub fn new(
        opcode: OpCode,
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        size: u64,
    ) -> Self {
        Self {
            opcode,
            source: source.into(),
            target: target.into(),
            size,
            file_size: 0,
            flags: OperationFlags::default(),
        }
    }

    /// Copy a file of `file_size` bytes.
    pub fn copy_file(
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        file_size: u64,
    ) -> Self {
        let mut op = Self::new(
            OpCode::CopyFile,
            source,
            target,
            file_size.max(COPY_MIN_FILE_SIZE),
        );
        op.file_size = file_size;
        op
    }

    /// Move a file; `same_volume` selects the rename weight.
    pub fn move_file(
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        file_size: u64,
        same_volume: bool,
    ) -> Self {
        let size = if same_volume {
            MOVE_FILE_SIZE
        } else {
            file_size.max(COPY_MIN_FILE_SIZE)
        };
        let mut op = Self::new(OpCode::MoveFile, source, target, size);
        op.file_size = file_size;
        op
    }

    /// Create a directory.
    pub fn create_dir(target: impl Into<PathBuf>) -> Self {
        let target = target.into();
        Self::new(OpCode::CreateDir, PathBuf::new(), target, CREATE_DIR_SIZE)
    }

    /// Delete a file.
    pub fn delete_file(source: impl Into<PathBuf>) -> Self {
        Self::new(OpCode::DeleteFile, source, PathBuf::new(), DELETE_FILE_SIZE)
    }

    /// Delete an empty directory.
    pub fn delete_dir(source: impl Into<PathBuf>) -> Self {
        Self::new(OpCode::DeleteDir, source, PathBuf::new(), DELETE_DIR_SIZE)
    }

    /// Set builder-style flags.
    pub fn with_flags(mut self, flags: OperationFlags) -> Self {
        self.flags = flags;
        self
    }

    /// The path shown to the operator for this step.
    pub fn display_path(&self) -> &PathBuf {
        if self.source.as_os_str().is_empty() {
            &self.target
        } else {
            &self.source
        }
    }
}

/// An error that occurred while executing an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    /// The path that caused the error.
    pub path: PathBuf,
    /// A human-readable error message.
    pub message: String,
}

impl OperationError {
    /// Create a new operation error.
    pub fn new(path: PathBuf, message: impl Into<String>) -> Self {
        Self {
            path,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_file_min_weight() {
        let op = Operation::copy_file("/a", "/b", 10);
        assert_eq!(op.size, COPY_MIN_FILE_SIZE);
        assert_eq!(op.file_size, 10);

        let big = Operation::copy_file("/a", "/b", 1 << 20);
        assert_eq!(big.size, 1 << 20);
    }

    #[test]
    fn test_move_file_weight() {
        assert_eq!(Operation::move_file("/a", "/b", 1 << 20, true).size, MOVE_FILE_SIZE);
        assert_eq!(Operation::move_file("/a", "/b", 1 << 20, false).size, 1 << 20);
    }

    #[test]
    fn test_prefers_pipelined() {
        let mut flags = OperationFlags {
            source_is_network: true,
            target_is_fast: true,
            ..Default::default()
        };
        assert!(flags.prefers_pipelined());

        flags.source_is_network = false;
        flags.source_is_fast = true;
        assert!(!flags.prefers_pipelined());

        let removable = OperationFlags {
            target_is_network: true,
            ..Default::default()
        };
        assert!(!removable.prefers_pipelined());
        assert!(!removable.both_sides_fast_or_network());
    }

    #[test]
    fn test_display_path() {
        let op = Operation::create_dir("/target/dir");
        assert_eq!(op.display_path(), &PathBuf::from("/target/dir"));
    }
}
