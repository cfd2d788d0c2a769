//! Scripts: ordered operation lists plus their run-wide settings.

use std::time::SystemTime;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::operation::{OpCode, Operation};

/// Switches that apply to every operation of a script.
#[derive(Debug, Clone, Builder, Serialize, Deserialize, PartialEq, Eq)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct ScriptSettings {
    /// Throughput cap in bytes per second (None = unlimited).
    #[builder(default)]
    #[serde(default)]
    pub speed_limit: Option<u64>,

    /// Mirror compressed/encrypted attributes onto the target.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub preserve_attrs: bool,

    /// Copy owner, group and permission bits.
    #[builder(default = "false")]
    #[serde(default)]
    pub preserve_security: bool,

    /// Restore directory times after their contents were written.
    #[builder(default = "false")]
    #[serde(default)]
    pub preserve_dir_time: bool,

    /// Copy alternate data streams where both volumes support them.
    #[builder(default = "false")]
    #[serde(default)]
    pub copy_streams: bool,

    /// Delete to the trash instead of unlinking.
    #[builder(default = "false")]
    #[serde(default)]
    pub use_trash: bool,

    /// The source volume has a trash at all.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub can_use_trash: bool,

    /// Per-invocation inversion of `use_trash` (shift+delete).
    #[builder(default = "false")]
    #[serde(default)]
    pub invert_trash: bool,

    /// Clear the read-only attribute on copied targets.
    #[builder(default = "false")]
    #[serde(default)]
    pub clear_readonly: bool,

    /// Overwrite existing targets only when the source is newer, without asking.
    #[builder(default = "false")]
    #[serde(default)]
    pub overwrite_older: bool,

    /// Overwrite existing targets without asking.
    #[builder(default = "false")]
    #[serde(default)]
    pub overwrite_all: bool,

    /// Copy (true) or move (false) script; only affects wording.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub is_copy: bool,
}

fn default_true() -> bool {
    true
}

impl ScriptSettingsBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(Some(0)) = self.speed_limit {
            return Err("Speed limit must be at least 1 byte per second".to_string());
        }
        Ok(())
    }
}

impl ScriptSettings {
    /// Create a new settings builder.
    pub fn builder() -> ScriptSettingsBuilder {
        ScriptSettingsBuilder::default()
    }

    /// Whether deletions go to the trash.
    pub fn effective_trash(&self) -> bool {
        self.can_use_trash && (self.use_trash != self.invert_trash)
    }
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            speed_limit: None,
            preserve_attrs: true,
            preserve_security: false,
            preserve_dir_time: false,
            copy_streams: false,
            use_trash: false,
            can_use_trash: true,
            invert_trash: false,
            clear_readonly: false,
            overwrite_older: false,
            overwrite_all: false,
            is_copy: true,
        }
    }
}

/// Aggregate counters computed when the script is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptTotals {
    /// Sum of all operation weights (the 100 % mark of the summary progress).
    pub total_size: u64,
    /// Bytes the sources occupy while compressed.
    pub compressed_size: u64,
    /// Bytes the targets will occupy on disk (rounded to clusters).
    pub occupied_space: u64,
    /// Sum of transferred file lengths.
    pub total_file_size: u64,
    /// Free space on the target when the script was built.
    pub free_space: Option<u64>,
    pub files_count: u64,
    pub dirs_count: u64,
}

/// Attribute and time changes for change-attrs scripts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeAttrsData {
    /// Toggle compression to the per-operation attribute value.
    #[serde(default)]
    pub change_compression: bool,
    /// Toggle encryption to the per-operation attribute value.
    #[serde(default)]
    pub change_encryption: bool,
    #[serde(default)]
    pub modified: Option<SystemTime>,
    #[serde(default)]
    pub accessed: Option<SystemTime>,
    #[serde(default)]
    pub created: Option<SystemTime>,
}

impl ChangeAttrsData {
    /// Whether any timestamp is to be set.
    pub fn changes_times(&self) -> bool {
        self.modified.is_some() || self.accessed.is_some() || self.created.is_some()
    }
}

/// Line ending applied by convert operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EolMode {
    /// Leave line endings as they are.
    #[default]
    Keep,
    Crlf,
    Lf,
    Cr,
}

impl EolMode {
    /// Byte sequence for this line ending.
    pub fn bytes(self) -> &'static [u8] {
        match self {
            Self::Keep => b"",
            Self::Crlf => b"\r\n",
            Self::Lf => b"\n",
            Self::Cr => b"\r",
        }
    }
}

/// Code table and line-ending policy for convert scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertData {
    /// Byte-to-byte translation table.
    pub code_table: Vec<u8>,
    #[serde(default)]
    pub eol: EolMode,
}

impl ConvertData {
    /// Identity table with the given line-ending policy.
    pub fn identity(eol: EolMode) -> Self {
        Self {
            code_table: (0..=255u8).collect(),
            eol,
        }
    }

    /// Map a byte through the table.
    pub fn translate(&self, byte: u8) -> u8 {
        self.code_table.get(byte as usize).copied().unwrap_or(byte)
    }
}

impl Default for ConvertData {
    fn default() -> Self {
        Self::identity(EolMode::Keep)
    }
}

/// An ordered list of operations plus the data they share.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub totals: ScriptTotals,
    #[serde(default)]
    pub settings: ScriptSettings,
    #[serde(default)]
    pub change_attrs: Option<ChangeAttrsData>,
    #[serde(default)]
    pub convert: Option<ConvertData>,
}

impl Script {
    /// Create an empty script with the given settings.
    pub fn new(settings: ScriptSettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    /// Append an operation and fold it into the totals.
    pub fn push(&mut self, op: Operation) -> usize {
        self.totals.total_size += op.size;
        match op.opcode {
            OpCode::CopyFile | OpCode::MoveFile | OpCode::Convert => {
                self.totals.files_count += 1;
                self.totals.total_file_size += op.file_size;
            }
            OpCode::DeleteFile | OpCode::ChangeAttrs { .. } => self.totals.files_count += 1,
            OpCode::CreateDir | OpCode::MoveDir | OpCode::DeleteDir | OpCode::DeleteDirLink => {
                self.totals.dirs_count += 1
            }
            OpCode::CountSize | OpCode::CopyDirTime { .. } | OpCode::SkipLabel { .. } => {}
        }
        self.operations.push(op);
        self.operations.len() - 1
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether the script has no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Index of the skip-label that closes the create-dir at `create_dir_index`.
    pub fn skip_label_for(&self, create_dir_index: usize) -> Option<(usize, u64)> {
        self.operations
            .iter()
            .enumerate()
            .skip(create_dir_index + 1)
            .find_map(|(i, op)| match op.opcode {
                OpCode::SkipLabel {
                    create_dir_index: idx,
                    skipped_size,
                } if idx == create_dir_index => Some((i, skipped_size)),
                _ => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_builder() {
        let settings = ScriptSettings::builder()
            .speed_limit(Some(65536u64))
            .preserve_dir_time(true)
            .build()
            .unwrap();

        assert_eq!(settings.speed_limit, Some(65536));
        assert!(settings.preserve_dir_time);
        assert!(settings.preserve_attrs);
    }

    #[test]
    fn test_settings_rejects_zero_limit() {
        let result = ScriptSettings::builder().speed_limit(Some(0u64)).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_effective_trash() {
        let mut settings = ScriptSettings {
            use_trash: true,
            ..Default::default()
        };
        assert!(settings.effective_trash());

        settings.invert_trash = true;
        assert!(!settings.effective_trash());

        settings.use_trash = false;
        assert!(settings.effective_trash());

        settings.can_use_trash = false;
        assert!(!settings.effective_trash());
    }

    #[test]
    fn test_push_updates_totals() {
        let mut script = Script::default();
        script.push(Operation::create_dir("/t/d"));
        script.push(Operation::copy_file("/s/a", "/t/d/a", 10_000));
        script.push(Operation::copy_file("/s/b", "/t/d/b", 0));

        assert_eq!(script.totals.dirs_count, 1);
        assert_eq!(script.totals.files_count, 2);
        assert_eq!(script.totals.total_file_size, 10_000);
        assert_eq!(
            script.totals.total_size,
            crate::CREATE_DIR_SIZE + 10_000 + crate::COPY_MIN_FILE_SIZE
        );
    }

    #[test]
    fn test_skip_label_lookup() {
        let mut script = Script::default();
        let dir = script.push(Operation::create_dir("/t/d"));
        script.push(Operation::copy_file("/s/a", "/t/d/a", 10_000));
        script.push(Operation::new(
            OpCode::SkipLabel {
                create_dir_index: dir,
                skipped_size: 10_000,
            },
            "",
            "",
            0,
        ));

        assert_eq!(script.skip_label_for(dir), Some((2, 10_000)));
        assert_eq!(script.skip_label_for(1), None);
    }

    #[test]
    fn test_convert_translate() {
        let mut data = ConvertData::identity(EolMode::Lf);
        data.code_table[b'a' as usize] = b'A';
        assert_eq!(data.translate(b'a'), b'A');
        assert_eq!(data.translate(b'b'), b'b');
        assert_eq!(data.eol.bytes(), b"\n");
    }
}
