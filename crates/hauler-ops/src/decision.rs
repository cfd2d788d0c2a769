//! Operator decisions for recoverable errors.
//!
//! Every recoverable error stops the script and asks the operator what to
//! do. The question carries an [`ErrorCategory`], which fixes the answers
//! on offer; "for all" answers are remembered per category in the
//! [`RunPolicy`] for the rest of the script.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumCount, EnumIter, IntoStaticStr};
use tokio::sync::oneshot;

/// Broad class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ErrorClass {
    /// The request itself is wrong (bad name, copy onto itself).
    Precondition,
    /// Opening or creating a file failed.
    Open,
    /// Reading or writing data failed.
    Io,
    /// Metadata could not be carried over; the data itself is fine.
    Attribute,
    /// Directory structure conflict.
    Structural,
}

/// What went wrong, at the granularity "skip all" works on.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumCount,
    EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "title_case")]
pub enum ErrorCategory {
    InvalidName,
    NameTooLong,
    CopyOntoSelf,
    ClassMismatch,
    SourceOpen,
    TargetCreate,
    Overwrite,
    Read,
    Write,
    TailMismatch,
    Streams,
    Security,
    Attributes,
    EncryptionLoss,
    CompressionLoss,
    FileTime,
    DirCreate,
    DirDelete,
    FileDelete,
    LinkDelete,
    Move,
    ChangeAttrs,
    Convert,
    CountSize,
    InsufficientSpace,
}

impl ErrorCategory {
    pub fn class(self) -> ErrorClass {
        match self {
            Self::InvalidName | Self::NameTooLong | Self::CopyOntoSelf | Self::ClassMismatch => {
                ErrorClass::Precondition
            }
            Self::SourceOpen | Self::TargetCreate | Self::Overwrite => ErrorClass::Open,
            Self::Read | Self::Write | Self::TailMismatch | Self::Convert | Self::CountSize => {
                ErrorClass::Io
            }
            Self::Streams
            | Self::Security
            | Self::Attributes
            | Self::EncryptionLoss
            | Self::CompressionLoss
            | Self::FileTime
            | Self::InsufficientSpace => ErrorClass::Attribute,
            Self::DirCreate
            | Self::DirDelete
            | Self::FileDelete
            | Self::LinkDelete
            | Self::Move
            | Self::ChangeAttrs => ErrorClass::Structural,
        }
    }

    /// Answers offered for this category.
    pub fn allowed(self) -> &'static [Decision] {
        use Decision::*;
        match self {
            Self::Overwrite => &[Yes, YesAll, Skip, SkipAll, Cancel],
            Self::EncryptionLoss | Self::CompressionLoss => &[Ignore, IgnoreAll, Skip, Cancel],
            Self::InsufficientSpace => &[Ignore, Cancel],
            // Retrying a rejected name cannot succeed.
            Self::InvalidName | Self::NameTooLong | Self::CopyOntoSelf | Self::ClassMismatch => {
                &[Skip, SkipAll, Cancel]
            }
            _ if self.class() == ErrorClass::Attribute => &[Retry, Ignore, IgnoreAll, Cancel],
            _ => &[Retry, Skip, SkipAll, Cancel],
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// An operator's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum Decision {
    Retry,
    Yes,
    YesAll,
    Skip,
    SkipAll,
    Ignore,
    IgnoreAll,
    Cancel,
}

impl Decision {
    /// Whether this answer applies to all remaining errors of its category.
    pub fn is_global(self) -> bool {
        matches!(self, Self::YesAll | Self::SkipAll | Self::IgnoreAll)
    }

    /// What the orchestrator does with this answer.
    pub fn resolution(self) -> Resolution {
        match self {
            Self::Retry => Resolution::Retry,
            Self::Yes | Self::YesAll | Self::Ignore | Self::IgnoreAll => Resolution::Proceed,
            Self::Skip | Self::SkipAll => Resolution::Skip,
            Self::Cancel => Resolution::Cancel,
        }
    }
}

/// Action taken after a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Try the failed step again.
    Retry,
    /// Go on as if the step had succeeded (overwrite, ignore).
    Proceed,
    /// Abandon the current operation.
    Skip,
    /// Abandon the script.
    Cancel,
}

/// A question for the operator.
#[derive(Debug)]
pub struct DecisionRequest {
    pub category: ErrorCategory,
    pub source: Option<PathBuf>,
    pub target: Option<PathBuf>,
    /// OS error text or explanation.
    pub message: String,
    pub allowed: &'static [Decision],
    reply: oneshot::Sender<Decision>,
}

impl DecisionRequest {
    /// Create a request and the receiver its answer arrives on.
    pub fn new(
        category: ErrorCategory,
        source: Option<PathBuf>,
        target: Option<PathBuf>,
        message: impl Into<String>,
    ) -> (Self, oneshot::Receiver<Decision>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                category,
                source,
                target,
                message: message.into(),
                allowed: category.allowed(),
                reply,
            },
            rx,
        )
    }

    /// The path most relevant to the operator.
    pub fn path(&self) -> Option<&PathBuf> {
        self.target.as_ref().or(self.source.as_ref())
    }

    /// Send the answer; answers not on offer are turned into Cancel.
    pub fn answer(self, decision: Decision) {
        let decision = if self.allowed.contains(&decision) {
            decision
        } else {
            Decision::Cancel
        };
        let _ = self.reply.send(decision);
    }
}

/// Script-wide memory of "for all" answers and run-time discoveries.
#[derive(Debug, Clone, Default)]
pub struct RunPolicy {
    skip_all: [bool; ErrorCategory::COUNT],
    ignore_all: [bool; ErrorCategory::COUNT],
    /// Overwrite existing targets without asking.
    pub overwrite_all: bool,
    /// Overwrite only when the source is newer, silently skipping otherwise.
    pub overwrite_older: bool,
    /// Preallocation proved unreliable on this run's target.
    pub preallocation_disabled: bool,
}

impl RunPolicy {
    pub fn new(overwrite_all: bool, overwrite_older: bool) -> Self {
        Self {
            overwrite_all,
            overwrite_older,
            ..Default::default()
        }
    }

    /// An earlier "for all" answer that settles this category.
    pub fn auto_answer(&self, category: ErrorCategory) -> Option<Resolution> {
        if self.skip_all[category.index()] {
            return Some(Resolution::Skip);
        }
        if self.ignore_all[category.index()] {
            return Some(Resolution::Proceed);
        }
        if category == ErrorCategory::Overwrite && self.overwrite_all {
            return Some(Resolution::Proceed);
        }
        None
    }

    /// Remember a "for all" answer.
    pub fn record(&mut self, category: ErrorCategory, decision: Decision) {
        match decision {
            Decision::SkipAll => self.skip_all[category.index()] = true,
            Decision::IgnoreAll => self.ignore_all[category.index()] = true,
            Decision::YesAll if category == ErrorCategory::Overwrite => self.overwrite_all = true,
            _ => {}
        }
    }

    /// Whether every error of `category` is skipped.
    pub fn skips_all(&self, category: ErrorCategory) -> bool {
        self.skip_all[category.index()]
    }

    /// Whether every error of `category` is ignored.
    pub fn ignores_all(&self, category: ErrorCategory) -> bool {
        self.ignore_all[category.index()]
    }
}
