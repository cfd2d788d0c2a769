//! File operation execution engine for hauler.
//!
//! Scripts built by [`plan_script`] are run by [`start_script`] on a tokio
//! task. The task reports through a channel of [`ScriptEvent`]s, stops to
//! ask the operator about recoverable errors, and honours pause, cancel and
//! a speed limit shared through [`OperationStatus`]. Files are copied either
//! with a simple read/write loop or through the overlapped block
//! [`Pipeline`], which can resume after an I/O error without sending bytes
//! twice.

mod attrs;
mod clock;
mod context;
mod control;
mod convert;
mod copy;
mod create;
mod decision;
mod delete;
mod driver;
pub mod fs;
mod meter;
mod move_op;
mod pipeline;
mod plan;
mod progress;
mod queue;
mod ring;
mod status;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{check_name, StepOutcome, MAX_NAME_LEN};
pub use control::JobControl;
pub use convert::LineConverter;
pub use decision::{Decision, DecisionRequest, ErrorCategory, ErrorClass, Resolution, RunPolicy};
pub use driver::{start_script, Job, ScriptHandle};
pub use fs::{FileSystem, LocalFs, MemFs};
pub use meter::{
    MeterParams, ProgressSpeedMeter, SpeedMeter, TransferSpeedMeter, ASYNC_SLOW_COPY_BUF_MINBLOCKS,
    ASYNC_SLOW_COPY_BUF_SIZE,
};
pub use pipeline::{BlockCounts, BlockState, IoSide, Pipeline, PipelineError, PIPELINE_BLOCKS};
pub use plan::{plan_script, PlanKind, PlanRequest};
pub use progress::{OperationStarted, ScriptEvent, ScriptOutcome, ScriptProgress, ScriptReport};
pub use queue::{JobId, JobQueue, JobState};
pub use ring::Ring;
pub use status::{OperationStatus, StatusSnapshot, HIGH_SPEED_LIMIT, HIGH_SPEED_LIMIT_BRAKE_DIV};
