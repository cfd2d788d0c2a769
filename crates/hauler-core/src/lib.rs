//! Core types for hauler.
//!
//! This crate provides the data structures shared by the execution engine
//! and its front ends: operations, scripts, run-wide settings, engine
//! configuration and the error taxonomy.

mod config;
mod error;
mod operation;
mod script;

pub use config::{
    default_async_tiers, BufferTier, EngineConfig, EngineConfigBuilder, ASYNC_COPY_BUF_SIZE,
    OPERATION_BUFFER, PREALLOCATE_MIN_SIZE, REMOVABLE_DISK_COPY_BUFFER, RETRYCOPY_TAIL_MINSIZE,
};
pub use error::EngineError;
pub use operation::{
    FileAttributes, OpCode, Operation, OperationError, OperationFlags, CHATTRS_FILE_SIZE,
    CONVERT_MIN_FILE_SIZE, COPY_MIN_FILE_SIZE, CREATE_DIR_SIZE, DELETE_DIRLINK_SIZE,
    DELETE_DIR_SIZE, DELETE_FILE_SIZE, MOVE_DIR_SIZE, MOVE_FILE_SIZE,
};
pub use script::{
    ChangeAttrsData, ConvertData, EolMode, Script, ScriptSettings, ScriptSettingsBuilder,
    ScriptTotals,
};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
