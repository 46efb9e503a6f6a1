//! Error types for block processing

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by partitioning, execution and result collection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    /// Shape or dimension mismatch, non-positive step, bad grid rank.
    /// Always reported before any block runs.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The user function failed (returned an error or panicked) on one block
    #[error("block {index:?} failed: {message}")]
    WorkerFailure { index: Vec<usize>, message: String },

    /// No completion arrived within the configured wait
    #[error("timed out after {timeout:?} waiting for completion {} of {expected}", .received + 1)]
    Timeout {
        timeout: Duration,
        received: usize,
        expected: usize,
    },

    /// Every producer went away before all completions were delivered
    #[error("completion channel closed after {received} of {expected} completions")]
    Disconnected { received: usize, expected: usize },

    /// Worker threads or the thread pool could not be created
    #[error("failed to start worker pool: {0}")]
    PoolSetup(String),

    /// The completion stream broke the one-completion-per-index rule
    #[error("completion stream corrupted: {0}")]
    Corrupted(String),
}

impl BlockError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        BlockError::InvalidArgument(message.into())
    }

    /// Grid index of the failing block, for `WorkerFailure`
    pub fn grid_index(&self) -> Option<&[usize]> {
        match self {
            BlockError::WorkerFailure { index, .. } => Some(index),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BlockError::Timeout { .. })
    }
}

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, BlockError>;
