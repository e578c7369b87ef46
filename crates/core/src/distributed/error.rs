//! Error types for distributed operations.

use thiserror::Error;

/// Errors that can occur during collective operations.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// Tensor shape mismatch for collective operation.
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Tensor device mismatch.
    #[error("tensor device mismatch: expected {expected}, got {actual}")]
    DeviceMismatch { expected: String, actual: String },

    /// A peer left the group (its channel endpoint was dropped).
    #[error("communication with rank {peer} failed: {reason}")]
    Communication { peer: usize, reason: String },

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
