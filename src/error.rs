//! Error types for palette extraction.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("k must be at least 1, got {0}")]
    InvalidK(usize),

    #[error("image dimensions cannot be zero")]
    ZeroDimension,

    #[error("pixel buffer length {len} does not match dimensions {width}x{height}x4")]
    DimensionMismatch { len: usize, width: u32, height: u32 },

    #[error("cannot allocate {len} {what}")]
    Allocation { what: &'static str, len: usize },

    #[error("failed to draw a random pixel index: {0}")]
    Entropy(getrandom::Error),

    #[error("unable to decode image: {0}")]
    Image(#[from] image::ImageError),

    #[error("failed to spawn cluster worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("cluster worker disconnected")]
    WorkerDisconnected,

    #[error("cluster worker failed: {0}")]
    Worker(String),

    #[error("clustering run was cancelled")]
    Cancelled,

    #[error("invalid worker message: {0}")]
    InvalidMessage(#[from] serde_json::Error),
}

impl ClusterError {
    /// Returns true if the error was caused by the request itself rather than
    /// by the worker or the environment.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            ClusterError::InvalidK(_)
                | ClusterError::ZeroDimension
                | ClusterError::DimensionMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
