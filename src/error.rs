//! Error types for Vantage.

use thiserror::Error;

/// Result type alias using Vantage's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Vantage operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// An argument failed validation (bad key, bad shape, bad value).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A format query failed or a format is not representable.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A frame index lies outside the stream and could not be clamped.
    #[error("frame {index} out of range, stream has {num_frames} frames")]
    FrameOutOfRange {
        /// The requested index.
        index: i64,
        /// Total frames in the stream.
        num_frames: usize,
    },

    /// A dependency of the requesting filter failed; carries that
    /// dependency's message.
    #[error("dependency failed: {0}")]
    Dependency(String),

    /// A filter reported an error for the current frame.
    #[error("{0}")]
    Filter(String),

    /// An allocation was refused under the memory budget.
    #[error("allocation of {0} bytes failed under the memory budget")]
    OutOfMemory(usize),

    /// A typed property read failed.
    #[error("property access: {0}")]
    Property(#[from] crate::map::PropError),

    /// The core is shutting down; outstanding requests drain with this.
    #[error("core is shutting down")]
    Shutdown,
}
