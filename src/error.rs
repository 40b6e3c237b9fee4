//! Error types for booster operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during booster operations.
#[derive(Error, Debug)]
pub enum BoosterError {
    /// I/O error during read/write operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error while walking a directory tree.
    #[error("error walking {}: {source}", path.display())]
    Walk {
        /// Root of the walk that failed.
        path: PathBuf,
        /// Underlying walkdir error.
        #[source]
        source: walkdir::Error,
    },

    /// A path under the walk root was not valid UTF-8.
    #[error("non-UTF-8 path under {}", .0.display())]
    NonUtf8Path(PathBuf),

    /// Patch stream framing violation.
    #[error("malformed patch: {0}")]
    PatchFormat(String),

    /// Patch references a block outside the target container.
    #[error("block range {start}..={end} exceeds target container ({blocks} blocks)")]
    BlockOutOfRange {
        /// First block of the offending range.
        start: u64,
        /// Last block of the offending range.
        end: u64,
        /// Number of blocks in the target container.
        blocks: u64,
    },

    /// Serialization of a wire record failed.
    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),

    /// One or more files failed during a recompression pass.
    #[error("{failed} file(s) failed to recompress under {}", path.display())]
    Recompress {
        /// Base directory of the pass.
        path: PathBuf,
        /// Number of failed files.
        failed: usize,
    },

    /// HTTP transport failure talking to the primary.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The primary returned an unusable response.
    #[error("bad response from primary: {0}")]
    BadResponse(String),

    /// Request parameter validation failure.
    #[error("invalid parameter: {0}")]
    Validation(String),

    /// Operation requires a primary URL but none is configured.
    #[error("no primary configured")]
    NoPrimary,
}

/// Result type for booster operations.
pub type Result<T> = std::result::Result<T, BoosterError>;
