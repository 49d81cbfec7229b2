use thiserror::Error;

/// Canonical error taxonomy shared by the scan, spill, and execution crates.
///
/// Classification guidance:
/// - [`StrataError::Internal`]: broken invariants and logic errors; never retried
/// - [`StrataError::ResourceExhausted`]: memory that could not be granted even after spilling
/// - [`StrataError::Execution`]: runtime decode/encode or data-shape failures
/// - [`StrataError::InvalidConfig`]: configuration contract violations
/// - [`StrataError::Unsupported`]: valid requests for shapes that are not implemented
/// - [`StrataError::Io`]: raw filesystem failures while spilling or restoring
#[derive(Debug, Error)]
pub enum StrataError {
    /// Invalid or inconsistent configuration.
    ///
    /// Examples:
    /// - zero spill partition bits
    /// - start partition bit beyond the hash width
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Runtime execution failures.
    ///
    /// Examples:
    /// - Arrow/IPC/parquet encode or decode failures
    /// - spill file with bad magic or version
    /// - batch schema not matching the operator input type
    #[error("execution error: {0}")]
    Execution(String),

    /// Logic errors and broken format or engine invariants.
    ///
    /// Examples:
    /// - value extraction after the extraction window was closed
    /// - preset null count not consumed before the next range
    /// - compaction asked for more rows than were decoded
    #[error("internal error: {0}")]
    Internal(String),

    /// Memory could not be granted by the pool even after spilling.
    ///
    /// The message carries pool name, usage, and reservation.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for a shape not implemented in the current version.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Standard result alias.
pub type Result<T> = std::result::Result<T, StrataError>;
