//! Error taxonomy for the logging engine.
//!
//! Every public operation returns [`Result`]; the variants below follow the
//! propagation rules described in the crate documentation: producers block on
//! a full write buffer instead of seeing [`LogError::BufferFull`] (the
//! variant surfaces only on non-blocking internal paths), checksum mismatches
//! are counted and skipped during recovery, and I/O failures poison the
//! affected range until it is re-initialized.

use std::io;

/// Errors surfaced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Configuration rejected at startup.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Underlying disk I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Payload checksum did not match the stored CRC.
    #[error("checksum mismatch for chunk {cid:#018x}")]
    ChecksumMismatch {
        /// Chunk whose payload failed verification.
        cid: u64,
    },

    /// The write buffer cannot accept more data right now.
    #[error("write buffer full")]
    BufferFull,

    /// No backup range is registered for the given owner and range id.
    #[error("backup range {range_id} of owner {owner:#06x} not found")]
    RangeNotFound {
        /// Owner node id.
        owner: u16,
        /// Range id within the owner.
        range_id: u16,
    },

    /// On-disk data failed structural validation.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// The engine is shutting down; the operation was not performed.
    #[error("shutdown in progress")]
    Shutdown,
}

impl LogError {
    /// Short tag used for per-kind error counters.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            LogError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            LogError::Io(_) => ErrorKind::Io,
            LogError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            LogError::BufferFull => ErrorKind::BufferFull,
            LogError::RangeNotFound { .. } => ErrorKind::RangeNotFound,
            LogError::Corrupt(_) => ErrorKind::Corrupt,
            LogError::Shutdown => ErrorKind::Shutdown,
        }
    }
}

/// Error categories, used for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    /// Configuration rejected.
    InvalidConfig = 0,
    /// I/O failure.
    Io = 1,
    /// Payload CRC mismatch.
    ChecksumMismatch = 2,
    /// Write buffer exhausted.
    BufferFull = 3,
    /// Unknown backup range.
    RangeNotFound = 4,
    /// Structural corruption.
    Corrupt = 5,
    /// Engine shutting down.
    Shutdown = 6,
}

impl ErrorKind {
    /// Number of distinct kinds (size of counter arrays).
    pub const COUNT: usize = 7;

    /// Stable display name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidConfig => "InvalidConfig",
            ErrorKind::Io => "IoError",
            ErrorKind::ChecksumMismatch => "ChecksumMismatch",
            ErrorKind::BufferFull => "BufferFull",
            ErrorKind::RangeNotFound => "RangeNotFound",
            ErrorKind::Corrupt => "Corrupt",
            ErrorKind::Shutdown => "Shutdown",
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LogError>;
