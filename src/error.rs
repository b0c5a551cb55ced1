//! Error types for the WalB core engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log device is read-only: {0}")]
    ReadOnly(String),

    #[error("ring buffer overflow: latest-oldest would exceed ring_buffer_size ({0} physical blocks)")]
    LogOverflow(u64),

    #[error("checksum mismatch at lsid {lsid}: expected salted checksum to fold to zero")]
    ChecksumMismatch { lsid: u64 },

    #[error("invalid logpack header: {0}")]
    InvalidLogpackHeader(String),

    #[error("logpack record out of range: {0}")]
    RecordOutOfRange(String),

    #[error("data-device IO failed for lsid {lsid}: {reason}")]
    DataIoFailed { lsid: u64, reason: String },

    #[error("log-device IO failed for lsid {lsid}: {reason}")]
    LogIoFailed { lsid: u64, reason: String },

    #[error("pack exceeds max_logpack_pb ({0} physical blocks)")]
    PackTooLarge(u32),

    #[error("device not open: {0}")]
    DeviceNotOpen(String),

    #[error("userland hook failed: {0}")]
    HookFailed(String),

    #[error("engine is frozen")]
    Frozen,

    #[error("end of log stream")]
    EndOfStream,
}

pub type Result<T> = std::result::Result<T, WalbError>;
