//! Error types for the streaming core

use thiserror::Error;

/// Main error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Bad magic number: expected {expected:?}, found {found:?}")]
    BadMagic { expected: [u8; 4], found: [u8; 4] },

    #[error("Packed file granularity {stored} does not match platform granularity {expected}")]
    GranularityMismatch { stored: u64, expected: u64 },

    #[error("Device out of memory")]
    DeviceOutOfMemory,

    #[error("Device error: {0}")]
    Device(String),

    #[error("Resource pool exhausted after {0} lock attempts")]
    PoolExhausted(u32),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Loader threads have stopped")]
    Shutdown,
}

impl Error {
    /// Project the error onto the `Copy` code stored in result slots
    pub fn code(&self) -> ResultCode {
        match self {
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ResultCode::NotFound,
            Error::Io(_) => ResultCode::Io,
            Error::NotFound(_) => ResultCode::NotFound,
            Error::InvalidData(_) => ResultCode::InvalidData,
            Error::BadMagic { .. } => ResultCode::BadMagic,
            Error::GranularityMismatch { .. } => ResultCode::InvalidData,
            Error::DeviceOutOfMemory => ResultCode::DeviceOutOfMemory,
            Error::Device(_) => ResultCode::Device,
            Error::PoolExhausted(_) => ResultCode::PoolExhausted,
            Error::Config(_) => ResultCode::Config,
            Error::Shutdown => ResultCode::Shutdown,
        }
    }
}

/// Outcome code written into a request's result slot.
///
/// Unlike [`Error`] this is `Copy`, so the same code can be carried through
/// every pipeline stage and handed to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok,
    Io,
    NotFound,
    InvalidData,
    BadMagic,
    DeviceOutOfMemory,
    Device,
    PoolExhausted,
    Config,
    Shutdown,
}

impl ResultCode {
    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }
}
