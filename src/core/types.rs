//! Core type aliases and re-exports

pub use glam::Vec3;

/// Standard Result type for the crate
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;

/// Bytes in a mebibyte
pub const MIB: u64 = 1024 * 1024;
