//! Content streaming - asynchronous loading of packed GPU resources

pub mod core;
pub mod device;
pub mod streaming;
pub mod terrain;
