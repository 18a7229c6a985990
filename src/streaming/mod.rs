//! Content streaming: packed files, pooled GPU resources and the async loader

pub mod budget;
pub mod cache;
pub mod payload;
pub mod disk_io;
pub mod packed;
pub mod request;
pub mod loaders;
pub mod processors;
pub mod async_loader;

pub use budget::MemoryBudget;
pub use cache::{CacheStats, PoolEntry, PoolKind, ResourceReuseCache};
pub use payload::PayloadShape;
pub use disk_io::{
    ChunkHeader, IndexEntry, PackedFileBuilder, PackedFileHeader, PackedFileMetadata,
    MAPPING_GRANULARITY,
};
pub use packed::{PackedBytes, PackedFile, PackedFileOptions, PackedFileStats};
pub use request::{DataLoader, DataProcessor, LockStatus, ResourceSlot, ResourceState, ResultSlot};
pub use loaders::{FileDataLoader, MemoryDataLoader, PackedDataLoader};
pub use processors::{BufferProcessor, MeshHandle, MeshProcessor, TextureProcessor};
pub use async_loader::{AsyncLoader, LoaderStats};
