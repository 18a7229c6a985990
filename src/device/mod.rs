//! GPU device abstraction
//!
//! The streaming core never talks to a graphics API directly. It creates,
//! destroys and uploads opaque resources through [`GpuDevice`], which any
//! backend can implement:
//! - [`HeadlessDevice`]: in-memory backend used by tools and tests
//! - `WgpuDevice`: real GPU backend (feature `backend_wgpu`)

pub mod headless;
#[cfg(feature = "backend_wgpu")]
pub mod wgpu_backend;

pub use headless::HeadlessDevice;
#[cfg(feature = "backend_wgpu")]
pub use wgpu_backend::WgpuDevice;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

/// Texel formats understood by the pool and the payload codec
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    R8Unorm,
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba16Float,
    R32Float,
    /// 4x4 blocks, 8 bytes per block
    Bc1RgbaUnorm,
    /// 4x4 blocks, 16 bytes per block
    Bc3RgbaUnorm,
}

impl TextureFormat {
    /// Edge length of a compression block (1 for uncompressed formats)
    pub fn block_dim(self) -> u32 {
        match self {
            TextureFormat::Bc1RgbaUnorm | TextureFormat::Bc3RgbaUnorm => 4,
            _ => 1,
        }
    }

    /// Bytes per block (per texel for uncompressed formats)
    pub fn block_bytes(self) -> u64 {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rgba8Unorm | TextureFormat::Bgra8Unorm | TextureFormat::R32Float => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Bc1RgbaUnorm => 8,
            TextureFormat::Bc3RgbaUnorm => 16,
        }
    }

    /// Stable id used in payload headers
    pub fn to_id(self) -> u32 {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rgba8Unorm => 2,
            TextureFormat::Bgra8Unorm => 3,
            TextureFormat::Rgba16Float => 4,
            TextureFormat::R32Float => 5,
            TextureFormat::Bc1RgbaUnorm => 6,
            TextureFormat::Bc3RgbaUnorm => 7,
        }
    }

    pub fn from_id(id: u32) -> Result<Self> {
        Ok(match id {
            1 => TextureFormat::R8Unorm,
            2 => TextureFormat::Rgba8Unorm,
            3 => TextureFormat::Bgra8Unorm,
            4 => TextureFormat::Rgba16Float,
            5 => TextureFormat::R32Float,
            6 => TextureFormat::Bc1RgbaUnorm,
            7 => TextureFormat::Bc3RgbaUnorm,
            other => return Err(Error::InvalidData(format!("unknown texture format id {}", other))),
        })
    }
}

/// Index element width
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub fn size(self) -> u64 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }

    pub fn to_id(self) -> u32 {
        match self {
            IndexFormat::Uint16 => 16,
            IndexFormat::Uint32 => 32,
        }
    }

    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            16 => Ok(IndexFormat::Uint16),
            32 => Ok(IndexFormat::Uint32),
            other => Err(Error::InvalidData(format!("unknown index format id {}", other))),
        }
    }
}

/// Shape of a 2D texture with a mip chain
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
}

impl TextureDesc {
    pub fn new(width: u32, height: u32, mip_levels: u32, format: TextureFormat) -> Self {
        Self { width, height, mip_levels, format }
    }

    /// Number of levels in a full chain down to 1x1
    pub fn full_mip_count(width: u32, height: u32) -> u32 {
        32 - width.max(height).max(1).leading_zeros()
    }

    /// Texel dimensions of a mip level
    pub fn mip_extent(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }

    /// Bytes in one row of blocks at a mip level
    pub fn row_bytes(&self, level: u32) -> u64 {
        let (w, _) = self.mip_extent(level);
        let dim = self.format.block_dim();
        w.div_ceil(dim) as u64 * self.format.block_bytes()
    }

    /// Rows of blocks at a mip level
    pub fn block_rows(&self, level: u32) -> u32 {
        let (_, h) = self.mip_extent(level);
        h.div_ceil(self.format.block_dim())
    }

    /// Bytes of a single mip level
    pub fn level_bytes(&self, level: u32) -> u64 {
        self.row_bytes(level) * self.block_rows(level) as u64
    }

    /// Bytes of the whole mip chain, laid out level after level
    pub fn footprint(&self) -> u64 {
        (0..self.mip_levels.max(1)).map(|l| self.level_bytes(l)).sum()
    }
}

/// What a buffer is bound as
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index(IndexFormat),
}

/// Opaque texture id issued by a device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u64);

/// Opaque buffer id issued by a device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

/// Which implementation sits behind a [`GpuDevice`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Headless,
    Wgpu,
}

/// Capability interface over a graphics device.
///
/// Creation and destruction are only issued from the pool (under its lock);
/// uploads are only issued from the graphics thread's drain.
pub trait GpuDevice: Send + Sync {
    fn backend(&self) -> Backend;

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureHandle>;

    fn create_buffer(&self, kind: BufferKind, size: u64) -> Result<BufferHandle>;

    fn destroy_texture(&self, handle: TextureHandle);

    fn destroy_buffer(&self, handle: BufferHandle);

    /// Upload a full mip chain, levels packed back to back
    fn upload_texture(&self, handle: TextureHandle, data: &[u8]) -> Result<()>;

    fn upload_buffer(&self, handle: BufferHandle, data: &[u8]) -> Result<()>;
}
