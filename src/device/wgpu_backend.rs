//! wgpu device backend
//!
//! Resources live in maps keyed by the opaque handle ids handed to the pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{Backend, BufferHandle, BufferKind, GpuDevice, TextureDesc, TextureFormat, TextureHandle};
use crate::core::{Error, Result};

fn to_wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
        TextureFormat::Bc1RgbaUnorm => wgpu::TextureFormat::Bc1RgbaUnorm,
        TextureFormat::Bc3RgbaUnorm => wgpu::TextureFormat::Bc3RgbaUnorm,
    }
}

/// Device backed by a wgpu device and queue
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    textures: Mutex<HashMap<u64, (wgpu::Texture, TextureDesc)>>,
    buffers: Mutex<HashMap<u64, wgpu::Buffer>>,
    next_id: AtomicU64,
}

impl WgpuDevice {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            textures: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run `f` against the wgpu texture behind a handle
    pub fn with_texture<R>(&self, handle: TextureHandle, f: impl FnOnce(&wgpu::Texture) -> R) -> Option<R> {
        self.textures.lock().get(&handle.0).map(|(texture, _)| f(texture))
    }

    /// Run `f` against the wgpu buffer behind a handle
    pub fn with_buffer<R>(&self, handle: BufferHandle, f: impl FnOnce(&wgpu::Buffer) -> R) -> Option<R> {
        self.buffers.lock().get(&handle.0).map(f)
    }
}

impl GpuDevice for WgpuDevice {
    fn backend(&self) -> Backend {
        Backend::Wgpu
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureHandle> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("streamed_texture"),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: desc.mip_levels.max(1),
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: to_wgpu_format(desc.format),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.textures.lock().insert(id, (texture, *desc));
        Ok(TextureHandle(id))
    }

    fn create_buffer(&self, kind: BufferKind, size: u64) -> Result<BufferHandle> {
        let usage = match kind {
            BufferKind::Vertex => wgpu::BufferUsages::VERTEX,
            BufferKind::Index(_) => wgpu::BufferUsages::INDEX,
        };
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("streamed_buffer"),
            // write_buffer requires a multiple of 4
            size: size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT),
            usage: usage | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.buffers.lock().insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn destroy_texture(&self, handle: TextureHandle) {
        if let Some((texture, _)) = self.textures.lock().remove(&handle.0) {
            texture.destroy();
        }
    }

    fn destroy_buffer(&self, handle: BufferHandle) {
        if let Some(buffer) = self.buffers.lock().remove(&handle.0) {
            buffer.destroy();
        }
    }

    fn upload_texture(&self, handle: TextureHandle, data: &[u8]) -> Result<()> {
        let textures = self.textures.lock();
        let (texture, desc) = textures
            .get(&handle.0)
            .ok_or_else(|| Error::Device(format!("upload to unknown texture {}", handle.0)))?;

        if data.len() as u64 != desc.footprint() {
            return Err(Error::Device(format!(
                "texture upload of {} bytes, expected {}",
                data.len(),
                desc.footprint()
            )));
        }

        let mut offset = 0usize;
        for level in 0..desc.mip_levels.max(1) {
            let level_bytes = desc.level_bytes(level) as usize;
            let (width, height) = desc.mip_extent(level);
            let dim = desc.format.block_dim();
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture,
                    mip_level: level,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &data[offset..offset + level_bytes],
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(desc.row_bytes(level) as u32),
                    rows_per_image: Some(desc.block_rows(level)),
                },
                wgpu::Extent3d {
                    width: width.next_multiple_of(dim),
                    height: height.next_multiple_of(dim),
                    depth_or_array_layers: 1,
                },
            );
            offset += level_bytes;
        }
        Ok(())
    }

    fn upload_buffer(&self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        let buffers = self.buffers.lock();
        let buffer = buffers
            .get(&handle.0)
            .ok_or_else(|| Error::Device(format!("upload to unknown buffer {}", handle.0)))?;

        // Pad the tail to the copy alignment
        let aligned = (data.len() as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT) as usize;
        if aligned == data.len() {
            self.queue.write_buffer(buffer, 0, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(aligned, 0);
            self.queue.write_buffer(buffer, 0, &padded);
        }
        Ok(())
    }
}
