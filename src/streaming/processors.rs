//! Data processors for textures, buffers and meshes
//!
//! Every processor follows the same four steps:
//! 1. `process` validates the payload and keeps its body
//! 2. `lock_device_object` loans a matching object from the reuse cache (or
//!    asks to be retried)
//! 3. `copy_to_resource` moves the body into staging for the upload
//! 4. `unlock_device_object` uploads the staging bytes and publishes the handle
//!
//! A loaned object that never gets published goes back to the cache, both on
//! `set_resource_error` and when the processor is dropped early.

use std::sync::Arc;

use crate::core::{Error, Result};
use crate::device::{BufferHandle, BufferKind, IndexFormat, TextureDesc, TextureHandle};
use crate::streaming::cache::ResourceReuseCache;
use crate::streaming::payload::{self, PayloadShape};
use crate::streaming::request::{DataProcessor, LockStatus, ResourceSlot};

fn not_processed(what: &str) -> Error {
    Error::InvalidData(format!("{} locked before its payload was processed", what))
}

fn not_locked(what: &str) -> Error {
    Error::InvalidData(format!("{} has no locked device object", what))
}

/// Move `body` into `staging` once it has the size the locked object needs
fn stage(staging: &mut Vec<u8>, body: &mut Vec<u8>, expected: usize) -> Result<()> {
    if body.len() != expected {
        return Err(Error::InvalidData(format!(
            "locked object takes {} bytes, payload body is {}",
            expected,
            body.len()
        )));
    }
    *staging = std::mem::take(body);
    Ok(())
}

// --- Textures ---

/// Streams a texture payload into a pooled texture
pub struct TextureProcessor {
    cache: Arc<ResourceReuseCache>,
    output: ResourceSlot<TextureHandle>,
    desc: Option<TextureDesc>,
    body: Vec<u8>,
    locked: Option<TextureHandle>,
    staging: Vec<u8>,
}

impl TextureProcessor {
    pub fn new(cache: Arc<ResourceReuseCache>, output: ResourceSlot<TextureHandle>) -> Self {
        Self {
            cache,
            output,
            desc: None,
            body: Vec::new(),
            locked: None,
            staging: Vec::new(),
        }
    }

    fn release(&mut self) {
        if let Some(handle) = self.locked.take() {
            self.cache.unuse_texture(handle);
        }
        self.staging = Vec::new();
    }
}

impl DataProcessor for TextureProcessor {
    fn process(&mut self, data: &[u8]) -> Result<()> {
        let (shape, body) = payload::decode(data, payload::TEXTURE_MAGIC)?;
        let PayloadShape::Texture(desc) = shape else {
            return Err(Error::InvalidData(format!("expected a texture, found {:?}", shape)));
        };
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 {
            return Err(Error::InvalidData(format!("degenerate texture {:?}", desc)));
        }
        self.desc = Some(desc);
        self.body = body.to_vec();
        Ok(())
    }

    fn lock_device_object(&mut self) -> Result<LockStatus> {
        let desc = self.desc.ok_or_else(|| not_processed("texture"))?;
        match self
            .cache
            .get_free_texture(desc.width, desc.height, desc.mip_levels, desc.format)
        {
            Some(handle) => {
                self.locked = Some(handle);
                Ok(LockStatus::Locked)
            }
            None => Ok(LockStatus::TryAgain),
        }
    }

    fn copy_to_resource(&mut self) -> Result<()> {
        let desc = self.desc.ok_or_else(|| not_processed("texture"))?;
        if self.locked.is_none() {
            return Err(not_locked("texture"));
        }
        stage(&mut self.staging, &mut self.body, desc.footprint() as usize)
    }

    fn unlock_device_object(&mut self) -> Result<()> {
        let handle = self.locked.ok_or_else(|| not_locked("texture"))?;
        self.cache.device().upload_texture(handle, &self.staging)?;
        self.locked = None;
        self.staging = Vec::new();
        self.output.set_ready(handle);
        Ok(())
    }

    fn set_resource_error(&mut self) {
        self.release();
        self.output.set_error();
    }
}

impl Drop for TextureProcessor {
    fn drop(&mut self) {
        self.release();
    }
}

// --- Buffers ---

/// Streams a vertex or index payload into a pooled buffer
pub struct BufferProcessor {
    cache: Arc<ResourceReuseCache>,
    output: ResourceSlot<BufferHandle>,
    index: bool,
    kind: Option<BufferKind>,
    size: usize,
    body: Vec<u8>,
    locked: Option<BufferHandle>,
    staging: Vec<u8>,
}

impl BufferProcessor {
    pub fn vertex(cache: Arc<ResourceReuseCache>, output: ResourceSlot<BufferHandle>) -> Self {
        Self::new(cache, output, false)
    }

    pub fn index(cache: Arc<ResourceReuseCache>, output: ResourceSlot<BufferHandle>) -> Self {
        Self::new(cache, output, true)
    }

    fn new(cache: Arc<ResourceReuseCache>, output: ResourceSlot<BufferHandle>, index: bool) -> Self {
        Self {
            cache,
            output,
            index,
            kind: None,
            size: 0,
            body: Vec::new(),
            locked: None,
            staging: Vec::new(),
        }
    }

    fn release(&mut self) {
        if let Some(handle) = self.locked.take() {
            match self.kind {
                Some(BufferKind::Index(_)) => self.cache.unuse_index_buffer(handle),
                _ => self.cache.unuse_vertex_buffer(handle),
            };
        }
        self.staging = Vec::new();
    }
}

impl DataProcessor for BufferProcessor {
    fn process(&mut self, data: &[u8]) -> Result<()> {
        let magic = if self.index { payload::INDEX_MAGIC } else { payload::VERTEX_MAGIC };
        let (shape, body) = payload::decode(data, magic)?;
        let kind = match shape {
            PayloadShape::Vertex { .. } => BufferKind::Vertex,
            PayloadShape::Index { format, .. } => BufferKind::Index(format),
            other => return Err(Error::InvalidData(format!("expected a buffer, found {:?}", other))),
        };
        if body.is_empty() {
            return Err(Error::InvalidData("empty buffer payload".into()));
        }
        self.kind = Some(kind);
        self.size = body.len();
        self.body = body.to_vec();
        Ok(())
    }

    fn lock_device_object(&mut self) -> Result<LockStatus> {
        let kind = self.kind.ok_or_else(|| not_processed("buffer"))?;
        let size = self.size as u64;
        let handle = match kind {
            BufferKind::Vertex => self.cache.get_free_vertex_buffer(size),
            BufferKind::Index(format) => self.cache.get_free_index_buffer(size, format),
        };
        match handle {
            Some(handle) => {
                self.locked = Some(handle);
                Ok(LockStatus::Locked)
            }
            None => Ok(LockStatus::TryAgain),
        }
    }

    fn copy_to_resource(&mut self) -> Result<()> {
        if self.locked.is_none() {
            return Err(not_locked("buffer"));
        }
        stage(&mut self.staging, &mut self.body, self.size)
    }

    fn unlock_device_object(&mut self) -> Result<()> {
        let handle = self.locked.ok_or_else(|| not_locked("buffer"))?;
        self.cache.device().upload_buffer(handle, &self.staging)?;
        self.locked = None;
        self.staging = Vec::new();
        self.output.set_ready(handle);
        Ok(())
    }

    fn set_resource_error(&mut self) {
        self.release();
        self.output.set_error();
    }
}

impl Drop for BufferProcessor {
    fn drop(&mut self) {
        self.release();
    }
}

// --- Meshes ---

/// Vertex and index buffer of one streamed mesh
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshHandle {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub vertex_count: u32,
    pub index_format: IndexFormat,
    pub index_count: u32,
}

impl MeshHandle {
    /// Give both buffers back to the cache
    pub fn release(self, cache: &ResourceReuseCache) {
        cache.unuse_vertex_buffer(self.vertex_buffer);
        cache.unuse_index_buffer(self.index_buffer);
    }
}

#[derive(Clone, Copy, Debug)]
struct MeshLayout {
    vertex_bytes: usize,
    vertex_count: u32,
    index_format: IndexFormat,
    index_count: u32,
}

impl MeshLayout {
    fn index_bytes(&self) -> usize {
        self.index_format.size() as usize * self.index_count as usize
    }
}

/// Streams a mesh payload into a vertex buffer and an index buffer.
///
/// Both buffers must be loaned together; if only one is available it is
/// given back and the lock is retried.
pub struct MeshProcessor {
    cache: Arc<ResourceReuseCache>,
    output: ResourceSlot<MeshHandle>,
    layout: Option<MeshLayout>,
    body: Vec<u8>,
    locked: Option<(BufferHandle, BufferHandle)>,
    staging: Vec<u8>,
}

impl MeshProcessor {
    pub fn new(cache: Arc<ResourceReuseCache>, output: ResourceSlot<MeshHandle>) -> Self {
        Self {
            cache,
            output,
            layout: None,
            body: Vec::new(),
            locked: None,
            staging: Vec::new(),
        }
    }

    fn release(&mut self) {
        if let Some((vb, ib)) = self.locked.take() {
            self.cache.unuse_vertex_buffer(vb);
            self.cache.unuse_index_buffer(ib);
        }
        self.staging = Vec::new();
    }
}

impl DataProcessor for MeshProcessor {
    fn process(&mut self, data: &[u8]) -> Result<()> {
        let (shape, body) = payload::decode(data, payload::MESH_MAGIC)?;
        let PayloadShape::Mesh { vertex_stride, vertex_count, index_format, index_count } = shape else {
            return Err(Error::InvalidData(format!("expected a mesh, found {:?}", shape)));
        };
        let vertex_bytes = vertex_stride as usize * vertex_count as usize;
        if vertex_bytes == 0 || index_count == 0 {
            return Err(Error::InvalidData("mesh has no vertices or no indices".into()));
        }
        self.layout = Some(MeshLayout {
            vertex_bytes,
            vertex_count,
            index_format,
            index_count,
        });
        self.body = body.to_vec();
        Ok(())
    }

    fn lock_device_object(&mut self) -> Result<LockStatus> {
        let layout = self.layout.ok_or_else(|| not_processed("mesh"))?;
        let index_bytes = layout.index_bytes() as u64;

        let Some(vb) = self.cache.get_free_vertex_buffer(layout.vertex_bytes as u64) else {
            return Ok(LockStatus::TryAgain);
        };
        let Some(ib) = self.cache.get_free_index_buffer(index_bytes, layout.index_format) else {
            self.cache.unuse_vertex_buffer(vb);
            return Ok(LockStatus::TryAgain);
        };

        self.locked = Some((vb, ib));
        Ok(LockStatus::Locked)
    }

    fn copy_to_resource(&mut self) -> Result<()> {
        let layout = self.layout.ok_or_else(|| not_processed("mesh"))?;
        if self.locked.is_none() {
            return Err(not_locked("mesh"));
        }
        stage(&mut self.staging, &mut self.body, layout.vertex_bytes + layout.index_bytes())
    }

    fn unlock_device_object(&mut self) -> Result<()> {
        let layout = self.layout.ok_or_else(|| not_processed("mesh"))?;
        let (vb, ib) = self.locked.ok_or_else(|| not_locked("mesh"))?;
        let (vertices, indices) = self.staging.split_at(layout.vertex_bytes);

        let device = self.cache.device();
        device.upload_buffer(vb, vertices)?;
        device.upload_buffer(ib, indices)?;

        self.locked = None;
        self.staging = Vec::new();
        self.output.set_ready(MeshHandle {
            vertex_buffer: vb,
            index_buffer: ib,
            vertex_count: layout.vertex_count,
            index_format: layout.index_format,
            index_count: layout.index_count,
        });
        Ok(())
    }

    fn set_resource_error(&mut self) {
        self.release();
        self.output.set_error();
    }
}

impl Drop for MeshProcessor {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDevice;
    use crate::device::{GpuDevice, TextureFormat};
    use crate::streaming::request::ResourceState;

    fn setup(limit: Option<u64>) -> (Arc<HeadlessDevice>, Arc<ResourceReuseCache>) {
        let device = Arc::new(HeadlessDevice::new());
        device.set_memory_limit(limit);
        let cache = Arc::new(ResourceReuseCache::new(device.clone() as Arc<dyn GpuDevice>, 1 << 30));
        (device, cache)
    }

    fn texture_payload(desc: TextureDesc, fill: u8) -> Vec<u8> {
        let body = vec![fill; desc.footprint() as usize];
        payload::encode(PayloadShape::Texture(desc), &body, false)
    }

    fn mesh_payload() -> Vec<u8> {
        let shape = PayloadShape::Mesh {
            vertex_stride: 12,
            vertex_count: 4,
            index_format: IndexFormat::Uint16,
            index_count: 6,
        };
        let body: Vec<u8> = (0..shape.body_len()).map(|i| i as u8).collect();
        payload::encode(shape, &body, false)
    }

    #[test]
    fn test_texture_full_cycle() {
        let (device, cache) = setup(None);
        let desc = TextureDesc::new(8, 8, 4, TextureFormat::Rgba8Unorm);
        let slot = ResourceSlot::new();
        let mut processor = TextureProcessor::new(cache.clone(), slot.clone());

        processor.process(&texture_payload(desc, 3)).unwrap();
        assert_eq!(processor.lock_device_object().unwrap(), LockStatus::Locked);
        processor.copy_to_resource().unwrap();
        processor.unlock_device_object().unwrap();

        let handle = slot.ready().unwrap();
        assert_eq!(device.texture_contents(handle).unwrap(), vec![3u8; desc.footprint() as usize]);

        // Dropping after publishing must not give the texture back
        drop(processor);
        assert_eq!(cache.entries().iter().filter(|e| e.in_use).count(), 1);
    }

    #[test]
    fn test_body_moves_into_staging() {
        let (_device, cache) = setup(None);
        let desc = TextureDesc::new(8, 8, 4, TextureFormat::Rgba8Unorm);
        let mut processor = TextureProcessor::new(cache, ResourceSlot::new());
        processor.process(&texture_payload(desc, 5)).unwrap();
        let body_ptr = processor.body.as_ptr();

        processor.lock_device_object().unwrap();
        assert_eq!(processor.staging.capacity(), 0);

        processor.copy_to_resource().unwrap();
        assert!(processor.body.is_empty());
        assert_eq!(processor.staging.len(), desc.footprint() as usize);
        assert_eq!(processor.staging.as_ptr(), body_ptr);

        // The body is gone, so a second copy cannot stage anything
        assert!(processor.copy_to_resource().is_err());
    }

    #[test]
    fn test_texture_try_again_when_device_full() {
        let (_device, cache) = setup(Some(0));
        let desc = TextureDesc::new(4, 4, 1, TextureFormat::Rgba8Unorm);
        let mut processor = TextureProcessor::new(cache, ResourceSlot::new());
        processor.process(&texture_payload(desc, 1)).unwrap();
        assert_eq!(processor.lock_device_object().unwrap(), LockStatus::TryAgain);
    }

    #[test]
    fn test_lock_before_process_fails() {
        let (_device, cache) = setup(None);
        let mut processor = TextureProcessor::new(cache, ResourceSlot::new());
        assert!(processor.lock_device_object().is_err());
    }

    #[test]
    fn test_error_releases_loan() {
        let (_device, cache) = setup(None);
        let desc = TextureDesc::new(4, 4, 1, TextureFormat::Rgba8Unorm);
        let slot = ResourceSlot::new();
        let mut processor = TextureProcessor::new(cache.clone(), slot.clone());
        processor.process(&texture_payload(desc, 1)).unwrap();
        processor.lock_device_object().unwrap();

        processor.set_resource_error();
        processor.set_resource_error();
        assert_eq!(slot.state(), ResourceState::Error);
        assert!(cache.entries().iter().all(|e| !e.in_use));
    }

    #[test]
    fn test_drop_releases_loan() {
        let (_device, cache) = setup(None);
        let mut processor = BufferProcessor::vertex(cache.clone(), ResourceSlot::new());
        let shape = PayloadShape::Vertex { stride: 16, count: 4 };
        processor.process(&payload::encode(shape, &[0u8; 64], false)).unwrap();
        processor.lock_device_object().unwrap();

        drop(processor);
        assert_eq!(cache.len(), 1);
        assert!(cache.entries().iter().all(|e| !e.in_use));
    }

    #[test]
    fn test_buffer_rejects_wrong_kind() {
        let (_device, cache) = setup(None);
        let mut processor = BufferProcessor::index(cache, ResourceSlot::new());
        let shape = PayloadShape::Vertex { stride: 16, count: 4 };
        let err = processor.process(&payload::encode(shape, &[0u8; 64], false)).unwrap_err();
        assert!(matches!(err, Error::BadMagic { .. }));
    }

    #[test]
    fn test_mesh_full_cycle() {
        let (device, cache) = setup(None);
        let slot = ResourceSlot::new();
        let mut processor = MeshProcessor::new(cache.clone(), slot.clone());
        processor.process(&mesh_payload()).unwrap();
        assert_eq!(processor.lock_device_object().unwrap(), LockStatus::Locked);
        processor.copy_to_resource().unwrap();
        processor.unlock_device_object().unwrap();

        let mesh = slot.ready().unwrap();
        assert_eq!(mesh.index_count, 6);
        assert_eq!(device.buffer_contents(mesh.vertex_buffer).unwrap().len(), 48);
        assert_eq!(device.buffer_contents(mesh.index_buffer).unwrap().len(), 12);

        mesh.release(&cache);
        assert!(cache.entries().iter().all(|e| !e.in_use));
    }

    #[test]
    fn test_mesh_gives_back_vertex_buffer_when_index_missing() {
        let (_device, cache) = setup(None);
        let mut processor = MeshProcessor::new(cache.clone(), ResourceSlot::new());
        processor.process(&mesh_payload()).unwrap();

        // Vertex buffer is already pooled and free; no new objects may be made
        let vb = cache.get_free_vertex_buffer(48).unwrap();
        cache.unuse_vertex_buffer(vb);
        cache.set_dont_create_resources(true);

        assert_eq!(processor.lock_device_object().unwrap(), LockStatus::TryAgain);
        assert!(cache.entries().iter().all(|e| !e.in_use));
    }
}
