//! In-memory device backend.
//!
//! Resources are plain byte vectors. An optional memory limit makes creation
//! fail with [`Error::DeviceOutOfMemory`] the way a real device would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{Backend, BufferHandle, BufferKind, GpuDevice, TextureDesc, TextureHandle};
use crate::core::{Error, Result};

struct Resource {
    size: u64,
    contents: Vec<u8>,
    is_texture: bool,
}

#[derive(Default)]
struct Resources {
    live: HashMap<u64, Resource>,
    allocated_bytes: u64,
}

/// Device that keeps every resource in host memory
pub struct HeadlessDevice {
    resources: Mutex<Resources>,
    next_id: AtomicU64,
    memory_limit: Mutex<Option<u64>>,
    textures_created: AtomicUsize,
    buffers_created: AtomicUsize,
    destroyed: AtomicUsize,
    uploads: AtomicUsize,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(Resources::default()),
            next_id: AtomicU64::new(1),
            memory_limit: Mutex::new(None),
            textures_created: AtomicUsize::new(0),
            buffers_created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
        }
    }

    /// Device whose creations fail once `limit` bytes are allocated
    pub fn with_memory_limit(limit: u64) -> Self {
        let device = Self::new();
        device.set_memory_limit(Some(limit));
        device
    }

    pub fn set_memory_limit(&self, limit: Option<u64>) {
        *self.memory_limit.lock() = limit;
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.resources.lock().allocated_bytes
    }

    pub fn live_textures(&self) -> usize {
        self.resources.lock().live.values().filter(|r| r.is_texture).count()
    }

    pub fn live_buffers(&self) -> usize {
        self.resources.lock().live.values().filter(|r| !r.is_texture).count()
    }

    pub fn textures_created(&self) -> usize {
        self.textures_created.load(Ordering::Acquire)
    }

    pub fn buffers_created(&self) -> usize {
        self.buffers_created.load(Ordering::Acquire)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::Acquire)
    }

    /// Copy of the bytes last uploaded to a texture
    pub fn texture_contents(&self, handle: TextureHandle) -> Option<Vec<u8>> {
        self.resources.lock().live.get(&handle.0).map(|r| r.contents.clone())
    }

    /// Copy of the bytes last uploaded to a buffer
    pub fn buffer_contents(&self, handle: BufferHandle) -> Option<Vec<u8>> {
        self.resources.lock().live.get(&handle.0).map(|r| r.contents.clone())
    }

    fn allocate(&self, size: u64, is_texture: bool) -> Result<u64> {
        let limit = *self.memory_limit.lock();
        let mut resources = self.resources.lock();
        if let Some(limit) = limit {
            if resources.allocated_bytes + size > limit {
                return Err(Error::DeviceOutOfMemory);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        resources.live.insert(id, Resource {
            size,
            contents: vec![0; size as usize],
            is_texture,
        });
        resources.allocated_bytes += size;
        Ok(id)
    }

    fn release(&self, id: u64) {
        let mut resources = self.resources.lock();
        if let Some(resource) = resources.live.remove(&id) {
            resources.allocated_bytes -= resource.size;
            self.destroyed.fetch_add(1, Ordering::AcqRel);
        } else {
            log::warn!("Destroying unknown headless resource {}", id);
        }
    }

    fn write(&self, id: u64, data: &[u8]) -> Result<()> {
        let mut resources = self.resources.lock();
        let resource = resources
            .live
            .get_mut(&id)
            .ok_or_else(|| Error::Device(format!("upload to unknown resource {}", id)))?;
        if data.len() as u64 > resource.size {
            return Err(Error::Device(format!(
                "upload of {} bytes exceeds resource size {}",
                data.len(),
                resource.size
            )));
        }
        resource.contents[..data.len()].copy_from_slice(data);
        self.uploads.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for HeadlessDevice {
    fn backend(&self) -> Backend {
        Backend::Headless
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureHandle> {
        let id = self.allocate(desc.footprint(), true)?;
        self.textures_created.fetch_add(1, Ordering::AcqRel);
        Ok(TextureHandle(id))
    }

    fn create_buffer(&self, _kind: BufferKind, size: u64) -> Result<BufferHandle> {
        let id = self.allocate(size, false)?;
        self.buffers_created.fetch_add(1, Ordering::AcqRel);
        Ok(BufferHandle(id))
    }

    fn destroy_texture(&self, handle: TextureHandle) {
        self.release(handle.0);
    }

    fn destroy_buffer(&self, handle: BufferHandle) {
        self.release(handle.0);
    }

    fn upload_texture(&self, handle: TextureHandle, data: &[u8]) -> Result<()> {
        self.write(handle.0, data)
    }

    fn upload_buffer(&self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        self.write(handle.0, data)
    }
}
