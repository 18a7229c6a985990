//! Resource reuse cache
//!
//! Pools GPU textures, vertex buffers and index buffers by shape. A request
//! is satisfied by a free pooled entry of exactly the same shape when one
//! exists; otherwise a new object is created, after evicting least recently
//! used free entries if the new object would push the pool past its budget.
//!
//! Every pool scan, insert and eviction happens under a single mutex, so the
//! I/O thread, processing threads and graphics thread can all call in.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{
    BufferHandle, BufferKind, GpuDevice, IndexFormat, TextureDesc, TextureFormat, TextureHandle,
};
use crate::streaming::budget::MemoryBudget;

/// A pooled texture
#[derive(Clone, Copy, Debug)]
struct PooledTexture {
    handle: TextureHandle,
    desc: TextureDesc,
    bytes: u64,
    in_use: bool,
    /// Value of the use counter when last loaned out
    last_used: u64,
}

/// A pooled vertex or index buffer
#[derive(Clone, Copy, Debug)]
struct PooledBuffer {
    handle: BufferHandle,
    size: u64,
    /// Only set for index buffers
    index_format: Option<IndexFormat>,
    in_use: bool,
    last_used: u64,
}

/// Which pool an entry lives in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Texture,
    VertexBuffer,
    IndexBuffer,
}

/// Diagnostic snapshot of one pooled entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolEntry {
    pub kind: PoolKind,
    /// Device id of the texture or buffer
    pub id: u64,
    pub bytes: u64,
    pub in_use: bool,
    pub last_used: u64,
}

/// Counters since the cache was created
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Requests satisfied from a free pooled entry
    pub hits: u64,
    /// Requests that needed a new object
    pub misses: u64,
    pub created: u64,
    pub evicted: u64,
    pub evicted_bytes: u64,
    /// Creations refused by the device
    pub failed_creations: u64,
}

struct Pools {
    textures: Vec<PooledTexture>,
    vertex_buffers: Vec<PooledBuffer>,
    index_buffers: Vec<PooledBuffer>,
    budget: MemoryBudget,
    /// Global monotonically increasing loan counter
    use_counter: u64,
    dont_create_resources: bool,
    stats: CacheStats,
}

impl Pools {
    fn next_stamp(&mut self) -> u64 {
        self.use_counter += 1;
        self.use_counter
    }

    fn destroy_lru_texture(&mut self, device: &dyn GpuDevice) -> u64 {
        let Some(idx) = lru_index(self.textures.iter().map(|t| (t.in_use, t.last_used))) else {
            return 0;
        };
        let entry = self.textures.swap_remove(idx);
        device.destroy_texture(entry.handle);
        self.note_eviction(entry.bytes);
        log::debug!(
            "Evicted texture {} ({}x{} {:?}, {} bytes, last used {})",
            entry.handle.0,
            entry.desc.width,
            entry.desc.height,
            entry.desc.format,
            entry.bytes,
            entry.last_used
        );
        entry.bytes
    }

    fn destroy_lru_buffer(&mut self, kind: PoolKind, device: &dyn GpuDevice) -> u64 {
        let pool = match kind {
            PoolKind::VertexBuffer => &mut self.vertex_buffers,
            PoolKind::IndexBuffer => &mut self.index_buffers,
            PoolKind::Texture => return self.destroy_lru_texture(device),
        };
        let Some(idx) = lru_index(pool.iter().map(|b| (b.in_use, b.last_used))) else {
            return 0;
        };
        let entry = pool.swap_remove(idx);
        device.destroy_buffer(entry.handle);
        self.note_eviction(entry.size);
        log::debug!(
            "Evicted {:?} {} ({} bytes, last used {})",
            kind,
            entry.handle.0,
            entry.size,
            entry.last_used
        );
        entry.size
    }

    fn note_eviction(&mut self, bytes: u64) {
        self.budget.remove(bytes);
        self.stats.evicted += 1;
        self.stats.evicted_bytes += bytes;
    }

    /// Evict free entries until `bytes` fit or nothing evictable remains.
    /// Textures go first, then vertex buffers, then index buffers.
    fn make_room(&mut self, bytes: u64, device: &dyn GpuDevice) {
        if self.budget.would_exceed(bytes) {
            log::trace!(
                "Making room for {} bytes: {} available, {} to free",
                bytes,
                self.budget.available(),
                self.budget.shortfall(bytes)
            );
        }
        while self.budget.would_exceed(bytes) {
            if self.destroy_lru_texture(device) > 0 {
                continue;
            }
            if self.destroy_lru_buffer(PoolKind::VertexBuffer, device) > 0 {
                continue;
            }
            if self.destroy_lru_buffer(PoolKind::IndexBuffer, device) > 0 {
                continue;
            }
            log::debug!(
                "Pool over budget by {} bytes ({} used + {} requested > {} max), nothing left to evict",
                self.budget.shortfall(bytes),
                self.budget.used(),
                bytes,
                self.budget.max()
            );
            break;
        }
    }

    fn destroy_all(&mut self, device: &dyn GpuDevice) {
        for texture in self.textures.drain(..) {
            device.destroy_texture(texture.handle);
        }
        for buffer in self.vertex_buffers.drain(..).chain(self.index_buffers.drain(..)) {
            device.destroy_buffer(buffer.handle);
        }
        let used = self.budget.used();
        self.budget.remove(used);
    }
}

/// Index of the free entry with the smallest stamp
fn lru_index(entries: impl Iterator<Item = (bool, u64)>) -> Option<usize> {
    entries
        .enumerate()
        .filter(|(_, (in_use, _))| !in_use)
        .min_by_key(|(_, (_, last_used))| *last_used)
        .map(|(idx, _)| idx)
}

/// Pool of reusable GPU resources under a managed memory budget
pub struct ResourceReuseCache {
    device: Arc<dyn GpuDevice>,
    pools: Mutex<Pools>,
}

impl ResourceReuseCache {
    /// Create an empty pool with a budget of `max_managed_memory` bytes
    pub fn new(device: Arc<dyn GpuDevice>, max_managed_memory: u64) -> Self {
        Self {
            device,
            pools: Mutex::new(Pools {
                textures: Vec::new(),
                vertex_buffers: Vec::new(),
                index_buffers: Vec::new(),
                budget: MemoryBudget::new(max_managed_memory),
                use_counter: 0,
                dont_create_resources: false,
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    // --- Acquisition ---

    /// Loan a texture of exactly this shape.
    ///
    /// Returns `None` when no free entry matches and a new texture could not
    /// be created right now; callers should retry later.
    pub fn get_free_texture(
        &self,
        width: u32,
        height: u32,
        mip_levels: u32,
        format: TextureFormat,
    ) -> Option<TextureHandle> {
        let desc = TextureDesc::new(width, height, mip_levels, format);
        let mut pools = self.pools.lock();

        if let Some(idx) = pools.textures.iter().position(|t| !t.in_use && t.desc == desc) {
            let stamp = pools.next_stamp();
            let entry = &mut pools.textures[idx];
            entry.in_use = true;
            entry.last_used = stamp;
            let handle = entry.handle;
            pools.stats.hits += 1;
            return Some(handle);
        }

        pools.stats.misses += 1;
        let bytes = desc.footprint();
        pools.make_room(bytes, self.device.as_ref());
        if pools.dont_create_resources {
            return None;
        }

        match self.device.create_texture(&desc) {
            Ok(handle) => {
                let stamp = pools.next_stamp();
                pools.textures.push(PooledTexture {
                    handle,
                    desc,
                    bytes,
                    in_use: true,
                    last_used: stamp,
                });
                pools.budget.add(bytes);
                pools.stats.created += 1;
                log::trace!("Created texture {} ({}x{}x{} {:?})", handle.0, width, height, mip_levels, format);
                Some(handle)
            }
            Err(e) => {
                pools.stats.failed_creations += 1;
                log::warn!("Failed to create {}x{} {:?} texture: {}", width, height, format, e);
                None
            }
        }
    }

    /// Loan a vertex buffer of exactly `size` bytes
    pub fn get_free_vertex_buffer(&self, size: u64) -> Option<BufferHandle> {
        self.get_free_buffer(PoolKind::VertexBuffer, size, None)
    }

    /// Loan an index buffer of exactly `size` bytes and `format`
    pub fn get_free_index_buffer(&self, size: u64, format: IndexFormat) -> Option<BufferHandle> {
        self.get_free_buffer(PoolKind::IndexBuffer, size, Some(format))
    }

    fn get_free_buffer(
        &self,
        kind: PoolKind,
        size: u64,
        index_format: Option<IndexFormat>,
    ) -> Option<BufferHandle> {
        let mut guard = self.pools.lock();
        let pools = &mut *guard;
        let pool = match kind {
            PoolKind::IndexBuffer => &mut pools.index_buffers,
            _ => &mut pools.vertex_buffers,
        };

        if let Some(idx) = pool
            .iter()
            .position(|b| !b.in_use && b.size == size && b.index_format == index_format)
        {
            pools.use_counter += 1;
            let entry = &mut pool[idx];
            entry.in_use = true;
            entry.last_used = pools.use_counter;
            pools.stats.hits += 1;
            return Some(entry.handle);
        }

        pools.stats.misses += 1;
        pools.make_room(size, self.device.as_ref());
        if pools.dont_create_resources {
            return None;
        }

        let buffer_kind = match index_format {
            Some(format) => BufferKind::Index(format),
            None => BufferKind::Vertex,
        };
        match self.device.create_buffer(buffer_kind, size) {
            Ok(handle) => {
                let stamp = pools.next_stamp();
                let entry = PooledBuffer {
                    handle,
                    size,
                    index_format,
                    in_use: true,
                    last_used: stamp,
                };
                match kind {
                    PoolKind::IndexBuffer => pools.index_buffers.push(entry),
                    _ => pools.vertex_buffers.push(entry),
                }
                pools.budget.add(size);
                pools.stats.created += 1;
                log::trace!("Created {:?} {} ({} bytes)", kind, handle.0, size);
                Some(handle)
            }
            Err(e) => {
                pools.stats.failed_creations += 1;
                log::warn!("Failed to create {:?} of {} bytes: {}", kind, size, e);
                None
            }
        }
    }

    // --- Release ---

    /// Return a loaned texture to the pool. The texture is kept for reuse.
    pub fn unuse_texture(&self, handle: TextureHandle) -> bool {
        let mut pools = self.pools.lock();
        match pools.textures.iter_mut().find(|t| t.handle == handle) {
            Some(entry) => {
                entry.in_use = false;
                true
            }
            None => {
                log::warn!("Released texture {} is not pooled", handle.0);
                false
            }
        }
    }

    pub fn unuse_vertex_buffer(&self, handle: BufferHandle) -> bool {
        self.unuse_buffer(PoolKind::VertexBuffer, handle)
    }

    pub fn unuse_index_buffer(&self, handle: BufferHandle) -> bool {
        self.unuse_buffer(PoolKind::IndexBuffer, handle)
    }

    fn unuse_buffer(&self, kind: PoolKind, handle: BufferHandle) -> bool {
        let mut pools = self.pools.lock();
        let pool = match kind {
            PoolKind::IndexBuffer => &mut pools.index_buffers,
            _ => &mut pools.vertex_buffers,
        };
        match pool.iter_mut().find(|b| b.handle == handle) {
            Some(entry) => {
                entry.in_use = false;
                true
            }
            None => {
                log::warn!("Released {:?} {} is not pooled", kind, handle.0);
                false
            }
        }
    }

    // --- Accounting ---

    pub fn set_max_managed_memory(&self, bytes: u64) {
        self.pools.lock().budget.set_max(bytes);
    }

    pub fn used_managed_memory(&self) -> u64 {
        self.pools.lock().budget.used()
    }

    pub fn max_managed_memory(&self) -> u64 {
        self.pools.lock().budget.max()
    }

    /// Used / max managed memory; above 1.0 when live loans exceed the budget
    pub fn memory_pressure(&self) -> f32 {
        self.pools.lock().budget.pressure()
    }

    /// Stop creating new objects; misses then only evict and return `None`
    pub fn set_dont_create_resources(&self, dont_create: bool) {
        self.pools.lock().dont_create_resources = dont_create;
    }

    pub fn stats(&self) -> CacheStats {
        self.pools.lock().stats
    }

    // --- Eviction ---

    /// Destroy the least recently loaned free texture; returns bytes freed
    pub fn destroy_lru_texture(&self) -> u64 {
        self.pools.lock().destroy_lru_texture(self.device.as_ref())
    }

    pub fn destroy_lru_vertex_buffer(&self) -> u64 {
        self.pools
            .lock()
            .destroy_lru_buffer(PoolKind::VertexBuffer, self.device.as_ref())
    }

    pub fn destroy_lru_index_buffer(&self) -> u64 {
        self.pools
            .lock()
            .destroy_lru_buffer(PoolKind::IndexBuffer, self.device.as_ref())
    }

    /// Destroy every pooled object, loaned or not. Teardown only.
    pub fn on_destroy(&self) {
        let mut pools = self.pools.lock();
        let count = pools.textures.len() + pools.vertex_buffers.len() + pools.index_buffers.len();
        pools.destroy_all(self.device.as_ref());
        if count > 0 {
            log::info!("Destroyed {} pooled resources", count);
        }
    }

    // --- Diagnostics ---

    /// Snapshot of every pooled entry
    pub fn entries(&self) -> Vec<PoolEntry> {
        let pools = self.pools.lock();
        let textures = pools.textures.iter().map(|t| PoolEntry {
            kind: PoolKind::Texture,
            id: t.handle.0,
            bytes: t.bytes,
            in_use: t.in_use,
            last_used: t.last_used,
        });
        let buffers = pools
            .vertex_buffers
            .iter()
            .map(|b| (PoolKind::VertexBuffer, b))
            .chain(pools.index_buffers.iter().map(|b| (PoolKind::IndexBuffer, b)))
            .map(|(kind, b)| PoolEntry {
                kind,
                id: b.handle.0,
                bytes: b.size,
                in_use: b.in_use,
                last_used: b.last_used,
            });
        textures.chain(buffers).collect()
    }

    pub fn len(&self) -> usize {
        let pools = self.pools.lock();
        pools.textures.len() + pools.vertex_buffers.len() + pools.index_buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ResourceReuseCache {
    fn drop(&mut self) {
        self.pools.get_mut().destroy_all(self.device.as_ref());
    }
}
