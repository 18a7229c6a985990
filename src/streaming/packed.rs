//! Packed file store
//!
//! Opens a packed file, keeps its index in memory and hands out resource
//! bytes by name. In mapped mode each chunk is memory mapped on demand and
//! at most `max_chunks_mapped` chunks are mapped at once; the least recently
//! touched chunk no view refers to is unmapped to make room. In heap mode
//! resources are read into owned buffers and no mapping state is kept.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glam::Vec3;
use memmap2::{Mmap, MmapOptions};

use crate::core::{Error, Result};
use crate::streaming::disk_io::{
    ChunkHeader, HEADER_SIZE, IndexEntry, MAPPING_GRANULARITY, PackedFileHeader, decode_tables,
};

/// How a packed file is accessed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackedFileOptions {
    pub use_memory_mapping: bool,
    /// Overrides the header's recommended mapped chunk count
    pub max_chunks_mapped: Option<u32>,
}

impl Default for PackedFileOptions {
    fn default() -> Self {
        Self {
            use_memory_mapping: true,
            max_chunks_mapped: None,
        }
    }
}

/// Bytes of one resource.
///
/// A mapped view shares its chunk mapping with the store. The chunk counts
/// against the mapping cap and cannot be unmapped until the view is dropped.
pub enum PackedBytes {
    Mapped { map: Arc<Mmap>, start: usize, len: usize },
    Owned(Vec<u8>),
}

impl PackedBytes {
    pub fn is_mapped(&self) -> bool {
        matches!(self, PackedBytes::Mapped { .. })
    }
}

impl Deref for PackedBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            PackedBytes::Mapped { map, start, len } => &map[*start..*start + *len],
            PackedBytes::Owned(data) => data,
        }
    }
}

impl AsRef<[u8]> for PackedBytes {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl std::fmt::Debug for PackedBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackedBytes")
            .field("mapped", &self.is_mapped())
            .field("len", &self.len())
            .finish()
    }
}

struct ChunkState {
    header: ChunkHeader,
    mapping: Option<Arc<Mmap>>,
    last_used: u64,
}

/// Counters since the file was opened
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PackedFileStats {
    pub lookups: u64,
    pub misses: u64,
    pub chunk_maps: u64,
    pub chunk_unmaps: u64,
    pub heap_fallbacks: u64,
}

/// An open packed file
pub struct PackedFile {
    path: PathBuf,
    file: File,
    header: PackedFileHeader,
    chunks: Vec<ChunkState>,
    index: Vec<IndexEntry>,
    use_memory_mapping: bool,
    max_chunks_mapped: usize,
    mapped_count: usize,
    use_counter: u64,
    stats: PackedFileStats,
}

impl std::fmt::Debug for PackedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackedFile")
            .field("path", &self.path)
            .field("resources", &self.index.len())
            .field("chunks", &self.chunks.len())
            .field("mapped", &self.mapped_count)
            .finish()
    }
}

impl PackedFile {
    /// Open and validate a packed file, loading its index
    pub fn open(path: &Path, options: PackedFileOptions) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();

        let mut header_bytes = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = PackedFileHeader::decode(&header_bytes)?;

        if header.granularity != MAPPING_GRANULARITY {
            return Err(Error::GranularityMismatch {
                stored: header.granularity,
                expected: MAPPING_GRANULARITY,
            });
        }
        if header.file_size != file_len {
            return Err(Error::InvalidData(format!(
                "header declares {} bytes, file has {}",
                header.file_size, file_len
            )));
        }

        let data_start = header.data_start()?;
        if data_start > file_len {
            return Err(Error::InvalidData("packed file tables are truncated".into()));
        }
        let mut tables = vec![0u8; (data_start - HEADER_SIZE as u64) as usize];
        file.read_exact(&mut tables)?;
        let (chunk_headers, index) = decode_tables(&header, &tables)?;

        for (i, chunk) in chunk_headers.iter().enumerate() {
            let in_bounds = chunk.offset.checked_add(chunk.size).is_some_and(|end| end <= file_len);
            if chunk.offset % header.granularity != 0 || !in_bounds {
                return Err(Error::InvalidData(format!("chunk {} is out of bounds or misaligned", i)));
            }
        }
        for entry in &index {
            let chunk = chunk_headers.get(entry.chunk_index as usize).ok_or_else(|| {
                Error::InvalidData(format!("'{}' refers to missing chunk {}", entry.name, entry.chunk_index))
            })?;
            let in_bounds = entry
                .offset_into_chunk
                .checked_add(entry.size)
                .is_some_and(|end| end <= chunk.size);
            if !in_bounds {
                return Err(Error::InvalidData(format!("'{}' overruns its chunk", entry.name)));
            }
        }

        let max_chunks_mapped = options
            .max_chunks_mapped
            .unwrap_or(header.max_chunks_in_va)
            .max(1) as usize;

        log::info!(
            "Opened packed file {}: {} resources, {} chunks, {} ({} chunks mappable)",
            path.display(),
            index.len(),
            chunk_headers.len(),
            if options.use_memory_mapping { "mapped" } else { "heap reads" },
            max_chunks_mapped
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            chunks: chunk_headers
                .into_iter()
                .map(|header| ChunkState {
                    header,
                    mapping: None,
                    last_used: 0,
                })
                .collect(),
            index,
            use_memory_mapping: options.use_memory_mapping,
            max_chunks_mapped,
            mapped_count: 0,
            use_counter: 0,
            stats: PackedFileStats::default(),
        })
    }

    // --- Lookup ---

    fn find(&self, name: &str) -> Option<&IndexEntry> {
        self.index.iter().find(|e| e.name == name)
    }

    /// Size of a named resource
    pub fn file_info(&self, name: &str) -> Option<u64> {
        self.find(name).map(|e| e.size)
    }

    /// Bytes of a named resource.
    ///
    /// Mapped mode returns a zero-copy view into the chunk mapping; heap mode
    /// reads the resource into a fresh buffer. A mapped store also reads into
    /// a buffer when no chunk can be unmapped to make room.
    pub fn file(&mut self, name: &str) -> Result<PackedBytes> {
        self.stats.lookups += 1;
        let found = self
            .find(name)
            .map(|e| (e.chunk_index as usize, e.offset_into_chunk, e.size));
        let Some((chunk_index, offset, size)) = found else {
            self.stats.misses += 1;
            return Err(Error::NotFound(name.to_string()));
        };

        if self.use_memory_mapping {
            if let Some(map) = self.ensure_chunk_mapped(chunk_index)? {
                return Ok(PackedBytes::Mapped {
                    map,
                    start: offset as usize,
                    len: size as usize,
                });
            }
            // Every mapping is in use by a view; read this one instead
            self.stats.heap_fallbacks += 1;
            log::debug!("Mapping cap of {} reached, reading '{}' from disk", self.max_chunks_mapped, name);
        }

        let absolute = self.chunks[chunk_index].header.offset + offset;
        self.file.seek(SeekFrom::Start(absolute))?;
        let mut data = vec![0u8; size as usize];
        self.file.read_exact(&mut data)?;
        Ok(PackedBytes::Owned(data))
    }

    /// Names of resources whose center lies within `radius` of `center`
    pub fn resources_within_radius(&self, center: Vec3, radius: f32) -> Vec<&str> {
        let radius_sq = radius * radius;
        self.index
            .iter()
            .filter(|e| e.center.distance_squared(center) <= radius_sq)
            .map(|e| e.name.as_str())
            .collect()
    }

    // --- Chunk mapping ---

    /// Map a chunk if needed, unmapping the least recently touched chunk
    /// first when the cap is reached.
    ///
    /// Returns `None` when the cap is reached and every mapped chunk is still
    /// referenced by a handed-out view; nothing is mapped in that case.
    pub fn ensure_chunk_mapped(&mut self, chunk_index: usize) -> Result<Option<Arc<Mmap>>> {
        let chunk_count = self.chunks.len();
        if chunk_index >= chunk_count {
            return Err(Error::InvalidData(format!(
                "chunk {} out of range ({} chunks)",
                chunk_index, chunk_count
            )));
        }

        self.use_counter += 1;
        let stamp = self.use_counter;

        if let Some(map) = &self.chunks[chunk_index].mapping {
            let map = map.clone();
            self.chunks[chunk_index].last_used = stamp;
            return Ok(Some(map));
        }

        let header = self.chunks[chunk_index].header;
        if header.size == 0 {
            return Err(Error::InvalidData(format!("chunk {} is empty", chunk_index)));
        }

        if self.mapped_count >= self.max_chunks_mapped && !self.unmap_lru_chunk() {
            return Ok(None);
        }

        // SAFETY: the file is opened read-only and is not modified while the
        // store is open; the range was validated against the file length.
        let map = unsafe {
            MmapOptions::new()
                .offset(header.offset)
                .len(header.size as usize)
                .map(&self.file)?
        };
        let map = Arc::new(map);

        let chunk = &mut self.chunks[chunk_index];
        chunk.mapping = Some(map.clone());
        chunk.last_used = stamp;
        self.mapped_count += 1;
        self.stats.chunk_maps += 1;
        log::trace!("Mapped chunk {} ({} bytes at {})", chunk_index, header.size, header.offset);
        Ok(Some(map))
    }

    // The store keeps its own reference to every live mapping, so a chunk
    // whose mapping is shared with a view stays mapped and is never unmapped.
    fn unmap_lru_chunk(&mut self) -> bool {
        let lru = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.mapping.as_ref().is_some_and(|m| Arc::strong_count(m) == 1))
            .min_by_key(|(_, c)| c.last_used)
            .map(|(i, _)| i);

        match lru {
            Some(i) => {
                self.chunks[i].mapping = None;
                self.mapped_count -= 1;
                self.stats.chunk_unmaps += 1;
                log::debug!("Unmapped chunk {} (last used {})", i, self.chunks[i].last_used);
                true
            }
            None => false,
        }
    }

    // --- Accessors ---

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &PackedFileHeader {
        &self.header
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.index
    }

    pub fn chunk_headers(&self) -> impl Iterator<Item = &ChunkHeader> {
        self.chunks.iter().map(|c| &c.header)
    }

    pub fn is_chunk_mapped(&self, chunk_index: usize) -> bool {
        self.chunks
            .get(chunk_index)
            .is_some_and(|c| c.mapping.is_some())
    }

    pub fn mapped_chunk_count(&self) -> usize {
        self.mapped_count
    }

    pub fn max_chunks_mapped(&self) -> usize {
        self.max_chunks_mapped
    }

    pub fn uses_memory_mapping(&self) -> bool {
        self.use_memory_mapping
    }

    pub fn stats(&self) -> PackedFileStats {
        self.stats
    }
}
