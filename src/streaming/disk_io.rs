//! Packed file format and writer
//!
//! A packed file stores many small named blobs grouped into chunks. Every
//! chunk starts on a [`MAPPING_GRANULARITY`] boundary so it can be memory
//! mapped on its own.
//!
//! ```text
//! Header (64 bytes)
//! ChunkHeader[num_chunks]        (16 bytes each)
//! FileIndexEntry[num_files]      (560 bytes each)
//! [padding to granularity]
//! ChunkData[num_chunks]          (each padded to granularity)
//! ```
//!
//! All integers are little-endian; fields are padded to natural C alignment.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use glam::Vec3;

use crate::core::{Error, Result};

/// Alignment of every chunk's start offset.
///
/// 64 KiB is the Windows allocation granularity and a multiple of every
/// common page size, so mapping at a chunk offset is valid everywhere.
pub const MAPPING_GRANULARITY: u64 = 64 * 1024;

/// Fixed width of a stored name in UTF-16 units, terminator included
pub const MAX_NAME_UNITS: usize = 260;

pub const HEADER_SIZE: usize = 64;
pub const CHUNK_HEADER_SIZE: usize = 16;
pub const INDEX_ENTRY_SIZE: usize = 560;

/// File header
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PackedFileHeader {
    pub file_size: u64,
    pub num_files: u64,
    pub num_chunks: u64,
    /// Granularity the file was built with
    pub granularity: u64,
    /// Recommended max concurrently mapped chunks
    pub max_chunks_in_va: u32,
    pub tile_bytes_size: u64,
    pub tile_side_size: f32,
    pub loading_radius: f32,
    pub video_memory_usage_at_full_mips: u64,
}

impl PackedFileHeader {
    fn encode(&self, w: &mut ByteWriter) {
        w.u64(self.file_size);
        w.u64(self.num_files);
        w.u64(self.num_chunks);
        w.u64(self.granularity);
        w.u32(self.max_chunks_in_va);
        w.u32(0);
        w.u64(self.tile_bytes_size);
        w.f32(self.tile_side_size);
        w.f32(self.loading_radius);
        w.u64(self.video_memory_usage_at_full_mips);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let header = Self {
            file_size: r.u64()?,
            num_files: r.u64()?,
            num_chunks: r.u64()?,
            granularity: r.u64()?,
            max_chunks_in_va: {
                let v = r.u32()?;
                r.u32()?;
                v
            },
            tile_bytes_size: r.u64()?,
            tile_side_size: r.f32()?,
            loading_radius: r.f32()?,
            video_memory_usage_at_full_mips: r.u64()?,
        };
        Ok(header)
    }

    /// Bytes before the first chunk: header, tables and padding.
    ///
    /// Fails when the table counts cannot describe a real file.
    pub fn data_start(&self) -> Result<u64> {
        let overflow = || {
            Error::InvalidData(format!(
                "table sizes overflow ({} chunks, {} files)",
                self.num_chunks, self.num_files
            ))
        };
        let chunk_table = self.num_chunks.checked_mul(CHUNK_HEADER_SIZE as u64).ok_or_else(overflow)?;
        let index_table = self.num_files.checked_mul(INDEX_ENTRY_SIZE as u64).ok_or_else(overflow)?;
        let tables = (HEADER_SIZE as u64)
            .checked_add(chunk_table)
            .and_then(|v| v.checked_add(index_table))
            .ok_or_else(overflow)?;
        if self.granularity == 0 {
            return Ok(tables);
        }
        tables
            .div_ceil(self.granularity)
            .checked_mul(self.granularity)
            .ok_or_else(overflow)
    }
}

/// Location of one chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Absolute byte offset in the file
    pub offset: u64,
    /// Bytes used (the allocation is padded to granularity)
    pub size: u64,
}

impl ChunkHeader {
    fn encode(&self, w: &mut ByteWriter) {
        w.u64(self.offset);
        w.u64(self.size);
    }

    fn decode(r: &mut ByteReader) -> Result<Self> {
        Ok(Self {
            offset: r.u64()?,
            size: r.u64()?,
        })
    }
}

/// One named resource in the index
#[derive(Clone, Debug, PartialEq)]
pub struct IndexEntry {
    pub name: String,
    pub size: u64,
    pub chunk_index: u64,
    pub offset_into_chunk: u64,
    /// World-space center, used for radius queries
    pub center: Vec3,
}

impl IndexEntry {
    fn encode(&self, w: &mut ByteWriter) -> Result<()> {
        let units: Vec<u16> = self.name.encode_utf16().collect();
        if units.len() >= MAX_NAME_UNITS {
            return Err(Error::InvalidData(format!(
                "resource name '{}' exceeds {} UTF-16 units",
                self.name,
                MAX_NAME_UNITS - 1
            )));
        }
        for i in 0..MAX_NAME_UNITS {
            w.u16(units.get(i).copied().unwrap_or(0));
        }
        w.u64(self.size);
        w.u64(self.chunk_index);
        w.u64(self.offset_into_chunk);
        w.f32(self.center.x);
        w.f32(self.center.y);
        w.f32(self.center.z);
        w.u32(0);
        Ok(())
    }

    fn decode(r: &mut ByteReader) -> Result<Self> {
        let mut units = Vec::with_capacity(MAX_NAME_UNITS);
        for _ in 0..MAX_NAME_UNITS {
            units.push(r.u16()?);
        }
        let len = units.iter().position(|&u| u == 0).ok_or_else(|| {
            Error::InvalidData("index entry name is not NUL-terminated".into())
        })?;
        let name = String::from_utf16(&units[..len])
            .map_err(|e| Error::InvalidData(format!("index entry name: {}", e)))?;

        let entry = Self {
            name,
            size: r.u64()?,
            chunk_index: r.u64()?,
            offset_into_chunk: r.u64()?,
            center: Vec3::new(r.f32()?, r.f32()?, r.f32()?),
        };
        r.u32()?;
        Ok(entry)
    }
}

/// Decode the chunk and index tables that follow the header
pub fn decode_tables(header: &PackedFileHeader, data: &[u8]) -> Result<(Vec<ChunkHeader>, Vec<IndexEntry>)> {
    let mut r = ByteReader::new(data);
    let chunks = (0..header.num_chunks)
        .map(|_| ChunkHeader::decode(&mut r))
        .collect::<Result<Vec<_>>>()?;
    let entries = (0..header.num_files)
        .map(|_| IndexEntry::decode(&mut r))
        .collect::<Result<Vec<_>>>()?;
    Ok((chunks, entries))
}

/// Round `value` up to a multiple of `align`
pub fn align_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        return value;
    }
    value.div_ceil(align) * align
}

/// Values stored in the header alongside the layout
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PackedFileMetadata {
    pub max_chunks_in_va: u32,
    pub tile_bytes_size: u64,
    pub tile_side_size: f32,
    pub loading_radius: f32,
    pub video_memory_usage_at_full_mips: u64,
}

struct PendingResource {
    name: String,
    data: Vec<u8>,
    center: Vec3,
}

/// Collects resources into chunks and writes a packed file
#[derive(Default)]
pub struct PackedFileBuilder {
    chunks: Vec<Vec<PendingResource>>,
    names: HashSet<String>,
    metadata: PackedFileMetadata,
}

impl PackedFileBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_metadata(&mut self, metadata: PackedFileMetadata) {
        self.metadata = metadata;
    }

    /// Start a new chunk; returns its index
    pub fn add_chunk(&mut self) -> usize {
        self.chunks.push(Vec::new());
        self.chunks.len() - 1
    }

    /// Append a resource to an existing chunk
    pub fn add_resource(&mut self, chunk: usize, name: impl Into<String>, data: Vec<u8>, center: Vec3) -> Result<()> {
        let name = name.into();
        if name.is_empty() || name.encode_utf16().count() >= MAX_NAME_UNITS {
            return Err(Error::InvalidData(format!("invalid resource name '{}'", name)));
        }
        let resources = self
            .chunks
            .get_mut(chunk)
            .ok_or_else(|| Error::InvalidData(format!("chunk {} does not exist", chunk)))?;
        if !self.names.insert(name.clone()) {
            return Err(Error::InvalidData(format!("duplicate resource name '{}'", name)));
        }
        resources.push(PendingResource { name, data, center });
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn resource_count(&self) -> usize {
        self.names.len()
    }

    /// Compute the header, chunk table and index without writing anything
    pub fn layout(&self) -> Result<(PackedFileHeader, Vec<ChunkHeader>, Vec<IndexEntry>)> {
        let mut header = PackedFileHeader {
            file_size: 0,
            num_files: self.resource_count() as u64,
            num_chunks: self.chunks.len() as u64,
            granularity: MAPPING_GRANULARITY,
            max_chunks_in_va: self.metadata.max_chunks_in_va,
            tile_bytes_size: self.metadata.tile_bytes_size,
            tile_side_size: self.metadata.tile_side_size,
            loading_radius: self.metadata.loading_radius,
            video_memory_usage_at_full_mips: self.metadata.video_memory_usage_at_full_mips,
        };

        let mut cursor = header.data_start()?;
        let mut chunk_headers = Vec::with_capacity(self.chunks.len());
        let mut entries = Vec::with_capacity(self.resource_count());

        for (chunk_index, resources) in self.chunks.iter().enumerate() {
            let mut offset_into_chunk = 0u64;
            for resource in resources {
                entries.push(IndexEntry {
                    name: resource.name.clone(),
                    size: resource.data.len() as u64,
                    chunk_index: chunk_index as u64,
                    offset_into_chunk,
                    center: resource.center,
                });
                offset_into_chunk += resource.data.len() as u64;
            }
            chunk_headers.push(ChunkHeader {
                offset: cursor,
                size: offset_into_chunk,
            });
            cursor = align_up(cursor + offset_into_chunk, MAPPING_GRANULARITY);
        }

        header.file_size = cursor;
        Ok((header, chunk_headers, entries))
    }

    /// Write the packed file
    pub fn write(&self, path: &Path) -> Result<PackedFileHeader> {
        let (header, chunk_headers, entries) = self.layout()?;

        let mut tables = ByteWriter::default();
        header.encode(&mut tables);
        for chunk in &chunk_headers {
            chunk.encode(&mut tables);
        }
        for entry in &entries {
            entry.encode(&mut tables)?;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&tables.bytes)?;
        let mut written = tables.bytes.len() as u64;

        for (resources, chunk) in self.chunks.iter().zip(&chunk_headers) {
            written = write_padding(&mut out, written, chunk.offset)?;
            for resource in resources {
                out.write_all(&resource.data)?;
                written += resource.data.len() as u64;
            }
        }
        write_padding(&mut out, written, header.file_size)?;
        out.flush()?;

        log::info!(
            "Wrote packed file {}: {} resources in {} chunks, {} bytes",
            path.display(),
            header.num_files,
            header.num_chunks,
            header.file_size
        );
        Ok(header)
    }
}

fn write_padding(out: &mut impl Write, written: u64, target: u64) -> Result<u64> {
    const ZEROS: [u8; 4096] = [0; 4096];
    let mut remaining = target.saturating_sub(written);
    while remaining > 0 {
        let n = remaining.min(ZEROS.len() as u64) as usize;
        out.write_all(&ZEROS[..n])?;
        remaining -= n as u64;
    }
    Ok(written.max(target))
}

#[derive(Default)]
struct ByteWriter {
    bytes: Vec<u8>,
}

impl ByteWriter {
    fn u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn f32(&mut self, v: f32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self
            .data
            .get(self.pos..self.pos + N)
            .ok_or_else(|| Error::InvalidData("packed file tables are truncated".into()))?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take()?))
    }
}
