//! Terrain tile grid packing
//!
//! Each tile of the grid becomes one chunk of a packed file holding four
//! payloads: vertex buffer, index buffer, diffuse texture and normal texture.
//! The header is calibrated so that the tiles inside the loading radius fit a
//! video memory budget at full mips.

use std::f32::consts::PI;
use std::path::Path;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::{Error, Result, MIB};
use crate::device::{IndexFormat, TextureDesc, TextureFormat};
use crate::streaming::disk_io::{PackedFileBuilder, PackedFileHeader, PackedFileMetadata};
use crate::streaming::payload::{self, PayloadShape};
use crate::terrain::generator::TerrainGenerator;

/// Interleaved terrain vertex
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TerrainVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

/// Which payload of a tile
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TilePart {
    Vertices,
    Indices,
    Diffuse,
    Normals,
}

impl TilePart {
    pub const ALL: [TilePart; 4] = [TilePart::Vertices, TilePart::Indices, TilePart::Diffuse, TilePart::Normals];

    fn suffix(self) -> &'static str {
        match self {
            TilePart::Vertices => "vb",
            TilePart::Indices => "ib",
            TilePart::Diffuse => "diffuse",
            TilePart::Normals => "normal",
        }
    }
}

/// Resource name of one tile payload
pub fn tile_resource_name(x: u32, z: u32, part: TilePart) -> String {
    format!("tile_{}_{}_{}", x, z, part.suffix())
}

/// Parse a name produced by [`tile_resource_name`]
pub fn parse_tile_resource_name(name: &str) -> Option<(u32, u32, TilePart)> {
    let mut parts = name.strip_prefix("tile_")?.splitn(3, '_');
    let x = parts.next()?.parse().ok()?;
    let z = parts.next()?.parse().ok()?;
    let suffix = parts.next()?;
    let part = TilePart::ALL.into_iter().find(|p| p.suffix() == suffix)?;
    Some((x, z, part))
}

/// Layout of the tile grid
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileGridParams {
    pub tiles_per_side: u32,
    /// World size of one tile edge
    pub tile_side_size: f32,
    /// Height samples per tile edge
    pub vertices_per_side: u32,
    /// Texel size of both tile textures (power of two)
    pub texture_size: u32,
    /// LZ4-compress payload bodies
    pub compress: bool,
    /// Video memory the tiles inside the loading radius may use
    pub video_memory_budget: u64,
    /// Address space the mapped chunks may use
    pub address_space_budget: u64,
}

impl Default for TileGridParams {
    fn default() -> Self {
        Self {
            tiles_per_side: 16,
            tile_side_size: 64.0,
            vertices_per_side: 65,
            texture_size: 256,
            compress: true,
            video_memory_budget: 512 * MIB,
            address_space_budget: 1024 * MIB,
        }
    }
}

impl TileGridParams {
    pub fn validate(&self) -> Result<()> {
        if self.tiles_per_side == 0 {
            return Err(Error::Config("tiles_per_side must be at least 1".into()));
        }
        if self.vertices_per_side < 2 {
            return Err(Error::Config("vertices_per_side must be at least 2".into()));
        }
        if !self.texture_size.is_power_of_two() {
            return Err(Error::Config(format!("texture_size {} is not a power of two", self.texture_size)));
        }
        if self.tile_side_size <= 0.0 {
            return Err(Error::Config("tile_side_size must be positive".into()));
        }
        Ok(())
    }

    pub fn tile_count(&self) -> u32 {
        self.tiles_per_side * self.tiles_per_side
    }

    pub fn index_format(&self) -> IndexFormat {
        if self.vertices_per_side * self.vertices_per_side <= u16::MAX as u32 + 1 {
            IndexFormat::Uint16
        } else {
            IndexFormat::Uint32
        }
    }

    pub fn index_count(&self) -> u32 {
        let quads = self.vertices_per_side - 1;
        quads * quads * 6
    }

    pub fn texture_desc(&self) -> TextureDesc {
        let mips = TextureDesc::full_mip_count(self.texture_size, self.texture_size);
        TextureDesc::new(self.texture_size, self.texture_size, mips, TextureFormat::Rgba8Unorm)
    }

    /// Device bytes of one fully loaded tile
    pub fn tile_video_bytes(&self) -> u64 {
        let vertices = (self.vertices_per_side * self.vertices_per_side) as u64;
        let vb = vertices * std::mem::size_of::<TerrainVertex>() as u64;
        let ib = self.index_count() as u64 * self.index_format().size();
        vb + ib + 2 * self.texture_desc().footprint()
    }

    /// World-space center of a tile at height `y`
    pub fn tile_center(&self, x: u32, z: u32, y: f32) -> Vec3 {
        Vec3::new(
            (x as f32 + 0.5) * self.tile_side_size,
            y,
            (z as f32 + 0.5) * self.tile_side_size,
        )
    }

    /// Center of the whole grid at ground level
    pub fn grid_center(&self) -> Vec3 {
        let half = self.tiles_per_side as f32 * self.tile_side_size * 0.5;
        Vec3::new(half, 0.0, half)
    }
}

/// Encoded payloads of one tile
pub struct TilePayloads {
    pub x: u32,
    pub z: u32,
    pub center: Vec3,
    pub parts: [(TilePart, Vec<u8>); 4],
}

impl TilePayloads {
    pub fn total_bytes(&self) -> u64 {
        self.parts.iter().map(|(_, data)| data.len() as u64).sum()
    }
}

/// Build the four payloads of tile (x, z)
pub fn build_tile(generator: &TerrainGenerator, grid: &TileGridParams, x: u32, z: u32) -> TilePayloads {
    let n = grid.vertices_per_side;
    let side = grid.tile_side_size;
    let origin_x = x as f32 * side;
    let origin_z = z as f32 * side;
    let step = side / (n - 1) as f32;

    let mut vertices = Vec::with_capacity((n * n) as usize);
    for row in 0..n {
        for col in 0..n {
            let wx = origin_x + col as f32 * step;
            let wz = origin_z + row as f32 * step;
            let normal = generator.normal_at(wx, wz, step * 0.5);
            vertices.push(TerrainVertex {
                position: [wx, generator.height_at(wx, wz), wz],
                normal: normal.to_array(),
                uv: [col as f32 / (n - 1) as f32, row as f32 / (n - 1) as f32],
            });
        }
    }

    let mut indices: Vec<u32> = Vec::with_capacity(grid.index_count() as usize);
    for row in 0..n - 1 {
        for col in 0..n - 1 {
            let i0 = row * n + col;
            let i1 = i0 + 1;
            let i2 = i0 + n;
            let i3 = i2 + 1;
            indices.extend_from_slice(&[i0, i2, i1, i1, i2, i3]);
        }
    }

    let index_format = grid.index_format();
    let index_bytes: Vec<u8> = match index_format {
        IndexFormat::Uint16 => {
            let narrow: Vec<u16> = indices.iter().map(|&i| i as u16).collect();
            bytemuck::cast_slice(&narrow).to_vec()
        }
        IndexFormat::Uint32 => bytemuck::cast_slice(&indices).to_vec(),
    };

    let desc = grid.texture_desc();
    let texel = side / desc.width as f32;
    let mut diffuse = Vec::with_capacity((desc.width * desc.height) as usize);
    let mut normals = Vec::with_capacity((desc.width * desc.height) as usize);
    for ty in 0..desc.height {
        for tx in 0..desc.width {
            let wx = origin_x + (tx as f32 + 0.5) * texel;
            let wz = origin_z + (ty as f32 + 0.5) * texel;
            let normal = generator.normal_at(wx, wz, texel);
            diffuse.push(generator.surface_color(generator.height_at(wx, wz), normal));
            normals.push(encode_normal(normal));
        }
    }

    let compress = grid.compress;
    let center_height = generator.height_at(origin_x + side * 0.5, origin_z + side * 0.5);
    TilePayloads {
        x,
        z,
        center: grid.tile_center(x, z, center_height),
        parts: [
            (
                TilePart::Vertices,
                payload::encode(
                    PayloadShape::Vertex {
                        stride: std::mem::size_of::<TerrainVertex>() as u32,
                        count: vertices.len() as u32,
                    },
                    bytemuck::cast_slice(&vertices),
                    compress,
                ),
            ),
            (
                TilePart::Indices,
                payload::encode(
                    PayloadShape::Index { format: index_format, count: indices.len() as u32 },
                    &index_bytes,
                    compress,
                ),
            ),
            (
                TilePart::Diffuse,
                payload::encode(PayloadShape::Texture(desc), &build_mip_chain(desc, diffuse), compress),
            ),
            (
                TilePart::Normals,
                payload::encode(PayloadShape::Texture(desc), &build_mip_chain(desc, normals), compress),
            ),
        ],
    }
}

fn encode_normal(n: Vec3) -> [u8; 4] {
    let enc = |v: f32| ((v * 0.5 + 0.5).clamp(0.0, 1.0) * 255.0).round() as u8;
    [enc(n.x), enc(n.y), enc(n.z), 255]
}

/// RGBA8 mip chain by 2x2 box filtering, levels packed back to back
pub fn build_mip_chain(desc: TextureDesc, base: Vec<[u8; 4]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(desc.footprint() as usize);
    let (mut w, mut h) = (desc.width, desc.height);
    let mut level = base;
    for mip in 0..desc.mip_levels {
        out.extend_from_slice(bytemuck::cast_slice(&level));
        if mip + 1 == desc.mip_levels {
            break;
        }

        let (nw, nh) = ((w / 2).max(1), (h / 2).max(1));
        let mut next = Vec::with_capacity((nw * nh) as usize);
        for y in 0..nh {
            for x in 0..nw {
                let mut sum = [0u32; 4];
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let sx = (x * 2 + dx).min(w - 1);
                    let sy = (y * 2 + dy).min(h - 1);
                    let texel = level[(sy * w + sx) as usize];
                    for c in 0..4 {
                        sum[c] += texel[c] as u32;
                    }
                }
                next.push(sum.map(|s| (s / 4) as u8));
            }
        }
        level = next;
        w = nw;
        h = nh;
    }
    out
}

/// Header values derived from the grid and the largest packed tile
pub fn calibrate(grid: &TileGridParams, largest_tile_bytes: u64) -> PackedFileMetadata {
    let tile_video = grid.tile_video_bytes().max(1);
    let resident_tiles = (grid.video_memory_budget / tile_video).clamp(1, grid.tile_count() as u64);

    let tile_bytes = largest_tile_bytes.max(1);
    let mappable = (grid.address_space_budget / tile_bytes).max(1);
    let max_chunks_in_va = resident_tiles.min(mappable).min(u32::MAX as u64) as u32;

    PackedFileMetadata {
        max_chunks_in_va,
        tile_bytes_size: largest_tile_bytes,
        tile_side_size: grid.tile_side_size,
        loading_radius: (resident_tiles as f32 / PI).sqrt() * grid.tile_side_size,
        video_memory_usage_at_full_mips: resident_tiles * tile_video,
    }
}

/// Generate the whole grid in parallel and write it as a packed file
pub fn pack_terrain(generator: &TerrainGenerator, grid: &TileGridParams, path: &Path) -> Result<PackedFileHeader> {
    grid.validate()?;

    let coords: Vec<(u32, u32)> = (0..grid.tiles_per_side)
        .flat_map(|z| (0..grid.tiles_per_side).map(move |x| (x, z)))
        .collect();
    log::info!("Building {} terrain tiles", coords.len());

    let tiles: Vec<TilePayloads> = coords
        .par_iter()
        .map(|&(x, z)| build_tile(generator, grid, x, z))
        .collect();

    let largest = tiles.iter().map(TilePayloads::total_bytes).max().unwrap_or(0);
    let metadata = calibrate(grid, largest);
    log::info!(
        "Calibrated: {} chunks in VA, loading radius {:.1}, {} MiB at full mips",
        metadata.max_chunks_in_va,
        metadata.loading_radius,
        metadata.video_memory_usage_at_full_mips / MIB
    );

    let mut builder = PackedFileBuilder::new();
    builder.set_metadata(metadata);
    for tile in tiles {
        let chunk = builder.add_chunk();
        for (part, data) in tile.parts {
            builder.add_resource(chunk, tile_resource_name(tile.x, tile.z, part), data, tile.center)?;
        }
    }
    builder.write(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::packed::{PackedFile, PackedFileOptions};
    use crate::terrain::generator::TerrainParams;

    fn small_grid() -> TileGridParams {
        TileGridParams {
            tiles_per_side: 2,
            tile_side_size: 32.0,
            vertices_per_side: 9,
            texture_size: 16,
            compress: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_resource_names_round_trip() {
        for part in TilePart::ALL {
            let name = tile_resource_name(3, 11, part);
            assert_eq!(parse_tile_resource_name(&name), Some((3, 11, part)));
        }
        assert_eq!(parse_tile_resource_name("tile_1_2_bogus"), None);
        assert_eq!(parse_tile_resource_name("mesh_1_2_vb"), None);
    }

    #[test]
    fn test_mip_chain_size_and_average() {
        let desc = TextureDesc::new(4, 4, 3, TextureFormat::Rgba8Unorm);
        let base: Vec<[u8; 4]> = (0..16).map(|i| if i % 2 == 0 { [0, 0, 0, 255] } else { [200, 100, 50, 255] }).collect();
        let chain = build_mip_chain(desc, base);
        assert_eq!(chain.len() as u64, desc.footprint());
        // Last level averages everything
        assert_eq!(&chain[chain.len() - 4..], &[100, 50, 25, 255]);
    }

    #[test]
    fn test_tile_payloads_decode() {
        let generator = TerrainGenerator::new(TerrainParams::default());
        let grid = small_grid();
        let tile = build_tile(&generator, &grid, 1, 0);

        for (part, data) in &tile.parts {
            let inflated = payload::decompress(data).unwrap().unwrap();
            let magic = match part {
                TilePart::Vertices => payload::VERTEX_MAGIC,
                TilePart::Indices => payload::INDEX_MAGIC,
                TilePart::Diffuse | TilePart::Normals => payload::TEXTURE_MAGIC,
            };
            let (shape, _) = payload::decode(&inflated, magic).unwrap();
            if let PayloadShape::Index { format, count } = shape {
                assert_eq!(format, IndexFormat::Uint16);
                assert_eq!(count, 8 * 8 * 6);
            }
        }
        assert!((tile.center.x - 48.0).abs() < 1e-4);
        assert!((tile.center.z - 16.0).abs() < 1e-4);
    }

    #[test]
    fn test_calibration_respects_budget() {
        let grid = TileGridParams { tiles_per_side: 64, ..Default::default() };
        let meta = calibrate(&grid, 4 * MIB);
        let resident = meta.video_memory_usage_at_full_mips / grid.tile_video_bytes();

        assert!(meta.video_memory_usage_at_full_mips <= grid.video_memory_budget);
        assert!((grid.video_memory_budget - meta.video_memory_usage_at_full_mips) < grid.tile_video_bytes());
        assert_eq!(meta.max_chunks_in_va as u64, resident.min(grid.address_space_budget / (4 * MIB)));
        let expected_radius = (resident as f32 / PI).sqrt() * grid.tile_side_size;
        assert!((meta.loading_radius - expected_radius).abs() < 1e-3);
    }

    #[test]
    fn test_calibration_small_grid_loads_everything() {
        let grid = small_grid();
        let meta = calibrate(&grid, 1000);
        assert_eq!(meta.max_chunks_in_va, 4);
        assert_eq!(meta.video_memory_usage_at_full_mips, 4 * grid.tile_video_bytes());
    }

    #[test]
    fn test_pack_terrain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terrain.pak");
        let generator = TerrainGenerator::new(TerrainParams::default());
        let grid = small_grid();

        let header = pack_terrain(&generator, &grid, &path).unwrap();
        assert_eq!(header.num_chunks, 4);
        assert_eq!(header.num_files, 16);

        let mut store = PackedFile::open(&path, PackedFileOptions::default()).unwrap();
        assert_eq!(store.header().tile_side_size, 32.0);
        let name = tile_resource_name(1, 1, TilePart::Diffuse);
        let bytes = store.file(&name).unwrap();
        assert_eq!(payload::peek_magic(&bytes), Some(payload::TEXTURE_MAGIC));

        let y = generator.height_at(16.0, 16.0);
        let near = store.resources_within_radius(grid.tile_center(0, 0, y), 1.0);
        assert_eq!(near.len(), 4);
        assert!(near.iter().all(|n| n.starts_with("tile_0_0_")));
    }

    #[test]
    fn test_invalid_grid_rejected() {
        let generator = TerrainGenerator::new(TerrainParams::default());
        let dir = tempfile::tempdir().unwrap();
        let grid = TileGridParams { texture_size: 100, ..small_grid() };
        assert!(matches!(
            pack_terrain(&generator, &grid, &dir.path().join("x.pak")),
            Err(Error::Config(_))
        ));
    }
}
