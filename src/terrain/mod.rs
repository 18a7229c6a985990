//! Procedural terrain tiles for streaming

pub mod generator;
pub use generator::{TerrainGenerator, TerrainParams};

pub mod tiles;
pub use tiles::{
    TerrainVertex, TileGridParams, TilePart, calibrate, pack_terrain, parse_tile_resource_name,
    tile_resource_name,
};
