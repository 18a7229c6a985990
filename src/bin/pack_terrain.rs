//! Terrain packer binary - generates a tile grid and writes it as a packed file.
//!
//! Usage: cargo run --release --bin pack_terrain -- [OPTIONS]
//!
//! Options:
//!   --out <PATH>        Output packed file (default: "terrain.pak")
//!   --tiles <N>         Tiles per grid side (default: 16)
//!   --tile-size <M>     Tile edge in meters (default: 64)
//!   --vertices <N>      Height samples per tile edge (default: 65)
//!   --texture <N>       Tile texture size, power of two (default: 256)
//!   --seed <SEED>       Random seed (default: 12345)
//!   --scale <SCALE>     Terrain noise scale (default: 150.0)
//!   --height <H>        Terrain height scale (default: 80.0)
//!   --budget-mb <MB>    Video memory budget for resident tiles (default: 512)
//!   --jobs <N>          Max parallel tile builds (default: 4)
//!   --raw               Store payloads uncompressed

use std::path::PathBuf;
use std::time::Instant;

use content_streaming::core::MIB;
use content_streaming::terrain::{TerrainGenerator, TerrainParams, TileGridParams, pack_terrain};

fn main() {
    content_streaming::core::logging::init();

    let args: Vec<String> = std::env::args().collect();
    let out = PathBuf::from(parse_str_arg(&args, "--out").unwrap_or_else(|| "terrain.pak".to_string()));
    let jobs = parse_usize_arg(&args, "--jobs").unwrap_or(4);

    let defaults = TileGridParams::default();
    let grid = TileGridParams {
        tiles_per_side: parse_u32_arg(&args, "--tiles").unwrap_or(defaults.tiles_per_side),
        tile_side_size: parse_f32_arg(&args, "--tile-size").unwrap_or(defaults.tile_side_size),
        vertices_per_side: parse_u32_arg(&args, "--vertices").unwrap_or(defaults.vertices_per_side),
        texture_size: parse_u32_arg(&args, "--texture").unwrap_or(defaults.texture_size),
        compress: !args.iter().any(|a| a == "--raw"),
        video_memory_budget: parse_u32_arg(&args, "--budget-mb")
            .map(|mb| mb as u64 * MIB)
            .unwrap_or(defaults.video_memory_budget),
        ..defaults
    };
    let terrain_params = TerrainParams {
        seed: parse_u32_arg(&args, "--seed").unwrap_or(12345),
        scale: parse_f32_arg(&args, "--scale").unwrap_or(150.0),
        height_scale: parse_f32_arg(&args, "--height").unwrap_or(80.0),
        octaves: 5,
        ..Default::default()
    };

    // Limit rayon's thread pool to cap peak memory usage
    rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build_global()
        .expect("Failed to configure thread pool");

    println!("=== Terrain Packer ===");
    println!("Grid:    {0} x {0} tiles of {1}m", grid.tiles_per_side, grid.tile_side_size);
    println!("Tile:    {} vertices/side, {}px textures", grid.vertices_per_side, grid.texture_size);
    println!("Seed:    {}", terrain_params.seed);
    println!("Budget:  {} MiB video memory", grid.video_memory_budget / MIB);
    println!("Output:  {}", out.display());
    println!();

    let start = Instant::now();
    let generator = TerrainGenerator::new(terrain_params);
    let header = match pack_terrain(&generator, &grid, &out) {
        Ok(header) => header,
        Err(e) => {
            eprintln!("Packing failed: {}", e);
            std::process::exit(1);
        }
    };

    println!("=== Done in {:.1}s ===", start.elapsed().as_secs_f32());
    println!("Files:          {}", header.num_files);
    println!("Chunks:         {}", header.num_chunks);
    println!("File size:      {:.1} MiB", header.file_size as f64 / MIB as f64);
    println!("Largest tile:   {} KiB", header.tile_bytes_size / 1024);
    println!("Chunks in VA:   {}", header.max_chunks_in_va);
    println!("Loading radius: {:.1}m", header.loading_radius);
    println!(
        "Resident video: {:.1} MiB at full mips",
        header.video_memory_usage_at_full_mips as f64 / MIB as f64
    );
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_u32_arg(args: &[String], flag: &str) -> Option<u32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
