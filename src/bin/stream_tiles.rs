//! Tile streaming binary - streams every tile inside the loading radius of a
//! packed terrain file through the async loader on a headless device.
//!
//! Usage: cargo run --release --bin stream_tiles -- [OPTIONS]
//!
//! Options:
//!   --file <PATH>       Packed file (default: "terrain.pak")
//!   --config <PATH>     Streaming config JSON (default: built-in defaults)
//!   --x <X> --z <Z>     Viewer position (default: grid center)
//!   --radius <R>        Override the file's loading radius
//!   --threads <N>       Processing threads
//!   --heap              Read chunks into heap buffers instead of mapping them

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::Vec3;
use parking_lot::Mutex;

use content_streaming::core::{MIB, StreamingConfig};
use content_streaming::device::GpuDevice;
use content_streaming::device::headless::HeadlessDevice;
use content_streaming::streaming::{
    AsyncLoader, BufferProcessor, DataProcessor, PackedDataLoader, PackedFile, PackedFileOptions,
    ResourceReuseCache, ResourceSlot, ResultSlot, TextureProcessor,
};
use content_streaming::terrain::{TilePart, parse_tile_resource_name};

fn main() {
    content_streaming::core::logging::init();

    let args: Vec<String> = std::env::args().collect();
    let path = PathBuf::from(parse_str_arg(&args, "--file").unwrap_or_else(|| "terrain.pak".to_string()));

    let mut config = match parse_str_arg(&args, "--config") {
        Some(config_path) => StreamingConfig::load_sync(&PathBuf::from(config_path)).unwrap_or_else(|e| {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }),
        None => StreamingConfig::default(),
    };
    if let Some(threads) = parse_usize_arg(&args, "--threads") {
        config.processing_threads = threads;
    }
    if args.iter().any(|a| a == "--heap") {
        config.use_memory_mapping = false;
    }

    let options = PackedFileOptions {
        use_memory_mapping: config.use_memory_mapping,
        max_chunks_mapped: config.max_chunks_mapped,
    };
    let store = match PackedFile::open(&path, options) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to open {}: {}", path.display(), e);
            std::process::exit(1);
        }
    };
    let header = *store.header();

    // Default viewer position: middle of all tile centers
    let entries = store.entries();
    let mean = entries.iter().fold(Vec3::ZERO, |acc, e| acc + e.center) / entries.len().max(1) as f32;
    let viewer = Vec3::new(
        parse_f32_arg(&args, "--x").unwrap_or(mean.x),
        mean.y,
        parse_f32_arg(&args, "--z").unwrap_or(mean.z),
    );
    let radius = parse_f32_arg(&args, "--radius").unwrap_or(header.loading_radius);

    // Ignore height when picking tiles
    let names: Vec<String> = entries
        .iter()
        .filter(|e| {
            let dx = e.center.x - viewer.x;
            let dz = e.center.z - viewer.z;
            dx * dx + dz * dz <= radius * radius
        })
        .map(|e| e.name.clone())
        .collect();

    println!("=== Tile Streamer ===");
    println!("File:     {} ({} files, {} chunks)", path.display(), header.num_files, header.num_chunks);
    println!("Viewer:   ({:.1}, {:.1}), radius {:.1}m", viewer.x, viewer.z, radius);
    println!("Requests: {}", names.len());
    println!("Mapping:  {}", if config.use_memory_mapping { "memory mapped" } else { "heap" });
    println!();

    let store = Arc::new(Mutex::new(store));
    let device = Arc::new(HeadlessDevice::new());
    let cache = Arc::new(ResourceReuseCache::new(
        device.clone() as Arc<dyn GpuDevice>,
        config.max_managed_memory,
    ));
    let loader = match AsyncLoader::new(&config) {
        Ok(loader) => loader,
        Err(e) => {
            eprintln!("Failed to start loader: {}", e);
            std::process::exit(1);
        }
    };

    let start = Instant::now();
    let mut results = Vec::with_capacity(names.len());
    for name in &names {
        let Some((_, _, part)) = parse_tile_resource_name(name) else {
            log::warn!("Skipping unknown resource '{}'", name);
            continue;
        };
        let processor: Box<dyn DataProcessor> = match part {
            TilePart::Vertices => Box::new(BufferProcessor::vertex(cache.clone(), ResourceSlot::new())),
            TilePart::Indices => Box::new(BufferProcessor::index(cache.clone(), ResourceSlot::new())),
            TilePart::Diffuse | TilePart::Normals => {
                Box::new(TextureProcessor::new(cache.clone(), ResourceSlot::new()))
            }
        };
        let result = ResultSlot::new();
        if let Err(e) = loader.submit(
            Box::new(PackedDataLoader::new(store.clone(), name.clone())),
            processor,
            Some(result.clone()),
        ) {
            eprintln!("Submit failed: {}", e);
            std::process::exit(1);
        }
        results.push((name, result));
    }

    // Frame loop: a bounded drain per frame until everything has landed
    let mut frames = 0u64;
    while loader.outstanding() > 0 {
        loader.process_device_work_items(config.device_items_per_frame);
        frames += 1;
        std::thread::sleep(Duration::from_millis(1));
    }
    let elapsed = start.elapsed();

    for (name, result) in &results {
        if let Some(code) = result.get() {
            if !code.is_ok() {
                println!("FAILED {}: {:?}", name, code);
            }
        }
    }

    let stats = loader.stats();
    let cache_stats = cache.stats();
    let packed_stats = store.lock().stats();
    println!("=== Done in {:.2}s over {} frames ===", elapsed.as_secs_f32(), frames);
    println!("Loaded:        {} ok, {} failed, {} lock retries", stats.completed, stats.failed, stats.lock_retries);
    println!(
        "Cache:         {} objects, {:.1} / {:.1} MiB managed ({:.0}% of budget)",
        cache.len(),
        cache.used_managed_memory() as f64 / MIB as f64,
        cache.max_managed_memory() as f64 / MIB as f64,
        cache.memory_pressure() * 100.0
    );
    println!(
        "               {} hits, {} misses, {} created, {} evicted, {} failed creations",
        cache_stats.hits, cache_stats.misses, cache_stats.created, cache_stats.evicted, cache_stats.failed_creations
    );
    println!(
        "Packed file:   {} lookups, {} chunk maps, {} chunk unmaps, {} heap fallbacks",
        packed_stats.lookups, packed_stats.chunk_maps, packed_stats.chunk_unmaps, packed_stats.heap_fallbacks
    );
    println!("Device:        {:.1} MiB allocated, {} uploads", device.allocated_bytes() as f64 / MIB as f64, device.uploads());
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
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
