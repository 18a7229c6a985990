use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, black_box};
use glam::Vec3;

use content_streaming::device::headless::HeadlessDevice;
use content_streaming::device::{GpuDevice, TextureFormat};
use content_streaming::streaming::payload::{self, PayloadShape};
use content_streaming::streaming::{PackedFile, PackedFileBuilder, PackedFileOptions, ResourceReuseCache};

fn bench_cache_reuse_hit(c: &mut Criterion) {
    let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::new());
    let cache = ResourceReuseCache::new(device, 1 << 30);

    // Warm the pool with a spread of shapes
    let mut warm = Vec::new();
    for size in [16u32, 32, 64, 128] {
        for _ in 0..16 {
            warm.push(cache.get_free_texture(size, size, 1, TextureFormat::Rgba8Unorm).unwrap());
        }
    }
    for handle in warm {
        cache.unuse_texture(handle);
    }

    c.bench_function("cache_reuse_hit", |b| {
        b.iter(|| {
            let handle = cache
                .get_free_texture(black_box(128), black_box(128), 1, TextureFormat::Rgba8Unorm)
                .unwrap();
            cache.unuse_texture(handle);
        });
    });
}

fn bench_cache_evict_and_create(c: &mut Criterion) {
    let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::new());
    // Room for a single 64x64 texture: every new shape evicts the previous one
    let cache = ResourceReuseCache::new(device, 64 * 64 * 4);

    c.bench_function("cache_evict_and_create", |b| {
        let mut flip = false;
        b.iter(|| {
            flip = !flip;
            let format = if flip { TextureFormat::Rgba8Unorm } else { TextureFormat::Bgra8Unorm };
            let handle = cache.get_free_texture(64, 64, 1, format).unwrap();
            cache.unuse_texture(handle);
        });
    });
}

fn bench_buffer_acquire_mixed(c: &mut Criterion) {
    let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::new());
    let cache = ResourceReuseCache::new(device, 1 << 30);

    c.bench_function("buffer_acquire_mixed", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let size = 1024 * (1 + i % 8);
            let handle = cache.get_free_vertex_buffer(black_box(size)).unwrap();
            cache.unuse_vertex_buffer(handle);
        });
    });
}

fn build_packed(dir: &std::path::Path, resources_per_chunk: usize, chunks: usize) -> std::path::PathBuf {
    let path = dir.join("bench.pak");
    let shape = PayloadShape::Vertex { stride: 32, count: 64 };
    let body = vec![7u8; shape.body_len() as usize];

    let mut builder = PackedFileBuilder::new();
    for c in 0..chunks {
        let chunk = builder.add_chunk();
        for r in 0..resources_per_chunk {
            builder
                .add_resource(
                    chunk,
                    format!("res_{}_{}", c, r),
                    payload::encode(shape, &body, false),
                    Vec3::new(c as f32, 0.0, r as f32),
                )
                .unwrap();
        }
    }
    builder.write(&path).unwrap();
    path
}

fn bench_packed_lookup_mapped(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = build_packed(dir.path(), 16, 32);
    let mut store = PackedFile::open(&path, PackedFileOptions::default()).unwrap();

    c.bench_function("packed_lookup_mapped", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 7) % 512;
            let name = format!("res_{}_{}", i / 16, i % 16);
            let bytes = store.file(black_box(&name)).unwrap();
            black_box(bytes.len());
        });
    });
}

fn bench_packed_lookup_capped(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = build_packed(dir.path(), 16, 32);
    let options = PackedFileOptions {
        use_memory_mapping: true,
        max_chunks_mapped: Some(2),
    };
    let mut store = PackedFile::open(&path, options).unwrap();

    c.bench_function("packed_lookup_capped", |b| {
        let mut i = 0usize;
        b.iter(|| {
            // Stride across chunks so most lookups remap
            i = (i + 17) % 512;
            let name = format!("res_{}_{}", i / 16, i % 16);
            let bytes = store.file(black_box(&name)).unwrap();
            black_box(bytes.len());
        });
    });
}

fn bench_packed_lookup_heap(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = build_packed(dir.path(), 16, 32);
    let options = PackedFileOptions {
        use_memory_mapping: false,
        max_chunks_mapped: None,
    };
    let mut store = PackedFile::open(&path, options).unwrap();

    c.bench_function("packed_lookup_heap", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 7) % 512;
            let name = format!("res_{}_{}", i / 16, i % 16);
            let bytes = store.file(black_box(&name)).unwrap();
            black_box(bytes.len());
        });
    });
}

fn bench_payload_decompress(c: &mut Criterion) {
    let shape = PayloadShape::Vertex { stride: 32, count: 4096 };
    let body: Vec<u8> = (0..shape.body_len()).map(|i| (i % 251) as u8).collect();
    let encoded = payload::encode(shape, &body, true);

    c.bench_function("payload_decompress_128k", |b| {
        b.iter(|| {
            let inflated = payload::decompress(black_box(&encoded)).unwrap();
            black_box(inflated.map(|v| v.len()));
        });
    });
}

criterion_group!(
    benches,
    bench_cache_reuse_hit,
    bench_cache_evict_and_create,
    bench_buffer_acquire_mixed,
    bench_packed_lookup_mapped,
    bench_packed_lookup_capped,
    bench_packed_lookup_heap,
    bench_payload_decompress,
);
criterion_main!(benches);
