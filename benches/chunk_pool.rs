//! Benchmarks for chunk pool cursors and sample windows

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use esprom_rs::{CatalogConfig, ChunkPool, DirectoryEntry, RomCatalog, DEFAULT_CHUNK_PAYLOAD};
use std::io::{Cursor, SeekFrom};

fn benchmark_sequential_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_pool_sequential_read");

    for size in [64 * 1024, 1024 * 1024, 16 * 1024 * 1024].iter() {
        let pool = ChunkPool::allocate(*size).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut cursor = pool.cursor();
                let mut total = 0usize;
                loop {
                    let window = cursor.window(&pool);
                    if window.is_empty() {
                        break;
                    }
                    total += window.len();
                    cursor
                        .seek(&pool, SeekFrom::Current(window.len() as i64))
                        .unwrap();
                }
                black_box(total)
            });
        });
    }

    group.finish();
}

fn benchmark_random_seek(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_pool_random_seek");
    let size = 16 * 1024 * 1024;
    let pool = ChunkPool::allocate(size).unwrap();

    for stride in [DEFAULT_CHUNK_PAYLOAD / 2, DEFAULT_CHUNK_PAYLOAD * 7].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(stride), stride, |b, &stride| {
            b.iter(|| {
                let mut cursor = pool.cursor();
                let mut at = 0usize;
                for _ in 0..256 {
                    at = (at + stride * 31) % size;
                    cursor.seek(&pool, SeekFrom::Start(at as u64)).unwrap();
                }
                black_box(cursor.position())
            });
        });
    }

    group.finish();
}

fn benchmark_catalog_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("rom_catalog_build");

    for count in [16u16, 256, 1024].iter() {
        let sample_len = 2048u32;
        let body = 18 + 10 * *count as u32;
        let len = (body + sample_len * *count as u32) as usize;
        let mut image = vec![0x5Au8; len];
        image[14..16].copy_from_slice(&count.to_be_bytes());
        for i in 0..*count {
            let start = body + sample_len * i as u32;
            let at = DirectoryEntry::offset_of(i) as usize;
            image[at..at + 8]
                .copy_from_slice(&DirectoryEntry::new(start, start + sample_len - 1).to_bytes());
        }

        group.bench_with_input(BenchmarkId::from_parameter(count), &image, |b, image| {
            b.iter(|| {
                let catalog =
                    RomCatalog::from_source(&mut Cursor::new(image), &CatalogConfig::default())
                        .unwrap();
                black_box(catalog.len())
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_sequential_read,
    benchmark_random_seek,
    benchmark_catalog_build
);
criterion_main!(benches);
