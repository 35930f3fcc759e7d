//! Performance benchmarks for sluice-files.
//!
//! Run with: `cargo bench -p sluice-files`
//!
//! Covers:
//! - Parallel hashing throughput by worker count
//! - File-backed hashing (workers read their own partitions)
//! - Chunk planning and record bitmaps for large sources

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::RngCore;
use sluice_files::chunker::{ChunkSizePolicy, SIZE_UNIT, plan_chunks};
use sluice_files::hasher::{HasherConfig, ParallelHasher};
use sluice_files::{Blake3, ContentId, UploadRecord};
use std::io::Write;
use tempfile::NamedTempFile;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

// ============================================================================
// Parallel Hasher Benchmarks
// ============================================================================

/// Hashing a 64 MiB buffer with 1 MiB chunks across different worker counts
fn bench_hash_bytes_by_workers(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_bytes_workers");
    group.sample_size(10);

    let data = random_bytes(64 * SIZE_UNIT as usize);
    group.throughput(Throughput::Bytes(data.len() as u64));

    for workers in [1, 2, 4, 8, 16] {
        let hasher = ParallelHasher::<Blake3>::new(HasherConfig {
            workers,
            chunk_policy: ChunkSizePolicy::Custom(1.0),
        })
        .unwrap();

        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, _| {
            b.iter(|| black_box(hasher.hash_bytes(&data).unwrap().content_id));
        });
    }

    group.finish();
}

/// Hashing a 64 MiB file, partitions read by the workers
fn bench_hash_file(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_file");
    group.sample_size(10);

    let data = random_bytes(64 * SIZE_UNIT as usize);
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&data).unwrap();
    file.flush().unwrap();

    group.throughput(Throughput::Bytes(data.len() as u64));

    for workers in [1, 4, 8] {
        let hasher = ParallelHasher::<Blake3>::with_workers(workers).unwrap();
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, _| {
            b.iter(|| black_box(hasher.hash_file(file.path()).unwrap().content_id));
        });
    }

    group.finish();
}

// ============================================================================
// Planning Benchmarks
// ============================================================================

/// Chunk plans for sources up to 100 GiB
fn bench_plan_chunks(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_chunks");

    for gib in [1u64, 10, 100] {
        let total = gib * 1024 * SIZE_UNIT;
        group.bench_with_input(BenchmarkId::new("gib", gib), &total, |b, &total| {
            b.iter(|| black_box(plan_chunks(total, ChunkSizePolicy::Auto).unwrap().len()));
        });
    }

    group.finish();
}

/// Bitmap encoding of a half-delivered 10,000 chunk record
fn bench_record_bitmap(c: &mut Criterion) {
    let mut record = UploadRecord::new(
        ContentId::from_bytes([1; 16]),
        "bench",
        None,
        10_000 * SIZE_UNIT,
        SIZE_UNIT,
    );
    let even: Vec<usize> = (0..10_000).step_by(2).collect();
    record.mark_chunks_complete(&even);

    c.bench_function("record_bitmap", |b| {
        b.iter(|| black_box(record.chunk_bitmap()));
    });

    c.bench_function("record_missing_chunks", |b| {
        b.iter(|| black_box(record.missing_chunks().len()));
    });
}

criterion_group!(
    benches,
    bench_hash_bytes_by_workers,
    bench_hash_file,
    bench_plan_chunks,
    bench_record_bitmap
);
criterion_main!(benches);
