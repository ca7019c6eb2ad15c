//! Benchmarks for the hot paths of a read: readahead bookkeeping, cache
//! lookups, governor admission and XOR reassembly
//!
//! Run with: cargo bench --bench read_path

use std::hint::black_box;
use std::time::Duration;

use bytes::Bytes;
use chunkfs_read::xor::reconstruct_part;
use chunkfs_read::{
    BandwidthGovernor, ByteRange, CacheKey, ChunkExtent, ChunkId, ChunkPart, ChunkReadCache,
    ChunkVersion, ReadCache, ReadaheadController, StripeGeometry,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// Benchmark the readahead controller under sequential and random access
fn bench_readahead_feed(c: &mut Criterion) {
    let mut group = c.benchmark_group("readahead_feed");
    group.throughput(Throughput::Elements(1024));

    group.bench_function("sequential", |b| {
        b.iter(|| {
            let mut ra = ReadaheadController::new(64 << 20, Duration::from_secs(1), 0, false);
            for i in 0..1024u64 {
                black_box(ra.feed(i * 65536, 65536));
            }
            black_box(ra.window())
        });
    });

    group.bench_function("random", |b| {
        b.iter(|| {
            let mut ra = ReadaheadController::new(64 << 20, Duration::from_secs(1), 0, false);
            for i in 0..1024u64 {
                let offset = i.wrapping_mul(2_654_435_761) % (1 << 34);
                black_box(ra.feed(offset, 4096));
            }
            black_box(ra.window())
        });
    });

    group.finish();
}

/// Benchmark cache lookups at several extent counts per chunk
fn bench_cache_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_lookup");

    for extents in [1u32, 16, 256] {
        let cache = ChunkReadCache::new(Duration::from_secs(3600), 0);
        let key = CacheKey::new(ChunkId(42), ChunkPart::Standard);
        for i in 0..extents {
            let data = Bytes::from(vec![i as u8; 4096]);
            cache.store(key, ChunkExtent::new(i * 4096, data, ChunkVersion(1)));
        }

        group.throughput(Throughput::Bytes(4096));
        group.bench_with_input(BenchmarkId::new("hit", extents), &extents, |b, &n| {
            let last = ByteRange::new((n - 1) * 4096, 4096);
            b.iter(|| black_box(cache.lookup(&key, last, ChunkVersion(1))));
        });
        group.bench_with_input(BenchmarkId::new("miss", extents), &extents, |b, &n| {
            let past = ByteRange::new(n * 4096, 4096);
            b.iter(|| black_box(cache.lookup(&key, past, ChunkVersion(1))));
        });
    }

    group.finish();
}

fn bench_governor_admit(c: &mut Criterion) {
    c.bench_function("governor_admit", |b| {
        let governor = BandwidthGovernor::new(1.0, Duration::from_secs(1));
        b.iter(|| {
            governor.record_demand(65536);
            black_box(governor.admit(65536))
        });
    });
}

/// Benchmark stripe reassembly and single-part reconstruction
fn bench_xor(c: &mut Criterion) {
    let mut group = c.benchmark_group("xor");
    const BLOCK: u32 = 64 * 1024;

    for level in [2u8, 4, 9] {
        let geometry = StripeGeometry::new(level, BLOCK);
        let range = ByteRange::new(0, u32::from(level) * BLOCK * 4);
        let rows = geometry.rows(range);
        let part_len = geometry.part_range(rows).size as usize;
        let parts: Vec<Bytes> = (0..level)
            .map(|p| Bytes::from(vec![p; part_len]))
            .collect();

        group.throughput(Throughput::Bytes(u64::from(range.size)));
        group.bench_with_input(BenchmarkId::new("assemble", level), &level, |b, _| {
            b.iter(|| black_box(geometry.assemble(range, rows, &parts)));
        });

        let parity = vec![0x5au8; part_len];
        let others: Vec<&[u8]> = parts.iter().skip(1).map(|p| &p[..]).collect();
        group.bench_with_input(BenchmarkId::new("reconstruct", level), &level, |b, _| {
            b.iter(|| black_box(reconstruct_part(part_len, &parity, &others)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_readahead_feed,
    bench_cache_lookup,
    bench_governor_admit,
    bench_xor
);
criterion_main!(benches);
