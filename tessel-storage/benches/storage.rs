//! Benchmarks for the in-memory object store
//!
//! Run with: cargo bench --package tessel-storage --bench storage

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tessel_core::{ContainerId, EpochRange, ObjectId, PoolId, EPOCH_MAX};
use tessel_storage::{MemoryStore, ObjectRef, ObjectStore, WriteMeta};

/// Generate test data of specified size
fn generate_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

fn object(pool: PoolId, cont: ContainerId, seed: u64) -> ObjectRef {
    ObjectRef {
        pool,
        target: 0,
        cont,
        oid: ObjectId::from_name(&seed.to_le_bytes()),
    }
}

/// Single value writes (latency)
fn bench_update_latency(c: &mut Criterion) {
    let store = MemoryStore::new();
    let (pool, cont) = (PoolId::new(), ContainerId::new());
    let dkey = Bytes::from_static(b"dkey");
    let akey = Bytes::from_static(b"akey");

    let mut group = c.benchmark_group("memory_update_latency");
    for size in [
        1024,        // 1 KB
        32 * 1024,   // 32 KB (inline threshold)
        256 * 1024,  // 256 KB
        1024 * 1024, // 1 MB
    ] {
        let data = Bytes::from(generate_data(size));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("update", format_size(size)), &data, |b, data| {
            let mut counter = 0u64;
            b.iter(|| {
                counter += 1;
                let obj = object(pool, cont, counter);
                store
                    .update(
                        &obj,
                        WriteMeta::client(0, 1),
                        &dkey,
                        &akey,
                        store.next_epoch(),
                        black_box(data.clone()),
                    )
                    .unwrap()
            })
        });
    }
    group.finish();
}

/// Enumerating an object the way a puller does
fn bench_fetch_object(c: &mut Criterion) {
    let store = MemoryStore::new();
    let (pool, cont) = (PoolId::new(), ContainerId::new());
    let value = Bytes::from(generate_data(4096));

    let mut group = c.benchmark_group("memory_fetch_object");
    for dkeys in [1usize, 16, 256] {
        let obj = object(pool, cont, dkeys as u64);
        for d in 0..dkeys {
            let dkey = Bytes::from(format!("d{d}"));
            for version in 0..4 {
                store
                    .update(
                        &obj,
                        WriteMeta::client(0, 1),
                        &dkey,
                        &Bytes::from(format!("a{version}")),
                        store.next_epoch(),
                        value.clone(),
                    )
                    .unwrap();
            }
        }

        group.throughput(Throughput::Elements(dkeys as u64));
        group.bench_with_input(BenchmarkId::new("fetch", dkeys), &obj, |b, obj| {
            b.iter(|| store.fetch_object(black_box(obj), EPOCH_MAX).unwrap())
        });
    }
    group.finish();
}

/// Discarding whole objects, as Reclaim does
fn bench_discard(c: &mut Criterion) {
    let (pool, cont) = (PoolId::new(), ContainerId::new());
    let dkey = Bytes::from_static(b"dkey");
    let akey = Bytes::from_static(b"akey");
    let value = Bytes::from(generate_data(1024));

    c.bench_function("memory_discard_object", |b| {
        b.iter_batched(
            || {
                let store = MemoryStore::new();
                for seed in 0..64 {
                    store
                        .update(
                            &object(pool, cont, seed),
                            WriteMeta::client(0, 1),
                            &dkey,
                            &akey,
                            store.next_epoch(),
                            value.clone(),
                        )
                        .unwrap();
                }
                store
            },
            |store| {
                for seed in 0..64 {
                    store
                        .discard(&object(pool, cont, seed), EpochRange::up_to(EPOCH_MAX), 0)
                        .unwrap();
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn format_size(bytes: usize) -> String {
    if bytes >= 1024 * 1024 {
        format!("{}MB", bytes / (1024 * 1024))
    } else if bytes >= 1024 {
        format!("{}KB", bytes / 1024)
    } else {
        format!("{}B", bytes)
    }
}

criterion_group!(benches, bench_update_latency, bench_fetch_object, bench_discard);
criterion_main!(benches);
