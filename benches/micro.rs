//! Micro-benchmarks: point writes, point reads, scans, and the raw
//! in-memory index, each against a small working set.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tempfile::TempDir;
use trellisdb::index::TrieIndex;
use trellisdb::kv::{KeyRef, Record};
use trellisdb::{Store, StoreConfig};

fn bench_config() -> StoreConfig {
    StoreConfig {
        cache_mb: 64,
        memtable_mb: 64,
        wal_mb: 128,
        ..StoreConfig::default()
    }
}

fn key(i: u64) -> Vec<u8> {
    format!("key{i:012}").into_bytes()
}

fn bench_store_put(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(tmp.path(), bench_config()).unwrap();
    let mut db = store.make_ref().unwrap();
    let value = vec![0xabu8; 100];

    let mut i = 0u64;
    c.bench_function("store_put_100b", |b| {
        b.iter(|| {
            db.put(&key(i), &value).unwrap();
            i += 1;
        })
    });
}

fn bench_store_get(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(tmp.path(), bench_config()).unwrap();
    let mut db = store.make_ref().unwrap();
    let value = vec![0xcdu8; 100];

    let n = 100_000u64;
    for i in 0..n {
        db.put(&key(i), &value).unwrap();
    }

    let mut i = 0u64;
    c.bench_function("store_get_hit", |b| {
        b.iter(|| {
            let got = db.get(&key(i % n)).unwrap();
            black_box(got);
            i += 1;
        })
    });

    c.bench_function("store_probe_miss", |b| {
        b.iter(|| {
            let got = db.probe(&key(n + (i % n))).unwrap();
            black_box(got);
            i += 1;
        })
    });
}

fn bench_store_scan(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(tmp.path(), bench_config()).unwrap();
    let mut db = store.make_ref().unwrap();
    let value = vec![0xefu8; 100];

    for i in 0..100_000u64 {
        db.put(&key(i), &value).unwrap();
    }

    c.bench_function("store_scan_1000", |b| {
        b.iter(|| {
            let mut iter = db.iter().unwrap();
            iter.seek(&key(10_000)).unwrap();
            let mut count = 0u32;
            while count < 1000 {
                let Some((k, _)) = iter.peek() else { break };
                black_box(k);
                count += 1;
                iter.skip1();
            }
            assert_eq!(count, 1000);
        })
    });
}

fn bench_index_raw(c: &mut Criterion) {
    let index = TrieIndex::new();
    let idx_ref = index.make_ref().unwrap();

    let n = 100_000u64;
    for i in 0..n {
        idx_ref.put(Record::new(&key(i), &[0x42u8; 100]).unwrap());
    }

    let mut i = 0u64;
    c.bench_function("index_get_hit", |b| {
        b.iter(|| {
            let k = key(i % n);
            let hit = idx_ref.probe(&KeyRef::new(&k));
            black_box(hit);
            i += 1;
        })
    });

    c.bench_function("index_put_overwrite", |b| {
        b.iter(|| {
            let k = key(i % n);
            idx_ref.put(Record::new(&k, &[0x43u8; 100]).unwrap());
            i += 1;
        })
    });
}

criterion_group!(
    benches,
    bench_store_put,
    bench_store_get,
    bench_store_scan,
    bench_index_raw
);
criterion_main!(benches);
