//! Benchmark: duplicate-check hot path.
//!
//! Measures search-only checks of known and unknown hashes and adds of
//! fresh records against a store seeded with `SEED_RECORDS` entries.

use std::sync::atomic::{AtomicUsize, Ordering};

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use fhist_core::{BackendKind, HashAlgo, HistoryConfig, HistoryRecord, HistoryStore};

const SEED_RECORDS: usize = 10_000;

fn hash(n: usize) -> String {
    HashAlgo::Sha256.digest(format!("<{n}@bench.history>").as_bytes())
}

fn seeded_store(dir: &std::path::Path) -> HistoryStore {
    let mut config = HistoryConfig::new(dir);
    config.backend = BackendKind::Memory;
    let store = HistoryStore::open(config).expect("open store");
    for n in 0..SEED_RECORDS {
        store
            .add(HistoryRecord::new(hash(n), format!("@{n:016x}@")))
            .expect("seed");
    }
    store.sync().expect("sync");
    store
}

fn bench_dedup(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = seeded_store(dir.path());
    let known: Vec<String> = (0..SEED_RECORDS).step_by(97).map(hash).collect();
    let unknown: Vec<String> = (SEED_RECORDS * 10..SEED_RECORDS * 10 + 128).map(hash).collect();

    let mut group = c.benchmark_group("dedup");
    group.throughput(Throughput::Elements(1));

    let next = AtomicUsize::new(0);
    group.bench_function("check_known", |b| {
        b.iter(|| {
            let i = next.fetch_add(1, Ordering::Relaxed) % known.len();
            store.check(&known[i]).expect("check")
        });
    });

    group.bench_function("check_unknown", |b| {
        b.iter(|| {
            let i = next.fetch_add(1, Ordering::Relaxed) % unknown.len();
            store.check(&unknown[i]).expect("check")
        });
    });

    let fresh = AtomicUsize::new(SEED_RECORDS * 100);
    group.bench_function("add_fresh", |b| {
        b.iter(|| {
            let n = fresh.fetch_add(1, Ordering::Relaxed);
            store
                .add(HistoryRecord::new(hash(n), format!("@{n:016x}@")))
                .expect("add")
        });
    });

    group.finish();
    store.close().expect("close");
}

criterion_group!(benches, bench_dedup);
criterion_main!(benches);
