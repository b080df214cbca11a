// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Entry store scan microbenchmarks.

use criterion::BatchSize;
use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::Throughput;
use criterion::criterion_group;
use criterion::criterion_main;
use natsync::engine::entry::EntryStore;
use natsync_bench::SIZES;
use natsync_bench::conns;
use natsync_bench::loaded_cache;
use natsync_test_utils::*;
use std::hint::black_box;
use std::num::NonZeroU32;

/// Fill a store and then look up its last entry, the worst case for
/// the linear duplicate scan.
fn store_add_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("entry_store");

    for size in SIZES {
        let conns = conns(size, 16);
        let limit = NonZeroU32::new(size).unwrap();
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(
            BenchmarkId::new("fill", size),
            &conns,
            |b, cs| {
                b.iter_batched_ref(
                    || EntryStore::new(limit),
                    |store| {
                        for c in cs {
                            let _ = black_box(store.add(*c));
                        }
                    },
                    BatchSize::SmallInput,
                )
            },
        );

        let mut store = EntryStore::new(limit);
        for c in &conns {
            let _ = store.add(*c);
        }
        let last = conns[conns.len() - 1].key();
        group.bench_function(BenchmarkId::new("find_last", size), |b| {
            b.iter(|| black_box(store.find(black_box(&last))))
        });
    }

    group.finish();
}

/// Withdraw and reinstall one client's rules, scanning the whole
/// store each way.
fn power_save_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("power_save");

    for size in SIZES {
        let conns = conns(size, 16);
        let (mut cache, _sim) = loaded_cache(&conns);
        let client = conns[0].private_ip;

        group.bench_function(BenchmarkId::new("enter_exit", size), |b| {
            b.iter(|| {
                black_box(cache.enter_power_save(client)).unwrap();
                black_box(cache.exit_power_save(client)).unwrap();
            })
        });
    }

    group.finish();
}

/// One timestamp pass where every rule has seen traffic.
fn ts_sync_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("ts_sync");

    for size in SIZES {
        let conns = conns(size, 16);
        let (mut cache, sim) = loaded_cache(&conns);
        let mut idle = 0;

        group.throughput(Throughput::Elements(size as u64));
        group.bench_function(BenchmarkId::new("all_changed", size), |b| {
            b.iter_batched(
                || {
                    idle += 1;
                    for c in &conns {
                        sim.device.set_idle(&c.key(), idle);
                    }
                },
                |()| black_box(cache.sync_timestamps()),
                BatchSize::PerIteration,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, store_add_find, power_save_cycle, ts_sync_pass);
criterion_main!(benches);
