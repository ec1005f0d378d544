//! Allocator hot-path benchmarks against the emulated device.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use zbd_device::{EmuConfig, EmuZoned, ZonedBackend};
use zbd_engine::{lifetime_diff, OpenMode, ZonedBlockDevice};
use zbd_types::LifetimeHint;

fn bench_lifetime_diff(c: &mut Criterion) {
    use LifetimeHint::*;
    let hints = [NotSet, None, Short, Medium, Long, Extreme];

    c.bench_function("lifetime_diff_all_pairs", |b| {
        b.iter(|| {
            let mut acc = 0_u32;
            for zone in hints {
                for file in hints {
                    acc = acc.wrapping_add(lifetime_diff(black_box(zone), black_box(file)));
                }
            }
            acc
        });
    });
}

fn bench_reuse_allocation(c: &mut Criterion) {
    let dev = Arc::new(
        EmuZoned::new(EmuConfig {
            zone_size: 256 * 1024,
            zone_capacity: 256 * 1024,
            nr_zones: 64,
            max_active_zones: 20,
            max_open_zones: 20,
            ..EmuConfig::default()
        })
        .unwrap(),
    );
    let engine =
        ZonedBlockDevice::open(dev as Arc<dyn ZonedBackend>, OpenMode::ReadWrite).unwrap();

    // One written zone in the pool; every iteration re-opens and closes it
    // through the best-fit path.
    let seed = engine.allocate_zone(LifetimeHint::Medium, false);
    seed.append(&[7_u8; 4096]).unwrap();
    seed.add_used_capacity(4096);
    seed.close_write().unwrap();

    c.bench_function("allocate_reuse_and_close", |b| {
        b.iter(|| {
            let zone = engine
                .try_allocate_zone(LifetimeHint::Medium, false)
                .expect("seeded zone is always reusable");
            zone.close_write().unwrap();
        });
    });
}

criterion_group!(benches, bench_lifetime_diff, bench_reuse_allocation);
criterion_main!(benches);
