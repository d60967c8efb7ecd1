use std::alloc::System;
use std::hint::black_box;

use meterline::counter::{Counter, Key, Role, StatAccumulator, Unit};
use meterline::store::counter::CounterStore;
use serial_test::serial;
use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

fn measure_alloc_counts<T>(f: impl FnOnce() -> T) -> (T, usize, usize) {
    // Calibrate for ambient allocator activity in the test harness process.
    let idle_region = Region::new(&GLOBAL);
    black_box(());
    let idle = idle_region.change();

    let region = Region::new(&GLOBAL);
    let output = f();
    let used = region.change();

    let allocations = used.allocations.saturating_sub(idle.allocations);
    let deallocations = used.deallocations.saturating_sub(idle.deallocations);
    (output, allocations, deallocations)
}

#[test]
#[serial]
fn accumulator_add_value_allocates_zero() {
    let mut stats = StatAccumulator::new();

    let (_, allocations, deallocations) = measure_alloc_counts(|| {
        for i in 0..10_000 {
            stats.add_value(black_box(f64::from(i)));
        }
    });

    assert_eq!(stats.hits(), 10_000);
    assert_eq!(allocations, 0, "add_value allocated");
    assert_eq!(deallocations, 0, "add_value deallocated");
}

#[test]
#[serial]
fn counter_add_allocates_zero() {
    let counter = Counter::new(Key::new(Role::performances(), "Service.call"));

    let (_, allocations, _) = measure_alloc_counts(|| {
        for i in 0..10_000u32 {
            counter
                .add(black_box(f64::from(i)), &Unit::MICROSECOND)
                .expect("compatible unit");
        }
    });

    assert_eq!(counter.hits(), 10_000);
    assert_eq!(allocations, 0, "Counter::add allocated");
}

#[test]
#[serial]
fn record_timing_on_existing_key_allocation_budget() {
    let store = CounterStore::new();
    let key = Key::new(Role::web(), "/checkout");
    store.record_timing(&key, 1).expect("first timing");

    let (_, allocations, _) = measure_alloc_counts(|| {
        for i in 0..1_000u64 {
            store.record_timing(black_box(&key), i).expect("timing");
        }
    });

    assert!(
        allocations <= 8,
        "record_timing allocation budget exceeded: {}",
        allocations
    );
}

#[test]
#[serial]
fn merge_allocates_zero() {
    let mut a = StatAccumulator::new();
    let mut b = StatAccumulator::new();
    for i in 0..100 {
        a.add_value(f64::from(i));
        b.add_value(f64::from(i * 3));
    }

    let (merged, allocations, _) = measure_alloc_counts(|| {
        let mut merged = a;
        for _ in 0..1_000 {
            merged = black_box(merged.merge(&b));
        }
        merged
    });

    assert_eq!(merged.hits(), 100 + 100 * 1_000);
    assert_eq!(allocations, 0, "merge allocated");
}
