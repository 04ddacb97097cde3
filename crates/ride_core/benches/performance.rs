//! Performance benchmarks for ride_core using Criterion.rs.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ride_core::fare::{fare, RateTable};
use ride_core::geo::GeoPoint;
use ride_core::matching::rank_candidates;
use ride_core::store::memory::DriverIndex;
use ride_core::store::ProximityQuery;
use ride_core::test_helpers::{sample_driver, TestHarness, TEST_PICKUP};
use ride_core::VehicleClass;

/// Spreads `count` Car drivers on a grid of ~300 m steps around the pickup.
fn populated_index(count: usize) -> DriverIndex {
    let mut index = DriverIndex::new();
    let side = (count as f64).sqrt().ceil() as usize;
    for i in 0..count {
        let row = (i / side) as f64 - side as f64 / 2.0;
        let col = (i % side) as f64 - side as f64 / 2.0;
        let point = GeoPoint {
            lat: TEST_PICKUP.lat + row * 0.0027,
            lng: TEST_PICKUP.lng + col * 0.0027,
        };
        index.upsert(sample_driver(point, VehicleClass::Car));
    }
    index
}

fn bench_fare(c: &mut Criterion) {
    let table = RateTable::default();
    let mut group = c.benchmark_group("fare");
    group.bench_function("default_rates", |b| {
        b.iter(|| black_box(fare(black_box(6.2), black_box(18.0), VehicleClass::Car, 1.0)));
    });
    group.bench_function("rate_table_surge", |b| {
        b.iter(|| black_box(table.fare(black_box(12.4), black_box(31.0), VehicleClass::Auto, 1.8)));
    });
    group.finish();
}

fn bench_proximity(c: &mut Criterion) {
    let mut group = c.benchmark_group("proximity_query");
    for drivers in [100, 1_000, 5_000] {
        let index = populated_index(drivers);
        let query = ProximityQuery {
            center: TEST_PICKUP,
            radius_km: 5.0,
            vehicle_class: VehicleClass::Car,
            limit: 20,
            exclude: Vec::new(),
        };
        group.bench_with_input(BenchmarkId::from_parameter(drivers), &query, |b, query| {
            b.iter(|| black_box(index.nearby(query)));
        });
    }
    group.finish();
}

fn bench_ranking(c: &mut Criterion) {
    let index = populated_index(1_000);
    let query = ProximityQuery {
        center: TEST_PICKUP,
        radius_km: 10.0,
        vehicle_class: VehicleClass::Car,
        limit: usize::MAX,
        exclude: Vec::new(),
    };
    let candidates = index.nearby(&query);
    c.bench_function("rank_candidates", |b| {
        b.iter(|| black_box(rank_candidates(candidates.clone(), 20)));
    });
}

fn bench_request_dispatch_accept(c: &mut Criterion) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => panic!("tokio runtime: {err}"),
    };
    c.bench_function("request_dispatch_accept", |b| {
        b.to_async(&runtime).iter(|| async {
            let harness = TestHarness::new();
            let rider = harness.add_requester("rider");
            let driver = harness
                .add_driver("driver", TEST_PICKUP, VehicleClass::Car)
                .await
                .expect("driver");
            let ride = harness.request_sample_ride(&rider).await.expect("ride");
            harness.service.dispatch(ride.id).await.expect("dispatch");
            black_box(harness.service.accept_ride(&driver, ride.id).await.expect("accept"));
        });
    });
}

criterion_group!(
    benches,
    bench_fare,
    bench_proximity,
    bench_ranking,
    bench_request_dispatch_accept
);
criterion_main!(benches);
