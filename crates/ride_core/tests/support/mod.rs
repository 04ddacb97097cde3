#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ride_core::auth::Principal;
use ride_core::driver::{Driver, DriverPatch};
use ride_core::geo::GeoPoint;
use ride_core::store::memory::InMemoryStore;
use ride_core::store::{
    CasOutcome, DriverCandidate, ProximityQuery, RideGuard, RideStore, RideUpdate, StoreError,
    StoreResult,
};
use ride_core::test_helpers::{RecordingNotifier, TestHarness, TEST_PICKUP};
use ride_core::{Ride, RideId, UserId, VehicleClass};

pub const RIDER: &str = "rider-token";
pub const DRIVER: &str = "driver-token";

/// A point `steps` hundred metres north of the standard pickup.
pub fn near_pickup(steps: u32) -> GeoPoint {
    GeoPoint {
        lat: TEST_PICKUP.lat + 0.0009 * f64::from(steps),
        lng: TEST_PICKUP.lng,
    }
}

/// Parties and ride of an accepted trip.
pub struct Trip {
    pub rider: Principal,
    pub driver: Principal,
    pub ride: Ride,
}

/// A Car ride accepted by a driver waiting next to the pickup.
pub async fn accepted_trip(harness: &TestHarness) -> Trip {
    let rider = harness.add_requester(RIDER);
    let driver = harness
        .add_driver(DRIVER, near_pickup(1), VehicleClass::Car)
        .await
        .expect("driver");
    let ride = harness.request_sample_ride(&rider).await.expect("ride");
    harness.service.dispatch(ride.id).await.expect("dispatch");
    let ride = harness
        .service
        .accept_ride(&driver, ride.id)
        .await
        .expect("accept");
    Trip {
        rider,
        driver,
        ride,
    }
}

/// Like [`accepted_trip`], moved on to `started`.
pub async fn started_trip(harness: &TestHarness) -> Trip {
    let mut trip = accepted_trip(harness).await;
    harness
        .service
        .mark_arrived(&trip.driver, trip.ride.id)
        .await
        .expect("arrive");
    trip.ride = harness
        .service
        .start_trip(&trip.driver, trip.ride.id)
        .await
        .expect("start");
    trip
}

/// Like [`accepted_trip`], driven through to `completed`.
pub async fn completed_trip(harness: &TestHarness) -> Trip {
    let mut trip = started_trip(harness).await;
    trip.ride = harness
        .service
        .complete_trip(&trip.driver, trip.ride.id)
        .await
        .expect("complete");
    trip
}

/// Yields until the detached notification tasks have delivered `count` notifications.
pub async fn wait_for_notifications(notifier: &RecordingNotifier, count: usize) {
    for _ in 0..100 {
        if notifier.sent().len() >= count {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!(
        "expected {count} notifications, got {}",
        notifier.sent().len()
    );
}

/// In-memory store that can answer the first score read late and refuse
/// rating writes.
pub struct FlakyStore {
    inner: Arc<InMemoryStore>,
    stale_first_scores: Option<Duration>,
    fail_rating_patches: bool,
    score_reads: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            stale_first_scores: None,
            fail_rating_patches: false,
            score_reads: AtomicUsize::new(0),
        }
    }

    /// The first score read returns what it saw, but only after `delay`.
    pub fn stale_first_scores(mut self, delay: Duration) -> Self {
        self.stale_first_scores = Some(delay);
        self
    }

    pub fn failing_rating_patches(mut self) -> Self {
        self.fail_rating_patches = true;
        self
    }

    pub fn score_reads(&self) -> usize {
        self.score_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RideStore for FlakyStore {
    async fn insert_ride(&self, ride: &Ride) -> StoreResult<()> {
        self.inner.insert_ride(ride).await
    }

    async fn get_ride(&self, id: RideId) -> StoreResult<Option<Ride>> {
        self.inner.get_ride(id).await
    }

    async fn update_ride_if(
        &self,
        id: RideId,
        guard: &RideGuard,
        update: &RideUpdate,
    ) -> StoreResult<CasOutcome> {
        self.inner.update_ride_if(id, guard, update).await
    }

    async fn put_driver(&self, driver: &Driver) -> StoreResult<()> {
        self.inner.put_driver(driver).await
    }

    async fn get_driver(&self, id: UserId) -> StoreResult<Option<Driver>> {
        self.inner.get_driver(id).await
    }

    async fn patch_driver(
        &self,
        id: UserId,
        patch: &DriverPatch,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Driver>> {
        if self.fail_rating_patches && patch.rating.is_some() {
            return Err(StoreError::backend("driver table unavailable"));
        }
        self.inner.patch_driver(id, patch, now).await
    }

    async fn find_available_drivers(
        &self,
        query: &ProximityQuery,
    ) -> StoreResult<Vec<DriverCandidate>> {
        self.inner.find_available_drivers(query).await
    }

    async fn rated_scores_for_driver(&self, driver: UserId) -> StoreResult<Vec<u8>> {
        let call = self.score_reads.fetch_add(1, Ordering::SeqCst);
        let scores = self.inner.rated_scores_for_driver(driver).await?;
        if call == 0 {
            if let Some(delay) = self.stale_first_scores {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(scores)
    }
}
