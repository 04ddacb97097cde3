//! In-memory store implementation.
//!
//! [`InMemoryStore`] keeps rides in a map guarded by an `RwLock` and drivers
//! in a [`DriverIndex`] that buckets them by H3 cell for proximity queries.
//!
//! ## Limitations
//!
//! - No durability: all state is lost when the process exits
//! - Single-process only: the conditional update is atomic within this process

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use h3o::CellIndex;

use super::{
    CasOutcome, DriverCandidate, ProximityQuery, RideGuard, RideStore, RideUpdate, StoreError,
    StoreResult,
};
use crate::driver::{Driver, DriverPatch};
use crate::geo::{disk_covering, INDEX_RESOLUTION};
use crate::lifecycle::RideStatus;
use crate::ride::{Ride, RideId, UserId};

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Poisoned
}

/// Driver records plus an H3 cell → driver mapping.
///
/// Drivers whose location cannot be indexed are kept but never returned by
/// proximity queries.
#[derive(Debug, Default)]
pub struct DriverIndex {
    drivers: HashMap<UserId, Driver>,
    drivers_by_cell: HashMap<CellIndex, Vec<UserId>>,
    driver_to_cell: HashMap<UserId, CellIndex>,
}

impl DriverIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn get(&self, id: UserId) -> Option<&Driver> {
        self.drivers.get(&id)
    }

    /// Inserts or replaces a driver and re-indexes its cell.
    pub fn upsert(&mut self, driver: Driver) {
        let new_cell = driver.location.cell(INDEX_RESOLUTION).ok();
        let old_cell = self.driver_to_cell.get(&driver.id).copied();
        if old_cell != new_cell {
            if let Some(old) = old_cell {
                self.remove_from_cell(driver.id, old);
                self.driver_to_cell.remove(&driver.id);
            }
            if let Some(new) = new_cell {
                self.drivers_by_cell.entry(new).or_default().push(driver.id);
                self.driver_to_cell.insert(driver.id, new);
            }
        }
        self.drivers.insert(driver.id, driver);
    }

    pub fn remove(&mut self, id: UserId) -> Option<Driver> {
        if let Some(cell) = self.driver_to_cell.remove(&id) {
            self.remove_from_cell(id, cell);
        }
        self.drivers.remove(&id)
    }

    fn remove_from_cell(&mut self, id: UserId, cell: CellIndex) {
        if let Some(ids) = self.drivers_by_cell.get_mut(&cell) {
            ids.retain(|d| *d != id);
            if ids.is_empty() {
                self.drivers_by_cell.remove(&cell);
            }
        }
    }

    /// Drivers in any of the given cells.
    pub fn drivers_in_cells<'a>(
        &'a self,
        cells: &'a [CellIndex],
    ) -> impl Iterator<Item = &'a Driver> + 'a {
        cells
            .iter()
            .filter_map(|cell| self.drivers_by_cell.get(cell))
            .flatten()
            .filter_map(|id| self.drivers.get(id))
    }

    /// Runs a proximity query against the index.
    pub fn nearby(&self, query: &ProximityQuery) -> Vec<DriverCandidate> {
        let Ok(center_cell) = query.center.cell(INDEX_RESOLUTION) else {
            return Vec::new();
        };
        let cells = disk_covering(center_cell, query.radius_km);
        let mut candidates: Vec<DriverCandidate> = self
            .drivers_in_cells(&cells)
            .filter(|d| d.available && d.vehicle.class == query.vehicle_class)
            .filter(|d| !query.exclude.contains(&d.id))
            .filter_map(|d| {
                let distance_km = query.center.distance_km(&d.location);
                (distance_km <= query.radius_km).then(|| DriverCandidate {
                    driver: d.clone(),
                    distance_km,
                })
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.distance_km
                .partial_cmp(&b.distance_km)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.driver.id.cmp(&b.driver.id))
        });
        candidates.truncate(query.limit);
        candidates
    }
}

/// Thread-safe in-memory [`RideStore`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    rides: RwLock<HashMap<RideId, Ride>>,
    drivers: RwLock<DriverIndex>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rides currently stored.
    pub fn ride_count(&self) -> StoreResult<usize> {
        Ok(self.rides.read().map_err(poison_err)?.len())
    }

    pub fn driver_count(&self) -> StoreResult<usize> {
        Ok(self.drivers.read().map_err(poison_err)?.len())
    }
}

#[async_trait]
impl RideStore for InMemoryStore {
    async fn insert_ride(&self, ride: &Ride) -> StoreResult<()> {
        let mut rides = self.rides.write().map_err(poison_err)?;
        if rides.contains_key(&ride.id) {
            return Err(StoreError::DuplicateRide(ride.id));
        }
        rides.insert(ride.id, ride.clone());
        Ok(())
    }

    async fn get_ride(&self, id: RideId) -> StoreResult<Option<Ride>> {
        let rides = self.rides.read().map_err(poison_err)?;
        Ok(rides.get(&id).cloned())
    }

    async fn update_ride_if(
        &self,
        id: RideId,
        guard: &RideGuard,
        update: &RideUpdate,
    ) -> StoreResult<CasOutcome> {
        let mut rides = self.rides.write().map_err(poison_err)?;
        let Some(ride) = rides.get_mut(&id) else {
            return Ok(CasOutcome::NotFound);
        };
        if !guard.matches(ride) {
            return Ok(CasOutcome::PreconditionFailed(ride.clone()));
        }
        update.apply(ride);
        Ok(CasOutcome::Applied(ride.clone()))
    }

    async fn put_driver(&self, driver: &Driver) -> StoreResult<()> {
        self.drivers
            .write()
            .map_err(poison_err)?
            .upsert(driver.clone());
        Ok(())
    }

    async fn get_driver(&self, id: UserId) -> StoreResult<Option<Driver>> {
        let drivers = self.drivers.read().map_err(poison_err)?;
        Ok(drivers.get(id).cloned())
    }

    async fn patch_driver(
        &self,
        id: UserId,
        patch: &DriverPatch,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Driver>> {
        let mut drivers = self.drivers.write().map_err(poison_err)?;
        let Some(mut driver) = drivers.get(id).cloned() else {
            return Ok(None);
        };
        patch.apply(&mut driver, now);
        drivers.upsert(driver.clone());
        Ok(Some(driver))
    }

    async fn find_available_drivers(
        &self,
        query: &ProximityQuery,
    ) -> StoreResult<Vec<DriverCandidate>> {
        let drivers = self.drivers.read().map_err(poison_err)?;
        Ok(drivers.nearby(query))
    }

    async fn rated_scores_for_driver(&self, driver: UserId) -> StoreResult<Vec<u8>> {
        let rides = self.rides.read().map_err(poison_err)?;
        Ok(rides
            .values()
            .filter(|r| r.driver == Some(driver) && r.status == RideStatus::Completed)
            .filter_map(|r| r.rating.as_ref().map(|rating| rating.score))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoPoint;
    use crate::ride::VehicleClass;
    use crate::store::DriverGuard;
    use crate::test_helpers::{sample_driver, sample_request, sample_ride, TEST_PICKUP};

    fn query(radius_km: f64, class: VehicleClass) -> ProximityQuery {
        ProximityQuery {
            center: TEST_PICKUP,
            radius_km,
            vehicle_class: class,
            limit: 20,
            exclude: Vec::new(),
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let store = InMemoryStore::new();
        let ride = sample_ride(sample_request());
        store.insert_ride(&ride).await.expect("insert");
        assert!(matches!(
            store.insert_ride(&ride).await,
            Err(StoreError::DuplicateRide(_))
        ));
    }

    #[tokio::test]
    async fn conditional_update_reports_current_state_on_mismatch() {
        let store = InMemoryStore::new();
        let ride = sample_ride(sample_request());
        store.insert_ride(&ride).await.expect("insert");

        let guard = RideGuard::status_is(RideStatus::Accepted);
        let update = RideUpdate::transition(RideStatus::Arrived, Utc::now());
        let outcome = store.update_ride_if(ride.id, &guard, &update).await.expect("cas");
        match outcome {
            CasOutcome::PreconditionFailed(current) => {
                assert_eq!(current.status, RideStatus::Pending)
            }
            other => panic!("expected precondition failure, got {other:?}"),
        }

        let missing = store
            .update_ride_if(RideId::new(), &guard, &update)
            .await
            .expect("cas");
        assert_eq!(missing, CasOutcome::NotFound);
    }

    #[tokio::test]
    async fn second_claim_fails_after_first_applies() {
        let store = InMemoryStore::new();
        let ride = sample_ride(sample_request());
        store.insert_ride(&ride).await.expect("insert");
        let guard =
            RideGuard::status_in(&RideStatus::CLAIMABLE).with_driver(DriverGuard::Unassigned);
        let claim_by =
            |driver| RideUpdate::transition(RideStatus::Accepted, Utc::now()).with_driver(driver);

        let first = UserId::new();
        let second = UserId::new();
        let a = store.update_ride_if(ride.id, &guard, &claim_by(first)).await.expect("cas");
        let b = store.update_ride_if(ride.id, &guard, &claim_by(second)).await.expect("cas");
        assert!(matches!(a, CasOutcome::Applied(_)));
        assert!(matches!(b, CasOutcome::PreconditionFailed(r) if r.driver == Some(first)));
    }

    #[tokio::test]
    async fn proximity_orders_by_distance_and_filters() {
        let store = InMemoryStore::new();
        let near = sample_driver(GeoPoint::new(12.905, 77.6).expect("point"), VehicleClass::Car);
        let far = sample_driver(GeoPoint::new(12.96, 77.6).expect("point"), VehicleClass::Car);
        let out_of_range =
            sample_driver(GeoPoint::new(13.2, 77.6).expect("point"), VehicleClass::Car);
        let wrong_class =
            sample_driver(GeoPoint::new(12.901, 77.6).expect("point"), VehicleClass::Bike);
        let mut busy =
            sample_driver(GeoPoint::new(12.902, 77.6).expect("point"), VehicleClass::Car);
        busy.available = false;
        for d in [&far, &near, &out_of_range, &wrong_class, &busy] {
            store.put_driver(d).await.expect("put");
        }

        let found = store
            .find_available_drivers(&query(10.0, VehicleClass::Car))
            .await
            .expect("query");
        let ids: Vec<_> = found.iter().map(|c| c.driver.id).collect();
        assert_eq!(ids, vec![near.id, far.id]);
        assert!(found[0].distance_km < found[1].distance_km);

        let mut excluding = query(10.0, VehicleClass::Car);
        excluding.exclude.push(near.id);
        excluding.limit = 1;
        let found = store.find_available_drivers(&excluding).await.expect("query");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].driver.id, far.id);
    }

    #[test]
    fn nearby_finds_drivers_on_the_whole_radius_edge() {
        let center = GeoPoint::new(60.17, 24.94).expect("point");
        for radius_km in [10.0, 22.5, 30.0] {
            let mut index = DriverIndex::new();
            for step in 0..72 {
                let location = center.destination(f64::from(step) * 5.0, radius_km * 0.995);
                index.upsert(sample_driver(location, VehicleClass::Car));
            }
            let found = index.nearby(&ProximityQuery {
                center,
                radius_km,
                vehicle_class: VehicleClass::Car,
                limit: 100,
                exclude: Vec::new(),
            });
            assert_eq!(found.len(), 72, "radius {radius_km}");
        }
    }

    #[tokio::test]
    async fn patch_moves_driver_between_cells() {
        let store = InMemoryStore::new();
        let driver = sample_driver(GeoPoint::new(13.3, 77.6).expect("point"), VehicleClass::Car);
        store.put_driver(&driver).await.expect("put");
        assert!(store
            .find_available_drivers(&query(10.0, VehicleClass::Car))
            .await
            .expect("query")
            .is_empty());

        let patched = store
            .patch_driver(driver.id, &DriverPatch::location(TEST_PICKUP), Utc::now())
            .await
            .expect("patch")
            .expect("driver exists");
        assert_eq!(patched.location, TEST_PICKUP);
        let found = store
            .find_available_drivers(&query(10.0, VehicleClass::Car))
            .await
            .expect("query");
        assert_eq!(found.len(), 1);

        assert!(store
            .patch_driver(UserId::new(), &DriverPatch::availability(false), Utc::now())
            .await
            .expect("patch")
            .is_none());
    }
}
