//! Pluggable storage for rides and drivers.
//!
//! The core needs two atomic primitives from a store:
//!
//! - **Conditional update**: apply a [`RideUpdate`] only if the ride still
//!   satisfies a [`RideGuard`], as one atomic step
//! - **Proximity query**: available drivers of a class near a point, nearest first
//!
//! Every ride transition is a single conditional update, so a crash never
//! leaves a driver assigned without the matching status or the other way round.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::driver::{Driver, DriverPatch};
use crate::geo::GeoPoint;
use crate::lifecycle::RideStatus;
use crate::ride::{Cancellation, Ride, RideId, RideRating, TrackingPoint, UserId, VehicleClass};

/// Errors raised by a store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("lock poisoned")]
    Poisoned,

    #[error("ride {0} already exists")]
    DuplicateRide(RideId),

    #[error("backend failure: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Precondition on the ride's `driver` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverGuard {
    Any,
    Unassigned,
    AssignedTo(UserId),
}

/// Precondition a ride must satisfy for a conditional update to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct RideGuard {
    pub statuses: Vec<RideStatus>,
    pub driver: DriverGuard,
    /// Require that no rating has been recorded yet.
    pub unrated: bool,
    /// Require every tracking entry to be recorded at or before this time.
    pub tracking_not_after: Option<DateTime<Utc>>,
}

impl RideGuard {
    pub fn status_in(statuses: &[RideStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            driver: DriverGuard::Any,
            unrated: false,
            tracking_not_after: None,
        }
    }

    pub fn status_is(status: RideStatus) -> Self {
        Self::status_in(&[status])
    }

    pub fn with_driver(mut self, driver: DriverGuard) -> Self {
        self.driver = driver;
        self
    }

    pub fn unrated(mut self) -> Self {
        self.unrated = true;
        self
    }

    pub fn tracking_not_after(mut self, at: DateTime<Utc>) -> Self {
        self.tracking_not_after = Some(at);
        self
    }

    /// Evaluates the guard against the current record.
    pub fn matches(&self, ride: &Ride) -> bool {
        if !self.statuses.contains(&ride.status) {
            return false;
        }
        let driver_ok = match self.driver {
            DriverGuard::Any => true,
            DriverGuard::Unassigned => ride.driver.is_none(),
            DriverGuard::AssignedTo(id) => ride.driver == Some(id),
        };
        if !driver_ok {
            return false;
        }
        if self.unrated && ride.rating.is_some() {
            return false;
        }
        if let Some(at) = self.tracking_not_after {
            if ride.tracking.last().is_some_and(|p| p.recorded_at > at) {
                return false;
            }
        }
        true
    }
}

/// Fields written by a conditional update. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RideUpdate {
    /// New status and the time it was entered.
    pub status: Option<(RideStatus, DateTime<Utc>)>,
    pub driver: Option<UserId>,
    pub cancellation: Option<Cancellation>,
    pub rating: Option<RideRating>,
    pub append_tracking: Option<TrackingPoint>,
    pub final_amount: Option<f64>,
    pub finalize_pricing: bool,
}

impl RideUpdate {
    pub fn transition(status: RideStatus, at: DateTime<Utc>) -> Self {
        Self {
            status: Some((status, at)),
            ..Self::default()
        }
    }

    pub fn with_driver(mut self, driver: UserId) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    pub fn with_final_amount(mut self, amount: f64) -> Self {
        self.final_amount = Some(amount);
        self
    }

    pub fn finalizing(mut self) -> Self {
        self.finalize_pricing = true;
        self
    }

    pub fn rating(rating: RideRating) -> Self {
        Self {
            rating: Some(rating),
            ..Self::default()
        }
    }

    pub fn tracking(point: TrackingPoint) -> Self {
        Self {
            append_tracking: Some(point),
            ..Self::default()
        }
    }

    /// Writes the update onto `ride`. Callers must have checked the guard.
    pub fn apply(&self, ride: &mut Ride) {
        if let Some((status, at)) = self.status {
            ride.status = status;
            ride.timeline.stamp(status, at);
        }
        if let Some(driver) = self.driver {
            ride.driver = Some(driver);
        }
        if let Some(cancellation) = &self.cancellation {
            ride.cancellation = Some(cancellation.clone());
        }
        if let Some(rating) = &self.rating {
            ride.rating = Some(rating.clone());
        }
        if let Some(point) = self.append_tracking {
            ride.tracking.push(point);
        }
        if let Some(amount) = self.final_amount {
            ride.pricing.final_amount = amount;
        }
        if self.finalize_pricing {
            ride.pricing.finalized = true;
        }
    }
}

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The guard held; contains the updated ride.
    Applied(Ride),
    /// No ride with this id.
    NotFound,
    /// The guard did not hold; contains the ride as it currently is.
    PreconditionFailed(Ride),
}

/// Available drivers of one class around a point.
#[derive(Debug, Clone, PartialEq)]
pub struct ProximityQuery {
    pub center: GeoPoint,
    pub radius_km: f64,
    pub vehicle_class: VehicleClass,
    pub limit: usize,
    /// Drivers to leave out, e.g. those who already declined.
    pub exclude: Vec<UserId>,
}

/// A driver returned by a proximity query with the distance to the query point.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverCandidate {
    pub driver: Driver,
    pub distance_km: f64,
}

/// Storage abstraction for rides and drivers.
///
/// ## Conditional update semantics
///
/// `update_ride_if` is the only cross-request synchronization primitive the
/// core relies on. Implementations must evaluate the guard and apply the
/// update as one atomic step, so that of N concurrent callers racing on the
/// same precondition exactly one observes `Applied`.
#[async_trait]
pub trait RideStore: Send + Sync {
    /// Persists a new ride. Fails if the id already exists.
    async fn insert_ride(&self, ride: &Ride) -> StoreResult<()>;

    async fn get_ride(&self, id: RideId) -> StoreResult<Option<Ride>>;

    /// Atomically applies `update` if the ride matches `guard`.
    async fn update_ride_if(
        &self,
        id: RideId,
        guard: &RideGuard,
        update: &RideUpdate,
    ) -> StoreResult<CasOutcome>;

    /// Inserts or replaces a driver record.
    async fn put_driver(&self, driver: &Driver) -> StoreResult<()>;

    async fn get_driver(&self, id: UserId) -> StoreResult<Option<Driver>>;

    /// Applies a partial update, last write wins. Returns `None` for unknown drivers.
    async fn patch_driver(
        &self,
        id: UserId,
        patch: &DriverPatch,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Driver>>;

    /// Available drivers matching the query, nearest first, at most `limit`.
    async fn find_available_drivers(
        &self,
        query: &ProximityQuery,
    ) -> StoreResult<Vec<DriverCandidate>>;

    /// Scores of every completed, rated ride of the driver.
    async fn rated_scores_for_driver(&self, driver: UserId) -> StoreResult<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{sample_request, sample_ride};

    #[test]
    fn guard_checks_status_and_driver() {
        let mut ride = sample_ride(sample_request());
        let claim =
            RideGuard::status_in(&RideStatus::CLAIMABLE).with_driver(DriverGuard::Unassigned);
        assert!(claim.matches(&ride));

        ride.driver = Some(UserId::new());
        assert!(!claim.matches(&ride));

        ride.status = RideStatus::Cancelled;
        assert!(!RideGuard::status_is(RideStatus::Pending).matches(&ride));
    }

    #[test]
    fn guard_rejects_second_rating() {
        let mut ride = sample_ride(sample_request());
        ride.status = RideStatus::Completed;
        let guard = RideGuard::status_is(RideStatus::Completed).unrated();
        assert!(guard.matches(&ride));
        ride.rating = Some(RideRating {
            score: 5,
            feedback: None,
            rated_at: Utc::now(),
        });
        assert!(!guard.matches(&ride));
    }

    #[test]
    fn update_stamps_transition_time() {
        let mut ride = sample_ride(sample_request());
        let now = Utc::now();
        let driver = UserId::new();
        RideUpdate::transition(RideStatus::Accepted, now)
            .with_driver(driver)
            .apply(&mut ride);
        assert_eq!(ride.status, RideStatus::Accepted);
        assert_eq!(ride.driver, Some(driver));
        assert_eq!(ride.timeline.accepted_at, Some(now));
    }
}
