//! Test helpers for common test setup and utilities.
//!
//! This module provides shared fixtures and a fully wired [`TestHarness`] so
//! unit tests, integration tests and benchmarks build rides the same way.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use crate::auth::{Principal, StaticIdentityProvider};
use crate::clock::ManualClock;
use crate::config::CoreConfig;
use crate::driver::{Driver, Vehicle};
use crate::error::Result;
use crate::fare::fare;
use crate::geo::GeoPoint;
use crate::notify::{Notification, Notifier, NotifyError};
use crate::ride::{Place, Ride, RideRequest, RouteEstimate, UserId, VehicleClass};
use crate::routing::{RouteError, RouteProvider};
use crate::service::{Collaborators, RideService};
use crate::store::memory::InMemoryStore;
use crate::store::RideStore;

/// Standard pickup used across tests (central Bengaluru).
pub const TEST_PICKUP: GeoPoint = GeoPoint { lat: 12.9, lng: 77.6 };

/// Standard destination, roughly 7.6 km from [`TEST_PICKUP`].
pub const TEST_DESTINATION: GeoPoint = GeoPoint { lat: 12.95, lng: 77.65 };

/// Route returned by [`FixedRouteProvider::default`].
pub const TEST_ROUTE: RouteEstimate = RouteEstimate {
    distance_km: 6.2,
    duration_min: 18.0,
};

/// A Car request from [`TEST_PICKUP`] to [`TEST_DESTINATION`].
pub fn sample_request() -> RideRequest {
    RideRequest::new(
        Place::new(TEST_PICKUP, "MG Road"),
        Place::new(TEST_DESTINATION, "Indiranagar"),
        VehicleClass::Car,
    )
}

/// A pending ride for `request` priced with [`TEST_ROUTE`].
pub fn sample_ride(request: RideRequest) -> Ride {
    let class = request.vehicle_class;
    Ride::new(
        UserId::new(),
        request,
        TEST_ROUTE,
        fare(TEST_ROUTE.distance_km, TEST_ROUTE.duration_min, class, 1.0),
        Utc::now(),
    )
}

pub fn sample_vehicle(class: VehicleClass) -> Vehicle {
    Vehicle {
        class,
        plate: "KA01AB1234".into(),
        model: "Swift".into(),
    }
}

/// An available driver of `class` at `point`.
pub fn sample_driver(point: GeoPoint, class: VehicleClass) -> Driver {
    Driver::new(UserId::new(), "Test Driver", point, sample_vehicle(class), Utc::now())
}

/// Returns the same estimate for every query, or fails when `estimate` is `None`.
#[derive(Debug, Clone, Copy)]
pub struct FixedRouteProvider {
    pub estimate: Option<RouteEstimate>,
}

impl FixedRouteProvider {
    pub fn failing() -> Self {
        Self { estimate: None }
    }
}

impl Default for FixedRouteProvider {
    fn default() -> Self {
        Self {
            estimate: Some(TEST_ROUTE),
        }
    }
}

#[async_trait]
impl RouteProvider for FixedRouteProvider {
    async fn estimate(
        &self,
        _from: GeoPoint,
        _to: GeoPoint,
    ) -> std::result::Result<RouteEstimate, RouteError> {
        self.estimate.ok_or(RouteError::NoRoute)
    }
}

/// Keeps every notification it is asked to send; optionally reports failure.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    pub fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::default(),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> std::result::Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(notification.clone());
        if self.fail {
            Err(NotifyError::Delivery("smtp unreachable".into()))
        } else {
            Ok(())
        }
    }
}

/// A [`RideService`] wired to in-memory collaborators that tests can reach into.
pub struct TestHarness {
    pub service: Arc<RideService>,
    pub store: Arc<InMemoryStore>,
    pub identity: Arc<StaticIdentityProvider>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(CoreConfig::default())
    }

    pub fn with_config(config: CoreConfig) -> Self {
        Self::build(config, FixedRouteProvider::default(), RecordingNotifier::default())
    }

    pub fn build(
        config: CoreConfig,
        routes: FixedRouteProvider,
        notifier: RecordingNotifier,
    ) -> Self {
        Self::assemble(config, routes, notifier, |store| store)
    }

    /// Routes every store call through `layer`, which wraps the in-memory
    /// store that [`TestHarness::store`] still exposes directly.
    pub fn with_store_layer(
        config: CoreConfig,
        layer: impl FnOnce(Arc<InMemoryStore>) -> Arc<dyn RideStore>,
    ) -> Self {
        Self::assemble(
            config,
            FixedRouteProvider::default(),
            RecordingNotifier::default(),
            layer,
        )
    }

    fn assemble(
        config: CoreConfig,
        routes: FixedRouteProvider,
        notifier: RecordingNotifier,
        layer: impl FnOnce(Arc<InMemoryStore>) -> Arc<dyn RideStore>,
    ) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let identity = Arc::new(StaticIdentityProvider::new());
        let notifier = Arc::new(notifier);
        let clock = Arc::new(ManualClock::default());
        let collaborators = Collaborators::new(identity.clone())
            .with_store(layer(store.clone()))
            .with_routes(Arc::new(routes))
            .with_notifier(notifier.clone())
            .with_clock(clock.clone());
        Self {
            service: Arc::new(RideService::new(config, collaborators)),
            store,
            identity,
            notifier,
            clock,
        }
    }

    /// Registers a requester reachable with `token`.
    pub fn add_requester(&self, token: &str) -> Principal {
        let principal = Principal::requester(UserId::new());
        self.identity.insert(token, principal.clone());
        principal
    }

    /// Registers a driver reachable with `token` and stores an available driver record.
    pub async fn add_driver(
        &self,
        token: &str,
        point: GeoPoint,
        class: VehicleClass,
    ) -> Result<Principal> {
        let principal = Principal::driver(UserId::new());
        self.identity.insert(token, principal.clone());
        self.service
            .register_driver(&principal, token, point, sample_vehicle(class))
            .await?;
        Ok(principal)
    }

    /// Submits [`sample_request`] for `requester`.
    pub async fn request_sample_ride(&self, requester: &Principal) -> Result<Ride> {
        self.service.request_ride(requester, sample_request()).await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixtures_are_valid() {
        assert!(TEST_PICKUP.validate().is_ok());
        assert!(TEST_DESTINATION.validate().is_ok());
        assert!(sample_request().validate(Utc::now()).is_ok());
    }
}
