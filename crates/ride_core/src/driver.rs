//! Driver availability records and the partial update drivers send.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;
use crate::ride::{UserId, VehicleClass};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub class: VehicleClass,
    pub plate: String,
    pub model: String,
}

/// Rolling rating written back by the rating aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriverRating {
    /// Mean score, rounded to one decimal.
    pub average: f64,
    pub rated_rides: u32,
}

/// A driver's location, vehicle and whether they take offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub id: UserId,
    pub name: String,
    pub location: GeoPoint,
    pub vehicle: Vehicle,
    /// Accepting new offers. Cleared on acceptance, restored on completion or cancellation.
    pub available: bool,
    pub rating: Option<DriverRating>,
    pub updated_at: DateTime<Utc>,
}

impl Driver {
    pub fn new(
        id: UserId,
        name: impl Into<String>,
        location: GeoPoint,
        vehicle: Vehicle,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            location,
            vehicle,
            available: true,
            rating: None,
            updated_at: now,
        }
    }

    pub fn vehicle_class(&self) -> VehicleClass {
        self.vehicle.class
    }
}

/// Partial driver update: only the fields that are `Some` are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverPatch {
    pub location: Option<GeoPoint>,
    pub available: Option<bool>,
    pub vehicle: Option<Vehicle>,
    pub rating: Option<DriverRating>,
}

impl DriverPatch {
    pub fn location(point: GeoPoint) -> Self {
        Self {
            location: Some(point),
            ..Self::default()
        }
    }

    pub fn availability(available: bool) -> Self {
        Self {
            available: Some(available),
            ..Self::default()
        }
    }

    pub fn with_available(mut self, available: bool) -> Self {
        self.available = Some(available);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.location.is_none()
            && self.available.is_none()
            && self.vehicle.is_none()
            && self.rating.is_none()
    }

    /// Writes the present fields onto `driver` and stamps `updated_at`.
    pub fn apply(&self, driver: &mut Driver, now: DateTime<Utc>) {
        if let Some(location) = self.location {
            driver.location = location;
        }
        if let Some(available) = self.available {
            driver.available = available;
        }
        if let Some(vehicle) = &self.vehicle {
            driver.vehicle = vehicle.clone();
        }
        if let Some(rating) = self.rating {
            driver.rating = Some(rating);
        }
        driver.updated_at = now;
    }
}
