//! The Ride record and the value types it is built from.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RideError};
use crate::fare::FareBreakdown;
use crate::geo::GeoPoint;
use crate::lifecycle::RideStatus;

/// Unique ride identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RideId(Uuid);

impl RideId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for RideId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RideId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a requester or driver, as resolved by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Vehicle category a rider requests and a driver operates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleClass {
    Bike,
    Auto,
    Car,
    Suv,
}

impl VehicleClass {
    /// Class whose rates apply when a rate table has no entry for a class.
    pub const DEFAULT: VehicleClass = VehicleClass::Car;

    pub const ALL: [VehicleClass; 4] = [
        VehicleClass::Bike,
        VehicleClass::Auto,
        VehicleClass::Car,
        VehicleClass::Suv,
    ];

    /// Maximum number of passengers the class carries.
    pub const fn seats(self) -> u8 {
        match self {
            VehicleClass::Bike => 1,
            VehicleClass::Auto => 3,
            VehicleClass::Car => 4,
            VehicleClass::Suv => 6,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            VehicleClass::Bike => "Bike",
            VehicleClass::Auto => "Auto",
            VehicleClass::Car => "Car",
            VehicleClass::Suv => "Suv",
        }
    }
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VehicleClass {
    type Err = RideError;

    fn from_str(s: &str) -> Result<Self> {
        VehicleClass::ALL
            .into_iter()
            .find(|class| class.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| RideError::validation(format!("unknown vehicle class: {s}")))
    }
}

/// A location with the address the rider typed or picked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub point: GeoPoint,
    pub address: String,
}

impl Place {
    pub fn new(point: GeoPoint, address: impl Into<String>) -> Self {
        Self {
            point,
            address: address.into(),
        }
    }
}

/// Distance and duration estimate returned by the route provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteEstimate {
    pub distance_km: f64,
    pub duration_min: f64,
}

/// Fare quoted at request time and the amount actually charged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub breakdown: FareBreakdown,
    /// Amount owed for the ride. Equal to `breakdown.total` unless adjusted.
    pub final_amount: f64,
    /// Set when the ride completes and the amount is locked.
    pub finalized: bool,
}

impl Pricing {
    pub fn quoted(breakdown: FareBreakdown) -> Self {
        Self {
            final_amount: breakdown.total,
            breakdown,
            finalized: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[default]
    Cash,
    Card,
    Wallet,
}

/// Timestamp of every transition the ride has gone through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideTimeline {
    pub requested_at: DateTime<Utc>,
    pub searching_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl RideTimeline {
    pub fn new(requested_at: DateTime<Utc>) -> Self {
        Self {
            requested_at,
            searching_at: None,
            accepted_at: None,
            arrived_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
        }
    }

    /// Records the time the ride entered `status`.
    pub fn stamp(&mut self, status: RideStatus, at: DateTime<Utc>) {
        let slot = match status {
            RideStatus::Pending => return,
            RideStatus::Searching => &mut self.searching_at,
            RideStatus::Accepted => &mut self.accepted_at,
            RideStatus::Arrived => &mut self.arrived_at,
            RideStatus::Started => &mut self.started_at,
            RideStatus::Completed => &mut self.completed_at,
            RideStatus::Cancelled => &mut self.cancelled_at,
        };
        *slot = Some(at);
    }
}

/// The requester's rating of the driver for one ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideRating {
    pub score: u8,
    pub feedback: Option<String>,
    pub rated_at: DateTime<Utc>,
}

/// One entry of the in-trip tracking log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackingPoint {
    pub location: GeoPoint,
    pub speed_kmh: f64,
    pub heading_deg: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelledBy {
    Requester,
    Driver,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancellation {
    pub actor: CancelledBy,
    pub reason: Option<String>,
    pub fee: f64,
    /// `final_amount - fee`; never negative.
    pub refund: f64,
    pub cancelled_at: DateTime<Utc>,
}

/// What a rider submits to request a ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideRequest {
    pub pickup: Place,
    pub destination: Place,
    pub vehicle_class: VehicleClass,
    pub passengers: u8,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub payment_method: PaymentMethod,
    /// Surge multiplier to quote with; `None` means 1.0.
    pub surge: Option<f64>,
}

impl RideRequest {
    pub fn new(pickup: Place, destination: Place, vehicle_class: VehicleClass) -> Self {
        Self {
            pickup,
            destination,
            vehicle_class,
            passengers: 1,
            scheduled_at: None,
            payment_method: PaymentMethod::default(),
            surge: None,
        }
    }

    pub fn with_passengers(mut self, passengers: u8) -> Self {
        self.passengers = passengers;
        self
    }

    pub fn with_surge(mut self, surge: f64) -> Self {
        self.surge = Some(surge);
        self
    }

    pub fn with_payment_method(mut self, method: PaymentMethod) -> Self {
        self.payment_method = method;
        self
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Checks the request against everything that can be judged without I/O.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        self.pickup.point.validate()?;
        self.destination.point.validate()?;
        if self.pickup.point == self.destination.point {
            return Err(RideError::validation(
                "pickup and destination must differ",
            ));
        }
        if self.passengers == 0 || self.passengers > self.vehicle_class.seats() {
            return Err(RideError::validation(format!(
                "{} passengers do not fit a {} (max {})",
                self.passengers,
                self.vehicle_class,
                self.vehicle_class.seats()
            )));
        }
        if let Some(surge) = self.surge {
            if !surge.is_finite() || surge < 1.0 {
                return Err(RideError::validation(format!(
                    "surge multiplier must be >= 1.0, got {surge}"
                )));
            }
        }
        if let Some(at) = self.scheduled_at {
            if at < now {
                return Err(RideError::validation("scheduled time is in the past"));
            }
        }
        Ok(())
    }
}

/// One transportation request from creation to terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    pub id: RideId,
    pub requester: UserId,
    pub driver: Option<UserId>,
    pub vehicle_class: VehicleClass,
    pub pickup: Place,
    pub destination: Place,
    pub route: RouteEstimate,
    pub pricing: Pricing,
    pub passengers: u8,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub payment_method: PaymentMethod,
    pub status: RideStatus,
    pub timeline: RideTimeline,
    pub rating: Option<RideRating>,
    pub tracking: Vec<TrackingPoint>,
    pub cancellation: Option<Cancellation>,
}

impl Ride {
    /// Builds a new `pending` ride from a validated request.
    pub fn new(
        requester: UserId,
        request: RideRequest,
        route: RouteEstimate,
        fare: FareBreakdown,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RideId::new(),
            requester,
            driver: None,
            vehicle_class: request.vehicle_class,
            pickup: request.pickup,
            destination: request.destination,
            route,
            pricing: Pricing::quoted(fare),
            passengers: request.passengers,
            scheduled_at: request.scheduled_at,
            payment_method: request.payment_method,
            status: RideStatus::Pending,
            timeline: RideTimeline::new(now),
            rating: None,
            tracking: Vec::new(),
            cancellation: None,
        }
    }

    /// Whether `user` is the requester or the assigned driver.
    pub fn is_party(&self, user: UserId) -> bool {
        self.requester == user || self.driver == Some(user)
    }

    pub fn is_assigned_to(&self, user: UserId) -> bool {
        self.driver == Some(user)
    }
}
