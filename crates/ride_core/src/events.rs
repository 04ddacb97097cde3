//! Events published on the real-time bus and the topics they are scoped to.

use std::fmt;

use chrono::{DateTime, Utc};
use h3o::CellIndex;
use serde::Serialize;

use crate::driver::Vehicle;
use crate::geo::{GeoPoint, REGION_RESOLUTION};
use crate::lifecycle::RideStatus;
use crate::ride::{Cancellation, Place, RideId, TrackingPoint, UserId, VehicleClass};

/// Delivery scope of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Everyone currently associated with a ride.
    Ride(RideId),
    /// One user's personal channel.
    User(UserId),
    /// Drivers on duty in one coarse H3 cell, and riders watching supply there.
    Region(CellIndex),
}

impl Topic {
    /// Region topic containing `point`, if the point is valid.
    pub fn region_of(point: GeoPoint) -> Option<Topic> {
        point.cell(REGION_RESOLUTION).ok().map(Topic::Region)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Ride(id) => write!(f, "ride:{id}"),
            Topic::User(id) => write!(f, "user:{id}"),
            Topic::Region(cell) => write!(f, "region:{cell}"),
        }
    }
}

/// Named real-time events. Serialized as `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RideEvent {
    RideAccepted {
        ride_id: RideId,
        driver_id: UserId,
        driver_name: String,
        vehicle: Vehicle,
        driver_rating: Option<f64>,
        driver_location: GeoPoint,
    },
    RideStatusUpdate {
        ride_id: RideId,
        status: RideStatus,
        at: DateTime<Utc>,
        cancellation: Option<Cancellation>,
    },
    RideLocationUpdate {
        ride_id: RideId,
        driver_id: UserId,
        point: TrackingPoint,
    },
    NewRideRequest {
        ride_id: RideId,
        pickup: Place,
        destination: Place,
        vehicle_class: VehicleClass,
        fare: f64,
        distance_to_pickup_km: f64,
        round: u32,
        expires_at: DateTime<Utc>,
    },
    DriverAvailabilityUpdate {
        driver_id: UserId,
        available: bool,
        location: GeoPoint,
        vehicle_class: VehicleClass,
    },
}

impl RideEvent {
    /// Wire name of the event.
    pub const fn name(&self) -> &'static str {
        match self {
            RideEvent::RideAccepted { .. } => "ride-accepted",
            RideEvent::RideStatusUpdate { .. } => "ride-status-update",
            RideEvent::RideLocationUpdate { .. } => "ride-location-update",
            RideEvent::NewRideRequest { .. } => "new-ride-request",
            RideEvent::DriverAvailabilityUpdate { .. } => "driver-availability-update",
        }
    }

    /// Ride the event concerns, if any.
    pub const fn ride_id(&self) -> Option<RideId> {
        match self {
            RideEvent::RideAccepted { ride_id, .. }
            | RideEvent::RideStatusUpdate { ride_id, .. }
            | RideEvent::RideLocationUpdate { ride_id, .. }
            | RideEvent::NewRideRequest { ride_id, .. } => Some(*ride_id),
            RideEvent::DriverAvailabilityUpdate { .. } => None,
        }
    }
}

/// An event as delivered to one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub topic: Topic,
    pub event: RideEvent,
}

impl Envelope {
    /// Wire form handed to the transport.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&serde_json::json!({
            "topic": self.topic.to_string(),
            "event": self.event,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_wire_names() {
        let ride_id = RideId::new();
        let event = RideEvent::RideStatusUpdate {
            ride_id,
            status: RideStatus::Arrived,
            at: Utc::now(),
            cancellation: None,
        };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["event"], "ride-status-update");
        assert_eq!(json["data"]["status"], "arrived");
        assert_eq!(event.name(), "ride-status-update");
        assert_eq!(event.ride_id(), Some(ride_id));
    }

    #[test]
    fn envelope_carries_topic() {
        let driver_id = UserId::new();
        let envelope = Envelope {
            topic: Topic::User(driver_id),
            event: RideEvent::DriverAvailabilityUpdate {
                driver_id,
                available: true,
                location: GeoPoint::new(12.9, 77.6).expect("point"),
                vehicle_class: VehicleClass::Auto,
            },
        };
        let json: serde_json::Value =
            serde_json::from_str(&envelope.to_json().expect("json")).expect("parse");
        assert_eq!(json["topic"], format!("user:{driver_id}"));
        assert_eq!(json["event"]["event"], "driver-availability-update");
    }
}
