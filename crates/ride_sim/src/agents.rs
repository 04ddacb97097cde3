//! Simulated drivers and riders.
//!
//! Every agent talks to the core the way a real client would: through its own
//! bus connection and the public service operations, never through the store.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ride_core::auth::Principal;
use ride_core::bus::Connection;
use ride_core::dispatch::DispatchOutcome;
use ride_core::driver::Vehicle;
use ride_core::events::RideEvent;
use ride_core::geo::GeoPoint;
use ride_core::ride::{Place, TrackingPoint};
use ride_core::{Ride, RideRequest, RideService, RideStatus, VehicleClass};

/// Berlin bounding box.
const LAT_RANGE: (f64, f64) = (52.34, 52.68);
const LNG_RANGE: (f64, f64) = (13.08, 13.76);

/// Offers further away than this are sometimes declined.
const PICKY_DISTANCE_KM: f64 = 5.0;
const TRACKING_SAMPLES: u32 = 3;
const TRIP_TIMEOUT: Duration = Duration::from_secs(30);

pub fn random_point(rng: &mut impl Rng) -> GeoPoint {
    GeoPoint {
        lat: rng.gen_range(LAT_RANGE.0..LAT_RANGE.1),
        lng: rng.gen_range(LNG_RANGE.0..LNG_RANGE.1),
    }
}

/// Mostly cars, with a sprinkling of the other classes.
fn random_class(rng: &mut impl Rng) -> VehicleClass {
    match rng.gen_range(0..10) {
        0 => VehicleClass::Bike,
        1 => VehicleClass::Auto,
        2 => VehicleClass::Suv,
        _ => VehicleClass::Car,
    }
}

pub fn random_vehicle(rng: &mut impl Rng, index: usize) -> Vehicle {
    let class = random_class(rng);
    let model = match class {
        VehicleClass::Bike => "Vespa Primavera",
        VehicleClass::Auto => "Bajaj RE",
        VehicleClass::Car => "VW Golf",
        VehicleClass::Suv => "Skoda Kodiaq",
    };
    Vehicle {
        class,
        plate: format!("B-RS {index:04}"),
        model: model.into(),
    }
}

fn lerp(from: GeoPoint, to: GeoPoint, t: f64) -> GeoPoint {
    GeoPoint {
        lat: from.lat + (to.lat - from.lat) * t,
        lng: from.lng + (to.lng - from.lng) * t,
    }
}

fn heading_deg(from: GeoPoint, to: GeoPoint) -> f64 {
    let bearing = (to.lng - from.lng).atan2(to.lat - from.lat).to_degrees();
    (bearing + 360.0) % 360.0
}

pub struct DriverAgent {
    service: Arc<RideService>,
    principal: Principal,
    connection: Connection,
    rng: StdRng,
}

impl DriverAgent {
    pub fn new(
        service: Arc<RideService>,
        principal: Principal,
        token: &str,
        seed: u64,
    ) -> ride_core::Result<Self> {
        let connection = service.connect(token)?;
        Ok(Self {
            service,
            principal,
            connection,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Answers offers until the connection closes.
    pub async fn run(mut self) {
        while let Some(envelope) = self.connection.recv().await {
            let RideEvent::NewRideRequest {
                ride_id,
                distance_to_pickup_km,
                ..
            } = envelope.event
            else {
                continue;
            };

            if distance_to_pickup_km > PICKY_DISTANCE_KM && self.rng.gen_bool(0.5) {
                if let Err(err) = self.service.decline_ride(&self.principal, ride_id) {
                    tracing::debug!(%ride_id, error = %err, "decline failed");
                }
                continue;
            }

            self.pause(5..40).await;
            match self.service.accept_ride(&self.principal, ride_id).await {
                Ok(ride) => {
                    if let Err(err) = self.drive(&ride).await {
                        tracing::warn!(%ride_id, error = %err, "trip aborted");
                    }
                    // offers that piled up while busy are stale by now
                    self.connection.drain();
                }
                Err(err) => tracing::debug!(%ride_id, error = %err, "offer lost"),
            }
        }
    }

    async fn pause(&mut self, millis: std::ops::Range<u64>) {
        let millis = self.rng.gen_range(millis);
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    async fn drive(&mut self, ride: &Ride) -> ride_core::Result<()> {
        let service = Arc::clone(&self.service);
        self.pause(10..50).await;
        service.mark_arrived(&self.principal, ride.id).await?;
        self.pause(5..20).await;
        service.start_trip(&self.principal, ride.id).await?;

        let (from, to) = (ride.pickup.point, ride.destination.point);
        for step in 1..=TRACKING_SAMPLES {
            self.pause(5..20).await;
            let point = TrackingPoint {
                location: lerp(from, to, f64::from(step) / f64::from(TRACKING_SAMPLES + 1)),
                speed_kmh: self.rng.gen_range(18.0..45.0),
                heading_deg: heading_deg(from, to),
                recorded_at: chrono::Utc::now(),
            };
            service.record_location(&self.principal, ride.id, point).await?;
        }

        self.pause(5..20).await;
        let completed = service.complete_trip(&self.principal, ride.id).await?;
        tracing::info!(
            ride_id = %completed.id,
            fare = completed.pricing.final_amount,
            "trip completed"
        );
        Ok(())
    }
}

#[derive(Debug)]
pub enum RiderOutcome {
    Completed,
    NoDriverFound,
    Cancelled,
    Failed(String),
}

pub struct RiderJourney {
    service: Arc<RideService>,
    principal: Principal,
    connection: Connection,
    rng: StdRng,
}

impl RiderJourney {
    pub fn new(
        service: Arc<RideService>,
        principal: Principal,
        token: &str,
        seed: u64,
    ) -> ride_core::Result<Self> {
        let connection = service.connect(token)?;
        Ok(Self {
            service,
            principal,
            connection,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub async fn run(mut self) -> RiderOutcome {
        match self.travel().await {
            Ok(outcome) => outcome,
            Err(err) => RiderOutcome::Failed(err.to_string()),
        }
    }

    async fn travel(&mut self) -> ride_core::Result<RiderOutcome> {
        let service = Arc::clone(&self.service);
        let request = RideRequest::new(
            Place::new(random_point(&mut self.rng), "Pickup"),
            Place::new(random_point(&mut self.rng), "Drop-off"),
            random_class(&mut self.rng),
        );
        let ride = service.request_ride(&self.principal, request).await?;
        service.join_ride_room(&self.connection, ride.id).await?;

        match service.find_driver(ride.id).await? {
            DispatchOutcome::Accepted(_) => {}
            DispatchOutcome::Cancelled(_) => return Ok(RiderOutcome::Cancelled),
            DispatchOutcome::NoDriverFound { rounds } => {
                tracing::info!(ride_id = %ride.id, rounds, "giving up");
                service
                    .cancel_ride(&self.principal, ride.id, Some("no driver found".into()))
                    .await?;
                return Ok(RiderOutcome::NoDriverFound);
            }
        }

        let finished = tokio::time::timeout(TRIP_TIMEOUT, self.wait_for_end()).await;
        match finished {
            Ok(Some(RideStatus::Completed)) => {}
            Ok(Some(_)) => return Ok(RiderOutcome::Cancelled),
            Ok(None) | Err(_) => {
                return Ok(RiderOutcome::Failed(format!("ride {} never finished", ride.id)))
            }
        }

        let score = self.rng.gen_range(3..=5);
        service.rate_ride(&self.principal, ride.id, score, None).await?;
        Ok(RiderOutcome::Completed)
    }

    /// Terminal status announced in the ride room.
    async fn wait_for_end(&mut self) -> Option<RideStatus> {
        while let Some(envelope) = self.connection.recv().await {
            if let RideEvent::RideStatusUpdate { status, .. } = envelope.event {
                if status.is_terminal() {
                    return Some(status);
                }
            }
        }
        None
    }
}
