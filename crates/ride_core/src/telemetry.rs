//! Telemetry / KPIs: dispatch counters and completed ride records.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Duration;
use serde::Serialize;

use crate::config::TelemetryConfig;
use crate::ride::{Ride, RideId, UserId};

/// One completed ride, recorded when the trip completes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedRideRecord {
    pub ride_id: RideId,
    pub requester: UserId,
    pub driver: UserId,
    pub fare: f64,
    pub requested_at_ms: i64,
    pub accepted_at_ms: i64,
    pub started_at_ms: i64,
    pub completed_at_ms: i64,
}

impl CompletedRideRecord {
    /// Builds a record from a completed ride; `None` if the ride never had a driver.
    pub fn from_ride(ride: &Ride) -> Option<Self> {
        let timeline = &ride.timeline;
        let completed_at = timeline.completed_at?;
        let accepted_at = timeline.accepted_at.unwrap_or(timeline.requested_at);
        Some(Self {
            ride_id: ride.id,
            requester: ride.requester,
            driver: ride.driver?,
            fare: ride.pricing.final_amount,
            requested_at_ms: timeline.requested_at.timestamp_millis(),
            accepted_at_ms: accepted_at.timestamp_millis(),
            started_at_ms: timeline.started_at.unwrap_or(accepted_at).timestamp_millis(),
            completed_at_ms: completed_at.timestamp_millis(),
        })
    }

    /// Time from request to driver acceptance.
    pub fn time_to_match(&self) -> Duration {
        Duration::milliseconds((self.accepted_at_ms - self.requested_at_ms).max(0))
    }

    /// Time from driver acceptance to trip start.
    pub fn time_to_pickup(&self) -> Duration {
        Duration::milliseconds((self.started_at_ms - self.accepted_at_ms).max(0))
    }

    /// Time from pickup to dropoff.
    pub fn trip_duration(&self) -> Duration {
        Duration::milliseconds((self.completed_at_ms - self.started_at_ms).max(0))
    }
}

/// Aggregated counts at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchCounts {
    pub rides_requested: u64,
    pub offer_rounds: u64,
    pub offers_sent: u64,
    pub rides_accepted: u64,
    pub lost_accept_races: u64,
    pub no_driver_found: u64,
    pub rides_completed: u64,
    pub rides_cancelled: u64,
}

/// Collects dispatch telemetry. Shared by the dispatch engine and the ride service.
///
/// Counters cover the whole process lifetime; only the most recent
/// completed-ride records are kept.
#[derive(Debug)]
pub struct DispatchTelemetry {
    rides_requested: AtomicU64,
    offer_rounds: AtomicU64,
    offers_sent: AtomicU64,
    rides_accepted: AtomicU64,
    lost_accept_races: AtomicU64,
    no_driver_found: AtomicU64,
    rides_completed: AtomicU64,
    rides_cancelled: AtomicU64,
    completed_rides: Mutex<VecDeque<CompletedRideRecord>>,
    record_capacity: usize,
}

impl DispatchTelemetry {
    pub fn new() -> Self {
        Self::with_record_capacity(TelemetryConfig::default().completed_ride_capacity)
    }

    /// Keeps at most `capacity` completed-ride records.
    pub fn with_record_capacity(capacity: usize) -> Self {
        Self {
            rides_requested: AtomicU64::new(0),
            offer_rounds: AtomicU64::new(0),
            offers_sent: AtomicU64::new(0),
            rides_accepted: AtomicU64::new(0),
            lost_accept_races: AtomicU64::new(0),
            no_driver_found: AtomicU64::new(0),
            rides_completed: AtomicU64::new(0),
            rides_cancelled: AtomicU64::new(0),
            completed_rides: Mutex::new(VecDeque::new()),
            record_capacity: capacity,
        }
    }

    pub(crate) fn ride_requested(&self) {
        self.rides_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn offer_round(&self, offers: usize) {
        self.offer_rounds.fetch_add(1, Ordering::Relaxed);
        self.offers_sent.fetch_add(offers as u64, Ordering::Relaxed);
    }

    pub(crate) fn ride_accepted(&self) {
        self.rides_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn lost_accept_race(&self) {
        self.lost_accept_races.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn no_driver_found(&self) {
        self.no_driver_found.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn ride_cancelled(&self) {
        self.rides_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn ride_completed(&self, ride: &Ride) {
        self.rides_completed.fetch_add(1, Ordering::Relaxed);
        if self.record_capacity == 0 {
            return;
        }
        if let Some(record) = CompletedRideRecord::from_ride(ride) {
            let mut records = self
                .completed_rides
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            while records.len() >= self.record_capacity {
                records.pop_front();
            }
            records.push_back(record);
        }
    }

    pub fn snapshot(&self) -> DispatchCounts {
        DispatchCounts {
            rides_requested: self.rides_requested.load(Ordering::Relaxed),
            offer_rounds: self.offer_rounds.load(Ordering::Relaxed),
            offers_sent: self.offers_sent.load(Ordering::Relaxed),
            rides_accepted: self.rides_accepted.load(Ordering::Relaxed),
            lost_accept_races: self.lost_accept_races.load(Ordering::Relaxed),
            no_driver_found: self.no_driver_found.load(Ordering::Relaxed),
            rides_completed: self.rides_completed.load(Ordering::Relaxed),
            rides_cancelled: self.rides_cancelled.load(Ordering::Relaxed),
        }
    }

    /// The most recent completed ride records, oldest first.
    pub fn completed_rides(&self) -> Vec<CompletedRideRecord> {
        self.completed_rides
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for DispatchTelemetry {
    fn default() -> Self {
        Self::new()
    }
}
