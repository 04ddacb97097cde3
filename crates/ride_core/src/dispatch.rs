//! Dispatch engine: offer rounds and the acceptance race.
//!
//! A round queries available drivers of the ride's class around the pickup,
//! ranks them, and sends each one a `new-ride-request` on their personal
//! channel. The first driver whose conditional update lands wins the ride;
//! every other claimant sees `RideUnavailable`.
//!
//! Rounds live only in memory. Expiry is enforced here, not by the store:
//! while a round is tracked only its non-declined candidates may accept, and
//! once it has expired every claimant is turned away until the next round.
//! An expired round is forgotten once it has been expired for
//! [`EXPIRED_ROUND_RETENTION`]; after that the conditional update alone
//! decides a claim on a ride that is still searching.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::auth::{Principal, Role};
use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::driver::DriverPatch;
use crate::error::{Result, RideError};
use crate::events::{RideEvent, Topic};
use crate::lifecycle::RideStatus;
use crate::matching::CostBasedRanking;
use crate::notify::{send_detached, Notification, Notifier};
use crate::ride::{Ride, RideId, UserId};
use crate::store::{CasOutcome, DriverGuard, ProximityQuery, RideGuard, RideStore, RideUpdate};
use crate::telemetry::DispatchTelemetry;

/// How long an expired round keeps turning away stale claimants.
pub const EXPIRED_ROUND_RETENTION: Duration = Duration::from_secs(300);

/// One broadcast of a ride to a set of candidate drivers.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferRound {
    pub ride_id: RideId,
    /// 1-based round number.
    pub round: u32,
    pub radius_km: f64,
    /// Drivers the offer was sent to, best ranked first.
    pub candidates: Vec<UserId>,
    /// Drivers who declined this ride in any round so far.
    pub declined: HashSet<UserId>,
    pub expires_at: Instant,
    /// Wall-clock expiry advertised to drivers.
    pub expires_at_utc: DateTime<Utc>,
}

impl OfferRound {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Every candidate has declined, or there were none.
    pub fn is_exhausted(&self) -> bool {
        self.candidates.iter().all(|id| self.declined.contains(id))
    }

    /// Whether `driver` holds a live offer in this round.
    pub fn can_accept(&self, driver: UserId, now: Instant) -> bool {
        !self.is_expired(now)
            && self.candidates.contains(&driver)
            && !self.declined.contains(&driver)
    }
}

/// How a search for a driver ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A driver accepted; contains the ride as it was when the search noticed.
    Accepted(Ride),
    /// Every round expired unanswered. The ride stays `searching`.
    NoDriverFound { rounds: u32 },
    /// The requester cancelled while the search was running.
    Cancelled(Ride),
}

struct TrackedRound {
    round: OfferRound,
    /// Woken on accept, cancel and exhausting declines.
    signal: Arc<Notify>,
}

pub struct DispatchEngine {
    store: Arc<dyn RideStore>,
    bus: EventBus,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<DispatchTelemetry>,
    config: DispatchConfig,
    ranking: CostBasedRanking,
    rounds: Mutex<HashMap<RideId, TrackedRound>>,
}

impl DispatchEngine {
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn RideStore>,
        bus: EventBus,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<DispatchTelemetry>,
    ) -> Self {
        Self {
            store,
            bus,
            notifier,
            clock,
            telemetry,
            config,
            ranking: CostBasedRanking::default(),
            rounds: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ranking(mut self, ranking: CostBasedRanking) -> Self {
        self.ranking = ranking;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    fn rounds(&self) -> MutexGuard<'_, HashMap<RideId, TrackedRound>> {
        self.rounds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The round currently tracked for `ride_id`, expired or not.
    pub fn current_round(&self, ride_id: RideId) -> Option<OfferRound> {
        self.rounds().get(&ride_id).map(|tracked| tracked.round.clone())
    }

    /// Opens the first offer round for a ride.
    pub async fn dispatch(&self, ride_id: RideId) -> Result<OfferRound> {
        self.dispatch_round(ride_id, 1).await
    }

    #[tracing::instrument(skip(self), fields(ride_id = %ride_id))]
    async fn dispatch_round(&self, ride_id: RideId, round: u32) -> Result<OfferRound> {
        let now = self.clock.now();
        let timeout = self.config.offer_timeout();
        let expiry = Instant::now().checked_add(timeout).zip(
            chrono::Duration::from_std(timeout)
                .ok()
                .and_then(|timeout| now.checked_add_signed(timeout)),
        );
        let Some((expires_at, expires_at_utc)) = expiry else {
            return Err(RideError::validation(format!(
                "offer timeout of {} ms is out of range",
                self.config.offer_timeout_ms
            )));
        };
        let ride = match self
            .store
            .update_ride_if(
                ride_id,
                &RideGuard::status_is(RideStatus::Pending),
                &RideUpdate::transition(RideStatus::Searching, now),
            )
            .await?
        {
            CasOutcome::Applied(ride) => {
                self.bus.publish(
                    Topic::Ride(ride_id),
                    RideEvent::RideStatusUpdate {
                        ride_id,
                        status: RideStatus::Searching,
                        at: now,
                        cancellation: None,
                    },
                );
                ride
            }
            CasOutcome::NotFound => return Err(RideError::RideNotFound(ride_id)),
            CasOutcome::PreconditionFailed(current) => match current.status {
                RideStatus::Searching => current,
                status if status.is_terminal() => return Err(RideError::AlreadyFinalized(ride_id)),
                _ => return Err(RideError::RideUnavailable(ride_id)),
            },
        };

        let declined = self
            .rounds()
            .get(&ride_id)
            .map(|tracked| tracked.round.declined.clone())
            .unwrap_or_default();
        let radius_km = self.config.radius_for_round(round.saturating_sub(1));
        let query = ProximityQuery {
            center: ride.pickup.point,
            radius_km,
            vehicle_class: ride.vehicle_class,
            limit: self.config.max_fanout,
            exclude: declined.iter().copied().collect(),
        };
        let found = self.store.find_available_drivers(&query).await?;
        let ranked = self.ranking.rank(found, self.config.max_fanout);

        for ranked in &ranked {
            let candidate = &ranked.candidate;
            self.bus.publish(
                Topic::User(candidate.driver.id),
                RideEvent::NewRideRequest {
                    ride_id,
                    pickup: ride.pickup.clone(),
                    destination: ride.destination.clone(),
                    vehicle_class: ride.vehicle_class,
                    fare: ride.pricing.final_amount,
                    distance_to_pickup_km: candidate.distance_km,
                    round,
                    expires_at: expires_at_utc,
                },
            );
        }

        let offer = OfferRound {
            ride_id,
            round,
            radius_km,
            candidates: ranked.iter().map(|r| r.candidate.driver.id).collect(),
            declined,
            expires_at,
            expires_at_utc,
        };
        {
            let mut rounds = self.rounds();
            let now = Instant::now();
            rounds.retain(|_, tracked| {
                now.saturating_duration_since(tracked.round.expires_at) < EXPIRED_ROUND_RETENTION
            });
            let signal = rounds
                .remove(&ride_id)
                .map(|tracked| tracked.signal)
                .unwrap_or_default();
            rounds.insert(
                ride_id,
                TrackedRound {
                    round: offer.clone(),
                    signal,
                },
            );
        }

        self.telemetry.offer_round(offer.candidates.len());
        tracing::info!(
            round,
            radius_km,
            candidates = offer.candidates.len(),
            "offer round opened"
        );
        Ok(offer)
    }

    /// Claims `ride_id` for the calling driver.
    ///
    /// Exactly one of any number of concurrent callers succeeds; the rest get
    /// `RideUnavailable`.
    #[tracing::instrument(
        skip(self, principal),
        fields(ride_id = %ride_id, driver_id = %principal.user_id)
    )]
    pub async fn accept(&self, principal: &Principal, ride_id: RideId) -> Result<Ride> {
        principal.ensure_role(Role::Driver)?;
        let driver = self
            .store
            .get_driver(principal.user_id)
            .await?
            .ok_or(RideError::DriverNotFound(principal.user_id))?;
        let ride = self
            .store
            .get_ride(ride_id)
            .await?
            .ok_or(RideError::RideNotFound(ride_id))?;

        if driver.vehicle_class() != ride.vehicle_class {
            return Err(RideError::VehicleMismatch {
                required: ride.vehicle_class,
                offered: driver.vehicle_class(),
            });
        }
        if !driver.available {
            return Err(RideError::validation("driver is not accepting rides"));
        }
        if let Some(tracked) = self.rounds().get(&ride_id) {
            if !tracked.round.can_accept(driver.id, Instant::now()) {
                tracing::debug!("no live offer for this driver");
                return Err(RideError::RideUnavailable(ride_id));
            }
        }

        let now = self.clock.now();
        let guard =
            RideGuard::status_in(&RideStatus::CLAIMABLE).with_driver(DriverGuard::Unassigned);
        let update = RideUpdate::transition(RideStatus::Accepted, now).with_driver(driver.id);
        let ride = match self.store.update_ride_if(ride_id, &guard, &update).await? {
            CasOutcome::Applied(ride) => ride,
            CasOutcome::NotFound => return Err(RideError::RideNotFound(ride_id)),
            CasOutcome::PreconditionFailed(current) => {
                self.telemetry.lost_accept_race();
                tracing::debug!(status = %current.status, "lost acceptance race");
                return Err(RideError::RideUnavailable(ride_id));
            }
        };

        if let Err(err) = self
            .store
            .patch_driver(driver.id, &DriverPatch::availability(false), now)
            .await
        {
            tracing::warn!(error = %err, "failed to mark driver unavailable");
        }
        self.close_round(ride_id);

        let accepted = RideEvent::RideAccepted {
            ride_id,
            driver_id: driver.id,
            driver_name: driver.name.clone(),
            vehicle: driver.vehicle.clone(),
            driver_rating: driver.rating.map(|r| r.average),
            driver_location: driver.location,
        };
        self.bus.publish(Topic::User(ride.requester), accepted.clone());
        self.bus.publish(Topic::Ride(ride_id), accepted);
        send_detached(
            Arc::clone(&self.notifier),
            Notification::RideAccepted {
                ride_id,
                requester: ride.requester,
                driver: driver.id,
            },
        );

        self.telemetry.ride_accepted();
        tracing::info!("ride accepted");
        Ok(ride)
    }

    /// Withdraws the calling driver from the current round.
    /// Declining a ride the driver was never offered is a no-op.
    pub fn decline(&self, principal: &Principal, ride_id: RideId) -> Result<()> {
        principal.ensure_role(Role::Driver)?;
        let mut rounds = self.rounds();
        if let Some(tracked) = rounds.get_mut(&ride_id) {
            if tracked.round.candidates.contains(&principal.user_id) {
                tracked.round.declined.insert(principal.user_id);
                tracing::debug!(%ride_id, driver_id = %principal.user_id, "offer declined");
                if tracked.round.is_exhausted() {
                    tracked.signal.notify_one();
                }
            }
        }
        Ok(())
    }

    /// Stops tracking a ride's round and wakes its search.
    pub(crate) fn close_round(&self, ride_id: RideId) {
        if let Some(tracked) = self.rounds().remove(&ride_id) {
            tracked.signal.notify_one();
        }
    }

    fn round_state(&self, ride_id: RideId) -> Option<(Arc<Notify>, Instant, bool)> {
        self.rounds().get(&ride_id).map(|tracked| {
            (
                Arc::clone(&tracked.signal),
                tracked.round.expires_at,
                tracked.round.is_exhausted(),
            )
        })
    }

    /// `Some` once the ride has left the searching states.
    async fn settled(&self, ride_id: RideId) -> Result<Option<DispatchOutcome>> {
        let ride = self
            .store
            .get_ride(ride_id)
            .await?
            .ok_or(RideError::RideNotFound(ride_id))?;
        Ok(match ride.status {
            RideStatus::Pending | RideStatus::Searching => None,
            RideStatus::Cancelled => Some(DispatchOutcome::Cancelled(ride)),
            _ => Some(DispatchOutcome::Accepted(ride)),
        })
    }

    /// Runs offer rounds with a widening radius until a driver accepts, the
    /// ride is cancelled, or every round has expired.
    #[tracing::instrument(skip(self), fields(ride_id = %ride_id))]
    pub async fn find_driver(&self, ride_id: RideId) -> Result<DispatchOutcome> {
        let max_rounds = self.config.max_rounds.max(1);
        for round in 1..=max_rounds {
            if let Some(outcome) = self.settled(ride_id).await? {
                return Ok(outcome);
            }
            match self.dispatch_round(ride_id, round).await {
                Ok(_) => {}
                Err(RideError::RideUnavailable(_) | RideError::AlreadyFinalized(_)) => {
                    if let Some(outcome) = self.settled(ride_id).await? {
                        return Ok(outcome);
                    }
                    return Err(RideError::RideUnavailable(ride_id));
                }
                Err(err) => return Err(err),
            }

            loop {
                let Some((signal, deadline, exhausted)) = self.round_state(ride_id) else {
                    break;
                };
                let notified = signal.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(outcome) = self.settled(ride_id).await? {
                    return Ok(outcome);
                }
                if exhausted {
                    tracing::debug!(round, "round exhausted");
                    break;
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    tracing::debug!(round, "round expired");
                    break;
                }
            }
        }

        if let Some(outcome) = self.settled(ride_id).await? {
            return Ok(outcome);
        }
        self.telemetry.no_driver_found();
        tracing::info!(rounds = max_rounds, "no driver found");
        Ok(DispatchOutcome::NoDriverFound { rounds: max_rounds })
    }
}
