//! Ride lifecycle operations.
//!
//! [`RideService`] owns the collaborators and exposes every caller-facing
//! operation. Each state change is one conditional store update followed by
//! bus events and, where relevant, a detached durable notification.
//!
//! ```text
//! request_ride ─▶ pending ─dispatch─▶ searching ─accept─▶ accepted
//!                                                           │ mark_arrived
//!                                                           ▼
//!                              completed ◀─complete_trip─ started ◀─start_trip─ arrived
//! ```

use std::sync::Arc;

use crate::auth::{IdentityProvider, Principal, Role};
use crate::bus::{Connection, EventBus};
use crate::clock::{Clock, SystemClock};
use crate::config::CoreConfig;
use crate::dispatch::{DispatchEngine, DispatchOutcome, OfferRound};
use crate::driver::{Driver, DriverPatch, Vehicle};
use crate::error::{Result, RideError};
use crate::events::{RideEvent, Topic};
use crate::geo::GeoPoint;
use crate::lifecycle::RideStatus;
use crate::notify::{send_detached, Notification, Notifier, TracingNotifier};
use crate::rating::RatingAggregator;
use crate::ride::{
    Cancellation, CancelledBy, Ride, RideId, RideRating, RideRequest, TrackingPoint, UserId,
};
use crate::routing::{build_route_provider, HaversineRouteProvider, RouteProvider};
use crate::store::memory::InMemoryStore;
use crate::store::{CasOutcome, DriverGuard, RideGuard, RideStore, RideUpdate};
use crate::telemetry::DispatchTelemetry;

/// Upper bound on re-reads when a cancellation races another transition.
const CANCEL_ATTEMPTS: usize = 8;

/// External systems the service talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn RideStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub routes: Arc<dyn RouteProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// In-memory store, haversine routing, logged notifications, system clock.
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            identity,
            routes: Arc::new(HaversineRouteProvider::default()),
            notifier: Arc::new(TracingNotifier),
            clock: Arc::new(SystemClock),
        }
    }

    /// Like [`Collaborators::new`] with the route provider named in `config`.
    pub fn from_config(identity: Arc<dyn IdentityProvider>, config: &CoreConfig) -> Result<Self> {
        let routes = build_route_provider(&config.routing)
            .map_err(|err| RideError::RouteUnavailable(err.to_string()))?;
        Ok(Self::new(identity).with_routes(Arc::from(routes)))
    }

    pub fn with_store(mut self, store: Arc<dyn RideStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_routes(mut self, routes: Arc<dyn RouteProvider>) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub struct RideService {
    config: CoreConfig,
    store: Arc<dyn RideStore>,
    identity: Arc<dyn IdentityProvider>,
    routes: Arc<dyn RouteProvider>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    dispatcher: DispatchEngine,
    ratings: RatingAggregator,
    telemetry: Arc<DispatchTelemetry>,
}

impl RideService {
    pub fn new(config: CoreConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            store,
            identity,
            routes,
            notifier,
            clock,
        } = collaborators;
        let telemetry = Arc::new(DispatchTelemetry::with_record_capacity(
            config.telemetry.completed_ride_capacity,
        ));
        let bus = EventBus::new(Arc::clone(&identity), config.bus);
        let dispatcher = DispatchEngine::new(
            config.dispatch,
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&notifier),
            Arc::clone(&clock),
            Arc::clone(&telemetry),
        );
        let ratings = RatingAggregator::new(Arc::clone(&store), Arc::clone(&clock));
        Self {
            config,
            store,
            identity,
            routes,
            notifier,
            clock,
            bus,
            dispatcher,
            ratings,
            telemetry,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn dispatcher(&self) -> &DispatchEngine {
        &self.dispatcher
    }

    pub fn telemetry(&self) -> &DispatchTelemetry {
        &self.telemetry
    }

    pub fn store(&self) -> &Arc<dyn RideStore> {
        &self.store
    }

    /// Resolves a caller token to an active principal.
    pub fn authenticate(&self, token: &str) -> Result<Principal> {
        self.identity.authenticate(token)
    }

    /// Opens a real-time connection for the caller behind `token`.
    pub fn connect(&self, token: &str) -> Result<Connection> {
        self.bus.connect(token)
    }

    async fn load(&self, ride_id: RideId) -> Result<Ride> {
        self.store
            .get_ride(ride_id)
            .await?
            .ok_or(RideError::RideNotFound(ride_id))
    }

    /// The ride as stored, for its requester or assigned driver.
    pub async fn get_ride(&self, principal: &Principal, ride_id: RideId) -> Result<Ride> {
        principal.ensure_active()?;
        let ride = self.load(ride_id).await?;
        if !ride.is_party(principal.user_id) {
            return Err(RideError::unauthorized("not a party to this ride"));
        }
        Ok(ride)
    }

    /// Prices and persists a new `pending` ride.
    ///
    /// Nothing is written if validation or the route estimate fails.
    #[tracing::instrument(
        skip_all,
        fields(requester = %principal.user_id, class = %request.vehicle_class)
    )]
    pub async fn request_ride(&self, principal: &Principal, request: RideRequest) -> Result<Ride> {
        principal.ensure_role(Role::Requester)?;
        let now = self.clock.now();
        request.validate(now)?;

        let route = self
            .routes
            .estimate(request.pickup.point, request.destination.point)
            .await
            .map_err(|err| RideError::RouteUnavailable(err.to_string()))?;
        if !(route.distance_km.is_finite() && route.distance_km >= 0.0)
            || !(route.duration_min.is_finite() && route.duration_min >= 0.0)
        {
            return Err(RideError::RouteUnavailable(format!(
                "provider returned an unusable estimate: {route:?}"
            )));
        }

        let fare = self.config.rates.fare(
            route.distance_km,
            route.duration_min,
            request.vehicle_class,
            request.surge.unwrap_or(1.0),
        );
        let ride = Ride::new(principal.user_id, request, route, fare, now);
        self.store.insert_ride(&ride).await?;

        self.telemetry.ride_requested();
        tracing::info!(
            ride_id = %ride.id,
            distance_km = route.distance_km,
            fare = ride.pricing.final_amount,
            "ride requested"
        );
        Ok(ride)
    }

    /// Opens the first offer round; the ride moves to `searching`.
    pub async fn dispatch(&self, ride_id: RideId) -> Result<OfferRound> {
        self.dispatcher.dispatch(ride_id).await
    }

    /// Runs offer rounds until a driver accepts or every round expires.
    pub async fn find_driver(&self, ride_id: RideId) -> Result<DispatchOutcome> {
        self.dispatcher.find_driver(ride_id).await
    }

    pub async fn accept_ride(&self, principal: &Principal, ride_id: RideId) -> Result<Ride> {
        self.dispatcher.accept(principal, ride_id).await
    }

    pub fn decline_ride(&self, principal: &Principal, ride_id: RideId) -> Result<()> {
        self.dispatcher.decline(principal, ride_id)
    }

    pub async fn mark_arrived(&self, principal: &Principal, ride_id: RideId) -> Result<Ride> {
        let now = self.clock.now();
        self.driver_transition(
            principal,
            ride_id,
            RideStatus::Arrived,
            RideUpdate::transition(RideStatus::Arrived, now),
        )
        .await
    }

    pub async fn start_trip(&self, principal: &Principal, ride_id: RideId) -> Result<Ride> {
        let now = self.clock.now();
        self.driver_transition(
            principal,
            ride_id,
            RideStatus::Started,
            RideUpdate::transition(RideStatus::Started, now),
        )
        .await
    }

    /// Completes the trip, locks the final amount and frees the driver.
    pub async fn complete_trip(&self, principal: &Principal, ride_id: RideId) -> Result<Ride> {
        let now = self.clock.now();
        let current = self.load(ride_id).await?;
        let update = RideUpdate::transition(RideStatus::Completed, now)
            .with_final_amount(current.pricing.final_amount)
            .finalizing();
        let ride = self
            .driver_transition(principal, ride_id, RideStatus::Completed, update)
            .await?;

        self.restore_availability(principal.user_id).await;
        self.telemetry.ride_completed(&ride);
        Ok(ride)
    }

    /// Checks that `user` may move `ride` to `to` as its driver.
    fn check_driver_transition(ride: &Ride, user: UserId, to: RideStatus) -> Result<()> {
        if !ride.is_assigned_to(user) {
            return Err(RideError::unauthorized("caller is not the assigned driver"));
        }
        if ride.status.is_terminal() {
            return Err(RideError::AlreadyFinalized(ride.id));
        }
        if !ride.status.can_transition_to(to) {
            return Err(RideError::InvalidTransition {
                from: ride.status,
                to,
            });
        }
        Ok(())
    }

    async fn driver_transition(
        &self,
        principal: &Principal,
        ride_id: RideId,
        to: RideStatus,
        update: RideUpdate,
    ) -> Result<Ride> {
        principal.ensure_role(Role::Driver)?;
        let user = principal.user_id;
        let ride = self.load(ride_id).await?;
        Self::check_driver_transition(&ride, user, to)?;

        let guard = RideGuard::status_is(ride.status).with_driver(DriverGuard::AssignedTo(user));
        let ride = match self.store.update_ride_if(ride_id, &guard, &update).await? {
            CasOutcome::Applied(ride) => ride,
            CasOutcome::NotFound => return Err(RideError::RideNotFound(ride_id)),
            CasOutcome::PreconditionFailed(current) => {
                Self::check_driver_transition(&current, user, to)?;
                return Err(RideError::InvalidTransition {
                    from: current.status,
                    to,
                });
            }
        };

        self.publish_status(&ride, None);
        tracing::info!(%ride_id, driver_id = %user, status = %to, "ride status changed");
        Ok(ride)
    }

    fn publish_status(&self, ride: &Ride, cancellation: Option<Cancellation>) -> RideEvent {
        let at = match ride.status {
            RideStatus::Cancelled => ride.timeline.cancelled_at,
            RideStatus::Completed => ride.timeline.completed_at,
            RideStatus::Started => ride.timeline.started_at,
            RideStatus::Arrived => ride.timeline.arrived_at,
            RideStatus::Accepted => ride.timeline.accepted_at,
            RideStatus::Searching => ride.timeline.searching_at,
            RideStatus::Pending => None,
        }
        .unwrap_or(ride.timeline.requested_at);
        let event = RideEvent::RideStatusUpdate {
            ride_id: ride.id,
            status: ride.status,
            at,
            cancellation,
        };
        self.bus.publish(Topic::Ride(ride.id), event.clone());
        event
    }

    async fn restore_availability(&self, driver_id: UserId) {
        let now = self.clock.now();
        match self
            .store
            .patch_driver(driver_id, &DriverPatch::availability(true), now)
            .await
        {
            Ok(Some(driver)) => self.publish_availability(&driver),
            Ok(None) => {
                tracing::warn!(%driver_id, "driver record missing, availability not restored")
            }
            Err(err) => {
                tracing::warn!(%driver_id, error = %err, "failed to restore driver availability")
            }
        }
    }

    fn publish_availability(&self, driver: &Driver) {
        if let Some(region) = Topic::region_of(driver.location) {
            self.bus.publish(
                region,
                RideEvent::DriverAvailabilityUpdate {
                    driver_id: driver.id,
                    available: driver.available,
                    location: driver.location,
                    vehicle_class: driver.vehicle_class(),
                },
            );
        }
    }

    /// Cancels a ride on behalf of its requester or assigned driver.
    ///
    /// A requester cancelling after acceptance pays the policy fee; a driver
    /// never does. Terminal rides fail with `AlreadyFinalized`.
    #[tracing::instrument(skip(self, principal, reason), fields(caller = %principal.user_id))]
    pub async fn cancel_ride(
        &self,
        principal: &Principal,
        ride_id: RideId,
        reason: Option<String>,
    ) -> Result<Ride> {
        principal.ensure_active()?;
        let user = principal.user_id;

        for _ in 0..CANCEL_ATTEMPTS {
            let ride = self.load(ride_id).await?;
            let actor = if ride.requester == user {
                CancelledBy::Requester
            } else if ride.is_assigned_to(user) {
                CancelledBy::Driver
            } else {
                return Err(RideError::unauthorized("not a party to this ride"));
            };
            if ride.status.is_terminal() {
                return Err(RideError::AlreadyFinalized(ride_id));
            }
            let allowed: &[RideStatus] = match actor {
                CancelledBy::Requester => &RideStatus::REQUESTER_CANCELLABLE,
                CancelledBy::Driver => &RideStatus::DRIVER_CANCELLABLE,
            };
            if !allowed.contains(&ride.status) {
                return Err(RideError::InvalidTransition {
                    from: ride.status,
                    to: RideStatus::Cancelled,
                });
            }

            let now = self.clock.now();
            let amount = ride.pricing.final_amount;
            let policy = &self.config.cancellation;
            let fee = match actor {
                CancelledBy::Requester => policy.fee(ride.status, amount),
                CancelledBy::Driver => 0.0,
            };
            let cancellation = Cancellation {
                actor,
                reason: reason.clone(),
                fee,
                refund: policy.refund(amount, fee),
                cancelled_at: now,
            };
            let driver_guard = match ride.driver {
                Some(driver) => DriverGuard::AssignedTo(driver),
                None => DriverGuard::Unassigned,
            };
            let guard = RideGuard::status_is(ride.status).with_driver(driver_guard);
            let update = RideUpdate::transition(RideStatus::Cancelled, now)
                .with_cancellation(cancellation.clone());

            let cancelled = match self.store.update_ride_if(ride_id, &guard, &update).await? {
                CasOutcome::Applied(ride) => ride,
                CasOutcome::NotFound => return Err(RideError::RideNotFound(ride_id)),
                CasOutcome::PreconditionFailed(current) => {
                    tracing::debug!(
                        status = %current.status,
                        "ride changed during cancellation, retrying"
                    );
                    continue;
                }
            };

            self.after_cancel(&cancelled, cancellation).await;
            return Ok(cancelled);
        }

        Err(RideError::RideUnavailable(ride_id))
    }

    async fn after_cancel(&self, ride: &Ride, cancellation: Cancellation) {
        self.dispatcher.close_round(ride.id);
        if let Some(driver_id) = ride.driver {
            self.restore_availability(driver_id).await;
        }

        let actor = cancellation.actor;
        let fee = cancellation.fee;
        let event = self.publish_status(ride, Some(cancellation));
        let counterparty = match actor {
            CancelledBy::Requester => ride.driver,
            CancelledBy::Driver => Some(ride.requester),
        };
        if let Some(recipient) = counterparty {
            self.bus.publish(Topic::User(recipient), event);
            send_detached(
                Arc::clone(&self.notifier),
                Notification::RideCancelled {
                    ride_id: ride.id,
                    recipient,
                    cancelled_by: actor,
                    fee,
                },
            );
        }

        self.telemetry.ride_cancelled();
        tracing::info!(ride_id = %ride.id, ?actor, fee, "ride cancelled");
    }

    fn check_tracking(ride: &Ride, user: UserId, point: &TrackingPoint) -> Result<()> {
        if !ride.is_assigned_to(user) {
            return Err(RideError::unauthorized("caller is not the assigned driver"));
        }
        if ride.status.is_terminal() {
            return Err(RideError::AlreadyFinalized(ride.id));
        }
        if ride.status != RideStatus::Started {
            return Err(RideError::validation(format!(
                "tracking is only recorded on a started trip, ride is {}",
                ride.status
            )));
        }
        if ride
            .tracking
            .last()
            .is_some_and(|last| last.recorded_at > point.recorded_at)
        {
            return Err(RideError::validation("tracking timestamps must not go backwards"));
        }
        Ok(())
    }

    /// Appends a tracking point to a started trip and moves the driver.
    pub async fn record_location(
        &self,
        principal: &Principal,
        ride_id: RideId,
        point: TrackingPoint,
    ) -> Result<Ride> {
        principal.ensure_role(Role::Driver)?;
        point.location.validate()?;
        if !point.speed_kmh.is_finite() || point.speed_kmh < 0.0 || !point.heading_deg.is_finite() {
            return Err(RideError::validation(
                "speed and heading must be finite, speed non-negative",
            ));
        }
        let user = principal.user_id;
        let ride = self.load(ride_id).await?;
        Self::check_tracking(&ride, user, &point)?;

        let guard = RideGuard::status_is(RideStatus::Started)
            .with_driver(DriverGuard::AssignedTo(user))
            .tracking_not_after(point.recorded_at);
        let ride = match self
            .store
            .update_ride_if(ride_id, &guard, &RideUpdate::tracking(point))
            .await?
        {
            CasOutcome::Applied(ride) => ride,
            CasOutcome::NotFound => return Err(RideError::RideNotFound(ride_id)),
            CasOutcome::PreconditionFailed(current) => {
                Self::check_tracking(&current, user, &point)?;
                return Err(RideError::RideUnavailable(ride_id));
            }
        };

        if let Err(err) = self
            .store
            .patch_driver(user, &DriverPatch::location(point.location), self.clock.now())
            .await
        {
            tracing::warn!(driver_id = %user, error = %err, "failed to update driver location");
        }
        self.bus.publish(
            Topic::Ride(ride_id),
            RideEvent::RideLocationUpdate {
                ride_id,
                driver_id: user,
                point,
            },
        );
        Ok(ride)
    }

    /// Records the requester's rating of a completed ride and refreshes the
    /// driver's average. A ride can be rated once.
    pub async fn rate_ride(
        &self,
        principal: &Principal,
        ride_id: RideId,
        score: u8,
        feedback: Option<String>,
    ) -> Result<Ride> {
        principal.ensure_role(Role::Requester)?;
        if !(1..=5).contains(&score) {
            return Err(RideError::validation(format!(
                "rating must be between 1 and 5, got {score}"
            )));
        }
        let ride = self.load(ride_id).await?;
        if ride.requester != principal.user_id {
            return Err(RideError::unauthorized("only the requester can rate a ride"));
        }
        if ride.status != RideStatus::Completed {
            return Err(RideError::validation(format!(
                "only completed rides can be rated, ride is {}",
                ride.status
            )));
        }
        if ride.rating.is_some() {
            return Err(RideError::validation("ride has already been rated"));
        }

        let rating = RideRating {
            score,
            feedback,
            rated_at: self.clock.now(),
        };
        let guard = RideGuard::status_is(RideStatus::Completed).unrated();
        let ride = match self
            .store
            .update_ride_if(ride_id, &guard, &RideUpdate::rating(rating))
            .await?
        {
            CasOutcome::Applied(ride) => ride,
            CasOutcome::NotFound => return Err(RideError::RideNotFound(ride_id)),
            CasOutcome::PreconditionFailed(_) => {
                return Err(RideError::validation("ride has already been rated"))
            }
        };

        // The rating is committed; a failed average refresh is caught up by the
        // driver's next rating, which recomputes from every rated ride.
        if let Some(driver_id) = ride.driver {
            if let Err(err) = self.ratings.recompute(driver_id).await {
                tracing::warn!(
                    %ride_id,
                    %driver_id,
                    error = %err,
                    "driver rating refresh failed"
                );
            }
        }
        tracing::info!(%ride_id, score, "ride rated");
        Ok(ride)
    }

    /// Subscribes `connection` to the ride room if its owner is a party to the ride.
    pub async fn join_ride_room(&self, connection: &Connection, ride_id: RideId) -> Result<()> {
        let ride = self.load(ride_id).await?;
        if !ride.is_party(connection.principal().user_id) {
            return Err(RideError::unauthorized("not a party to this ride"));
        }
        if !self.bus.join(connection.id(), Topic::Ride(ride_id)) {
            return Err(RideError::unauthorized("connection is closed"));
        }
        Ok(())
    }

    /// Creates or replaces the caller's driver record; the driver starts available.
    pub async fn register_driver(
        &self,
        principal: &Principal,
        name: &str,
        location: GeoPoint,
        vehicle: Vehicle,
    ) -> Result<Driver> {
        principal.ensure_role(Role::Driver)?;
        location.validate()?;
        let driver = Driver::new(principal.user_id, name, location, vehicle, self.clock.now());
        self.store.put_driver(&driver).await?;
        self.publish_availability(&driver);
        tracing::info!(
            driver_id = %driver.id,
            class = %driver.vehicle_class(),
            "driver registered"
        );
        Ok(driver)
    }

    /// Applies the caller's location/availability update, last write wins.
    pub async fn update_driver(&self, principal: &Principal, patch: DriverPatch) -> Result<Driver> {
        principal.ensure_role(Role::Driver)?;
        if patch.rating.is_some() {
            return Err(RideError::validation("driver rating is computed from ride ratings"));
        }
        if patch.is_empty() {
            return Err(RideError::validation("driver update has no fields"));
        }
        if let Some(location) = patch.location {
            location.validate()?;
        }
        let driver = self
            .store
            .patch_driver(principal.user_id, &patch, self.clock.now())
            .await?
            .ok_or(RideError::DriverNotFound(principal.user_id))?;
        self.publish_availability(&driver);
        tracing::debug!(driver_id = %driver.id, available = driver.available, "driver updated");
        Ok(driver)
    }
}
