//! Ride dispatch core: ride lifecycle, driver matching, fares and real-time events.
//!
//! Entry point is [`service::RideService`], which wires a [`store::RideStore`],
//! an [`auth::IdentityProvider`], a [`routing::RouteProvider`] and a
//! [`notify::Notifier`] to the [`dispatch::DispatchEngine`] and the
//! [`bus::EventBus`].

pub mod auth;
pub mod bus;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod events;
pub mod fare;
pub mod geo;
pub mod lifecycle;
pub mod matching;
pub mod notify;
pub mod rating;
pub mod ride;
pub mod routing;
pub mod service;
pub mod store;
pub mod telemetry;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use error::{Disposition, Result, RideError};
pub use lifecycle::RideStatus;
pub use ride::{Ride, RideId, RideRequest, UserId, VehicleClass};
pub use service::{Collaborators, RideService};
