//! Error taxonomy for the dispatch core.
//!
//! Every failure a caller can observe is a [`RideError`]. The variants are
//! grouped by what the caller can do about them through
//! [`RideError::disposition`].

use crate::lifecycle::RideStatus;
use crate::ride::{RideId, UserId, VehicleClass};

/// The result type used throughout ride_core.
pub type Result<T> = std::result::Result<T, RideError>;

/// What a caller can do after an operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The ride is gone; pick another offer or driver.
    TryAnotherDriver,
    /// The request itself is wrong and must be changed before retrying.
    FixRequest,
    /// A collaborator is unavailable; the same request may succeed later.
    RetryLater,
    /// The ride is in a state where the operation can never succeed.
    NoAction,
}

/// Errors returned by ride operations.
#[derive(Debug, thiserror::Error)]
pub enum RideError {
    /// Malformed input, rejected before it reaches the state machine.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The route provider could not estimate the trip; nothing was persisted.
    #[error("route unavailable: {0}")]
    RouteUnavailable(String),

    /// The ride was claimed by someone else, cancelled, or the offer expired.
    #[error("ride {0} is no longer available")]
    RideUnavailable(RideId),

    /// The driver's vehicle class does not match the requested class.
    #[error("vehicle class mismatch: ride requires {required}, driver has {offered}")]
    VehicleMismatch {
        /// Class requested by the rider.
        required: VehicleClass,
        /// Class of the driver's vehicle.
        offered: VehicleClass,
    },

    /// The caller is not the ride's owner or assigned driver, or failed authentication.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The state machine does not allow the requested transition.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status of the ride.
        from: RideStatus,
        /// Status the caller tried to reach.
        to: RideStatus,
    },

    /// The ride is completed or cancelled.
    #[error("ride {0} is already finalized")]
    AlreadyFinalized(RideId),

    /// No ride with this id exists.
    #[error("ride not found: {0}")]
    RideNotFound(RideId),

    /// No driver record exists for this user.
    #[error("driver not found: {0}")]
    DriverNotFound(UserId),

    /// The backing store failed.
    #[error("storage error: {0}")]
    Storage(#[from] crate::store::StoreError),
}

impl RideError {
    /// Creates a validation error from any displayable message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates an authorization error from any displayable message.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    /// Classifies the error by what the caller can do next.
    #[must_use]
    pub const fn disposition(&self) -> Disposition {
        match self {
            Self::RideUnavailable(_) => Disposition::TryAnotherDriver,
            Self::Validation(_)
            | Self::VehicleMismatch { .. }
            | Self::Unauthorized(_)
            | Self::RideNotFound(_)
            | Self::DriverNotFound(_) => Disposition::FixRequest,
            Self::RouteUnavailable(_) | Self::Storage(_) => Disposition::RetryLater,
            Self::InvalidTransition { .. } | Self::AlreadyFinalized(_) => Disposition::NoAction,
        }
    }
}
