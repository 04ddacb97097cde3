//! Durable notification collaborator (email, SMS, push).
//!
//! Notifications are sent on a spawned task after the store transition has
//! committed. A failed delivery is logged and never rolls the ride back.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::ride::{CancelledBy, RideId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    RideAccepted {
        ride_id: RideId,
        requester: UserId,
        driver: UserId,
    },
    RideCancelled {
        ride_id: RideId,
        recipient: UserId,
        cancelled_by: CancelledBy,
        fee: f64,
    },
}

impl Notification {
    pub fn ride_id(&self) -> RideId {
        match self {
            Notification::RideAccepted { ride_id, .. }
            | Notification::RideCancelled { ride_id, .. } => *ride_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(ride_id = %notification.ride_id(), ?notification, "notification");
        Ok(())
    }
}

/// Sends `notification` on a background task; failures are logged.
pub fn send_detached(notifier: Arc<dyn Notifier>, notification: Notification) {
    tokio::spawn(async move {
        if let Err(err) = notifier.send(&notification).await {
            tracing::warn!(
                ride_id = %notification.ride_id(),
                error = %err,
                "durable notification failed"
            );
        }
    });
}
