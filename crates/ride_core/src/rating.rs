//! Recomputes a driver's rolling rating from their rated rides.

use std::sync::Arc;

use crate::clock::Clock;
use crate::driver::{DriverPatch, DriverRating};
use crate::error::Result;
use crate::ride::UserId;
use crate::store::RideStore;

/// Mean of `scores`, rounded to one decimal (half away from zero).
pub fn average_score(scores: &[u8]) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    let sum: u32 = scores.iter().map(|&s| u32::from(s)).sum();
    let mean = f64::from(sum) / scores.len() as f64;
    Some((mean * 10.0).round() / 10.0)
}

/// Rating passes before a recompute gives up chasing newer ratings.
const MAX_PASSES: u32 = 4;

/// Writes the mean of every rated ride back onto the driver record.
///
/// The read of the scores and the write of the average are separate store
/// calls, so a recompute that read before a newer rating landed can overwrite
/// a fresher average. Each pass therefore re-reads the scores after writing
/// and writes again until the set it averaged is still the current one.
/// Ratings are never removed, so an unchanged count means an unchanged set.
#[derive(Clone)]
pub struct RatingAggregator {
    store: Arc<dyn RideStore>,
    clock: Arc<dyn Clock>,
}

impl RatingAggregator {
    pub fn new(store: Arc<dyn RideStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Returns the written rating, or `None` when the driver has no rated rides
    /// or no driver record.
    pub async fn recompute(&self, driver_id: UserId) -> Result<Option<DriverRating>> {
        let mut scores = self.store.rated_scores_for_driver(driver_id).await?;
        let mut pass = 1;
        loop {
            let Some(rating) = self.write(driver_id, &scores).await? else {
                return Ok(None);
            };
            let latest = self.store.rated_scores_for_driver(driver_id).await?;
            if latest.len() == scores.len() {
                tracing::debug!(
                    %driver_id,
                    average = rating.average,
                    rated_rides = rating.rated_rides,
                    "driver rating updated"
                );
                return Ok(Some(rating));
            }
            if pass == MAX_PASSES {
                tracing::warn!(%driver_id, passes = pass, "driver rating still changing");
                return Ok(Some(rating));
            }
            pass += 1;
            scores = latest;
        }
    }

    async fn write(&self, driver_id: UserId, scores: &[u8]) -> Result<Option<DriverRating>> {
        let Some(average) = average_score(scores) else {
            return Ok(None);
        };
        let rating = DriverRating {
            average,
            rated_rides: scores.len() as u32,
        };
        let patch = DriverPatch {
            rating: Some(rating),
            ..DriverPatch::default()
        };
        let updated = self.store.patch_driver(driver_id, &patch, self.clock.now()).await?;
        if updated.is_none() {
            tracing::warn!(%driver_id, "rated driver has no driver record");
            return Ok(None);
        }
        Ok(Some(rating))
    }
}
