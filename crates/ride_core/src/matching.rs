//! Cost-based ranking of offer candidates.
//!
//! Candidates come back from the store nearest first. Ranking scores each
//! pairing by pickup distance, estimated pickup ETA and the driver's rating.
//! Distance and ETA dominate; the rating moves a driver past others that are
//! only slightly closer. Equal scores fall back to driver id.

use std::cmp::Ordering;
use std::time::Duration;

use crate::store::DriverCandidate;

/// Average speed for pickup ETA estimation (km/h).
const AVG_PICKUP_SPEED_KMH: f64 = 40.0;

/// Rating an unrated driver is scored with, the middle of the 1-5 scale.
const NEUTRAL_RATING: f64 = 3.0;

/// Estimated time for a driver `distance_km` away to reach the pickup.
/// Never less than one second.
pub fn estimate_pickup_eta(distance_km: f64) -> Duration {
    if !distance_km.is_finite() || distance_km <= 0.0 {
        return Duration::from_secs(1);
    }
    let eta_ms = (distance_km / AVG_PICKUP_SPEED_KMH) * 3_600_000.0;
    Duration::from_millis(eta_ms.max(1_000.0) as u64)
}

/// A candidate with its pickup ETA and score. Higher score ranks first.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub candidate: DriverCandidate,
    pub pickup_eta: Duration,
    pub score: f64,
}

/// Scores driver/ride pairings by distance, ETA and driver rating.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostBasedRanking {
    /// Weight for ETA seconds in the score. Higher values prioritize lower ETA more.
    pub eta_weight: f64,
    /// Score per rating star above [`NEUTRAL_RATING`]; negative below it.
    pub rating_weight: f64,
}

impl CostBasedRanking {
    pub fn new(eta_weight: f64) -> Self {
        Self {
            eta_weight,
            rating_weight: 2.0,
        }
    }

    pub fn with_rating_weight(mut self, rating_weight: f64) -> Self {
        self.rating_weight = rating_weight;
        self
    }

    /// Lower cost = higher score.
    fn score(&self, candidate: &DriverCandidate, pickup_eta: Duration) -> f64 {
        let rating = candidate
            .driver
            .rating
            .map(|r| r.average)
            .filter(|average| average.is_finite())
            .unwrap_or(NEUTRAL_RATING);
        -candidate.distance_km - pickup_eta.as_secs_f64() * self.eta_weight
            + (rating - NEUTRAL_RATING) * self.rating_weight
    }

    /// Scores and orders `candidates`, best first, capped at `limit`.
    pub fn rank(&self, candidates: Vec<DriverCandidate>, limit: usize) -> Vec<RankedCandidate> {
        let mut ranked: Vec<RankedCandidate> = candidates
            .into_iter()
            .map(|candidate| {
                let pickup_eta = estimate_pickup_eta(candidate.distance_km);
                RankedCandidate {
                    score: self.score(&candidate, pickup_eta),
                    pickup_eta,
                    candidate,
                }
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.candidate.driver.id.cmp(&b.candidate.driver.id))
        });
        ranked.truncate(limit);
        ranked
    }
}

impl Default for CostBasedRanking {
    fn default() -> Self {
        Self::new(0.1)
    }
}

/// Ranks with the default weights.
pub fn rank_candidates(candidates: Vec<DriverCandidate>, limit: usize) -> Vec<RankedCandidate> {
    CostBasedRanking::default().rank(candidates, limit)
}
