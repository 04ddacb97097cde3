//! Tunables for dispatch, pricing and the event bus.
//!
//! Every field has a default, so a partial JSON document overrides only what
//! it names.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RideError};
use crate::fare::{CancellationPolicy, RateTable};
use crate::routing::RouteProviderKind;

/// Longest offer round a config may ask for: one hour.
pub const MAX_OFFER_TIMEOUT_MS: u64 = 3_600_000;

/// Offer round parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Search radius of the first round.
    pub search_radius_km: f64,
    /// Maximum number of drivers offered a ride per round.
    pub max_fanout: usize,
    /// How long an offer round stays open.
    pub offer_timeout_ms: u64,
    /// Rounds attempted before the requester is told no driver was found.
    pub max_rounds: u32,
    /// Radius multiplier applied after each unanswered round.
    pub radius_growth: f64,
    /// Upper bound on the widened radius.
    pub max_radius_km: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            search_radius_km: 10.0,
            max_fanout: 20,
            offer_timeout_ms: 15_000,
            max_rounds: 3,
            radius_growth: 1.5,
            max_radius_km: 30.0,
        }
    }
}

impl DispatchConfig {
    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }

    /// Search radius for the zero-based `round`.
    pub fn radius_for_round(&self, round: u32) -> f64 {
        let growth = if self.radius_growth.is_finite() && self.radius_growth >= 1.0 {
            self.radius_growth
        } else {
            1.0
        };
        let widened = self.search_radius_km * growth.powi(round.min(i32::MAX as u32) as i32);
        widened.min(self.max_radius_km.max(self.search_radius_km))
    }

    fn validate(&self) -> Result<()> {
        if !(self.search_radius_km.is_finite() && self.search_radius_km > 0.0) {
            return Err(RideError::validation("search_radius_km must be positive"));
        }
        if self.max_fanout == 0 {
            return Err(RideError::validation("max_fanout must be at least 1"));
        }
        if self.max_rounds == 0 {
            return Err(RideError::validation("max_rounds must be at least 1"));
        }
        if self.offer_timeout_ms > MAX_OFFER_TIMEOUT_MS {
            return Err(RideError::validation(format!(
                "offer_timeout_ms must be at most {MAX_OFFER_TIMEOUT_MS}, got {}",
                self.offer_timeout_ms
            )));
        }
        Ok(())
    }
}

/// Per-connection delivery buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Events buffered per connection before new ones are dropped.
    pub inbox_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { inbox_capacity: 64 }
    }
}

/// In-process KPI retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Completed-ride records kept; the oldest are dropped first.
    pub completed_ride_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            completed_ride_capacity: 10_000,
        }
    }
}

/// Everything the core can be tuned with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub dispatch: DispatchConfig,
    pub rates: RateTable,
    pub cancellation: CancellationPolicy,
    pub bus: BusConfig,
    pub routing: RouteProviderKind,
    pub telemetry: TelemetryConfig,
}

impl CoreConfig {
    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CoreConfig = serde_json::from_str(json)
            .map_err(|err| RideError::validation(format!("invalid config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.dispatch.validate()
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_offer_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.dispatch.offer_timeout_ms = timeout_ms;
        self
    }

    pub fn with_search_radius_km(mut self, radius_km: f64) -> Self {
        self.dispatch.search_radius_km = radius_km;
        self
    }

    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.dispatch.max_rounds = rounds;
        self
    }

    pub fn with_rates(mut self, rates: RateTable) -> Self {
        self.rates = rates;
        self
    }

    pub fn with_cancellation(mut self, policy: CancellationPolicy) -> Self {
        self.cancellation = policy;
        self
    }

    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.bus.inbox_capacity = capacity;
        self
    }

    pub fn with_completed_ride_capacity(mut self, capacity: usize) -> Self {
        self.telemetry.completed_ride_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = CoreConfig::from_json(r#"{"dispatch": {"max_fanout": 5}}"#).expect("config");
        assert_eq!(config.dispatch.max_fanout, 5);
        assert_eq!(config.dispatch.search_radius_km, 10.0);
        assert_eq!(config.dispatch.offer_timeout_ms, 15_000);
        assert_eq!(config.bus.inbox_capacity, 64);
        assert_eq!(config.cancellation.fee_cap, 50.0);
        assert_eq!(config.telemetry.completed_ride_capacity, 10_000);
    }

    #[test]
    fn rejects_zero_fanout() {
        assert!(CoreConfig::from_json(r#"{"dispatch": {"max_fanout": 0}}"#).is_err());
        assert!(CoreConfig::from_json("not json").is_err());
    }

    #[test]
    fn rejects_offer_timeout_past_an_hour() {
        let json = format!(r#"{{"dispatch": {{"offer_timeout_ms": {}}}}}"#, u64::MAX);
        assert!(CoreConfig::from_json(&json).is_err());
        let json = format!(r#"{{"dispatch": {{"offer_timeout_ms": {MAX_OFFER_TIMEOUT_MS}}}}}"#);
        assert!(CoreConfig::from_json(&json).is_ok());
        assert!(CoreConfig::default()
            .with_offer_timeout_ms(MAX_OFFER_TIMEOUT_MS + 1)
            .validate()
            .is_err());
    }

    #[test]
    fn radius_widens_up_to_cap() {
        let dispatch = DispatchConfig::default();
        assert_eq!(dispatch.radius_for_round(0), 10.0);
        assert_eq!(dispatch.radius_for_round(1), 15.0);
        assert_eq!(dispatch.radius_for_round(2), 22.5);
        assert_eq!(dispatch.radius_for_round(3), 30.0);
    }
}
