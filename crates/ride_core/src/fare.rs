//! Fare engine: rate table keyed by vehicle class.
//!
//! Formula: `total = (base + distance_km * per_km + duration_min * per_min) * surge`
//!
//! Every component is rounded to two decimals (half away from zero), so the
//! same inputs always produce the same breakdown.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::lifecycle::RideStatus;
use crate::ride::VehicleClass;

/// Rates for one vehicle class, in currency units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateCard {
    pub base_fare: f64,
    pub per_km: f64,
    pub per_min: f64,
}

/// Rates used when neither the requested class nor the table's default class has an entry.
const FALLBACK_RATES: RateCard = RateCard {
    base_fare: 50.0,
    per_km: 12.0,
    per_min: 2.0,
};

/// Fare components for one quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FareBreakdown {
    pub base_fare: f64,
    pub distance_fare: f64,
    pub time_fare: f64,
    pub surge_multiplier: f64,
    pub total: f64,
}

/// Rate cards per vehicle class.
///
/// A class without an entry is priced with the rates of `default_class`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateTable {
    pub default_class: VehicleClass,
    pub rates: HashMap<VehicleClass, RateCard>,
}

impl Default for RateTable {
    fn default() -> Self {
        let rates = HashMap::from([
            (
                VehicleClass::Bike,
                RateCard {
                    base_fare: 15.0,
                    per_km: 5.0,
                    per_min: 0.5,
                },
            ),
            (
                VehicleClass::Auto,
                RateCard {
                    base_fare: 25.0,
                    per_km: 9.0,
                    per_min: 1.0,
                },
            ),
            (VehicleClass::Car, FALLBACK_RATES),
            (
                VehicleClass::Suv,
                RateCard {
                    base_fare: 80.0,
                    per_km: 18.0,
                    per_min: 3.0,
                },
            ),
        ]);
        Self {
            default_class: VehicleClass::DEFAULT,
            rates,
        }
    }
}

impl RateTable {
    pub fn with_rates(mut self, class: VehicleClass, card: RateCard) -> Self {
        self.rates.insert(class, card);
        self
    }

    /// Rate card for `class`, falling back to the default class.
    pub fn rates_for(&self, class: VehicleClass) -> RateCard {
        self.rates
            .get(&class)
            .or_else(|| self.rates.get(&self.default_class))
            .copied()
            .unwrap_or(FALLBACK_RATES)
    }

    /// Computes the fare breakdown for a trip.
    ///
    /// Negative or non-finite distance and duration count as zero; a surge
    /// multiplier that is not a positive finite number counts as 1.0.
    pub fn fare(
        &self,
        distance_km: f64,
        duration_min: f64,
        class: VehicleClass,
        surge: f64,
    ) -> FareBreakdown {
        let card = self.rates_for(class);
        let distance_km = sanitize(distance_km);
        let duration_min = sanitize(duration_min);
        let surge = if surge.is_finite() && surge > 0.0 {
            surge
        } else {
            1.0
        };

        let base_fare = round2(card.base_fare);
        let distance_fare = round2(distance_km * card.per_km);
        let time_fare = round2(duration_min * card.per_min);
        let total = round2((base_fare + distance_fare + time_fare) * surge);

        FareBreakdown {
            base_fare,
            distance_fare,
            time_fare,
            surge_multiplier: surge,
            total,
        }
    }

    /// Like [`RateTable::fare`], keyed by class name. Unknown names use the default class.
    pub fn fare_for_name(
        &self,
        class_name: &str,
        distance_km: f64,
        duration_min: f64,
        surge: f64,
    ) -> FareBreakdown {
        let class = class_name.parse().unwrap_or_else(|_| {
            tracing::debug!(
                class_name,
                default = %self.default_class,
                "unknown vehicle class, pricing with default class"
            );
            self.default_class
        });
        self.fare(distance_km, duration_min, class, surge)
    }
}

fn default_table() -> &'static RateTable {
    static TABLE: OnceLock<RateTable> = OnceLock::new();
    TABLE.get_or_init(RateTable::default)
}

/// Fare with the default rate table.
pub fn fare(distance_km: f64, duration_min: f64, class: VehicleClass, surge: f64) -> FareBreakdown {
    default_table().fare(distance_km, duration_min, class, surge)
}

/// Cancellation fee terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CancellationPolicy {
    /// Percentage of the ride's final amount charged on a late cancellation.
    pub fee_percent: f64,
    /// Upper bound on the fee.
    pub fee_cap: f64,
}

impl Default for CancellationPolicy {
    fn default() -> Self {
        Self {
            fee_percent: 10.0,
            fee_cap: 50.0,
        }
    }
}

impl CancellationPolicy {
    /// Fee for a requester cancelling a ride in `status` whose amount is `fare`.
    pub fn fee(&self, status: RideStatus, fare: f64) -> f64 {
        if !status.charges_cancellation_fee() {
            return 0.0;
        }
        let fare = sanitize(fare);
        let fee = (fare * self.fee_percent / 100.0).min(self.fee_cap);
        round2(fee.clamp(0.0, fare))
    }

    /// Amount returned to the requester; never negative.
    pub fn refund(&self, fare: f64, fee: f64) -> f64 {
        round2((sanitize(fare) - fee).max(0.0))
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value.max(0.0)
    } else {
        0.0
    }
}

/// Rounds to two decimals, half away from zero.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fare_includes_base_distance_and_time() {
        let quote = fare(10.0, 20.0, VehicleClass::Car, 1.0);
        assert_eq!(quote.base_fare, 50.0);
        assert_eq!(quote.distance_fare, 120.0);
        assert_eq!(quote.time_fare, 40.0);
        assert_eq!(quote.total, 210.0);
    }

    #[test]
    fn fare_is_bit_for_bit_deterministic() {
        let a = fare(10.0, 20.0, VehicleClass::Car, 1.0);
        for _ in 0..100 {
            let b = fare(10.0, 20.0, VehicleClass::Car, 1.0);
            assert_eq!(a.total.to_bits(), b.total.to_bits());
            assert_eq!(a, b);
        }
    }

    #[test]
    fn surge_scales_the_total() {
        let base = fare(10.0, 20.0, VehicleClass::Car, 1.0);
        let surged = fare(10.0, 20.0, VehicleClass::Car, 1.5);
        assert_eq!(surged.total, 315.0);
        assert_eq!(surged.distance_fare, base.distance_fare);
        assert_eq!(surged.surge_multiplier, 1.5);
    }

    #[test]
    fn unknown_class_name_uses_default_rates() {
        let table = RateTable::default();
        let unknown = table.fare_for_name("Limousine", 5.0, 10.0, 1.0);
        let car = table.fare(5.0, 10.0, VehicleClass::Car, 1.0);
        assert_eq!(unknown, car);
    }

    #[test]
    fn missing_table_entry_uses_default_class() {
        let mut table = RateTable::default();
        table.rates.remove(&VehicleClass::Suv);
        assert_eq!(
            table.fare(3.0, 7.0, VehicleClass::Suv, 1.0),
            table.fare(3.0, 7.0, VehicleClass::Car, 1.0)
        );
    }

    #[test]
    fn negative_inputs_price_as_zero() {
        let quote = fare(-4.0, f64::NAN, VehicleClass::Bike, -2.0);
        assert_eq!(quote.distance_fare, 0.0);
        assert_eq!(quote.time_fare, 0.0);
        assert_eq!(quote.surge_multiplier, 1.0);
        assert_eq!(quote.total, 15.0);
    }

    #[test]
    fn cancellation_fee_boundaries() {
        let policy = CancellationPolicy::default();
        assert_eq!(policy.fee(RideStatus::Pending, 500.0), 0.0);
        assert_eq!(policy.fee(RideStatus::Searching, 500.0), 0.0);
        assert_eq!(policy.fee(RideStatus::Accepted, 500.0), 50.0);
        assert_eq!(policy.fee(RideStatus::Arrived, 100.0), 10.0);
        assert_eq!(policy.fee(RideStatus::Accepted, 2_000.0), 50.0);
        for fare in [0.0, 1.0, 99.99, 500.0, 10_000.0] {
            let fee = policy.fee(RideStatus::Accepted, fare);
            assert!(policy.refund(fare, fee) >= 0.0);
        }
    }
}
