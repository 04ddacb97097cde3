//! Ride status and the transition table.
//!
//! ```text
//! pending -> searching -> accepted -> arrived -> started -> completed
//!    \___________\____________\__________\_________\______-> cancelled
//! ```
//!
//! `completed` and `cancelled` are terminal.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Pending,
    Searching,
    Accepted,
    Arrived,
    Started,
    Completed,
    Cancelled,
}

impl RideStatus {
    /// Statuses from which a driver may claim the ride.
    pub const CLAIMABLE: [RideStatus; 2] = [RideStatus::Pending, RideStatus::Searching];

    /// Statuses in which the requester may still cancel.
    pub const REQUESTER_CANCELLABLE: [RideStatus; 4] = [
        RideStatus::Pending,
        RideStatus::Searching,
        RideStatus::Accepted,
        RideStatus::Arrived,
    ];

    /// Statuses in which the assigned driver may cancel.
    pub const DRIVER_CANCELLABLE: [RideStatus; 3] = [
        RideStatus::Accepted,
        RideStatus::Arrived,
        RideStatus::Started,
    ];

    pub const fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    /// True once a driver has been assigned and the ride is not terminal.
    pub const fn has_driver_assigned(self) -> bool {
        matches!(
            self,
            RideStatus::Accepted | RideStatus::Arrived | RideStatus::Started
        )
    }

    /// Whether a requester cancellation in this status is charged a fee.
    pub const fn charges_cancellation_fee(self) -> bool {
        matches!(self, RideStatus::Accepted | RideStatus::Arrived)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub const fn can_transition_to(self, next: RideStatus) -> bool {
        use RideStatus::*;
        match (self, next) {
            (Pending, Searching) => true,
            (Pending | Searching, Accepted) => true,
            (Accepted, Arrived) => true,
            (Arrived, Started) => true,
            (Started, Completed) => true,
            (Pending | Searching | Accepted | Arrived | Started, Cancelled) => true,
            _ => false,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            RideStatus::Pending => "pending",
            RideStatus::Searching => "searching",
            RideStatus::Accepted => "accepted",
            RideStatus::Arrived => "arrived",
            RideStatus::Started => "started",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [RideStatus; 7] = [
        RideStatus::Pending,
        RideStatus::Searching,
        RideStatus::Accepted,
        RideStatus::Arrived,
        RideStatus::Started,
        RideStatus::Completed,
        RideStatus::Cancelled,
    ];

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [RideStatus::Completed, RideStatus::Cancelled] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn happy_path_is_linear() {
        let path = [
            RideStatus::Pending,
            RideStatus::Searching,
            RideStatus::Accepted,
            RideStatus::Arrived,
            RideStatus::Started,
            RideStatus::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
        }
        assert!(!RideStatus::Accepted.can_transition_to(RideStatus::Started));
        assert!(!RideStatus::Arrived.can_transition_to(RideStatus::Completed));
        assert!(!RideStatus::Started.can_transition_to(RideStatus::Accepted));
    }

    #[test]
    fn every_non_terminal_state_can_cancel() {
        for from in ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(RideStatus::Cancelled));
        }
    }

    #[test]
    fn fee_applies_only_after_assignment_before_pickup() {
        let charged: Vec<_> = ALL
            .into_iter()
            .filter(|s| s.charges_cancellation_fee())
            .collect();
        assert_eq!(charged, vec![RideStatus::Accepted, RideStatus::Arrived]);
    }

    #[test]
    fn serializes_as_snake_case() {
        let json = serde_json::to_string(&RideStatus::Searching).expect("json");
        assert_eq!(json, "\"searching\"");
    }
}
