mod support;

use ride_core::config::CoreConfig;
use ride_core::events::{RideEvent, Topic};
use ride_core::fare::{RateCard, RateTable};
use ride_core::notify::Notification;
use ride_core::ride::CancelledBy;
use ride_core::store::RideStore;
use ride_core::test_helpers::{FixedRouteProvider, RecordingNotifier, TestHarness};
use ride_core::{RideError, RideStatus, VehicleClass};
use support::{accepted_trip, started_trip, wait_for_notifications, DRIVER, RIDER};

/// Car rides cost a flat 500.
fn flat_fare_config() -> CoreConfig {
    CoreConfig::default().with_rates(RateTable::default().with_rates(
        VehicleClass::Car,
        RateCard {
            base_fare: 500.0,
            per_km: 0.0,
            per_min: 0.0,
        },
    ))
}

#[tokio::test]
async fn pending_cancellation_is_free() {
    let harness = TestHarness::with_config(flat_fare_config());
    let rider = harness.add_requester(RIDER);
    let ride = harness.request_sample_ride(&rider).await.expect("ride");

    let cancelled = harness
        .service
        .cancel_ride(&rider, ride.id, Some("changed plans".into()))
        .await
        .expect("cancel");
    assert_eq!(cancelled.status, RideStatus::Cancelled);
    let cancellation = cancelled.cancellation.expect("cancellation");
    assert_eq!(cancellation.actor, CancelledBy::Requester);
    assert_eq!(cancellation.fee, 0.0);
    assert_eq!(cancellation.refund, 500.0);
    assert_eq!(cancellation.reason.as_deref(), Some("changed plans"));
    assert!(cancelled.timeline.cancelled_at.is_some());
}

#[tokio::test]
async fn searching_cancellation_is_free() {
    let harness = TestHarness::with_config(flat_fare_config());
    let rider = harness.add_requester(RIDER);
    let ride = harness.request_sample_ride(&rider).await.expect("ride");
    harness.service.dispatch(ride.id).await.expect("dispatch");

    let cancelled = harness
        .service
        .cancel_ride(&rider, ride.id, None)
        .await
        .expect("cancel");
    assert_eq!(cancelled.cancellation.expect("cancellation").fee, 0.0);
}

#[tokio::test]
async fn accepted_cancellation_charges_capped_fee() {
    let harness = TestHarness::with_config(flat_fare_config());
    let trip = accepted_trip(&harness).await;
    assert_eq!(trip.ride.pricing.final_amount, 500.0);

    let cancelled = harness
        .service
        .cancel_ride(&trip.rider, trip.ride.id, None)
        .await
        .expect("cancel");
    let cancellation = cancelled.cancellation.expect("cancellation");
    assert_eq!(cancellation.fee, 50.0);
    assert_eq!(cancellation.refund, 450.0);
    assert!(cancellation.refund >= 0.0);
}

#[tokio::test]
async fn arrived_cancellation_charges_percentage_below_cap() {
    let harness = TestHarness::new();
    let trip = accepted_trip(&harness).await;
    harness
        .service
        .mark_arrived(&trip.driver, trip.ride.id)
        .await
        .expect("arrive");

    let cancelled = harness
        .service
        .cancel_ride(&trip.rider, trip.ride.id, None)
        .await
        .expect("cancel");
    // 10% of 160.4
    assert_eq!(cancelled.cancellation.expect("cancellation").fee, 16.04);
}

#[tokio::test]
async fn requester_cannot_cancel_a_started_trip() {
    let harness = TestHarness::new();
    let trip = started_trip(&harness).await;
    let err = harness
        .service
        .cancel_ride(&trip.rider, trip.ride.id, None)
        .await
        .expect_err("started");
    assert!(matches!(
        err,
        RideError::InvalidTransition {
            from: RideStatus::Started,
            to: RideStatus::Cancelled
        }
    ));
}

#[tokio::test]
async fn driver_cancellation_is_free_and_frees_the_driver() {
    let harness = TestHarness::with_config(flat_fare_config());
    let trip = started_trip(&harness).await;

    let cancelled = harness
        .service
        .cancel_ride(&trip.driver, trip.ride.id, Some("vehicle trouble".into()))
        .await
        .expect("cancel");
    let cancellation = cancelled.cancellation.expect("cancellation");
    assert_eq!(cancellation.actor, CancelledBy::Driver);
    assert_eq!(cancellation.fee, 0.0);
    assert_eq!(cancellation.refund, 500.0);

    let driver = harness
        .store
        .get_driver(trip.driver.user_id)
        .await
        .expect("get")
        .expect("driver");
    assert!(driver.available);
}

#[tokio::test]
async fn strangers_cannot_cancel() {
    let harness = TestHarness::new();
    let trip = accepted_trip(&harness).await;
    let stranger = harness.add_requester("stranger");
    let err = harness
        .service
        .cancel_ride(&stranger, trip.ride.id, None)
        .await
        .expect_err("stranger");
    assert!(matches!(err, RideError::Unauthorized(_)));
}

#[tokio::test]
async fn cancelling_twice_fails() {
    let harness = TestHarness::new();
    let rider = harness.add_requester(RIDER);
    let ride = harness.request_sample_ride(&rider).await.expect("ride");
    harness
        .service
        .cancel_ride(&rider, ride.id, None)
        .await
        .expect("cancel");
    let err = harness
        .service
        .cancel_ride(&rider, ride.id, None)
        .await
        .expect_err("twice");
    assert!(matches!(err, RideError::AlreadyFinalized(_)));
    assert_eq!(err.disposition(), ride_core::Disposition::NoAction);
}

#[tokio::test]
async fn counterparty_is_told_about_cancellation() {
    let harness = TestHarness::new();
    let trip = accepted_trip(&harness).await;
    let mut driver_conn = harness.service.connect(DRIVER).expect("connect");

    harness
        .service
        .cancel_ride(&trip.rider, trip.ride.id, None)
        .await
        .expect("cancel");

    let envelope = driver_conn.try_recv().expect("event");
    assert_eq!(envelope.topic, Topic::User(trip.driver.user_id));
    match envelope.event {
        RideEvent::RideStatusUpdate {
            status,
            cancellation,
            ..
        } => {
            assert_eq!(status, RideStatus::Cancelled);
            assert_eq!(
                cancellation.map(|c| c.actor),
                Some(CancelledBy::Requester)
            );
        }
        other => panic!("unexpected event {other:?}"),
    }

    wait_for_notifications(&harness.notifier, 2).await;
    assert!(harness.notifier.sent().iter().any(|n| matches!(
        n,
        Notification::RideCancelled { recipient, .. } if *recipient == trip.driver.user_id
    )));
}

#[tokio::test]
async fn failed_notification_does_not_roll_back() {
    let harness = TestHarness::build(
        CoreConfig::default(),
        FixedRouteProvider::default(),
        RecordingNotifier::failing(),
    );
    let trip = accepted_trip(&harness).await;
    harness
        .service
        .cancel_ride(&trip.driver, trip.ride.id, None)
        .await
        .expect("cancel");

    // accept + cancel notifications were both attempted and both failed
    wait_for_notifications(&harness.notifier, 2).await;
    let stored = harness
        .store
        .get_ride(trip.ride.id)
        .await
        .expect("get")
        .expect("ride");
    assert_eq!(stored.status, RideStatus::Cancelled);
    assert_eq!(stored.driver, Some(trip.driver.user_id));
}
