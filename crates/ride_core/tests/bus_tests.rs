mod support;

use ride_core::auth::Principal;
use ride_core::driver::DriverPatch;
use ride_core::events::{RideEvent, Topic};
use ride_core::test_helpers::{TestHarness, TEST_PICKUP};
use ride_core::{RideError, UserId, VehicleClass};
use support::{accepted_trip, near_pickup, DRIVER, RIDER};

#[tokio::test]
async fn connections_require_an_active_principal() {
    let harness = TestHarness::new();
    let mut dormant = Principal::requester(UserId::new());
    dormant.is_active = false;
    harness.identity.insert("dormant", dormant);

    assert!(matches!(
        harness.service.connect("missing"),
        Err(RideError::Unauthorized(_))
    ));
    assert!(matches!(
        harness.service.connect("dormant"),
        Err(RideError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn offers_reach_only_candidates() {
    let harness = TestHarness::new();
    let rider = harness.add_requester(RIDER);
    harness
        .add_driver("car", near_pickup(1), VehicleClass::Car)
        .await
        .expect("driver");
    harness
        .add_driver("bike", near_pickup(2), VehicleClass::Bike)
        .await
        .expect("driver");
    let mut car = harness.service.connect("car").expect("connect");
    let mut bike = harness.service.connect("bike").expect("connect");
    let mut rider_conn = harness.service.connect(RIDER).expect("connect");

    let ride = harness.request_sample_ride(&rider).await.expect("ride");
    harness.service.dispatch(ride.id).await.expect("dispatch");

    let offer = car.try_recv().expect("offer");
    match offer.event {
        RideEvent::NewRideRequest {
            ride_id,
            vehicle_class,
            fare,
            round,
            ..
        } => {
            assert_eq!(ride_id, ride.id);
            assert_eq!(vehicle_class, VehicleClass::Car);
            assert_eq!(fare, ride.pricing.final_amount);
            assert_eq!(round, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(bike.try_recv().is_none());
    assert!(rider_conn.try_recv().is_none());
}

#[tokio::test]
async fn requester_hears_about_acceptance() {
    let harness = TestHarness::new();
    let rider = harness.add_requester(RIDER);
    let driver = harness
        .add_driver(DRIVER, near_pickup(1), VehicleClass::Car)
        .await
        .expect("driver");
    let mut rider_conn = harness.service.connect(RIDER).expect("connect");

    let ride = harness.request_sample_ride(&rider).await.expect("ride");
    harness.service.dispatch(ride.id).await.expect("dispatch");
    harness.service.accept_ride(&driver, ride.id).await.expect("accept");

    let envelope = rider_conn.try_recv().expect("event");
    assert_eq!(envelope.topic, Topic::User(rider.user_id));
    match &envelope.event {
        RideEvent::RideAccepted {
            driver_id, vehicle, ..
        } => {
            assert_eq!(*driver_id, driver.user_id);
            assert_eq!(vehicle.class, VehicleClass::Car);
        }
        other => panic!("unexpected event {other:?}"),
    }
    let json = envelope.to_json().expect("json");
    assert!(json.contains("\"ride-accepted\""));
}

#[tokio::test]
async fn only_parties_join_the_ride_room() {
    let harness = TestHarness::new();
    let trip = accepted_trip(&harness).await;
    harness.add_requester("stranger");

    let mut rider_conn = harness.service.connect(RIDER).expect("connect");
    let stranger_conn = harness.service.connect("stranger").expect("connect");
    harness
        .service
        .join_ride_room(&rider_conn, trip.ride.id)
        .await
        .expect("party joins");
    let err = harness
        .service
        .join_ride_room(&stranger_conn, trip.ride.id)
        .await
        .expect_err("stranger");
    assert!(matches!(err, RideError::Unauthorized(_)));

    harness
        .service
        .mark_arrived(&trip.driver, trip.ride.id)
        .await
        .expect("arrive");
    let envelope = rider_conn.try_recv().expect("status update");
    assert_eq!(envelope.topic, Topic::Ride(trip.ride.id));
    assert_eq!(envelope.event.name(), "ride-status-update");
    assert_eq!(
        harness.service.bus().subscriber_count(&Topic::Ride(trip.ride.id)),
        1
    );
}

#[tokio::test]
async fn availability_updates_go_to_the_region_room() {
    let harness = TestHarness::new();
    let driver = harness
        .add_driver(DRIVER, near_pickup(1), VehicleClass::Car)
        .await
        .expect("driver");
    harness.add_requester(RIDER);
    let mut watcher = harness.service.connect(RIDER).expect("connect");
    let region = watcher.watch_region(TEST_PICKUP).expect("region");

    let updated = harness
        .service
        .update_driver(&driver, DriverPatch::availability(false))
        .await
        .expect("update");
    assert!(!updated.available);

    let envelope = watcher.try_recv().expect("availability");
    assert_eq!(envelope.topic, region);
    assert!(matches!(
        envelope.event,
        RideEvent::DriverAvailabilityUpdate {
            available: false,
            ..
        }
    ));
}

#[tokio::test]
async fn driver_updates_are_validated() {
    let harness = TestHarness::new();
    let driver = harness
        .add_driver(DRIVER, near_pickup(1), VehicleClass::Car)
        .await
        .expect("driver");

    let err = harness
        .service
        .update_driver(&driver, DriverPatch::default())
        .await
        .expect_err("empty");
    assert!(matches!(err, RideError::Validation(_)));

    let unregistered = Principal::driver(UserId::new());
    let err = harness
        .service
        .update_driver(&unregistered, DriverPatch::availability(true))
        .await
        .expect_err("unknown");
    assert!(matches!(err, RideError::DriverNotFound(_)));
}
