//! Request a ride, let three nearby drivers race for it and print the trip.
//!
//! Run with: cargo run -p ride_core --example dispatch_run

use std::sync::Arc;

use ride_core::dispatch::DispatchOutcome;
use ride_core::geo::GeoPoint;
use ride_core::test_helpers::{TestHarness, TEST_PICKUP};
use ride_core::VehicleClass;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ride_core::Result<()> {
    const NUM_DRIVERS: u32 = 3;

    let harness = TestHarness::new();
    let rider = harness.add_requester("rider");
    let mut drivers = Vec::new();
    for i in 0..NUM_DRIVERS {
        let point = GeoPoint {
            lat: TEST_PICKUP.lat + 0.002 * f64::from(i + 1),
            lng: TEST_PICKUP.lng,
        };
        drivers.push(harness.add_driver(&format!("driver-{i}"), point, VehicleClass::Car).await?);
    }

    let ride = harness.request_sample_ride(&rider).await?;
    println!("--- Dispatch run ({NUM_DRIVERS} drivers) ---");
    println!("Requested ride {} quoted at {:.2}", ride.id, ride.pricing.final_amount);

    let search = {
        let service = Arc::clone(&harness.service);
        tokio::spawn(async move { service.find_driver(ride.id).await })
    };
    tokio::task::yield_now().await;

    let claims: Vec<_> = drivers
        .iter()
        .cloned()
        .map(|driver| {
            let service = Arc::clone(&harness.service);
            tokio::spawn(async move {
                let result = service.accept_ride(&driver, ride.id).await;
                (driver.user_id, result)
            })
        })
        .collect();
    for claim in claims {
        if let Ok((driver_id, result)) = claim.await {
            match result {
                Ok(_) => println!("  driver {driver_id} won the ride"),
                Err(err) => println!("  driver {driver_id}: {err}"),
            }
        }
    }

    let outcome = search.await.expect("search task")?;
    let DispatchOutcome::Accepted(accepted) = outcome else {
        println!("No driver: {outcome:?}");
        return Ok(());
    };
    let Some(driver) = drivers.iter().find(|d| Some(d.user_id) == accepted.driver) else {
        return Ok(());
    };

    harness.service.mark_arrived(driver, ride.id).await?;
    harness.service.start_trip(driver, ride.id).await?;
    let completed = harness.service.complete_trip(driver, ride.id).await?;
    harness.service.rate_ride(&rider, ride.id, 5, Some("quick pickup".into())).await?;

    for record in harness.service.telemetry().completed_rides() {
        println!(
            "  ride={} fare={:.2} time_to_match={} ms trip_duration={} ms",
            record.ride_id,
            record.fare,
            record.time_to_match().num_milliseconds(),
            record.trip_duration().num_milliseconds(),
        );
    }
    println!("Final status: {}", completed.status);
    Ok(())
}
