//! Demo runner: drives the dispatch core with simulated drivers and riders.
//!
//! Run with: cargo run -p ride_sim -- --drivers 80 --requests 40

mod agents;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ride_core::auth::{Principal, StaticIdentityProvider};
use ride_core::config::CoreConfig;
use ride_core::{Collaborators, RideService, UserId};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::agents::{random_point, random_vehicle, DriverAgent, RiderJourney, RiderOutcome};

#[derive(Debug, Parser)]
#[command(
    name = "ride_sim",
    about = "Runs simulated drivers and riders against the ride dispatch core"
)]
struct Args {
    /// Number of drivers to register
    #[arg(long, env = "RIDE_SIM_DRIVERS", default_value_t = 50)]
    drivers: usize,
    /// Number of ride requests to submit
    #[arg(long, env = "RIDE_SIM_REQUESTS", default_value_t = 20)]
    requests: usize,
    /// Seed for driver placement, trip endpoints and agent behaviour
    #[arg(long, env = "RIDE_SIM_SEED", default_value_t = 42)]
    seed: u64,
    /// JSON file with core configuration (dispatch, rates, cancellation, bus, routing)
    #[arg(long, env = "RIDE_SIM_CONFIG")]
    config: Option<PathBuf>,
    /// Overrides the offer timeout from the config file
    #[arg(long, env = "RIDE_SIM_OFFER_TIMEOUT_MS")]
    offer_timeout_ms: Option<u64>,
    /// Milliseconds between consecutive ride requests
    #[arg(long, default_value_t = 25)]
    request_interval_ms: u64,
    /// Emit JSON logs instead of plain text
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Serialize)]
struct Summary {
    counts: ride_core::telemetry::DispatchCounts,
    outcomes: OutcomeTally,
    completed_rides: Vec<ride_core::telemetry::CompletedRideRecord>,
}

#[derive(Debug, Default, Serialize)]
struct OutcomeTally {
    completed: usize,
    no_driver_found: usize,
    cancelled: usize,
    failed: usize,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &Args) -> Result<CoreConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            CoreConfig::from_json(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => CoreConfig::default().with_offer_timeout_ms(2_000),
    };
    if let Some(timeout_ms) = args.offer_timeout_ms {
        config = config.with_offer_timeout_ms(timeout_ms);
    }
    config.validate().context("checking config")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);
    let config = load_config(&args)?;

    let identity = Arc::new(StaticIdentityProvider::new());
    let collaborators =
        Collaborators::from_config(identity.clone(), &config).context("building collaborators")?;
    let service = Arc::new(RideService::new(config, collaborators));
    let mut rng = StdRng::seed_from_u64(args.seed);

    tracing::info!(
        drivers = args.drivers,
        requests = args.requests,
        seed = args.seed,
        "starting simulation"
    );

    let mut agents = Vec::with_capacity(args.drivers);
    for i in 0..args.drivers {
        let token = format!("driver-{i}");
        let principal = Principal::driver(UserId::new());
        identity.insert(token.as_str(), principal.clone());
        service
            .register_driver(
                &principal,
                &format!("Driver {i}"),
                random_point(&mut rng),
                random_vehicle(&mut rng, i),
            )
            .await
            .with_context(|| format!("registering {token}"))?;
        let agent = DriverAgent::new(Arc::clone(&service), principal, &token, rng.gen())
            .with_context(|| format!("connecting {token}"))?;
        agents.push(tokio::spawn(agent.run()));
    }

    let mut journeys = Vec::with_capacity(args.requests);
    for i in 0..args.requests {
        let token = format!("rider-{i}");
        let principal = Principal::requester(UserId::new());
        identity.insert(token.as_str(), principal.clone());
        let journey = RiderJourney::new(Arc::clone(&service), principal, &token, rng.gen())
            .with_context(|| format!("connecting {token}"))?;
        journeys.push(tokio::spawn(journey.run()));
        tokio::time::sleep(Duration::from_millis(args.request_interval_ms)).await;
    }

    let mut tally = OutcomeTally::default();
    for journey in journeys {
        match journey.await.context("rider task panicked")? {
            RiderOutcome::Completed => tally.completed += 1,
            RiderOutcome::NoDriverFound => tally.no_driver_found += 1,
            RiderOutcome::Cancelled => tally.cancelled += 1,
            RiderOutcome::Failed(reason) => {
                tracing::warn!(%reason, "rider journey failed");
                tally.failed += 1;
            }
        }
    }
    for agent in agents {
        agent.abort();
    }

    let telemetry = service.telemetry();
    let summary = Summary {
        counts: telemetry.snapshot(),
        outcomes: tally,
        completed_rides: telemetry.completed_rides(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
