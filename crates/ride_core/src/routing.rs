//! Pluggable route providers: distance and duration estimates between two points.
//!
//! Implementations, selectable via [`RouteProviderKind`]:
//!
//! - **`HaversineRouteProvider`**: great-circle distance at an average city speed.
//!   Zero dependencies.
//! - **`OsrmRouteProvider`** (feature `osrm`): calls a local/remote OSRM HTTP endpoint.
//!
//! [`CachedRouteProvider`] wraps any provider with an LRU keyed by H3 cells.
//! A provider failure aborts ride creation before anything is persisted.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use async_trait::async_trait;
use h3o::{CellIndex, Resolution};
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;
use crate::ride::RouteEstimate;

/// Average city speed used when no road network is available.
pub const DEFAULT_AVG_SPEED_KMH: f64 = 30.0;

/// Resolution at which route cache keys are snapped (~66 m edge).
const CACHE_RESOLUTION: Resolution = Resolution::Ten;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no route between the requested points")]
    NoRoute,
    #[error("route provider request failed: {0}")]
    Transport(String),
    #[error("route provider returned an error: {0}")]
    Api(String),
}

/// Trait for routing backends. Must be `Send + Sync` so one provider can serve
/// every request task.
#[async_trait]
pub trait RouteProvider: Send + Sync {
    async fn estimate(&self, from: GeoPoint, to: GeoPoint) -> Result<RouteEstimate, RouteError>;
}

/// Which routing backend to use.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub enum RouteProviderKind {
    #[default]
    Haversine,
    /// OSRM HTTP endpoint (e.g. `"http://localhost:5000"`).
    #[cfg(feature = "osrm")]
    Osrm { endpoint: String },
}

// ---------------------------------------------------------------------------
// Haversine provider (always available)
// ---------------------------------------------------------------------------

/// Straight-line distance scaled by a detour factor, driven at a fixed speed.
#[derive(Debug, Clone, Copy)]
pub struct HaversineRouteProvider {
    pub avg_speed_kmh: f64,
    /// Road distance per straight-line kilometre.
    pub detour_factor: f64,
}

impl Default for HaversineRouteProvider {
    fn default() -> Self {
        Self {
            avg_speed_kmh: DEFAULT_AVG_SPEED_KMH,
            detour_factor: 1.3,
        }
    }
}

#[async_trait]
impl RouteProvider for HaversineRouteProvider {
    async fn estimate(&self, from: GeoPoint, to: GeoPoint) -> Result<RouteEstimate, RouteError> {
        if from.validate().is_err() || to.validate().is_err() || self.avg_speed_kmh <= 0.0 {
            return Err(RouteError::NoRoute);
        }
        let distance_km = from.distance_km(&to) * self.detour_factor.max(1.0);
        let duration_min = distance_km / self.avg_speed_kmh * 60.0;
        Ok(RouteEstimate {
            distance_km,
            duration_min,
        })
    }
}

// ---------------------------------------------------------------------------
// OSRM provider (behind `osrm` feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "osrm")]
pub mod osrm {
    use super::*;
    use reqwest::Client;
    use std::time::Duration;

    const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    pub struct OsrmRouteProvider {
        client: Client,
        endpoint: String,
    }

    impl OsrmRouteProvider {
        pub fn new(endpoint: &str) -> Result<Self, RouteError> {
            let client = Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(|err| RouteError::Transport(err.to_string()))?;
            Ok(Self {
                client,
                endpoint: endpoint.trim_end_matches('/').to_string(),
            })
        }
    }

    /// Minimal OSRM JSON response structures.
    #[derive(Deserialize)]
    struct OsrmResponse {
        code: String,
        message: Option<String>,
        routes: Option<Vec<OsrmRoute>>,
    }

    #[derive(Deserialize)]
    struct OsrmRoute {
        distance: f64, // metres
        duration: f64, // seconds
    }

    #[async_trait]
    impl RouteProvider for OsrmRouteProvider {
        async fn estimate(
            &self,
            from: GeoPoint,
            to: GeoPoint,
        ) -> Result<RouteEstimate, RouteError> {
            // OSRM takes lng,lat pairs
            let url = format!(
                "{}/route/v1/driving/{},{};{},{}?overview=false",
                self.endpoint, from.lng, from.lat, to.lng, to.lat,
            );

            let resp: OsrmResponse = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|err| RouteError::Transport(err.to_string()))?
                .json()
                .await
                .map_err(|err| RouteError::Transport(err.to_string()))?;

            if resp.code != "Ok" {
                return Err(RouteError::Api(resp.message.unwrap_or(resp.code)));
            }

            let route = resp
                .routes
                .and_then(|routes| routes.into_iter().next())
                .ok_or(RouteError::NoRoute)?;

            Ok(RouteEstimate {
                distance_km: route.distance / 1000.0,
                duration_min: route.duration / 60.0,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Caching wrapper
// ---------------------------------------------------------------------------

/// LRU-cached wrapper around any [`RouteProvider`].
///
/// Cache key is the directional pair of resolution-10 cells of the endpoints.
/// On inner failure the optional haversine fallback is tried before the error
/// is returned.
pub struct CachedRouteProvider {
    inner: Box<dyn RouteProvider>,
    cache: Mutex<LruCache<(CellIndex, CellIndex), RouteEstimate>>,
    fallback: Option<HaversineRouteProvider>,
}

impl CachedRouteProvider {
    pub fn new(
        inner: Box<dyn RouteProvider>,
        capacity: usize,
        fallback_to_haversine: bool,
    ) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            fallback: fallback_to_haversine.then(HaversineRouteProvider::default),
        }
    }

    fn key(from: GeoPoint, to: GeoPoint) -> Option<(CellIndex, CellIndex)> {
        Some((from.cell(CACHE_RESOLUTION).ok()?, to.cell(CACHE_RESOLUTION).ok()?))
    }
}

#[async_trait]
impl RouteProvider for CachedRouteProvider {
    async fn estimate(&self, from: GeoPoint, to: GeoPoint) -> Result<RouteEstimate, RouteError> {
        let key = Self::key(from, to);

        // Fast path: cache hit
        if let Some(key) = key {
            if let Ok(mut cache) = self.cache.lock() {
                if let Some(hit) = cache.get(&key) {
                    return Ok(*hit);
                }
            }
        }

        // Slow path: query inner provider
        let result = match self.inner.estimate(from, to).await {
            Ok(estimate) => Ok(estimate),
            Err(err) => match &self.fallback {
                Some(fallback) => {
                    tracing::warn!(error = %err, "route provider failed, using haversine fallback");
                    fallback.estimate(from, to).await
                }
                None => Err(err),
            },
        };

        if let (Ok(estimate), Some(key)) = (&result, key) {
            if let Ok(mut cache) = self.cache.lock() {
                cache.put(key, *estimate);
            }
        }

        result
    }
}

/// Default route cache capacity.
const DEFAULT_ROUTE_CACHE_CAPACITY: usize = 20_000;

/// Constructs a boxed [`RouteProvider`] from a [`RouteProviderKind`].
///
/// `Haversine` is returned without caching; network providers are wrapped in a
/// [`CachedRouteProvider`] with haversine fallback.
pub fn build_route_provider(
    kind: &RouteProviderKind,
) -> Result<Box<dyn RouteProvider>, RouteError> {
    match kind {
        RouteProviderKind::Haversine => Ok(Box::new(HaversineRouteProvider::default())),

        #[cfg(feature = "osrm")]
        RouteProviderKind::Osrm { endpoint } => {
            let inner = Box::new(osrm::OsrmRouteProvider::new(endpoint)?);
            Ok(Box::new(CachedRouteProvider::new(
                inner,
                DEFAULT_ROUTE_CACHE_CAPACITY,
                true,
            )))
        }
    }
}

/// Wraps `provider` in a cache of the default capacity without fallback.
pub fn cached(provider: Box<dyn RouteProvider>) -> CachedRouteProvider {
    CachedRouteProvider::new(provider, DEFAULT_ROUTE_CACHE_CAPACITY, false)
}
