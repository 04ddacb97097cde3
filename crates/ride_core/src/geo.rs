//! Geographic operations: coordinates, haversine distance, and H3 cell helpers.
//!
//! This module provides:
//!
//! - **GeoPoint**: validated latitude/longitude pair
//! - **Distance calculations**: great-circle distance between points
//! - **Proximity disks**: the H3 cells covering a search radius, cached
//!
//! Driver locations are bucketed at [`INDEX_RESOLUTION`] (~1.4 km edge) for
//! proximity queries. Region rooms on the event bus use the coarser
//! [`REGION_RESOLUTION`].

use std::num::NonZeroUsize;
use std::sync::{Mutex, OnceLock};

use h3o::{CellIndex, LatLng, Resolution};
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RideError};

/// Resolution of the driver proximity index.
pub const INDEX_RESOLUTION: Resolution = Resolution::Seven;

/// Resolution of driver region rooms.
pub const REGION_RESOLUTION: Resolution = Resolution::Five;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// A WGS84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// Creates a point, rejecting non-finite or out-of-range coordinates.
    pub fn new(lat: f64, lng: f64) -> Result<Self> {
        let point = Self { lat, lng };
        point.validate()?;
        Ok(point)
    }

    /// Checks that the coordinates are finite and in range.
    pub fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(RideError::validation(format!(
                "latitude out of range: {}",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(RideError::validation(format!(
                "longitude out of range: {}",
                self.lng
            )));
        }
        Ok(())
    }

    /// H3 cell containing this point at the given resolution.
    pub fn cell(&self, resolution: Resolution) -> Result<CellIndex> {
        LatLng::new(self.lat, self.lng)
            .map(|ll| ll.to_cell(resolution))
            .map_err(|err| RideError::validation(format!("invalid coordinate: {err}")))
    }

    /// Great-circle distance to `other` in kilometres.
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        distance_km(*self, *other)
    }

    /// The point `distance_km` away along the initial bearing `bearing_deg`.
    pub fn destination(&self, bearing_deg: f64, distance_km: f64) -> GeoPoint {
        let delta = distance_km / EARTH_RADIUS_KM;
        let theta = bearing_deg.to_radians();
        let (lat1, lng1) = (self.lat.to_radians(), self.lng.to_radians());
        let lat2 = (lat1.sin() * delta.cos() + lat1.cos() * delta.sin() * theta.cos()).asin();
        let lng2 = lng1
            + (theta.sin() * delta.sin() * lat1.cos())
                .atan2(delta.cos() - lat1.sin() * lat2.sin());
        GeoPoint {
            lat: lat2.to_degrees(),
            lng: (lng2.to_degrees() + 540.0) % 360.0 - 180.0,
        }
    }
}

impl From<LatLng> for GeoPoint {
    fn from(ll: LatLng) -> Self {
        Self {
            lat: ll.lat(),
            lng: ll.lng(),
        }
    }
}

/// Haversine distance between two points in kilometres.
pub fn distance_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lng.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lng.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// First guess at the ring count for `radius_km`, from the average edge
/// length. Cells shrink and skew away from the average, so
/// [`disk_covering`] widens this until the disk provably covers the radius.
fn estimated_rings(radius_km: f64) -> u32 {
    let step = INDEX_RESOLUTION.edge_length_km() * 1.5;
    if radius_km <= 0.0 || step <= 0.0 {
        return 0;
    }
    (radius_km / step).ceil() as u32 + 1
}

/// Farthest boundary vertex from the cell centre.
fn circumradius_km(cell: CellIndex) -> f64 {
    let centre = GeoPoint::from(LatLng::from(cell));
    cell.boundary()
        .iter()
        .map(|vertex| distance_km(centre, GeoPoint::from(*vertex)))
        .fold(0.0, f64::max)
}

/// Smallest `k` whose outermost ring lies entirely beyond `radius_km` of every
/// point in `origin`.
///
/// Ring `k` encloses rings `0..k`, so a point within the radius can only sit
/// in a cell outside the disk if the straight path to it crosses a ring cell
/// that reaches inside the radius.
fn covering_rings(origin: CellIndex, radius_km: f64) -> u32 {
    let centre = GeoPoint::from(LatLng::from(origin));
    let reach = radius_km + circumradius_km(origin);
    let mut k = estimated_rings(radius_km).max(1);
    let limit = k.saturating_mul(4).saturating_add(8);
    while k < limit {
        let ring_clear = origin
            .grid_disk_distances::<Vec<_>>(k)
            .into_iter()
            .filter(|(_, ring)| *ring == k)
            .all(|(cell, _)| {
                let cell_centre = GeoPoint::from(LatLng::from(cell));
                distance_km(centre, cell_centre) - circumradius_km(cell) > reach
            });
        if ring_clear {
            return k;
        }
        k += 1;
    }
    tracing::warn!(%origin, radius_km, k, "ring search hit its limit");
    k
}

/// Grid disk and ring count caches for proximity queries.
struct GridDiskCache {
    disks: Mutex<LruCache<(CellIndex, u32), Vec<CellIndex>>>,
    rings: Mutex<LruCache<(CellIndex, u64), u32>>,
}

impl GridDiskCache {
    fn new() -> Self {
        let capacity = NonZeroUsize::new(1_000).unwrap_or(NonZeroUsize::MIN);
        Self {
            disks: Mutex::new(LruCache::new(capacity)),
            rings: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn get_or_compute(&self, origin: CellIndex, k: u32) -> Vec<CellIndex> {
        let mut cache = match self.disks.lock() {
            Ok(guard) => guard,
            // poisoned: compute without the cache
            Err(_) => return origin.grid_disk::<Vec<_>>(k),
        };
        cache
            .get_or_insert((origin, k), || origin.grid_disk::<Vec<_>>(k))
            .clone()
    }

    fn rings_for(&self, origin: CellIndex, radius_km: f64) -> u32 {
        let key = (origin, radius_km.to_bits());
        if let Ok(mut cache) = self.rings.lock() {
            if let Some(k) = cache.get(&key) {
                return *k;
            }
        }
        let k = covering_rings(origin, radius_km);
        if let Ok(mut cache) = self.rings.lock() {
            cache.put(key, k);
        }
        k
    }
}

static GRID_DISK_CACHE: OnceLock<GridDiskCache> = OnceLock::new();

fn grid_disk_cache() -> &'static GridDiskCache {
    GRID_DISK_CACHE.get_or_init(GridDiskCache::new)
}

/// Cells holding every point within `radius_km` of any point inside `origin`.
///
/// The disk may reach past the radius; callers still filter by exact distance.
pub fn disk_covering(origin: CellIndex, radius_km: f64) -> Vec<CellIndex> {
    if !(radius_km.is_finite() && radius_km > 0.0) {
        return vec![origin];
    }
    let cache = grid_disk_cache();
    let k = cache.rings_for(origin, radius_km);
    cache.get_or_compute(origin, k)
}
