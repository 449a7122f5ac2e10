//! Great-circle distance helpers for radius queries.

pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

/// Haversine distance in kilometres
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Box that contains every point within `radius_km` of the centre.
/// Used as a cheap index-friendly pre-filter before the exact distance check.
pub fn bounding_box(lat: f64, lon: f64, radius_km: f64) -> BoundingBox {
    let d_lat = (radius_km / EARTH_RADIUS_KM).to_degrees();
    let cos_lat = lat.to_radians().cos().abs().max(1e-6);
    let d_lon = (radius_km / (EARTH_RADIUS_KM * cos_lat)).to_degrees().min(180.0);
    BoundingBox {
        min_lat: (lat - d_lat).max(-90.0),
        max_lat: (lat + d_lat).min(90.0),
        min_lon: (lon - d_lon).max(-180.0),
        max_lon: (lon + d_lon).min(180.0),
    }
}
