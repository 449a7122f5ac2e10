//! External agronomic data: the weather provider and radius queries over
//! pest reports.

use crate::entities;
use crate::errors::SakhiError;
use crate::geo;
use crate::storage::{self, NewWeatherObs};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};

/// Source of weather observations for the scheduled refresh
#[derive(Debug, Clone, Copy, Default)]
pub enum WeatherProvider {
    /// Plausible Kerala readings, stable per district and hour
    #[default]
    Dummy,
}

impl WeatherProvider {
    pub fn name(&self) -> &'static str {
        match self {
            WeatherProvider::Dummy => "dummy",
        }
    }

    pub async fn observe(&self, district: &str, at: i64) -> Result<NewWeatherObs, SakhiError> {
        match self {
            WeatherProvider::Dummy => Ok(dummy_observation(district, at)),
        }
    }
}

fn dummy_observation(district: &str, at: i64) -> NewWeatherObs {
    let seed = district
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))
        .wrapping_add((at / 3600) as u64);
    let step = |modulus: u64| (seed % modulus) as f64;
    NewWeatherObs {
        district: district.to_string(),
        timestamp: Some(at),
        temp_c: Some(26.0 + step(5)),
        temp_min_c: Some(22.0 + step(3)),
        temp_max_c: Some(30.0 + step(4)),
        humidity: Some(70.0 + step(2) * 10.0),
        wind_speed_ms: Some(2.0 + step(3)),
        rain_24h_mm: Some(if seed % 3 == 0 { 5.0 + step(2) * 3.0 } else { 0.0 }),
        is_forecast: false,
        source: Some(WeatherProvider::Dummy.name().to_string()),
    }
}

/// Record a fresh observation for every district that has farmers
pub async fn refresh_weather(
    db: &DatabaseConnection,
    provider: &WeatherProvider,
) -> Result<u64, SakhiError> {
    let now = Utc::now().timestamp();
    let mut stored = 0;
    for district in storage::farmer_districts(db).await? {
        match provider.observe(&district, now).await {
            Ok(obs) => {
                storage::insert_weather_obs(db, obs).await?;
                stored += 1;
            }
            Err(e) => tracing::warn!(%district, provider = provider.name(), error = %e, "Weather refresh failed"),
        }
    }
    Ok(stored)
}

#[derive(Debug, Deserialize)]
pub struct PestQuery {
    pub district: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub radius_km: Option<f64>,
    /// Unix seconds; defaults to the last 7 days
    pub since: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NearbyPestReport {
    #[serde(flatten)]
    pub report: entities::pest_report::Model,
    pub distance_km: f64,
}

pub const DEFAULT_RADIUS_KM: f64 = 25.0;
pub const MAX_RADIUS_KM: f64 = 500.0;

/// Located pest reports within `radius_km` of a point, nearest first
pub async fn pests_near(
    db: &DatabaseConnection,
    lat: f64,
    lon: f64,
    radius_km: f64,
    since: i64,
) -> Result<Vec<NearbyPestReport>, SakhiError> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(SakhiError::BadRequest("lat/lon out of range".into()));
    }
    if !(radius_km > 0.0 && radius_km <= MAX_RADIUS_KM) {
        return Err(SakhiError::BadRequest(format!(
            "radius_km must be within 0..{MAX_RADIUS_KM}"
        )));
    }
    let bbox = geo::bounding_box(lat, lon, radius_km);
    let mut nearby: Vec<NearbyPestReport> = storage::pest_reports_in_box(db, bbox, since)
        .await?
        .into_iter()
        .filter_map(|report| {
            let (rlat, rlon) = (report.lat?, report.lon?);
            let distance_km = geo::haversine_km(lat, lon, rlat, rlon);
            (distance_km <= radius_km).then_some(NearbyPestReport {
                report,
                distance_km,
            })
        })
        .collect();
    nearby.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
    Ok(nearby)
}

/// Pest reports by district or around a point, whichever the query names
pub async fn query_pests(
    db: &DatabaseConnection,
    q: &PestQuery,
) -> Result<Vec<NearbyPestReport>, SakhiError> {
    let since = q
        .since
        .unwrap_or_else(|| Utc::now().timestamp() - crate::rules::PEST_LOOKBACK_SECS);
    match (q.lat, q.lon, q.district.as_deref()) {
        (Some(lat), Some(lon), _) => {
            pests_near(db, lat, lon, q.radius_km.unwrap_or(DEFAULT_RADIUS_KM), since).await
        }
        (None, None, Some(district)) => Ok(storage::pest_reports_in_district(db, district, since)
            .await?
            .into_iter()
            .map(|report| NearbyPestReport {
                report,
                distance_km: 0.0,
            })
            .collect()),
        _ => Err(SakhiError::BadRequest(
            "either district or lat and lon are required".into(),
        )),
    }
}
