//! Startup geolocation.
//!
//! External-IP geolocation via the ip-api JSON endpoint, a timezone
//! heuristic as fallback, and a one-hour on-disk cache so restarts don't
//! re-query.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use guardant_core::{derive_region_id, builtin_catalogue, GeoPoint, WorkerLocation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const GEO_ENDPOINT: &str = "http://ip-api.com/json";
const CACHE_TTL_SECONDS: i64 = 3600;
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedLocation {
    pub location: WorkerLocation,
    pub region_id: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GeoApiResponse {
    status: String,
    #[serde(default)]
    city: String,
    #[serde(default, rename = "countryCode")]
    country_code: String,
    #[serde(default)]
    continent: Option<String>,
    #[serde(default)]
    lat: f64,
    #[serde(default)]
    lon: f64,
    #[serde(default)]
    isp: Option<String>,
    #[serde(default, rename = "as")]
    as_field: Option<String>,
}

pub struct Geolocator {
    client: reqwest::Client,
    cache_path: PathBuf,
    endpoint: String,
}

impl Geolocator {
    pub fn new(cache_path: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            cache_path: cache_path.into(),
            endpoint: GEO_ENDPOINT.to_string(),
        }
    }

    /// Test hook pointing at a stub geo service.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Detect where this worker runs. Order: fresh cache, geo lookup
    /// (optionally for an explicit public IP), timezone heuristic.
    pub async fn detect(&self, public_ip: Option<&str>) -> DetectedLocation {
        if let Some(cached) = self.read_cache() {
            debug!(region = %cached.region_id, "using cached location");
            return cached;
        }

        let detected = match self.lookup(public_ip).await {
            Ok(location) => location,
            Err(err) => {
                warn!(error = %err, "geolocation failed; falling back to timezone heuristic");
                timezone_fallback()
            }
        };
        self.write_cache(&detected);
        detected
    }

    async fn lookup(&self, public_ip: Option<&str>) -> Result<DetectedLocation, reqwest::Error> {
        let url = match public_ip {
            Some(ip) => format!("{}/{}", self.endpoint, ip),
            None => self.endpoint.clone(),
        };
        let response: GeoApiResponse = self
            .client
            .get(&url)
            .timeout(LOOKUP_TIMEOUT)
            .query(&[("fields", "status,city,countryCode,continent,lat,lon,isp,as")])
            .send()
            .await?
            .json()
            .await?;

        if response.status != "success" || response.city.is_empty() {
            return Ok(timezone_fallback());
        }

        let asn = response
            .as_field
            .as_deref()
            .and_then(|s| s.strip_prefix("AS"))
            .and_then(|s| s.split_whitespace().next())
            .and_then(|s| s.parse().ok());
        let location = WorkerLocation {
            city: response.city.clone(),
            country: response.country_code.clone(),
            continent: response.continent.unwrap_or_else(|| "Unknown".to_string()),
            coordinates: GeoPoint::new(response.lat, response.lon),
            asn,
            isp: response.isp,
        };
        Ok(DetectedLocation {
            region_id: match_region(&location),
            location,
            detected_at: Utc::now(),
        })
    }

    fn read_cache(&self) -> Option<DetectedLocation> {
        let raw = std::fs::read_to_string(&self.cache_path).ok()?;
        let cached: DetectedLocation = serde_json::from_str(&raw).ok()?;
        if (Utc::now() - cached.detected_at).num_seconds() < CACHE_TTL_SECONDS {
            Some(cached)
        } else {
            None
        }
    }

    fn write_cache(&self, detected: &DetectedLocation) {
        if let Some(parent) = self.cache_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(detected) {
            Ok(raw) => {
                if let Err(err) = std::fs::write(&self.cache_path, raw) {
                    warn!(error = %err, path = %self.cache_path.display(), "location cache write failed");
                }
            }
            Err(err) => warn!(error = %err, "location cache encode failed"),
        }
    }
}

/// Nearest catalogue region within 500 km, else a derived id.
fn match_region(location: &WorkerLocation) -> String {
    builtin_catalogue()
        .iter()
        .map(|region| {
            (
                region.coordinates.distance_km(&location.coordinates),
                &region.id,
            )
        })
        .filter(|(distance, _)| *distance < 500.0)
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, id)| id.clone())
        .unwrap_or_else(|| derive_region_id(&location.city, &location.country))
}

/// Rough location from the system timezone, used when the geo service is
/// unreachable. Produces a continent-level region at catalogue
/// coordinates where possible.
fn timezone_fallback() -> DetectedLocation {
    let tz = std::env::var("TZ")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/timezone").ok())
        .unwrap_or_default();
    let tz = tz.trim();
    let (continent, city) = match tz.split_once('/') {
        Some((continent, city)) => (continent.to_string(), city.replace('_', " ")),
        None => ("Unknown".to_string(), "Unknown".to_string()),
    };

    let region = builtin_catalogue()
        .iter()
        .find(|r| r.continent.eq_ignore_ascii_case(&continent))
        .or_else(|| builtin_catalogue().first());
    let (coordinates, region_id, country) = match region {
        Some(region) => (
            region.coordinates,
            region.id.clone(),
            region.country.clone(),
        ),
        None => (GeoPoint::new(0.0, 0.0), "unknown".to_string(), "??".to_string()),
    };

    DetectedLocation {
        location: WorkerLocation {
            city,
            country,
            continent,
            coordinates,
            asn: None,
            isp: None,
        },
        region_id,
        detected_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_matching_prefers_nearby_catalogue_entry() {
        let frankfurt_suburb = WorkerLocation {
            city: "Offenbach".into(),
            country: "DE".into(),
            continent: "Europe".into(),
            coordinates: GeoPoint::new(50.0956, 8.7761),
            asn: None,
            isp: None,
        };
        assert_eq!(match_region(&frankfurt_suburb), "eu-central-1");

        let remote = WorkerLocation {
            city: "Reykjavik".into(),
            country: "IS".into(),
            continent: "Europe".into(),
            coordinates: GeoPoint::new(64.1466, -21.9426),
            asn: None,
            isp: None,
        };
        assert_eq!(match_region(&remote), "reykjavik-is");
    }

    #[tokio::test]
    async fn cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geo.json");
        let geolocator = Geolocator::new(&path).with_endpoint("http://127.0.0.1:1/json");

        // Endpoint unreachable: falls back, then caches.
        let first = geolocator.detect(None).await;
        let second = geolocator.detect(None).await;
        assert_eq!(first.region_id, second.region_id);
        assert!(path.exists());
    }
}
