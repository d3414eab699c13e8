use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Great-circle distance in kilometres.
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lon = (other.lon - self.lon).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

/// A logical grouping of workers by location, used for task routing and
/// status reporting. The static catalogue below is extended at runtime by
/// regions derived from active workers' geolocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub continent: String,
    pub country: String,
    pub city: String,
    pub coordinates: GeoPoint,
    #[serde(default)]
    pub capability_flags: Vec<String>,
}

static BUILTIN_REGIONS: Lazy<Vec<Region>> = Lazy::new(|| {
    let entry = |id: &str, continent: &str, country: &str, city: &str, lat: f64, lon: f64| Region {
        id: id.to_string(),
        continent: continent.to_string(),
        country: country.to_string(),
        city: city.to_string(),
        coordinates: GeoPoint::new(lat, lon),
        capability_flags: vec!["icmp".to_string(), "ipv6".to_string()],
    };
    vec![
        entry("eu-central-1", "Europe", "DE", "Frankfurt", 50.1109, 8.6821),
        entry("eu-west-1", "Europe", "IE", "Dublin", 53.3498, -6.2603),
        entry("us-east-1", "North America", "US", "Ashburn", 39.0438, -77.4874),
        entry("us-west-1", "North America", "US", "San Jose", 37.3382, -121.8863),
        entry("ap-southeast-1", "Asia", "SG", "Singapore", 1.3521, 103.8198),
        entry("ap-northeast-1", "Asia", "JP", "Tokyo", 35.6762, 139.6503),
        entry("sa-east-1", "South America", "BR", "Sao Paulo", -23.5505, -46.6333),
    ]
});

pub fn builtin_catalogue() -> &'static [Region] {
    &BUILTIN_REGIONS
}

pub fn builtin_region(id: &str) -> Option<&'static Region> {
    BUILTIN_REGIONS.iter().find(|r| r.id == id)
}

/// Region id derived from a worker's geolocation, for workers outside the
/// static catalogue: lowercased `city-country`, non-alphanumerics collapsed
/// to hyphens.
pub fn derive_region_id(city: &str, country: &str) -> String {
    let mut id = String::with_capacity(city.len() + country.len() + 1);
    for part in [city, country] {
        if !id.is_empty() {
            id.push('-');
        }
        let mut last_hyphen = true;
        for ch in part.chars() {
            if ch.is_ascii_alphanumeric() {
                id.push(ch.to_ascii_lowercase());
                last_hyphen = false;
            } else if !last_hyphen {
                id.push('-');
                last_hyphen = true;
            }
        }
        while id.ends_with('-') {
            id.pop();
        }
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_known_distance() {
        let frankfurt = GeoPoint::new(50.1109, 8.6821);
        let dublin = GeoPoint::new(53.3498, -6.2603);
        let d = frankfurt.distance_km(&dublin);
        assert!((d - 1088.0).abs() < 30.0, "got {d}");
    }

    #[test]
    fn derive_region_id_normalises() {
        assert_eq!(derive_region_id("Frankfurt", "DE"), "frankfurt-de");
        assert_eq!(derive_region_id("São Paulo", "BR"), "s-o-paulo-br");
        assert_eq!(derive_region_id("New York", "US"), "new-york-us");
    }

    #[test]
    fn builtin_lookup() {
        assert!(builtin_region("eu-central-1").is_some());
        assert!(builtin_region("atlantis-1").is_none());
    }
}
