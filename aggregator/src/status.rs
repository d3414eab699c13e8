//! Per-service status derivation from the latest per-region states.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use guardant_core::{ProbeStatus, RegionState};

/// Strict-majority rule over the service's configured regions:
/// `up` iff more than half reported up within the last `2 * interval`,
/// `down` iff more than half reported down in that window, otherwise
/// `degraded`. Regions with no recent report count as silent.
pub fn derive_status(
    configured_regions: &[String],
    latest: &BTreeMap<String, RegionState>,
    interval_seconds: u32,
    now: DateTime<Utc>,
) -> ProbeStatus {
    let total = configured_regions.len().max(1);
    let freshness = Duration::seconds(2 * interval_seconds as i64);

    let mut up = 0usize;
    let mut down = 0usize;
    for region in configured_regions {
        let Some(state) = latest.get(region) else {
            continue;
        };
        if now - state.started_at > freshness {
            continue;
        }
        match state.status {
            ProbeStatus::Up => up += 1,
            ProbeStatus::Down => down += 1,
            ProbeStatus::Degraded => {}
        }
    }

    if up * 2 > total {
        ProbeStatus::Up
    } else if down * 2 > total {
        ProbeStatus::Down
    } else {
        ProbeStatus::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardant_core::Sample;
    use uuid::Uuid;

    fn state(status: ProbeStatus, age_seconds: i64, now: DateTime<Utc>) -> RegionState {
        RegionState {
            result_id: Uuid::new_v4(),
            status,
            started_at: now - Duration::seconds(age_seconds),
            rtt_ms: Some(100.0),
            status_code: None,
            sample: Sample::default(),
        }
    }

    fn regions(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn majority_up() {
        let now = Utc::now();
        let configured = regions(&["a", "b", "c"]);
        let mut latest = BTreeMap::new();
        latest.insert("a".to_string(), state(ProbeStatus::Up, 10, now));
        latest.insert("b".to_string(), state(ProbeStatus::Up, 10, now));
        latest.insert("c".to_string(), state(ProbeStatus::Down, 10, now));
        assert_eq!(derive_status(&configured, &latest, 60, now), ProbeStatus::Up);
    }

    #[test]
    fn split_vote_is_degraded() {
        let now = Utc::now();
        let configured = regions(&["a", "b"]);
        let mut latest = BTreeMap::new();
        latest.insert("a".to_string(), state(ProbeStatus::Up, 10, now));
        latest.insert("b".to_string(), state(ProbeStatus::Down, 10, now));
        assert_eq!(
            derive_status(&configured, &latest, 60, now),
            ProbeStatus::Degraded
        );
    }

    #[test]
    fn stale_reports_do_not_vote() {
        let now = Utc::now();
        let configured = regions(&["a", "b"]);
        let mut latest = BTreeMap::new();
        latest.insert("a".to_string(), state(ProbeStatus::Up, 10, now));
        // Older than 2 * interval: silent.
        latest.insert("b".to_string(), state(ProbeStatus::Down, 500, now));
        // 1 of 2 up is not a strict majority.
        assert_eq!(
            derive_status(&configured, &latest, 60, now),
            ProbeStatus::Degraded
        );
    }

    #[test]
    fn single_region_majority() {
        let now = Utc::now();
        let configured = regions(&["a"]);
        let mut latest = BTreeMap::new();
        latest.insert("a".to_string(), state(ProbeStatus::Down, 10, now));
        assert_eq!(
            derive_status(&configured, &latest, 60, now),
            ProbeStatus::Down
        );
    }
}
