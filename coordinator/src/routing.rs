//! Region selection and worker scoring.

use guardant_core::{builtin_region, GeoPoint, RegionStrategy, Service};

use crate::catalog::{ActiveWorker, WorkerPool};

/// Score one candidate worker for a service. Capacity headroom weighs
/// 1.0, region-capability tag match 10, geographic proximity up to 100
/// (fading by 1 per 100 km), and current load subtracts 1.0 per in-use
/// slot fraction.
pub fn score_worker(worker: &ActiveWorker, service: &Service, service_coords: Option<GeoPoint>) -> f64 {
    let limits = &worker.registration.capabilities.limits;
    let inflight_estimate = worker.heartbeat.buffer_depth as f64;
    let headroom = (limits.max_concurrency as f64 - inflight_estimate).max(0.0);
    let load_factor = if limits.max_concurrency == 0 {
        1.0
    } else {
        inflight_estimate / limits.max_concurrency as f64
    };

    let tag_match = if worker
        .registration
        .capabilities
        .supports(service.service_type)
    {
        10.0
    } else {
        0.0
    };

    let proximity = match service_coords {
        Some(coords) => {
            let distance_km = worker
                .registration
                .location
                .coordinates
                .distance_km(&coords);
            (100.0 - distance_km / 100.0).max(0.0)
        }
        None => 0.0,
    };

    headroom + tag_match + proximity - load_factor
}

/// Best eligible worker in a region; ties break on the smallest
/// `worker_id` for determinism.
pub fn select_worker<'a>(
    candidates: &'a [ActiveWorker],
    service: &Service,
    service_coords: Option<GeoPoint>,
) -> Option<&'a ActiveWorker> {
    candidates
        .iter()
        .filter(|worker| {
            worker
                .registration
                .capabilities
                .supports(service.service_type)
        })
        .max_by(|a, b| {
            score_worker(a, service, service_coords)
                .total_cmp(&score_worker(b, service, service_coords))
                // Reversed id ordering so max_by picks the smallest id on ties.
                .then_with(|| b.registration.worker_id.cmp(&a.registration.worker_id))
        })
}

/// Approximate service position as the centroid of its preferred regions'
/// catalogue coordinates; used by the `closest` strategy.
pub fn estimate_service_coords(service: &Service) -> Option<GeoPoint> {
    let coords: Vec<GeoPoint> = service
        .regions
        .iter()
        .filter_map(|id| builtin_region(id))
        .map(|region| region.coordinates)
        .collect();
    if coords.is_empty() {
        return None;
    }
    Some(GeoPoint::new(
        coords.iter().map(|c| c.lat).sum::<f64>() / coords.len() as f64,
        coords.iter().map(|c| c.lon).sum::<f64>() / coords.len() as f64,
    ))
}

/// Choose target regions for one dispatch cycle.
///
/// Covered preferred regions come first (ordered per the strategy); when
/// they fall short of `min_regions`, additional covered regions fill the
/// gap.
pub fn choose_regions(
    service: &Service,
    pool: &WorkerPool,
    round_robin_cursor: usize,
) -> Vec<String> {
    let eligible = |region: &str| {
        pool.by_region
            .get(region)
            .map(|workers| {
                select_worker(workers, service, None).is_some()
            })
            .unwrap_or(false)
    };

    let covered: Vec<String> = service
        .regions
        .iter()
        .filter(|region| eligible(region))
        .cloned()
        .collect();

    let min_regions = service.routing.min_regions.max(1);
    let mut chosen: Vec<String> = match service.routing.strategy {
        RegionStrategy::All => covered.clone(),
        RegionStrategy::Closest => {
            let coords = estimate_service_coords(service);
            let mut ranked = covered.clone();
            if let Some(coords) = coords {
                ranked.sort_by(|a, b| {
                    let da = builtin_region(a)
                        .map(|r| r.coordinates.distance_km(&coords))
                        .unwrap_or(f64::MAX);
                    let db = builtin_region(b)
                        .map(|r| r.coordinates.distance_km(&coords))
                        .unwrap_or(f64::MAX);
                    da.total_cmp(&db)
                });
            }
            ranked.truncate(min_regions);
            ranked
        }
        RegionStrategy::RoundRobin => {
            if covered.is_empty() {
                Vec::new()
            } else {
                vec![covered[round_robin_cursor % covered.len()].clone()]
            }
        }
        RegionStrategy::Failover => covered.iter().take(2).cloned().collect(),
    };

    // Fill to min_regions from any other covered region.
    if chosen.len() < min_regions {
        let mut extras: Vec<String> = pool
            .by_region
            .keys()
            .filter(|region| !chosen.contains(region) && eligible(region))
            .cloned()
            .collect();
        extras.sort();
        for extra in extras {
            if chosen.len() >= min_regions {
                break;
            }
            chosen.push(extra);
        }
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use guardant_core::{
        Heartbeat, RoutingPolicy, ServiceType, TypeConfig, WorkerCapabilities, WorkerLocation,
        WorkerRegistration,
    };
    use std::collections::HashMap;
    use uuid::Uuid;

    fn worker(id: &str, lat: f64, lon: f64, buffer_depth: usize) -> ActiveWorker {
        ActiveWorker {
            registration: WorkerRegistration {
                worker_id: id.to_string(),
                owner_email: "ops@example.com".into(),
                location: WorkerLocation {
                    city: "X".into(),
                    country: "Y".into(),
                    continent: "Z".into(),
                    coordinates: GeoPoint::new(lat, lon),
                    asn: None,
                    isp: None,
                },
                capabilities: WorkerCapabilities::default(),
                status: Default::default(),
                counters: Default::default(),
                registered_at: Utc::now(),
            },
            heartbeat: Heartbeat {
                worker_id: id.to_string(),
                version: "0.1.0".into(),
                region: "eu-central-1".into(),
                last_seen: Utc::now(),
                checks_ok: 0,
                checks_fail: 0,
                total_points: 0.0,
                current_period_points: 0.0,
                avg_rt_ms: 0.0,
                buffer_depth,
                connected: true,
                last_update_error: None,
            },
        }
    }

    fn service(regions: &[&str], strategy: RegionStrategy, min_regions: usize) -> Service {
        Service {
            id: Uuid::new_v4(),
            nest_id: Uuid::new_v4(),
            name: "svc".into(),
            service_type: ServiceType::Web,
            target: "https://example.com".into(),
            type_config: TypeConfig::default_for(ServiceType::Web),
            interval_seconds: 60,
            timeout_ms: 5000,
            regions: regions.iter().map(|s| s.to_string()).collect(),
            routing: RoutingPolicy {
                strategy,
                min_regions,
            },
            is_active: true,
        }
    }

    fn pool(regions: &[(&str, Vec<ActiveWorker>)]) -> WorkerPool {
        WorkerPool {
            by_region: regions
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn tie_breaks_on_smallest_worker_id() {
        let candidates = vec![worker("w-b", 0.0, 0.0, 0), worker("w-a", 0.0, 0.0, 0)];
        let svc = service(&["eu-central-1"], RegionStrategy::All, 1);
        let selected = select_worker(&candidates, &svc, None).unwrap();
        assert_eq!(selected.registration.worker_id, "w-a");
    }

    #[test]
    fn loaded_worker_scores_lower() {
        let candidates = vec![worker("w-a", 0.0, 0.0, 9), worker("w-b", 0.0, 0.0, 0)];
        let svc = service(&["eu-central-1"], RegionStrategy::All, 1);
        let selected = select_worker(&candidates, &svc, None).unwrap();
        assert_eq!(selected.registration.worker_id, "w-b");
    }

    #[test]
    fn all_strategy_takes_every_covered_region() {
        let svc = service(&["eu-central-1", "us-east-1", "sa-east-1"], RegionStrategy::All, 1);
        let pool = pool(&[
            ("eu-central-1", vec![worker("w-1", 50.0, 8.0, 0)]),
            ("us-east-1", vec![worker("w-2", 39.0, -77.0, 0)]),
        ]);
        let regions = choose_regions(&svc, &pool, 0);
        assert_eq!(regions, vec!["eu-central-1", "us-east-1"]);
    }

    #[test]
    fn round_robin_rotates() {
        let svc = service(&["eu-central-1", "us-east-1"], RegionStrategy::RoundRobin, 1);
        let pool = pool(&[
            ("eu-central-1", vec![worker("w-1", 50.0, 8.0, 0)]),
            ("us-east-1", vec![worker("w-2", 39.0, -77.0, 0)]),
        ]);
        assert_eq!(choose_regions(&svc, &pool, 0), vec!["eu-central-1"]);
        assert_eq!(choose_regions(&svc, &pool, 1), vec!["us-east-1"]);
        assert_eq!(choose_regions(&svc, &pool, 2), vec!["eu-central-1"]);
    }

    #[test]
    fn fills_to_min_regions_from_extras() {
        let svc = service(&["sa-east-1"], RegionStrategy::All, 2);
        let pool = pool(&[
            ("eu-central-1", vec![worker("w-1", 50.0, 8.0, 0)]),
            ("us-east-1", vec![worker("w-2", 39.0, -77.0, 0)]),
        ]);
        // Preferred region has no coverage; both extras fill in.
        let regions = choose_regions(&svc, &pool, 0);
        assert_eq!(regions, vec!["eu-central-1", "us-east-1"]);
    }

    #[test]
    fn closest_prefers_nearby_regions() {
        let svc = service(
            &["eu-central-1", "eu-west-1", "ap-northeast-1"],
            RegionStrategy::Closest,
            2,
        );
        let pool = pool(&[
            ("eu-central-1", vec![worker("w-1", 50.0, 8.0, 0)]),
            ("eu-west-1", vec![worker("w-2", 53.0, -6.0, 0)]),
            ("ap-northeast-1", vec![worker("w-3", 35.6, 139.6, 0)]),
        ]);
        let regions = choose_regions(&svc, &pool, 0);
        assert_eq!(regions.len(), 2);
        assert!(regions.contains(&"eu-central-1".to_string()));
        assert!(regions.contains(&"eu-west-1".to_string()));
    }
}
