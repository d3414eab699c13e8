//! Service catalogue and worker pool snapshots read each scheduling tick.

use std::collections::HashMap;
use std::sync::Arc;

use guardant_core::{Heartbeat, Nest, Service, WorkerRegistration};
use guardant_registry::{ListFilter, WorkerRegistry};
use guardant_store::{get_json, keys, scan_all, StoreError, TenantStore};
use uuid::Uuid;

/// One schedulable service with its owning nest resolved.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub service: Service,
    pub nest: Nest,
}

/// Active workers with their latest heartbeat, keyed by region.
#[derive(Debug, Clone, Default)]
pub struct WorkerPool {
    pub by_region: HashMap<String, Vec<ActiveWorker>>,
}

#[derive(Debug, Clone)]
pub struct ActiveWorker {
    pub registration: WorkerRegistration,
    pub heartbeat: Heartbeat,
}

impl WorkerPool {
    pub fn regions_with_coverage(&self) -> Vec<&str> {
        self.by_region.keys().map(String::as_str).collect()
    }
}

/// Active services of active nests. Index keys sharing the `nest:` prefix
/// (subdomain/email lookups) are skipped by the id parse.
pub async fn load_catalog(store: &dyn TenantStore) -> Result<Vec<CatalogEntry>, StoreError> {
    let mut nests: HashMap<Uuid, Nest> = HashMap::new();
    for key in scan_all(store, "nest:").await? {
        let Some(id) = key
            .strip_prefix("nest:")
            .and_then(|rest| rest.parse::<Uuid>().ok())
        else {
            continue;
        };
        if let Some(nest) = get_json::<Nest>(store, &key).await? {
            if nest.is_active {
                nests.insert(id, nest);
            }
        }
    }

    let mut entries = Vec::new();
    for key in scan_all(store, "service:").await? {
        let Some(service) = get_json::<Service>(store, &key).await? else {
            continue;
        };
        if !service.is_active {
            continue;
        }
        if let Some(nest) = nests.get(&service.nest_id) {
            entries.push(CatalogEntry {
                service,
                nest: nest.clone(),
            });
        }
    }
    entries.sort_by_key(|entry| entry.service.id);
    Ok(entries)
}

/// Snapshot of live, approved, unsuspended workers grouped by the region
/// their heartbeat reports.
pub async fn load_worker_pool(
    registry: &Arc<WorkerRegistry>,
) -> Result<WorkerPool, guardant_registry::RegistryError> {
    let now = chrono::Utc::now();
    let registrations: HashMap<String, WorkerRegistration> = registry
        .list(ListFilter::Approved)
        .await?
        .into_iter()
        .filter(|r| !r.status.suspended)
        .map(|r| (r.worker_id.clone(), r))
        .collect();

    let mut pool = WorkerPool::default();
    for heartbeat in registry.live_heartbeats().await? {
        if !heartbeat.is_active(now) {
            continue;
        }
        let Some(registration) = registrations.get(&heartbeat.worker_id) else {
            continue;
        };
        pool.by_region
            .entry(heartbeat.region.clone())
            .or_default()
            .push(ActiveWorker {
                registration: registration.clone(),
                heartbeat,
            });
    }
    Ok(pool)
}

pub async fn store_nest(store: &dyn TenantStore, nest: &Nest) -> Result<(), StoreError> {
    guardant_store::set_json(store, &keys::nest(nest.id), nest).await?;
    store
        .set(&keys::nest_by_subdomain(&nest.subdomain), &nest.id.to_string())
        .await?;
    store
        .set(&keys::nest_by_email(&nest.owner_email), &nest.id.to_string())
        .await
}

pub async fn store_service(store: &dyn TenantStore, service: &Service) -> Result<(), StoreError> {
    guardant_store::set_json(store, &keys::service(service.nest_id, service.id), service).await
}
