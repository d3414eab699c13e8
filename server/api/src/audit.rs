//! Audit trail for every mutating control-plane call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::ApiError;
use crate::AppState;

pub const AUDIT_LOG_KEY: &str = "audit:log";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub actor_user_id: String,
    pub nest_id: Option<Uuid>,
    pub action: String,
    pub target: String,
    pub before: Value,
    pub after: Value,
    pub ts: DateTime<Utc>,
}

/// Record a mutation. Audit failures fail the request: an unauditable
/// mutation must not happen.
pub async fn record(
    state: &AppState,
    principal: &Principal,
    action: &str,
    target: impl Into<String>,
    before: Value,
    after: Value,
) -> Result<(), ApiError> {
    let entry = AuditEntry {
        actor_user_id: principal.user_id.clone(),
        nest_id: principal.nest_id,
        action: action.to_string(),
        target: target.into(),
        before,
        after,
        ts: Utc::now(),
    };
    let member = serde_json::to_string(&entry).map_err(guardant_store::StoreError::from)?;
    state
        .store
        .zadd(
            AUDIT_LOG_KEY,
            &member,
            entry.ts.timestamp_millis() as f64,
        )
        .await?;
    Ok(())
}
