//! Bearer authentication and principal resolution.
//!
//! Tokens are opaque; each maps to a stored [`Principal`] under
//! `token:<value>`. Every endpoint scopes to the principal's nest unless
//! the role is `platform_admin`.

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    NestUser,
    PlatformAdmin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub nest_id: Option<Uuid>,
    pub role: Role,
}

impl Principal {
    pub fn is_platform_admin(&self) -> bool {
        self.role == Role::PlatformAdmin
    }

    /// The nest this principal may act on; cross-nest access is a 403,
    /// never a 404, so existence of other nests does not leak through
    /// admin endpoints either.
    pub fn authorize_nest(&self, nest_id: Uuid) -> Result<(), ApiError> {
        if self.is_platform_admin() || self.nest_id == Some(nest_id) {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }

    pub fn require_platform_admin(&self) -> Result<(), ApiError> {
        if self.is_platform_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

pub fn token_key(token: &str) -> String {
    format!("token:{token}")
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Resolve the caller or fail with 401.
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthenticated)?;
    guardant_store::get_json::<Principal>(state.store.as_ref(), &token_key(token))
        .await?
        .ok_or(ApiError::Unauthenticated)
}

/// Install a principal's token, used by bootstrap and tests.
pub async fn install_token(
    store: &dyn guardant_store::TenantStore,
    token: &str,
    principal: &Principal,
) -> Result<(), guardant_store::StoreError> {
    guardant_store::set_json(store, &token_key(token), principal).await
}
