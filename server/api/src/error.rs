use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("rate limit exceeded")]
    RateLimited { retry_after_seconds: u64 },
    #[error("{0}")]
    Validation(String),
    #[error("subscription limit reached: {0}")]
    LimitReached(String),
    #[error(transparent)]
    Store(#[from] guardant_store::StoreError),
    #[error(transparent)]
    Bus(#[from] guardant_bus::BusError),
    #[error(transparent)]
    Registry(#[from] guardant_registry::RegistryError),
}

impl From<guardant_core::ServiceValidationError> for ApiError {
    fn from(err: guardant_core::ServiceValidationError) -> Self {
        ApiError::Validation(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthenticated => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::RateLimited {
                retry_after_seconds,
            } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({ "error": "rate limit exceeded" })),
                )
                    .into_response();
                if let Ok(value) = retry_after_seconds.to_string().parse() {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                return response;
            }
            ApiError::Validation(message) => (StatusCode::BAD_REQUEST, message.clone()),
            ApiError::LimitReached(message) => (StatusCode::UNPROCESSABLE_ENTITY, message.clone()),
            ApiError::Registry(guardant_registry::RegistryError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            ApiError::Registry(guardant_registry::RegistryError::BadToken(_)) => {
                (StatusCode::FORBIDDEN, "forbidden".to_string())
            }
            ApiError::Store(_) | ApiError::Bus(_) | ApiError::Registry(_) => {
                tracing::error!(error = %self, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
