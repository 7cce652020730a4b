use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use stagehand_provider::ProviderError;

pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::BAD_REQUEST, message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::INTERNAL_SERVER_ERROR, message: msg.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        match e {
            // Configuration mistakes are the caller's to fix.
            ProviderError::Config(_) | ProviderError::NotConfigured(_) => {
                ApiError::bad_request(e.to_string())
            }
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<stagehand_store::StoreError> for ApiError {
    fn from(e: stagehand_store::StoreError) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl From<stagehand_checkout::CheckoutError> for ApiError {
    fn from(e: stagehand_checkout::CheckoutError) -> Self {
        ApiError::internal(e.to_string())
    }
}
