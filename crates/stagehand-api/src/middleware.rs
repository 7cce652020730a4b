use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Every endpoint speaks JSON and nothing else: callers must accept
/// `application/json`, and request bodies must declare it.
pub async fn require_json(request: Request<Body>, next: Next) -> Response {
    if let Some(accept) = request.headers().get(header::ACCEPT).and_then(|v| v.to_str().ok()) {
        if !accept.contains("application/json") && !accept.contains("*/*") {
            return (
                StatusCode::NOT_ACCEPTABLE,
                Json(json!({"error": "this API only supports responses encoded as JSON"})),
            )
                .into_response();
        }
    }

    if matches!(*request.method(), Method::POST | Method::PUT) {
        let content_type = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with("application/json") {
            return (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                Json(json!({"error": "this API only supports requests encoded as JSON"})),
            )
                .into_response();
        }
    }

    next.run(request).await
}
