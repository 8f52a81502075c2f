//! Health, service metadata, and fallthrough responses.

use crate::api::{ClientResponse, SharedResponse};
use hyper::StatusCode;
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn health(request_id: &str) -> SharedResponse {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default();

    ClientResponse::json(
        StatusCode::OK,
        &json!({ "status": "healthy", "timestamp": timestamp }),
        request_id,
    )
}

pub fn service_info(request_id: &str) -> SharedResponse {
    ClientResponse::json(
        StatusCode::OK,
        &json!({
            "service": "babelgate",
            "version": env!("CARGO_PKG_VERSION"),
            "endpoints": [
                "POST /translate/<key>",
                "ANY /providers/gemini/<path>",
                "ANY /v1beta/<path>",
                "GET /health",
            ],
        }),
        request_id,
    )
}

pub fn favicon(request_id: &str) -> SharedResponse {
    ClientResponse::empty(StatusCode::NO_CONTENT, request_id)
}

pub fn not_found(request_id: &str) -> SharedResponse {
    ClientResponse::json(
        StatusCode::NOT_FOUND,
        &json!({
            "error": "Not found",
            "message": "No route matches the request",
            "request_id": request_id,
        }),
        request_id,
    )
}
