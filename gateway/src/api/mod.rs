//! Buffered client responses and the per-endpoint handlers.

pub mod passthrough;
pub mod status;
pub mod translate;

use crate::errors::GatewayError;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use std::sync::Arc;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// A fully buffered response. Shared as-is between coalesced joiners, so
/// everything in it, including the request id header, is common to all of
/// them.
#[derive(Debug)]
pub struct ClientResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub type SharedResponse = Arc<ClientResponse>;

impl ClientResponse {
    pub fn json(status: StatusCode, value: &serde_json::Value, request_id: &str) -> SharedResponse {
        let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        set_request_id(&mut headers, request_id);
        Arc::new(ClientResponse {
            status,
            headers,
            body: Bytes::from(body),
        })
    }

    pub fn error(err: &GatewayError, request_id: &str) -> SharedResponse {
        Self::json(
            err.status_code(),
            &serde_json::json!({
                "error": err.client_error(),
                "message": err.client_message(),
                "request_id": request_id,
            }),
            request_id,
        )
    }

    pub fn empty(status: StatusCode, request_id: &str) -> SharedResponse {
        let mut headers = HeaderMap::new();
        set_request_id(&mut headers, request_id);
        Arc::new(ClientResponse {
            status,
            headers,
            body: Bytes::new(),
        })
    }
}

pub(crate) fn set_request_id(headers: &mut HeaderMap, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
}
