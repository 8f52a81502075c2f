//! Generic passthrough to the upstream API.
//!
//! The request is forwarded verbatim apart from hop-by-hop headers and the
//! client's own gateway credentials; a pool credential is injected as
//! `x-goog-api-key`. Forwarding runs through the retry executor, so
//! rejected credentials rotate and transient upstream failures back off.

use crate::api::{ClientResponse, SharedResponse, set_request_id};
use crate::errors::GatewayError;
use crate::keypool::KeySet;
use crate::retry::{OutboundRequest, validate_json_response};
use crate::service::Core;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderValue, Method, Version};
use shared::http::{add_via_header, filter_hop_by_hop};
use std::sync::Arc;
use url::Url;

pub async fn handle(
    core: &Core,
    method: &Method,
    version: Version,
    headers: &HeaderMap,
    path_and_query: &str,
    body: Option<&Bytes>,
    request_id: &str,
) -> SharedResponse {
    let target: Url = match format!(
        "{}{}",
        core.config.upstream.trimmed_base_url(),
        path_and_query
    )
    .parse()
    {
        Ok(url) => url,
        Err(err) => {
            tracing::warn!(request_id, error = %err, "unforwardable path");
            return ClientResponse::error(
                &GatewayError::BadRequest("invalid upstream path".to_string()),
                request_id,
            );
        }
    };

    // Forward the client's headers minus hop-by-hop noise and its own
    // gateway credentials; the pool credential replaces them.
    let mut base_headers = headers.clone();
    filter_hop_by_hop(&mut base_headers, version);
    base_headers.remove(HOST);
    base_headers.remove(CONTENT_LENGTH);
    base_headers.remove(AUTHORIZATION);
    base_headers.remove("x-goog-api-key");
    add_via_header(&mut base_headers, version);

    let method = method.clone();
    let body = body.cloned();
    let build = move |credential: &str| {
        let mut headers = base_headers.clone();
        if let Ok(value) = HeaderValue::from_str(credential) {
            headers.insert("x-goog-api-key", value);
        }
        OutboundRequest {
            method: method.clone(),
            url: target.clone(),
            headers,
            body: body.clone(),
        }
    };

    let result = core
        .executor
        .execute(
            &core.pool.source(KeySet::GeminiApi),
            build,
            &validate_json_response,
            request_id,
        )
        .await;

    match result {
        Ok(Some(response)) => {
            let mut headers = response.headers;
            filter_hop_by_hop(&mut headers, Version::HTTP_11);
            headers.remove(CONTENT_LENGTH);
            add_via_header(&mut headers, Version::HTTP_11);
            set_request_id(&mut headers, request_id);
            Arc::new(ClientResponse {
                status: response.status,
                headers,
                body: response.body,
            })
        }
        Ok(None) => ClientResponse::error(
            &GatewayError::Internal("upstream produced no response".to_string()),
            request_id,
        ),
        Err(err) => {
            tracing::error!(request_id, error = %err, "passthrough failed");
            ClientResponse::error(&err, request_id)
        }
    }
}
