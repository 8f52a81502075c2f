//! The batched translation endpoint.

use crate::api::{ClientResponse, SharedResponse};
use crate::auth::extract_client_key;
use crate::errors::GatewayError;
use crate::service::Core;
use bytes::Bytes;
use http::{HeaderMap, Method};
use hyper::StatusCode;
use serde_json::{Value, json};

const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug)]
struct TranslateRequest {
    source_lang: Option<String>,
    target_lang: String,
    text_list: Vec<String>,
}

pub async fn handle(
    core: &Core,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    body: Option<&Bytes>,
    request_id: &str,
) -> SharedResponse {
    let Some(client_key) = extract_client_key(method, path, headers) else {
        return ClientResponse::error(&GatewayError::AuthMissing, request_id);
    };
    if !core.pool.validate_auth(&client_key).await {
        return ClientResponse::error(&GatewayError::AuthInvalid, request_id);
    }

    let request = match parse_request(body) {
        Ok(request) => request,
        Err(err) => return ClientResponse::error(&err, request_id),
    };

    match core
        .engine
        .translate_batch(
            &request.text_list,
            &request.target_lang,
            request.source_lang.as_deref(),
            request_id,
        )
        .await
    {
        Ok(translations) => ClientResponse::json(
            StatusCode::OK,
            &json!({ "translations": translations }),
            request_id,
        ),
        Err(err) => {
            tracing::error!(request_id, error = %err, "translation pipeline failed");
            ClientResponse::error(&err, request_id)
        }
    }
}

fn parse_request(body: Option<&Bytes>) -> Result<TranslateRequest, GatewayError> {
    let body = body
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("request body is required".to_string()))?;
    let value: Value = serde_json::from_slice(body)
        .map_err(|_| GatewayError::BadRequest("request body must be valid JSON".to_string()))?;

    let Some(list) = value.get("text_list").and_then(Value::as_array) else {
        return Err(GatewayError::BadRequest(
            "text_list is required and must be an array".to_string(),
        ));
    };
    let mut text_list = Vec::with_capacity(list.len());
    for item in list {
        match item.as_str() {
            Some(text) => text_list.push(text.to_string()),
            None => {
                return Err(GatewayError::BadRequest(
                    "text_list entries must be strings".to_string(),
                ));
            }
        }
    }
    if text_list.len() > MAX_BATCH_SIZE {
        return Err(GatewayError::BatchTooLarge(MAX_BATCH_SIZE));
    }

    let target_lang = value
        .get("target_lang")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|lang| !lang.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("target_lang is required".to_string()))?
        .to_string();

    let source_lang = value
        .get("source_lang")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|lang| !lang.is_empty())
        .map(str::to_string);

    Ok(TranslateRequest {
        source_lang,
        target_lang,
        text_list,
    })
}
