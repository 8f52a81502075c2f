//! Client credential extraction from request path and headers.

use http::header::AUTHORIZATION;
use http::{HeaderMap, Method};

/// Derives the client credential, first non-empty wins: the URL path
/// segment of `POST /translate/<key>`, the `x-goog-api-key` header, then
/// the `Authorization` header with an optional `Bearer ` prefix stripped
/// case-insensitively. Whitespace-only values count as absent.
pub fn extract_client_key(method: &Method, path: &str, headers: &HeaderMap) -> Option<String> {
    if *method == Method::POST
        && let Some(rest) = path.strip_prefix("/translate/")
    {
        let segment = rest.split('/').next().unwrap_or("");
        if let Some(key) = non_empty(segment) {
            return Some(key);
        }
    }

    if let Some(value) = headers.get("x-goog-api-key").and_then(|v| v.to_str().ok())
        && let Some(key) = non_empty(value)
    {
        return Some(key);
    }

    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        let token = if value.len() >= 7 && value[..7].eq_ignore_ascii_case("bearer ") {
            &value[7..]
        } else {
            value
        };
        if let Some(key) = non_empty(token) {
            return Some(key);
        }
    }

    None
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
