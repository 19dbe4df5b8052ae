//! # HTTP Ingress
//!
//! The generic handler behind every path the operator API does not claim.
//! It buffers the inbound body (bounded), hands the request to the
//! dispatcher with the original full path, and writes the tunneled
//! response back — status first, then headers, then the body, with
//! content-length recomputed. Dispatcher failures surface as an HTTP 500
//! JSON envelope.

use crate::dispatch;
use crate::error::ProxyError;
use crate::protocol::ResponsePayload;
use crate::state::AppState;
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

pub async fn ingress_handler(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let method = parts.method.as_str().to_string();
    let path = parts.uri.path().to_string();
    let query = parse_query(parts.uri.query());
    let headers = flatten_headers(&parts.headers);

    let bytes = match to_bytes(body, state.settings.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return envelope(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
                "BODY_TOO_LARGE",
            )
        }
    };
    let body = normalize_body(&bytes);

    match dispatch::dispatch(&state, &method, &path, headers, body, query).await {
        Ok(response) => tunnel_response(response),
        Err(e) => proxy_error_response(&e),
    }
}

/// Collect a header map into a flat string map, last value winning for
/// duplicate names. Values that are not valid UTF-8 are dropped.
pub fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut flat = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            flat.insert(name.as_str().to_string(), value.to_string());
        }
    }
    flat
}

/// Parse a raw query string into the frame's query map. Repeated keys
/// collect into arrays so the egress can replay them as repeated pairs.
pub fn parse_query(raw: Option<&str>) -> Map<String, Value> {
    let mut map = Map::new();
    let Some(raw) = raw else { return map };
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        let key = key.into_owned();
        let value = Value::String(value.into_owned());
        match map.get_mut(&key) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                map.insert(key, value);
            }
        }
    }
    map
}

/// JSON bodies are forwarded in canonical serialization; anything else
/// passes through byte-for-byte. Empty bodies stay absent.
pub fn normalize_body(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => Some(value.to_string()),
        Err(_) => Some(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Copy the tunneled response back to the HTTP caller.
fn tunnel_response(payload: ResponsePayload) -> Response {
    let status = StatusCode::from_u16(payload.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &payload.headers {
            let lower = name.to_ascii_lowercase();
            // Recomputed from the body written below.
            if lower == "content-length" || lower == "transfer-encoding" {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
    }
    builder
        .body(Body::from(payload.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// The JSON envelope for a failed dispatch.
pub fn proxy_error_response(error: &ProxyError) -> Response {
    envelope(
        StatusCode::INTERNAL_SERVER_ERROR,
        &error.to_string(),
        error.code(),
    )
}

fn envelope(status: StatusCode, message: &str, code: &str) -> Response {
    (
        status,
        Json(json!({
            "error": "Proxy error",
            "message": message,
            "code": code,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_strings_collect_repeated_keys_into_arrays() {
        let query = parse_query(Some("x=1&tag=a&tag=b&tag=c"));
        assert_eq!(query["x"], Value::String("1".into()));
        assert_eq!(
            query["tag"],
            Value::Array(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn absent_query_yields_an_empty_map() {
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn json_bodies_are_canonicalized() {
        let body = normalize_body(b"{ \"b\" : 2,\n \"a\" : 1 }").unwrap();
        // Canonical serde_json form: no interstitial whitespace, sorted keys.
        assert_eq!(body, "{\"a\":1,\"b\":2}");
    }

    #[test]
    fn non_json_bodies_pass_through_unchanged() {
        assert_eq!(
            normalize_body(b"plain text, not json").as_deref(),
            Some("plain text, not json")
        );
        assert_eq!(normalize_body(b""), None);
    }

    #[test]
    fn duplicate_headers_keep_the_last_value() {
        let mut headers = HeaderMap::new();
        headers.append("x-tag", HeaderValue::from_static("first"));
        headers.append("x-tag", HeaderValue::from_static("second"));
        let flat = flatten_headers(&headers);
        assert_eq!(flat.get("x-tag").map(String::as_str), Some("second"));
    }

    #[tokio::test]
    async fn tunnel_responses_copy_status_and_headers() {
        let payload = ResponsePayload {
            status_code: 201,
            headers: HashMap::from([
                ("content-type".to_string(), "application/json".to_string()),
                ("content-length".to_string(), "999".to_string()),
            ]),
            body: "{\"ok\":true}".to_string(),
            duration: Some(12),
            mapping: None,
        };
        let response = tunnel_response(payload);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        // Stale content-length from the agent is not copied through.
        assert!(response.headers().get("content-length").is_none());

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"{\"ok\":true}");
    }

    #[test]
    fn dispatch_failures_render_the_envelope() {
        let response = proxy_error_response(&ProxyError::Timeout);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
