//! # Local HTTP Egress
//!
//! Issues the actual HTTP request against a local target and shapes the
//! reply into a `response` payload. Never fails upward: any transport
//! problem — refused connection, timeout, unreadable body — synthesizes a
//! well-formed `503` so the relay can always answer the caller with a
//! real HTTP response instead of a protocol error.

use crate::protocol::{RequestPayload, ResponsePayload, MAX_FRAME_BYTES};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Headers recomputed by the egress stack or tied to the ingress socket;
/// never forwarded to the local target.
const DENIED_HEADERS: [&str; 5] = [
    "host",
    "connection",
    "upgrade",
    "transfer-encoding",
    "content-length",
];

/// Methods whose tunneled body is dropped before the local call.
const BODYLESS_METHODS: [&str; 3] = ["GET", "HEAD", "DELETE"];

/// Issue `request` against `base_url` and return the local service's
/// reply, or a synthesized `503` on any failure.
pub async fn execute(
    client: &Client,
    timeout: Duration,
    base_url: &str,
    request: &RequestPayload,
) -> ResponsePayload {
    let method = match Method::from_bytes(request.method.as_bytes()) {
        Ok(method) => method,
        Err(_) => return failure(format!("unsupported method '{}'", request.method)),
    };

    let url = format!(
        "{}{}",
        base_url.trim_end_matches('/'),
        ensure_rooted(&request.path)
    );

    let mut builder = client
        .request(method, &url)
        .timeout(timeout)
        .headers(forwardable_headers(&request.headers));

    let pairs = query_pairs(&request.query);
    if !pairs.is_empty() {
        builder = builder.query(&pairs);
    }

    if !BODYLESS_METHODS.contains(&request.method.to_ascii_uppercase().as_str()) {
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
    }

    match builder.send().await {
        Ok(response) => {
            let status_code = response.status().as_u16();
            let headers = flatten_headers(response.headers());
            match response.text().await {
                // A body that cannot fit in one frame would close the
                // link at the relay; refuse it here instead.
                Ok(body) if body.len() > MAX_FRAME_BYTES => {
                    failure(format!("local response body of {} bytes exceeds the tunnel limit", body.len()))
                }
                Ok(body) => ResponsePayload {
                    status_code,
                    headers,
                    body,
                    duration: None,
                    mapping: Some(base_url.to_string()),
                },
                Err(e) => failure(format!("reading response body: {e}")),
            }
        }
        Err(e) => {
            warn!("Local request to {} failed: {}", url, e);
            failure(e.to_string())
        }
    }
}

fn ensure_rooted(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Flatten the frame's query map into repeatable pairs; array values
/// become repeated keys.
fn query_pairs(query: &serde_json::Map<String, Value>) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (key, value) in query {
        match value {
            Value::Array(items) => {
                for item in items {
                    pairs.push((key.clone(), scalar(item)));
                }
            }
            other => pairs.push((key.clone(), scalar(other))),
        }
    }
    pairs
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn forwardable_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if DENIED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            map.insert(name, value);
        }
    }
    map
}

/// Response headers flattened to a string map, last value winning.
fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut flat = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            flat.insert(name.as_str().to_string(), value.to_string());
        }
    }
    flat
}

fn failure(detail: String) -> ResponsePayload {
    ResponsePayload {
        status_code: 503,
        headers: HashMap::from([(
            "content-type".to_string(),
            "application/json".to_string(),
        )]),
        body: json!({
            "error": "Service Unavailable",
            "message": detail,
            "code": "HTTP_REQUEST_FAILED",
        })
        .to_string(),
        duration: None,
        mapping: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use wiremock::matchers::{body_string, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn request(method: &str, path: &str) -> RequestPayload {
        RequestPayload {
            method: method.to_string(),
            path: path.to_string(),
            headers: HashMap::new(),
            body: None,
            query: Map::new(),
            target_mapping: None,
        }
    }

    #[tokio::test]
    async fn forwards_method_path_query_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/items"))
            .and(query_param("x", "1"))
            .and(body_string("{\"n\":1}"))
            .respond_with(ResponseTemplate::new(201).set_body_string("created"))
            .expect(1)
            .mount(&server)
            .await;

        let mut req = request("POST", "/items");
        req.body = Some("{\"n\":1}".to_string());
        req.query.insert("x".to_string(), Value::String("1".to_string()));

        let response = execute(&Client::new(), TIMEOUT, &server.uri(), &req).await;
        assert_eq!(response.status_code, 201);
        assert_eq!(response.body, "created");
        assert_eq!(response.mapping.as_deref(), Some(server.uri().as_str()));
    }

    #[tokio::test]
    async fn body_is_dropped_for_get_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/x"))
            .and(body_string(""))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut req = request("GET", "/x");
        req.body = Some("should never reach the wire".to_string());

        let response = execute(&Client::new(), TIMEOUT, &server.uri(), &req).await;
        assert_eq!(response.status_code, 200);
    }

    #[tokio::test]
    async fn deny_listed_headers_are_stripped_and_the_rest_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/h"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let mut req = request("GET", "/h");
        req.headers = HashMap::from([
            ("Host".to_string(), "spoofed.example".to_string()),
            ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ("x-request-id".to_string(), "req-7".to_string()),
        ]);

        execute(&Client::new(), TIMEOUT, &server.uri(), &req).await;

        let received = &server.received_requests().await.unwrap()[0];
        assert_eq!(
            received.headers.get("x-request-id").unwrap().to_str().unwrap(),
            "req-7"
        );
        assert!(received.headers.get("transfer-encoding").is_none());
        // reqwest recomputes Host for the real target.
        assert_ne!(
            received.headers.get("host").unwrap().to_str().unwrap(),
            "spoofed.example"
        );
    }

    #[tokio::test]
    async fn array_query_values_repeat_the_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/q"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut req = request("GET", "/q");
        req.query.insert(
            "tag".to_string(),
            Value::Array(vec!["a".into(), "b".into()]),
        );

        execute(&Client::new(), TIMEOUT, &server.uri(), &req).await;

        let received = &server.received_requests().await.unwrap()[0];
        let raw_query = received.url.query().unwrap();
        assert!(raw_query.contains("tag=a"));
        assert!(raw_query.contains("tag=b"));
    }

    #[tokio::test]
    async fn unreachable_targets_synthesize_a_503() {
        // Nothing listens here.
        let response = execute(
            &Client::new(),
            TIMEOUT,
            "http://127.0.0.1:1",
            &request("GET", "/x"),
        )
        .await;

        assert_eq!(response.status_code, 503);
        let body: Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["error"], "Service Unavailable");
        assert_eq!(body["code"], "HTTP_REQUEST_FAILED");
    }

    #[tokio::test]
    async fn slow_targets_time_out_into_a_503() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let response = execute(
            &Client::new(),
            Duration::from_millis(100),
            &server.uri(),
            &request("GET", "/slow"),
        )
        .await;
        assert_eq!(response.status_code, 503);
    }

    #[tokio::test]
    async fn response_headers_are_flattened() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hdr"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-upstream", "local")
                    .set_body_string("ok"),
            )
            .mount(&server)
            .await;

        let response = execute(&Client::new(), TIMEOUT, &server.uri(), &request("GET", "/hdr")).await;
        assert_eq!(
            response.headers.get("x-upstream").map(String::as_str),
            Some("local")
        );
    }
}
