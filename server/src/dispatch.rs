//! # Request Dispatcher
//!
//! Turns one inbound HTTP request into one `request` frame on an agent
//! link and awaits its single terminal outcome. No retries: a request is
//! attempted against exactly one agent selection.

use crate::error::ProxyError;
use crate::protocol::{Frame, FrameKind, RequestPayload, ResponsePayload};
use crate::state::AppState;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

/// Headers never forwarded through the tunnel: hop-by-hop and forwarding
/// metadata that the egress stack recomputes.
const DENIED_HEADERS: [&str; 9] = [
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-forwarded-host",
];

/// Drop the deny-listed headers; everything else passes through as-is.
pub fn sanitize_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !DENIED_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Dispatch one request through the tunnel and await the response.
///
/// `path` is the original full ingress path; agent pinning and mapping
/// resolution happen here via [`AppState::pick_for`].
pub async fn dispatch(
    state: &AppState,
    method: &str,
    path: &str,
    headers: HashMap<String, String>,
    body: Option<String>,
    query: Map<String, Value>,
) -> Result<ResponsePayload, ProxyError> {
    let pick = state.pick_for(path)?;

    let payload = RequestPayload {
        method: method.to_string(),
        path: pick.path.clone(),
        headers: sanitize_headers(&headers),
        body,
        query,
        target_mapping: Some(pick.target.clone()),
    };
    let frame = Frame::new(FrameKind::Request).with_payload(&payload);
    let request_id = frame.id.clone();
    debug!(
        "Dispatching {} {} to client {} as request {}",
        method, pick.path, pick.agent_id, request_id
    );

    let rx = state.add_pending(&request_id, &pick.agent_id);
    if pick.tx.send(frame).is_err() {
        state.reject_pending(
            &request_id,
            ProxyError::SendFailed("tunnel link closed".into()),
        );
    }

    match rx.await {
        Ok(outcome) => outcome,
        // The sender vanished without a terminal signal; treat it as a drop.
        Err(_) => Err(ProxyError::Disconnected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MappingEntry, RegisterPayload};
    use crate::state::Settings;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn register_test_agent(
        state: &AppState,
        id: &str,
        mappings: Vec<MappingEntry>,
    ) -> (mpsc::UnboundedReceiver<Frame>, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = mpsc::unbounded_channel();
        state.register_agent(
            Some(id.to_string()),
            "conn-1",
            tx,
            shutdown,
            RegisterPayload {
                name: "test".into(),
                default_target: "http://localhost:8080".into(),
                mappings,
            },
        );
        (rx, shutdown_rx)
    }

    #[tokio::test]
    async fn dispatch_sends_a_sanitized_frame_and_returns_the_response() {
        let state = AppState::new(Settings::default());
        let (mut link_rx, _shutdown_rx) = register_test_agent(
            &state,
            "a2",
            vec![MappingEntry {
                prefix: "api".into(),
                target: "http://localhost:5000".into(),
                description: String::new(),
            }],
        );

        let headers = HashMap::from([
            ("host".to_string(), "tunnel.example".to_string()),
            ("x-forwarded-for".to_string(), "1.2.3.4".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ]);

        let task = {
            let state = state.clone();
            tokio::spawn(async move {
                dispatch(
                    &state,
                    "POST",
                    "/client/a2/api/items",
                    headers,
                    Some("{\"n\":1}".to_string()),
                    Map::new(),
                )
                .await
            })
        };

        let frame = link_rx.recv().await.expect("request frame");
        assert_eq!(frame.kind, FrameKind::Request);
        let payload: RequestPayload =
            serde_json::from_value(frame.payload.clone().unwrap()).unwrap();
        assert_eq!(payload.method, "POST");
        assert_eq!(payload.path, "/items");
        assert_eq!(
            payload.target_mapping.as_deref(),
            Some("http://localhost:5000")
        );
        assert!(!payload.headers.contains_key("host"));
        assert!(!payload.headers.contains_key("x-forwarded-for"));
        assert_eq!(
            payload.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );

        state.resolve_pending(
            &frame.id,
            ResponsePayload {
                status_code: 201,
                headers: HashMap::new(),
                body: String::new(),
                duration: None,
                mapping: None,
            },
        );

        let response = task.await.unwrap().unwrap();
        assert_eq!(response.status_code, 201);
    }

    #[tokio::test]
    async fn dispatch_without_agents_reports_no_clients() {
        let state = AppState::new(Settings::default());
        let err = dispatch(&state, "GET", "/x", HashMap::new(), None, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NoClients));
    }

    #[tokio::test]
    async fn dispatch_fails_fast_when_the_link_is_already_gone() {
        let state = AppState::new(Settings {
            request_timeout: Duration::from_secs(5),
            ..Settings::default()
        });
        let (link_rx, _shutdown_rx) = register_test_agent(&state, "a1", Vec::new());
        drop(link_rx);

        let err = dispatch(&state, "GET", "/client/a1/x", HashMap::new(), None, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::SendFailed(_)));
        assert!(state.pending.is_empty());
    }

    #[test]
    fn sanitation_is_case_insensitive_and_preserves_the_rest() {
        let headers = HashMap::from([
            ("Host".to_string(), "x".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Upgrade".to_string(), "websocket".to_string()),
            ("Sec-WebSocket-Key".to_string(), "k".to_string()),
            ("accept".to_string(), "*/*".to_string()),
            ("authorization".to_string(), "Bearer t".to_string()),
        ]);
        let sanitized = sanitize_headers(&headers);
        assert_eq!(sanitized.len(), 2);
        assert!(sanitized.contains_key("accept"));
        assert!(sanitized.contains_key("authorization"));
    }
}
