//! # Operator API
//!
//! Read-only views of the registry, plus the per-agent health probe.
//! Only `GET /client/{id}/health` engages the tunnel — it pushes a real
//! `GET /health` through the normal dispatcher path; everything else is
//! a pure read of relay state.

use crate::dispatch;
use crate::ingress::proxy_error_response;
use crate::protocol::MappingEntry;
use crate::state::{AgentRecord, AppState};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::collections::HashMap;

/// One registered agent, as shown to operators.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientView {
    pub id: String,
    pub name: String,
    pub connected: bool,
    pub default_target: String,
    pub mappings: Vec<MappingEntry>,
    pub request_count: u64,
    /// Milliseconds since the last heartbeat or other traffic.
    pub last_seen_ms: u64,
}

impl From<&AgentRecord> for ClientView {
    fn from(record: &AgentRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            connected: record.connected,
            default_target: record.default_target.clone(),
            mappings: record.mappings.clone(),
            request_count: record.request_count,
            last_seen_ms: record.last_heartbeat.elapsed().as_millis() as u64,
        }
    }
}

fn client_views(state: &AppState) -> Vec<ClientView> {
    state.agents.iter().map(|record| ClientView::from(&*record)).collect()
}

/// `GET /health` — coarse liveness and counts.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "connectedClients": state.agents.len(),
        "pendingRequests": state.pending.len(),
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
    }))
}

/// `GET /status` — detailed per-agent listing.
pub async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "pendingRequests": state.pending.len(),
        "clients": client_views(&state),
    }))
}

/// `GET /clients` — the same data shaped for enumeration.
pub async fn list_clients(State(state): State<AppState>) -> Json<Vec<ClientView>> {
    Json(client_views(&state))
}

/// `GET /clients/{id}` — a single record, or 404.
pub async fn get_client(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.agents.get(&id) {
        Some(record) => Json(ClientView::from(&*record)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "Not found",
                "message": format!("Client '{}' not found", id),
                "code": "CLIENT_NOT_FOUND",
            })),
        )
            .into_response(),
    }
}

/// `GET /client/{id}/health` — tunnels a `GET /health` into the agent
/// through the normal dispatcher and reports the reply.
pub async fn client_health(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let path = format!("/client/{}/health", id);
    match dispatch::dispatch(&state, "GET", &path, HashMap::new(), None, Map::new()).await {
        Ok(response) => Json(json!({
            "clientId": id,
            "healthy": response.status_code < 500,
            "statusCode": response.status_code,
            "duration": response.duration,
            "body": response.body,
        }))
        .into_response(),
        Err(e) => proxy_error_response(&e),
    }
}

#[derive(Deserialize)]
pub struct RouteInfoQuery {
    pub path: Option<String>,
}

/// `GET /route-info?path=<p>` — what `pick_for` would do for `<p>`,
/// without executing it.
pub async fn route_info(
    State(state): State<AppState>,
    Query(query): Query<RouteInfoQuery>,
) -> Response {
    let Some(path) = query.path else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Proxy error",
                "message": "Missing required query parameter 'path'",
                "code": "MISSING_PATH",
            })),
        )
            .into_response();
    };

    match state.pick_for(&path) {
        Ok(pick) => Json(json!({
            "clientId": pick.agent_id,
            "target": pick.target,
            "path": pick.path,
            "prefix": pick.prefix,
        }))
        .into_response(),
        Err(e) => proxy_error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RegisterPayload;
    use crate::state::Settings;
    use tokio::sync::mpsc;

    fn state_with_agent(id: &str) -> AppState {
        let state = AppState::new(Settings::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let (shutdown, _shutdown_rx) = mpsc::unbounded_channel();
        state.register_agent(
            Some(id.to_string()),
            "conn-1",
            tx,
            shutdown,
            RegisterPayload {
                name: "probe".into(),
                default_target: "http://localhost:8080".into(),
                mappings: Vec::new(),
            },
        );
        state
    }

    #[tokio::test]
    async fn get_client_returns_404_for_unknown_ids() {
        let state = AppState::new(Settings::default());
        let response = get_client(State(state), Path("ghost".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn route_info_previews_the_pick_without_dispatching() {
        let state = state_with_agent("a1");
        let response = route_info(
            State(state.clone()),
            Query(RouteInfoQuery {
                path: Some("/client/a1/api/x".to_string()),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        // Nothing was dispatched.
        assert!(state.pending.is_empty());
        assert_eq!(state.agents.get("a1").unwrap().request_count, 0);
    }

    #[tokio::test]
    async fn route_info_requires_the_path_parameter() {
        let state = AppState::new(Settings::default());
        let response = route_info(State(state), Query(RouteInfoQuery { path: None })).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
