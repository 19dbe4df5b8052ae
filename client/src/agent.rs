//! # Agent Connection Loop
//!
//! Manages the persistent tunnel link between the agent and the relay:
//! - Connection establishment and auto-reconnect on failure
//! - Registration on connect (unsolicited and on the relay's prompt)
//! - Heartbeats, pong replies, and a liveness check that drops a link
//!   when the relay goes quiet
//! - Concurrent handling of tunneled requests via the local HTTP egress
//!
//! The loop never returns; the binary decides when to stop it.

use crate::egress;
use crate::mapping;
use crate::protocol::{
    ErrorPayload, Frame, FrameKind, RegisterConfirm, RegisterPayload, RequestPayload,
    MAX_FRAME_BYTES,
};
use crate::state::{AgentState, RelayTx};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};

// ─── Main Connection Loop ───────────────────────────────────────

/// Runs the agent's tunnel loop forever: connect, register, serve,
/// reconnect after the configured interval on any failure.
pub async fn run_agent_loop(state: Arc<AgentState>) {
    loop {
        let server_url = state.settings.server_url.clone();
        info!("Connecting to relay: {}", server_url);

        match connect_async(server_url.as_str()).await {
            Ok((ws_stream, _)) => {
                info!("Connected to relay");
                *state.connected.write().await = true;

                let (mut ws_sink, mut ws_rx) = ws_stream.split();

                // Outbound frame queue; one writer task preserves JSON
                // frame boundaries.
                let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

                let outbound = tokio::spawn(async move {
                    while let Some(frame) = rx.recv().await {
                        let text = match frame.encode() {
                            Ok(t) => t,
                            Err(e) => {
                                error!("Serialize error: {}", e);
                                continue;
                            }
                        };
                        if ws_sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                });

                // Register immediately; the relay also prompts after accept,
                // and both triggers present the same stable identity.
                send_registration(&state, &tx).await;

                // ── Heartbeat Task ──
                let heartbeat = tokio::spawn({
                    let state = state.clone();
                    let tx = tx.clone();
                    async move {
                        loop {
                            tokio::time::sleep(state.settings.heartbeat_interval).await;
                            let id = state.agent_id.read().await.clone();
                            if id.is_empty() {
                                // Not confirmed yet; nothing to prove alive.
                                continue;
                            }
                            if tx
                                .send(Frame::new(FrameKind::Heartbeat).with_client_id(id))
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                });

                // ── Inbound Loop ──
                // Reads frames until the socket drops or the relay goes
                // quiet past the heartbeat timeout.
                let mut last_traffic = Instant::now();
                let mut liveness = tokio::time::interval(state.settings.heartbeat_interval);

                loop {
                    tokio::select! {
                        inbound = ws_rx.next() => match inbound {
                            Some(Ok(Message::Text(text))) => {
                                last_traffic = Instant::now();
                                if text.len() > MAX_FRAME_BYTES {
                                    error!("Oversize frame from relay; closing link");
                                    break;
                                }
                                match Frame::decode(&text) {
                                    Ok(frame) => handle_relay_frame(&state, &tx, frame).await,
                                    Err(e) => warn!("Malformed frame from relay: {}", e),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("Socket error: {}", e);
                                break;
                            }
                        },
                        _ = liveness.tick() => {
                            if last_traffic.elapsed() > state.settings.heartbeat_timeout() {
                                warn!("Relay went quiet; dropping the link");
                                break;
                            }
                        }
                    }
                }

                // ── Disconnect Cleanup ──
                outbound.abort();
                heartbeat.abort();
                *state.connected.write().await = false;
                warn!("Disconnected from relay");
            }
            Err(e) => {
                error!("Connection failed: {}", e);
            }
        }

        info!(
            "Reconnecting in {}s...",
            state.settings.reconnect_interval.as_secs()
        );
        tokio::time::sleep(state.settings.reconnect_interval).await;
    }
}

/// Present this agent's identity and routing table to the relay.
async fn send_registration(state: &Arc<AgentState>, tx: &RelayTx) {
    let payload = RegisterPayload {
        name: state.config.client.name.clone(),
        default_target: state.config.client.default_target.clone(),
        mappings: state.config.effective_mappings(),
    };
    let mut frame = Frame::new(FrameKind::Register).with_payload(&payload);
    let id = state.agent_id.read().await.clone();
    if !id.is_empty() {
        frame = frame.with_client_id(id);
    }
    let _ = tx.send(frame);
}

// ─── Relay Frame Handler ────────────────────────────────────────

/// Handles a single frame from the relay.
///
/// - **Register** with `confirmed: true`: adopt the canonical id
/// - **Register** without it (the relay's prompt): re-send registration
/// - **Request**: served concurrently on its own task
/// - **Heartbeat**: answered with a `pong` echoing the frame id
/// - **Pong**: consumed silently
async fn handle_relay_frame(state: &Arc<AgentState>, tx: &RelayTx, frame: Frame) {
    match frame.kind {
        FrameKind::Register => {
            let confirmed = frame
                .payload
                .as_ref()
                .and_then(|p| serde_json::from_value::<RegisterConfirm>(p.clone()).ok())
                .is_some_and(|c| c.confirmed);
            if confirmed {
                if let Some(canonical) = frame.client_id {
                    info!("Registered with relay as {}", canonical);
                    *state.agent_id.write().await = canonical;
                }
            } else {
                send_registration(state, tx).await;
            }
        }

        FrameKind::Request => {
            let state = state.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                handle_request(state, tx, frame).await;
            });
        }

        FrameKind::Heartbeat => {
            let _ = tx.send(Frame::reply(FrameKind::Pong, &frame.id));
        }

        FrameKind::Pong => {}

        FrameKind::Error => {
            let message = frame
                .payload
                .and_then(|p| serde_json::from_value::<ErrorPayload>(p).ok())
                .map(|p| p.message)
                .unwrap_or_else(|| "unknown".to_string());
            error!("Relay error: {}", message);
        }

        FrameKind::Response => {
            warn!("Unexpected response frame from relay; dropped")
        }

        FrameKind::Unknown => {
            warn!("Unknown frame type from relay; dropped")
        }
    }
}

/// Serve one tunneled request. A payload that does not parse produces an
/// `error` frame; everything else — including a failed local call, which
/// the egress turns into a synthesized 503 — flows back as a normal
/// `response` frame.
async fn handle_request(state: Arc<AgentState>, tx: RelayTx, frame: Frame) {
    let request_id = frame.id;
    let request = match frame.payload.map(serde_json::from_value::<RequestPayload>) {
        Some(Ok(request)) => request,
        Some(Err(e)) => {
            send_error(&tx, &request_id, format!("invalid request payload: {e}"));
            return;
        }
        None => {
            send_error(&tx, &request_id, "missing request payload".to_string());
            return;
        }
    };

    // Prefer the relay's resolution; re-resolve against our own table
    // when the annotation is absent.
    let base_url = match request.target_mapping.as_deref() {
        Some(target) if !target.is_empty() => target.to_string(),
        _ => {
            mapping::resolve(
                &request.path,
                &state.config.effective_mappings(),
                &state.config.client.default_target,
            )
            .target
        }
    };

    info!("{} {} -> {}", request.method, request.path, base_url);
    let response = egress::execute(
        &state.http,
        state.settings.request_timeout,
        &base_url,
        &request,
    )
    .await;

    let _ = tx.send(Frame::reply(FrameKind::Response, &request_id).with_payload(&response));
}

fn send_error(tx: &RelayTx, request_id: &str, message: String) {
    warn!("Request {} failed in the handler: {}", request_id, message);
    let _ = tx.send(
        Frame::reply(FrameKind::Error, request_id).with_payload(&ErrorPayload {
            message,
            code: Some("INVALID_REQUEST".to_string()),
        }),
    );
}
