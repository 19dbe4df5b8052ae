//! # Tunnel Link Handlers
//!
//! The WebSocket side of the relay:
//! - Upgrading tunnel connections and prompting the peer to register
//! - One outbound writer task per link draining an unbounded frame queue
//! - The inbound loop decoding frames and dispatching them by kind
//! - Shutdown-on-signal so the registry can close a displaced or evicted
//!   link from the outside
//! - Cleanup that unregisters the connection and fails its pending requests

use crate::error::ProxyError;
use crate::protocol::{
    ErrorPayload, Frame, FrameKind, RegisterConfirm, RegisterPayload, ResponsePayload,
    MAX_FRAME_BYTES,
};
use crate::state::{AppState, ClientTx};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

// ─── WebSocket Upgrade Endpoint ─────────────────────────────────

/// `GET /ws` — upgrades the connection and hands it to [`handle_connection`].
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

// ─── Connection Lifecycle ───────────────────────────────────────

/// Manages the full lifecycle of a single tunnel link.
///
/// ## Flow:
/// 1. Assign a connection ID and split the socket
/// 2. Spawn the outbound writer task (single-writer discipline)
/// 3. Prompt the peer with an empty `register` frame
/// 4. Read frames until the socket closes, errors, or the registry asks
///    this link to shut down (displacement, heartbeat eviction)
/// 5. On exit: unregister and fail the agent's pending requests
async fn handle_connection(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4().to_string();
    info!("New tunnel connection: {}", conn_id);

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Outbound frame queue. Everything that wants to talk to this agent
    // goes through `tx`, so JSON frame boundaries are never interleaved.
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    // The registry holds the sender and signals it to close this link.
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();

    let outbound_task = tokio::spawn(async move {
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

    // Ask the peer to register.
    let _ = tx.send(Frame::new(FrameKind::Register));

    // Set once this connection registers as an agent; used for cleanup.
    let mut agent_id: Option<String> = None;

    loop {
        tokio::select! {
            inbound = ws_stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > MAX_FRAME_BYTES {
                        error!("Oversize frame ({} bytes) on conn {}; closing link", text.len(), conn_id);
                        break;
                    }
                    match Frame::decode(&text) {
                        Ok(frame) => {
                            handle_frame(&state, &conn_id, &tx, &shutdown_tx, &mut agent_id, frame)
                        }
                        Err(e) => warn!("Malformed frame on conn {}: {}", conn_id, e),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Socket error on conn {}: {}", conn_id, e);
                    break;
                }
            },
            _ = shutdown_rx.recv() => {
                info!("Link {} closed by the registry", conn_id);
                break;
            }
        }
    }

    info!("Disconnecting tunnel connection: {}", conn_id);
    outbound_task.abort();
    if let Some(agent_id) = agent_id {
        state.unregister_conn(&agent_id, &conn_id);
    }
}

// ─── Frame Dispatcher ───────────────────────────────────────────

/// Handles a single decoded frame from an agent link.
///
/// - **Register**: registers (or refreshes) the agent and confirms with
///   the canonical id
/// - **Response / Error**: terminates the matching pending request, but
///   only when this link's agent owns it
/// - **Heartbeat**: answered with a `pong` echoing the frame id
/// - **Pong**: consumed; any traffic already proved liveness
/// - everything else is logged and dropped
fn handle_frame(
    state: &AppState,
    conn_id: &str,
    tx: &ClientTx,
    shutdown: &mpsc::UnboundedSender<()>,
    agent_id: &mut Option<String>,
    frame: Frame,
) {
    // Any inbound traffic on a registered link refreshes liveness.
    if let Some(id) = agent_id.as_deref() {
        state.touch(id);
    }

    match frame.kind {
        FrameKind::Register => {
            let registration = frame
                .payload
                .and_then(|p| serde_json::from_value::<RegisterPayload>(p).ok());
            let Some(registration) = registration else {
                warn!("Register frame without a usable payload on conn {}", conn_id);
                return;
            };
            let canonical = state.register_agent(
                frame.client_id,
                conn_id,
                tx.clone(),
                shutdown.clone(),
                registration,
            );
            *agent_id = Some(canonical.clone());
            let confirm = Frame::reply(FrameKind::Register, &frame.id)
                .with_client_id(canonical)
                .with_payload(&RegisterConfirm { confirmed: true });
            let _ = tx.send(confirm);
        }

        FrameKind::Response => {
            let Some(owner) = agent_id.as_deref() else {
                warn!("Response frame from unregistered conn {}", conn_id);
                return;
            };
            match state.pending_owner(&frame.id) {
                Some(bound) if bound == owner => {
                    match frame.payload.map(serde_json::from_value::<ResponsePayload>) {
                        Some(Ok(response)) => state.resolve_pending(&frame.id, response),
                        Some(Err(e)) => {
                            state.reject_pending(&frame.id, ProxyError::BadResponse(e.to_string()))
                        }
                        None => state
                            .reject_pending(&frame.id, ProxyError::BadResponse("missing payload".into())),
                    }
                }
                Some(_) => warn!(
                    "Client {} answered request {} it does not own; dropped",
                    owner, frame.id
                ),
                // Late response after a terminal outcome; nothing to do.
                None => {}
            }
        }

        FrameKind::Error => {
            let Some(owner) = agent_id.as_deref() else {
                return;
            };
            if state.pending_owner(&frame.id).as_deref() == Some(owner) {
                let message = frame
                    .payload
                    .and_then(|p| serde_json::from_value::<ErrorPayload>(p).ok())
                    .map(|p| p.message)
                    .unwrap_or_else(|| "upstream error".to_string());
                state.reject_pending(&frame.id, ProxyError::Agent(message));
            }
        }

        FrameKind::Heartbeat => {
            let _ = tx.send(Frame::reply(FrameKind::Pong, &frame.id));
        }

        FrameKind::Pong => {}

        FrameKind::Request => {
            warn!("Unexpected request frame from conn {}; dropped", conn_id)
        }

        FrameKind::Unknown => {
            warn!("Unknown frame type on conn {}; dropped", conn_id)
        }
    }
}
