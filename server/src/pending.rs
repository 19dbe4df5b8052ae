//! # Pending-Request Table
//!
//! Correlates tunneled responses with their waiting dispatch tasks. Every
//! entry has exactly one terminal outcome — response, error frame, deadline,
//! or agent disconnect — whichever removes the entry first wins and the
//! rest are no-ops. The table never retries; a request is attempted against
//! exactly one agent selection.

use crate::error::ProxyError;
use crate::state::{AppState, DispatchOutcome, PendingRequest};
use tokio::sync::oneshot;
use tracing::{debug, warn};

impl AppState {
    /// Insert a pending entry and start its deadline timer. Increments the
    /// agent's dispatch counter. Returns the receiver the dispatcher awaits.
    pub fn add_pending(&self, request_id: &str, agent_id: &str) -> oneshot::Receiver<DispatchOutcome> {
        let (complete, rx) = oneshot::channel();

        if let Some(mut record) = self.agents.get_mut(agent_id) {
            record.request_count += 1;
        }

        let timer = tokio::spawn({
            let state = self.clone();
            let request_id = request_id.to_string();
            let deadline = self.settings.request_timeout;
            async move {
                tokio::time::sleep(deadline).await;
                state.reject_pending(&request_id, ProxyError::Timeout);
            }
        });

        self.pending.insert(
            request_id.to_string(),
            PendingRequest {
                agent_id: agent_id.to_string(),
                created_at: std::time::Instant::now(),
                complete,
                timer,
            },
        );

        rx
    }

    /// Complete a pending request with the agent's response, stamping the
    /// round-trip duration. A no-op when the entry is already terminal.
    pub fn resolve_pending(&self, request_id: &str, mut response: crate::protocol::ResponsePayload) {
        if let Some((_, entry)) = self.pending.remove(request_id) {
            entry.timer.abort();
            response.duration = Some(entry.created_at.elapsed().as_millis() as u64);
            let _ = entry.complete.send(Ok(response));
        } else {
            debug!("Response for unknown or already-terminal request {}", request_id);
        }
    }

    /// Fail a pending request. A no-op when the entry is already terminal.
    pub fn reject_pending(&self, request_id: &str, error: ProxyError) {
        if let Some((_, entry)) = self.pending.remove(request_id) {
            entry.timer.abort();
            let _ = entry.complete.send(Err(error));
        }
    }

    /// Fail every pending request bound to `agent_id` with a disconnect
    /// error. Entries belonging to other agents are untouched.
    pub fn reject_pending_for_agent(&self, agent_id: &str) {
        let doomed: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.agent_id == agent_id)
            .map(|entry| entry.key().clone())
            .collect();

        if !doomed.is_empty() {
            warn!(
                "Failing {} pending request(s) for disconnected client {}",
                doomed.len(),
                agent_id
            );
        }
        for request_id in doomed {
            self.reject_pending(&request_id, ProxyError::Disconnected);
        }
    }

    /// The agent a pending request is bound to, if it is still in flight.
    pub fn pending_owner(&self, request_id: &str) -> Option<String> {
        self.pending.get(request_id).map(|entry| entry.agent_id.clone())
    }
}
