//! # Agent Registry
//!
//! Registry operations on [`AppState`]: registration (including displacement
//! of a stale link holding the same identity), connection-scoped
//! unregistration, liveness tracking, the periodic heartbeat sweep, and
//! agent selection for inbound requests.
//!
//! The registry is the single source of truth for liveness. Link tasks hold
//! only their connection id; records are created and destroyed here.

use crate::error::ProxyError;
use crate::mapping;
use crate::protocol::RegisterPayload;
use crate::state::{generate_agent_id, AgentRecord, AppState, ClientTx};
use dashmap::mapref::entry::Entry;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// The agent and resolved target chosen for one inbound request.
#[derive(Debug)]
pub struct Pick {
    pub agent_id: String,
    pub tx: ClientTx,
    /// Base URL of the local service the agent should call.
    pub target: String,
    /// Path rewritten by the mapping resolver.
    pub path: String,
    /// The table prefix that matched, if any.
    pub prefix: Option<String>,
}

impl AppState {
    /// Register an agent on a tunnel connection, minting an id when the
    /// agent supplied none. An existing record held by a *different*
    /// connection is displaced: its link is told to shut down and its
    /// pending requests are failed before the new record takes over.
    /// Re-registration on the same connection just refreshes the table.
    ///
    /// Returns the canonical agent id.
    pub fn register_agent(
        &self,
        requested_id: Option<String>,
        conn_id: &str,
        tx: ClientTx,
        shutdown: mpsc::UnboundedSender<()>,
        registration: RegisterPayload,
    ) -> String {
        let id = requested_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_agent_id);

        let mut record = AgentRecord {
            id: id.clone(),
            name: registration.name.clone(),
            conn_id: conn_id.to_string(),
            tx,
            shutdown,
            mappings: registration.mappings,
            default_target: registration.default_target,
            connected: true,
            last_heartbeat: Instant::now(),
            request_count: 0,
        };

        // The whole decide-and-replace runs under the entry's shard lock:
        // racing registrations for the same id serialize here, so the
        // loser is always displaced, never silently orphaned.
        match self.agents.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().conn_id == conn_id {
                    // Same link re-registering: refresh the table, keep
                    // the dispatch counter.
                    record.request_count = occupied.get().request_count;
                } else {
                    warn!(
                        "Client {} registered from a new connection; displacing the old link",
                        id
                    );
                    let _ = occupied.get().shutdown.send(());
                    self.reject_pending_for_agent(&id);
                }
                occupied.insert(record);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record);
            }
        }

        info!(
            "Client registered: {} ({}) conn={}",
            id, registration.name, conn_id
        );
        id
    }

    /// Remove the record owned by `conn_id`, failing its pending requests.
    /// A displaced link's cleanup finds its successor's record under the
    /// same id and leaves it alone.
    pub fn unregister_conn(&self, agent_id: &str, conn_id: &str) {
        if let Some((_, mut record)) = self
            .agents
            .remove_if(agent_id, |_, record| record.conn_id == conn_id)
        {
            record.connected = false;
            info!("Client {} disconnected", agent_id);
            self.reject_pending_for_agent(agent_id);
        }
    }

    /// Refresh an agent's liveness timestamp. Called for heartbeats and
    /// any other inbound traffic on its link.
    pub fn touch(&self, agent_id: &str) {
        if let Some(mut record) = self.agents.get_mut(agent_id) {
            record.last_heartbeat = Instant::now();
        }
    }

    /// Evict every agent whose last heartbeat is older than the heartbeat
    /// timeout, exactly as if its link had dropped.
    pub fn sweep_stale_agents(&self) {
        let timeout = self.settings.heartbeat_timeout;
        let stale: Vec<(String, String)> = self
            .agents
            .iter()
            .filter(|record| record.last_heartbeat.elapsed() > timeout)
            .map(|record| (record.id.clone(), record.conn_id.clone()))
            .collect();

        for (agent_id, conn_id) in stale {
            warn!("Client {} missed its heartbeats; evicting", agent_id);
            if let Some(record) = self.agents.get(&agent_id) {
                if record.conn_id == conn_id {
                    let _ = record.shutdown.send(());
                }
            }
            if self
                .agents
                .remove_if(&agent_id, |_, record| record.conn_id == conn_id)
                .is_some()
            {
                self.reject_pending_for_agent(&agent_id);
            }
        }
    }

    /// Choose the agent and local target for an inbound path.
    ///
    /// `/client/{id}/...` pins the agent and resolves the remainder against
    /// its table; any other path goes to the least-loaded connected agent
    /// (first by iteration order on a tie) with the full path resolved.
    pub fn pick_for(&self, path: &str) -> Result<Pick, ProxyError> {
        if let Some(rest) = path.strip_prefix("/client/") {
            let (id, remainder) = match rest.split_once('/') {
                Some((id, tail)) => (id, format!("/{tail}")),
                None => (rest, "/".to_string()),
            };
            if !id.is_empty() {
                let record = self
                    .agents
                    .get(id)
                    .ok_or_else(|| ProxyError::ClientNotFound(id.to_string()))?;
                let resolved =
                    mapping::resolve(&remainder, &record.mappings, &record.default_target);
                return Ok(Pick {
                    agent_id: record.id.clone(),
                    tx: record.tx.clone(),
                    target: resolved.target,
                    path: resolved.path,
                    prefix: resolved.prefix,
                });
            }
        }

        let mut best: Option<(String, u64)> = None;
        for record in self.agents.iter() {
            if !record.connected {
                continue;
            }
            let better = match &best {
                Some((_, count)) => record.request_count < *count,
                None => true,
            };
            if better {
                best = Some((record.id.clone(), record.request_count));
            }
        }
        let (agent_id, _) = best.ok_or(ProxyError::NoClients)?;

        let record = self
            .agents
            .get(&agent_id)
            .ok_or(ProxyError::NoClients)?;
        let resolved = mapping::resolve(path, &record.mappings, &record.default_target);
        Ok(Pick {
            agent_id: record.id.clone(),
            tx: record.tx.clone(),
            target: resolved.target,
            path: resolved.path,
            prefix: resolved.prefix,
        })
    }
}
