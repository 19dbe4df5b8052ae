//! # Relay State
//!
//! Holds the shared application state for the relay:
//! - **Agent registry**: maps agent IDs to their live records
//! - **Pending-request table**: maps request IDs to their waiters
//!
//! Both registries use [`DashMap`] for concurrent access, since tunnel
//! links and inbound HTTP requests are handled concurrently. The state is
//! constructed once in `main` and cloned into every handler; there is no
//! module-level global.

use crate::error::ProxyError;
use crate::protocol::{Frame, MappingEntry, ResponsePayload};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Sender half of an agent link's outbound frame queue. The link's writer
/// task drains this, so concurrent sends are serialized and JSON frame
/// boundaries are preserved.
pub type ClientTx = mpsc::UnboundedSender<Frame>;

/// The single terminal outcome of a dispatched request.
pub type DispatchOutcome = Result<ResponsePayload, ProxyError>;

/// Generates a short, human-readable agent ID from a UUID.
///
/// Format: "XXXX-XXXX" (8 uppercase hex characters split by a hyphen).
/// Example: "A3F8-B2C1"
pub fn generate_agent_id() -> String {
    let uuid = Uuid::new_v4().to_string();
    let short = &uuid[..8];
    format!(
        "{}-{}",
        short[..4].to_uppercase(),
        short[4..8].to_uppercase()
    )
}

/// A registered agent, owned by the registry. Link tasks hold only the
/// agent id plus the shared state; records are created and destroyed by
/// the registry alone.
#[derive(Debug)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,

    /// Which tunnel connection currently owns this record. Cleanup and
    /// unregistration are scoped by this, so a displaced link cannot
    /// remove its successor's record.
    pub conn_id: String,

    /// Outbound frame queue of the owning link.
    pub tx: ClientTx,

    /// Tells the owning link's read loop to shut down (displacement,
    /// heartbeat eviction).
    pub shutdown: mpsc::UnboundedSender<()>,

    /// Effective routing table (enabled entries only).
    pub mappings: Vec<MappingEntry>,
    pub default_target: String,

    pub connected: bool,

    /// Refreshed by heartbeats and any other inbound traffic on the link.
    pub last_heartbeat: Instant,

    /// Running count of dispatched requests; never decremented. Used for
    /// least-loaded selection.
    pub request_count: u64,
}

/// A request in flight through the tunnel, awaiting its terminal outcome.
#[derive(Debug)]
pub struct PendingRequest {
    pub agent_id: String,
    pub created_at: Instant,

    /// One-shot completion channel back to the dispatching task.
    pub complete: oneshot::Sender<DispatchOutcome>,

    /// Deadline timer; aborted when the request resolves or is rejected.
    pub timer: JoinHandle<()>,
}

/// Tunable limits and intervals. Defaults follow the protocol baseline;
/// tests shrink the timeouts.
#[derive(Debug, Clone)]
pub struct Settings {
    pub request_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_body_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(30),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Shared application state, cloned and passed to each handler.
#[derive(Clone)]
pub struct AppState {
    /// Registry of currently connected agents, keyed by agent ID.
    pub agents: Arc<DashMap<String, AgentRecord>>,

    /// Requests awaiting a response frame, keyed by request ID.
    pub pending: Arc<DashMap<String, PendingRequest>>,

    pub settings: Arc<Settings>,

    pub started_at: Instant,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        Self {
            agents: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
            settings: Arc::new(settings),
            started_at: Instant::now(),
        }
    }
}
