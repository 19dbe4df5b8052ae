//! # Agent State
//!
//! Runtime state shared between the connection loop, the heartbeat task
//! and request handler tasks via `Arc<AgentState>`.

use crate::config::AgentConfig;
use crate::protocol::Frame;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

/// Sender half of the link's outbound frame queue.
pub type RelayTx = mpsc::UnboundedSender<Frame>;

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:3001/ws";
const DEFAULT_RECONNECT_SECS: u64 = 5;
const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Knobs resolved once at startup from flags and environment.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub server_url: String,
    pub reconnect_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Wall-clock limit for one local egress call.
    pub request_timeout: Duration,
}

impl RuntimeSettings {
    /// Resolve from the environment; `server_url_flag` (from the CLI)
    /// wins over `SERVER_WS_URL`.
    pub fn resolve(server_url_flag: Option<String>) -> Self {
        let server_url = server_url_flag
            .or_else(|| std::env::var("SERVER_WS_URL").ok())
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

        Self {
            server_url,
            reconnect_interval: Duration::from_secs(env_secs(
                "RECONNECT_INTERVAL",
                DEFAULT_RECONNECT_SECS,
            )),
            heartbeat_interval: Duration::from_secs(env_secs(
                "HEARTBEAT_INTERVAL",
                DEFAULT_HEARTBEAT_SECS,
            )),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// The link is considered dead after three missed heartbeats.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

fn env_secs(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Shared agent state. Mutable fields are RwLock'd; the connection loop
/// writes them, request tasks read.
pub struct AgentState {
    pub config: AgentConfig,
    pub settings: RuntimeSettings,

    /// Canonical identity: the configured id, or whatever the relay
    /// minted on first registration. Stable across reconnects.
    pub agent_id: RwLock<String>,

    pub connected: RwLock<bool>,

    /// Shared HTTP client for local egress.
    pub http: reqwest::Client,
}

impl AgentState {
    pub fn new(config: AgentConfig, settings: RuntimeSettings) -> Self {
        let agent_id = config.client.id.clone().unwrap_or_default();
        Self {
            config,
            settings,
            agent_id: RwLock::new(agent_id),
            connected: RwLock::new(false),
            http: reqwest::Client::new(),
        }
    }
}
