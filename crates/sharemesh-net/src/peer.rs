//! Peer link identity and state

use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a gossip link
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    /// Source we receive content and history from
    Upstream,
    /// Target we forward content to
    Downstream,
}

impl PeerRole {
    /// The other link direction
    pub fn opposite(self) -> Self {
        match self {
            PeerRole::Upstream => PeerRole::Downstream,
            PeerRole::Downstream => PeerRole::Upstream,
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Upstream => write!(f, "upstream"),
            PeerRole::Downstream => write!(f, "downstream"),
        }
    }
}

/// Link connection state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Runtime state of one link direction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHandle {
    /// Peer address (`host:port`)
    pub host: String,
    pub role: PeerRole,
    pub state: ConnectionState,
    /// Reason of the last disconnect or failed attempt
    pub last_error: Option<String>,
}

impl PeerHandle {
    /// Fresh handle for a connection attempt
    pub fn connecting(host: impl Into<String>, role: PeerRole) -> Self {
        Self {
            host: host.into(),
            role,
            state: ConnectionState::Connecting,
            last_error: None,
        }
    }

    /// Whether this handle holds its slot (connecting or connected)
    pub fn is_occupying(&self) -> bool {
        self.state != ConnectionState::Disconnected
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({:?})", self.role, self.host, self.state)
    }
}
