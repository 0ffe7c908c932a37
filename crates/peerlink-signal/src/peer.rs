//! Registered peers

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

use crate::transport::Transport;

/// Connection state of a peer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    /// Admitted, transport handshake not finished
    Connecting,
    /// Ready to carry messages
    Open,
    /// Removed from the registry
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Connecting => write!(f, "connecting"),
            PeerState::Open => write!(f, "open"),
            PeerState::Closed => write!(f, "closed"),
        }
    }
}

/// Why a peer left the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer sent LEAVE
    Left,
    /// Transport closed by the remote side
    Closed,
    /// Transport failed
    TransportError,
    /// No activity within the liveness timeout
    Expired,
    /// Server shutdown
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Left => write!(f, "left"),
            DisconnectReason::Closed => write!(f, "transport closed"),
            DisconnectReason::TransportError => write!(f, "transport error"),
            DisconnectReason::Expired => write!(f, "heartbeat timeout"),
            DisconnectReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// One registered participant.
///
/// Values handed out by the registry are snapshots; the transport handle is
/// shared with the registry entry.
#[derive(Clone)]
pub struct Peer {
    pub id: String,
    pub transport: Arc<dyn Transport>,
    pub state: PeerState,
    pub metadata: HashMap<String, String>,
    pub connected_at: Instant,
    pub last_seen: Instant,
    /// Set by the liveness sweep once the peer has been idle too long
    pub flagged_at: Option<Instant>,
}

impl Peer {
    pub(crate) fn new(
        id: String,
        transport: Arc<dyn Transport>,
        metadata: HashMap<String, String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            transport,
            state: PeerState::Connecting,
            metadata,
            connected_at: now,
            last_seen: now,
            flagged_at: None,
        }
    }

    /// Record inbound activity
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.flagged_at = None;
    }

    pub fn is_open(&self) -> bool {
        self.state == PeerState::Open
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("metadata", &self.metadata)
            .field("last_seen", &self.last_seen)
            .field("flagged_at", &self.flagged_at)
            .finish_non_exhaustive()
    }
}
