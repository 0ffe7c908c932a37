//! Lifecycle notifications
//!
//! Observers are called after the registry mutation they describe has
//! committed, in subscription order.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use peerlink_core::RelayError;

use crate::peer::{DisconnectReason, Peer};

/// Receives peer lifecycle events (for logging, metrics, ...)
pub trait LifecycleObserver: Send + Sync + 'static {
    fn on_connect(&self, _peer: &Peer) {}

    fn on_disconnect(&self, _peer: &Peer, _reason: DisconnectReason) {}

    /// A non-fatal error attributed to `peer_id`, if known
    fn on_error(&self, _peer_id: Option<&str>, _err: &RelayError) {}
}

/// Ordered list of observers
#[derive(Default)]
pub struct Observers {
    list: RwLock<Vec<Arc<dyn LifecycleObserver>>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn LifecycleObserver>) {
        self.list.write().push(observer);
    }

    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.read().is_empty()
    }

    pub(crate) fn connect(&self, peer: &Peer) {
        for observer in self.snapshot() {
            observer.on_connect(peer);
        }
    }

    pub(crate) fn disconnect(&self, peer: &Peer, reason: DisconnectReason) {
        for observer in self.snapshot() {
            observer.on_disconnect(peer, reason);
        }
    }

    pub(crate) fn error(&self, peer_id: Option<&str>, err: &RelayError) {
        for observer in self.snapshot() {
            observer.on_error(peer_id, err);
        }
    }

    // Observers may subscribe others; never call out with the lock held
    fn snapshot(&self) -> Vec<Arc<dyn LifecycleObserver>> {
        self.list.read().clone()
    }
}

/// Logs lifecycle events through `tracing`
pub struct TracingObserver;

impl LifecycleObserver for TracingObserver {
    fn on_connect(&self, peer: &Peer) {
        info!("Peer connected: {}", peer.id);
    }

    fn on_disconnect(&self, peer: &Peer, reason: DisconnectReason) {
        info!(
            "Peer disconnected: {} ({}, connected for {:?})",
            peer.id,
            reason,
            peer.connected_at.elapsed()
        );
    }

    fn on_error(&self, peer_id: Option<&str>, err: &RelayError) {
        match peer_id {
            Some(id) => warn!("Peer {}: {}", id, err),
            None => warn!("Relay error: {}", err),
        }
    }
}
