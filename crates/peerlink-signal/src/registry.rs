//! Peer registry
//!
//! The single authority mapping peer ids to connection state. Insert,
//! lookup and removal are atomic per id (DashMap entry locks), and the
//! concurrent-peer limit is enforced with a reservation counter so that two
//! admissions racing for the last slot cannot both succeed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use peerlink_core::{validate_peer_id, Config, IdGenerator, RelayError};

use crate::observer::Observers;
use crate::peer::{DisconnectReason, Peer, PeerState};
use crate::transport::{same_transport, Transport};

/// Attempts at generating an unused id before giving up
const MAX_ID_ATTEMPTS: usize = 32;

/// Process-wide collection of peers
pub struct Registry {
    peers: DashMap<String, Peer>,
    /// Reserved or occupied slots
    live: AtomicUsize,
    max_peers: usize,
    ids: IdGenerator,
    observers: Arc<Observers>,
}

/// Result of one idle scan
#[derive(Debug, Default)]
pub(crate) struct IdleScan {
    /// Peers flagged during this scan
    pub flagged: Vec<String>,
    /// Flagged peers idle past the grace period
    pub due: Vec<String>,
}

impl Registry {
    pub fn new(max_peers: usize, ids: IdGenerator, observers: Arc<Observers>) -> Self {
        Self {
            peers: DashMap::new(),
            live: AtomicUsize::new(0),
            max_peers,
            ids,
            observers,
        }
    }

    pub fn from_config(config: &Config, observers: Arc<Observers>) -> Self {
        Self::new(
            config.relay.max_peers,
            IdGenerator::new(config.relay.id_prefix.clone()),
            observers,
        )
    }

    pub fn id_generator(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    /// Admit a peer in the CONNECTING state.
    ///
    /// A supplied id must be valid and unused; without one an id is
    /// generated until an unused candidate is found.
    pub fn register(
        &self,
        id: Option<String>,
        transport: Arc<dyn Transport>,
        metadata: HashMap<String, String>,
    ) -> Result<Peer, RelayError> {
        if let Some(id) = &id {
            validate_peer_id(id)?;
        }

        self.reserve_slot()?;

        let inserted = match id {
            Some(id) => self.insert(id, transport, metadata),
            None => self.insert_generated(transport, metadata),
        };

        match inserted {
            Ok(peer) => {
                debug!("Registered peer {} ({} live)", peer.id, self.peers.len());
                self.observers.connect(&peer);
                Ok(peer)
            }
            Err(e) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn reserve_slot(&self) -> Result<(), RelayError> {
        let max = self.max_peers;
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| RelayError::CapacityExceeded { limit: max })
    }

    fn insert(
        &self,
        id: String,
        transport: Arc<dyn Transport>,
        metadata: HashMap<String, String>,
    ) -> Result<Peer, RelayError> {
        match self.peers.entry(id) {
            Entry::Occupied(slot) => Err(RelayError::DuplicateId(slot.key().clone())),
            Entry::Vacant(slot) => {
                let peer = Peer::new(slot.key().clone(), transport, metadata);
                slot.insert(peer.clone());
                Ok(peer)
            }
        }
    }

    fn insert_generated(
        &self,
        transport: Arc<dyn Transport>,
        metadata: HashMap<String, String>,
    ) -> Result<Peer, RelayError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let candidate = self.ids.generate()?;
            match self.peers.entry(candidate) {
                Entry::Occupied(slot) => {
                    debug!("Generated id {} already in use, retrying", slot.key());
                }
                Entry::Vacant(slot) => {
                    let peer = Peer::new(slot.key().clone(), transport, metadata);
                    slot.insert(peer.clone());
                    return Ok(peer);
                }
            }
        }
        Err(RelayError::IdSpaceExhausted {
            attempts: MAX_ID_ATTEMPTS,
        })
    }

    /// Mark a CONNECTING peer as ready to carry messages
    pub fn activate(&self, id: &str) -> Result<Peer, RelayError> {
        let mut peer = self
            .peers
            .get_mut(id)
            .ok_or_else(|| RelayError::NotFound(id.to_string()))?;

        if peer.state != PeerState::Connecting {
            return Err(RelayError::InvalidState {
                id: id.to_string(),
                state: peer.state.to_string(),
                expected: PeerState::Connecting.to_string(),
            });
        }

        peer.state = PeerState::Open;
        peer.touch();
        Ok(peer.value().clone())
    }

    /// Snapshot of a peer
    pub fn lookup(&self, id: &str) -> Option<Peer> {
        self.peers.get(id).map(|p| p.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    /// Record activity for a peer. Returns false if it is not registered.
    pub fn touch(&self, id: &str) -> bool {
        match self.peers.get_mut(id) {
            Some(mut peer) => {
                peer.touch();
                true
            }
            None => false,
        }
    }

    /// Remove a peer and request its transport to close.
    ///
    /// Removing an absent peer is a no-op.
    pub fn remove(&self, id: &str, reason: DisconnectReason) -> Option<Peer> {
        let (_, peer) = self.peers.remove(id)?;
        Some(self.finish_removal(peer, reason))
    }

    /// True if `id` is registered and still bound to `transport`
    pub fn is_owned_by(&self, id: &str, transport: &Arc<dyn Transport>) -> bool {
        self.peers
            .get(id)
            .is_some_and(|p| same_transport(&p.transport, transport))
    }

    /// Like [`touch`](Self::touch), but only for the peer bound to `transport`
    pub fn touch_owned(&self, id: &str, transport: &Arc<dyn Transport>) -> bool {
        match self.peers.get_mut(id) {
            Some(mut peer) if same_transport(&peer.transport, transport) => {
                peer.touch();
                true
            }
            _ => false,
        }
    }

    /// Remove `id` only while it is bound to `transport`.
    ///
    /// A connection that outlived its peer cannot remove a newer peer that
    /// registered the same id.
    pub fn remove_owned(
        &self,
        id: &str,
        transport: &Arc<dyn Transport>,
        reason: DisconnectReason,
    ) -> Option<Peer> {
        let (_, peer) = self
            .peers
            .remove_if(id, |_, p| same_transport(&p.transport, transport))?;
        Some(self.finish_removal(peer, reason))
    }

    /// Remove a peer only if it is still flagged and idle beyond `idle_limit`
    pub(crate) fn expire(&self, id: &str, now: Instant, idle_limit: Duration) -> Option<Peer> {
        let (_, peer) = self.peers.remove_if(id, |_, p| {
            p.flagged_at.is_some() && now.saturating_duration_since(p.last_seen) > idle_limit
        })?;
        Some(self.finish_removal(peer, DisconnectReason::Expired))
    }

    fn finish_removal(&self, mut peer: Peer, reason: DisconnectReason) -> Peer {
        self.live.fetch_sub(1, Ordering::SeqCst);
        peer.state = PeerState::Closed;
        peer.transport.close();
        debug!("Removed peer {} ({})", peer.id, reason);
        self.observers.disconnect(&peer, reason);
        peer
    }

    /// Flag peers idle beyond `expire` and report flagged peers idle beyond
    /// `expire + grace`. Touches no transports.
    pub(crate) fn scan_idle(&self, now: Instant, expire: Duration, grace: Duration) -> IdleScan {
        let mut scan = IdleScan::default();

        for mut peer in self.peers.iter_mut() {
            let idle = now.saturating_duration_since(peer.last_seen);
            if idle <= expire {
                continue;
            }
            if peer.flagged_at.is_none() {
                peer.flagged_at = Some(now);
                scan.flagged.push(peer.id.clone());
            }
            if idle > expire + grace {
                scan.due.push(peer.id.clone());
            }
        }

        scan
    }

    /// Snapshot of all peers
    pub fn list(&self) -> Vec<Peer> {
        self.peers.iter().map(|p| p.value().clone()).collect()
    }

    /// Sorted snapshot of peer ids
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.iter().map(|p| p.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{registry_with, MockTransport, RecordingObserver};

    fn register(registry: &Registry, id: &str) -> Result<Peer, RelayError> {
        registry.register(Some(id.into()), MockTransport::shared(), HashMap::new())
    }

    #[test]
    fn test_register_and_activate() {
        let registry = registry_with(10);

        let peer = register(&registry, "alice").unwrap();
        assert_eq!(peer.state, PeerState::Connecting);

        let peer = registry.activate("alice").unwrap();
        assert_eq!(peer.state, PeerState::Open);
        assert!(registry.lookup("alice").unwrap().is_open());
    }

    #[test]
    fn test_size_tracks_live_peers() {
        let registry = registry_with(100);

        for i in 0..20 {
            register(&registry, &format!("peer{}", i)).unwrap();
            registry.activate(&format!("peer{}", i)).unwrap();
        }
        assert_eq!(registry.len(), 20);

        for i in (0..20).step_by(2) {
            registry.remove(&format!("peer{}", i), DisconnectReason::Left);
        }
        assert_eq!(registry.len(), 10);
        assert!(registry.list().iter().all(|p| p.is_open()));
    }

    #[test]
    fn test_duplicate_id() {
        let registry = registry_with(10);

        register(&registry, "X").unwrap();
        registry.activate("X").unwrap();
        assert_eq!(
            register(&registry, "X").unwrap_err(),
            RelayError::DuplicateId("X".into())
        );
        assert_eq!(registry.len(), 1);

        registry.remove("X", DisconnectReason::Left).unwrap();
        assert!(register(&registry, "X").is_ok());
    }

    #[test]
    fn test_generated_ids() {
        let registry = registry_with(10);

        let a = registry
            .register(None, MockTransport::shared(), HashMap::new())
            .unwrap();
        let b = registry
            .register(None, MockTransport::shared(), HashMap::new())
            .unwrap();

        assert!(a.id.starts_with("pl-"));
        assert_ne!(a.id, b.id);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_invalid_id() {
        let registry = registry_with(1);
        assert!(matches!(
            register(&registry, "../etc"),
            Err(RelayError::InvalidId(_))
        ));
        // The rejected attempt must not hold a slot
        assert!(register(&registry, "alice").is_ok());
    }

    #[test]
    fn test_capacity_exceeded() {
        let registry = registry_with(2);

        register(&registry, "a").unwrap();
        register(&registry, "b").unwrap();
        assert_eq!(
            register(&registry, "c").unwrap_err(),
            RelayError::CapacityExceeded { limit: 2 }
        );
        // Nobody was evicted
        assert!(registry.contains("a") && registry.contains("b"));

        registry.remove("a", DisconnectReason::Closed);
        assert!(register(&registry, "c").is_ok());
    }

    #[test]
    fn test_duplicate_releases_slot() {
        let registry = registry_with(2);
        register(&registry, "a").unwrap();
        assert!(register(&registry, "a").is_err());
        assert!(register(&registry, "b").is_ok());
    }

    #[test]
    fn test_activate_errors() {
        let registry = registry_with(10);
        assert_eq!(
            registry.activate("ghost").unwrap_err(),
            RelayError::NotFound("ghost".into())
        );

        register(&registry, "alice").unwrap();
        registry.activate("alice").unwrap();
        assert!(matches!(
            registry.activate("alice"),
            Err(RelayError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = registry_with(10);
        let transport = MockTransport::shared();
        registry
            .register(Some("alice".into()), transport.clone(), HashMap::new())
            .unwrap();

        let removed = registry.remove("alice", DisconnectReason::Left).unwrap();
        assert_eq!(removed.state, PeerState::Closed);
        assert!(transport.close_requested());

        assert!(registry.remove("alice", DisconnectReason::Left).is_none());
        assert!(registry.lookup("alice").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lifecycle_notifications() {
        let observers = Arc::new(Observers::new());
        let recorder = Arc::new(RecordingObserver::new("obs"));
        observers.subscribe(recorder.clone());
        let registry = Registry::new(10, IdGenerator::default(), observers);

        register(&registry, "alice").unwrap();
        assert!(register(&registry, "alice").is_err());
        registry.remove("alice", DisconnectReason::Expired);
        registry.remove("alice", DisconnectReason::Expired);

        assert_eq!(
            recorder.events(),
            vec!["obs connect alice", "obs disconnect alice heartbeat timeout"]
        );
    }

    #[test]
    fn test_concurrent_register_same_id() {
        let registry = Arc::new(registry_with(100));

        let successes: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let registry = registry.clone();
                    s.spawn(move || register(&registry, "X").is_ok() as usize)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(successes, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_register_respects_capacity() {
        let registry = Arc::new(registry_with(5));

        std::thread::scope(|s| {
            for i in 0..32 {
                let registry = registry.clone();
                s.spawn(move || {
                    let _ = register(&registry, &format!("peer{}", i));
                });
            }
        });

        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_ids_sorted() {
        let registry = registry_with(10);
        for id in ["carol", "alice", "bob"] {
            register(&registry, id).unwrap();
        }
        assert_eq!(registry.ids(), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_stale_transport_cannot_remove_reused_id() {
        let registry = registry_with(10);
        let old: Arc<dyn Transport> = MockTransport::shared();
        let new = MockTransport::shared();

        registry
            .register(Some("alice".into()), old.clone(), HashMap::new())
            .unwrap();
        assert!(registry.is_owned_by("alice", &old));
        registry.remove("alice", DisconnectReason::Left).unwrap();

        registry
            .register(Some("alice".into()), new.clone(), HashMap::new())
            .unwrap();
        let new: Arc<dyn Transport> = new;

        assert!(!registry.is_owned_by("alice", &old));
        assert!(!registry.touch_owned("alice", &old));
        assert!(registry
            .remove_owned("alice", &old, DisconnectReason::TransportError)
            .is_none());
        assert!(registry.contains("alice"));

        assert!(registry
            .remove_owned("alice", &new, DisconnectReason::Closed)
            .is_some());
        assert!(registry.is_empty());
    }
}
