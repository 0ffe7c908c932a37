//! Lifecycle coordinator
//!
//! Bridges connection events (opened, message received, closed, failed) to
//! registry operations, turns relay errors into peer-visible ERROR messages
//! or observer notifications, and drains every peer on shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use peerlink_core::{
    Config, ErrorCode, LivenessConfig, MessageType, RelayError, SignalingMessage, TransportError,
};

use crate::observer::{LifecycleObserver, Observers};
use crate::peer::{DisconnectReason, Peer};
use crate::registry::Registry;
use crate::router::{Delivery, Router};
use crate::supervisor::LivenessSupervisor;
use crate::transport::Transport;

/// A connection asking to join
#[derive(Debug, Clone, Default)]
pub struct AdmissionRequest {
    /// Namespace key presented by the client
    pub key: String,
    /// Requested id; generated when absent
    pub id: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Answer to a readiness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub accepting: bool,
    pub peers: usize,
    pub max_peers: usize,
}

/// Outcome of a shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Peers removed from the registry
    pub removed: usize,
    /// Transports that had not finished closing when the grace period ended
    pub unacknowledged: usize,
    pub elapsed: Duration,
}

/// Owns the registry and everything operating on it
pub struct Coordinator {
    key: String,
    liveness: LivenessConfig,
    registry: Arc<Registry>,
    router: Router,
    observers: Arc<Observers>,
    accepting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Coordinator {
    pub fn new(config: &Config) -> Self {
        let observers = Arc::new(Observers::new());
        let registry = Arc::new(Registry::from_config(config, observers.clone()));
        let router = Router::new(registry.clone(), config.relay.overflow);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            key: config.relay.key.clone(),
            liveness: config.liveness.clone(),
            registry,
            router,
            observers,
            accepting: AtomicBool::new(true),
            shutdown_tx,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn subscribe(&self, observer: Arc<dyn LifecycleObserver>) {
        self.observers.subscribe(observer);
    }

    /// Supervisor sweeping this coordinator's registry
    pub fn supervisor(&self) -> LivenessSupervisor {
        LivenessSupervisor::new(self.registry.clone(), &self.liveness)
    }

    /// Watch that turns true once shutdown begins
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn key_matches(&self, key: &str) -> bool {
        self.key == key
    }

    pub fn status(&self) -> Readiness {
        Readiness {
            accepting: self.is_accepting(),
            peers: self.registry.len(),
            max_peers: self.registry.max_peers(),
        }
    }

    /// Register and open a new connection's peer, then greet it with OPEN
    pub fn admit(
        &self,
        request: AdmissionRequest,
        transport: Arc<dyn Transport>,
    ) -> Result<Peer, RelayError> {
        let requested = request.id.clone();
        let result = self.try_admit(request, transport);
        if let Err(e) = &result {
            debug!("Admission of {:?} refused: {}", requested, e);
            self.observers.error(requested.as_deref(), e);
        }
        result
    }

    fn try_admit(
        &self,
        request: AdmissionRequest,
        transport: Arc<dyn Transport>,
    ) -> Result<Peer, RelayError> {
        if !self.is_accepting() {
            return Err(RelayError::ShuttingDown);
        }
        if !self.key_matches(&request.key) {
            return Err(RelayError::InvalidKey);
        }

        let peer = self
            .registry
            .register(request.id, transport.clone(), request.metadata)?;

        // Shutdown may have drained the registry while we were registering
        if !self.is_accepting() {
            self.registry
                .remove_owned(&peer.id, &transport, DisconnectReason::Shutdown);
            return Err(RelayError::ShuttingDown);
        }

        let peer = match self.registry.activate(&peer.id) {
            Ok(peer) => peer,
            Err(e) => {
                self.registry
                    .remove_owned(&peer.id, &transport, DisconnectReason::TransportError);
                return Err(e);
            }
        };

        if let Err(e) = peer.transport.try_send(SignalingMessage::open()) {
            warn!("Could not send OPEN to {}: {}", peer.id, e);
        }
        Ok(peer)
    }

    /// Handle a message received on the connection bound to peer `id`.
    ///
    /// Messages from a connection that no longer owns `id` are refused with
    /// `NotFound` and never relayed.
    pub async fn handle_inbound(
        &self,
        id: &str,
        transport: &Arc<dyn Transport>,
        mut msg: SignalingMessage,
    ) -> Result<Delivery, RelayError> {
        if !self.registry.is_owned_by(id, transport) {
            debug!("Ignoring {} from stale connection for {}", msg.kind, id);
            return Err(RelayError::NotFound(id.to_string()));
        }
        msg.src = Some(id.to_string());

        if msg.is_control() && msg.kind == MessageType::Leave {
            self.registry
                .remove_owned(id, transport, DisconnectReason::Left);
            return Ok(Delivery::Consumed);
        }

        let kind = msg.kind.clone();
        match self.router.route(msg).await {
            Ok(delivery) => Ok(delivery),
            Err(e) => {
                self.report(id, &kind, &e);
                Err(e)
            }
        }
    }

    /// Tell the sender what went wrong, best effort, and notify observers
    fn report(&self, id: &str, kind: &MessageType, err: &RelayError) {
        self.observers.error(Some(id), err);

        if !err.is_peer_visible() {
            return;
        }

        let code = ErrorCode::from(err);
        let reply = match err {
            RelayError::UnreachablePeer(dst) => SignalingMessage::peer_error(
                code,
                format!("Could not deliver {} to {}", kind, dst),
                dst,
            ),
            other => SignalingMessage::error(code, other.to_string()),
        };

        match self.registry.lookup(id) {
            Some(sender) => {
                if let Err(e) = sender.transport.try_send(reply) {
                    debug!("Dropping error reply to {}: {}", id, e);
                }
            }
            None => debug!("Sender {} gone, dropping error reply", id),
        }
    }

    /// The remote side closed the connection bound to `id`
    pub fn transport_closed(&self, id: &str, transport: &Arc<dyn Transport>) -> Option<Peer> {
        self.registry
            .remove_owned(id, transport, DisconnectReason::Closed)
    }

    /// The connection bound to `id` failed. Ignored once `id` belongs to
    /// another connection.
    pub fn transport_error(
        &self,
        id: &str,
        transport: &Arc<dyn Transport>,
        err: TransportError,
    ) -> Option<Peer> {
        if !self.registry.is_owned_by(id, transport) {
            debug!("Transport error for {} after removal: {}", id, err);
            return None;
        }
        self.observers.error(Some(id), &RelayError::Transport(err));
        self.registry
            .remove_owned(id, transport, DisconnectReason::TransportError)
    }

    /// Stop admissions, remove every peer, and wait up to `grace` for their
    /// transports to finish closing.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let started = Instant::now();
        self.accepting.store(false, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);

        let peers: Vec<Peer> = self
            .registry
            .list()
            .into_iter()
            .filter_map(|peer| self.registry.remove(&peer.id, DisconnectReason::Shutdown))
            .collect();
        let removed = peers.len();
        info!("Shutting down: closing {} peers (grace {:?})", removed, grace);

        let mut pending: FuturesUnordered<_> =
            peers.iter().map(|peer| peer.transport.closed()).collect();
        let mut acknowledged = 0;
        let _ = tokio::time::timeout(grace, async {
            while pending.next().await.is_some() {
                acknowledged += 1;
            }
        })
        .await;

        let report = ShutdownReport {
            removed,
            unacknowledged: removed - acknowledged,
            elapsed: started.elapsed(),
        };

        if report.unacknowledged > 0 {
            warn!(
                "{} of {} transports did not close within {:?}",
                report.unacknowledged, removed, grace
            );
        }
        info!("Shutdown complete in {:?}", report.elapsed);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockTransport, RecordingObserver};

    fn coordinator() -> (Coordinator, Arc<RecordingObserver>) {
        let mut config = Config::default();
        config.relay.key = "test-key".into();
        config.relay.max_peers = 20;
        let coordinator = Coordinator::new(&config);
        let recorder = Arc::new(RecordingObserver::new("obs"));
        coordinator.subscribe(recorder.clone());
        (coordinator, recorder)
    }

    fn request(id: &str) -> AdmissionRequest {
        AdmissionRequest {
            key: "test-key".into(),
            id: Some(id.into()),
            metadata: HashMap::new(),
        }
    }

    fn admit(coordinator: &Coordinator, id: &str) -> Arc<MockTransport> {
        let transport = MockTransport::shared();
        coordinator.admit(request(id), transport.clone()).unwrap();
        transport
    }

    fn conn(transport: &Arc<MockTransport>) -> Arc<dyn Transport> {
        transport.clone()
    }

    #[test]
    fn test_admit_opens_peer() {
        let (coordinator, recorder) = coordinator();
        let transport = admit(&coordinator, "alice");

        assert!(coordinator.registry().lookup("alice").unwrap().is_open());
        assert_eq!(transport.kinds(), vec![MessageType::Open]);
        assert_eq!(recorder.events(), vec!["obs connect alice"]);
        assert_eq!(coordinator.status().peers, 1);
    }

    #[test]
    fn test_admit_generates_id() {
        let (coordinator, _) = coordinator();
        let peer = coordinator
            .admit(
                AdmissionRequest {
                    key: "test-key".into(),
                    ..Default::default()
                },
                MockTransport::shared(),
            )
            .unwrap();
        assert!(peer.id.starts_with("pl-"));
    }

    #[test]
    fn test_admit_rejects_wrong_key() {
        let (coordinator, recorder) = coordinator();
        let mut req = request("alice");
        req.key = "other".into();

        assert_eq!(
            coordinator.admit(req, MockTransport::shared()).unwrap_err(),
            RelayError::InvalidKey
        );
        assert!(coordinator.registry().is_empty());
        assert_eq!(recorder.events(), vec!["obs error invalid_key"]);
    }

    #[test]
    fn test_admit_duplicate() {
        let (coordinator, _) = coordinator();
        admit(&coordinator, "alice");
        assert_eq!(
            coordinator
                .admit(request("alice"), MockTransport::shared())
                .unwrap_err(),
            RelayError::DuplicateId("alice".into())
        );
    }

    #[tokio::test]
    async fn test_src_is_stamped() {
        let (coordinator, _) = coordinator();
        let alice = admit(&coordinator, "alice");
        let bob = admit(&coordinator, "bob");

        let msg = SignalingMessage::new(MessageType::Answer)
            .with_src("mallory")
            .with_dst("bob");
        coordinator
            .handle_inbound("alice", &conn(&alice), msg)
            .await
            .unwrap();

        let sent = bob.sent();
        assert_eq!(sent.last().unwrap().src.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_unreachable_reported_to_sender() {
        let (coordinator, recorder) = coordinator();
        let alice = admit(&coordinator, "alice");

        let msg = SignalingMessage::new(MessageType::Offer).with_dst("ghost");
        let err = coordinator
            .handle_inbound("alice", &conn(&alice), msg)
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::UnreachablePeer("ghost".into()));

        let reply = alice.sent().pop().unwrap();
        assert_eq!(reply.kind, MessageType::Error);
        let payload = reply.error_payload().unwrap();
        assert_eq!(payload.code, ErrorCode::UnreachablePeer);
        assert_eq!(payload.peer.as_deref(), Some("ghost"));

        assert!(coordinator.registry().lookup("alice").unwrap().is_open());
        assert!(recorder.events().contains(&"obs error unreachable_peer".to_string()));
    }

    #[tokio::test]
    async fn test_error_reply_dropped_when_sender_full() {
        let (coordinator, _) = coordinator();
        let alice = MockTransport::with_capacity(1);
        coordinator.admit(request("alice"), alice.clone()).unwrap();

        // OPEN fills the buffer; the error reply is silently dropped
        let msg = SignalingMessage::new(MessageType::Offer).with_dst("ghost");
        assert!(coordinator
            .handle_inbound("alice", &conn(&alice), msg)
            .await
            .is_err());
        assert_eq!(alice.kinds(), vec![MessageType::Open]);
        assert!(coordinator.registry().contains("alice"));
    }

    #[tokio::test]
    async fn test_leave_removes_sender() {
        let (coordinator, recorder) = coordinator();
        let alice = admit(&coordinator, "alice");

        let delivery = coordinator
            .handle_inbound("alice", &conn(&alice), SignalingMessage::new(MessageType::Leave))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Consumed);
        assert!(coordinator.registry().is_empty());
        assert!(alice.close_requested());
        assert_eq!(
            recorder.events(),
            vec!["obs connect alice", "obs disconnect alice left"]
        );
    }

    #[tokio::test]
    async fn test_leave_with_destination_is_relayed() {
        let (coordinator, _) = coordinator();
        let alice = admit(&coordinator, "alice");
        let bob = admit(&coordinator, "bob");

        let msg = SignalingMessage::new(MessageType::Leave).with_dst("bob");
        coordinator
            .handle_inbound("alice", &conn(&alice), msg)
            .await
            .unwrap();

        assert!(coordinator.registry().contains("alice"));
        assert_eq!(bob.kinds(), vec![MessageType::Open, MessageType::Leave]);
    }

    #[test]
    fn test_transport_events() {
        let (coordinator, recorder) = coordinator();
        let alice = conn(&admit(&coordinator, "alice"));
        let bob = conn(&admit(&coordinator, "bob"));

        assert!(coordinator.transport_closed("alice", &alice).is_some());
        assert!(coordinator.transport_closed("alice", &alice).is_none());
        assert!(coordinator
            .transport_error("bob", &bob, TransportError::WebSocket("reset".into()))
            .is_some());

        assert_eq!(
            recorder.events(),
            vec![
                "obs connect alice",
                "obs connect bob",
                "obs disconnect alice transport closed",
                "obs error transport_error",
                "obs disconnect bob transport error",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_bounded_by_grace() {
        let (coordinator, _) = coordinator();
        let mut signal = coordinator.shutdown_signal();

        let mut transports = Vec::new();
        for i in 0..10 {
            let transport = if i < 3 {
                MockTransport::never_acks_close()
            } else {
                MockTransport::shared()
            };
            coordinator
                .admit(request(&format!("peer{}", i)), transport.clone())
                .unwrap();
            transports.push(transport);
        }

        let grace = Duration::from_millis(5000);
        let report = coordinator.shutdown(grace).await;

        assert_eq!(report.removed, 10);
        assert_eq!(report.unacknowledged, 3);
        assert!(report.elapsed <= grace + Duration::from_millis(100));
        assert!(coordinator.registry().is_empty());
        assert!(transports.iter().all(|t| t.close_requested()));

        assert!(*signal.borrow_and_update());
        assert!(!coordinator.status().accepting);
        assert_eq!(
            coordinator
                .admit(request("late"), MockTransport::shared())
                .unwrap_err(),
            RelayError::ShuttingDown
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_returns_early_when_all_close() {
        let (coordinator, recorder) = coordinator();
        for i in 0..4 {
            admit(&coordinator, &format!("peer{}", i));
        }

        let report = coordinator.shutdown(Duration::from_secs(10)).await;
        assert_eq!(report.removed, 4);
        assert_eq!(report.unacknowledged, 0);
        assert!(report.elapsed < Duration::from_secs(1));
        assert_eq!(
            recorder
                .events()
                .iter()
                .filter(|e| e.ends_with("shutdown"))
                .count(),
            4
        );
    }

    #[tokio::test]
    async fn test_old_connection_cannot_touch_reused_id() {
        let (coordinator, recorder) = coordinator();
        let old = admit(&coordinator, "alice");
        let bob = admit(&coordinator, "bob");

        coordinator
            .handle_inbound("alice", &conn(&old), SignalingMessage::new(MessageType::Leave))
            .await
            .unwrap();
        let new = admit(&coordinator, "alice");

        // Late events from the first connection's reader and writer
        assert!(coordinator
            .transport_error("alice", &conn(&old), TransportError::WebSocket("reset".into()))
            .is_none());
        assert!(coordinator.transport_closed("alice", &conn(&old)).is_none());
        assert!(coordinator.registry().lookup("alice").unwrap().is_open());
        assert!(!new.close_requested());

        let offer = SignalingMessage::new(MessageType::Offer).with_dst("bob");
        assert_eq!(
            coordinator
                .handle_inbound("alice", &conn(&old), offer)
                .await
                .unwrap_err(),
            RelayError::NotFound("alice".into())
        );
        assert_eq!(bob.kinds(), vec![MessageType::Open]);
        assert!(!recorder
            .events()
            .contains(&"obs error transport_error".to_string()));

        let offer = SignalingMessage::new(MessageType::Offer).with_dst("bob");
        assert_eq!(
            coordinator
                .handle_inbound("alice", &conn(&new), offer)
                .await
                .unwrap(),
            Delivery::Forwarded
        );
        assert_eq!(bob.kinds(), vec![MessageType::Open, MessageType::Offer]);
    }
}
