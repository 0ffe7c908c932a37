//! Message routing between registered peers
//!
//! Each destination has a single FIFO transport queue, and each source's
//! messages are routed one at a time by its connection task, so messages
//! from one source to one destination keep their order.

use std::sync::Arc;

use tracing::{debug, warn};

use peerlink_core::{OverflowPolicy, RelayError, SignalingMessage, TransportError};

use crate::registry::Registry;

/// Outcome of a successful route
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Control message handled by the server
    Consumed,
    /// Queued on the destination's transport
    Forwarded,
    /// Destination buffer full, message discarded
    Dropped,
}

/// Relays signaling messages to their destination peer
#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
    overflow: OverflowPolicy,
}

impl Router {
    pub fn new(registry: Arc<Registry>, overflow: OverflowPolicy) -> Self {
        Self { registry, overflow }
    }

    /// Deliver `msg` to `msg.dst`, or consume it if it has no destination.
    ///
    /// The payload is never inspected. Inbound traffic refreshes the
    /// source's liveness.
    pub async fn route(&self, msg: SignalingMessage) -> Result<Delivery, RelayError> {
        let src_known = msg
            .src
            .as_deref()
            .map(|src| self.registry.touch(src))
            .unwrap_or(false);

        if msg.is_control() {
            if src_known {
                return Ok(Delivery::Consumed);
            }
            return Err(RelayError::NotFound(msg.src.unwrap_or_default()));
        }
        let dst = msg.dst.clone().unwrap_or_default();

        let peer = match self.registry.lookup(&dst) {
            Some(peer) if peer.is_open() => peer,
            _ => return Err(RelayError::UnreachablePeer(dst)),
        };

        debug!(
            "Relaying {} from {} to {}",
            msg.kind,
            msg.src.as_deref().unwrap_or("?"),
            dst
        );

        match self.overflow {
            OverflowPolicy::DropNewest => match peer.transport.try_send(msg) {
                Ok(()) => Ok(Delivery::Forwarded),
                Err(TransportError::Full) => {
                    warn!("Send buffer for {} is full, dropping message", dst);
                    Ok(Delivery::Dropped)
                }
                Err(e) => Err(e.into()),
            },
            OverflowPolicy::Block => {
                peer.transport.send(msg).await?;
                Ok(Delivery::Forwarded)
            }
        }
    }
}
