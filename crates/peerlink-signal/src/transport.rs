//! Per-peer transport abstraction
//!
//! The registry never touches sockets. Each peer owns a [`Transport`], which
//! for WebSocket connections is a [`ChannelTransport`]: a bounded queue
//! drained by the connection's writer task through a [`ChannelEndpoint`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use peerlink_core::{SignalingMessage, TransportError};

/// Outbound half of a peer connection
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queue a message without waiting
    fn try_send(&self, msg: SignalingMessage) -> Result<(), TransportError>;

    /// Queue a message, waiting for buffer space
    async fn send(&self, msg: SignalingMessage) -> Result<(), TransportError>;

    /// Request close. Must not block.
    fn close(&self);

    /// Resolves once the transport has finished closing
    async fn closed(&self);
}

/// Transport backed by a bounded channel
pub struct ChannelTransport {
    tx: mpsc::Sender<SignalingMessage>,
    close_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

/// Receiving side of a [`ChannelTransport`], owned by the connection writer.
///
/// Dropping the endpoint marks the transport as closed.
pub struct ChannelEndpoint {
    rx: mpsc::Receiver<SignalingMessage>,
    close_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
}

/// Next action for the connection writer
#[derive(Debug)]
pub enum Outbound {
    Message(SignalingMessage),
    Close,
}

/// Create a transport with room for `capacity` queued messages
pub fn channel(capacity: usize) -> (ChannelTransport, ChannelEndpoint) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (close_tx, close_rx) = watch::channel(false);
    let (done_tx, done_rx) = watch::channel(false);

    (
        ChannelTransport {
            tx,
            close_tx,
            done_rx,
        },
        ChannelEndpoint {
            rx,
            close_rx,
            done_tx,
        },
    )
}

/// True if both handles refer to the same transport instance
pub fn same_transport(a: &Arc<dyn Transport>, b: &Arc<dyn Transport>) -> bool {
    // Compare data pointers only; vtable pointers may differ across codegen units
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[async_trait]
impl Transport for ChannelTransport {
    fn try_send(&self, msg: SignalingMessage) -> Result<(), TransportError> {
        if *self.close_tx.borrow() {
            return Err(TransportError::Closed);
        }
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    async fn send(&self, msg: SignalingMessage) -> Result<(), TransportError> {
        if *self.close_tx.borrow() {
            return Err(TransportError::Closed);
        }
        self.tx.send(msg).await.map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        self.close_tx.send_replace(true);
    }

    async fn closed(&self) {
        let mut done = self.done_rx.clone();
        // An error means the endpoint is gone, which is also done
        let _ = done.wait_for(|d| *d).await;
    }
}

impl ChannelEndpoint {
    /// Wait for the next outbound message.
    ///
    /// Messages queued before a close request are still delivered.
    pub async fn next(&mut self) -> Outbound {
        let Self { rx, close_rx, .. } = self;
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(msg) => Outbound::Message(msg),
                None => Outbound::Close,
            },
            _ = close_rx.wait_for(|c| *c) => match rx.try_recv() {
                Ok(msg) => Outbound::Message(msg),
                Err(_) => Outbound::Close,
            },
        }
    }

    /// Watch that flips to `true` when close is requested
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_rx.clone()
    }
}

impl Drop for ChannelEndpoint {
    fn drop(&mut self) {
        self.done_tx.send_replace(true);
    }
}
