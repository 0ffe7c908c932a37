//! Peerlink Signal Server
//!
//! Signaling relay for peer discovery and connection setup.
//! Clients connect via WebSocket, get a unique id, and exchange
//! offer/answer/candidate messages addressed by peer id.
//!
//! # Protocol
//!
//! 1. Client opens `{path}/peerjs?key=K&id=I` (id optional)
//! 2. Server admits the peer and replies `OPEN` (or `ID-TAKEN` / `ERROR`)
//! 3. Client sends `{"type":"OFFER","dst":"…","payload":…}`; the server
//!    stamps `src` and relays it verbatim to `dst`
//! 4. Client sends `HEARTBEAT` periodically; silent peers are expired
//! 5. Peers establish a direct link and may drop the signal connection

pub mod coordinator;
mod http;
pub mod observer;
pub mod peer;
pub mod registry;
pub mod router;
pub mod server;
pub mod supervisor;
pub mod transport;

pub use coordinator::{AdmissionRequest, Coordinator, Readiness, ShutdownReport};
pub use observer::{LifecycleObserver, Observers, TracingObserver};
pub use peer::{DisconnectReason, Peer, PeerState};
pub use registry::Registry;
pub use router::{Delivery, Router};
pub use server::SignalServer;
pub use supervisor::{LivenessSupervisor, SweepReport};
pub use transport::{ChannelEndpoint, ChannelTransport, Transport};

/// Service name reported by the health endpoint
pub const SERVICE_NAME: &str = "peerlink-signal";
