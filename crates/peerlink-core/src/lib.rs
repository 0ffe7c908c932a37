//! Peerlink Core - Shared types, wire messages, and configuration
//!
//! This crate contains the foundational types used by the signaling relay.
//! It has no dependencies on networking code.

pub mod config;
pub mod error;
pub mod identity;
pub mod message;

pub use config::{
    Config, ConfigError, LivenessConfig, OverflowPolicy, RelayConfig, ServerConfig,
    ShutdownConfig,
};
pub use error::*;
pub use identity::{validate_peer_id, IdGenerator};
pub use message::{MessageType, SignalingMessage};

/// Default listen port
pub const DEFAULT_PORT: u16 = 9000;

/// Default namespace key clients must present
pub const DEFAULT_KEY: &str = "peerjs";

/// Default prefix stamped on generated peer ids
pub const DEFAULT_ID_PREFIX: &str = "pl-";

/// Number of random characters in a generated peer id
pub const GENERATED_ID_LEN: usize = 16;

/// Maximum length of a client-supplied peer id
pub const MAX_PEER_ID_LEN: usize = 64;
