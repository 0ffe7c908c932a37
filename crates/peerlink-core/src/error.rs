//! Error types for the signaling relay

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the registry, router, and lifecycle coordinator.
///
/// None of these are fatal to the process; they are reported back to the
/// offending peer or to the operator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("peer id already taken: {0}")]
    DuplicateId(String),

    #[error("peer not found: {0}")]
    NotFound(String),

    #[error("peer {id} is {state}, expected {expected}")]
    InvalidState {
        id: String,
        state: String,
        expected: String,
    },

    #[error("peer unreachable: {0}")]
    UnreachablePeer(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("concurrent peer limit reached ({limit})")]
    CapacityExceeded { limit: usize },

    #[error("invalid peer id: {0:?}")]
    InvalidId(String),

    #[error("invalid namespace key")]
    InvalidKey,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("could not generate a unique peer id after {attempts} attempts")]
    IdSpaceExhausted { attempts: usize },

    #[error("entropy source unavailable: {0}")]
    Entropy(String),
}

/// Failures of a single peer's transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("send buffer full")]
    Full,

    #[error("websocket: {0}")]
    WebSocket(String),
}

/// Wire error codes (sent to peers inside ERROR payloads)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    IdTaken,
    NotFound,
    InvalidState,
    UnreachablePeer,
    TransportError,
    CapacityExceeded,
    InvalidId,
    InvalidKey,
    ShuttingDown,
    InvalidMessage,
    InternalError,
}

impl From<&RelayError> for ErrorCode {
    fn from(e: &RelayError) -> Self {
        match e {
            RelayError::DuplicateId(_) => ErrorCode::IdTaken,
            RelayError::NotFound(_) => ErrorCode::NotFound,
            RelayError::InvalidState { .. } => ErrorCode::InvalidState,
            RelayError::UnreachablePeer(_) => ErrorCode::UnreachablePeer,
            RelayError::Transport(_) => ErrorCode::TransportError,
            RelayError::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            RelayError::InvalidId(_) => ErrorCode::InvalidId,
            RelayError::InvalidKey => ErrorCode::InvalidKey,
            RelayError::ShuttingDown => ErrorCode::ShuttingDown,
            RelayError::IdSpaceExhausted { .. } | RelayError::Entropy(_) => {
                ErrorCode::InternalError
            }
        }
    }
}

impl RelayError {
    /// Whether the peer that caused this error should be told about it.
    ///
    /// Operator-only conditions are logged instead.
    pub fn is_peer_visible(&self) -> bool {
        !matches!(
            self,
            RelayError::IdSpaceExhausted { .. } | RelayError::Entropy(_)
        )
    }
}
