//! Error types for the stack registration layer

use std::net::SocketAddr;

use thiserror::Error;

use super::endpoint::TransportProtocol;

/// Errors raised by [`NetStack`](super::NetStack)
#[derive(Debug, Error)]
pub enum StackError {
    /// Another endpoint already claims this transport/port/address
    #[error("{transport} endpoint {local} already registered")]
    PortInUse {
        transport: TransportProtocol,
        local: SocketAddr,
    },

    /// Registration names no network protocol
    #[error("Invalid registration for {local}: {reason}")]
    InvalidRegistration { local: SocketAddr, reason: String },

    /// `attach` called on a stack that is already driving a link
    #[error("Stack already attached to a link")]
    AlreadyRunning,

    /// The stack has been shut down
    #[error("Stack is shut down")]
    Shutdown,

    /// Listener closed while accepting
    #[error("Listener closed")]
    ListenerClosed,
}

impl StackError {
    /// Registration conflicts and shutdown are permanent; nothing here is
    /// worth retrying without changing the request.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        false
    }

    /// Whether the error is a registration conflict
    #[must_use]
    pub fn is_port_in_use(&self) -> bool {
        matches!(self, Self::PortInUse { .. })
    }
}

/// Result type for stack operations
pub type StackResult<T> = Result<T, StackError>;
