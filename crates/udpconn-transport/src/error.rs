use std::net::SocketAddr;
use std::time::Duration;

/// Errors that can occur in datagram transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The local address is already bound by another socket.
    #[error("address {addr} already in use: {source}")]
    AddressInUse {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to bind to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// A connection to this remote address is already registered on the transport.
    #[error("connection to {0} already registered")]
    DuplicateConnection(SocketAddr),

    /// The transport has been closed.
    #[error("transport closed")]
    Closed,

    /// The virtual connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The payload exceeds the configured maximum datagram size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The transport already has an active acceptor.
    #[error("transport is already listening")]
    AlreadyListening,

    /// A blocking operation did not complete in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The background receive loop failed; the transport no longer delivers.
    #[error("transport degraded: {0}")]
    Degraded(String),

    /// An I/O error occurred on the underlying endpoint.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the caller may retry or treat the condition as benign.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::DuplicateConnection(_) | TransportError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_and_timeout_are_recoverable() {
        let addr: SocketAddr = "127.0.0.1:9".parse().expect("addr should parse");
        assert!(TransportError::DuplicateConnection(addr).is_recoverable());
        assert!(TransportError::Timeout(Duration::from_millis(5)).is_recoverable());
        assert!(!TransportError::Closed.is_recoverable());
        assert!(!TransportError::PayloadTooLarge { size: 2, max: 1 }.is_recoverable());
    }

    #[test]
    fn payload_too_large_message_names_sizes() {
        let err = TransportError::PayloadTooLarge {
            size: 70_000,
            max: 65_507,
        };
        assert_eq!(err.to_string(), "payload too large (70000 bytes, max 65507)");
    }
}
