//! Accept/connect/send/receive sockets over UDP.
//!
//! udpconn multiplexes many virtual connections over one UDP endpoint, with
//! no handshake and no delivery guarantees beyond what UDP gives.
//!
//! # Crate Structure
//!
//! - [`transport`] — Shared endpoint, receive demultiplexer, connections and acceptor

/// Re-export transport types.
pub mod transport {
    pub use udpconn_transport::*;
}

pub use udpconn_transport::{acquire, Acceptor, Connection, Transport, TransportError};
