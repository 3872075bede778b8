//! Connection-oriented virtual streams over one shared UDP endpoint.
//!
//! A [`Transport`] owns a bound datagram socket and demultiplexes everything
//! it receives by sender address. On top of it:
//! - [`Transport::connect_to`] registers a [`Connection`] to a known remote
//! - [`Transport::listen`] returns an [`Acceptor`] whose `accept()` turns the
//!   first datagram from an unknown sender into a new [`Connection`]
//!
//! There is no handshake on the wire. Delivery, ordering across senders and
//! retransmission are left exactly as unreliable as UDP makes them.

pub mod acceptor;
pub mod config;
pub mod connection;
mod demux;
pub mod endpoint;
pub mod error;
mod inbox;
pub mod pool;
pub mod stream;
mod sync;
pub mod transport;

pub use acceptor::Acceptor;
pub use config::{OverflowPolicy, TransportConfig, DEFAULT_MAX_DATAGRAM};
pub use connection::Connection;
pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use inbox::ConnState;
pub use pool::TransportPool;
pub use stream::ConnectionStream;
pub use transport::Transport;

/// Bind a transport on `port` (all interfaces), or an ephemeral port for `None`.
pub fn acquire(port: Option<u16>) -> Result<Transport> {
    Transport::acquire(port)
}
