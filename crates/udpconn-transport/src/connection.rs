use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::inbox::{ConnState, Inbox};
use crate::stream::ConnectionStream;
use crate::sync::lock;
use crate::transport::{Shared, Transport};

/// A virtual connection to one fixed remote address.
///
/// There is no handshake on the wire: the connection only declares locally
/// which sender's datagrams it receives. Each [`send`](Self::send) is one
/// datagram and each [`receive`](Self::receive) yields one datagram payload,
/// unmodified. Delivery is not guaranteed.
///
/// All methods take `&self`; wrap the connection in an `Arc` to receive on
/// one thread while closing or sending from another.
pub struct Connection {
    shared: Arc<Shared>,
    lease: Mutex<Option<Transport>>,
    inbox: Arc<Inbox>,
    remote: SocketAddr,
    closed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(lease: Transport, inbox: Arc<Inbox>) -> Self {
        Self {
            shared: Arc::clone(&lease.shared),
            remote: inbox.remote(),
            lease: Mutex::new(Some(lease)),
            inbox,
            closed: AtomicBool::new(false),
        }
    }

    /// Send `payload` to the remote as a single datagram.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        self.shared.send_to(self.remote, payload)
    }

    /// Block until the next payload from the remote arrives.
    ///
    /// Returns `Ok(None)` once the connection is closed.
    pub fn receive(&self) -> Result<Option<Bytes>> {
        self.inbox.pop(None)
    }

    /// Like [`receive`](Self::receive), failing with
    /// [`TransportError::Timeout`] if nothing arrives within `timeout`.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<Bytes>> {
        self.inbox.pop(Some(timeout))
    }

    /// Whether the remote has been heard from within the liveness window.
    ///
    /// A diagnostic heuristic only; it says nothing about future delivery.
    pub fn is_alive(&self) -> bool {
        if self.state() == ConnState::Closed {
            return false;
        }
        self.inbox.last_seen().is_some_and(|seen| {
            Instant::now().saturating_duration_since(seen) <= self.shared.config.liveness_window
        })
    }

    /// Close the connection. Idempotent.
    ///
    /// Deregisters the remote address, discards undelivered payloads, wakes
    /// blocked receivers with end-of-stream and releases the transport lease.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        lock(&self.shared.state).deregister(&self.inbox);
        self.inbox.close();
        debug!(remote = %self.remote, "connection closed");

        let lease = lock(&self.lease).take();
        drop(lease);
    }

    pub fn state(&self) -> ConnState {
        if self.closed.load(Ordering::Acquire) {
            return ConnState::Closed;
        }
        self.inbox.conn_state()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Largest payload [`send`](Self::send) accepts.
    pub fn max_datagram_size(&self) -> usize {
        self.shared.config.max_datagram_size
    }

    /// Inbound payloads discarded by the overflow policy.
    pub fn dropped(&self) -> u64 {
        self.inbox.dropped()
    }

    /// Payloads received but not yet taken.
    pub fn queued(&self) -> usize {
        self.inbox.len()
    }

    /// Wrap this connection in a `Read + Write` adapter.
    pub fn into_stream(self) -> ConnectionStream {
        ConnectionStream::new(self)
    }

    #[cfg(test)]
    pub(crate) fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_addr", &self.shared.local_addr)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}
