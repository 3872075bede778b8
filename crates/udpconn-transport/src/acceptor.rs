use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::connection::Connection;
use crate::error::{Result, TransportError};
use crate::inbox::ConnState;
use crate::sync::{lock, wait_until};
use crate::transport::{Shared, Transport};

/// Accepts virtual connections from senders the transport does not know yet.
///
/// The first datagram from an unknown address provisionally reserves that
/// address. Anything else it sends before `accept()` queues behind the first
/// payload on the reservation, so nothing is overwritten or lost.
pub struct Acceptor {
    shared: Arc<Shared>,
    lease: Mutex<Option<Transport>>,
    closed: AtomicBool,
}

impl Acceptor {
    pub(crate) fn new(lease: Transport) -> Self {
        Self {
            shared: Arc::clone(&lease.shared),
            lease: Mutex::new(Some(lease)),
            closed: AtomicBool::new(false),
        }
    }

    /// Accept the oldest pending sender (blocking).
    ///
    /// The returned connection's first `receive()` yields the datagram that
    /// created the request. Fails with [`TransportError::DuplicateConnection`]
    /// if `connect_to` claimed the address first; its payloads then belong to
    /// that connection.
    pub fn accept(&self) -> Result<Connection> {
        self.accept_inner(None)
    }

    /// Like [`accept`](Self::accept), failing with
    /// [`TransportError::Timeout`] if nobody arrives within `timeout`.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Connection> {
        self.accept_inner(Some(timeout))
    }

    fn accept_inner(&self, timeout: Option<Duration>) -> Result<Connection> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock(&self.shared.state);

        loop {
            if state.closed || self.closed.load(Ordering::Acquire) || !state.listening {
                return Err(TransportError::Closed);
            }

            if let Some(pending) = state.pending.pop_front() {
                let still_reserved = state
                    .registry
                    .get(&pending.remote)
                    .is_some_and(|current| Arc::ptr_eq(current, &pending.inbox));
                if !still_reserved {
                    continue;
                }
                if !pending.inbox.establish() {
                    return Err(TransportError::DuplicateConnection(pending.remote));
                }

                let lease = Transport::lease_locked(&self.shared, &mut state);
                drop(state);

                debug!(
                    remote = %pending.remote,
                    waited = ?pending.first_seen.elapsed(),
                    "accepted connection"
                );
                return Ok(Connection::new(lease, pending.inbox));
            }

            if let Some(reason) = &state.degraded {
                return Err(TransportError::Degraded(reason.clone()));
            }

            let (guard, expired) = wait_until(&self.shared.accept_ready, state, deadline);
            state = guard;
            if expired && state.pending.is_empty() {
                return Err(TransportError::Timeout(timeout.unwrap_or_default()));
            }
        }
    }

    /// Stop accepting. Idempotent.
    ///
    /// Unaccepted reservations are discarded, blocked `accept()` calls return
    /// [`TransportError::Closed`] and the transport lease is released.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let abandoned = {
            let mut state = lock(&self.shared.state);
            state.listening = false;
            // Reservations adopted by `connect_to` belong to live connections.
            let pending: Vec<_> = state
                .pending
                .drain(..)
                .filter(|request| request.inbox.conn_state() == ConnState::Connecting)
                .collect();
            for request in &pending {
                state.deregister(&request.inbox);
            }
            pending
        };
        for request in &abandoned {
            request.inbox.close();
        }
        self.shared.accept_ready.notify_all();

        debug!(
            local_addr = %self.shared.local_addr,
            abandoned = abandoned.len(),
            "acceptor closed"
        );

        let lease = lock(&self.lease).take();
        drop(lease);
    }

    /// Number of senders waiting to be accepted.
    pub fn pending(&self) -> usize {
        lock(&self.shared.state).pending.len()
    }

    /// Remote addresses waiting to be accepted, oldest first.
    pub fn pending_addrs(&self) -> Vec<SocketAddr> {
        lock(&self.shared.state)
            .pending
            .iter()
            .map(|pending| pending.remote)
            .collect()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("local_addr", &self.shared.local_addr)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}
