use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, info};

use crate::acceptor::Acceptor;
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::demux;
use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::inbox::{ConnState, Inbox};
use crate::sync::lock;

/// An unrecognized sender waiting for `accept()`.
///
/// The reservation inbox already holds the sender's first payload and
/// collects anything else it sends before being accepted.
#[derive(Debug)]
pub(crate) struct PendingConnection {
    pub(crate) remote: SocketAddr,
    pub(crate) inbox: Arc<Inbox>,
    pub(crate) first_seen: Instant,
}

/// Routing state guarded by the transport's single lock.
#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) refs: usize,
    pub(crate) closed: bool,
    pub(crate) receiver_started: bool,
    pub(crate) registry: HashMap<SocketAddr, Arc<Inbox>>,
    pub(crate) listening: bool,
    pub(crate) pending: VecDeque<PendingConnection>,
    pub(crate) degraded: Option<String>,
    pub(crate) unrouted: u64,
}

impl State {
    /// Remove `inbox` from the registry and pending queue if it is still the
    /// entry registered for its remote address.
    pub(crate) fn deregister(&mut self, inbox: &Arc<Inbox>) {
        let remote = inbox.remote();
        if self
            .registry
            .get(&remote)
            .is_some_and(|current| Arc::ptr_eq(current, inbox))
        {
            self.registry.remove(&remote);
        }
        self.pending
            .retain(|pending| !Arc::ptr_eq(&pending.inbox, inbox));
    }
}

/// Everything one bound endpoint shares between its leases, connections,
/// acceptor and receive loop.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: TransportConfig,
    pub(crate) local_addr: SocketAddr,
    endpoint: Mutex<Option<Arc<Endpoint>>>,
    pub(crate) state: Mutex<State>,
    pub(crate) accept_ready: Condvar,
    shutdown: AtomicBool,
    receiver: Mutex<Option<JoinHandle<()>>>,
    closes: AtomicUsize,
}

impl Shared {
    /// Cancellation flag checked by the receive loop after every read.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn send_to(&self, remote: SocketAddr, payload: &[u8]) -> Result<()> {
        let max = self.config.max_datagram_size;
        if payload.len() > max {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        let endpoint = lock(&self.endpoint).clone().ok_or(TransportError::Closed)?;
        endpoint.send_to(payload, remote)?;
        tracing::trace!(%remote, size = payload.len(), "sent datagram");
        Ok(())
    }

    /// Start the receive loop if it is not running yet.
    fn ensure_receiver(self: &Arc<Self>, state: &mut State) -> Result<()> {
        if state.receiver_started {
            return Ok(());
        }
        let endpoint = lock(&self.endpoint).clone().ok_or(TransportError::Closed)?;
        let handle = demux::spawn(Arc::clone(self), endpoint)?;
        *lock(&self.receiver) = Some(handle);
        state.receiver_started = true;
        Ok(())
    }

    /// Close the endpoint. Only the first call has any effect.
    fn close(&self) {
        let inboxes = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.listening = false;
            state.pending.clear();
            let inboxes: Vec<_> = state.registry.drain().map(|(_, inbox)| inbox).collect();
            inboxes
        };

        for inbox in inboxes {
            inbox.close();
        }
        self.accept_ready.notify_all();

        self.shutdown.store(true, Ordering::Release);
        let endpoint = lock(&self.endpoint).take();
        if let Some(endpoint) = &endpoint {
            endpoint.wake();
        }

        let receiver = lock(&self.receiver).take();
        if let Some(handle) = receiver {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
        drop(endpoint);

        self.closes.fetch_add(1, Ordering::AcqRel);
        info!(local_addr = %self.local_addr, "closed udp endpoint");
    }

    /// Record a fatal receive failure and release every blocked caller.
    pub(crate) fn degrade(&self, reason: String) {
        let inboxes = {
            let mut state = lock(&self.state);
            if state.degraded.is_some() {
                return;
            }
            state.degraded = Some(reason.clone());
            let inboxes: Vec<_> = state.registry.values().cloned().collect();
            inboxes
        };

        tracing::warn!(local_addr = %self.local_addr, %reason, "transport degraded");
        for inbox in inboxes {
            inbox.fail(&reason);
        }
        self.accept_ready.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }
}

/// A reference-counted lease on one bound UDP endpoint.
///
/// Every `Transport` value, [`Connection`] and [`Acceptor`] holds one
/// reference. Cloning takes another; dropping or [`release`](Self::release)
/// gives it back. The endpoint is closed exactly once, when the count
/// reaches zero, or earlier through [`shutdown`](Self::shutdown).
pub struct Transport {
    pub(crate) shared: Arc<Shared>,
}

impl Transport {
    /// Bind a new endpoint with explicit configuration.
    pub fn bind(config: TransportConfig) -> Result<Self> {
        let endpoint = Endpoint::bind(config.bind_addr, config.poll_interval)?;
        let local_addr = endpoint.local_addr();
        let shared = Arc::new(Shared {
            config,
            local_addr,
            endpoint: Mutex::new(Some(Arc::new(endpoint))),
            state: Mutex::new(State {
                refs: 1,
                ..State::default()
            }),
            accept_ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
            receiver: Mutex::new(None),
            closes: AtomicUsize::new(0),
        });
        Ok(Self { shared })
    }

    /// Bind all interfaces on `port`, or an ephemeral client port for `None`.
    pub fn acquire(port: Option<u16>) -> Result<Self> {
        Self::bind(TransportConfig::with_port(port.unwrap_or(0)))
    }

    /// Take another lease on a live endpoint. `None` once it has closed.
    ///
    /// A count of zero means the last lease is on its way to closing the
    /// endpoint, so it is treated as closed too.
    pub(crate) fn lease(shared: &Arc<Shared>) -> Option<Self> {
        let mut state = lock(&shared.state);
        if state.closed || state.refs == 0 {
            return None;
        }
        Some(Self::lease_locked(shared, &mut state))
    }

    /// Take another lease while the caller already holds the state lock.
    pub(crate) fn lease_locked(shared: &Arc<Shared>, state: &mut State) -> Self {
        state.refs += 1;
        Self {
            shared: Arc::clone(shared),
        }
    }

    /// Register a virtual connection to `remote`.
    ///
    /// If `remote` already sent datagrams that are waiting for `accept()`,
    /// the reservation is adopted and those payloads are delivered to the
    /// returned connection. Fails with [`TransportError::DuplicateConnection`]
    /// if an established connection to `remote` exists.
    pub fn connect_to(&self, remote: SocketAddr) -> Result<Connection> {
        let mut state = lock(&self.shared.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        if let Some(reason) = &state.degraded {
            return Err(TransportError::Degraded(reason.clone()));
        }
        self.shared.ensure_receiver(&mut state)?;

        let inbox = match state.registry.get(&remote).cloned() {
            Some(existing) if existing.establish() => {
                debug!(%remote, "adopted pending reservation");
                existing
            }
            Some(_) => return Err(TransportError::DuplicateConnection(remote)),
            None => {
                let config = &self.shared.config;
                let inbox = Arc::new(Inbox::new(
                    remote,
                    ConnState::Established,
                    config.inbox_capacity,
                    config.overflow,
                ));
                state.registry.insert(remote, Arc::clone(&inbox));
                inbox
            }
        };

        let lease = Self::lease_locked(&self.shared, &mut state);
        drop(state);

        debug!(local_addr = %self.shared.local_addr, %remote, "connected");
        Ok(Connection::new(lease, inbox))
    }

    /// Start accepting unrecognized senders.
    ///
    /// A transport has at most one acceptor at a time.
    pub fn listen(&self) -> Result<Acceptor> {
        let mut state = lock(&self.shared.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.listening {
            return Err(TransportError::AlreadyListening);
        }
        self.shared.ensure_receiver(&mut state)?;
        state.listening = true;

        let lease = Self::lease_locked(&self.shared, &mut state);
        drop(state);

        info!(local_addr = %self.shared.local_addr, "listening");
        Ok(Acceptor::new(lease))
    }

    /// Send one datagram to `remote`.
    pub fn send_to(&self, remote: SocketAddr, payload: &[u8]) -> Result<()> {
        self.shared.send_to(remote, payload)
    }

    /// Give back this lease. The endpoint closes when the last lease goes.
    pub fn release(self) {
        drop(self);
    }

    /// Close the endpoint now, regardless of outstanding references.
    ///
    /// Blocked `accept()` and `receive()` calls return closed indications
    /// and later sends fail with [`TransportError::Closed`].
    pub fn shutdown(&self) {
        self.shared.close();
    }

    /// Address the endpoint is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Number of outstanding references.
    pub fn ref_count(&self) -> usize {
        lock(&self.shared.state).refs
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).closed
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.shared.state).listening
    }

    /// Reason the receive loop stopped, if it failed.
    pub fn degradation(&self) -> Option<String> {
        lock(&self.shared.state).degraded.clone()
    }

    /// Number of registered remote addresses, including pending reservations.
    pub fn connection_count(&self) -> usize {
        lock(&self.shared.state).registry.len()
    }

    /// Number of senders waiting for `accept()`.
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.state).pending.len()
    }

    /// Datagrams dropped because no connection or acceptor could take them.
    pub fn unrouted_count(&self) -> u64 {
        lock(&self.shared.state).unrouted
    }
}

impl Clone for Transport {
    fn clone(&self) -> Self {
        let mut state = lock(&self.shared.state);
        Self::lease_locked(&self.shared, &mut state)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let last = {
            let mut state = lock(&self.shared.state);
            state.refs = state.refs.saturating_sub(1);
            state.refs == 0
        };
        if last {
            self.shared.close();
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("local_addr", &self.shared.local_addr)
            .field(
                "type",
                &lock(&self.shared.endpoint)
                    .as_ref()
                    .map_or("closed", |endpoint| endpoint.transport_name()),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;
    use std::time::Duration;

    use super::*;

    fn loopback_transport() -> Transport {
        Transport::bind(TransportConfig::loopback(0).with_poll_interval(Duration::from_millis(20)))
            .expect("transport should bind")
    }

    #[test]
    fn release_closes_only_at_zero() {
        let first = loopback_transport();
        let shared = Arc::clone(&first.shared);
        let second = first.clone();
        assert_eq!(second.ref_count(), 2);

        first.release();
        assert!(!second.is_closed());
        assert_eq!(shared.close_count(), 0);

        second.release();
        assert!(lock(&shared.state).closed);
        assert_eq!(shared.close_count(), 1);
    }

    #[test]
    fn shutdown_then_release_closes_once() {
        let transport = loopback_transport();
        let shared = Arc::clone(&transport.shared);
        transport.shutdown();
        transport.shutdown();
        assert!(transport.is_closed());

        transport.release();
        assert_eq!(shared.close_count(), 1);
    }

    #[test]
    fn send_after_shutdown_is_closed() {
        let transport = loopback_transport();
        let target = transport.local_addr();
        transport.shutdown();

        let err = transport.send_to(target, b"late").unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[test]
    fn oversized_payload_is_rejected_before_sending() {
        let transport = Transport::bind(TransportConfig::loopback(0).with_max_datagram_size(8))
            .expect("transport should bind");
        let observer = UdpSocket::bind("127.0.0.1:0").expect("observer should bind");
        observer
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();

        let err = transport
            .send_to(observer.local_addr().unwrap(), &[0u8; 9])
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::PayloadTooLarge { size: 9, max: 8 }
        ));

        let mut buf = [0u8; 16];
        assert!(observer.recv_from(&mut buf).is_err(), "nothing should be sent");
    }

    #[test]
    fn receiver_starts_lazily() {
        let transport = loopback_transport();
        assert!(!lock(&transport.shared.state).receiver_started);

        let _conn = transport
            .connect_to("127.0.0.1:9".parse().unwrap())
            .expect("connect should succeed");
        assert!(lock(&transport.shared.state).receiver_started);
    }

    #[test]
    fn connect_twice_to_same_remote_is_duplicate() {
        let transport = loopback_transport();
        let remote: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let _first = transport.connect_to(remote).expect("first connect");

        let err = transport.connect_to(remote).unwrap_err();
        assert!(matches!(err, TransportError::DuplicateConnection(addr) if addr == remote));
    }

    #[test]
    fn connections_hold_references() {
        let transport = loopback_transport();
        let conn = transport
            .connect_to("127.0.0.1:9".parse().unwrap())
            .expect("connect should succeed");
        assert_eq!(transport.ref_count(), 2);

        conn.close();
        assert_eq!(transport.ref_count(), 1);
        assert_eq!(transport.connection_count(), 0);
    }

    #[test]
    fn listen_twice_is_rejected() {
        let transport = loopback_transport();
        let _acceptor = transport.listen().expect("listen should succeed");
        assert!(matches!(
            transport.listen(),
            Err(TransportError::AlreadyListening)
        ));
    }

    #[test]
    fn datagrams_without_listener_are_unrouted() {
        let transport = loopback_transport();
        let _conn = transport
            .connect_to("127.0.0.1:9".parse().unwrap())
            .expect("connect should succeed");

        let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();
        stranger.send_to(b"who?", transport.local_addr()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while transport.unrouted_count() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(transport.unrouted_count(), 1);
        assert_eq!(transport.pending_count(), 0);
    }

    #[test]
    fn no_new_lease_once_last_reference_dropped() {
        let transport = loopback_transport();
        let shared = Arc::clone(&transport.shared);

        // The window between the final decrement and the close itself.
        lock(&shared.state).refs = 0;
        assert!(Transport::lease(&shared).is_none());

        lock(&shared.state).refs = 1;
        assert!(Transport::lease(&shared).is_some());
        drop(transport);
        assert!(Transport::lease(&shared).is_none());
        assert_eq!(shared.close_count(), 1);
    }

    #[test]
    fn debug_names_the_transport() {
        let transport = loopback_transport();
        assert!(format!("{transport:?}").contains("\"udp\""));
        transport.shutdown();
        assert!(format!("{transport:?}").contains("\"closed\""));
    }
}
