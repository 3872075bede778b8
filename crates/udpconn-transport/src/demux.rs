//! Receive loop: one thread per transport routing datagrams by sender.
//!
//! The transport lock is taken only for the registry lookup or insert, never
//! across the blocking read. Delivery into an inbox happens after the lock is
//! released; inboxes synchronize themselves.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::inbox::{ConnState, Delivery, Inbox};
use crate::sync::lock;
use crate::transport::{PendingConnection, Shared};

/// Where a routed datagram ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Delivered,
    /// Started a new pending connection.
    Reserved,
    Dropped,
}

pub(crate) fn spawn(shared: Arc<Shared>, endpoint: Arc<Endpoint>) -> Result<JoinHandle<()>> {
    let name = format!("udpconn-demux-{}", endpoint.local_addr().port());
    let handle = std::thread::Builder::new()
        .name(name)
        .spawn(move || run(&shared, &endpoint))?;
    Ok(handle)
}

fn run(shared: &Shared, endpoint: &Endpoint) {
    // One extra byte tells an oversized datagram apart from one that fits exactly.
    let max = shared.config.max_datagram_size;
    let mut buf = vec![0u8; max.saturating_add(1)];
    debug!(local_addr = %endpoint.local_addr(), "receive loop started");

    while !shared.is_shutting_down() {
        let (len, from) = match endpoint.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err) if is_transient(err.kind()) => continue,
            Err(err) if is_peer_unreachable(err.kind()) => {
                debug!(error = %err, "ignoring unreachable-peer notification");
                continue;
            }
            Err(err) => {
                shared.degrade(err.to_string());
                break;
            }
        };

        if shared.is_shutting_down() {
            break;
        }
        if len > max {
            warn!(%from, max, "dropping oversized datagram");
            continue;
        }

        route(shared, from, Bytes::copy_from_slice(&buf[..len]));
    }

    debug!(local_addr = %endpoint.local_addr(), "receive loop stopped");
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

/// ICMP port-unreachable from an earlier send surfaces on some platforms as a
/// receive error. It says nothing about this socket's health.
fn is_peer_unreachable(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused
    )
}

/// Route one inbound datagram to its connection or the pending queue.
pub(crate) fn route(shared: &Shared, from: SocketAddr, payload: Bytes) -> Route {
    let mut state = lock(&shared.state);
    if state.closed {
        return Route::Dropped;
    }

    if let Some(inbox) = state.registry.get(&from).cloned() {
        drop(state);
        return deliver(&inbox, payload);
    }

    if !state.listening {
        state.unrouted = state.unrouted.saturating_add(1);
        drop(state);
        debug!(%from, "no connection or acceptor for sender; dropping datagram");
        return Route::Dropped;
    }

    if state.pending.len() >= shared.config.backlog {
        state.unrouted = state.unrouted.saturating_add(1);
        drop(state);
        warn!(%from, backlog = shared.config.backlog, "accept backlog full; dropping datagram");
        return Route::Dropped;
    }

    let inbox = Arc::new(Inbox::new(
        from,
        ConnState::Connecting,
        shared.config.inbox_capacity,
        shared.config.overflow,
    ));
    inbox.push(payload);
    state.registry.insert(from, Arc::clone(&inbox));
    state.pending.push_back(PendingConnection {
        remote: from,
        inbox,
        first_seen: Instant::now(),
    });
    drop(state);

    shared.accept_ready.notify_all();
    debug!(%from, "new sender pending accept");
    Route::Reserved
}

fn deliver(inbox: &Inbox, payload: Bytes) -> Route {
    let remote = inbox.remote();
    let size = payload.len();
    match inbox.push(payload) {
        Delivery::Queued => {
            trace!(%remote, size, "delivered datagram");
            Route::Delivered
        }
        Delivery::Evicted => {
            warn!(%remote, "inbox full; evicted oldest payload");
            Route::Delivered
        }
        Delivery::Rejected => {
            warn!(%remote, size, "inbox full; dropped incoming payload");
            Route::Dropped
        }
        Delivery::Closed => {
            trace!(%remote, "connection closing; dropped datagram");
            Route::Dropped
        }
    }
}
