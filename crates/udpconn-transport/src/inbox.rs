//! Per-connection inbound delivery queue.
//!
//! The receive loop is the only producer; connection owners are consumers.
//! Each inbox has its own lock so a slow consumer never holds up delivery to
//! other connections on the same transport.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::OverflowPolicy;
use crate::error::{Result, TransportError};
use crate::sync::{lock, wait_until};

/// Lifecycle of a virtual connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Provisionally reserved for an unrecognized sender; waiting for `accept()`.
    Connecting,
    /// Registered by `connect_to` or promoted by `accept`.
    Established,
    /// Deregistered; nothing more is delivered.
    Closed,
}

/// Outcome of offering a payload to an inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Queued,
    /// Queued after evicting the oldest payload.
    Evicted,
    /// Discarded because the inbox was full.
    Rejected,
    /// Discarded because the connection is closed.
    Closed,
}

#[derive(Debug)]
struct InboxState {
    queue: VecDeque<Bytes>,
    conn: ConnState,
    failure: Option<String>,
    last_seen: Option<Instant>,
    dropped: u64,
}

#[derive(Debug)]
pub(crate) struct Inbox {
    remote: SocketAddr,
    capacity: usize,
    overflow: OverflowPolicy,
    state: Mutex<InboxState>,
    ready: Condvar,
}

impl Inbox {
    pub(crate) fn new(
        remote: SocketAddr,
        conn: ConnState,
        capacity: usize,
        overflow: OverflowPolicy,
    ) -> Self {
        Self {
            remote,
            capacity: capacity.max(1),
            overflow,
            state: Mutex::new(InboxState {
                queue: VecDeque::new(),
                conn,
                failure: None,
                last_seen: None,
                dropped: 0,
            }),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Offer one inbound payload. Never blocks on the consumer.
    pub(crate) fn push(&self, payload: Bytes) -> Delivery {
        let mut state = lock(&self.state);
        if state.conn == ConnState::Closed {
            return Delivery::Closed;
        }
        state.last_seen = Some(Instant::now());

        let mut outcome = Delivery::Queued;
        if state.queue.len() >= self.capacity {
            state.dropped = state.dropped.saturating_add(1);
            match self.overflow {
                OverflowPolicy::DropNewest => return Delivery::Rejected,
                OverflowPolicy::DropOldest => {
                    state.queue.pop_front();
                    outcome = Delivery::Evicted;
                }
            }
        }

        state.queue.push_back(payload);
        drop(state);
        self.ready.notify_one();
        outcome
    }

    /// Take the next payload, blocking until one arrives.
    ///
    /// `Ok(None)` is end-of-stream: the connection was closed.
    pub(crate) fn pop(&self, timeout: Option<Duration>) -> Result<Option<Bytes>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock(&self.state);
        loop {
            if state.conn == ConnState::Closed {
                return Ok(None);
            }
            if let Some(payload) = state.queue.pop_front() {
                return Ok(Some(payload));
            }
            if let Some(reason) = &state.failure {
                return Err(TransportError::Degraded(reason.clone()));
            }

            let (guard, expired) = wait_until(&self.ready, state, deadline);
            state = guard;
            if expired && state.queue.is_empty() && state.conn != ConnState::Closed {
                if let Some(reason) = &state.failure {
                    return Err(TransportError::Degraded(reason.clone()));
                }
                return Err(TransportError::Timeout(timeout.unwrap_or_default()));
            }
        }
    }

    /// Move a reservation to `Established`. Returns false if it was not `Connecting`.
    pub(crate) fn establish(&self) -> bool {
        let mut state = lock(&self.state);
        if state.conn == ConnState::Connecting {
            state.conn = ConnState::Established;
            true
        } else {
            false
        }
    }

    /// Close the inbox: discard queued payloads and wake every waiter.
    ///
    /// Returns false if it was already closed.
    pub(crate) fn close(&self) -> bool {
        let mut state = lock(&self.state);
        if state.conn == ConnState::Closed {
            return false;
        }
        state.conn = ConnState::Closed;
        state.queue.clear();
        drop(state);
        self.ready.notify_all();
        true
    }

    /// Mark the inbox failed after a fatal transport error.
    ///
    /// Already-queued payloads stay readable; afterwards receivers get the error.
    pub(crate) fn fail(&self, reason: &str) {
        let mut state = lock(&self.state);
        if state.failure.is_none() {
            state.failure = Some(reason.to_string());
        }
        drop(state);
        self.ready.notify_all();
    }

    pub(crate) fn conn_state(&self) -> ConnState {
        lock(&self.state).conn
    }

    pub(crate) fn last_seen(&self) -> Option<Instant> {
        lock(&self.state).last_seen
    }

    pub(crate) fn dropped(&self) -> u64 {
        lock(&self.state).dropped
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.state).queue.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn inbox(capacity: usize, overflow: OverflowPolicy) -> Inbox {
        let remote = "127.0.0.1:4000".parse().expect("addr should parse");
        Inbox::new(remote, ConnState::Established, capacity, overflow)
    }

    #[test]
    fn pops_in_arrival_order() {
        let inbox = inbox(8, OverflowPolicy::DropOldest);
        inbox.push(Bytes::from_static(b"one"));
        inbox.push(Bytes::from_static(b"two"));
        inbox.push(Bytes::from_static(b"three"));

        assert_eq!(inbox.pop(None).unwrap().unwrap(), "one");
        assert_eq!(inbox.pop(None).unwrap().unwrap(), "two");
        assert_eq!(inbox.pop(None).unwrap().unwrap(), "three");
    }

    #[test]
    fn drop_oldest_evicts_head() {
        let inbox = inbox(2, OverflowPolicy::DropOldest);
        assert_eq!(inbox.push(Bytes::from_static(b"a")), Delivery::Queued);
        assert_eq!(inbox.push(Bytes::from_static(b"b")), Delivery::Queued);
        assert_eq!(inbox.push(Bytes::from_static(b"c")), Delivery::Evicted);

        assert_eq!(inbox.dropped(), 1);
        assert_eq!(inbox.pop(None).unwrap().unwrap(), "b");
        assert_eq!(inbox.pop(None).unwrap().unwrap(), "c");
    }

    #[test]
    fn drop_newest_rejects_incoming() {
        let inbox = inbox(1, OverflowPolicy::DropNewest);
        assert_eq!(inbox.push(Bytes::from_static(b"a")), Delivery::Queued);
        assert_eq!(inbox.push(Bytes::from_static(b"b")), Delivery::Rejected);

        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox.pop(None).unwrap().unwrap(), "a");
    }

    #[test]
    fn closed_inbox_refuses_delivery_and_reports_eof() {
        let inbox = inbox(4, OverflowPolicy::DropOldest);
        inbox.push(Bytes::from_static(b"queued"));
        assert!(inbox.close());
        assert!(!inbox.close());

        assert_eq!(inbox.push(Bytes::from_static(b"late")), Delivery::Closed);
        assert!(inbox.pop(None).unwrap().is_none());
        assert_eq!(inbox.conn_state(), ConnState::Closed);
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let inbox = Arc::new(inbox(4, OverflowPolicy::DropOldest));
        let consumer = {
            let inbox = Arc::clone(&inbox);
            thread::spawn(move || inbox.pop(None))
        };

        thread::sleep(Duration::from_millis(50));
        inbox.close();

        let result = consumer.join().expect("consumer should finish");
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn pop_times_out_when_empty() {
        let inbox = inbox(4, OverflowPolicy::DropOldest);
        let err = inbox.pop(Some(Duration::from_millis(20))).unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[test]
    fn failure_surfaces_after_queue_drains() {
        let inbox = inbox(4, OverflowPolicy::DropOldest);
        inbox.push(Bytes::from_static(b"last"));
        inbox.fail("socket gone");

        assert_eq!(inbox.pop(None).unwrap().unwrap(), "last");
        let err = inbox.pop(None).unwrap_err();
        assert!(matches!(err, TransportError::Degraded(reason) if reason == "socket gone"));
    }

    #[test]
    fn failure_wins_over_expiring_deadline() {
        let inbox = Arc::new(inbox(4, OverflowPolicy::DropOldest));
        let consumer = {
            let inbox = Arc::clone(&inbox);
            thread::spawn(move || inbox.pop(Some(Duration::from_millis(100))))
        };
        thread::sleep(Duration::from_millis(30));

        // Hold the lock past the deadline so the consumer wakes expired and
        // finds the failure already recorded.
        let mut state = lock(&inbox.state);
        thread::sleep(Duration::from_millis(150));
        state.failure = Some("socket gone".to_string());
        drop(state);

        let result = consumer.join().expect("consumer should finish");
        assert!(matches!(result, Err(TransportError::Degraded(reason)) if reason == "socket gone"));
    }

    #[test]
    fn establish_only_promotes_reservations() {
        let remote = "127.0.0.1:4001".parse().unwrap();
        let reserved = Inbox::new(remote, ConnState::Connecting, 4, OverflowPolicy::DropOldest);
        assert!(reserved.establish());
        assert!(!reserved.establish());
        assert_eq!(reserved.conn_state(), ConnState::Established);
    }
}
