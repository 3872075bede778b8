use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Largest UDP payload that fits in a single IPv4 datagram.
pub const DEFAULT_MAX_DATAGRAM: usize = 65_507;

/// Default number of undelivered payloads held per connection.
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// Default number of unaccepted senders held by an acceptor.
pub const DEFAULT_BACKLOG: usize = 128;

/// What a full inbox does with a newly arrived payload.
///
/// The receive loop never blocks on a slow consumer, so one of the two
/// payloads has to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued payload to make room.
    #[default]
    DropOldest,
    /// Discard the incoming payload.
    DropNewest,
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Local address to bind. Port 0 selects an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Maximum payload size for a single datagram, in both directions.
    pub max_datagram_size: usize,
    /// Maximum number of queued payloads per connection.
    pub inbox_capacity: usize,
    /// Policy applied when a connection's inbox is full.
    pub overflow: OverflowPolicy,
    /// Maximum number of senders waiting for `accept()`.
    pub backlog: usize,
    /// Read timeout of the receive loop; bounds shutdown latency.
    pub poll_interval: Duration,
    /// A remote heard from within this window counts as alive.
    pub liveness_window: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            max_datagram_size: DEFAULT_MAX_DATAGRAM,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            overflow: OverflowPolicy::default(),
            backlog: DEFAULT_BACKLOG,
            poll_interval: Duration::from_millis(100),
            liveness_window: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    /// Configuration bound to all interfaces on `port` (0 = ephemeral).
    pub fn with_port(port: u16) -> Self {
        let mut config = Self::default();
        config.bind_addr.set_port(port);
        config
    }

    /// Configuration bound to `127.0.0.1:port`.
    pub fn loopback(port: u16) -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            ..Self::default()
        }
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size;
        self
    }

    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity.max(1);
        self
    }

    pub fn with_overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }

    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_liveness_window(mut self, window: Duration) -> Self {
        self.liveness_window = window;
        self
    }
}
