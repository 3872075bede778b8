use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// Lower bound for the receive timeout; `set_read_timeout` rejects zero.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// One bound UDP socket.
///
/// Owns only byte I/O. Routing, reference counting and connection state live
/// in [`crate::transport`].
#[derive(Debug)]
pub struct Endpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl Endpoint {
    /// Bind a UDP socket to `addr` with the given receive poll interval.
    ///
    /// Binding a port that is already in use fails with
    /// [`TransportError::AddressInUse`].
    pub fn bind(addr: SocketAddr, poll_interval: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(addr).map_err(|source| {
            if source.kind() == ErrorKind::AddrInUse {
                TransportError::AddressInUse { addr, source }
            } else {
                TransportError::Bind { addr, source }
            }
        })?;
        socket
            .set_read_timeout(Some(poll_interval.max(MIN_POLL_INTERVAL)))
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        info!(%local_addr, "bound udp endpoint");

        Ok(Self { socket, local_addr })
    }

    /// Send `payload` as exactly one datagram to `dest`.
    pub fn send_to(&self, payload: &[u8], dest: SocketAddr) -> Result<()> {
        let sent = self.socket.send_to(payload, dest)?;
        if sent != payload.len() {
            return Err(TransportError::Io(std::io::Error::new(
                ErrorKind::WriteZero,
                format!("short datagram write ({sent} of {} bytes)", payload.len()),
            )));
        }
        Ok(())
    }

    /// Receive one datagram into `buf` (blocks up to the poll interval).
    pub fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    /// Nudge a blocked receiver by sending an empty datagram to ourselves.
    ///
    /// Best effort; the poll interval bounds wake-up latency if this fails.
    pub fn wake(&self) {
        let target = SocketAddr::new(reachable_ip(self.local_addr.ip()), self.local_addr.port());
        if let Err(err) = self.socket.send_to(&[], target) {
            debug!(%target, error = %err, "wake datagram not sent");
        }
    }

    /// Address this endpoint is bound to (with the OS-assigned port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "udp"
    }
}

fn reachable_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    }
}
