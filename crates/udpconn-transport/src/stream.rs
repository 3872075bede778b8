use std::io::{self, ErrorKind, Read, Write};

use bytes::{Buf, Bytes};

use crate::connection::Connection;
use crate::error::TransportError;

/// `Read + Write` adapter over a [`Connection`].
///
/// Reads drain one datagram across as many calls as needed before taking the
/// next; `read` returns 0 at end-of-stream. Each `write` sends at most one
/// datagram, so a write larger than the datagram limit is short and
/// `write_all` splits it. Datagram boundaries are not visible to the reader.
pub struct ConnectionStream {
    conn: Connection,
    current: Bytes,
}

impl ConnectionStream {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            current: Bytes::new(),
        }
    }

    /// Borrow the underlying connection.
    pub fn get_ref(&self) -> &Connection {
        &self.conn
    }

    /// Consume the adapter and return the connection.
    ///
    /// Bytes of a partially read datagram are discarded.
    pub fn into_inner(self) -> Connection {
        self.conn
    }
}

impl Read for ConnectionStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while !self.current.has_remaining() {
            match self.conn.receive().map_err(into_io)? {
                Some(payload) => self.current = payload,
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.current.remaining());
        self.current.copy_to_slice(&mut buf[..n]);
        Ok(n)
    }
}

impl Write for ConnectionStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(self.conn.max_datagram_size());
        self.conn.send(&buf[..n]).map_err(into_io)?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn into_io(err: TransportError) -> io::Error {
    match err {
        TransportError::Io(io) => io,
        TransportError::Timeout(_) => io::Error::new(ErrorKind::TimedOut, err.to_string()),
        TransportError::Closed | TransportError::ConnectionClosed => {
            io::Error::new(ErrorKind::NotConnected, err.to_string())
        }
        other => io::Error::other(other.to_string()),
    }
}

impl std::fmt::Debug for ConnectionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStream")
            .field("conn", &self.conn)
            .field("buffered", &self.current.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;
    use std::time::Duration;

    use super::*;
    use crate::config::TransportConfig;
    use crate::transport::Transport;

    fn transport(max_datagram: usize) -> Transport {
        Transport::bind(
            TransportConfig::loopback(0)
                .with_poll_interval(Duration::from_millis(20))
                .with_max_datagram_size(max_datagram),
        )
        .expect("transport should bind")
    }

    #[test]
    fn read_spans_datagram_boundaries() {
        let transport = transport(1024);
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let conn = transport.connect_to(peer.local_addr().unwrap()).unwrap();
        let mut stream = conn.into_stream();

        peer.send_to(b"hello ", transport.local_addr()).unwrap();
        peer.send_to(b"world", transport.local_addr()).unwrap();

        let mut buf = [0u8; 4];
        let mut collected = Vec::new();
        while collected.len() < 11 {
            let n = stream.read(&mut buf).unwrap();
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"hello world");
    }

    #[test]
    fn write_all_splits_at_datagram_limit() {
        let transport = transport(4);
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let conn = transport.connect_to(peer.local_addr().unwrap()).unwrap();
        let mut stream = conn.into_stream();

        stream.write_all(b"abcdefghij").unwrap();

        let mut buf = [0u8; 16];
        let mut sizes = Vec::new();
        let mut collected = Vec::new();
        for _ in 0..3 {
            let (n, _) = peer.recv_from(&mut buf).unwrap();
            sizes.push(n);
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(collected, b"abcdefghij");
    }

    #[test]
    fn read_returns_zero_after_close() {
        let transport = transport(1024);
        let conn = transport.connect_to("127.0.0.1:9".parse().unwrap()).unwrap();
        conn.close();
        let mut stream = ConnectionStream::new(conn);

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        let err = stream.write(b"x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }
}
