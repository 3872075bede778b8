use std::fs;
use std::time::Duration;

use bytes::Bytes;
use udpconn_transport::{Connection, TransportError};

use crate::cmd::{bind, parse_duration, SendArgs};
use crate::exit::{transport_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_datagram, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let payload = resolve_payload(&args)?;

    let transport = bind(&args.endpoint, args.port.unwrap_or(0))?;
    let conn = transport
        .connect_to(args.remote)
        .map_err(|err| transport_error("connect failed", err))?;

    conn.send(&payload)
        .map_err(|err| transport_error("send failed", err))?;
    tracing::debug!(remote = %args.remote, size = payload.len(), "sent datagram");

    if args.wait {
        let reply = wait_for_reply(&conn, wait_timeout)
            .map_err(|err| transport_error("receive failed", err))?;
        print_datagram(&reply, conn.remote_addr(), 1, format);
    }

    Ok(SUCCESS)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(json.as_bytes().to_vec());
    }
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        });
    }
    Ok(Vec::new())
}

trait ReplyReceiver {
    fn receive_within(&self, timeout: Duration) -> udpconn_transport::Result<Option<Bytes>>;
}

impl ReplyReceiver for Connection {
    fn receive_within(&self, timeout: Duration) -> udpconn_transport::Result<Option<Bytes>> {
        self.receive_timeout(timeout)
    }
}

/// Wait for one reply; an end-of-stream counts as the connection closing.
fn wait_for_reply<R: ReplyReceiver>(
    receiver: &R,
    timeout: Duration,
) -> udpconn_transport::Result<Bytes> {
    receiver
        .receive_within(timeout)?
        .ok_or(TransportError::ConnectionClosed)
}
