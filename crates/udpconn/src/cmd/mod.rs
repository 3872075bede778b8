use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use udpconn_transport::{
    Acceptor, Connection, Transport, TransportConfig, TransportError, DEFAULT_MAX_DATAGRAM,
};

use crate::exit::{transport_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod echo;
pub mod listen;
pub mod send;
pub mod version;

/// How long blocking calls wait before re-checking for Ctrl-C.
pub(crate) const POLL: Duration = Duration::from_millis(200);

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept connections and echo every datagram back.
    Echo(EchoArgs),
    /// Send a single datagram.
    Send(SendArgs),
    /// Accept connections and print received datagrams.
    Listen(ListenArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Echo(args) => echo::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Listen(args) => listen::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug, Clone)]
pub struct EndpointArgs {
    /// Local address to bind.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,
    /// Maximum datagram payload size in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_DATAGRAM)]
    pub max_datagram: usize,
}

impl EndpointArgs {
    pub fn config(&self, port: u16) -> TransportConfig {
        TransportConfig::default()
            .with_bind_addr(SocketAddr::new(self.bind, port))
            .with_max_datagram_size(self.max_datagram)
    }
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Local port to listen on.
    #[arg(long, short = 'p')]
    pub port: u16,
    #[command(flatten)]
    pub endpoint: EndpointArgs,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Remote address (ip:port) to send to.
    pub remote: SocketAddr,
    /// Local port to send from. Default: ephemeral.
    #[arg(long, short = 'p')]
    pub port: Option<u16>,
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    /// JSON payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Wait for one reply datagram and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for a reply when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Local port to listen on.
    #[arg(long, short = 'p')]
    pub port: u16,
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    /// Exit after receiving N datagrams.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn bind(endpoint: &EndpointArgs, port: u16) -> CliResult<Transport> {
    Transport::bind(endpoint.config(port)).map_err(|err| transport_error("bind failed", err))
}

pub(crate) fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}

/// Accept connections until `running` clears, numbering them from 1.
pub(crate) fn accept_loop<F>(acceptor: &Acceptor, running: &AtomicBool, mut on_connection: F)
where
    F: FnMut(Connection, u64),
{
    let mut next_id = 1u64;
    while running.load(Ordering::SeqCst) {
        match acceptor.accept_timeout(POLL) {
            Ok(conn) => {
                tracing::info!(remote = %conn.remote_addr(), id = next_id, "accepted connection");
                on_connection(conn, next_id);
                next_id += 1;
            }
            Err(err) if err.is_recoverable() => continue,
            Err(err) => {
                if !matches!(err, TransportError::Closed) {
                    tracing::warn!(error = %err, "accept loop stopped");
                }
                break;
            }
        }
    }
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        _ => Err(CliError::new(
            USAGE,
            format!("unsupported duration unit: {unit}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
    }

    #[test]
    fn endpoint_args_build_config() {
        let args = EndpointArgs {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            max_datagram: 512,
        };
        let config = args.config(5000);
        assert_eq!(config.bind_addr, "127.0.0.1:5000".parse().unwrap());
        assert_eq!(config.max_datagram_size, 512);
    }

    #[test]
    fn accept_loop_stops_when_not_running() {
        let transport = Transport::bind(TransportConfig::loopback(0)).unwrap();
        let acceptor = transport.listen().unwrap();
        let running = AtomicBool::new(false);
        let mut accepted = 0;
        accept_loop(&acceptor, &running, |_, _| accepted += 1);
        assert_eq!(accepted, 0);
    }
}
