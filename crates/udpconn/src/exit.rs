use std::fmt;
use std::io;

use udpconn_transport::TransportError;

// Exit code constants aligned with rsfulmen/DDR-0002 semantics.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const ADDRESS_IN_USE: i32 = 4;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::AddrInUse => ADDRESS_IN_USE,
        io::ErrorKind::ConnectionRefused => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. } | TransportError::Io(source) => {
            io_error(context, source)
        }
        TransportError::AddressInUse { .. } => {
            CliError::new(ADDRESS_IN_USE, format!("{context}: {err}"))
        }
        TransportError::PayloadTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        TransportError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        TransportError::Closed | TransportError::ConnectionClosed => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        TransportError::Degraded(_) => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_too_large_is_data_invalid() {
        let err = transport_error(
            "send failed",
            TransportError::PayloadTooLarge { size: 10, max: 4 },
        );
        assert_eq!(err.code, DATA_INVALID);
        assert_eq!(err.message, "send failed: payload too large (10 bytes, max 4)");
    }

    #[test]
    fn address_in_use_has_dedicated_code() {
        let err = transport_error(
            "bind failed",
            TransportError::AddressInUse {
                addr: "127.0.0.1:5000".parse().unwrap(),
                source: io::Error::from(io::ErrorKind::AddrInUse),
            },
        );
        assert_eq!(err.code, ADDRESS_IN_USE);
    }

    #[test]
    fn timeout_maps_to_timeout_code() {
        let err = transport_error(
            "receive failed",
            TransportError::Timeout(std::time::Duration::from_secs(1)),
        );
        assert_eq!(err.code, TIMEOUT);
    }
}
