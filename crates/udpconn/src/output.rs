use std::io::{IsTerminal, Write};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct DatagramOutput<'a> {
    remote: String,
    connection_id: u64,
    payload_size: usize,
    payload: &'a str,
    timestamp: String,
}

/// Print one received datagram.
pub fn print_datagram(
    payload: &[u8],
    remote: SocketAddr,
    connection_id: u64,
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => {
            let preview = payload_preview(payload);
            let out = DatagramOutput {
                remote: remote.to_string(),
                connection_id,
                payload_size: payload.len(),
                payload: &preview,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CONN", "REMOTE", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    connection_id.to_string(),
                    remote.to_string(),
                    payload.len().to_string(),
                    payload_preview(payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "conn={} remote={} size={} payload={}",
                connection_id,
                remote,
                payload.len(),
                payload_preview(payload)
            );
        }
        OutputFormat::Raw => {
            print_raw(payload);
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_shows_text_or_size() {
        assert_eq!(payload_preview(b"ping"), "ping");
        assert_eq!(payload_preview(&[0xff, 0xfe]), "<binary 2 bytes>");
    }
}
