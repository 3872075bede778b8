use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use udpconn_transport::{Connection, TransportError};

use crate::cmd::{accept_loop, bind, install_ctrlc_handler, EchoArgs, POLL};
use crate::exit::{transport_error, CliResult, SUCCESS};
use crate::output::OutputFormat;

enum RecvDisposition {
    Echo(bytes::Bytes),
    Idle,
    Stop,
}

pub fn run(args: EchoArgs, _format: OutputFormat) -> CliResult<i32> {
    let transport = bind(&args.endpoint, args.port)?;
    let acceptor = transport
        .listen()
        .map_err(|err| transport_error("listen failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut workers = Vec::new();
    accept_loop(&acceptor, &running, |conn, id| {
        let running = running.clone();
        reap_finished(&mut workers);
        workers.push(thread::spawn(move || echo_connection(conn, id, &running)));
    });

    transport.shutdown();
    for worker in workers {
        let _ = worker.join();
    }
    Ok(SUCCESS)
}

/// Join workers whose connection already ended.
fn reap_finished(workers: &mut Vec<JoinHandle<()>>) {
    let (done, live): (Vec<_>, Vec<_>) = workers.drain(..).partition(|h| h.is_finished());
    for worker in done {
        let _ = worker.join();
    }
    *workers = live;
}

fn echo_connection(conn: Connection, id: u64, running: &AtomicBool) {
    let remote = conn.remote_addr();
    while running.load(Ordering::SeqCst) {
        match classify(conn.receive_timeout(POLL)) {
            RecvDisposition::Echo(payload) => {
                tracing::info!(%remote, id, size = payload.len(), "echoing datagram");
                if let Err(err) = conn.send(&payload) {
                    tracing::warn!(%remote, error = %err, "echo send failed");
                }
            }
            RecvDisposition::Idle => continue,
            RecvDisposition::Stop => break,
        }
    }
}

fn classify(result: udpconn_transport::Result<Option<bytes::Bytes>>) -> RecvDisposition {
    match result {
        Ok(Some(payload)) => RecvDisposition::Echo(payload),
        Err(TransportError::Timeout(_)) => RecvDisposition::Idle,
        Ok(None) => RecvDisposition::Stop,
        Err(err) => {
            tracing::warn!(error = %err, "receive failed");
            RecvDisposition::Stop
        }
    }
}
