use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use udpconn_transport::{Connection, TransportError};

use crate::cmd::{accept_loop, bind, install_ctrlc_handler, ListenArgs, POLL};
use crate::exit::{transport_error, CliResult, SUCCESS};
use crate::output::{print_datagram, OutputFormat};

struct Received {
    connection_id: u64,
    remote: SocketAddr,
    payload: Bytes,
}

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let transport = bind(&args.endpoint, args.port)?;
    let acceptor = transport
        .listen()
        .map_err(|err| transport_error("listen failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let (tx, rx) = mpsc::channel::<Received>();
    let acceptor_thread = {
        let running = running.clone();
        thread::spawn(move || {
            accept_loop(&acceptor, &running, |conn, id| {
                spawn_reader(conn, id, tx.clone(), running.clone());
            });
        })
    };

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        let received = match rx.recv_timeout(POLL) {
            Ok(received) => received,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        print_datagram(
            &received.payload,
            received.remote,
            received.connection_id,
            format,
        );
        printed = printed.saturating_add(1);

        if args.count.is_some_and(|count| printed >= count) {
            break;
        }
    }

    running.store(false, Ordering::SeqCst);
    transport.shutdown();
    let _ = acceptor_thread.join();
    Ok(SUCCESS)
}

fn spawn_reader(conn: Connection, id: u64, tx: Sender<Received>, running: Arc<AtomicBool>) {
    thread::spawn(move || {
        let remote = conn.remote_addr();
        while running.load(Ordering::SeqCst) {
            let payload = match conn.receive_timeout(POLL) {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(TransportError::Timeout(_)) => continue,
                Err(err) => {
                    tracing::warn!(%remote, error = %err, "receive failed");
                    break;
                }
            };
            let received = Received {
                connection_id: id,
                remote,
                payload,
            };
            if tx.send(received).is_err() {
                break;
            }
        }
    });
}
