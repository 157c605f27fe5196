//! Per-connection I/O: the reader/writer task pair and the client session.
//!
//! Three tasks run per live connection. The reader pulls bounded chunks
//! off the socket under a short deadline and turns CRLF-separated
//! fragments into dispatcher events. The writer drains a bounded line
//! queue onto the socket under a long deadline. The session sits between
//! the dispatcher's output queue and the writer queue, owns the stop
//! fan-out, and reports the hangup when it exits. None of them touch
//! shared server state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::server::{ClientId, Event};

/// Capacity of the session output queue and the writer queue.
pub const OUTPUT_QUEUE_LEN: usize = 100;

/// Largest chunk pulled from the socket in one read.
const READ_CHUNK: usize = 512;

/// Read deadline. Bounds how long the reader goes without polling its
/// stop signal, and therefore the cooperative shutdown latency.
const READ_DEADLINE: Duration = Duration::from_secs(3);

/// Write deadline for a single outbound line.
const WRITE_DEADLINE: Duration = Duration::from_secs(30);

/// Shared stop handle for one connection.
///
/// Cloned into the dispatcher's client table and both I/O tasks. The
/// first `disconnect` wins; repeats are no-ops because the stop queue
/// holds a single token.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    connected: Arc<AtomicBool>,
    stop: mpsc::Sender<()>,
}

impl ConnHandle {
    /// A fresh handle and the receiving end of its stop queue.
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (stop, stop_rx) = mpsc::channel(1);
        let handle = ConnHandle {
            connected: Arc::new(AtomicBool::new(true)),
            stop,
        };
        (handle, stop_rx)
    }

    /// Whether replies may still be offered to this connection.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mark the connection down and wake the session for teardown.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.stop.try_send(());
    }
}

/// The session task for one accepted socket.
pub struct Session {
    id: ClientId,
    socket: TcpStream,
    events: mpsc::Sender<Event>,
    output_rx: mpsc::Receiver<String>,
    stop_rx: mpsc::Receiver<()>,
    handle: ConnHandle,
}

impl Session {
    /// Build a session and its dispatcher-facing handles. Nothing runs
    /// until [`Session::spawn`], so the caller can register the client
    /// with the dispatcher before any input event can race ahead.
    pub fn new(
        id: ClientId,
        socket: TcpStream,
        events: mpsc::Sender<Event>,
    ) -> (Session, ConnHandle, mpsc::Sender<String>) {
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE_LEN);
        let (handle, stop_rx) = ConnHandle::new();
        let session = Session {
            id,
            socket,
            events,
            output_rx,
            stop_rx,
            handle: handle.clone(),
        };
        (session, handle, output_tx)
    }

    /// Start the session task, which starts the reader/writer pair.
    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        let (read_half, write_half) = self.socket.into_split();
        let (write_tx, write_rx) = mpsc::channel(OUTPUT_QUEUE_LEN);
        let (reader_stop, reader_stop_rx) = mpsc::channel(1);
        let (writer_stop, writer_stop_rx) = mpsc::channel(1);

        tokio::spawn(read_loop(
            self.id,
            read_half,
            self.events.clone(),
            reader_stop_rx,
            self.handle.clone(),
        ));
        tokio::spawn(write_loop(
            write_half,
            write_rx,
            writer_stop_rx,
            self.handle.clone(),
        ));

        loop {
            tokio::select! {
                _ = self.stop_rx.recv() => break,
                line = self.output_rx.recv() => {
                    let Some(line) = line else { break };
                    if write_tx.try_send(line).is_err() {
                        // Slow consumer: drop the line, drop the client.
                        warn!(id = %self.id, "writer queue full, dropping client");
                        self.handle.disconnect();
                    }
                }
            }
        }

        let _ = reader_stop.try_send(());
        let _ = writer_stop.try_send(());

        // Teardown runs through the dispatcher, which parts every joined
        // channel and unbinds the nick. The socket closes once the I/O
        // tasks drop their halves.
        let _ = self.events.send(Event::Hangup(self.id)).await;
    }
}

/// Pull chunks off the socket and turn CRLF-separated fragments into
/// input events. Exits on EOF or on the stop signal, which it polls
/// between reads; the read deadline bounds the gap between polls.
async fn read_loop(
    id: ClientId,
    mut socket: OwnedReadHalf,
    events: mpsc::Sender<Event>,
    mut stop_rx: mpsc::Receiver<()>,
    handle: ConnHandle,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        if stop_rx.try_recv().is_ok() {
            return;
        }
        match timeout(READ_DEADLINE, socket.read(&mut buf)).await {
            // Deadline expired. Loop around and poll the stop signal.
            Err(_) => continue,
            Ok(Ok(0)) => {
                handle.disconnect();
                return;
            }
            Ok(Ok(n)) => {
                let chunk = String::from_utf8_lossy(&buf[..n]);
                for line in chunk.split("\r\n").filter(|line| !line.is_empty()) {
                    let event = Event::Input {
                        id,
                        line: line.to_owned(),
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            // Transient read error; the next pass re-polls the signal.
            Ok(Err(_)) => continue,
        }
    }
}

/// Drain the line queue onto the socket, one write per line with the
/// terminator appended. Any write failure tears the connection down.
async fn write_loop(
    mut socket: OwnedWriteHalf,
    mut lines: mpsc::Receiver<String>,
    mut stop_rx: mpsc::Receiver<()>,
    handle: ConnHandle,
) {
    loop {
        tokio::select! {
            _ = stop_rx.recv() => return,
            line = lines.recv() => {
                let Some(mut line) = line else { return };
                line.push_str("\r\n");
                match timeout(WRITE_DEADLINE, socket.write_all(line.as_bytes())).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("write error: {e}");
                        handle.disconnect();
                        return;
                    }
                    Err(_) => {
                        handle.disconnect();
                        return;
                    }
                }
            }
        }
    }
}
