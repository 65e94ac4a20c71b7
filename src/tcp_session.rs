//! TCP proxy session (§4.3): one outbound TCP stream per CID, pumped in
//! both directions independently of every other session sharing the
//! tunnel.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::codec::ServerFrame;
use crate::tunnel::OutboundSender;

/// Inbound data queue depth per session; this is the per-session half
/// of the backpressure story (the other half is the tunnel's shared
/// outbound channel). Close requests bypass this queue entirely (see
/// [`TcpHandle::close`]) so a backed-up writer can never swallow one.
const INBOUND_CHANNEL_CAPACITY: usize = 64;
const READ_CHUNK: usize = 16 * 1024;

enum Command {
    Data(Vec<u8>),
}

/// A live handle to a TCP session's background task, held by the
/// tunnel's CID table.
pub struct TcpHandle {
    tx: mpsc::Sender<Command>,
    close: Arc<Notify>,
}

impl TcpHandle {
    /// Enqueues client-originated bytes for the outbound stream. Drops
    /// the write silently if the session's queue is full or already
    /// gone — a destroyed stream absorbs writes rather than erroring.
    pub fn send_data(&self, payload: Vec<u8>) {
        let _ = self.tx.try_send(Command::Data(payload));
    }

    /// Requests that the outbound stream be torn down without an echo.
    /// Delivered over a `Notify` rather than the data queue, so it
    /// cannot be lost behind a backed-up writer the way a queued
    /// message could be — the session checks it every `select!`
    /// iteration and a notification issued before that check still
    /// wakes it (§3's at-most-one-live-session-per-CID guarantee
    /// depends on this: the tunnel removes the CID from its table the
    /// instant it calls this, so the session must actually stop).
    pub fn close(&self) {
        self.close.notify_one();
    }
}

/// Spawns the task that owns this CID's outbound TCP connection and
/// returns a handle to it. `initial` is written once the connection is
/// up, ahead of anything already queued on the command channel.
pub fn spawn(
    cid: String,
    target: String,
    initial: Option<Vec<u8>>,
    outbound: OutboundSender,
    tasks: &mut JoinSet<()>,
) -> TcpHandle {
    let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
    let close = Arc::new(Notify::new());
    tasks.spawn(run(cid, target, initial, outbound, rx, close.clone()));
    TcpHandle { tx, close }
}

async fn run(
    cid: String,
    target: String,
    initial: Option<Vec<u8>>,
    outbound: OutboundSender,
    mut rx: mpsc::Receiver<Command>,
    close: Arc<Notify>,
) {
    let Some(stream) = dial(&cid, &target, initial, &outbound, &mut rx, &close).await else {
        return;
    };
    let (mut read_half, mut write_half) = stream.into_split();

    if outbound
        .send(ServerFrame::Connected { cid: cid.clone() })
        .await
        .is_err()
    {
        return;
    }

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            // Checked first every iteration so a close request — client-
            // initiated or tunnel teardown — always wins the next time
            // this loop runs, no matter how backed up `rx` is.
            _ = close.notified() => {
                return;
            }
            read = read_half.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        let _ = outbound.send(ServerFrame::Close { cid: cid.clone() }).await;
                        return;
                    }
                    Ok(n) => {
                        let frame = ServerFrame::Data { cid: cid.clone(), payload: buf[..n].to_vec() };
                        if outbound.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        log_transport_error(&cid, &e);
                        let _ = outbound.send(ServerFrame::Close { cid: cid.clone() }).await;
                        return;
                    }
                }
            }
            cmd = rx.recv() => {
                match cmd {
                    Some(Command::Data(payload)) => {
                        if write_half.write_all(&payload).await.is_err() {
                            let _ = outbound.send(ServerFrame::Close { cid: cid.clone() }).await;
                            return;
                        }
                    }
                    // No remaining sender means the handle was dropped
                    // without an explicit close — treat it the same way,
                    // no echo (§4.3).
                    None => {
                        return;
                    }
                }
            }
        }
    }
}

/// Dials `target`, buffering any `Data` commands that arrive before the
/// connection is established and flushing them in order once it is
/// (§4.3's Dialing state; §8's buffer-or-drop open question resolved
/// toward buffering). A close notification received while still dialing
/// cancels the attempt outright. `initial` — the prelude bytes carried
/// on the open frame itself — is written first, ahead of anything
/// buffered while still dialing, preserving client send order.
async fn dial(
    cid: &str,
    target: &str,
    initial: Option<Vec<u8>>,
    outbound: &OutboundSender,
    rx: &mut mpsc::Receiver<Command>,
    close: &Notify,
) -> Option<TcpStream> {
    let (result, buffered) = buffer_while_pending(TcpStream::connect(target), rx, close).await?;
    let mut stream = match result {
        Ok(stream) => stream,
        Err(e) => {
            debug!(cid, target, error = %e, "dial failed");
            let _ = outbound.send(ServerFrame::Close { cid: cid.to_string() }).await;
            return None;
        }
    };

    if let Some(initial) = initial {
        if stream.write_all(&initial).await.is_err() {
            let _ = outbound.send(ServerFrame::Close { cid: cid.to_string() }).await;
            return None;
        }
    }
    for chunk in buffered {
        if stream.write_all(&chunk).await.is_err() {
            let _ = outbound.send(ServerFrame::Close { cid: cid.to_string() }).await;
            return None;
        }
    }
    Some(stream)
}

/// Drives `pending` to completion, buffering any `Data` commands that
/// arrive on `rx` in the meantime (arrival order preserved) so the caller
/// can flush them once the awaited operation finishes. Returns `None` if
/// `close` fires or the command channel is drained first. Generic over
/// `pending` so the Dialing-state buffering behavior is exercised by a
/// unit test without needing a real socket.
async fn buffer_while_pending<T>(
    pending: impl std::future::Future<Output = T>,
    rx: &mut mpsc::Receiver<Command>,
    close: &Notify,
) -> Option<(T, Vec<Vec<u8>>)> {
    let mut buffered: Vec<Vec<u8>> = Vec::new();
    tokio::pin!(pending);
    loop {
        tokio::select! {
            _ = close.notified() => return None,
            value = &mut pending => return Some((value, buffered)),
            cmd = rx.recv() => {
                match cmd {
                    Some(Command::Data(payload)) => buffered.push(payload),
                    None => return None,
                }
            }
        }
    }
}

fn log_transport_error(cid: &str, e: &std::io::Error) {
    use std::io::ErrorKind::*;
    match e.kind() {
        ConnectionReset | BrokenPipe | UnexpectedEof => debug!(cid, "peer closed normally"),
        _ => warn!(cid, error = %e, "outbound transport error"),
    }
}
