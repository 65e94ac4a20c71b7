//! UDP proxy session (§4.4): a bound local socket with a sticky default
//! destination. Transient send/receive errors are reported but never
//! close the flow; only an explicit `UDP_CLOSE` or tunnel teardown does.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tracing::debug;

use crate::codec::ServerFrame;
use crate::tunnel::OutboundSender;

/// Inbound data queue depth per session. Close requests bypass this
/// queue entirely (see [`UdpHandle::close`]).
const INBOUND_CHANNEL_CAPACITY: usize = 64;
const MAX_DATAGRAM: usize = 64 * 1024;

enum Command {
    Data(Vec<u8>),
}

pub struct UdpHandle {
    tx: mpsc::Sender<Command>,
    close: Arc<Notify>,
}

impl UdpHandle {
    pub fn send_data(&self, payload: Vec<u8>) {
        let _ = self.tx.try_send(Command::Data(payload));
    }

    /// Delivered over a `Notify`, not the data queue, so a `UDP_CLOSE`
    /// or tunnel teardown can never be swallowed by a backed-up flow
    /// the way a queued message could be.
    pub fn close(&self) {
        self.close.notify_one();
    }
}

/// Binds a fresh local UDP socket, resolves `target` as the sticky
/// destination, and spawns the task that relays datagrams in both
/// directions for this CID.
pub async fn spawn(
    cid: String,
    target: String,
    outbound: OutboundSender,
    tasks: &mut JoinSet<()>,
) -> io::Result<UdpHandle> {
    let sticky: SocketAddr = tokio::net::lookup_host(&target)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address resolved"))?;
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;

    let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
    let close = Arc::new(Notify::new());
    tasks.spawn(run(cid, socket, sticky, outbound, rx, close.clone()));
    Ok(UdpHandle { tx, close })
}

async fn run(
    cid: String,
    socket: UdpSocket,
    sticky: SocketAddr,
    outbound: OutboundSender,
    mut rx: mpsc::Receiver<Command>,
    close: Arc<Notify>,
) {
    if outbound
        .send(ServerFrame::UdpConnected { cid: cid.clone() })
        .await
        .is_err()
    {
        return;
    }

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            // Checked first every iteration so a close request always
            // wins the next time this loop runs, regardless of how
            // backed up `rx` is.
            _ = close.notified() => {
                return;
            }
            recvd = socket.recv_from(&mut buf) => {
                match recvd {
                    Ok((n, src)) => {
                        let frame = ServerFrame::UdpData {
                            cid: cid.clone(),
                            src: src.to_string(),
                            payload: buf[..n].to_vec(),
                        };
                        if outbound.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(cid, error = %e, "udp recv error");
                        let _ = outbound
                            .send(ServerFrame::UdpError { cid: cid.clone(), message: e.to_string() })
                            .await;
                    }
                }
            }
            cmd = rx.recv() => {
                match cmd {
                    Some(Command::Data(payload)) => {
                        if let Err(e) = socket.send_to(&payload, sticky).await {
                            let _ = outbound
                                .send(ServerFrame::UdpError { cid: cid.clone(), message: e.to_string() })
                                .await;
                        }
                    }
                    None => return,
                }
            }
        }
    }
}
