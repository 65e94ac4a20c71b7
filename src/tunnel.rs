//! Tunnel session (§4.5): the per-WebSocket owner of the two CID
//! tables. Runs a single loop that is the tunnel's only reader and only
//! writer of the WebSocket; every session task reaches the wire by
//! enqueueing a [`ServerFrame`] here instead of touching the socket
//! directly (§5, §9 — "a single writer-owned send queue").

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::codec::{self, ClientFrame, ServerFrame};
use crate::tcp_session::{self, TcpHandle};
use crate::udp_session::{self, UdpHandle};
use crate::ws::{WsMessage, WsStream};

/// Depth of the shared outbound queue every session task feeds. Once
/// full, a session's `send` blocks rather than the tunnel dropping
/// frames, which is how a stalled client applies backpressure to a fast
/// remote (§5).
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

pub type OutboundSender = mpsc::Sender<ServerFrame>;

/// Drives one tunnel to completion: dispatches inbound frames to
/// sessions, relays their outbound frames to the WebSocket, and tears
/// every session down once the connection ends.
pub async fn run<S>(mut ws: WsStream<S>, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_CHANNEL_CAPACITY);
    let mut tcp_sessions: HashMap<String, TcpHandle> = HashMap::new();
    let mut udp_sessions: HashMap<String, UdpHandle> = HashMap::new();
    let mut tasks: JoinSet<()> = JoinSet::new();

    info!(%peer, "tunnel established");

    loop {
        tokio::select! {
            incoming = ws.recv() => {
                match incoming {
                    Ok(Some(message)) => {
                        let frame = match message {
                            WsMessage::Text(text) => codec::parse_text(&text),
                            WsMessage::Binary(data) => codec::parse_binary(&data),
                        };
                        match frame {
                            Some(frame) => dispatch(
                                frame,
                                &peer,
                                &outbound_tx,
                                &mut tcp_sessions,
                                &mut udp_sessions,
                                &mut tasks,
                            ).await,
                            None => debug!(%peer, "dropped an unrecognized or malformed frame"),
                        }
                    }
                    Ok(None) => {
                        debug!(%peer, "tunnel closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!(%peer, error = %e, "tunnel read failed");
                        break;
                    }
                }
            }
            Some(outgoing) = outbound_rx.recv() => {
                // A self-terminated TCP session (remote EOF, dial failure,
                // transport error) reaches the wire as a CLOSE here without
                // ever going through `dispatch`'s client-initiated path, so
                // this is also the only place that sees it end. Drop the
                // cid from the table now or a later TCP open reusing it
                // would be mistaken for a duplicate of a still-live session.
                if let ServerFrame::Close { cid } = &outgoing {
                    tcp_sessions.remove(cid);
                }
                if let Err(e) = send(&mut ws, outgoing).await {
                    warn!(%peer, error = %e, "tunnel write failed");
                    break;
                }
            }
            Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = result {
                    warn!(%peer, error = %e, "a session task panicked");
                }
            }
        }
    }

    ws.shutdown().await;
    for (_, handle) in tcp_sessions.drain() {
        handle.close();
    }
    for (_, handle) in udp_sessions.drain() {
        handle.close();
    }
    while tasks.join_next().await.is_some() {}
    info!(%peer, "tunnel torn down");
}

async fn send<S>(ws: &mut WsStream<S>, frame: ServerFrame) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let binary = frame.is_binary();
    let bytes = frame.encode();
    if binary {
        ws.send_binary(&bytes).await
    } else {
        let text = String::from_utf8(bytes).expect("text server frames are always valid UTF-8");
        ws.send_text(&text).await
    }
}

async fn dispatch(
    frame: ClientFrame,
    peer: &SocketAddr,
    outbound: &OutboundSender,
    tcp_sessions: &mut HashMap<String, TcpHandle>,
    udp_sessions: &mut HashMap<String, UdpHandle>,
    tasks: &mut JoinSet<()>,
) {
    match frame {
        ClientFrame::Tcp { cid, target, initial } => {
            if tcp_sessions.contains_key(&cid) {
                debug!(%peer, cid, "duplicate TCP open ignored");
                return;
            }
            let handle = tcp_session::spawn(cid.clone(), target, initial, outbound.clone(), tasks);
            tcp_sessions.insert(cid, handle);
        }
        ClientFrame::Data { cid, payload } => {
            if let Some(handle) = tcp_sessions.get(&cid) {
                handle.send_data(payload);
            } else {
                debug!(%peer, cid, "DATA for unknown cid dropped");
            }
        }
        ClientFrame::Close { cid } => {
            if let Some(handle) = tcp_sessions.remove(&cid) {
                handle.close();
            }
        }
        ClientFrame::UdpConnect { cid, target } => {
            if udp_sessions.contains_key(&cid) {
                debug!(%peer, cid, "duplicate UDP_CONNECT ignored");
                return;
            }
            match udp_session::spawn(cid.clone(), target, outbound.clone(), tasks).await {
                Ok(handle) => {
                    udp_sessions.insert(cid, handle);
                }
                Err(e) => {
                    warn!(%peer, cid, error = %e, "udp bind/resolve failed");
                    let _ = outbound
                        .send(ServerFrame::UdpError { cid, message: e.to_string() })
                        .await;
                }
            }
        }
        ClientFrame::UdpData { cid, payload } => {
            if let Some(handle) = udp_sessions.get(&cid) {
                handle.send_data(payload);
            } else {
                debug!(%peer, cid, "UDP_DATA for unknown cid dropped");
            }
        }
        ClientFrame::UdpClose { cid } => {
            if let Some(handle) = udp_sessions.remove(&cid) {
                handle.close();
            }
        }
        ClientFrame::Claim { a, b } => {
            let _ = outbound.send(ServerFrame::ClaimAck { a, b }).await;
        }
    }
}
