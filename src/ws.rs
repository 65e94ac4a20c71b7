//! A minimal hand-rolled WebSocket transport: just enough of RFC 6455 to
//! carry this gateway's framing (§9 — "the WebSocket text/binary flag
//! distinguishes control-only frames from data-bearing ones"). No
//! extensions, no permessage-deflate; client frames must be masked,
//! server frames are always sent unmasked.

use std::collections::HashMap;
use std::io;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::engine::Engine as _;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
/// Caps a single WebSocket frame's payload so a malicious or confused
/// peer can't force an unbounded allocation while we read its length
/// prefix.
const MAX_FRAME_PAYLOAD: u64 = 16 * 1024 * 1024;

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

/// A parsed HTTP/1.1 upgrade request: just enough to run admission
/// (§4.2) and compute the handshake response.
#[derive(Debug)]
pub struct UpgradeRequest {
    pub path: String,
    pub headers: HashMap<String, String>,
}

impl UpgradeRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("connection")
            .map(|v| v.to_lowercase().contains("upgrade"))
            .unwrap_or(false)
            && self
                .header("upgrade")
                .map(|v| v.eq_ignore_ascii_case("websocket"))
                .unwrap_or(false)
            && self.header("sec-websocket-version").map(String::as_str) == Some("13")
            && self.header("sec-websocket-key").is_some()
    }
}

/// Reads the request line and headers of one HTTP/1.1 request.
/// Returns `Ok(None)` on a clean EOF before any bytes arrive.
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> io::Result<Option<UpgradeRequest>> {
    use tokio::io::AsyncBufReadExt;

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(None);
    }
    let mut parts = request_line.split_whitespace();
    let _method = parts.next().ok_or_else(bad_request)?;
    let path = parts.next().ok_or_else(bad_request)?.to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    Ok(Some(UpgradeRequest { path, headers }))
}

fn bad_request() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "malformed HTTP request line")
}

/// Computes `Sec-WebSocket-Accept` from the client's `Sec-WebSocket-Key`.
pub fn accept_key(sec_websocket_key: &str) -> String {
    let concatenated = format!("{sec_websocket_key}{WEBSOCKET_GUID}");
    let digest = sha1_smol::Sha1::from(concatenated).hexdigest();
    let digest_bytes = hex::decode(digest).expect("hex digest is always valid hex");
    BASE64.encode(digest_bytes)
}

/// Sends a bare HTTP/1.1 status line with a short plain-text body and
/// no `Connection: keep-alive` — the caller closes the socket right
/// after (§4.2's 401/403 responses precede any WebSocket handshake).
pub async fn send_status<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status_line: &str,
    body: &str,
) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    writer.write_all(response.as_bytes()).await
}

/// Sends the `101 Switching Protocols` response, echoing `protocol` as
/// `Sec-WebSocket-Protocol` when the token check requires it.
pub async fn send_switching_protocols<W: AsyncWrite + Unpin>(
    writer: &mut W,
    sec_websocket_key: &str,
    protocol: Option<&str>,
) -> io::Result<()> {
    let accept = accept_key(sec_websocket_key);
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: {accept}\r\n"
    );
    if let Some(protocol) = protocol {
        response.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
    }
    response.push_str("\r\n");
    writer.write_all(response.as_bytes()).await
}

/// A reassembled WebSocket message delivered to the tunnel dispatch
/// loop. Control frames (ping/pong/close) are handled inside [`WsStream`]
/// and never surfaced here.
#[derive(Debug)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// An established WebSocket connection, split into independent read and
/// write halves purely so the transport can run over `tokio::io::split`'s
/// owned halves; both live inside one [`WsStream`], which the tunnel
/// session drives from a single task (§5, §9).
pub struct WsReader<S> {
    rx: BufReader<ReadHalf<S>>,
}

pub struct WsWriter<S> {
    tx: WriteHalf<S>,
}

pub fn from_parts<S: AsyncRead + AsyncWrite>(
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
) -> (WsReader<S>, WsWriter<S>) {
    (WsReader { rx: reader }, WsWriter { tx: writer })
}

enum RawFrame {
    Data { opcode: u8, fin: bool, payload: Vec<u8> },
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

async fn read_raw_frame<R: AsyncRead + Unpin>(rx: &mut BufReader<R>) -> io::Result<RawFrame> {
    let mut head = [0u8; 2];
    rx.read_exact(&mut head).await?;
    let fin = head[0] & 0b1000_0000 != 0;
    let opcode = head[0] & 0b0000_1111;
    if head[1] & 0b1000_0000 == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "client frame was not masked",
        ));
    }
    let mut len = (head[1] & 0b0111_1111) as u64;
    if len == 126 {
        let mut ext = [0u8; 2];
        rx.read_exact(&mut ext).await?;
        len = u16::from_be_bytes(ext) as u64;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        rx.read_exact(&mut ext).await?;
        len = u64::from_be_bytes(ext);
    }
    if len > MAX_FRAME_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame payload exceeds limit",
        ));
    }
    let mut mask = [0u8; 4];
    rx.read_exact(&mut mask).await?;
    let mut payload = vec![0u8; len as usize];
    rx.read_exact(&mut payload).await?;
    for (i, b) in payload.iter_mut().enumerate() {
        *b ^= mask[i % 4];
    }

    match opcode {
        OP_PING => Ok(RawFrame::Ping(payload)),
        OP_PONG => Ok(RawFrame::Pong(payload)),
        OP_CLOSE => Ok(RawFrame::Close),
        OP_TEXT | OP_BINARY | OP_CONTINUATION => Ok(RawFrame::Data { opcode, fin, payload }),
        _ => Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported opcode")),
    }
}

/// Bundles a reader half with a handle capable of replying on the wire
/// (used for ping→pong and close→close-ack, both of which must be sent
/// from whichever side currently holds the write half).
pub struct WsStream<S> {
    pub reader: WsReader<S>,
    pub writer: WsWriter<S>,
    closed: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> WsStream<S> {
    pub fn new(reader: WsReader<S>, writer: WsWriter<S>) -> Self {
        Self {
            reader,
            writer,
            closed: false,
        }
    }

    /// Reads the next complete application message, answering pings
    /// with pongs and absorbing pongs, fully on this stream's own
    /// reader+writer pair.
    pub async fn recv(&mut self) -> io::Result<Option<WsMessage>> {
        if self.closed {
            return Ok(None);
        }
        let mut pending: Option<(u8, Vec<u8>)> = None;
        loop {
            let frame = match read_raw_frame(&mut self.reader.rx).await {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e),
            };
            match frame {
                RawFrame::Close => {
                    self.closed = true;
                    let _ = self.send_close().await;
                    return Ok(None);
                }
                RawFrame::Ping(payload) => {
                    self.send_raw(OP_PONG, &payload).await?;
                }
                RawFrame::Pong(_) => {}
                RawFrame::Data { opcode, fin, payload } => {
                    let (kind, mut buf) = match (opcode, pending.take()) {
                        (OP_CONTINUATION, Some((kind, buf))) => (kind, buf),
                        (OP_CONTINUATION, None) => {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "continuation without a preceding data frame",
                            ))
                        }
                        (op, _) => (op, Vec::new()),
                    };
                    buf.extend_from_slice(&payload);
                    if fin {
                        return Ok(Some(if kind == OP_TEXT {
                            WsMessage::Text(String::from_utf8_lossy(&buf).into_owned())
                        } else {
                            WsMessage::Binary(buf)
                        }));
                    }
                    pending = Some((kind, buf));
                }
            }
        }
    }

    pub async fn send_text(&mut self, text: &str) -> io::Result<()> {
        self.send_raw(OP_TEXT, text.as_bytes()).await
    }

    pub async fn send_binary(&mut self, data: &[u8]) -> io::Result<()> {
        self.send_raw(OP_BINARY, data).await
    }

    async fn send_raw(&mut self, opcode: u8, payload: &[u8]) -> io::Result<()> {
        let len = payload.len();
        let mut header = Vec::with_capacity(10);
        header.push(0b1000_0000 | opcode);
        if len > 65535 {
            header.push(127);
            header.extend_from_slice(&(len as u64).to_be_bytes());
        } else if len > 125 {
            header.push(126);
            header.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            header.push(len as u8);
        }
        self.writer.tx.write_all(&header).await?;
        self.writer.tx.write_all(payload).await?;
        Ok(())
    }

    async fn send_close(&mut self) -> io::Result<()> {
        self.writer.tx.write_all(&[0b1000_0000 | OP_CLOSE, 0x00]).await
    }

    /// Sends a close frame and shuts the transport down. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.send_close().await;
        let _ = self.writer.tx.shutdown().await;
    }
}
