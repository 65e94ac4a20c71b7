//! Wire framing (§4.1): a single-line `TAG:field|field|...` header, with
//! binary frames carrying an opaque payload immediately after the
//! header's final pipe. Text frames never contain raw bytes ≥ 0x80;
//! binary frames are parsed by scanning bytes, never by decoding the
//! whole message as UTF-8 (§9).

/// A frame received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Tcp {
        cid: String,
        target: String,
        initial: Option<Vec<u8>>,
    },
    Data {
        cid: String,
        payload: Vec<u8>,
    },
    Close {
        cid: String,
    },
    UdpConnect {
        cid: String,
        target: String,
    },
    UdpData {
        cid: String,
        payload: Vec<u8>,
    },
    UdpClose {
        cid: String,
    },
    Claim {
        a: String,
        b: String,
    },
}

/// A frame this gateway sends to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Connected { cid: String },
    Data { cid: String, payload: Vec<u8> },
    Close { cid: String },
    UdpConnected { cid: String },
    UdpData { cid: String, src: String, payload: Vec<u8> },
    UdpError { cid: String, message: String },
    ClaimAck { a: String, b: String },
}

/// Parses a text control frame. Returns `None` for an unrecognized tag,
/// a field count that doesn't match the tag, or an empty CID — all of
/// which are dropped silently per §4.1/§7.
pub fn parse_text(line: &str) -> Option<ClientFrame> {
    let (tag, rest) = line.split_once(':')?;
    match tag {
        "TCP" => {
            let mut parts = rest.splitn(3, '|');
            let cid = parts.next()?.to_string();
            let target = parts.next()?.to_string();
            let initial = parts.next().map(|s| s.as_bytes().to_vec());
            non_empty(cid).map(|cid| ClientFrame::Tcp { cid, target, initial })
        }
        "DATA" => {
            let mut parts = rest.splitn(2, '|');
            let cid = parts.next()?.to_string();
            let payload = parts.next()?.as_bytes().to_vec();
            non_empty(cid).map(|cid| ClientFrame::Data { cid, payload })
        }
        "CLOSE" => {
            if rest.contains('|') {
                return None;
            }
            non_empty(rest.to_string()).map(|cid| ClientFrame::Close { cid })
        }
        "UDP_CONNECT" => {
            let mut parts = rest.splitn(2, '|');
            let cid = parts.next()?.to_string();
            let target = parts.next()?.to_string();
            non_empty(cid).map(|cid| ClientFrame::UdpConnect { cid, target })
        }
        "UDP_CLOSE" => {
            if rest.contains('|') {
                return None;
            }
            non_empty(rest.to_string()).map(|cid| ClientFrame::UdpClose { cid })
        }
        "CLAIM" => {
            let mut parts = rest.splitn(2, '|');
            let a = parts.next()?.to_string();
            let b = parts.next()?.to_string();
            Some(ClientFrame::Claim { a, b })
        }
        _ => None,
    }
}

/// Parses a binary data frame (`DATA` or `UDP_DATA`). The header is
/// located by scanning bytes for the tag-terminating `:` and the
/// cid-terminating `|`; everything after is opaque payload.
pub fn parse_binary(data: &[u8]) -> Option<ClientFrame> {
    let colon = data.iter().position(|&b| b == b':')?;
    let tag = std::str::from_utf8(&data[..colon]).ok()?;
    let rest = &data[colon + 1..];
    let pipe = rest.iter().position(|&b| b == b'|')?;
    let cid = std::str::from_utf8(&rest[..pipe]).ok()?.to_string();
    let payload = rest[pipe + 1..].to_vec();
    let cid = non_empty(cid)?;
    match tag {
        "DATA" => Some(ClientFrame::Data { cid, payload }),
        "UDP_DATA" => Some(ClientFrame::UdpData { cid, payload }),
        _ => None,
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

impl ServerFrame {
    /// `true` for frames that must be sent as a WebSocket binary message.
    pub fn is_binary(&self) -> bool {
        matches!(self, ServerFrame::Data { .. } | ServerFrame::UdpData { .. })
    }

    /// Encodes this frame to the bytes that go on the wire, header and
    /// payload concatenated. Text frames and binary frames share an
    /// encoding; `is_binary` tells the transport which WebSocket opcode
    /// to use.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ServerFrame::Connected { cid } => format!("CONNECTED:{cid}").into_bytes(),
            ServerFrame::Close { cid } => format!("CLOSE:{cid}").into_bytes(),
            ServerFrame::UdpConnected { cid } => format!("UDP_CONNECTED:{cid}").into_bytes(),
            ServerFrame::UdpError { cid, message } => {
                format!("UDP_ERROR:{cid}|{message}").into_bytes()
            }
            ServerFrame::ClaimAck { a, b } => format!("CLAIM_ACK:{a}|{b}").into_bytes(),
            ServerFrame::Data { cid, payload } => {
                let mut out = format!("DATA:{cid}|").into_bytes();
                out.extend_from_slice(payload);
                out
            }
            ServerFrame::UdpData { cid, src, payload } => {
                let mut out = format!("UDP_DATA:{cid}|{src}|").into_bytes();
                out.extend_from_slice(payload);
                out
            }
        }
    }
}
