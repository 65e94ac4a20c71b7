//! Black-box end-to-end scenarios driven against a real loopback
//! listener, a minimal hand-rolled WebSocket client, and in-process
//! echo servers — the six scenarios this engine is expected to satisfy.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::engine::Engine as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

use tunnelmux::codec::{parse_binary, ClientFrame};
use tunnelmux::{listener, Config};

const TOKEN: &str = "secret";

/// Minimal client-side half of the handshake and frame transport: masks
/// outgoing frames (as RFC 6455 requires of a client) and reads
/// unmasked frames back, with no ping/fragmentation support beyond what
/// these scenarios exercise.
struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    async fn connect(addr: SocketAddr, path: &str, protocol: Option<&str>) -> io::Result<(Self, u16)> {
        let mut stream = TcpStream::connect(addr).await?;
        let key = BASE64.encode(b"0123456789012345");
        let mut request = format!(
            "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {key}\r\n"
        );
        if let Some(p) = protocol {
            request.push_str(&format!("Sec-WebSocket-Protocol: {p}\r\n"));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok((Self { stream }, 0));
        }
        let response = String::from_utf8_lossy(&buf[..n]).into_owned();
        let code = response
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse().ok())
            .unwrap_or(0);
        Ok((Self { stream }, code))
    }

    async fn send_text(&mut self, text: &str) -> io::Result<()> {
        self.send_masked(0x1, text.as_bytes()).await
    }

    async fn send_binary(&mut self, payload: &[u8]) -> io::Result<()> {
        self.send_masked(0x2, payload).await
    }

    async fn send_masked(&mut self, opcode: u8, payload: &[u8]) -> io::Result<()> {
        let mask: [u8; 4] = [0x12, 0x34, 0x56, 0x78];
        let mut frame = vec![0x80 | opcode];
        let len = payload.len();
        if len > 65535 {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        } else if len > 125 {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            frame.push(0x80 | len as u8);
        }
        frame.extend_from_slice(&mask);
        let masked: Vec<u8> = payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]).collect();
        frame.extend_from_slice(&masked);
        self.stream.write_all(&frame).await
    }

    /// Reads one server frame, returning `(is_binary, payload)`.
    async fn recv(&mut self) -> io::Result<(bool, Vec<u8>)> {
        let mut head = [0u8; 2];
        self.stream.read_exact(&mut head).await?;
        let opcode = head[0] & 0x0f;
        let mut len = (head[1] & 0x7f) as u64;
        if len == 126 {
            let mut ext = [0u8; 2];
            self.stream.read_exact(&mut ext).await?;
            len = u16::from_be_bytes(ext) as u64;
        } else if len == 127 {
            let mut ext = [0u8; 8];
            self.stream.read_exact(&mut ext).await?;
            len = u64::from_be_bytes(ext);
        }
        let mut payload = vec![0u8; len as usize];
        self.stream.read_exact(&mut payload).await?;
        Ok((opcode == 0x2, payload))
    }

    async fn recv_text(&mut self) -> io::Result<String> {
        let (_, payload) = self.recv().await?;
        Ok(String::from_utf8_lossy(&payload).into_owned())
    }
}

fn encode_client_binary(tag: &str, cid: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = format!("{tag}:{cid}|").into_bytes();
    out.extend_from_slice(payload);
    out
}

/// Parses a server `UDP_DATA:cid|src|payload` frame, which carries one
/// more header field than the client's `UDP_DATA:cid|payload`.
fn parse_server_udp_data(raw: &[u8]) -> (String, String, Vec<u8>) {
    let colon = raw.iter().position(|&b| b == b':').unwrap();
    let rest = &raw[colon + 1..];
    let pipe1 = rest.iter().position(|&b| b == b'|').unwrap();
    let cid = String::from_utf8(rest[..pipe1].to_vec()).unwrap();
    let rest = &rest[pipe1 + 1..];
    let pipe2 = rest.iter().position(|&b| b == b'|').unwrap();
    let src = String::from_utf8(rest[..pipe2].to_vec()).unwrap();
    (cid, src, rest[pipe2 + 1..].to_vec())
}

async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// A TCP echo server that tracks its live connection count, for the
/// teardown scenario.
async fn spawn_tracked_tcp_echo() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let counted = count.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let counted = counted.clone();
            counted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                counted.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });
    (addr, count)
}

async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, src)) => {
                    let _ = socket.send_to(&buf[..n], src).await;
                }
                Err(_) => return,
            }
        }
    });
    addr
}

async fn spawn_gateway(cidrs: &str, token: &str) -> SocketAddr {
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);
    let config = Arc::new(Config {
        port: addr.port(),
        ws_path: "/ws".to_string(),
        token: token.to_string(),
        cidrs: cidrs.split(',').map(|s| s.parse().unwrap()).collect(),
        tls: None,
    });
    tokio::spawn(listener::run(config));
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

#[tokio::test]
async fn tcp_echo_round_trips_and_closes() {
    let echo_addr = spawn_tcp_echo().await;
    let gw = spawn_gateway("0.0.0.0/0", TOKEN).await;
    let (mut client, status) = TestClient::connect(gw, "/ws", Some(TOKEN)).await.unwrap();
    assert_eq!(status, 101);

    client
        .send_text(&format!("TCP:c1|{echo_addr}|hello"))
        .await
        .unwrap();
    assert_eq!(client.recv_text().await.unwrap(), "CONNECTED:c1");

    let (is_binary, payload) = client.recv().await.unwrap();
    assert!(is_binary);
    match parse_binary(&payload).unwrap() {
        ClientFrame::Data { cid, payload } => {
            assert_eq!(cid, "c1");
            assert_eq!(payload, b"hello");
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    client
        .send_binary(&encode_client_binary("DATA", "c1", b"world"))
        .await
        .unwrap();
    let (is_binary, payload) = client.recv().await.unwrap();
    assert!(is_binary);
    match parse_binary(&payload).unwrap() {
        ClientFrame::Data { cid, payload } => {
            assert_eq!(cid, "c1");
            assert_eq!(payload, b"world");
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    client.send_text("CLOSE:c1").await.unwrap();
}

#[tokio::test]
async fn udp_echo_round_trips_with_annotated_source() {
    let echo_addr = spawn_udp_echo().await;
    let gw = spawn_gateway("0.0.0.0/0", TOKEN).await;
    let (mut client, status) = TestClient::connect(gw, "/ws", Some(TOKEN)).await.unwrap();
    assert_eq!(status, 101);

    client
        .send_text(&format!("UDP_CONNECT:u1|{echo_addr}"))
        .await
        .unwrap();
    assert_eq!(client.recv_text().await.unwrap(), "UDP_CONNECTED:u1");

    client
        .send_binary(&encode_client_binary("UDP_DATA", "u1", b"ping"))
        .await
        .unwrap();
    let (is_binary, payload) = client.recv().await.unwrap();
    assert!(is_binary);
    let (cid, src, data) = parse_server_udp_data(&payload);
    assert_eq!(cid, "u1");
    assert_eq!(src, echo_addr.to_string());
    assert_eq!(data, b"ping");

    client.send_text("UDP_CLOSE:u1").await.unwrap();
}

#[tokio::test]
async fn claim_always_yields_matching_ack() {
    let gw = spawn_gateway("0.0.0.0/0", TOKEN).await;
    let (mut client, status) = TestClient::connect(gw, "/ws", Some(TOKEN)).await.unwrap();
    assert_eq!(status, 101);

    for _ in 0..3 {
        client.send_text("CLAIM:42|abc").await.unwrap();
        assert_eq!(client.recv_text().await.unwrap(), "CLAIM_ACK:42|abc");
    }
}

#[tokio::test]
async fn admission_rejects_wrong_token() {
    let gw = spawn_gateway("0.0.0.0/0", TOKEN).await;
    let (_client, status) = TestClient::connect(gw, "/ws", Some("wrong")).await.unwrap();
    assert_eq!(status, 401);
}

#[tokio::test]
async fn admission_rejects_address_outside_allow_list() {
    let gw = spawn_gateway("203.0.113.0/24", TOKEN).await;
    let (_client, status) = TestClient::connect(gw, "/ws", Some(TOKEN)).await.unwrap();
    assert_eq!(status, 403);
}

#[tokio::test]
async fn admission_drops_connection_on_wrong_path() {
    let gw = spawn_gateway("0.0.0.0/0", TOKEN).await;
    let (mut client, _ignored_status) = TestClient::connect(gw, "/other", Some(TOKEN)).await.unwrap();
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_millis(500), client.stream.read(&mut buf)).await;
    assert!(matches!(read, Ok(Ok(0)) | Err(_)));
}

#[tokio::test]
async fn closing_the_tunnel_tears_down_outbound_connections() {
    let (echo_addr, live) = spawn_tracked_tcp_echo().await;
    let gw = spawn_gateway("0.0.0.0/0", TOKEN).await;
    let (mut client, status) = TestClient::connect(gw, "/ws", Some(TOKEN)).await.unwrap();
    assert_eq!(status, 101);

    client.send_text(&format!("TCP:c1|{echo_addr}")).await.unwrap();
    assert_eq!(client.recv_text().await.unwrap(), "CONNECTED:c1");
    assert_eq!(live.load(Ordering::SeqCst), 1);

    drop(client);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while live.load(Ordering::SeqCst) != 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(live.load(Ordering::SeqCst), 0);
}
