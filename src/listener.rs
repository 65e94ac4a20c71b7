//! Listener (§4.6): binds the configured port, upgrades and admits
//! connections, and hands each admitted one to a fresh tunnel session.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::admission::{self, Outcome};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::tunnel;
use crate::ws;

/// A plain or TLS-wrapped byte stream, unified behind one type so the
/// WebSocket and tunnel layers never need to know which transport they
/// are running over.
pub enum Conn {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_flush(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Binds the listener and runs it until the process is torn down.
/// Mirrors the accept-then-handshake-in-a-task split used throughout
/// this codebase, so one slow handshake never blocks new accepts.
pub async fn run(config: Arc<Config>) -> Result<()> {
    let acceptor = match &config.tls {
        Some(tls) => Some(build_tls_acceptor(&tls.cert_file, &tls.key_file)?),
        None => None,
    };

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, tls = acceptor.is_some(), "listening");

    let mut handshakes: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let config = config.clone();
                        let acceptor = acceptor.clone();
                        handshakes.spawn(async move {
                            if let Err(e) = handle_connection(socket, peer, config, acceptor).await {
                                warn!(%peer, error = %e, "connection setup failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            Some(result) = handshakes.join_next(), if !handshakes.is_empty() => {
                if let Err(e) = result {
                    warn!(error = %e, "handshake task panicked");
                }
            }
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    config: Arc<Config>,
    acceptor: Option<TlsAcceptor>,
) -> io::Result<()> {
    let conn = match acceptor {
        Some(acceptor) => Conn::Tls(Box::new(acceptor.accept(socket).await?)),
        None => Conn::Plain(socket),
    };

    let mut reader = BufReader::new(conn);
    let Some(request) = ws::read_request(&mut reader).await? else {
        return Ok(());
    };
    let mut conn = reader.into_inner();

    if !request.is_websocket_upgrade() {
        let _ = ws::send_status(&mut conn, "400 Bad Request", "expected a WebSocket upgrade").await;
        return Ok(());
    }

    match admission::evaluate(&config, &request, peer.ip()) {
        Outcome::WrongPath => {
            // §4.2: path mismatch drops the connection without a response.
            debug!(%peer, path = %request.path, "admission: wrong path, dropping");
            return Ok(());
        }
        Outcome::Unauthorized => {
            warn!(%peer, "admission: rejected, bad token");
            let _ = ws::send_status(&mut conn, "401 Unauthorized", "invalid token").await;
            return Ok(());
        }
        Outcome::Forbidden => {
            warn!(%peer, "admission: rejected, address not in allow-list");
            let _ = ws::send_status(&mut conn, "403 Forbidden", "address not permitted").await;
            return Ok(());
        }
        Outcome::Allow => {
            info!(%peer, "admission: accepted");
        }
    }

    let sec_websocket_key = request.header("sec-websocket-key").unwrap_or_default().to_string();
    let protocol = if config.token.is_empty() {
        None
    } else {
        Some(config.token.as_str())
    };
    ws::send_switching_protocols(&mut conn, &sec_websocket_key, protocol).await?;

    let (read_half, write_half) = tokio::io::split(conn);
    let (reader, writer) = ws::from_parts(BufReader::new(read_half), write_half);
    let ws_stream = ws::WsStream::new(reader, writer);

    tunnel::run(ws_stream, peer).await;
    Ok(())
}

fn build_tls_acceptor(cert_file: &std::path::Path, key_file: &std::path::Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>> {
    let bytes = std::fs::read(path).map_err(|e| GatewayError::TlsCert(path.to_path_buf(), e))?;
    let mut reader = io::BufReader::new(bytes.as_slice());
    certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::TlsCert(path.to_path_buf(), e))
}

fn load_private_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>> {
    let bytes = std::fs::read(path).map_err(|e| GatewayError::TlsKey(path.to_path_buf(), e))?;

    let mut reader = io::BufReader::new(bytes.as_slice());
    if let Some(key) = pkcs8_private_keys(&mut reader)
        .next()
        .transpose()
        .map_err(|e| GatewayError::TlsKey(path.to_path_buf(), e))?
    {
        return Ok(PrivateKeyDer::Pkcs8(key));
    }

    let mut reader = io::BufReader::new(bytes.as_slice());
    if let Some(key) = rsa_private_keys(&mut reader)
        .next()
        .transpose()
        .map_err(|e| GatewayError::TlsKey(path.to_path_buf(), e))?
    {
        return Ok(PrivateKeyDer::Pkcs1(key));
    }

    Err(GatewayError::NoPrivateKey(path.to_path_buf()))
}
