use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Crate-level error categories. Per-session transport failures (dial
/// errors, normal closes, UDP send failures) are not represented here:
/// they are reported as log lines and `CLOSE`/`UDP_ERROR` frames at the
/// point they occur rather than propagated across task boundaries.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid PORT {0:?}: {1}")]
    InvalidPort(String, std::num::ParseIntError),

    #[error("invalid CIDR {0:?}: {1}")]
    InvalidCidr(String, ipnet::AddrParseError),

    #[error("USE_TLS is set but {0:?} is missing")]
    MissingTlsMaterial(&'static str),

    #[error("failed to load TLS certificate from {0}: {1}")]
    TlsCert(PathBuf, std::io::Error),

    #[error("failed to load TLS private key from {0}: {1}")]
    TlsKey(PathBuf, std::io::Error),

    #[error("{0:?} does not contain a usable private key")]
    NoPrivateKey(PathBuf),

    #[error("failed to configure TLS: {0}")]
    TlsConfig(#[from] tokio_rustls::rustls::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
