use std::path::PathBuf;

use ipnet::IpNet;

use crate::error::{GatewayError, Result};

/// Process-wide settings loaded once at startup from the environment
/// (§6). Immutable for the lifetime of the process; shared by the
/// listener and every tunnel session via `Arc`.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub ws_path: String,
    pub token: String,
    pub cidrs: Vec<IpNet>,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl Config {
    /// Reads `PORT`, `WS_PATH`, `TOKEN`, `CIDRS`, `USE_TLS`, `CERT_FILE`
    /// and `KEY_FILE` from the environment, applying the defaults of §6.
    /// Parse and consistency failures are returned rather than panicking;
    /// the caller treats them as fatal startup errors.
    pub fn from_env() -> Result<Self> {
        let port = match std::env::var("PORT") {
            Ok(v) if !v.is_empty() => v
                .parse()
                .map_err(|e| GatewayError::InvalidPort(v.clone(), e))?,
            _ => 8080,
        };

        let ws_path = match std::env::var("WS_PATH") {
            Ok(v) if !v.is_empty() => v,
            _ => "/ws".to_string(),
        };

        let token = std::env::var("TOKEN").unwrap_or_default();

        let cidrs_raw = match std::env::var("CIDRS") {
            Ok(v) if !v.is_empty() => v,
            _ => "0.0.0.0/0,::/0".to_string(),
        };
        let cidrs = cidrs_raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<IpNet>()
                    .map_err(|e| GatewayError::InvalidCidr(s.to_string(), e))
            })
            .collect::<Result<Vec<_>>>()?;

        let use_tls = match std::env::var("USE_TLS") {
            Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
            Err(_) => false,
        };

        let tls = if use_tls {
            let cert_file = non_empty_env("CERT_FILE")
                .ok_or(GatewayError::MissingTlsMaterial("CERT_FILE"))?;
            let key_file =
                non_empty_env("KEY_FILE").ok_or(GatewayError::MissingTlsMaterial("KEY_FILE"))?;
            Some(TlsConfig {
                cert_file: PathBuf::from(cert_file),
                key_file: PathBuf::from(key_file),
            })
        } else {
            None
        };

        Ok(Self {
            port,
            ws_path,
            token,
            cidrs,
            tls,
        })
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
