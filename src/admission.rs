//! Connection admission (§4.2): every upgrade request is checked against
//! the configured source-address allow-list, bearer token, and path, in
//! that order, before a tunnel is ever created.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::config::Config;
use crate::ws::UpgradeRequest;

/// The result of running admission against one upgrade attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allow,
    WrongPath,
    Unauthorized,
    Forbidden,
}

/// Runs the three admission checks in the documented precedence order:
/// source address, then token, then path (§4.2). A peer that fails more
/// than one check at once is reported against the first one it fails in
/// this order.
pub fn evaluate(config: &Config, request: &UpgradeRequest, peer: IpAddr) -> Outcome {
    if !is_admitted(&config.cidrs, peer) {
        return Outcome::Forbidden;
    }
    if !token_matches(config, request) {
        return Outcome::Unauthorized;
    }
    if request.path != config.ws_path {
        return Outcome::WrongPath;
    }
    Outcome::Allow
}

/// The token travels as the `Sec-WebSocket-Protocol` header (§4.2): the
/// client offers it as a subprotocol, and a matching gateway echoes it
/// back in the handshake response so the client can confirm acceptance.
fn token_matches(config: &Config, request: &UpgradeRequest) -> bool {
    if config.token.is_empty() {
        return true;
    }
    request
        .header("sec-websocket-protocol")
        .map(|offered| offered.split(',').map(str::trim).any(|p| p == config.token))
        .unwrap_or(false)
}

/// Checks `peer` against the configured allow-list, normalizing
/// IPv4-mapped IPv6 addresses to plain IPv4 first so a `CIDRS` entry
/// written as `10.0.0.0/8` matches a peer that arrived over a
/// dual-stack listener as `::ffff:10.0.0.1`. Only IPv4 CIDR matching is
/// implemented (§4.2/§9): a genuine (non-mapped) IPv6 peer is admitted
/// only when the list contains the `::/0` wildcard, never by matching
/// a narrower IPv6 subnet.
pub fn is_admitted(cidrs: &[IpNet], peer: IpAddr) -> bool {
    match normalize(peer) {
        IpAddr::V4(v4) => cidrs.iter().any(|net| match net {
            IpNet::V4(net) => net.contains(&v4),
            IpNet::V6(_) => false,
        }),
        IpAddr::V6(_) => cidrs
            .iter()
            .any(|net| matches!(net, IpNet::V6(net) if net.prefix_len() == 0)),
    }
}

fn normalize(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}
