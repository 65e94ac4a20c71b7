//! Multiplexed WebSocket tunnel: one authenticated WebSocket carries an
//! arbitrary number of virtual TCP streams and UDP flows, each identified
//! by a client-assigned connection id (CID).
//!
//! [`listener`] accepts the upgrade and runs [`admission`]; [`tunnel`] owns
//! the per-WebSocket CID tables and dispatches frames decoded by [`codec`]
//! to a [`tcp_session`] or [`udp_session`]; [`ws`] is the hand-rolled frame
//! transport underneath it all.

pub mod admission;
pub mod codec;
pub mod config;
pub mod error;
pub mod listener;
pub mod logging;
pub mod tcp_session;
pub mod tunnel;
pub mod udp_session;
pub mod ws;

pub use config::Config;
pub use error::{GatewayError, Result};
