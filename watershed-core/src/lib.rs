//! Watershed core - proxy dispatcher and ambient plumbing
//!
//! Hosts the mixed SOCKS5/HTTP inbound listener, the outbound connectors it
//! dispatches onto (direct, SOCKS5, HTTP CONNECT), the TOML configuration
//! surface and logging bootstrap. Route decisions come from the shared
//! [`watershed_dns::Resolver`].

pub mod config;
pub mod error;
pub mod inbound;
pub mod logging;
pub mod outbound;

pub use config::{Config, ProxyScheme, ProxyUri};
pub use error::{Error, Result};
pub use inbound::MixedInbound;
pub use outbound::{
    DirectOutbound, HttpOutbound, Outbound, Socks5Outbound, TargetAddr,
};
