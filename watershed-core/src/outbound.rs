//! Outbound connectors
//!
//! The dispatcher hands every classified connection to one of these: the
//! DIRECT connector dials the target itself, the SOCKS5 and HTTP CONNECT
//! connectors tunnel through the configured proxy server. The SOCKS5 and
//! HTTP connectors double as proxy dialers for the abroad DNS transport.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

mod direct;
mod http;
mod socks5;

pub use direct::DirectOutbound;
pub use http::HttpOutbound;
pub use socks5::Socks5Outbound;

/// Target address for outbound connections.
#[derive(Debug, Clone)]
pub enum TargetAddr {
    /// Domain name with port; a proxy-routed target stays a name so the
    /// proxy resolves it at its egress.
    Domain(String, u16),
    /// Socket address.
    Ip(SocketAddr),
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
        }
    }
}

impl TargetAddr {
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Domain(domain, _) => domain.clone(),
            TargetAddr::Ip(addr) => addr.ip().to_string(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Domain(_, port) => *port,
            TargetAddr::Ip(addr) => addr.port(),
        }
    }
}

/// An outbound transport the dispatcher can hand connections to.
#[async_trait]
pub trait Outbound: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a connection carrying data for `target`.
    async fn dial(&self, target: &TargetAddr) -> Result<TcpStream>;
}

/// Copy both directions until both close, tolerating half-close and the
/// usual teardown errors.
pub async fn relay_bidirectional<A, B>(a: &mut A, b: &mut B) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let a_to_b = async {
        let copied = tokio::io::copy(&mut ar, &mut bw).await;
        let _ = bw.shutdown().await;
        copied
    };
    let b_to_a = async {
        let copied = tokio::io::copy(&mut br, &mut aw).await;
        let _ = aw.shutdown().await;
        copied
    };

    match tokio::join!(a_to_b, b_to_a) {
        (Ok(_), Ok(_)) => Ok(()),
        (Ok(_), Err(_)) | (Err(_), Ok(_)) => Ok(()),
        (Err(e1), Err(e2)) => {
            if is_teardown(&e1) && is_teardown(&e2) {
                Ok(())
            } else {
                Err(Error::network(format!("relay failed: {e1} / {e2}")))
            }
        }
    }
}

fn is_teardown(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}
