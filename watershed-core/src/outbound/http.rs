//! HTTP CONNECT client connector

use crate::error::{Error, Result};
use crate::outbound::{Outbound, TargetAddr};
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use watershed_dns::ProxyDialer;

/// Connects through an upstream HTTP proxy using CONNECT.
pub struct HttpOutbound {
    server: String,
}

impl HttpOutbound {
    /// `server` is the proxy's `host:port`.
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
        }
    }
}

#[async_trait]
impl Outbound for HttpOutbound {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn dial(&self, target: &TargetAddr) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(self.server.as_str()).await.map_err(|e| {
            Error::network(format!("connect to http proxy {} failed: {e}", self.server))
        })?;
        stream.set_nodelay(true).ok();

        let authority = target.to_string();
        let request = format!(
            "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await?;

        // read the reply head only; the tunnel bytes follow
        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if head.len() > 8192 {
                return Err(Error::protocol("oversized CONNECT response"));
            }
            let n = stream.read(&mut byte).await?;
            if n == 0 {
                return Err(Error::protocol("http proxy closed during CONNECT"));
            }
            head.push(byte[0]);
        }

        let status_line = String::from_utf8_lossy(&head);
        let status = status_line
            .split_whitespace()
            .nth(1)
            .unwrap_or_default()
            .to_string();
        if status != "200" {
            return Err(Error::protocol(format!(
                "http proxy {} refused CONNECT: {}",
                self.server,
                status_line.lines().next().unwrap_or_default()
            )));
        }

        debug!("http tunnel via {} to {} established", self.server, target);
        Ok(stream)
    }
}

#[async_trait]
impl ProxyDialer for HttpOutbound {
    async fn dial(&self, addr: &str) -> io::Result<TcpStream> {
        let target = super::socks5::parse_host_port(addr)?;
        Outbound::dial(self, &target).await.map_err(io::Error::other)
    }
}
