//! SOCKS5 client connector

use crate::error::{Error, Result};
use crate::outbound::{Outbound, TargetAddr};
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use watershed_dns::ProxyDialer;

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ADDR_IPV4: u8 = 0x01;
const SOCKS5_ADDR_DOMAIN: u8 = 0x03;
const SOCKS5_ADDR_IPV6: u8 = 0x04;

/// Connects through an upstream SOCKS5 server (no authentication).
pub struct Socks5Outbound {
    server: String,
}

impl Socks5Outbound {
    /// `server` is the proxy's `host:port`.
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
        }
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<()> {
        stream
            .write_all(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_NONE])
            .await?;

        let mut response = [0u8; 2];
        stream.read_exact(&mut response).await?;
        if response[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!(
                "socks5 server {} answered version {}",
                self.server, response[0]
            )));
        }
        if response[1] != SOCKS5_AUTH_NONE {
            return Err(Error::protocol(format!(
                "socks5 server {} rejected no-auth",
                self.server
            )));
        }
        Ok(())
    }

    async fn send_connect(&self, stream: &mut TcpStream, target: &TargetAddr) -> Result<()> {
        let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0x00];
        match target {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                request.push(SOCKS5_ADDR_IPV4);
                request.extend_from_slice(&addr.ip().octets());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                request.push(SOCKS5_ADDR_IPV6);
                request.extend_from_slice(&addr.ip().octets());
            }
            TargetAddr::Domain(domain, _) => {
                if domain.len() > 255 {
                    return Err(Error::protocol(format!("domain too long: {domain:?}")));
                }
                request.push(SOCKS5_ADDR_DOMAIN);
                request.push(domain.len() as u8);
                request.extend_from_slice(domain.as_bytes());
            }
        }
        request.extend_from_slice(&target.port().to_be_bytes());
        stream.write_all(&request).await?;
        Ok(())
    }

    async fn read_connect_reply(&self, stream: &mut TcpStream) -> Result<()> {
        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS5_VERSION {
            return Err(Error::protocol("bad socks5 reply version"));
        }
        if head[1] != 0x00 {
            return Err(Error::protocol(format!(
                "socks5 connect refused, code {:#04x}",
                head[1]
            )));
        }

        // drain the bound address
        let addr_len = match head[3] {
            SOCKS5_ADDR_IPV4 => 4,
            SOCKS5_ADDR_IPV6 => 16,
            SOCKS5_ADDR_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize
            }
            other => {
                return Err(Error::protocol(format!(
                    "bad socks5 bound address type {other:#04x}"
                )))
            }
        };
        let mut bound = vec![0u8; addr_len + 2];
        stream.read_exact(&mut bound).await?;
        Ok(())
    }
}

#[async_trait]
impl Outbound for Socks5Outbound {
    fn name(&self) -> &'static str {
        "socks5"
    }

    async fn dial(&self, target: &TargetAddr) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(self.server.as_str()).await.map_err(|e| {
            Error::network(format!("connect to socks5 server {} failed: {e}", self.server))
        })?;
        stream.set_nodelay(true).ok();

        self.handshake(&mut stream).await?;
        self.send_connect(&mut stream, target).await?;
        self.read_connect_reply(&mut stream).await?;

        debug!("socks5 tunnel via {} to {} established", self.server, target);
        Ok(stream)
    }
}

#[async_trait]
impl ProxyDialer for Socks5Outbound {
    async fn dial(&self, addr: &str) -> io::Result<TcpStream> {
        let target = parse_host_port(addr)?;
        Outbound::dial(self, &target).await.map_err(io::Error::other)
    }
}

/// Split `host:port` into a target, keeping IP literals as addresses.
pub(crate) fn parse_host_port(addr: &str) -> io::Result<TargetAddr> {
    if let Ok(sockaddr) = addr.parse::<SocketAddr>() {
        return Ok(TargetAddr::Ip(sockaddr));
    }
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| io::Error::other(format!("address {addr:?} has no port")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| io::Error::other(format!("bad port in {addr:?}")))?;
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(TargetAddr::Ip(SocketAddr::new(ip, port)));
    }
    Ok(TargetAddr::Domain(host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_parsing() {
        assert!(matches!(
            parse_host_port("1.2.3.4:53").unwrap(),
            TargetAddr::Ip(_)
        ));
        assert!(matches!(
            parse_host_port("dns.example:853").unwrap(),
            TargetAddr::Domain(_, 853)
        ));
        assert!(parse_host_port("noport").is_err());
    }
}
