//! Client-facing DNS server (UDP + TCP)
//!
//! Both listeners bind the same address and feed the shared resolver; each
//! query runs in its own task. The first listener to fail ends the front.
//! A query the resolver cannot answer gets no reply at all: the client
//! times out instead of seeing SERVFAIL.

use crate::error::{DnsError, Result};
use crate::resolver::Resolver;

use hickory_proto::op::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

/// DNS server front.
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    listener: TcpListener,
    resolver: Arc<Resolver>,
}

impl DnsServer {
    /// Bind both transports on `listen`.
    pub async fn bind(listen: SocketAddr, resolver: Arc<Resolver>) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(listen).await?);
        let listener = TcpListener::bind(listen).await?;
        info!("dns server listening on {} (udp+tcp)", listen);
        Ok(Self {
            socket,
            listener,
            resolver,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until either transport fails.
    pub async fn run(&self) -> Result<()> {
        tokio::select! {
            r = self.run_udp() => r,
            r = self.run_tcp() => r,
        }
    }

    async fn run_udp(&self) -> Result<()> {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buf).await?;
            let data = buf[..len].to_vec();
            let resolver = Arc::clone(&self.resolver);
            let socket = Arc::clone(&self.socket);

            tokio::spawn(async move {
                match handle_query(&resolver, &data).await {
                    Ok(reply) => {
                        if let Err(e) = socket.send_to(&reply, peer).await {
                            debug!("udp reply to {} failed: {}", peer, e);
                        }
                    }
                    Err(e) => warn!("udp query from {} failed: {}", peer, e),
                }
            });
        }
    }

    async fn run_tcp(&self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let resolver = Arc::clone(&self.resolver);
            tokio::spawn(async move {
                if let Err(e) = handle_tcp_connection(stream, &resolver).await {
                    debug!("tcp dns connection from {} ended: {}", peer, e);
                }
            });
        }
    }
}

/// Handle one TCP DNS connection; queries are length-prefixed.
async fn handle_tcp_connection(mut stream: TcpStream, resolver: &Resolver) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(()); // connection closed
        }
        let len = u16::from_be_bytes(len_buf) as usize;

        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;

        // a failed query closes the connection without a reply
        let reply = handle_query(resolver, &buf).await?;

        let len = (reply.len() as u16).to_be_bytes();
        stream.write_all(&len).await?;
        stream.write_all(&reply).await?;
    }
}

/// Parse, classify and serialize one query.
async fn handle_query(resolver: &Resolver, data: &[u8]) -> Result<Vec<u8>> {
    let req =
        Message::from_vec(data).map_err(|e| DnsError::Protocol(format!("bad query: {e}")))?;
    let resp = resolver.answer_query(&req).await?;
    Ok(resp.to_vec()?)
}
