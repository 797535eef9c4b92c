//! Upstream DNS client
//!
//! One upstream endpoint (nameserver + protocol), optionally dialed through
//! a proxy. `exchange` is a single round trip; `race` spawns three of them
//! and keeps the first success.

use crate::doh::{self, DohEndpoint};
use crate::error::{DnsError, Result};
use crate::message;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Upstream wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
    /// Google JSON DNS over HTTPS.
    Https,
}

/// Dials TCP connections on behalf of an upstream transport, e.g. through a
/// SOCKS5 proxy. Implemented by the outbound connectors in `watershed-core`.
#[async_trait]
pub trait ProxyDialer: Send + Sync {
    async fn dial(&self, addr: &str) -> io::Result<TcpStream>;
}

/// Total deadline for one upstream round trip.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Number of concurrent probes spawned by [`DnsClient::race`].
const RACE_PROBES: usize = 3;

/// Client for one upstream DNS endpoint.
#[derive(Clone)]
pub struct DnsClient {
    nameserver: String,
    protocol: Protocol,
    dialer: Option<Arc<dyn ProxyDialer>>,
    doh: Option<DohEndpoint>,
    tls: Option<TlsConnector>,
    timeout: Duration,
}

impl DnsClient {
    /// Create a client for `nameserver`.
    ///
    /// For [`Protocol::Https`] the nameserver is a DoH URL; otherwise it is
    /// `host:port`. A dialer can only be combined with TCP or HTTPS: a
    /// CONNECT-style proxy cannot carry UDP, so that pairing is rejected
    /// here rather than failing on every dial.
    pub fn new(
        nameserver: impl Into<String>,
        protocol: Protocol,
        dialer: Option<Arc<dyn ProxyDialer>>,
    ) -> Result<Self> {
        let nameserver = nameserver.into();
        if protocol == Protocol::Udp && dialer.is_some() {
            return Err(DnsError::Config(
                "a proxied upstream must use tcp or https".to_string(),
            ));
        }

        let (doh, tls) = if protocol == Protocol::Https {
            (
                Some(DohEndpoint::parse(&nameserver)?),
                Some(doh::tls_connector()),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            nameserver,
            protocol,
            dialer,
            doh,
            tls,
            timeout: EXCHANGE_TIMEOUT,
        })
    }

    /// Override the per-exchange deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn nameserver(&self) -> &str {
        &self.nameserver
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Build a question for `domain` and race it, optionally tagged with an
    /// ECS hint.
    pub async fn query(
        &self,
        domain: &str,
        rtype: RecordType,
        ecs: Option<IpAddr>,
    ) -> Result<Message> {
        let mut name = Name::from_ascii(domain)
            .map_err(|e| DnsError::Name(format!("invalid domain {domain:?}: {e}")))?;
        name.set_fqdn(true);

        let mut req = Message::new();
        req.set_id(rand::random());
        req.set_message_type(MessageType::Query);
        req.set_op_code(OpCode::Query);
        req.set_recursion_desired(true);
        req.add_query(Query::query(name, rtype));
        if let Some(addr) = ecs {
            message::set_ecs(&mut req, addr);
        }
        self.race(&req).await
    }

    /// One round trip to the upstream.
    pub async fn exchange(&self, req: &Message) -> Result<Message> {
        match self.protocol {
            Protocol::Udp => self.exchange_udp(req).await,
            Protocol::Tcp => self.exchange_tcp(req).await,
            Protocol::Https => self.exchange_doh(req).await,
        }
    }

    /// Issue [`RACE_PROBES`] concurrent exchanges and return the first
    /// success; when every probe fails, the last failure is returned.
    ///
    /// The channel holds one slot per probe so losing tasks finish and drop
    /// their result without blocking. Losers are not cancelled; each probe
    /// is already bounded by the exchange deadline.
    pub async fn race(&self, req: &Message) -> Result<Message> {
        let (tx, mut rx) = mpsc::channel::<Result<Message>>(RACE_PROBES);
        for _ in 0..RACE_PROBES {
            let client = self.clone();
            let req = req.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(client.exchange(&req).await).await;
            });
        }
        drop(tx);

        let mut last_err = None;
        while let Some(result) = rx.recv().await {
            match result {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    debug!("upstream {} probe failed: {}", self.nameserver, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| DnsError::QueryFailed("no probe completed".to_string())))
    }

    async fn exchange_udp(&self, req: &Message) -> Result<Message> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let data = req.to_vec()?;
        socket.send_to(&data, self.nameserver.as_str()).await?;

        let mut buf = vec![0u8; 4096];
        let (len, _) = timeout(self.timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| DnsError::Timeout)??;

        let resp = Message::from_vec(&buf[..len])?;
        if resp.id() != req.id() {
            return Err(DnsError::IdMismatch);
        }
        Ok(resp)
    }

    async fn exchange_tcp(&self, req: &Message) -> Result<Message> {
        let mut stream = self.dial_tcp().await?;
        let data = req.to_vec()?;

        // TCP DNS uses a 2-byte length prefix
        let len = (data.len() as u16).to_be_bytes();
        timeout(self.timeout, async {
            stream.write_all(&len).await?;
            stream.write_all(&data).await
        })
        .await
        .map_err(|_| DnsError::Timeout)??;

        let mut len_buf = [0u8; 2];
        timeout(self.timeout, stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| DnsError::Timeout)??;
        let len = u16::from_be_bytes(len_buf) as usize;

        let mut buf = vec![0u8; len];
        timeout(self.timeout, stream.read_exact(&mut buf))
            .await
            .map_err(|_| DnsError::Timeout)??;

        let resp = Message::from_vec(&buf)?;
        if resp.id() != req.id() {
            return Err(DnsError::IdMismatch);
        }
        Ok(resp)
    }

    async fn exchange_doh(&self, req: &Message) -> Result<Message> {
        let endpoint = self
            .doh
            .as_ref()
            .ok_or_else(|| DnsError::Config("DoH endpoint not configured".to_string()))?;
        let tls = self
            .tls
            .as_ref()
            .ok_or_else(|| DnsError::Tls("TLS connector not initialized".to_string()))?;
        doh::exchange(endpoint, tls, self.dialer.as_ref(), req, self.timeout).await
    }

    async fn dial_tcp(&self) -> Result<TcpStream> {
        let stream = match &self.dialer {
            Some(dialer) => timeout(self.timeout, dialer.dial(&self.nameserver))
                .await
                .map_err(|_| DnsError::Timeout)??,
            None => timeout(self.timeout, TcpStream::connect(self.nameserver.as_str()))
                .await
                .map_err(|_| DnsError::Timeout)??,
        };
        stream.set_nodelay(true).ok();
        Ok(stream)
    }
}
