//! Mixed SOCKS5/HTTP inbound with route dispatch
//!
//! One TCP listener serves both proxy protocols. The first byte decides:
//! 0x05 is SOCKS5, anything else is HTTP. The sniffed bytes are replayed
//! through a [`PrefetchStream`] so the protocol handlers read an untouched
//! stream. Every accepted connection is classified against the shared
//! resolver and handed to the DIRECT or PROXY outbound.

use crate::config::parse_listen;
use crate::error::{Error, Result};
use crate::inbound::PrefetchStream;
use crate::outbound::{relay_bidirectional, Outbound, TargetAddr};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};
use url::Url;
use watershed_dns::resolver::normalize_domain;
use watershed_dns::{Resolver, Route};

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ADDR_IPV4: u8 = 0x01;
const SOCKS5_ADDR_DOMAIN: u8 = 0x03;
const SOCKS5_ADDR_IPV6: u8 = 0x04;

const SOCKS5_REPLY_OK: u8 = 0x00;
const SOCKS5_REPLY_FAILURE: u8 = 0x01;
const SOCKS5_REPLY_CMD_UNSUPPORTED: u8 = 0x07;
const SOCKS5_REPLY_ADDR_UNSUPPORTED: u8 = 0x08;

/// Upper bound on one HTTP request head.
const MAX_HTTP_HEAD: usize = 16 * 1024;

type ClientStream = PrefetchStream<TcpStream>;

/// The mixed proxy dispatcher front.
pub struct MixedInbound {
    listener: TcpListener,
    resolver: Arc<Resolver>,
    direct: Arc<dyn Outbound>,
    proxy: Arc<dyn Outbound>,
}

impl MixedInbound {
    pub async fn bind(
        listen: &str,
        resolver: Arc<Resolver>,
        direct: Arc<dyn Outbound>,
        proxy: Arc<dyn Outbound>,
    ) -> Result<Self> {
        let addr = parse_listen(listen)?;
        let listener = TcpListener::bind(addr).await?;
        info!("mixed proxy (socks5/http) listening on {}", addr);
        Ok(Self {
            listener,
            resolver,
            direct,
            proxy,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until the listener dies. Per-connection failures are logged
    /// and never stop the front.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream, peer).await {
                            debug!("proxy connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => error!("proxy accept failed: {}", e),
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        // sniff at least two bytes, then hand the handler an intact stream
        let mut prefix = vec![0u8; 2048];
        let mut filled = 0;
        while filled < 2 {
            let n = stream.read(&mut prefix[filled..]).await?;
            if n == 0 {
                return Err(Error::protocol("connection closed during sniff"));
            }
            filled += n;
        }
        prefix.truncate(filled);

        let first = prefix[0];
        let stream = PrefetchStream::new(prefix, stream);
        if first == SOCKS5_VERSION {
            debug!("{}: socks5 client", peer);
            self.handle_socks5(stream, peer).await
        } else {
            debug!("{}: http client", peer);
            self.handle_http(stream, peer).await
        }
    }

    async fn handle_socks5(&self, mut stream: ClientStream, peer: SocketAddr) -> Result<()> {
        // method selection
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!(
                "bad socks5 version {} from {}",
                header[0], peer
            )));
        }
        let mut methods = vec![0u8; header[1] as usize];
        stream.read_exact(&mut methods).await?;
        if !methods.contains(&SOCKS5_AUTH_NONE) {
            stream.write_all(&[SOCKS5_VERSION, 0xFF]).await.ok();
            return Err(Error::protocol("no acceptable socks5 auth method"));
        }
        stream
            .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_NONE])
            .await?;

        // one CONNECT request
        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS5_VERSION {
            return Err(Error::protocol("bad socks5 version in request"));
        }
        if head[1] != SOCKS5_CMD_CONNECT {
            send_socks5_reply(&mut stream, SOCKS5_REPLY_CMD_UNSUPPORTED).await.ok();
            return Err(Error::protocol(format!(
                "unsupported socks5 command {}",
                head[1]
            )));
        }

        let target = match head[3] {
            SOCKS5_ADDR_IPV4 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
                let port = read_port(&mut stream).await?;
                TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(addr)), port))
            }
            SOCKS5_ADDR_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut domain = vec![0u8; len[0] as usize];
                stream.read_exact(&mut domain).await?;
                let domain = String::from_utf8(domain)
                    .map_err(|_| Error::protocol("socks5 domain is not utf-8"))?;
                let port = read_port(&mut stream).await?;
                TargetAddr::Domain(domain, port)
            }
            SOCKS5_ADDR_IPV6 => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
                let port = read_port(&mut stream).await?;
                TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(addr)), port))
            }
            other => {
                send_socks5_reply(&mut stream, SOCKS5_REPLY_ADDR_UNSUPPORTED).await.ok();
                return Err(Error::protocol(format!(
                    "unsupported socks5 address type {other}"
                )));
            }
        };

        self.dispatch(ProxyRequest::Socks5(Socks5Request { target }), stream)
            .await
    }

    async fn handle_http(&self, mut stream: ClientStream, peer: SocketAddr) -> Result<()> {
        // read one request head; anything past it goes back onto the stream
        let mut head = Vec::with_capacity(1024);
        let mut buf = [0u8; 1024];
        let header_end = loop {
            if let Some(end) = find_header_end(&head) {
                break end;
            }
            if head.len() > MAX_HTTP_HEAD {
                return Err(Error::protocol(format!("oversized request head from {peer}")));
            }
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::protocol("connection closed before full request"));
            }
            head.extend_from_slice(&buf[..n]);
        };
        let leftover = head.split_off(header_end + 4);
        stream.unread(leftover);

        let request = HttpRequest::parse(&head)?;
        self.dispatch(ProxyRequest::Http(request), stream).await
    }

    /// Classify the request's destination and hand it to the chosen relay.
    async fn dispatch(&self, mut request: ProxyRequest, stream: ClientStream) -> Result<()> {
        let target = request.target().clone();
        let route = match &target {
            TargetAddr::Ip(addr) => self.resolver.classify_ip(&addr.ip().to_string()),
            TargetAddr::Domain(domain, _) => {
                let (route, redirect) = self
                    .resolver
                    .classify_domain(&normalize_domain(domain))
                    .await;
                if let Some(ip) = redirect {
                    request.set_redirect(ip);
                }
                route
            }
        };

        let outbound = match route {
            Route::Direct => Arc::clone(&self.direct),
            Route::Proxy => Arc::clone(&self.proxy),
        };
        info!(
            "{} {} -> {} ({})",
            request.kind(),
            request.target(),
            route,
            outbound.name()
        );
        request.execute(stream, outbound).await
    }
}

async fn read_port(stream: &mut ClientStream) -> Result<u16> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

async fn send_socks5_reply(stream: &mut ClientStream, code: u8) -> Result<()> {
    let reply = [
        SOCKS5_VERSION,
        code,
        0x00,
        SOCKS5_ADDR_IPV4,
        0,
        0,
        0,
        0, // bound address
        0,
        0, // bound port
    ];
    stream.write_all(&reply).await?;
    Ok(())
}

/// One accepted proxy request, SOCKS5 or HTTP.
enum ProxyRequest {
    Socks5(Socks5Request),
    Http(HttpRequest),
}

impl ProxyRequest {
    fn target(&self) -> &TargetAddr {
        match self {
            ProxyRequest::Socks5(req) => &req.target,
            ProxyRequest::Http(req) => &req.target,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ProxyRequest::Socks5(_) => "socks5",
            ProxyRequest::Http(req) => {
                if req.is_connect {
                    "http-connect"
                } else {
                    "http"
                }
            }
        }
    }

    /// Point the request at an already-resolved address.
    ///
    /// SOCKS5 targets are rewritten to the IP literal, keeping the port and
    /// taking the address family from the IP itself. HTTP requests keep
    /// their hostname: the head still names the host and cannot be
    /// rewritten, so the relay resolves it again.
    fn set_redirect(&mut self, ip: IpAddr) {
        match self {
            ProxyRequest::Socks5(req) => {
                let port = req.target.port();
                req.target = TargetAddr::Ip(SocketAddr::new(ip, port));
            }
            ProxyRequest::Http(_) => {}
        }
    }

    async fn execute(self, stream: ClientStream, outbound: Arc<dyn Outbound>) -> Result<()> {
        match self {
            ProxyRequest::Socks5(req) => req.execute(stream, outbound).await,
            ProxyRequest::Http(req) => req.execute(stream, outbound).await,
        }
    }
}

struct Socks5Request {
    target: TargetAddr,
}

impl Socks5Request {
    async fn execute(self, mut stream: ClientStream, outbound: Arc<dyn Outbound>) -> Result<()> {
        match outbound.dial(&self.target).await {
            Ok(mut upstream) => {
                send_socks5_reply(&mut stream, SOCKS5_REPLY_OK).await?;
                relay_bidirectional(&mut stream, &mut upstream).await
            }
            Err(e) => {
                send_socks5_reply(&mut stream, SOCKS5_REPLY_FAILURE).await.ok();
                Err(e)
            }
        }
    }
}

struct HttpRequest {
    is_connect: bool,
    target: TargetAddr,
    /// Rebuilt origin-form head forwarded upstream; empty for CONNECT.
    head: Vec<u8>,
}

impl HttpRequest {
    fn parse(head: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(head)
            .map_err(|_| Error::protocol("request head is not utf-8"))?;
        let mut lines = text.split("\r\n");

        let request_line = lines
            .next()
            .ok_or_else(|| Error::protocol("empty request"))?;
        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| Error::protocol("request line has no method"))?;
        let uri = parts
            .next()
            .ok_or_else(|| Error::protocol("request line has no target"))?;
        let version = parts.next().unwrap_or("HTTP/1.1");

        if method.eq_ignore_ascii_case("CONNECT") {
            let (host, port) = split_authority(uri, 443)?;
            return Ok(Self {
                is_connect: true,
                target: target_from(host, port),
                head: Vec::new(),
            });
        }

        let headers: Vec<&str> = lines.take_while(|line| !line.is_empty()).collect();

        let (host, port, origin) = if uri.starts_with("http://") || uri.starts_with("https://") {
            let url = Url::parse(uri)
                .map_err(|e| Error::protocol(format!("bad request target {uri:?}: {e}")))?;
            let host = url
                .host_str()
                .ok_or_else(|| Error::protocol(format!("request target has no host: {uri:?}")))?
                .to_string();
            let port = url.port_or_known_default().unwrap_or(80);
            let origin = match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            };
            (host, port, origin)
        } else {
            let host_header = headers
                .iter()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.trim()
                        .eq_ignore_ascii_case("host")
                        .then(|| value.trim().to_string())
                })
                .ok_or_else(|| Error::protocol("request without host"))?;
            let (host, port) = split_authority(&host_header, 80)?;
            (host, port, uri.to_string())
        };

        // rebuild an origin-form head, dropping the proxy hop headers
        let mut rebuilt = format!("{method} {origin} {version}\r\n").into_bytes();
        for line in &headers {
            let name = line.split(':').next().unwrap_or_default().trim();
            if name.eq_ignore_ascii_case("proxy-connection")
                || name.eq_ignore_ascii_case("proxy-authorization")
            {
                continue;
            }
            rebuilt.extend_from_slice(line.as_bytes());
            rebuilt.extend_from_slice(b"\r\n");
        }
        rebuilt.extend_from_slice(b"\r\n");

        Ok(Self {
            is_connect: false,
            target: target_from(host, port),
            head: rebuilt,
        })
    }

    async fn execute(self, mut stream: ClientStream, outbound: Arc<dyn Outbound>) -> Result<()> {
        match outbound.dial(&self.target).await {
            Ok(mut upstream) => {
                if self.is_connect {
                    stream
                        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                        .await?;
                } else {
                    upstream.write_all(&self.head).await?;
                }
                relay_bidirectional(&mut stream, &mut upstream).await
            }
            Err(e) => {
                stream
                    .write_all(b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n")
                    .await
                    .ok();
                Err(e)
            }
        }
    }
}

fn target_from(host: String, port: u16) -> TargetAddr {
    match host.parse::<IpAddr>() {
        Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
        Err(_) => TargetAddr::Domain(host, port),
    }
}

fn split_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    // bracketed IPv6 authority
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::protocol(format!("bad authority {authority:?}")))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port
                .parse()
                .map_err(|_| Error::protocol(format!("bad port in {authority:?}")))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| Error::protocol(format!("bad port in {authority:?}")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), default_port)),
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|window| window == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_connect_request() {
        let head = b"CONNECT blocked.example.net:443 HTTP/1.1\r\nHost: blocked.example.net:443\r\n\r\n";
        let req = HttpRequest::parse(head).unwrap();
        assert!(req.is_connect);
        assert!(matches!(
            &req.target,
            TargetAddr::Domain(domain, 443) if domain == "blocked.example.net"
        ));
    }

    #[test]
    fn parse_absolute_uri_request() {
        let head = b"GET http://www.example.com/index.html?q=1 HTTP/1.1\r\n\
                     Host: www.example.com\r\n\
                     Proxy-Connection: keep-alive\r\n\
                     User-Agent: test\r\n\r\n";
        let req = HttpRequest::parse(head).unwrap();
        assert!(!req.is_connect);
        assert!(matches!(
            &req.target,
            TargetAddr::Domain(domain, 80) if domain == "www.example.com"
        ));

        let rebuilt = String::from_utf8(req.head).unwrap();
        assert!(rebuilt.starts_with("GET /index.html?q=1 HTTP/1.1\r\n"));
        assert!(rebuilt.contains("User-Agent: test\r\n"));
        assert!(!rebuilt.to_ascii_lowercase().contains("proxy-connection"));
    }

    #[test]
    fn parse_origin_form_with_host_header() {
        let head = b"GET /path HTTP/1.1\r\nHost: origin.example:8080\r\n\r\n";
        let req = HttpRequest::parse(head).unwrap();
        assert!(matches!(
            &req.target,
            TargetAddr::Domain(domain, 8080) if domain == "origin.example"
        ));
    }

    #[test]
    fn parse_ip_literal_host() {
        let head = b"GET http://93.184.216.34/ HTTP/1.1\r\nHost: 93.184.216.34\r\n\r\n";
        let req = HttpRequest::parse(head).unwrap();
        assert!(matches!(req.target, TargetAddr::Ip(_)));
    }

    #[test]
    fn http_redirect_is_a_noop() {
        let head = b"GET http://www.example.com/ HTTP/1.1\r\nHost: www.example.com\r\n\r\n";
        let mut req = ProxyRequest::Http(HttpRequest::parse(head).unwrap());
        req.set_redirect("1.2.3.4".parse().unwrap());
        assert!(matches!(req.target(), TargetAddr::Domain(_, _)));
    }

    #[test]
    fn socks5_redirect_keeps_the_address_family() {
        let mut req = ProxyRequest::Socks5(Socks5Request {
            target: TargetAddr::Domain("v6.example".to_string(), 443),
        });
        req.set_redirect("2001:db8::1".parse().unwrap());
        match req.target() {
            TargetAddr::Ip(addr) => {
                assert!(addr.is_ipv6());
                assert_eq!(addr.port(), 443);
            }
            other => panic!("unexpected target {other}"),
        }
    }

    #[test]
    fn authority_splitting() {
        assert_eq!(
            split_authority("example.com:8443", 443).unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            split_authority("example.com", 443).unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            split_authority("[2001:db8::1]:443", 443).unwrap(),
            ("2001:db8::1".to_string(), 443)
        );
    }
}
