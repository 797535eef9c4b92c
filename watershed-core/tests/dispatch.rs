//! Dispatcher scenarios: one stub target and one stub SOCKS5 egress stand
//! in for the real network.

use ipnet::Ipv4Net;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use watershed_core::outbound::{DirectOutbound, Outbound, Socks5Outbound};
use watershed_core::MixedInbound;
use watershed_dns::{DnsClient, DomainMatcher, DomesticIp, Protocol, Resolver, Route};

fn build_resolver(gfw: &[&str], cidrs: &[&str]) -> Arc<Resolver> {
    let matcher = DomainMatcher::new(
        gfw.iter().map(|s| s.to_string()).collect(),
        Vec::new(),
    );
    let domestic = DomesticIp::new(
        cidrs
            .iter()
            .map(|c| c.parse::<Ipv4Net>().unwrap())
            .collect(),
    );
    // upstreams point at a dead port; these scenarios must never resolve
    let dead = || {
        Arc::new(
            DnsClient::new("127.0.0.1:1", Protocol::Udp, None)
                .unwrap()
                .with_timeout(Duration::from_millis(100)),
        )
    };
    Arc::new(Resolver::new(
        matcher,
        domestic,
        "114.114.114.114".parse().unwrap(),
        "8.8.8.8".parse().unwrap(),
        dead(),
        dead(),
        Duration::from_secs(300),
    ))
}

async fn spawn_front(
    resolver: Arc<Resolver>,
    proxy: Arc<dyn Outbound>,
) -> SocketAddr {
    let mixed = Arc::new(
        MixedInbound::bind(
            "127.0.0.1:0",
            resolver,
            Arc::new(DirectOutbound),
            proxy,
        )
        .await
        .unwrap(),
    );
    let addr = mixed.local_addr().unwrap();
    tokio::spawn(mixed.run());
    addr
}

/// One-shot echo server: reads 4 bytes, answers `pong`, closes.
async fn spawn_echo_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        stream.write_all(b"pong").await.unwrap();
    });
    addr
}

#[tokio::test]
async fn s5_socks5_connect_to_domestic_ip_goes_direct() {
    let target = spawn_echo_target().await;
    let resolver = build_resolver(&[], &["127.0.0.0/8"]);
    // the PROXY outbound points nowhere; a wrong route would fail loudly
    let front = spawn_front(
        Arc::clone(&resolver),
        Arc::new(Socks5Outbound::new("127.0.0.1:1")),
    )
    .await;

    let mut client = TcpStream::connect(front).await.unwrap();

    // method selection
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    // CONNECT 127.0.0.1:<target>
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&target.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00, "connect must succeed");

    client.write_all(b"ping").await.unwrap();
    let mut answer = [0u8; 4];
    client.read_exact(&mut answer).await.unwrap();
    assert_eq!(&answer, b"pong");

    assert_eq!(resolver.ip_cache().get("127.0.0.1"), Some(Route::Direct));
}

/// Minimal SOCKS5 egress: no-auth, one CONNECT, answers any HTTP request
/// with a fixed 200.
async fn spawn_socks5_egress() -> (SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await.unwrap();
        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).await.unwrap();
        stream.write_all(&[0x05, 0x00]).await.unwrap();

        let mut request = [0u8; 4];
        stream.read_exact(&mut request).await.unwrap();
        assert_eq!(request[3], 0x03, "proxy-routed domains stay unresolved");
        let mut len = [0u8; 1];
        stream.read_exact(&mut len).await.unwrap();
        let mut domain = vec![0u8; len[0] as usize];
        stream.read_exact(&mut domain).await.unwrap();
        let mut port = [0u8; 2];
        stream.read_exact(&mut port).await.unwrap();
        let _ = tx.send(String::from_utf8(domain).unwrap());

        stream
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        // swallow the forwarded request head, answer, close
        let mut buf = vec![0u8; 4096];
        let mut seen = Vec::new();
        while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&buf[..n]);
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
            .await
            .unwrap();
    });
    (addr, rx)
}

#[tokio::test]
async fn s6_http_request_for_blacklisted_domain_goes_proxy_unresolved() {
    let (egress, seen_domain) = spawn_socks5_egress().await;
    let resolver = build_resolver(&["example.net"], &["1.0.0.0/8"]);
    let front = spawn_front(
        Arc::clone(&resolver),
        Arc::new(Socks5Outbound::new(egress.to_string())),
    )
    .await;

    let mut client = TcpStream::connect(front).await.unwrap();
    client
        .write_all(
            b"GET http://blocked.example.net/ HTTP/1.1\r\n\
              Host: blocked.example.net\r\n\
              Connection: close\r\n\r\n",
        )
        .await
        .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("ok"));

    // the proxy got the hostname, not an address
    assert_eq!(seen_domain.await.unwrap(), "blocked.example.net");
    // no DNS was performed and nothing was cached
    assert!(resolver.ip_cache().is_empty());
    assert!(resolver.domain_cache().is_empty());
}

#[tokio::test]
async fn http_connect_tunnels_through_the_chosen_route() {
    let target = spawn_echo_target().await;
    let resolver = build_resolver(&[], &["127.0.0.0/8"]);
    let front = spawn_front(
        Arc::clone(&resolver),
        Arc::new(Socks5Outbound::new("127.0.0.1:1")),
    )
    .await;

    let mut client = TcpStream::connect(front).await.unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", target.port()).as_bytes())
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        client.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    assert!(String::from_utf8_lossy(&head).starts_with("HTTP/1.1 200"));

    client.write_all(b"ping").await.unwrap();
    let mut answer = [0u8; 4];
    client.read_exact(&mut answer).await.unwrap();
    assert_eq!(&answer, b"pong");
}
