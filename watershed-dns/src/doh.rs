//! DNS over HTTPS client, Google JSON flavor
//!
//! Speaks `GET ${server}?name=&type=&edns_client_subnet=` and translates the
//! JSON payload back into a wire-format message. Connections are one-shot
//! (`Connection: close`) so a proxied dial never pins a TCP socket.

use crate::client::ProxyDialer;
use crate::error::{DnsError, Result};
use crate::message;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, NS, NULL, PTR, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rustls::pki_types::ServerName;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::trace;
use url::Url;

/// Response shape of the Google DNS-over-HTTPS JSON API.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct DohResponse {
    #[serde(rename = "Status", default)]
    pub status: u16,
    #[serde(rename = "TC", default)]
    pub tc: bool,
    #[serde(rename = "RD", default)]
    pub rd: bool,
    #[serde(rename = "RA", default)]
    pub ra: bool,
    #[serde(rename = "AD", default)]
    pub ad: bool,
    #[serde(rename = "CD", default)]
    pub cd: bool,
    #[serde(rename = "Question", default)]
    pub question: Vec<DohQuestion>,
    #[serde(rename = "Answer", default)]
    pub answer: Vec<DohRecord>,
    #[serde(rename = "Authority", default)]
    pub authority: Vec<DohRecord>,
    #[serde(rename = "Additional", default)]
    pub additional: Vec<DohRecord>,
    #[serde(rename = "edns_client_subnet", default)]
    pub edns_client_subnet: Option<String>,
    #[serde(rename = "Comment", default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DohQuestion {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub rtype: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DohRecord {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub rtype: u16,
    #[serde(rename = "TTL", default)]
    pub ttl: u32,
    #[serde(default)]
    pub data: String,
}

/// A parsed DoH endpoint.
#[derive(Debug, Clone)]
pub struct DohEndpoint {
    host: String,
    port: u16,
    path: String,
}

impl DohEndpoint {
    /// Parse a DoH endpoint URL, e.g. `https://dns.google/resolve`.
    pub fn parse(server: &str) -> Result<Self> {
        let url = Url::parse(server)
            .map_err(|e| DnsError::Config(format!("invalid DoH URL {server:?}: {e}")))?;
        if url.scheme() != "https" {
            return Err(DnsError::Config(format!(
                "DoH URL must use https: {server:?}"
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| DnsError::Config(format!("DoH URL has no host: {server:?}")))?
            .to_string();
        let path = match url.path() {
            "" | "/" => "/resolve".to_string(),
            path => path.to_string(),
        };
        Ok(Self {
            host,
            port: url.port().unwrap_or(443),
            path,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// TLS connector trusting the webpki root set.
pub fn tls_connector() -> TlsConnector {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

/// Perform one DoH round trip for `req`.
///
/// The query carries the request's name and type; when the request has an
/// EDNS client-subnet option its address is forwarded as
/// `edns_client_subnet`. The JSON response is translated back to a
/// wire-format message carrying the request id.
pub async fn exchange(
    endpoint: &DohEndpoint,
    tls: &TlsConnector,
    dialer: Option<&Arc<dyn ProxyDialer>>,
    req: &Message,
    deadline: Duration,
) -> Result<Message> {
    let question = req
        .queries()
        .first()
        .ok_or_else(|| DnsError::Protocol("request has no question".to_string()))?;
    let name = question.name().to_utf8();
    let qtype = u16::from(question.query_type());
    let ecs = message::ecs_addr(req);

    let mut target = format!("{}?name={}&type={}", endpoint.path, name, qtype);
    if let Some(addr) = ecs {
        target.push_str(&format!("&edns_client_subnet={addr}"));
    }

    let body = http_get(endpoint, tls, dialer, &target, deadline).await?;
    let doh: DohResponse = serde_json::from_slice(&body)
        .map_err(|e| DnsError::Http(format!("invalid DoH JSON: {e}")))?;

    let mut resp = message_from_response(req, &doh)?;
    if let Some(addr) = ecs {
        message::set_ecs(&mut resp, addr);
    }
    trace!("DoH {} type {} -> status {}", name, qtype, doh.status);
    Ok(resp)
}

/// One-shot HTTP/1.1 GET over TLS; returns the response body.
async fn http_get(
    endpoint: &DohEndpoint,
    tls: &TlsConnector,
    dialer: Option<&Arc<dyn ProxyDialer>>,
    target: &str,
    deadline: Duration,
) -> Result<Vec<u8>> {
    let addr = endpoint.addr();
    let tcp = match dialer {
        Some(dialer) => timeout(deadline, dialer.dial(&addr))
            .await
            .map_err(|_| DnsError::Timeout)??,
        None => timeout(deadline, TcpStream::connect(&addr))
            .await
            .map_err(|_| DnsError::Timeout)??,
    };

    let server_name = ServerName::try_from(endpoint.host.clone())
        .map_err(|e| DnsError::Tls(format!("invalid server name: {e}")))?;
    let mut stream = timeout(deadline, tls.connect(server_name, tcp))
        .await
        .map_err(|_| DnsError::Timeout)?
        .map_err(|e| DnsError::Tls(e.to_string()))?;

    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Accept: application/dns-json\r\n\
         Connection: close\r\n\
         \r\n",
        target, endpoint.host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    timeout(deadline, stream.read_to_end(&mut response))
        .await
        .map_err(|_| DnsError::Timeout)??;

    parse_http_response(&response)
}

fn parse_http_response(response: &[u8]) -> Result<Vec<u8>> {
    let header_end = find_header_end(response)
        .ok_or_else(|| DnsError::Http("truncated HTTP response".to_string()))?;
    let head = String::from_utf8_lossy(&response[..header_end]);

    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "200" {
        return Err(DnsError::Http(format!("DoH server returned {status_line}")));
    }

    let chunked = head.lines().any(|line| {
        let lower = line.to_ascii_lowercase();
        lower.starts_with("transfer-encoding:") && lower.contains("chunked")
    });

    let body = &response[header_end + 4..];
    if chunked {
        decode_chunked(body)
    } else {
        Ok(body.to_vec())
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|window| window == b"\r\n\r\n")
}

fn decode_chunked(mut body: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let line_end = find_crlf(body)
            .ok_or_else(|| DnsError::Http("truncated chunked body".to_string()))?;
        let size_str = String::from_utf8_lossy(&body[..line_end]);
        let size = usize::from_str_radix(size_str.trim().trim_end_matches(';'), 16)
            .map_err(|_| DnsError::Http(format!("bad chunk size {size_str:?}")))?;
        body = &body[line_end + 2..];
        if size == 0 {
            return Ok(out);
        }
        if body.len() < size + 2 {
            return Err(DnsError::Http("truncated chunk".to_string()));
        }
        out.extend_from_slice(&body[..size]);
        body = &body[size + 2..];
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|window| window == b"\r\n")
}

/// Translate a Google JSON response into a wire-format message for `req`.
pub fn message_from_response(req: &Message, doh: &DohResponse) -> Result<Message> {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_response_code(rcode_from_status(doh.status));
    msg.set_truncated(doh.tc);
    msg.set_recursion_desired(doh.rd);
    msg.set_recursion_available(doh.ra);
    msg.set_authentic_data(doh.ad);
    msg.set_checking_disabled(doh.cd);

    for question in &doh.question {
        let name = Name::from_ascii(&question.name)
            .map_err(|e| DnsError::Name(format!("bad question name {:?}: {e}", question.name)))?;
        msg.add_query(Query::query(name, RecordType::from(question.rtype)));
    }
    for rr in &doh.answer {
        msg.add_answer(record_from_doh(rr)?);
    }
    for rr in &doh.authority {
        msg.add_name_server(record_from_doh(rr)?);
    }
    for rr in &doh.additional {
        msg.add_additional(record_from_doh(rr)?);
    }
    Ok(msg)
}

fn rcode_from_status(status: u16) -> ResponseCode {
    match status {
        0 => ResponseCode::NoError,
        1 => ResponseCode::FormErr,
        2 => ResponseCode::ServFail,
        3 => ResponseCode::NXDomain,
        4 => ResponseCode::NotImp,
        5 => ResponseCode::Refused,
        _ => ResponseCode::ServFail,
    }
}

/// Rebuild one wire record from a JSON RR.
///
/// Types without a structured constructor here are carried as opaque NULL
/// records holding the textual data bytes.
fn record_from_doh(rr: &DohRecord) -> Result<Record> {
    let name = Name::from_ascii(&rr.name)
        .map_err(|e| DnsError::Name(format!("bad record name {:?}: {e}", rr.name)))?;
    let rtype = RecordType::from(rr.rtype);

    let rdata = match rtype {
        RecordType::A => RData::A(A(rr
            .data
            .parse()
            .map_err(|_| DnsError::Protocol(format!("bad A data {:?}", rr.data)))?)),
        RecordType::AAAA => RData::AAAA(AAAA(rr
            .data
            .parse()
            .map_err(|_| DnsError::Protocol(format!("bad AAAA data {:?}", rr.data)))?)),
        RecordType::CNAME => RData::CNAME(CNAME(parse_name(&rr.data)?)),
        RecordType::NS => RData::NS(NS(parse_name(&rr.data)?)),
        RecordType::PTR => RData::PTR(PTR(parse_name(&rr.data)?)),
        RecordType::TXT => RData::TXT(TXT::new(vec![rr.data.clone()])),
        _ => RData::NULL(NULL::with(rr.data.as_bytes().to_vec())),
    };
    Ok(Record::from_rdata(name, rr.ttl, rdata))
}

fn parse_name(data: &str) -> Result<Name> {
    Name::from_ascii(data).map_err(|e| DnsError::Name(format!("bad name data {data:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::MessageType;
    use std::str::FromStr;

    fn request(name: &str, rtype: RecordType) -> Message {
        let mut req = Message::new();
        req.set_id(0x4242);
        req.set_message_type(MessageType::Query);
        req.set_op_code(OpCode::Query);
        req.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
        req
    }

    const FIXTURE_A: &str = r#"{
        "Status": 0,
        "TC": false,
        "RD": true,
        "RA": true,
        "AD": false,
        "CD": false,
        "Question": [{"name": "example.net.", "type": 1}],
        "Answer": [
            {"name": "example.net.", "type": 5, "TTL": 300, "data": "edge.example.net."},
            {"name": "edge.example.net.", "type": 1, "TTL": 60, "data": "93.184.216.34"}
        ],
        "edns_client_subnet": "8.8.8.8/32"
    }"#;

    #[test]
    fn translation_round_trips_header_and_answers() {
        let req = request("example.net.", RecordType::A);
        let doh: DohResponse = serde_json::from_str(FIXTURE_A).unwrap();
        let msg = message_from_response(&req, &doh).unwrap();

        assert_eq!(msg.id(), 0x4242);
        assert_eq!(msg.response_code(), ResponseCode::NoError);
        assert!(msg.recursion_desired());
        assert!(msg.recursion_available());
        assert!(!msg.truncated());
        assert!(!msg.authentic_data());
        assert!(!msg.checking_disabled());
        assert_eq!(msg.queries().len(), 1);
        assert_eq!(msg.answers().len(), 2);

        // survives a wire round trip
        let bytes = msg.to_vec().unwrap();
        let reparsed = Message::from_vec(&bytes).unwrap();
        assert_eq!(reparsed.response_code(), msg.response_code());
        assert_eq!(reparsed.answers().len(), 2);
        let (_, ip) = crate::message::extract_answer(&reparsed).unwrap();
        assert_eq!(ip, "93.184.216.34".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn translation_carries_nxdomain_and_authority() {
        let fixture = r#"{
            "Status": 3,
            "RD": true,
            "RA": true,
            "Question": [{"name": "nope.example.", "type": 28}],
            "Authority": [
                {"name": "example.", "type": 6, "TTL": 900,
                 "data": "ns.example. root.example. 1 7200 900 1209600 86400"}
            ]
        }"#;
        let req = request("nope.example.", RecordType::AAAA);
        let doh: DohResponse = serde_json::from_str(fixture).unwrap();
        let msg = message_from_response(&req, &doh).unwrap();

        assert_eq!(msg.response_code(), ResponseCode::NXDomain);
        assert_eq!(msg.name_servers().len(), 1);
        assert!(msg.answers().is_empty());
    }

    #[test]
    fn aaaa_answer_translates() {
        let fixture = r#"{
            "Status": 0,
            "Question": [{"name": "v6.example.", "type": 28}],
            "Answer": [{"name": "v6.example.", "type": 28, "TTL": 120,
                        "data": "2606:2800:220:1:248:1893:25c8:1946"}]
        }"#;
        let req = request("v6.example.", RecordType::AAAA);
        let doh: DohResponse = serde_json::from_str(fixture).unwrap();
        let msg = message_from_response(&req, &doh).unwrap();

        let (_, ip) = crate::message::extract_answer(&msg).unwrap();
        assert_eq!(
            ip,
            "2606:2800:220:1:248:1893:25c8:1946".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn unknown_type_falls_back_to_opaque_record() {
        let rr = DohRecord {
            name: "example.com.".to_string(),
            rtype: 99,
            ttl: 60,
            data: "some opaque payload".to_string(),
        };
        let record = record_from_doh(&rr).unwrap();
        assert!(matches!(record.data(), RData::NULL(_)));
    }

    #[test]
    fn endpoint_parsing() {
        let ep = DohEndpoint::parse("https://dns.google/resolve").unwrap();
        assert_eq!(ep.host(), "dns.google");
        assert_eq!(ep.addr(), "dns.google:443");

        let ep = DohEndpoint::parse("https://doh.example:8443").unwrap();
        assert_eq!(ep.addr(), "doh.example:8443");
        assert_eq!(ep.path, "/resolve");

        assert!(DohEndpoint::parse("http://dns.google/resolve").is_err());
    }

    #[test]
    fn chunked_body_decodes() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\n{\"St\r\n9\r\natus\": 0}\r\n0\r\n\r\n";
        let body = parse_http_response(raw).unwrap();
        assert_eq!(body, b"{\"Status\": 0}");
    }

    #[test]
    fn non_200_is_an_error() {
        let raw = b"HTTP/1.1 429 Too Many Requests\r\n\r\n";
        assert!(parse_http_response(raw).is_err());
    }
}
