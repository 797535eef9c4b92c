//! TOML configuration surface
//!
//! The recognized options mirror the original deployment's `config.toml`:
//! three rule-list paths, the DNS section with its two upstreams, and the
//! proxy section with the outbound transport.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Blacklist domains file, newline-separated suffixes.
    pub gfw_list: String,
    /// Whitelist domains file, same format.
    pub china_list: String,
    /// Domestic CIDR set file, one CIDR per line.
    pub china_ip_list: String,
    pub dns: DnsSection,
    pub proxy: ProxySection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gfw_list: "gfw_domain_list.txt".to_string(),
            china_list: "china_domain_list.txt".to_string(),
            china_ip_list: "china_ip_list.txt".to_string(),
            dns: DnsSection::default(),
            proxy: ProxySection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DnsSection {
    /// Listen address for the DNS server, e.g. `:53` or `127.0.0.1:5353`.
    pub listen: String,
    pub obedient: ObedientSection,
    pub abroad: AbroadSection,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            listen: ":53".to_string(),
            obedient: ObedientSection::default(),
            abroad: AbroadSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObedientSection {
    /// `host:port` of the domestic upstream.
    pub nameserver: String,
    /// `udp` or `tcp`.
    pub net: String,
}

impl Default for ObedientSection {
    fn default() -> Self {
        Self {
            nameserver: "114.114.114.114:53".to_string(),
            net: "udp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AbroadSection {
    /// When true the abroad upstream speaks Google JSON DoH GET.
    pub enable_dns_over_https: bool,
    /// `host:port`, or a DoH URL when DoH is enabled.
    pub nameserver: String,
    /// Proxy URI used to dial the abroad upstream; empty means direct.
    pub proxy: String,
}

impl Default for AbroadSection {
    fn default() -> Self {
        Self {
            enable_dns_over_https: true,
            nameserver: "https://dns.google/resolve".to_string(),
            proxy: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxySection {
    /// Listen address for the mixed SOCKS5/HTTP front.
    pub listen: String,
    /// Outbound PROXY transport URI, e.g. `socks5://127.0.0.1:1080`.
    pub proxy_server: String,
    /// Overrides the proxy-side ECS sentinel with the egress address.
    pub proxy_server_external_ip: String,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            listen: ":1080".to_string(),
            proxy_server: String::new(),
            proxy_server_external_ip: String::new(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("read {}: {e}", path.display())))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(e.to_string()))
    }
}

/// Parse a listen address, allowing the bare-port `:53` shorthand.
pub fn parse_listen(listen: &str) -> Result<SocketAddr> {
    let padded;
    let addr = if listen.starts_with(':') {
        padded = format!("0.0.0.0{listen}");
        padded.as_str()
    } else {
        listen
    };
    addr.parse()
        .map_err(|e| Error::config(format!("invalid listen address {listen:?}: {e}")))
}

/// Supported outbound proxy schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Socks5,
    Http,
}

/// A parsed proxy transport URI.
#[derive(Debug, Clone)]
pub struct ProxyUri {
    pub scheme: ProxyScheme,
    /// `host:port` of the proxy server.
    pub addr: String,
}

impl ProxyUri {
    /// Parse `socks5://host:port` or `http://host:port`. The port is
    /// required.
    pub fn parse(uri: &str) -> Result<Self> {
        let url =
            Url::parse(uri).map_err(|e| Error::config(format!("invalid proxy URI {uri:?}: {e}")))?;
        let scheme = match url.scheme() {
            "socks5" => ProxyScheme::Socks5,
            "http" => ProxyScheme::Http,
            other => {
                return Err(Error::config(format!(
                    "unsupported proxy scheme {other:?} in {uri:?}"
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::config(format!("proxy URI has no host: {uri:?}")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::config(format!("proxy URI has no port: {uri:?}")))?;
        Ok(Self {
            scheme,
            addr: format!("{host}:{port}"),
        })
    }

    /// Parse an optional URI; empty input means no proxy.
    pub fn parse_opt(uri: &str) -> Result<Option<Self>> {
        if uri.trim().is_empty() {
            Ok(None)
        } else {
            Self::parse(uri).map(Some)
        }
    }
}
