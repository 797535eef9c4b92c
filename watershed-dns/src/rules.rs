//! Static rule sets: domain suffix lists and the domestic CIDR predicate
//!
//! Two domain lists drive classification: the blacklist ("must go via
//! proxy") and the whitelist ("known domestic"). Both use suffix semantics:
//! a rule matches a domain when they are equal or the domain ends in
//! `"." + rule`. The CIDR set answers whether an IPv4 address is domestic;
//! IPv6 is never domestic.

use crate::error::{DnsError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ipnet::Ipv4Net;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

/// Suffix matcher over the blacklist and whitelist.
pub struct DomainMatcher {
    gfw: Vec<String>,
    obedient: Vec<String>,
}

impl DomainMatcher {
    pub fn new(gfw: Vec<String>, obedient: Vec<String>) -> Self {
        Self {
            gfw: normalize_rules(gfw),
            obedient: normalize_rules(obedient),
        }
    }

    /// True when the domain is on the blacklist.
    pub fn match_gfw(&self, domain: &str) -> bool {
        match_list(domain, &self.gfw)
    }

    /// True when the domain is on the whitelist.
    pub fn match_obedient(&self, domain: &str) -> bool {
        match_list(domain, &self.obedient)
    }

    pub fn gfw_len(&self) -> usize {
        self.gfw.len()
    }

    pub fn obedient_len(&self) -> usize {
        self.obedient.len()
    }
}

fn normalize_rules(rules: Vec<String>) -> Vec<String> {
    rules
        .into_iter()
        .map(|rule| rule.trim().to_ascii_lowercase())
        .filter(|rule| !rule.is_empty())
        .collect()
}

fn match_list(domain: &str, rules: &[String]) -> bool {
    rules.iter().any(|rule| {
        domain == rule
            || domain
                .strip_suffix(rule.as_str())
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}

/// Membership predicate over the national IPv4 CIDR set.
pub struct DomesticIp {
    networks: Vec<Ipv4Net>,
}

impl DomesticIp {
    pub fn new(networks: Vec<Ipv4Net>) -> Self {
        Self { networks }
    }

    /// True when `ip` is IPv4 and contained in any configured network.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.networks.iter().any(|net| net.contains(&v4)),
            IpAddr::V6(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

/// Load a newline-separated domain suffix list.
pub fn load_domain_list(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| DnsError::RuleList(format!("read {}: {e}", path.display())))?;
    let list: Vec<String> = content
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect();
    if list.is_empty() {
        return Err(DnsError::RuleList(format!(
            "empty domain list: {}",
            path.display()
        )));
    }
    Ok(list)
}

/// Load a one-CIDR-per-line network list.
pub fn load_cidr_list(path: impl AsRef<Path>) -> Result<Vec<Ipv4Net>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| DnsError::RuleList(format!("read {}: {e}", path.display())))?;

    let mut networks = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let net = line
            .parse::<Ipv4Net>()
            .map_err(|e| DnsError::RuleList(format!("bad CIDR {line:?}: {e}")))?;
        networks.push(net);
    }
    if networks.is_empty() {
        return Err(DnsError::RuleList(format!(
            "empty network list: {}",
            path.display()
        )));
    }
    Ok(networks)
}

static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:[A-Za-z0-9](?:[A-Za-z0-9_-]*[A-Za-z0-9])?\.)+(?:xn--[a-z0-9-]+|[A-Za-z]{2,})")
        .expect("domain pattern")
});

static DNSMASQ_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^server=/(.+?)/.+$").expect("dnsmasq pattern"));

/// Extract domain suffixes from a raw base64-encoded gfwlist filter file.
///
/// Only the section before the whitelist marker is scanned; every embedded
/// domain is collected once, in first-seen order.
pub fn extract_gfwlist(raw: &str) -> Result<Vec<String>> {
    let packed: String = raw.split_whitespace().collect();
    let decoded = STANDARD
        .decode(packed)
        .map_err(|e| DnsError::RuleList(format!("gfwlist base64: {e}")))?;
    let content = String::from_utf8_lossy(&decoded);

    let scanned = match content.find("Whitelist Start") {
        Some(end) => &content[..end],
        None => &content[..],
    };

    let mut seen = HashSet::new();
    let mut domains = Vec::new();
    for found in DOMAIN_RE.find_iter(scanned) {
        let domain = found.as_str().to_ascii_lowercase();
        if seen.insert(domain.clone()) {
            domains.push(domain);
        }
    }
    if domains.is_empty() {
        return Err(DnsError::RuleList("gfwlist yielded no domains".to_string()));
    }
    Ok(domains)
}

/// Extract domain suffixes from a dnsmasq-style `server=/domain/ns` list.
pub fn extract_dnsmasq_list(content: &str) -> Vec<String> {
    DNSMASQ_RE
        .captures_iter(content)
        .map(|captures| captures[1].to_ascii_lowercase())
        .collect()
}
