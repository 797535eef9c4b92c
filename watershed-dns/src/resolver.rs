//! Route classification engine
//!
//! One `Resolver` value holds everything both fronts share: the caches, the
//! rule matchers, the domestic predicate, the two ECS sentinel addresses
//! and the two upstream clients. It is built once at bootstrap and handed
//! to the DNS server and the proxy dispatcher behind an `Arc`; after
//! construction everything except the caches is read-only.

use crate::cache::{DomainCache, IpCache};
use crate::client::DnsClient;
use crate::error::{DnsError, Result};
use crate::message;
use crate::rules::{DomainMatcher, DomesticIp};
use crate::Route;

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RecordType;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Everything the classification engine needs, built once at bootstrap.
pub struct Resolver {
    domain_cache: DomainCache,
    ip_cache: IpCache,
    matcher: DomainMatcher,
    domestic: DomesticIp,
    /// Domestic ECS anchor: makes upstreams answer as if the client were at
    /// home.
    local_ip: IpAddr,
    /// Proxy-egress ECS anchor: makes upstreams answer for the proxy's
    /// vantage point.
    proxy_ip: IpAddr,
    obedient: Arc<DnsClient>,
    abroad: Arc<DnsClient>,
}

impl Resolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        matcher: DomainMatcher,
        domestic: DomesticIp,
        local_ip: IpAddr,
        proxy_ip: IpAddr,
        obedient: Arc<DnsClient>,
        abroad: Arc<DnsClient>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            domain_cache: DomainCache::new(cache_ttl),
            ip_cache: IpCache::new(cache_ttl),
            matcher,
            domestic,
            local_ip,
            proxy_ip,
            obedient,
            abroad,
        }
    }

    pub fn domain_cache(&self) -> &DomainCache {
        &self.domain_cache
    }

    pub fn ip_cache(&self) -> &IpCache {
        &self.ip_cache
    }

    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    pub fn proxy_ip(&self) -> IpAddr {
        self.proxy_ip
    }

    /// Spawn the periodic cache sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let resolver = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                resolver.domain_cache.sweep();
                resolver.ip_cache.sweep();
            }
        });
    }

    /// Answer one client DNS query.
    ///
    /// This is the DNS front's per-query state machine. An error means no
    /// reply is written; the client times out instead of seeing SERVFAIL.
    pub async fn answer_query(&self, req: &Message) -> Result<Message> {
        let question = req
            .queries()
            .first()
            .ok_or_else(|| DnsError::Protocol("query has no question".to_string()))?
            .clone();

        // hide local hostnames from upstream resolvers
        if message::is_dhcp_host(question.name()) {
            return Ok(message::reply_from_request(req, Vec::new()));
        }

        let domain = normalize_domain(&question.name().to_utf8());

        if let Some(entry) = self.domain_cache.get(&domain) {
            trace!("dns {}: cache hit ({})", domain, entry.route);
            return Ok(message::reply_from_request(req, vec![entry.answer]));
        }

        if self.matcher.match_gfw(&domain) {
            return self.answer_gfw(req, &domain).await;
        }
        if self.matcher.match_obedient(&domain) {
            return self.answer_obedient(req, &domain).await;
        }
        self.answer_unknown(req, &domain).await
    }

    /// Blacklisted domain: resolve from the proxy's vantage point.
    async fn answer_gfw(&self, req: &Message, domain: &str) -> Result<Message> {
        let mut probe = req.clone();
        message::set_ecs(&mut probe, self.proxy_ip);
        let resp = self.abroad.race(&probe).await?;
        if let Some((answer, ip)) = message::extract_answer(&resp) {
            self.domain_cache.add(domain, &answer, Route::Proxy);
            self.ip_cache.add(&ip.to_string(), Route::Proxy);
        }
        debug!("dns {}: blacklisted -> proxy", domain);
        Ok(resp)
    }

    /// Whitelisted domain: the domestic upstream answers; the abroad
    /// upstream with a domestic hint is the uncached fallback.
    async fn answer_obedient(&self, req: &Message, domain: &str) -> Result<Message> {
        if let Ok(resp) = self.obedient.race(req).await {
            if let Some((answer, ip)) = message::extract_answer(&resp) {
                self.domain_cache.add(domain, &answer, Route::Direct);
                self.ip_cache.add(&ip.to_string(), Route::Direct);
                debug!("dns {}: whitelisted -> direct", domain);
                return Ok(resp);
            }
        }

        let mut probe = req.clone();
        message::set_ecs(&mut probe, self.local_ip);
        let resp = self.abroad.race(&probe).await?;
        debug!("dns {}: whitelisted, domestic upstream failed, abroad fallback", domain);
        Ok(resp)
    }

    /// Unknown domain: two abroad probes decide the route.
    ///
    /// Probe B (domestic hint) is the decisive one: an upstream that hands a
    /// domestic address to a domestic client marks the domain reachable
    /// directly. Probe A (proxy hint) runs concurrently as a latency
    /// pre-warm and is consumed only when B forces the proxy route.
    async fn answer_unknown(&self, req: &Message, domain: &str) -> Result<Message> {
        let probe_a = {
            let mut req_a = req.clone();
            message::set_ecs(&mut req_a, self.proxy_ip);
            let abroad = Arc::clone(&self.abroad);
            tokio::spawn(async move { abroad.race(&req_a).await.ok() })
        };

        let mut req_b = req.clone();
        message::set_ecs(&mut req_b, self.local_ip);
        let probe_b = self.abroad.race(&req_b).await;

        let decided = probe_b.ok().and_then(|resp| {
            if resp.response_code() != ResponseCode::NoError {
                return None;
            }
            message::extract_answer(&resp).map(|(answer, ip)| (resp, answer, ip))
        });

        let Some((mut resp, mut answer, mut ip)) = decided else {
            // B failed outright: the domestic upstream is the last word
            let resp = self.obedient.race(req).await?;
            if let Some((answer, ip)) = message::extract_answer(&resp) {
                let route = self.route_for(ip);
                self.domain_cache.add(domain, &answer, route);
                self.ip_cache.add(&ip.to_string(), route);
                debug!("dns {}: abroad probe failed, domestic says {} -> {}", domain, ip, route);
            }
            return Ok(resp);
        };

        let route;
        if self.domestic.contains(ip) {
            route = Route::Direct;
            // re-query the domestic upstream to improve the answer quality
            if let Ok(better) = self.obedient.race(req).await {
                if let Some((better_answer, better_ip)) = message::extract_answer(&better) {
                    resp = better;
                    answer = better_answer;
                    ip = better_ip;
                }
            }
        } else {
            route = Route::Proxy;
            // adopt the pre-warmed proxy-vantage answer when it arrived
            if let Ok(Some(abroad_resp)) = probe_a.await {
                if let Some((abroad_answer, abroad_ip)) = message::extract_answer(&abroad_resp) {
                    resp = abroad_resp;
                    answer = abroad_answer;
                    ip = abroad_ip;
                }
            }
        }

        self.domain_cache.add(domain, &answer, route);
        self.ip_cache.add(&ip.to_string(), route);
        debug!("dns {}: {} -> {}", domain, ip, route);
        Ok(resp)
    }

    /// Classify an IP literal for the proxy front.
    pub fn classify_ip(&self, host: &str) -> Route {
        if let Some(route) = self.ip_cache.get(host) {
            return route;
        }
        let route = match host.parse::<IpAddr>() {
            Ok(ip) if self.domestic.contains(ip) => Route::Direct,
            _ => Route::Proxy,
        };
        self.ip_cache.add(host, route);
        route
    }

    /// Classify a domain for the proxy front.
    ///
    /// Returns the route plus the address the connection should be
    /// redirected to, when one is known. Proxy-routed domains are never
    /// redirected; the proxy resolves the name at its egress. This path
    /// never fails: when every lookup dies the connection defaults to the
    /// proxy, which gets another chance to resolve it.
    pub async fn classify_domain(&self, domain: &str) -> (Route, Option<IpAddr>) {
        if let Some(entry) = self.domain_cache.get(domain) {
            let redirect = match entry.route {
                Route::Direct => message::record_addr(&entry.answer),
                Route::Proxy => None,
            };
            trace!("proxy {}: cache hit ({})", domain, entry.route);
            return (entry.route, redirect);
        }

        if self.matcher.match_gfw(domain) {
            debug!("proxy {}: blacklisted -> proxy, unresolved", domain);
            return (Route::Proxy, None);
        }

        if self.matcher.match_obedient(domain) {
            if let Ok(resp) = self.obedient.query(domain, RecordType::A, None).await {
                if let Some((answer, ip)) = message::extract_answer(&resp) {
                    self.ip_cache.add(&ip.to_string(), Route::Direct);
                    self.domain_cache.add(domain, &answer, Route::Direct);
                    return (Route::Direct, Some(ip));
                }
            }
            // still reached directly; the relay dials the name itself
            return (Route::Direct, None);
        }

        // unknown domain: one abroad probe with the domestic hint
        if let Ok(resp) = self
            .abroad
            .query(domain, RecordType::A, Some(self.local_ip))
            .await
        {
            if let Some((answer, ip)) = message::extract_answer(&resp) {
                return self.classify_probed(domain, answer, ip).await;
            }
        }

        // abroad probe failed: domestic upstream decides, else default proxy
        if let Ok(resp) = self.obedient.query(domain, RecordType::A, None).await {
            if let Some((answer, ip)) = message::extract_answer(&resp) {
                let route = self.route_for(ip);
                self.ip_cache.add(&ip.to_string(), route);
                self.domain_cache.add(domain, &answer, route);
                let redirect = (route == Route::Direct).then_some(ip);
                return (route, redirect);
            }
        }
        debug!("proxy {}: all lookups failed -> proxy", domain);
        (Route::Proxy, None)
    }

    async fn classify_probed(
        &self,
        domain: &str,
        mut answer: hickory_proto::rr::Record,
        mut ip: IpAddr,
    ) -> (Route, Option<IpAddr>) {
        if self.domestic.contains(ip) {
            // re-query the domestic upstream to improve the address quality
            if let Ok(better) = self.obedient.query(domain, RecordType::A, None).await {
                if let Some((better_answer, better_ip)) = message::extract_answer(&better) {
                    answer = better_answer;
                    ip = better_ip;
                }
            }
            self.domain_cache.add(domain, &answer, Route::Direct);
            self.ip_cache.add(&ip.to_string(), Route::Direct);
            (Route::Direct, Some(ip))
        } else {
            self.domain_cache.add(domain, &answer, Route::Proxy);
            self.ip_cache.add(&ip.to_string(), Route::Proxy);
            (Route::Proxy, None)
        }
    }

    fn route_for(&self, ip: IpAddr) -> Route {
        if self.domestic.contains(ip) {
            Route::Direct
        } else {
            Route::Proxy
        }
    }
}

/// Lowercased domain without the trailing dot, the cache and matcher key.
pub fn normalize_domain(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_normalization() {
        assert_eq!(normalize_domain("Example.COM."), "example.com");
        assert_eq!(normalize_domain("example.com"), "example.com");
        assert_eq!(normalize_domain("."), "");
    }
}
