//! Watershed - split-horizon DNS resolver and transparent proxy dispatcher
//!
//! Loads the configuration and rule lists, builds the shared classification
//! engine and runs both fronts until the first of them dies.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;
use watershed_core::config::parse_listen;
use watershed_core::outbound::{DirectOutbound, HttpOutbound, Outbound, Socks5Outbound};
use watershed_core::{Config, MixedInbound, ProxyScheme, ProxyUri};
use watershed_dns::cache::{DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL};
use watershed_dns::client::ProxyDialer;
use watershed_dns::{
    rules, DnsClient, DnsServer, DomainMatcher, DomesticIp, Protocol, Resolver,
};

/// Domestic ECS anchor used when hinting upstreams toward local answers.
const DEFAULT_LOCAL_IP: &str = "114.114.114.114";

/// Fallback foreign ECS anchor when no proxy egress address is configured.
const DEFAULT_PROXY_IP: &str = "8.8.8.8";

#[derive(Parser, Debug)]
#[command(name = "watershed")]
#[command(about = "Split-horizon DNS resolver and transparent proxy dispatcher", version)]
struct Args {
    /// Path of the config file
    #[arg(short, long, default_value = "./config.toml")]
    config: String,

    /// Validate the configuration and rule lists, then exit
    #[arg(long)]
    test_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    watershed_core::logging::init();

    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config))?;

    let gfw = rules::load_domain_list(&config.gfw_list).context("loading gfw_list")?;
    let obedient_domains =
        rules::load_domain_list(&config.china_list).context("loading china_list")?;
    let networks = rules::load_cidr_list(&config.china_ip_list).context("loading china_ip_list")?;
    info!(
        "rules loaded: {} blacklisted, {} whitelisted, {} networks",
        gfw.len(),
        obedient_domains.len(),
        networks.len()
    );

    if args.test_config {
        println!("configuration OK");
        return Ok(());
    }

    let matcher = DomainMatcher::new(gfw, obedient_domains);
    let domestic = DomesticIp::new(networks);

    let local_ip: IpAddr = DEFAULT_LOCAL_IP.parse().expect("constant address");
    let proxy_ip: IpAddr = match config.proxy.proxy_server_external_ip.trim() {
        "" => DEFAULT_PROXY_IP.parse().expect("constant address"),
        configured => configured
            .parse()
            .context("invalid [proxy] proxy_server_external_ip")?,
    };

    // domestic upstream is always dialed directly
    let obedient_protocol = match config.dns.obedient.net.as_str() {
        "udp" => Protocol::Udp,
        "tcp" => Protocol::Tcp,
        other => bail!("invalid [dns.obedient] net {other:?}, expected udp or tcp"),
    };
    let obedient = Arc::new(DnsClient::new(
        config.dns.obedient.nameserver.clone(),
        obedient_protocol,
        None,
    )?);

    // abroad upstream goes through the configured proxy when one is set
    let abroad_dialer: Option<Arc<dyn ProxyDialer>> =
        ProxyUri::parse_opt(&config.dns.abroad.proxy)?.map(dialer_for);
    let abroad_protocol = if config.dns.abroad.enable_dns_over_https {
        Protocol::Https
    } else {
        Protocol::Tcp
    };
    let abroad = Arc::new(DnsClient::new(
        config.dns.abroad.nameserver.clone(),
        abroad_protocol,
        abroad_dialer,
    )?);

    let resolver = Arc::new(Resolver::new(
        matcher,
        domestic,
        local_ip,
        proxy_ip,
        obedient,
        abroad,
        DEFAULT_TTL,
    ));
    resolver.spawn_sweeper(DEFAULT_SWEEP_INTERVAL);

    let direct: Arc<dyn Outbound> = Arc::new(DirectOutbound);
    let proxy_uri = ProxyUri::parse(&config.proxy.proxy_server)
        .context("invalid [proxy] proxy_server")?;
    let proxy: Arc<dyn Outbound> = outbound_for(proxy_uri);

    let dns_listen = parse_listen(&config.dns.listen)?;
    let dns_server = DnsServer::bind(dns_listen, Arc::clone(&resolver)).await?;
    let mixed = Arc::new(
        MixedInbound::bind(&config.proxy.listen, Arc::clone(&resolver), direct, proxy).await?,
    );

    // the first front to return, error or not, takes the process down
    tokio::select! {
        result = dns_server.run() => match result {
            Ok(()) => bail!("dns server exited unexpectedly"),
            Err(e) => Err(e).context("dns server failed"),
        },
        result = Arc::clone(&mixed).run() => match result {
            Ok(()) => bail!("proxy dispatcher exited unexpectedly"),
            Err(e) => Err(e).context("proxy dispatcher failed"),
        },
    }
}

fn dialer_for(uri: ProxyUri) -> Arc<dyn ProxyDialer> {
    match uri.scheme {
        ProxyScheme::Socks5 => Arc::new(Socks5Outbound::new(uri.addr)),
        ProxyScheme::Http => Arc::new(HttpOutbound::new(uri.addr)),
    }
}

fn outbound_for(uri: ProxyUri) -> Arc<dyn Outbound> {
    match uri.scheme {
        ProxyScheme::Socks5 => Arc::new(Socks5Outbound::new(uri.addr)),
        ProxyScheme::Http => Arc::new(HttpOutbound::new(uri.addr)),
    }
}
