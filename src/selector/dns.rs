//! Selector resolving services through DNS.
//!
//! `host:port` names resolve through A/AAAA lookups; anything else through
//! an SRV lookup of `_<service>._tcp.<domain>.`.

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tracing::debug;

use super::{Next, SelectOptions, Selector, SelectorOptions};
use crate::registry::{Node, Service};
use crate::{Error, Result};

/// Default SRV domain.
pub const DEFAULT_DOMAIN: &str = "local";

/// DNS-backed selector.
pub struct DnsSelector {
    opts: SelectorOptions,
    domain: String,
    resolver: TokioAsyncResolver,
}

impl DnsSelector {
    /// Create a selector using the system resolver configuration.
    pub fn new(opts: SelectorOptions) -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            debug!(error = %e, "no system resolver config, using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self::with_resolver(opts, resolver)
    }

    /// Create a selector with an explicit resolver.
    pub fn with_resolver(opts: SelectorOptions, resolver: TokioAsyncResolver) -> Self {
        Self {
            opts,
            domain: DEFAULT_DOMAIN.to_string(),
            resolver,
        }
    }

    /// Set the SRV domain.
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    async fn resolve(&self, service: &str) -> Result<Vec<Node>> {
        if let Some((host, port)) = host_port(service) {
            let ips = self.resolver.lookup_ip(host).await.map_err(|e| {
                debug!(host, error = %e, "host lookup failed");
                Error::NotFound
            })?;
            return Ok(ips
                .iter()
                .map(|ip| {
                    let address = match ip {
                        std::net::IpAddr::V4(v4) => format!("{v4}:{port}"),
                        std::net::IpAddr::V6(v6) => format!("[{v6}]:{port}"),
                    };
                    Node::new(ip.to_string(), address)
                })
                .collect());
        }

        let name = format!("_{}._tcp.{}.", service, self.domain.trim_end_matches('.'));
        let srvs = self.resolver.srv_lookup(name.as_str()).await.map_err(|e| {
            debug!(%name, error = %e, "srv lookup failed");
            Error::NotFound
        })?;
        Ok(srvs
            .iter()
            .map(|srv| {
                let target = srv.target().to_utf8();
                let target = target.trim_end_matches('.');
                Node::new(target, format!("{target}:{}", srv.port()))
            })
            .collect())
    }
}

/// `host:port` with a numeric port.
fn host_port(name: &str) -> Option<(&str, u16)> {
    let (host, port) = name.rsplit_once(':')?;
    let port = port.parse().ok()?;
    Some((host.trim_start_matches('[').trim_end_matches(']'), port))
}

#[async_trait]
impl Selector for DnsSelector {
    fn init(&mut self, opts: SelectorOptions) -> Result<()> {
        self.opts = opts;
        Ok(())
    }

    fn options(&self) -> &SelectorOptions {
        &self.opts
    }

    async fn select(&self, service: &str, opts: SelectOptions) -> Result<Next> {
        let nodes = self.resolve(service).await?;
        let services = vec![Service {
            name: service.to_string(),
            nodes,
            ..Default::default()
        }];
        opts.apply(&self.opts.strategy, services)
    }

    fn mark(&self, _service: &str, _node: &Node, _err: Option<&Error>) {}

    fn reset(&self, _service: &str) {}

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dns"
    }
}
