//! Records published on, and entries observed from, multicast DNS.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::registry::encoding::TXT_CHUNK_LEN;
use crate::{Error, Result};

/// Default record TTL in seconds.
pub const DEFAULT_TTL: u32 = 120;

/// A service instance announced by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Instance label, the node id (or service name for wildcard records).
    pub instance: String,
    /// Service label.
    pub service: String,
    /// Domain without trailing dot.
    pub domain: String,
    /// Port the instance listens on.
    pub port: u16,
    /// Addresses of the instance host.
    pub ips: Vec<IpAddr>,
    /// TXT strings.
    pub txt: Vec<String>,
    /// Record TTL in seconds.
    pub ttl: u32,
}

impl ServiceRecord {
    /// `<service>.<domain>.`
    pub fn service_addr(&self) -> String {
        service_addr(&self.service, &self.domain)
    }

    /// `<instance>.<service>.<domain>.`
    pub fn instance_addr(&self) -> String {
        format!("{}.{}", self.instance, self.service_addr())
    }

    /// Reject records DNS cannot carry.
    pub fn validate(&self) -> Result<()> {
        match self.txt.iter().find(|s| s.len() > TXT_CHUNK_LEN) {
            Some(s) => Err(Error::discovery(format!(
                "txt string of {} bytes for {} exceeds {TXT_CHUNK_LEN}",
                s.len(),
                self.instance_addr()
            ))),
            None => Ok(()),
        }
    }

    /// The entry a querier observes for this record with the given TTL.
    pub fn entry(&self, ttl: u32) -> ServiceEntry {
        let addr_v4 = self.ips.iter().find_map(|ip| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        });
        let addr_v6 = self.ips.iter().find_map(|ip| match ip {
            IpAddr::V6(v6) => Some(*v6),
            IpAddr::V4(_) => None,
        });
        ServiceEntry {
            name: self.instance_addr(),
            host: self.instance_addr(),
            addr_v4,
            addr_v6,
            port: self.port,
            info_fields: self.txt.clone(),
            ttl,
        }
    }
}

/// `<service>.<domain>.`
pub fn service_addr(service: &str, domain: &str) -> String {
    format!("{}.{}.", service, domain.trim_end_matches('.'))
}

/// A service instance seen on the network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceEntry {
    /// Fully qualified instance name.
    pub name: String,
    /// Target host name.
    pub host: String,
    /// IPv4 address, if announced.
    pub addr_v4: Option<Ipv4Addr>,
    /// IPv6 address, if announced.
    pub addr_v6: Option<Ipv6Addr>,
    /// Service port.
    pub port: u16,
    /// TXT strings in announcement order.
    pub info_fields: Vec<String>,
    /// TTL in seconds; zero announces removal.
    pub ttl: u32,
}

impl ServiceEntry {
    /// `host:port`, preferring IPv4 and bracketing IPv6.
    pub fn address(&self) -> Option<String> {
        if let Some(v4) = self.addr_v4 {
            Some(format!("{v4}:{}", self.port))
        } else {
            self.addr_v6.map(|v6| format!("[{v6}]:{}", self.port))
        }
    }
}

/// Parameters of a one-shot lookup.
#[derive(Debug, Clone)]
pub struct QueryParams {
    /// Service label to look up.
    pub service: String,
    /// Domain without trailing dot.
    pub domain: String,
    /// How long to gather answers.
    pub timeout: Duration,
}

impl QueryParams {
    /// `<service>.<domain>.`
    pub fn service_addr(&self) -> String {
        service_addr(&self.service, &self.domain)
    }
}

/// Moves records and entries between processes.
///
/// Implementations keep a zone of announced records, answer lookups from it,
/// and surface every entry they observe to listeners.
#[async_trait]
pub trait MdnsTransport: Send + Sync + 'static {
    /// Add a record to the zone and announce it.
    async fn announce(&self, record: ServiceRecord) -> Result<()>;

    /// Remove the record named `instance_addr` and announce its removal (TTL 0).
    async fn withdraw(&self, instance_addr: &str) -> Result<()>;

    /// Gather entries for `params.service` until `params.timeout` elapses.
    ///
    /// An expired lookup returns whatever was gathered, possibly nothing.
    async fn query(&self, params: &QueryParams) -> Result<Vec<ServiceEntry>>;

    /// Forward every observed entry to `tx` until `exit` is cancelled.
    async fn listen(&self, tx: mpsc::Sender<ServiceEntry>, exit: CancellationToken) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_names() {
        let record = ServiceRecord {
            instance: "node-1".into(),
            service: "greeter".into(),
            domain: "vine".into(),
            port: 9000,
            ips: vec!["10.0.0.1".parse().unwrap()],
            txt: vec![],
            ttl: DEFAULT_TTL,
        };
        assert_eq!(record.service_addr(), "greeter.vine.");
        assert_eq!(record.instance_addr(), "node-1.greeter.vine.");
    }

    #[test]
    fn address_prefers_ipv4() {
        let mut entry = ServiceEntry {
            addr_v4: Some(Ipv4Addr::new(10, 0, 0, 1)),
            addr_v6: Some(Ipv6Addr::LOCALHOST),
            port: 80,
            ..Default::default()
        };
        assert_eq!(entry.address().as_deref(), Some("10.0.0.1:80"));
        entry.addr_v4 = None;
        assert_eq!(entry.address().as_deref(), Some("[::1]:80"));
        entry.addr_v6 = None;
        assert_eq!(entry.address(), None);
    }
}
