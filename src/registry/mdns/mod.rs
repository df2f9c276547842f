//! Multicast DNS registry.
//!
//! Each registered node becomes one record named `<node id>.<service>.<domain>.`
//! whose TXT strings carry the [`TxtRecord`](super::encoding::TxtRecord).
//! The first node of a service also publishes a wildcard record under
//! `_services` so [`Registry::list_services`] can enumerate names.
//!
//! Watchers share a single listener, started with the first watcher and
//! stopped with the last.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::encoding::{self, TxtRecord};
use super::{Action, Node, Registry, Service, WatchEvent, WatchOptions, Watcher};
use crate::{Error, Result};

pub mod local;
pub mod multicast;
pub mod zone;

pub use local::LocalTransport;
pub use multicast::MulticastTransport;
pub use zone::{MdnsTransport, QueryParams, ServiceEntry, ServiceRecord};

/// Wildcard service label used for enumeration.
pub const WILDCARD_SERVICE: &str = "_services";
/// Id of the per-service wildcard entry.
const WILDCARD_ID: &str = "*";
/// Buffered events per watcher before new ones are dropped.
pub const WATCHER_BUFFER: usize = 32;

/// Registry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MdnsOptions {
    /// Domain records live under. Default: `vine`.
    pub domain: String,
    /// How long lookups gather answers. Default: 100ms.
    #[serde(deserialize_with = "crate::secs::deserialize")]
    pub timeout: Duration,
    /// TTL announced on records. Default: 120s.
    pub ttl: u32,
}

impl Default for MdnsOptions {
    fn default() -> Self {
        Self {
            domain: "vine".to_string(),
            timeout: Duration::from_millis(100),
            ttl: zone::DEFAULT_TTL,
        }
    }
}

impl MdnsOptions {
    /// Set the domain.
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Set the lookup timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A published record owned by the registry.
#[derive(Debug)]
struct MdnsEntry {
    id: String,
    instance_addr: String,
}

/// Registry backed by multicast DNS.
#[derive(Clone)]
pub struct MdnsRegistry {
    opts: MdnsOptions,
    transport: Arc<dyn MdnsTransport>,
    services: Arc<tokio::sync::Mutex<HashMap<String, Vec<MdnsEntry>>>>,
    hub: Arc<WatchHub>,
}

impl MdnsRegistry {
    /// Create a registry on the network, binding the mDNS socket.
    pub fn new(opts: MdnsOptions) -> Result<Self> {
        Ok(Self::with_transport(opts, Arc::new(MulticastTransport::bind()?)))
    }

    /// Create a registry over an explicit transport.
    pub fn with_transport(opts: MdnsOptions, transport: Arc<dyn MdnsTransport>) -> Self {
        Self {
            opts,
            hub: Arc::new(WatchHub::new(Arc::clone(&transport))),
            transport,
            services: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Registry configuration.
    pub fn options(&self) -> &MdnsOptions {
        &self.opts
    }

    fn record(&self, instance: &str, service: &str, port: u16, ips: Vec<IpAddr>, txt: Vec<String>) -> ServiceRecord {
        ServiceRecord {
            instance: instance.to_string(),
            service: service.to_string(),
            domain: self.opts.domain.clone(),
            port,
            ips,
            txt,
            ttl: self.opts.ttl,
        }
    }

    async fn publish_node(&self, service: &Service, node: &Node) -> Result<MdnsEntry> {
        let txt = encoding::encode(&TxtRecord {
            service: service.name.clone(),
            version: service.version.clone(),
            endpoints: service.endpoints.clone(),
            metadata: node.metadata.clone(),
        })?;

        let (host, port) = split_host_port(&node.address)?;
        let ip = resolve_host(host, port).await?;

        let record = self.record(&node.id, &service.name, port, vec![ip], txt);
        let instance_addr = record.instance_addr();
        self.transport.announce(record).await?;

        Ok(MdnsEntry {
            id: node.id.clone(),
            instance_addr,
        })
    }
}

#[async_trait]
impl Registry for MdnsRegistry {
    async fn register(&self, service: &Service) -> Result<()> {
        let mut services = self.services.lock().await;
        let mut entries = services.remove(&service.name).unwrap_or_default();
        let mut last_err = None;

        if entries.is_empty() {
            let wildcard = self.record(
                &service.name,
                WILDCARD_SERVICE,
                9999,
                vec![IpAddr::from([0, 0, 0, 0])],
                Vec::new(),
            );
            let instance_addr = wildcard.instance_addr();
            match self.transport.announce(wildcard).await {
                Ok(()) => entries.push(MdnsEntry {
                    id: WILDCARD_ID.to_string(),
                    instance_addr,
                }),
                Err(e) => {
                    warn!(service = %service.name, error = %e, "failed to announce wildcard");
                    last_err = Some(e);
                }
            }
        }

        for node in &service.nodes {
            if entries.iter().any(|e| e.id == node.id) {
                continue;
            }
            match self.publish_node(service, node).await {
                Ok(entry) => {
                    info!(service = %service.name, node = %node.id, "registered node");
                    entries.push(entry);
                }
                Err(e) => {
                    warn!(service = %service.name, node = %node.id, error = %e, "failed to register node");
                    last_err = Some(e);
                }
            }
        }

        if !entries.is_empty() {
            services.insert(service.name.clone(), entries);
        }
        last_err.map_or(Ok(()), Err)
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        let mut services = self.services.lock().await;
        let Some(entries) = services.remove(&service.name) else {
            return Ok(());
        };

        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            if service.nodes.iter().any(|n| n.id == entry.id) {
                debug!(service = %service.name, node = %entry.id, "deregistering node");
                if let Err(e) = self.transport.withdraw(&entry.instance_addr).await {
                    warn!(node = %entry.id, error = %e, "failed to withdraw record");
                }
            } else {
                kept.push(entry);
            }
        }

        if kept.len() == 1 && kept[0].id == WILDCARD_ID {
            self.transport.withdraw(&kept[0].instance_addr).await?;
        } else if !kept.is_empty() {
            services.insert(service.name.clone(), kept);
        }
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
        let params = QueryParams {
            service: name.to_string(),
            domain: self.opts.domain.clone(),
            timeout: self.opts.timeout,
        };
        let suffix = format!(".{}", params.service_addr());
        let entries = self.transport.query(&params).await?;

        let mut by_version: HashMap<String, Service> = HashMap::new();
        let mut order = Vec::new();
        for entry in entries {
            if entry.ttl == 0 || !entry.name.ends_with(&suffix) {
                continue;
            }
            let txt = match encoding::decode(&entry.info_fields) {
                Ok(txt) => txt,
                Err(e) => {
                    debug!(entry = %entry.name, error = %e, "skipping undecodable entry");
                    continue;
                }
            };
            if txt.service != name {
                continue;
            }
            let Some(address) = entry.address() else {
                continue;
            };

            let service = by_version.entry(txt.version.clone()).or_insert_with(|| {
                order.push(txt.version.clone());
                Service {
                    name: txt.service.clone(),
                    version: txt.version.clone(),
                    endpoints: txt.endpoints.clone(),
                    nodes: Vec::new(),
                }
            });
            service.nodes.push(Node {
                id: strip(&entry.name, &suffix),
                address,
                metadata: txt.metadata,
            });
        }

        Ok(order
            .into_iter()
            .filter_map(|v| by_version.remove(&v))
            .collect())
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let params = QueryParams {
            service: WILDCARD_SERVICE.to_string(),
            domain: self.opts.domain.clone(),
            timeout: self.opts.timeout,
        };
        let suffix = format!(".{}", params.service_addr());
        let entries = self.transport.query(&params).await?;

        let mut seen = std::collections::HashSet::new();
        let mut services = Vec::new();
        for entry in entries {
            if entry.ttl == 0 || !entry.name.ends_with(&suffix) {
                continue;
            }
            let name = strip(&entry.name, &suffix);
            if seen.insert(name.clone()) {
                services.push(Service {
                    name,
                    ..Default::default()
                });
            }
        }
        Ok(services)
    }

    async fn watch(&self, opts: WatchOptions) -> Result<Box<dyn Watcher>> {
        let (id, rx, exit) = self.hub.add();
        Ok(Box::new(MdnsWatcher {
            id,
            opts,
            domain: self.opts.domain.clone(),
            rx,
            exit,
            stopped: AtomicBool::new(false),
            hub: Arc::clone(&self.hub),
        }))
    }

    fn name(&self) -> &'static str {
        "mdns"
    }
}

/// Shared listener and the watchers it feeds.
struct WatchHub {
    transport: Arc<dyn MdnsTransport>,
    watchers: Arc<RwLock<HashMap<String, mpsc::Sender<ServiceEntry>>>>,
    listener: Mutex<Option<CancellationToken>>,
}

impl WatchHub {
    fn new(transport: Arc<dyn MdnsTransport>) -> Self {
        Self {
            transport,
            watchers: Arc::new(RwLock::new(HashMap::new())),
            listener: Mutex::new(None),
        }
    }

    fn add(&self) -> (String, mpsc::Receiver<ServiceEntry>, CancellationToken) {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(WATCHER_BUFFER);

        let mut listener = self.listener.lock();
        self.watchers.write().insert(id.clone(), tx);
        if listener.is_none() {
            *listener = Some(self.spawn_listener());
        }
        (id, rx, CancellationToken::new())
    }

    fn remove(&self, id: &str) {
        let mut listener = self.listener.lock();
        let empty = {
            let mut watchers = self.watchers.write();
            watchers.remove(id);
            watchers.is_empty()
        };
        if empty {
            if let Some(exit) = listener.take() {
                debug!("last watcher gone, stopping mdns listener");
                exit.cancel();
            }
        }
    }

    fn watcher_count(&self) -> usize {
        self.watchers.read().len()
    }

    fn spawn_listener(&self) -> CancellationToken {
        let exit = CancellationToken::new();
        let transport = Arc::clone(&self.transport);
        let watchers = Arc::clone(&self.watchers);
        let token = exit.clone();

        tokio::spawn(async move {
            debug!("starting mdns listener");
            while !token.is_cancelled() {
                let (tx, mut rx) = mpsc::channel(WATCHER_BUFFER);
                let listen = transport.listen(tx, token.clone());
                tokio::pin!(listen);

                let res = loop {
                    tokio::select! {
                        res = &mut listen => break res,
                        Some(entry) = rx.recv() => fan_out(&watchers, entry),
                    }
                };
                // Deliver whatever was buffered before the listener returned.
                while let Ok(entry) = rx.try_recv() {
                    fan_out(&watchers, entry);
                }

                if let Err(e) = res {
                    warn!(error = %e, "mdns listener failed, restarting");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
            debug!("mdns listener stopped");
        });

        exit
    }
}

/// Non-blocking delivery; a full watcher misses the event.
fn fan_out(watchers: &RwLock<HashMap<String, mpsc::Sender<ServiceEntry>>>, entry: ServiceEntry) {
    for (id, tx) in watchers.read().iter() {
        if tx.try_send(entry.clone()).is_err() {
            debug!(watcher = %id, "watcher full, dropping event");
        }
    }
}

/// Watcher over the shared mDNS listener.
pub struct MdnsWatcher {
    id: String,
    opts: WatchOptions,
    domain: String,
    rx: mpsc::Receiver<ServiceEntry>,
    exit: CancellationToken,
    stopped: AtomicBool,
    hub: Arc<WatchHub>,
}

impl MdnsWatcher {
    fn event(&self, entry: ServiceEntry) -> Option<WatchEvent> {
        let txt = encoding::decode(&entry.info_fields).ok()?;
        if txt.service.is_empty() || txt.version.is_empty() {
            return None;
        }
        if !self.opts.service.is_empty() && txt.service != self.opts.service {
            return None;
        }

        let suffix = format!(".{}", zone::service_addr(&txt.service, &self.domain));
        if !entry.name.ends_with(&suffix) {
            return None;
        }

        let action = if entry.ttl == 0 {
            Action::Delete
        } else {
            Action::Create
        };
        let node = Node {
            id: strip(&entry.name, &suffix),
            address: entry.address().unwrap_or_default(),
            metadata: txt.metadata,
        };
        Some(WatchEvent {
            action,
            service: Service {
                name: txt.service,
                version: txt.version,
                endpoints: txt.endpoints,
                nodes: vec![node],
            },
        })
    }
}

#[async_trait]
impl Watcher for MdnsWatcher {
    async fn next(&mut self) -> Result<WatchEvent> {
        loop {
            let entry = tokio::select! {
                _ = self.exit.cancelled() => return Err(Error::WatcherStopped),
                entry = self.rx.recv() => entry.ok_or(Error::WatcherStopped)?,
            };
            if let Some(event) = self.event(entry) {
                return Ok(event);
            }
        }
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.exit.cancel();
        self.hub.remove(&self.id);
    }
}

impl Drop for MdnsWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn strip(name: &str, suffix: &str) -> String {
    name.strip_suffix(suffix).unwrap_or(name).to_string()
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
fn split_host_port(address: &str) -> Result<(&str, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| Error::discovery(format!("missing port in address {address:?}")))?;
    let port = port
        .parse()
        .map_err(|_| Error::discovery(format!("invalid port in address {address:?}")))?;
    Ok((host.trim_start_matches('[').trim_end_matches(']'), port))
}

async fn resolve_host(host: &str, port: u16) -> Result<IpAddr> {
    if host.is_empty() {
        return Ok(IpAddr::from([0, 0, 0, 0]));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    let mut fallback = None;
    for addr in addrs.by_ref() {
        match addr {
            SocketAddr::V4(v4) => return Ok(IpAddr::V4(*v4.ip())),
            SocketAddr::V6(v6) => fallback = fallback.or(Some(IpAddr::V6(*v6.ip()))),
        }
    }
    fallback.ok_or_else(|| Error::discovery(format!("could not resolve host {host:?}")))
}
