//! In-process transport sharing one zone between registries.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::zone::{MdnsTransport, QueryParams, ServiceEntry, ServiceRecord};
use crate::Result;

/// Zone shared by every clone; announcements reach every listener at once.
#[derive(Clone)]
pub struct LocalTransport {
    zone: Arc<RwLock<HashMap<String, ServiceRecord>>>,
    events: broadcast::Sender<ServiceEntry>,
}

impl LocalTransport {
    /// Create an empty zone.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            zone: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MdnsTransport for LocalTransport {
    async fn announce(&self, record: ServiceRecord) -> Result<()> {
        record.validate()?;
        let entry = record.entry(record.ttl);
        debug!(name = %entry.name, "local: announce");
        self.zone.write().insert(record.instance_addr(), record);
        let _ = self.events.send(entry);
        Ok(())
    }

    async fn withdraw(&self, instance_addr: &str) -> Result<()> {
        let removed = self.zone.write().remove(instance_addr);
        if let Some(record) = removed {
            debug!(name = %instance_addr, "local: goodbye");
            let _ = self.events.send(record.entry(0));
        }
        Ok(())
    }

    async fn query(&self, params: &QueryParams) -> Result<Vec<ServiceEntry>> {
        let wanted = params.service_addr();
        let entries: Vec<_> = self
            .zone
            .read()
            .values()
            .filter(|r| r.service_addr() == wanted)
            .map(|r| r.entry(r.ttl))
            .collect();
        trace!(service = %wanted, count = entries.len(), "local: query");
        Ok(entries)
    }

    async fn listen(&self, tx: mpsc::Sender<ServiceEntry>, exit: CancellationToken) -> Result<()> {
        let mut rx = self.events.subscribe();
        loop {
            tokio::select! {
                _ = exit.cancelled() => return Ok(()),
                msg = rx.recv() => match msg {
                    Ok(entry) => {
                        if tx.send(entry).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "local: listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::registry::mdns::zone::DEFAULT_TTL;

    fn record(instance: &str, service: &str) -> ServiceRecord {
        ServiceRecord {
            instance: instance.into(),
            service: service.into(),
            domain: "vine".into(),
            port: 8080,
            ips: vec!["127.0.0.1".parse().unwrap()],
            txt: vec!["abc".into()],
            ttl: DEFAULT_TTL,
        }
    }

    fn params(service: &str) -> QueryParams {
        QueryParams {
            service: service.into(),
            domain: "vine".into(),
            timeout: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn query_matches_service_only() {
        let transport = LocalTransport::new();
        transport.announce(record("a", "greeter")).await.unwrap();
        transport.announce(record("b", "other")).await.unwrap();

        let entries = transport.query(&params("greeter")).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.greeter.vine.");
        assert_eq!(entries[0].address().as_deref(), Some("127.0.0.1:8080"));
    }

    #[tokio::test]
    async fn announce_rejects_oversize_txt() {
        let transport = LocalTransport::new();
        let mut rec = record("a", "greeter");
        rec.txt = vec!["a".repeat(256)];
        assert!(matches!(
            transport.announce(rec).await,
            Err(crate::Error::Discovery(_))
        ));
        assert!(transport.query(&params("greeter")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listener_sees_goodbye() {
        let transport = LocalTransport::new();
        let (tx, mut rx) = mpsc::channel(8);
        let exit = CancellationToken::new();
        let listener = {
            let transport = transport.clone();
            let exit = exit.clone();
            tokio::spawn(async move { transport.listen(tx, exit).await })
        };
        tokio::task::yield_now().await;

        transport.announce(record("a", "greeter")).await.unwrap();
        transport.withdraw("a.greeter.vine.").await.unwrap();

        assert_eq!(rx.recv().await.unwrap().ttl, DEFAULT_TTL);
        assert_eq!(rx.recv().await.unwrap().ttl, 0);
        assert!(transport.query(&params("greeter")).await.unwrap().is_empty());

        exit.cancel();
        listener.await.unwrap().unwrap();
    }
}
