//! Explicitly constructed bundle of registry, selector and client.
//!
//! Build one per process and hand clones of the `Arc`s to whatever needs
//! them.

use std::sync::Arc;

use tracing::{info, warn};

use crate::broker::Broker;
use crate::client::{Client, ClientOptions, RpcClient};
use crate::registry::{MdnsOptions, MdnsRegistry, Registry};
use crate::selector::{RegistrySelector, Selector, SelectorOptions};
use crate::transport::{GrpcTransport, Transport};
use crate::Result;

/// Builder for [`Runtime`].
///
/// Anything not set falls back to multicast DNS discovery, a
/// registry-backed selector and the gRPC transport.
#[derive(Default)]
pub struct RuntimeBuilder {
    registry: Option<Arc<dyn Registry>>,
    selector: Option<Arc<dyn Selector>>,
    transport: Option<Arc<dyn Transport>>,
    broker: Option<Arc<dyn Broker>>,
    mdns: MdnsOptions,
    selector_options: SelectorOptions,
    client: ClientOptions,
}

impl RuntimeBuilder {
    /// Create a builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `registry` instead of multicast DNS.
    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Options for the default multicast DNS registry.
    pub fn mdns_options(mut self, opts: MdnsOptions) -> Self {
        self.mdns = opts;
        self
    }

    /// Use `selector` instead of the registry selector.
    pub fn selector(mut self, selector: Arc<dyn Selector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Options for the default registry selector.
    pub fn selector_options(mut self, opts: SelectorOptions) -> Self {
        self.selector_options = opts;
        self
    }

    /// Use `transport` instead of gRPC.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Publish through `broker`.
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Client options.
    pub fn client_options(mut self, opts: ClientOptions) -> Self {
        self.client = opts;
        self
    }

    /// Assemble the runtime.
    ///
    /// Binds the multicast socket when no registry was supplied.
    pub fn build(self) -> Result<Runtime> {
        let registry: Arc<dyn Registry> = match self.registry {
            Some(registry) => registry,
            None => Arc::new(MdnsRegistry::new(self.mdns)?),
        };
        let selector: Arc<dyn Selector> = match self.selector {
            Some(selector) => selector,
            None => Arc::new(RegistrySelector::with_options(
                self.selector_options.registry(Arc::clone(&registry)),
            )?),
        };
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(GrpcTransport::new()));

        let mut client = RpcClient::new(self.client, Arc::clone(&selector), transport);
        if let Some(broker) = self.broker {
            client = client.with_broker(broker);
        }

        info!(
            registry = registry.name(),
            selector = selector.name(),
            "runtime ready"
        );
        Ok(Runtime {
            registry,
            selector,
            client: Arc::new(client),
        })
    }
}

/// The registry, selector and client a process shares.
#[derive(Clone)]
pub struct Runtime {
    registry: Arc<dyn Registry>,
    selector: Arc<dyn Selector>,
    client: Arc<dyn Client>,
}

impl Runtime {
    /// Start building a runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Service registry.
    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Node selector.
    pub fn selector(&self) -> &Arc<dyn Selector> {
        &self.selector
    }

    /// RPC client.
    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    /// Close pooled connections and the selector.
    pub async fn shutdown(self) -> Result<()> {
        if let Err(e) = self.client.close().await {
            warn!("client close error: {e}");
        }
        self.selector.close().await
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("registry", &self.registry.name())
            .field("selector", &self.selector.name())
            .field("client", &self.client.name())
            .finish()
    }
}
