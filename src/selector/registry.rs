//! Selector resolving services through a [`Registry`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::{Next, SelectOptions, Selector, SelectorOptions};
use crate::registry::{Node, Registry};
use crate::{Error, Result};

/// Selector backed by a registry lookup on every selection.
pub struct RegistrySelector {
    opts: SelectorOptions,
    registry: Arc<dyn Registry>,
}

impl RegistrySelector {
    /// Create a selector over `registry`.
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            opts: SelectorOptions::default().registry(Arc::clone(&registry)),
            registry,
        }
    }

    /// Create a selector from options; the options must name a registry.
    pub fn with_options(opts: SelectorOptions) -> Result<Self> {
        let registry = opts
            .registry
            .clone()
            .ok_or_else(|| Error::internal("vine.selector", "registry selector needs a registry"))?;
        Ok(Self { opts, registry })
    }
}

#[async_trait]
impl Selector for RegistrySelector {
    fn init(&mut self, opts: SelectorOptions) -> Result<()> {
        if let Some(registry) = &opts.registry {
            self.registry = Arc::clone(registry);
        }
        self.opts = opts;
        Ok(())
    }

    fn options(&self) -> &SelectorOptions {
        &self.opts
    }

    async fn select(&self, service: &str, opts: SelectOptions) -> Result<Next> {
        let services = self.registry.get_service(service).await?;
        trace!(service, versions = services.len(), "registry lookup");
        if services.is_empty() {
            return Err(Error::NotFound);
        }
        opts.apply(&self.opts.strategy, services)
    }

    fn mark(&self, _service: &str, _node: &Node, _err: Option<&Error>) {}

    fn reset(&self, _service: &str) {}

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "registry"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::mdns::{LocalTransport, MdnsOptions, MdnsRegistry};
    use crate::registry::Service;
    use crate::selector::filter;

    async fn registry() -> Arc<dyn Registry> {
        let reg = MdnsRegistry::with_transport(
            MdnsOptions::default(),
            Arc::new(LocalTransport::new()),
        );
        reg.register(
            &Service::new("greeter", "1.0")
                .with_node(Node::new("a", "10.0.0.1:80").with_metadata("dc", "east")),
        )
        .await
        .unwrap();
        Arc::new(reg)
    }

    #[tokio::test]
    async fn selects_registered_nodes() {
        let selector = RegistrySelector::new(registry().await);
        let next = selector
            .select("greeter", SelectOptions::default())
            .await
            .unwrap();
        assert_eq!(next().unwrap().id, "a");
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let selector = RegistrySelector::new(registry().await);
        let res = selector.select("missing", SelectOptions::default()).await;
        assert!(matches!(res, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn filtered_out_is_none_available() {
        let selector = RegistrySelector::new(registry().await);
        let opts = SelectOptions::default().with_filter(filter::label("dc", "west"));
        let res = selector.select("greeter", opts).await;
        assert!(matches!(res, Err(Error::NoneAvailable)));
    }

    #[test]
    fn options_without_registry_are_rejected() {
        assert!(RegistrySelector::with_options(SelectorOptions::default()).is_err());
    }
}
