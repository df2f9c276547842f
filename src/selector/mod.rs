//! Selectors turn a list of services into a pick-next-node function.
//!
//! - [`filter`] narrows the candidate services before selection
//! - [`strategy`] builds the [`Next`] closure (random, round robin)
//! - [`DnsSelector`] and [`RegistrySelector`] are the two resolution backends
//!
//! Callers report every attempt's outcome through [`Selector::mark`] so an
//! adaptive selector can be swapped in without touching the call path.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::registry::{Node, Registry, Service};
use crate::{Error, Result};

pub mod dns;
pub mod filter;
pub mod registry;
pub mod strategy;

pub use dns::DnsSelector;
pub use registry::RegistrySelector;

/// Yields the next node to try.
pub type Next = Arc<dyn Fn() -> Result<Node> + Send + Sync>;

/// Builds a [`Next`] from candidate services.
pub type Strategy = Arc<dyn Fn(&[Service]) -> Next + Send + Sync>;

/// Narrows candidate services. Must not modify its input.
pub type Filter = Arc<dyn Fn(&[Service]) -> Vec<Service> + Send + Sync>;

/// Selector-wide configuration.
#[derive(Clone)]
pub struct SelectorOptions {
    /// Registry consulted by registry-backed selectors.
    pub registry: Option<Arc<dyn Registry>>,
    /// Default strategy.
    pub strategy: Strategy,
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self {
            registry: None,
            strategy: Arc::new(strategy::random),
        }
    }
}

impl fmt::Debug for SelectorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorOptions")
            .field("registry", &self.registry.as_ref().map(|r| r.name()))
            .finish_non_exhaustive()
    }
}

impl SelectorOptions {
    /// Use `registry` for resolution.
    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the default strategy.
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Per-selection configuration.
#[derive(Clone, Default)]
pub struct SelectOptions {
    /// Applied left to right before the strategy.
    pub filters: Vec<Filter>,
    /// Overrides the selector's strategy for this call.
    pub strategy: Option<Strategy>,
}

impl fmt::Debug for SelectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectOptions")
            .field("filters", &self.filters.len())
            .field("strategy", &self.strategy.is_some())
            .finish()
    }
}

impl SelectOptions {
    /// Append a filter.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Override the strategy.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Run the filters, then build `Next` with the chosen strategy.
    ///
    /// Returns [`Error::NoneAvailable`] when filtering leaves nothing.
    pub fn apply(&self, default: &Strategy, services: Vec<Service>) -> Result<Next> {
        let services = self
            .filters
            .iter()
            .fold(services, |services, filter| filter(&services));
        if services.is_empty() {
            return Err(Error::NoneAvailable);
        }
        let strategy = self.strategy.as_ref().unwrap_or(default);
        Ok(strategy(&services))
    }
}

/// Picks nodes for a service and receives feedback on their use.
#[async_trait]
pub trait Selector: Send + Sync + 'static {
    /// Replace the selector configuration.
    fn init(&mut self, opts: SelectorOptions) -> Result<()>;

    /// Current configuration.
    fn options(&self) -> &SelectorOptions;

    /// Resolve `service` and return a node generator.
    async fn select(&self, service: &str, opts: SelectOptions) -> Result<Next>;

    /// Record the outcome of using `node`. Must not block.
    fn mark(&self, service: &str, node: &Node, err: Option<&Error>);

    /// Forget any state accumulated for `service`.
    fn reset(&self, service: &str);

    /// Release resources.
    async fn close(&self) -> Result<()>;

    /// Implementation name.
    fn name(&self) -> &'static str;
}

/// A `Next` that always yields one of `addresses`, chosen at random.
pub fn static_next(addresses: &[String]) -> Next {
    let service = Service {
        nodes: addresses
            .iter()
            .map(|addr| Node::new(addr.clone(), addr.clone()))
            .collect(),
        ..Default::default()
    };
    strategy::random(&[service])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services() -> Vec<Service> {
        vec![
            Service::new("greeter", "1").with_node(Node::new("a", "10.0.0.1:1")),
            Service::new("greeter", "2").with_node(Node::new("b", "10.0.0.2:1")),
        ]
    }

    #[test]
    fn apply_runs_filters_in_order() {
        let opts = SelectOptions::default()
            .with_filter(filter::version("2"))
            .with_filter(filter::version("1"));
        let default: Strategy = Arc::new(strategy::random);
        assert!(matches!(
            opts.apply(&default, services()),
            Err(Error::NoneAvailable)
        ));

        let opts = SelectOptions::default().with_filter(filter::version("2"));
        let next = opts.apply(&default, services()).unwrap();
        assert_eq!(next().unwrap().id, "b");
    }

    #[test]
    fn static_next_uses_given_addresses() {
        let next = static_next(&["10.1.1.1:80".to_string()]);
        let node = next().unwrap();
        assert_eq!(node.address, "10.1.1.1:80");
        assert!(matches!(static_next(&[])(), Err(Error::NoneAvailable)));
    }
}
