//! Service registry: data model, registry and watcher contracts.
//!
//! - [`Node`] is one addressable instance, [`Service`] groups nodes of one version
//! - [`Registry`] publishes and discovers services
//! - [`Watcher`] yields add/remove events
//!
//! The multicast DNS implementation lives in [`mdns`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

pub mod encoding;
pub mod mdns;

pub use mdns::{MdnsOptions, MdnsRegistry};

/// One physical instance of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique instance id.
    pub id: String,
    /// `host:port` address.
    pub address: String,
    /// Free-form labels.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Node {
    /// Create a node without metadata.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata label.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Describes a request or response type of an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    /// Field or type name.
    pub name: String,
    /// Type name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Nested fields.
    #[serde(default)]
    pub values: Vec<Value>,
}

/// An RPC method exposed by a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Method name, e.g. `Greeter.Hello`.
    pub name: String,
    /// Request shape.
    #[serde(default)]
    pub request: Option<Value>,
    /// Response shape.
    #[serde(default)]
    pub response: Option<Value>,
    /// Free-form labels.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Endpoint {
    /// Endpoint with only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// One version of a named service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Service name.
    pub name: String,
    /// Version string.
    #[serde(default)]
    pub version: String,
    /// Exposed methods.
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// Known instances.
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Service {
    /// Create a service with no nodes or endpoints.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    /// Add a node.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add an endpoint.
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }
}

/// Kind of change reported by a [`Watcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// A node appeared or was refreshed.
    Create,
    /// A node went away.
    Delete,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Create => f.write_str("create"),
            Action::Delete => f.write_str("delete"),
        }
    }
}

/// A discovery event: the action and the single-node service it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// What happened.
    pub action: Action,
    /// The service, carrying exactly the affected node.
    pub service: Service,
}

/// Options for [`Registry::watch`].
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Only report this service. Empty means every service.
    pub service: String,
}

impl WatchOptions {
    /// Watch a single service.
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            service: name.into(),
        }
    }
}

/// Subscriber to discovery events.
#[async_trait]
pub trait Watcher: Send {
    /// Wait for the next matching event.
    ///
    /// Returns [`Error::WatcherStopped`](crate::Error::WatcherStopped) once stopped.
    async fn next(&mut self) -> Result<WatchEvent>;

    /// Stop the watcher. Safe to call more than once.
    fn stop(&self);
}

/// Publishes and discovers services.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Announce every node of `service` not yet published.
    async fn register(&self, service: &Service) -> Result<()>;

    /// Withdraw the listed nodes of `service`.
    async fn deregister(&self, service: &Service) -> Result<()>;

    /// Discover `name`, one [`Service`] per version.
    async fn get_service(&self, name: &str) -> Result<Vec<Service>>;

    /// Enumerate the names of all announced services.
    async fn list_services(&self) -> Result<Vec<Service>>;

    /// Subscribe to discovery events.
    async fn watch(&self, opts: WatchOptions) -> Result<Box<dyn Watcher>>;

    /// Implementation name.
    fn name(&self) -> &'static str;
}
