//! Client-side RPC runtime: multicast DNS discovery, load-balancing
//! selectors, pooled gRPC connections and retrying calls.

#![deny(missing_docs)]

pub mod broker;
pub mod client;
pub mod context;
pub mod error;
pub mod pool;
pub mod registry;
pub mod runtime;
mod secs;
pub mod selector;
pub mod transport;

// Re-export key types
pub use broker::{Broker, BrokerMessage};
pub use client::{CallOptions, Client, ClientOptions, ClientStream, Message, Request, Response, RpcClient};
pub use context::Context;
pub use error::{Error, Result};
pub use pool::{Pool, PoolOptions};
pub use registry::{MdnsOptions, MdnsRegistry, Node, Registry, Service, Watcher};
pub use runtime::{Runtime, RuntimeBuilder};
pub use selector::{DnsSelector, RegistrySelector, SelectOptions, Selector};
pub use transport::{GrpcTransport, Transport};
