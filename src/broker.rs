//! Message broker seam used by [`Client::publish`](crate::client::Client::publish).
//!
//! No broker ships with the crate; embedders plug one in.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::context::Context;
use crate::Result;

/// Header naming the payload content type.
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";

/// Header naming the topic a message was published to.
pub const TOPIC_HEADER: &str = "Micro-Topic";

/// A message as handed to the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Headers, including content type and topic.
    pub header: HashMap<String, String>,
    /// Encoded payload.
    pub body: Bytes,
}

/// Publish side of a message broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Connect to the broker. Called once before the first publish.
    async fn connect(&self) -> Result<()>;

    /// Publish `msg` on `topic`.
    async fn publish(&self, ctx: &Context, topic: &str, msg: BrokerMessage) -> Result<()>;

    /// Implementation name.
    fn name(&self) -> &'static str;
}
