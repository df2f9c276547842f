//! Transport capability traits.
//!
//! The pool and the call executor only see [`Transport`], [`Connection`] and
//! [`TransportStream`]; [`grpc`] is the tonic-backed implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::client::Request;
use crate::context::Context;
use crate::Result;

pub mod grpc;

pub use grpc::GrpcTransport;

/// Connectivity of a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Not connected, will connect on use.
    Idle,
    /// Connection in progress.
    Connecting,
    /// Usable.
    Ready,
    /// Failed, may recover.
    TransientFailure,
    /// Closed for good.
    Shutdown,
}

impl ConnectivityState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Ready,
            3 => Self::TransientFailure,
            _ => Self::Shutdown,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Connecting => 1,
            Self::Ready => 2,
            Self::TransientFailure => 3,
            Self::Shutdown => 4,
        }
    }
}

/// Options used when dialing a new connection.
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Connect timeout.
    pub timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// Dials connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to `address`.
    async fn dial(&self, address: &str, opts: &DialOptions) -> Result<Arc<dyn Connection>>;

    /// Implementation name.
    fn name(&self) -> &'static str;
}

/// One physical connection able to carry many concurrent calls.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Current connectivity.
    fn state(&self) -> ConnectivityState;

    /// Unary call; `timeout` bounds the whole exchange.
    async fn invoke(&self, ctx: &Context, req: &Request, timeout: Duration) -> Result<Bytes>;

    /// Open a bidirectional stream.
    async fn stream(&self, ctx: &Context, req: &Request) -> Result<Box<dyn TransportStream>>;

    /// Close the connection. Further calls fail.
    fn close(&self);
}

/// A bidirectional message stream on a connection.
#[async_trait]
pub trait TransportStream: Send {
    /// Send one message.
    async fn send(&mut self, msg: Bytes) -> Result<()>;

    /// Receive one message; `None` at end of stream.
    async fn recv(&mut self) -> Result<Option<Bytes>>;

    /// Half-close the sending side.
    fn close_send(&mut self);
}
