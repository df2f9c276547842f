//! gRPC transport over tonic channels.
//!
//! Payloads are already encoded, so the codec passes bytes through.

use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes};
use http::uri::PathAndQuery;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::metadata::{MetadataKey, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::Status;
use tracing::{debug, info};

use super::{Connection, ConnectivityState, DialOptions, Transport, TransportStream};
use crate::client::Request;
use crate::context::Context;
use crate::{Error, Result};

/// Passes already-encoded payloads through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawCodec;
    type Decoder = RawCodec;

    fn encoder(&mut self) -> Self::Encoder {
        RawCodec
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawCodec
    }
}

impl Encoder for RawCodec {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> std::result::Result<(), Status> {
        dst.put(item);
        Ok(())
    }
}

impl Decoder for RawCodec {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> std::result::Result<Option<Bytes>, Status> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

/// Map an endpoint to a gRPC path.
///
/// `Greeter.Hello` on service `greeter` becomes `/greeter.Greeter/Hello`;
/// paths starting with `/` are used verbatim.
pub fn grpc_path(service: &str, endpoint: &str) -> String {
    if endpoint.is_empty() || endpoint.starts_with('/') {
        return endpoint.to_string();
    }
    let parts: Vec<&str> = endpoint.split('.').collect();
    if parts.len() != 2 {
        return endpoint.to_string();
    }
    if service.is_empty() {
        format!("/{}/{}", parts[0], parts[1])
    } else {
        format!("/{}.{}/{}", service, parts[0], parts[1])
    }
}

/// Dials tonic channels.
#[derive(Debug, Clone, Default)]
pub struct GrpcTransport;

impl GrpcTransport {
    /// Create the transport.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn dial(&self, address: &str, opts: &DialOptions) -> Result<Arc<dyn Connection>> {
        debug!("Dialing {}", address);

        let channel = Endpoint::from_shared(format!("http://{address}"))?
            .connect_timeout(opts.timeout)
            .connect()
            .await
            .map_err(|e| Error::connection(format!("dial {address}: {e}")))?;

        info!("Connected to {}", address);
        Ok(Arc::new(GrpcConnection {
            address: address.to_string(),
            channel: Mutex::new(Some(channel)),
            state: AtomicU8::new(ConnectivityState::Ready.as_u8()),
        }))
    }

    fn name(&self) -> &'static str {
        "grpc"
    }
}

/// A tonic channel with tracked connectivity.
pub struct GrpcConnection {
    address: String,
    channel: Mutex<Option<Channel>>,
    state: AtomicU8,
}

impl GrpcConnection {
    fn set_state(&self, state: ConnectivityState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn client(&self) -> Result<tonic::client::Grpc<Channel>> {
        let channel = self
            .channel
            .lock()
            .clone()
            .ok_or_else(|| Error::connection(format!("connection to {} is closed", self.address)))?;
        Ok(tonic::client::Grpc::new(channel))
    }

    async fn ready(&self, grpc: &mut tonic::client::Grpc<Channel>) -> Result<()> {
        grpc.ready().await.map_err(|e| {
            self.set_state(ConnectivityState::TransientFailure);
            Error::connection(format!("{} not ready: {e}", self.address))
        })
    }

    /// Record transport-level failures so the pool stops reusing us.
    fn observe(&self, status: &Status) {
        if status.code() == tonic::Code::Unavailable {
            self.set_state(ConnectivityState::TransientFailure);
        }
    }
}

fn request_with_metadata<T>(ctx: &Context, req: &Request, msg: T) -> tonic::Request<T> {
    let mut request = tonic::Request::new(msg);
    let md = request.metadata_mut();
    for (k, v) in ctx.metadata() {
        match (MetadataKey::from_str(&k.to_ascii_lowercase()), MetadataValue::try_from(v.as_str())) {
            (Ok(key), Ok(value)) => {
                md.insert(key, value);
            }
            _ => debug!(key = %k, "skipping invalid metadata"),
        }
    }
    if let Ok(value) = MetadataValue::try_from(req.content_type()) {
        md.insert("x-content-type", value);
    }
    request
}

fn path(req: &Request) -> Result<PathAndQuery> {
    let path = grpc_path(req.service(), req.endpoint());
    PathAndQuery::try_from(path.as_str())
        .map_err(|e| Error::internal(req.service(), format!("invalid endpoint {path:?}: {e}")))
}

#[async_trait]
impl Connection for GrpcConnection {
    fn state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn invoke(&self, ctx: &Context, req: &Request, timeout: Duration) -> Result<Bytes> {
        let mut grpc = self.client()?;
        self.ready(&mut grpc).await?;

        let mut request = request_with_metadata(ctx, req, req.body().clone());
        request.set_timeout(timeout);

        match grpc.unary(request, path(req)?, RawCodec).await {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => {
                self.observe(&status);
                Err(status.into())
            }
        }
    }

    async fn stream(&self, ctx: &Context, req: &Request) -> Result<Box<dyn TransportStream>> {
        let mut grpc = self.client()?;
        self.ready(&mut grpc).await?;

        let (tx, rx) = mpsc::channel::<Bytes>(16);
        let request = request_with_metadata(ctx, req, ReceiverStream::new(rx));

        match grpc.streaming(request, path(req)?, RawCodec).await {
            Ok(response) => Ok(Box::new(GrpcStream {
                tx: Some(tx),
                inbound: response.into_inner(),
            })),
            Err(status) => {
                self.observe(&status);
                Err(status.into())
            }
        }
    }

    fn close(&self) {
        debug!("Closing connection to {}", self.address);
        self.set_state(ConnectivityState::Shutdown);
        self.channel.lock().take();
    }
}

struct GrpcStream {
    tx: Option<mpsc::Sender<Bytes>>,
    inbound: tonic::Streaming<Bytes>,
}

#[async_trait]
impl TransportStream for GrpcStream {
    async fn send(&mut self, msg: Bytes) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::connection("stream send side closed"))?;
        tx.send(msg)
            .await
            .map_err(|_| Error::connection("stream closed by peer"))
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        Ok(self.inbound.message().await?)
    }

    fn close_send(&mut self) {
        self.tx.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_paths() {
        assert_eq!(grpc_path("greeter", "Greeter.Hello"), "/greeter.Greeter/Hello");
        assert_eq!(grpc_path("", "Greeter.Hello"), "/Greeter/Hello");
        assert_eq!(grpc_path("greeter", "/pkg.Svc/Call"), "/pkg.Svc/Call");
        assert_eq!(grpc_path("greeter", "Hello"), "Hello");
    }

    #[test]
    fn state_encoding_roundtrips() {
        for state in [
            ConnectivityState::Idle,
            ConnectivityState::Connecting,
            ConnectivityState::Ready,
            ConnectivityState::TransientFailure,
            ConnectivityState::Shutdown,
        ] {
            assert_eq!(ConnectivityState::from_u8(state.as_u8()), state);
        }
    }

    #[tokio::test]
    async fn dial_refused_is_a_connection_error() {
        let opts = DialOptions {
            timeout: Duration::from_millis(200),
        };
        // Port 1 on loopback is reliably closed.
        let res = GrpcTransport::new().dial("127.0.0.1:1", &opts).await;
        assert!(matches!(res, Err(Error::Connection(_))));
    }
}
