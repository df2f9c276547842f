use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::body::Body;
use tonic::codegen::{http, BoxFuture, Service};
use tonic::server::{NamedService, UnaryService};
use tonic::{Request as TonicRequest, Response as TonicResponse, Status};
use vine_rpc::registry::mdns::LocalTransport;
use vine_rpc::transport::grpc::RawCodec;
use vine_rpc::transport::{ConnectivityState, DialOptions, GrpcTransport, Transport};
use vine_rpc::{
    CallOptions, Context, Error, MdnsOptions, MdnsRegistry, Node, Registry, Request, Runtime,
    Service as VineService,
};

/// Raw echo service mounted at `/greeter.Greeter/*`.
#[derive(Clone)]
struct Echo;

impl NamedService for Echo {
    const NAME: &'static str = "greeter.Greeter";
}

struct EchoUnary;

impl UnaryService<Bytes> for EchoUnary {
    type Response = Bytes;
    type Future = BoxFuture<TonicResponse<Bytes>, Status>;

    fn call(&mut self, request: TonicRequest<Bytes>) -> Self::Future {
        Box::pin(async move {
            let body = request.into_inner();
            if body.as_ref() == b"fail" {
                return Err(Status::invalid_argument("asked to fail"));
            }
            Ok(TonicResponse::new(body))
        })
    }
}

impl Service<http::Request<Body>> for Echo {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        Box::pin(async move {
            let mut grpc = tonic::server::Grpc::new(RawCodec);
            Ok(grpc.unary(EchoUnary, req).await)
        })
    }
}

async fn spawn_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(Echo)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    addr.to_string()
}

#[test_log::test(tokio::test)]
async fn test_grpc_transport_unary() {
    let addr = spawn_server().await;
    let conn = GrpcTransport::new()
        .dial(&addr, &DialOptions::default())
        .await
        .unwrap();
    assert_eq!(conn.state(), ConnectivityState::Ready);

    let req = Request::new("greeter", "Greeter.Hello", "hello");
    let body = conn
        .invoke(&Context::background(), &req, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(body.as_ref(), b"hello");

    let req = Request::new("greeter", "Greeter.Hello", "fail");
    let err = conn
        .invoke(&Context::background(), &req, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Status(ref s) if s.code() == tonic::Code::InvalidArgument));

    conn.close();
    assert_eq!(conn.state(), ConnectivityState::Shutdown);
    assert!(conn
        .invoke(&Context::background(), &req, Duration::from_secs(5))
        .await
        .is_err());
}

#[test_log::test(tokio::test)]
async fn test_runtime_over_grpc() -> anyhow::Result<()> {
    let addr = spawn_server().await;

    let zone = LocalTransport::new();
    let registry = Arc::new(MdnsRegistry::with_transport(
        MdnsOptions::default(),
        Arc::new(zone),
    ));
    registry
        .register(&VineService::new("greeter", "1.0.0").with_node(Node::new("greeter-1", &addr)))
        .await?;

    let runtime = Runtime::builder().registry(registry).build()?;
    let req = runtime
        .client()
        .new_request("greeter", "Greeter.Hello", Bytes::from_static(b"{\"n\":1}"));
    let rsp = runtime
        .client()
        .call(&Context::background(), &req, CallOptions::default())
        .await?;
    assert_eq!(rsp.body().as_ref(), b"{\"n\":1}");

    // Remote statuses are returned as-is.
    let req = Request::new("greeter", "Greeter.Hello", "fail");
    let err = runtime
        .client()
        .call(&Context::background(), &req, CallOptions::default().retries(0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Status(_)));

    runtime.shutdown().await?;
    Ok(())
}
