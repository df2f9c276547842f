use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::timeout;
use vine_rpc::client::backoff;
use vine_rpc::registry::mdns::LocalTransport;
use vine_rpc::registry::{Action, Endpoint, WatchOptions};
use vine_rpc::selector::{filter, Next, SelectorOptions};
use vine_rpc::transport::{
    Connection, ConnectivityState, DialOptions, Transport, TransportStream,
};
use vine_rpc::{
    CallOptions, ClientOptions, Context, Error, MdnsOptions, MdnsRegistry, Node, Registry,
    RegistrySelector, Request, Runtime, SelectOptions, Selector, Service,
};

/// Echoes bodies back, or fails every call when `fail` is set.
struct EchoTransport {
    fail: bool,
    dials: AtomicUsize,
    calls: Arc<AtomicUsize>,
}

impl EchoTransport {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            fail,
            dials: AtomicUsize::new(0),
            calls: Arc::new(AtomicUsize::new(0)),
        })
    }
}

struct EchoConn {
    fail: bool,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Connection for EchoConn {
    fn state(&self) -> ConnectivityState {
        ConnectivityState::Ready
    }

    async fn invoke(
        &self,
        _ctx: &Context,
        req: &Request,
        _timeout: Duration,
    ) -> vine_rpc::Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(tonic::Status::unavailable("node is down").into());
        }
        Ok(req.body().clone())
    }

    async fn stream(
        &self,
        _ctx: &Context,
        _req: &Request,
    ) -> vine_rpc::Result<Box<dyn TransportStream>> {
        Err(tonic::Status::unimplemented("no streams").into())
    }

    fn close(&self) {}
}

#[async_trait]
impl Transport for EchoTransport {
    async fn dial(&self, _address: &str, _opts: &DialOptions) -> vine_rpc::Result<Arc<dyn Connection>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(EchoConn {
            fail: self.fail,
            calls: Arc::clone(&self.calls),
        }))
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

/// Delegates to a registry selector and counts marks.
struct CountingSelector {
    inner: RegistrySelector,
    marks: AtomicUsize,
}

#[async_trait]
impl Selector for CountingSelector {
    fn init(&mut self, opts: SelectorOptions) -> vine_rpc::Result<()> {
        self.inner.init(opts)
    }

    fn options(&self) -> &SelectorOptions {
        self.inner.options()
    }

    async fn select(&self, service: &str, opts: SelectOptions) -> vine_rpc::Result<Next> {
        self.inner.select(service, opts).await
    }

    fn mark(&self, service: &str, node: &Node, err: Option<&Error>) {
        self.marks.fetch_add(1, Ordering::SeqCst);
        self.inner.mark(service, node, err);
    }

    fn reset(&self, service: &str) {
        self.inner.reset(service);
    }

    async fn close(&self) -> vine_rpc::Result<()> {
        self.inner.close().await
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

fn local_registry(zone: &LocalTransport) -> Arc<MdnsRegistry> {
    Arc::new(MdnsRegistry::with_transport(
        MdnsOptions::default(),
        Arc::new(zone.clone()),
    ))
}

fn greeter(id: &str, address: &str, version: &str) -> Service {
    Service::new("greeter", version)
        .with_endpoint(Endpoint::named("Greeter.Hello"))
        .with_node(Node::new(id, address).with_metadata("zone", "a"))
}

#[test_log::test(tokio::test)]
async fn test_runtime_call_through_discovery() {
    let zone = LocalTransport::new();
    let server_side = local_registry(&zone);
    server_side
        .register(&greeter("greeter-1", "10.1.0.1:9000", "1.0.0"))
        .await
        .unwrap();

    let transport = EchoTransport::new(false);
    let runtime = Runtime::builder()
        .registry(local_registry(&zone))
        .transport(transport.clone())
        .build()
        .unwrap();

    let client = runtime.client();
    let req = Request::json("greeter", "Greeter.Hello", &serde_json::json!({"name": "vine"}))
        .unwrap();
    let rsp = client
        .call(&Context::background(), &req, CallOptions::default())
        .await
        .unwrap();
    let body: serde_json::Value = rsp.json().unwrap();
    assert_eq!(body["name"], "vine");

    // Second call reuses the pooled connection.
    client
        .call(&Context::background(), &req, CallOptions::default())
        .await
        .unwrap();
    assert_eq!(transport.dials.load(Ordering::SeqCst), 1);

    runtime.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_filters_reach_the_selector() {
    let zone = LocalTransport::new();
    let registry = local_registry(&zone);
    registry
        .register(&greeter("greeter-1", "10.1.0.1:9000", "1.0.0"))
        .await
        .unwrap();

    let runtime = Runtime::builder()
        .registry(registry)
        .transport(EchoTransport::new(false))
        .build()
        .unwrap();
    let req = Request::new("greeter", "Greeter.Hello", "{}");

    let opts = CallOptions::default()
        .select_options(SelectOptions::default().with_filter(filter::version("2.0.0")));
    let err = runtime
        .client()
        .call(&Context::background(), &req, opts)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Internal { .. }));
    assert!(err.to_string().contains("none available"));
}

#[test_log::test(tokio::test)]
async fn test_watcher_fan_out() {
    let zone = LocalTransport::new();
    let registry = local_registry(&zone);

    let mut greeter_watch = registry.watch(WatchOptions::service("greeter")).await.unwrap();
    let mut billing_watch = registry.watch(WatchOptions::service("billing")).await.unwrap();
    // Let the shared listener subscribe.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let service = greeter("greeter-1", "10.1.0.1:9000", "1.0.0");
    registry.register(&service).await.unwrap();

    let event = timeout(Duration::from_secs(1), greeter_watch.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.action, Action::Create);
    assert_eq!(event.service.name, "greeter");
    assert_eq!(event.service.version, "1.0.0");
    assert_eq!(event.service.nodes[0].id, "greeter-1");
    assert_eq!(event.service.nodes[0].address, "10.1.0.1:9000");

    assert!(timeout(Duration::from_millis(100), billing_watch.next())
        .await
        .is_err());

    registry.deregister(&service).await.unwrap();
    let event = timeout(Duration::from_secs(1), greeter_watch.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.action, Action::Delete);
    assert_eq!(event.service.nodes[0].id, "greeter-1");

    greeter_watch.stop();
    billing_watch.stop();
}

#[test_log::test(tokio::test)]
async fn test_retry_exhaustion_marks_every_attempt() {
    let zone = LocalTransport::new();
    let registry = local_registry(&zone);
    registry
        .register(&greeter("greeter-1", "10.1.0.1:9000", "1.0.0"))
        .await
        .unwrap();

    let selector = Arc::new(CountingSelector {
        inner: RegistrySelector::new(registry.clone()),
        marks: AtomicUsize::new(0),
    });
    let transport = EchoTransport::new(true);
    let runtime = Runtime::builder()
        .registry(registry)
        .selector(selector.clone())
        .transport(transport.clone())
        .client_options(ClientOptions::default().backoff(backoff::none))
        .build()
        .unwrap();

    let req = Request::new("greeter", "Greeter.Hello", "{}");
    let err = runtime
        .client()
        .call(&Context::background(), &req, CallOptions::default().retries(2))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Status(ref s) if s.code() == tonic::Code::Unavailable));
    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    assert_eq!(selector.marks.load(Ordering::SeqCst), 3);
}

#[test_log::test(tokio::test)]
async fn test_cancellation_wins_over_backoff() {
    let runtime = Runtime::builder()
        .registry(local_registry(&LocalTransport::new()))
        .transport(EchoTransport::new(false))
        .client_options(
            ClientOptions::default().backoff(|_: &Context, _: &Request, _: u32| {
                Ok(Duration::from_secs(30))
            }),
        )
        .build()
        .unwrap();

    let ctx = Context::background().with_cancel();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let req = Request::new("greeter", "Greeter.Hello", "{}");
    let err = runtime
        .client()
        .call(&ctx, &req, CallOptions::default().address("10.1.0.1:9000"))
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test_log::test(tokio::test)]
async fn test_caller_deadline_bounds_the_call() {
    let runtime = Runtime::builder()
        .registry(local_registry(&LocalTransport::new()))
        .transport(EchoTransport::new(false))
        .client_options(
            ClientOptions::default().backoff(|_: &Context, _: &Request, _: u32| {
                Ok(Duration::from_secs(30))
            }),
        )
        .build()
        .unwrap();

    let ctx = Context::background().with_timeout(Duration::from_millis(50));
    let req = Request::new("greeter", "Greeter.Hello", "{}");
    let err = runtime
        .client()
        .call(&ctx, &req, CallOptions::default().address("10.1.0.1:9000"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
}

#[test_log::test(tokio::test)]
async fn test_list_services_after_register() {
    let zone = LocalTransport::new();
    let a = local_registry(&zone);
    let b = local_registry(&zone);

    a.register(&greeter("greeter-1", "10.1.0.1:9000", "1.0.0"))
        .await
        .unwrap();
    b.register(
        &Service::new("billing", "0.1.0").with_node(Node::new("billing-1", "10.1.0.2:9000")),
    )
    .await
    .unwrap();

    let mut names: Vec<_> = a
        .list_services()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["billing", "greeter"]);
}
