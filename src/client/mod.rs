//! RPC client and call executor.
//!
//! A call resolves a [`Next`] from the selector (or from an address
//! override), then runs up to `retries + 1` attempts. Each attempt backs
//! off, picks a node, leases a pooled connection, invokes the transport and
//! reports the outcome through [`Selector::mark`]. Attempts run as tasks
//! raced against the caller's [`Context`]; when the context finishes first
//! the attempt is aborted and a timeout error returned.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::broker::{Broker, BrokerMessage, CONTENT_TYPE_HEADER, TOPIC_HEADER};
use crate::context::Context;
use crate::error::CLIENT_ID;
use crate::pool::{Pool, PooledConn};
use crate::registry::Node;
use crate::selector::{self, Next, Selector};
use crate::transport::{Connection, DialOptions, Transport};
use crate::{Error, Result};

pub mod backoff;
pub mod options;
pub mod retry;
mod stream;

pub use options::{
    BackoffFn, CallOptions, ClientOptions, PublishOptions, RetryFn, DEFAULT_CONTENT_TYPE,
};
pub use stream::ClientStream;

use options::CallSettings;

/// A request to one endpoint of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    service: String,
    endpoint: String,
    content_type: String,
    body: Bytes,
}

impl Request {
    /// Create a request with the default content type.
    pub fn new(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            service: service.into(),
            endpoint: endpoint.into(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            body: body.into(),
        }
    }

    /// Create a request with a JSON-encoded body.
    pub fn json<T: Serialize>(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        body: &T,
    ) -> Result<Self> {
        Ok(Self::new(service, endpoint, serde_json::to_vec(body)?))
    }

    /// Set the content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Target service.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Target endpoint, e.g. `Greeter.Hello`.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Payload content type.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Encoded payload.
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Reply to a unary call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    content_type: String,
    body: Bytes,
}

impl Response {
    /// Payload content type.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Encoded payload.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Take the payload.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Decode a JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// A message published to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    content_type: String,
    payload: Bytes,
}

impl Message {
    /// Create a message with the default content type.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            payload: payload.into(),
        }
    }

    /// Set the content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Payload content type.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Encoded payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// Calls services.
#[async_trait]
pub trait Client: Send + Sync + 'static {
    /// Client configuration.
    fn options(&self) -> &ClientOptions;

    /// Build a request using the client's default content type.
    fn new_request(&self, service: &str, endpoint: &str, body: Bytes) -> Request {
        Request::new(service, endpoint, body).with_content_type(self.options().content_type.clone())
    }

    /// Build a message using the client's default content type.
    fn new_message(&self, topic: &str, payload: Bytes) -> Message {
        Message::new(topic, payload).with_content_type(self.options().content_type.clone())
    }

    /// Make a unary call.
    async fn call(&self, ctx: &Context, req: &Request, opts: CallOptions) -> Result<Response>;

    /// Open a bidirectional stream.
    async fn stream(&self, ctx: &Context, req: &Request, opts: CallOptions) -> Result<ClientStream>;

    /// Publish a message through the configured broker.
    async fn publish(&self, ctx: &Context, msg: &Message, opts: PublishOptions) -> Result<()>;

    /// Release pooled connections.
    async fn close(&self) -> Result<()>;

    /// Implementation name.
    fn name(&self) -> &'static str;
}

/// Client over a [`Selector`], a [`Pool`] and an optional [`Broker`].
pub struct RpcClient {
    opts: ClientOptions,
    selector: Arc<dyn Selector>,
    pool: Arc<Pool>,
    broker: Option<Arc<dyn Broker>>,
    broker_ready: OnceCell<()>,
}

impl RpcClient {
    /// Create a client dialing through `transport`.
    pub fn new(
        opts: ClientOptions,
        selector: Arc<dyn Selector>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let pool = Arc::new(Pool::new(opts.pool.clone(), transport));
        Self {
            opts,
            selector,
            pool,
            broker: None,
            broker_ready: OnceCell::new(),
        }
    }

    /// Publish through `broker`.
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// The selector used to pick nodes.
    pub fn selector(&self) -> &Arc<dyn Selector> {
        &self.selector
    }

    /// The connection pool.
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    async fn next(&self, req: &Request, opts: &CallOptions) -> Result<Next> {
        if !opts.address.is_empty() {
            return Ok(selector::static_next(&opts.address));
        }
        self.selector
            .select(req.service(), opts.select_options.clone())
            .await
            .map_err(|e| selection_error(req.service(), e))
    }

    /// Run the attempt loop.
    async fn execute(
        &self,
        ctx: &Context,
        req: &Request,
        next: Next,
        settings: CallSettings,
        kind: Kind,
    ) -> Result<Outcome> {
        if let Some(done) = ctx.err() {
            return Err(Error::timeout(CLIENT_ID, done));
        }

        let mut last = None;
        for i in 0..=settings.retries {
            let attempt = Attempt {
                ctx: ctx.clone(),
                req: req.clone(),
                next: Arc::clone(&next),
                selector: Arc::clone(&self.selector),
                pool: Arc::clone(&self.pool),
                settings: settings.clone(),
                kind,
            };
            let mut handle = tokio::spawn(attempt.run(i));

            let result = tokio::select! {
                done = ctx.done() => {
                    handle.abort();
                    return Err(Error::timeout(CLIENT_ID, format!("call timeout: {done}")));
                }
                joined = &mut handle => joined
                    .map_err(|e| Error::internal(CLIENT_ID, format!("attempt {i} aborted: {e}")))?,
            };

            let err = match result {
                Ok(outcome) => return Ok(outcome),
                Err(Failure::Terminal(e)) => return Err(e),
                Err(Failure::Retryable(e)) => e,
            };
            match (settings.retry)(ctx, req, i, &err) {
                Err(e) => return Err(e),
                Ok(false) => return Err(err),
                Ok(true) => {
                    debug!(service = %req.service(), attempt = i, error = %err, "retrying call");
                    last = Some(err);
                }
            }
        }

        Err(last.unwrap_or_else(|| Error::internal(CLIENT_ID, "no attempts made")))
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("opts", &self.opts)
            .field("selector", &self.selector.name())
            .field("broker", &self.broker.as_ref().map(|b| b.name()))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Client for RpcClient {
    fn options(&self) -> &ClientOptions {
        &self.opts
    }

    async fn call(&self, ctx: &Context, req: &Request, opts: CallOptions) -> Result<Response> {
        let mut settings = self.opts.resolve(&opts);
        let next = self.next(req, &opts).await?;

        let ctx = match ctx.remaining() {
            Some(remaining) => {
                settings.request_timeout = remaining;
                ctx.clone()
            }
            None => ctx.with_timeout(settings.request_timeout),
        };

        match self.execute(&ctx, req, next, settings, Kind::Unary).await? {
            Outcome::Reply(body) => Ok(Response {
                content_type: req.content_type().to_string(),
                body,
            }),
            Outcome::Stream(_) => Err(Error::internal(CLIENT_ID, "unexpected stream reply")),
        }
    }

    async fn stream(&self, ctx: &Context, req: &Request, opts: CallOptions) -> Result<ClientStream> {
        let settings = self.opts.resolve(&opts);
        let next = self.next(req, &opts).await?;

        match self.execute(ctx, req, next, settings, Kind::Stream).await? {
            Outcome::Stream(stream) => Ok(stream),
            Outcome::Reply(_) => Err(Error::internal(CLIENT_ID, "unexpected unary reply")),
        }
    }

    async fn publish(&self, ctx: &Context, msg: &Message, opts: PublishOptions) -> Result<()> {
        let broker = self
            .broker
            .as_ref()
            .ok_or_else(|| Error::internal(CLIENT_ID, "no broker configured"))?;

        self.broker_ready
            .get_or_try_init(|| broker.connect())
            .await
            .map_err(|e| Error::internal(CLIENT_ID, e))?;

        let mut header = ctx.metadata().clone();
        header.insert(CONTENT_TYPE_HEADER.to_string(), msg.content_type().to_string());
        header.insert(TOPIC_HEADER.to_string(), msg.topic().to_string());

        let topic = opts.exchange.as_deref().unwrap_or(msg.topic());
        trace!(topic, "publishing message");
        broker
            .publish(
                ctx,
                topic,
                BrokerMessage {
                    header,
                    body: msg.payload().clone(),
                },
            )
            .await
    }

    async fn close(&self) -> Result<()> {
        self.pool.close();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "rpc"
    }
}

fn selection_error(service: &str, err: Error) -> Error {
    match err {
        Error::NotFound => Error::internal(CLIENT_ID, format!("service {service}: {err}")),
        _ => Error::internal(CLIENT_ID, format!("error selecting {service} node: {err}")),
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Unary,
    Stream,
}

enum Outcome {
    Reply(Bytes),
    Stream(ClientStream),
}

enum Failure {
    /// Stop without consulting the retry policy.
    Terminal(Error),
    Retryable(Error),
}

/// Everything one attempt needs, owned so it can run as its own task.
struct Attempt {
    ctx: Context,
    req: Request,
    next: Next,
    selector: Arc<dyn Selector>,
    pool: Arc<Pool>,
    settings: CallSettings,
    kind: Kind,
}

impl Attempt {
    async fn run(self, i: u32) -> std::result::Result<Outcome, Failure> {
        let delay = (self.settings.backoff)(&self.ctx, &self.req, i).map_err(|e| {
            Failure::Terminal(Error::internal(CLIENT_ID, format!("backoff error: {e}")))
        })?;
        if !delay.is_zero() {
            trace!(attempt = i, ?delay, "backing off");
            tokio::time::sleep(delay).await;
        }

        let service = self.req.service();
        let node = (self.next)().map_err(|e| Failure::Terminal(selection_error(service, e)))?;

        let result = self.invoke(&node).await;
        self.selector.mark(service, &node, result.as_ref().err());
        result.map_err(Failure::Retryable)
    }

    async fn invoke(&self, node: &Node) -> Result<Outcome> {
        let dial = DialOptions {
            timeout: self.settings.dial_timeout,
        };
        let conn = self
            .pool
            .get_conn(&node.address, &dial)
            .await
            .map_err(|e| self.wrap(node, "error sending request", e))?;
        let lease = Lease::new(Arc::clone(&self.pool), conn);

        match self.kind {
            Kind::Unary => {
                let result = lease
                    .conn()
                    .invoke(&self.ctx, &self.req, self.settings.request_timeout)
                    .await
                    .map_err(|e| self.wrap(node, "error calling endpoint", e));
                lease.release(result.as_ref().err());
                result.map(Outcome::Reply)
            }
            Kind::Stream => {
                let ctx = self.ctx.without_deadline();
                match lease.conn().stream(&ctx, &self.req).await {
                    Ok(inner) => Ok(Outcome::Stream(ClientStream::new(
                        self.req.clone(),
                        ctx,
                        inner,
                        Arc::clone(&self.pool),
                        lease.into_inner(),
                    ))),
                    Err(e) => {
                        let e = self.wrap(node, "error creating stream", e);
                        lease.release(Some(&e));
                        Err(e)
                    }
                }
            }
        }
    }

    /// Local transport failures become internal errors naming the service
    /// and node; remote statuses and timeouts pass through.
    fn wrap(&self, node: &Node, what: &str, err: Error) -> Error {
        match err {
            Error::Status(_) | Error::Timeout { .. } | Error::Internal { .. } => err,
            _ => Error::internal(
                CLIENT_ID,
                format!("{what} to {} node {}: {err}", self.req.service(), node.id),
            ),
        }
    }
}

/// Returns a leased connection to the pool, even when the attempt is
/// aborted mid-flight.
struct Lease {
    pool: Arc<Pool>,
    conn: Arc<dyn Connection>,
    pooled: Option<PooledConn>,
}

impl Lease {
    fn new(pool: Arc<Pool>, pooled: PooledConn) -> Self {
        Self {
            pool,
            conn: Arc::clone(pooled.conn()),
            pooled: Some(pooled),
        }
    }

    fn conn(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    fn release(mut self, err: Option<&Error>) {
        if let Some(pc) = self.pooled.take() {
            self.pool.release(pc, err);
        }
    }

    fn into_inner(mut self) -> Option<PooledConn> {
        self.pooled.take()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(pc) = self.pooled.take() {
            let err = Error::timeout(CLIENT_ID, "attempt abandoned");
            self.pool.release(pc, Some(&err));
        }
    }
}
