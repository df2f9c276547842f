//! Streaming half of the client: a leased connection wrapped in a message stream.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::Stream;
use tracing::trace;

use super::Request;
use crate::context::Context;
use crate::error::CLIENT_ID;
use crate::pool::{Pool, PooledConn};
use crate::transport::TransportStream;
use crate::{Error, Result};

/// A bidirectional stream opened by [`Client::stream`](super::Client::stream).
///
/// Holds its pooled connection until closed or dropped; the last error seen
/// on the stream decides whether the connection goes back into the pool.
pub struct ClientStream {
    req: Request,
    ctx: Context,
    inner: Box<dyn TransportStream>,
    pool: Arc<Pool>,
    conn: Option<PooledConn>,
    err: Option<Error>,
}

impl ClientStream {
    pub(crate) fn new(
        req: Request,
        ctx: Context,
        inner: Box<dyn TransportStream>,
        pool: Arc<Pool>,
        conn: Option<PooledConn>,
    ) -> Self {
        Self {
            req,
            ctx,
            inner,
            pool,
            conn,
            err: None,
        }
    }

    /// The request that opened the stream.
    pub fn request(&self) -> &Request {
        &self.req
    }

    /// The stream's context. Cancelling it ends the stream.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Last error observed on the stream.
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Send one message.
    pub async fn send(&mut self, msg: impl Into<Bytes>) -> Result<()> {
        let result = tokio::select! {
            biased;
            done = self.ctx.done() => Err(Error::timeout(CLIENT_ID, done)),
            res = self.inner.send(msg.into()) => res,
        };
        self.record(result)
    }

    /// Receive one message; `None` once the server finishes.
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        let result = tokio::select! {
            biased;
            done = self.ctx.done() => Err(Error::timeout(CLIENT_ID, done)),
            res = self.inner.recv() => res,
        };
        self.record(result)
    }

    /// Stop sending; receiving continues.
    pub fn close_send(&mut self) {
        self.inner.close_send();
    }

    /// Close the stream and return its connection to the pool.
    pub fn close(mut self) {
        self.finish();
    }

    /// Turn the receive side into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + Send {
        futures_util::stream::unfold(Some(self), |state| async move {
            let mut stream = state?;
            match stream.recv().await {
                Ok(Some(msg)) => Some((Ok(msg), Some(stream))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.err = Some(e.clone());
        }
        result
    }

    fn finish(&mut self) {
        self.inner.close_send();
        if let Some(conn) = self.conn.take() {
            trace!(service = %self.req.service(), "stream finished");
            self.ctx.cancel();
            self.pool.release(conn, self.err.as_ref());
        }
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        self.finish();
    }
}

impl fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStream")
            .field("service", &self.req.service())
            .field("endpoint", &self.req.endpoint())
            .field("err", &self.err)
            .finish_non_exhaustive()
    }
}
