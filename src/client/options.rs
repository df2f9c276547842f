//! Client and per-call options.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::{backoff, retry, Request};
use crate::context::Context;
use crate::pool::PoolOptions;
use crate::selector::SelectOptions;
use crate::{Error, Result};

/// Computes the delay before attempt `n` (zero-based).
pub type BackoffFn = Arc<dyn Fn(&Context, &Request, u32) -> Result<Duration> + Send + Sync>;

/// Decides whether a failed attempt should be retried.
///
/// `Err` aborts the call with that error.
pub type RetryFn = Arc<dyn Fn(&Context, &Request, u32, &Error) -> Result<bool> + Send + Sync>;

/// Content type used when a request does not set one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Client-wide configuration.
#[derive(Clone)]
pub struct ClientOptions {
    /// Default request content type.
    pub content_type: String,
    /// Retries after the first attempt.
    pub retries: u32,
    /// Connect timeout for new connections.
    pub dial_timeout: Duration,
    /// Deadline applied when the caller's context has none.
    pub request_timeout: Duration,
    /// Backoff policy.
    pub backoff: BackoffFn,
    /// Retry policy.
    pub retry: RetryFn,
    /// Connection pool limits.
    pub pool: PoolOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            retries: 1,
            dial_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            backoff: Arc::new(backoff::exponential),
            retry: Arc::new(retry::on_error),
            pool: PoolOptions::default(),
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("content_type", &self.content_type)
            .field("retries", &self.retries)
            .field("dial_timeout", &self.dial_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl ClientOptions {
    /// Set the default content type.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Set the number of retries.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the dial timeout.
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the backoff policy.
    pub fn backoff<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, &Request, u32) -> Result<Duration> + Send + Sync + 'static,
    {
        self.backoff = Arc::new(f);
        self
    }

    /// Set the retry policy.
    pub fn retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, &Request, u32, &Error) -> Result<bool> + Send + Sync + 'static,
    {
        self.retry = Arc::new(f);
        self
    }

    /// Set the pool limits.
    pub fn pool(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }

    pub(crate) fn resolve(&self, call: &CallOptions) -> CallSettings {
        CallSettings {
            retries: call.retries.unwrap_or(self.retries),
            dial_timeout: call.dial_timeout.unwrap_or(self.dial_timeout),
            request_timeout: call.request_timeout.unwrap_or(self.request_timeout),
            backoff: call.backoff.clone().unwrap_or_else(|| self.backoff.clone()),
            retry: call.retry.clone().unwrap_or_else(|| self.retry.clone()),
        }
    }
}

/// Per-call overrides of [`ClientOptions`].
#[derive(Clone, Default)]
pub struct CallOptions {
    /// Skip discovery and call one of these addresses.
    pub address: Vec<String>,
    /// Override the retry count.
    pub retries: Option<u32>,
    /// Override the backoff policy.
    pub backoff: Option<BackoffFn>,
    /// Override the retry policy.
    pub retry: Option<RetryFn>,
    /// Override the dial timeout.
    pub dial_timeout: Option<Duration>,
    /// Override the request timeout.
    pub request_timeout: Option<Duration>,
    /// Filters and strategy passed to the selector.
    pub select_options: SelectOptions,
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("address", &self.address)
            .field("retries", &self.retries)
            .field("dial_timeout", &self.dial_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("select_options", &self.select_options)
            .finish_non_exhaustive()
    }
}

impl CallOptions {
    /// Call `address` directly. May be given several times.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address.push(address.into());
        self
    }

    /// Override the retry count.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Override the backoff policy.
    pub fn backoff<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, &Request, u32) -> Result<Duration> + Send + Sync + 'static,
    {
        self.backoff = Some(Arc::new(f));
        self
    }

    /// Override the retry policy.
    pub fn retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, &Request, u32, &Error) -> Result<bool> + Send + Sync + 'static,
    {
        self.retry = Some(Arc::new(f));
        self
    }

    /// Override the dial timeout.
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    /// Override the request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the selector options.
    pub fn select_options(mut self, opts: SelectOptions) -> Self {
        self.select_options = opts;
        self
    }
}

/// Options resolved for one call.
#[derive(Clone)]
pub(crate) struct CallSettings {
    pub retries: u32,
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
    pub backoff: BackoffFn,
    pub retry: RetryFn,
}

/// Options for [`Client::publish`](super::Client::publish).
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Publish to this exchange instead of the message topic.
    pub exchange: Option<String>,
}

impl PublishOptions {
    /// Publish to `exchange`.
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = ClientOptions::default();
        assert_eq!(opts.retries, 1);
        assert_eq!(opts.dial_timeout, Duration::from_secs(30));
        assert_eq!(opts.request_timeout, Duration::from_secs(30));
        assert_eq!(opts.content_type, "application/json");
        assert_eq!(opts.pool.size, 100);
        assert_eq!(opts.pool.max_streams, 20);
    }

    #[test]
    fn call_options_override() {
        let opts = ClientOptions::default().retries(3);
        let settings = opts.resolve(&CallOptions::default());
        assert_eq!(settings.retries, 3);

        let call = CallOptions::default()
            .retries(0)
            .request_timeout(Duration::from_secs(1));
        let settings = opts.resolve(&call);
        assert_eq!(settings.retries, 0);
        assert_eq!(settings.request_timeout, Duration::from_secs(1));
        assert_eq!(settings.dial_timeout, Duration::from_secs(30));
    }
}
