//! Request-scoped deadline and cancellation.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a [`Context`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Done {
    /// The deadline passed.
    DeadlineExceeded,
    /// The context was cancelled explicitly.
    Cancelled,
}

impl std::fmt::Display for Done {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Done::DeadlineExceeded => f.write_str("context deadline exceeded"),
            Done::Cancelled => f.write_str("context canceled"),
        }
    }
}

/// Carries a deadline, a cancellation signal and request metadata.
///
/// Children share the parent's token through [`CancellationToken::child_token`],
/// so cancelling a parent cancels every context derived from it.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    token: CancellationToken,
    metadata: HashMap<String, String>,
}

impl Context {
    /// An empty context with no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context that expires after `timeout`.
    ///
    /// An existing earlier deadline is kept.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context that expires at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            token: self.token.child_token(),
            metadata: self.metadata.clone(),
        }
    }

    /// Derive a context that is cancelled with its parent or by its own token.
    pub fn with_cancel(&self) -> Self {
        Self {
            deadline: self.deadline,
            token: self.token.child_token(),
            metadata: self.metadata.clone(),
        }
    }

    /// Derive a cancellable context that drops the parent's deadline.
    ///
    /// Long-lived streams use this so a request deadline does not cut them off.
    pub fn without_deadline(&self) -> Self {
        Self {
            deadline: None,
            token: self.token.child_token(),
            metadata: self.metadata.clone(),
        }
    }

    /// Attach a metadata key.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Request metadata.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Cancel this context and all contexts derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The cancellation token backing this context.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns why the context finished, or `None` while it is still live.
    pub fn err(&self) -> Option<Done> {
        if self.token.is_cancelled() {
            return Some(Done::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(Done::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Done {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => Done::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => Done::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                Done::Cancelled
            }
        }
    }
}
