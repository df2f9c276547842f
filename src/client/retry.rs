//! Retry predicates.

use super::Request;
use crate::context::Context;
use crate::{Error, Result};

/// Retry any error except timeouts and cancellation.
pub fn on_error(_ctx: &Context, _req: &Request, _attempt: u32, err: &Error) -> Result<bool> {
    Ok(err.is_retryable())
}

/// Never retry.
pub fn never(_ctx: &Context, _req: &Request, _attempt: u32, _err: &Error) -> Result<bool> {
    Ok(false)
}
