//! Backoff policies.

use std::time::Duration;

use super::Request;
use crate::context::Context;
use crate::Result;

/// Exponential backoff: no delay for the first attempt, then
/// `100ms * floor(attempt^e)`.
pub fn exponential(_ctx: &Context, _req: &Request, attempt: u32) -> Result<Duration> {
    if attempt == 0 {
        return Ok(Duration::ZERO);
    }
    let factor = f64::from(attempt).powf(std::f64::consts::E) as u64;
    Ok(Duration::from_millis(100).saturating_mul(factor.min(u64::from(u32::MAX)) as u32))
}

/// No delay between attempts.
pub fn none(_ctx: &Context, _req: &Request, _attempt: u32) -> Result<Duration> {
    Ok(Duration::ZERO)
}
