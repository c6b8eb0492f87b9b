//! KV cache editing
//!
//! Thin wrappers over the engine's position-indexed cache. Callers must remove
//! discarded ranges before shifting retained ones: a shift onto positions that
//! are still occupied corrupts the cache and cannot be undone.

use crate::inference::engine::{EngineContext, EngineError, DEFAULT_SEQUENCE};

/// Evicts positions `[start, stop)`; `stop == None` evicts to the end.
pub fn remove_range<C: EngineContext + ?Sized>(
    ctx: &mut C,
    start: usize,
    stop: Option<usize>,
) -> Result<(), EngineError> {
    if matches!(stop, Some(stop) if stop <= start) {
        return Ok(());
    }
    tracing::trace!(start, ?stop, "removing cache range");
    ctx.cache_remove(DEFAULT_SEQUENCE, start, stop)
}

/// Renumbers positions `[start, stop)` by `delta`.
pub fn shift_range<C: EngineContext + ?Sized>(
    ctx: &mut C,
    start: usize,
    stop: usize,
    delta: isize,
) -> Result<(), EngineError> {
    if delta == 0 || stop <= start {
        return Ok(());
    }
    tracing::trace!(start, stop, delta, "shifting cache range");
    ctx.cache_shift(DEFAULT_SEQUENCE, start, stop, delta)
}
