//! Single-slot reuse cache for closed sessions
//!
//! Holding a session keeps its engine context, and therefore its KV cache,
//! alive for the next prediction. The mutex only covers the hand-off; a session
//! taken out of the pool is exclusively owned by its caller.
//!
//! Every pooled session is tagged with the [`OwnerId`] of the model that created
//! it. A pool shared between models never hands one model's context to another.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::inference::engine::EngineContext;
use crate::inference::session::Session;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Identity of the model a session was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    /// A process-unique id.
    pub fn next() -> Self {
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

struct Pooled<C: EngineContext> {
    owner: OwnerId,
    session: Session<C>,
}

pub struct SessionPool<C: EngineContext> {
    slot: Mutex<Option<Pooled<C>>>,
}

impl<C: EngineContext> SessionPool<C> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Pooled<C>>> {
        // A panic while holding the lock cannot leave the slot half-written.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes and returns the pooled session if `owner` created it.
    ///
    /// A session belonging to another owner is freed instead, so the slot is
    /// always empty afterwards.
    pub fn take(&self, owner: OwnerId) -> Option<Session<C>> {
        let pooled = self.lock().take()?;
        if pooled.owner != owner {
            tracing::debug!("freeing session pooled by another model");
            pooled.session.free();
            return None;
        }
        tracing::debug!(history = pooled.session.history().len(), "reusing pooled session");
        Some(pooled.session)
    }

    /// Stores `session` for `owner`, freeing the previous occupant.
    pub fn put(&self, owner: OwnerId, session: Session<C>) {
        tracing::debug!(history = session.history().len(), "pooling session");
        let evicted = self.lock().replace(Pooled { owner, session });
        if let Some(evicted) = evicted {
            tracing::debug!("evicting previously pooled session");
            evicted.session.free();
        }
    }

    /// Frees the pooled session if `owner` created it.
    pub fn release(&self, owner: OwnerId) {
        let evicted = {
            let mut slot = self.lock();
            match slot.as_ref() {
                Some(pooled) if pooled.owner == owner => slot.take(),
                _ => None,
            }
        };
        if let Some(evicted) = evicted {
            evicted.session.free();
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.lock().is_some()
    }

    /// True when the pooled session was created by `owner`.
    pub fn is_held_by(&self, owner: OwnerId) -> bool {
        self.lock().as_ref().is_some_and(|pooled| pooled.owner == owner)
    }
}

impl<C: EngineContext> Default for SessionPool<C> {
    fn default() -> Self {
        Self::new()
    }
}
