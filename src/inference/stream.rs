//! Caller-facing handle on an active session.

use std::sync::Arc;

use crate::inference::engine::{EngineContext, Token};
use crate::inference::error::InferenceError;
use crate::inference::pool::{OwnerId, SessionPool};
use crate::inference::session::Session;

/// An in-progress prediction.
///
/// Call [`Stream::next`] until it returns an error; [`InferenceError::EndOfStream`]
/// marks normal completion. [`Stream::close`] hands the session back to the
/// model's pool for reuse; dropping the stream frees it instead.
pub struct Stream<C: EngineContext> {
    session: Session<C>,
    pool: Arc<SessionPool<C>>,
    owner: OwnerId,
}

impl<C: EngineContext> Stream<C> {
    pub(crate) fn new(session: Session<C>, pool: Arc<SessionPool<C>>, owner: OwnerId) -> Self {
        Self {
            session,
            pool,
            owner,
        }
    }

    /// Evaluates `lookahead`, then samples and returns one token.
    pub fn next(&mut self, lookahead: &[Token]) -> Result<Token, InferenceError> {
        self.session.next(lookahead)
    }

    /// Seed resolved for this prediction.
    pub fn seed(&self) -> u32 {
        self.session.seed()
    }

    pub fn history(&self) -> &[Token] {
        self.session.history()
    }

    pub fn headspace(&self) -> usize {
        self.session.headspace()
    }

    /// Returns the session to the pool, evicting the previous occupant.
    ///
    /// A session whose cache may have diverged from its history is freed instead.
    pub fn close(self) {
        let Stream {
            session,
            pool,
            owner,
        } = self;
        if session.is_poisoned() {
            tracing::warn!("closing a failed session, freeing it instead of pooling");
            session.free();
            return;
        }
        pool.put(owner, session);
    }

    /// Releases the engine context without pooling it.
    pub fn free(self) {
        self.session.free();
    }

    #[cfg(test)]
    pub(crate) fn session(&self) -> &Session<C> {
        &self.session
    }
}
