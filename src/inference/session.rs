//! Session lifecycle
//!
//! A [`Session`] owns one attached engine context together with `history`, the
//! exact list of tokens resident in that context's cache: `history[i]` lives at
//! cache position `i`. Every cache edit or decode happens before the matching
//! change to `history`, and only once the engine reports success.

use crate::inference::cache;
use crate::inference::engine::{
    Engine, EngineContext, EngineError, SpecialTokens, Token, DECODE_CACHE_OVERFLOW, DECODE_OK,
};
use crate::inference::error::InferenceError;
use crate::inference::overlap;
use crate::inference::params::Parameters;
use crate::inference::sampler::Sampler;

/// Positions kept free beyond the input so at least one token can be generated.
pub const RESERVED_SLACK: usize = 5;

pub struct Session<C: EngineContext> {
    ctx: C,
    history: Vec<Token>,
    capacity: usize,
    special: SpecialTokens,
    sampler: Sampler,
    seed: u32,
    poisoned: bool,
}

impl<C: EngineContext> Session<C> {
    /// Attaches a fresh context sized to the model's trained context length and
    /// evaluates `tokens` into it. On failure the context is released.
    pub fn initialize<E>(
        engine: &E,
        tokens: &[Token],
        params: &Parameters,
    ) -> Result<Self, InferenceError>
    where
        E: Engine<Context = C>,
    {
        let capacity = engine.trained_context_length();
        let max = capacity.saturating_sub(RESERVED_SLACK);
        if tokens.len() > max {
            return Err(InferenceError::InputTooLarge {
                tokens: tokens.len(),
                max,
            });
        }

        let seed = params.resolve_seed();
        let special = engine.special_tokens();
        tracing::trace!(
            seed,
            n_ctx = capacity,
            bos = special.bos.0,
            nl = special.nl.0,
            eos = special.eos.0,
            "creating context"
        );
        let ctx = engine.new_context(capacity, seed)?;

        let mut session = Self {
            ctx,
            history: Vec::with_capacity(capacity),
            capacity,
            special,
            sampler: Sampler::new(params),
            seed,
            poisoned: false,
        };
        session.evaluate(tokens)?;
        Ok(session)
    }

    /// Reuses the resident cache for a new request.
    ///
    /// Keeps the longest window of `history` that starts `tokens`, slides it down
    /// to position 0 and evaluates only the remainder of `tokens`.
    pub fn resume(&mut self, tokens: &[Token], params: &Parameters) -> Result<(), InferenceError> {
        self.configure(params);

        if tokens.len() > self.capacity {
            return Err(InferenceError::InputTooLarge {
                tokens: tokens.len(),
                max: self.capacity,
            });
        }

        let overlap = overlap::find(tokens, &self.history);
        let (offset, end) = (overlap.offset, overlap.end());
        tracing::debug!(
            history = self.history.len(),
            pos = offset,
            sz = overlap.len,
            "resetting stream"
        );

        self.edit_cache(|ctx| {
            cache::remove_range(ctx, end, None)?;
            cache::remove_range(ctx, 0, Some(offset))?;
            cache::shift_range(ctx, offset, end, -(offset as isize))
        })?;
        self.history.truncate(end);
        self.history.drain(..offset);

        // A fully resident request still needs logits for its last position.
        let retained = self.history.len();
        if retained > 0 && retained == tokens.len() && !self.ctx.has_logits(retained - 1) {
            tracing::debug!(position = retained - 1, "re-evaluating last token for logits");
            self.edit_cache(|ctx| cache::remove_range(ctx, retained - 1, None))?;
            self.history.truncate(retained - 1);
        }

        let fresh = self.history.len();
        self.evaluate(&tokens[fresh..])
    }

    /// Generates one token after evaluating `lookahead`.
    ///
    /// Fails with [`InferenceError::ContextFull`] without touching the session
    /// when `lookahead` does not fit, and with [`InferenceError::EndOfStream`]
    /// when the model emits its end-of-sequence token.
    pub fn next(&mut self, lookahead: &[Token]) -> Result<Token, InferenceError> {
        if self.history.len() + RESERVED_SLACK + lookahead.len() > self.capacity {
            return Err(InferenceError::ContextFull);
        }
        self.evaluate(lookahead)?;

        let token = self.sample()?;
        if token == self.special.eos {
            return Err(InferenceError::EndOfStream);
        }
        self.evaluate(&[token])?;
        Ok(token)
    }

    /// Appends `tokens` to the cache at the next free positions.
    pub fn evaluate(&mut self, tokens: &[Token]) -> Result<(), InferenceError> {
        if tokens.is_empty() {
            return Ok(());
        }
        let start = self.history.len();
        if start + tokens.len() > self.capacity {
            return Err(InferenceError::CacheOverflow);
        }
        tracing::trace!(history = start, tokens = tokens.len(), "evaluating tokens");

        match self.ctx.decode(start, tokens) {
            DECODE_OK => {
                self.history.extend_from_slice(tokens);
                Ok(())
            }
            DECODE_CACHE_OVERFLOW => {
                self.poisoned = true;
                Err(InferenceError::CacheOverflow)
            }
            code => {
                self.poisoned = true;
                Err(InferenceError::EvaluationFailed { code })
            }
        }
    }

    fn sample(&mut self) -> Result<Token, InferenceError> {
        let position = self
            .history
            .len()
            .checked_sub(1)
            .ok_or(InferenceError::NoOutput { position: 0 })?;
        self.sampler
            .sample(&mut self.ctx, position, &self.history, self.special.nl)
    }

    fn configure(&mut self, params: &Parameters) {
        self.sampler = Sampler::new(params);
        self.seed = params.resolve_seed();
        self.ctx.reseed(self.seed);
    }

    fn edit_cache<F>(&mut self, edit: F) -> Result<(), InferenceError>
    where
        F: FnOnce(&mut C) -> Result<(), EngineError>,
    {
        edit(&mut self.ctx).map_err(|e| {
            self.poisoned = true;
            InferenceError::from(e)
        })
    }

    /// Tokens resident in the cache, in position order.
    pub fn history(&self) -> &[Token] {
        &self.history
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Positions still available for lookahead tokens.
    pub fn headspace(&self) -> usize {
        self.capacity
            .saturating_sub(self.history.len() + RESERVED_SLACK)
    }

    /// Seed resolved for the current request.
    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// True once the engine cache may have diverged from `history`.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Releases the engine context.
    pub fn free(self) {
        tracing::trace!(history = self.history.len(), "freeing context");
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &C {
        &self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::{CacheEdit, MockEngine, EOS};

    fn toks(ids: &[i32]) -> Vec<Token> {
        ids.iter().copied().map(Token).collect()
    }

    fn assert_consistent(session: &Session<crate::inference::testing::MockContext>) {
        let ctx = session.context();
        assert!(!ctx.is_corrupted());
        assert!(ctx.is_contiguous());
        assert_eq!(ctx.cached_tokens(), session.history());
        assert!(session.history().len() <= session.capacity());
    }

    #[test]
    fn test_initialize_evaluates_all_tokens() {
        let engine = MockEngine::new(2048);
        let session = Session::initialize(&engine, &toks(&[1, 2, 3, 4, 5]), &Parameters::default())
            .unwrap();
        assert_eq!(session.history(), &toks(&[1, 2, 3, 4, 5])[..]);
        assert_eq!(engine.journal().decodes, vec![(0, toks(&[1, 2, 3, 4, 5]))]);
        assert_ne!(session.seed(), 0);
        assert_consistent(&session);
    }

    #[test]
    fn test_initialize_rejects_input_beyond_slack() {
        let engine = MockEngine::new(16);
        let tokens: Vec<Token> = (0..12).map(Token).collect();
        let err = Session::initialize(&engine, &tokens, &Parameters::default()).err();
        assert_eq!(
            err,
            Some(InferenceError::InputTooLarge { tokens: 12, max: 11 })
        );
        // Rejected before any context was attached.
        assert_eq!(engine.journal().contexts_created, 0);
    }

    #[test]
    fn test_initialize_failure_releases_context() {
        let engine = MockEngine::new(64);
        engine.fail_next_decode(-4);
        let err = Session::initialize(&engine, &toks(&[1, 2]), &Parameters::default()).err();
        assert_eq!(err, Some(InferenceError::EvaluationFailed { code: -4 }));
        let journal = engine.journal();
        assert_eq!(journal.contexts_created, 1);
        assert_eq!(journal.contexts_dropped, 1);
    }

    #[test]
    fn test_initialize_uses_explicit_seed() {
        let engine = MockEngine::new(64);
        let params = Parameters {
            seed: 99,
            ..Parameters::default()
        };
        let session = Session::initialize(&engine, &toks(&[1]), &params).unwrap();
        assert_eq!(session.seed(), 99);
        assert_eq!(engine.journal().seeds, vec![99]);
    }

    #[test]
    fn test_resume_evaluates_only_new_suffix() {
        let engine = MockEngine::new(2048);
        let params = Parameters::default();
        let mut session = Session::initialize(&engine, &toks(&[1, 2, 3, 4, 5]), &params).unwrap();
        session.resume(&toks(&[1, 2, 3, 4, 5, 6, 7]), &params).unwrap();

        assert_eq!(session.history(), &toks(&[1, 2, 3, 4, 5, 6, 7])[..]);
        let journal = engine.journal();
        assert_eq!(journal.decodes.last(), Some(&(5, toks(&[6, 7]))));
        assert_eq!(journal.decodes.len(), 2);
        assert_consistent(&session);
    }

    #[test]
    fn test_resume_identical_tokens_evaluates_nothing() {
        let engine = MockEngine::new(2048);
        let params = Parameters::default();
        let tokens = toks(&[1, 2, 3, 4, 5]);
        let mut session = Session::initialize(&engine, &tokens, &params).unwrap();
        session.resume(&tokens, &params).unwrap();

        assert_eq!(session.history(), &tokens[..]);
        assert_eq!(engine.journal().decodes.len(), 1);
        assert_consistent(&session);
    }

    #[test]
    fn test_resume_disjoint_clears_cache() {
        let engine = MockEngine::new(2048);
        let params = Parameters::default();
        let mut session = Session::initialize(&engine, &toks(&[1, 2, 3, 4, 5]), &params).unwrap();
        session.resume(&toks(&[9, 9, 9]), &params).unwrap();

        assert_eq!(session.history(), &toks(&[9, 9, 9])[..]);
        let journal = engine.journal();
        assert_eq!(
            journal.edits,
            vec![CacheEdit::Remove {
                start: 0,
                stop: None
            }]
        );
        assert_eq!(journal.decodes.last(), Some(&(0, toks(&[9, 9, 9]))));
        assert_consistent(&session);
    }

    #[test]
    fn test_resume_slides_retained_window_to_front() {
        let engine = MockEngine::new(2048);
        let params = Parameters::default();
        let mut session =
            Session::initialize(&engine, &toks(&[1, 7, 7, 1, 4, 5, 6, 8]), &params).unwrap();
        session.resume(&toks(&[1, 4, 5, 6, 9]), &params).unwrap();

        assert_eq!(session.history(), &toks(&[1, 4, 5, 6, 9])[..]);
        let journal = engine.journal();
        assert_eq!(
            journal.edits,
            vec![
                CacheEdit::Remove {
                    start: 7,
                    stop: None
                },
                CacheEdit::Remove {
                    start: 0,
                    stop: Some(3)
                },
                CacheEdit::Shift {
                    start: 3,
                    stop: 7,
                    delta: -3
                },
            ]
        );
        assert_eq!(journal.decodes.last(), Some(&(4, toks(&[9]))));
        assert_consistent(&session);
    }

    #[test]
    fn test_resume_prefix_of_history_reevaluates_last_token() {
        let engine = MockEngine::new(2048);
        let params = Parameters::default();
        let mut session = Session::initialize(&engine, &toks(&[1, 2, 3, 4, 5]), &params).unwrap();
        session.resume(&toks(&[1, 2, 3]), &params).unwrap();

        assert_eq!(session.history(), &toks(&[1, 2, 3])[..]);
        assert_eq!(engine.journal().decodes.last(), Some(&(2, toks(&[3]))));
        assert!(session.context().has_logits(2));
        assert_consistent(&session);
    }

    #[test]
    fn test_failed_cache_edit_poisons_session() {
        let engine = MockEngine::new(2048);
        let params = Parameters::default();
        let mut session = Session::initialize(&engine, &toks(&[1, 2, 3, 4, 5]), &params).unwrap();
        engine.fail_next_edit();

        let err = session.resume(&toks(&[9, 9, 9]), &params).unwrap_err();
        assert!(matches!(err, InferenceError::Engine(EngineError::CacheEdit(_))));
        assert!(err.poisons_session());
        assert!(session.is_poisoned());
        // Nothing was evaluated and local history was left alone.
        assert_eq!(session.history(), &toks(&[1, 2, 3, 4, 5])[..]);
        assert_eq!(engine.journal().decodes.len(), 1);
    }

    #[test]
    fn test_next_reports_sampling_failure() {
        let engine = MockEngine::new(64);
        let mut session =
            Session::initialize(&engine, &toks(&[1, 20]), &Parameters::default()).unwrap();
        engine.null_next_sample();
        assert_eq!(
            session.next(&[]),
            Err(InferenceError::SamplingFailed { position: 1 })
        );
        assert_eq!(session.history(), &toks(&[1, 20])[..]);
        assert!(!session.is_poisoned());
    }

    #[test]
    fn test_resume_rejects_input_beyond_capacity() {
        let engine = MockEngine::new(16);
        let params = Parameters::default();
        let mut session = Session::initialize(&engine, &toks(&[1, 2]), &params).unwrap();
        let tokens: Vec<Token> = (0..17).map(Token).collect();
        let err = session.resume(&tokens, &params).unwrap_err();
        assert_eq!(err, InferenceError::InputTooLarge { tokens: 17, max: 16 });
        assert_eq!(session.history(), &toks(&[1, 2])[..]);
    }

    #[test]
    fn test_resume_reseeds_context() {
        let engine = MockEngine::new(64);
        let mut session = Session::initialize(
            &engine,
            &toks(&[1]),
            &Parameters {
                seed: 5,
                ..Parameters::default()
            },
        )
        .unwrap();
        session
            .resume(
                &toks(&[1, 2]),
                &Parameters {
                    seed: 6,
                    ..Parameters::default()
                },
            )
            .unwrap();
        assert_eq!(session.seed(), 6);
        assert_eq!(engine.journal().seeds, vec![5, 6]);
    }

    #[test]
    fn test_next_generates_and_evaluates_token() {
        let engine = MockEngine::new(64);
        let mut session =
            Session::initialize(&engine, &toks(&[1, 20]), &Parameters::default()).unwrap();
        assert_eq!(session.next(&[]).unwrap(), Token(21));
        assert_eq!(session.next(&[]).unwrap(), Token(22));
        assert_eq!(session.history(), &toks(&[1, 20, 21, 22])[..]);
        assert_consistent(&session);
    }

    #[test]
    fn test_next_evaluates_lookahead_first() {
        let engine = MockEngine::new(64);
        let mut session =
            Session::initialize(&engine, &toks(&[1, 20]), &Parameters::default()).unwrap();
        assert_eq!(session.next(&toks(&[40, 41])).unwrap(), Token(42));
        assert_eq!(session.history(), &toks(&[1, 20, 40, 41, 42])[..]);
    }

    #[test]
    fn test_next_end_of_stream() {
        let engine = MockEngine::new(64).with_transition(Token(30), EOS);
        let mut session =
            Session::initialize(&engine, &toks(&[1, 29]), &Parameters::default()).unwrap();
        assert_eq!(session.next(&[]).unwrap(), Token(30));
        assert_eq!(session.next(&[]), Err(InferenceError::EndOfStream));
        // The end-of-sequence token is not evaluated.
        assert_eq!(session.history(), &toks(&[1, 29, 30])[..]);
        assert!(!session.is_poisoned());
    }

    #[test]
    fn test_next_context_full_leaves_history_untouched() {
        let engine = MockEngine::new(12);
        let mut session =
            Session::initialize(&engine, &toks(&[1, 2, 3, 4, 5]), &Parameters::default())
                .unwrap();
        assert_eq!(session.headspace(), 2);
        let decodes = engine.journal().decodes.len();

        let err = session.next(&toks(&[7, 8, 9])).unwrap_err();
        assert_eq!(err, InferenceError::ContextFull);
        assert_eq!(session.history(), &toks(&[1, 2, 3, 4, 5])[..]);
        assert_eq!(engine.journal().decodes.len(), decodes);
    }

    #[test]
    fn test_generation_stops_at_capacity() {
        let engine = MockEngine::new(10);
        let mut session =
            Session::initialize(&engine, &toks(&[1, 20]), &Parameters::default()).unwrap();
        let mut generated = 0;
        let err = loop {
            match session.next(&[]) {
                Ok(_) => generated += 1,
                Err(e) => break e,
            }
        };
        assert_eq!(err, InferenceError::ContextFull);
        assert_eq!(generated, 4);
        assert_eq!(session.history().len(), 6);
        assert_consistent(&session);
    }

    #[test]
    fn test_evaluate_failure_keeps_history_and_poisons() {
        let engine = MockEngine::new(64);
        let mut session =
            Session::initialize(&engine, &toks(&[1, 2]), &Parameters::default()).unwrap();
        engine.fail_next_decode(1);
        assert_eq!(
            session.evaluate(&toks(&[3])),
            Err(InferenceError::CacheOverflow)
        );
        assert_eq!(session.history(), &toks(&[1, 2])[..]);
        assert!(session.is_poisoned());
    }

    #[test]
    fn test_evaluate_beyond_capacity_is_refused() {
        let engine = MockEngine::new(8);
        let mut session =
            Session::initialize(&engine, &toks(&[1, 2]), &Parameters::default()).unwrap();
        let err = session.evaluate(&toks(&[3, 4, 5, 6, 7, 8, 9])).unwrap_err();
        assert_eq!(err, InferenceError::CacheOverflow);
        // Refused before reaching the engine, so the cache is still trustworthy.
        assert!(!session.is_poisoned());
        assert_eq!(engine.journal().decodes.len(), 1);
    }

    #[test]
    fn test_evaluate_empty_is_noop() {
        let engine = MockEngine::new(64);
        let mut session =
            Session::initialize(&engine, &toks(&[1]), &Parameters::default()).unwrap();
        session.evaluate(&[]).unwrap();
        assert_eq!(engine.journal().decodes.len(), 1);
    }

    #[test]
    fn test_free_releases_context() {
        let engine = MockEngine::new(64);
        let session = Session::initialize(&engine, &toks(&[1]), &Parameters::default()).unwrap();
        session.free();
        assert_eq!(engine.journal().contexts_dropped, 1);
    }
}
