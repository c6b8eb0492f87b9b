//! In-memory engine for tests.
//!
//! The vocabulary is the 256 byte values. Logits always favour a single "next"
//! token (the previous token plus one, unless overridden), so greedy generation is
//! fully predictable. The cache is simulated per position and flags writes or
//! shifts onto occupied slots as corruption.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::inference::engine::{
    Candidates, Engine, EngineContext, EngineError, Penalties, SamplingKernels, SpecialTokens,
    Token, DECODE_CACHE_OVERFLOW, DECODE_OK,
};

pub(crate) const VOCAB: usize = 256;
pub(crate) const BOS: Token = Token(1);
pub(crate) const EOS: Token = Token(2);
pub(crate) const NL: Token = Token(10);

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CacheEdit {
    Remove { start: usize, stop: Option<usize> },
    Shift { start: usize, stop: usize, delta: isize },
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Journal {
    pub decodes: Vec<(usize, Vec<Token>)>,
    pub edits: Vec<CacheEdit>,
    pub kernels: Vec<&'static str>,
    pub seeds: Vec<u32>,
    pub contexts_created: usize,
    pub contexts_dropped: usize,
    /// `m` passed to each Mirostat v1 call
    pub mirostat_m: Vec<i32>,
    fail_next_decode: Option<i32>,
    fail_next_edit: bool,
    null_next_sample: bool,
}

pub(crate) struct MockEngine {
    n_ctx: usize,
    transitions: Arc<HashMap<Token, Token>>,
    journal: Arc<Mutex<Journal>>,
}

impl MockEngine {
    pub fn new(n_ctx: usize) -> Self {
        Self {
            n_ctx,
            transitions: Arc::new(HashMap::new()),
            journal: Arc::new(Mutex::new(Journal::default())),
        }
    }

    /// After `from` has been evaluated, the favoured next token is `to`.
    pub fn with_transition(mut self, from: Token, to: Token) -> Self {
        Arc::make_mut(&mut self.transitions).insert(from, to);
        self
    }

    pub fn journal(&self) -> Journal {
        lock(&self.journal).clone()
    }

    pub fn journal_handle(&self) -> Arc<Mutex<Journal>> {
        Arc::clone(&self.journal)
    }

    pub fn fail_next_decode(&self, code: i32) {
        lock(&self.journal).fail_next_decode = Some(code);
    }

    /// The next cache remove or shift fails without touching the cache.
    pub fn fail_next_edit(&self) {
        lock(&self.journal).fail_next_edit = true;
    }

    /// The next selection kernel returns no token.
    pub fn null_next_sample(&self) {
        lock(&self.journal).null_next_sample = true;
    }
}

fn lock(journal: &Mutex<Journal>) -> MutexGuard<'_, Journal> {
    journal.lock().unwrap()
}

impl Engine for MockEngine {
    type Context = MockContext;

    fn trained_context_length(&self) -> usize {
        self.n_ctx
    }

    fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens {
            bos: BOS,
            eos: EOS,
            nl: NL,
        }
    }

    fn tokenize(&self, text: &str) -> Result<Vec<Token>, EngineError> {
        if text.contains('\0') {
            return Err(EngineError::Tokenization("interior nul byte".to_string()));
        }
        // Mimics sentencepiece's leading space.
        Ok(std::iter::once(b' ')
            .chain(text.bytes())
            .map(|b| Token(b as i32))
            .collect())
    }

    fn token_to_piece(&self, token: Token) -> Result<Vec<u8>, EngineError> {
        u8::try_from(token.0)
            .map(|b| vec![b])
            .map_err(|_| EngineError::Detokenization(token.0, "out of vocabulary".to_string()))
    }

    fn new_context(&self, n_ctx: usize, seed: u32) -> Result<MockContext, EngineError> {
        let mut journal = lock(&self.journal);
        journal.contexts_created += 1;
        journal.seeds.push(seed);
        drop(journal);
        Ok(MockContext {
            n_ctx,
            cache: BTreeMap::new(),
            corrupted: false,
            logits: vec![0.0; VOCAB],
            logits_at: None,
            transitions: Arc::clone(&self.transitions),
            journal: Arc::clone(&self.journal),
        })
    }
}

pub(crate) struct MockContext {
    n_ctx: usize,
    cache: BTreeMap<usize, Token>,
    corrupted: bool,
    logits: Vec<f32>,
    logits_at: Option<usize>,
    transitions: Arc<HashMap<Token, Token>>,
    journal: Arc<Mutex<Journal>>,
}

impl MockContext {
    /// Cache contents in position order.
    pub fn cached_tokens(&self) -> Vec<Token> {
        self.cache.values().copied().collect()
    }

    /// True when every position `0..len` is occupied and nothing lies beyond.
    pub fn is_contiguous(&self) -> bool {
        self.cache.keys().copied().eq(0..self.cache.len())
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    fn favoured_after(&self, token: Token) -> Token {
        self.transitions
            .get(&token)
            .copied()
            .unwrap_or(Token((token.0 + 1).rem_euclid(VOCAB as i32)))
    }

    fn record(&self, kernel: &'static str) {
        lock(&self.journal).kernels.push(kernel);
    }

    fn select(&self, kernel: &'static str, candidates: &Candidates) -> Option<Token> {
        let mut journal = lock(&self.journal);
        journal.kernels.push(kernel);
        if std::mem::take(&mut journal.null_next_sample) {
            return None;
        }
        argmax(candidates)
    }

    fn injected_edit_failure(&self) -> Result<(), EngineError> {
        if std::mem::take(&mut lock(&self.journal).fail_next_edit) {
            return Err(EngineError::CacheEdit("injected failure".to_string()));
        }
        Ok(())
    }
}

impl Drop for MockContext {
    fn drop(&mut self) {
        lock(&self.journal).contexts_dropped += 1;
    }
}

impl EngineContext for MockContext {
    fn decode(&mut self, start: usize, tokens: &[Token]) -> i32 {
        let mut journal = lock(&self.journal);
        if let Some(code) = journal.fail_next_decode.take() {
            return code;
        }
        if start + tokens.len() > self.n_ctx {
            return DECODE_CACHE_OVERFLOW;
        }
        journal.decodes.push((start, tokens.to_vec()));
        drop(journal);

        for (i, token) in tokens.iter().enumerate() {
            if self.cache.insert(start + i, *token).is_some() {
                self.corrupted = true;
            }
        }
        if let Some(last) = tokens.last() {
            let favoured = self.favoured_after(*last);
            self.logits = vec![0.0; VOCAB];
            self.logits[favoured.0 as usize] = 5.0;
            self.logits_at = Some(start + tokens.len() - 1);
        }
        DECODE_OK
    }

    fn logits(&self, position: usize) -> Option<&[f32]> {
        (self.logits_at == Some(position)).then_some(self.logits.as_slice())
    }

    fn cache_remove(
        &mut self,
        _seq: i32,
        start: usize,
        stop: Option<usize>,
    ) -> Result<(), EngineError> {
        self.injected_edit_failure()?;
        let stop = stop.unwrap_or(usize::MAX);
        self.cache.retain(|pos, _| *pos < start || *pos >= stop);
        if matches!(self.logits_at, Some(pos) if pos >= start && pos < stop) {
            self.logits_at = None;
        }
        lock(&self.journal).edits.push(CacheEdit::Remove {
            start,
            stop: (stop != usize::MAX).then_some(stop),
        });
        Ok(())
    }

    fn cache_shift(
        &mut self,
        _seq: i32,
        start: usize,
        stop: usize,
        delta: isize,
    ) -> Result<(), EngineError> {
        self.injected_edit_failure()?;
        let moved: Vec<(usize, Token)> = self
            .cache
            .range(start..stop)
            .map(|(pos, token)| (*pos, *token))
            .collect();
        for (pos, _) in &moved {
            self.cache.remove(pos);
        }
        for (pos, token) in moved {
            match pos.checked_add_signed(delta) {
                Some(target) => {
                    if self.cache.insert(target, token).is_some() {
                        self.corrupted = true;
                    }
                }
                None => self.corrupted = true,
            }
        }
        if let Some(pos) = self.logits_at.filter(|pos| *pos >= start && *pos < stop) {
            self.logits_at = pos.checked_add_signed(delta);
        }
        lock(&self.journal).edits.push(CacheEdit::Shift { start, stop, delta });
        Ok(())
    }

    fn reseed(&mut self, seed: u32) {
        lock(&self.journal).seeds.push(seed);
    }
}

fn argmax(candidates: &Candidates) -> Option<Token> {
    candidates
        .data
        .iter()
        .fold(None::<(Token, f32)>, |best, d| match best {
            Some((_, logit)) if logit >= d.logit => best,
            _ => Some((d.id, d.logit)),
        })
        .map(|(id, _)| id)
}

impl SamplingKernels for MockContext {
    fn penalize_repetition(
        &mut self,
        candidates: &mut Candidates,
        window: &[Token],
        penalties: Penalties,
    ) {
        self.record("penalties");
        for d in candidates.data.iter_mut() {
            let count = window.iter().filter(|t| **t == d.id).count();
            if count == 0 {
                continue;
            }
            d.logit = if d.logit > 0.0 {
                d.logit / penalties.repeat
            } else {
                d.logit * penalties.repeat
            };
            d.logit -= count as f32 * penalties.frequency + penalties.presence;
        }
    }

    fn temperature(&mut self, candidates: &mut Candidates, temperature: f32) {
        self.record("temperature");
        for d in candidates.data.iter_mut() {
            d.logit /= temperature;
        }
    }

    fn top_k(&mut self, candidates: &mut Candidates, k: i32, min_keep: usize) {
        self.record("top_k");
        if k <= 0 {
            return;
        }
        candidates
            .data
            .sort_by(|a, b| b.logit.total_cmp(&a.logit));
        candidates.data.truncate((k as usize).max(min_keep));
        candidates.sorted = true;
    }

    fn tail_free(&mut self, _candidates: &mut Candidates, _z: f32, _min_keep: usize) {
        self.record("tail_free");
    }

    fn typical(&mut self, _candidates: &mut Candidates, _p: f32, _min_keep: usize) {
        self.record("typical");
    }

    fn top_p(&mut self, _candidates: &mut Candidates, _p: f32, _min_keep: usize) {
        self.record("top_p");
    }

    fn greedy(&mut self, candidates: &mut Candidates) -> Option<Token> {
        self.select("greedy", candidates)
    }

    fn draw(&mut self, candidates: &mut Candidates) -> Option<Token> {
        self.select("draw", candidates)
    }

    fn mirostat(
        &mut self,
        candidates: &mut Candidates,
        _tau: f32,
        _eta: f32,
        m: i32,
    ) -> Option<Token> {
        lock(&self.journal).mirostat_m.push(m);
        self.select("mirostat", candidates)
    }

    fn mirostat_v2(&mut self, candidates: &mut Candidates, _tau: f32, _eta: f32) -> Option<Token> {
        self.select("mirostat_v2", candidates)
    }
}
