//! Inference engine boundary
//!
//! The model weights, the per-context KV cache and the numeric sampling kernels
//! live outside this crate. These traits describe exactly what the session layer
//! needs from them; `inference::llama` implements them over llama-cpp-2.

use thiserror::Error;

/// Sequence id used for every cache edit. Contexts never batch concurrent sequences.
pub const DEFAULT_SEQUENCE: i32 = 0;

/// Decode status reported by a successful [`EngineContext::decode`].
pub const DECODE_OK: i32 = 0;

/// Decode status reported when the engine has no free KV slot for the batch.
pub const DECODE_CACHE_OVERFLOW: i32 = 1;

/// Errors reported by an engine implementation
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Failed to convert token {0} to text: {1}")]
    Detokenization(i32, String),

    #[error("Cache edit failed: {0}")]
    CacheEdit(String),
}

/// An opaque vocabulary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub i32);

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Tokens with a fixed meaning for the loaded vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    /// Beginning of sequence, prepended to every request
    pub bos: Token,
    /// End of sequence, terminates a stream
    pub eos: Token,
    /// Newline, optionally shielded from repetition penalties
    pub nl: Token,
}

/// One scored vocabulary entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: Token,
    pub logit: f32,
    pub p: f32,
}

/// The candidate list handed through the sampling kernels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidates {
    pub data: Vec<TokenData>,
    /// Whether `data` is sorted by descending logit
    pub sorted: bool,
}

impl Candidates {
    /// Builds the full-vocabulary candidate list for a logit vector.
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| TokenData {
                id: Token(i as i32),
                logit,
                p: 0.0,
            })
            .collect();
        Self {
            data,
            sorted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn logit(&self, token: Token) -> Option<f32> {
        self.data.iter().find(|d| d.id == token).map(|d| d.logit)
    }

    /// Overwrites the logit of `token`, returning false if it is not a candidate.
    pub fn set_logit(&mut self, token: Token, logit: f32) -> bool {
        match self.data.iter_mut().find(|d| d.id == token) {
            Some(d) => {
                d.logit = logit;
                true
            }
            None => false,
        }
    }
}

/// Repetition penalty knobs applied over the recent-token window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Penalties {
    pub repeat: f32,
    pub frequency: f32,
    pub presence: f32,
}

/// Loaded model weights.
pub trait Engine {
    type Context: EngineContext;

    /// Context length the model was trained with.
    fn trained_context_length(&self) -> usize;

    fn special_tokens(&self) -> SpecialTokens;

    /// Tokenizes `text` without adding BOS.
    fn tokenize(&self, text: &str) -> Result<Vec<Token>, EngineError>;

    /// Raw bytes of a single token; may be an incomplete UTF-8 sequence.
    fn token_to_piece(&self, token: Token) -> Result<Vec<u8>, EngineError>;

    /// Attaches a fresh context with room for `n_ctx` positions.
    fn new_context(&self, n_ctx: usize, seed: u32) -> Result<Self::Context, EngineError>;
}

/// One attached context with its position-indexed cache.
///
/// Every method runs the engine inline on the calling thread. A context has no
/// undo: callers keep their own record of what the cache holds.
pub trait EngineContext: SamplingKernels {
    /// Evaluates `tokens` at positions `start..start + tokens.len()`, producing
    /// logits for the final token only. Returns [`DECODE_OK`],
    /// [`DECODE_CACHE_OVERFLOW`] or another engine-specific fatal code.
    fn decode(&mut self, start: usize, tokens: &[Token]) -> i32;

    /// Logit vector produced for `position` by the latest decode, if any.
    fn logits(&self, position: usize) -> Option<&[f32]>;

    fn has_logits(&self, position: usize) -> bool {
        self.logits(position).is_some()
    }

    /// Evicts `[start, stop)` from `seq`; `None` means to the end.
    fn cache_remove(
        &mut self,
        seq: i32,
        start: usize,
        stop: Option<usize>,
    ) -> Result<(), EngineError>;

    /// Renumbers `[start, stop)` of `seq` by `delta`.
    fn cache_shift(
        &mut self,
        seq: i32,
        start: usize,
        stop: usize,
        delta: isize,
    ) -> Result<(), EngineError>;

    /// Reseeds the context's random source.
    fn reseed(&mut self, seed: u32);
}

/// Numeric sampling transforms owned by the engine.
///
/// Selection kernels return `None` when the engine could not produce a token.
pub trait SamplingKernels {
    fn penalize_repetition(
        &mut self,
        candidates: &mut Candidates,
        window: &[Token],
        penalties: Penalties,
    );

    fn temperature(&mut self, candidates: &mut Candidates, temperature: f32);

    fn top_k(&mut self, candidates: &mut Candidates, k: i32, min_keep: usize);

    fn tail_free(&mut self, candidates: &mut Candidates, z: f32, min_keep: usize);

    fn typical(&mut self, candidates: &mut Candidates, p: f32, min_keep: usize);

    fn top_p(&mut self, candidates: &mut Candidates, p: f32, min_keep: usize);

    fn greedy(&mut self, candidates: &mut Candidates) -> Option<Token>;

    /// Stochastic draw from the (already filtered) distribution.
    fn draw(&mut self, candidates: &mut Candidates) -> Option<Token>;

    /// Mirostat v1 with `m` tokens used to estimate `s_hat`. The threshold `mu`
    /// starts at `2 * tau` for each call.
    fn mirostat(&mut self, candidates: &mut Candidates, tau: f32, eta: f32, m: i32)
        -> Option<Token>;

    /// Mirostat v2; `mu` starts at `2 * tau` for each call.
    fn mirostat_v2(&mut self, candidates: &mut Candidates, tau: f32, eta: f32) -> Option<Token>;
}
