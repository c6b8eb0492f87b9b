//! llama.cpp backend
//!
//! Implements the engine traits over llama-cpp-2. Each [`LlamaSession`] owns an
//! `Arc` of the weights it was created from, so a pooled context can never
//! outlive its model.

use std::mem::ManuallyDrop;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::data::LlamaTokenData;
use llama_cpp_2::token::data_array::LlamaTokenDataArray;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::DecodeError;
use once_cell::sync::OnceCell;

use crate::inference::engine::{
    Candidates, Engine, EngineContext, EngineError, Penalties, SamplingKernels, SpecialTokens,
    Token, TokenData, DECODE_CACHE_OVERFLOW, DECODE_OK, DEFAULT_SEQUENCE,
};
use crate::inference::error::InferenceError;
use crate::inference::model::{validate_gguf, Model};

/// Generic failure code for decode errors llama.cpp reports without a status.
const DECODE_FAILED: i32 = -1;

static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

static TAIL_FREE_UNSUPPORTED: Once = Once::new();

/// The process-wide backend, initialised on first use with native logging silenced.
fn backend() -> Result<&'static LlamaBackend, EngineError> {
    BACKEND.get_or_try_init(|| {
        let mut backend =
            LlamaBackend::init().map_err(|e| EngineError::BackendInit(e.to_string()))?;
        backend.void_logs();
        tracing::info!("llama.cpp backend initialized");
        Ok(backend)
    })
}

fn to_llama(token: Token) -> LlamaToken {
    LlamaToken::new(token.0)
}

fn from_llama(token: LlamaToken) -> Token {
    Token(token.0)
}

fn to_position(value: usize) -> Result<u32, EngineError> {
    u32::try_from(value)
        .map_err(|_| EngineError::CacheEdit(format!("position {value} out of range")))
}

/// Options applied when loading weights
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Number of layers to offload to the GPU (0 = CPU only)
    pub gpu_layers: u32,
}

/// Loaded GGUF weights
pub struct LlamaEngine {
    model: Arc<LlamaModel>,
    path: PathBuf,
}

impl LlamaEngine {
    /// Loads the weights at `path`.
    pub fn load(path: &Path, options: &LoadOptions) -> Result<Self, EngineError> {
        let backend = backend()?;
        tracing::info!(
            "Loading model from {:?} with {} GPU layers",
            path,
            options.gpu_layers
        );
        let params = LlamaModelParams::default().with_n_gpu_layers(options.gpu_layers);
        let model = LlamaModel::load_from_file(backend, path, &params)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;
        tracing::info!(
            n_ctx_train = model.n_ctx_train(),
            n_vocab = model.n_vocab(),
            "model loaded"
        );
        Ok(Self {
            model: Arc::new(model),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Engine for LlamaEngine {
    type Context = LlamaSession;

    fn trained_context_length(&self) -> usize {
        self.model.n_ctx_train() as usize
    }

    fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens {
            bos: from_llama(self.model.token_bos()),
            eos: from_llama(self.model.token_eos()),
            nl: from_llama(self.model.token_nl()),
        }
    }

    fn tokenize(&self, text: &str) -> Result<Vec<Token>, EngineError> {
        let tokens = self
            .model
            .str_to_token(text, AddBos::Never)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().map(from_llama).collect())
    }

    fn token_to_piece(&self, token: Token) -> Result<Vec<u8>, EngineError> {
        self.model
            .token_to_bytes(to_llama(token), Special::Tokenize)
            .map_err(|e| EngineError::Detokenization(token.0, e.to_string()))
    }

    fn new_context(&self, n_ctx: usize, seed: u32) -> Result<LlamaSession, EngineError> {
        let backend = backend()?;
        let size = u32::try_from(n_ctx)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| EngineError::ContextCreate(format!("invalid context size {n_ctx}")))?;
        let params = LlamaContextParams::default()
            .with_n_ctx(Some(size))
            .with_n_batch(size.get());
        let ctx = self
            .model
            .new_context(backend, params)
            .map_err(|e| EngineError::ContextCreate(e.to_string()))?;
        // SAFETY: the context borrows the model, which lives behind the `Arc`
        // stored alongside it. `LlamaSession::drop` releases the context
        // before any field is dropped, so the `Arc` always outlives it.
        let ctx = unsafe { std::mem::transmute::<LlamaContext<'_>, LlamaContext<'static>>(ctx) };
        Ok(LlamaSession {
            ctx: ManuallyDrop::new(ctx),
            model: Arc::clone(&self.model),
            dist: LlamaSampler::dist(seed),
            seed,
            draws: 0,
            logits_at: None,
        })
    }
}

impl Model<LlamaEngine> {
    /// Validates and loads a GGUF model.
    pub fn load(path: impl AsRef<Path>, options: &LoadOptions) -> Result<Self, InferenceError> {
        let path = path.as_ref();
        let load_error = |reason: String| InferenceError::ModelLoad {
            path: Some(path.to_path_buf()),
            reason,
        };
        let metadata = validate_gguf(path).map_err(|e| load_error(e.to_string()))?;
        tracing::debug!(
            version = metadata.version,
            tensors = metadata.tensor_count,
            "GGUF header ok"
        );
        let engine = LlamaEngine::load(path, options).map_err(|e| load_error(e.to_string()))?;
        Model::from_engine(engine).map_err(|e| match e {
            InferenceError::ModelLoad { reason, .. } => load_error(reason),
            other => other,
        })
    }
}

/// An attached llama.cpp context
pub struct LlamaSession {
    /// Borrows from `model`; only dropped in `Drop for LlamaSession`.
    ctx: ManuallyDrop<LlamaContext<'static>>,
    model: Arc<LlamaModel>,
    dist: LlamaSampler,
    seed: u32,
    draws: u32,
    /// Position whose logits the last decode produced, and its batch index.
    logits_at: Option<(usize, i32)>,
}

impl Drop for LlamaSession {
    fn drop(&mut self) {
        // SAFETY: `ctx` is never touched again, and `model` is still alive
        // because fields are only dropped after this body returns.
        unsafe { ManuallyDrop::drop(&mut self.ctx) };
    }
}

impl LlamaSession {
    /// Runs `sampler` over `candidates`, writing the filtered list back.
    fn apply(candidates: &mut Candidates, sampler: &LlamaSampler) -> Option<Token> {
        let data = candidates
            .data
            .iter()
            .map(|d| LlamaTokenData::new(to_llama(d.id), d.logit, d.p))
            .collect();
        let mut array = LlamaTokenDataArray::new(data, candidates.sorted);
        array.apply_sampler(sampler);

        candidates.data = array
            .data
            .iter()
            .map(|d| TokenData {
                id: from_llama(d.id()),
                logit: d.logit(),
                p: d.p(),
            })
            .collect();
        candidates.sorted = array.sorted;
        array.selected_token().map(from_llama)
    }

    /// Seed for a one-shot stochastic sampler, distinct per draw.
    fn next_seed(&mut self) -> u32 {
        self.draws = self.draws.wrapping_add(1);
        self.seed.wrapping_add(self.draws)
    }
}

impl EngineContext for LlamaSession {
    fn decode(&mut self, start: usize, tokens: &[Token]) -> i32 {
        let Some(last) = tokens.len().checked_sub(1) else {
            return DECODE_OK;
        };
        self.logits_at = None;

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        for (i, token) in tokens.iter().enumerate() {
            let Ok(position) = i32::try_from(start + i) else {
                return DECODE_CACHE_OVERFLOW;
            };
            if let Err(e) = batch.add(to_llama(*token), position, &[DEFAULT_SEQUENCE], i == last) {
                tracing::error!("failed to build batch: {}", e);
                return DECODE_FAILED;
            }
        }

        match self.ctx.decode(&mut batch) {
            Ok(()) => {
                self.logits_at = Some((start + last, last as i32));
                DECODE_OK
            }
            Err(DecodeError::NoKvCacheSlot) => DECODE_CACHE_OVERFLOW,
            Err(DecodeError::NTokensZero) => DECODE_FAILED,
            Err(DecodeError::Unknown(code)) => code,
        }
    }

    fn logits(&self, position: usize) -> Option<&[f32]> {
        match self.logits_at {
            Some((at, index)) if at == position => Some(self.ctx.get_logits_ith(index)),
            _ => None,
        }
    }

    fn cache_remove(
        &mut self,
        seq: i32,
        start: usize,
        stop: Option<usize>,
    ) -> Result<(), EngineError> {
        let seq = u32::try_from(seq)
            .map_err(|_| EngineError::CacheEdit(format!("invalid sequence {seq}")))?;
        let p0 = to_position(start)?;
        let p1 = stop.map(to_position).transpose()?;
        let removed = self
            .ctx
            .clear_kv_cache_seq(Some(seq), Some(p0), p1)
            .map_err(|e| EngineError::CacheEdit(e.to_string()))?;
        if !removed {
            return Err(EngineError::CacheEdit(format!(
                "could not remove positions {start}..{stop:?}"
            )));
        }
        if matches!(self.logits_at, Some((at, _)) if at >= start && stop.map_or(true, |stop| at < stop))
        {
            self.logits_at = None;
        }
        Ok(())
    }

    fn cache_shift(
        &mut self,
        seq: i32,
        start: usize,
        stop: usize,
        delta: isize,
    ) -> Result<(), EngineError> {
        let shift = i32::try_from(delta)
            .map_err(|_| EngineError::CacheEdit(format!("shift {delta} out of range")))?;
        self.ctx
            .kv_cache_seq_add(seq, Some(to_position(start)?), Some(to_position(stop)?), shift)
            .map_err(|e| EngineError::CacheEdit(e.to_string()))?;
        if let Some((at, index)) = self.logits_at {
            if at >= start && at < stop {
                self.logits_at = at.checked_add_signed(delta).map(|at| (at, index));
            }
        }
        Ok(())
    }

    fn reseed(&mut self, seed: u32) {
        self.seed = seed;
        self.draws = 0;
        self.dist = LlamaSampler::dist(seed);
    }
}

impl SamplingKernels for LlamaSession {
    fn penalize_repetition(
        &mut self,
        candidates: &mut Candidates,
        window: &[Token],
        penalties: Penalties,
    ) {
        let last_n = i32::try_from(window.len()).unwrap_or(i32::MAX);
        let mut sampler = LlamaSampler::penalties(
            last_n,
            penalties.repeat,
            penalties.frequency,
            penalties.presence,
        );
        for token in window {
            sampler.accept(to_llama(*token));
        }
        Self::apply(candidates, &sampler);
    }

    fn temperature(&mut self, candidates: &mut Candidates, temperature: f32) {
        Self::apply(candidates, &LlamaSampler::temp(temperature));
    }

    fn top_k(&mut self, candidates: &mut Candidates, k: i32, _min_keep: usize) {
        Self::apply(candidates, &LlamaSampler::top_k(k));
    }

    fn tail_free(&mut self, _candidates: &mut Candidates, z: f32, _min_keep: usize) {
        if z < 1.0 {
            TAIL_FREE_UNSUPPORTED.call_once(|| {
                tracing::warn!(z, "tail free sampling is not supported by llama.cpp, ignoring tfsz");
            });
        }
    }

    fn typical(&mut self, candidates: &mut Candidates, p: f32, min_keep: usize) {
        Self::apply(candidates, &LlamaSampler::typical(p, min_keep));
    }

    fn top_p(&mut self, candidates: &mut Candidates, p: f32, min_keep: usize) {
        Self::apply(candidates, &LlamaSampler::top_p(p, min_keep));
    }

    fn greedy(&mut self, candidates: &mut Candidates) -> Option<Token> {
        Self::apply(candidates, &LlamaSampler::greedy())
    }

    fn draw(&mut self, candidates: &mut Candidates) -> Option<Token> {
        let token = Self::apply(candidates, &self.dist);
        if let Some(token) = token {
            self.dist.accept(to_llama(token));
        }
        token
    }

    fn mirostat(&mut self, candidates: &mut Candidates, tau: f32, eta: f32, m: i32) -> Option<Token> {
        let seed = self.next_seed();
        let sampler = LlamaSampler::mirostat(self.model.n_vocab(), seed, tau, eta, m);
        Self::apply(candidates, &sampler)
    }

    fn mirostat_v2(&mut self, candidates: &mut Candidates, tau: f32, eta: f32) -> Option<Token> {
        let seed = self.next_seed();
        Self::apply(candidates, &LlamaSampler::mirostat_v2(seed, tau, eta))
    }
}
