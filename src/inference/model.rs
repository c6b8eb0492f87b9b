//! Model management
//!
//! A [`Model`] owns the loaded engine, the constants derived from it and the
//! pool that lets consecutive predictions reuse one context.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::inference::engine::{Engine, SpecialTokens, Token};
use crate::inference::error::InferenceError;
use crate::inference::params::Parameters;
use crate::inference::pool::{OwnerId, SessionPool};
use crate::inference::session::Session;
use crate::inference::stream::Stream;
use crate::inference::streaming::TextStream;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Errors that can occur while validating a model file
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// Metadata extracted from a GGUF file header
#[derive(Debug, Clone)]
pub struct GgufMetadata {
    /// GGUF format version
    pub version: u32,
    /// Number of tensors in the model
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_kv_count: u64,
}

/// Validates that a file is a valid GGUF format and extracts basic metadata.
///
/// Run before handing a path to the engine so that obviously wrong files fail
/// with a readable error instead of inside the loader.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, ModelError> {
    let mut file = File::open(path)?;

    // magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
    let file_size = file.seek(SeekFrom::End(0))?;
    if file_size < 24 {
        return Err(ModelError::FileTooSmall);
    }
    file.seek(SeekFrom::Start(0))?;

    let mut header = [0u8; 24];
    file.read_exact(&mut header)?;

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    let mut count = [0u8; 8];
    count.copy_from_slice(&header[8..16]);
    let tensor_count = u64::from_le_bytes(count);
    count.copy_from_slice(&header[16..24]);
    let metadata_kv_count = u64::from_le_bytes(count);

    Ok(GgufMetadata {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

/// A loaded model and its session pool.
///
/// Sessions created by [`Model::predict`] never outlive the engine: contexts
/// keep what they need of it alive themselves, and dropping the model frees the
/// pooled session first.
pub struct Model<E: Engine> {
    id: OwnerId,
    engine: E,
    special: SpecialTokens,
    context_length: usize,
    pool: Arc<SessionPool<E::Context>>,
}

impl<E: Engine> Model<E> {
    /// Wraps a loaded engine with a fresh pool.
    pub fn from_engine(engine: E) -> Result<Self, InferenceError> {
        Self::with_pool(engine, Arc::new(SessionPool::new()))
    }

    /// Wraps a loaded engine, reusing sessions through `pool`.
    ///
    /// The pool may be shared with other models; each model only ever resumes
    /// or releases sessions it created itself. Fails, dropping the engine, if it
    /// reports no trained context length.
    pub fn with_pool(engine: E, pool: Arc<SessionPool<E::Context>>) -> Result<Self, InferenceError> {
        let context_length = engine.trained_context_length();
        if context_length < 1 {
            return Err(InferenceError::ModelLoad {
                path: None,
                reason: "missing n_ctx_train in model".to_string(),
            });
        }
        let special = engine.special_tokens();
        tracing::info!(
            context_length,
            bos = special.bos.0,
            eos = special.eos.0,
            nl = special.nl.0,
            "model ready"
        );
        Ok(Self {
            id: OwnerId::next(),
            engine,
            special,
            context_length,
            pool,
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn special_tokens(&self) -> SpecialTokens {
        self.special
    }

    /// Maximum number of positions a session can hold.
    pub fn context_length(&self) -> usize {
        self.context_length
    }

    pub fn pool(&self) -> &Arc<SessionPool<E::Context>> {
        &self.pool
    }

    /// Tokenizes `text` without a BOS token.
    pub fn encode(&self, text: &str) -> Result<Vec<Token>, InferenceError> {
        Ok(self.engine.tokenize(text)?)
    }

    /// Converts tokens back to text, dropping the single leading space
    /// tokenization introduces.
    pub fn decode(&self, tokens: &[Token]) -> Result<String, InferenceError> {
        let mut bytes = Vec::with_capacity(tokens.len() * 4);
        for token in tokens {
            bytes.extend_from_slice(&self.engine.token_to_piece(*token)?);
        }
        let text = String::from_utf8_lossy(&bytes);
        Ok(text.strip_prefix(' ').unwrap_or(&text).to_string())
    }

    /// Starts a prediction for `tokens` (BOS is prepended).
    ///
    /// Reuses the pooled session when there is one, evaluating only what its
    /// cache does not already hold; otherwise attaches a new context.
    pub fn predict(
        &self,
        params: &Parameters,
        tokens: &[Token],
    ) -> Result<Stream<E::Context>, InferenceError> {
        let mut request = Vec::with_capacity(tokens.len() + 1);
        request.push(self.special.bos);
        request.extend_from_slice(tokens);

        let session = match self.pool.take(self.id) {
            Some(mut session) => match session.resume(&request, params) {
                Ok(()) => session,
                Err(e) => {
                    session.free();
                    return Err(e);
                }
            },
            None => Session::initialize(&self.engine, &request, params)?,
        };
        Ok(Stream::new(session, Arc::clone(&self.pool), self.id))
    }

    /// Encodes `prompt` and starts a text prediction limited by `params.n_predict`.
    pub fn predict_text(
        &self,
        params: &Parameters,
        prompt: &str,
    ) -> Result<TextStream<'_, E>, InferenceError> {
        let tokens = self.encode(prompt)?;
        let stream = self.predict(params, &tokens)?;
        Ok(TextStream::new(self, stream, params.token_limit()))
    }

    /// Frees the pooled session, then the engine.
    pub fn close(self) {
        tracing::info!("closing model");
    }
}

impl<E: Engine> Drop for Model<E> {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}
