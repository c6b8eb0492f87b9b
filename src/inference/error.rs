//! Prediction errors

use std::path::PathBuf;
use thiserror::Error;

use crate::inference::engine::EngineError;

/// Errors returned by model loading, prediction and token generation
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InferenceError {
    #[error("{tokens} tokens of input exceeds maximum {max} tokens")]
    InputTooLarge { tokens: usize, max: usize },

    #[error("context full")]
    ContextFull,

    #[error("eval failed, cache overflow")]
    CacheOverflow,

    #[error("eval failed with error {code}")]
    EvaluationFailed { code: i32 },

    #[error("no output available at position {position}")]
    NoOutput { position: usize },

    #[error("engine failed to produce a token at position {position}")]
    SamplingFailed { position: usize },

    /// Generation is complete; not a failure.
    #[error("end of stream")]
    EndOfStream,

    /// `path` is `None` when the engine was loaded elsewhere.
    #[error("failed to load model{}: {reason}", path_suffix(.path))]
    ModelLoad {
        path: Option<PathBuf>,
        reason: String,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

fn path_suffix(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" {}", path.display()),
        None => String::new(),
    }
}

impl InferenceError {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, InferenceError::EndOfStream)
    }

    /// True when the engine cache may no longer match the session history.
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            InferenceError::CacheOverflow
                | InferenceError::EvaluationFailed { .. }
                | InferenceError::Engine(EngineError::CacheEdit(_))
        )
    }
}
