//! LLM inference sessions
//!
//! Reusable KV-cache sessions over an external engine: overlap-based resume,
//! incremental evaluation and configurable token sampling.

pub mod cache;
pub mod engine;
pub mod error;
#[cfg(feature = "llama")]
pub mod llama;
pub mod model;
pub mod overlap;
pub mod params;
pub mod pool;
pub mod sampler;
pub mod session;
pub mod stream;
pub mod streaming;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use engine::{Engine, EngineContext, EngineError, SamplingKernels, SpecialTokens, Token};
pub use error::InferenceError;
#[cfg(feature = "llama")]
pub use llama::{LlamaEngine, LlamaSession, LoadOptions};
pub use model::{validate_gguf, GgufMetadata, Model, ModelError, GGUF_MAGIC};
pub use params::{Mirostat, Parameters};
pub use pool::SessionPool;
pub use session::Session;
pub use stream::Stream;
pub use streaming::{StreamToken, TextStream};
