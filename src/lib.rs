//! llm-session library
//!
//! Session management for local LLM inference: KV-cache reuse across
//! predictions, token sampling and persisted settings.

pub mod inference;
pub mod storage;
