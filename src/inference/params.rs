//! Prediction parameters
//!
//! Field names and defaults follow the llama.cpp server API so that existing
//! request bodies deserialize unchanged.

use serde::{Deserialize, Serialize};

/// Mirostat mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Mirostat {
    #[default]
    Disabled,
    /// Mirostat
    V1,
    /// Mirostat 2.0
    V2,
}

impl TryFrom<u8> for Mirostat {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Mirostat::Disabled),
            1 => Ok(Mirostat::V1),
            2 => Ok(Mirostat::V2),
            other => Err(format!("unknown mirostat mode {other}")),
        }
    }
}

impl From<Mirostat> for u8 {
    fn from(value: Mirostat) -> Self {
        match value {
            Mirostat::Disabled => 0,
            Mirostat::V1 => 1,
            Mirostat::V2 => 2,
        }
    }
}

/// Sampling and generation parameters for one prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    /// Temperature for sampling (0.0 or below = greedy, no randomness)
    pub temperature: f32,
    /// Apply repetition penalties to the newline token too
    #[serde(rename = "penalize_nl")]
    pub penalize_newline: bool,
    /// Limits selection to the K most probable tokens (0 = disabled)
    pub top_k: i32,
    /// Nucleus sampling threshold (1.0 = disabled)
    pub top_p: f32,
    /// Tokens to generate: 0 evaluates the prompt only, -1 is unbounded
    pub n_predict: i32,
    /// Tail free sampling parameter z (1.0 = disabled)
    #[serde(rename = "tfsz")]
    pub tfs_z: f32,
    /// Locally typical sampling parameter p (1.0 = disabled)
    pub typical_p: f32,
    /// Penalty for repeating tokens from the recent window
    pub repeat_penalty: f32,
    /// Recent window size for penalties (0 = disabled, -1 = whole history)
    pub repeat_last_n: i32,
    /// Alpha presence penalty (0.0 = disabled)
    pub presence_penalty: f32,
    /// Alpha frequency penalty (0.0 = disabled)
    pub frequency_penalty: f32,
    pub mirostat: Mirostat,
    /// Mirostat target entropy
    pub mirostat_tau: f32,
    /// Mirostat learning rate
    pub mirostat_eta: f32,
    /// Seed for sampling (0 = pick a fresh random seed per prediction)
    pub seed: u32,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            penalize_newline: false,
            top_k: 40,
            top_p: 0.9,
            n_predict: 128,
            tfs_z: 1.0,
            typical_p: 1.0,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            mirostat: Mirostat::Disabled,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            seed: 0,
        }
    }
}

impl Parameters {
    /// Seed to use for this prediction; never zero.
    pub fn resolve_seed(&self) -> u32 {
        if self.seed != 0 {
            return self.seed;
        }
        loop {
            let seed = rand_seed();
            if seed != 0 {
                return seed;
            }
        }
    }

    /// Generation limit, `None` when unbounded.
    pub fn token_limit(&self) -> Option<usize> {
        usize::try_from(self.n_predict).ok()
    }
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
