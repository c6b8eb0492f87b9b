//! Next-token selection policy
//!
//! The numeric transforms belong to the engine ([`SamplingKernels`]); this module
//! only decides which of them run, and in which order, for a given set of
//! [`Parameters`].

use crate::inference::engine::{Candidates, EngineContext, Penalties, SamplingKernels, Token};
use crate::inference::error::InferenceError;
use crate::inference::params::{Mirostat, Parameters};

/// Tokens used by Mirostat v1 to estimate `s_hat`.
const MIROSTAT_M: i32 = 100;

/// Minimum candidates kept by each filter of the standard pipeline.
const MIN_KEEP: usize = 1;

/// Selection path, chosen once per prediction from the parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Strategy {
    Greedy,
    Mirostat {
        temperature: f32,
        tau: f32,
        eta: f32,
    },
    MirostatV2 {
        temperature: f32,
        tau: f32,
        eta: f32,
    },
    Standard {
        top_k: i32,
        tfs_z: f32,
        typical_p: f32,
        top_p: f32,
        temperature: f32,
    },
}

impl Strategy {
    /// Temperature wins over Mirostat, which wins over the standard pipeline.
    pub fn from_parameters(params: &Parameters) -> Self {
        if params.temperature <= 0.0 {
            return Strategy::Greedy;
        }
        match params.mirostat {
            Mirostat::V1 => Strategy::Mirostat {
                temperature: params.temperature,
                tau: params.mirostat_tau,
                eta: params.mirostat_eta,
            },
            Mirostat::V2 => Strategy::MirostatV2 {
                temperature: params.temperature,
                tau: params.mirostat_tau,
                eta: params.mirostat_eta,
            },
            Mirostat::Disabled => Strategy::Standard {
                top_k: params.top_k,
                tfs_z: params.tfs_z,
                typical_p: params.typical_p,
                top_p: params.top_p,
                temperature: params.temperature,
            },
        }
    }

    fn select<K: SamplingKernels + ?Sized>(
        &self,
        kernels: &mut K,
        candidates: &mut Candidates,
    ) -> Option<Token> {
        match *self {
            Strategy::Greedy => kernels.greedy(candidates),
            Strategy::Mirostat {
                temperature,
                tau,
                eta,
            } => {
                kernels.temperature(candidates, temperature);
                kernels.mirostat(candidates, tau, eta, MIROSTAT_M)
            }
            Strategy::MirostatV2 {
                temperature,
                tau,
                eta,
            } => {
                kernels.temperature(candidates, temperature);
                kernels.mirostat_v2(candidates, tau, eta)
            }
            Strategy::Standard {
                top_k,
                tfs_z,
                typical_p,
                top_p,
                temperature,
            } => {
                kernels.top_k(candidates, top_k, MIN_KEEP);
                kernels.tail_free(candidates, tfs_z, MIN_KEEP);
                kernels.typical(candidates, typical_p, MIN_KEEP);
                kernels.top_p(candidates, top_p, MIN_KEEP);
                kernels.temperature(candidates, temperature);
                kernels.draw(candidates)
            }
        }
    }
}

/// Sampling configuration of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct Sampler {
    strategy: Strategy,
    penalties: Penalties,
    penalize_newline: bool,
    repeat_last_n: i32,
}

impl Sampler {
    pub fn new(params: &Parameters) -> Self {
        Self {
            strategy: Strategy::from_parameters(params),
            penalties: Penalties {
                repeat: params.repeat_penalty,
                frequency: params.frequency_penalty,
                presence: params.presence_penalty,
            },
            penalize_newline: params.penalize_newline,
            repeat_last_n: params.repeat_last_n,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Trailing part of `history` subject to repetition penalties.
    pub fn window<'h>(&self, history: &'h [Token]) -> &'h [Token] {
        let n = match self.repeat_last_n {
            n if n < 0 => history.len(),
            n => history.len().min(n as usize),
        };
        &history[history.len() - n..]
    }

    /// Picks one token from the logits the engine holds for `position`.
    pub fn sample<C: EngineContext + ?Sized>(
        &self,
        ctx: &mut C,
        position: usize,
        history: &[Token],
        newline: Token,
    ) -> Result<Token, InferenceError> {
        let mut candidates = match ctx.logits(position) {
            Some(logits) => Candidates::from_logits(logits),
            None => return Err(InferenceError::NoOutput { position }),
        };

        let window = self.window(history);
        if !window.is_empty() {
            let newline_logit = if self.penalize_newline {
                None
            } else {
                candidates.logit(newline)
            };
            ctx.penalize_repetition(&mut candidates, window, self.penalties);
            if let Some(logit) = newline_logit {
                candidates.set_logit(newline, logit);
            }
        }

        let token = self
            .strategy
            .select(ctx, &mut candidates)
            .ok_or(InferenceError::SamplingFailed { position })?;
        tracing::trace!(position, token = token.0, "sampled token");
        Ok(token)
    }
}
