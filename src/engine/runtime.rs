//! The native inference capability, as seen by the engine handle.
//!
//! A runtime loads model artifacts; a model opens sessions; a session holds
//! the tokenized conversation state and compute buffers for one context
//! window. Implementations are blocking and are only ever driven from one
//! thread at a time by [`EngineHandle`](crate::engine::EngineHandle).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::types::HistoryTurn;

#[derive(Error, Debug)]
pub enum NativeError {
    #[error("failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("context creation failed: {0}")]
    ContextFailed(String),

    #[error("context window exhausted: {used} of {capacity} tokens")]
    ContextOverflow { used: usize, capacity: usize },

    #[error("decode failed: {0}")]
    DecodeFailed(String),

    #[error("release failed: {0}")]
    ReleaseFailed(String),

    #[error("generation cancelled")]
    Cancelled,
}

/// Model parameters (mirrors llama_model_params).
#[derive(Debug, Clone)]
pub struct ModelParams {
    /// Number of GPU layers to offload (-1 = all).
    pub n_gpu_layers: i32,

    /// Use memory mapping for the model file.
    pub use_mmap: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: 0,
            use_mmap: true,
        }
    }
}

/// Context parameters (mirrors llama_context_params).
#[derive(Debug, Clone)]
pub struct ContextParams {
    /// Context size in tokens.
    pub n_ctx: u32,

    /// Batch size for prompt processing.
    pub n_batch: u32,

    /// Number of threads for computation (0 = runtime default).
    pub n_threads: u32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_batch: 512,
            n_threads: 0,
        }
    }
}

/// Per-turn generation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// Maximum tokens to generate.
    pub max_tokens: u32,

    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,

    /// Top-p (nucleus) sampling threshold.
    pub top_p: f32,

    pub seed: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.7,
            top_p: 0.9,
            seed: 1234,
        }
    }
}

/// Cooperative cancellation flag checked between generated tokens.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Tokens a generation may produce once `used` tokens occupy a window of
/// `capacity`: whatever room is left, capped at `max_tokens`. Fails only when
/// the prompt leaves no room at all.
pub fn output_budget(used: usize, capacity: usize, max_tokens: u32) -> Result<usize, NativeError> {
    if used >= capacity {
        return Err(NativeError::ContextOverflow { used, capacity });
    }
    Ok((capacity - used).min(max_tokens as usize))
}

/// Loads model artifacts from disk.
pub trait NativeRuntime: Send + Sync {
    fn load_model(
        &self,
        path: &Path,
        params: &ModelParams,
    ) -> Result<Box<dyn NativeModel>, NativeError>;
}

/// A loaded model; owns the weights.
pub trait NativeModel: Send {
    /// Allocate a session sized by `params`.
    fn new_session(&self, params: &ContextParams) -> Result<Box<dyn NativeSession>, NativeError>;

    /// Free the weights. Dropping without calling this also frees them.
    fn close(self: Box<Self>) -> Result<(), NativeError> {
        Ok(())
    }
}

/// Conversation state and compute buffers bound to one model.
pub trait NativeSession: Send {
    /// Clear all state and start over with `preamble` as the system prompt.
    fn begin(&mut self, preamble: &str) -> Result<(), NativeError>;

    /// Feed a prior turn into the session without generating.
    fn ingest(&mut self, turn: &HistoryTurn) -> Result<(), NativeError>;

    /// Append a user prompt and generate the reply. The reply becomes part
    /// of the session state.
    fn generate(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
        cancel: &CancelToken,
    ) -> Result<String, NativeError>;

    /// Free the compute buffers. Dropping without calling this also frees them.
    fn close(self: Box<Self>) -> Result<(), NativeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_shared_between_clones() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn test_output_budget_uses_remaining_window() {
        // A long prompt shrinks the reply instead of failing.
        assert_eq!(output_budget(2100, 4096, 2048).unwrap(), 1996);
        assert_eq!(output_budget(100, 4096, 2048).unwrap(), 2048);
        assert_eq!(output_budget(4095, 4096, 2048).unwrap(), 1);

        let err = output_budget(4096, 4096, 2048).unwrap_err();
        assert!(matches!(err, NativeError::ContextOverflow { used: 4096, capacity: 4096 }));
    }
}
