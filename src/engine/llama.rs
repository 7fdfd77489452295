//! llama.cpp runtime via `llama-cpp-2` (cargo feature `llama`).
//!
//! A `LlamaContext` borrows its model, so a session keeps the conversation as
//! chat messages and materialises a native context for each generation,
//! prefilling the templated conversation in batch-sized chunks. Session
//! creation allocates one context up front so an unusable window size is
//! reported as a load failure.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use tracing::{debug, info, warn};

use crate::engine::runtime::{
    output_budget, CancelToken, ContextParams, ModelParams, NativeError, NativeModel,
    NativeRuntime, NativeSession, SamplingParams,
};
use crate::types::{HistoryTurn, Role};

/// Process-wide llama.cpp backend. Initialise once.
pub struct LlamaRuntime {
    backend: Arc<LlamaBackend>,
}

impl LlamaRuntime {
    pub fn new() -> Result<Self, NativeError> {
        let backend =
            LlamaBackend::init().map_err(|e| NativeError::ModelLoadFailed(e.to_string()))?;
        Ok(Self {
            backend: Arc::new(backend),
        })
    }
}

impl NativeRuntime for LlamaRuntime {
    fn load_model(
        &self,
        path: &Path,
        params: &ModelParams,
    ) -> Result<Box<dyn NativeModel>, NativeError> {
        // Negative means "offload everything"; llama.cpp caps at the layer count.
        let gpu_layers = u32::try_from(params.n_gpu_layers).unwrap_or(u32::MAX);
        let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);

        let model = LlamaModel::load_from_file(&self.backend, path, &model_params)
            .map_err(|e| NativeError::ModelLoadFailed(e.to_string()))?;

        let template = match model.chat_template(None) {
            Ok(t) => t,
            Err(_) => {
                warn!("Model has no embedded chat template, falling back to chatml");
                LlamaChatTemplate::new("chatml")
                    .map_err(|e| NativeError::ModelLoadFailed(e.to_string()))?
            }
        };

        info!(path = %path.display(), gpu_layers, "llama.cpp model loaded");

        Ok(Box::new(LlamaLoadedModel {
            backend: self.backend.clone(),
            model: Arc::new(model),
            template: Arc::new(template),
        }))
    }
}

struct LlamaLoadedModel {
    backend: Arc<LlamaBackend>,
    model: Arc<LlamaModel>,
    template: Arc<LlamaChatTemplate>,
}

impl NativeModel for LlamaLoadedModel {
    fn new_session(&self, params: &ContextParams) -> Result<Box<dyn NativeSession>, NativeError> {
        let n_ctx = NonZeroU32::new(params.n_ctx)
            .ok_or_else(|| NativeError::ContextFailed("context size is zero".to_string()))?;
        let session = LlamaSession {
            backend: self.backend.clone(),
            model: self.model.clone(),
            template: self.template.clone(),
            n_ctx,
            n_batch: params.n_batch.max(1),
            n_threads: params.n_threads,
            messages: Vec::new(),
        };

        // Allocate the window once so an oversized context fails the load,
        // not the first prompt. It borrows the model and cannot be kept.
        let trial_ctx = self
            .model
            .new_context(&self.backend, session.context_params())
            .map_err(|e| NativeError::ContextFailed(e.to_string()))?;
        drop(trial_ctx);
        debug!(n_ctx = n_ctx.get(), "llama.cpp context allocated");

        Ok(Box::new(session))
    }
}

struct LlamaSession {
    backend: Arc<LlamaBackend>,
    model: Arc<LlamaModel>,
    template: Arc<LlamaChatTemplate>,
    n_ctx: NonZeroU32,
    n_batch: u32,
    n_threads: u32,
    messages: Vec<(String, String)>,
}

impl LlamaSession {
    fn context_params(&self) -> LlamaContextParams {
        let params = LlamaContextParams::default()
            .with_n_ctx(Some(self.n_ctx))
            .with_n_batch(self.n_batch);
        if self.n_threads > 0 {
            params
                .with_n_threads(self.n_threads as i32)
                .with_n_threads_batch(self.n_threads as i32)
        } else {
            params
        }
    }

    fn chat_messages(&self) -> Result<Vec<LlamaChatMessage>, NativeError> {
        self.messages
            .iter()
            .map(|(role, content)| {
                LlamaChatMessage::new(role.clone(), content.clone())
                    .map_err(|e| NativeError::DecodeFailed(e.to_string()))
            })
            .collect()
    }
}

impl NativeSession for LlamaSession {
    fn begin(&mut self, preamble: &str) -> Result<(), NativeError> {
        self.messages.clear();
        if !preamble.is_empty() {
            self.messages
                .push((Role::System.to_string(), preamble.to_string()));
        }
        Ok(())
    }

    fn ingest(&mut self, turn: &HistoryTurn) -> Result<(), NativeError> {
        self.messages
            .push((turn.role.to_string(), turn.content.clone()));
        Ok(())
    }

    fn generate(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
        cancel: &CancelToken,
    ) -> Result<String, NativeError> {
        self.messages
            .push((Role::User.to_string(), prompt.to_string()));

        let rendered = self
            .model
            .apply_chat_template(&self.template, &self.chat_messages()?, true)
            .map_err(|e| NativeError::DecodeFailed(e.to_string()))?;

        let tokens = self
            .model
            .str_to_token(&rendered, AddBos::Always)
            .map_err(|e| NativeError::DecodeFailed(e.to_string()))?;

        let capacity = self.n_ctx.get() as usize;
        let budget = match output_budget(tokens.len(), capacity, params.max_tokens) {
            Ok(budget) => budget,
            Err(e) => {
                self.messages.pop();
                return Err(e);
            }
        };

        let mut ctx = self
            .model
            .new_context(&self.backend, self.context_params())
            .map_err(|e| NativeError::ContextFailed(e.to_string()))?;

        let mut batch = LlamaBatch::new(self.n_batch as usize, 1);
        let last_pos = (tokens.len() as i32).saturating_sub(1);
        let mut pos = 0i32;
        for chunk in tokens.chunks(self.n_batch as usize) {
            batch.clear();
            for &token in chunk {
                batch
                    .add(token, pos, &[0], pos == last_pos)
                    .map_err(|e| NativeError::DecodeFailed(e.to_string()))?;
                pos += 1;
            }
            ctx.decode(&mut batch)
                .map_err(|e| NativeError::DecodeFailed(e.to_string()))?;
        }

        let mut sampler = if params.temperature <= 0.0 {
            LlamaSampler::greedy()
        } else {
            LlamaSampler::chain_simple([
                LlamaSampler::top_p(params.top_p, 1),
                LlamaSampler::temp(params.temperature),
                LlamaSampler::dist(params.seed),
            ])
        };

        // One decoder for the whole reply: a token may end mid-character.
        let mut decoder = encoding_rs::UTF_8.new_decoder();
        let mut output = String::new();
        let mut n_cur = tokens.len() as i32;
        for _ in 0..budget {
            if cancel.is_cancelled() {
                self.messages.pop();
                return Err(NativeError::Cancelled);
            }

            let token = sampler.sample(&ctx, batch.n_tokens() - 1);
            sampler.accept(token);
            if self.model.is_eog_token(token) {
                break;
            }

            let piece = self
                .model
                .token_to_piece(token, &mut decoder, true, None)
                .map_err(|e| NativeError::DecodeFailed(format!("failed to decode token: {e}")))?;
            output.push_str(&piece);

            batch.clear();
            batch
                .add(token, n_cur, &[0], true)
                .map_err(|e| NativeError::DecodeFailed(e.to_string()))?;
            n_cur += 1;
            ctx.decode(&mut batch)
                .map_err(|e| NativeError::DecodeFailed(e.to_string()))?;
        }

        debug!(
            prompt_tokens = tokens.len(),
            generated = n_cur as usize - tokens.len(),
            "llama.cpp generation complete"
        );

        self.messages
            .push((Role::Assistant.to_string(), output.clone()));
        Ok(output)
    }
}
