//! The engine handle: at most one resident model and its session.
//!
//! State is either `Empty` or `Loaded(id)`. The model, its session and the
//! recorded id live in one [`Resident`] value, so a session can never outlive
//! or be paired with a different model than the one recorded as loaded.
//! Every transition that can fail leaves the handle `Empty` rather than
//! half-initialised.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::ModelId;
use crate::config::{EngineConfig, HistoryMode};
use crate::engine::runtime::{
    CancelToken, ContextParams, ModelParams, NativeError, NativeModel, NativeRuntime,
    NativeSession, SamplingParams,
};
use crate::types::{HistorySync, HistoryTurn, Role};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to load model {model}: {reason}")]
    Load { model: String, reason: String },

    #[error("failed to release model {model}: {reason}")]
    Release { model: String, reason: String },

    #[error("no model is loaded")]
    NotLoaded,

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("generation cancelled")]
    Cancelled,
}

/// Observable handle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Empty,
    Loaded(ModelId),
}

/// What `ensure_loaded` had to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The requested model was already resident.
    AlreadyResident,
    /// The model was loaded, replacing `replaced` if something was resident.
    Loaded { replaced: Option<ModelId> },
}

/// Exactly what the live session has consumed since it last began.
struct Consumed {
    preamble: String,
    turns: Vec<HistoryTurn>,
}

struct Resident {
    id: ModelId,
    model: Box<dyn NativeModel>,
    session: Box<dyn NativeSession>,
    /// `None` when the session state is unknown (fresh or after a failure).
    consumed: Option<Consumed>,
}

/// Owns zero or one resident model. Not shareable by itself; wrap it in a
/// mutex to serialise callers.
pub struct EngineHandle {
    runtime: Arc<dyn NativeRuntime>,
    model_params: ModelParams,
    context_params: ContextParams,
    resident: Option<Resident>,
}

impl EngineHandle {
    pub fn new(
        runtime: Arc<dyn NativeRuntime>,
        model_params: ModelParams,
        context_params: ContextParams,
    ) -> Self {
        Self {
            runtime,
            model_params,
            context_params,
            resident: None,
        }
    }

    pub fn from_config(runtime: Arc<dyn NativeRuntime>, config: &EngineConfig) -> Self {
        Self::new(
            runtime,
            ModelParams {
                n_gpu_layers: config.n_gpu_layers,
                ..Default::default()
            },
            ContextParams {
                n_ctx: config.context_size,
                n_batch: config.batch_size,
                n_threads: config.threads,
            },
        )
    }

    pub fn state(&self) -> EngineState {
        match &self.resident {
            Some(r) => EngineState::Loaded(r.id.clone()),
            None => EngineState::Empty,
        }
    }

    pub fn resident_id(&self) -> Option<&str> {
        self.resident.as_ref().map(|r| r.id.as_str())
    }

    /// Make `id` (stored at `path`) the resident model.
    ///
    /// A no-op when it already is. Otherwise the current model is fully
    /// released before the new one is read from disk, so at most one model
    /// occupies memory at any time.
    pub fn ensure_loaded(&mut self, id: &str, path: &Path) -> Result<LoadOutcome, EngineError> {
        if self.resident_id() == Some(id) {
            debug!(model = id, "Model already resident");
            return Ok(LoadOutcome::AlreadyResident);
        }

        let replaced = self.resident_id().map(str::to_string);
        if let Err(e) = self.release() {
            // The handle is Empty now; report and let the caller try again.
            return Err(EngineError::Load {
                model: id.to_string(),
                reason: format!("could not release previous model: {e}"),
            });
        }

        let start = Instant::now();
        info!(model = id, replaced = ?replaced, "Loading model");

        let load_err = |e: NativeError| EngineError::Load {
            model: id.to_string(),
            reason: e.to_string(),
        };

        let model = self
            .runtime
            .load_model(path, &self.model_params)
            .map_err(load_err)?;

        let session = match model.new_session(&self.context_params) {
            Ok(session) => session,
            Err(e) => {
                if let Err(close_err) = model.close() {
                    warn!(model = id, "Closing model after failed context creation: {close_err}");
                }
                return Err(load_err(e));
            }
        };

        self.resident = Some(Resident {
            id: id.to_string(),
            model,
            session,
            consumed: None,
        });

        info!(
            model = id,
            n_ctx = self.context_params.n_ctx,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Model loaded"
        );
        Ok(LoadOutcome::Loaded { replaced })
    }

    /// Tear down the resident session and model. Releasing an empty handle
    /// is a no-op. The handle is `Empty` afterwards even when a native
    /// release step reports failure.
    pub fn release(&mut self) -> Result<(), EngineError> {
        let Some(resident) = self.resident.take() else {
            return Ok(());
        };

        let Resident {
            id, model, session, ..
        } = resident;

        // Context before weights.
        let session_result = session.close();
        let model_result = model.close();

        match session_result.and(model_result) {
            Ok(()) => {
                info!(model = id, "Model released");
                Ok(())
            }
            Err(e) => {
                warn!(model = id, "Model release reported failure: {e}");
                Err(EngineError::Release {
                    model: id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Prepare the session for the next prompt under `mode`.
    ///
    /// With [`HistoryMode::Replay`], a session whose consumed turns are a
    /// prefix of `prior` (under the same preamble) is continued by ingesting
    /// only the missing turns. Anything else restarts the session and feeds
    /// all of `prior`. Empty `prior` always starts fresh.
    pub fn sync_history(
        &mut self,
        preamble: &str,
        prior: &[HistoryTurn],
        mode: HistoryMode,
    ) -> Result<HistorySync, EngineError> {
        let resident = self.resident.as_mut().ok_or(EngineError::NotLoaded)?;
        let Resident {
            session, consumed, ..
        } = resident;

        if mode == HistoryMode::Replay && !prior.is_empty() {
            if let Some(seen) = consumed.as_mut() {
                if seen.preamble == preamble && prior.starts_with(&seen.turns) {
                    let missing = &prior[seen.turns.len()..];
                    for turn in missing {
                        if let Err(e) = session.ingest(turn) {
                            *consumed = None;
                            return Err(EngineError::Inference(e.to_string()));
                        }
                        seen.turns.push(turn.clone());
                    }
                    return Ok(HistorySync::Continued {
                        appended: missing.len(),
                    });
                }
            }
        }

        *consumed = None;
        session
            .begin(preamble)
            .map_err(|e| EngineError::Inference(e.to_string()))?;

        let feed: &[HistoryTurn] = match mode {
            HistoryMode::Replay => prior,
            HistoryMode::SingleShot => &[],
        };
        for turn in feed {
            session
                .ingest(turn)
                .map_err(|e| EngineError::Inference(e.to_string()))?;
        }

        *consumed = Some(Consumed {
            preamble: preamble.to_string(),
            turns: feed.to_vec(),
        });

        Ok(if feed.is_empty() {
            HistorySync::Fresh
        } else {
            HistorySync::Replayed {
                replayed: feed.len(),
            }
        })
    }

    /// Generate a reply to `text`.
    pub fn prompt(
        &mut self,
        text: &str,
        params: &SamplingParams,
        cancel: &CancelToken,
    ) -> Result<String, EngineError> {
        let turn = HistoryTurn::new(Role::User, text);
        self.prompt_as(text, &turn, params, cancel)
    }

    /// Generate a reply to `text`, remembering the exchange as `turn` plus
    /// the reply. The caller's transcript will carry `turn` rather than the
    /// expanded prompt text, so that is what later requests are matched
    /// against.
    pub fn prompt_as(
        &mut self,
        text: &str,
        turn: &HistoryTurn,
        params: &SamplingParams,
        cancel: &CancelToken,
    ) -> Result<String, EngineError> {
        let resident = self.resident.as_mut().ok_or(EngineError::NotLoaded)?;

        match resident.session.generate(text, params, cancel) {
            Ok(reply) => {
                if let Some(seen) = resident.consumed.as_mut() {
                    seen.turns.push(turn.clone());
                    seen.turns
                        .push(HistoryTurn::new(Role::Assistant, reply.clone()));
                }
                Ok(reply)
            }
            Err(e) => {
                resident.consumed = None;
                match e {
                    NativeError::Cancelled => Err(EngineError::Cancelled),
                    other => Err(EngineError::Inference(other.to_string())),
                }
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Release on drop failed: {e}");
        }
    }
}
