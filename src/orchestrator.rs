//! Inference orchestrator: the two operations the presentation layer uses.
//!
//! `generate` walks each request through Validate → EnsureModel →
//! AssemblePrompt → Invoke → Return:
//! 1. Validates the transcript and checks the model against the latest scan
//! 2. Waits its turn for the engine (or is turned away when admission is `reject`)
//! 3. Makes the requested model resident, swapping if needed
//! 4. Builds the prompt and brings the engine session's history up to date
//! 5. Generates under the configured wall-clock limit
//!
//! Native work runs on the blocking pool with the engine lock moved into the
//! task, so the lock is held for exactly as long as the native call runs.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{ModelCatalog, ModelDescriptor, ModelId};
use crate::config::{Admission, Config, HistoryMode};
use crate::engine::{
    new_shared_engine, CancelToken, EngineError, EngineHandle, EngineState, LoadOutcome,
    NativeRuntime, SamplingParams, SharedEngine,
};
use crate::error::AirlockError;
use crate::metrics::Metrics;
use crate::prompt::PromptAssembler;
use crate::types::{Attachment, ChatTurn, Generation, InferenceRequest, InferenceResult, Role};

/// Snapshot of orchestrator state for the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub engine: EngineStatus,
    pub catalog_models: Option<usize>,
    pub models_dir: String,
    pub admission: Admission,
    pub history: HistoryMode,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineStatus {
    Empty,
    Loaded { model_id: ModelId },
    /// An operation is in flight; the resident model cannot be inspected.
    Busy,
}

pub struct Orchestrator {
    config: Arc<Config>,
    catalog: Arc<ModelCatalog>,
    engine: SharedEngine,
    assembler: PromptAssembler,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, runtime: Arc<dyn NativeRuntime>) -> anyhow::Result<Self> {
        let catalog = Arc::new(ModelCatalog::from_config(&config.catalog));
        let engine = new_shared_engine(EngineHandle::from_config(runtime, &config.engine));
        let assembler = PromptAssembler::new(config.prompt.task_marker.clone());
        let metrics = Arc::new(Metrics::new()?);

        Ok(Self {
            config,
            catalog,
            engine,
            assembler,
            metrics,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Rescan the model directory on the blocking pool. The result becomes
    /// the catalog requests are validated against.
    pub async fn list_models(&self) -> Result<Vec<ModelDescriptor>, AirlockError> {
        let catalog = self.catalog.clone();
        let snapshot = tokio::task::spawn_blocking(move || catalog.refresh())
            .await
            .map_err(|e| AirlockError::Inference(format!("catalog scan task failed: {e}")))??;
        self.metrics.catalog_models.set(snapshot.len() as i64);
        info!(
            dir = %self.catalog.dir().display(),
            count = snapshot.len(),
            "Model catalog refreshed"
        );
        Ok(snapshot.to_vec())
    }

    /// Answer the last turn of `request.transcript` with the requested model.
    pub async fn generate(&self, request: InferenceRequest) -> InferenceResult {
        let request_id = Uuid::new_v4().to_string();
        let start = Instant::now();

        info!(
            request_id,
            model = request.model_id,
            turns = request.transcript.len(),
            attachments = request.attachments.len(),
            "Inference requested"
        );

        let result = self.run(&request_id, request).await;

        match &result {
            Ok(generation) => {
                self.metrics.record_success();
                info!(
                    request_id,
                    history = ?generation.history,
                    chars = generation.text.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Generation complete"
                );
            }
            Err(e) => {
                self.metrics.record_failure(e.kind());
                warn!(request_id, kind = e.kind().as_str(), "Generation failed: {e}");
            }
        }

        result
    }

    /// The presentation-layer form of [`generate`](Self::generate): text or a typed error.
    pub async fn generate_response(
        &self,
        model_id: impl Into<ModelId>,
        transcript: Vec<ChatTurn>,
        attachments: Vec<Attachment>,
    ) -> Result<String, AirlockError> {
        let request = InferenceRequest::new(model_id, transcript).with_attachments(attachments);
        self.generate(request).await.map(|generation| generation.text)
    }

    async fn run(&self, request_id: &str, request: InferenceRequest) -> InferenceResult {
        let start = Instant::now();

        // Validate.
        let last = request
            .transcript
            .last()
            .ok_or_else(|| AirlockError::InvalidRequest("transcript is empty".to_string()))?;
        if last.role != Role::User {
            return Err(AirlockError::InvalidRequest(format!(
                "last turn must come from the user, found {}",
                last.role
            )));
        }
        let descriptor = self
            .catalog
            .lookup(&request.model_id)?
            .ok_or_else(|| AirlockError::ModelNotFound(request.model_id.clone()))?;

        let queued = Instant::now();
        let guard = match self.config.scheduler.admission {
            Admission::Queue => self.engine.clone().lock_owned().await,
            Admission::Reject => self
                .engine
                .clone()
                .try_lock_owned()
                .map_err(|_| AirlockError::Busy)?,
        };
        self.metrics
            .queue_wait_seconds
            .observe(queued.elapsed().as_secs_f64());

        // EnsureModel.
        let model_id = descriptor.id.clone();
        let model_path = descriptor.path.clone();
        let (guard, released, loaded) = tokio::task::spawn_blocking(move || {
            let mut engine = guard;
            let before = engine.resident_id().map(str::to_string);
            let outcome = engine.ensure_loaded(&model_id, &model_path);
            // Any model that was resident and no longer is has been released,
            // whether or not the new load then succeeded.
            let released = before.is_some() && engine.resident_id() != before.as_deref();
            (engine, released, outcome)
        })
        .await
        .map_err(|e| AirlockError::Inference(format!("engine task failed: {e}")))?;

        if released {
            self.metrics.model_releases.inc();
        }
        match loaded {
            Ok(LoadOutcome::Loaded { .. }) => self.metrics.model_loads.inc(),
            Ok(LoadOutcome::AlreadyResident) => {}
            Err(e) => {
                self.metrics.load_failures.inc();
                return Err(e.into());
            }
        }

        // AssemblePrompt.
        let assembled = self
            .assembler
            .assemble(&request.transcript, &request.attachments)?;
        debug!(
            request_id,
            prompt_chars = assembled.text.len(),
            prior_turns = assembled.prior.len(),
            "Prompt assembled"
        );

        // Invoke.
        let preamble = request
            .system_instruction
            .unwrap_or_else(|| self.config.prompt.system_prompt.clone());
        let mode = self.config.prompt.history;
        let params = self.sampling_params(request.temperature);
        let cancel = CancelToken::new();
        let task_cancel = cancel.clone();

        let generation_start = Instant::now();
        let mut task = tokio::task::spawn_blocking(move || {
            let mut engine = guard;
            let sync = engine.sync_history(&preamble, &assembled.prior, mode)?;
            let text = engine.prompt_as(&assembled.text, &assembled.active, &params, &task_cancel)?;
            Ok::<_, EngineError>((sync, text))
        });

        let joined = match self.config.generation.timeout() {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    // The task keeps the engine locked until it observes the cancel.
                    cancel.cancel();
                    self.metrics
                        .generation_seconds
                        .observe(generation_start.elapsed().as_secs_f64());
                    return Err(AirlockError::Timeout(limit));
                }
            },
            None => task.await,
        };
        self.metrics
            .generation_seconds
            .observe(generation_start.elapsed().as_secs_f64());

        let (history, text) = joined
            .map_err(|e| AirlockError::Inference(format!("engine task failed: {e}")))??;

        // Return.
        Ok(Generation {
            request_id: request_id.to_string(),
            model_id: descriptor.id,
            text,
            history,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn sampling_params(&self, temperature: Option<f32>) -> SamplingParams {
        let generation = &self.config.generation;
        SamplingParams {
            max_tokens: generation.max_tokens,
            temperature: temperature
                .unwrap_or(generation.temperature)
                .clamp(0.0, 2.0),
            top_p: generation.top_p,
            seed: generation.seed,
        }
    }

    /// Current engine and catalog state. Never waits for the engine.
    pub fn status(&self) -> Status {
        let engine = match self.engine.try_lock() {
            Ok(handle) => match handle.state() {
                EngineState::Empty => EngineStatus::Empty,
                EngineState::Loaded(model_id) => EngineStatus::Loaded { model_id },
            },
            Err(_) => EngineStatus::Busy,
        };

        Status {
            engine,
            catalog_models: self.catalog.latest().map(|s| s.len()),
            models_dir: self.catalog.dir().display().to_string(),
            admission: self.config.scheduler.admission,
            history: self.config.prompt.history,
        }
    }

    /// Release the resident model. Waits for any in-flight operation first.
    pub async fn shutdown(&self) -> Result<(), AirlockError> {
        let guard = self.engine.clone().lock_owned().await;
        let (had_model, released) = tokio::task::spawn_blocking(move || {
            let mut engine = guard;
            let had_model = engine.resident_id().is_some();
            (had_model, engine.release())
        })
        .await
        .map_err(|e| AirlockError::Inference(format!("engine task failed: {e}")))?;

        if had_model {
            self.metrics.model_releases.inc();
        }
        released?;
        info!("Engine shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::engine::stub::StubRuntime;
    use crate::types::HistorySync;

    fn write_model(dir: &Path, name: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, crate::catalog::gguf::tests::synthetic_header("llama", 15, false))
            .unwrap();
        std::fs::canonicalize(path)
            .unwrap()
            .to_string_lossy()
            .into_owned()
    }

    fn orchestrator(dir: &Path, runtime: StubRuntime, tweak: impl FnOnce(&mut Config)) -> Orchestrator {
        let mut config = Config::default();
        config.catalog.models_dir = dir.to_path_buf();
        tweak(&mut config);
        Orchestrator::new(Arc::new(config), Arc::new(runtime)).unwrap()
    }

    #[tokio::test]
    async fn test_generate_replays_then_continues() {
        let dir = tempfile::tempdir().unwrap();
        let id = write_model(dir.path(), "tiny.gguf");
        let orch = orchestrator(dir.path(), StubRuntime::new(), |_| {});
        orch.list_models().await.unwrap();

        let mut transcript = vec![ChatTurn::user("hello there")];
        let first = orch
            .generate(InferenceRequest::new(id.clone(), transcript.clone()))
            .await
            .unwrap();
        assert_eq!(first.history, HistorySync::Fresh);

        transcript.push(ChatTurn::assistant(first.text.clone()));
        transcript.push(ChatTurn::user("and again"));
        let second = orch
            .generate(InferenceRequest::new(id.clone(), transcript))
            .await
            .unwrap();
        assert_eq!(second.history, HistorySync::Continued { appended: 0 });
        assert!(second.text.contains("2 earlier turns"));
    }

    #[tokio::test]
    async fn test_attachments_reach_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let id = write_model(dir.path(), "tiny.gguf");
        let orch = orchestrator(dir.path(), StubRuntime::new(), |_| {});
        orch.list_models().await.unwrap();

        let request = InferenceRequest::new(id, vec![ChatTurn::user("fix it")])
            .with_attachments(vec![Attachment::new("config.json", r#"{"a":1}"#)]);
        let generation = orch.generate(request).await.unwrap();
        // Delimiters, marker and instruction all count as words.
        assert!(generation.text.contains("Received 12 words"));
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let id = write_model(dir.path(), "tiny.gguf");
        let runtime = StubRuntime::new().with_token_delay(Duration::from_millis(400));
        let orch = orchestrator(dir.path(), runtime, |c| c.generation.timeout_secs = 1);
        orch.list_models().await.unwrap();

        let err = orch
            .generate(InferenceRequest::new(id, vec![ChatTurn::user("slow")]))
            .await
            .unwrap_err();
        assert!(matches!(err, AirlockError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_non_user_tail_rejected_before_engine() {
        let dir = tempfile::tempdir().unwrap();
        let id = write_model(dir.path(), "tiny.gguf");
        let orch = orchestrator(dir.path(), StubRuntime::new(), |_| {});
        orch.list_models().await.unwrap();

        let err = orch
            .generate(InferenceRequest::new(id, vec![ChatTurn::assistant("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, AirlockError::InvalidRequest(_)));
        assert!(matches!(orch.status().engine, EngineStatus::Empty));
    }

    #[tokio::test]
    async fn test_metrics_follow_every_release_and_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_model(dir.path(), "a.gguf");
        std::fs::write(dir.path().join("broken.gguf"), b"not a model").unwrap();
        let broken = std::fs::canonicalize(dir.path().join("broken.gguf"))
            .unwrap()
            .to_string_lossy()
            .into_owned();
        let runtime = StubRuntime::new().with_token_delay(Duration::from_millis(400));
        let orch = orchestrator(dir.path(), runtime, |c| c.generation.timeout_secs = 1);
        orch.list_models().await.unwrap();

        let err = orch
            .generate(InferenceRequest::new(a.clone(), vec![ChatTurn::user("slow")]))
            .await
            .unwrap_err();
        assert!(matches!(err, AirlockError::Timeout(_)));
        assert_eq!(orch.metrics().generation_seconds.get_sample_count(), 1);

        // Swap away from `a`, then fail to load the replacement.
        let err = orch
            .generate(InferenceRequest::new(broken, vec![ChatTurn::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, AirlockError::EngineLoad { .. }));
        assert_eq!(orch.metrics().model_releases.get(), 1);
        assert_eq!(orch.metrics().load_failures.get(), 1);

        orch.generate(InferenceRequest::new(a, vec![ChatTurn::user("hi")]))
            .await
            .ok();
        orch.shutdown().await.unwrap();
        assert_eq!(orch.metrics().model_loads.get(), 2);
        assert_eq!(orch.metrics().model_releases.get(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_releases_model() {
        let dir = tempfile::tempdir().unwrap();
        let id = write_model(dir.path(), "tiny.gguf");
        let orch = orchestrator(dir.path(), StubRuntime::new(), |_| {});
        orch.list_models().await.unwrap();

        orch.generate(InferenceRequest::new(id.clone(), vec![ChatTurn::user("hi")]))
            .await
            .unwrap();
        assert!(matches!(orch.status().engine, EngineStatus::Loaded { ref model_id } if *model_id == id));

        orch.shutdown().await.unwrap();
        assert!(matches!(orch.status().engine, EngineStatus::Empty));
    }
}
