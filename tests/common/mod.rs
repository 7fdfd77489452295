//! Shared fixtures: a native runtime that records what the engine asks of it.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use airlock::config::Config;
use airlock::engine::{
    CancelToken, ContextParams, ModelParams, NativeError, NativeModel, NativeRuntime,
    NativeSession, SamplingParams,
};
use airlock::types::HistoryTurn;
use airlock::{ModelDescriptor, Orchestrator};

/// Prompts containing this word generate slowly.
pub const SLOW: &str = "slow";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Load(String),
    Release(String),
    Ingest(String),
    Generate(String),
}

#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<Event>>,
    pub prompts: Mutex<Vec<String>>,
    pub loads: AtomicUsize,
    pub resident: AtomicUsize,
    pub max_resident: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    /// File names whose load fails.
    pub broken: Mutex<HashSet<String>>,
    /// File names whose release reports failure.
    pub broken_release: Mutex<HashSet<String>>,
    /// How long a generation for a prompt containing [`SLOW`] runs.
    pub slow_for: Mutex<Duration>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn enter(&self) -> ActiveGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(self)
    }
}

struct ActiveGuard<'a>(&'a Recorder);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockRuntime {
    pub recorder: Arc<Recorder>,
}

impl MockRuntime {
    pub fn new() -> (Self, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        *recorder.slow_for.lock().unwrap() = Duration::from_millis(200);
        (
            Self {
                recorder: recorder.clone(),
            },
            recorder,
        )
    }
}

impl NativeRuntime for MockRuntime {
    fn load_model(
        &self,
        path: &Path,
        _params: &ModelParams,
    ) -> Result<Box<dyn NativeModel>, NativeError> {
        let _active = self.recorder.enter();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if self.recorder.broken.lock().unwrap().contains(&name) {
            return Err(NativeError::ModelLoadFailed(format!("{name} is corrupt")));
        }

        self.recorder.record(Event::Load(name.clone()));
        self.recorder.loads.fetch_add(1, Ordering::SeqCst);
        let resident = self.recorder.resident.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.max_resident.fetch_max(resident, Ordering::SeqCst);

        Ok(Box::new(MockModel {
            name,
            recorder: self.recorder.clone(),
        }))
    }
}

struct MockModel {
    name: String,
    recorder: Arc<Recorder>,
}

impl NativeModel for MockModel {
    fn new_session(&self, _params: &ContextParams) -> Result<Box<dyn NativeSession>, NativeError> {
        Ok(Box::new(MockSession {
            name: self.name.clone(),
            recorder: self.recorder.clone(),
        }))
    }

    fn close(self: Box<Self>) -> Result<(), NativeError> {
        let _active = self.recorder.enter();
        self.recorder.resident.fetch_sub(1, Ordering::SeqCst);
        self.recorder.record(Event::Release(self.name.clone()));
        if self.recorder.broken_release.lock().unwrap().contains(&self.name) {
            return Err(NativeError::ReleaseFailed(format!("{} would not unmap", self.name)));
        }
        Ok(())
    }
}

struct MockSession {
    name: String,
    recorder: Arc<Recorder>,
}

impl NativeSession for MockSession {
    fn begin(&mut self, _preamble: &str) -> Result<(), NativeError> {
        Ok(())
    }

    fn ingest(&mut self, turn: &HistoryTurn) -> Result<(), NativeError> {
        self.recorder.record(Event::Ingest(turn.content.clone()));
        Ok(())
    }

    fn generate(
        &mut self,
        prompt: &str,
        _params: &SamplingParams,
        cancel: &CancelToken,
    ) -> Result<String, NativeError> {
        let _active = self.recorder.enter();
        self.recorder.record(Event::Generate(self.name.clone()));
        self.recorder.prompts.lock().unwrap().push(prompt.to_string());

        let run_for = if prompt.contains(SLOW) {
            *self.recorder.slow_for.lock().unwrap()
        } else {
            Duration::from_millis(20)
        };
        let start = Instant::now();
        while start.elapsed() < run_for {
            if cancel.is_cancelled() {
                return Err(NativeError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        Ok(format!("{} says hi", self.name))
    }
}

/// Write a model file. The mock runtime never parses it.
pub fn write_model(dir: &Path, file: &str) {
    std::fs::write(dir.join(file), b"GGUF\x03\x00\x00\x00").unwrap();
}

pub fn config_for(dir: &Path) -> Config {
    let mut config = Config::default();
    config.catalog.models_dir = dir.to_path_buf();
    config
}

pub fn orchestrator(config: Config) -> (Arc<Orchestrator>, Arc<Recorder>) {
    let (runtime, recorder) = MockRuntime::new();
    let orchestrator = Orchestrator::new(Arc::new(config), Arc::new(runtime)).unwrap();
    (Arc::new(orchestrator), recorder)
}

/// Catalog id of the model stored as `file`.
pub fn id_of(models: &[ModelDescriptor], file: &str) -> String {
    models
        .iter()
        .find(|m| m.path.file_name().is_some_and(|f| f == file))
        .map(|m| m.id.clone())
        .unwrap_or_else(|| panic!("{file} not in catalog"))
}
