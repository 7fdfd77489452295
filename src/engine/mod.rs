//! Inference engine ownership.
//!
//! - [`runtime`]: the native capability contract (runtime, model, session)
//! - [`handle`]: the single-resident-model state machine
//! - [`stub`]: built-in runtime for builds without llama.cpp
//! - `llama`: llama.cpp runtime (feature `llama`)

pub mod handle;
#[cfg(feature = "llama")]
pub mod llama;
pub mod runtime;
pub mod stub;

use std::sync::Arc;

use tokio::sync::Mutex;

pub use handle::{EngineError, EngineHandle, EngineState, LoadOutcome};
pub use runtime::{
    output_budget, CancelToken, ContextParams, ModelParams, NativeError, NativeModel,
    NativeRuntime, NativeSession, SamplingParams,
};

/// The engine behind a FIFO-fair async mutex: one operation at a time.
pub type SharedEngine = Arc<Mutex<EngineHandle>>;

/// Wrap a handle for shared use.
pub fn new_shared_engine(handle: EngineHandle) -> SharedEngine {
    Arc::new(Mutex::new(handle))
}

/// The runtime this build was compiled with.
pub fn default_runtime() -> Result<Arc<dyn NativeRuntime>, NativeError> {
    #[cfg(feature = "llama")]
    {
        Ok(Arc::new(llama::LlamaRuntime::new()?))
    }
    #[cfg(not(feature = "llama"))]
    {
        Ok(Arc::new(stub::StubRuntime::new()))
    }
}
