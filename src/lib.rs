//! airlock: offline local-inference orchestrator.
//!
//! Discovers GGUF models in a directory, keeps at most one of them resident
//! in a native engine, folds attached files into the prompt, and runs one
//! generation at a time. Nothing here touches the network.

pub mod bridge;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod prompt;
pub mod types;

pub use catalog::{ModelCatalog, ModelDescriptor, ModelId};
pub use config::Config;
pub use error::{AirlockError, ErrorKind};
pub use orchestrator::Orchestrator;
pub use types::{Attachment, ChatTurn, Generation, InferenceRequest, InferenceResult, Role};
