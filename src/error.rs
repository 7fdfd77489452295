//! Typed failures surfaced to the presentation layer.
//!
//! Every failure the orchestrator can produce maps to exactly one
//! [`ErrorKind`], so callers can tell "model unavailable" from
//! "generation failed" from "engine busy" without parsing messages.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::engine::EngineError;
use crate::prompt::PromptError;

#[derive(Error, Debug)]
pub enum AirlockError {
    #[error("model directory unavailable: {0}")]
    Catalog(#[from] CatalogError),

    #[error("model not found in catalog: {0}")]
    ModelNotFound(String),

    #[error("failed to load model {model}: {reason}")]
    EngineLoad { model: String, reason: String },

    #[error("no model is loaded")]
    NotLoaded,

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("generation exceeded the {}s limit", .0.as_secs())]
    Timeout(Duration),

    #[error("engine is busy with another request")]
    Busy,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Closed set of failure categories, stable across the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Catalog,
    ModelNotFound,
    EngineLoad,
    NotLoaded,
    Inference,
    Timeout,
    Busy,
    InvalidRequest,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Catalog => "catalog",
            ErrorKind::ModelNotFound => "model_not_found",
            ErrorKind::EngineLoad => "engine_load",
            ErrorKind::NotLoaded => "not_loaded",
            ErrorKind::Inference => "inference",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Busy => "busy",
            ErrorKind::InvalidRequest => "invalid_request",
        }
    }
}

impl AirlockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AirlockError::Catalog(_) => ErrorKind::Catalog,
            AirlockError::ModelNotFound(_) => ErrorKind::ModelNotFound,
            AirlockError::EngineLoad { .. } => ErrorKind::EngineLoad,
            AirlockError::NotLoaded => ErrorKind::NotLoaded,
            AirlockError::Inference(_) => ErrorKind::Inference,
            AirlockError::Timeout(_) => ErrorKind::Timeout,
            AirlockError::Busy => ErrorKind::Busy,
            AirlockError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    /// Only a busy rejection may be retried after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AirlockError::Busy)
    }
}

impl From<EngineError> for AirlockError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Load { model, reason } => AirlockError::EngineLoad { model, reason },
            EngineError::Release { model, reason } => AirlockError::EngineLoad {
                model,
                reason: format!("release failed: {reason}"),
            },
            EngineError::NotLoaded => AirlockError::NotLoaded,
            EngineError::Inference(reason) => AirlockError::Inference(reason),
            EngineError::Cancelled => AirlockError::Inference("generation cancelled".to_string()),
        }
    }
}

impl From<PromptError> for AirlockError {
    fn from(err: PromptError) -> Self {
        AirlockError::InvalidRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_mapping() {
        let err: AirlockError = EngineError::Load {
            model: "/m/a.gguf".to_string(),
            reason: "bad magic".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::EngineLoad);

        let err: AirlockError = EngineError::NotLoaded.into();
        assert_eq!(err.kind(), ErrorKind::NotLoaded);
    }

    #[test]
    fn test_only_busy_is_retryable() {
        assert!(AirlockError::Busy.is_retryable());
        assert!(!AirlockError::Inference("overflow".into()).is_retryable());
        assert!(!AirlockError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ModelNotFound).unwrap();
        assert_eq!(json, "\"model_not_found\"");
        assert_eq!(ErrorKind::ModelNotFound.as_str(), "model_not_found");
    }
}
