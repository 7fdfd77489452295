//! Wire types for the JSON-lines bridge.
//!
//! One request object per input line:
//!
//! ```json
//! {"id": 1, "op": "generate_response", "model_id": "/models/a.gguf", "transcript": [...]}
//! ```
//!
//! One response object per output line, echoing `id`:
//!
//! ```json
//! {"id": 1, "status": "ok", "result": {...}}
//! {"id": 1, "status": "error", "error": {"kind": "busy", "message": "...", "retryable": true}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AirlockError, ErrorKind};
use crate::types::InferenceRequest;

/// A decoded request line.
#[derive(Debug, Deserialize)]
pub struct BridgeRequest {
    /// Opaque correlation id, echoed back unchanged.
    #[serde(default)]
    pub id: Option<Value>,

    #[serde(flatten)]
    pub op: Operation,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    ListModels,
    GenerateResponse(InferenceRequest),
    Status,
    Metrics,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::ListModels => "list_models",
            Operation::GenerateResponse(_) => "generate_response",
            Operation::Status => "status",
            Operation::Metrics => "metrics",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BridgeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok { result: Value },
    Error { error: ErrorBody },
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl BridgeResponse {
    pub fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Ok { result },
        }
    }

    pub fn error(id: Option<Value>, err: &AirlockError) -> Self {
        Self {
            id,
            outcome: Outcome::Error {
                error: ErrorBody {
                    kind: err.kind(),
                    message: err.to_string(),
                    retryable: err.is_retryable(),
                },
            },
        }
    }
}

/// Decode one input line. On failure the error carries whatever `id` could
/// still be recovered so the caller can correlate the rejection.
pub fn parse_line(line: &str) -> Result<BridgeRequest, (Option<Value>, AirlockError)> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| (None, AirlockError::InvalidRequest(format!("malformed JSON: {e}"))))?;
    let id = value.get("id").cloned();
    serde_json::from_value(value).map_err(|e| (id, AirlockError::InvalidRequest(e.to_string())))
}
