//! Request-scoped data passed across the orchestrator boundary.
//!
//! None of these values are retained by the core beyond a single request:
//! the caller owns the transcript and attachments, and only the generated
//! text flows back.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::ModelId;

/// Who authored a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    /// The UI layer historically labels replies as `model`.
    #[serde(alias = "model")]
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// One message in a conversation transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    /// Stable identifier assigned by the caller.
    #[serde(default = "new_turn_id")]
    pub id: String,

    pub role: Role,

    pub content: String,

    /// Creation time in milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: u64,
}

fn new_turn_id() -> String {
    Uuid::new_v4().to_string()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ChatTurn {
    /// Create a turn stamped with a fresh id and the current time.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_turn_id(),
            role,
            content: content.into(),
            timestamp: now_millis(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// A turn as the engine session sees it: role and text only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub content: String,
}

impl HistoryTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<&ChatTurn> for HistoryTurn {
    fn from(turn: &ChatTurn) -> Self {
        Self::new(turn.role, turn.content.clone())
    }
}

/// A file the user attached to the current submission, already decoded to text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,

    /// Declared media type (e.g. `application/json`).
    #[serde(default = "default_media_type", alias = "type")]
    pub media_type: String,

    pub content: String,

    /// Size of the original file in bytes.
    #[serde(default)]
    pub size: u64,
}

fn default_media_type() -> String {
    "text/plain".to_string()
}

impl Attachment {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        let name = name.into();
        let content = content.into();
        Self {
            media_type: media_type_for(&name).to_string(),
            size: content.len() as u64,
            name,
            content,
        }
    }
}

/// Best-effort media type from a file name's extension.
pub fn media_type_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "json" => "application/json",
        "yaml" | "yml" => "application/yaml",
        "toml" => "application/toml",
        "xml" => "application/xml",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        _ => "text/plain",
    }
}

/// A single user submission: which model, what conversation, which files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub model_id: ModelId,

    /// Ordered oldest-first; the last turn is the one being answered.
    pub transcript: Vec<ChatTurn>,

    #[serde(default)]
    pub attachments: Vec<Attachment>,

    /// Overrides the configured system preamble for this request.
    #[serde(default)]
    pub system_instruction: Option<String>,

    /// Overrides the configured sampling temperature for this request.
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl InferenceRequest {
    pub fn new(model_id: impl Into<ModelId>, transcript: Vec<ChatTurn>) -> Self {
        Self {
            model_id: model_id.into(),
            transcript,
            attachments: Vec::new(),
            system_instruction: None,
            temperature: None,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// How the engine session was prepared before the prompt was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HistorySync {
    /// Fresh session, no prior turns fed.
    Fresh,
    /// Existing session kept; `appended` new prior turns were ingested.
    Continued { appended: usize },
    /// Session restarted and `replayed` prior turns were ingested.
    Replayed { replayed: usize },
}

/// Successful outcome of one inference turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub request_id: String,
    pub model_id: ModelId,
    pub text: String,
    pub history: HistorySync,
    pub elapsed_ms: u64,
}

/// What the orchestrator hands back for every `generate` call.
pub type InferenceResult = Result<Generation, crate::error::AirlockError>;
