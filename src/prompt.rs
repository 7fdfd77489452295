//! Turns a transcript plus attachments into the text for one engine turn.
//!
//! The last turn is the one being answered. Attached files are rendered as
//! delimited blocks ahead of it, followed by a task marker and the user's own
//! words. Earlier turns are returned separately, minus system turns, for the
//! orchestrator to feed to the session. Nothing is truncated here; an
//! oversized prompt fails in the engine.

use thiserror::Error;

use crate::types::{Attachment, ChatTurn, HistoryTurn, Role};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PromptError {
    #[error("transcript is empty")]
    EmptyTranscript,

    #[error("last turn must come from the user, found {0}")]
    NotUserTurn(Role),
}

/// Output of [`PromptAssembler::assemble`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledPrompt {
    /// Text sent to the engine for this turn.
    pub text: String,

    /// The active turn as the caller's transcript records it.
    pub active: HistoryTurn,

    /// Earlier turns, oldest first, without system turns.
    pub prior: Vec<HistoryTurn>,
}

#[derive(Debug, Clone)]
pub struct PromptAssembler {
    task_marker: String,
}

impl Default for PromptAssembler {
    fn default() -> Self {
        Self::new("Task:")
    }
}

impl PromptAssembler {
    pub fn new(task_marker: impl Into<String>) -> Self {
        Self {
            task_marker: task_marker.into(),
        }
    }

    pub fn assemble(
        &self,
        transcript: &[ChatTurn],
        attachments: &[Attachment],
    ) -> Result<AssembledPrompt, PromptError> {
        let (last, earlier) = transcript
            .split_last()
            .ok_or(PromptError::EmptyTranscript)?;
        if last.role != Role::User {
            return Err(PromptError::NotUserTurn(last.role));
        }

        let text = if attachments.is_empty() {
            last.content.clone()
        } else {
            let files: String = attachments.iter().map(render_attachment).collect();
            format!("{files}\n\n{} {}", self.task_marker, last.content)
        };

        let prior = earlier
            .iter()
            .filter(|turn| turn.role != Role::System)
            .map(HistoryTurn::from)
            .collect();

        Ok(AssembledPrompt {
            text,
            active: HistoryTurn::from(last),
            prior,
        })
    }
}

fn render_attachment(file: &Attachment) -> String {
    format!(
        "\n--- FILE: {} ---\n{}\n--- END FILE ---\n",
        file.name, file.content
    )
}
