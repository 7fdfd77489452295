//! Built-in runtime used when no native backend is compiled in.
//!
//! It validates artifacts the way the real loader would (file present, GGUF
//! magic), accounts for context usage at roughly one token per four
//! characters, and produces deterministic replies so the orchestration path
//! can be exercised end to end without llama.cpp.

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::catalog::gguf;
use crate::engine::runtime::{
    output_budget, CancelToken, ContextParams, ModelParams, NativeError, NativeModel,
    NativeRuntime, NativeSession, SamplingParams,
};
use crate::types::HistoryTurn;

/// Stub runtime handle.
#[derive(Debug, Clone, Default)]
pub struct StubRuntime {
    /// Simulated time per generated token.
    token_delay: Duration,
}

impl StubRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slow generation down, e.g. to exercise timeouts.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }
}

/// Approximate token count: about one token per four characters.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

impl NativeRuntime for StubRuntime {
    fn load_model(
        &self,
        path: &Path,
        _params: &ModelParams,
    ) -> Result<Box<dyn NativeModel>, NativeError> {
        let is_gguf = gguf::has_magic(path)
            .map_err(|e| NativeError::ModelLoadFailed(format!("{}: {e}", path.display())))?;
        if !is_gguf {
            return Err(NativeError::ModelLoadFailed(format!(
                "{} is not a GGUF file",
                path.display()
            )));
        }

        let architecture = gguf::read_header(path)
            .ok()
            .and_then(|h| h.architecture)
            .unwrap_or_else(|| "llama".to_string());
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        debug!(model = name, arch = architecture, "Stub model loaded");

        Ok(Box::new(StubModel {
            name,
            token_delay: self.token_delay,
        }))
    }
}

/// Stub model handle.
pub struct StubModel {
    name: String,
    token_delay: Duration,
}

impl NativeModel for StubModel {
    fn new_session(&self, params: &ContextParams) -> Result<Box<dyn NativeSession>, NativeError> {
        if params.n_ctx == 0 {
            return Err(NativeError::ContextFailed("context size is zero".to_string()));
        }
        Ok(Box::new(StubSession {
            model: self.name.clone(),
            n_ctx: params.n_ctx as usize,
            pos: 0,
            turns: 0,
            token_delay: self.token_delay,
        }))
    }
}

/// Stub session: tracks context position and turn count only.
pub struct StubSession {
    model: String,
    n_ctx: usize,
    pos: usize,
    turns: usize,
    token_delay: Duration,
}

impl StubSession {
    fn advance(&mut self, tokens: usize) -> Result<(), NativeError> {
        let used = self.pos + tokens;
        if used > self.n_ctx {
            return Err(NativeError::ContextOverflow {
                used,
                capacity: self.n_ctx,
            });
        }
        self.pos = used;
        Ok(())
    }
}

impl NativeSession for StubSession {
    fn begin(&mut self, preamble: &str) -> Result<(), NativeError> {
        self.pos = 0;
        self.turns = 0;
        if !preamble.is_empty() {
            self.advance(estimate_tokens(preamble))?;
        }
        Ok(())
    }

    fn ingest(&mut self, turn: &HistoryTurn) -> Result<(), NativeError> {
        self.advance(estimate_tokens(&turn.content))?;
        self.turns += 1;
        Ok(())
    }

    fn generate(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
        cancel: &CancelToken,
    ) -> Result<String, NativeError> {
        let prompt_tokens = estimate_tokens(prompt);
        let budget = output_budget(self.pos + prompt_tokens, self.n_ctx, params.max_tokens)?;
        self.pos += prompt_tokens;

        let reply = format!(
            "[{}] Received {} words with {} earlier turns in context.",
            self.model,
            prompt.split_whitespace().count(),
            self.turns
        );

        let mut out = Vec::new();
        // Stops early when the window fills, like a real context would.
        for word in reply.split(' ').take(budget) {
            if cancel.is_cancelled() {
                return Err(NativeError::Cancelled);
            }
            if !self.token_delay.is_zero() {
                std::thread::sleep(self.token_delay);
            }
            self.advance(1)?;
            out.push(word);
        }

        self.turns += 2;
        Ok(out.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gguf_file(dir: &Path, name: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, crate::catalog::gguf::tests::synthetic_header("llama", 15, false))
            .unwrap();
        path
    }

    #[test]
    fn test_stub_rejects_non_gguf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.gguf");
        std::fs::write(&path, b"plain text").unwrap();

        let err = StubRuntime::new()
            .load_model(&path, &ModelParams::default())
            .err()
            .unwrap();
        assert!(matches!(err, NativeError::ModelLoadFailed(_)));
    }

    #[test]
    fn test_stub_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = StubRuntime::new().load_model(&dir.path().join("gone.gguf"), &ModelParams::default());
        assert!(matches!(result, Err(NativeError::ModelLoadFailed(_))));
    }

    #[test]
    fn test_stub_generation_counts_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = gguf_file(dir.path(), "tiny.gguf");
        let model = StubRuntime::new()
            .load_model(&path, &ModelParams::default())
            .unwrap();
        let mut session = model.new_session(&ContextParams::default()).unwrap();

        session.begin("be brief").unwrap();
        session
            .ingest(&HistoryTurn::new(crate::types::Role::User, "hello"))
            .unwrap();
        let reply = session
            .generate("what now", &SamplingParams::default(), &CancelToken::new())
            .unwrap();
        assert_eq!(reply, "[tiny] Received 2 words with 1 earlier turns in context.");
    }

    #[test]
    fn test_stub_context_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let path = gguf_file(dir.path(), "tiny.gguf");
        let model = StubRuntime::new()
            .load_model(&path, &ModelParams::default())
            .unwrap();
        let params = ContextParams {
            n_ctx: 16,
            ..Default::default()
        };
        let mut session = model.new_session(&params).unwrap();
        session.begin("").unwrap();

        let long = "x".repeat(200);
        let err = session
            .generate(&long, &SamplingParams::default(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, NativeError::ContextOverflow { capacity: 16, .. }));
    }

    #[test]
    fn test_stub_reply_truncated_by_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = gguf_file(dir.path(), "tiny.gguf");
        let model = StubRuntime::new()
            .load_model(&path, &ModelParams::default())
            .unwrap();
        let params = ContextParams {
            n_ctx: 12,
            ..Default::default()
        };
        let mut session = model.new_session(&params).unwrap();
        session.begin("").unwrap();

        // 36 chars is 9 tokens, leaving room for 3 words of the reply.
        let reply = session
            .generate(&"y".repeat(36), &SamplingParams::default(), &CancelToken::new())
            .unwrap();
        assert_eq!(reply, "[tiny] Received 1");
    }

    #[test]
    fn test_stub_honours_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let path = gguf_file(dir.path(), "tiny.gguf");
        let model = StubRuntime::new()
            .load_model(&path, &ModelParams::default())
            .unwrap();
        let mut session = model.new_session(&ContextParams::default()).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = session
            .generate("hi", &SamplingParams::default(), &cancel)
            .unwrap_err();
        assert!(matches!(err, NativeError::Cancelled));
    }
}
