//! Generation orchestration.

use crate::config::BridgeConfig;
use anyhow::{Context, Result};
use lib_llm_ffi::{BridgeError, CancelToken, Input, Runtime, Session};
use lib_types::{FinishReason, SessionStats};
use serde::Serialize;
use std::io;
use std::time::Instant;

/// Receives generated text. A write error stops the generation.
pub type Sink<'a> = dyn FnMut(&str) -> io::Result<()> + 'a;

/// How output is produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Wait for the full response.
    Complete,
    /// Hand each piece of text to the sink as it is produced.
    Stream,
}

/// Summary of one generation run.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub backend: String,
    pub supports_stop: bool,
    pub supports_reset: bool,
    pub model: String,
    pub vocab_size: Option<usize>,
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub finish_reason: FinishReason,
    pub timed_out: bool,
    pub elapsed_ms: u128,
    pub tokens_per_second: f64,
    pub stats: SessionStats,
}

/// Drives one model through init, load, generate and teardown.
pub struct Orchestrator {
    runtime: Runtime,
    config: BridgeConfig,
}

impl Orchestrator {
    /// Create an orchestrator over an already constructed runtime.
    pub fn new(runtime: Runtime, config: BridgeConfig) -> Self {
        Self { runtime, config }
    }

    /// Load the configured runtime library.
    pub fn from_config(config: BridgeConfig) -> Result<Self> {
        let library = config
            .library
            .clone()
            .context("No runtime library configured")?;
        let runtime = Runtime::load_library(&library)
            .with_context(|| format!("Failed to load runtime library {:?}", library))?;
        Ok(Self::new(runtime, config))
    }

    /// Run one generation.
    pub fn run(&self, prompt: &str, mode: RunMode, sink: &mut Sink<'_>) -> Result<RunReport> {
        self.runtime.init().context("Failed to initialize native backend")?;

        let model = self
            .runtime
            .load_model(&self.config.model)
            .with_context(|| format!("Failed to load model {:?}", self.config.model.path))?;
        let vocab_size = model.info().vocab_size;
        tracing::info!(path = ?model.path(), ?vocab_size, "Model ready");

        let session = model
            .open_session(self.config.context.clone())
            .context("Failed to create execution context")?;

        let started = Instant::now();
        let outcome = self.generate(&session, prompt, mode, sink);
        let elapsed = started.elapsed();

        let stats = session.stats();
        session.close().context("Failed to close session")?;
        model.close();
        drop(model);
        if let Err(e) = self.runtime.shutdown() {
            tracing::warn!(error = %e, "Backend shutdown deferred");
        }

        let generated = outcome?;
        let secs = elapsed.as_secs_f64();
        Ok(RunReport {
            backend: self.runtime.backend_name(),
            supports_stop: self.runtime.supports_stop(),
            supports_reset: self.runtime.supports_reset(),
            model: self.config.model.path.display().to_string(),
            vocab_size,
            prompt_tokens: generated.prompt_tokens,
            completion_tokens: generated.completion_tokens,
            timed_out: generated.finish_reason == FinishReason::Cancelled,
            finish_reason: generated.finish_reason,
            text: generated.text,
            elapsed_ms: elapsed.as_millis(),
            tokens_per_second: if secs > 0.0 {
                generated.completion_tokens as f64 / secs
            } else {
                0.0
            },
            stats,
        })
    }

    fn generate(
        &self,
        session: &Session,
        prompt: &str,
        mode: RunMode,
        sink: &mut Sink<'_>,
    ) -> Result<Generated> {
        let input = Input::text(prompt);
        let options = &self.config.generation;

        match mode {
            RunMode::Complete => {
                let cancel = CancelToken::new();
                let _deadline = self.config.timeout().map(|t| cancel.cancel_after(t));
                match session.generate_with_cancel(&input, options, &cancel) {
                    Ok(generation) => {
                        sink(&generation.text).context("Failed to write output")?;
                        Ok(Generated {
                            prompt_tokens: generation.prompt_tokens,
                            completion_tokens: generation.completion_tokens(),
                            finish_reason: generation.finish_reason,
                            text: generation.text,
                        })
                    }
                    Err(BridgeError::Cancelled) => anyhow::bail!(
                        "Generation timed out after {} ms",
                        self.config.timeout_ms.unwrap_or_default()
                    ),
                    Err(e) => Err(e).context("Generation failed"),
                }
            }
            RunMode::Stream => {
                let mut stream = session
                    .stream(&input, options)
                    .context("Failed to start stream")?;
                let _deadline = self
                    .config
                    .timeout()
                    .map(|t| stream.cancel_token().cancel_after(t));

                let mut text = String::new();
                let mut completion_tokens = 0;
                while let Some(unit) = stream.next() {
                    match unit {
                        Ok(unit) => {
                            completion_tokens += 1;
                            if let Err(e) = sink(&unit.text) {
                                stream.cancel();
                                return Err(e).context("Failed to write streamed output");
                            }
                            text.push_str(&unit.text);
                        }
                        Err(BridgeError::Cancelled) => {
                            tracing::warn!(completion_tokens, "Stream timed out");
                        }
                        Err(e) => return Err(e).context("Stream failed"),
                    }
                }
                Ok(Generated {
                    prompt_tokens: stream.prompt_tokens(),
                    completion_tokens,
                    finish_reason: stream.finish_reason().unwrap_or(FinishReason::EndOfSequence),
                    text,
                })
            }
        }
    }
}

struct Generated {
    prompt_tokens: usize,
    completion_tokens: usize,
    finish_reason: FinishReason,
    text: String,
}
