//! Built-in checks against the scripted runtime.
//!
//! Each check drives the public bridge API the way a host would and verifies
//! the result through the mock's counters, so a build can be sanity-checked
//! without a real model or shared library.

use anyhow::{Context, Result};
use lib_llm_ffi::mock::MockBackend;
use lib_llm_ffi::{
    BridgeError, ContextParams, GenerateOptions, Input, ModelConfig, Runtime, SessionState,
};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one check.
#[derive(Clone, Debug, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

type Check = fn(&ModelConfig) -> Result<String>;

const CHECKS: &[(&str, Check)] = &[
    ("missing-model-rejected", missing_model_rejected),
    ("generate-text", generate_text),
    ("overlapping-call-busy", overlapping_call_busy),
    ("stream-cancel-recovers", stream_cancel_recovers),
    ("handles-freed-once", handles_freed_once),
];

/// Run every check. Errors only when the placeholder model cannot be created.
pub fn run_all() -> Result<Vec<CheckResult>> {
    let mut file = tempfile::Builder::new()
        .prefix("llm-bridge-selftest")
        .suffix(".gguf")
        .tempfile()
        .context("Failed to create placeholder model file")?;
    file.write_all(b"GGUF")?;
    let model = ModelConfig::new(file.path());

    let results = CHECKS
        .iter()
        .map(|&(name, check)| {
            tracing::info!(check = name, "Running self-test check");
            match check(&model) {
                Ok(detail) => CheckResult {
                    name,
                    passed: true,
                    detail,
                },
                Err(e) => CheckResult {
                    name,
                    passed: false,
                    detail: format!("{e:#}"),
                },
            }
        })
        .collect();
    Ok(results)
}

fn start(mock: &Arc<MockBackend>) -> Result<Runtime> {
    let runtime = Runtime::new(mock.clone());
    runtime.init()?;
    Ok(runtime)
}

fn missing_model_rejected(_model: &ModelConfig) -> Result<String> {
    let mock = Arc::new(MockBackend::new());
    let runtime = start(&mock)?;
    let before = mock.native_calls();

    match runtime.load_model(&ModelConfig::new("/nonexistent/selftest.gguf")) {
        Err(BridgeError::InvalidArgument { .. }) => {}
        Err(e) => anyhow::bail!("expected InvalidArgument, got {e}"),
        Ok(_) => anyhow::bail!("missing model was accepted"),
    }
    anyhow::ensure!(
        mock.native_calls() == before,
        "{} native calls made for a missing path",
        mock.native_calls() - before
    );
    Ok("rejected before any native call".to_string())
}

fn generate_text(model: &ModelConfig) -> Result<String> {
    let mock = Arc::new(MockBackend::new().with_response("selftest"));
    let runtime = start(&mock)?;
    let model = runtime.load_model(model)?;
    let session = model.open_session(ContextParams::default())?;

    let out = session.generate(&Input::text("ping"), &GenerateOptions::default())?;
    anyhow::ensure!(out.text == "selftest", "unexpected output {:?}", out.text);
    Ok(format!(
        "{} prompt + {} generated tokens",
        out.prompt_tokens,
        out.completion_tokens()
    ))
}

fn overlapping_call_busy(model: &ModelConfig) -> Result<String> {
    let mock = Arc::new(MockBackend::new());
    let runtime = start(&mock)?;
    let model = runtime.load_model(model)?;
    let session = model.open_session(ContextParams::default())?;
    let mut gate = mock.hold_decode();

    let (first, second) = std::thread::scope(|s| {
        let first = s.spawn(|| session.submit(&Input::text("one")));
        let second = if gate.wait_entered() {
            Some(session.submit(&Input::text("two")))
        } else {
            None
        };
        gate.release();
        (first.join(), second)
    });

    let first = first.map_err(|_| anyhow::anyhow!("first call panicked"))?;
    first.context("first call failed")?;
    match second {
        Some(Err(BridgeError::Busy)) => {}
        Some(other) => anyhow::bail!("expected Busy, got {other:?}"),
        None => anyhow::bail!("first call never reached the runtime"),
    }
    anyhow::ensure!(mock.interleaved() == 0, "native calls interleaved");
    Ok(format!("{} rejected", session.stats().busy_rejections))
}

fn stream_cancel_recovers(model: &ModelConfig) -> Result<String> {
    let mock = Arc::new(
        MockBackend::new()
            .with_response(&"z".repeat(64))
            .with_step_delay(Duration::from_millis(1)),
    );
    let runtime = start(&mock)?;
    let model = runtime.load_model(model)?;
    let session = model.open_session(ContextParams::default())?;

    let mut stream = session.stream(&Input::text("go"), &GenerateOptions::default())?;
    let mut received = 0;
    if let Some(unit) = stream.next() {
        unit?;
        received += 1;
    }
    session.cancel();
    for unit in stream.by_ref() {
        match unit {
            Ok(_) => received += 1,
            Err(BridgeError::Cancelled) => {}
            Err(e) => return Err(e.into()),
        }
    }
    drop(stream);

    anyhow::ensure!(
        session.state() == SessionState::Ready,
        "session left in {:?}",
        session.state()
    );
    session.generate(&Input::text("again"), &GenerateOptions::default().with_max_tokens(1))?;
    Ok(format!("cancelled after {received} units"))
}

fn handles_freed_once(model: &ModelConfig) -> Result<String> {
    let mock = Arc::new(MockBackend::new());
    {
        let runtime = start(&mock)?;
        let model = runtime.load_model(model)?;
        let a = model.open_session(ContextParams::default())?;
        let b = model.open_session(ContextParams::default())?;
        a.close()?;
        a.close()?;
        model.close();
        b.generate(&Input::text("x"), &GenerateOptions::default().with_max_tokens(1))?;
    }
    anyhow::ensure!(mock.double_frees() == 0, "{} double frees", mock.double_frees());
    anyhow::ensure!(mock.live_handles() == 0, "{} handles leaked", mock.live_handles());
    anyhow::ensure!(mock.teardowns() == 1, "backend torn down {} times", mock.teardowns());
    Ok(format!(
        "{} model, {} context frees",
        mock.model_frees(),
        mock.context_frees()
    ))
}
