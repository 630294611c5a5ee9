//! Incremental token output.
//!
//! The runtime produces tokens by being stepped in a loop. [`TokenStream`]
//! runs that loop on a dedicated worker thread which pushes each unit into
//! a bounded channel; the consumer pulls units through [`Iterator`]. The
//! channel bound provides backpressure, so the worker never runs more than
//! `stream_buffer` units ahead of the consumer.

use crate::cancel::CancelToken;
use crate::error::{BridgeError, BridgeResult};
use crate::lifecycle::{CallGuard, SessionShared};
use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};
use lib_types::{FinishReason, GenerateOptions, OutputUnit};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How often a worker blocked on a full channel re-checks for cancellation.
const SEND_POLL: Duration = Duration::from_millis(20);

enum StreamEvent {
    Unit(OutputUnit),
    Finished(FinishReason),
    Failed(BridgeError),
}

/// Lazy, finite, non-restartable sequence of output units.
///
/// Yields `Ok(unit)` per token, then ends. A cancelled stream yields one
/// final `Err(BridgeError::Cancelled)`; a failed one yields the error. After
/// the first `None` or error the stream stays exhausted and the session is
/// back to `Ready` (or `Failed`).
///
/// Dropping the stream cancels the generation and waits for the worker to
/// reach its next unit boundary.
pub struct TokenStream {
    events: Option<Receiver<StreamEvent>>,
    worker: Option<thread::JoinHandle<()>>,
    session: Arc<SessionShared>,
    cancel: CancelToken,
    prompt_tokens: usize,
    finish_reason: Option<FinishReason>,
    done: bool,
}

impl TokenStream {
    pub(crate) fn spawn(
        guard: CallGuard,
        options: GenerateOptions,
        cancel: CancelToken,
        prompt_tokens: usize,
    ) -> BridgeResult<Self> {
        let session = guard.session().clone();
        let (tx, rx) = channel::bounded(options.stream_buffer.max(1));
        let worker_cancel = cancel.clone();

        let worker = thread::Builder::new()
            .name("llm-stream".to_string())
            .spawn(move || run_worker(guard, options, worker_cancel, tx))
            .map_err(|e| BridgeError::ResourceExhausted {
                operation: "stream",
                code: e.raw_os_error(),
                message: Some(format!("failed to spawn stream worker: {e}")),
            })?;

        Ok(Self {
            events: Some(rx),
            worker: Some(worker),
            session,
            cancel,
            prompt_tokens,
            finish_reason: None,
            done: false,
        })
    }

    /// Request cancellation. The stream ends with `Err(Cancelled)` once the
    /// worker reaches its next unit boundary.
    pub fn cancel(&self) {
        if !self.session.cancel_active() {
            // The call already finished; keep the flag consistent anyway.
            self.cancel.cancel();
        }
    }

    /// Token observed by the worker, for arming external timeouts.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Number of prompt tokens submitted before generation began.
    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }

    /// Why the stream ended, once it has.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    fn finish(&mut self) {
        self.done = true;
        self.events.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Stream worker panicked");
            }
        }
    }
}

impl Iterator for TokenStream {
    type Item = BridgeResult<OutputUnit>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let event = self.events.as_ref()?.recv();
        match event {
            Ok(StreamEvent::Unit(unit)) => Some(Ok(unit)),
            Ok(StreamEvent::Finished(reason)) => {
                self.finish_reason = Some(reason);
                self.finish();
                (reason == FinishReason::Cancelled).then_some(Err(BridgeError::Cancelled))
            }
            Ok(StreamEvent::Failed(err)) => {
                self.finish();
                Some(Err(err))
            }
            Err(_) => {
                // Worker exited without a final event, which only happens
                // if it panicked.
                self.finish();
                Some(Err(BridgeError::internal(
                    "stream",
                    0,
                    Some("stream worker terminated unexpectedly".to_string()),
                )))
            }
        }
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        if !self.done {
            self.cancel();
            self.finish();
        }
    }
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("prompt_tokens", &self.prompt_tokens)
            .field("finish_reason", &self.finish_reason)
            .field("done", &self.done)
            .finish()
    }
}

fn run_worker(
    mut guard: CallGuard,
    options: GenerateOptions,
    cancel: CancelToken,
    tx: Sender<StreamEvent>,
) {
    let session = guard.session().clone();
    let result = session.run_generation(&guard, &options, &cancel, |unit| {
        send_unit(&tx, unit, &cancel)
    });
    let result = guard.observe(result);

    // Back to Ready before the consumer can observe the end of the stream.
    drop(guard);

    let event = match result {
        Ok(reason) => StreamEvent::Finished(reason),
        Err(err) => StreamEvent::Failed(err),
    };
    // Fails only when the consumer is gone, which is fine.
    let _ = tx.send(event);
}

/// Push one unit, giving up if the consumer disappears or cancels while
/// the channel is full.
fn send_unit(tx: &Sender<StreamEvent>, unit: OutputUnit, cancel: &CancelToken) -> bool {
    let mut event = StreamEvent::Unit(unit);
    loop {
        match tx.send_timeout(event, SEND_POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => {
                if cancel.is_cancelled() {
                    return false;
                }
                event = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                cancel.cancel();
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cancel::CancelToken;
    use crate::error::BridgeError;
    use crate::mock::MockBackend;
    use crate::{Model, Runtime};
    use lib_types::{
        ContextParams, FinishReason, GenerateOptions, Input, ModelConfig, SessionState,
    };
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    fn load(mock: &Arc<MockBackend>) -> (Runtime, Model, tempfile::NamedTempFile) {
        let runtime = Runtime::new(mock.clone());
        runtime.init().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"GGUF").unwrap();
        let model = runtime.load_model(&ModelConfig::new(file.path())).unwrap();
        (runtime, model, file)
    }

    #[test]
    fn test_stream_yields_units_then_ends() {
        let mock = Arc::new(MockBackend::new().with_response("héllo"));
        let (_rt, model, _f) = load(&mock);
        let session = model.open_session(ContextParams::default()).unwrap();

        // A one-slot buffer keeps the worker parked until we read.
        let options = GenerateOptions {
            stream_buffer: 1,
            ..Default::default()
        };
        let mut stream = session.stream(&Input::text("hi"), &options).unwrap();
        assert_eq!(stream.prompt_tokens(), 3);
        assert_eq!(session.state(), SessionState::Executing);

        let units: Vec<_> = stream.by_ref().map(|u| u.unwrap()).collect();
        // "é" is two bytes: the first piece yields no text.
        assert_eq!(units.len(), 6);
        assert_eq!(units[1].text, "");
        let text: String = units.iter().map(|u| u.text.as_str()).collect();
        assert_eq!(text, "héllo");

        assert_eq!(stream.finish_reason(), Some(FinishReason::EndOfSequence));
        assert!(stream.next().is_none());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_stream_is_busy_for_other_callers() {
        let mock = Arc::new(MockBackend::new());
        let (_rt, model, _f) = load(&mock);
        let session = model.open_session(ContextParams::default()).unwrap();

        let stream = session
            .stream(&Input::text("a"), &GenerateOptions::default())
            .unwrap();
        assert!(matches!(
            session.generate(&Input::text("b"), &GenerateOptions::default()),
            Err(BridgeError::Busy)
        ));
        assert_eq!(session.stats().busy_rejections, 1);
        drop(stream);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_drop_mid_stream_returns_session_to_ready() {
        let mock = Arc::new(
            MockBackend::new()
                .with_response(&"x".repeat(200))
                .with_step_delay(Duration::from_millis(1)),
        );
        let (_rt, model, _f) = load(&mock);
        let session = model.open_session(ContextParams::default()).unwrap();

        let mut stream = session
            .stream(&Input::text("a"), &GenerateOptions::default().with_max_tokens(200))
            .unwrap();
        assert!(stream.next().unwrap().is_ok());
        drop(stream);

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(mock.interleaved(), 0);
        let out = session
            .generate(&Input::text("b"), &GenerateOptions::default().with_max_tokens(2))
            .unwrap();
        assert_eq!(out.text, "xx");
    }

    #[test]
    fn test_cancel_token_from_stream() {
        let mock = Arc::new(
            MockBackend::new()
                .without_stop()
                .with_response(&"y".repeat(100))
                .with_step_delay(Duration::from_millis(2)),
        );
        let (_rt, model, _f) = load(&mock);
        let session = model.open_session(ContextParams::default()).unwrap();
        let mut stream = session
            .stream(&Input::text("a"), &GenerateOptions::default())
            .unwrap();
        let token: CancelToken = stream.cancel_token();
        assert!(stream.next().unwrap().is_ok());
        token.cancel();

        let last = stream.by_ref().last().unwrap();
        assert!(matches!(last, Err(BridgeError::Cancelled)));
        assert_eq!(stream.finish_reason(), Some(FinishReason::Cancelled));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_stream_failure_is_reported_once() {
        let mock = Arc::new(MockBackend::new().with_step_failure(1, -3));
        let (_rt, model, _f) = load(&mock);
        let session = model.open_session(ContextParams::default()).unwrap();
        let mut stream = session
            .stream(&Input::text("a"), &GenerateOptions::default())
            .unwrap();
        assert!(stream.next().unwrap().is_ok());
        let err = stream.next().unwrap().unwrap_err();
        assert_eq!(err.native_code(), Some(-3));
        assert!(stream.next().is_none());
        assert_eq!(session.state(), SessionState::Failed);
    }
}
