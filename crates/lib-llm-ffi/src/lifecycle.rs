//! Execution session lifecycle management.
//!
//! A [`Session`] owns one native execution context and sequences every call
//! into it: create context, submit input, step, read output, reset, close.
//!
//! # Thread Safety
//!
//! The native runtime may not be entered concurrently on one context. The
//! session admits exactly one caller at a time with a compare-and-swap from
//! `Ready` to `Executing`; any caller that loses the race gets
//! [`BridgeError::Busy`] immediately instead of blocking. A session may
//! therefore be shared freely (`&Session` is `Sync`), and different sessions
//! on the same model never wait on each other.
//!
//! The only call allowed to overlap an executing call is the runtime's stop
//! request, issued by [`Session::cancel`].

use crate::cancel::CancelToken;
use crate::error::{BridgeError, BridgeResult};
use crate::handle::{ContextKind, NativeHandle};
use crate::marshal::{self, to_c_int, TokenArg, Utf8Assembler};
use crate::model::ModelShared;
use crate::status::{check, check_handle};
use crate::stream::TokenStream;
use crate::sync::RecoverMutex;
use lib_types::{
    ContextParams, FinishReason, GenerateOptions, Generation, Input, OutputUnit, SessionState,
    SessionStats, TokenId,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    busy_rejections: AtomicU64,
    tokens_generated: AtomicU64,
    cancellations: AtomicU64,
}

pub(crate) struct SessionShared {
    id: u64,
    model: Arc<ModelShared>,
    model_ref_held: AtomicBool,
    context: NativeHandle<ContextKind>,
    params: ContextParams,
    state: AtomicU8,
    /// Cancel token of the call in flight. Cleared before the state leaves
    /// `Executing`, so a stop request never reaches an idle or freed context.
    active_cancel: Mutex<Option<CancelToken>>,
    /// Tokens currently held by the native context. Only the admitted caller
    /// touches it.
    n_past: AtomicUsize,
    counters: Counters,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(SessionState::Failed)
    }

    /// Admit one caller into the native context.
    pub(crate) fn admit(self: &Arc<Self>) -> BridgeResult<CallGuard> {
        match self.state.compare_exchange(
            SessionState::Ready as u8,
            SessionState::Executing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.counters.calls.fetch_add(1, Ordering::Relaxed);
                Ok(CallGuard {
                    session: self.clone(),
                    failed: false,
                })
            }
            Err(current) => Err(self.rejection(current)),
        }
    }

    fn rejection(&self, raw: u8) -> BridgeError {
        match SessionState::from_u8(raw) {
            Some(SessionState::Closed) => BridgeError::use_after_release("session"),
            Some(SessionState::Failed) | None => BridgeError::Faulted,
            Some(SessionState::Executing) | Some(SessionState::Created) | Some(SessionState::Ready) => {
                self.counters.busy_rejections.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(session = self.id, "Rejected overlapping call");
                BridgeError::Busy
            }
        }
    }

    /// Fail fast for operations that do not enter the context.
    fn ensure_open(&self) -> BridgeResult<()> {
        match self.state() {
            SessionState::Closed => Err(BridgeError::use_after_release("session")),
            SessionState::Failed => Err(BridgeError::Faulted),
            _ => Ok(()),
        }
    }

    pub(crate) fn cancel_active(&self) -> bool {
        let active = self.active_cancel.lock_recover();
        let Some(token) = active.as_ref() else {
            return false;
        };
        token.cancel();
        if let Ok(ctx) = self.context.as_ptr() {
            // SAFETY: the context stays alive while a call is active, and
            // stop requests are the one call allowed to overlap it
            match unsafe { self.context.backend().request_stop(ctx) } {
                Some(status) if status != 0 => {
                    tracing::warn!(session = self.id, status, "Native stop request failed")
                }
                Some(_) => tracing::debug!(session = self.id, "Native stop requested"),
                None => {}
            }
        }
        true
    }

    /// Tokenize (if needed) and feed the input into the context.
    ///
    /// Special tokens are only added when the context is empty. A submit is
    /// all or nothing: if a later batch chunk fails, the context is reset,
    /// or the session faults when the runtime cannot reset.
    pub(crate) fn prefill(
        &self,
        guard: &mut CallGuard,
        input: &Input,
        add_special: bool,
    ) -> BridgeResult<usize> {
        let n_past = self.n_past.load(Ordering::Relaxed);
        let tokens = match input {
            Input::Text(text) => self.model.tokenize(text, add_special && n_past == 0)?,
            Input::Tokens(tokens) => tokens.clone(),
        };
        if tokens.is_empty() {
            return Err(BridgeError::invalid_argument("input", "no tokens to submit"));
        }
        if n_past + tokens.len() > self.params.context_length {
            return Err(BridgeError::ResourceExhausted {
                operation: "decode",
                code: None,
                message: Some(format!(
                    "{} prompt tokens do not fit: {n_past} of {} context slots used",
                    tokens.len(),
                    self.params.context_length
                )),
            });
        }
        if let Some(vocab) = self.model.vocab_size() {
            if let Some(bad) = tokens.iter().find(|t| t.0 as usize >= vocab) {
                return Err(BridgeError::invalid_argument(
                    "input",
                    format!("token id {} outside vocabulary of {vocab}", bad.0),
                ));
            }
        }

        let ctx = self.context.as_ptr()?;
        let backend = self.context.backend();
        let batch = TokenArg::new(&tokens)?;
        let mut applied = 0;
        for chunk in batch.chunks(self.params.batch_size) {
            let n = to_c_int(chunk.len(), "batch length")?;
            // SAFETY: `chunk` borrows `batch`, which outlives the call
            let status = unsafe { backend.decode(ctx, chunk.as_ptr(), n) };
            if let Err(e) = check(backend, status, "decode") {
                if applied > 0 {
                    self.roll_back(guard, applied);
                }
                return Err(e);
            }
            applied += chunk.len();
            self.n_past.fetch_add(chunk.len(), Ordering::Relaxed);
        }
        tracing::debug!(session = self.id, tokens = tokens.len(), "Submitted input");
        Ok(tokens.len())
    }

    /// Undo a partially decoded submit by clearing the context.
    fn roll_back(&self, guard: &mut CallGuard, applied: usize) {
        let reset = self
            .context
            .as_ptr()
            .ok()
            // SAFETY: admitted caller, context alive
            .and_then(|ctx| unsafe { self.context.backend().reset_context(ctx) });
        match reset {
            Some(0) => {
                self.n_past.store(0, Ordering::Relaxed);
                tracing::warn!(session = self.id, applied, "Submit failed midway, context reset");
            }
            Some(status) => {
                tracing::error!(session = self.id, status, "Context reset after failed submit failed");
                guard.fault();
            }
            None => {
                tracing::error!(
                    session = self.id,
                    applied,
                    "Submit failed midway and the runtime cannot reset"
                );
                guard.fault();
            }
        }
    }

    /// Step the runtime until end-of-sequence, the token limit, or
    /// cancellation. `emit` returns `false` to stop early (consumer gone or
    /// cancelled while waiting).
    ///
    /// Unit text only ever carries complete characters. Bytes of a character
    /// still incomplete when generation stops are dropped, so the text of a
    /// generation is exactly the concatenation of its units.
    pub(crate) fn run_generation(
        &self,
        _guard: &CallGuard,
        options: &GenerateOptions,
        cancel: &CancelToken,
        mut emit: impl FnMut(OutputUnit) -> bool,
    ) -> BridgeResult<FinishReason> {
        let ctx = self.context.as_ptr()?;
        let backend = self.context.backend();
        let mut assembler = Utf8Assembler::new();

        let mut reason = FinishReason::MaxTokens;
        for _ in 0..options.max_tokens {
            if cancel.is_cancelled() {
                reason = FinishReason::Cancelled;
                break;
            }
            if self.n_past.load(Ordering::Relaxed) >= self.params.context_length {
                return Err(BridgeError::ResourceExhausted {
                    operation: "generate_step",
                    code: None,
                    message: Some("context window is full".to_string()),
                });
            }

            let mut raw = 0i32;
            // SAFETY: `raw` is a valid out-pointer for the call
            let status = unsafe { backend.generate_step(ctx, &mut raw) };
            match check(backend, status, "generate_step") {
                Ok(()) => {}
                Err(BridgeError::Cancelled) => {
                    reason = FinishReason::Cancelled;
                    break;
                }
                Err(e) => return Err(e),
            }
            self.n_past.fetch_add(1, Ordering::Relaxed);
            self.counters.tokens_generated.fetch_add(1, Ordering::Relaxed);

            // SAFETY: admitted caller, context alive
            if unsafe { backend.is_end_of_sequence(ctx) } {
                reason = FinishReason::EndOfSequence;
                break;
            }

            let token = marshal::token_from_c(raw, "generate_step")?;
            let text = assembler.push(&self.model.piece(token)?);
            if !emit(OutputUnit { token, text }) {
                reason = FinishReason::Cancelled;
                break;
            }
        }

        if reason == FinishReason::Cancelled {
            self.counters.cancellations.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(session = self.id, "Generation cancelled");
        }
        let pending = assembler.pending();
        if pending > 0 && reason != FinishReason::Cancelled {
            tracing::warn!(
                session = self.id,
                dropped_bytes = pending,
                finish_reason = ?reason,
                "Generation ended inside a multi-byte character"
            );
        }
        Ok(reason)
    }

    fn release_resources(&self) {
        if self.context.release() {
            tracing::debug!(session = self.id, "Released execution context");
        }
        if self.model_ref_held.swap(false, Ordering::SeqCst) {
            self.model.release_ref();
        }
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        self.release_resources();
    }
}

/// Exclusive admission to a session's context.
///
/// Dropping the guard clears the active cancel token and returns the
/// session to `Ready`, or to `Failed` when the call hit an unrecoverable
/// native error (or panicked).
pub(crate) struct CallGuard {
    session: Arc<SessionShared>,
    failed: bool,
}

impl CallGuard {
    pub(crate) fn session(&self) -> &Arc<SessionShared> {
        &self.session
    }

    /// Publish the cancel token for this call.
    pub(crate) fn arm(&self, cancel: &CancelToken) {
        *self.session.active_cancel.lock_recover() = Some(cancel.clone());
    }

    /// Mark the context unusable; the session moves to `Failed` on drop.
    pub(crate) fn fault(&mut self) {
        self.failed = true;
    }

    /// Record whether a result leaves the context unusable.
    pub(crate) fn observe<T>(&mut self, result: BridgeResult<T>) -> BridgeResult<T> {
        if let Err(BridgeError::InternalFailure { operation, code, .. }) = &result {
            tracing::error!(
                session = self.session.id,
                operation,
                code,
                "Native failure, session faulted"
            );
            self.failed = true;
        }
        result
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.session.active_cancel.lock_recover().take();
        let next = if self.failed || std::thread::panicking() {
            SessionState::Failed
        } else {
            SessionState::Ready
        };
        self.session.state.store(next as u8, Ordering::Release);
    }
}

/// One execution context bound to a model.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub(crate) fn open(model: &Arc<ModelShared>, params: ContextParams) -> BridgeResult<Self> {
        let raw_params = marshal::context_params(&params)?;
        model.acquire_ref()?;

        let created = (|| {
            let model_ptr = model.handle().as_ptr()?;
            let backend = model.handle().backend();
            // SAFETY: `raw_params` outlives the call and the model is held
            // open by the reference taken above
            let ctx = unsafe { backend.create_context(model_ptr, &raw_params) };
            check_handle(backend, ctx, "create_context")
        })();
        let ctx = match created {
            Ok(ctx) => ctx,
            Err(e) => {
                model.release_ref();
                return Err(e);
            }
        };

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(SessionShared {
            id,
            model: model.clone(),
            model_ref_held: AtomicBool::new(true),
            context: NativeHandle::adopt(model.handle().backend_arc(), ctx),
            params,
            state: AtomicU8::new(SessionState::Created as u8),
            active_cancel: Mutex::new(None),
            n_past: AtomicUsize::new(0),
            counters: Counters::default(),
        });
        shared
            .state
            .store(SessionState::Ready as u8, Ordering::Release);

        tracing::info!(
            session = id,
            context_length = shared.params.context_length,
            batch_size = shared.params.batch_size,
            "Opened session"
        );
        Ok(Self { shared })
    }

    /// Process-unique session id, as used in logs.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn params(&self) -> &ContextParams {
        &self.shared.params
    }

    /// Tokens currently held by the context.
    pub fn tokens_in_context(&self) -> usize {
        self.shared.n_past.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SessionStats {
        let c = &self.shared.counters;
        SessionStats {
            calls: c.calls.load(Ordering::Relaxed),
            busy_rejections: c.busy_rejections.load(Ordering::Relaxed),
            tokens_generated: c.tokens_generated.load(Ordering::Relaxed),
            cancellations: c.cancellations.load(Ordering::Relaxed),
        }
    }

    /// Feed input into the context without generating. Returns the number
    /// of tokens consumed.
    pub fn submit(&self, input: &Input) -> BridgeResult<usize> {
        let mut guard = self.shared.admit()?;
        let result = self.shared.prefill(&mut guard, input, true);
        guard.observe(result)
    }

    /// Submit `input` and generate a complete response.
    pub fn generate(&self, input: &Input, options: &GenerateOptions) -> BridgeResult<Generation> {
        self.generate_with_cancel(input, options, &CancelToken::new())
    }

    /// Like [`generate`](Self::generate), observing an external cancel
    /// token (for example one armed with [`CancelToken::cancel_after`]).
    pub fn generate_with_cancel(
        &self,
        input: &Input,
        options: &GenerateOptions,
        cancel: &CancelToken,
    ) -> BridgeResult<Generation> {
        let mut guard = self.shared.admit()?;
        guard.arm(cancel);

        let result = self.shared.prefill(&mut guard, input, options.add_special);
        let prompt_tokens = guard.observe(result)?;

        let mut text = String::new();
        let mut tokens: Vec<TokenId> = Vec::new();
        let result = self.shared.run_generation(&guard, options, cancel, |unit| {
            text.push_str(&unit.text);
            tokens.push(unit.token);
            true
        });
        let reason = guard.observe(result)?;
        drop(guard);

        if reason == FinishReason::Cancelled {
            return Err(BridgeError::Cancelled);
        }
        tracing::debug!(
            session = self.shared.id,
            prompt_tokens,
            completion_tokens = tokens.len(),
            finish_reason = ?reason,
            "Generation finished"
        );
        Ok(Generation {
            text,
            tokens,
            prompt_tokens,
            finish_reason: reason,
        })
    }

    /// Submit `input` and return a lazy stream of output units.
    ///
    /// The input is submitted before this returns; generation then runs on
    /// a worker thread, and the session stays `Executing` until the stream
    /// finishes, fails, is cancelled or is dropped.
    pub fn stream(&self, input: &Input, options: &GenerateOptions) -> BridgeResult<TokenStream> {
        let mut guard = self.shared.admit()?;
        let cancel = CancelToken::new();
        guard.arm(&cancel);

        let result = self.shared.prefill(&mut guard, input, options.add_special);
        let prompt_tokens = guard.observe(result)?;
        TokenStream::spawn(guard, options.clone(), cancel, prompt_tokens)
    }

    /// Cancel the call in flight, if any. Returns whether one was running.
    ///
    /// The generation stops at its next unit boundary, or sooner when the
    /// runtime exports a stop primitive.
    pub fn cancel(&self) -> bool {
        self.shared.cancel_active()
    }

    /// Clear the context's sequence state so the next input starts fresh.
    pub fn reset(&self) -> BridgeResult<()> {
        let mut guard = self.shared.admit()?;
        let ctx = self.shared.context.as_ptr()?;
        let backend = self.shared.context.backend();
        // SAFETY: admitted caller, context alive
        let status = unsafe { backend.reset_context(ctx) }
            .ok_or(BridgeError::NotSupported { operation: "reset" })?;
        guard.observe(check(backend, status, "reset_context"))?;
        self.shared.n_past.store(0, Ordering::Relaxed);
        tracing::debug!(session = self.shared.id, "Context reset");
        Ok(())
    }

    /// Tokenize with the session's model. Does not enter the context, so it
    /// is allowed while a generation is running.
    pub fn tokenize(&self, text: &str, add_special: bool) -> BridgeResult<Vec<TokenId>> {
        self.shared.ensure_open()?;
        self.shared.model.tokenize(text, add_special)
    }

    /// Release the context.
    ///
    /// Returns [`BridgeError::Busy`] while a call is executing; cancel it
    /// first. Closing a closed session is a no-op.
    pub fn close(&self) -> BridgeResult<()> {
        // Serializes with cancel_active so a stop request never races the free.
        let _active = self.shared.active_cancel.lock_recover();
        let state = &self.shared.state;
        let mut current = state.load(Ordering::Acquire);
        loop {
            match SessionState::from_u8(current) {
                Some(SessionState::Closed) => return Ok(()),
                Some(SessionState::Executing) => return Err(BridgeError::Busy),
                _ => {}
            }
            match state.compare_exchange(
                current,
                SessionState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.shared.release_resources();
        tracing::info!(session = self.shared.id, "Closed session");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            // A stream still owns the call; its worker drops the last
            // reference and the context is freed then.
            tracing::debug!(session = self.shared.id, error = %e, "Deferred session close");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("tokens_in_context", &self.tokens_in_context())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use crate::runtime::Runtime;
    use crate::Model;
    use lib_types::ModelConfig;
    use std::io::Write;
    use std::time::Duration;

    struct Fixture {
        mock: Arc<MockBackend>,
        _runtime: Runtime,
        model: Model,
        _file: tempfile::NamedTempFile,
    }

    fn fixture(mock: MockBackend) -> Fixture {
        let mock = Arc::new(mock);
        let runtime = Runtime::new(mock.clone());
        runtime.init().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"GGUF").unwrap();
        let model = runtime.load_model(&ModelConfig::new(file.path())).unwrap();
        Fixture {
            mock,
            _runtime: runtime,
            model,
            _file: file,
        }
    }

    fn small_context() -> ContextParams {
        ContextParams {
            context_length: 64,
            batch_size: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_open_session_is_ready() {
        let fx = fixture(MockBackend::new());
        let session = fx.model.open_session(small_context()).unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(fx.mock.context_creates(), 1);
    }

    #[test]
    fn test_invalid_params_rejected_before_native_call() {
        let fx = fixture(MockBackend::new());
        let params = ContextParams {
            batch_size: 0,
            ..Default::default()
        };
        let err = fx.model.open_session(params).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
        assert_eq!(fx.mock.context_creates(), 0);
        assert_eq!(fx.model.open_sessions(), 0);
    }

    #[test]
    fn test_null_context_is_resource_exhausted() {
        let fx = fixture(MockBackend::new());
        fx.mock.fail_next_context();
        let err = fx.model.open_session(small_context()).unwrap_err();
        assert!(matches!(err, BridgeError::ResourceExhausted { .. }));
        assert_eq!(fx.model.open_sessions(), 0);
    }

    #[test]
    fn test_generate_returns_scripted_text() {
        let fx = fixture(MockBackend::new().with_response("Hi there"));
        let session = fx.model.open_session(small_context()).unwrap();
        let out = session
            .generate(&Input::text("Hello"), &GenerateOptions::default())
            .unwrap();
        assert_eq!(out.text, "Hi there");
        assert_eq!(out.prompt_tokens, 6);
        assert_eq!(out.completion_tokens(), 8);
        assert_eq!(out.finish_reason, FinishReason::EndOfSequence);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.stats().calls, 1);
        assert_eq!(fx.mock.interleaved(), 0);
    }

    #[test]
    fn test_max_tokens_stops_generation() {
        let fx = fixture(MockBackend::new().with_response("abcdefgh"));
        let session = fx.model.open_session(small_context()).unwrap();
        let out = session
            .generate(&Input::text("x"), &GenerateOptions::default().with_max_tokens(3))
            .unwrap();
        assert_eq!(out.text, "abc");
        assert_eq!(out.finish_reason, FinishReason::MaxTokens);
    }

    #[test]
    fn test_split_character_handled_alike_by_generate_and_stream() {
        // Three tokens cover "a" and the first two bytes of the crab.
        let fx = fixture(MockBackend::new().with_response("a🦀b"));
        let session = fx.model.open_session(small_context()).unwrap();
        let options = GenerateOptions::default().with_max_tokens(3);

        let out = session.generate(&Input::text("x"), &options).unwrap();
        assert_eq!(out.text, "a");
        assert_eq!(out.completion_tokens(), 3);

        session.reset().unwrap();
        let streamed: String = session
            .stream(&Input::text("x"), &options)
            .unwrap()
            .map(|u| u.unwrap().text)
            .collect();
        assert_eq!(streamed, out.text);
    }

    #[test]
    fn test_submit_counts_tokens_and_bos_only_once() {
        let fx = fixture(MockBackend::new());
        let session = fx.model.open_session(small_context()).unwrap();
        assert_eq!(session.submit(&Input::text("abc")).unwrap(), 4);
        assert_eq!(session.submit(&Input::text("de")).unwrap(), 2);
        assert_eq!(session.tokens_in_context(), 6);
    }

    #[test]
    fn test_prompt_larger_than_context_is_resource_exhausted() {
        let fx = fixture(MockBackend::new());
        let session = fx.model.open_session(small_context()).unwrap();
        let long = "x".repeat(100);
        let err = session.submit(&Input::text(long)).unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, BridgeError::ResourceExhausted { .. }));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_empty_input_is_invalid() {
        let fx = fixture(MockBackend::new());
        let session = fx.model.open_session(small_context()).unwrap();
        let err = session.submit(&Input::Tokens(Vec::new())).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_out_of_vocab_token_is_invalid_argument() {
        let fx = fixture(MockBackend::new());
        let session = fx.model.open_session(small_context()).unwrap();
        let err = session.submit(&Input::Tokens(vec![TokenId(100_000)])).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
        assert_eq!(session.state(), SessionState::Ready);
    }

    fn tokens_with_bad_second_chunk() -> Input {
        let mut tokens: Vec<TokenId> = (10..30).map(TokenId).collect();
        tokens[12] = TokenId(100_000);
        Input::Tokens(tokens)
    }

    #[test]
    fn test_out_of_vocab_token_rejected_before_any_decode() {
        let fx = fixture(MockBackend::new());
        let session = fx.model.open_session(small_context()).unwrap();
        let calls = fx.mock.native_calls();

        let err = session.submit(&tokens_with_bad_second_chunk()).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
        assert_eq!(fx.mock.native_calls(), calls);
        assert_eq!(session.tokens_in_context(), 0);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_failed_second_chunk_rolls_back_context() {
        let fx = fixture(MockBackend::new().without_vocab_size());
        let session = fx.model.open_session(small_context()).unwrap();

        let err = session.submit(&tokens_with_bad_second_chunk()).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
        assert_eq!(session.tokens_in_context(), 0);
        assert_eq!(session.state(), SessionState::Ready);

        // Empty context again, so the next prompt gets its BOS token.
        assert_eq!(session.submit(&Input::text("ab")).unwrap(), 3);
        assert_eq!(session.tokens_in_context(), 3);
    }

    #[test]
    fn test_failed_second_chunk_without_reset_faults_session() {
        let fx = fixture(MockBackend::new().without_vocab_size().without_reset());
        let session = fx.model.open_session(small_context()).unwrap();

        assert!(session.submit(&tokens_with_bad_second_chunk()).is_err());
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(
            session.submit(&Input::text("a")),
            Err(BridgeError::Faulted)
        ));
    }

    #[test]
    fn test_internal_failure_faults_session() {
        let fx = fixture(MockBackend::new().with_step_failure(2, -7));
        let session = fx.model.open_session(small_context()).unwrap();
        let err = session
            .generate(&Input::text("go"), &GenerateOptions::default())
            .unwrap_err();
        assert_eq!(err.native_code(), Some(-7));
        assert_eq!(session.state(), SessionState::Failed);

        assert!(matches!(
            session.submit(&Input::text("again")),
            Err(BridgeError::Faulted)
        ));
        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(fx.mock.context_frees(), 1);
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_reuse() {
        let fx = fixture(MockBackend::new());
        let session = fx.model.open_session(small_context()).unwrap();
        session.close().unwrap();
        session.close().unwrap();
        assert_eq!(fx.mock.context_frees(), 1);
        assert_eq!(fx.mock.double_frees(), 0);

        let err = session.submit(&Input::text("x")).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, BridgeError::UseAfterRelease { resource: "session" }));
        assert!(matches!(
            session.tokenize("x", false),
            Err(BridgeError::UseAfterRelease { .. })
        ));
        drop(session);
        assert_eq!(fx.mock.context_frees(), 1);
    }

    #[test]
    fn test_reset_clears_context() {
        let fx = fixture(MockBackend::new());
        let session = fx.model.open_session(small_context()).unwrap();
        session.submit(&Input::text("abcdef")).unwrap();
        session.reset().unwrap();
        assert_eq!(session.tokens_in_context(), 0);
        assert_eq!(session.submit(&Input::text("a")).unwrap(), 2);
    }

    #[test]
    fn test_reset_unsupported() {
        let fx = fixture(MockBackend::new().without_reset());
        let session = fx.model.open_session(small_context()).unwrap();
        assert!(matches!(
            session.reset(),
            Err(BridgeError::NotSupported { operation: "reset" })
        ));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_cancel_without_active_call() {
        let fx = fixture(MockBackend::new());
        let session = fx.model.open_session(small_context()).unwrap();
        assert!(!session.cancel());
    }

    #[test]
    fn test_pre_cancelled_token_stops_generate() {
        let fx = fixture(MockBackend::new());
        let session = fx.model.open_session(small_context()).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let err = session
            .generate_with_cancel(&Input::text("x"), &GenerateOptions::default(), &token)
            .unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.stats().cancellations, 1);
    }

    #[test]
    fn test_deadline_cancels_slow_generation() {
        let fx = fixture(
            MockBackend::new()
                .with_response(&"z".repeat(40))
                .with_step_delay(Duration::from_millis(10)),
        );
        let session = fx.model.open_session(small_context()).unwrap();
        let token = CancelToken::new();
        let _deadline = token.cancel_after(Duration::from_millis(50));
        let err = session
            .generate_with_cancel(&Input::text("x"), &GenerateOptions::default(), &token)
            .unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_close_while_executing_is_busy() {
        let fx = fixture(MockBackend::new());
        let session = fx.model.open_session(small_context()).unwrap();
        let mut gate = fx.mock.hold_decode();
        std::thread::scope(|s| {
            let worker = s.spawn(|| session.submit(&Input::text("abc")));
            assert!(gate.wait_entered());
            assert!(matches!(session.close(), Err(BridgeError::Busy)));
            gate.release();
            assert_eq!(worker.join().unwrap().unwrap(), 4);
        });
        session.close().unwrap();
        assert_eq!(fx.mock.context_frees(), 1);
    }
}
