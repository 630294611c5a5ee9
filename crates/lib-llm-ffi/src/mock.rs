//! Scripted in-process engine implementing the native ABI.
//!
//! The mock behaves like a tiny byte-level model: every byte of the prompt is
//! one token, and generation replays a fixed response followed by
//! end-of-sequence. It keeps count of every native call and free so tests can
//! check exactly-once release, and it flags any two calls that overlap on
//! one context.
//!
//! Vocabulary:
//! - `1` BOS, `2` EOS (both render as empty pieces)
//! - `3 + b` for each byte value `b`

use crate::backend::{NativeBackend, NativeContext, NativeModel, RawContextParams, RawModelParams};
use crate::status::{STATUS_ABORTED, STATUS_INVALID_INPUT, STATUS_NO_SPACE, STATUS_OK};
use crate::sync::RecoverMutex;
use crossbeam::channel::{self, Receiver, Sender};
use std::collections::HashSet;
use std::ffi::{c_char, c_int, CStr};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

pub const BOS: i32 = 1;
pub const EOS: i32 = 2;
pub const BYTE_BASE: i32 = 3;
pub const VOCAB_SIZE: i32 = BYTE_BASE + 256;
pub const TRAIN_CONTEXT: i32 = 2048;

/// Upper bound on how long a held call or rendezvous waits before giving up,
/// so a broken test fails instead of hanging.
const HOLD_TIMEOUT: Duration = Duration::from_secs(5);

struct MockModel {
    vocab_only: bool,
}

struct MockContext {
    n_ctx: usize,
    in_call: AtomicBool,
    stop: AtomicBool,
    seq: Mutex<Sequence>,
}

#[derive(Default)]
struct Sequence {
    n_past: usize,
    cursor: usize,
    steps: usize,
    at_eos: bool,
}

/// Marks one context as busy for the duration of a native call.
struct CallScope<'a> {
    ctx: &'a MockContext,
}

impl<'a> CallScope<'a> {
    fn enter(backend: &MockBackend, ctx: &'a MockContext) -> Self {
        if ctx.in_call.swap(true, Ordering::AcqRel) {
            backend.interleaved.fetch_add(1, Ordering::SeqCst);
        }
        Self { ctx }
    }
}

impl Drop for CallScope<'_> {
    fn drop(&mut self) {
        self.ctx.in_call.store(false, Ordering::Release);
    }
}

struct GateInner {
    entered: Sender<()>,
    release: Receiver<()>,
}

/// Handle for a decode hold installed by [`MockBackend::hold_decode`].
pub struct CallGate {
    entered: Receiver<()>,
    release: Option<Sender<()>>,
}

impl CallGate {
    /// Wait until a decode call is parked at the gate.
    pub fn wait_entered(&self) -> bool {
        self.entered.recv_timeout(HOLD_TIMEOUT).is_ok()
    }

    /// Let every parked and future decode call through.
    pub fn release(&mut self) {
        self.release.take();
    }
}

impl Drop for CallGate {
    fn drop(&mut self) {
        self.release();
    }
}

struct Rendezvous {
    parties: usize,
    arrived: Mutex<usize>,
    all_here: Condvar,
    reached: AtomicBool,
}

impl Rendezvous {
    fn arrive(&self) {
        let mut arrived = self.arrived.lock_recover();
        *arrived += 1;
        if *arrived >= self.parties {
            self.reached.store(true, Ordering::SeqCst);
            self.all_here.notify_all();
            return;
        }
        let _ = self
            .all_here
            .wait_timeout_while(arrived, HOLD_TIMEOUT, |n| *n < self.parties);
    }
}

#[derive(Clone, Copy)]
struct StepFailure {
    at_step: usize,
    code: c_int,
}

/// Scripted native runtime.
pub struct MockBackend {
    response: Vec<u8>,
    step_delay: Duration,
    supports_stop: bool,
    supports_reset: bool,
    reports_vocab: bool,
    step_failure: Option<StepFailure>,
    rendezvous: Option<Arc<Rendezvous>>,

    gate: Mutex<Option<Arc<GateInner>>>,
    fail_next_load: AtomicBool,
    fail_next_context: AtomicBool,
    last_error: AtomicI32,
    last_message: Mutex<Option<String>>,
    live: Mutex<HashSet<usize>>,

    native_calls: AtomicUsize,
    inits: AtomicUsize,
    teardowns: AtomicUsize,
    model_loads: AtomicUsize,
    model_frees: AtomicUsize,
    context_creates: AtomicUsize,
    context_frees: AtomicUsize,
    double_frees: AtomicUsize,
    interleaved: AtomicUsize,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            response: b"Hello from the mock runtime.".to_vec(),
            step_delay: Duration::ZERO,
            supports_stop: true,
            supports_reset: true,
            reports_vocab: true,
            step_failure: None,
            rendezvous: None,
            gate: Mutex::new(None),
            fail_next_load: AtomicBool::new(false),
            fail_next_context: AtomicBool::new(false),
            last_error: AtomicI32::new(0),
            last_message: Mutex::new(None),
            live: Mutex::new(HashSet::new()),
            native_calls: AtomicUsize::new(0),
            inits: AtomicUsize::new(0),
            teardowns: AtomicUsize::new(0),
            model_loads: AtomicUsize::new(0),
            model_frees: AtomicUsize::new(0),
            context_creates: AtomicUsize::new(0),
            context_frees: AtomicUsize::new(0),
            double_frees: AtomicUsize::new(0),
            interleaved: AtomicUsize::new(0),
        }
    }

    /// Text replayed by every generation.
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.as_bytes().to_vec();
        self
    }

    /// Sleep this long inside every generation step.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Behave like a runtime without a stop primitive.
    pub fn without_stop(mut self) -> Self {
        self.supports_stop = false;
        self
    }

    /// Behave like a runtime without context reset.
    pub fn without_reset(mut self) -> Self {
        self.supports_reset = false;
        self
    }

    /// Behave like a runtime that does not export its vocabulary size.
    pub fn without_vocab_size(mut self) -> Self {
        self.reports_vocab = false;
        self
    }

    /// Make the `at_step`-th generation step (0-based, per prompt) return `code`.
    pub fn with_step_failure(mut self, at_step: usize, code: c_int) -> Self {
        self.step_failure = Some(StepFailure { at_step, code });
        self
    }

    /// Park every decode until `parties` decodes are in flight at once.
    pub fn with_rendezvous(mut self, parties: usize) -> Self {
        self.rendezvous = Some(Arc::new(Rendezvous {
            parties,
            arrived: Mutex::new(0),
            all_here: Condvar::new(),
            reached: AtomicBool::new(false),
        }));
        self
    }

    /// Whether the configured rendezvous saw all parties simultaneously.
    pub fn rendezvous_reached(&self) -> bool {
        self.rendezvous
            .as_ref()
            .map_or(false, |r| r.reached.load(Ordering::SeqCst))
    }

    /// Hold decode calls inside the runtime until the returned gate releases.
    pub fn hold_decode(&self) -> CallGate {
        let (entered_tx, entered_rx) = channel::unbounded();
        let (release_tx, release_rx) = channel::bounded(0);
        *self.gate.lock_recover() = Some(Arc::new(GateInner {
            entered: entered_tx,
            release: release_rx,
        }));
        CallGate {
            entered: entered_rx,
            release: Some(release_tx),
        }
    }

    /// Make the next `load_model` return null.
    pub fn fail_next_load(&self) {
        self.fail_next_load.store(true, Ordering::SeqCst);
    }

    /// Make the next `create_context` return null.
    pub fn fail_next_context(&self) {
        self.fail_next_context.store(true, Ordering::SeqCst);
    }

    pub fn native_calls(&self) -> usize {
        self.native_calls.load(Ordering::SeqCst)
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    pub fn model_loads(&self) -> usize {
        self.model_loads.load(Ordering::SeqCst)
    }

    pub fn model_frees(&self) -> usize {
        self.model_frees.load(Ordering::SeqCst)
    }

    pub fn context_creates(&self) -> usize {
        self.context_creates.load(Ordering::SeqCst)
    }

    pub fn context_frees(&self) -> usize {
        self.context_frees.load(Ordering::SeqCst)
    }

    /// Frees of a pointer that was not live.
    pub fn double_frees(&self) -> usize {
        self.double_frees.load(Ordering::SeqCst)
    }

    /// Native calls that overlapped another call on the same context.
    pub fn interleaved(&self) -> usize {
        self.interleaved.load(Ordering::SeqCst)
    }

    /// Handles created and not yet freed.
    pub fn live_handles(&self) -> usize {
        self.live.lock_recover().len()
    }

    fn count_call(&self) {
        self.native_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn fail(&self, code: c_int, message: &str) {
        self.last_error.store(code, Ordering::SeqCst);
        *self.last_message.lock_recover() = Some(message.to_string());
    }

    fn track<T>(&self, boxed: Box<T>) -> *mut T {
        let raw = Box::into_raw(boxed);
        self.live.lock_recover().insert(raw as usize);
        raw
    }

    /// Returns `false` (and counts a double free) if `raw` is not live.
    fn untrack<T>(&self, raw: *mut T) -> bool {
        if self.live.lock_recover().remove(&(raw as usize)) {
            true
        } else {
            self.double_frees.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    fn wait_at_gate(&self) {
        let gate = self.gate.lock_recover().clone();
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv_timeout(HOLD_TIMEOUT);
        }
    }

    /// # Safety
    /// `ctx` must be a live context created by this backend.
    unsafe fn context<'a>(&self, ctx: *const NativeContext) -> Option<&'a MockContext> {
        if ctx.is_null() || !self.live.lock_recover().contains(&(ctx as usize)) {
            return None;
        }
        Some(&*ctx.cast::<MockContext>())
    }

    unsafe fn model<'a>(&self, model: *const NativeModel) -> Option<&'a MockModel> {
        if model.is_null() || !self.live.lock_recover().contains(&(model as usize)) {
            return None;
        }
        Some(&*model.cast::<MockModel>())
    }
}

unsafe impl NativeBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn supports_stop(&self) -> bool {
        self.supports_stop
    }

    fn supports_reset(&self) -> bool {
        self.supports_reset
    }

    unsafe fn backend_init(&self) {
        self.count_call();
        self.inits.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn backend_free(&self) {
        self.count_call();
        self.teardowns.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn load_model(
        &self,
        path: *const c_char,
        params: *const RawModelParams,
    ) -> *mut NativeModel {
        self.count_call();
        self.model_loads.fetch_add(1, Ordering::SeqCst);
        if path.is_null() || params.is_null() {
            self.fail(STATUS_INVALID_INPUT, "null argument");
            return std::ptr::null_mut();
        }
        if self.fail_next_load.swap(false, Ordering::SeqCst) {
            self.fail(12, "failed to allocate model buffer");
            return std::ptr::null_mut();
        }
        let path = CStr::from_ptr(path).to_string_lossy();
        tracing::trace!(%path, "mock: load_model");
        let params = &*params;
        self.track(Box::new(MockModel {
            vocab_only: params.vocab_only,
        }))
        .cast()
    }

    unsafe fn free_model(&self, model: *mut NativeModel) {
        self.count_call();
        if self.untrack(model) {
            self.model_frees.fetch_add(1, Ordering::SeqCst);
            drop(Box::from_raw(model.cast::<MockModel>()));
        }
    }

    unsafe fn create_context(
        &self,
        model: *mut NativeModel,
        params: *const RawContextParams,
    ) -> *mut NativeContext {
        self.count_call();
        self.context_creates.fetch_add(1, Ordering::SeqCst);
        let Some(model) = self.model(model) else {
            self.fail(STATUS_INVALID_INPUT, "unknown model");
            return std::ptr::null_mut();
        };
        if model.vocab_only {
            self.fail(STATUS_INVALID_INPUT, "model was loaded vocab-only");
            return std::ptr::null_mut();
        }
        if self.fail_next_context.swap(false, Ordering::SeqCst) {
            self.fail(12, "failed to allocate KV cache");
            return std::ptr::null_mut();
        }
        let params = &*params;
        self.track(Box::new(MockContext {
            n_ctx: params.n_ctx as usize,
            in_call: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            seq: Mutex::new(Sequence::default()),
        }))
        .cast()
    }

    unsafe fn free_context(&self, ctx: *mut NativeContext) {
        self.count_call();
        if self.untrack(ctx) {
            let boxed = Box::from_raw(ctx.cast::<MockContext>());
            if boxed.in_call.load(Ordering::Acquire) {
                self.interleaved.fetch_add(1, Ordering::SeqCst);
            }
            self.context_frees.fetch_add(1, Ordering::SeqCst);
        }
    }

    unsafe fn tokenize(
        &self,
        model: *const NativeModel,
        text: *const c_char,
        text_len: c_int,
        tokens: *mut i32,
        n_tokens_max: c_int,
        add_special: bool,
    ) -> c_int {
        self.count_call();
        if self.model(model).is_none() || text_len < 0 || (text.is_null() && text_len > 0) {
            return STATUS_INVALID_INPUT;
        }
        let bytes: &[u8] = if text_len == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(text.cast::<u8>(), text_len as usize)
        };
        let needed = bytes.len() + usize::from(add_special);
        if needed > n_tokens_max.max(0) as usize {
            return -(needed as c_int);
        }
        let out = std::slice::from_raw_parts_mut(tokens, needed);
        let mut i = 0;
        if add_special {
            out[0] = BOS;
            i = 1;
        }
        for &b in bytes {
            out[i] = BYTE_BASE + i32::from(b);
            i += 1;
        }
        needed as c_int
    }

    unsafe fn decode(&self, ctx: *mut NativeContext, tokens: *const i32, n_tokens: c_int) -> c_int {
        self.count_call();
        let Some(ctx) = self.context(ctx) else {
            return STATUS_INVALID_INPUT;
        };
        let _scope = CallScope::enter(self, ctx);
        if let Some(rendezvous) = &self.rendezvous {
            rendezvous.arrive();
        }
        self.wait_at_gate();

        if n_tokens <= 0 || tokens.is_null() {
            self.fail(STATUS_INVALID_INPUT, "empty batch");
            return STATUS_INVALID_INPUT;
        }
        let batch = std::slice::from_raw_parts(tokens, n_tokens as usize);
        if batch.iter().any(|&t| !(0..VOCAB_SIZE).contains(&t)) {
            self.fail(STATUS_INVALID_INPUT, "token id out of vocabulary");
            return STATUS_INVALID_INPUT;
        }

        let mut seq = ctx.seq.lock_recover();
        if seq.n_past + batch.len() > ctx.n_ctx {
            return STATUS_NO_SPACE;
        }
        seq.n_past += batch.len();
        seq.cursor = 0;
        seq.steps = 0;
        seq.at_eos = false;
        ctx.stop.store(false, Ordering::SeqCst);
        STATUS_OK
    }

    unsafe fn generate_step(&self, ctx: *mut NativeContext, token_out: *mut i32) -> c_int {
        self.count_call();
        let Some(ctx) = self.context(ctx) else {
            return STATUS_INVALID_INPUT;
        };
        let _scope = CallScope::enter(self, ctx);
        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }
        if ctx.stop.swap(false, Ordering::SeqCst) {
            return STATUS_ABORTED;
        }

        let mut seq = ctx.seq.lock_recover();
        if let Some(failure) = self.step_failure {
            if failure.at_step == seq.steps {
                self.fail(failure.code, "injected step failure");
                return failure.code;
            }
        }
        if seq.n_past >= ctx.n_ctx {
            return STATUS_NO_SPACE;
        }
        let token = match self.response.get(seq.cursor) {
            Some(&b) => {
                seq.cursor += 1;
                BYTE_BASE + i32::from(b)
            }
            None => EOS,
        };
        seq.at_eos = token == EOS;
        seq.n_past += 1;
        seq.steps += 1;
        *token_out = token;
        STATUS_OK
    }

    unsafe fn token_to_piece(
        &self,
        model: *const NativeModel,
        token: i32,
        buf: *mut c_char,
        length: c_int,
    ) -> c_int {
        self.count_call();
        if self.model(model).is_none() {
            return STATUS_INVALID_INPUT;
        }
        if !(BYTE_BASE..VOCAB_SIZE).contains(&token) {
            return 0;
        }
        if length < 1 {
            return -1;
        }
        *buf = (token - BYTE_BASE) as u8 as c_char;
        1
    }

    unsafe fn is_end_of_sequence(&self, ctx: *const NativeContext) -> bool {
        self.count_call();
        match self.context(ctx) {
            Some(ctx) => {
                let _scope = CallScope::enter(self, ctx);
                let at_eos = ctx.seq.lock_recover().at_eos;
                at_eos
            }
            None => false,
        }
    }

    fn last_error(&self) -> c_int {
        self.last_error.load(Ordering::SeqCst)
    }

    fn last_error_message(&self) -> Option<String> {
        self.last_message.lock_recover().clone()
    }

    unsafe fn request_stop(&self, ctx: *mut NativeContext) -> Option<c_int> {
        if !self.supports_stop {
            return None;
        }
        self.count_call();
        // Deliberately no CallScope: stop requests may race an in-flight call.
        match self.context(ctx) {
            Some(ctx) => {
                ctx.stop.store(true, Ordering::SeqCst);
                Some(STATUS_OK)
            }
            None => Some(STATUS_INVALID_INPUT),
        }
    }

    unsafe fn reset_context(&self, ctx: *mut NativeContext) -> Option<c_int> {
        if !self.supports_reset {
            return None;
        }
        self.count_call();
        match self.context(ctx) {
            Some(ctx) => {
                let _scope = CallScope::enter(self, ctx);
                *ctx.seq.lock_recover() = Sequence::default();
                ctx.stop.store(false, Ordering::SeqCst);
                Some(STATUS_OK)
            }
            None => Some(STATUS_INVALID_INPUT),
        }
    }

    unsafe fn vocab_size(&self, model: *const NativeModel) -> Option<c_int> {
        if !self.reports_vocab {
            return None;
        }
        self.count_call();
        self.model(model).map(|_| VOCAB_SIZE)
    }

    unsafe fn train_context_length(&self, model: *const NativeModel) -> Option<c_int> {
        self.count_call();
        self.model(model).map(|_| TRAIN_CONTEXT)
    }
}
