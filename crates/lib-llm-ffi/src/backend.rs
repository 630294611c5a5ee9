//! The native capability surface consumed by the bridge.
//!
//! [`NativeBackend`] is the seam between the safe bridge and whatever
//! actually implements the C ABI: a dynamically loaded runtime
//! ([`crate::loader::LlamaLibrary`]) or the scripted engine used in tests.
//! Every method mirrors one C function; arguments and results are already in
//! their C shapes, so all host-side conversion lives in [`crate::marshal`].

use std::ffi::{c_char, c_int};

/// Opaque native model.
#[repr(C)]
pub struct NativeModel {
    _private: [u8; 0],
}

/// Opaque native execution context.
#[repr(C)]
pub struct NativeContext {
    _private: [u8; 0],
}

/// Model loading parameters in their C layout.
///
/// ```c
/// typedef struct {
///     int32_t n_gpu_layers;
///     bool    use_mmap;
///     bool    use_mlock;
///     bool    vocab_only;
/// } llm_model_params;
/// ```
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawModelParams {
    pub n_gpu_layers: i32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub vocab_only: bool,
}

/// Context parameters in their C layout.
///
/// ```c
/// typedef struct {
///     uint32_t n_ctx;
///     uint32_t n_batch;
///     int32_t  n_threads;
///     uint32_t seed;
///     float    temperature;
///     int32_t  top_k;
///     float    top_p;
///     float    repeat_penalty;
/// } llm_context_params;
/// ```
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawContextParams {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_threads: i32,
    pub seed: u32,
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub repeat_penalty: f32,
}

/// Seed value asking the runtime to choose its own seed.
pub const DEFAULT_SEED: u32 = 0xFFFF_FFFF;

/// A native LLM runtime reachable through its C calling convention.
///
/// Status-returning functions follow the llama.cpp `llama_decode`
/// convention: `0` success, `1` out of KV/cache space, `2` aborted,
/// `-1` invalid input, any other negative value a fatal internal error.
/// Buffer-filling functions return the number of elements written, or the
/// negated required size when the buffer is too small.
///
/// # Safety
///
/// Implementors guarantee that a non-null pointer returned by
/// [`load_model`](Self::load_model) or [`create_context`](Self::create_context)
/// stays valid until the matching free function is called, and that
/// [`request_stop`](Self::request_stop) may be called from any thread while
/// another call is in flight on the same context. Apart from that stop
/// request, the bridge never calls into one context from two threads at once.
pub unsafe trait NativeBackend: Send + Sync {
    /// Human readable backend name, for logs.
    fn name(&self) -> &str;

    /// One-time process-wide initialization.
    unsafe fn backend_init(&self);

    /// Process-wide teardown.
    unsafe fn backend_free(&self);

    /// Load weights; returns null on failure.
    unsafe fn load_model(
        &self,
        path: *const c_char,
        params: *const RawModelParams,
    ) -> *mut NativeModel;

    unsafe fn free_model(&self, model: *mut NativeModel);

    /// Create an execution context; returns null on failure.
    unsafe fn create_context(
        &self,
        model: *mut NativeModel,
        params: *const RawContextParams,
    ) -> *mut NativeContext;

    unsafe fn free_context(&self, ctx: *mut NativeContext);

    /// Tokenize `text_len` bytes of UTF-8 (not null-terminated).
    unsafe fn tokenize(
        &self,
        model: *const NativeModel,
        text: *const c_char,
        text_len: c_int,
        tokens: *mut i32,
        n_tokens_max: c_int,
        add_special: bool,
    ) -> c_int;

    /// Feed tokens into the context (prefill).
    unsafe fn decode(&self, ctx: *mut NativeContext, tokens: *const i32, n_tokens: c_int) -> c_int;

    /// Sample and feed back one token, writing its id to `token_out`.
    unsafe fn generate_step(&self, ctx: *mut NativeContext, token_out: *mut i32) -> c_int;

    /// Render a token's bytes into `buf`.
    unsafe fn token_to_piece(
        &self,
        model: *const NativeModel,
        token: i32,
        buf: *mut c_char,
        length: c_int,
    ) -> c_int;

    /// Whether the last generated token ended the sequence.
    unsafe fn is_end_of_sequence(&self, ctx: *const NativeContext) -> bool;

    /// Last error code recorded by the runtime (0 if none).
    fn last_error(&self) -> c_int;

    /// Last error message, copied into host memory.
    fn last_error_message(&self) -> Option<String> {
        None
    }

    /// Whether [`request_stop`](Self::request_stop) reaches the runtime.
    fn supports_stop(&self) -> bool {
        false
    }

    /// Whether [`reset_context`](Self::reset_context) reaches the runtime.
    fn supports_reset(&self) -> bool {
        false
    }

    /// Ask an in-flight call on `ctx` to stop at its next safe point.
    /// A pending request is cleared by the next `decode` or `reset_context`.
    ///
    /// Returns `None` when the runtime has no stop primitive.
    unsafe fn request_stop(&self, _ctx: *mut NativeContext) -> Option<c_int> {
        None
    }

    /// Clear the context's sequence state. `None` when unsupported.
    unsafe fn reset_context(&self, _ctx: *mut NativeContext) -> Option<c_int> {
        None
    }

    /// Vocabulary size, when the runtime exposes it.
    unsafe fn vocab_size(&self, _model: *const NativeModel) -> Option<c_int> {
        None
    }

    /// Context length the model was trained with, when exposed.
    unsafe fn train_context_length(&self, _model: *const NativeModel) -> Option<c_int> {
        None
    }
}
