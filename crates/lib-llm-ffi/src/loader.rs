//! Dynamic library loading for native LLM runtimes.
//!
//! This module loads a runtime shared library that exports the `llm_*` C API
//! (a thin shim over llama.cpp) and resolves its function symbols once, up
//! front. Missing required symbols fail the load; optional symbols degrade
//! the matching capability to [`BridgeError::NotSupported`].

use crate::backend::{NativeBackend, NativeContext, NativeModel, RawContextParams, RawModelParams};
use crate::error::{BridgeError, BridgeResult};
use crate::marshal::read_c_string;
use libloading::Library;
use std::ffi::{c_char, c_int};
use std::path::Path;
use std::sync::Arc;

/// ```c
/// void llm_backend_init(void);
/// void llm_backend_free(void);
/// ```
pub type BackendFn = unsafe extern "C" fn();

/// ```c
/// llm_model *llm_load_model(const char *path, const llm_model_params *params);
/// ```
pub type LoadModelFn =
    unsafe extern "C" fn(path: *const c_char, params: *const RawModelParams) -> *mut NativeModel;

/// ```c
/// void llm_free_model(llm_model *model);
/// ```
pub type FreeModelFn = unsafe extern "C" fn(model: *mut NativeModel);

/// ```c
/// llm_context *llm_create_context(llm_model *model, const llm_context_params *params);
/// ```
pub type CreateContextFn = unsafe extern "C" fn(
    model: *mut NativeModel,
    params: *const RawContextParams,
) -> *mut NativeContext;

/// ```c
/// void llm_free_context(llm_context *ctx);
/// ```
pub type FreeContextFn = unsafe extern "C" fn(ctx: *mut NativeContext);

/// Function signature for llm_tokenize.
///
/// ```c
/// int32_t llm_tokenize(
///     const llm_model *model,
///     const char      *text,
///     int32_t          text_len,
///     int32_t         *tokens,
///     int32_t          n_tokens_max,
///     bool             add_special
/// );
/// ```
///
/// Returns the number of tokens written, or the negated required count.
pub type TokenizeFn = unsafe extern "C" fn(
    model: *const NativeModel,
    text: *const c_char,
    text_len: c_int,
    tokens: *mut i32,
    n_tokens_max: c_int,
    add_special: bool,
) -> c_int;

/// ```c
/// int32_t llm_decode(llm_context *ctx, const int32_t *tokens, int32_t n_tokens);
/// ```
pub type DecodeFn =
    unsafe extern "C" fn(ctx: *mut NativeContext, tokens: *const i32, n_tokens: c_int) -> c_int;

/// ```c
/// int32_t llm_generate_step(llm_context *ctx, int32_t *token_out);
/// ```
pub type GenerateStepFn = unsafe extern "C" fn(ctx: *mut NativeContext, token_out: *mut i32) -> c_int;

/// ```c
/// int32_t llm_token_to_piece(const llm_model *model, int32_t token, char *buf, int32_t length);
/// ```
pub type TokenToPieceFn = unsafe extern "C" fn(
    model: *const NativeModel,
    token: i32,
    buf: *mut c_char,
    length: c_int,
) -> c_int;

/// ```c
/// bool llm_is_eos(const llm_context *ctx);
/// ```
pub type IsEosFn = unsafe extern "C" fn(ctx: *const NativeContext) -> bool;

/// ```c
/// int32_t llm_last_error(void);
/// ```
pub type LastErrorFn = unsafe extern "C" fn() -> c_int;

/// The returned string is owned by the runtime and valid until the next call
/// on the same thread.
///
/// ```c
/// const char *llm_last_error_message(void);
/// ```
pub type LastErrorMessageFn = unsafe extern "C" fn() -> *const c_char;

/// ```c
/// int32_t llm_request_stop(llm_context *ctx);
/// int32_t llm_reset_context(llm_context *ctx);
/// ```
pub type ContextControlFn = unsafe extern "C" fn(ctx: *mut NativeContext) -> c_int;

/// ```c
/// int32_t llm_n_vocab(const llm_model *model);
/// int32_t llm_n_ctx_train(const llm_model *model);
/// ```
pub type ModelQueryFn = unsafe extern "C" fn(model: *const NativeModel) -> c_int;

/// Symbols a library must export to be usable.
pub const REQUIRED_SYMBOLS: &[&str] = &[
    "llm_backend_init",
    "llm_backend_free",
    "llm_load_model",
    "llm_free_model",
    "llm_create_context",
    "llm_free_context",
    "llm_tokenize",
    "llm_decode",
    "llm_generate_step",
    "llm_token_to_piece",
    "llm_is_eos",
    "llm_last_error",
];

/// Symbols that enable extra capabilities when present.
pub const OPTIONAL_SYMBOLS: &[&str] = &[
    "llm_last_error_message",
    "llm_request_stop",
    "llm_reset_context",
    "llm_n_vocab",
    "llm_n_ctx_train",
];

/// Loaded runtime library with extracted function pointers.
pub struct LlamaLibrary {
    /// Keeps the code behind the function pointers mapped.
    #[allow(dead_code)]
    library: Library,

    /// Path to the library file.
    pub path: String,

    backend_init: BackendFn,
    backend_free: BackendFn,
    load_model: LoadModelFn,
    free_model: FreeModelFn,
    create_context: CreateContextFn,
    free_context: FreeContextFn,
    tokenize: TokenizeFn,
    decode: DecodeFn,
    generate_step: GenerateStepFn,
    token_to_piece: TokenToPieceFn,
    is_eos: IsEosFn,
    last_error: LastErrorFn,

    last_error_message: Option<LastErrorMessageFn>,
    request_stop: Option<ContextControlFn>,
    reset_context: Option<ContextControlFn>,
    n_vocab: Option<ModelQueryFn>,
    n_ctx_train: Option<ModelQueryFn>,
}

/// Resolve one required symbol, copying the function pointer out.
///
/// # Safety
/// `T` must be the symbol's real signature.
unsafe fn required<T: Copy>(library: &Library, name: &str) -> BridgeResult<T> {
    let symbol = format!("{name}\0");
    library
        .get::<T>(symbol.as_bytes())
        .map(|s| *s)
        .map_err(|_| BridgeError::symbol_not_found(name))
}

/// # Safety
/// `T` must be the symbol's real signature.
unsafe fn optional<T: Copy>(library: &Library, name: &str) -> Option<T> {
    let symbol = format!("{name}\0");
    library.get::<T>(symbol.as_bytes()).ok().map(|s| *s)
}

impl LlamaLibrary {
    /// Load a runtime from a shared library file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the `.so`, `.dylib` or `.dll` file
    ///
    /// # Safety
    ///
    /// Loading runs the library's initializers, and the bridge trusts the
    /// exported functions to match the documented signatures. Invalid or
    /// malicious libraries may cause undefined behavior.
    pub fn load<P: AsRef<Path>>(path: P) -> BridgeResult<Arc<Self>> {
        let path = path.as_ref();
        let path_str = path.display().to_string();

        let library =
            unsafe { Library::new(path) }.map_err(|e| BridgeError::load_error(&path_str, e))?;

        // SAFETY: each type alias mirrors the C prototype documented on it
        let lib = unsafe {
            Self {
                backend_init: required(&library, "llm_backend_init")?,
                backend_free: required(&library, "llm_backend_free")?,
                load_model: required(&library, "llm_load_model")?,
                free_model: required(&library, "llm_free_model")?,
                create_context: required(&library, "llm_create_context")?,
                free_context: required(&library, "llm_free_context")?,
                tokenize: required(&library, "llm_tokenize")?,
                decode: required(&library, "llm_decode")?,
                generate_step: required(&library, "llm_generate_step")?,
                token_to_piece: required(&library, "llm_token_to_piece")?,
                is_eos: required(&library, "llm_is_eos")?,
                last_error: required(&library, "llm_last_error")?,
                last_error_message: optional(&library, "llm_last_error_message"),
                request_stop: optional(&library, "llm_request_stop"),
                reset_context: optional(&library, "llm_reset_context"),
                n_vocab: optional(&library, "llm_n_vocab"),
                n_ctx_train: optional(&library, "llm_n_ctx_train"),
                path: path_str,
                library,
            }
        };

        tracing::info!(
            path = %lib.path,
            has_stop = lib.request_stop.is_some(),
            has_reset = lib.reset_context.is_some(),
            has_error_message = lib.last_error_message.is_some(),
            "Loaded LLM runtime library"
        );

        Ok(Arc::new(lib))
    }

    /// Summarize what the library exports.
    pub fn info(&self) -> LibraryInfo {
        let present = [
            ("llm_last_error_message", self.last_error_message.is_some()),
            ("llm_request_stop", self.request_stop.is_some()),
            ("llm_reset_context", self.reset_context.is_some()),
            ("llm_n_vocab", self.n_vocab.is_some()),
            ("llm_n_ctx_train", self.n_ctx_train.is_some()),
        ];
        LibraryInfo {
            path: self.path.clone(),
            format: LibraryFormat::from_path(&self.path),
            optional_symbols: present
                .iter()
                .map(|&(name, found)| SymbolStatus {
                    name: name.to_string(),
                    found,
                })
                .collect(),
        }
    }
}

// LlamaLibrary is Send + Sync because it only stores function pointers and
// the Library handle. Per-context exclusion is enforced by the session layer.
unsafe impl Send for LlamaLibrary {}
unsafe impl Sync for LlamaLibrary {}

unsafe impl NativeBackend for LlamaLibrary {
    fn name(&self) -> &str {
        &self.path
    }

    fn supports_stop(&self) -> bool {
        self.request_stop.is_some()
    }

    fn supports_reset(&self) -> bool {
        self.reset_context.is_some()
    }

    unsafe fn backend_init(&self) {
        (self.backend_init)()
    }

    unsafe fn backend_free(&self) {
        (self.backend_free)()
    }

    unsafe fn load_model(
        &self,
        path: *const c_char,
        params: *const RawModelParams,
    ) -> *mut NativeModel {
        (self.load_model)(path, params)
    }

    unsafe fn free_model(&self, model: *mut NativeModel) {
        (self.free_model)(model)
    }

    unsafe fn create_context(
        &self,
        model: *mut NativeModel,
        params: *const RawContextParams,
    ) -> *mut NativeContext {
        (self.create_context)(model, params)
    }

    unsafe fn free_context(&self, ctx: *mut NativeContext) {
        (self.free_context)(ctx)
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
        (self.tokenize)(model, text, text_len, tokens, n_tokens_max, add_special)
    }

    unsafe fn decode(&self, ctx: *mut NativeContext, tokens: *const i32, n_tokens: c_int) -> c_int {
        (self.decode)(ctx, tokens, n_tokens)
    }

    unsafe fn generate_step(&self, ctx: *mut NativeContext, token_out: *mut i32) -> c_int {
        (self.generate_step)(ctx, token_out)
    }

    unsafe fn token_to_piece(
        &self,
        model: *const NativeModel,
        token: i32,
        buf: *mut c_char,
        length: c_int,
    ) -> c_int {
        (self.token_to_piece)(model, token, buf, length)
    }

    unsafe fn is_end_of_sequence(&self, ctx: *const NativeContext) -> bool {
        (self.is_eos)(ctx)
    }

    fn last_error(&self) -> c_int {
        // SAFETY: takes no arguments and only reads runtime state
        unsafe { (self.last_error)() }
    }

    fn last_error_message(&self) -> Option<String> {
        let f = self.last_error_message?;
        // SAFETY: the runtime keeps the string alive until its next call on
        // this thread; it is copied before returning
        unsafe { read_c_string(f()) }
    }

    unsafe fn request_stop(&self, ctx: *mut NativeContext) -> Option<c_int> {
        self.request_stop.map(|f| f(ctx))
    }

    unsafe fn reset_context(&self, ctx: *mut NativeContext) -> Option<c_int> {
        self.reset_context.map(|f| f(ctx))
    }

    unsafe fn vocab_size(&self, model: *const NativeModel) -> Option<c_int> {
        self.n_vocab.map(|f| f(model))
    }

    unsafe fn train_context_length(&self, model: *const NativeModel) -> Option<c_int> {
        self.n_ctx_train.map(|f| f(model))
    }
}

/// Report the presence of every known symbol without requiring a complete
/// library, for diagnostics.
pub fn probe<P: AsRef<Path>>(path: P) -> BridgeResult<Vec<SymbolStatus>> {
    let path = path.as_ref();
    let library = unsafe { Library::new(path) }
        .map_err(|e| BridgeError::load_error(path.display().to_string(), e))?;
    let statuses = REQUIRED_SYMBOLS
        .iter()
        .chain(OPTIONAL_SYMBOLS)
        .map(|&name| {
            let symbol = format!("{name}\0");
            // SAFETY: the symbol is only looked up, never called
            let found = unsafe { library.get::<*const ()>(symbol.as_bytes()).is_ok() };
            SymbolStatus {
                name: name.to_string(),
                found,
            }
        })
        .collect();
    Ok(statuses)
}

/// Whether a symbol was found.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolStatus {
    pub name: String,
    pub found: bool,
}

/// Information about a loaded runtime library.
#[derive(Clone, Debug)]
pub struct LibraryInfo {
    /// Path to the library.
    pub path: String,

    /// Platform-specific library format.
    pub format: LibraryFormat,

    /// Optional capabilities and whether each is exported.
    pub optional_symbols: Vec<SymbolStatus>,
}

/// Platform-specific library format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LibraryFormat {
    /// Windows DLL.
    Dll,
    /// Linux/Unix shared object.
    So,
    /// macOS dynamic library.
    Dylib,
    /// Unknown format.
    Unknown,
}

impl LibraryFormat {
    /// Detect format from file extension.
    ///
    /// Versioned shared objects (`libllama.so.1`) count as `So`.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("dll") => Self::Dll,
            Some("so") => Self::So,
            Some("dylib") => Self::Dylib,
            _ => {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                if name.contains(".so.") {
                    Self::So
                } else {
                    Self::Unknown
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_format_detection() {
        assert_eq!(LibraryFormat::from_path("llama.dll"), LibraryFormat::Dll);
        assert_eq!(LibraryFormat::from_path("LLAMA.DLL"), LibraryFormat::Dll);
        assert_eq!(LibraryFormat::from_path("libllama.so"), LibraryFormat::So);
        assert_eq!(LibraryFormat::from_path("libllama.so.1"), LibraryFormat::So);
        assert_eq!(
            LibraryFormat::from_path("libllama.dylib"),
            LibraryFormat::Dylib
        );
        assert_eq!(LibraryFormat::from_path("model.gguf"), LibraryFormat::Unknown);
    }

    #[test]
    fn test_missing_library_is_load_error() {
        let err = LlamaLibrary::load("/nonexistent/libllm_shim.so").err().unwrap();
        assert!(matches!(err, BridgeError::LoadError { .. }));
    }

    #[test]
    fn test_symbol_tables_are_disjoint() {
        for name in OPTIONAL_SYMBOLS {
            assert!(!REQUIRED_SYMBOLS.contains(name));
        }
        assert_eq!(REQUIRED_SYMBOLS.len(), 12);
    }
}
