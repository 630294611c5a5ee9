//! Loaded model weights.
//!
//! A [`Model`] is shared read-only by every session opened on it. Closing a
//! model stops new sessions immediately, but the native free is deferred
//! until the last open session has closed, so no context ever outlives the
//! weights it was created from.

use crate::error::{BridgeError, BridgeResult};
use crate::handle::{ModelKind, NativeHandle};
use crate::lifecycle::Session;
use crate::marshal::{self, read_growable, TextArg, TokenArg, Utf8Assembler};
use crate::runtime::RuntimeShared;
use crate::status::check_handle;
use lib_types::{ContextParams, ModelConfig, TokenId};
use std::ffi::c_char;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Initial piece buffer; most vocabularies render tokens in a few bytes.
const PIECE_BUFFER: usize = 16;

/// Static facts about a loaded model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelInfo {
    pub path: PathBuf,
    /// Vocabulary size, if the runtime reports it.
    pub vocab_size: Option<usize>,
    /// Context length used in training, if the runtime reports it.
    pub train_context_length: Option<usize>,
}

pub(crate) struct ModelShared {
    handle: NativeHandle<ModelKind>,
    runtime: Arc<RuntimeShared>,
    info: ModelInfo,
    closed: AtomicBool,
    refs: AtomicUsize,
}

impl ModelShared {
    /// Take a reference that keeps the native model alive.
    ///
    /// `refs` is raised before `closed` is read, and [`close`](Self::close)
    /// sets `closed` before reading `refs`; with sequentially consistent
    /// ordering at least one side observes the other.
    pub(crate) fn acquire_ref(&self) -> BridgeResult<()> {
        self.refs.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.release_ref();
            return Err(BridgeError::use_after_release("model"));
        }
        Ok(())
    }

    pub(crate) fn release_ref(&self) {
        if self.refs.fetch_sub(1, Ordering::SeqCst) == 1 && self.closed.load(Ordering::SeqCst) {
            self.free_native();
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let refs = self.refs.load(Ordering::SeqCst);
        tracing::info!(path = %self.info.path.display(), open_sessions = refs, "Closing model");
        if refs == 0 {
            self.free_native();
        }
    }

    fn free_native(&self) {
        if self.handle.release() {
            self.runtime.model_released();
        }
    }

    pub(crate) fn handle(&self) -> &NativeHandle<ModelKind> {
        &self.handle
    }

    pub(crate) fn vocab_size(&self) -> Option<usize> {
        self.info.vocab_size
    }

    /// Tokenize through the native tokenizer.
    ///
    /// Callers must hold a reference (see [`acquire_ref`](Self::acquire_ref)).
    pub(crate) fn tokenize(&self, text: &str, add_special: bool) -> BridgeResult<Vec<TokenId>> {
        let model = self.handle.as_ptr()?;
        let backend = self.handle.backend();
        let arg = TextArg::new(text)?;
        let initial = text.len() + usize::from(add_special) + 1;
        let raw = read_growable::<i32, _>(initial, "tokenize", |buf, capacity| {
            // SAFETY: `arg` borrows `text` and `buf` holds `capacity` slots,
            // both alive for the whole call
            unsafe {
                backend.tokenize(model, arg.as_ptr(), arg.len(), buf, capacity, add_special)
            }
        })?;
        TokenArg::from_raw(raw).to_host("tokenize")
    }

    /// Bytes the runtime renders for one token.
    pub(crate) fn piece(&self, token: TokenId) -> BridgeResult<Vec<u8>> {
        let model = self.handle.as_ptr()?;
        let backend = self.handle.backend();
        let raw = marshal::token_to_c(token)?;
        let bytes = read_growable::<c_char, _>(PIECE_BUFFER, "token_to_piece", |buf, capacity| {
            // SAFETY: `buf` holds `capacity` bytes for the duration of the call
            unsafe { backend.token_to_piece(model, raw, buf, capacity) }
        })?;
        Ok(bytes.into_iter().map(|b| b as u8).collect())
    }

    /// Run `f` while holding a reference.
    fn with_ref<T>(&self, f: impl FnOnce(&Self) -> BridgeResult<T>) -> BridgeResult<T> {
        self.acquire_ref()?;
        let result = f(self);
        self.release_ref();
        result
    }
}

impl Drop for ModelShared {
    fn drop(&mut self) {
        self.free_native();
    }
}

/// Loaded model weights.
///
/// Move-only. Dropping the model closes it.
pub struct Model {
    shared: Arc<ModelShared>,
}

impl Model {
    pub(crate) fn load(runtime: &Arc<RuntimeShared>, config: &ModelConfig) -> BridgeResult<Self> {
        config.validate()?;
        let params = marshal::model_params(config)?;
        let path = marshal::path_to_cstring(&config.path)?;

        runtime.reserve_model()?;
        let backend = runtime.backend();
        // SAFETY: `path` and `params` outlive the call
        let raw = unsafe { backend.load_model(path.as_ptr(), &params) };
        let raw = match check_handle(backend.as_ref(), raw, "load_model") {
            Ok(raw) => raw,
            Err(e) => {
                runtime.model_released();
                return Err(e);
            }
        };
        let handle = NativeHandle::<ModelKind>::adopt(backend.clone(), raw);

        // SAFETY: `raw` is live and owned by `handle`
        let (vocab_size, train_context_length) = unsafe {
            (
                backend.vocab_size(raw).and_then(|n| usize::try_from(n).ok()),
                backend.train_context_length(raw).and_then(|n| usize::try_from(n).ok()),
            )
        };

        let info = ModelInfo {
            path: config.path.clone(),
            vocab_size,
            train_context_length,
        };
        tracing::info!(
            path = %info.path.display(),
            backend = backend.name(),
            vocab_size = ?info.vocab_size,
            train_context_length = ?info.train_context_length,
            gpu_layers = params.n_gpu_layers,
            "Loaded model"
        );

        Ok(Self {
            shared: Arc::new(ModelShared {
                handle,
                runtime: runtime.clone(),
                info,
                closed: AtomicBool::new(false),
                refs: AtomicUsize::new(0),
            }),
        })
    }

    pub fn info(&self) -> &ModelInfo {
        &self.shared.info
    }

    pub fn path(&self) -> &Path {
        &self.shared.info.path
    }

    /// Create an execution context on this model.
    pub fn open_session(&self, params: ContextParams) -> BridgeResult<Session> {
        if let Some(train) = self.shared.info.train_context_length {
            if params.context_length > train {
                tracing::warn!(
                    context_length = params.context_length,
                    train_context_length = train,
                    "Context longer than the model was trained for"
                );
            }
        }
        Session::open(&self.shared, params)
    }

    /// Tokenize text with the model's vocabulary.
    pub fn tokenize(&self, text: &str, add_special: bool) -> BridgeResult<Vec<TokenId>> {
        self.shared.with_ref(|m| m.tokenize(text, add_special))
    }

    /// Render tokens back to text.
    pub fn detokenize(&self, tokens: &[TokenId]) -> BridgeResult<String> {
        self.shared.with_ref(|m| {
            let mut assembler = Utf8Assembler::new();
            let mut text = String::new();
            for &token in tokens {
                text.push_str(&assembler.push(&m.piece(token)?));
            }
            text.push_str(&assembler.finish());
            Ok(text)
        })
    }

    /// Sessions currently holding the model open.
    pub fn open_sessions(&self) -> usize {
        self.shared.refs.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Whether the native weights have been freed.
    pub fn is_released(&self) -> bool {
        self.shared.handle.is_released()
    }

    /// Close the model. Idempotent.
    ///
    /// New sessions and tokenization fail with
    /// [`BridgeError::UseAfterRelease`] from here on; sessions that are
    /// already open keep working, and the last one to close frees the
    /// weights.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("path", &self.shared.info.path)
            .field("closed", &self.is_closed())
            .field("open_sessions", &self.open_sessions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, BOS, BYTE_BASE, TRAIN_CONTEXT, VOCAB_SIZE};
    use crate::runtime::Runtime;
    use std::io::Write;

    fn model_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"GGUF").unwrap();
        file
    }

    fn setup() -> (Arc<MockBackend>, Runtime, tempfile::NamedTempFile) {
        let mock = Arc::new(MockBackend::new());
        let runtime = Runtime::new(mock.clone());
        runtime.init().unwrap();
        (mock, runtime, model_file())
    }

    #[test]
    fn test_missing_file_makes_no_native_call() {
        let (mock, runtime, _file) = setup();
        let before = mock.native_calls();
        let err = runtime
            .load_model(&ModelConfig::new("/no/such/model.gguf"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
        assert_eq!(mock.native_calls(), before);
        assert_eq!(runtime.live_models(), 0);
    }

    #[test]
    fn test_load_before_init_fails() {
        let mock = Arc::new(MockBackend::new());
        let runtime = Runtime::new(mock.clone());
        let file = model_file();
        let err = runtime.load_model(&ModelConfig::new(file.path())).unwrap_err();
        assert!(matches!(err, BridgeError::NotInitialized));
        assert_eq!(mock.model_loads(), 0);
    }

    #[test]
    fn test_null_model_is_resource_exhausted() {
        let (mock, runtime, file) = setup();
        mock.fail_next_load();
        let err = runtime.load_model(&ModelConfig::new(file.path())).unwrap_err();
        assert!(matches!(err, BridgeError::ResourceExhausted { code: Some(12), .. }));
        assert_eq!(runtime.live_models(), 0);
    }

    #[test]
    fn test_info_reports_runtime_values() {
        let (_mock, runtime, file) = setup();
        let model = runtime.load_model(&ModelConfig::new(file.path())).unwrap();
        assert_eq!(model.info().vocab_size, Some(VOCAB_SIZE as usize));
        assert_eq!(model.info().train_context_length, Some(TRAIN_CONTEXT as usize));
    }

    #[test]
    fn test_tokenize_and_detokenize() {
        let (_mock, runtime, file) = setup();
        let model = runtime.load_model(&ModelConfig::new(file.path())).unwrap();
        let tokens = model.tokenize("hé", true).unwrap();
        assert_eq!(tokens[0], TokenId(BOS as u32));
        assert_eq!(tokens[1], TokenId((BYTE_BASE + i32::from(b'h')) as u32));
        assert_eq!(tokens.len(), 1 + "hé".len());
        assert_eq!(model.detokenize(&tokens).unwrap(), "hé");
    }

    #[test]
    fn test_close_then_use_is_use_after_release() {
        let (mock, runtime, file) = setup();
        let model = runtime.load_model(&ModelConfig::new(file.path())).unwrap();
        model.close();
        model.close();
        assert!(model.is_released());
        assert_eq!(mock.model_frees(), 1);
        assert_eq!(runtime.live_models(), 0);

        assert!(matches!(
            model.tokenize("x", false),
            Err(BridgeError::UseAfterRelease { resource: "model" })
        ));
        assert!(matches!(
            model.open_session(ContextParams::default()),
            Err(BridgeError::UseAfterRelease { .. })
        ));
        drop(model);
        assert_eq!(mock.model_frees(), 1);
        assert_eq!(mock.double_frees(), 0);
    }

    #[test]
    fn test_close_defers_free_until_sessions_close() {
        let (mock, runtime, file) = setup();
        let model = runtime.load_model(&ModelConfig::new(file.path())).unwrap();
        let session = model.open_session(ContextParams::default()).unwrap();
        assert_eq!(model.open_sessions(), 1);

        model.close();
        assert!(!model.is_released());
        assert_eq!(mock.model_frees(), 0);
        assert!(matches!(runtime.shutdown(), Err(BridgeError::Busy)));

        session.close().unwrap();
        assert!(model.is_released());
        assert_eq!(mock.model_frees(), 1);
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_dropping_model_keeps_open_session_usable() {
        let (mock, runtime, file) = setup();
        let model = runtime.load_model(&ModelConfig::new(file.path())).unwrap();
        let session = model.open_session(ContextParams::default()).unwrap();
        drop(model);
        assert_eq!(mock.model_frees(), 0);
        assert_eq!(session.tokenize("ok", false).unwrap().len(), 2);
        drop(session);
        assert_eq!(mock.model_frees(), 1);
        assert_eq!(mock.context_frees(), 1);
    }
}
