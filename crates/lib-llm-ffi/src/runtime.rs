//! Process-wide backend initialization.
//!
//! llama.cpp-style runtimes need a one-time `backend_init` before any model
//! is loaded and a matching `backend_free` at teardown. [`Runtime`] makes
//! both explicit and idempotent behind a single mutex, and refuses to tear
//! the backend down while models are still alive.

use crate::backend::NativeBackend;
use crate::error::{BridgeError, BridgeResult};
use crate::loader::LlamaLibrary;
use crate::model::Model;
use crate::sync::RecoverMutex;
use lib_types::ModelConfig;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Backend lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeState {
    Uninitialized,
    Initialized,
    ShutDown,
}

pub(crate) struct RuntimeShared {
    backend: Arc<dyn NativeBackend>,
    state: Mutex<RuntimeState>,
    live_models: AtomicUsize,
}

impl RuntimeShared {
    pub(crate) fn backend(&self) -> &Arc<dyn NativeBackend> {
        &self.backend
    }

    /// Reserve a model slot; fails unless the backend is initialized.
    ///
    /// The state lock is held across the check and the increment so a
    /// concurrent shutdown sees either no reservation and wins, or the
    /// reservation and refuses.
    pub(crate) fn reserve_model(&self) -> BridgeResult<()> {
        let state = self.state.lock_recover();
        if *state != RuntimeState::Initialized {
            return Err(BridgeError::NotInitialized);
        }
        self.live_models.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn model_released(&self) {
        self.live_models.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for RuntimeShared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|p| p.into_inner());
        if *state == RuntimeState::Initialized {
            tracing::debug!(backend = self.backend.name(), "Freeing backend on runtime drop");
            // SAFETY: no models remain; they each hold a reference to us
            unsafe { self.backend.backend_free() };
            *state = RuntimeState::ShutDown;
        }
    }
}

/// Handle to an initialized (or initializable) native runtime.
///
/// Cloning is cheap; all clones share one backend and one lifecycle.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<RuntimeShared>,
}

impl Runtime {
    /// Wrap a backend. Nothing is called on it until [`init`](Self::init).
    pub fn new(backend: Arc<dyn NativeBackend>) -> Self {
        Self {
            shared: Arc::new(RuntimeShared {
                backend,
                state: Mutex::new(RuntimeState::Uninitialized),
                live_models: AtomicUsize::new(0),
            }),
        }
    }

    /// Load a runtime shared library and wrap it.
    pub fn load_library<P: AsRef<Path>>(path: P) -> BridgeResult<Self> {
        let library = LlamaLibrary::load(path)?;
        let info = library.info();
        let missing: Vec<&str> = info
            .optional_symbols
            .iter()
            .filter(|s| !s.found)
            .map(|s| s.name.as_str())
            .collect();
        if !missing.is_empty() {
            tracing::warn!(
                path = %info.path,
                format = ?info.format,
                ?missing,
                "Runtime library lacks optional symbols"
            );
        }
        Ok(Self::new(library))
    }

    /// Initialize the native backend. Calling it again is a no-op.
    pub fn init(&self) -> BridgeResult<()> {
        let mut state = self.shared.state.lock_recover();
        if *state == RuntimeState::Initialized {
            return Ok(());
        }
        // SAFETY: guarded by the state lock, so init never runs twice
        // concurrently or while the backend is initialized
        unsafe { self.shared.backend.backend_init() };
        *state = RuntimeState::Initialized;
        tracing::info!(backend = self.shared.backend.name(), "Native backend initialized");
        Ok(())
    }

    /// Tear the backend down.
    ///
    /// Returns [`BridgeError::Busy`] while any model is still loaded. A
    /// runtime that was never initialized, or is already shut down, is left
    /// as it is.
    pub fn shutdown(&self) -> BridgeResult<()> {
        let mut state = self.shared.state.lock_recover();
        if *state != RuntimeState::Initialized {
            return Ok(());
        }
        let live = self.shared.live_models.load(Ordering::SeqCst);
        if live > 0 {
            tracing::warn!(live_models = live, "Refusing backend shutdown with live models");
            return Err(BridgeError::Busy);
        }
        // SAFETY: no models are alive and the state lock excludes loads
        unsafe { self.shared.backend.backend_free() };
        *state = RuntimeState::ShutDown;
        tracing::info!(backend = self.shared.backend.name(), "Native backend shut down");
        Ok(())
    }

    pub fn state(&self) -> RuntimeState {
        *self.shared.state.lock_recover()
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == RuntimeState::Initialized
    }

    /// Models whose native handle has not been freed yet.
    pub fn live_models(&self) -> usize {
        self.shared.live_models.load(Ordering::SeqCst)
    }

    pub fn backend_name(&self) -> String {
        self.shared.backend.name().to_string()
    }

    /// Whether sessions can interrupt a native step mid-call. Without it,
    /// cancellation waits for the current step to return.
    pub fn supports_stop(&self) -> bool {
        self.shared.backend.supports_stop()
    }

    /// Whether [`Session::reset`](crate::Session::reset) is available.
    pub fn supports_reset(&self) -> bool {
        self.shared.backend.supports_reset()
    }

    /// Load model weights.
    ///
    /// The configuration is validated before anything crosses into the
    /// native library, so a missing file is reported as
    /// [`BridgeError::InvalidArgument`] with no native call made.
    pub fn load_model(&self, config: &ModelConfig) -> BridgeResult<Model> {
        Model::load(&self.shared, config)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("backend", &self.shared.backend.name())
            .field("state", &self.state())
            .field("live_models", &self.live_models())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;

    #[test]
    fn test_init_is_idempotent() {
        let mock = Arc::new(MockBackend::new());
        let runtime = Runtime::new(mock.clone());
        assert_eq!(runtime.state(), RuntimeState::Uninitialized);

        runtime.init().unwrap();
        runtime.init().unwrap();
        assert!(runtime.is_initialized());
        assert_eq!(mock.inits(), 1);
    }

    #[test]
    fn test_reports_backend_capabilities() {
        let full = Runtime::new(Arc::new(MockBackend::new()));
        assert!(full.supports_stop());
        assert!(full.supports_reset());

        let bare = Runtime::new(Arc::new(MockBackend::new().without_stop().without_reset()));
        assert!(!bare.supports_stop());
        assert!(!bare.supports_reset());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mock = Arc::new(MockBackend::new());
        let runtime = Runtime::new(mock.clone());
        runtime.shutdown().unwrap();
        assert_eq!(mock.teardowns(), 0);

        runtime.init().unwrap();
        runtime.shutdown().unwrap();
        runtime.shutdown().unwrap();
        assert_eq!(mock.teardowns(), 1);
        assert_eq!(runtime.state(), RuntimeState::ShutDown);
    }

    #[test]
    fn test_drop_frees_initialized_backend() {
        let mock = Arc::new(MockBackend::new());
        {
            let runtime = Runtime::new(mock.clone());
            runtime.init().unwrap();
        }
        assert_eq!(mock.teardowns(), 1);
    }

    #[test]
    fn test_concurrent_init_runs_once() {
        let mock = Arc::new(MockBackend::new());
        let runtime = Runtime::new(mock.clone());
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| runtime.init().unwrap());
            }
        });
        assert_eq!(mock.inits(), 1);
    }
}
