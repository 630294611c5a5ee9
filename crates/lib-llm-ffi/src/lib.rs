//! # lib-llm-ffi
//!
//! Safe bridge to a native large-language-model runtime exposing a C ABI.
//!
//! This crate lets a host drive a llama.cpp-style inference library without
//! ever touching its raw handles. It handles:
//!
//! - Dynamic library loading with `libloading`
//! - Ownership of native model and context handles (freed exactly once)
//! - Marshaling of integers, text and token buffers across the boundary
//! - Translation of native status codes into [`BridgeError`]
//! - Per-context admission control (one call in flight, others get `Busy`)
//! - Streaming generation as a pull-based iterator with cooperative cancel
//!
//! # Usage
//!
//! ```ignore
//! let runtime = Runtime::load_library("libllm_shim.so")?;
//! runtime.init()?;
//! let model = runtime.load_model(&ModelConfig::new("model.gguf"))?;
//! let session = model.open_session(ContextParams::default())?;
//! for unit in session.stream(&Input::text("Hello"), &GenerateOptions::default())? {
//!     print!("{}", unit?.text);
//! }
//! ```
//!
//! # Safety
//!
//! The native library is trusted to honor the contract documented on
//! [`NativeBackend`]. Everything above that trait is safe Rust: the bridge
//! never calls into one context from two threads, never frees a handle
//! twice, and never lets a native pointer outlive the call that produced it.

pub mod backend;
pub mod cancel;
pub mod error;
mod handle;
pub mod lifecycle;
pub mod loader;
pub mod marshal;
pub mod model;
pub mod runtime;
pub mod status;
pub mod stream;
mod sync;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use backend::NativeBackend;
pub use cancel::{CancelToken, Deadline};
pub use error::{BridgeError, BridgeResult};
pub use lifecycle::Session;
pub use loader::{LibraryFormat, LibraryInfo, LlamaLibrary};
pub use model::{Model, ModelInfo};
pub use runtime::{Runtime, RuntimeState};
pub use status::StatusCode;
pub use stream::TokenStream;

pub use lib_types::{
    ContextParams, FinishReason, GenerateOptions, Generation, Input, ModelConfig, OutputUnit,
    SessionState, SessionStats, TokenId,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    fn model_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"GGUF").unwrap();
        file
    }

    fn runtime(mock: &Arc<MockBackend>) -> Runtime {
        let runtime = Runtime::new(mock.clone());
        runtime.init().unwrap();
        runtime
    }

    #[test]
    fn test_nonexistent_path_is_invalid_without_native_calls() {
        let mock = Arc::new(MockBackend::new());
        let runtime = runtime(&mock);
        let calls = mock.native_calls();

        let err = runtime
            .load_model(&ModelConfig::new("/models/missing.gguf"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument { .. }));
        assert_eq!(mock.native_calls(), calls);
        assert_eq!(mock.model_loads(), 0);
    }

    #[test]
    fn test_acquire_release_use_is_use_after_release() {
        let mock = Arc::new(MockBackend::new());
        let runtime = runtime(&mock);
        let file = model_file();
        let model = runtime.load_model(&ModelConfig::new(file.path())).unwrap();
        let session = model.open_session(ContextParams::default()).unwrap();

        session.close().unwrap();
        let err = session
            .generate(&Input::text("hi"), &GenerateOptions::default())
            .unwrap_err();
        assert!(matches!(err, BridgeError::UseAfterRelease { .. }));
        assert!(err.is_fatal());

        model.close();
        assert!(matches!(
            model.tokenize("hi", true),
            Err(BridgeError::UseAfterRelease { .. })
        ));
    }

    #[test]
    fn test_two_sessions_on_one_model_run_concurrently() {
        // Both decodes must be inside the runtime at the same time for the
        // rendezvous to complete.
        let mock = Arc::new(MockBackend::new().with_rendezvous(2).with_response("ok"));
        let runtime = runtime(&mock);
        let file = model_file();
        let model = runtime.load_model(&ModelConfig::new(file.path())).unwrap();
        let a = model.open_session(ContextParams::default()).unwrap();
        let b = model.open_session(ContextParams::default()).unwrap();

        let (ra, rb) = std::thread::scope(|s| {
            let ha = s.spawn(|| a.generate(&Input::text("a"), &GenerateOptions::default()));
            let hb = s.spawn(|| b.generate(&Input::text("b"), &GenerateOptions::default()));
            (ha.join().unwrap(), hb.join().unwrap())
        });
        assert_eq!(ra.unwrap().text, "ok");
        assert_eq!(rb.unwrap().text, "ok");
        assert!(mock.rendezvous_reached());
        assert_eq!(mock.interleaved(), 0);
    }

    #[test]
    fn test_overlapping_calls_on_one_session_are_busy() {
        let mock = Arc::new(MockBackend::new());
        let runtime = runtime(&mock);
        let file = model_file();
        let model = runtime.load_model(&ModelConfig::new(file.path())).unwrap();
        let session = model.open_session(ContextParams::default()).unwrap();
        let mut gate = mock.hold_decode();

        std::thread::scope(|s| {
            let first = s.spawn(|| session.generate(&Input::text("one"), &GenerateOptions::default()));
            assert!(gate.wait_entered());

            let contenders: Vec<_> = (0..4)
                .map(|_| s.spawn(|| session.submit(&Input::text("two"))))
                .collect();
            for c in contenders {
                assert!(matches!(c.join().unwrap(), Err(BridgeError::Busy)));
            }
            assert!(matches!(session.reset(), Err(BridgeError::Busy)));

            gate.release();
            assert!(first.join().unwrap().is_ok());
        });

        let stats = session.stats();
        assert_eq!(stats.calls, 1);
        assert_eq!(stats.busy_rejections, 5);
        assert_eq!(mock.interleaved(), 0);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_mid_stream_cancel_leaves_session_ready() {
        let mock = Arc::new(
            MockBackend::new()
                .with_response(&"abc".repeat(50))
                .with_step_delay(Duration::from_millis(2)),
        );
        let runtime = runtime(&mock);
        let file = model_file();
        let model = runtime.load_model(&ModelConfig::new(file.path())).unwrap();
        let session = model.open_session(ContextParams::default()).unwrap();

        let mut stream = session
            .stream(&Input::text("go"), &GenerateOptions::default())
            .unwrap();
        for _ in 0..3 {
            assert!(stream.next().unwrap().is_ok());
        }
        assert!(session.cancel());

        let mut saw_cancel = false;
        for item in stream.by_ref() {
            if let Err(e) = item {
                assert!(matches!(e, BridgeError::Cancelled));
                saw_cancel = true;
            }
        }
        assert!(saw_cancel);
        assert!(stream.next().is_none());
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.stats().cancellations, 1);

        let out = session
            .generate(&Input::text("again"), &GenerateOptions::default().with_max_tokens(3))
            .unwrap();
        assert_eq!(out.text, "abc");
    }

    #[test]
    fn test_every_handle_freed_exactly_once() {
        let mock = Arc::new(MockBackend::new());
        {
            let runtime = runtime(&mock);
            let file = model_file();
            let model = runtime.load_model(&ModelConfig::new(file.path())).unwrap();
            let sessions: Vec<_> = (0..3)
                .map(|_| model.open_session(ContextParams::default()).unwrap())
                .collect();
            sessions[0].close().unwrap();
            sessions[0].close().unwrap();
            model.close();
            let _ = sessions[1].generate(&Input::text("x"), &GenerateOptions::default());
            assert!(matches!(runtime.shutdown(), Err(BridgeError::Busy)));
        }
        assert_eq!(mock.model_frees(), 1);
        assert_eq!(mock.context_frees(), 3);
        assert_eq!(mock.double_frees(), 0);
        assert_eq!(mock.live_handles(), 0);
        assert_eq!(mock.teardowns(), 1);
    }
}
