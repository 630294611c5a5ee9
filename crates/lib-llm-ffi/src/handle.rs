//! Owning wrappers for native handles.
//!
//! A [`NativeHandle`] is the only place a raw model or context pointer is
//! stored. It is move-only, never hands the pointer out beyond the crate, and
//! swaps the pointer to null on release so the native free runs exactly once
//! no matter how many times release is requested.

use crate::backend::{NativeBackend, NativeContext, NativeModel};
use crate::error::{BridgeError, BridgeResult};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

/// The kind of resource a handle owns.
pub(crate) trait HandleKind: 'static {
    type Raw;

    /// Resource name used in errors and logs.
    const NAME: &'static str;

    /// Run the matching native free function.
    ///
    /// # Safety
    /// `raw` must be a live handle created by `backend` and not freed yet.
    unsafe fn free(backend: &dyn NativeBackend, raw: *mut Self::Raw);
}

pub(crate) enum ModelKind {}

impl HandleKind for ModelKind {
    type Raw = NativeModel;
    const NAME: &'static str = "model";

    unsafe fn free(backend: &dyn NativeBackend, raw: *mut NativeModel) {
        backend.free_model(raw)
    }
}

pub(crate) enum ContextKind {}

impl HandleKind for ContextKind {
    type Raw = NativeContext;
    const NAME: &'static str = "context";

    unsafe fn free(backend: &dyn NativeBackend, raw: *mut NativeContext) {
        backend.free_context(raw)
    }
}

/// Exclusive owner of one native resource.
pub(crate) struct NativeHandle<K: HandleKind> {
    raw: AtomicPtr<K::Raw>,
    backend: Arc<dyn NativeBackend>,
    _kind: PhantomData<K>,
}

impl<K: HandleKind> NativeHandle<K> {
    /// Take ownership of a freshly created, non-null handle.
    pub(crate) fn adopt(backend: Arc<dyn NativeBackend>, raw: *mut K::Raw) -> Self {
        debug_assert!(!raw.is_null(), "adopting a null {} handle", K::NAME);
        Self {
            raw: AtomicPtr::new(raw),
            backend,
            _kind: PhantomData,
        }
    }

    /// Borrow the raw pointer for a native call.
    ///
    /// Callers must hold whatever exclusion the resource requires (session
    /// admission for contexts, an open-session reference for models) so the
    /// pointer cannot be released while in use.
    pub(crate) fn as_ptr(&self) -> BridgeResult<*mut K::Raw> {
        let raw = self.raw.load(Ordering::Acquire);
        if raw.is_null() {
            return Err(BridgeError::use_after_release(K::NAME));
        }
        Ok(raw)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.raw.load(Ordering::Acquire).is_null()
    }

    /// Release the resource. Returns `true` only for the call that actually
    /// invoked the native free.
    pub(crate) fn release(&self) -> bool {
        let raw = self.raw.swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            return false;
        }
        // SAFETY: the swap hands the live pointer to exactly one caller
        unsafe { K::free(self.backend.as_ref(), raw) };
        tracing::debug!(kind = K::NAME, backend = self.backend.name(), "Released native handle");
        true
    }

    pub(crate) fn backend(&self) -> &dyn NativeBackend {
        self.backend.as_ref()
    }

    pub(crate) fn backend_arc(&self) -> Arc<dyn NativeBackend> {
        self.backend.clone()
    }
}

impl<K: HandleKind> Drop for NativeHandle<K> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<K: HandleKind> std::fmt::Debug for NativeHandle<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeHandle")
            .field("kind", &K::NAME)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RawModelParams;
    use crate::mock::MockBackend;

    fn load_raw(mock: &Arc<MockBackend>) -> *mut NativeModel {
        let path = std::ffi::CString::new("mock.gguf").unwrap();
        let params = RawModelParams {
            n_gpu_layers: 0,
            use_mmap: true,
            use_mlock: false,
            vocab_only: false,
        };
        unsafe { mock.load_model(path.as_ptr(), &params) }
    }

    #[test]
    fn test_release_frees_exactly_once() {
        let mock = Arc::new(MockBackend::new());
        let raw = load_raw(&mock);
        let handle = NativeHandle::<ModelKind>::adopt(mock.clone(), raw);

        assert!(handle.release());
        assert!(!handle.release());
        assert!(!handle.release());
        drop(handle);

        assert_eq!(mock.model_frees(), 1);
        assert_eq!(mock.double_frees(), 0);
    }

    #[test]
    fn test_use_after_release_is_detected() {
        let mock = Arc::new(MockBackend::new());
        let handle = NativeHandle::<ModelKind>::adopt(mock.clone(), load_raw(&mock));
        assert!(handle.as_ptr().is_ok());
        handle.release();
        assert!(matches!(
            handle.as_ptr(),
            Err(BridgeError::UseAfterRelease { resource: "model" })
        ));
    }

    #[test]
    fn test_drop_releases() {
        let mock = Arc::new(MockBackend::new());
        {
            let _handle = NativeHandle::<ModelKind>::adopt(mock.clone(), load_raw(&mock));
        }
        assert_eq!(mock.model_frees(), 1);
    }

    #[test]
    fn test_concurrent_release_frees_once() {
        let mock = Arc::new(MockBackend::new());
        let handle = NativeHandle::<ModelKind>::adopt(mock.clone(), load_raw(&mock));
        let freed: usize = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8).map(|_| s.spawn(|| handle.release())).collect();
            workers.into_iter().map(|w| w.join().unwrap() as usize).sum()
        });
        assert_eq!(freed, 1);
        assert_eq!(mock.model_frees(), 1);
    }
}
