//! Translation of native status codes into [`BridgeError`].

use crate::backend::NativeBackend;
use crate::error::{BridgeError, BridgeResult};
use std::ffi::c_int;

/// Raw status: success.
pub const STATUS_OK: c_int = 0;
/// Raw status: no space left in the context (KV cache full).
pub const STATUS_NO_SPACE: c_int = 1;
/// Raw status: the call was aborted by a stop request.
pub const STATUS_ABORTED: c_int = 2;
/// Raw status: the input was rejected.
pub const STATUS_INVALID_INPUT: c_int = -1;

/// Status signal returned by a native call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    InvalidArgument,
    ResourceExhausted,
    Cancelled,
    /// Fatal native error (negative code other than invalid input).
    InternalFailure(c_int),
    /// A code outside the documented range.
    Unknown(c_int),
}

impl StatusCode {
    pub fn from_raw(raw: c_int) -> Self {
        match raw {
            STATUS_OK => Self::Success,
            STATUS_NO_SPACE => Self::ResourceExhausted,
            STATUS_ABORTED => Self::Cancelled,
            STATUS_INVALID_INPUT => Self::InvalidArgument,
            r if r < 0 => Self::InternalFailure(r),
            r => Self::Unknown(r),
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// The raw code this status was decoded from.
    pub fn raw(self) -> c_int {
        match self {
            Self::Success => STATUS_OK,
            Self::ResourceExhausted => STATUS_NO_SPACE,
            Self::Cancelled => STATUS_ABORTED,
            Self::InvalidArgument => STATUS_INVALID_INPUT,
            Self::InternalFailure(r) | Self::Unknown(r) => r,
        }
    }
}

/// Map a status to the host error taxonomy. Pure; `None` for success.
///
/// `message` is whatever diagnostic text the caller already copied out of
/// the runtime.
pub fn translate(
    status: StatusCode,
    operation: &'static str,
    message: Option<String>,
) -> Option<BridgeError> {
    match status {
        StatusCode::Success => None,
        StatusCode::InvalidArgument => Some(BridgeError::invalid_argument(
            operation,
            message.unwrap_or_else(|| "rejected by native runtime".to_string()),
        )),
        StatusCode::ResourceExhausted => Some(BridgeError::ResourceExhausted {
            operation,
            code: Some(status.raw()),
            message,
        }),
        StatusCode::Cancelled => Some(BridgeError::Cancelled),
        StatusCode::InternalFailure(code) | StatusCode::Unknown(code) => {
            Some(BridgeError::internal(operation, code, message))
        }
    }
}

/// Map a null handle returned by a creation function.
pub fn translate_null(
    operation: &'static str,
    last_error: c_int,
    message: Option<String>,
) -> BridgeError {
    BridgeError::ResourceExhausted {
        operation,
        code: (last_error != 0).then_some(last_error),
        message,
    }
}

/// Check a raw status at a call site, pulling the runtime's error message
/// only when the call failed.
pub(crate) fn check(
    backend: &dyn NativeBackend,
    raw: c_int,
    operation: &'static str,
) -> BridgeResult<()> {
    let status = StatusCode::from_raw(raw);
    if status.is_success() {
        return Ok(());
    }
    let message = backend.last_error_message();
    tracing::debug!(operation, raw, ?status, "Native call returned failure status");
    match translate(status, operation, message) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Check a handle returned by a creation function.
pub(crate) fn check_handle<T>(
    backend: &dyn NativeBackend,
    ptr: *mut T,
    operation: &'static str,
) -> BridgeResult<*mut T> {
    if ptr.is_null() {
        let code = backend.last_error();
        let message = backend.last_error_message();
        tracing::warn!(operation, code, "Native creation function returned null");
        return Err(translate_null(operation, code, message));
    }
    Ok(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_codes() {
        assert_eq!(StatusCode::from_raw(0), StatusCode::Success);
        assert_eq!(StatusCode::from_raw(1), StatusCode::ResourceExhausted);
        assert_eq!(StatusCode::from_raw(2), StatusCode::Cancelled);
        assert_eq!(StatusCode::from_raw(-1), StatusCode::InvalidArgument);
        assert_eq!(StatusCode::from_raw(-2), StatusCode::InternalFailure(-2));
        assert_eq!(StatusCode::from_raw(99), StatusCode::Unknown(99));
    }

    #[test]
    fn test_raw_is_preserved() {
        for raw in [-100, -2, -1, 0, 1, 2, 3, 77] {
            assert_eq!(StatusCode::from_raw(raw).raw(), raw);
        }
    }

    #[test]
    fn test_translate_success_is_none() {
        assert!(translate(StatusCode::Success, "decode", None).is_none());
    }

    #[test]
    fn test_unknown_code_becomes_internal_failure_with_code() {
        let err = translate(StatusCode::from_raw(42), "generate_step", None).unwrap();
        match err {
            BridgeError::InternalFailure { operation, code, .. } => {
                assert_eq!(operation, "generate_step");
                assert_eq!(code, 42);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_translate_categories() {
        assert!(matches!(
            translate(StatusCode::Cancelled, "decode", None),
            Some(BridgeError::Cancelled)
        ));
        assert!(matches!(
            translate(StatusCode::ResourceExhausted, "decode", None),
            Some(BridgeError::ResourceExhausted { code: Some(1), .. })
        ));
        assert!(matches!(
            translate(StatusCode::InvalidArgument, "decode", Some("bad batch".into())),
            Some(BridgeError::InvalidArgument { ref reason, .. }) if reason == "bad batch"
        ));
    }

    #[test]
    fn test_null_handle_maps_to_resource_exhausted() {
        let err = translate_null("load_model", 0, None);
        assert!(matches!(
            err,
            BridgeError::ResourceExhausted { operation: "load_model", code: None, .. }
        ));
        let err = translate_null("create_context", 12, Some("oom".into()));
        assert_eq!(err.native_code(), Some(12));
    }
}
