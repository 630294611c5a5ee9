//! Error types for bridge operations.

use lib_types::ConfigError;
use thiserror::Error;

/// Errors surfaced to the host application.
///
/// The host never sees raw native pointers. Raw native status codes only
/// appear inside [`BridgeError::InternalFailure`] and
/// [`BridgeError::ResourceExhausted`], for diagnostics.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Failed to load the shared library.
    #[error("Failed to load library '{path}': {source}")]
    LoadError {
        path: String,
        #[source]
        source: libloading::Error,
    },

    /// Required symbol not found in library.
    #[error("Symbol '{symbol}' not found in library")]
    SymbolNotFound { symbol: String },

    /// Bad configuration or a value that cannot be represented in the C ABI.
    #[error("Invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    /// The native runtime could not allocate what was asked of it.
    #[error("Resource exhausted during {operation}{}", describe(.code, .message))]
    ResourceExhausted {
        operation: &'static str,
        code: Option<i32>,
        message: Option<String>,
    },

    /// Another call is already executing against this context.
    #[error("Session busy: another call is in flight on this context")]
    Busy,

    /// A released handle was used again.
    #[error("Use after release: {resource} has already been released")]
    UseAfterRelease { resource: &'static str },

    /// Cooperative cancellation completed.
    #[error("Generation cancelled")]
    Cancelled,

    /// Unexpected native status, raw code preserved.
    #[error("Native failure during {operation}{}", describe_code(.code, .message))]
    InternalFailure {
        operation: &'static str,
        code: i32,
        message: Option<String>,
    },

    /// The native backend has not been initialized.
    #[error("Native runtime not initialized; call Runtime::init first")]
    NotInitialized,

    /// The session hit an unrecoverable native error earlier.
    #[error("Session faulted by an earlier native failure; only close is permitted")]
    Faulted,

    /// Optional capability not exported by the loaded library.
    #[error("Operation '{operation}' not supported by the native library")]
    NotSupported { operation: &'static str },
}

fn describe(code: &Option<i32>, message: &Option<String>) -> String {
    match (code, message) {
        (Some(code), Some(msg)) => format!(" (code {code}): {msg}"),
        (Some(code), None) => format!(" (code {code})"),
        (None, Some(msg)) => format!(": {msg}"),
        (None, None) => String::new(),
    }
}

fn describe_code(code: &i32, message: &Option<String>) -> String {
    describe(&Some(*code), message)
}

impl BridgeError {
    /// Create a load error.
    pub fn load_error(path: impl Into<String>, source: libloading::Error) -> Self {
        Self::LoadError {
            path: path.into(),
            source,
        }
    }

    /// Create a symbol not found error.
    pub fn symbol_not_found(symbol: impl Into<String>) -> Self {
        Self::SymbolNotFound {
            symbol: symbol.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal failure carrying the raw native code.
    pub fn internal(operation: &'static str, code: i32, message: Option<String>) -> Self {
        Self::InternalFailure {
            operation,
            code,
            message,
        }
    }

    /// Create a use-after-release error.
    ///
    /// This is a host-side contract violation, so it is logged at error level
    /// where it is detected.
    pub fn use_after_release(resource: &'static str) -> Self {
        tracing::error!(resource, "Use of a released native handle");
        Self::UseAfterRelease { resource }
    }

    /// Check if the caller may retry after waiting or freeing resources.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Busy | Self::ResourceExhausted { .. } | Self::Cancelled
        )
    }

    /// Check if this error signals a bridge-usage bug or a dead session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UseAfterRelease { .. } | Self::Faulted)
    }

    /// Raw native code, if the error carries one.
    pub fn native_code(&self) -> Option<i32> {
        match self {
            Self::InternalFailure { code, .. } => Some(*code),
            Self::ResourceExhausted { code, .. } => *code,
            _ => None,
        }
    }
}

impl From<ConfigError> for BridgeError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::ModelNotFound(path) | ConfigError::NotAFile(path) => {
                Self::invalid_argument("path", err_reason(&path))
            }
            ConfigError::OutOfRange { field, reason } => Self::invalid_argument(field, reason),
        }
    }
}

fn err_reason(path: &std::path::Path) -> String {
    format!("no model file at {}", path.display())
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;
