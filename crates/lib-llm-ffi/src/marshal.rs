//! Conversion of host values to and from their C ABI shapes.
//!
//! Rules enforced here:
//! - integers are width and sign checked; narrowing never truncates silently
//! - text crosses as (pointer, byte length), never relying on a terminator,
//!   except file paths which the C API takes null-terminated
//! - buffers handed to the runtime are owned by a value that outlives the call
//! - native-owned memory is copied before the pointer leaves this module

use crate::backend::{RawContextParams, RawModelParams, DEFAULT_SEED};
use crate::error::{BridgeError, BridgeResult};
use lib_types::{ContextParams, GpuOffload, ModelConfig, TokenId};
use std::ffi::{c_char, c_int, CStr, CString};
use std::fmt::Display;
use std::path::Path;

/// Narrow an integer to a C `int`, failing instead of truncating.
pub fn to_c_int<T>(value: T, name: &str) -> BridgeResult<c_int>
where
    T: TryInto<c_int> + Copy + Display,
{
    value.try_into().map_err(|_| {
        BridgeError::invalid_argument(name, format!("{value} does not fit in a 32-bit C int"))
    })
}

/// Narrow an integer to a C `uint32_t`.
pub fn to_c_u32<T>(value: T, name: &str) -> BridgeResult<u32>
where
    T: TryInto<u32> + Copy + Display,
{
    value.try_into().map_err(|_| {
        BridgeError::invalid_argument(name, format!("{value} does not fit in a 32-bit C uint"))
    })
}

/// Host token id to its C representation.
pub fn token_to_c(token: TokenId) -> BridgeResult<i32> {
    to_c_int(token.get(), "token")
}

/// C token id back to the host type. Negative ids are a runtime fault.
pub fn token_from_c(raw: i32, operation: &'static str) -> BridgeResult<TokenId> {
    u32::try_from(raw)
        .map(TokenId)
        .map_err(|_| BridgeError::internal(operation, raw, Some("negative token id".to_string())))
}

/// Convert a filesystem path to the null-terminated form the runtime expects.
pub fn path_to_cstring(path: &Path) -> BridgeResult<CString> {
    #[cfg(unix)]
    let bytes = {
        use std::os::unix::ffi::OsStrExt;
        path.as_os_str().as_bytes().to_vec()
    };
    #[cfg(not(unix))]
    let bytes = path
        .to_str()
        .ok_or_else(|| BridgeError::invalid_argument("path", "path is not valid UTF-8"))?
        .as_bytes()
        .to_vec();

    CString::new(bytes)
        .map_err(|_| BridgeError::invalid_argument("path", "path contains an interior NUL byte"))
}

/// Borrowed text argument passed as (pointer, length).
#[derive(Clone, Copy, Debug)]
pub struct TextArg<'a> {
    bytes: &'a [u8],
    len: c_int,
}

impl<'a> TextArg<'a> {
    pub fn new(text: &'a str) -> BridgeResult<Self> {
        let len = to_c_int(text.len(), "text length")?;
        Ok(Self {
            bytes: text.as_bytes(),
            len,
        })
    }

    pub fn as_ptr(&self) -> *const c_char {
        self.bytes.as_ptr().cast()
    }

    pub fn len(&self) -> c_int {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Owned token buffer in C layout, alive for as long as the value is.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenArg {
    buf: Vec<i32>,
}

impl TokenArg {
    pub fn new(tokens: &[TokenId]) -> BridgeResult<Self> {
        to_c_int(tokens.len(), "token count")?;
        let buf = tokens
            .iter()
            .map(|&t| token_to_c(t))
            .collect::<BridgeResult<Vec<_>>>()?;
        Ok(Self { buf })
    }

    /// Wrap ids that came from the runtime and are already in C form.
    pub fn from_raw(buf: Vec<i32>) -> Self {
        Self { buf }
    }

    pub fn as_ptr(&self) -> *const i32 {
        self.buf.as_ptr()
    }

    /// Element count; construction guarantees it fits in a C int.
    pub fn len(&self) -> c_int {
        self.buf.len() as c_int
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Split into chunks of at most `size` tokens, for batched decode.
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = &[i32]> {
        self.buf.chunks(size.max(1))
    }

    pub fn to_host(&self, operation: &'static str) -> BridgeResult<Vec<TokenId>> {
        self.buf.iter().map(|&t| token_from_c(t, operation)).collect()
    }
}

/// Run a native buffer-filling call, growing the buffer once if the runtime
/// reports (as a negative count) that it needs more room.
///
/// The buffer is owned here for the whole call; only the copied prefix
/// leaves this function.
pub fn read_growable<T, F>(initial: usize, operation: &'static str, mut fill: F) -> BridgeResult<Vec<T>>
where
    T: Copy + Default,
    F: FnMut(*mut T, c_int) -> c_int,
{
    let mut buf = vec![T::default(); initial.max(1)];
    for attempt in 0..2 {
        let capacity = to_c_int(buf.len(), "buffer capacity")?;
        let n = fill(buf.as_mut_ptr(), capacity);
        if n >= 0 {
            let written = n as usize;
            if written > buf.len() {
                return Err(BridgeError::internal(
                    operation,
                    n,
                    Some(format!("runtime reported {written} elements for a buffer of {}", buf.len())),
                ));
            }
            buf.truncate(written);
            return Ok(buf);
        }

        let required = n
            .checked_neg()
            .map(|r| r as usize)
            .ok_or_else(|| BridgeError::internal(operation, n, Some("size overflow".to_string())))?;
        if attempt > 0 || required <= buf.len() {
            return Err(BridgeError::internal(
                operation,
                n,
                Some(format!("inconsistent size request of {required}")),
            ));
        }
        tracing::trace!(operation, required, "Growing native output buffer");
        buf.resize(required, T::default());
    }
    unreachable!("read_growable returns within two attempts")
}

/// Copy a null-terminated native string into host memory.
///
/// # Safety
/// `ptr` must be null or point to a valid null-terminated C string that is
/// not freed for the duration of this call.
pub unsafe fn read_c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: Caller guarantees ptr is valid if not null
    unsafe { Some(CStr::from_ptr(ptr).to_string_lossy().into_owned()) }
}

/// Build the C model parameter block.
pub fn model_params(config: &ModelConfig) -> BridgeResult<RawModelParams> {
    let n_gpu_layers = match config.gpu_offload {
        GpuOffload::None => 0,
        GpuOffload::All => -1,
        GpuOffload::Layers(n) => to_c_int(n, "gpu_offload.layers")?,
    };
    Ok(RawModelParams {
        n_gpu_layers,
        use_mmap: config.use_mmap,
        use_mlock: config.use_mlock,
        vocab_only: config.vocab_only,
    })
}

/// Build the C context parameter block.
pub fn context_params(params: &ContextParams) -> BridgeResult<RawContextParams> {
    params.validate()?;
    let sampling = &params.sampling;
    Ok(RawContextParams {
        n_ctx: to_c_u32(params.context_length, "context_length")?,
        n_batch: to_c_u32(params.batch_size, "batch_size")?,
        n_threads: to_c_int(params.threads, "threads")?,
        seed: match sampling.seed {
            Some(DEFAULT_SEED) => {
                return Err(BridgeError::invalid_argument(
                    "seed",
                    format!("{DEFAULT_SEED} is reserved for runtime-chosen seeds"),
                ))
            }
            Some(seed) => seed,
            None => DEFAULT_SEED,
        },
        temperature: sampling.temperature,
        top_k: to_c_int(sampling.top_k, "top_k")?,
        top_p: sampling.top_p,
        repeat_penalty: sampling.repeat_penalty,
    })
}

/// Reassembles UTF-8 text from token pieces that may split characters.
#[derive(Debug, Default)]
pub struct Utf8Assembler {
    pending: Vec<u8>,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every complete character now available.
    ///
    /// Invalid sequences become U+FFFD; an incomplete trailing sequence is
    /// held until more bytes arrive.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Flush whatever is left, replacing an incomplete tail.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}
