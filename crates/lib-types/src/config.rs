//! Model, context and generation configuration.
//!
//! All structs deserialize from TOML/JSON with sensible defaults so that a
//! configuration file only needs to name the model path.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error produced when a configuration value is out of range.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Model file not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("Model path is not a file: {0}")]
    NotAFile(PathBuf),

    #[error("Invalid value for '{field}': {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

impl ConfigError {
    fn out_of_range(field: &'static str, reason: impl Into<String>) -> Self {
        Self::OutOfRange {
            field,
            reason: reason.into(),
        }
    }
}

/// GPU offload selection for model weights.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuOffload {
    /// Keep all layers on the CPU.
    #[default]
    None,
    /// Offload every layer the runtime can place on the GPU.
    All,
    /// Offload the given number of layers.
    Layers(u32),
}

/// Configuration for loading model weights.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path to the model file (e.g. a `.gguf`).
    pub path: PathBuf,

    /// GPU offload policy.
    #[serde(default)]
    pub gpu_offload: GpuOffload,

    /// Memory-map the weights instead of reading them.
    #[serde(default = "default_true")]
    pub use_mmap: bool,

    /// Lock the weights in memory (prevents swapping).
    #[serde(default)]
    pub use_mlock: bool,

    /// Load the vocabulary only, skipping weights.
    #[serde(default)]
    pub vocab_only: bool,
}

impl ModelConfig {
    /// Create a config for the given model path with default options.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            gpu_offload: GpuOffload::default(),
            use_mmap: true,
            use_mlock: false,
            vocab_only: false,
        }
    }

    /// Set the GPU offload policy.
    pub fn with_gpu_offload(mut self, offload: GpuOffload) -> Self {
        self.gpu_offload = offload;
        self
    }

    /// Check that the model path points to an existing file.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.path.exists() {
            return Err(ConfigError::ModelNotFound(self.path.clone()));
        }
        if !self.path.is_file() {
            return Err(ConfigError::NotAFile(self.path.clone()));
        }
        Ok(())
    }
}

/// Sampling parameters applied by the native runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Softmax temperature; 0 selects greedy decoding.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Keep only the top-k candidates (0 disables the filter).
    #[serde(default = "default_top_k")]
    pub top_k: u32,

    /// Nucleus sampling threshold in (0, 1].
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Penalty for repeated tokens (1.0 disables it).
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    /// RNG seed; `None` lets the runtime pick one.
    #[serde(default)]
    pub seed: Option<u32>,
}

fn default_temperature() -> f32 { 0.8 }
fn default_top_k() -> u32 { 40 }
fn default_top_p() -> f32 { 0.95 }
fn default_repeat_penalty() -> f32 { 1.1 }

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            repeat_penalty: default_repeat_penalty(),
            seed: None,
        }
    }
}

impl SamplingParams {
    /// Greedy decoding (deterministic).
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(ConfigError::out_of_range(
                "temperature",
                format!("must be a finite value >= 0, got {}", self.temperature),
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(ConfigError::out_of_range(
                "top_p",
                format!("must be in (0, 1], got {}", self.top_p),
            ));
        }
        if !self.repeat_penalty.is_finite() || self.repeat_penalty <= 0.0 {
            return Err(ConfigError::out_of_range(
                "repeat_penalty",
                format!("must be a finite value > 0, got {}", self.repeat_penalty),
            ));
        }
        Ok(())
    }
}

/// Parameters for one execution context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextParams {
    /// Context window in tokens.
    #[serde(default = "default_context_length")]
    pub context_length: usize,

    /// Maximum tokens submitted per decode call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Worker threads used by the runtime (0 = runtime default).
    #[serde(default)]
    pub threads: usize,

    /// Sampling configuration.
    #[serde(default)]
    pub sampling: SamplingParams,
}

fn default_context_length() -> usize { 4096 }
fn default_batch_size() -> usize { 512 }

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            context_length: default_context_length(),
            batch_size: default_batch_size(),
            threads: 0,
            sampling: SamplingParams::default(),
        }
    }
}

impl ContextParams {
    /// Range checks that do not depend on the C representation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.context_length == 0 {
            return Err(ConfigError::out_of_range("context_length", "must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::out_of_range("batch_size", "must be > 0"));
        }
        if self.batch_size > self.context_length {
            return Err(ConfigError::out_of_range(
                "batch_size",
                format!(
                    "must not exceed context_length ({} > {})",
                    self.batch_size, self.context_length
                ),
            ));
        }
        self.sampling.validate()
    }
}

/// Per-request generation options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Upper bound on generated tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Prepend the runtime's special tokens (BOS) when tokenizing text.
    #[serde(default = "default_true")]
    pub add_special: bool,

    /// Capacity of the channel between the stream worker and the consumer.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

fn default_max_tokens() -> usize { 256 }
fn default_stream_buffer() -> usize { 16 }
fn default_true() -> bool { true }

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            add_special: true,
            stream_buffer: default_stream_buffer(),
        }
    }
}

impl GenerateOptions {
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_defaults_from_empty_toml() {
        let params: ContextParams = toml::from_str("").unwrap();
        assert_eq!(params, ContextParams::default());
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_model_config_minimal_json() {
        let cfg: ModelConfig = serde_json::from_str(r#"{"path": "m.gguf"}"#).unwrap();
        assert_eq!(cfg.path, PathBuf::from("m.gguf"));
        assert!(cfg.use_mmap);
        assert_eq!(cfg.gpu_offload, GpuOffload::None);
    }

    #[test]
    fn test_gpu_offload_layers_toml() {
        let cfg: ModelConfig = toml::from_str(
            r#"
            path = "m.gguf"
            gpu_offload = { layers = 20 }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.gpu_offload, GpuOffload::Layers(20));
    }

    #[test]
    fn test_missing_model_path() {
        let cfg = ModelConfig::new("/definitely/not/here.gguf");
        assert!(matches!(cfg.validate(), Err(ConfigError::ModelNotFound(_))));
    }

    #[test]
    fn test_batch_larger_than_context_rejected() {
        let params = ContextParams {
            context_length: 128,
            batch_size: 256,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(ConfigError::OutOfRange { field: "batch_size", .. })
        ));
    }

    #[test]
    fn test_sampling_validation() {
        assert!(SamplingParams::greedy().validate().is_ok());

        let bad = SamplingParams {
            top_p: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let nan = SamplingParams {
            temperature: f32::NAN,
            ..Default::default()
        };
        assert!(nan.validate().is_err());
    }
}
