//! Bridge configuration loading and validation.

use anyhow::{Context, Result};
use lib_types::{ContextParams, GenerateOptions, ModelConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
///
/// ```toml
/// library = "/opt/llm/libllm_shim.so"
/// timeout_ms = 30000
///
/// [model]
/// path = "/models/tinyllama-q4.gguf"
/// gpu_offload = "all"
///
/// [context]
/// context_length = 2048
///
/// [context.sampling]
/// temperature = 0.2
///
/// [generation]
/// max_tokens = 128
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Runtime shared library exporting the `llm_*` C API.
    #[serde(default)]
    pub library: Option<PathBuf>,

    /// Model to load.
    pub model: ModelConfig,

    /// Execution context parameters.
    #[serde(default)]
    pub context: ContextParams,

    /// Generation options.
    #[serde(default)]
    pub generation: GenerateOptions,

    /// Cancel generation after this many milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl BridgeConfig {
    /// Minimal configuration for a model path, everything else defaulted.
    pub fn for_model(path: impl AsRef<Path>) -> Self {
        Self {
            library: None,
            model: ModelConfig::new(path),
            context: ContextParams::default(),
            generation: GenerateOptions::default(),
            timeout_ms: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Values given on the command line that take precedence over the file.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub library: Option<PathBuf>,
    pub model: Option<PathBuf>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub seed: Option<u32>,
    pub context_length: Option<usize>,
    pub timeout_ms: Option<u64>,
}

impl Overrides {
    pub fn apply(&self, config: &mut BridgeConfig) {
        if let Some(ref library) = self.library {
            config.library = Some(library.clone());
        }
        if let Some(ref model) = self.model {
            config.model.path = model.clone();
        }
        if let Some(max_tokens) = self.max_tokens {
            config.generation.max_tokens = max_tokens;
        }
        if let Some(temperature) = self.temperature {
            config.context.sampling.temperature = temperature;
        }
        if self.seed.is_some() {
            config.context.sampling.seed = self.seed;
        }
        if let Some(context_length) = self.context_length {
            config.context.context_length = context_length;
            config.context.batch_size = config.context.batch_size.min(context_length);
        }
        if self.timeout_ms.is_some() {
            config.timeout_ms = self.timeout_ms;
        }
    }
}

/// Load configuration from a file (JSON by extension, TOML otherwise).
///
/// Only parses; call [`validate_config`] once overrides are applied.
pub fn load_config(path: &Path) -> Result<BridgeConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: BridgeConfig = if path.extension().map_or(false, |e| e == "json") {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config as JSON: {:?}", path))?
    } else {
        toml::from_str(&content).with_context(|| "Failed to parse config as TOML")?
    };

    Ok(config)
}

/// Validate paths and ranges before anything touches the native library.
///
/// `require_library` is false when an in-process backend stands in for the
/// shared library.
pub fn validate_config(config: &BridgeConfig, require_library: bool) -> Result<()> {
    match &config.library {
        Some(library) if !library.is_file() => {
            anyhow::bail!("Runtime library not found: {:?}", library);
        }
        None if require_library => {
            anyhow::bail!("No runtime library configured (set 'library' or pass --library)");
        }
        _ => {}
    }

    config
        .model
        .validate()
        .with_context(|| "Invalid model configuration")?;
    config
        .context
        .validate()
        .with_context(|| "Invalid context configuration")?;

    if config.generation.max_tokens == 0 {
        anyhow::bail!("generation.max_tokens must be > 0");
    }
    if config.generation.stream_buffer == 0 {
        anyhow::bail!("generation.stream_buffer must be > 0");
    }
    if config.timeout_ms == Some(0) {
        anyhow::bail!("timeout_ms must be > 0 when set");
    }

    Ok(())
}
