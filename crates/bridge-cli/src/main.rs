//! llm-bridge CLI: run text generation through a native inference runtime.
//!
//! This is the main entry point for the bridge tool.

mod config;
mod orchestrator;
mod output;
#[cfg(feature = "mock")]
mod selftest;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "llm-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
    Csv,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate text from a prompt
    Generate {
        /// Path to the bridge configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Prompt text (read from stdin when omitted)
        prompt: Option<String>,

        /// Read the prompt from a file
        #[arg(long, conflicts_with = "prompt")]
        prompt_file: Option<PathBuf>,

        /// Print tokens as they are produced
        #[arg(long)]
        stream: bool,

        /// Runtime library, overriding the config file
        #[arg(long)]
        library: Option<PathBuf>,

        /// Model file, overriding the config file
        #[arg(long)]
        model: Option<PathBuf>,

        /// Maximum number of tokens to generate
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Sampling temperature (0 is greedy)
        #[arg(long)]
        temperature: Option<f32>,

        /// Sampling seed
        #[arg(long)]
        seed: Option<u32>,

        /// Context window size in tokens
        #[arg(long)]
        context_length: Option<usize>,

        /// Cancel generation after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Use the in-process scripted runtime instead of a shared library
        #[cfg(feature = "mock")]
        #[arg(long)]
        mock: bool,
    },

    /// List the C API symbols a runtime library exports
    Inspect {
        /// Path to the shared library
        library: PathBuf,
    },

    /// Parse and validate a configuration file
    CheckConfig {
        /// Path to the configuration file
        config: PathBuf,
    },

    /// Exercise the bridge against the scripted runtime
    #[cfg(feature = "mock")]
    Selftest,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match cli.command {
        Commands::Generate {
            config,
            prompt,
            prompt_file,
            stream,
            library,
            model,
            max_tokens,
            temperature,
            seed,
            context_length,
            timeout_ms,
            #[cfg(feature = "mock")]
            mock,
        } => {
            #[cfg(not(feature = "mock"))]
            let mock = false;
            let overrides = config::Overrides {
                library,
                model,
                max_tokens,
                temperature,
                seed,
                context_length,
                timeout_ms,
            };
            let prompt = read_prompt(prompt, prompt_file)?;
            run_generate(&config, &overrides, &prompt, stream, mock, cli.format)?;
        }
        Commands::Inspect { library } => {
            inspect_library(&library, cli.format)?;
        }
        Commands::CheckConfig { config } => {
            check_config(&config, cli.format)?;
        }
        #[cfg(feature = "mock")]
        Commands::Selftest => {
            run_selftest(cli.format)?;
        }
    }

    Ok(())
}

fn read_prompt(prompt: Option<String>, prompt_file: Option<PathBuf>) -> Result<String> {
    if let Some(prompt) = prompt {
        return Ok(prompt);
    }
    if let Some(path) = prompt_file {
        return std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read prompt file: {:?}", path));
    }
    let mut prompt = String::new();
    std::io::stdin()
        .read_to_string(&mut prompt)
        .context("Failed to read prompt from stdin")?;
    Ok(prompt)
}

fn run_generate(
    config_path: &PathBuf,
    overrides: &config::Overrides,
    prompt: &str,
    stream: bool,
    mock: bool,
    format: OutputFormat,
) -> Result<()> {
    tracing::info!("Loading configuration from {:?}", config_path);

    let mut config = config::load_config(config_path)?;
    overrides.apply(&mut config);
    config::validate_config(&config, !mock)?;

    let orchestrator = if mock {
        mock_orchestrator(config)?
    } else {
        orchestrator::Orchestrator::from_config(config)?
    };

    let mode = if stream {
        orchestrator::RunMode::Stream
    } else {
        orchestrator::RunMode::Complete
    };

    // Streamed text goes straight to stdout; the report follows it.
    let live = stream && matches!(format, OutputFormat::Text);
    let mut stdout = std::io::stdout();
    let mut sink = |piece: &str| -> std::io::Result<()> {
        if live {
            stdout.write_all(piece.as_bytes())?;
            stdout.flush()?;
        }
        Ok(())
    };

    tracing::info!("Starting generation...");
    let report = orchestrator.run(prompt, mode, &mut sink)?;
    if live {
        println!();
    }

    output::print_report(&report, format, !live)?;
    Ok(())
}

#[cfg(feature = "mock")]
fn mock_orchestrator(config: config::BridgeConfig) -> Result<orchestrator::Orchestrator> {
    use lib_llm_ffi::mock::MockBackend;
    use std::sync::Arc;

    let runtime = lib_llm_ffi::Runtime::new(Arc::new(MockBackend::new()));
    Ok(orchestrator::Orchestrator::new(runtime, config))
}

#[cfg(not(feature = "mock"))]
fn mock_orchestrator(_config: config::BridgeConfig) -> Result<orchestrator::Orchestrator> {
    anyhow::bail!("Built without the scripted runtime")
}

fn inspect_library(library: &PathBuf, format: OutputFormat) -> Result<()> {
    tracing::info!("Inspecting runtime library: {:?}", library);

    let symbols = lib_llm_ffi::loader::probe(library)
        .with_context(|| format!("Failed to open runtime library {:?}", library))?;
    let format_kind = lib_llm_ffi::LibraryFormat::from_path(library);

    output::print_symbols(library, format_kind, &symbols, format)?;

    let missing = symbols
        .iter()
        .take(lib_llm_ffi::loader::REQUIRED_SYMBOLS.len())
        .filter(|s| !s.found)
        .count();
    if missing > 0 {
        anyhow::bail!("{} required symbol(s) missing", missing);
    }
    Ok(())
}

fn check_config(config_path: &PathBuf, format: OutputFormat) -> Result<()> {
    tracing::info!("Checking configuration {:?}", config_path);

    let config = config::load_config(config_path)?;
    config::validate_config(&config, false)?;
    output::print_config_summary(&config, format)?;
    Ok(())
}

#[cfg(feature = "mock")]
fn run_selftest(format: OutputFormat) -> Result<()> {
    let results = selftest::run_all()?;
    output::print_selftest(&results, format)?;

    let failed = results.iter().filter(|r| !r.passed).count();
    if failed > 0 {
        anyhow::bail!("{} of {} self-test checks failed", failed, results.len());
    }
    Ok(())
}
