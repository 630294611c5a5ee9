//! Result output formatting.

use crate::config::BridgeConfig;
use crate::orchestrator::RunReport;
use crate::OutputFormat;
use anyhow::Result;
use lib_llm_ffi::loader::SymbolStatus;
use lib_llm_ffi::LibraryFormat;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Snake-case name of a serializable enum value.
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => String::from("unknown"),
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Print a generation report to stdout.
///
/// `include_text` is false when the text was already streamed.
pub fn print_report(report: &RunReport, format: OutputFormat, include_text: bool) -> Result<()> {
    let stdout = std::io::stdout();
    let mut f = stdout.lock();
    write_report(&mut f, report, format, include_text)
}

fn write_report(
    f: &mut dyn Write,
    report: &RunReport,
    format: OutputFormat,
    include_text: bool,
) -> Result<()> {
    match format {
        OutputFormat::Text => {
            if include_text {
                writeln!(f, "{}", report.text)?;
                writeln!(f)?;
            }
            writeln!(f, "Generation Summary")?;
            writeln!(f, "==================")?;
            writeln!(f, "Backend:        {}", report.backend)?;
            writeln!(
                f,
                "Capabilities:   stop={} reset={}",
                yes_no(report.supports_stop),
                yes_no(report.supports_reset)
            )?;
            writeln!(f, "Model:          {}", report.model)?;
            if let Some(vocab) = report.vocab_size {
                writeln!(f, "Vocabulary:     {}", vocab)?;
            }
            writeln!(f, "Prompt tokens:  {}", report.prompt_tokens)?;
            writeln!(f, "Output tokens:  {}", report.completion_tokens)?;
            writeln!(f, "Finish reason:  {}", label(&report.finish_reason))?;
            if report.timed_out {
                writeln!(f, "Timed out:      yes")?;
            }
            writeln!(f, "Elapsed:        {} ms", report.elapsed_ms)?;
            writeln!(f, "Throughput:     {:.2} tok/s", report.tokens_per_second)?;
        }
        OutputFormat::Json => {
            writeln!(f, "{}", serde_json::to_string_pretty(report)?)?;
        }
        OutputFormat::Csv => {
            writeln!(f, "metric,value")?;
            writeln!(f, "backend,{}", csv_field(&report.backend))?;
            writeln!(f, "supports_stop,{}", report.supports_stop)?;
            writeln!(f, "supports_reset,{}", report.supports_reset)?;
            writeln!(f, "model,{}", csv_field(&report.model))?;
            if let Some(vocab) = report.vocab_size {
                writeln!(f, "vocab_size,{}", vocab)?;
            }
            writeln!(f, "prompt_tokens,{}", report.prompt_tokens)?;
            writeln!(f, "completion_tokens,{}", report.completion_tokens)?;
            writeln!(f, "finish_reason,{}", label(&report.finish_reason))?;
            writeln!(f, "timed_out,{}", report.timed_out)?;
            writeln!(f, "elapsed_ms,{}", report.elapsed_ms)?;
            writeln!(f, "tokens_per_second,{:.4}", report.tokens_per_second)?;
            writeln!(f, "busy_rejections,{}", report.stats.busy_rejections)?;
            writeln!(f, "text,{}", csv_field(&report.text))?;
        }
    }
    Ok(())
}

/// Print the symbol table of a runtime library.
pub fn print_symbols(
    library: &Path,
    kind: LibraryFormat,
    symbols: &[SymbolStatus],
    format: OutputFormat,
) -> Result<()> {
    let required = lib_llm_ffi::loader::REQUIRED_SYMBOLS.len();
    let stdout = std::io::stdout();
    let mut f = stdout.lock();

    match format {
        OutputFormat::Text => {
            writeln!(f, "Runtime Library: {}", library.display())?;
            writeln!(f, "Format: {:?}", kind)?;
            writeln!(f, "\nRequired Symbols:")?;
            for s in &symbols[..required.min(symbols.len())] {
                writeln!(f, "  {:<28} {}", s.name, if s.found { "ok" } else { "MISSING" })?;
            }
            writeln!(f, "\nOptional Symbols:")?;
            for s in symbols.iter().skip(required) {
                writeln!(f, "  {:<28} {}", s.name, if s.found { "ok" } else { "absent" })?;
            }
        }
        OutputFormat::Json => {
            let entries: Vec<_> = symbols
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    serde_json::json!({
                        "name": s.name,
                        "found": s.found,
                        "required": i < required,
                    })
                })
                .collect();
            let json = serde_json::json!({
                "library": library.display().to_string(),
                "format": format!("{:?}", kind),
                "symbols": entries,
            });
            writeln!(f, "{}", serde_json::to_string_pretty(&json)?)?;
        }
        OutputFormat::Csv => {
            writeln!(f, "symbol,required,found")?;
            for (i, s) in symbols.iter().enumerate() {
                writeln!(f, "{},{},{}", s.name, i < required, s.found)?;
            }
        }
    }
    Ok(())
}

/// Print the effective configuration after validation.
pub fn print_config_summary(config: &BridgeConfig, format: OutputFormat) -> Result<()> {
    let stdout = std::io::stdout();
    let mut f = stdout.lock();

    match format {
        OutputFormat::Text => {
            writeln!(f, "Configuration OK")?;
            match &config.library {
                Some(library) => writeln!(f, "  Library:        {}", library.display())?,
                None => writeln!(f, "  Library:        (not set)")?,
            }
            writeln!(f, "  Model:          {}", config.model.path.display())?;
            writeln!(f, "  GPU offload:    {:?}", config.model.gpu_offload)?;
            writeln!(f, "  Context length: {}", config.context.context_length)?;
            writeln!(f, "  Batch size:     {}", config.context.batch_size)?;
            writeln!(f, "  Temperature:    {}", config.context.sampling.temperature)?;
            writeln!(f, "  Max tokens:     {}", config.generation.max_tokens)?;
            if let Some(timeout) = config.timeout_ms {
                writeln!(f, "  Timeout:        {} ms", timeout)?;
            }
        }
        OutputFormat::Json => {
            writeln!(f, "{}", serde_json::to_string_pretty(config)?)?;
        }
        OutputFormat::Csv => {
            writeln!(f, "key,value")?;
            if let Some(library) = &config.library {
                writeln!(f, "library,{}", csv_field(&library.display().to_string()))?;
            }
            writeln!(f, "model,{}", csv_field(&config.model.path.display().to_string()))?;
            writeln!(f, "context_length,{}", config.context.context_length)?;
            writeln!(f, "batch_size,{}", config.context.batch_size)?;
            writeln!(f, "temperature,{}", config.context.sampling.temperature)?;
            writeln!(f, "max_tokens,{}", config.generation.max_tokens)?;
            if let Some(timeout) = config.timeout_ms {
                writeln!(f, "timeout_ms,{}", timeout)?;
            }
        }
    }
    Ok(())
}

#[cfg(feature = "mock")]
pub fn print_selftest(results: &[crate::selftest::CheckResult], format: OutputFormat) -> Result<()> {
    let stdout = std::io::stdout();
    let mut f = stdout.lock();

    match format {
        OutputFormat::Text => {
            writeln!(f, "Self-test")?;
            writeln!(f, "=========")?;
            for r in results {
                let mark = if r.passed { "PASS" } else { "FAIL" };
                writeln!(f, "[{}] {:<32} {}", mark, r.name, r.detail)?;
            }
        }
        OutputFormat::Json => {
            writeln!(f, "{}", serde_json::to_string_pretty(results)?)?;
        }
        OutputFormat::Csv => {
            writeln!(f, "check,passed,detail")?;
            for r in results {
                writeln!(f, "{},{},{}", r.name, r.passed, csv_field(&r.detail))?;
            }
        }
    }
    Ok(())
}
