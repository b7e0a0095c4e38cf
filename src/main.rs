//! pipeliner command line interface
//!
//! Usage:
//!   pipeliner [OPTIONS] <input-file>
//!   pipeliner --help
//!
//! Examples:
//!   pipeliner dot.ir                               # Pipeline with defaults (-O3)
//!   pipeliner -O1 dot.ir                           # Extract and legalize only
//!   pipeliner --pass extract --pass legalize dot.ir
//!   pipeliner --unit mem=2 --latency load=5 dot.ir # Override the machine model
//!   pipeliner --emit report dot.ir                 # Print the schedules found
//!   pipeliner --run dot --arg '[1,2,3]' --arg '[4,5,6]' --arg 3 dot.ir

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::{debug, error, info, warn};
use pipeliner::ir::{print_module, Interpreter, Module, RtValue};
use pipeliner::target::{ResourceClass, TargetConfig};
use pipeliner::transform::{OptLevel, PassKind, PipelineConfig, PipelineReport};
use pipeliner::utils::errors::PipelinerError;
use pipeliner::utils::location::{SourceMap, Span};
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;

/// pipeliner - modulo-scheduling software pipeliner
#[derive(Parser, Debug)]
#[command(name = "pipeliner")]
#[command(version)]
#[command(about = "Software pipelining of counted loops in structured SSA IR", long_about = None)]
struct Cli {
    /// Input IR file
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Output file (defaults to stdout)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Optimization level (0-3)
    #[arg(short = 'O', long, default_value = "3", value_parser = clap::value_parser!(u8).range(0..=3))]
    opt_level: u8,

    /// Run exactly these passes, in order (overrides -O)
    #[arg(long = "pass", value_name = "PASS")]
    passes: Vec<PassKind>,

    /// Target description (JSON); flags below override it
    #[arg(long, value_name = "FILE")]
    target_config: Option<PathBuf>,

    /// Native vector register width in bits
    #[arg(long, value_name = "BITS")]
    vector_bits: Option<u32>,

    /// Functional units per class, e.g. `mem=2`
    #[arg(long = "unit", value_name = "CLASS=N", value_parser = parse_assignment)]
    units: Vec<(String, u32)>,

    /// Latency per op mnemonic, e.g. `fma=4`
    #[arg(long = "latency", value_name = "OP=N", value_parser = parse_assignment)]
    latencies: Vec<(String, u32)>,

    /// Extra II values tried above the lower bound
    #[arg(long, value_name = "K")]
    max_ii_offset: Option<u32>,

    /// Legalization passes allowed before giving up
    #[arg(long, value_name = "N")]
    max_legalize_iters: Option<u32>,

    /// What to emit
    #[arg(long, default_value = "ir")]
    emit: EmitKind,

    /// Execute a function of the transformed module
    #[arg(long, value_name = "FUNC")]
    run: Option<String>,

    /// Argument for --run: an integer, or a JSON array for a buffer
    #[arg(long = "arg", value_name = "JSON", requires = "run")]
    args: Vec<String>,

    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress warnings)
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EmitKind {
    /// Transformed IR text
    Ir,
    /// Pipeline report as JSON
    Json,
    /// Human-readable pipeline report
    Report,
}

fn parse_assignment(text: &str) -> Result<(String, u32), String> {
    let (key, value) = text
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=N, got '{}'", text))?;
    let value = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid count in '{}': {}", text, e))?;
    Ok((key.trim().to_string(), value))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.quiet {
        log::LevelFilter::Error
    } else {
        match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    info!("pipeliner v{}", pipeliner::VERSION);
    debug!("Input file: {:?}", cli.input);

    let source = fs::read_to_string(&cli.input)
        .with_context(|| format!("Failed to read input file: {:?}", cli.input))?;

    let config = build_config(&cli)?;
    debug!("Passes: {:?}", config.passes());

    let (module, report) = pipeliner::run_pipeline(&source, config).map_err(|e| {
        if let Some(snippet) = error_span(&e).and_then(|span| SourceMap::new(source.clone()).snippet(&span)) {
            error!("{}\n{}", e, snippet);
        }
        e
    })?;
    for failure in &report.failures {
        warn!("{}", failure);
    }

    let output = match cli.emit {
        EmitKind::Ir => print_module(&module),
        EmitKind::Report => report.to_string(),
        EmitKind::Json => serde_json::to_string_pretty(&report_json(&report))?,
    };
    write_output(&cli.output, &output)?;

    if let Some(ref name) = cli.run {
        let result = run_function(&module, name, &cli.args)?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    Ok(())
}

fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let level = OptLevel::from_level(cli.opt_level)
        .ok_or_else(|| anyhow!("invalid optimization level {}", cli.opt_level))?;

    let mut target = match cli.target_config {
        Some(ref path) => TargetConfig::load(path)
            .with_context(|| format!("Failed to load target description: {:?}", path))?,
        None => TargetConfig::default(),
    };
    if let Some(bits) = cli.vector_bits {
        target.native_vector_bits = bits;
    }
    for (class, units) in &cli.units {
        let class = ResourceClass::from_name(class)
            .ok_or_else(|| anyhow!("unknown resource class '{}'", class))?;
        target.set_capacity(class, *units);
    }
    for (op, latency) in &cli.latencies {
        target.set_latency(op, *latency);
    }
    if let Some(k) = cli.max_ii_offset {
        target.max_ii_offset = k;
    }
    if let Some(n) = cli.max_legalize_iters {
        target.max_legalize_iterations = n;
    }

    let mut config = PipelineConfig::new(level).with_target(target);
    if !cli.passes.is_empty() {
        config = config.with_passes(cli.passes.clone());
    }
    Ok(config)
}

/// Location of the first lexer or parser error in the chain.
fn error_span(err: &anyhow::Error) -> Option<Span> {
    err.chain().find_map(|cause| match cause.downcast_ref::<PipelinerError>()? {
        PipelinerError::Lexer(e) => Some(e.span),
        PipelinerError::Parse(e) => Some(e.span),
        _ => None,
    })
}

fn report_json(report: &PipelineReport) -> Value {
    let schedules: Vec<Value> = report
        .schedules
        .iter()
        .map(|(name, info)| json!({ "function": name, "schedule": info }))
        .collect();
    let failures: Vec<Value> = report
        .failures
        .iter()
        .map(|f| {
            json!({
                "kind": f.kind.to_string(),
                "transform": f.transform,
                "function": f.function,
                "message": f.message,
            })
        })
        .collect();
    json!({
        "applied": report.applied_transforms,
        "modified": report.modified,
        "schedules": schedules,
        "failures": failures,
    })
}

fn run_function(module: &Module, name: &str, args: &[String]) -> Result<Value> {
    let mut interp = Interpreter::new(module);
    let mut values = Vec::with_capacity(args.len());
    for text in args {
        let arg: Value = serde_json::from_str(text)
            .with_context(|| format!("Invalid argument: {}", text))?;
        values.push(match arg {
            Value::Number(n) => RtValue::Int(
                n.as_i64().ok_or_else(|| anyhow!("argument {} is not an integer", n))?,
            ),
            Value::Array(items) => {
                let data = items
                    .iter()
                    .map(|v| v.as_i64().ok_or_else(|| anyhow!("buffer element {} is not an integer", v)))
                    .collect::<Result<Vec<_>>>()?;
                interp.alloc(data)
            }
            other => bail!("unsupported argument {}", other),
        });
    }

    let results = interp
        .call(name, &values)
        .with_context(|| format!("Failed to run @{}", name))?;
    let buffers: Vec<Value> = values
        .iter()
        .filter_map(|v| interp.buffer(v))
        .map(|data| json!(data))
        .collect();
    Ok(json!({
        "results": results.iter().map(rt_json).collect::<Vec<_>>(),
        "buffers": buffers,
    }))
}

fn rt_json(value: &RtValue) -> Value {
    match value {
        RtValue::Int(v) => json!(v),
        RtValue::Vector(lanes) => json!(lanes),
        RtValue::Buffer(handle) => json!({ "buffer": handle }),
    }
}

fn write_output(path: &Option<PathBuf>, content: &str) -> Result<()> {
    match path {
        Some(p) => {
            fs::write(p, content)
                .with_context(|| format!("Failed to write output file: {:?}", p))?;
        }
        None => {
            println!("{}", content);
        }
    }
    Ok(())
}
