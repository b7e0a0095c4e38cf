//! # pipeliner - software pipelining for structured SSA loops
//!
//! Rewrites counted loops so that successive iterations overlap:
//! - Kernel extraction (outlining loop bodies into standalone functions)
//! - Legalization against a target machine model
//! - Iterative modulo scheduling with generated prologue, steady state and epilogue
//! - Kernel-tail extraction for the residual loop
//! - Loop-shape conversion to guarded do-while loops with run-time dispatch
//!
//! ## Architecture
//!
//! ```text
//! IR text → Frontend → IR → Extract → Legalize → Schedule → Tail → Legalize → Reshape → IR text
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use pipeliner::prelude::*;
//!
//! let source = std::fs::read_to_string("dot.ir")?;
//! let (module, report) = pipeliner::run_pipeline(&source, PipelineConfig::default())?;
//! println!("{}", report);
//! println!("{}", print_module(&module));
//! ```

#![warn(clippy::all)]

pub mod frontend;
pub mod ir;
pub mod analysis;
pub mod transform;
pub mod target;
pub mod utils;

// Re-export commonly used types
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::frontend::parse;
    pub use crate::ir::{
        print_module, verify_module, Builder, Func, FuncRole, Interpreter, LoopRole, Module,
        OpKind, PipelineInfo, RtValue, Type,
    };
    pub use crate::analysis::{CountedLoop, DependenceGraph, ScheduleBounds};
    pub use crate::transform::{
        KernelExtractor, Legalizer, LoopShapeConverter, ModuloScheduler, OptLevel, PassKind,
        Pipeline, PipelineConfig, PipelineReport, Transform,
    };
    pub use crate::target::{ResourceClass, TargetConfig};
    pub use crate::utils::errors::*;
}

use anyhow::{Context, Result};
use ir::Module;
use transform::{Pipeline, PipelineConfig, PipelineReport};

/// Parse and verify IR text.
pub fn parse(source: &str) -> Result<Module> {
    let module = frontend::parse(source).context("failed to parse input")?;
    ir::verify_module(&module).context("input does not verify")?;
    Ok(module)
}

/// Parse IR text and run the configured passes over it.
pub fn run_pipeline(source: &str, config: PipelineConfig) -> Result<(Module, PipelineReport)> {
    config.target.validate().context("invalid target configuration")?;
    let mut module = parse(source)?;
    let report = Pipeline::new(config)
        .optimize(&mut module)
        .context("pipeline failed")?;
    Ok((module, report))
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
