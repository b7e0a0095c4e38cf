//! Pass pipeline for software pipelining.
//!
//! Functions are processed one at a time, in module order. Each function
//! starts from a snapshot of the module; when one of its passes fails the
//! snapshot is restored, so a function is either fully transformed or left
//! exactly as it was, and the failure is recorded in the report.

use crate::ir::function::Module;
use crate::ir::ops::{FuncRole, PipelineInfo};
use crate::ir::verify::verify_module;
use crate::target::TargetConfig;
use crate::transform::{
    KernelExtractor, Legalizer, LoopShapeConverter, ModuloScheduler, Transform,
};
use crate::utils::errors::{PipelinerError, PipelinerResult, TransformError};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Optimization level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptLevel {
    /// No transformation
    O0,
    /// Kernel extraction and legalization
    O1,
    /// O1 plus do-while loop shape, without pipelining
    O2,
    /// Full software pipelining
    O3,
}

impl OptLevel {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(OptLevel::O0),
            1 => Some(OptLevel::O1),
            2 => Some(OptLevel::O2),
            3 => Some(OptLevel::O3),
            _ => None,
        }
    }

    /// Passes run at this level, in order.
    pub fn passes(&self) -> Vec<PassKind> {
        use PassKind::*;
        match self {
            OptLevel::O0 => vec![],
            OptLevel::O1 => vec![Extract, Legalize],
            OptLevel::O2 => vec![Extract, Legalize, Reshape],
            OptLevel::O3 => vec![Extract, Legalize, Schedule, Tail, Legalize, Reshape],
        }
    }
}

/// One transformation of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    /// Outline the loop body into a kernel
    Extract,
    /// Legalize vector widths of kernels and tails
    Legalize,
    /// Modulo-schedule kernels
    Schedule,
    /// Outline residual tail bodies
    Tail,
    /// Convert loops to do-while form
    Reshape,
}

impl PassKind {
    pub const ALL: [PassKind; 5] = [
        PassKind::Extract,
        PassKind::Legalize,
        PassKind::Schedule,
        PassKind::Tail,
        PassKind::Reshape,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PassKind::Extract => "extract",
            PassKind::Legalize => "legalize",
            PassKind::Schedule => "schedule",
            PassKind::Tail => "tail",
            PassKind::Reshape => "reshape",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.name() == name)
    }
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PassKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| {
            let known: Vec<_> = Self::ALL.iter().map(|p| p.name()).collect();
            format!("unknown pass '{}' (expected one of {})", s, known.join(", "))
        })
    }
}

/// Optimization pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Optimization level
    pub opt_level: OptLevel,
    /// Machine model and search limits
    pub target: TargetConfig,
    /// Explicit pass list overriding the level's
    pub passes: Option<Vec<PassKind>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::O3,
            target: TargetConfig::default(),
            passes: None,
        }
    }
}

impl PipelineConfig {
    pub fn new(opt_level: OptLevel) -> Self {
        Self { opt_level, ..Default::default() }
    }

    pub fn with_target(mut self, target: TargetConfig) -> Self {
        self.target = target;
        self
    }

    pub fn with_passes(mut self, passes: Vec<PassKind>) -> Self {
        self.passes = Some(passes);
        self
    }

    /// Passes to run: the explicit list, or the level's.
    pub fn passes(&self) -> Vec<PassKind> {
        self.passes.clone().unwrap_or_else(|| self.opt_level.passes())
    }
}

/// Result of optimization pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    /// Transformations that changed something, as `pass(@function)`
    pub applied_transforms: Vec<String>,
    /// Whether the module was modified
    pub modified: bool,
    /// Schedules of the steady-state functions created by this run
    pub schedules: Vec<(String, PipelineInfo)>,
    /// Functions left untouched, with the reason
    pub failures: Vec<TransformError>,
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.applied_transforms.is_empty() {
            writeln!(f, "applied: none")?;
        } else {
            writeln!(f, "applied: {}", self.applied_transforms.join(", "))?;
        }
        for (name, info) in &self.schedules {
            writeln!(
                f,
                "@{}: II={} (ResMII={}, RecMII={}), {} stage(s), prologue {} op(s), epilogue {} op(s)",
                name,
                info.ii,
                info.res_mii,
                info.rec_mii,
                info.stage_count,
                info.prologue_ops,
                info.epilogue_ops
            )?;
        }
        for failure in &self.failures {
            writeln!(f, "failed: {}", failure)?;
        }
        Ok(())
    }
}

/// Optimization pipeline.
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    /// Create a new pipeline with the given configuration.
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Create a pipeline with default configuration.
    pub fn default_pipeline() -> Self {
        Self::new(PipelineConfig::default())
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn transform(&self, kind: PassKind) -> Box<dyn Transform> {
        let target = &self.config.target;
        match kind {
            PassKind::Extract => Box::new(KernelExtractor::kernel()),
            PassKind::Legalize => Box::new(Legalizer::new(target)),
            PassKind::Schedule => Box::new(ModuloScheduler::new(target)),
            PassKind::Tail => Box::new(KernelExtractor::tail()),
            PassKind::Reshape => Box::new(LoopShapeConverter::new()),
        }
    }

    /// Run the configured passes over every function of `module`.
    ///
    /// Malformed input or a pass producing malformed IR is an error;
    /// transformation failures only skip the function concerned.
    pub fn optimize(&self, module: &mut Module) -> PipelinerResult<PipelineReport> {
        verify_module(module)?;
        let passes = self.config.passes();
        let mut report = PipelineReport::default();
        let original: HashSet<String> = module.names().into_iter().collect();

        for name in module.names() {
            if !module.contains(&name) {
                continue;
            }
            let snapshot = module.clone();
            match self.run_function(module, &name, &passes) {
                Ok(applied) => {
                    report.modified |= !applied.is_empty();
                    report
                        .applied_transforms
                        .extend(applied.iter().map(|kind| format!("{}(@{})", kind, name)));
                }
                Err(PipelinerError::Transform(err)) => {
                    warn!("@{} left unchanged: {}", name, err);
                    *module = snapshot;
                    report.failures.push(err);
                }
                Err(fatal) => return Err(fatal),
            }
        }

        report.schedules = module
            .functions
            .iter()
            .filter(|f| f.role == FuncRole::Steady && !original.contains(&f.name))
            .filter_map(|f| f.info.map(|info| (f.name.clone(), info)))
            .collect();
        info!(
            "{} transformation(s) applied, {} loop(s) pipelined, {} function(s) failed",
            report.applied_transforms.len(),
            report.schedules.len(),
            report.failures.len()
        );
        Ok(report)
    }

    fn run_function(
        &self,
        module: &mut Module,
        function: &str,
        passes: &[PassKind],
    ) -> PipelinerResult<Vec<PassKind>> {
        let mut applied = Vec::new();
        for &kind in passes {
            let pass = self.transform(kind);
            let changed = pass
                .apply(module, function)
                .map_err(|e| e.in_function(function))?;
            if changed {
                verify_module(module)?;
                debug!("{} changed @{}", pass.name(), function);
                applied.push(kind);
            }
        }
        Ok(applied)
    }
}

/// Optimize a module with the default configuration.
pub fn quick_optimize(module: &mut Module) -> PipelinerResult<PipelineReport> {
    Pipeline::default_pipeline().optimize(module)
}
