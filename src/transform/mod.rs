//! Loop transformations for software pipelining.
//!
//! Every transformation is addressed by the name of the function it is
//! responsible for: the extractors and the loop-shape converter rewrite the
//! loops of that function, the legalizer and the scheduler work on the
//! kernels its loops call.

pub mod extract;
pub mod legalize;
pub mod modulo;
pub mod loop_shape;
pub mod pipeline;

pub use extract::{ExtractMode, KernelExtractor};
pub use legalize::Legalizer;
pub use modulo::{ModuloSchedule, ModuloScheduler};
pub use loop_shape::LoopShapeConverter;
pub use pipeline::{OptLevel, PassKind, Pipeline, PipelineConfig, PipelineReport};

use crate::ir::function::Module;
use crate::utils::errors::TransformError;

/// Transformation pass trait.
pub trait Transform {
    /// Rewrite `function` and the functions it owns. Returns whether anything
    /// changed. On error the module may be partially rewritten; callers that
    /// need all-or-nothing behaviour use [`Transform::run`].
    fn apply(&self, module: &mut Module, function: &str) -> Result<bool, TransformError>;

    /// Get transformation name.
    fn name(&self) -> &str;

    /// Apply to a copy of `module`, leaving the input untouched.
    fn run(&self, module: &Module, function: &str) -> Result<(Module, bool), TransformError> {
        let mut out = module.clone();
        let changed = self
            .apply(&mut out, function)
            .map_err(|e| e.in_function(function))?;
        Ok((out, changed))
    }
}
