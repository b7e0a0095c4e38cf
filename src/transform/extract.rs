//! Kernel and tail extraction.
//!
//! Outlines the body of a counted loop into its own function so it can be
//! legalized and scheduled in isolation. The loop keeps its control and
//! calls the outlined function once per iteration:
//!
//! ```text
//! %r = for[main](%lb, %ub, %st, %init) : i32 {
//!   ^(%i: index, %acc: i32):
//!   %k = call[@f_kernel](%i, %acc, %buf) : i32
//!   yield(%k)
//! }
//! ```

use crate::analysis::loops::{self, CountedLoop};
use crate::ir::builder::Builder;
use crate::ir::function::{clone_op, BlockId, Func, Module, OpId, ValueMap};
use crate::ir::ops::{FuncRole, OpKind, PipelineInfo};
use crate::ir::types::Type;
use crate::transform::Transform;
use crate::utils::errors::{TransformError, TransformErrorKind};
use log::debug;

/// Which loops an extractor outlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    /// The single counted loop of a function, into `@<f>_kernel`
    Kernel,
    /// Residual tail bodies of pipelined loops, into `@<k>_tail`
    Tail,
}

/// Outlines loop bodies into kernel or tail functions.
#[derive(Debug, Clone)]
pub struct KernelExtractor {
    mode: ExtractMode,
}

impl KernelExtractor {
    pub fn new(mode: ExtractMode) -> Self {
        Self { mode }
    }

    pub fn kernel() -> Self {
        Self::new(ExtractMode::Kernel)
    }

    pub fn tail() -> Self {
        Self::new(ExtractMode::Tail)
    }

    fn error(&self, message: impl Into<String>) -> TransformError {
        TransformError::new(TransformErrorKind::UnsupportedLoopShape, self.name(), message)
    }

    fn extract_kernel(&self, module: &mut Module, function: &str) -> Result<bool, TransformError> {
        let Some(func) = module.get(function) else { return Ok(false) };
        let all = loops::all_loops(func);
        if all.is_empty() {
            return Ok(false);
        }
        let top = loops::top_level_loops(func);
        if top.len() != 1 || all.len() != 1 {
            return Err(self.error(format!(
                "expected exactly one top-level loop without nested loops, found {} loops ({} at top level)",
                all.len(),
                top.len()
            )));
        }
        let lp = CountedLoop::from_op(func, top[0])
            .ok_or_else(|| self.error("malformed loop"))?;
        if lp.pipeline.is_some() || outlined_callee(func, lp.body).is_some() {
            return Ok(false);
        }
        if !loops::is_straight_line(func, lp.body) {
            return Err(self.error("loop body contains control flow"));
        }
        if [lp.lb, lp.ub, lp.step].iter().any(|&v| func.value_type(v) != Type::Index) {
            return Err(self.error("trip count is not an index expression"));
        }
        let escaping = loops::escaping_values(func, lp.body);
        if !escaping.is_empty() {
            return Err(self.error(format!(
                "{} value(s) defined in the loop body are used after the loop",
                escaping.len()
            )));
        }

        let name = module.unique_name(&format!("{}_kernel", function));
        self.outline(module, function, &lp, &name, FuncRole::Kernel, None)?;
        debug!("outlined loop body of @{} into @{}", function, name);
        Ok(true)
    }

    fn extract_tails(&self, module: &mut Module, function: &str) -> Result<bool, TransformError> {
        let Some(func) = module.get(function) else { return Ok(false) };
        let pending: Vec<CountedLoop> = loops::top_level_loops(func)
            .into_iter()
            .filter_map(|op| CountedLoop::from_op(func, op))
            .filter(|lp| lp.pipeline.is_some() && outlined_callee(func, lp.body).is_none())
            .collect();

        let mut changed = false;
        for lp in pending {
            let func = module.get(function).ok_or_else(|| self.error("function disappeared"))?;
            if !loops::is_straight_line(func, lp.body) {
                return Err(self.error("tail body contains control flow"));
            }
            let base = lp
                .pipeline
                .as_ref()
                .and_then(|p| p.steady.strip_suffix("_steady"))
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}_kernel", function));
            let name = module.unique_name(&format!("{}_tail", base));
            self.outline(module, function, &lp, &name, FuncRole::Tail, Some(PipelineInfo::unpipelined()))?;
            debug!("outlined tail body of @{} into @{}", function, name);
            changed = true;
        }
        Ok(changed)
    }

    /// Move the body of `lp` into a new function and replace it by a call.
    fn outline(
        &self,
        module: &mut Module,
        function: &str,
        lp: &CountedLoop,
        name: &str,
        role: FuncRole,
        info: Option<PipelineInfo>,
    ) -> Result<(), TransformError> {
        let func = module
            .get_mut(function)
            .ok_or_else(|| self.error(format!("unknown function @{}", function)))?;

        let live_ins = loops::live_ins(func, lp.body);
        let (constants, params): (Vec<_>, Vec<_>) =
            live_ins.into_iter().partition(|&v| func.const_value(v).is_some());

        let mut param_types = vec![Type::Index];
        param_types.extend(lp.carried.iter().map(|&v| func.value_type(v)));
        param_types.extend(params.iter().map(|&v| func.value_type(v)));
        let result_types: Vec<Type> = lp.results.iter().map(|&v| func.value_type(v)).collect();

        let mut kernel = Func::new(name, &param_types, result_types.clone()).with_role(role);
        kernel.info = info;
        let entry = kernel.entry();
        let mut map = ValueMap::new();
        let mut sources = vec![lp.iv];
        sources.extend(&lp.carried);
        sources.extend(&params);
        for (src, &dst) in sources.iter().zip(kernel.params()) {
            map.insert(*src, dst);
        }
        for &c in &constants {
            if let Some(op) = func.defining_op(c) {
                clone_op(func, op, &mut kernel, entry, &mut map);
            }
        }

        let body_ops: Vec<OpId> = func.block(lp.body).ops.clone();
        for &op in &body_ops {
            if !func.op(op).kind.is_terminator() {
                clone_op(func, op, &mut kernel, entry, &mut map);
            }
        }
        let returned = lp.yielded.iter().map(|v| *map.get(v).unwrap_or(v)).collect();
        Builder::at_end(&mut kernel, entry).ret(returned);

        for op in body_ops {
            func.detach(op);
        }
        let mut args = sources;
        args.truncate(1 + lp.carried.len());
        args.extend(params);
        let mut b = Builder::at_end(func, lp.body);
        let results = b.call(name, args, &result_types);
        b.yield_(results);

        module.add(kernel);
        Ok(())
    }
}

impl Transform for KernelExtractor {
    fn apply(&self, module: &mut Module, function: &str) -> Result<bool, TransformError> {
        if module.get(function).map(|f| f.role) != Some(FuncRole::Normal) {
            return Ok(false);
        }
        match self.mode {
            ExtractMode::Kernel => self.extract_kernel(module, function),
            ExtractMode::Tail => self.extract_tails(module, function),
        }
    }

    fn name(&self) -> &str {
        match self.mode {
            ExtractMode::Kernel => "extract",
            ExtractMode::Tail => "tail-extract",
        }
    }
}

/// Callee of a loop body that is nothing but a call whose results are
/// yielded unchanged.
pub fn outlined_callee(func: &Func, body: BlockId) -> Option<&str> {
    let ops = &func.block(body).ops;
    let [call, term] = ops.as_slice() else { return None };
    let OpKind::Call(callee) = &func.op(*call).kind else { return None };
    let yields_results = func.op(*term).kind == OpKind::Yield
        && func.op(*term).operands == func.op(*call).results;
    yields_results.then_some(callee.as_str())
}
