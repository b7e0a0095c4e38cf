//! Modulo scheduling of outlined loop kernels.
//!
//! A kernel is scheduled once for all iterations: every op gets a cycle
//! within a single iteration, and a new iteration starts every II cycles.
//! The resulting overlap is materialized as three functions (prologue,
//! steady state, epilogue) while the caller loop keeps an inline,
//! unpipelined copy of the body as its residual tail.

pub mod codegen;
pub mod search;

use crate::analysis::bounds::ScheduleBounds;
use crate::analysis::dependence::DependenceGraph;
use crate::analysis::loops::{self, CountedLoop};
use crate::ir::builder::Builder;
use crate::ir::function::{clone_op, Func, Module, OpId, ValueId, ValueMap};
use crate::ir::ops::{FuncRole, LoopRole, OpKind, PipelineInfo, PipelineRef};
use crate::target::TargetConfig;
use crate::transform::extract::outlined_callee;
use crate::transform::Transform;
use crate::utils::errors::{TransformError, TransformErrorKind};
use codegen::PipelineNames;
use log::debug;
use std::collections::{BTreeMap, HashSet};

const NAME: &str = "modulo-schedule";

/// Issue cycle of every node of a dependence graph at a fixed II.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuloSchedule {
    pub ii: u32,
    /// Cycle of each node within one iteration, starting at 0
    pub cycles: Vec<u32>,
    pub bounds: ScheduleBounds,
}

impl ModuloSchedule {
    /// Shift raw cycles so the earliest node issues at cycle 0.
    pub fn from_cycles(ii: u32, raw: &[i64], bounds: ScheduleBounds) -> Self {
        let base = raw.iter().copied().min().unwrap_or(0);
        Self {
            ii: ii.max(1),
            cycles: raw.iter().map(|&c| (c - base) as u32).collect(),
            bounds,
        }
    }

    pub fn cycle(&self, node: usize) -> u32 {
        self.cycles[node]
    }

    pub fn stage(&self, node: usize) -> u32 {
        self.cycles[node] / self.ii
    }

    /// Row of the reservation table the node occupies first.
    pub fn slot(&self, node: usize) -> u32 {
        self.cycles[node] % self.ii
    }

    pub fn max_cycle(&self) -> u32 {
        self.cycles.iter().copied().max().unwrap_or(0)
    }

    /// Number of iterations in flight in the steady state.
    pub fn stage_count(&self) -> u32 {
        self.max_cycle() / self.ii + 1
    }

    /// Order in which one steady-state step issues its ops.
    pub fn emission_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.cycles.len()).collect();
        order.sort_by_key(|&n| (self.slot(n), n));
        order
    }

    /// Check dependence and resource constraints against `graph`.
    pub fn verify(&self, graph: &DependenceGraph, target: &TargetConfig) -> Result<(), String> {
        if self.cycles.len() != graph.len() {
            return Err(format!(
                "{} cycle(s) for {} node(s)",
                self.cycles.len(),
                graph.len()
            ));
        }
        for edge in &graph.edges {
            let earliest = self.cycles[edge.source] as i64 + edge.delay(self.ii);
            if (self.cycles[edge.target] as i64) < earliest {
                return Err(format!(
                    "{} violated: n{} at {} before {}",
                    edge, edge.target, self.cycles[edge.target], earliest
                ));
            }
        }
        let mut usage = BTreeMap::new();
        for (n, node) in graph.nodes.iter().enumerate() {
            let row = usage
                .entry(node.class)
                .or_insert_with(|| vec![0u32; self.ii as usize]);
            for k in 0..node.occupancy {
                row[((self.cycles[n] + k) % self.ii) as usize] += 1;
            }
        }
        for (class, row) in usage {
            let capacity = target.capacity(class);
            if let Some(slot) = row.iter().position(|&used| used > capacity) {
                return Err(format!(
                    "{} class uses {} unit(s) at slot {}, capacity {}",
                    class.name(),
                    row[slot],
                    slot,
                    capacity
                ));
            }
        }
        Ok(())
    }

    pub fn info(&self, prologue_ops: usize, epilogue_ops: usize) -> PipelineInfo {
        PipelineInfo {
            ii: self.ii,
            stage_count: self.stage_count(),
            res_mii: self.bounds.res_mii,
            rec_mii: self.bounds.rec_mii,
            prologue_ops,
            epilogue_ops,
        }
    }
}

/// Make every returned value a distinct op result that is not a constant,
/// inserting `copy` ops where needed. Returns the number of copies.
pub fn normalize_returns(func: &mut Func) -> usize {
    let entry = func.entry();
    let Some(ret) = func.terminator(entry) else { return 0 };
    let operands = func.op(ret).operands.clone();
    let mut seen = HashSet::new();
    let mut inserted = 0;
    for (k, v) in operands.into_iter().enumerate() {
        let computed = func
            .defining_op(v)
            .map_or(false, |op| !matches!(func.op(op).kind, OpKind::Const(_)));
        if computed && seen.insert(v) {
            continue;
        }
        let copy = Builder::before(func, ret).copy(v);
        func.op_mut(ret).operands[k] = copy;
        seen.insert(copy);
        inserted += 1;
    }
    inserted
}

/// Pairs of (carried parameter, value returned for the next iteration).
fn carried_pairs(kernel: &Func) -> Result<Vec<(ValueId, ValueId)>, TransformError> {
    let ret = kernel
        .terminator(kernel.entry())
        .ok_or_else(|| error(TransformErrorKind::UnsupportedLoopShape, "kernel has no return"))?;
    let returned = &kernel.op(ret).operands;
    if kernel.params().len() < 1 + returned.len() {
        return Err(error(
            TransformErrorKind::UnsupportedLoopShape,
            "kernel takes fewer carried values than it returns",
        ));
    }
    Ok(returned
        .iter()
        .enumerate()
        .map(|(k, &w)| (kernel.params()[1 + k], w))
        .collect())
}

fn error(kind: TransformErrorKind, message: impl Into<String>) -> TransformError {
    TransformError::new(kind, NAME, message)
}

/// Schedules the kernels called by the loops of a function.
#[derive(Debug, Clone)]
pub struct ModuloScheduler {
    target: TargetConfig,
}

impl ModuloScheduler {
    pub fn new(target: &TargetConfig) -> Self {
        Self { target: target.clone() }
    }

    /// Graph, bounds and schedule of a kernel without rewriting anything.
    pub fn schedule_kernel(
        &self,
        kernel: &Func,
    ) -> Result<(Func, DependenceGraph, ModuloSchedule), TransformError> {
        if !loops::is_straight_line(kernel, kernel.entry()) {
            return Err(error(
                TransformErrorKind::UnsupportedLoopShape,
                "kernel body contains control flow",
            ));
        }
        let mut normalized = kernel.clone();
        normalize_returns(&mut normalized);
        let carried = carried_pairs(&normalized)?;
        let graph = DependenceGraph::build(&normalized, normalized.entry(), &carried, &self.target);
        let bounds = ScheduleBounds::compute(&graph, &self.target);
        debug!(
            "@{}: {} node(s), {} edge(s), ResMII={}, RecMII={}",
            kernel.name,
            graph.len(),
            graph.edges.len(),
            bounds.res_mii,
            bounds.rec_mii
        );
        let schedule = search::find_schedule(&graph, bounds, &self.target)
            .map_err(|e| e.in_function(&kernel.name))?;
        Ok((normalized, graph, schedule))
    }

    fn pipeline_loop(
        &self,
        module: &mut Module,
        function: &str,
        loop_op: OpId,
        callee: &str,
    ) -> Result<(), TransformError> {
        let original = module
            .get(callee)
            .cloned()
            .ok_or_else(|| error(TransformErrorKind::UnsupportedLoopShape, format!("unknown kernel @{}", callee)))?;
        let (kernel, graph, schedule) = self.schedule_kernel(&original)?;

        let names = PipelineNames {
            prologue: module.unique_name(&format!("{}_prologue", callee)),
            steady: module.unique_name(&format!("{}_steady", callee)),
            epilogue: module.unique_name(&format!("{}_epilogue", callee)),
        };
        let generated = codegen::generate(&kernel, &graph, &schedule, &names)?;
        let info = generated.info;

        let func = module
            .get_mut(function)
            .ok_or_else(|| error(TransformErrorKind::UnsupportedLoopShape, format!("unknown function @{}", function)))?;
        let lp = CountedLoop::from_op(func, loop_op)
            .ok_or_else(|| error(TransformErrorKind::UnsupportedLoopShape, "loop disappeared"))?;
        let body_ops = func.block(lp.body).ops.clone();
        let args = match body_ops.first() {
            Some(&call) => func.op(call).operands.clone(),
            None => Vec::new(),
        };
        for &op in &body_ops {
            func.detach(op);
        }

        // the residual tail runs the legalized body as it was outlined
        let entry = original.entry();
        let mut map = ValueMap::new();
        for (&param, &arg) in original.params().iter().zip(&args) {
            map.insert(param, arg);
        }
        let mut returned = Vec::new();
        for &op in &original.block(entry).ops {
            if original.op(op).kind == OpKind::Return {
                returned = original.op(op).operands.clone();
            } else {
                clone_op(&original, op, func, lp.body, &mut map);
            }
        }
        let yielded = returned.iter().map(|v| *map.get(v).unwrap_or(v)).collect();
        Builder::at_end(func, lp.body).yield_(yielded);

        let live_ins: Vec<ValueId> = args.iter().skip(1 + lp.carried.len()).copied().collect();
        let pipeline = PipelineRef {
            prologue: names.prologue.clone(),
            steady: names.steady.clone(),
            epilogue: names.epilogue.clone(),
            stage_count: info.stage_count,
            ii: info.ii,
            num_live_ins: live_ins.len(),
        };
        let data = func.op_mut(loop_op);
        data.kind = OpKind::For { role: LoopRole::Tail, pipeline: Some(pipeline) };
        data.operands.extend(live_ins);

        module.remove(callee);
        module.add(generated.prologue);
        module.add(generated.steady);
        module.add(generated.epilogue);
        debug!(
            "pipelined @{} in @{}: II={} (II0={}), {} stage(s)",
            callee,
            function,
            info.ii,
            schedule.bounds.ii0(),
            info.stage_count
        );
        Ok(())
    }
}

impl Transform for ModuloScheduler {
    fn apply(&self, module: &mut Module, function: &str) -> Result<bool, TransformError> {
        let Some(func) = module.get(function) else { return Ok(false) };
        if func.role != FuncRole::Normal {
            return Ok(false);
        }
        let pending: Vec<(OpId, String)> = loops::top_level_loops(func)
            .into_iter()
            .filter_map(|op| CountedLoop::from_op(func, op))
            .filter(|lp| lp.pipeline.is_none())
            .filter_map(|lp| {
                let callee = outlined_callee(func, lp.body)?;
                let role = module.get(callee)?.role;
                (role == FuncRole::Kernel).then(|| (lp.op, callee.to_string()))
            })
            .collect();

        let changed = !pending.is_empty();
        for (op, callee) in pending {
            self.pipeline_loop(module, function, op, &callee)?;
        }
        Ok(changed)
    }

    fn name(&self) -> &str {
        NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::parse;
    use crate::ir::interp::{Interpreter, RtValue};
    use crate::ir::verify::verify_module;
    use crate::transform::extract::KernelExtractor;

    const SAXPY: &str = r#"
        func @saxpy(%x: buffer<i32>, %y: buffer<i32>, %o: buffer<i32>, %n: index, %a: i32) -> (i32) {
          %lb = const[0]() : index
          %st = const[1]() : index
          %z = const[0]() : i32
          %r = for[main](%lb, %n, %st, %z) : i32 {
            ^(%i: index, %acc: i32):
            %u = load(%x, %i) : i32
            %v = load(%y, %i) : i32
            %w = fma(%u, %a, %v) : i32
            store(%w, %o, %i)
            %s = add(%acc, %w) : i32
            yield(%s)
          }
          return(%r)
        }
    "#;

    fn extracted(source: &str, function: &str) -> Module {
        let module = parse(source).unwrap();
        KernelExtractor::kernel().run(&module, function).unwrap().0
    }

    fn run_saxpy(module: &Module, n: usize) -> (i64, Vec<i64>) {
        let mut interp = Interpreter::new(module);
        let x = interp.alloc((1..=n as i64).collect());
        let y = interp.alloc((0..n as i64).map(|v| 10 - v).collect());
        let o = interp.alloc(vec![0; n]);
        let out = interp
            .call("saxpy", &[x, y, o.clone(), RtValue::Int(n as i64), RtValue::Int(3)])
            .unwrap();
        (out[0].as_int().unwrap(), interp.buffer(&o).unwrap().to_vec())
    }

    #[test]
    fn test_schedule_accessors() {
        let bounds = ScheduleBounds { res_mii: 2, rec_mii: 1 };
        let schedule = ModuloSchedule::from_cycles(2, &[-1, 2, 4], bounds);
        assert_eq!(schedule.cycles, vec![0, 3, 5]);
        assert_eq!(schedule.stage(1), 1);
        assert_eq!(schedule.slot(1), 1);
        assert_eq!(schedule.stage_count(), 3);
        assert_eq!(schedule.emission_order(), vec![0, 1, 2]);
        let info = schedule.info(3, 3);
        assert_eq!((info.ii, info.stage_count, info.res_mii), (2, 3, 2));

        let empty = ModuloSchedule::from_cycles(1, &[], ScheduleBounds { res_mii: 0, rec_mii: 0 });
        assert_eq!(empty.stage_count(), 1);
    }

    #[test]
    fn test_normalize_returns() {
        let source = r#"
            func @k(%i: index, %a: i32, %b: i32) -> (i32, i32, i32) [kernel] {
              %c = const[1]() : i32
              %s = add(%a, %c) : i32
              return(%s, %s, %c)
            }
        "#;
        let mut module = parse(source).unwrap();
        let func = &mut module.functions[0];
        assert_eq!(normalize_returns(func), 2);
        let ret = func.terminator(func.entry()).unwrap();
        let returned = func.op(ret).operands.clone();
        assert_eq!(returned.iter().collect::<HashSet<_>>().len(), 3);
        verify_module(&module).unwrap();
        assert_eq!(normalize_returns(&mut module.functions[0]), 0);
    }

    #[test]
    fn test_pipeline_saxpy() {
        let module = extracted(SAXPY, "saxpy");
        let scheduler = ModuloScheduler::new(&TargetConfig::default());
        let (out, changed) = scheduler.run(&module, "saxpy").unwrap();
        assert!(changed);
        verify_module(&out).unwrap();

        assert!(!out.contains("saxpy_kernel"));
        let steady = out.get("saxpy_kernel_steady").unwrap();
        assert_eq!(steady.role, FuncRole::Steady);
        let info = steady.info.unwrap();
        assert!(info.ii >= info.res_mii.max(info.rec_mii).max(1));
        // loads at 0 and 1, fma at 4, store and add at 8
        assert_eq!((info.ii, info.stage_count), (3, 3));

        let caller = out.get("saxpy").unwrap();
        let lp = loops::top_level_loops(caller)[0];
        let lp = CountedLoop::from_op(caller, lp).unwrap();
        let pipeline = lp.pipeline.unwrap();
        assert_eq!(pipeline.steady, "saxpy_kernel_steady");
        assert_eq!(pipeline.stage_count, info.stage_count);
        // three buffers and the scale factor
        assert_eq!(lp.live_ins.len(), 4);

        for n in [0, 1, 5] {
            assert_eq!(run_saxpy(&out, n), run_saxpy(&module, n));
        }
    }

    #[test]
    fn test_scheduler_is_idempotent() {
        let module = extracted(SAXPY, "saxpy");
        let scheduler = ModuloScheduler::new(&TargetConfig::default());
        let (once, _) = scheduler.run(&module, "saxpy").unwrap();
        let (twice, changed) = scheduler.run(&once, "saxpy").unwrap();
        assert!(!changed);
        assert_eq!(twice.names(), once.names());
    }

    #[test]
    fn test_infeasible_schedule_reports_kernel() {
        let mut target = TargetConfig::default();
        target.max_ii_offset = 0;
        target.set_capacity(crate::target::ResourceClass::Mem, 0);
        let module = extracted(SAXPY, "saxpy");
        let scheduler = ModuloScheduler::new(&target);
        let err = scheduler.run(&module, "saxpy").unwrap_err();
        assert_eq!(err.kind, TransformErrorKind::SchedulingInfeasible);
        assert_eq!(err.function.as_deref(), Some("saxpy_kernel"));
    }
}
