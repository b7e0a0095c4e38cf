//! Conversion of counted `for` loops into guarded `do_while` loops.
//!
//! The trip count is computed once before the loop, so the loop test runs
//! after the body and compares a down-counter against zero:
//!
//! ```text
//! tc = max((ub - lb + step - 1) / step, 0)
//! if tc > 0 {
//!   do_while(lb, tc, inits) { ^(iv, count, carried): body; condition(count - 1 > 0, ...) }
//! } else { inits }
//! ```
//!
//! A loop carrying a pipeline reference dispatches at run time between the
//! pipelined form (prologue, steady-state do-while, epilogue) when at least
//! `StageCount` iterations run, and its residual tail body otherwise.

use crate::analysis::loops::{self, CountedLoop};
use crate::ir::builder::Builder;
use crate::ir::function::{BlockId, Func, Module, ValueId};
use crate::ir::ops::{BinOp, CmpPred, OpKind, PipelineRef};
use crate::ir::types::Type;
use crate::transform::Transform;
use crate::utils::errors::{TransformError, TransformErrorKind};
use log::debug;

const NAME: &str = "loop-shape";

/// Rewrites every `for` loop of a function into `do_while` form.
#[derive(Debug, Clone, Default)]
pub struct LoopShapeConverter;

impl LoopShapeConverter {
    pub fn new() -> Self {
        Self
    }

    fn convert(&self, module: &mut Module, function: &str, lp: &CountedLoop) -> Result<(), TransformError> {
        let func = module
            .get(function)
            .ok_or_else(|| error(TransformErrorKind::UnsupportedLoopShape, format!("unknown function @{}", function)))?;
        let step = loops::constant_step(func, lp.step).ok_or_else(|| {
            error(
                TransformErrorKind::UnsupportedInductionPattern,
                "loop step is not a positive constant",
            )
        })?;
        let slot_types = match &lp.pipeline {
            Some(p) => Some(
                module
                    .get(&p.prologue)
                    .map(|f| f.result_types.clone())
                    .ok_or_else(|| {
                        error(
                            TransformErrorKind::UnsupportedLoopShape,
                            format!("pipelined loop refers to missing @{}", p.prologue),
                        )
                    })?,
            ),
            None => None,
        };

        let func = module
            .get_mut(function)
            .ok_or_else(|| error(TransformErrorKind::UnsupportedLoopShape, format!("unknown function @{}", function)))?;
        let mut b = Builder::before(func, lp.op);
        let tc = trip_count(&mut b, lp, step);
        let results = match (&lp.pipeline, slot_types) {
            (Some(pipeline), Some(slot_types)) => dispatch(&mut b, lp, pipeline, tc, &slot_types),
            _ => guarded_do_while(&mut b, lp, tc),
        };
        for (&old, &new) in lp.results.iter().zip(&results) {
            func.replace_all_uses(old, new);
        }
        func.detach(lp.op);
        Ok(())
    }
}

impl Transform for LoopShapeConverter {
    fn apply(&self, module: &mut Module, function: &str) -> Result<bool, TransformError> {
        let Some(func) = module.get(function) else { return Ok(false) };
        // innermost first, so every loop is converted with its body intact
        let pending: Vec<_> = loops::all_loops(func).into_iter().rev().collect();
        let changed = !pending.is_empty();
        for op in pending {
            let func = module
                .get(function)
                .ok_or_else(|| error(TransformErrorKind::UnsupportedLoopShape, "function disappeared"))?;
            let lp = CountedLoop::from_op(func, op)
                .ok_or_else(|| error(TransformErrorKind::UnsupportedLoopShape, "malformed loop"))?;
            self.convert(module, function, &lp)?;
            debug!(
                "converted {} loop in @{} to do-while",
                if lp.pipeline.is_some() { "pipelined" } else { "counted" },
                function
            );
        }
        Ok(changed)
    }

    fn name(&self) -> &str {
        NAME
    }
}

fn error(kind: TransformErrorKind, message: impl Into<String>) -> TransformError {
    TransformError::new(kind, NAME, message)
}

/// `max((ub - lb + step - 1) / step, 0)`.
fn trip_count(b: &mut Builder<'_>, lp: &CountedLoop, step: i64) -> ValueId {
    let span = b.sub(lp.ub, lp.lb);
    let bias = b.index(step - 1);
    let rounded = b.add(span, bias);
    let count = b.binary(BinOp::Div, rounded, lp.step);
    let zero = b.index(0);
    b.binary(BinOp::Max, count, zero)
}

/// `count - 1 > 0` and the next induction value, appended to `block`.
fn advance(func: &mut Func, block: BlockId, iv: ValueId, count: ValueId, step: ValueId) -> (ValueId, ValueId, ValueId) {
    let mut b = Builder::at_end(func, block);
    let one = b.index(1);
    let next_count = b.sub(count, one);
    let zero = b.index(0);
    let more = b.cmp(CmpPred::Gt, next_count, zero);
    let next_iv = b.add(iv, step);
    (more, next_iv, next_count)
}

fn carried_types(func: &Func, lp: &CountedLoop) -> Vec<Type> {
    lp.inits.iter().map(|&v| func.value_type(v)).collect()
}

/// `if tc > 0 { do_while } else { inits }` at the builder's position,
/// moving the loop body into the `do_while`.
fn guarded_do_while(b: &mut Builder<'_>, lp: &CountedLoop, tc: ValueId) -> Vec<ValueId> {
    let zero = b.index(0);
    let any = b.cmp(CmpPred::Gt, tc, zero);
    let func = b.func();
    let types = carried_types(func, lp);
    let then_block = func.new_block(&[]);
    let else_block = func.new_block(&[]);
    let finals = do_while(func, then_block, lp, tc);
    Builder::at_end(func, then_block).yield_(finals);
    Builder::at_end(func, else_block).yield_(lp.inits.clone());
    let op = b.op(OpKind::If, vec![any], &types, vec![then_block, else_block]);
    b.func().op(op).results.clone()
}

/// Append to `block` a `do_while` running the loop body `tc >= 1` times.
/// Returns the final carried values.
fn do_while(func: &mut Func, block: BlockId, lp: &CountedLoop, tc: ValueId) -> Vec<ValueId> {
    let mut types = vec![Type::Index, Type::Index];
    types.extend(carried_types(func, lp));
    let body = func.new_block(&types);
    let args = func.block(body).args.clone();
    let (iv, count) = (args[0], args[1]);

    for op in func.block(lp.body).ops.clone() {
        func.detach(op);
        func.attach(body, None, op);
    }
    func.replace_all_uses(lp.iv, iv);
    for (&old, &new) in lp.carried.iter().zip(&args[2..]) {
        func.replace_all_uses(old, new);
    }
    let yielded = match func.terminator(body) {
        Some(term) => {
            let values = func.op(term).operands.clone();
            func.detach(term);
            values
        }
        None => Vec::new(),
    };

    let (more, next_iv, next_count) = advance(func, body, iv, count, lp.step);
    let mut next = vec![next_iv, next_count];
    next.extend(yielded);
    Builder::at_end(func, body).condition(more, next);

    let mut operands = vec![lp.lb, tc];
    operands.extend(lp.inits.iter().copied());
    let op = Builder::at_end(func, block).op(OpKind::DoWhile, operands, &types, vec![body]);
    func.op(op).results[2..].to_vec()
}

/// `if tc >= StageCount { prologue; do_while { steady }; epilogue } else { tail }`.
fn dispatch(
    b: &mut Builder<'_>,
    lp: &CountedLoop,
    pipeline: &PipelineRef,
    tc: ValueId,
    slot_types: &[Type],
) -> Vec<ValueId> {
    let stages = b.index(pipeline.stage_count as i64);
    let full = b.cmp(CmpPred::Ge, tc, stages);
    let func = b.func();
    let types = carried_types(func, lp);
    let then_block = func.new_block(&[]);
    let else_block = func.new_block(&[]);

    let mut args = vec![lp.lb, lp.step];
    args.extend(lp.inits.iter().copied());
    args.extend(lp.live_ins.iter().copied());
    let mut t = Builder::at_end(func, then_block);
    let slots = t.call(&pipeline.prologue, args, slot_types);
    let filled = t.index(pipeline.stage_count as i64 - 1);
    let offset = t.mul(filled, lp.step);
    let first_iv = t.add(lp.lb, offset);
    let trips = t.sub(tc, filled);

    let mut body_types = vec![Type::Index, Type::Index];
    body_types.extend_from_slice(slot_types);
    let body = func.new_block(&body_types);
    let body_args = func.block(body).args.clone();
    let mut steady_args = vec![body_args[0]];
    steady_args.extend(body_args[2..].iter().copied());
    steady_args.extend(lp.live_ins.iter().copied());
    let next_slots = Builder::at_end(func, body).call(&pipeline.steady, steady_args, slot_types);
    let (more, next_iv, next_count) = advance(func, body, body_args[0], body_args[1], lp.step);
    let mut next = vec![next_iv, next_count];
    next.extend(next_slots);
    Builder::at_end(func, body).condition(more, next);

    let mut operands = vec![first_iv, trips];
    operands.extend(slots);
    let mut t = Builder::at_end(func, then_block);
    let steady = t.op(OpKind::DoWhile, operands, &body_types, vec![body]);
    let mut drained = t.func().op(steady).results[2..].to_vec();
    drained.extend(lp.live_ins.iter().copied());
    let finals = t.call(&pipeline.epilogue, drained, &types);
    t.yield_(finals);

    let mut e = Builder::at_end(func, else_block);
    let finals = guarded_do_while(&mut e, lp, tc);
    e.yield_(finals);

    let op = b.op(OpKind::If, vec![full], &types, vec![then_block, else_block]);
    b.func().op(op).results.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::parse;
    use crate::ir::interp::{Interpreter, RtValue};
    use crate::ir::verify::verify_module;
    use crate::target::TargetConfig;
    use crate::transform::extract::KernelExtractor;
    use crate::transform::modulo::ModuloScheduler;

    const STRIDED: &str = r#"
        func @sum(%buf: buffer<i32>, %lo: index, %n: index) -> (i32) {
          %st = const[2]() : index
          %z = const[0]() : i32
          %r = for[main](%lo, %n, %st, %z) : i32 {
            ^(%i: index, %acc: i32):
            %x = load(%buf, %i) : i32
            %s = add(%acc, %x) : i32
            yield(%s)
          }
          return(%r)
        }
    "#;

    fn run_sum(module: &Module, lo: i64, n: i64) -> i64 {
        let mut interp = Interpreter::new(module);
        let buf = interp.alloc((0..16).map(|v| v * v).collect());
        let out = interp.call("sum", &[buf, RtValue::Int(lo), RtValue::Int(n)]).unwrap();
        out[0].as_int().unwrap()
    }

    fn has_op(func: &Func, pred: impl Fn(&OpKind) -> bool) -> bool {
        func.all_ops().into_iter().any(|op| pred(&func.op(op).kind))
    }

    #[test]
    fn test_convert_counted_loop() {
        let module = parse(STRIDED).unwrap();
        let (out, changed) = LoopShapeConverter::new().run(&module, "sum").unwrap();
        assert!(changed);
        verify_module(&out).unwrap();
        let func = out.get("sum").unwrap();
        assert!(!has_op(func, |k| matches!(k, OpKind::For { .. })));
        assert!(has_op(func, |k| *k == OpKind::DoWhile));

        // empty, single-iteration, odd and even spans, and ub < lb
        for (lo, n) in [(0, 0), (0, 1), (1, 8), (0, 9), (3, 16), (7, 2)] {
            assert_eq!(run_sum(&out, lo, n), run_sum(&module, lo, n), "lo={} n={}", lo, n);
        }
    }

    #[test]
    fn test_conversion_is_idempotent() {
        let module = parse(STRIDED).unwrap();
        let (once, _) = LoopShapeConverter::new().run(&module, "sum").unwrap();
        let (twice, changed) = LoopShapeConverter::new().run(&once, "sum").unwrap();
        assert!(!changed);
        assert_eq!(
            crate::ir::printer::print_module(&twice),
            crate::ir::printer::print_module(&once)
        );
    }

    #[test]
    fn test_nested_loops() {
        let source = r#"
            func @grid(%n: index) -> (index) {
              %lb = const[0]() : index
              %st = const[1]() : index
              %r = for[main](%lb, %n, %st, %lb) : index {
                ^(%i: index, %outer: index):
                %q = for[main](%lb, %i, %st, %outer) : index {
                  ^(%j: index, %inner: index):
                  %t = add(%inner, %j) : index
                  yield(%t)
                }
                yield(%q)
              }
              return(%r)
            }
        "#;
        let module = parse(source).unwrap();
        let (out, _) = LoopShapeConverter::new().run(&module, "grid").unwrap();
        verify_module(&out).unwrap();
        for n in 0..6 {
            let expected = Interpreter::new(&module).call("grid", &[RtValue::Int(n)]).unwrap();
            let actual = Interpreter::new(&out).call("grid", &[RtValue::Int(n)]).unwrap();
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn test_dynamic_step_is_rejected() {
        let source = r#"
            func @f(%n: index, %st: index) -> () {
              %lb = const[0]() : index
              for[main](%lb, %n, %st) {
                ^(%i: index):
                yield()
              }
              return()
            }
        "#;
        let module = parse(source).unwrap();
        let err = LoopShapeConverter::new().run(&module, "f").unwrap_err();
        assert_eq!(err.kind, TransformErrorKind::UnsupportedInductionPattern);
        assert_eq!(err.function.as_deref(), Some("f"));
    }

    #[test]
    fn test_pipelined_dispatch() {
        let source = r#"
            func @scale(%a: buffer<i32>, %b: buffer<i32>, %n: index) -> () {
              %lb = const[0]() : index
              %st = const[1]() : index
              %k = const[3]() : i32
              for[main](%lb, %n, %st) {
                ^(%i: index):
                %x = load(%a, %i) : i32
                %y = mul(%x, %k) : i32
                store(%y, %b, %i)
                yield()
              }
              return()
            }
        "#;
        let module = parse(source).unwrap();
        let target = TargetConfig::default();
        let (extracted, _) = KernelExtractor::kernel().run(&module, "scale").unwrap();
        let (scheduled, _) = ModuloScheduler::new(&target).run(&extracted, "scale").unwrap();
        let (out, _) = LoopShapeConverter::new().run(&scheduled, "scale").unwrap();
        verify_module(&out).unwrap();
        let stages = out.get("scale_kernel_steady").unwrap().info.unwrap().stage_count as i64;
        assert!(stages > 1);

        for n in 0..stages + 4 {
            let mut interp = Interpreter::new(&out);
            let a = interp.alloc((1..=12).collect());
            let b = interp.alloc(vec![0; 12]);
            interp.call("scale", &[a, b.clone(), RtValue::Int(n)]).unwrap();
            let expected: Vec<i64> = (1..=12).map(|v| if v <= n { 3 * v } else { 0 }).collect();
            assert_eq!(interp.buffer(&b).unwrap(), expected.as_slice(), "n={}", n);
            let pipelined = if n >= stages { 1 } else { 0 };
            assert_eq!(interp.calls("scale_kernel_prologue"), pipelined);
            assert_eq!(interp.calls("scale_kernel_epilogue"), pipelined);
            assert_eq!(interp.calls("scale_kernel_steady"), (n - stages + 1).max(0) as usize);
        }
    }
}
