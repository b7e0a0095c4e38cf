//! Vector width legalization.
//!
//! Rewrites vector operations of kernel and tail functions to the native
//! vector width `W` of the target:
//! - wider vectors (a multiple of the native lane count) are split into
//!   native parts over `slice`s and recombined with `concat`
//! - narrower vectors (dividing the native lane count) are padded to the
//!   native width and sliced back
//!
//! `slice` and `concat` are legal at any width. Every pass ends with a
//! canonicalization sweep that folds shape ops and removes dead pure ops;
//! a pass without rewrites is the fixed point.

use crate::analysis::loops;
use crate::ir::builder::Builder;
use crate::ir::function::{Func, Module, OpId, ValueId};
use crate::ir::ops::{BinOp, FuncRole, OpKind};
use crate::ir::types::{ElemType, Type};
use crate::target::TargetConfig;
use crate::transform::extract::outlined_callee;
use crate::transform::Transform;
use crate::utils::errors::{TransformError, TransformErrorKind};
use log::{debug, trace};
use std::collections::HashSet;

/// What a pass does with one op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Keep,
    /// Split into `parts` ops of `lanes` lanes each
    Split { parts: u32, lanes: u32 },
    /// Pad to `lanes` lanes
    Promote { lanes: u32 },
}

/// Legalizes kernel and tail functions to the native vector width.
#[derive(Debug, Clone)]
pub struct Legalizer {
    native_bits: u32,
    max_iterations: u32,
}

impl Legalizer {
    pub fn new(target: &TargetConfig) -> Self {
        Self {
            native_bits: target.native_vector_bits,
            max_iterations: target.max_legalize_iterations,
        }
    }

    fn error(&self, kind: TransformErrorKind, message: impl Into<String>) -> TransformError {
        TransformError::new(kind, self.name(), message)
    }

    /// Run passes until one performs no rewrites. Returns the total number
    /// of rewrites.
    pub fn legalize_func(&self, func: &mut Func) -> Result<usize, TransformError> {
        let mut total = 0;
        for pass in 0..self.max_iterations {
            let rewrites = self.run_pass(func)?;
            trace!("legalize @{}: pass {} rewrote {} op(s)", func.name, pass, rewrites);
            if rewrites == 0 {
                return Ok(total);
            }
            total += rewrites;
        }
        Err(self.error(
            TransformErrorKind::LegalizationDidNotConverge,
            format!("still rewriting after {} passes", self.max_iterations),
        ))
    }

    /// One legalization pass followed by canonicalization.
    pub fn run_pass(&self, func: &mut Func) -> Result<usize, TransformError> {
        let mut rewrites = 0;
        for op in func.all_ops() {
            if func.op(op).parent.is_none() {
                continue;
            }
            match self.classify(func, op)? {
                Action::Keep => {}
                Action::Split { parts, lanes } => {
                    self.split(func, op, parts, lanes)?;
                    rewrites += 1;
                }
                Action::Promote { lanes } => {
                    self.promote(func, op, lanes)?;
                    rewrites += 1;
                }
            }
        }
        Ok(rewrites + canonicalize(func))
    }

    fn classify(&self, func: &Func, op: OpId) -> Result<Action, TransformError> {
        let data = func.op(op);
        let unlegalizable = |what: String| {
            self.error(TransformErrorKind::UnlegalizableOperation, what)
        };
        let subject = match &data.kind {
            OpKind::Const(_) | OpKind::Binary(_) | OpKind::Fma | OpKind::Copy
            | OpKind::Broadcast | OpKind::Load => func.value_type(data.results[0]),
            OpKind::Store | OpKind::Reduce(_) => func.value_type(data.operands[0]),
            OpKind::Cmp(_) => {
                if data.operands.iter().any(|&v| func.value_type(v).is_vector()) {
                    return Err(unlegalizable("no rule for vector comparisons".to_string()));
                }
                return Ok(Action::Keep);
            }
            OpKind::Call(callee) => {
                let mut values = data.operands.iter().chain(&data.results);
                if values.any(|&v| func.value_type(v).is_vector()) {
                    return Err(unlegalizable(format!("call to @{} passes vectors", callee)));
                }
                return Ok(Action::Keep);
            }
            _ => return Ok(Action::Keep),
        };
        let Type::Vector { lanes, elem } = subject else { return Ok(Action::Keep) };
        if elem.bits() > self.native_bits {
            return Err(unlegalizable(format!(
                "{} elements are wider than the {}-bit native vector",
                elem, self.native_bits
            )));
        }
        let native = self.native_bits / elem.bits();
        let memory = matches!(data.kind, OpKind::Load | OpKind::Store);
        if lanes == native {
            Ok(Action::Keep)
        } else if lanes > native && lanes % native == 0 {
            Ok(Action::Split { parts: lanes / native, lanes: native })
        } else if lanes < native && native % lanes == 0 && !memory {
            Ok(Action::Promote { lanes: native })
        } else {
            Err(unlegalizable(format!(
                "no rule to fit {} {} into {} lanes",
                data.kind, subject, native
            )))
        }
    }

    fn split(&self, func: &mut Func, op: OpId, parts: u32, lanes: u32) -> Result<(), TransformError> {
        let data = func.op(op).clone();
        let part_ty = |v: ValueId, f: &Func| f.value_type(v).with_lanes(lanes);
        let mut b = Builder::before(func, op);

        let replacement = match &data.kind {
            OpKind::Binary(_) | OpKind::Fma | OpKind::Copy => {
                let ty = part_ty(data.results[0], b.func());
                let pieces = (0..parts)
                    .map(|p| {
                        let operands = data.operands.iter().map(|&v| part_of(&mut b, v, p, lanes)).collect();
                        b.value(data.kind.clone(), operands, ty)
                    })
                    .collect();
                Some(b.concat(pieces))
            }
            OpKind::Const(c) => {
                let ty = part_ty(data.results[0], b.func());
                let pieces = (0..parts).map(|_| b.constant(*c, ty)).collect();
                Some(b.concat(pieces))
            }
            OpKind::Broadcast => {
                let ty = part_ty(data.results[0], b.func());
                let pieces = (0..parts).map(|_| b.broadcast(data.operands[0], ty)).collect();
                Some(b.concat(pieces))
            }
            OpKind::Load => {
                let ty = part_ty(data.results[0], b.func());
                let (buffer, index) = (data.operands[0], data.operands[1]);
                let pieces = (0..parts)
                    .map(|p| {
                        let at = offset_index(&mut b, index, p * lanes);
                        b.load(buffer, at, ty)
                    })
                    .collect();
                Some(b.concat(pieces))
            }
            OpKind::Store => {
                let (value, buffer, index) = (data.operands[0], data.operands[1], data.operands[2]);
                for p in 0..parts {
                    let piece = part_of(&mut b, value, p, lanes);
                    let at = offset_index(&mut b, index, p * lanes);
                    b.store(piece, buffer, at);
                }
                None
            }
            OpKind::Reduce(bin) => {
                let mut acc = None;
                for p in 0..parts {
                    let piece = part_of(&mut b, data.operands[0], p, lanes);
                    let partial = b.reduce(*bin, piece);
                    acc = Some(match acc {
                        Some(prev) => b.binary(*bin, prev, partial),
                        None => partial,
                    });
                }
                acc
            }
            other => {
                return Err(self.error(
                    TransformErrorKind::UnlegalizableOperation,
                    format!("no split rule for {}", other),
                ))
            }
        };
        replace_op(func, op, replacement);
        Ok(())
    }

    fn promote(&self, func: &mut Func, op: OpId, lanes: u32) -> Result<(), TransformError> {
        let data = func.op(op).clone();
        let subject = match data.kind {
            OpKind::Reduce(_) => func.value_type(data.operands[0]),
            _ => func.value_type(data.results[0]),
        };
        let narrow = subject.lanes();
        let wide_ty = subject.with_lanes(lanes);
        let mut b = Builder::before(func, op);

        let replacement = match &data.kind {
            OpKind::Binary(_) | OpKind::Fma | OpKind::Copy => {
                // padding lanes are discarded; ones keep division total
                let fill = if data.kind == OpKind::Binary(BinOp::Div) { 1 } else { 0 };
                let operands = data.operands.iter().map(|&v| pad(&mut b, v, lanes, fill)).collect();
                let wide = b.value(data.kind.clone(), operands, wide_ty);
                b.slice(wide, 0, narrow)
            }
            OpKind::Const(c) => {
                let wide = b.constant(*c, wide_ty);
                b.slice(wide, 0, narrow)
            }
            OpKind::Broadcast => {
                let wide = b.broadcast(data.operands[0], wide_ty);
                b.slice(wide, 0, narrow)
            }
            OpKind::Reduce(bin) => {
                let elem = subject.elem().unwrap_or(ElemType::I64);
                let fill = identity(*bin, elem).ok_or_else(|| {
                    self.error(
                        TransformErrorKind::UnlegalizableOperation,
                        format!("reduce[{}] has no identity to pad with", bin.name()),
                    )
                })?;
                let padded = pad(&mut b, data.operands[0], lanes, fill);
                b.reduce(*bin, padded)
            }
            other => {
                return Err(self.error(
                    TransformErrorKind::UnlegalizableOperation,
                    format!("no promotion rule for {}", other),
                ))
            }
        };
        replace_op(func, op, Some(replacement));
        Ok(())
    }

    /// Kernel and tail functions `function` is responsible for.
    fn targets(module: &Module, function: &str) -> Vec<String> {
        let Some(func) = module.get(function) else { return Vec::new() };
        match func.role {
            FuncRole::Kernel | FuncRole::Tail => vec![function.to_string()],
            FuncRole::Normal => loops::all_loops(func)
                .into_iter()
                .filter_map(|op| outlined_callee(func, func.op(op).regions[0]))
                .filter(|callee| {
                    module
                        .get(callee)
                        .map(|f| matches!(f.role, FuncRole::Kernel | FuncRole::Tail))
                        .unwrap_or(false)
                })
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl Transform for Legalizer {
    fn apply(&self, module: &mut Module, function: &str) -> Result<bool, TransformError> {
        let mut changed = false;
        for target in Self::targets(module, function) {
            let Some(func) = module.get_mut(&target) else { continue };
            let rewrites = self.legalize_func(func).map_err(|e| e.in_function(&target))?;
            if rewrites > 0 {
                debug!("legalized @{} with {} rewrite(s)", target, rewrites);
                changed = true;
            }
        }
        Ok(changed)
    }

    fn name(&self) -> &str {
        "legalize"
    }
}

/// Identity element of a reduction operator.
fn identity(op: BinOp, elem: ElemType) -> Option<i64> {
    match op {
        BinOp::Add | BinOp::Or | BinOp::Xor => Some(0),
        BinOp::Mul => Some(1),
        BinOp::And => Some(-1),
        BinOp::Min => Some(elem.max_value()),
        BinOp::Max => Some(elem.min_value()),
        BinOp::Sub | BinOp::Div => None,
    }
}

/// Part `p` of a vector, reusing the operand of a matching `concat`.
fn part_of(b: &mut Builder<'_>, v: ValueId, p: u32, lanes: u32) -> ValueId {
    let ty = b.value_type(v);
    if !ty.is_vector() {
        return v;
    }
    let func = b.func();
    if let Some(def) = func.defining_op(v) {
        let data = func.op(def);
        if data.kind == OpKind::Concat
            && data.parent.is_some()
            && data.operands.iter().all(|&x| func.value_type(x).lanes() == lanes)
        {
            return data.operands[p as usize];
        }
    }
    b.slice(v, p * lanes, lanes)
}

fn offset_index(b: &mut Builder<'_>, index: ValueId, offset: u32) -> ValueId {
    if offset == 0 {
        return index;
    }
    let off = b.index(offset as i64);
    b.add(index, off)
}

/// Widen `v` to `lanes` lanes, filling the new lanes with `fill`.
fn pad(b: &mut Builder<'_>, v: ValueId, lanes: u32, fill: i64) -> ValueId {
    let ty = b.value_type(v);
    let extra = lanes - ty.lanes();
    let filler = b.constant(fill, ty.with_lanes(lanes));
    let tail = b.slice(filler, 0, extra);
    b.concat(vec![v, tail])
}

fn replace_op(func: &mut Func, op: OpId, replacement: Option<ValueId>) {
    if let (Some(new), Some(&old)) = (replacement, func.op(op).results.first()) {
        func.replace_all_uses(old, new);
    }
    func.detach(op);
}

/// Fold shape ops and delete dead pure ops. Returns the number of rewrites.
pub fn canonicalize(func: &mut Func) -> usize {
    let mut rewrites = 0;
    for op in func.all_ops() {
        if let Some(folded) = fold_shape(func, op) {
            replace_op(func, op, Some(folded));
            rewrites += 1;
        }
    }
    rewrites + remove_dead_ops(func)
}

/// Value an attached `slice` or `concat` is equivalent to, if any.
fn fold_shape(func: &Func, op: OpId) -> Option<ValueId> {
    let data = func.op(op);
    if data.parent.is_none() {
        return None;
    }
    let result = *data.results.first()?;
    let ty = func.value_type(result);
    match data.kind {
        OpKind::Slice(offset) => {
            let src = data.operands[0];
            if func.value_type(src) == ty {
                return Some(src);
            }
            let def = func.defining_op(src)?;
            if func.op(def).kind != OpKind::Concat {
                return None;
            }
            let mut start = 0;
            for &part in &func.op(def).operands {
                let part_ty = func.value_type(part);
                if start == offset && part_ty == ty {
                    return Some(part);
                }
                start += part_ty.lanes();
            }
            None
        }
        OpKind::Concat => {
            let mut source = None;
            let mut next = 0;
            for &part in &data.operands {
                let def = func.defining_op(part)?;
                let OpKind::Slice(offset) = func.op(def).kind else { return None };
                let src = func.op(def).operands[0];
                if offset != next || source.map_or(false, |s| s != src) {
                    return None;
                }
                source = Some(src);
                next += func.value_type(part).lanes();
            }
            source.filter(|&s| func.value_type(s) == ty)
        }
        _ => None,
    }
}

fn remove_dead_ops(func: &mut Func) -> usize {
    let mut removed = 0;
    loop {
        let ops = func.all_ops();
        let used: HashSet<ValueId> = ops
            .iter()
            .flat_map(|&op| func.op(op).operands.iter().copied())
            .collect();
        let dead: Vec<OpId> = ops
            .into_iter()
            .filter(|&op| {
                let data = func.op(op);
                data.kind.is_pure() && data.results.iter().all(|r| !used.contains(r))
            })
            .collect();
        if dead.is_empty() {
            return removed;
        }
        removed += dead.len();
        for op in dead {
            func.detach(op);
        }
    }
}
