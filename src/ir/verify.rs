//! Structural checks on modules.
//!
//! The driver runs these after parsing and after every transformation. A
//! module that verifies can be printed, re-parsed and interpreted.

use crate::ir::function::{BlockId, Func, Module, OpId, ValueId};
use crate::ir::ops::OpKind;
use crate::ir::types::Type;
use crate::utils::errors::{VerifyError, VerifyErrorKind};
use std::collections::HashSet;

/// Verify every function of a module.
pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    for func in &module.functions {
        verify_func(func, module)?;
    }
    Ok(())
}

/// Verify one function; `module` resolves callees.
pub fn verify_func(func: &Func, module: &Module) -> Result<(), VerifyError> {
    let mut verifier = Verifier { func, module, visible: HashSet::new() };
    verifier.check_block(func.entry(), Terminator::Return)?;
    Ok(())
}

/// Terminator a block must end with.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Terminator {
    Return,
    Yield,
    Condition,
}

struct Verifier<'a> {
    func: &'a Func,
    module: &'a Module,
    visible: HashSet<ValueId>,
}

impl<'a> Verifier<'a> {
    fn error(&self, kind: VerifyErrorKind, message: String) -> VerifyError {
        VerifyError { message, function: self.func.name.clone(), kind }
    }

    fn ty(&self, v: ValueId) -> Type {
        self.func.value_type(v)
    }

    fn types(&self, values: &[ValueId]) -> Vec<Type> {
        values.iter().map(|&v| self.ty(v)).collect()
    }

    fn check_block(&mut self, block: BlockId, terminator: Terminator) -> Result<(), VerifyError> {
        let func = self.func;
        let data = func.block(block);
        let mut added: Vec<ValueId> = data.args.clone();
        self.visible.extend(data.args.iter().copied());

        let last = data.ops.len().checked_sub(1);
        for (pos, &op) in data.ops.iter().enumerate() {
            let kind = &func.op(op).kind;
            if kind.is_terminator() && Some(pos) != last {
                return Err(self.error(
                    VerifyErrorKind::Terminator,
                    format!("{} in the middle of a block", kind),
                ));
            }
            self.check_op(op)?;
            let results = &func.op(op).results;
            self.visible.extend(results.iter().copied());
            added.extend(results.iter().copied());
        }

        let expected = match terminator {
            Terminator::Return => OpKind::Return,
            Terminator::Yield => OpKind::Yield,
            Terminator::Condition => OpKind::Condition,
        };
        match last.map(|p| &func.op(data.ops[p]).kind) {
            Some(kind) if *kind == expected => {}
            _ => {
                return Err(self.error(
                    VerifyErrorKind::Terminator,
                    format!("block must end with {}", expected),
                ))
            }
        }

        for v in added {
            self.visible.remove(&v);
        }
        Ok(())
    }

    fn check_op(&mut self, id: OpId) -> Result<(), VerifyError> {
        let func = self.func;
        let op = func.op(id);
        for &v in &op.operands {
            if !self.visible.contains(&v) {
                return Err(self.error(
                    VerifyErrorKind::Visibility,
                    format!("{} uses {} which is not visible", op.kind, v),
                ));
            }
        }

        let operands = self.types(&op.operands);
        let results = self.types(&op.results);
        let arity = |n_ops: usize, n_res: usize| operands.len() == n_ops && results.len() == n_res;
        let mismatch = |what: &str| {
            VerifyError {
                message: format!("{}: {}", op.kind, what),
                function: func.name.clone(),
                kind: VerifyErrorKind::TypeMismatch,
            }
        };
        if !op.kind.has_regions() && !op.regions.is_empty() {
            return Err(self.error(VerifyErrorKind::Arity, format!("{} cannot own regions", op.kind)));
        }

        match &op.kind {
            OpKind::Const(_) => {
                if !arity(0, 1) {
                    return Err(self.arity_error(id));
                }
                if matches!(results[0], Type::Buffer(_)) {
                    return Err(mismatch("buffer constant"));
                }
            }
            OpKind::Binary(_) | OpKind::Fma | OpKind::Copy => {
                let n = match op.kind {
                    OpKind::Fma => 3,
                    OpKind::Copy => 1,
                    _ => 2,
                };
                if !arity(n, 1) {
                    return Err(self.arity_error(id));
                }
                if !results[0].is_arith() && op.kind != OpKind::Copy {
                    return Err(mismatch("non-arithmetic type"));
                }
                if operands.iter().any(|t| *t != results[0]) {
                    return Err(mismatch("operand and result types differ"));
                }
            }
            OpKind::Cmp(_) => {
                if !arity(2, 1) {
                    return Err(self.arity_error(id));
                }
                if operands[0] != operands[1] || !operands[0].is_arith() || results[0] != Type::Bool {
                    return Err(mismatch("expects two equal arithmetic operands and an i1 result"));
                }
            }
            OpKind::Broadcast => {
                if !arity(1, 1) {
                    return Err(self.arity_error(id));
                }
                if !results[0].is_vector() || results[0].scalar() != operands[0] {
                    return Err(mismatch("expects a scalar of the result element type"));
                }
            }
            OpKind::Reduce(op_kind) => {
                if !arity(1, 1) {
                    return Err(self.arity_error(id));
                }
                if !op_kind.is_reduction() || !operands[0].is_vector() || operands[0].scalar() != results[0] {
                    return Err(mismatch("expects a vector reduced to its element type"));
                }
            }
            OpKind::Slice(offset) => {
                if !arity(1, 1) {
                    return Err(self.arity_error(id));
                }
                let (src, dst) = (operands[0], results[0]);
                if !src.is_vector() || !dst.is_vector() || src.elem() != dst.elem()
                    || offset + dst.lanes() > src.lanes()
                {
                    return Err(mismatch("slice out of range"));
                }
            }
            OpKind::Concat => {
                if operands.is_empty() || results.len() != 1 {
                    return Err(self.arity_error(id));
                }
                let lanes: u32 = operands.iter().map(|t| t.lanes()).sum();
                if operands.iter().any(|t| !t.is_vector() || t.elem() != results[0].elem())
                    || results[0] != results[0].with_lanes(lanes)
                    || !results[0].is_vector()
                {
                    return Err(mismatch("parts must be vectors covering the result"));
                }
            }
            OpKind::Load => {
                if !arity(2, 1) {
                    return Err(self.arity_error(id));
                }
                let ok = matches!(operands[0], Type::Buffer(e) if Some(e) == results[0].elem())
                    && operands[1] == Type::Index
                    && matches!(results[0], Type::Scalar(_) | Type::Vector { .. });
                if !ok {
                    return Err(mismatch("expects (buffer, index) and an element-typed result"));
                }
            }
            OpKind::Store => {
                if !arity(3, 0) {
                    return Err(self.arity_error(id));
                }
                let ok = matches!(operands[1], Type::Buffer(e) if Some(e) == operands[0].elem())
                    && operands[2] == Type::Index
                    && matches!(operands[0], Type::Scalar(_) | Type::Vector { .. });
                if !ok {
                    return Err(mismatch("expects (value, buffer, index)"));
                }
            }
            OpKind::Call(callee) => {
                let Some(target) = self.module.get(callee) else {
                    return Err(self.error(
                        VerifyErrorKind::UnknownCallee,
                        format!("call to unknown function @{}", callee),
                    ));
                };
                if target.param_types() != operands || target.result_types != results {
                    return Err(mismatch(&format!("signature of @{} does not match", callee)));
                }
            }
            OpKind::For { pipeline, .. } => {
                if op.regions.len() != 1 || operands.len() < 3 + results.len() {
                    return Err(self.arity_error(id));
                }
                if operands[..3].iter().any(|t| *t != Type::Index) {
                    return Err(mismatch("bounds and step must be index"));
                }
                let live_ins = operands.len() - 3 - results.len();
                let expected_live_ins = pipeline.as_ref().map(|p| p.num_live_ins).unwrap_or(0);
                if live_ins != expected_live_ins {
                    return Err(self.arity_error(id));
                }
                if operands[3..3 + results.len()] != results[..] {
                    return Err(mismatch("initial values must match results"));
                }
                let body = op.regions[0];
                let mut args = vec![Type::Index];
                args.extend(results.iter().copied());
                if self.types(&self.func.block(body).args) != args {
                    return Err(mismatch("body arguments must be (index, carried...)"));
                }
                self.check_block(body, Terminator::Yield)?;
                self.check_terminator(body, &results, 0)?;
            }
            OpKind::DoWhile => {
                if op.regions.len() != 1 || operands != results {
                    return Err(mismatch("operands, results and body arguments must agree"));
                }
                let body = op.regions[0];
                if self.types(&self.func.block(body).args) != results {
                    return Err(mismatch("operands, results and body arguments must agree"));
                }
                self.check_block(body, Terminator::Condition)?;
                self.check_terminator(body, &results, 1)?;
                let cond = self.func.op(self.last_op(body)).operands[0];
                if self.ty(cond) != Type::Bool {
                    return Err(mismatch("condition must be i1"));
                }
            }
            OpKind::If => {
                if op.regions.len() != 2 || operands != [Type::Bool] {
                    return Err(self.arity_error(id));
                }
                for &region in &op.regions {
                    if !self.func.block(region).args.is_empty() {
                        return Err(mismatch("regions take no arguments"));
                    }
                    self.check_block(region, Terminator::Yield)?;
                    self.check_terminator(region, &results, 0)?;
                }
            }
            OpKind::Return => {
                if operands != self.func.result_types {
                    return Err(mismatch("returned types differ from the signature"));
                }
            }
            OpKind::Yield | OpKind::Condition => {}
        }
        Ok(())
    }

    fn last_op(&self, block: BlockId) -> OpId {
        // check_block has already ensured the block ends with a terminator
        self.func.block(block).ops[self.func.block(block).ops.len() - 1]
    }

    /// Terminator operand types after skipping `skip` leading operands.
    fn check_terminator(&self, block: BlockId, expected: &[Type], skip: usize) -> Result<(), VerifyError> {
        let term = self.func.op(self.last_op(block));
        if term.operands.len() < skip || self.types(&term.operands[skip..]) != expected {
            return Err(self.error(
                VerifyErrorKind::TypeMismatch,
                format!("{} operands do not match the enclosing results", term.kind),
            ));
        }
        Ok(())
    }

    fn arity_error(&self, id: OpId) -> VerifyError {
        let op = self.func.op(id);
        self.error(
            VerifyErrorKind::Arity,
            format!(
                "{} has {} operands, {} results and {} regions",
                op.kind,
                op.operands.len(),
                op.results.len(),
                op.regions.len()
            ),
        )
    }
}
