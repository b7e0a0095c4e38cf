//! Convenience layer for emitting operations into a block.

use crate::ir::function::{BlockId, Func, OpId, ValueId};
use crate::ir::ops::{BinOp, CmpPred, OpKind};
use crate::ir::types::Type;

/// Emits ops into one block of a function, either at the end or before a
/// fixed position that advances as ops are inserted.
pub struct Builder<'f> {
    func: &'f mut Func,
    block: BlockId,
    pos: Option<usize>,
}

impl<'f> Builder<'f> {
    /// Insert at the end of `block`.
    pub fn at_end(func: &'f mut Func, block: BlockId) -> Self {
        Self { func, block, pos: None }
    }

    /// Insert before the op currently at `pos` in `block`.
    pub fn at(func: &'f mut Func, block: BlockId, pos: usize) -> Self {
        Self { func, block, pos: Some(pos) }
    }

    /// Insert before `op`.
    pub fn before(func: &'f mut Func, op: OpId) -> Self {
        let block = func.op(op).parent.unwrap_or(func.entry());
        let pos = func.position(op);
        Self { func, block, pos }
    }

    pub fn func(&mut self) -> &mut Func {
        self.func
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn value_type(&self, v: ValueId) -> Type {
        self.func.value_type(v)
    }

    /// Create an op at the insertion point and return it.
    pub fn op(
        &mut self,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: &[Type],
        regions: Vec<BlockId>,
    ) -> OpId {
        let op = self.func.create_op(kind, operands, result_types, regions);
        self.func.attach(self.block, self.pos, op);
        if let Some(pos) = self.pos.as_mut() {
            *pos += 1;
        }
        op
    }

    /// Create a single-result op and return its result.
    pub fn value(&mut self, kind: OpKind, operands: Vec<ValueId>, ty: Type) -> ValueId {
        let op = self.op(kind, operands, &[ty], Vec::new());
        self.func.result(op, 0)
    }

    pub fn constant(&mut self, value: i64, ty: Type) -> ValueId {
        self.value(OpKind::Const(value), Vec::new(), ty)
    }

    pub fn index(&mut self, value: i64) -> ValueId {
        self.constant(value, Type::Index)
    }

    pub fn binary(&mut self, op: BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.value_type(lhs);
        self.value(OpKind::Binary(op), vec![lhs, rhs], ty)
    }

    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Mul, lhs, rhs)
    }

    pub fn fma(&mut self, a: ValueId, b: ValueId, c: ValueId) -> ValueId {
        let ty = self.value_type(a);
        self.value(OpKind::Fma, vec![a, b, c], ty)
    }

    pub fn cmp(&mut self, pred: CmpPred, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.value(OpKind::Cmp(pred), vec![lhs, rhs], Type::Bool)
    }

    pub fn copy(&mut self, v: ValueId) -> ValueId {
        let ty = self.value_type(v);
        self.value(OpKind::Copy, vec![v], ty)
    }

    pub fn broadcast(&mut self, v: ValueId, ty: Type) -> ValueId {
        self.value(OpKind::Broadcast, vec![v], ty)
    }

    pub fn reduce(&mut self, op: BinOp, v: ValueId) -> ValueId {
        let ty = self.value_type(v).scalar();
        self.value(OpKind::Reduce(op), vec![v], ty)
    }

    pub fn slice(&mut self, v: ValueId, offset: u32, lanes: u32) -> ValueId {
        let ty = self.value_type(v).with_lanes(lanes);
        self.value(OpKind::Slice(offset), vec![v], ty)
    }

    pub fn concat(&mut self, parts: Vec<ValueId>) -> ValueId {
        let lanes = parts.iter().map(|&p| self.value_type(p).lanes()).sum();
        let ty = self.value_type(parts[0]).with_lanes(lanes);
        self.value(OpKind::Concat, parts, ty)
    }

    pub fn load(&mut self, buffer: ValueId, index: ValueId, ty: Type) -> ValueId {
        self.value(OpKind::Load, vec![buffer, index], ty)
    }

    pub fn store(&mut self, value: ValueId, buffer: ValueId, index: ValueId) -> OpId {
        self.op(OpKind::Store, vec![value, buffer, index], &[], Vec::new())
    }

    pub fn call(&mut self, callee: &str, args: Vec<ValueId>, result_types: &[Type]) -> Vec<ValueId> {
        let op = self.op(OpKind::Call(callee.to_string()), args, result_types, Vec::new());
        self.func.op(op).results.clone()
    }

    pub fn yield_(&mut self, values: Vec<ValueId>) -> OpId {
        self.op(OpKind::Yield, values, &[], Vec::new())
    }

    pub fn condition(&mut self, cond: ValueId, next: Vec<ValueId>) -> OpId {
        let mut operands = vec![cond];
        operands.extend(next);
        self.op(OpKind::Condition, operands, &[], Vec::new())
    }

    pub fn ret(&mut self, values: Vec<ValueId>) -> OpId {
        self.op(OpKind::Return, values, &[], Vec::new())
    }
}
