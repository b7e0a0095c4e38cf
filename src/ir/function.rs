//! Functions, modules and their arena storage.
//!
//! Values, operations and blocks of a function live in per-function arenas
//! addressed by integer ids. Rewrites detach operations from their block
//! instead of freeing them, so an id stays valid for the lifetime of the
//! function even when nothing reaches it anymore.

use crate::ir::ops::{FuncRole, OpKind, PipelineInfo};
use crate::ir::types::Type;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifier of an SSA value within a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Identifier of an operation within a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u32);

/// Identifier of a block within a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%v{}", self.0)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueDef {
    /// Block argument (function parameter for the entry block)
    Arg { block: BlockId, index: usize },
    /// Operation result
    Result { op: OpId, index: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueData {
    pub ty: Type,
    pub def: ValueDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpData {
    pub kind: OpKind,
    pub operands: Vec<ValueId>,
    pub results: Vec<ValueId>,
    pub regions: Vec<BlockId>,
    /// Block currently holding the op, if attached
    pub parent: Option<BlockId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockData {
    pub args: Vec<ValueId>,
    pub ops: Vec<OpId>,
    /// Op owning this block as a region
    pub parent: Option<OpId>,
}

/// A function: signature plus a body of nested blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Func {
    pub name: String,
    pub role: FuncRole,
    pub result_types: Vec<Type>,
    /// Schedule summary for generated functions
    pub info: Option<PipelineInfo>,
    entry: BlockId,
    values: Vec<ValueData>,
    ops: Vec<OpData>,
    blocks: Vec<BlockData>,
}

impl Func {
    /// Create an empty function whose entry block takes `params`.
    pub fn new(name: impl Into<String>, params: &[Type], result_types: Vec<Type>) -> Self {
        let mut func = Self {
            name: name.into(),
            role: FuncRole::Normal,
            result_types,
            info: None,
            entry: BlockId(0),
            values: Vec::new(),
            ops: Vec::new(),
            blocks: Vec::new(),
        };
        func.entry = func.new_block(params);
        func
    }

    pub fn with_role(mut self, role: FuncRole) -> Self {
        self.role = role;
        self
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn params(&self) -> &[ValueId] {
        &self.blocks[self.entry.0 as usize].args
    }

    pub fn param_types(&self) -> Vec<Type> {
        self.params().iter().map(|&v| self.value_type(v)).collect()
    }

    pub fn value(&self, v: ValueId) -> &ValueData {
        &self.values[v.0 as usize]
    }

    pub fn value_type(&self, v: ValueId) -> Type {
        self.values[v.0 as usize].ty
    }

    pub fn op(&self, id: OpId) -> &OpData {
        &self.ops[id.0 as usize]
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut OpData {
        &mut self.ops[id.0 as usize]
    }

    pub fn block(&self, id: BlockId) -> &BlockData {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BlockData {
        &mut self.blocks[id.0 as usize]
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Create a detached block with the given argument types.
    pub fn new_block(&mut self, arg_types: &[Type]) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockData { args: Vec::new(), ops: Vec::new(), parent: None });
        for &ty in arg_types {
            self.add_block_arg(id, ty);
        }
        id
    }

    /// Append an argument to a block.
    pub fn add_block_arg(&mut self, block: BlockId, ty: Type) -> ValueId {
        let index = self.blocks[block.0 as usize].args.len();
        let v = self.new_value(ty, ValueDef::Arg { block, index });
        self.blocks[block.0 as usize].args.push(v);
        v
    }

    fn new_value(&mut self, ty: Type, def: ValueDef) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueData { ty, def });
        id
    }

    /// Create a detached op. The given regions become owned by it.
    pub fn create_op(
        &mut self,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: &[Type],
        regions: Vec<BlockId>,
    ) -> OpId {
        let id = OpId(self.ops.len() as u32);
        let results = result_types
            .iter()
            .enumerate()
            .map(|(index, &ty)| self.new_value(ty, ValueDef::Result { op: id, index }))
            .collect();
        for &region in &regions {
            self.blocks[region.0 as usize].parent = Some(id);
        }
        self.ops.push(OpData { kind, operands, results, regions, parent: None });
        id
    }

    /// Create an op at the end of `block`.
    pub fn append_op(
        &mut self,
        block: BlockId,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: &[Type],
        regions: Vec<BlockId>,
    ) -> OpId {
        let id = self.create_op(kind, operands, result_types, regions);
        self.attach(block, None, id);
        id
    }

    /// Attach a detached op to `block` at `pos` (end when `None`).
    pub fn attach(&mut self, block: BlockId, pos: Option<usize>, op: OpId) {
        let ops = &mut self.blocks[block.0 as usize].ops;
        match pos {
            Some(p) => ops.insert(p, op),
            None => ops.push(op),
        }
        self.ops[op.0 as usize].parent = Some(block);
    }

    /// Remove an op from its block. The op and its values stay in the arena.
    pub fn detach(&mut self, op: OpId) {
        if let Some(block) = self.ops[op.0 as usize].parent.take() {
            self.blocks[block.0 as usize].ops.retain(|&o| o != op);
        }
    }

    /// Position of an attached op within its block.
    pub fn position(&self, op: OpId) -> Option<usize> {
        let block = self.op(op).parent?;
        self.block(block).ops.iter().position(|&o| o == op)
    }

    pub fn result(&self, op: OpId, index: usize) -> ValueId {
        self.ops[op.0 as usize].results[index]
    }

    /// Op defining `v`, or `None` for block arguments.
    pub fn defining_op(&self, v: ValueId) -> Option<OpId> {
        match self.value(v).def {
            ValueDef::Result { op, .. } => Some(op),
            ValueDef::Arg { .. } => None,
        }
    }

    /// Block in which `v` becomes visible.
    pub fn defining_block(&self, v: ValueId) -> Option<BlockId> {
        match self.value(v).def {
            ValueDef::Arg { block, .. } => Some(block),
            ValueDef::Result { op, .. } => self.op(op).parent,
        }
    }

    /// Integer value of `v` if it is produced by a `const` op.
    pub fn const_value(&self, v: ValueId) -> Option<i64> {
        let op = self.defining_op(v)?;
        match self.op(op).kind {
            OpKind::Const(c) => Some(c),
            _ => None,
        }
    }

    /// Whether `block` is `ancestor` or nested inside one of its ops.
    pub fn is_nested_in(&self, mut block: BlockId, ancestor: BlockId) -> bool {
        loop {
            if block == ancestor {
                return true;
            }
            let Some(op) = self.block(block).parent else { return false };
            let Some(parent) = self.op(op).parent else { return false };
            block = parent;
        }
    }

    /// Whether `v` is defined inside `block` or any region nested in it.
    pub fn is_defined_in(&self, v: ValueId, block: BlockId) -> bool {
        self.defining_block(v)
            .map(|b| self.is_nested_in(b, block))
            .unwrap_or(false)
    }

    /// Last op of a block if it is a terminator.
    pub fn terminator(&self, block: BlockId) -> Option<OpId> {
        let &last = self.block(block).ops.last()?;
        self.op(last).kind.is_terminator().then_some(last)
    }

    /// Visit every attached op of `block` and its regions in pre-order.
    pub fn walk_block(&self, block: BlockId, f: &mut impl FnMut(OpId)) {
        for &op in &self.block(block).ops {
            f(op);
            for &region in &self.op(op).regions {
                self.walk_block(region, f);
            }
        }
    }

    /// Visit every attached op of the function in pre-order.
    pub fn walk(&self, mut f: impl FnMut(OpId)) {
        self.walk_block(self.entry, &mut f);
    }

    /// All attached ops in pre-order.
    pub fn all_ops(&self) -> Vec<OpId> {
        let mut ops = Vec::new();
        self.walk(|op| ops.push(op));
        ops
    }

    /// Attached ops using `v` as an operand.
    pub fn users(&self, v: ValueId) -> Vec<OpId> {
        let mut users = Vec::new();
        self.walk(|op| {
            if self.op(op).operands.contains(&v) {
                users.push(op);
            }
        });
        users
    }

    /// Replace every operand use of `old` by `new`.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        for op in &mut self.ops {
            for operand in &mut op.operands {
                if *operand == old {
                    *operand = new;
                }
            }
        }
    }

    /// Number of attached ops, excluding terminators.
    pub fn op_count(&self) -> usize {
        let mut count = 0;
        self.walk(|op| {
            if !self.op(op).kind.is_terminator() {
                count += 1;
            }
        });
        count
    }
}

/// Maps values of a source function to values of a destination function.
pub type ValueMap = HashMap<ValueId, ValueId>;

/// Clone `op` (with its regions) from `src` to the end of `block` in `dst`.
///
/// Operands are translated through `map`; operands missing from the map are
/// kept as-is, which is only correct when `src` and `dst` share value ids.
/// Results are recorded in `map`.
pub fn clone_op(src: &Func, op: OpId, dst: &mut Func, block: BlockId, map: &mut ValueMap) -> OpId {
    let data = src.op(op);
    let operands = data.operands.iter().map(|v| *map.get(v).unwrap_or(v)).collect();
    let mut regions = Vec::with_capacity(data.regions.len());
    for &region in &data.regions {
        let arg_types: Vec<Type> = src.block(region).args.iter().map(|&a| src.value_type(a)).collect();
        let new_region = dst.new_block(&arg_types);
        for (old, new) in src.block(region).args.iter().zip(dst.block(new_region).args.clone()) {
            map.insert(*old, new);
        }
        for &inner in &src.block(region).ops {
            clone_op(src, inner, dst, new_region, map);
        }
        regions.push(new_region);
    }
    let result_types: Vec<Type> = data.results.iter().map(|&r| src.value_type(r)).collect();
    let new_op = dst.append_op(block, data.kind.clone(), operands, &result_types, regions);
    for (old, new) in data.results.iter().zip(dst.op(new_op).results.clone()) {
        map.insert(*old, new);
    }
    new_op
}

/// An ordered collection of functions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Module {
    pub functions: Vec<Func>,
}

impl Module {
    pub fn new() -> Self {
        Self { functions: Vec::new() }
    }

    pub fn get(&self, name: &str) -> Option<&Func> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Func> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn add(&mut self, func: Func) {
        self.functions.push(func);
    }

    /// Replace the function with the same name, or append it.
    pub fn replace(&mut self, func: Func) {
        match self.functions.iter_mut().find(|f| f.name == func.name) {
            Some(slot) => *slot = func,
            None => self.functions.push(func),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Func> {
        let pos = self.functions.iter().position(|f| f.name == name)?;
        Some(self.functions.remove(pos))
    }

    /// `base`, or `base_N` for the first free `N`.
    pub fn unique_name(&self, base: &str) -> String {
        if !self.contains(base) {
            return base.to_string();
        }
        (1..)
            .map(|n| format!("{}_{}", base, n))
            .find(|name| !self.contains(name))
            .unwrap_or_else(|| base.to_string())
    }

    pub fn names(&self) -> Vec<String> {
        self.functions.iter().map(|f| f.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ops::BinOp;
    use crate::ir::types::ElemType;

    fn sample() -> Func {
        let i32t = Type::Scalar(ElemType::I32);
        let mut func = Func::new("f", &[i32t, i32t], vec![i32t]);
        let entry = func.entry();
        let (a, b) = (func.params()[0], func.params()[1]);
        let add = func.append_op(entry, OpKind::Binary(BinOp::Add), vec![a, b], &[i32t], vec![]);
        let sum = func.result(add, 0);
        func.append_op(entry, OpKind::Return, vec![sum], &[], vec![]);
        func
    }

    #[test]
    fn test_build_and_query() {
        let func = sample();
        assert_eq!(func.params().len(), 2);
        assert_eq!(func.op_count(), 1);
        let add = func.block(func.entry()).ops[0];
        assert_eq!(func.defining_op(func.result(add, 0)), Some(add));
        assert!(func.terminator(func.entry()).is_some());
        assert_eq!(func.users(func.params()[0]), vec![add]);
    }

    #[test]
    fn test_detach_keeps_ids() {
        let mut func = sample();
        let add = func.block(func.entry()).ops[0];
        func.detach(add);
        assert_eq!(func.op(add).parent, None);
        assert_eq!(func.block(func.entry()).ops.len(), 1);
        assert_eq!(func.op(add).results.len(), 1);
    }

    #[test]
    fn test_unique_name() {
        let mut module = Module::new();
        module.add(sample());
        assert_eq!(module.unique_name("g"), "g");
        assert_eq!(module.unique_name("f"), "f_1");
    }
}
