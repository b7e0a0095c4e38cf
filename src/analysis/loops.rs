//! Loop structure queries shared by the transformations.

use crate::ir::function::{BlockId, Func, OpId, ValueId};
use crate::ir::ops::{OpKind, PipelineRef};
use std::collections::HashSet;

/// Operands, region and terminator of a `for` op, by role.
#[derive(Debug, Clone)]
pub struct CountedLoop {
    pub op: OpId,
    pub lb: ValueId,
    pub ub: ValueId,
    pub step: ValueId,
    /// Initial carried values
    pub inits: Vec<ValueId>,
    /// Trailing operands forwarded to generated functions
    pub live_ins: Vec<ValueId>,
    pub body: BlockId,
    pub iv: ValueId,
    /// Body arguments after the induction variable
    pub carried: Vec<ValueId>,
    /// Operands of the body's `yield`
    pub yielded: Vec<ValueId>,
    pub results: Vec<ValueId>,
    pub pipeline: Option<PipelineRef>,
}

impl CountedLoop {
    /// Decompose a verified `for` op; `None` for any other op.
    pub fn from_op(func: &Func, op: OpId) -> Option<Self> {
        let data = func.op(op);
        let OpKind::For { pipeline, .. } = &data.kind else {
            return None;
        };
        let n_carried = data.results.len();
        let body = *data.regions.first()?;
        let args = &func.block(body).args;
        let yielded = func
            .terminator(body)
            .map(|t| func.op(t).operands.clone())
            .unwrap_or_default();
        Some(Self {
            op,
            lb: data.operands[0],
            ub: data.operands[1],
            step: data.operands[2],
            inits: data.operands[3..3 + n_carried].to_vec(),
            live_ins: data.operands[3 + n_carried..].to_vec(),
            body,
            iv: args[0],
            carried: args[1..].to_vec(),
            yielded,
            results: data.results.clone(),
            pipeline: pipeline.clone(),
        })
    }
}

/// `for` ops placed directly in the function body.
pub fn top_level_loops(func: &Func) -> Vec<OpId> {
    func.block(func.entry())
        .ops
        .iter()
        .copied()
        .filter(|&op| matches!(func.op(op).kind, OpKind::For { .. }))
        .collect()
}

/// Every `for` op of the function, outermost first.
pub fn all_loops(func: &Func) -> Vec<OpId> {
    let mut loops = Vec::new();
    func.walk(|op| {
        if matches!(func.op(op).kind, OpKind::For { .. }) {
            loops.push(op);
        }
    });
    loops
}

/// Whether a block holds no region ops.
pub fn is_straight_line(func: &Func, block: BlockId) -> bool {
    func.block(block).ops.iter().all(|&op| !func.op(op).kind.has_regions())
}

/// Values used inside `block` (or its regions) but defined outside it,
/// in order of first use.
pub fn live_ins(func: &Func, block: BlockId) -> Vec<ValueId> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    func.walk_block(block, &mut |op| {
        for &v in &func.op(op).operands {
            if !func.is_defined_in(v, block) && seen.insert(v) {
                result.push(v);
            }
        }
    });
    result
}

/// Values defined inside `block` that are used by ops outside it.
pub fn escaping_values(func: &Func, block: BlockId) -> Vec<ValueId> {
    let mut result = Vec::new();
    func.walk(|op| {
        let Some(parent) = func.op(op).parent else { return };
        if func.is_nested_in(parent, block) {
            return;
        }
        for &v in &func.op(op).operands {
            if func.is_defined_in(v, block) && !result.contains(&v) {
                result.push(v);
            }
        }
    });
    result
}

/// Step of a loop, if it is a positive constant.
pub fn constant_step(func: &Func, step: ValueId) -> Option<i64> {
    func.const_value(step).filter(|&s| s > 0)
}
