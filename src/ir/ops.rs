//! Operation kinds and their attributes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Elementwise binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    And,
    Or,
    Xor,
}

impl BinOp {
    pub const ALL: [BinOp; 9] = [
        BinOp::Add, BinOp::Sub, BinOp::Mul, BinOp::Div,
        BinOp::Min, BinOp::Max, BinOp::And, BinOp::Or, BinOp::Xor,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Min => "min",
            BinOp::Max => "max",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.name() == name)
    }

    /// Evaluate on two lanes. Division by zero yields zero.
    pub fn eval(&self, a: i64, b: i64) -> i64 {
        match self {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div => if b == 0 { 0 } else { a.wrapping_div(b) },
            BinOp::Min => a.min(b),
            BinOp::Max => a.max(b),
            BinOp::And => a & b,
            BinOp::Or => a | b,
            BinOp::Xor => a ^ b,
        }
    }

    /// Whether the operator can be used by `reduce`.
    pub fn is_reduction(&self) -> bool {
        !matches!(self, BinOp::Sub | BinOp::Div)
    }
}

/// Comparison predicates (signed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpPred {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpPred {
    pub const ALL: [CmpPred; 6] = [
        CmpPred::Lt, CmpPred::Le, CmpPred::Gt, CmpPred::Ge, CmpPred::Eq, CmpPred::Ne,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CmpPred::Lt => "lt",
            CmpPred::Le => "le",
            CmpPred::Gt => "gt",
            CmpPred::Ge => "ge",
            CmpPred::Eq => "eq",
            CmpPred::Ne => "ne",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.name() == name)
    }

    pub fn eval(&self, a: i64, b: i64) -> bool {
        match self {
            CmpPred::Lt => a < b,
            CmpPred::Le => a <= b,
            CmpPred::Gt => a > b,
            CmpPred::Ge => a >= b,
            CmpPred::Eq => a == b,
            CmpPred::Ne => a != b,
        }
    }
}

/// Role of a `for` loop in the transformation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopRole {
    /// A loop as written by the user
    Main,
    /// Unpipelined remainder loop left behind by the modulo scheduler
    Tail,
}

/// Links a residual tail loop to the functions generated for its pipelined form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineRef {
    pub prologue: String,
    pub steady: String,
    pub epilogue: String,
    pub stage_count: u32,
    pub ii: u32,
    /// Number of trailing `for` operands forwarded to the generated functions
    pub num_live_ins: usize,
}

/// The kind of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Integer constant, splatted across lanes for vector results
    Const(i64),
    Binary(BinOp),
    /// `a * b + c`
    Fma,
    /// Produces an `i1`
    Cmp(CmpPred),
    /// Scalar to vector splat
    Broadcast,
    /// Horizontal reduction of a vector to a scalar
    Reduce(BinOp),
    /// Contiguous lanes starting at `offset`; width given by the result type
    Slice(u32),
    /// Lane-wise concatenation of vectors
    Concat,
    /// Identity
    Copy,
    /// `load(buffer, index)`: contiguous lanes starting at `index`
    Load,
    /// `store(value, buffer, index)`
    Store,
    Call(String),
    /// `for(lb, ub, step, inits..., live_ins...)` with one body region
    For {
        role: LoopRole,
        pipeline: Option<PipelineRef>,
    },
    /// `do_while(inits...)` with one body region ending in `condition`
    DoWhile,
    /// `if(cond)` with then/else regions ending in `yield`
    If,
    /// Terminates `for` and `if` regions
    Yield,
    /// Terminates `do_while` regions: `condition(cond, next...)`
    Condition,
    /// Terminates a function body
    Return,
}

impl OpKind {
    /// Mnemonic used by the text format and the timing table.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            OpKind::Const(_) => "const",
            OpKind::Binary(op) => op.name(),
            OpKind::Fma => "fma",
            OpKind::Cmp(_) => "cmp",
            OpKind::Broadcast => "broadcast",
            OpKind::Reduce(_) => "reduce",
            OpKind::Slice(_) => "slice",
            OpKind::Concat => "concat",
            OpKind::Copy => "copy",
            OpKind::Load => "load",
            OpKind::Store => "store",
            OpKind::Call(_) => "call",
            OpKind::For { .. } => "for",
            OpKind::DoWhile => "do_while",
            OpKind::If => "if",
            OpKind::Yield => "yield",
            OpKind::Condition => "condition",
            OpKind::Return => "return",
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, OpKind::Yield | OpKind::Condition | OpKind::Return)
    }

    /// Ops owning nested regions.
    pub fn has_regions(&self) -> bool {
        matches!(self, OpKind::For { .. } | OpKind::DoWhile | OpKind::If)
    }

    /// Lane-parallel arithmetic.
    pub fn is_elementwise(&self) -> bool {
        matches!(self, OpKind::Binary(_) | OpKind::Fma | OpKind::Copy)
    }

    /// Register renaming only.
    pub fn is_shape(&self) -> bool {
        matches!(self, OpKind::Slice(_) | OpKind::Concat)
    }

    pub fn touches_memory(&self) -> bool {
        matches!(self, OpKind::Load | OpKind::Store | OpKind::Call(_))
    }

    /// Free of side effects, removable when unused.
    pub fn is_pure(&self) -> bool {
        !self.touches_memory() && !self.has_regions() && !self.is_terminator()
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// Role of a function in the transformation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FuncRole {
    Normal,
    /// Outlined loop body awaiting scheduling
    Kernel,
    /// Outlined remainder loop body, run unpipelined
    Tail,
    Prologue,
    Steady,
    Epilogue,
}

impl FuncRole {
    pub fn name(&self) -> &'static str {
        match self {
            FuncRole::Normal => "normal",
            FuncRole::Kernel => "kernel",
            FuncRole::Tail => "tail",
            FuncRole::Prologue => "prologue",
            FuncRole::Steady => "steady",
            FuncRole::Epilogue => "epilogue",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            FuncRole::Normal, FuncRole::Kernel, FuncRole::Tail,
            FuncRole::Prologue, FuncRole::Steady, FuncRole::Epilogue,
        ]
        .into_iter()
        .find(|r| r.name() == name)
    }
}

/// Schedule summary recorded on generated functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub ii: u32,
    pub stage_count: u32,
    pub res_mii: u32,
    pub rec_mii: u32,
    /// Scheduled ops replayed by the prologue
    pub prologue_ops: usize,
    /// Scheduled ops replayed by the epilogue
    pub epilogue_ops: usize,
}

impl PipelineInfo {
    /// Degenerate schedule of an unpipelined body.
    pub fn unpipelined() -> Self {
        Self {
            ii: 1,
            stage_count: 1,
            res_mii: 0,
            rec_mii: 0,
            prologue_ops: 0,
            epilogue_ops: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binop_names_roundtrip() {
        for op in BinOp::ALL {
            assert_eq!(BinOp::from_name(op.name()), Some(op));
        }
        assert_eq!(BinOp::from_name("fma"), None);
    }

    #[test]
    fn test_binop_eval() {
        assert_eq!(BinOp::Div.eval(7, 0), 0);
        assert_eq!(BinOp::Div.eval(-7, 2), -3);
        assert_eq!(BinOp::Max.eval(-1, 3), 3);
        assert!(!BinOp::Sub.is_reduction());
    }

    #[test]
    fn test_op_classes() {
        assert!(OpKind::Fma.is_elementwise());
        assert!(OpKind::Concat.is_shape());
        assert!(OpKind::Store.touches_memory());
        assert!(!OpKind::Store.is_pure());
        assert!(OpKind::DoWhile.has_regions());
        assert!(OpKind::Condition.is_terminator());
    }
}
