//! Intermediate representation.
//!
//! A structured SSA operation graph:
//! - **Types** (`types`): index, i1, integer scalars, vectors and buffers
//! - **Operations** (`ops`): arithmetic, shape, memory, calls and the
//!   region-holding `for`, `do_while` and `if`
//! - **Functions** (`function`): arena storage addressed by `ValueId`,
//!   `OpId` and `BlockId`
//!
//! `builder` emits ops, `printer` renders text, `verify` checks structure
//! and `interp` executes modules.

pub mod types;
pub mod ops;
pub mod function;
pub mod builder;
pub mod printer;
pub mod verify;
pub mod interp;

// Re-exports
pub use types::{ElemType, Type};
pub use ops::{BinOp, CmpPred, FuncRole, LoopRole, OpKind, PipelineInfo, PipelineRef};
pub use function::{clone_op, BlockId, Func, Module, OpId, ValueDef, ValueId, ValueMap};
pub use builder::Builder;
pub use printer::{print_func, print_module};
pub use verify::{verify_func, verify_module};
pub use interp::{Interpreter, RtValue};
