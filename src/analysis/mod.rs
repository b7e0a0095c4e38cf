//! Analyses feeding the pipelining transformations.
//!
//! - **Loops** (`loops`): counted-loop decomposition, live-ins and escapes
//! - **Dependence** (`dependence`): latency/distance graph of a loop body
//! - **Bounds** (`bounds`): ResMII, RecMII and the starting II

pub mod loops;
pub mod dependence;
pub mod bounds;

pub use loops::CountedLoop;
pub use dependence::{DepEdge, DepNode, DependenceGraph, DependenceGraphSummary, DependenceKind};
pub use bounds::ScheduleBounds;
