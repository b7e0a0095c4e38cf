//! Dependence graph of a straight-line loop body.
//!
//! Nodes are the non-constant, non-terminator ops of one block. Every edge
//! carries the latency the target must wait after the source issues and
//! the iteration distance it spans:
//! - register uses inside one iteration (distance 0)
//! - recurrences through loop-carried values (distance 1)
//! - RAW/WAR/WAW ordering between accesses of the same buffer, and
//!   ordering of calls against all memory traffic, in both directions
//!
//! Distinct buffer values are assumed not to alias.

use crate::ir::function::{BlockId, Func, OpId, ValueId};
use crate::ir::ops::OpKind;
use crate::target::{ResourceClass, TargetConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Why one op must wait for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependenceKind {
    /// Register use within one iteration
    Data,
    /// Read-after-write through memory
    Flow,
    /// Write-after-read through memory
    Anti,
    /// Write-after-write through memory
    Output,
    /// Call ordered against memory traffic
    Order,
    /// Register use of a value produced by the previous iteration
    Carried,
}

impl DependenceKind {
    /// Get short name for the dependence kind.
    pub fn short_name(&self) -> &'static str {
        match self {
            DependenceKind::Data => "DATA",
            DependenceKind::Flow => "RAW",
            DependenceKind::Anti => "WAR",
            DependenceKind::Output => "WAW",
            DependenceKind::Order => "ORD",
            DependenceKind::Carried => "REC",
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, DependenceKind::Flow | DependenceKind::Anti | DependenceKind::Output)
    }
}

/// A schedulable op with its timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepNode {
    pub op: OpId,
    pub class: ResourceClass,
    pub latency: u32,
    pub occupancy: u32,
}

/// `target` may issue no earlier than `latency - II * distance` cycles
/// after `source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepEdge {
    pub source: usize,
    pub target: usize,
    pub latency: u32,
    pub distance: u32,
    pub kind: DependenceKind,
}

impl DepEdge {
    pub fn is_loop_carried(&self) -> bool {
        self.distance > 0
    }

    /// Edge weight at a given II.
    pub fn delay(&self, ii: u32) -> i64 {
        self.latency as i64 - ii as i64 * self.distance as i64
    }
}

impl fmt::Display for DepEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n{} -> n{} [{}, lat={}, dist={}]",
            self.source, self.target, self.kind.short_name(), self.latency, self.distance
        )
    }
}

/// Dependence graph over the ops of one block.
#[derive(Debug, Clone)]
pub struct DependenceGraph {
    pub nodes: Vec<DepNode>,
    pub edges: Vec<DepEdge>,
    pub successors: Vec<Vec<usize>>,
    pub predecessors: Vec<Vec<usize>>,
    index: HashMap<OpId, usize>,
}

impl DependenceGraph {
    /// Build the graph of `block`.
    ///
    /// `carried` pairs each loop-carried value visible in the block with the
    /// value it takes in the next iteration.
    pub fn build(
        func: &Func,
        block: BlockId,
        carried: &[(ValueId, ValueId)],
        target: &TargetConfig,
    ) -> Self {
        let mut nodes = Vec::new();
        let mut index = HashMap::new();
        for &op in &func.block(block).ops {
            let kind = &func.op(op).kind;
            if matches!(kind, OpKind::Const(_)) || kind.is_terminator() {
                continue;
            }
            let timing = target.timing(kind);
            index.insert(op, nodes.len());
            nodes.push(DepNode {
                op,
                class: timing.class,
                latency: target.latency(kind),
                occupancy: timing.occupancy.max(1),
            });
        }

        let mut builder = EdgeSet::default();
        let node_of = |v: ValueId| func.defining_op(v).and_then(|op| index.get(&op).copied());

        for (j, node) in nodes.iter().enumerate() {
            for &v in &func.op(node.op).operands {
                if let Some(i) = node_of(v) {
                    builder.add(i, j, nodes[i].latency, 0, DependenceKind::Data);
                }
            }
        }

        for &(param, next) in carried {
            let Some(i) = node_of(next) else { continue };
            for (j, node) in nodes.iter().enumerate() {
                if func.op(node.op).operands.contains(&param) {
                    builder.add(i, j, nodes[i].latency, 1, DependenceKind::Carried);
                }
            }
        }

        let memory: Vec<usize> = (0..nodes.len())
            .filter(|&i| func.op(nodes[i].op).kind.touches_memory())
            .collect();
        for (a, &i) in memory.iter().enumerate() {
            for &j in &memory[a + 1..] {
                add_memory_edges(func, &nodes, i, j, &mut builder);
            }
        }

        let edges = builder.edges;
        let mut successors = vec![Vec::new(); nodes.len()];
        let mut predecessors = vec![Vec::new(); nodes.len()];
        for (e, edge) in edges.iter().enumerate() {
            successors[edge.source].push(e);
            predecessors[edge.target].push(e);
        }

        Self { nodes, edges, successors, predecessors, index }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node index of an op.
    pub fn node_of(&self, op: OpId) -> Option<usize> {
        self.index.get(&op).copied()
    }

    pub fn get_outgoing(&self, node: usize) -> impl Iterator<Item = &DepEdge> {
        self.successors[node].iter().map(move |&e| &self.edges[e])
    }

    pub fn get_incoming(&self, node: usize) -> impl Iterator<Item = &DepEdge> {
        self.predecessors[node].iter().map(move |&e| &self.edges[e])
    }

    pub fn has_dependence(&self, from: usize, to: usize) -> bool {
        self.get_outgoing(from).any(|d| d.target == to)
    }

    pub fn dependences_of_kind(&self, kind: DependenceKind) -> Vec<&DepEdge> {
        self.edges.iter().filter(|d| d.kind == kind).collect()
    }

    pub fn loop_carried_dependences(&self) -> Vec<&DepEdge> {
        self.edges.iter().filter(|d| d.is_loop_carried()).collect()
    }

    /// Sum of all edge latencies; no recurrence needs a larger II.
    pub fn total_latency(&self) -> u32 {
        self.edges.iter().map(|e| e.latency).sum()
    }

    /// Check if there's a cycle in the dependence graph.
    pub fn has_cycle(&self) -> bool {
        !self.recurrences().is_empty()
    }

    fn has_self_loop(&self, node: usize) -> bool {
        self.get_outgoing(node).any(|d| d.target == node)
    }

    /// Strongly connected components that contain a cycle.
    pub fn recurrences(&self) -> Vec<Vec<usize>> {
        self.strongly_connected_components()
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.has_self_loop(scc[0]))
            .collect()
    }

    /// Get strongly connected components using Tarjan's algorithm.
    pub fn strongly_connected_components(&self) -> Vec<Vec<usize>> {
        let mut state = TarjanState {
            index_counter: 0,
            stack: Vec::new(),
            indices: vec![None; self.nodes.len()],
            lowlinks: vec![0; self.nodes.len()],
            on_stack: vec![false; self.nodes.len()],
            sccs: Vec::new(),
        };
        for v in 0..self.nodes.len() {
            if state.indices[v].is_none() {
                self.strongconnect(v, &mut state);
            }
        }
        state.sccs
    }

    fn strongconnect(&self, v: usize, state: &mut TarjanState) {
        state.indices[v] = Some(state.index_counter);
        state.lowlinks[v] = state.index_counter;
        state.index_counter += 1;
        state.stack.push(v);
        state.on_stack[v] = true;

        for &e in &self.successors[v] {
            let w = self.edges[e].target;
            match state.indices[w] {
                None => {
                    self.strongconnect(w, state);
                    state.lowlinks[v] = state.lowlinks[v].min(state.lowlinks[w]);
                }
                Some(index_w) if state.on_stack[w] => {
                    state.lowlinks[v] = state.lowlinks[v].min(index_w);
                }
                Some(_) => {}
            }
        }

        if state.indices[v] == Some(state.lowlinks[v]) {
            let mut scc = Vec::new();
            while let Some(w) = state.stack.pop() {
                state.on_stack[w] = false;
                scc.push(w);
                if w == v {
                    break;
                }
            }
            scc.sort_unstable();
            state.sccs.push(scc);
        }
    }

    /// Get a summary of the dependence graph.
    pub fn summary(&self) -> DependenceGraphSummary {
        let count = |kind| self.dependences_of_kind(kind).len();
        DependenceGraphSummary {
            num_nodes: self.nodes.len(),
            num_dependences: self.edges.len(),
            num_data: count(DependenceKind::Data),
            num_flow: count(DependenceKind::Flow),
            num_anti: count(DependenceKind::Anti),
            num_output: count(DependenceKind::Output),
            num_order: count(DependenceKind::Order),
            num_carried: count(DependenceKind::Carried),
            num_loop_carried: self.loop_carried_dependences().len(),
            num_recurrences: self.recurrences().len(),
        }
    }
}

struct TarjanState {
    index_counter: usize,
    stack: Vec<usize>,
    indices: Vec<Option<usize>>,
    lowlinks: Vec<usize>,
    on_stack: Vec<bool>,
    sccs: Vec<Vec<usize>>,
}

/// Edge list deduplicated on `(source, target, distance)`, keeping the
/// largest latency.
#[derive(Default)]
struct EdgeSet {
    edges: Vec<DepEdge>,
    seen: HashMap<(usize, usize, u32), usize>,
}

impl EdgeSet {
    fn add(&mut self, source: usize, target: usize, latency: u32, distance: u32, kind: DependenceKind) {
        match self.seen.get(&(source, target, distance)) {
            Some(&e) => {
                let edge = &mut self.edges[e];
                if latency > edge.latency {
                    edge.latency = latency;
                    edge.kind = kind;
                }
            }
            None => {
                self.seen.insert((source, target, distance), self.edges.len());
                self.edges.push(DepEdge { source, target, latency, distance, kind });
            }
        }
    }
}

/// Buffer accessed by a load or store.
fn buffer_of(func: &Func, op: OpId) -> Option<ValueId> {
    let data = func.op(op);
    match data.kind {
        OpKind::Load => data.operands.first().copied(),
        OpKind::Store => data.operands.get(1).copied(),
        _ => None,
    }
}

/// Ordering edges between memory ops `i` and `j`, `i` first in program order.
fn add_memory_edges(func: &Func, nodes: &[DepNode], i: usize, j: usize, edges: &mut EdgeSet) {
    let (ki, kj) = (&func.op(nodes[i].op).kind, &func.op(nodes[j].op).kind);
    let is_call = |k: &OpKind| matches!(k, OpKind::Call(_));

    if is_call(ki) || is_call(kj) {
        let lat = |n: usize, k: &OpKind| if is_call(k) { nodes[n].latency } else { 1 };
        edges.add(i, j, lat(i, ki), 0, DependenceKind::Order);
        edges.add(j, i, lat(j, kj), 1, DependenceKind::Order);
        return;
    }

    if buffer_of(func, nodes[i].op) != buffer_of(func, nodes[j].op) {
        return;
    }
    match (ki, kj) {
        (OpKind::Store, OpKind::Load) => {
            edges.add(i, j, nodes[i].latency, 0, DependenceKind::Flow);
            edges.add(j, i, 1, 1, DependenceKind::Anti);
        }
        (OpKind::Load, OpKind::Store) => {
            edges.add(i, j, 1, 0, DependenceKind::Anti);
            edges.add(j, i, nodes[j].latency, 1, DependenceKind::Flow);
        }
        (OpKind::Store, OpKind::Store) => {
            edges.add(i, j, 1, 0, DependenceKind::Output);
            edges.add(j, i, 1, 1, DependenceKind::Output);
        }
        _ => {}
    }
}

/// Summary of a dependence graph.
#[derive(Debug, Clone)]
pub struct DependenceGraphSummary {
    pub num_nodes: usize,
    pub num_dependences: usize,
    pub num_data: usize,
    pub num_flow: usize,
    pub num_anti: usize,
    pub num_output: usize,
    pub num_order: usize,
    pub num_carried: usize,
    pub num_loop_carried: usize,
    pub num_recurrences: usize,
}

impl fmt::Display for DependenceGraphSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Dependence Graph Summary:")?;
        writeln!(f, "  Nodes: {}", self.num_nodes)?;
        writeln!(f, "  Total dependences: {}", self.num_dependences)?;
        writeln!(f, "    Data: {}", self.num_data)?;
        writeln!(f, "    Flow (RAW): {}", self.num_flow)?;
        writeln!(f, "    Anti (WAR): {}", self.num_anti)?;
        writeln!(f, "    Output (WAW): {}", self.num_output)?;
        writeln!(f, "    Call order: {}", self.num_order)?;
        writeln!(f, "    Recurrence: {}", self.num_carried)?;
        writeln!(f, "  Loop-carried: {}", self.num_loop_carried)?;
        writeln!(f, "  Recurrences: {}", self.num_recurrences)?;
        Ok(())
    }
}
