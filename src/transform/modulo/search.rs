//! Iterative modulo scheduling search.
//!
//! For each candidate II, starting from `II0`, nodes are placed in order of
//! decreasing height. A node's window opens at the latest cycle its placed
//! predecessors allow (never before cycle 0) and spans II cycles. When no
//! cycle of the window has a free unit, the node is forced in and displaces
//! the ops it conflicts with, which are queued again. Placed successors whose
//! dependences break are displaced the same way. A bounded number of
//! placements per II keeps the search finite.

use crate::analysis::bounds::{self, ScheduleBounds};
use crate::analysis::dependence::{DepNode, DependenceGraph};
use crate::target::{ResourceClass, TargetConfig};
use crate::transform::modulo::ModuloSchedule;
use crate::utils::errors::{TransformError, TransformErrorKind};
use log::{debug, trace};
use std::collections::BTreeMap;

/// Unit usage per class and cycle modulo II.
#[derive(Debug, Clone)]
pub struct ModuloReservationTable {
    ii: u32,
    usage: BTreeMap<ResourceClass, Vec<u32>>,
}

impl ModuloReservationTable {
    pub fn new(ii: u32) -> Self {
        Self { ii: ii.max(1), usage: BTreeMap::new() }
    }

    fn slots(&self, node: &DepNode, cycle: i64) -> impl Iterator<Item = usize> {
        let ii = self.ii as i64;
        (0..node.occupancy as i64).map(move |k| (cycle + k).rem_euclid(ii) as usize)
    }

    /// Whether `node` can issue at `cycle` without exceeding its class.
    pub fn fits(&self, node: &DepNode, cycle: i64, target: &TargetConfig) -> bool {
        let capacity = target.capacity(node.class);
        let mut wanted = vec![0u32; self.ii as usize];
        for slot in self.slots(node, cycle) {
            wanted[slot] += 1;
        }
        let used = self.usage.get(&node.class);
        wanted.iter().enumerate().all(|(slot, &w)| {
            w == 0 || used.map_or(0, |u| u[slot]) + w <= capacity
        })
    }

    pub fn reserve(&mut self, node: &DepNode, cycle: i64) {
        let slots: Vec<usize> = self.slots(node, cycle).collect();
        let ii = self.ii as usize;
        let row = self.usage.entry(node.class).or_insert_with(|| vec![0; ii]);
        for slot in slots {
            row[slot] += 1;
        }
    }

    pub fn release(&mut self, node: &DepNode, cycle: i64) {
        let slots: Vec<usize> = self.slots(node, cycle).collect();
        if let Some(row) = self.usage.get_mut(&node.class) {
            for slot in slots {
                row[slot] = row[slot].saturating_sub(1);
            }
        }
    }

    /// Whether two placements of the same class share a row.
    fn overlaps(&self, a: &DepNode, at: i64, b: &DepNode, bt: i64) -> bool {
        a.class == b.class && self.slots(a, at).any(|s| self.slots(b, bt).any(|t| t == s))
    }
}

/// Placements allowed per node before an II is abandoned.
const BUDGET_PER_NODE: usize = 8;

/// Longest delay from each node to any sink at the given II.
///
/// Requires `II` to be free of positive cycles.
pub fn heights(graph: &DependenceGraph, ii: u32) -> Vec<i64> {
    let mut height = vec![0i64; graph.len()];
    for _ in 0..=graph.len() {
        let mut changed = false;
        for edge in graph.edges.iter().filter(|e| e.source != e.target) {
            let candidate = edge.delay(ii) + height[edge.target];
            if candidate > height[edge.source] {
                height[edge.source] = candidate;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    height
}

/// Scheduling priority: tallest first, program order on ties.
pub fn priority_order(graph: &DependenceGraph, ii: u32) -> Vec<usize> {
    let height = heights(graph, ii);
    let mut order: Vec<usize> = (0..graph.len()).collect();
    order.sort_by_key(|&n| (std::cmp::Reverse(height[n]), n));
    order
}

/// One placement attempt at a fixed II. Returns raw (unnormalized) cycles.
pub fn schedule_at(graph: &DependenceGraph, ii: u32, target: &TargetConfig) -> Option<Vec<i64>> {
    let empty = ModuloReservationTable::new(ii);
    if let Some(n) = graph.nodes.iter().position(|node| !empty.fits(node, 0, target)) {
        trace!("II={}: n{} does not fit an empty table", ii, n);
        return None;
    }

    let order = priority_order(graph, ii);
    let mut cycles: Vec<Option<i64>> = vec![None; graph.len()];
    let mut previous: Vec<Option<i64>> = vec![None; graph.len()];
    let mut mrt = ModuloReservationTable::new(ii);
    let mut budget = graph.len() * BUDGET_PER_NODE;
    let window = ii as i64;

    while let Some(n) = order.iter().copied().find(|&n| cycles[n].is_none()) {
        if budget == 0 {
            trace!("II={}: placement budget exhausted", ii);
            return None;
        }
        budget -= 1;

        let node = &graph.nodes[n];
        let early = graph
            .get_incoming(n)
            .filter(|e| e.source != n)
            .filter_map(|e| cycles[e.source].map(|t| t + e.delay(ii)))
            .fold(0, i64::max);
        let cycle = match (early..early + window).find(|&t| mrt.fits(node, t, target)) {
            Some(t) => t,
            None => match previous[n] {
                Some(prev) if prev >= early => prev + 1,
                _ => early,
            },
        };

        // units
        for m in 0..graph.len() {
            if mrt.fits(node, cycle, target) {
                break;
            }
            if let Some(t) = cycles[m] {
                if mrt.overlaps(node, cycle, &graph.nodes[m], t) {
                    trace!("II={}: n{} at {} displaces n{}", ii, n, cycle, m);
                    mrt.release(&graph.nodes[m], t);
                    cycles[m] = None;
                }
            }
        }
        // dependences
        for edge in graph.get_outgoing(n).filter(|e| e.target != n) {
            if let Some(t) = cycles[edge.target] {
                if t < cycle + edge.delay(ii) {
                    trace!("II={}: n{} at {} displaces n{}", ii, n, cycle, edge.target);
                    mrt.release(&graph.nodes[edge.target], t);
                    cycles[edge.target] = None;
                }
            }
        }

        mrt.reserve(node, cycle);
        cycles[n] = Some(cycle);
        previous[n] = Some(cycle);
    }
    cycles.into_iter().collect()
}

/// Search `II0..=II0+K` for the first feasible schedule.
pub fn find_schedule(
    graph: &DependenceGraph,
    bounds: ScheduleBounds,
    target: &TargetConfig,
) -> Result<ModuloSchedule, TransformError> {
    let first = bounds.ii0();
    let last = first.saturating_add(target.max_ii_offset);
    for ii in first..=last {
        if bounds::has_positive_cycle(graph, ii) {
            trace!("II={}: recurrence not satisfiable", ii);
            continue;
        }
        let Some(raw) = schedule_at(graph, ii, target) else { continue };
        let schedule = ModuloSchedule::from_cycles(ii, &raw, bounds);
        match schedule.verify(graph, target) {
            Ok(()) => {
                debug!("scheduled {} node(s) at II={} (II0={})", graph.len(), ii, first);
                return Ok(schedule);
            }
            Err(violation) => trace!("II={}: rejected: {}", ii, violation),
        }
    }
    Err(TransformError::new(
        TransformErrorKind::SchedulingInfeasible,
        "modulo-schedule",
        format!("no schedule with II in {}..={}", first, last),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::parse;
    use crate::ir::function::Func;

    fn graph_of(source: &str, target: &TargetConfig) -> (Func, DependenceGraph) {
        let module = parse(source).unwrap();
        let func = module.functions[0].clone();
        let entry = func.entry();
        let ret = func.terminator(entry).unwrap();
        let carried: Vec<_> = func.op(ret).operands.iter().enumerate()
            .map(|(k, &w)| (func.params()[1 + k], w))
            .collect();
        let graph = DependenceGraph::build(&func, entry, &carried, target);
        (func, graph)
    }

    const CHAIN: &str = r#"
        func @k(%i: index, %a: buffer<i32>, %b: buffer<i32>, %s: i32) -> () [kernel] {
          %x = load(%a, %i) : i32
          %y = mul(%x, %s) : i32
          %z = add(%y, %s) : i32
          store(%z, %b, %i)
          return()
        }
    "#;

    #[test]
    fn test_mrt_capacity() {
        let target = TargetConfig::default();
        let (_, graph) = graph_of(CHAIN, &target);
        let load = graph.nodes[0];
        let mut mrt = ModuloReservationTable::new(2);
        assert!(mrt.fits(&load, 0, &target));
        mrt.reserve(&load, 0);
        assert!(!mrt.fits(&load, 2, &target));
        assert!(mrt.fits(&load, 3, &target));
    }

    #[test]
    fn test_heights_follow_latency() {
        let target = TargetConfig::default();
        let (_, graph) = graph_of(CHAIN, &target);
        // load(3) -> mul(3) -> add(1) -> store
        assert_eq!(heights(&graph, 2), vec![7, 4, 1, 0]);
        assert_eq!(priority_order(&graph, 2), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_find_schedule_chain() {
        let target = TargetConfig::default();
        let (_, graph) = graph_of(CHAIN, &target);
        let bounds = ScheduleBounds::compute(&graph, &target);
        assert_eq!(bounds.ii0(), 2);
        let schedule = find_schedule(&graph, bounds, &target).unwrap();
        assert_eq!(schedule.ii, 2);
        schedule.verify(&graph, &target).unwrap();
        // every op issues as soon as its operand is ready
        assert_eq!(schedule.cycles, vec![0, 3, 6, 7]);
        assert_eq!(schedule.stage_count(), 4);
    }

    #[test]
    fn test_carried_stores_start_at_or_after_zero() {
        let target = TargetConfig::default();
        // the store of %c1 only waits on last iteration's %r
        let source = r#"
            func @k(%i: index, %c0: i32, %c1: i32, %c2: i32, %a: buffer<i32>, %b: buffer<i32>) -> (i32, i32, i32) [kernel] {
              %one = const[1]() : index
              %two = const[2]() : index
              %i1 = add(%i, %one) : index
              %i2 = add(%i, %two) : index
              %x = load(%a, %i) : i32
              %y = load(%b, %i2) : i32
              %p = mul(%x, %c0) : i32
              %q = add(%p, %c1) : i32
              %r = fma(%y, %c2, %q) : i32
              store(%r, %a, %i2)
              store(%c1, %b, %i)
              store(%q, %b, %i1)
              return(%r, %r, %p)
            }
        "#;
        let (_, graph) = graph_of(source, &target);
        let bounds = ScheduleBounds::compute(&graph, &target);
        let schedule = find_schedule(&graph, bounds, &target).unwrap();
        assert!(schedule.ii >= bounds.ii0());
        schedule.verify(&graph, &target).unwrap();

        let raw = schedule_at(&graph, schedule.ii, &target).unwrap();
        assert!(raw.iter().all(|&t| t >= 0));
    }

    #[test]
    fn test_shared_unit_needs_distinct_rows() {
        let mut target = TargetConfig::default();
        target.set_capacity(ResourceClass::Mem, 1);
        let (_, graph) = graph_of(CHAIN, &target);
        // load and store share the only memory unit; at II=1 they keep
        // displacing each other until the budget runs out
        let raw = schedule_at(&graph, 2, &target).unwrap();
        assert_ne!(raw[0].rem_euclid(2), raw[3].rem_euclid(2));
        assert!(schedule_at(&graph, 1, &target).is_none());
    }

    #[test]
    fn test_infeasible_within_offset() {
        let mut target = TargetConfig::default();
        target.max_ii_offset = 0;
        target.set_capacity(ResourceClass::Mem, 1);
        // a store that reads its own value through memory cannot overlap
        let source = r#"
            func @k(%i: index, %a: buffer<i32>) -> () [kernel] {
              %x = load(%a, %i) : i32
              %y = mul(%x, %x) : i32
              store(%y, %a, %i)
              return()
            }
        "#;
        let (_, graph) = graph_of(source, &target);
        let bounds = ScheduleBounds::compute(&graph, &target);
        // RecMII covers the memory recurrence, so II0 is feasible
        assert!(find_schedule(&graph, bounds, &target).is_ok());

        let tight = ScheduleBounds { res_mii: 1, rec_mii: 1 };
        let err = find_schedule(&graph, tight, &target).unwrap_err();
        assert_eq!(err.kind, TransformErrorKind::SchedulingInfeasible);
    }
}
