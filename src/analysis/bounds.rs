//! Lower bounds on the initiation interval.

use crate::analysis::dependence::DependenceGraph;
use crate::target::{ResourceClass, TargetConfig};
use num_integer::Integer;
use std::collections::BTreeMap;

/// Resource- and recurrence-constrained minimum IIs of a loop body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleBounds {
    pub res_mii: u32,
    pub rec_mii: u32,
}

impl ScheduleBounds {
    pub fn compute(graph: &DependenceGraph, target: &TargetConfig) -> Self {
        Self {
            res_mii: res_mii(graph, target),
            rec_mii: rec_mii(graph),
        }
    }

    /// First II the scheduler tries.
    pub fn ii0(&self) -> u32 {
        self.res_mii.max(self.rec_mii).max(1)
    }
}

/// Unit-cycles requested from each class by one iteration.
pub fn class_usage(graph: &DependenceGraph) -> BTreeMap<ResourceClass, u32> {
    let mut usage = BTreeMap::new();
    for node in &graph.nodes {
        *usage.entry(node.class).or_insert(0) += node.occupancy;
    }
    usage
}

/// `max` over classes of `ceil(usage / units)`; zero for an empty body.
pub fn res_mii(graph: &DependenceGraph, target: &TargetConfig) -> u32 {
    class_usage(graph)
        .into_iter()
        .map(|(class, used)| Integer::div_ceil(&used, &target.capacity(class).max(1)))
        .max()
        .unwrap_or(0)
}

/// Smallest II at which no dependence cycle has positive total delay;
/// zero when the graph is acyclic.
pub fn rec_mii(graph: &DependenceGraph) -> u32 {
    if !graph.has_cycle() {
        return 0;
    }
    let (mut lo, mut hi) = (1u32, graph.total_latency().max(1));
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if has_positive_cycle(graph, mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Bellman-Ford on longest paths with edge weights `latency - II * distance`.
pub fn has_positive_cycle(graph: &DependenceGraph, ii: u32) -> bool {
    let n = graph.len();
    let mut dist = vec![0i64; n];
    for _ in 0..=n {
        let mut changed = false;
        for edge in &graph.edges {
            let candidate = dist[edge.source] + edge.delay(ii);
            if candidate > dist[edge.target] {
                dist[edge.target] = candidate;
                changed = true;
            }
        }
        if !changed {
            return false;
        }
    }
    true
}
