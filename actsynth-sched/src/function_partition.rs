// SPDX-License-Identifier: Apache-2.0

//! Minimum-cost partition of nodes across one pipeline boundary.
//!
//! The partition question "which spanning nodes end up at or before the
//! boundary cycle, which after" is solved as a minimum s-t cut. Each node `v`
//! contributes a cut arc of capacity `width(v)` (registering `v`'s value at
//! the boundary); dataflow feasibility and value availability are encoded as
//! infinite arcs. The cut therefore minimizes the register bits crossing the
//! boundary.

use std::collections::{HashMap, HashSet, VecDeque};

use actsynth_ir::ir::{Fn, NodeRef};
use actsynth_ir::ir_utils::operands;

const INF: i64 = i64::MAX / 4;

/// Dense-ish max-flow network on adjacency lists with residual edges.
struct FlowNetwork {
    // (to, capacity, index of reverse edge in adj[to])
    edges: Vec<(usize, i64, usize)>,
    adj: Vec<Vec<usize>>,
}

impl FlowNetwork {
    fn new(num_nodes: usize) -> Self {
        FlowNetwork {
            edges: Vec::new(),
            adj: vec![Vec::new(); num_nodes],
        }
    }

    fn add_edge(&mut self, from: usize, to: usize, capacity: i64) {
        let fwd = self.edges.len();
        self.edges.push((to, capacity, 0));
        self.adj[from].push(fwd);
        let bwd = self.edges.len();
        self.edges.push((from, 0, 0));
        self.adj[to].push(bwd);
        self.edges[fwd].2 = bwd;
        self.edges[bwd].2 = fwd;
    }

    /// Edmonds-Karp: BFS augmenting paths until no path remains.
    fn max_flow(&mut self, source: usize, sink: usize) -> i64 {
        let mut total = 0i64;
        loop {
            let mut pred: Vec<Option<usize>> = vec![None; self.adj.len()];
            let mut queue = VecDeque::new();
            queue.push_back(source);
            while let Some(u) = queue.pop_front() {
                if u == sink {
                    break;
                }
                for &ei in self.adj[u].iter() {
                    let (to, cap, _) = self.edges[ei];
                    if cap > 0 && pred[to].is_none() && to != source {
                        pred[to] = Some(ei);
                        queue.push_back(to);
                    }
                }
            }
            if pred[sink].is_none() {
                return total;
            }
            // Find the bottleneck along the path.
            let mut bottleneck = INF;
            let mut cursor = sink;
            while cursor != source {
                let ei = pred[cursor].expect("path edge");
                bottleneck = bottleneck.min(self.edges[ei].1);
                cursor = self.edges[self.edges[ei].2].0;
            }
            // Apply it.
            let mut cursor = sink;
            while cursor != source {
                let ei = pred[cursor].expect("path edge");
                self.edges[ei].1 -= bottleneck;
                let rev = self.edges[ei].2;
                self.edges[rev].1 += bottleneck;
                cursor = self.edges[rev].0;
            }
            total += bottleneck;
        }
    }

    /// Nodes reachable from `source` in the residual graph; the s-side of the
    /// minimum cut.
    fn residual_reachable(&self, source: usize) -> Vec<bool> {
        let mut seen = vec![false; self.adj.len()];
        let mut queue = VecDeque::new();
        seen[source] = true;
        queue.push_back(source);
        while let Some(u) = queue.pop_front() {
            for &ei in self.adj[u].iter() {
                let (to, cap, _) = self.edges[ei];
                if cap > 0 && !seen[to] {
                    seen[to] = true;
                    queue.push_back(to);
                }
            }
        }
        seen
    }
}

/// Partitions `partitionable` into (at-or-before, after) the boundary,
/// minimizing the total bit width of values that must be registered across
/// it.
///
/// `forced_before` / `forced_after` pin nodes whose neighbors outside the
/// partitionable set have already been fixed on one side.
pub fn min_cost_partition(
    f: &Fn,
    partitionable: &[NodeRef],
    forced_before: &HashSet<NodeRef>,
    forced_after: &HashSet<NodeRef>,
) -> (Vec<NodeRef>, Vec<NodeRef>) {
    let k = partitionable.len();
    if k == 0 {
        return (Vec::new(), Vec::new());
    }
    let mut index_of: HashMap<NodeRef, usize> = HashMap::with_capacity(k);
    for (i, nr) in partitionable.iter().enumerate() {
        index_of.insert(*nr, i);
    }

    // Graph layout: v_in = 2i, v_out = 2i+1, then source, sink.
    let source = 2 * k;
    let sink = 2 * k + 1;
    let mut net = FlowNetwork::new(2 * k + 2);

    for (i, nr) in partitionable.iter().enumerate() {
        let width = f.get_node(*nr).ty.bit_count() as i64;
        // Cutting this arc registers the node's value at the boundary.
        net.add_edge(2 * i, 2 * i + 1, width);
    }
    for (vi, nr) in partitionable.iter().enumerate() {
        for dep in operands(&f.get_node(*nr).payload) {
            if let Some(&ui) = index_of.get(&dep) {
                // Value availability: a consumer after the boundary needs the
                // producer's value registered.
                net.add_edge(2 * ui + 1, 2 * vi, INF);
                // Feasibility: the consumer cannot precede its producer.
                net.add_edge(2 * vi, 2 * ui, INF);
            }
        }
    }
    for nr in forced_before.iter() {
        if let Some(&i) = index_of.get(nr) {
            net.add_edge(source, 2 * i, INF);
        }
    }
    for nr in forced_after.iter() {
        if let Some(&i) = index_of.get(nr) {
            net.add_edge(2 * i, sink, INF);
        }
    }

    let cut_bits = net.max_flow(source, sink);
    log::debug!("min-cut boundary cost: {} register bits", cut_bits);

    let reachable = net.residual_reachable(source);
    let mut before = Vec::new();
    let mut after = Vec::new();
    for (i, nr) in partitionable.iter().enumerate() {
        if reachable[2 * i] {
            before.push(*nr);
        } else {
            after.push(*nr);
        }
    }
    (before, after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actsynth_ir::ir_builder::FunctionBuilder;

    #[test]
    fn forced_sides_are_respected() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let x = fb.not(a, None).unwrap();
        let y = fb.not(x, None).unwrap();
        let f = fb.build_with_return_value(y).unwrap();

        let nodes = vec![x.node_ref(), y.node_ref()];
        let mut forced_before = HashSet::new();
        forced_before.insert(x.node_ref());
        let mut forced_after = HashSet::new();
        forced_after.insert(y.node_ref());

        let (before, after) = min_cost_partition(&f, &nodes, &forced_before, &forced_after);
        assert_eq!(before, vec![x.node_ref()]);
        assert_eq!(after, vec![y.node_ref()]);
    }

    #[test]
    fn partition_never_splits_against_dataflow() {
        // x -> y; forcing x after the boundary must drag y after it too.
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let x = fb.not(a, None).unwrap();
        let y = fb.not(x, None).unwrap();
        let f = fb.build_with_return_value(y).unwrap();

        let nodes = vec![x.node_ref(), y.node_ref()];
        let mut forced_after = HashSet::new();
        forced_after.insert(x.node_ref());

        let (before, after) = min_cost_partition(&f, &nodes, &HashSet::new(), &forced_after);
        assert!(before.is_empty());
        assert_eq!(after.len(), 2);
    }

    #[test]
    fn cut_prefers_narrow_values() {
        // wide (16 bits) fans into two narrow consumers (1 bit each); with
        // the producer forced before and the final consumer after, the cut
        // should cross the narrow wires, not the wide one.
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 16);
        let wide = fb.not(a, None).unwrap();
        let n1 = fb.bit_slice(wide, 0, 1, None).unwrap();
        let n2 = fb.bit_slice(wide, 1, 1, None).unwrap();
        let joined = fb.and(&[n1, n2], None).unwrap();
        let f = fb.build_with_return_value(joined).unwrap();

        let nodes = vec![wide.node_ref(), n1.node_ref(), n2.node_ref(), joined.node_ref()];
        let mut forced_before = HashSet::new();
        forced_before.insert(wide.node_ref());
        let mut forced_after = HashSet::new();
        forced_after.insert(joined.node_ref());

        let (before, _after) = min_cost_partition(&f, &nodes, &forced_before, &forced_after);
        // Slices stay with the producer: 2 one-bit registers beat one
        // 16-bit register.
        assert!(before.contains(&n1.node_ref()));
        assert!(before.contains(&n2.node_ref()));
    }
}
