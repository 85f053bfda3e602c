// SPDX-License-Identifier: Apache-2.0

//! Per-node scheduling bounds under a clock-period constraint.
//!
//! `lb`/`ub` bracket the cycles a node may legally occupy. Propagation tracks
//! the accumulated combinational delay within the boundary cycle so chained
//! operations spill into the next (previous) cycle exactly when they exceed
//! the clock period.

use actsynth_common::status::{Status, StatusResult};
use actsynth_ir::ir::{Fn, NodeRef};
use actsynth_ir::ir_utils::{compute_users, get_topological, operands};

use crate::delay_model::DelayEstimator;

#[derive(Clone)]
pub struct ScheduleBounds {
    topo: Vec<NodeRef>,
    clock_period_ps: i64,
    delays: Vec<i64>,
    deps: Vec<Vec<usize>>,
    users: Vec<Vec<usize>>,
    lb: Vec<i64>,
    ub: Vec<i64>,
    /// Longest in-cycle delay of a path ending at the node (inclusive) when
    /// the node sits at its lower bound.
    lb_delay: Vec<i64>,
    /// Longest in-cycle delay of a path starting at the node (inclusive) when
    /// the node sits at its upper bound.
    ub_delay: Vec<i64>,
}

impl ScheduleBounds {
    pub fn new(
        f: &Fn,
        clock_period_ps: i64,
        estimator: &dyn DelayEstimator,
    ) -> StatusResult<Self> {
        let n = f.nodes.len();
        let topo = get_topological(f);
        let mut delays = vec![0i64; n];
        for nr in topo.iter() {
            delays[nr.index] = estimator.operation_delay_ps(f, *nr)?;
        }
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, node) in f.nodes.iter().enumerate() {
            deps[i] = operands(&node.payload).into_iter().map(|r| r.index).collect();
        }
        let users_map = compute_users(f);
        let mut users: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (nr, us) in users_map.iter() {
            let mut sorted: Vec<usize> = us.iter().map(|u| u.index).collect();
            sorted.sort_unstable();
            users[nr.index] = sorted;
        }
        Ok(ScheduleBounds {
            topo,
            clock_period_ps,
            delays,
            deps,
            users,
            lb: vec![0; n],
            ub: vec![i64::MAX / 2; n],
            lb_delay: vec![0; n],
            ub_delay: vec![0; n],
        })
    }

    pub fn clock_period_ps(&self) -> i64 {
        self.clock_period_ps
    }

    pub fn lb(&self, node: NodeRef) -> i64 {
        self.lb[node.index]
    }

    pub fn ub(&self, node: NodeRef) -> i64 {
        self.ub[node.index]
    }

    pub fn max_lower_bound(&self) -> i64 {
        self.lb.iter().copied().max().unwrap_or(0)
    }

    pub fn node_delay(&self, node: NodeRef) -> i64 {
        self.delays[node.index]
    }

    /// Raises a node's lower bound. Fails when the bound crosses the node's
    /// upper bound.
    pub fn tighten_node_lb(&mut self, node: NodeRef, cycle: i64) -> StatusResult<()> {
        let i = node.index;
        if cycle > self.lb[i] {
            self.lb[i] = cycle;
            self.lb_delay[i] = self.delays[i];
        }
        if self.lb[i] > self.ub[i] {
            return Err(Status::ResourceExhausted(format!(
                "node {} lower bound {} exceeds upper bound {}",
                i, self.lb[i], self.ub[i]
            )));
        }
        Ok(())
    }

    /// Lowers a node's upper bound. Fails when the bound crosses the node's
    /// lower bound.
    pub fn tighten_node_ub(&mut self, node: NodeRef, cycle: i64) -> StatusResult<()> {
        let i = node.index;
        if cycle < self.ub[i] {
            self.ub[i] = cycle;
            self.ub_delay[i] = self.delays[i];
        }
        if self.lb[i] > self.ub[i] {
            return Err(Status::ResourceExhausted(format!(
                "node {} upper bound {} undercuts lower bound {}",
                i, self.ub[i], self.lb[i]
            )));
        }
        Ok(())
    }

    /// Propagates lower bounds forward along dataflow edges with delay
    /// chaining.
    pub fn propagate_lower_bounds(&mut self) -> StatusResult<()> {
        let topo = self.topo.clone();
        for nr in topo {
            let i = nr.index;
            let mut cycle = self.lb[i];
            for &dep in self.deps[i].iter() {
                cycle = cycle.max(self.lb[dep]);
            }
            let mut entry = 0i64;
            for &dep in self.deps[i].iter() {
                if self.lb[dep] == cycle {
                    entry = entry.max(self.lb_delay[dep]);
                }
            }
            let mut total = entry + self.delays[i];
            if total > self.clock_period_ps && entry > 0 {
                cycle += 1;
                total = self.delays[i];
            }
            self.lb[i] = cycle;
            self.lb_delay[i] = total;
            if self.lb[i] > self.ub[i] {
                return Err(Status::ResourceExhausted(format!(
                    "node {}: propagated lower bound {} exceeds upper bound {}",
                    i, self.lb[i], self.ub[i]
                )));
            }
        }
        Ok(())
    }

    /// Propagates upper bounds backward along dataflow edges with delay
    /// chaining.
    pub fn propagate_upper_bounds(&mut self) -> StatusResult<()> {
        let topo = self.topo.clone();
        for nr in topo.into_iter().rev() {
            let i = nr.index;
            let mut cycle = self.ub[i];
            for &user in self.users[i].iter() {
                cycle = cycle.min(self.ub[user]);
            }
            let mut exit = 0i64;
            for &user in self.users[i].iter() {
                if self.ub[user] == cycle {
                    exit = exit.max(self.ub_delay[user]);
                }
            }
            let mut total = exit + self.delays[i];
            if total > self.clock_period_ps && exit > 0 {
                cycle -= 1;
                total = self.delays[i];
            }
            self.ub[i] = cycle;
            self.ub_delay[i] = total;
            if self.lb[i] > self.ub[i] {
                return Err(Status::ResourceExhausted(format!(
                    "node {}: propagated upper bound {} undercuts lower bound {}",
                    i, self.ub[i], self.lb[i]
                )));
            }
        }
        Ok(())
    }

    pub fn to_string(&self, f: &Fn) -> String {
        let mut out = String::new();
        for nr in self.topo.iter() {
            out.push_str(&format!(
                "{}: [{}, {}]\n",
                actsynth_ir::ir::node_textual_id(f, *nr),
                self.lb[nr.index],
                self.ub[nr.index]
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delay_model::StandardDelayEstimator;
    use actsynth_ir::ir_builder::FunctionBuilder;

    /// A chain of four unit-delay ops at period 1 needs four cycles.
    #[test]
    fn chain_lower_bounds_respect_period() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let n1 = fb.not(a, None).unwrap();
        let n2 = fb.not(n1, None).unwrap();
        let n3 = fb.not(n2, None).unwrap();
        let n4 = fb.not(n3, None).unwrap();
        let f = fb.build_with_return_value(n4).unwrap();

        let mut bounds = ScheduleBounds::new(&f, 1, &StandardDelayEstimator).unwrap();
        bounds.propagate_lower_bounds().unwrap();
        assert_eq!(bounds.lb(n1.node_ref()), 0);
        assert_eq!(bounds.lb(n2.node_ref()), 1);
        assert_eq!(bounds.lb(n3.node_ref()), 2);
        assert_eq!(bounds.lb(n4.node_ref()), 3);
        assert_eq!(bounds.max_lower_bound(), 3);
    }

    #[test]
    fn wide_period_fits_in_one_cycle() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let n1 = fb.not(a, None).unwrap();
        let n2 = fb.not(n1, None).unwrap();
        let f = fb.build_with_return_value(n2).unwrap();

        let mut bounds = ScheduleBounds::new(&f, 10, &StandardDelayEstimator).unwrap();
        bounds.propagate_lower_bounds().unwrap();
        assert_eq!(bounds.max_lower_bound(), 0);
    }

    #[test]
    fn upper_bounds_tighten_backward() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let n1 = fb.not(a, None).unwrap();
        let n2 = fb.not(n1, None).unwrap();
        let f = fb.build_with_return_value(n2).unwrap();

        let mut bounds = ScheduleBounds::new(&f, 1, &StandardDelayEstimator).unwrap();
        bounds.propagate_lower_bounds().unwrap();
        for nr in f.node_refs() {
            bounds.tighten_node_ub(nr, 1).unwrap();
        }
        bounds.propagate_upper_bounds().unwrap();
        // n2 at cycle <= 1, so n1 must be at cycle <= 0 under period 1.
        assert_eq!(bounds.ub(n1.node_ref()), 0);
    }

    #[test]
    fn crossing_bounds_is_resource_exhausted() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let n1 = fb.not(a, None).unwrap();
        let n2 = fb.not(n1, None).unwrap();
        let n3 = fb.not(n2, None).unwrap();
        let f = fb.build_with_return_value(n3).unwrap();

        let mut bounds = ScheduleBounds::new(&f, 1, &StandardDelayEstimator).unwrap();
        bounds.propagate_lower_bounds().unwrap();
        // Three dependent unit ops cannot fit in 2 cycles at period 1.
        let err = (|| -> StatusResult<()> {
            for nr in f.node_refs() {
                bounds.tighten_node_ub(nr, 1)?;
            }
            bounds.propagate_upper_bounds()
        })();
        assert!(matches!(err, Err(Status::ResourceExhausted(_))));
    }
}
