// SPDX-License-Identifier: Apache-2.0

//! Pipeline scheduling: assigns every IR node to a cycle subject to the
//! clock-period constraint, minimizing interior pipeline register bits.
//!
//! Three strategies are provided: a min-cut heuristic over boundary
//! orderings, an SDC formulation solved as an LP (the constraint matrix is
//! totally unimodular, so the relaxation is integral), and plain ASAP.
//!
//! References for the SDC formulation:
//! - Cong, Zhang: "An efficient and versatile scheduling algorithm based on
//!   SDC formulation", DAC 2006.
//! - Zhang, Liu: "SDC-based modulo scheduling for pipeline synthesis",
//!   ICCAD 2013.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use actsynth_common::binary_search::binary_search_min_true;
use actsynth_common::status::{Status, StatusResult};
use actsynth_ir::ir::{Fn, NodePayload, NodeRef};
use actsynth_ir::ir_utils::{compute_users, get_topological, operands};
use serde::{Deserialize, Serialize};

use crate::delay_model::{DelayEstimator, DelayEstimatorWithInputDelay};
use crate::function_partition::min_cost_partition;
use crate::schedule_bounds::ScheduleBounds;

pub type ScheduleCycleMap = HashMap<NodeRef, i64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingStrategy {
    /// Min-cut over several boundary orderings.
    MinimizeRegisters,
    /// System-of-difference-constraints LP.
    MinimizeRegistersSdc,
    /// Every node at its lower bound.
    Asap,
}

#[derive(Debug, Clone)]
pub struct SchedulingOptions {
    pub strategy: SchedulingStrategy,
    pub clock_period_ps: Option<i64>,
    pub pipeline_stages: Option<i64>,
    pub clock_margin_percent: Option<i64>,
    pub period_relaxation_percent: Option<i64>,
    pub additional_input_delay_ps: Option<i64>,
    /// Wall-clock budget for a single LP solve; exceeding it falls back to
    /// min-cut.
    pub sdc_time_budget: Duration,
}

impl SchedulingOptions {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        SchedulingOptions {
            strategy,
            clock_period_ps: None,
            pipeline_stages: None,
            clock_margin_percent: None,
            period_relaxation_percent: None,
            additional_input_delay_ps: None,
            sdc_time_budget: Duration::from_secs(200),
        }
    }

    pub fn clock_period_ps(mut self, ps: i64) -> Self {
        self.clock_period_ps = Some(ps);
        self
    }

    pub fn pipeline_stages(mut self, stages: i64) -> Self {
        self.pipeline_stages = Some(stages);
        self
    }
}

/// True for nodes with implicit uses: the function output and side-effecting
/// operations.
fn has_implicit_use(f: &Fn, node: NodeRef) -> bool {
    f.ret_node_ref == Some(node) || f.get_node(node).payload.is_side_effecting()
}

/// Nodes which must be scheduled in the first pipeline stage: parameters and
/// receives.
fn first_stage_nodes(f: &Fn) -> Vec<NodeRef> {
    f.nodes
        .iter()
        .enumerate()
        .filter_map(|(i, n)| {
            matches!(
                n.payload,
                NodePayload::GetParam(_) | NodePayload::Receive { .. }
            )
            .then_some(NodeRef { index: i })
        })
        .collect()
}

/// Nodes which must be scheduled in the final stage: the return value (unless
/// it is a parameter, which pins it to the first stage instead) and sends.
fn final_stage_nodes(f: &Fn) -> Vec<NodeRef> {
    let mut nodes: Vec<NodeRef> = f
        .nodes
        .iter()
        .enumerate()
        .filter_map(|(i, n)| {
            matches!(n.payload, NodePayload::Send { .. }).then_some(NodeRef { index: i })
        })
        .collect();
    if let Some(ret) = f.ret_node_ref {
        if !matches!(f.get_node(ret).payload, NodePayload::GetParam(_)) && !nodes.contains(&ret) {
            nodes.push(ret);
        }
    }
    nodes
}

/// Constructs bounds for scheduling `f` at the given clock period. With a
/// `schedule_length`, the maximum upper bound is `schedule_length - 1`;
/// otherwise it is the maximum lower bound.
fn construct_bounds(
    f: &Fn,
    clock_period_ps: i64,
    schedule_length: Option<i64>,
    estimator: &dyn DelayEstimator,
) -> StatusResult<ScheduleBounds> {
    let mut bounds = ScheduleBounds::new(f, clock_period_ps, estimator)?;
    bounds.propagate_lower_bounds()?;

    let upper_bound = match schedule_length {
        Some(length) => {
            if length <= bounds.max_lower_bound() {
                return Err(Status::ResourceExhausted(format!(
                    "cannot be scheduled in {} stages; computed lower bound is {}",
                    length,
                    bounds.max_lower_bound() + 1
                )));
            }
            length - 1
        }
        None => bounds.max_lower_bound(),
    };

    // Pin final-stage nodes down to the last cycle.
    let users = compute_users(f);
    let mut rerun_lb_propagation = false;
    for node in final_stage_nodes(f) {
        if bounds.lb(node) != upper_bound {
            bounds.tighten_node_lb(node, upper_bound)?;
            if !users.get(&node).map(|u| u.is_empty()).unwrap_or(true) {
                rerun_lb_propagation = true;
            }
        }
    }
    if rerun_lb_propagation {
        bounds.propagate_lower_bounds()?;
    }
    if bounds.max_lower_bound() > upper_bound {
        return Err(Status::ResourceExhausted(format!(
            "impossible to schedule function '{}'; the node(s) pinned to the final cycle \
             cannot be placed there because of their users",
            f.name
        )));
    }

    for node in f.node_refs() {
        bounds.tighten_node_ub(node, upper_bound)?;
    }
    for node in first_stage_nodes(f) {
        if bounds.lb(node) > 0 {
            return Err(Status::ResourceExhausted(format!(
                "impossible to schedule function '{}'; node '{}' must be in the first cycle \
                 but its operands forbid it",
                f.name,
                actsynth_ir::ir::node_textual_id(f, node)
            )));
        }
        bounds.tighten_node_ub(node, 0)?;
    }
    bounds.propagate_upper_bounds()?;

    Ok(bounds)
}

/// Delay-weighted critical path of the whole function.
pub fn compute_critical_path(f: &Fn, estimator: &dyn DelayEstimator) -> StatusResult<i64> {
    let mut node_cp: HashMap<NodeRef, i64> = HashMap::new();
    let mut function_cp = 0i64;
    for node in get_topological(f) {
        let mut start = 0i64;
        for operand in operands(&f.get_node(node).payload) {
            start = start.max(*node_cp.get(&operand).unwrap_or(&0));
        }
        let delay = estimator.operation_delay_ps(f, node)?;
        node_cp.insert(node, start + delay);
        function_cp = function_cp.max(start + delay);
    }
    Ok(function_cp)
}

/// Minimum clock period at which the function fits in `pipeline_stages`
/// stages, by binary search over `[ceil(cp / stages), cp]`.
fn find_minimum_clock_period(
    f: &Fn,
    pipeline_stages: i64,
    estimator: &dyn DelayEstimator,
) -> StatusResult<i64> {
    let function_cp = compute_critical_path(f, estimator)?;
    let search_start = (function_cp + pipeline_stages - 1) / pipeline_stages;
    let search_end = function_cp;
    log::debug!(
        "binary searching for the minimum clock period over [{}, {}]",
        search_start,
        search_end
    );
    let min_period = binary_search_min_true(search_start.max(1), search_end.max(1), |period| {
        match construct_bounds(f, period, None, estimator) {
            Ok(bounds) => Ok(bounds.max_lower_bound() < pipeline_stages),
            Err(_) => Ok(false),
        }
    })
    .map_err(|_| {
        Status::ResourceExhausted(format!(
            "no clock period in [{}, {}] schedules '{}' into {} stages",
            search_start, search_end, f.name, pipeline_stages
        ))
    })?;
    log::debug!("minimum clock period = {}", min_period);
    Ok(min_period)
}

/// Middle element first, then recursively the intervals on either side.
fn middle_first_order(first: i64, last: i64) -> Vec<i64> {
    if first == last {
        return vec![first];
    }
    if first == last - 1 {
        return vec![first, last];
    }
    let middle = (first + last) / 2;
    let mut ret = vec![middle];
    if middle > first {
        ret.extend(middle_first_order(first, middle - 1));
    }
    ret.extend(middle_first_order(middle + 1, last));
    ret
}

/// Boundary orderings tried by the min-cut strategy: forward, reverse, and
/// middle-first for lengths above two.
pub fn get_min_cut_cycle_orders(length: i64) -> Vec<Vec<i64>> {
    if length == 0 {
        return vec![vec![]];
    }
    if length == 1 {
        return vec![vec![0]];
    }
    if length == 2 {
        return vec![vec![0, 1], vec![1, 0]];
    }
    let forward: Vec<i64> = (0..length).collect();
    let reverse: Vec<i64> = (0..length).rev().collect();
    vec![forward, reverse, middle_first_order(0, length - 1)]
}

/// Splits the nodes spanning the boundary between `cycle` and `cycle + 1` by
/// a minimum-cost cut, then tightens the bounds accordingly. Upon return no
/// node has a range spanning both cycles.
fn split_after_cycle(f: &Fn, cycle: i64, bounds: &mut ScheduleBounds) -> StatusResult<()> {
    log::debug!("splitting after cycle {}", cycle);
    let partitionable: Vec<NodeRef> = f
        .node_refs()
        .into_iter()
        .filter(|n| bounds.lb(*n) <= cycle && bounds.ub(*n) >= cycle + 1)
        .collect();

    // Neighbors already fixed on one side drag spanning nodes with them.
    let partitionable_set: HashSet<NodeRef> = partitionable.iter().copied().collect();
    let users = compute_users(f);
    let mut forced_before: HashSet<NodeRef> = HashSet::new();
    let forced_after: HashSet<NodeRef> = HashSet::new();
    for node in partitionable.iter() {
        for user in users.get(node).into_iter().flatten() {
            if !partitionable_set.contains(user) && bounds.ub(*user) <= cycle {
                forced_before.insert(*node);
            }
        }
    }

    let (before, after) = min_cost_partition(f, &partitionable, &forced_before, &forced_after);
    for node in before {
        bounds.tighten_node_ub(node, cycle)?;
    }
    for node in after {
        bounds.tighten_node_lb(node, cycle + 1)?;
    }
    Ok(())
}

/// Interior pipeline register bits implied by single-cycle bounds: for every
/// node, its width times the number of boundaries between its definition and
/// its last use.
fn count_interior_pipeline_registers(f: &Fn, bounds: &ScheduleBounds) -> StatusResult<i64> {
    let users = compute_users(f);
    let mut registers = 0i64;
    for node in f.node_refs() {
        if bounds.lb(node) != bounds.ub(node) {
            return Err(Status::Internal(format!(
                "node '{}' has non-singleton range [{}, {}]",
                actsynth_ir::ir::node_textual_id(f, node),
                bounds.lb(node),
                bounds.ub(node)
            )));
        }
        let mut latest_use = bounds.lb(node);
        for user in users.get(&node).into_iter().flatten() {
            latest_use = latest_use.max(bounds.lb(*user));
        }
        registers += f.get_node(node).ty.bit_count() as i64 * (latest_use - bounds.lb(node));
    }
    Ok(registers)
}

/// Min-cut strategy: try several boundary orderings, keep the one with the
/// fewest interior register bits.
fn schedule_to_minimize_registers(
    f: &Fn,
    pipeline_stages: i64,
    bounds: &mut ScheduleBounds,
) -> StatusResult<ScheduleCycleMap> {
    log::debug!(
        "schedule_to_minimize_registers: {} pipeline stages",
        pipeline_stages
    );
    let mut best_register_count = i64::MAX;
    let mut best_bounds: Option<ScheduleBounds> = None;
    for cut_order in get_min_cut_cycle_orders(pipeline_stages - 1) {
        log::debug!("trying cycle order {:?}", cut_order);
        let mut trial_bounds = bounds.clone();
        let mut feasible = true;
        for cycle in cut_order {
            if split_after_cycle(f, cycle, &mut trial_bounds).is_err()
                || trial_bounds.propagate_lower_bounds().is_err()
                || trial_bounds.propagate_upper_bounds().is_err()
            {
                feasible = false;
                break;
            }
        }
        if !feasible {
            continue;
        }
        let trial_register_count = count_interior_pipeline_registers(f, &trial_bounds)?;
        if best_bounds.is_none() || best_register_count > trial_register_count {
            best_bounds = Some(trial_bounds);
            best_register_count = trial_register_count;
        }
    }
    let best = best_bounds.ok_or_else(|| {
        Status::ResourceExhausted(format!(
            "no feasible min-cut partitioning of '{}' into {} stages",
            f.name, pipeline_stages
        ))
    })?;
    *bounds = best;

    let mut cycle_map = ScheduleCycleMap::new();
    for node in f.node_refs() {
        if bounds.lb(node) != bounds.ub(node) {
            return Err(Status::Internal(format!(
                "min-cut left node '{}' unpinned",
                actsynth_ir::ir::node_textual_id(f, node)
            )));
        }
        cycle_map.insert(node, bounds.lb(node));
    }
    Ok(cycle_map)
}

/// Destinations of paths starting at `src` whose combinational delay just
/// exceeds the clock period; the SDC formulation forces a register somewhere
/// on each of them.
fn search_paths_just_exceeding_clock_period(
    f: &Fn,
    src: NodeRef,
    clock_period_ps: i64,
    delay_map: &HashMap<NodeRef, i64>,
    users: &HashMap<NodeRef, HashSet<NodeRef>>,
) -> Vec<NodeRef> {
    let mut result = Vec::new();
    fn dfs(
        node: NodeRef,
        node_start_time: i64,
        clock_period_ps: i64,
        delay_map: &HashMap<NodeRef, i64>,
        users: &HashMap<NodeRef, HashSet<NodeRef>>,
        result: &mut Vec<NodeRef>,
    ) {
        let node_end_time = node_start_time + delay_map[&node];
        if node_end_time > clock_period_ps {
            result.push(node);
            return;
        }
        if let Some(us) = users.get(&node) {
            let mut sorted: Vec<NodeRef> = us.iter().copied().collect();
            sorted.sort();
            for user in sorted {
                dfs(user, node_end_time, clock_period_ps, delay_map, users, result);
            }
        }
    }
    dfs(src, 0, clock_period_ps, delay_map, users, &mut result);
    result
}

/// SDC strategy: cycle and lifetime variables, du-chain and path-length
/// constraints, objective `sum(width * lifetime)`. The LP relaxation is
/// integral; non-integer answers are an internal error.
fn schedule_to_minimize_registers_sdc(
    f: &Fn,
    bounds: &ScheduleBounds,
    clock_period_ps: i64,
    estimator: &dyn DelayEstimator,
) -> StatusResult<ScheduleCycleMap> {
    use microlp::{ComparisonOp, OptimizationDirection, Problem, Variable};

    let mut lp = Problem::new(OptimizationDirection::Minimize);

    let nodes = f.node_refs();
    let mut cycle_var: HashMap<NodeRef, Variable> = HashMap::with_capacity(nodes.len());
    let mut lifetime_var: HashMap<NodeRef, Variable> = HashMap::with_capacity(nodes.len());
    for node in nodes.iter() {
        let width = f.get_node(*node).ty.bit_count() as f64;
        cycle_var.insert(
            *node,
            lp.add_var(0.0, (bounds.lb(*node) as f64, bounds.ub(*node) as f64)),
        );
        // The lifetime carries the objective weight directly.
        lifetime_var.insert(
            *node,
            lp.add_var(width, (0.0, bounds.max_lower_bound() as f64)),
        );
    }
    // An artificial sink representing the consumer of implicitly-used values.
    let cycle_at_sink = lp.add_var(0.0, (0.0, bounds.max_lower_bound() as f64));

    let users = compute_users(f);
    for node in nodes.iter() {
        let cycle_at_node = cycle_var[node];
        let lifetime_at_node = lifetime_var[node];
        let mut add_du_chain_constraints = |cycle_at_user: Variable| {
            // cycle[node] - cycle[user] <= 0
            lp.add_constraint(
                [(cycle_at_node, 1.0), (cycle_at_user, -1.0)].as_slice(),
                ComparisonOp::Le,
                0.0,
            );
            // cycle[user] - cycle[node] - lifetime[node] <= 0
            lp.add_constraint(
                [
                    (cycle_at_user, 1.0),
                    (cycle_at_node, -1.0),
                    (lifetime_at_node, -1.0),
                ]
                .as_slice(),
                ComparisonOp::Le,
                0.0,
            );
        };
        let mut sorted_users: Vec<NodeRef> =
            users.get(node).into_iter().flatten().copied().collect();
        sorted_users.sort();
        for user in sorted_users {
            add_du_chain_constraints(cycle_var[&user]);
        }
        if has_implicit_use(f, *node) {
            add_du_chain_constraints(cycle_at_sink);
        }
    }

    let mut delay_map: HashMap<NodeRef, i64> = HashMap::new();
    for node in nodes.iter() {
        delay_map.insert(*node, estimator.operation_delay_ps(f, *node)?);
    }
    for src in nodes.iter() {
        for dst in
            search_paths_just_exceeding_clock_period(f, *src, clock_period_ps, &delay_map, &users)
        {
            // cycle[dst] - cycle[src] >= 1
            lp.add_constraint(
                [(cycle_var[&dst], 1.0), (cycle_var[src], -1.0)].as_slice(),
                ComparisonOp::Ge,
                1.0,
            );
        }
    }

    let solution = lp
        .solve()
        .map_err(|e| Status::Internal(format!("the SDC problem has no optimal solution: {}", e)))?;

    let mut cycle_map = ScheduleCycleMap::new();
    for node in nodes.iter() {
        let cycle = solution[cycle_var[node]];
        if (cycle - cycle.round()).abs() > 1e-3 {
            return Err(Status::Internal(
                "the scheduling result is expected to be integer".to_string(),
            ));
        }
        cycle_map.insert(*node, cycle.round() as i64);
    }
    Ok(cycle_map)
}

/// A materialized schedule: cycle per node plus the per-cycle node listing.
#[derive(Debug, Clone)]
pub struct PipelineSchedule {
    cycle_map: ScheduleCycleMap,
    cycle_to_nodes: Vec<Vec<NodeRef>>,
}

/// Serializable form of a schedule, for round-tripping through tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineScheduleProto {
    pub function: String,
    pub stages: Vec<StageProto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProto {
    pub stage: i64,
    pub nodes: Vec<String>,
}

impl PipelineSchedule {
    pub fn new(f: &Fn, cycle_map: ScheduleCycleMap, length: Option<i64>) -> Self {
        let mut max_cycle = cycle_map.values().copied().max().unwrap_or(0);
        if let Some(length) = length {
            assert!(length > max_cycle, "schedule length must exceed the last cycle");
            max_cycle = length - 1;
        }
        let mut cycle_to_nodes: Vec<Vec<NodeRef>> = vec![Vec::new(); (max_cycle + 1) as usize];
        for (node, cycle) in cycle_map.iter() {
            cycle_to_nodes[*cycle as usize].push(*node);
        }
        // Nodes within a cycle are kept in topological order.
        let mut topo_index: HashMap<NodeRef, usize> = HashMap::new();
        for (i, node) in get_topological(f).into_iter().enumerate() {
            topo_index.insert(node, i);
        }
        for nodes_in_cycle in cycle_to_nodes.iter_mut() {
            nodes_in_cycle.sort_by_key(|n| topo_index[n]);
        }
        PipelineSchedule {
            cycle_map,
            cycle_to_nodes,
        }
    }

    pub fn length(&self) -> i64 {
        self.cycle_to_nodes.len() as i64
    }

    pub fn cycle(&self, node: NodeRef) -> i64 {
        self.cycle_map[&node]
    }

    pub fn is_scheduled(&self, node: NodeRef) -> bool {
        self.cycle_map.contains_key(&node)
    }

    pub fn cycle_map(&self) -> &ScheduleCycleMap {
        &self.cycle_map
    }

    pub fn nodes_in_cycle(&self, cycle: i64) -> &[NodeRef] {
        static EMPTY: Vec<NodeRef> = Vec::new();
        self.cycle_to_nodes
            .get(cycle as usize)
            .map(|v| v.as_slice())
            .unwrap_or(&EMPTY)
    }

    /// Nodes defined at or before cycle `c` whose value is consumed after it.
    pub fn get_live_out_of_cycle(&self, f: &Fn, c: i64) -> Vec<NodeRef> {
        let users = compute_users(f);
        let mut live_out = Vec::new();
        for i in 0..=c {
            for node in self.nodes_in_cycle(i) {
                let implicit = has_implicit_use(f, *node) && c < self.length() - 1;
                let used_later = users
                    .get(node)
                    .into_iter()
                    .flatten()
                    .any(|u| self.cycle(*u) > c);
                if implicit || used_later {
                    live_out.push(*node);
                }
            }
        }
        live_out
    }

    /// Runs the scheduler per the options.
    pub fn run(
        f: &Fn,
        estimator: &dyn DelayEstimator,
        options: &SchedulingOptions,
    ) -> StatusResult<PipelineSchedule> {
        let input_delay = options.additional_input_delay_ps.unwrap_or(0);
        let estimator = DelayEstimatorWithInputDelay::new(estimator, input_delay);

        let clock_period_ps = match options.clock_period_ps {
            Some(mut period) => {
                if let Some(margin) = options.clock_margin_percent {
                    let original = period;
                    period -= (period * margin + 50) / 100;
                    if period <= 0 {
                        return Err(Status::InvalidArgument(format!(
                            "clock period non-positive ({}ps) after adjusting for margin; \
                             original clock period: {}ps, clock margin: {}%",
                            period, original, margin
                        )));
                    }
                }
                period
            }
            None => {
                let stages = options.pipeline_stages.ok_or_else(|| {
                    Status::InvalidArgument(
                        "either clock_period_ps or pipeline_stages is required".to_string(),
                    )
                })?;
                let mut period = find_minimum_clock_period(f, stages, &estimator)?;
                if let Some(relaxation) = options.period_relaxation_percent {
                    period += (period * relaxation + 50) / 100;
                }
                period
            }
        };

        let mut bounds =
            construct_bounds(f, clock_period_ps, options.pipeline_stages, &estimator)?;
        let schedule_length = bounds.max_lower_bound() + 1;

        let cycle_map = match options.strategy {
            SchedulingStrategy::MinimizeRegisters => {
                schedule_to_minimize_registers(f, schedule_length, &mut bounds)?
            }
            SchedulingStrategy::MinimizeRegistersSdc => {
                let started = Instant::now();
                let result =
                    schedule_to_minimize_registers_sdc(f, &bounds, clock_period_ps, &estimator);
                if started.elapsed() > options.sdc_time_budget {
                    log::warn!(
                        "SDC solve exceeded its {}s budget; falling back to min-cut",
                        options.sdc_time_budget.as_secs()
                    );
                    schedule_to_minimize_registers(f, schedule_length, &mut bounds)?
                } else {
                    result?
                }
            }
            SchedulingStrategy::Asap => {
                if options.pipeline_stages.is_some() {
                    return Err(Status::InvalidArgument(
                        "ASAP scheduling does not accept a pipeline_stages constraint".to_string(),
                    ));
                }
                let mut cycle_map = ScheduleCycleMap::new();
                for node in f.node_refs() {
                    cycle_map.insert(node, bounds.lb(node));
                }
                cycle_map
            }
        };

        let schedule = PipelineSchedule::new(f, cycle_map, options.pipeline_stages);
        schedule.verify(f)?;
        schedule.verify_timing(f, clock_period_ps, &estimator)?;
        log::debug!("schedule:\n{}", schedule.to_string_with(f));
        Ok(schedule)
    }

    /// Structural checks: everything scheduled, dataflow edges non-decreasing
    /// in cycle.
    pub fn verify(&self, f: &Fn) -> StatusResult<()> {
        for node in f.node_refs() {
            if !self.is_scheduled(node) {
                return Err(Status::Internal(format!(
                    "node '{}' was not scheduled",
                    actsynth_ir::ir::node_textual_id(f, node)
                )));
            }
        }
        for node in f.node_refs() {
            for operand in operands(&f.get_node(node).payload) {
                if self.cycle(operand) > self.cycle(node) {
                    return Err(Status::Internal(format!(
                        "node '{}' is scheduled before its operand '{}'",
                        actsynth_ir::ir::node_textual_id(f, node),
                        actsynth_ir::ir::node_textual_id(f, operand)
                    )));
                }
            }
        }
        Ok(())
    }

    /// Re-walks the graph checking that no intra-stage combinational path
    /// exceeds the clock period; reports the longest failing path.
    pub fn verify_timing(
        &self,
        f: &Fn,
        clock_period_ps: i64,
        estimator: &dyn DelayEstimator,
    ) -> StatusResult<()> {
        // Critical path from the start of a node's cycle through the node.
        let mut node_cp: HashMap<NodeRef, i64> = HashMap::new();
        let mut cp_pred: HashMap<NodeRef, Option<NodeRef>> = HashMap::new();
        let mut max_cp_node: Option<NodeRef> = None;
        for node in get_topological(f) {
            let mut cp_to_node_start = 0i64;
            cp_pred.insert(node, None);
            for operand in operands(&f.get_node(node).payload) {
                if self.cycle(operand) == self.cycle(node)
                    && cp_to_node_start < node_cp[&operand]
                {
                    cp_to_node_start = node_cp[&operand];
                    cp_pred.insert(node, Some(operand));
                }
            }
            let node_delay = estimator.operation_delay_ps(f, node)?;
            node_cp.insert(node, cp_to_node_start + node_delay);
            if max_cp_node.is_none() || node_cp[&node] > node_cp[&max_cp_node.unwrap()] {
                max_cp_node = Some(node);
            }
        }

        let Some(max_node) = max_cp_node else {
            return Ok(());
        };
        if node_cp[&max_node] > clock_period_ps {
            let mut path = Vec::new();
            let mut cursor = Some(max_node);
            while let Some(node) = cursor {
                path.push(node);
                cursor = cp_pred[&node];
            }
            path.reverse();
            let path_str = path
                .iter()
                .map(|n| {
                    format!(
                        "{} ({}ps)",
                        actsynth_ir::ir::node_textual_id(f, *n),
                        estimator.operation_delay_ps(f, *n).unwrap_or(0)
                    )
                })
                .collect::<Vec<String>>()
                .join(" -> ");
            return Err(Status::Internal(format!(
                "schedule does not meet timing ({}ps); longest failing path ({}ps): {}",
                clock_period_ps, node_cp[&max_node], path_str
            )));
        }
        Ok(())
    }

    /// Interior pipeline register bits of the final schedule.
    pub fn count_final_interior_pipeline_registers(&self, f: &Fn) -> i64 {
        let users = compute_users(f);
        let mut reg_count = 0i64;
        for stage in 0..self.length() {
            for node in f.node_refs() {
                if self.cycle(node) > stage {
                    continue;
                }
                if stage == self.length() - 1 {
                    continue;
                }
                let is_ret = f.ret_node_ref == Some(node);
                let used_later = users
                    .get(&node)
                    .into_iter()
                    .flatten()
                    .any(|u| self.cycle(*u) > stage);
                if is_ret || used_later {
                    reg_count += f.get_node(node).ty.bit_count() as i64;
                }
            }
        }
        reg_count
    }

    pub fn to_string_with(&self, f: &Fn) -> String {
        let mut result = String::new();
        for cycle in 0..self.length() {
            result.push_str(&format!("cycle {}:\n", cycle));
            for node in self.nodes_in_cycle(cycle) {
                if let Some(line) = f.get_node(*node).to_string(f) {
                    result.push_str(&format!("  {}\n", line));
                }
            }
        }
        result
    }

    pub fn to_proto(&self, f: &Fn) -> PipelineScheduleProto {
        let mut stages = Vec::new();
        for cycle in 0..self.length() {
            stages.push(StageProto {
                stage: cycle,
                nodes: self
                    .nodes_in_cycle(cycle)
                    .iter()
                    .map(|n| actsynth_ir::ir::node_textual_id(f, *n))
                    .collect(),
            });
        }
        PipelineScheduleProto {
            function: f.name.clone(),
            stages,
        }
    }

    pub fn from_proto(f: &Fn, proto: &PipelineScheduleProto) -> StatusResult<PipelineSchedule> {
        let mut name_to_ref: HashMap<String, NodeRef> = HashMap::new();
        for node in f.node_refs() {
            name_to_ref.insert(actsynth_ir::ir::node_textual_id(f, node), node);
        }
        let mut cycle_map = ScheduleCycleMap::new();
        for stage in proto.stages.iter() {
            for node_name in stage.nodes.iter() {
                let node = name_to_ref.get(node_name).ok_or_else(|| {
                    Status::NotFound(format!(
                        "schedule references unknown node '{}'",
                        node_name
                    ))
                })?;
                cycle_map.insert(*node, stage.stage);
            }
        }
        Ok(PipelineSchedule::new(f, cycle_map, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delay_model::StandardDelayEstimator;
    use actsynth_ir::ir_builder::{BValue, FunctionBuilder};

    fn not_chain(len: usize) -> (Fn, Vec<BValue>) {
        let mut fb = FunctionBuilder::new("chain");
        let a = fb.param("a", 8);
        let mut values = vec![a];
        let mut cur = a;
        for _ in 0..len {
            cur = fb.not(cur, None).unwrap();
            values.push(cur);
        }
        (fb.build_with_return_value(cur).unwrap(), values)
    }

    #[test]
    fn asap_trivial_param_schedules_in_one_stage() {
        let mut fb = FunctionBuilder::new("f");
        let x = fb.param("x", 32);
        let f = fb.build_with_return_value(x).unwrap();
        let options = SchedulingOptions::new(SchedulingStrategy::Asap).clock_period_ps(2);
        let schedule = PipelineSchedule::run(&f, &StandardDelayEstimator, &options).unwrap();
        assert_eq!(schedule.length(), 1);
    }

    #[test]
    fn chain_splits_across_stages_at_tight_period() {
        let (f, values) = not_chain(4);
        let options = SchedulingOptions::new(SchedulingStrategy::MinimizeRegisters)
            .clock_period_ps(1)
            .pipeline_stages(4);
        let schedule = PipelineSchedule::run(&f, &StandardDelayEstimator, &options).unwrap();
        assert_eq!(schedule.length(), 4);
        // Each not lands in its own stage.
        for (i, v) in values.iter().skip(1).enumerate() {
            assert_eq!(schedule.cycle(v.node_ref()), i as i64);
        }
        schedule
            .verify_timing(&f, 1, &StandardDelayEstimator)
            .unwrap();
    }

    #[test]
    fn infeasible_stage_count_names_lower_bound() {
        // Four chained unit-delay ops cannot fit in 2 stages at period 1.
        let (f, _) = not_chain(4);
        let options = SchedulingOptions::new(SchedulingStrategy::MinimizeRegisters)
            .clock_period_ps(1)
            .pipeline_stages(2);
        let err = PipelineSchedule::run(&f, &StandardDelayEstimator, &options).unwrap_err();
        match err {
            Status::ResourceExhausted(msg) => {
                assert!(msg.contains("lower bound is 4"), "message: {}", msg);
            }
            other => panic!("expected ResourceExhausted, got {:?}", other),
        }
    }

    #[test]
    fn minimum_clock_period_search() {
        let (f, _) = not_chain(4);
        // 4 unit delays over 2 stages need a period of 2.
        let options =
            SchedulingOptions::new(SchedulingStrategy::MinimizeRegisters).pipeline_stages(2);
        let schedule = PipelineSchedule::run(&f, &StandardDelayEstimator, &options).unwrap();
        assert_eq!(schedule.length(), 2);
        schedule
            .verify_timing(&f, 2, &StandardDelayEstimator)
            .unwrap();
    }

    /// Fan-out-then-fan-in DAG scheduled into 2 stages: SDC's interior
    /// register count never exceeds min-cut's, and both meet timing.
    #[test]
    fn sdc_beats_or_matches_min_cut() {
        let mut fb = FunctionBuilder::new("diamond");
        let a = fb.param("a", 8);
        let x1 = fb.not(a, Some("x1")).unwrap();
        let x2 = fb.not(a, Some("x2")).unwrap();
        let x3 = fb.not(a, Some("x3")).unwrap();
        let y1 = fb.not(x1, Some("y1")).unwrap();
        let y2 = fb.not(x2, Some("y2")).unwrap();
        let y3 = fb.not(x3, Some("y3")).unwrap();
        let z1 = fb.and(&[y1, y2], Some("z1")).unwrap();
        let z2 = fb.and(&[z1, y3], Some("z2")).unwrap();
        let f = fb.build_with_return_value(z2).unwrap();

        let mincut_options = SchedulingOptions::new(SchedulingStrategy::MinimizeRegisters)
            .clock_period_ps(2)
            .pipeline_stages(2);
        let mincut = PipelineSchedule::run(&f, &StandardDelayEstimator, &mincut_options).unwrap();

        let sdc_options = SchedulingOptions::new(SchedulingStrategy::MinimizeRegistersSdc)
            .clock_period_ps(2)
            .pipeline_stages(2);
        let sdc = PipelineSchedule::run(&f, &StandardDelayEstimator, &sdc_options).unwrap();

        let mincut_regs = mincut.count_final_interior_pipeline_registers(&f);
        let sdc_regs = sdc.count_final_interior_pipeline_registers(&f);
        assert!(
            sdc_regs <= mincut_regs,
            "sdc = {} bits, min-cut = {} bits",
            sdc_regs,
            mincut_regs
        );

        mincut.verify_timing(&f, 2, &StandardDelayEstimator).unwrap();
        sdc.verify_timing(&f, 2, &StandardDelayEstimator).unwrap();
    }

    #[test]
    fn schedule_proto_round_trip() {
        let (f, _) = not_chain(4);
        let options = SchedulingOptions::new(SchedulingStrategy::MinimizeRegisters)
            .clock_period_ps(1)
            .pipeline_stages(4);
        let schedule = PipelineSchedule::run(&f, &StandardDelayEstimator, &options).unwrap();

        let proto = schedule.to_proto(&f);
        let json = serde_json::to_string(&proto).unwrap();
        let parsed: PipelineScheduleProto = serde_json::from_str(&json).unwrap();
        let restored = PipelineSchedule::from_proto(&f, &parsed).unwrap();
        assert_eq!(schedule.cycle_map(), restored.cycle_map());
    }

    #[test]
    fn cut_orders_cover_forward_reverse_middle() {
        assert_eq!(get_min_cut_cycle_orders(0), vec![Vec::<i64>::new()]);
        assert_eq!(get_min_cut_cycle_orders(1), vec![vec![0]]);
        assert_eq!(get_min_cut_cycle_orders(2), vec![vec![0, 1], vec![1, 0]]);
        let orders = get_min_cut_cycle_orders(5);
        assert_eq!(orders.len(), 3);
        assert_eq!(orders[0], vec![0, 1, 2, 3, 4]);
        assert_eq!(orders[1], vec![4, 3, 2, 1, 0]);
        // Middle-first starts at the middle and covers everything once.
        assert_eq!(orders[2][0], 2);
        let mut sorted = orders[2].clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn receives_pin_to_first_stage_and_sends_to_last() {
        let mut fb = FunctionBuilder::new("proc_like");
        let rx = fb.receive("in_ch", 8, Some("rx"));
        let n1 = fb.not(rx, None).unwrap();
        let n2 = fb.not(n1, None).unwrap();
        let _tx = fb.send("out_ch", n2, Some("tx"));
        let f = fb.build_with_return_value(n2).unwrap();

        let options = SchedulingOptions::new(SchedulingStrategy::MinimizeRegisters)
            .clock_period_ps(1)
            .pipeline_stages(3);
        let schedule = PipelineSchedule::run(&f, &StandardDelayEstimator, &options).unwrap();
        assert_eq!(schedule.cycle(rx.node_ref()), 0);
        let tx_node = f
            .node_refs()
            .into_iter()
            .find(|n| matches!(f.get_node(*n).payload, NodePayload::Send { .. }))
            .unwrap();
        assert_eq!(schedule.cycle(tx_node), schedule.length() - 1);
    }

    #[test]
    fn live_out_tracks_cross_stage_values() {
        let (f, values) = not_chain(2);
        let mut cycle_map = ScheduleCycleMap::new();
        for node in f.node_refs() {
            cycle_map.insert(node, 0);
        }
        cycle_map.insert(values[2].node_ref(), 1);
        let schedule = PipelineSchedule::new(&f, cycle_map, None);
        let live = schedule.get_live_out_of_cycle(&f, 0);
        assert!(live.contains(&values[1].node_ref()));
    }
}
