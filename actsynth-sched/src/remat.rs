// SPDX-License-Identifier: Apache-2.0

//! Schedule-aware rematerialization.
//!
//! For each node fed from an earlier pipeline stage, propose cloning the
//! feeding computation into the consumer's stage. A proposal survives when
//! the clone fits within the stage's slack and the register-width saving
//! exceeds the clone's area cost; a submodular minimizer chooses the final
//! subset and DCE reclaims the rejected clones. The schedule is updated in
//! place.

use std::collections::{HashMap, HashSet};

use actsynth_common::status::StatusResult;
use actsynth_common::submodular::{MinimizeOptions, SetFunction};
use actsynth_ir::cse::run_cse;
use actsynth_ir::dce::get_dead_nodes;
use actsynth_ir::ir::{Fn, Node, NodePayload, NodeRef};
use actsynth_ir::ir_utils::{compute_users, get_topological, operands, remap_payload_with};

use crate::delay_model::DelayEstimator;
use crate::pipeline_schedule::ScheduleCycleMap;

const AREA_PER_FLOP: f64 = 10.0;

fn number_of_pipeline_stages(schedule: &ScheduleCycleMap) -> i64 {
    schedule.values().copied().max().map_or(0, |m| m + 1)
}

/// Stage -> nodes, the inverse of the cycle map.
type InverseSchedule = Vec<HashSet<NodeRef>>;

fn invert_schedule(schedule: &ScheduleCycleMap) -> InverseSchedule {
    let mut result: InverseSchedule = Vec::new();
    result.resize(number_of_pipeline_stages(schedule) as usize, HashSet::new());
    for (node, stage) in schedule.iter() {
        result[*stage as usize].insert(*node);
    }
    result
}

type Delay = i64;

/// For every pair of nodes with a path between them, the delay of the
/// longest such path (inclusive of both endpoints).
type LongestPathLength = HashMap<NodeRef, HashMap<NodeRef, Delay>>;

fn longest_node_paths(
    f: &Fn,
    estimator: &dyn DelayEstimator,
) -> StatusResult<LongestPathLength> {
    let mut delay_map: HashMap<NodeRef, Delay> = HashMap::new();
    for node in get_topological(f) {
        delay_map.insert(node, estimator.operation_delay_ps(f, node)?);
    }

    let mut result: LongestPathLength = HashMap::new();
    for node in get_topological(f) {
        result.insert(node, HashMap::from([(node, delay_map[&node])]));
    }
    for node in get_topological(f) {
        let deps = operands(&f.get_node(node).payload);
        for targets in result.values_mut() {
            let mut best: Option<Delay> = None;
            for operand in deps.iter() {
                if let Some(through) = targets.get(operand) {
                    let candidate = through + delay_map[&node];
                    best = Some(best.map_or(candidate, |b: Delay| b.max(candidate)));
                }
            }
            if let Some(new_delay) = best {
                let entry = targets.entry(node).or_insert(new_delay);
                *entry = (*entry).max(new_delay);
            }
        }
    }
    Ok(result)
}

#[derive(Debug, Clone, Copy)]
struct Slack {
    /// Longest-path delay from this node to a stage exit, excluding the
    /// node's own delay.
    longest_path_out_of: Delay,
    /// Stage critical path minus the longest path through this node.
    #[allow(dead_code)]
    slack: Delay,
    stage_critical_path: Delay,
}

fn compute_slack(
    f: &Fn,
    inverse_schedule: &InverseSchedule,
    longest: &LongestPathLength,
) -> HashMap<NodeRef, Slack> {
    let users_map = compute_users(f);
    let mut slack: HashMap<NodeRef, Slack> = HashMap::new();

    for stage_nodes in inverse_schedule.iter() {
        let mut entry_nodes: HashSet<NodeRef> = HashSet::new();
        let mut exit_nodes: HashSet<NodeRef> = HashSet::new();
        for node in stage_nodes.iter() {
            let ops = operands(&f.get_node(*node).payload);
            if ops.iter().all(|n| !stage_nodes.contains(n)) {
                entry_nodes.insert(*node);
            }
            let users = users_map.get(node).cloned().unwrap_or_default();
            let is_implicit_sink = users.is_empty()
                && (f.ret_node_ref == Some(*node) || f.get_node(*node).payload.is_side_effecting());
            if is_implicit_sink || (!users.is_empty() && users.iter().all(|n| !stage_nodes.contains(n)))
            {
                exit_nodes.insert(*node);
            }
        }

        let mut stage_critical_length = 0i64;
        for entry in entry_nodes.iter() {
            for exit in exit_nodes.iter() {
                if let Some(d) = longest.get(entry).and_then(|t| t.get(exit)) {
                    stage_critical_length = stage_critical_length.max(*d);
                }
            }
        }

        for node in stage_nodes.iter() {
            let mut path_exists = false;
            let mut entry_to_node_max = 0i64;
            for entry in entry_nodes.iter() {
                if let Some(d) = longest.get(entry).and_then(|t| t.get(node)) {
                    entry_to_node_max = entry_to_node_max.max(*d);
                    path_exists = true;
                }
            }
            let mut node_to_exit_max = 0i64;
            for exit in exit_nodes.iter() {
                if let Some(d) = longest.get(node).and_then(|t| t.get(exit)) {
                    node_to_exit_max = node_to_exit_max.max(*d);
                    path_exists = true;
                }
            }
            if !path_exists {
                // Dead nodes have no entry/exit path.
                continue;
            }
            let node_delay = longest[node][node];
            let entry_to_node = entry_to_node_max - node_delay;
            let node_to_exit = (node_to_exit_max - node_delay).max(0);
            let through = entry_to_node.max(0) + node_delay + node_to_exit;
            slack.insert(
                *node,
                Slack {
                    longest_path_out_of: node_to_exit,
                    slack: stage_critical_length - through,
                    stage_critical_path: stage_critical_length,
                },
            );
        }
    }

    slack
}

/// An opportunity for rematerialization: a node fed across a stage boundary
/// and a dead clone of it whose cross-stage inputs were recomputed in the
/// node's own stage.
#[derive(Debug, Clone, Copy, PartialEq)]
struct RematOpportunity {
    to_rematerialize: NodeRef,
    rematerialization: NodeRef,
    /// Register bits saved by applying the opportunity, scaled to area; does
    /// not include the cost of the added nodes.
    quality: f64,
}

/// Largest contiguous set of `dead` nodes feeding `node` such that every path
/// from a member to `node` touches only dead nodes.
fn compute_dead_node_chunk(f: &Fn, dead: &HashSet<NodeRef>, node: NodeRef) -> HashSet<NodeRef> {
    let mut stack = vec![node];
    let mut discovered: HashSet<NodeRef> = HashSet::new();
    while let Some(popped) = stack.pop() {
        if dead.contains(&popped) && !discovered.contains(&popped) {
            discovered.insert(popped);
            for child in operands(&f.get_node(popped).payload) {
                stack.push(child);
            }
        }
    }
    discovered
}

/// Proposes the maximal rematerialization at `target`: clone every incoming
/// cross-stage chunk into the target's stage.
fn find_opportunity_at_node(
    f: &mut Fn,
    target: NodeRef,
    schedule: &mut ScheduleCycleMap,
    inverse_schedule: &InverseSchedule,
    next_text_id: &mut usize,
) -> Option<RematOpportunity> {
    let target_stage = schedule[&target];
    // A value is available to the clone when it is computed in the target's
    // stage, or when it is registered into that stage anyway because some
    // consumer other than the target lives at or beyond it.
    let users_map = compute_users(f);
    let mut available: HashSet<NodeRef> = inverse_schedule[target_stage as usize].clone();
    for node in f.node_refs() {
        let registered_through = users_map.get(&node).into_iter().flatten().any(|u| {
            *u != target && schedule.get(u).is_some_and(|s| *s >= target_stage)
        });
        if registered_through {
            available.insert(node);
        }
    }
    let unavailable: HashSet<NodeRef> = f
        .node_refs()
        .into_iter()
        .filter(|n| !available.contains(n))
        .collect();

    let target_operands = operands(&f.get_node(target).payload);
    let mut replacements: HashMap<NodeRef, HashSet<NodeRef>> = HashMap::new();
    for child in target_operands.iter() {
        if schedule[child] < target_stage {
            let chunk = compute_dead_node_chunk(f, &unavailable, *child);
            if chunk.is_empty() {
                // Already registered into this stage; the clone uses it
                // directly.
                continue;
            }
            // Chunks rooted in parameters or literals cannot be recomputed.
            if chunk
                .iter()
                .any(|n| operands(&f.get_node(*n).payload).is_empty())
            {
                continue;
            }
            replacements.insert(*child, chunk);
        }
    }
    if replacements.is_empty() {
        return None;
    }

    let mut topo_index: HashMap<NodeRef, usize> = HashMap::new();
    for (i, node) in get_topological(f).into_iter().enumerate() {
        topo_index.insert(node, i);
    }

    let mut clones: HashMap<NodeRef, NodeRef> = HashMap::new();
    for (_child, chunk) in replacements.iter() {
        let mut chunk_sorted: Vec<NodeRef> = chunk.iter().copied().collect();
        chunk_sorted.sort_by_key(|n| topo_index[n]);
        for node in chunk_sorted {
            if clones.contains_key(&node) {
                continue;
            }
            let payload = remap_payload_with(&f.get_node(node).payload, |(_, dep)| {
                clones.get(&dep).copied().unwrap_or(dep)
            });
            let clone = push_clone(f, node, payload, next_text_id);
            schedule.insert(clone, target_stage);
            clones.insert(node, clone);
        }
    }

    let cloned_target_operands: Vec<NodeRef> = target_operands
        .iter()
        .map(|child| {
            if schedule[child] < target_stage {
                clones.get(child).copied().unwrap_or(*child)
            } else {
                *child
            }
        })
        .collect();
    let mut slot = 0usize;
    let target_payload = remap_payload_with(&f.get_node(target).payload, |(_, _)| {
        let r = cloned_target_operands[slot];
        slot += 1;
        r
    });
    let target_replacement = push_clone(f, target, target_payload, next_text_id);
    schedule.insert(target_replacement, target_stage);

    let mut quality = 0.0f64;
    for child in target_operands.iter() {
        quality += (target_stage - schedule[child]) as f64
            * f.get_node(*child).ty.bit_count() as f64;
    }
    quality *= AREA_PER_FLOP;

    Some(RematOpportunity {
        to_rematerialize: target,
        rematerialization: target_replacement,
        quality,
    })
}

fn push_clone(f: &mut Fn, original: NodeRef, payload: NodePayload, next_text_id: &mut usize) -> NodeRef {
    let ty = f.get_node(original).ty.clone();
    f.nodes.push(Node {
        text_id: *next_text_id,
        name: None,
        ty,
        payload,
    });
    *next_text_id += 1;
    NodeRef {
        index: f.nodes.len() - 1,
    }
}

/// Area cost of a node, excluding its operands.
fn area_of_node(f: &Fn, node: NodeRef) -> f64 {
    f.get_node(node).ty.bit_count() as f64 * 2.0
}

/// Clobbers dead nodes with `Nil` so indices (and the schedule keyed on them)
/// stay stable; the caller drops the clobbered entries from the schedule.
fn clobber_dead_nodes(f: &mut Fn) -> HashSet<NodeRef> {
    let dead: HashSet<NodeRef> = get_dead_nodes(f).into_iter().collect();
    for nr in dead.iter() {
        f.get_node_mut(*nr).payload = NodePayload::Nil;
    }
    dead
}

/// Runs rematerialization over a scheduled function. Returns whether the
/// function was modified; the schedule is kept consistent throughout.
pub fn rematerialize(
    f: &mut Fn,
    schedule: &mut ScheduleCycleMap,
    estimator: &dyn DelayEstimator,
) -> StatusResult<bool> {
    let mut modified = false;

    if number_of_pipeline_stages(schedule) <= 1 {
        return Ok(false);
    }

    // Start clean: no dead nodes, no mergeable duplicates within a stage.
    {
        let deleted = clobber_dead_nodes(f);
        modified |= !deleted.is_empty();
        for node in deleted {
            schedule.remove(&node);
        }
    }
    modified |= run_cse(f, None, schedule);

    let original_nodes: HashSet<NodeRef> = f
        .node_refs()
        .into_iter()
        .filter(|n| !matches!(f.get_node(*n).payload, NodePayload::Nil))
        .collect();

    // Collect opportunities; this adds (dead) clone nodes to `f`.
    let mut next_text_id = f.nodes.iter().map(|n| n.text_id).max().unwrap_or(0) + 1;
    let inverse_schedule = invert_schedule(schedule);
    let mut opportunities: Vec<RematOpportunity> = Vec::new();
    for target in get_topological(f) {
        if !original_nodes.contains(&target) {
            continue;
        }
        let has_incoming_edges = operands(&f.get_node(target).payload)
            .iter()
            .any(|source| schedule[source] < schedule[&target]);
        if !has_incoming_edges {
            continue;
        }
        if let Some(op) =
            find_opportunity_at_node(f, target, schedule, &inverse_schedule, &mut next_text_id)
        {
            opportunities.push(op);
        }
    }
    if opportunities.is_empty() {
        return Ok(modified);
    }

    // Prune opportunities that would stretch their stage's critical path.
    {
        let added: HashSet<NodeRef> = f
            .node_refs()
            .into_iter()
            .filter(|n| {
                !original_nodes.contains(n) && !matches!(f.get_node(*n).payload, NodePayload::Nil)
            })
            .collect();
        let longest = longest_node_paths(f, estimator)?;
        let slack = compute_slack(f, &invert_schedule(schedule), &longest);

        let mut unpruned = Vec::new();
        for opportunity in opportunities.into_iter() {
            let chunk = compute_dead_node_chunk(f, &added, opportunity.rematerialization);
            let mut replacement_delay: Delay = 0;
            for node in chunk.iter() {
                if let Some(d) = longest
                    .get(node)
                    .and_then(|t| t.get(&opportunity.rematerialization))
                {
                    replacement_delay = replacement_delay.max(*d);
                }
            }
            let Some(s) = slack.get(&opportunity.to_rematerialize) else {
                continue;
            };
            if replacement_delay + s.longest_path_out_of > s.stage_critical_path {
                log::debug!(
                    "rematerialization opportunity at node {} pruned for slack",
                    opportunity.to_rematerialize.index
                );
                continue;
            }
            unpruned.push(opportunity);
        }
        opportunities = unpruned;
    }

    // Merge duplicated clones so chunks are shared between opportunities.
    {
        let mut replacements: HashMap<NodeRef, NodeRef> = HashMap::new();
        modified |= run_cse(f, Some(&mut replacements), schedule);
        for opportunity in opportunities.iter_mut() {
            if let Some(merged) = replacements.get(&opportunity.rematerialization) {
                opportunity.rematerialization = *merged;
            }
        }
    }

    // The clone nodes are all currently dead; chunk membership below is
    // computed against this set.
    let dead: HashSet<NodeRef> = get_dead_nodes(f).into_iter().collect();

    // Choose a subset minimizing added area minus saved register area.
    let universe: Vec<usize> = (0..opportunities.len()).collect();
    let objective = SetFunction::new(universe, |mask: &[bool]| {
        let mut added_nodes: HashSet<NodeRef> = HashSet::new();
        for (i, chosen) in mask.iter().enumerate() {
            if *chosen {
                added_nodes.extend(compute_dead_node_chunk(
                    f,
                    &dead,
                    opportunities[i].rematerialization,
                ));
            }
        }
        let mut result: f64 = added_nodes.iter().map(|n| area_of_node(f, *n)).sum();
        for (i, chosen) in mask.iter().enumerate() {
            if *chosen {
                result -= opportunities[i].quality;
            }
        }
        result
    });
    let chosen: Vec<usize> = objective.approx_minimize(MinimizeOptions::default());

    // Apply the chosen opportunities.
    let chosen_ops: Vec<RematOpportunity> = chosen.iter().map(|i| opportunities[*i]).collect();
    drop(objective);
    for opportunity in chosen_ops.iter() {
        log::debug!(
            "applying rematerialization: node {} -> clone {}",
            opportunity.to_rematerialize.index,
            opportunity.rematerialization.index
        );
        let from = opportunity.to_rematerialize;
        let to = opportunity.rematerialization;
        for i in 0..f.nodes.len() {
            if (NodeRef { index: i }) == to {
                continue;
            }
            let payload = remap_payload_with(&f.nodes[i].payload, |(_, nr)| {
                if nr == from {
                    to
                } else {
                    nr
                }
            });
            f.nodes[i].payload = payload;
        }
        if f.ret_node_ref == Some(from) {
            f.ret_node_ref = Some(to);
        }
        modified = true;
    }

    // Reclaim the unchosen clones.
    {
        let deleted = clobber_dead_nodes(f);
        modified |= !deleted.is_empty();
        for node in deleted {
            schedule.remove(&node);
        }
    }

    Ok(modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delay_model::StandardDelayEstimator;
    use actsynth_ir::ir_builder::FunctionBuilder;

    #[test]
    fn single_stage_is_untouched() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let x = fb.not(a, None).unwrap();
        let mut f = fb.build_with_return_value(x).unwrap();
        let mut schedule: ScheduleCycleMap =
            f.node_refs().into_iter().map(|n| (n, 0)).collect();
        let changed = rematerialize(&mut f, &mut schedule, &StandardDelayEstimator).unwrap();
        assert!(!changed);
    }

    /// A wide value crossing a boundary whose recomputation is cheap: the
    /// feeding not-node gets cloned into the consumer's stage and the
    /// cross-stage register disappears.
    #[test]
    fn wide_cross_stage_value_is_recomputed() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 64);
        // Stage 0 computes `wide`; stage 1 consumes it. `a` is also consumed
        // in stage 1 (by `extra`), so it is registered into that stage and
        // the clone of `wide` can recompute from it.
        let wide = fb.not(a, Some("wide")).unwrap();
        let target = fb.add(wide, a, Some("target")).unwrap();
        let extra = fb.not(a, Some("extra")).unwrap();
        let extra2 = fb.not(extra, Some("extra2")).unwrap();
        let ret = fb.tuple(&[target, extra2], Some("out"));
        let mut f = fb.build_with_return_value(ret).unwrap();

        let mut schedule = ScheduleCycleMap::new();
        for n in f.node_refs() {
            schedule.insert(n, 0);
        }
        for n in [target, extra, extra2, ret] {
            schedule.insert(n.node_ref(), 1);
        }

        let before_nodes = f.nodes.len();
        let changed = rematerialize(&mut f, &mut schedule, &StandardDelayEstimator).unwrap();
        assert!(changed);
        assert!(f.nodes.len() > before_nodes);
        // The original target and its wide feeder are reclaimed.
        assert!(matches!(
            f.get_node(target.node_ref()).payload,
            NodePayload::Nil
        ));
        assert!(matches!(
            f.get_node(wide.node_ref()).payload,
            NodePayload::Nil
        ));
        // The tuple now consumes the rematerialized clone.
        match &f.get_node(ret.node_ref()).payload {
            NodePayload::Tuple(elems) => {
                assert_ne!(elems[0], target.node_ref());
            }
            other => panic!("expected tuple, got {:?}", other),
        }
        // Schedule stays total over non-Nil nodes.
        for n in f.node_refs() {
            if !matches!(f.get_node(n).payload, NodePayload::Nil) {
                assert!(schedule.contains_key(&n), "node {} unscheduled", n.index);
            }
        }
    }
}
