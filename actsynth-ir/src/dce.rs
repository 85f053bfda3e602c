// SPDX-License-Identifier: Apache-2.0

//! Dead-code elimination for IR functions.

use std::collections::HashSet;

use crate::ir::{Fn, Node, NodePayload, NodeRef};
use crate::ir_utils::{operands, remap_payload_with};

fn compute_live(f: &Fn) -> Vec<bool> {
    let n = f.nodes.len();
    let mut live: Vec<bool> = vec![false; n];
    let mut stack: Vec<NodeRef> = Vec::new();

    // Roots: the return value plus every node with implicit uses. Side
    // effecting ops must survive even when nothing consumes their value.
    // Callee purity is not tracked, so invokes are rooted conservatively;
    // inlining removes them before DCE in the normal pipeline.
    if let Some(ret) = f.ret_node_ref {
        stack.push(ret);
    }
    for (i, node) in f.nodes.iter().enumerate() {
        if node.payload.is_side_effecting()
            || matches!(node.payload, NodePayload::Invoke { .. })
        {
            stack.push(NodeRef { index: i });
        }
    }

    while let Some(nr) = stack.pop() {
        if live[nr.index] {
            continue;
        }
        live[nr.index] = true;
        for dep in operands(&f.get_node(nr).payload) {
            if !live[dep.index] {
                stack.push(dep);
            }
        }
    }
    live
}

/// Returns the nodes unreachable from the return value and the implicit-use
/// roots, sorted by node index for deterministic ordering. GetParam and Nil
/// nodes are never reported.
pub fn get_dead_nodes(f: &Fn) -> Vec<NodeRef> {
    let live = compute_live(f);
    let mut dead: Vec<NodeRef> = Vec::new();
    for (i, node) in f.nodes.iter().enumerate() {
        if live[i] {
            continue;
        }
        if matches!(node.payload, NodePayload::GetParam(_) | NodePayload::Nil) {
            continue;
        }
        dead.push(NodeRef { index: i });
    }
    dead
}

/// Removes dead nodes from `f`, compacting indices and remapping operand
/// references. GetParam nodes are preserved even when dead so every declared
/// parameter keeps its defining node.
///
/// With `dry_run` set, `f` is left untouched and only the dead set is
/// reported. Returns whether the function changed (would change) and the set
/// of removed (reported) node refs, valid against the pre-pass indices.
pub fn run_dce(f: &mut Fn, dry_run: bool) -> (bool, HashSet<NodeRef>) {
    let dead: HashSet<NodeRef> = get_dead_nodes(f).into_iter().collect();
    if dry_run || dead.is_empty() {
        return (!dead.is_empty(), dead);
    }

    let n = f.nodes.len();
    let mut keep: Vec<bool> = vec![true; n];
    for nr in dead.iter() {
        keep[nr.index] = false;
    }

    let mut mapping: Vec<Option<usize>> = vec![None; n];
    let mut next = 0usize;
    for i in 0..n {
        if keep[i] {
            mapping[i] = Some(next);
            next += 1;
        }
    }

    let mut new_nodes: Vec<Node> = Vec::with_capacity(next);
    for (i, node) in f.nodes.iter().enumerate() {
        if !keep[i] {
            continue;
        }
        let remapped = remap_payload_with(&node.payload, |(_, nr): (usize, NodeRef)| NodeRef {
            index: mapping[nr.index].expect("live node must not reference a dead operand"),
        });
        new_nodes.push(Node {
            text_id: node.text_id,
            name: node.name.clone(),
            ty: node.ty.clone(),
            payload: remapped,
        });
    }

    if let Some(ret) = f.ret_node_ref {
        f.ret_node_ref = Some(NodeRef {
            index: mapping[ret.index].expect("return node must be live"),
        });
    }
    f.nodes = new_nodes;
    log::debug!("dce removed {} nodes from '{}'", dead.len(), f.name);
    (true, dead)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir_builder::FunctionBuilder;
    use crate::ir_verify::verify_fn;

    #[test]
    fn unreachable_arith_is_removed() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let b = fb.param("b", 8);
        let live = fb.add(a, a, None).unwrap();
        let dead = fb.add(b, b, None).unwrap();
        let mut f = fb.build_with_return_value(live).unwrap();

        let reported = get_dead_nodes(&f);
        assert!(reported.contains(&dead.node_ref()));

        let (changed, removed) = run_dce(&mut f, false);
        assert!(changed);
        assert!(removed.contains(&dead.node_ref()));
        // Both params survive even though b is now unused.
        let param_count = f
            .nodes
            .iter()
            .filter(|n| matches!(n.payload, NodePayload::GetParam(_)))
            .count();
        assert_eq!(param_count, 2);
        assert!(verify_fn(&f).is_ok());
    }

    #[test]
    fn dry_run_reports_without_mutating() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 4);
        let _unused = fb.literal_u64(7, 4);
        let mut f = fb.build_with_return_value(a).unwrap();
        let before = f.nodes.len();
        let (changed, dead) = run_dce(&mut f, true);
        assert!(changed);
        assert_eq!(dead.len(), 1);
        assert_eq!(f.nodes.len(), before);
    }

    #[test]
    fn side_effecting_nodes_survive() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 1);
        let _cov = fb.cover(a, "saw_a", None);
        let mut f = fb.build_with_return_value(a).unwrap();
        let (changed, _) = run_dce(&mut f, false);
        assert!(!changed);
        assert!(f
            .nodes
            .iter()
            .any(|n| matches!(n.payload, NodePayload::Cover { .. })));
    }
}
