// SPDX-License-Identifier: Apache-2.0

//! Common-subexpression elimination.
//!
//! Nodes are bucketed by a hash of `(op, type, attributes, canonicalized
//! operand ids)`; bucket collisions are confirmed with a structural equality
//! check before merging. A caller-supplied mergeability key (the scheduler's
//! cycle map) restricts merging to nodes with equal keys so CSE never merges
//! computations across pipeline stages.

use std::collections::HashMap;

use crate::ir::{Fn, NodePayload, NodeRef};
use crate::ir_utils::{get_topological, remap_payload_with};
use crate::node_hashing::{compute_cse_bucket_hash, operands_for_cse, FwdHash};

/// Structural equality modulo operand order for commutative ops.
fn is_definitely_equal_to(f: &Fn, a: NodeRef, b: NodeRef) -> bool {
    let na = f.get_node(a);
    let nb = f.get_node(b);
    if na.ty != nb.ty {
        return false;
    }
    if operands_for_cse(f, a) != operands_for_cse(f, b) {
        return false;
    }
    use NodePayload::*;
    match (&na.payload, &nb.payload) {
        (Literal(x), Literal(y)) => x == y,
        (Binop(op_a, _, _), Binop(op_b, _, _)) => op_a == op_b,
        (Unop(op_a, _), Unop(op_b, _)) => op_a == op_b,
        (Nary(op_a, _), Nary(op_b, _)) => op_a == op_b,
        (
            BitSlice {
                start: sa,
                width: wa,
                ..
            },
            BitSlice {
                start: sb,
                width: wb,
                ..
            },
        ) => sa == sb && wa == wb,
        (BitSliceUpdate { .. }, BitSliceUpdate { .. }) => true,
        (ZeroExt { new_bit_count: a, .. }, ZeroExt { new_bit_count: b, .. }) => a == b,
        (SignExt { new_bit_count: a, .. }, SignExt { new_bit_count: b, .. }) => a == b,
        (Sel { .. }, Sel { .. }) => true,
        (OneHot { lsb_prio: a, .. }, OneHot { lsb_prio: b, .. }) => a == b,
        (OneHotSel { .. }, OneHotSel { .. }) => true,
        (Tuple(_), Tuple(_)) => true,
        (TupleIndex { index: a, .. }, TupleIndex { index: b, .. }) => a == b,
        (Invoke { to_apply: a, .. }, Invoke { to_apply: b, .. }) => a == b,
        _ => false,
    }
}

/// Runs CSE over `f`.
///
/// `mergeable` maps nodes to an opaque key; two nodes merge only when both
/// are absent from the map or both map to the same key. Replacement pairs
/// (`dead -> survivor`) are recorded in `replacements` when provided. Merged
/// nodes become dead; run DCE afterwards to reclaim them.
pub fn run_cse(
    f: &mut Fn,
    replacements: Option<&mut HashMap<NodeRef, NodeRef>>,
    mergeable: &HashMap<NodeRef, i64>,
) -> bool {
    let is_mergeable = |x: NodeRef, y: NodeRef| -> bool {
        match (mergeable.get(&x), mergeable.get(&y)) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    };

    let mut changed = false;
    let mut node_buckets: HashMap<FwdHash, Vec<NodeRef>> = HashMap::new();
    // dead node -> surviving node, applied to payloads at the end.
    let mut replaced: HashMap<NodeRef, NodeRef> = HashMap::new();

    let resolve = |nr: NodeRef, replaced: &HashMap<NodeRef, NodeRef>| -> NodeRef {
        let mut cur = nr;
        while let Some(next) = replaced.get(&cur) {
            cur = *next;
        }
        cur
    };

    for node_ref in get_topological(f) {
        let node = f.get_node(node_ref);
        if node.payload.is_side_effecting()
            || matches!(node.payload, NodePayload::Nil | NodePayload::GetParam(_))
        {
            continue;
        }
        // Rewrite this node's operands through prior replacements so that
        // downstream hashes see the canonical survivors.
        let payload = remap_payload_with(&f.get_node(node_ref).payload, |(_, nr)| {
            resolve(nr, &replaced)
        });
        f.get_node_mut(node_ref).payload = payload;

        let hash = compute_cse_bucket_hash(f, node_ref);
        let bucket = node_buckets.entry(hash).or_default();
        let mut merged = false;
        for candidate in bucket.iter() {
            if is_definitely_equal_to(f, node_ref, *candidate)
                && is_mergeable(node_ref, *candidate)
            {
                log::debug!(
                    "cse: replacing node {} with equivalent node {}",
                    node_ref.index,
                    candidate.index
                );
                replaced.insert(node_ref, *candidate);
                changed = true;
                merged = true;
                break;
            }
        }
        if !merged {
            bucket.push(node_ref);
        }
    }

    if changed {
        for i in 0..f.nodes.len() {
            let payload = remap_payload_with(&f.nodes[i].payload, |(_, nr)| resolve(nr, &replaced));
            f.nodes[i].payload = payload;
        }
        if let Some(ret) = f.ret_node_ref {
            f.ret_node_ref = Some(resolve(ret, &replaced));
        }
    }

    if let Some(out) = replacements {
        out.extend(replaced.iter());
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dce::run_dce;
    use crate::ir_builder::FunctionBuilder;
    use crate::ir_verify::verify_fn;

    #[test]
    fn duplicate_adds_merge() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let b = fb.param("b", 8);
        let x = fb.add(a, b, None).unwrap();
        let y = fb.add(a, b, None).unwrap();
        let t = fb.tuple(&[x, y], None);
        let mut f = fb.build_with_return_value(t).unwrap();

        let mut replacements = HashMap::new();
        let changed = run_cse(&mut f, Some(&mut replacements), &HashMap::new());
        assert!(changed);
        assert_eq!(replacements.get(&y.node_ref()), Some(&x.node_ref()));

        // The tuple now references x twice; y is dead.
        let (dce_changed, dead) = run_dce(&mut f, false);
        assert!(dce_changed);
        assert_eq!(dead.len(), 1);
        assert!(verify_fn(&f).is_ok());
    }

    #[test]
    fn commutative_merge_across_operand_order() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let b = fb.param("b", 8);
        let x = fb.add(a, b, None).unwrap();
        let y = fb.add(b, a, None).unwrap();
        let t = fb.tuple(&[x, y], None);
        let mut f = fb.build_with_return_value(t).unwrap();
        assert!(run_cse(&mut f, None, &HashMap::new()));
    }

    #[test]
    fn non_commutative_order_does_not_merge() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let b = fb.param("b", 8);
        let x = fb.sub(a, b, None).unwrap();
        let y = fb.sub(b, a, None).unwrap();
        let t = fb.tuple(&[x, y], None);
        let mut f = fb.build_with_return_value(t).unwrap();
        assert!(!run_cse(&mut f, None, &HashMap::new()));
    }

    #[test]
    fn mergeable_key_blocks_cross_stage_merge() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let b = fb.param("b", 8);
        let x = fb.add(a, b, None).unwrap();
        let y = fb.add(a, b, None).unwrap();
        let t = fb.tuple(&[x, y], None);
        let mut f = fb.build_with_return_value(t).unwrap();

        // Pretend the scheduler placed x and y in different stages.
        let mut mergeable = HashMap::new();
        mergeable.insert(x.node_ref(), 0);
        mergeable.insert(y.node_ref(), 1);
        assert!(!run_cse(&mut f, None, &mergeable));

        // Same stage merges.
        let mut same_stage = HashMap::new();
        same_stage.insert(x.node_ref(), 0);
        same_stage.insert(y.node_ref(), 0);
        assert!(run_cse(&mut f, None, &same_stage));
    }

    #[test]
    fn chained_merges_resolve_transitively() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let x1 = fb.add(a, a, None).unwrap();
        let x2 = fb.add(a, a, None).unwrap();
        let y1 = fb.not(x1, None).unwrap();
        let y2 = fb.not(x2, None).unwrap();
        let t = fb.tuple(&[y1, y2], None);
        let mut f = fb.build_with_return_value(t).unwrap();
        assert!(run_cse(&mut f, None, &HashMap::new()));
        // After CSE both not-nodes collapse; tuple uses y1 twice.
        match &f.get_node(t.node_ref()).payload {
            NodePayload::Tuple(elems) => {
                assert_eq!(elems[0], elems[1]);
            }
            _ => panic!("expected tuple"),
        }
    }
}
