// SPDX-License-Identifier: Apache-2.0

//! Helpers for computing structural hashes of IR nodes.

use crate::ir::{self, Fn, NodePayload, NodeRef, ParamId, Type};
use crate::ir_utils::operands;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct FwdHash(pub blake3::Hash);

impl FwdHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

fn update_hash_str(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(s.as_bytes());
}

fn update_hash_u64(hasher: &mut blake3::Hasher, x: u64) {
    hasher.update(&x.to_le_bytes());
}

fn update_hash_bool(hasher: &mut blake3::Hasher, x: bool) {
    update_hash_u64(hasher, if x { 1 } else { 0 });
}

fn update_hash_type(hasher: &mut blake3::Hasher, ty: &Type) {
    match ty {
        Type::Token => update_hash_str(hasher, "token"),
        Type::Bits(width) => {
            update_hash_str(hasher, "bits");
            update_hash_u64(hasher, *width as u64);
        }
        Type::Tuple(elems) => {
            update_hash_str(hasher, "tuple");
            update_hash_u64(hasher, elems.len() as u64);
            for e in elems.iter() {
                update_hash_type(hasher, e);
            }
        }
    }
}

fn get_param_ordinal(f: &Fn, param_id: ParamId) -> usize {
    f.params
        .iter()
        .position(|p| p.id == param_id)
        .expect("ParamId must correspond to a function parameter")
}

fn hash_payload_attributes(f: &Fn, payload: &NodePayload, hasher: &mut blake3::Hasher) {
    match payload {
        NodePayload::Nil => {}
        NodePayload::GetParam(param_id) => {
            // Use the stable ordinal within the signature, not the text id.
            let ordinal = get_param_ordinal(f, *param_id) as u64 + 1;
            update_hash_u64(hasher, ordinal);
        }
        NodePayload::Literal(value) => update_hash_str(hasher, &value.to_string()),
        NodePayload::Binop(op, _, _) => update_hash_str(hasher, ir::binop_to_operator(*op)),
        NodePayload::Unop(op, _) => update_hash_str(hasher, ir::unop_to_operator(*op)),
        NodePayload::Nary(op, nodes) => {
            update_hash_str(hasher, ir::nary_op_to_operator(*op));
            update_hash_u64(hasher, nodes.len() as u64);
        }
        NodePayload::BitSlice { start, width, .. } => {
            update_hash_u64(hasher, *start as u64);
            update_hash_u64(hasher, *width as u64);
        }
        NodePayload::BitSliceUpdate { .. } => {}
        NodePayload::ZeroExt { new_bit_count, .. } | NodePayload::SignExt { new_bit_count, .. } => {
            update_hash_u64(hasher, *new_bit_count as u64)
        }
        NodePayload::Sel { cases, default, .. } => {
            update_hash_bool(hasher, default.is_some());
            update_hash_u64(hasher, cases.len() as u64);
        }
        NodePayload::OneHot { lsb_prio, .. } => update_hash_bool(hasher, *lsb_prio),
        NodePayload::OneHotSel { cases, .. } => update_hash_u64(hasher, cases.len() as u64),
        NodePayload::Tuple(nodes) | NodePayload::AfterAll(nodes) => {
            update_hash_u64(hasher, nodes.len() as u64)
        }
        NodePayload::TupleIndex { index, .. } => update_hash_u64(hasher, *index as u64),
        NodePayload::Invoke { to_apply, operands } => {
            update_hash_str(hasher, to_apply);
            update_hash_u64(hasher, operands.len() as u64);
        }
        NodePayload::CountedFor {
            trip_count,
            stride,
            body,
            invariant_args,
            ..
        } => {
            update_hash_u64(hasher, *trip_count as u64);
            update_hash_u64(hasher, *stride as u64);
            update_hash_str(hasher, body);
            update_hash_u64(hasher, invariant_args.len() as u64);
        }
        NodePayload::Receive { channel } => update_hash_str(hasher, channel),
        NodePayload::Send { channel, .. } => update_hash_str(hasher, channel),
        NodePayload::Cover { label, .. } => update_hash_str(hasher, label),
    }
}

/// Hashes a node's operator, type, attributes, and child hashes into a
/// structural fingerprint.
pub fn compute_node_structural_hash(f: &Fn, node_ref: NodeRef, child_hashes: &[FwdHash]) -> FwdHash {
    let node = f.get_node(node_ref);
    let mut hasher = blake3::Hasher::new();
    update_hash_str(&mut hasher, node.payload.get_operator());
    update_hash_type(&mut hasher, &node.ty);
    hash_payload_attributes(f, &node.payload, &mut hasher);
    for ch in child_hashes.iter() {
        hasher.update(ch.as_bytes());
    }
    FwdHash(hasher.finalize())
}

/// Hash on operator tag + type + payload attributes + operand identities,
/// with operand order canonicalized for commutative operators. This is the
/// bucketing key used by CSE.
pub fn compute_cse_bucket_hash(f: &Fn, node_ref: NodeRef) -> FwdHash {
    let node = f.get_node(node_ref);
    let mut hasher = blake3::Hasher::new();
    update_hash_str(&mut hasher, node.payload.get_operator());
    update_hash_type(&mut hasher, &node.ty);
    hash_payload_attributes(f, &node.payload, &mut hasher);
    for dep in operands_for_cse(f, node_ref) {
        update_hash_u64(&mut hasher, f.get_node(dep).text_id as u64);
    }
    FwdHash(hasher.finalize())
}

/// Returns the operands of `node_ref` for equivalence comparison purposes.
///
/// Commutative operations are agnostic to operand order, so their operands
/// are sorted by node id prior to comparison; other operations keep their
/// natural order.
pub fn operands_for_cse(f: &Fn, node_ref: NodeRef) -> Vec<NodeRef> {
    let node = f.get_node(node_ref);
    let mut deps = operands(&node.payload);
    let commutative = match &node.payload {
        NodePayload::Binop(op, _, _) => ir::binop_is_commutative(*op),
        NodePayload::Nary(op, _) => ir::nary_op_is_commutative(*op),
        _ => false,
    };
    if commutative {
        deps.sort_by_key(|nr| f.get_node(*nr).text_id);
    }
    deps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir_builder::FunctionBuilder;

    #[test]
    fn commutative_operands_are_canonicalized() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let b = fb.param("b", 8);
        let x = fb.add(a, b, None).unwrap();
        let y = fb.add(b, a, None).unwrap();
        let t = fb.tuple(&[x, y], None);
        let f = fb.build_with_return_value(t).unwrap();
        assert_eq!(
            compute_cse_bucket_hash(&f, x.node_ref()),
            compute_cse_bucket_hash(&f, y.node_ref())
        );
    }

    #[test]
    fn non_commutative_operands_keep_order() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let b = fb.param("b", 8);
        let x = fb.sub(a, b, None).unwrap();
        let y = fb.sub(b, a, None).unwrap();
        let t = fb.tuple(&[x, y], None);
        let f = fb.build_with_return_value(t).unwrap();
        assert_ne!(
            compute_cse_bucket_hash(&f, x.node_ref()),
            compute_cse_bucket_hash(&f, y.node_ref())
        );
    }

    #[test]
    fn attributes_distinguish_slices() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let x = fb.bit_slice(a, 0, 4, None).unwrap();
        let y = fb.bit_slice(a, 4, 4, None).unwrap();
        let t = fb.tuple(&[x, y], None);
        let f = fb.build_with_return_value(t).unwrap();
        assert_ne!(
            compute_cse_bucket_hash(&f, x.node_ref()),
            compute_cse_bucket_hash(&f, y.node_ref())
        );
    }
}
