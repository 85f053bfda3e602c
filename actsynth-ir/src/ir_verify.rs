// SPDX-License-Identifier: Apache-2.0

//! Lightweight IR validators for the invariants the converter and passes rely
//! on.

use std::collections::{HashMap, HashSet};

use crate::ir::{Binop, Fn, NaryOp, NodePayload, NodeRef, Type};
use crate::ir_utils::operands;

/// Verifies that all node text IDs within a function are unique.
pub fn verify_fn_unique_node_ids(f: &Fn) -> Result<(), String> {
    let mut seen: HashSet<usize> = HashSet::new();
    for (idx, n) in f.nodes.iter().enumerate() {
        if !matches!(n.payload, NodePayload::Nil) && !seen.insert(n.text_id) {
            return Err(format!(
                "duplicate node id={} found at node index {} in function '{}'",
                n.text_id, idx, f.name
            ));
        }
    }
    Ok(())
}

/// Verifies that all NodeRef indices referenced by payloads are within bounds.
pub fn verify_fn_operand_indices_in_bounds(f: &Fn) -> Result<(), String> {
    let n = f.nodes.len();
    for (i, node) in f.nodes.iter().enumerate() {
        for nr in operands(&node.payload) {
            if nr.index >= n {
                return Err(format!(
                    "operand index {} out of bounds at node {}; function '{}' has {} nodes",
                    nr.index, i, f.name, n
                ));
            }
        }
    }
    if let Some(ret) = f.ret_node_ref {
        if ret.index >= n {
            return Err(format!(
                "return node index {} out of bounds; function '{}' has {} nodes",
                ret.index, f.name, n
            ));
        }
    }
    Ok(())
}

/// Verifies the operand graph is acyclic (a topological order exists).
pub fn verify_fn_acyclic(f: &Fn) -> Result<(), String> {
    let n = f.nodes.len();
    // Kahn's algorithm over operand edges; leftovers indicate a cycle.
    let mut indegree: Vec<usize> = vec![0; n];
    let mut users: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, node) in f.nodes.iter().enumerate() {
        for dep in operands(&node.payload) {
            indegree[i] += 1;
            users[dep.index].push(i);
        }
    }
    let mut queue: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut emitted = 0usize;
    while let Some(i) = queue.pop() {
        emitted += 1;
        for &u in users[i].iter() {
            indegree[u] -= 1;
            if indegree[u] == 0 {
                queue.push(u);
            }
        }
    }
    if emitted != n {
        return Err(format!(
            "cycle detected in function '{}': {} of {} nodes unreachable from leaves",
            f.name,
            n - emitted,
            n
        ));
    }
    Ok(())
}

/// Deduces the result type for a payload given its operand types. `None`
/// means the payload carries its own type (literal, param, invoke).
pub fn deduce_result_type(
    payload: &NodePayload,
    op_types: &[Type],
) -> Result<Option<Type>, String> {
    let bits_width = |i: usize| -> Result<usize, String> {
        op_types[i]
            .as_bits_width()
            .ok_or_else(|| format!("operand {} must be bits-typed, got {}", i, op_types[i]))
    };
    let same_width_all = |what: &str| -> Result<usize, String> {
        let w = op_types[0]
            .as_bits_width()
            .ok_or_else(|| format!("{} operand must be bits-typed", what))?;
        for (i, t) in op_types.iter().enumerate() {
            if t.as_bits_width() != Some(w) {
                return Err(format!(
                    "{} requires equal operand widths; operand {} is {}",
                    what, i, t
                ));
            }
        }
        Ok(w)
    };
    let deduced = match payload {
        NodePayload::Nil
        | NodePayload::GetParam(_)
        | NodePayload::Literal(_)
        | NodePayload::Invoke { .. }
        | NodePayload::Receive { .. } => return Ok(None),
        NodePayload::Binop(op, _, _) => match op {
            Binop::Add | Binop::Sub | Binop::Umul | Binop::Udiv => {
                Type::Bits(same_width_all(crate::ir::binop_to_operator(*op))?)
            }
            Binop::Eq | Binop::Ne | Binop::Ult | Binop::Ule | Binop::Ugt | Binop::Uge => {
                same_width_all(crate::ir::binop_to_operator(*op))?;
                Type::Bits(1)
            }
            Binop::Shll | Binop::Shrl => Type::Bits(bits_width(0)?),
        },
        NodePayload::Unop(_, _) => Type::Bits(bits_width(0)?),
        NodePayload::Nary(op, _) => match op {
            NaryOp::And | NaryOp::Or => {
                Type::Bits(same_width_all(crate::ir::nary_op_to_operator(*op))?)
            }
            NaryOp::Concat => {
                let mut total = 0usize;
                for (i, _) in op_types.iter().enumerate() {
                    total += bits_width(i)?;
                }
                Type::Bits(total)
            }
        },
        NodePayload::BitSlice { start, width, .. } => {
            let aw = bits_width(0)?;
            if start + width > aw {
                return Err(format!(
                    "bit_slice [{}, {}) out of range for bits[{}]",
                    start,
                    start + width,
                    aw
                ));
            }
            Type::Bits(*width)
        }
        NodePayload::BitSliceUpdate { .. } => Type::Bits(bits_width(0)?),
        NodePayload::ZeroExt { new_bit_count, .. } | NodePayload::SignExt { new_bit_count, .. } => {
            let aw = bits_width(0)?;
            if *new_bit_count < aw {
                return Err(format!("extension to {} narrows bits[{}]", new_bit_count, aw));
            }
            Type::Bits(*new_bit_count)
        }
        NodePayload::Sel { cases, default, .. } => {
            let sel_w = bits_width(0)?;
            if default.is_none() && sel_w < usize::BITS as usize && cases.len() != 1usize << sel_w {
                return Err(format!(
                    "sel with bits[{}] selector and no default requires {} cases, got {}",
                    sel_w,
                    1usize << sel_w,
                    cases.len()
                ));
            }
            let case_ty = op_types[1].clone();
            for t in op_types.iter().skip(1) {
                if *t != case_ty {
                    return Err("sel cases must agree on type".to_string());
                }
            }
            case_ty
        }
        NodePayload::OneHot { .. } => Type::Bits(bits_width(0)? + 1),
        NodePayload::OneHotSel { cases, .. } => {
            let sel_w = bits_width(0)?;
            if sel_w != cases.len() {
                return Err(format!(
                    "one_hot_sel selector width {} does not match case count {}",
                    sel_w,
                    cases.len()
                ));
            }
            let case_ty = op_types[1].clone();
            for t in op_types.iter().skip(1) {
                if *t != case_ty {
                    return Err("one_hot_sel cases must agree on type".to_string());
                }
            }
            case_ty
        }
        NodePayload::Tuple(_) => Type::Tuple(op_types.to_vec()),
        NodePayload::TupleIndex { index, .. } => match &op_types[0] {
            Type::Tuple(types) => types
                .get(*index)
                .cloned()
                .ok_or_else(|| format!("tuple_index {} out of range", index))?,
            other => return Err(format!("tuple_index on non-tuple type {}", other)),
        },
        NodePayload::CountedFor { .. } => op_types[0].clone(),
        NodePayload::Send { .. } | NodePayload::Cover { .. } => Type::Token,
        NodePayload::AfterAll(_) => Type::Token,
    };
    Ok(Some(deduced))
}

/// Verifies every node's recorded type matches the deduction for its payload.
pub fn verify_fn_types_agree_with_deduction(f: &Fn) -> Result<(), String> {
    for (i, node) in f.nodes.iter().enumerate() {
        let op_refs = operands(&node.payload);
        let mut op_types: Vec<Type> = Vec::with_capacity(op_refs.len());
        for nr in op_refs.iter() {
            if nr.index >= f.nodes.len() {
                return Err(format!("node {} has out-of-bounds operand", i));
            }
            op_types.push(f.get_node(*nr).ty.clone());
        }
        if let Some(deduced) = deduce_result_type(&node.payload, &op_types)? {
            if deduced != node.ty {
                return Err(format!(
                    "type mismatch for node {} ({}): deduced {} vs actual {}",
                    i,
                    node.payload.get_operator(),
                    deduced,
                    node.ty
                ));
            }
        }
    }
    Ok(())
}

/// Verifies every declared parameter has exactly one GetParam node with a
/// matching name and type.
pub fn verify_fn_params(f: &Fn) -> Result<(), String> {
    for param in f.params.iter() {
        let matching: Vec<NodeRef> = f
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| match n.payload {
                NodePayload::GetParam(pid) if pid == param.id => Some(NodeRef { index: i }),
                _ => None,
            })
            .collect();
        if matching.len() != 1 {
            return Err(format!(
                "parameter '{}' has {} defining nodes, expected exactly 1",
                param.name,
                matching.len()
            ));
        }
        let node = f.get_node(matching[0]);
        if node.name.as_deref() != Some(param.name.as_str()) || node.ty != param.ty {
            return Err(format!(
                "parameter '{}' node disagrees with signature",
                param.name
            ));
        }
    }
    Ok(())
}

/// Verifies a users map is mutually consistent with operand edges:
/// `u ∈ users(n) ⇔ n ∈ operands(u)`.
pub fn verify_users_consistency(
    f: &Fn,
    users: &HashMap<NodeRef, HashSet<NodeRef>>,
) -> Result<(), String> {
    for (n, us) in users.iter() {
        for u in us.iter() {
            if !operands(&f.get_node(*u).payload).contains(n) {
                return Err(format!(
                    "users map claims node {} uses node {}, but it is not an operand",
                    u.index, n.index
                ));
            }
        }
    }
    for (i, node) in f.nodes.iter().enumerate() {
        let this_ref = NodeRef { index: i };
        for dep in operands(&node.payload) {
            let entry = users
                .get(&dep)
                .ok_or_else(|| format!("users map is missing node {}", dep.index))?;
            if !entry.contains(&this_ref) {
                return Err(format!(
                    "node {} is an operand of node {} but is missing from the users map",
                    dep.index, i
                ));
            }
        }
    }
    Ok(())
}

/// Runs the full validator battery.
pub fn verify_fn(f: &Fn) -> Result<(), String> {
    verify_fn_operand_indices_in_bounds(f)?;
    verify_fn_unique_node_ids(f)?;
    verify_fn_acyclic(f)?;
    verify_fn_params(f)?;
    verify_fn_types_agree_with_deduction(f)?;
    if let Some(ret) = f.ret_node_ref {
        let ret_ty = &f.get_node(ret).ty;
        if *ret_ty != f.ret_ty {
            return Err(format!(
                "return node type {} disagrees with function return type {}",
                ret_ty, f.ret_ty
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir_builder::FunctionBuilder;
    use crate::ir_utils::compute_users;

    #[test]
    fn builder_output_passes_verification() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let b = fb.param("b", 8);
        let sum = fb.add(a, b, None).unwrap();
        let cond = fb.ne(sum, a, None).unwrap();
        let sel = fb.select(cond, sum, a, None).unwrap();
        let f = fb.build_with_return_value(sel).unwrap();
        assert!(verify_fn(&f).is_ok());
    }

    #[test]
    fn type_mismatch_is_flagged() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let b = fb.param("b", 8);
        let sum = fb.add(a, b, None).unwrap();
        let mut f = fb.build_with_return_value(sum).unwrap();
        // Corrupt the add node's recorded type.
        let ret = f.ret_node_ref.unwrap();
        f.get_node_mut(ret).ty = Type::Bits(16);
        assert!(verify_fn_types_agree_with_deduction(&f).is_err());
    }

    #[test]
    fn cycle_is_flagged() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let x = fb.not(a, None).unwrap();
        let y = fb.not(x, None).unwrap();
        let mut f = fb.build_with_return_value(y).unwrap();
        // Point x's operand at y, creating x -> y -> x.
        let x_idx = x.node_ref().index;
        f.nodes[x_idx].payload = NodePayload::Unop(crate::ir::Unop::Not, y.node_ref());
        assert!(verify_fn_acyclic(&f).is_err());
    }

    #[test]
    fn users_map_consistency() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 4);
        let x = fb.add(a, a, None).unwrap();
        let f = fb.build_with_return_value(x).unwrap();
        let users = compute_users(&f);
        assert!(verify_users_consistency(&f, &users).is_ok());

        let mut broken = users.clone();
        broken
            .get_mut(&x.node_ref())
            .unwrap()
            .insert(a.node_ref());
        assert!(verify_users_consistency(&f, &broken).is_err());
    }
}
