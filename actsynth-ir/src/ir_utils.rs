// SPDX-License-Identifier: Apache-2.0

//! Utility functions for working with / on the IR graph.

use crate::ir::{Fn, Node, NodePayload, NodeRef};
use std::collections::{HashMap, HashSet};

/// Returns the list of operands for the provided node payload.
pub fn operands(payload: &NodePayload) -> Vec<NodeRef> {
    use NodePayload::*;

    match payload {
        Nil => vec![],
        GetParam(_) => vec![],
        Literal(_) => vec![],
        Binop(_, a, b) => vec![*a, *b],
        Unop(_, a) => vec![*a],
        Nary(_, elems) => elems.clone(),
        BitSlice { arg, .. } => vec![*arg],
        BitSliceUpdate {
            arg,
            start,
            update_value,
        } => vec![*arg, *start, *update_value],
        ZeroExt { arg, .. } => vec![*arg],
        SignExt { arg, .. } => vec![*arg],
        Sel {
            selector,
            cases,
            default,
        } => {
            let mut deps = vec![*selector];
            deps.extend(cases.iter().cloned());
            if let Some(d) = default {
                deps.push(*d);
            }
            deps
        }
        OneHot { arg, .. } => vec![*arg],
        OneHotSel { selector, cases } => {
            let mut deps = vec![*selector];
            deps.extend(cases.iter().cloned());
            deps
        }
        Tuple(elems) => elems.clone(),
        TupleIndex { tuple, .. } => vec![*tuple],
        Invoke { operands, .. } => operands.clone(),
        CountedFor {
            init,
            invariant_args,
            ..
        } => {
            let mut deps = vec![*init];
            deps.extend(invariant_args.iter().cloned());
            deps
        }
        Receive { .. } => vec![],
        Send { data, .. } => vec![*data],
        AfterAll(elems) => elems.clone(),
        Cover { predicate, .. } => vec![*predicate],
    }
}

/// Rebuilds a payload with each operand mapped through `map`. The map
/// function receives the operand slot index and the existing operand.
pub fn remap_payload_with<FMap>(payload: &NodePayload, mut map: FMap) -> NodePayload
where
    FMap: FnMut((usize, NodeRef)) -> NodeRef,
{
    use NodePayload::*;
    match payload {
        Nil => Nil,
        GetParam(p) => GetParam(*p),
        Literal(v) => Literal(v.clone()),
        Binop(op, a, b) => Binop(*op, map((0, *a)), map((1, *b))),
        Unop(op, a) => Unop(*op, map((0, *a))),
        Nary(op, elems) => Nary(
            *op,
            elems.iter().enumerate().map(|(i, r)| map((i, *r))).collect(),
        ),
        BitSlice { arg, start, width } => BitSlice {
            arg: map((0, *arg)),
            start: *start,
            width: *width,
        },
        BitSliceUpdate {
            arg,
            start,
            update_value,
        } => BitSliceUpdate {
            arg: map((0, *arg)),
            start: map((1, *start)),
            update_value: map((2, *update_value)),
        },
        ZeroExt { arg, new_bit_count } => ZeroExt {
            arg: map((0, *arg)),
            new_bit_count: *new_bit_count,
        },
        SignExt { arg, new_bit_count } => SignExt {
            arg: map((0, *arg)),
            new_bit_count: *new_bit_count,
        },
        Sel {
            selector,
            cases,
            default,
        } => Sel {
            selector: map((0, *selector)),
            cases: cases
                .iter()
                .enumerate()
                .map(|(i, r)| map((i + 1, *r)))
                .collect(),
            default: default.map(|d| map((cases.len() + 1, d))),
        },
        OneHot { arg, lsb_prio } => OneHot {
            arg: map((0, *arg)),
            lsb_prio: *lsb_prio,
        },
        OneHotSel { selector, cases } => OneHotSel {
            selector: map((0, *selector)),
            cases: cases
                .iter()
                .enumerate()
                .map(|(i, r)| map((i + 1, *r)))
                .collect(),
        },
        Tuple(elems) => Tuple(elems.iter().enumerate().map(|(i, r)| map((i, *r))).collect()),
        TupleIndex { tuple, index } => TupleIndex {
            tuple: map((0, *tuple)),
            index: *index,
        },
        Invoke { to_apply, operands } => Invoke {
            to_apply: to_apply.clone(),
            operands: operands
                .iter()
                .enumerate()
                .map(|(i, r)| map((i, *r)))
                .collect(),
        },
        CountedFor {
            init,
            trip_count,
            stride,
            body,
            invariant_args,
        } => CountedFor {
            init: map((0, *init)),
            trip_count: *trip_count,
            stride: *stride,
            body: body.clone(),
            invariant_args: invariant_args
                .iter()
                .enumerate()
                .map(|(i, r)| map((i + 1, *r)))
                .collect(),
        },
        Receive { channel } => Receive {
            channel: channel.clone(),
        },
        Send { channel, data } => Send {
            channel: channel.clone(),
            data: map((0, *data)),
        },
        AfterAll(elems) => {
            AfterAll(elems.iter().enumerate().map(|(i, r)| map((i, *r))).collect())
        }
        Cover { predicate, label } => Cover {
            predicate: map((0, *predicate)),
            label: label.clone(),
        },
    }
}

/// Returns a topologically sorted list of node references.
///
/// The ordering guarantees every node's dependencies appear before it.
/// Non-recursive DFS so deep chains cannot overflow the stack.
fn topo_from_nodes(nodes: &[Node]) -> Vec<NodeRef> {
    let n = nodes.len();
    let mut visited: Vec<bool> = vec![false; n];
    let mut in_stack: Vec<bool> = vec![false; n];
    let mut order: Vec<NodeRef> = Vec::with_capacity(n);

    let mut deps: Vec<Vec<usize>> = Vec::with_capacity(n);
    for node in nodes.iter() {
        deps.push(operands(&node.payload).into_iter().map(|r| r.index).collect());
    }

    for start in 0..n {
        if visited[start] {
            continue;
        }
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        in_stack[start] = true;

        while let Some((node_idx, child_pos)) = stack.pop() {
            if visited[node_idx] {
                in_stack[node_idx] = false;
                continue;
            }
            if child_pos < deps[node_idx].len() {
                let next_child = deps[node_idx][child_pos];
                stack.push((node_idx, child_pos + 1));
                if !visited[next_child] {
                    assert!(
                        !in_stack[next_child],
                        "cycle detected in IR graph; topological order impossible"
                    );
                    stack.push((next_child, 0));
                    in_stack[next_child] = true;
                }
                continue;
            }
            visited[node_idx] = true;
            in_stack[node_idx] = false;
            order.push(NodeRef { index: node_idx });
        }
    }
    assert!(order.len() == n, "topological sort did not include all nodes");
    order
}

pub fn get_topological(f: &Fn) -> Vec<NodeRef> {
    topo_from_nodes(&f.nodes)
}

/// Computes the immediate users of each node in the function.
///
/// Maps every `NodeRef` (including sinks) to the set of nodes that use it as
/// an operand, so `u ∈ users(n) ⇔ n ∈ operands(u)` holds by construction.
pub fn compute_users(f: &Fn) -> HashMap<NodeRef, HashSet<NodeRef>> {
    let n = f.nodes.len();
    let mut users: HashMap<NodeRef, HashSet<NodeRef>> = HashMap::with_capacity(n);

    for i in 0..n {
        users.insert(NodeRef { index: i }, HashSet::new());
    }

    for (i, node) in f.nodes.iter().enumerate() {
        let this_ref = NodeRef { index: i };
        for dep in operands(&node.payload) {
            users
                .get_mut(&dep)
                .expect("operand NodeRef must exist in users map")
                .insert(this_ref);
        }
    }

    users
}

/// Returns the `NodeRef` of the node defining the `index`-th parameter.
pub fn param_node_ref_by_index(f: &Fn, param_index: usize) -> Option<NodeRef> {
    let param = f.params.get(param_index)?;
    f.nodes
        .iter()
        .enumerate()
        .find_map(|(idx, node)| match node.payload {
            NodePayload::GetParam(pid) if pid == param.id => Some(NodeRef { index: idx }),
            _ => None,
        })
}

/// Returns true if `s` is a valid identifier `([_A-Za-z][_A-Za-z0-9]*)`.
pub fn is_valid_identifier_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    };
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Sanitizes arbitrary text to a valid identifier deterministically:
/// every character outside `[_A-Za-z0-9]` becomes an underscore, and a
/// leading digit gains an underscore prefix.
pub fn sanitize_identifier(s: &str) -> String {
    let mut out: String = s
        .chars()
        .map(|c| if c == '_' || c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir_builder::FunctionBuilder;

    fn verify_topo_property(f: &Fn, order: &[NodeRef]) {
        let mut pos: Vec<usize> = vec![0; f.nodes.len()];
        for (i, nr) in order.iter().enumerate() {
            pos[nr.index] = i;
        }
        for nr in order {
            let node = &f.nodes[nr.index];
            for dep in operands(&node.payload) {
                assert!(pos[dep.index] < pos[nr.index], "dependency must precede user");
            }
        }
    }

    #[test]
    fn topo_covers_all_nodes() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 8);
        let b = fb.param("b", 8);
        let sum = fb.add(a, b, None).unwrap();
        let _dead = fb.literal_u64(3, 8);
        let f = fb.build_with_return_value(sum).unwrap();
        let order = get_topological(&f);
        assert_eq!(order.len(), f.nodes.len());
        verify_topo_property(&f, &order);
    }

    #[test]
    fn topo_long_chain_non_recursive() {
        let mut fb = FunctionBuilder::new("g");
        let mut v = fb.param("x", 1);
        for _ in 0..4096 {
            v = fb.not(v, None).unwrap();
        }
        let f = fb.build_with_return_value(v).unwrap();
        let order = get_topological(&f);
        assert_eq!(order.len(), f.nodes.len());
        verify_topo_property(&f, &order);
    }

    #[test]
    fn users_fanout() {
        let mut fb = FunctionBuilder::new("f");
        let a = fb.param("a", 4);
        let x = fb.add(a, a, None).unwrap();
        let y = fb.sub(a, a, None).unwrap();
        let t = fb.tuple(&[x, y], None);
        let f = fb.build_with_return_value(t).unwrap();

        let users = compute_users(&f);
        assert_eq!(users.len(), f.nodes.len());
        assert_eq!(users.get(&a.node_ref()).unwrap().len(), 2);
        assert!(users.get(&x.node_ref()).unwrap().contains(&t.node_ref()));
        assert!(users.get(&t.node_ref()).unwrap().is_empty());
    }

    #[test]
    fn remap_shifts_operands() {
        let p = NodePayload::Sel {
            selector: NodeRef { index: 1 },
            cases: vec![NodeRef { index: 2 }, NodeRef { index: 3 }],
            default: Some(NodeRef { index: 4 }),
        };
        let r = remap_payload_with(&p, |(_, nr)| NodeRef { index: nr.index + 10 });
        match r {
            NodePayload::Sel {
                selector,
                cases,
                default,
            } => {
                assert_eq!(selector, NodeRef { index: 11 });
                assert_eq!(cases, vec![NodeRef { index: 12 }, NodeRef { index: 13 }]);
                assert_eq!(default, Some(NodeRef { index: 14 }));
            }
            _ => panic!("expected Sel"),
        }
    }

    #[test]
    fn sanitize() {
        assert!(is_valid_identifier_name("_foo1"));
        assert!(!is_valid_identifier_name("1foo"));
        assert!(!is_valid_identifier_name("a.b"));
        assert_eq!(sanitize_identifier("a.b-c"), "a_b_c");
        assert_eq!(sanitize_identifier("1abc"), "_1abc");
        assert_eq!(sanitize_identifier(""), "_");
    }
}
