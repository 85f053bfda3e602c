// SPDX-License-Identifier: Apache-2.0

//! Function inlining: every `invoke` is replaced by a copy of its callee's
//! body, processed in call-graph post-order so no invokes remain in a callee
//! by the time its callers are expanded.

use std::collections::{HashMap, HashSet};

use crate::ir::{Fn, NodePayload, NodeRef, Package};
use crate::ir_utils::{get_topological, remap_payload_with};

/// Names of functions invoked by `f`, in first-reference order.
fn invoked_functions(f: &Fn) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut result: Vec<String> = Vec::new();
    for node in f.nodes.iter() {
        if let NodePayload::Invoke { to_apply, .. } = &node.payload {
            if seen.insert(to_apply.as_str()) {
                result.push(to_apply.clone());
            }
        }
    }
    result
}

/// Functions of `pkg` in DFS post-order of the call graph (leaves first).
fn functions_in_post_order(pkg: &Package) -> Vec<String> {
    let invoked_anywhere: HashSet<String> = pkg
        .members
        .iter()
        .flat_map(|f| invoked_functions(f))
        .collect();
    let roots: Vec<&Fn> = pkg
        .members
        .iter()
        .filter(|f| !invoked_anywhere.contains(&f.name))
        .collect();

    let mut visited: HashSet<String> = HashSet::new();
    let mut post_order: Vec<String> = Vec::new();
    // Iterative DFS; the second stack element marks whether children were
    // already expanded.
    for root in roots {
        let mut stack: Vec<(String, bool)> = vec![(root.name.clone(), false)];
        while let Some((name, expanded)) = stack.pop() {
            if expanded {
                post_order.push(name);
                continue;
            }
            if !visited.insert(name.clone()) {
                continue;
            }
            stack.push((name.clone(), true));
            if let Some(f) = pkg.get_fn(&name) {
                for callee in invoked_functions(f) {
                    if !visited.contains(&callee) {
                        stack.push((callee, false));
                    }
                }
            }
        }
    }
    post_order
}

/// Returns the name `node` should take when inlined at `invoke`'s callsite.
///
/// If the node's name is prefixed by a callee parameter name, the respective
/// invoke operand's name is substituted for the parameter prefix; the longest
/// matching parameter wins. `None` when no meaningful name can be derived.
fn get_inlined_node_name(
    node_name: Option<&str>,
    callee: &Fn,
    caller: &Fn,
    invoke_operands: &[NodeRef],
) -> Option<String> {
    let name = node_name?;
    let mut best: Option<(usize, String)> = None;
    for (i, param) in callee.params.iter().enumerate() {
        let operand_name = invoke_operands
            .get(i)
            .and_then(|nr| caller.get_node(*nr).name.clone());
        let Some(operand_name) = operand_name else {
            continue;
        };
        if name.starts_with(param.name.as_str()) {
            let better = match &best {
                Some((len, _)) => param.name.len() > *len,
                None => true,
            };
            if better {
                let suffix = &name[param.name.len()..];
                best = Some((param.name.len(), format!("{}{}", operand_name, suffix)));
            }
        }
    }
    best.map(|(_, derived)| derived)
}

/// Inlines one invoke node of `caller`. The invoke node is clobbered with
/// `Nil` and all uses are redirected to the cloned return value.
fn inline_invoke(
    caller: &mut Fn,
    invoke_ref: NodeRef,
    callee: &Fn,
    next_text_id: &mut usize,
) -> Result<(), String> {
    let (to_apply, invoke_operands) = match &caller.get_node(invoke_ref).payload {
        NodePayload::Invoke { to_apply, operands } => (to_apply.clone(), operands.clone()),
        other => {
            return Err(format!(
                "inline_invoke called on non-invoke payload {}",
                other.get_operator()
            ))
        }
    };
    if invoke_operands.len() != callee.params.len() {
        return Err(format!(
            "invoke of '{}' passes {} operands but the callee has {} params",
            to_apply,
            invoke_operands.len(),
            callee.params.len()
        ));
    }

    // Map each callee node to its replacement in the caller. Params map to
    // the invoke operands.
    let mut replacement: HashMap<NodeRef, NodeRef> = HashMap::new();
    for (i, _) in callee.params.iter().enumerate() {
        let param_ref = crate::ir_utils::param_node_ref_by_index(callee, i)
            .ok_or_else(|| format!("callee '{}' is missing a param node", callee.name))?;
        replacement.insert(param_ref, invoke_operands[i]);
    }

    for node_ref in get_topological(callee) {
        if replacement.contains_key(&node_ref) {
            continue;
        }
        let node = callee.get_node(node_ref);
        if matches!(node.payload, NodePayload::Nil | NodePayload::GetParam(_)) {
            continue;
        }
        if matches!(node.payload, NodePayload::Invoke { .. }) {
            return Err(format!(
                "no invokes should remain in function to inline: '{}'",
                callee.name
            ));
        }
        let cloned_payload = remap_payload_with(&node.payload, |(_, dep): (usize, NodeRef)| {
            *replacement
                .get(&dep)
                .expect("operand of cloned node must already be mapped")
        });
        let new_name = if Some(node_ref) == callee.ret_node_ref {
            // The return value inherits its name from the invoke itself.
            caller.get_node(invoke_ref).name.clone()
        } else {
            get_inlined_node_name(node.name.as_deref(), callee, caller, &invoke_operands)
        };
        caller.nodes.push(crate::ir::Node {
            text_id: *next_text_id,
            name: new_name,
            ty: node.ty.clone(),
            payload: cloned_payload,
        });
        *next_text_id += 1;
        replacement.insert(
            node_ref,
            NodeRef {
                index: caller.nodes.len() - 1,
            },
        );
    }

    let callee_ret = callee
        .ret_node_ref
        .ok_or_else(|| format!("callee '{}' has no return node", callee.name))?;
    let inlined_ret = *replacement
        .get(&callee_ret)
        .ok_or_else(|| format!("callee '{}' return node was not cloned", callee.name))?;

    // Redirect all uses of the invoke to the inlined return value and clobber
    // the invoke with Nil.
    for i in 0..caller.nodes.len() {
        let payload = remap_payload_with(&caller.nodes[i].payload, |(_, nr)| {
            if nr == invoke_ref {
                inlined_ret
            } else {
                nr
            }
        });
        caller.nodes[i].payload = payload;
    }
    if caller.ret_node_ref == Some(invoke_ref) {
        caller.ret_node_ref = Some(inlined_ret);
    }
    caller.nodes[invoke_ref.index].payload = NodePayload::Nil;
    Ok(())
}

/// Inlines every invoke in the package. Returns whether anything changed.
pub fn run_inlining(pkg: &mut Package) -> Result<bool, String> {
    let mut changed = false;
    let mut next_text_id = pkg
        .members
        .iter()
        .flat_map(|f| f.nodes.iter())
        .map(|n| n.text_id)
        .max()
        .unwrap_or(0)
        + 1;

    for name in functions_in_post_order(pkg) {
        loop {
            let caller = match pkg.get_fn(&name) {
                Some(f) => f,
                None => break,
            };
            let invoke_ref = caller.nodes.iter().enumerate().find_map(|(i, n)| {
                matches!(n.payload, NodePayload::Invoke { .. }).then_some(NodeRef { index: i })
            });
            let Some(invoke_ref) = invoke_ref else {
                break;
            };
            let to_apply = match &caller.get_node(invoke_ref).payload {
                NodePayload::Invoke { to_apply, .. } => to_apply.clone(),
                _ => unreachable!(),
            };
            let callee = pkg
                .get_fn(&to_apply)
                .ok_or_else(|| format!("invoke references unknown function '{}'", to_apply))?
                .clone();
            let caller = pkg.get_fn_mut(&name).expect("caller just looked up");
            inline_invoke(caller, invoke_ref, &callee, &mut next_text_id)?;
            changed = true;
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dce::run_dce;
    use crate::ir_builder::FunctionBuilder;
    use crate::ir_verify::verify_fn;

    fn build_negate_callee() -> Fn {
        let mut fb = FunctionBuilder::new("negate_and_mask");
        let x = fb.param("x", 8);
        let inverted = fb.not(x, Some("x_inverted")).unwrap();
        fb.build_with_return_value(inverted).unwrap()
    }

    #[test]
    fn invoke_is_replaced_by_body() {
        let callee = build_negate_callee();
        let mut fb = FunctionBuilder::new("caller");
        let foo = fb.param("foo", 8);
        let call = fb.invoke(
            "negate_and_mask",
            &[foo],
            crate::ir::Type::Bits(8),
            None,
        );
        let mut pkg = Package::new("test");
        pkg.members.push(callee);
        pkg.members.push(fb.build_with_return_value(call).unwrap());
        pkg.set_top_fn("caller").unwrap();

        assert!(run_inlining(&mut pkg).unwrap());
        let caller = pkg.get_fn("caller").unwrap();
        assert!(!caller
            .nodes
            .iter()
            .any(|n| matches!(n.payload, NodePayload::Invoke { .. })));
        // The cloned not-node derives its name from the invoke operand.
        assert!(caller
            .nodes
            .iter()
            .any(|n| n.name.as_deref() == Some("foo_inverted")));

        let mut f = caller.clone();
        run_dce(&mut f, false);
        assert!(verify_fn(&f).is_ok());
    }

    #[test]
    fn nested_invokes_inline_leaves_first() {
        // inner <- middle <- outer
        let inner = build_negate_callee();

        let mut fb = FunctionBuilder::new("middle");
        let y = fb.param("y", 8);
        let call = fb.invoke("negate_and_mask", &[y], crate::ir::Type::Bits(8), None);
        let one = fb.literal_u64(1, 8);
        let plus = fb.add(call, one, None).unwrap();
        let middle = fb.build_with_return_value(plus).unwrap();

        let mut fb = FunctionBuilder::new("outer");
        let z = fb.param("z", 8);
        let call = fb.invoke("middle", &[z], crate::ir::Type::Bits(8), None);
        let outer = fb.build_with_return_value(call).unwrap();

        let mut pkg = Package::new("test");
        pkg.members.push(inner);
        pkg.members.push(middle);
        pkg.members.push(outer);
        pkg.set_top_fn("outer").unwrap();

        assert!(run_inlining(&mut pkg).unwrap());
        for f in pkg.members.iter() {
            assert!(!f
                .nodes
                .iter()
                .any(|n| matches!(n.payload, NodePayload::Invoke { .. })));
        }
    }

    #[test]
    fn ret_invoke_redirects_return() {
        let callee = build_negate_callee();
        let mut fb = FunctionBuilder::new("caller");
        let a = fb.param("a", 8);
        let call = fb.invoke("negate_and_mask", &[a], crate::ir::Type::Bits(8), Some("result"));
        let mut pkg = Package::new("test");
        pkg.members.push(callee);
        pkg.members.push(fb.build_with_return_value(call).unwrap());

        run_inlining(&mut pkg).unwrap();
        let caller = pkg.get_fn("caller").unwrap();
        let ret = caller.ret_node_ref.unwrap();
        assert!(matches!(
            caller.get_node(ret).payload,
            NodePayload::Unop(crate::ir::Unop::Not, _)
        ));
        assert_eq!(caller.get_node(ret).name.as_deref(), Some("result"));
    }
}
