// SPDX-License-Identifier: Apache-2.0

//! IR data model: a static-single-assignment value-dataflow graph with typed
//! nodes, plus its canonical text emission.

use crate::bits::Bits;

/// Strongly-typed wrapper for parameter IDs.
///
/// This is an ordinal into the dense parameter space of a function signature
/// (the Nth parameter), not a node id in the IR graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(usize);

impl ParamId {
    pub fn new(id: usize) -> Self {
        assert!(id > 0, "ParamId must be greater than zero, got {}", id);
        ParamId(id)
    }

    pub fn get_wrapped_id(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub enum Type {
    Token,
    Bits(usize),
    Tuple(Vec<Type>),
}

impl Type {
    pub fn nil() -> Self {
        Type::Tuple(vec![])
    }

    pub fn bit_count(&self) -> usize {
        match self {
            Type::Token => 0,
            Type::Bits(width) => *width,
            Type::Tuple(types) => types.iter().map(|t| t.bit_count()).sum(),
        }
    }

    /// Width accessor for values that must be plain bit vectors.
    pub fn as_bits_width(&self) -> Option<usize> {
        match self {
            Type::Bits(w) => Some(*w),
            _ => None,
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Token => write!(f, "token"),
            Type::Bits(width) => write!(f, "bits[{}]", width),
            Type::Tuple(types) => {
                write!(f, "(")?;
                for (i, ty) in types.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", ty)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binop {
    Add,
    Sub,
    Umul,
    Udiv,

    Eq,
    Ne,
    Ult,
    Ule,
    Ugt,
    Uge,

    Shll,
    Shrl,
}

pub fn binop_to_operator(binop: Binop) -> &'static str {
    match binop {
        Binop::Add => "add",
        Binop::Sub => "sub",
        Binop::Umul => "umul",
        Binop::Udiv => "udiv",
        Binop::Eq => "eq",
        Binop::Ne => "ne",
        Binop::Ult => "ult",
        Binop::Ule => "ule",
        Binop::Ugt => "ugt",
        Binop::Uge => "uge",
        Binop::Shll => "shll",
        Binop::Shrl => "shrl",
    }
}

/// True when operand order does not affect the result.
pub fn binop_is_commutative(binop: Binop) -> bool {
    matches!(binop, Binop::Add | Binop::Umul | Binop::Eq | Binop::Ne)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unop {
    Not,
}

pub fn unop_to_operator(unop: Unop) -> &'static str {
    match unop {
        Unop::Not => "not",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NaryOp {
    And,
    Or,
    Concat,
}

pub fn nary_op_to_operator(nary_op: NaryOp) -> &'static str {
    match nary_op {
        NaryOp::And => "and",
        NaryOp::Or => "or",
        NaryOp::Concat => "concat",
    }
}

pub fn nary_op_is_commutative(nary_op: NaryOp) -> bool {
    matches!(nary_op, NaryOp::And | NaryOp::Or)
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct NodeRef {
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodePayload {
    Nil,
    GetParam(ParamId),
    Literal(Bits),
    Binop(Binop, NodeRef, NodeRef),
    Unop(Unop, NodeRef),
    Nary(NaryOp, Vec<NodeRef>),
    BitSlice {
        arg: NodeRef,
        start: usize,
        width: usize,
    },
    BitSliceUpdate {
        arg: NodeRef,
        start: NodeRef,
        update_value: NodeRef,
    },
    ZeroExt {
        arg: NodeRef,
        new_bit_count: usize,
    },
    SignExt {
        arg: NodeRef,
        new_bit_count: usize,
    },
    Sel {
        selector: NodeRef,
        cases: Vec<NodeRef>,
        default: Option<NodeRef>,
    },
    OneHot {
        arg: NodeRef,
        lsb_prio: bool,
    },
    OneHotSel {
        selector: NodeRef,
        cases: Vec<NodeRef>,
    },
    Tuple(Vec<NodeRef>),
    TupleIndex {
        tuple: NodeRef,
        index: usize,
    },
    Invoke {
        to_apply: String,
        operands: Vec<NodeRef>,
    },
    // Counted for loop: starts from `init`, runs `trip_count` iterations with
    // stride `stride`, applying `body` each iteration. Invariant operands are
    // passed to the body after the induction variable and loop-carry.
    CountedFor {
        init: NodeRef,
        trip_count: usize,
        stride: usize,
        body: String,
        invariant_args: Vec<NodeRef>,
    },
    Receive {
        channel: String,
    },
    Send {
        channel: String,
        data: NodeRef,
    },
    AfterAll(Vec<NodeRef>),
    Cover {
        predicate: NodeRef,
        label: String,
    },
}

impl NodePayload {
    pub fn get_operator(&self) -> &str {
        match self {
            NodePayload::Nil => "nil",
            NodePayload::GetParam(_) => "param",
            NodePayload::Literal(_) => "literal",
            NodePayload::Binop(op, _, _) => binop_to_operator(*op),
            NodePayload::Unop(op, _) => unop_to_operator(*op),
            NodePayload::Nary(op, _) => nary_op_to_operator(*op),
            NodePayload::BitSlice { .. } => "bit_slice",
            NodePayload::BitSliceUpdate { .. } => "bit_slice_update",
            NodePayload::ZeroExt { .. } => "zero_ext",
            NodePayload::SignExt { .. } => "sign_ext",
            NodePayload::Sel { .. } => "sel",
            NodePayload::OneHot { .. } => "one_hot",
            NodePayload::OneHotSel { .. } => "one_hot_sel",
            NodePayload::Tuple(_) => "tuple",
            NodePayload::TupleIndex { .. } => "tuple_index",
            NodePayload::Invoke { .. } => "invoke",
            NodePayload::CountedFor { .. } => "counted_for",
            NodePayload::Receive { .. } => "receive",
            NodePayload::Send { .. } => "send",
            NodePayload::AfterAll(_) => "after_all",
            NodePayload::Cover { .. } => "cover",
        }
    }

    /// Side-effecting payloads must survive dead-code elimination even when
    /// nothing consumes their value.
    pub fn is_side_effecting(&self) -> bool {
        matches!(
            self,
            NodePayload::Send { .. } | NodePayload::Receive { .. } | NodePayload::Cover { .. }
        )
    }

    pub fn to_string(&self, f: &Fn, id: usize) -> Option<String> {
        let get_name = |node_ref: NodeRef| -> String { node_textual_id(f, node_ref) };
        let join = |nodes: &[NodeRef]| -> String {
            nodes
                .iter()
                .map(|n| get_name(*n))
                .collect::<Vec<String>>()
                .join(", ")
        };
        let result = match self {
            NodePayload::Literal(value) => format!("literal(value={}, id={})", value, id),
            NodePayload::Binop(op, lhs, rhs) => format!(
                "{}({}, {}, id={})",
                binop_to_operator(*op),
                get_name(*lhs),
                get_name(*rhs),
                id
            ),
            NodePayload::Unop(op, arg) => {
                format!("{}({}, id={})", unop_to_operator(*op), get_name(*arg), id)
            }
            NodePayload::Nary(op, nodes) => {
                format!("{}({}, id={})", nary_op_to_operator(*op), join(nodes), id)
            }
            NodePayload::BitSlice { arg, start, width } => format!(
                "bit_slice({}, start={}, width={}, id={})",
                get_name(*arg),
                start,
                width,
                id
            ),
            NodePayload::BitSliceUpdate {
                arg,
                start,
                update_value,
            } => format!(
                "bit_slice_update({}, {}, {}, id={})",
                get_name(*arg),
                get_name(*start),
                get_name(*update_value),
                id
            ),
            NodePayload::ZeroExt { arg, new_bit_count } => format!(
                "zero_ext({}, new_bit_count={}, id={})",
                get_name(*arg),
                new_bit_count,
                id
            ),
            NodePayload::SignExt { arg, new_bit_count } => format!(
                "sign_ext({}, new_bit_count={}, id={})",
                get_name(*arg),
                new_bit_count,
                id
            ),
            NodePayload::Sel {
                selector,
                cases,
                default,
            } => {
                let default_str = match default {
                    Some(d) => format!(", default={}", get_name(*d)),
                    None => String::new(),
                };
                format!(
                    "sel({}, cases=[{}]{}, id={})",
                    get_name(*selector),
                    join(cases),
                    default_str,
                    id
                )
            }
            NodePayload::OneHot { arg, lsb_prio } => format!(
                "one_hot({}, lsb_prio={}, id={})",
                get_name(*arg),
                lsb_prio,
                id
            ),
            NodePayload::OneHotSel { selector, cases } => format!(
                "one_hot_sel({}, cases=[{}], id={})",
                get_name(*selector),
                join(cases),
                id
            ),
            NodePayload::Tuple(nodes) => {
                if nodes.is_empty() {
                    format!("tuple(id={})", id)
                } else {
                    format!("tuple({}, id={})", join(nodes), id)
                }
            }
            NodePayload::TupleIndex { tuple, index } => format!(
                "tuple_index({}, index={}, id={})",
                get_name(*tuple),
                index,
                id
            ),
            NodePayload::Invoke { to_apply, operands } => {
                if operands.is_empty() {
                    format!("invoke(to_apply={}, id={})", to_apply, id)
                } else {
                    format!("invoke({}, to_apply={}, id={})", join(operands), to_apply, id)
                }
            }
            NodePayload::CountedFor {
                init,
                trip_count,
                stride,
                body,
                invariant_args,
            } => {
                let inv_str = if invariant_args.is_empty() {
                    String::new()
                } else {
                    format!(", invariant_args=[{}]", join(invariant_args))
                };
                format!(
                    "counted_for({}, trip_count={}, stride={}, body={}{}, id={})",
                    get_name(*init),
                    trip_count,
                    stride,
                    body,
                    inv_str,
                    id
                )
            }
            NodePayload::Receive { channel } => {
                format!("receive(channel={}, id={})", channel, id)
            }
            NodePayload::Send { channel, data } => {
                format!("send({}, channel={}, id={})", get_name(*data), channel, id)
            }
            NodePayload::AfterAll(nodes) => {
                if nodes.is_empty() {
                    format!("after_all(id={})", id)
                } else {
                    format!("after_all({}, id={})", join(nodes), id)
                }
            }
            NodePayload::Cover { predicate, label } => {
                format!("cover({}, label={}, id={})", get_name(*predicate), label, id)
            }
            NodePayload::GetParam(_) | NodePayload::Nil => return None,
        };
        Some(result)
    }
}

/// Returns a human-oriented textual identifier for a node reference.
///
/// Params return their parameter name; other nodes return their `name` when
/// present, otherwise `"<operator>.<text_id>"`.
pub fn node_textual_id(f: &Fn, nr: NodeRef) -> String {
    let node = f.get_node(nr);
    match node.payload {
        NodePayload::GetParam(_) => node.name.clone().expect("param node should have a name"),
        _ => match &node.name {
            Some(n) => n.clone(),
            None => format!("{}.{}", node.payload.get_operator(), node.text_id),
        },
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    /// All nodes have known ids.
    pub text_id: usize,
    /// Params must have names; other nodes optionally have names.
    pub name: Option<String>,
    pub ty: Type,
    pub payload: NodePayload,
}

impl Node {
    pub fn to_string(&self, f: &Fn) -> Option<String> {
        let payload_str = self.payload.to_string(f, self.text_id)?;
        let name_str = match &self.name {
            Some(name) => name.clone(),
            None => format!("{}.{}", self.payload.get_operator(), self.text_id),
        };
        Some(format!("{}: {} = {}", name_str, self.ty, payload_str))
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    pub id: ParamId,
}

#[derive(Debug, PartialEq)]
pub struct FunctionType {
    pub param_types: Vec<Type>,
    pub return_type: Type,
}

#[derive(Debug, Clone)]
pub struct Fn {
    pub name: String,
    pub params: Vec<Param>,
    pub ret_ty: Type,
    pub nodes: Vec<Node>,
    pub ret_node_ref: Option<NodeRef>,
}

impl Fn {
    pub fn get_type(&self) -> FunctionType {
        FunctionType {
            param_types: self.params.iter().map(|p| p.ty.clone()).collect(),
            return_type: self.ret_ty.clone(),
        }
    }

    pub fn node_refs(&self) -> Vec<NodeRef> {
        (0..self.nodes.len()).map(|i| NodeRef { index: i }).collect()
    }

    pub fn get_node(&self, node_ref: NodeRef) -> &Node {
        &self.nodes[node_ref.index]
    }

    pub fn get_node_ty(&self, node_ref: NodeRef) -> &Type {
        &self.get_node(node_ref).ty
    }

    pub fn get_node_mut(&mut self, node_ref: NodeRef) -> &mut Node {
        &mut self.nodes[node_ref.index]
    }
}

fn append_emitted_node_line(out: &mut String, func: &Fn, node_ref: NodeRef) {
    let node = func.get_node(node_ref);
    let is_ret = func.ret_node_ref == Some(node_ref);

    match &node.payload {
        NodePayload::GetParam(pid) if is_ret => {
            let name = node.name.as_deref().unwrap_or("<unnamed>");
            out.push_str(&format!(
                "  ret {}: {} = param(name={}, id={})\n",
                name,
                node.ty,
                name,
                pid.get_wrapped_id()
            ));
        }
        _ => {
            let Some(node_str) = node.to_string(func) else {
                return;
            };
            out.push_str("  ");
            if is_ret {
                out.push_str("ret ");
            }
            out.push_str(&node_str);
            out.push('\n');
        }
    }
}

/// Emits a function as text: signature line, nodes in index order (index
/// order is topological for builder-produced functions), `ret` marking the
/// return line.
pub fn emit_fn(func: &Fn, is_top: bool) -> String {
    let mut out = String::new();
    let params_str = func
        .params
        .iter()
        .map(|p| format!("{}: {} id={}", p.name, p.ty, p.id.get_wrapped_id()))
        .collect::<Vec<String>>()
        .join(", ");
    if is_top {
        out.push_str("top ");
    }
    out.push_str(&format!("fn {}({}) -> {} {{\n", func.name, params_str, func.ret_ty));

    for i in 0..func.nodes.len() {
        append_emitted_node_line(&mut out, func, NodeRef { index: i });
    }

    out.push('}');
    out
}

impl std::fmt::Display for Fn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", emit_fn(self, /* is_top= */ false))
    }
}

#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,
    pub members: Vec<Fn>,
    pub top: Option<String>,
}

impl Package {
    pub fn new(name: &str) -> Self {
        Package {
            name: name.to_string(),
            members: Vec::new(),
            top: None,
        }
    }

    pub fn set_top_fn(&mut self, name: &str) -> Result<(), String> {
        if self.members.iter().any(|f| f.name == name) {
            self.top = Some(name.to_string());
            Ok(())
        } else {
            Err(format!("set_top_fn: function '{}' not found", name))
        }
    }

    pub fn get_top_fn(&self) -> Option<&Fn> {
        match &self.top {
            Some(name) => self.members.iter().find(|f| &f.name == name),
            None => self.members.first(),
        }
    }

    pub fn get_top_fn_mut(&mut self) -> Option<&mut Fn> {
        match self.top.clone() {
            Some(name) => self.members.iter_mut().find(|f| f.name == name),
            None => self.members.first_mut(),
        }
    }

    pub fn get_fn(&self, name: &str) -> Option<&Fn> {
        self.members.iter().find(|f| f.name == name)
    }

    pub fn get_fn_mut(&mut self, name: &str) -> Option<&mut Fn> {
        self.members.iter_mut().find(|f| f.name == name)
    }

    pub fn get_fn_type(&self, name: &str) -> Option<FunctionType> {
        self.get_fn(name).map(|f| f.get_type())
    }
}

impl std::fmt::Display for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "package {}\n\n", self.name)?;
        for (i, member) in self.members.iter().enumerate() {
            let is_top = match &self.top {
                Some(top_name) => &member.name == top_name,
                None => false,
            };
            write!(f, "{}", emit_fn(member, is_top))?;
            if i < self.members.len().saturating_sub(1) {
                write!(f, "\n\n")?;
            } else {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir_builder::FunctionBuilder;
    use pretty_assertions::assert_eq;

    #[test]
    fn emit_add_fn() {
        let mut fb = FunctionBuilder::new("do_add");
        let a = fb.param("a", 8);
        let b = fb.param("b", 8);
        let sum = fb.add(a, b, Some("sum")).unwrap();
        let f = fb.build_with_return_value(sum).unwrap();
        assert_eq!(
            f.to_string(),
            r#"fn do_add(a: bits[8] id=1, b: bits[8] id=2) -> bits[8] {
  ret sum: bits[8] = add(a, b, id=3)
}"#
        );
    }

    #[test]
    fn emit_ret_param_fn() {
        let mut fb = FunctionBuilder::new("passthrough");
        let x = fb.param("x", 16);
        let f = fb.build_with_return_value(x).unwrap();
        assert_eq!(
            f.to_string(),
            r#"fn passthrough(x: bits[16] id=1) -> bits[16] {
  ret x: bits[16] = param(name=x, id=1)
}"#
        );
    }

    #[test]
    fn emit_package_with_top() {
        let mut fb = FunctionBuilder::new("f");
        let x = fb.param("x", 1);
        let f = fb.build_with_return_value(x).unwrap();
        let mut pkg = Package::new("test");
        pkg.members.push(f);
        pkg.set_top_fn("f").unwrap();
        let text = pkg.to_string();
        assert!(text.starts_with("package test\n\ntop fn f("));
    }

    #[test]
    fn nil_tuple_type_display() {
        assert_eq!(Type::nil().to_string(), "()");
        assert_eq!(Type::Bits(7).to_string(), "bits[7]");
        assert_eq!(
            Type::Tuple(vec![Type::Bits(1), Type::Bits(2)]).to_string(),
            "(bits[1], bits[2])"
        );
        assert_eq!(Type::Tuple(vec![Type::Bits(3), Type::Bits(5)]).bit_count(), 8);
    }

    #[test]
    fn side_effecting_payloads() {
        assert!(NodePayload::Receive {
            channel: "c".to_string()
        }
        .is_side_effecting());
        assert!(!NodePayload::Tuple(vec![]).is_side_effecting());
    }
}
