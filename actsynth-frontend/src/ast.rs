// SPDX-License-Identifier: Apache-2.0

//! Arena-owned AST for the action-tree language.
//!
//! The `Module` arena exclusively owns every node; interior references are
//! `AstId` indices. Parent links are indices too and are maintained by every
//! structural mutation. `replace_child` is the single mutation primitive all
//! rewrites go through, which restores the parent invariant in one place.

use std::collections::HashMap;

use crate::ops::{op_kind_to_symbol, op_kind_to_tag, OpKind};
use serde_json::json;

/// Stable index of a node in its module's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AstId(usize);

impl AstId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Width/globality annotation attached to a name reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameAnnotation {
    pub width: u32,
    pub is_global: bool,
}

/// Annotation attached to a field access: the flattened storage location
/// within the named struct variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldAnnotation {
    pub width: u32,
    pub is_global: bool,
    pub struct_var_name: String,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AstNode {
    // Statements.
    StmtBlock {
        name: String,
        stmts: Vec<AstId>,
    },
    AssignStmt {
        lhs: AstId,
        rhs: AstId,
    },
    IfStmt {
        cond: AstId,
        then_blk: AstId,
    },
    IfElseStmt {
        cond: AstId,
        then_blk: AstId,
        else_blk: AstId,
    },
    ReturnStmt,
    NopStmt,
    ExprEvalStmt {
        expr: AstId,
    },
    // Expressions.
    NameRef {
        name: String,
        annotation: Option<NameAnnotation>,
    },
    VarRef {
        def: AstId,
    },
    FieldAccess {
        source: AstId,
        field: String,
        annotation: Option<FieldAnnotation>,
    },
    ArrIndex {
        source: AstId,
        idx: u32,
    },
    BitSlice {
        target: AstId,
        max_bit: u32,
        min_bit: u32,
    },
    Cast {
        expr: AstId,
        cast_to: AstId,
    },
    UnaryOp {
        op: OpKind,
        operand: AstId,
    },
    BinaryOp {
        op: OpKind,
        lhs: AstId,
        rhs: AstId,
    },
    IntLiteral {
        value: u64,
        width: u32,
        name: Option<String>,
    },
    LongIntLiteral {
        words: Vec<u64>,
    },
    BuiltinCall {
        callee: String,
        args: Vec<AstId>,
    },
    // Other.
    TypeAnnotation {
        width: u32,
        name: String,
    },
    FakeVarDef {
        name: String,
        width: Option<u32>,
        is_global: bool,
    },
}

#[derive(Debug)]
struct NodeData {
    kind: AstNode,
    parent: Option<AstId>,
}

/// Arena root. `body` is the top-level statement block.
#[derive(Debug)]
pub struct Module {
    nodes: Vec<NodeData>,
    pub body: Option<AstId>,
    name2def: HashMap<String, AstId>,
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

impl Module {
    pub fn new() -> Self {
        Module {
            nodes: Vec::new(),
            body: None,
            name2def: HashMap::new(),
        }
    }

    fn alloc(&mut self, kind: AstNode) -> AstId {
        self.nodes.push(NodeData { kind, parent: None });
        AstId(self.nodes.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn kind(&self, id: AstId) -> &AstNode {
        &self.nodes[id.0].kind
    }

    pub fn parent(&self, id: AstId) -> Option<AstId> {
        self.nodes[id.0].parent
    }

    /// Sets `parent` as the parent of `id`, asserting the link does not close
    /// a cycle.
    pub fn set_parent(&mut self, id: AstId, parent: Option<AstId>) {
        if let Some(p) = parent {
            let mut cursor = Some(p);
            while let Some(c) = cursor {
                assert!(c != id, "cyclic parenting: node {} reached itself", id.0);
                cursor = self.nodes[c.0].parent;
            }
        }
        self.nodes[id.0].parent = parent;
    }

    /// Replaces `old` with `new` in the child slots of `parent`, re-parenting
    /// `new`. `parent == None` swaps the module body. Returns false when
    /// `old` is not a child of `parent`.
    pub fn replace_child(&mut self, parent: Option<AstId>, old: AstId, new: AstId) -> bool {
        let Some(parent) = parent else {
            if self.body == Some(old) {
                self.body = Some(new);
                self.set_parent(new, None);
                return true;
            }
            return false;
        };
        let mut replaced = false;
        let mut kind = std::mem::replace(&mut self.nodes[parent.0].kind, AstNode::NopStmt);
        {
            let mut swap = |slot: &mut AstId| {
                if *slot == old {
                    *slot = new;
                    replaced = true;
                }
            };
            match &mut kind {
                AstNode::StmtBlock { stmts, .. } => stmts.iter_mut().for_each(&mut swap),
                AstNode::AssignStmt { lhs, rhs } => {
                    swap(lhs);
                    swap(rhs);
                }
                AstNode::IfStmt { cond, then_blk } => {
                    swap(cond);
                    swap(then_blk);
                }
                AstNode::IfElseStmt {
                    cond,
                    then_blk,
                    else_blk,
                } => {
                    swap(cond);
                    swap(then_blk);
                    swap(else_blk);
                }
                AstNode::ExprEvalStmt { expr } => swap(expr),
                AstNode::FieldAccess { source, .. } => swap(source),
                AstNode::ArrIndex { source, .. } => swap(source),
                AstNode::BitSlice { target, .. } => swap(target),
                AstNode::Cast { expr, cast_to } => {
                    swap(expr);
                    swap(cast_to);
                }
                AstNode::UnaryOp { operand, .. } => swap(operand),
                AstNode::BinaryOp { lhs, rhs, .. } => {
                    swap(lhs);
                    swap(rhs);
                }
                AstNode::BuiltinCall { args, .. } => args.iter_mut().for_each(&mut swap),
                AstNode::VarRef { def } => swap(def),
                AstNode::ReturnStmt
                | AstNode::NopStmt
                | AstNode::NameRef { .. }
                | AstNode::IntLiteral { .. }
                | AstNode::LongIntLiteral { .. }
                | AstNode::TypeAnnotation { .. }
                | AstNode::FakeVarDef { .. } => {}
            }
        }
        self.nodes[parent.0].kind = kind;
        if replaced {
            self.set_parent(new, Some(parent));
        }
        replaced
    }

    /// Replaces a block's statement list wholesale, re-parenting each entry.
    pub fn block_replace_stmts(&mut self, block: AstId, new_stmts: Vec<AstId>) {
        for s in new_stmts.iter() {
            self.set_parent(*s, Some(block));
        }
        match &mut self.nodes[block.0].kind {
            AstNode::StmtBlock { stmts, .. } => *stmts = new_stmts,
            other => panic!("block_replace_stmts on non-block node {:?}", other),
        }
    }

    /// Immediate children of a node, in slot order.
    pub fn children(&self, id: AstId) -> Vec<AstId> {
        match self.kind(id) {
            AstNode::StmtBlock { stmts, .. } => stmts.clone(),
            AstNode::AssignStmt { lhs, rhs } => vec![*lhs, *rhs],
            AstNode::IfStmt { cond, then_blk } => vec![*cond, *then_blk],
            AstNode::IfElseStmt {
                cond,
                then_blk,
                else_blk,
            } => vec![*cond, *then_blk, *else_blk],
            AstNode::ExprEvalStmt { expr } => vec![*expr],
            AstNode::FieldAccess { source, .. } => vec![*source],
            AstNode::ArrIndex { source, .. } => vec![*source],
            AstNode::BitSlice { target, .. } => vec![*target],
            AstNode::Cast { expr, cast_to } => vec![*expr, *cast_to],
            AstNode::UnaryOp { operand, .. } => vec![*operand],
            AstNode::BinaryOp { lhs, rhs, .. } => vec![*lhs, *rhs],
            AstNode::BuiltinCall { args, .. } => args.clone(),
            AstNode::VarRef { def } => vec![*def],
            AstNode::ReturnStmt
            | AstNode::NopStmt
            | AstNode::NameRef { .. }
            | AstNode::IntLiteral { .. }
            | AstNode::LongIntLiteral { .. }
            | AstNode::TypeAnnotation { .. }
            | AstNode::FakeVarDef { .. } => vec![],
        }
    }

    pub fn is_stmt_kind(&self, id: AstId) -> bool {
        matches!(
            self.kind(id),
            AstNode::StmtBlock { .. }
                | AstNode::AssignStmt { .. }
                | AstNode::IfStmt { .. }
                | AstNode::IfElseStmt { .. }
                | AstNode::ReturnStmt
                | AstNode::NopStmt
                | AstNode::ExprEvalStmt { .. }
        )
    }

    pub fn is_lvalue_kind(&self, id: AstId) -> bool {
        matches!(
            self.kind(id),
            AstNode::NameRef { .. }
                | AstNode::VarRef { .. }
                | AstNode::FieldAccess { .. }
                | AstNode::ArrIndex { .. }
                | AstNode::BitSlice { .. }
        )
    }

    pub fn is_expr_kind(&self, id: AstId) -> bool {
        self.is_lvalue_kind(id)
            || matches!(
                self.kind(id),
                AstNode::Cast { .. }
                    | AstNode::UnaryOp { .. }
                    | AstNode::BinaryOp { .. }
                    | AstNode::IntLiteral { .. }
                    | AstNode::LongIntLiteral { .. }
                    | AstNode::BuiltinCall { .. }
            )
    }

    /// Number of statements in the subtree rooted at `id`, counting blocks
    /// and branch statements themselves.
    pub fn count_active_stmts(&self, id: AstId) -> u64 {
        match self.kind(id) {
            AstNode::StmtBlock { stmts, .. } => {
                1 + stmts.iter().map(|s| self.count_active_stmts(*s)).sum::<u64>()
            }
            AstNode::IfStmt { then_blk, .. } => 1 + self.count_active_stmts(*then_blk),
            AstNode::IfElseStmt {
                then_blk, else_blk, ..
            } => 1 + self.count_active_stmts(*then_blk) + self.count_active_stmts(*else_blk),
            _ => 1,
        }
    }

    // -- Factories

    pub fn add_stmt_block(&mut self, name: &str, stmts: Vec<AstId>) -> AstId {
        let id = self.alloc(AstNode::StmtBlock {
            name: name.to_string(),
            stmts: stmts.clone(),
        });
        for s in stmts {
            self.set_parent(s, Some(id));
        }
        id
    }

    pub fn add_assign_stmt(&mut self, lhs: AstId, rhs: AstId) -> AstId {
        let id = self.alloc(AstNode::AssignStmt { lhs, rhs });
        self.set_parent(lhs, Some(id));
        self.set_parent(rhs, Some(id));
        id
    }

    pub fn add_if_stmt(&mut self, cond: AstId, then_blk: AstId) -> AstId {
        let id = self.alloc(AstNode::IfStmt { cond, then_blk });
        self.set_parent(cond, Some(id));
        self.set_parent(then_blk, Some(id));
        id
    }

    pub fn add_if_else_stmt(&mut self, cond: AstId, then_blk: AstId, else_blk: AstId) -> AstId {
        let id = self.alloc(AstNode::IfElseStmt {
            cond,
            then_blk,
            else_blk,
        });
        self.set_parent(cond, Some(id));
        self.set_parent(then_blk, Some(id));
        self.set_parent(else_blk, Some(id));
        id
    }

    pub fn add_return_stmt(&mut self) -> AstId {
        self.alloc(AstNode::ReturnStmt)
    }

    pub fn add_nop_stmt(&mut self) -> AstId {
        self.alloc(AstNode::NopStmt)
    }

    pub fn add_expr_eval_stmt(&mut self, expr: AstId) -> AstId {
        let id = self.alloc(AstNode::ExprEvalStmt { expr });
        self.set_parent(expr, Some(id));
        id
    }

    pub fn add_name_ref(&mut self, name: &str) -> AstId {
        self.alloc(AstNode::NameRef {
            name: name.to_string(),
            annotation: None,
        })
    }

    pub fn annotate_name_ref(&mut self, id: AstId, annotation: NameAnnotation) {
        match &mut self.nodes[id.0].kind {
            AstNode::NameRef { annotation: a, .. } => *a = Some(annotation),
            other => panic!("annotate_name_ref on {:?}", other),
        }
    }

    pub fn add_var_ref(&mut self, def: AstId) -> AstId {
        assert!(
            matches!(self.kind(def), AstNode::FakeVarDef { .. }),
            "VarRef must point at a FakeVarDef"
        );
        // The def is interned and shared; it is not re-parented under each
        // reference.
        self.alloc(AstNode::VarRef { def })
    }

    pub fn add_field_access(&mut self, source: AstId, field: &str) -> AstId {
        let id = self.alloc(AstNode::FieldAccess {
            source,
            field: field.to_string(),
            annotation: None,
        });
        self.set_parent(source, Some(id));
        id
    }

    pub fn annotate_field_access(&mut self, id: AstId, annotation: FieldAnnotation) {
        match &mut self.nodes[id.0].kind {
            AstNode::FieldAccess { annotation: a, .. } => *a = Some(annotation),
            other => panic!("annotate_field_access on {:?}", other),
        }
    }

    pub fn add_arr_index(&mut self, source: AstId, idx: u32) -> AstId {
        let id = self.alloc(AstNode::ArrIndex { source, idx });
        self.set_parent(source, Some(id));
        id
    }

    pub fn add_bit_slice(&mut self, target: AstId, max_bit: u32, min_bit: u32) -> AstId {
        assert!(max_bit >= min_bit, "slice [{}:{}] is inverted", max_bit, min_bit);
        let id = self.alloc(AstNode::BitSlice {
            target,
            max_bit,
            min_bit,
        });
        self.set_parent(target, Some(id));
        id
    }

    pub fn add_cast(&mut self, expr: AstId, cast_to: AstId) -> AstId {
        let id = self.alloc(AstNode::Cast { expr, cast_to });
        self.set_parent(expr, Some(id));
        self.set_parent(cast_to, Some(id));
        id
    }

    pub fn add_unary_op(&mut self, op: OpKind, operand: AstId) -> AstId {
        assert!(crate::ops::is_unary_operator(op));
        let id = self.alloc(AstNode::UnaryOp { op, operand });
        self.set_parent(operand, Some(id));
        id
    }

    pub fn add_binary_op(&mut self, op: OpKind, lhs: AstId, rhs: AstId) -> AstId {
        assert!(crate::ops::is_binary_operator(op));
        let id = self.alloc(AstNode::BinaryOp { op, lhs, rhs });
        self.set_parent(lhs, Some(id));
        self.set_parent(rhs, Some(id));
        id
    }

    pub fn add_int_literal(&mut self, value: u64, width: u32, name: Option<&str>) -> AstId {
        self.alloc(AstNode::IntLiteral {
            value,
            width,
            name: name.map(|s| s.to_string()),
        })
    }

    pub fn add_long_int_literal(&mut self, words: Vec<u64>) -> AstId {
        self.alloc(AstNode::LongIntLiteral { words })
    }

    pub fn add_builtin_call(&mut self, callee: &str, args: Vec<AstId>) -> AstId {
        let id = self.alloc(AstNode::BuiltinCall {
            callee: callee.to_string(),
            args: args.clone(),
        });
        for a in args {
            self.set_parent(a, Some(id));
        }
        id
    }

    pub fn add_type_annotation(&mut self, width: u32, name: &str) -> AstId {
        self.alloc(AstNode::TypeAnnotation {
            width,
            name: name.to_string(),
        })
    }

    /// Interns a variable definition by name. A pre-existing def absorbs the
    /// new width via widening-only update.
    pub fn add_fake_var_def(&mut self, name: &str, width: Option<u32>) -> AstId {
        if let Some(&existing) = self.name2def.get(name) {
            if let Some(w) = width {
                self.try_update_def_width(existing, w);
            }
            return existing;
        }
        // By default everything is global.
        let id = self.alloc(AstNode::FakeVarDef {
            name: name.to_string(),
            width,
            is_global: true,
        });
        self.name2def.insert(name.to_string(), id);
        id
    }

    pub fn def_name(&self, def: AstId) -> &str {
        match self.kind(def) {
            AstNode::FakeVarDef { name, .. } => name,
            other => panic!("def_name on {:?}", other),
        }
    }

    pub fn def_width(&self, def: AstId) -> Option<u32> {
        match self.kind(def) {
            AstNode::FakeVarDef { width, .. } => *width,
            other => panic!("def_width on {:?}", other),
        }
    }

    pub fn def_is_global(&self, def: AstId) -> bool {
        match self.kind(def) {
            AstNode::FakeVarDef { is_global, .. } => *is_global,
            other => panic!("def_is_global on {:?}", other),
        }
    }

    pub fn set_def_is_global(&mut self, def: AstId, global: bool) {
        match &mut self.nodes[def.0].kind {
            AstNode::FakeVarDef { is_global, .. } => *is_global = global,
            other => panic!("set_def_is_global on {:?}", other),
        }
    }

    /// Widening-only width update; narrowing attempts are ignored with a
    /// warning. Returns true when the width changed.
    pub fn try_update_def_width(&mut self, def: AstId, new_width: u32) -> bool {
        match &mut self.nodes[def.0].kind {
            AstNode::FakeVarDef { name, width, .. } => match width {
                None => {
                    *width = Some(new_width);
                    true
                }
                Some(w) if *w < new_width => {
                    *width = Some(new_width);
                    true
                }
                Some(w) => {
                    if *w > new_width {
                        log::warn!(
                            "ignoring width narrowing of '{}' from {} to {}",
                            name,
                            w,
                            new_width
                        );
                    }
                    false
                }
            },
            other => panic!("try_update_def_width on {:?}", other),
        }
    }

    pub fn defs(&self) -> impl Iterator<Item = AstId> + '_ {
        self.name2def.values().copied()
    }

    // -- Printing

    pub fn to_string_indented(&self, id: AstId, indent: usize, pad: usize) -> String {
        let pad_str = " ".repeat(pad);
        match self.kind(id) {
            AstNode::StmtBlock { name, stmts } => {
                let mut out = format!("{}{{ // {}\n", pad_str, name);
                for s in stmts {
                    out.push_str(&self.to_string_indented(*s, indent, pad + indent));
                    out.push('\n');
                }
                out.push_str(&format!("{}}}", pad_str));
                out
            }
            AstNode::AssignStmt { lhs, rhs } => format!(
                "{}{} = {};",
                pad_str,
                self.expr_to_string(*lhs),
                self.expr_to_string(*rhs)
            ),
            AstNode::IfStmt { cond, then_blk } => format!(
                "{}if ({})\n{}",
                pad_str,
                self.expr_to_string(*cond),
                self.to_string_indented(*then_blk, indent, pad + indent)
            ),
            AstNode::IfElseStmt {
                cond,
                then_blk,
                else_blk,
            } => format!(
                "{}if ({})\n{}\n{}else\n{}",
                pad_str,
                self.expr_to_string(*cond),
                self.to_string_indented(*then_blk, indent, pad + indent),
                pad_str,
                self.to_string_indented(*else_blk, indent, pad + indent)
            ),
            AstNode::ReturnStmt => format!("{}return;", pad_str),
            AstNode::NopStmt => format!("{}nop;", pad_str),
            AstNode::ExprEvalStmt { expr } => {
                format!("{}{};", pad_str, self.expr_to_string(*expr))
            }
            _ => format!("{}{}", pad_str, self.expr_to_string(id)),
        }
    }

    pub fn expr_to_string(&self, id: AstId) -> String {
        match self.kind(id) {
            AstNode::NameRef { name, .. } => name.clone(),
            AstNode::VarRef { def } => self.def_name(*def).to_string(),
            AstNode::FieldAccess { source, field, .. } => {
                format!("{}.{}", self.expr_to_string(*source), field)
            }
            AstNode::ArrIndex { source, idx } => {
                format!("{}[{}]", self.expr_to_string(*source), idx)
            }
            AstNode::BitSlice {
                target,
                max_bit,
                min_bit,
            } => format!("{}[{}:{}]", self.expr_to_string(*target), max_bit, min_bit),
            AstNode::Cast { expr, cast_to } => match self.kind(*cast_to) {
                AstNode::TypeAnnotation { width, name } => format!(
                    "({}<{}>){}",
                    name,
                    width,
                    self.expr_to_string(*expr)
                ),
                _ => format!("(?){}", self.expr_to_string(*expr)),
            },
            AstNode::UnaryOp { op, operand } => {
                format!("{}({})", op_kind_to_symbol(*op), self.expr_to_string(*operand))
            }
            AstNode::BinaryOp { op, lhs, rhs } => format!(
                "({} {} {})",
                self.expr_to_string(*lhs),
                op_kind_to_symbol(*op),
                self.expr_to_string(*rhs)
            ),
            AstNode::IntLiteral { value, name, .. } => match name {
                Some(n) if n != "int_lit" => n.clone(),
                _ => value.to_string(),
            },
            AstNode::LongIntLiteral { words } => {
                let parts: Vec<String> = words.iter().map(|w| w.to_string()).collect();
                format!("{{{}}}", parts.join(", "))
            }
            AstNode::BuiltinCall { callee, args } => {
                let parts: Vec<String> = args.iter().map(|a| self.expr_to_string(*a)).collect();
                format!("{}({})", callee, parts.join(", "))
            }
            AstNode::TypeAnnotation { width, name } => format!("{}<{}>", name, width),
            AstNode::FakeVarDef { name, .. } => name.clone(),
            other => format!("<stmt {:?}>", other),
        }
    }

    // -- JSON dump (inverse of the parser)

    pub fn to_json(&self, id: AstId) -> serde_json::Value {
        match self.kind(id) {
            AstNode::StmtBlock { name, stmts } => json!({
                "TYNAME": "BLOCK",
                "OP0": { "TYNAME": "IDENT", "STRING": name },
                "OP1": {
                    "TYNAME": "LIST",
                    "VALUES": stmts.iter().map(|s| self.to_json(*s)).collect::<Vec<_>>(),
                },
            }),
            AstNode::AssignStmt { lhs, rhs } => json!({
                "TYNAME": "ASSIGN",
                "OP0": self.to_json(*lhs),
                "OP1": self.to_json(*rhs),
            }),
            AstNode::IfStmt { cond, then_blk } => json!({
                "TYNAME": "IF",
                "OP0": self.to_json(*cond),
                "OP1": self.to_json(*then_blk),
            }),
            AstNode::IfElseStmt {
                cond,
                then_blk,
                else_blk,
            } => json!({
                "TYNAME": "IF",
                "OP0": self.to_json(*cond),
                "OP1": self.to_json(*then_blk),
                "OP2": self.to_json(*else_blk),
            }),
            AstNode::ReturnStmt => json!({ "TYNAME": "RETURN" }),
            AstNode::NopStmt => json!({ "TYNAME": "NOP" }),
            AstNode::ExprEvalStmt { expr } => self.to_json(*expr),
            AstNode::NameRef { name, annotation } => {
                let mut obj = json!({ "TYNAME": "IDENT", "STRING": name });
                if let Some(a) = annotation {
                    obj["SIZE"] = json!(a.width);
                    obj["GLOBAL"] = json!(if a.is_global { 1 } else { 0 });
                }
                obj
            }
            AstNode::VarRef { def } => self.to_json(*def),
            AstNode::FieldAccess {
                source,
                field,
                annotation,
            } => {
                let mut obj = json!({
                    "TYNAME": "DOT",
                    "OP0": self.to_json(*source),
                    "OP1": { "TYNAME": "IDENT", "STRING": field },
                });
                if let Some(a) = annotation {
                    obj["SIZE"] = json!(a.width);
                    obj["GLOBAL"] = json!(if a.is_global { 1 } else { 0 });
                    obj["STRUCT"] = json!(a.struct_var_name);
                    obj["OFFSET"] = json!(a.offset);
                }
                obj
            }
            AstNode::ArrIndex { source, idx } => json!({
                "TYNAME": "INDEX",
                "OP0": self.to_json(*source),
                "OP1": { "TYNAME": "INT_LIT", "INT": reverse_decimal(*idx as u64) },
            }),
            AstNode::BitSlice {
                target,
                max_bit,
                min_bit,
            } => json!({
                "TYNAME": "SLICE",
                "OP0": self.to_json(*target),
                "OP1": { "TYNAME": "INT_LIT", "INT": reverse_decimal(*max_bit as u64) },
                "OP2": { "TYNAME": "INT_LIT", "INT": reverse_decimal(*min_bit as u64) },
            }),
            AstNode::Cast { expr, cast_to } => json!({
                "TYNAME": "CAST",
                "OP0": self.to_json(*expr),
                "OP1": self.to_json(*cast_to),
            }),
            AstNode::UnaryOp { op, operand } => json!({
                "TYNAME": op_kind_to_tag(*op),
                "OP0": self.to_json(*operand),
            }),
            AstNode::BinaryOp { op, lhs, rhs } => json!({
                "TYNAME": op_kind_to_tag(*op),
                "OP0": self.to_json(*lhs),
                "OP1": self.to_json(*rhs),
            }),
            AstNode::IntLiteral { value, name, .. } => match name {
                Some(n) if n != "int_lit" => json!({
                    "TYNAME": "IDENT",
                    "STRING": n,
                    "VALUE": value,
                }),
                _ => json!({ "TYNAME": "INT_LIT", "INT": reverse_decimal(*value) }),
            },
            AstNode::LongIntLiteral { words } => json!({
                "TYNAME": "LIST",
                "VALUES": words
                    .iter()
                    .map(|w| json!({ "TYNAME": "INT_LIT", "INT": reverse_decimal(*w) }))
                    .collect::<Vec<_>>(),
            }),
            AstNode::BuiltinCall { callee, args } => json!({
                "TYNAME": "FUNCTION_CALL",
                "OP0": { "TYNAME": "IDENT", "STRING": callee },
                "OP1": {
                    "TYNAME": "LIST",
                    "VALUES": args.iter().map(|a| self.to_json(*a)).collect::<Vec<_>>(),
                },
            }),
            AstNode::TypeAnnotation { width, name } => json!({
                "TYNAME": "IDENT",
                "STRING": name,
                "TYPESIZE": width,
            }),
            AstNode::FakeVarDef {
                name,
                width,
                is_global,
            } => {
                let mut obj = json!({ "TYNAME": "IDENT", "STRING": name });
                if let Some(w) = width {
                    obj["SIZE"] = json!(w);
                    obj["GLOBAL"] = json!(if *is_global { 1 } else { 0 });
                }
                obj
            }
        }
    }
}

/// Integer literals travel as character-reversed decimal strings in the AST
/// JSON.
pub fn reverse_decimal(value: u64) -> String {
    value.to_string().chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn replace_child_updates_slot_and_parent() {
        let mut m = Module::new();
        let a = m.add_name_ref("a");
        let b = m.add_name_ref("b");
        let sum = m.add_binary_op(OpKind::Plus, a, b);
        let c = m.add_name_ref("c");
        assert!(m.replace_child(Some(sum), b, c));
        match m.kind(sum) {
            AstNode::BinaryOp { lhs, rhs, .. } => {
                assert_eq!(*lhs, a);
                assert_eq!(*rhs, c);
            }
            _ => panic!(),
        }
        assert_eq!(m.parent(c), Some(sum));
        assert!(!m.replace_child(Some(sum), b, c));
    }

    #[test]
    fn replace_module_body() {
        let mut m = Module::new();
        let old = m.add_stmt_block("old", vec![]);
        m.body = Some(old);
        let new = m.add_stmt_block("new", vec![]);
        assert!(m.replace_child(None, old, new));
        assert_eq!(m.body, Some(new));
    }

    #[test]
    #[should_panic(expected = "cyclic parenting")]
    fn parent_cycle_is_rejected() {
        let mut m = Module::new();
        let a = m.add_name_ref("a");
        let not = m.add_unary_op(OpKind::LogicalNot, a);
        // Try to make `not` a child of its own descendant.
        m.set_parent(not, Some(a));
    }

    #[test]
    fn fake_var_defs_are_interned_and_widened() {
        let mut m = Module::new();
        let d1 = m.add_fake_var_def("hdr", Some(16));
        let d2 = m.add_fake_var_def("hdr", Some(32));
        assert_eq!(d1, d2);
        assert_eq!(m.def_width(d1), Some(32));
        // Narrowing is ignored.
        let d3 = m.add_fake_var_def("hdr", Some(8));
        assert_eq!(d3, d1);
        assert_eq!(m.def_width(d1), Some(32));
    }

    #[test]
    fn count_active_stmts_counts_nesting() {
        let mut m = Module::new();
        let r = m.add_return_stmt();
        let inner = m.add_stmt_block("inner", vec![r]);
        let cond = m.add_name_ref("c");
        let iff = m.add_if_stmt(cond, inner);
        let nop = m.add_nop_stmt();
        let body = m.add_stmt_block("body", vec![iff, nop]);
        // body + if + inner + return + nop
        assert_eq!(m.count_active_stmts(body), 5);
    }

    #[test]
    fn reversed_decimal_literals() {
        assert_eq!(reverse_decimal(123), "321");
        assert_eq!(reverse_decimal(0), "0");
        assert_eq!(reverse_decimal(100), "001");
    }

    #[test]
    fn json_dump_shape() {
        let mut m = Module::new();
        let a = m.add_name_ref("a");
        let slice = m.add_bit_slice(a, 59, 10);
        let v = m.to_json(slice);
        assert_eq!(v["TYNAME"], "SLICE");
        assert_eq!(v["OP1"]["INT"], "95");
        assert_eq!(v["OP2"]["INT"], "01");
    }

    #[test]
    fn printer_smoke() {
        let mut m = Module::new();
        let a = m.add_name_ref("a");
        let b = m.add_name_ref("b");
        let sum = m.add_binary_op(OpKind::Plus, a, b);
        let x = m.add_name_ref("x");
        let assign = m.add_assign_stmt(x, sum);
        let body = m.add_stmt_block("body", vec![assign]);
        let text = m.to_string_indented(body, 2, 0);
        assert!(text.contains("x = (a + b);"));
    }
}
