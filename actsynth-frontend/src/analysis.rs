// SPDX-License-Identifier: Apache-2.0

//! Pre-conversion AST analyses: live variables, per-return hit predicates,
//! per-statement modified-variable sets, and weak width inference.
//!
//! All analyses require the module to be lowered first (variable references
//! are `VarRef`s, slice targets are `VarRef`s).

use std::collections::{HashMap, HashSet};

use actsynth_common::status::{Status, StatusResult};

use crate::ast::{AstId, AstNode, Module};
use crate::ops::OpKind;

/// Collects every variable referenced in the body, in first-use order.
///
/// The order is frozen here and becomes the context-slot order of the IR
/// converter, so it must be deterministic.
pub fn collect_live_vars(m: &Module, body: AstId) -> Vec<AstId> {
    let mut seen: HashSet<AstId> = HashSet::new();
    let mut ordered: Vec<AstId> = Vec::new();
    fn walk(m: &Module, id: AstId, seen: &mut HashSet<AstId>, ordered: &mut Vec<AstId>) {
        if let AstNode::VarRef { def } = m.kind(id) {
            if seen.insert(*def) {
                ordered.push(*def);
            }
            return;
        }
        for child in m.children(id) {
            walk(m, child, seen, ordered);
        }
    }
    walk(m, body, &mut seen, &mut ordered);
    ordered
}

/// Computes, for every `Return` statement, the conjunction of branch
/// conditions along the unique path from the body entry to it (the "hit
/// predicate"). The conjunction expressions are fresh detached AST nodes.
pub fn exit_prediction(
    m: &mut Module,
    body: AstId,
) -> StatusResult<Vec<(AstId, AstId)>> {
    let mut exits: Vec<(AstId, AstId)> = Vec::new();
    let mut hit_condition: HashMap<AstId, AstId> = HashMap::new();

    fn visit(
        m: &mut Module,
        stmt: AstId,
        hit_condition: &mut HashMap<AstId, AstId>,
        exits: &mut Vec<(AstId, AstId)>,
    ) -> StatusResult<()> {
        match m.kind(stmt).clone() {
            AstNode::StmtBlock { stmts, .. } => {
                if let Some(&condition) = hit_condition.get(&stmt) {
                    for s in stmts.iter() {
                        hit_condition.insert(*s, condition);
                    }
                }
                for s in stmts {
                    visit(m, s, hit_condition, exits)?;
                }
            }
            AstNode::IfStmt { cond, then_blk } => {
                let pred = match hit_condition.get(&stmt) {
                    Some(&predict) => m.add_binary_op(OpKind::LogicalAnd, predict, cond),
                    None => cond,
                };
                hit_condition.insert(then_blk, pred);
                visit(m, then_blk, hit_condition, exits)?;
            }
            AstNode::IfElseStmt {
                cond,
                then_blk,
                else_blk,
            } => {
                let cond_neg = m.add_unary_op(OpKind::LogicalNot, cond);
                let (then_pred, else_pred) = match hit_condition.get(&stmt) {
                    Some(&predict) => (
                        m.add_binary_op(OpKind::LogicalAnd, predict, cond),
                        m.add_binary_op(OpKind::LogicalAnd, predict, cond_neg),
                    ),
                    None => (cond, cond_neg),
                };
                hit_condition.insert(then_blk, then_pred);
                hit_condition.insert(else_blk, else_pred);
                visit(m, then_blk, hit_condition, exits)?;
                visit(m, else_blk, hit_condition, exits)?;
            }
            AstNode::ReturnStmt => {
                let Some(&pred) = hit_condition.get(&stmt) else {
                    return Err(Status::Internal(
                        "the return statement's hit predicate was not computed".to_string(),
                    ));
                };
                exits.push((stmt, pred));
            }
            _ => {}
        }
        Ok(())
    }

    visit(m, body, &mut hit_condition, &mut exits)?;
    Ok(exits)
}

/// Computes which variables each statement may modify.
pub fn stmt_modified_vars(
    m: &Module,
    body: AstId,
) -> StatusResult<HashMap<AstId, HashSet<AstId>>> {
    let mut result: HashMap<AstId, HashSet<AstId>> = HashMap::new();

    fn visit(
        m: &Module,
        stmt: AstId,
        result: &mut HashMap<AstId, HashSet<AstId>>,
    ) -> StatusResult<()> {
        match m.kind(stmt) {
            AstNode::StmtBlock { stmts, .. } => {
                let mut acc: HashSet<AstId> = HashSet::new();
                for s in stmts.iter() {
                    visit(m, *s, result)?;
                    acc.extend(result.get(s).into_iter().flatten().copied());
                }
                result.insert(stmt, acc);
            }
            AstNode::IfStmt { then_blk, .. } => {
                visit(m, *then_blk, result)?;
                let acc = result.get(then_blk).cloned().unwrap_or_default();
                result.insert(stmt, acc);
            }
            AstNode::IfElseStmt {
                then_blk, else_blk, ..
            } => {
                visit(m, *then_blk, result)?;
                visit(m, *else_blk, result)?;
                let mut acc = result.get(then_blk).cloned().unwrap_or_default();
                acc.extend(result.get(else_blk).into_iter().flatten().copied());
                result.insert(stmt, acc);
            }
            AstNode::AssignStmt { lhs, .. } => {
                let def = match m.kind(*lhs) {
                    AstNode::VarRef { def } => *def,
                    AstNode::BitSlice { target, .. } => match m.kind(*target) {
                        AstNode::VarRef { def } => *def,
                        other => {
                            return Err(Status::Internal(format!(
                                "slice assignment target must be a variable, got {:?}",
                                other
                            )))
                        }
                    },
                    other => {
                        return Err(Status::Internal(format!(
                            "unsupported assignment target: {:?}",
                            other
                        )))
                    }
                };
                result.entry(stmt).or_default().insert(def);
            }
            _ => {
                result.entry(stmt).or_default();
            }
        }
        Ok(())
    }

    visit(m, body, &mut result)?;
    Ok(result)
}

/// Weak width inference: widening-only updates from observed usage.
///
/// A top-level slice `a[h:l]` forces `width(a) >= h+1`; an assignment from a
/// long literal forces `width(a) >= 64 * words`.
pub fn var_size_inference(m: &mut Module, body: AstId) -> StatusResult<()> {
    fn visit(m: &mut Module, id: AstId) -> StatusResult<()> {
        if let AstNode::AssignStmt { lhs, rhs } = m.kind(id) {
            let (lhs, rhs) = (*lhs, *rhs);
            if let (AstNode::VarRef { def }, AstNode::LongIntLiteral { words }) =
                (m.kind(lhs), m.kind(rhs))
            {
                let (def, nwords) = (*def, words.len());
                m.try_update_def_width(def, (nwords * 64) as u32);
            }
        }
        if let AstNode::BitSlice { target, max_bit, .. } = m.kind(id) {
            let (target, max_bit) = (*target, *max_bit);
            match m.kind(target) {
                AstNode::VarRef { def } => {
                    let def = *def;
                    m.try_update_def_width(def, max_bit + 1);
                }
                other => {
                    return Err(Status::Internal(format!(
                        "slice target must be a variable after lowering, got {:?}",
                        other
                    )))
                }
            }
        }
        for child in m.children(id) {
            visit(m, child)?;
        }
        Ok(())
    }
    visit(m, body)
}

/// All analysis results the IR converter consumes.
///
/// Variables are partitioned into globals and locals; only globals
/// participate in the exit merge.
pub struct AstAnalysisInformation {
    pub variables: Vec<AstId>,
    pub global_vars: Vec<AstId>,
    pub local_vars: Vec<AstId>,
    pub exits_predict_expr: Vec<(AstId, AstId)>,
    pub stmt_modified_vars: HashMap<AstId, HashSet<AstId>>,
}

impl AstAnalysisInformation {
    pub fn analyze(m: &mut Module, body: AstId) -> StatusResult<Self> {
        let variables = collect_live_vars(m, body);
        let global_vars: Vec<AstId> = variables
            .iter()
            .copied()
            .filter(|d| m.def_is_global(*d))
            .collect();
        let local_vars: Vec<AstId> = variables
            .iter()
            .copied()
            .filter(|d| !m.def_is_global(*d))
            .collect();
        log::info!(
            "analysis: {} global variables, {} local variables",
            global_vars.len(),
            local_vars.len()
        );

        let exits_predict_expr = exit_prediction(m, body)?;
        let stmt_modified_vars = stmt_modified_vars(m, body)?;
        var_size_inference(m, body)?;

        Ok(AstAnalysisInformation {
            variables,
            global_vars,
            local_vars,
            exits_predict_expr,
            stmt_modified_vars,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(m: &mut Module, name: &str, width: u32) -> AstId {
        let def = m.add_fake_var_def(name, Some(width));
        m.add_var_ref(def)
    }

    #[test]
    fn live_vars_in_first_use_order() {
        let mut m = Module::new();
        let b = var(&mut m, "b", 8);
        let a = var(&mut m, "a", 8);
        let assign = m.add_assign_stmt(a, b);
        let a2 = var(&mut m, "a", 8);
        let c = var(&mut m, "c", 8);
        let assign2 = m.add_assign_stmt(c, a2);
        let body = m.add_stmt_block("body", vec![assign, assign2]);
        m.body = Some(body);

        let vars = collect_live_vars(&m, body);
        let names: Vec<&str> = vars.iter().map(|d| m.def_name(*d)).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn modified_sets_propagate_to_branches() {
        let mut m = Module::new();
        let x = var(&mut m, "x", 8);
        let y = var(&mut m, "y", 8);
        let assign = m.add_assign_stmt(x, y);
        let blk = m.add_stmt_block("b", vec![assign]);
        let cond = var(&mut m, "c", 1);
        let iff = m.add_if_stmt(cond, blk);
        let body = m.add_stmt_block("body", vec![iff]);
        m.body = Some(body);

        let modified = stmt_modified_vars(&m, body).unwrap();
        let x_def = match m.kind(x) {
            AstNode::VarRef { def } => *def,
            _ => panic!(),
        };
        assert!(modified.get(&iff).unwrap().contains(&x_def));
        assert!(modified.get(&body).unwrap().contains(&x_def));
        assert_eq!(modified.get(&iff).unwrap().len(), 1);
    }

    #[test]
    fn return_predicates_conjoin_along_the_path() {
        let mut m = Module::new();
        let ret = m.add_return_stmt();
        let inner_blk = m.add_stmt_block("ib", vec![ret]);
        let c2 = var(&mut m, "c2", 1);
        let inner_if = m.add_if_stmt(c2, inner_blk);
        let outer_blk = m.add_stmt_block("ob", vec![inner_if]);
        let c1 = var(&mut m, "c1", 1);
        let outer_if = m.add_if_stmt(c1, outer_blk);
        let body = m.add_stmt_block("body", vec![outer_if]);
        m.body = Some(body);

        let exits = exit_prediction(&mut m, body).unwrap();
        assert_eq!(exits.len(), 1);
        let (ret_stmt, pred) = exits[0];
        assert_eq!(ret_stmt, ret);
        match m.kind(pred) {
            AstNode::BinaryOp { op, lhs, rhs } => {
                assert_eq!(*op, OpKind::LogicalAnd);
                assert_eq!(*lhs, c1);
                assert_eq!(*rhs, c2);
            }
            other => panic!("expected conjunction, got {:?}", other),
        }
    }

    #[test]
    fn unconditional_return_is_internal_error() {
        let mut m = Module::new();
        let ret = m.add_return_stmt();
        let body = m.add_stmt_block("body", vec![ret]);
        m.body = Some(body);
        let err = exit_prediction(&mut m, body).unwrap_err();
        assert!(matches!(err, Status::Internal(_)));
    }

    #[test]
    fn else_branch_gets_negated_condition() {
        let mut m = Module::new();
        let ret1 = m.add_return_stmt();
        let ret2 = m.add_return_stmt();
        let then_blk = m.add_stmt_block("t", vec![ret1]);
        let else_blk = m.add_stmt_block("e", vec![ret2]);
        let c = var(&mut m, "c", 1);
        let iff = m.add_if_else_stmt(c, then_blk, else_blk);
        let body = m.add_stmt_block("body", vec![iff]);
        m.body = Some(body);

        let exits = exit_prediction(&mut m, body).unwrap();
        assert_eq!(exits.len(), 2);
        assert_eq!(exits[0].1, c);
        match m.kind(exits[1].1) {
            AstNode::UnaryOp { op, operand } => {
                assert_eq!(*op, OpKind::LogicalNot);
                assert_eq!(*operand, c);
            }
            other => panic!("expected negation, got {:?}", other),
        }
    }

    #[test]
    fn width_inference_widens_from_slices_and_long_literals() {
        let mut m = Module::new();
        let def = m.add_fake_var_def("a", Some(8));
        let a = m.add_var_ref(def);
        let slice = m.add_bit_slice(a, 23, 16);
        let v = var(&mut m, "v", 8);
        let assign = m.add_assign_stmt(slice, v);

        let long_def = m.add_fake_var_def("big", Some(8));
        let big = m.add_var_ref(long_def);
        let long_lit = m.add_long_int_literal(vec![0, 0, 0]);
        let assign2 = m.add_assign_stmt(big, long_lit);

        let body = m.add_stmt_block("body", vec![assign, assign2]);
        m.body = Some(body);

        var_size_inference(&mut m, body).unwrap();
        assert_eq!(m.def_width(def), Some(24));
        assert_eq!(m.def_width(long_def), Some(192));
    }
}
