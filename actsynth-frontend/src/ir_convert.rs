// SPDX-License-Identifier: Apache-2.0

//! AST-to-IR conversion.
//!
//! The converter performs variable-granularity SSA: a context (one IR value
//! per live variable, slot order frozen at entry) is threaded through every
//! statement. Branches produce `sel` nodes per modified variable; the exit
//! merge composes per-return contexts with a one-hot-encoded priority among
//! the return hit predicates.

use std::collections::HashMap;

use actsynth_common::status::{Status, StatusResult};
use actsynth_ir::ir::Package;
use actsynth_ir::ir_builder::{BValue, FunctionBuilder};

use crate::analysis::AstAnalysisInformation;
use crate::ast::{AstId, AstNode, Module};
use crate::lowering::{lowering_transform, LoweringInfo};
use crate::mapping::LoweringMapping;
use crate::ops::OpKind;

/// Per-variable value vector; the converter's SSA state.
type Context = Vec<BValue>;

pub struct ActionIrConverter<'a> {
    module: &'a Module,
    analysis: &'a AstAnalysisInformation,
    mapping: Option<&'a mut LoweringMapping>,
    builder: FunctionBuilder,

    input_ctx: Context,
    def2idx: HashMap<AstId, usize>,

    expr_value: HashMap<AstId, BValue>,
    stmt_in_ctx: HashMap<AstId, Context>,
    stmt_out_ctx: HashMap<AstId, Context>,
}

fn internal(e: String) -> Status {
    Status::Internal(e)
}

impl<'a> ActionIrConverter<'a> {
    pub fn new(
        module: &'a Module,
        func_name: &str,
        analysis: &'a AstAnalysisInformation,
        mapping: Option<&'a mut LoweringMapping>,
    ) -> StatusResult<Self> {
        let mut builder = FunctionBuilder::new(func_name);
        let mut input_ctx = Context::new();
        let mut def2idx = HashMap::new();

        // One parameter per live variable, in frozen analysis order.
        for def in analysis.variables.iter() {
            let width = module.def_width(*def).ok_or_else(|| {
                Status::Internal(format!(
                    "variable '{}' has no resolved width",
                    module.def_name(*def)
                ))
            })?;
            def2idx.insert(*def, input_ctx.len());
            input_ctx.push(builder.param(module.def_name(*def), width as usize));
        }

        Ok(ActionIrConverter {
            module,
            analysis,
            mapping,
            builder,
            input_ctx,
            def2idx,
            expr_value: HashMap::new(),
            stmt_in_ctx: HashMap::new(),
            stmt_out_ctx: HashMap::new(),
        })
    }

    /// Converts the body and assembles the exit merge; the function returns a
    /// tuple of final global-variable values.
    pub fn build(mut self, body: AstId) -> StatusResult<actsynth_ir::ir::Fn> {
        let input_ctx = self.input_ctx.clone();
        let ctx_without_return = self.visit_stmt(body, &input_ctx)?;

        let global_var_idx: Vec<usize> = self
            .analysis
            .global_vars
            .iter()
            .map(|def| self.def2idx[def])
            .collect();

        let exit_no = self.analysis.exits_predict_expr.len();
        let var_no = global_var_idx.len();

        // Per-variable candidate values, one per return plus the fallthrough.
        // Case order matches the one-hot selector bits: the predicate concat
        // puts the first return at the most significant bit, so cases list
        // the returns last-first, with the all-zeros bit selecting the
        // fallthrough context.
        let mut exit_predict_bits: Vec<BValue> = Vec::with_capacity(exit_no);
        let mut per_return_ctx: Vec<Context> = Vec::with_capacity(exit_no);
        let exits = self.analysis.exits_predict_expr.clone();
        for (ret_stmt, predict_expr) in exits.iter() {
            let ctx = self
                .stmt_in_ctx
                .get(ret_stmt)
                .ok_or_else(|| {
                    Status::Internal("return statement context was not recorded".to_string())
                })?
                .clone();
            let bit = self.visit_expr(*predict_expr, &ctx, None)?;
            let bit = self.as_bool(bit)?;
            exit_predict_bits.push(bit);
            per_return_ctx.push(
                self.stmt_out_ctx
                    .get(ret_stmt)
                    .ok_or_else(|| {
                        Status::Internal("return statement context was not recorded".to_string())
                    })?
                    .clone(),
            );
        }

        let mut output_ctx: Context = Vec::with_capacity(var_no);
        if exit_no == 0 {
            for i in 0..var_no {
                output_ctx.push(ctx_without_return[global_var_idx[i]]);
            }
        } else {
            let predict = self
                .builder
                .concat(&exit_predict_bits, Some("predict"))
                .map_err(internal)?;
            let control_encoding = self
                .builder
                .one_hot(predict, /* lsb_prio= */ false, Some("predict_one_hot"))
                .map_err(internal)?;
            for i in 0..var_no {
                let idx = global_var_idx[i];
                let mut cases: Vec<BValue> = Vec::with_capacity(exit_no + 1);
                for ret in (0..exit_no).rev() {
                    cases.push(per_return_ctx[ret][idx]);
                }
                cases.push(ctx_without_return[idx]);
                let name = format!(
                    "final_{}",
                    self.module.def_name(self.analysis.global_vars[i])
                );
                output_ctx.push(
                    self.builder
                        .one_hot_select(control_encoding, &cases, Some(&name))
                        .map_err(internal)?,
                );
            }
        }

        let body_value = self.builder.tuple(&output_ctx, Some("body"));
        self.builder.build_with_return_value(body_value).map_err(internal)
    }

    fn def_idx(&self, def: AstId) -> StatusResult<usize> {
        self.def2idx.get(&def).copied().ok_or_else(|| {
            Status::Internal(format!(
                "variable '{}' is not in the conversion context",
                self.module.def_name(def)
            ))
        })
    }

    fn def_width(&self, def: AstId) -> StatusResult<usize> {
        self.module
            .def_width(def)
            .map(|w| w as usize)
            .ok_or_else(|| Status::Internal("variable width unresolved".to_string()))
    }

    /// Zero-extends or truncates `value` to `new_width`.
    fn change_size(
        &mut self,
        value: BValue,
        new_width: usize,
        name: Option<&str>,
    ) -> StatusResult<BValue> {
        let old_width = self.builder.bit_count(value).map_err(internal)?;
        if old_width == new_width {
            return Ok(value);
        }
        if old_width < new_width {
            return self
                .builder
                .zero_extend(value, new_width, name)
                .map_err(internal);
        }
        self.builder
            .bit_slice(value, 0, new_width, name)
            .map_err(internal)
    }

    /// Reduces a value to one bit: `v != 0` unless it already is one bit.
    fn as_bool(&mut self, value: BValue) -> StatusResult<BValue> {
        let width = self.builder.bit_count(value).map_err(internal)?;
        if width == 1 {
            return Ok(value);
        }
        let zero = self.builder.literal_u64(0, width);
        self.builder.ne(value, zero, None).map_err(internal)
    }

    // -- Statements

    fn visit_stmt(&mut self, stmt: AstId, ctx: &Context) -> StatusResult<Context> {
        self.stmt_in_ctx.insert(stmt, ctx.clone());
        let result = match self.module.kind(stmt).clone() {
            AstNode::StmtBlock { stmts, .. } => {
                let mut cur = ctx.clone();
                for s in stmts {
                    cur = self.visit_stmt(s, &cur)?;
                }
                Ok(cur)
            }
            AstNode::IfStmt { cond, then_blk } => self.visit_if(stmt, cond, then_blk, ctx),
            AstNode::IfElseStmt {
                cond,
                then_blk,
                else_blk,
            } => self.visit_if_else(stmt, cond, then_blk, else_blk, ctx),
            AstNode::AssignStmt { lhs, rhs } => self.visit_assign(lhs, rhs, ctx),
            AstNode::ExprEvalStmt { expr } => self.visit_expr_eval(expr, ctx),
            AstNode::ReturnStmt | AstNode::NopStmt => Ok(ctx.clone()),
            other => Err(Status::Internal(format!(
                "unsupported statement kind in conversion: {:?}",
                other
            ))),
        }?;
        if result.len() != ctx.len() {
            return Err(Status::Internal(
                "statement conversion changed the context length".to_string(),
            ));
        }
        self.stmt_out_ctx.insert(stmt, result.clone());
        Ok(result)
    }

    fn visit_if(
        &mut self,
        stmt: AstId,
        cond: AstId,
        then_blk: AstId,
        ctx: &Context,
    ) -> StatusResult<Context> {
        let selector = self.visit_expr(cond, ctx, Some("if_cond"))?;
        let selector = self.as_bool(selector)?;
        let then_ctx = self.visit_stmt(then_blk, ctx)?;

        let mut result = ctx.clone();
        let modified = self
            .analysis
            .stmt_modified_vars
            .get(&stmt)
            .cloned()
            .unwrap_or_default();
        for def in sorted_defs(&modified, &self.def2idx) {
            let idx = self.def_idx(def)?;
            if then_ctx[idx] != ctx[idx] {
                let name = format!("sel_{}", self.module.def_name(def));
                result[idx] = self
                    .builder
                    .select(selector, then_ctx[idx], ctx[idx], Some(&name))
                    .map_err(internal)?;
            }
        }
        Ok(result)
    }

    fn visit_if_else(
        &mut self,
        stmt: AstId,
        cond: AstId,
        then_blk: AstId,
        else_blk: AstId,
        ctx: &Context,
    ) -> StatusResult<Context> {
        let selector = self.visit_expr(cond, ctx, Some("if_else_cond"))?;
        let selector = self.as_bool(selector)?;
        let then_ctx = self.visit_stmt(then_blk, ctx)?;
        let else_ctx = self.visit_stmt(else_blk, ctx)?;

        let mut result = ctx.clone();
        let modified = self
            .analysis
            .stmt_modified_vars
            .get(&stmt)
            .cloned()
            .unwrap_or_default();
        for def in sorted_defs(&modified, &self.def2idx) {
            let idx = self.def_idx(def)?;
            if then_ctx[idx] != ctx[idx] || else_ctx[idx] != ctx[idx] {
                let name = format!("sel_{}", self.module.def_name(def));
                result[idx] = self
                    .builder
                    .select(selector, then_ctx[idx], else_ctx[idx], Some(&name))
                    .map_err(internal)?;
            }
        }
        Ok(result)
    }

    fn visit_assign(&mut self, lhs: AstId, rhs: AstId, ctx: &Context) -> StatusResult<Context> {
        let mut result = ctx.clone();
        let rhs_value = self.visit_expr(rhs, ctx, None)?;

        match self.module.kind(lhs).clone() {
            AstNode::VarRef { def } => {
                let idx = self.def_idx(def)?;
                let width = self.def_width(def)?;
                let name = self.module.def_name(def).to_string();
                result[idx] = self.change_size(rhs_value, width, Some(&name))?;
            }
            AstNode::BitSlice {
                target,
                max_bit,
                min_bit,
            } => {
                let def = match self.module.kind(target) {
                    AstNode::VarRef { def } => *def,
                    other => {
                        return Err(Status::Internal(format!(
                            "slice assignment target must be a variable, got {:?}",
                            other
                        )))
                    }
                };
                let idx = self.def_idx(def)?;
                let slice_size = (max_bit - min_bit + 1) as usize;
                let rhs_resized = self.change_size(rhs_value, slice_size, None)?;
                let start = self
                    .builder
                    .literal_u64(min_bit as u64, 64);
                let name = format!("{}_slice_update", self.module.def_name(def));
                result[idx] = self
                    .builder
                    .bit_slice_update(result[idx], start, rhs_resized, Some(&name))
                    .map_err(internal)?;
            }
            other => {
                return Err(Status::Internal(format!(
                    "unsupported assignment target: {:?}",
                    other
                )))
            }
        }
        Ok(result)
    }

    /// Observational builtins have no IR effect; the context passes through.
    fn visit_expr_eval(&mut self, expr: AstId, ctx: &Context) -> StatusResult<Context> {
        match self.module.kind(expr) {
            AstNode::BuiltinCall { callee, .. }
                if callee == "_get_anchor"
                    || callee == "_stack_push_h"
                    || callee == "_stack_push_b" =>
            {
                Ok(ctx.clone())
            }
            other => Err(Status::Internal(format!(
                "unsupported expression statement: {:?}",
                other
            ))),
        }
    }

    // -- Expressions

    fn visit_expr(
        &mut self,
        expr: AstId,
        ctx: &Context,
        name: Option<&str>,
    ) -> StatusResult<BValue> {
        if let Some(v) = self.expr_value.get(&expr) {
            return Ok(*v);
        }
        let result = match self.module.kind(expr).clone() {
            AstNode::VarRef { def } => {
                let idx = self.def_idx(def)?;
                Ok(ctx[idx])
            }
            AstNode::BitSlice {
                target,
                max_bit,
                min_bit,
            } => {
                let target_value = self.visit_expr(target, ctx, name)?;
                self.builder
                    .bit_slice(
                        target_value,
                        min_bit as usize,
                        (max_bit - min_bit + 1) as usize,
                        name,
                    )
                    .map_err(internal)
            }
            AstNode::Cast { expr: inner, cast_to } => {
                let value = self.visit_expr(inner, ctx, name)?;
                let (width, ty_name) = match self.module.kind(cast_to) {
                    AstNode::TypeAnnotation { width, name } => (*width as usize, name.clone()),
                    other => {
                        return Err(Status::Internal(format!(
                            "cast target must be a type annotation, got {:?}",
                            other
                        )))
                    }
                };
                let cast_name = format!("cast_{}", ty_name);
                self.change_size(value, width, Some(&cast_name))
            }
            AstNode::UnaryOp { op, operand } => self.visit_unary_op(op, operand, ctx, name),
            AstNode::BinaryOp { op, lhs, rhs } => self.visit_binary_op(op, lhs, rhs, ctx, name),
            AstNode::IntLiteral {
                value,
                width,
                name: lit_name,
            } => {
                let label = match &lit_name {
                    Some(n) if n != "int_lit" => n.clone(),
                    _ => format!("const_{}", value),
                };
                Ok(self.builder.literal(
                    actsynth_ir::bits::Bits::from_u64(value, width as usize),
                    Some(&label),
                ))
            }
            AstNode::LongIntLiteral { words } => Ok(self.builder.literal(
                actsynth_ir::bits::Bits::from_words(words.clone()),
                name.or(Some("long_literal")),
            )),
            AstNode::BuiltinCall { callee, args } => {
                self.visit_builtin_call(&callee, &args, ctx, name)
            }
            AstNode::NameRef { name: n, .. } => Err(Status::Internal(format!(
                "name reference '{}' survived lowering",
                n
            ))),
            other => Err(Status::Internal(format!(
                "unsupported expression kind in conversion: {:?}",
                other
            ))),
        }?;
        self.expr_value.insert(expr, result);
        if let Some(mapping) = self.mapping.as_deref_mut() {
            mapping.node2ast.insert(result.node_ref(), expr);
        }
        Ok(result)
    }

    fn visit_unary_op(
        &mut self,
        op: OpKind,
        operand: AstId,
        ctx: &Context,
        name: Option<&str>,
    ) -> StatusResult<BValue> {
        let operand_value = self.visit_expr(operand, ctx, None)?;
        match op {
            OpKind::BitwiseNot => self.builder.not(operand_value, name).map_err(internal),
            OpKind::LogicalNot => {
                let as_bool = self.as_bool(operand_value)?;
                self.builder.not(as_bool, name).map_err(internal)
            }
            other => Err(Status::Internal(format!(
                "not a unary operation: {:?}",
                other
            ))),
        }
    }

    fn visit_binary_op(
        &mut self,
        op: OpKind,
        lhs: AstId,
        rhs: AstId,
        ctx: &Context,
        name: Option<&str>,
    ) -> StatusResult<BValue> {
        // Shifts widen the shifted value to 64 bits first.
        if op == OpKind::LeftShift || op == OpKind::RightShift {
            let lhs_value = self.visit_expr(lhs, ctx, None)?;
            let lhs_wide = self.change_size(lhs_value, 64, None)?;
            let rhs_value = self.visit_expr(rhs, ctx, None)?;
            return match op {
                OpKind::LeftShift => self.builder.shll(lhs_wide, rhs_value, name).map_err(internal),
                _ => self.builder.shrl(lhs_wide, rhs_value, name).map_err(internal),
            };
        }

        // Logical connectives compare each side against zero first.
        if op == OpKind::LogicalAnd || op == OpKind::LogicalOr {
            let lhs_value = self.visit_expr(lhs, ctx, None)?;
            let rhs_value = self.visit_expr(rhs, ctx, None)?;
            let lhs_bool = self.as_bool(lhs_value)?;
            let rhs_bool = self.as_bool(rhs_value)?;
            return match op {
                OpKind::LogicalAnd => self
                    .builder
                    .and(&[lhs_bool, rhs_bool], name)
                    .map_err(internal),
                _ => self.builder.or(&[lhs_bool, rhs_bool], name).map_err(internal),
            };
        }

        // Everything else zero-extends the narrower operand to the wider.
        let lhs_value = self.visit_expr(lhs, ctx, None)?;
        let rhs_value = self.visit_expr(rhs, ctx, None)?;
        let lhs_width = self.builder.bit_count(lhs_value).map_err(internal)?;
        let rhs_width = self.builder.bit_count(rhs_value).map_err(internal)?;
        let (a, b) = if lhs_width > rhs_width {
            let widened = self.change_size(rhs_value, lhs_width, None)?;
            (lhs_value, widened)
        } else if rhs_width > lhs_width {
            let widened = self.change_size(lhs_value, rhs_width, None)?;
            (widened, rhs_value)
        } else {
            (lhs_value, rhs_value)
        };

        match op {
            OpKind::Plus => self.builder.add(a, b, name).map_err(internal),
            OpKind::Minus => self.builder.sub(a, b, name).map_err(internal),
            OpKind::Mul => self.builder.umul(a, b, name).map_err(internal),
            OpKind::Div => self.builder.udiv(a, b, name).map_err(internal),
            OpKind::BitwiseAnd => self.builder.and(&[a, b], name).map_err(internal),
            OpKind::BitwiseOr => self.builder.or(&[a, b], name).map_err(internal),
            OpKind::Equal => self.builder.eq(a, b, name).map_err(internal),
            OpKind::NotEqual => self.builder.ne(a, b, name).map_err(internal),
            OpKind::GreaterEqual => self.builder.uge(a, b, name).map_err(internal),
            OpKind::GreaterThan => self.builder.ugt(a, b, name).map_err(internal),
            OpKind::LessEqual => self.builder.ule(a, b, name).map_err(internal),
            OpKind::LessThan => self.builder.ult(a, b, name).map_err(internal),
            other => Err(Status::Internal(format!(
                "not a binary operation: {:?}",
                other
            ))),
        }
    }

    fn visit_builtin_call(
        &mut self,
        callee: &str,
        args: &[AstId],
        ctx: &Context,
        _name: Option<&str>,
    ) -> StatusResult<BValue> {
        if args.len() != 1 {
            return Err(Status::Internal(format!(
                "builtin '{}' expects one argument, got {}",
                callee,
                args.len()
            )));
        }
        match callee {
            "sizeof" => {
                let arg_value = self.visit_expr(args[0], ctx, None)?;
                let width = self.builder.bit_count(arg_value).map_err(internal)?;
                Ok(self.builder.literal_u64(width as u64, 64))
            }
            "_get_anchor" | "_stack_push_h" | "_stack_push_b" => {
                // Observational builtins evaluate to their argument.
                self.visit_expr(args[0], ctx, None)
            }
            other => Err(Status::Internal(format!(
                "unsupported builtin call '{}'",
                other
            ))),
        }
    }
}

/// Deterministic iteration order for a modified-variable set: context slot
/// order.
fn sorted_defs(set: &std::collections::HashSet<AstId>, def2idx: &HashMap<AstId, usize>) -> Vec<AstId> {
    let mut defs: Vec<AstId> = set.iter().copied().collect();
    defs.sort_by_key(|d| def2idx.get(d).copied().unwrap_or(usize::MAX));
    defs
}

/// Lowers `module` in place, analyzes it, and converts the body into an IR
/// package with a single `action` function.
pub fn convert_module_to_package(
    module: &mut Module,
    mut mapping: Option<&mut LoweringMapping>,
) -> StatusResult<Package> {
    let mut lowering_info = LoweringInfo::default();
    lowering_transform(
        &mut lowering_info,
        module,
        /* delimiter= */ ".",
        /* need_verify= */ true,
        mapping.as_deref_mut(),
    )?;

    let body = module
        .body
        .ok_or_else(|| Status::Internal("module has no body".to_string()))?;
    let analysis = AstAnalysisInformation::analyze(module, body)?;

    let converter = ActionIrConverter::new(module, "action", &analysis, mapping.as_deref_mut())?;
    let function = converter.build(body)?;

    let mut package = Package::new("actions");
    package.members.push(function);
    package.set_top_fn("action").map_err(Status::Internal)?;
    Ok(package)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::NameAnnotation;
    use actsynth_ir::ir::{NodePayload, Type};
    use actsynth_ir::ir_verify::verify_fn;

    fn annotated_name_ref(m: &mut Module, name: &str, width: u32) -> AstId {
        let id = m.add_name_ref(name);
        m.annotate_name_ref(
            id,
            NameAnnotation {
                width,
                is_global: true,
            },
        );
        id
    }

    /// `{ out = in; return; }` should produce a tiny IR with a tuple return.
    #[test]
    fn trivial_identity_action() {
        let mut m = Module::new();
        let out = annotated_name_ref(&mut m, "out", 32);
        let inp = annotated_name_ref(&mut m, "in", 32);
        let assign = m.add_assign_stmt(out, inp);
        let body = m.add_stmt_block("body", vec![assign]);
        m.body = Some(body);

        let pkg = convert_module_to_package(&mut m, None).unwrap();
        let f = pkg.get_top_fn().unwrap();
        assert!(verify_fn(f).is_ok());
        assert_eq!(f.params.len(), 2);
        // Return value is a tuple of the final global values.
        let ret = f.get_node(f.ret_node_ref.unwrap());
        assert!(matches!(ret.payload, NodePayload::Tuple(_)));
        assert_eq!(
            f.ret_ty,
            Type::Tuple(vec![Type::Bits(32), Type::Bits(32)])
        );
        // No selects or one-hots: straight-line code.
        assert!(!f
            .nodes
            .iter()
            .any(|n| matches!(n.payload, NodePayload::Sel { .. } | NodePayload::OneHotSel { .. })));
    }

    #[test]
    fn branch_produces_select_per_modified_variable() {
        let mut m = Module::new();
        let x = annotated_name_ref(&mut m, "x", 8);
        let seven = m.add_int_literal(7, 64, Some("int_lit"));
        let assign = m.add_assign_stmt(x, seven);
        let blk = m.add_stmt_block("b", vec![assign]);
        let cond = annotated_name_ref(&mut m, "c", 1);
        let iff = m.add_if_stmt(cond, blk);
        let body = m.add_stmt_block("body", vec![iff]);
        m.body = Some(body);

        let pkg = convert_module_to_package(&mut m, None).unwrap();
        let f = pkg.get_top_fn().unwrap();
        assert!(verify_fn(f).is_ok());
        let sel_count = f
            .nodes
            .iter()
            .filter(|n| matches!(n.payload, NodePayload::Sel { .. }))
            .count();
        assert_eq!(sel_count, 1);
    }

    #[test]
    fn slice_assignment_emits_bit_slice_update() {
        let mut m = Module::new();
        let a = annotated_name_ref(&mut m, "a", 32);
        let slice = m.add_bit_slice(a, 15, 8);
        let v = annotated_name_ref(&mut m, "v", 8);
        let assign = m.add_assign_stmt(slice, v);
        let body = m.add_stmt_block("body", vec![assign]);
        m.body = Some(body);

        let pkg = convert_module_to_package(&mut m, None).unwrap();
        let f = pkg.get_top_fn().unwrap();
        assert!(f
            .nodes
            .iter()
            .any(|n| matches!(n.payload, NodePayload::BitSliceUpdate { .. })));
    }

    #[test]
    fn conditional_return_uses_one_hot_merge() {
        let mut m = Module::new();
        let ret = m.add_return_stmt();
        let ret_blk = m.add_stmt_block("rb", vec![ret]);
        let c = annotated_name_ref(&mut m, "c", 1);
        let iff = m.add_if_stmt(c, ret_blk);
        let x = annotated_name_ref(&mut m, "x", 8);
        let one = m.add_int_literal(1, 64, Some("int_lit"));
        let assign = m.add_assign_stmt(x, one);
        let body = m.add_stmt_block("body", vec![iff, assign]);
        m.body = Some(body);

        let pkg = convert_module_to_package(&mut m, None).unwrap();
        let f = pkg.get_top_fn().unwrap();
        assert!(verify_fn(f).is_ok());
        assert!(f
            .nodes
            .iter()
            .any(|n| matches!(n.payload, NodePayload::OneHot { lsb_prio: false, .. })));
        // One one-hot-select per global variable (c and x).
        let ohs = f
            .nodes
            .iter()
            .filter(|n| matches!(n.payload, NodePayload::OneHotSel { .. }))
            .count();
        assert_eq!(ohs, 2);
        // Each one-hot-select has one case per return plus the fallthrough.
        for n in f.nodes.iter() {
            if let NodePayload::OneHotSel { cases, .. } = &n.payload {
                assert_eq!(cases.len(), 2);
            }
        }
    }

    #[test]
    fn logical_ops_lower_to_ne_and() {
        let mut m = Module::new();
        let a = annotated_name_ref(&mut m, "a", 8);
        let b = annotated_name_ref(&mut m, "b", 8);
        let conj = m.add_binary_op(OpKind::LogicalAnd, a, b);
        let x = annotated_name_ref(&mut m, "x", 1);
        let assign = m.add_assign_stmt(x, conj);
        let body = m.add_stmt_block("body", vec![assign]);
        m.body = Some(body);

        let pkg = convert_module_to_package(&mut m, None).unwrap();
        let f = pkg.get_top_fn().unwrap();
        let ne_count = f
            .nodes
            .iter()
            .filter(|n| {
                matches!(
                    n.payload,
                    NodePayload::Binop(actsynth_ir::ir::Binop::Ne, _, _)
                )
            })
            .count();
        assert_eq!(ne_count, 2);
        assert!(f
            .nodes
            .iter()
            .any(|n| matches!(n.payload, NodePayload::Nary(actsynth_ir::ir::NaryOp::And, _))));
    }

    #[test]
    fn width_promotion_zero_extends_narrower_operand() {
        let mut m = Module::new();
        let a = annotated_name_ref(&mut m, "a", 16);
        let b = annotated_name_ref(&mut m, "b", 8);
        let sum = m.add_binary_op(OpKind::Plus, a, b);
        let x = annotated_name_ref(&mut m, "x", 16);
        let assign = m.add_assign_stmt(x, sum);
        let body = m.add_stmt_block("body", vec![assign]);
        m.body = Some(body);

        let pkg = convert_module_to_package(&mut m, None).unwrap();
        let f = pkg.get_top_fn().unwrap();
        assert!(f.nodes.iter().any(|n| matches!(
            n.payload,
            NodePayload::ZeroExt {
                new_bit_count: 16,
                ..
            }
        )));
    }

    #[test]
    fn observational_builtins_have_no_ir_effect() {
        let mut m = Module::new();
        let a = annotated_name_ref(&mut m, "a", 8);
        let call = m.add_builtin_call("_get_anchor", vec![a]);
        let stmt = m.add_expr_eval_stmt(call);
        let x = annotated_name_ref(&mut m, "x", 8);
        let y = annotated_name_ref(&mut m, "y", 8);
        let assign = m.add_assign_stmt(x, y);
        let body = m.add_stmt_block("body", vec![stmt, assign]);
        m.body = Some(body);

        let pkg = convert_module_to_package(&mut m, None).unwrap();
        let f = pkg.get_top_fn().unwrap();
        assert!(verify_fn(f).is_ok());
    }
}
