// SPDX-License-Identifier: Apache-2.0

//! Structural lowering of the parsed AST into canonical form.
//!
//! The passes run in a fixed order that later passes depend on:
//!
//! 1. field-access elimination      `a.b.c` -> `a[hi:lo]`
//! 2. array-index elimination       `arr[3]` -> `arr.3`
//! 3. validity intrinsics           `_valid(x)` / `_valid_set(x, v)`
//! 4. name-reference elimination    `NameRef` -> `VarRef(FakeVarDef)`
//! 5. useless-block unrolling       (fixed point)
//! 6. nested-if merge               (fixed point)
//! 7. nested bit-slice flattening   (fixed point)
//!
//! After all seven, `verify_lowered` asserts the eliminated kinds are gone
//! and every generated variable has a resolved width.

use std::collections::{HashMap, HashSet};

use actsynth_common::status::{Status, StatusResult};

use crate::ast::{AstId, AstNode, Module};
use crate::mapping::LoweringMapping;
use crate::ops::OpKind;

// -- Lowering info accumulators.

#[derive(Default)]
pub struct FieldAccessLoweringInfo {
    /// Original field-access nodes (now detached).
    pub field_accesses: HashSet<AstId>,
    /// Generated struct-variable defs.
    pub defs: HashSet<AstId>,
    /// Original node -> lowered slice.
    pub field_access_map: HashMap<AstId, AstId>,
    /// Lowered slice -> readable dotted name.
    pub readable_name_map: HashMap<AstId, String>,
}

#[derive(Default)]
pub struct ArrayIndexLoweringInfo {
    pub arr_indexes: HashSet<AstId>,
    pub defs: HashSet<AstId>,
    pub index_map: HashMap<AstId, AstId>,
}

#[derive(Default)]
pub struct ValidBitLoweringInfo {
    pub valid_callsites: HashSet<AstId>,
    pub valid_map: HashMap<AstId, AstId>,
    pub valid_set_callsites: HashSet<AstId>,
    pub valid_set_map: HashMap<AstId, AstId>,
    /// Referenced variable -> its 1-bit valid def.
    pub ref2bit: HashMap<AstId, AstId>,
    pub defs: HashSet<AstId>,
}

#[derive(Default)]
pub struct NameRefLoweringInfo {
    pub name_refs: HashSet<AstId>,
    pub defs: HashSet<AstId>,
    pub name_ref_map: HashMap<AstId, AstId>,
}

#[derive(Default)]
pub struct NestedSliceLoweringInfo {
    pub nested_slices: HashSet<AstId>,
    pub nested_slice_map: HashMap<AstId, AstId>,
}

#[derive(Default)]
pub struct LoweringInfo {
    pub field_access: FieldAccessLoweringInfo,
    pub arr_idx: ArrayIndexLoweringInfo,
    pub valid_bit: ValidBitLoweringInfo,
    pub name_ref: NameRefLoweringInfo,
    pub nested_slice: NestedSliceLoweringInfo,
}

fn record_lowering(mapping: &mut Option<&mut LoweringMapping>, lowered: AstId, original: AstId) {
    if let Some(m) = mapping.as_deref_mut() {
        m.ast2lowering.insert(lowered, original);
    }
}

/// Name of the variable a NameRef or VarRef refers to.
fn get_ref_name(m: &Module, expr: AstId) -> StatusResult<String> {
    match m.kind(expr) {
        AstNode::NameRef { name, .. } => Ok(name.clone()),
        AstNode::VarRef { def } => Ok(m.def_name(*def).to_string()),
        other => Err(Status::InvalidArgument(format!(
            "expected a name or variable reference, got {:?}",
            other
        ))),
    }
}

// -- Pass 1: field access elimination.

/// Readable dotted name for a field-access chain, e.g. `pkt.hdr.dst`.
fn generate_field_name(m: &Module, expr: AstId, delimiter: &str) -> StatusResult<String> {
    match m.kind(expr) {
        AstNode::FieldAccess { source, field, .. } => Ok(format!(
            "{}{}{}",
            generate_field_name(m, *source, delimiter)?,
            delimiter,
            field
        )),
        AstNode::NameRef { name, .. } => Ok(name.clone()),
        other => Err(Status::InvalidArgument(format!(
            "unsupported field-access source: {:?}",
            other
        ))),
    }
}

/// Walks the source chain to the root NameRef and returns its name and
/// annotated width.
fn inner_struct_var_annotation(m: &Module, expr: AstId) -> StatusResult<(String, u32)> {
    let mut source = match m.kind(expr) {
        AstNode::FieldAccess { source, .. } => *source,
        other => {
            return Err(Status::InvalidArgument(format!(
                "expected field access, got {:?}",
                other
            )))
        }
    };
    loop {
        match m.kind(source) {
            AstNode::FieldAccess { source: inner, .. } => source = *inner,
            AstNode::NameRef { name, annotation } => {
                let anno = annotation.ok_or_else(|| {
                    Status::InvalidArgument(format!(
                        "struct variable '{}' has no width annotation",
                        name
                    ))
                })?;
                return Ok((name.clone(), anno.width));
            }
            other => {
                return Err(Status::InvalidArgument(format!(
                    "unsupported field-access source: {:?}",
                    other
                )))
            }
        }
    }
}

fn lower_field_access_expr(
    m: &mut Module,
    expr: AstId,
    info: &mut FieldAccessLoweringInfo,
    delimiter: &str,
    mapping: &mut Option<&mut LoweringMapping>,
) -> StatusResult<()> {
    let anno = match m.kind(expr) {
        AstNode::FieldAccess {
            annotation: Some(a),
            ..
        } => a.clone(),
        AstNode::FieldAccess { .. } => {
            return Err(Status::InvalidArgument(format!(
                "field access without annotation: {}",
                m.expr_to_string(expr)
            )))
        }
        _ => unreachable!("caller matched FieldAccess"),
    };
    let range_start = anno.offset;
    let range_end = anno.offset + anno.width - 1;

    let (inner_name, inner_width) = inner_struct_var_annotation(m, expr)?;
    if inner_name != anno.struct_var_name {
        return Err(Status::InvalidArgument(format!(
            "field access annotation names struct '{}' but the source chain roots at '{}'",
            anno.struct_var_name, inner_name
        )));
    }

    let parent = m.parent(expr);
    let var_def = m.add_fake_var_def(&anno.struct_var_name, Some(inner_width));
    m.set_def_is_global(var_def, anno.is_global);
    let var_ref = m.add_var_ref(var_def);
    let bit_slice = m.add_bit_slice(var_ref, range_end, range_start);

    if !m.replace_child(parent, expr, bit_slice) {
        return Err(Status::Internal(format!(
            "failed to replace field access {} in its parent",
            m.expr_to_string(expr)
        )));
    }

    info.field_accesses.insert(expr);
    info.defs.insert(var_def);
    info.field_access_map.insert(expr, bit_slice);
    let readable = generate_field_name(m, expr, delimiter)?;
    info.readable_name_map.insert(bit_slice, readable);
    record_lowering(mapping, bit_slice, expr);
    Ok(())
}

fn field_access_walk(
    m: &mut Module,
    id: AstId,
    info: &mut FieldAccessLoweringInfo,
    delimiter: &str,
    mapping: &mut Option<&mut LoweringMapping>,
) -> StatusResult<()> {
    if matches!(m.kind(id), AstNode::FieldAccess { .. }) {
        // The entire chain lowers to a single slice; the interior accesses
        // become garbage, so there is nothing to recurse into.
        return lower_field_access_expr(m, id, info, delimiter, mapping);
    }
    for child in m.children(id) {
        field_access_walk(m, child, info, delimiter, mapping)?;
    }
    Ok(())
}

pub fn eliminate_field_accesses(
    m: &mut Module,
    info: &mut FieldAccessLoweringInfo,
    delimiter: &str,
    mut mapping: Option<&mut LoweringMapping>,
) -> StatusResult<()> {
    let body = m.body.ok_or_else(|| Status::Internal("module has no body".to_string()))?;
    field_access_walk(m, body, info, delimiter, &mut mapping)
}

// -- Pass 2: array index elimination.

fn arr_index_walk(
    m: &mut Module,
    id: AstId,
    info: &mut ArrayIndexLoweringInfo,
    delimiter: &str,
    mapping: &mut Option<&mut LoweringMapping>,
) -> StatusResult<()> {
    if let AstNode::ArrIndex { source, idx } = m.kind(id) {
        let (source, idx) = (*source, *idx);
        let anno = match m.kind(source) {
            AstNode::NameRef {
                annotation: Some(a),
                ..
            } => *a,
            AstNode::NameRef { name, .. } => {
                return Err(Status::InvalidArgument(format!(
                    "array variable '{}' has no width annotation",
                    name
                )))
            }
            other => {
                return Err(Status::InvalidArgument(format!(
                    "array index target must be a name reference, got {:?}",
                    other
                )))
            }
        };
        let new_name = format!("{}{}{}", get_ref_name(m, source)?, delimiter, idx);
        let parent = m.parent(id);
        let var_def = m.add_fake_var_def(&new_name, Some(anno.width));
        m.set_def_is_global(var_def, anno.is_global);
        let var_ref = m.add_var_ref(var_def);
        if !m.replace_child(parent, id, var_ref) {
            return Err(Status::Internal(
                "failed to replace array index in its parent".to_string(),
            ));
        }
        info.arr_indexes.insert(id);
        info.defs.insert(var_def);
        info.index_map.insert(id, var_ref);
        record_lowering(mapping, var_ref, id);
        return Ok(());
    }
    for child in m.children(id) {
        arr_index_walk(m, child, info, delimiter, mapping)?;
    }
    Ok(())
}

pub fn eliminate_array_indexes(
    m: &mut Module,
    info: &mut ArrayIndexLoweringInfo,
    delimiter: &str,
    mut mapping: Option<&mut LoweringMapping>,
) -> StatusResult<()> {
    let body = m.body.ok_or_else(|| Status::Internal("module has no body".to_string()))?;
    arr_index_walk(m, body, info, delimiter, &mut mapping)
}

// -- Pass 3: validity intrinsics.

/// Makes (or reuses) the 1-bit valid def for the variable referenced by
/// `arg0`.
fn valid_bit_def_for(
    m: &mut Module,
    arg0: AstId,
    delimiter: &str,
) -> StatusResult<AstId> {
    let new_name = format!("{}{}valid", get_ref_name(m, arg0)?, delimiter);
    let is_global = match m.kind(arg0) {
        AstNode::NameRef { name, annotation } => annotation
            .ok_or_else(|| {
                Status::InvalidArgument(format!("'{}' has no globality annotation", name))
            })?
            .is_global,
        AstNode::VarRef { def } => m.def_is_global(*def),
        other => {
            return Err(Status::InvalidArgument(format!(
                "validity intrinsic argument must be a reference, got {:?}",
                other
            )))
        }
    };
    let def = m.add_fake_var_def(&new_name, Some(1));
    m.set_def_is_global(def, is_global);
    Ok(def)
}

fn valid_walk(
    m: &mut Module,
    id: AstId,
    info: &mut ValidBitLoweringInfo,
    delimiter: &str,
    mapping: &mut Option<&mut LoweringMapping>,
) -> StatusResult<()> {
    // `_valid_set(x, v);` statements become `x.valid = v;` assignments.
    if let AstNode::ExprEvalStmt { expr } = m.kind(id) {
        let expr = *expr;
        if let AstNode::BuiltinCall { callee, args } = m.kind(expr) {
            if callee == "_valid_set" {
                if args.len() != 2 {
                    return Err(Status::InvalidArgument(format!(
                        "_valid_set expects 2 arguments, got {}",
                        args.len()
                    )));
                }
                let (arg0, arg1) = (args[0], args[1]);
                let def = valid_bit_def_for(m, arg0, delimiter)?;
                let var_ref = m.add_var_ref(def);
                let parent = m.parent(id);
                let assign = m.add_assign_stmt(var_ref, arg1);
                if !m.replace_child(parent, id, assign) {
                    return Err(Status::Internal(
                        "failed to replace _valid_set statement".to_string(),
                    ));
                }
                info.valid_set_callsites.insert(id);
                info.valid_set_map.insert(id, assign);
                info.ref2bit.insert(arg0, def);
                info.defs.insert(def);
                record_lowering(mapping, assign, id);
                // The moved rhs may itself contain `_valid` calls.
                return valid_walk(m, arg1, info, delimiter, mapping);
            }
        }
    }
    // `_valid(x)` expressions become references to the 1-bit valid variable.
    if let AstNode::BuiltinCall { callee, args } = m.kind(id) {
        if callee == "_valid" {
            if args.len() != 1 {
                return Err(Status::InvalidArgument(format!(
                    "_valid expects 1 argument, got {}",
                    args.len()
                )));
            }
            let arg0 = args[0];
            let def = valid_bit_def_for(m, arg0, delimiter)?;
            let var_ref = m.add_var_ref(def);
            let parent = m.parent(id);
            if !m.replace_child(parent, id, var_ref) {
                return Err(Status::Internal(
                    "failed to replace _valid call".to_string(),
                ));
            }
            info.valid_callsites.insert(id);
            info.valid_map.insert(id, var_ref);
            info.ref2bit.insert(arg0, def);
            info.defs.insert(def);
            record_lowering(mapping, var_ref, id);
            return Ok(());
        }
    }
    for child in m.children(id) {
        valid_walk(m, child, info, delimiter, mapping)?;
    }
    Ok(())
}

pub fn eliminate_validity_intrinsics(
    m: &mut Module,
    info: &mut ValidBitLoweringInfo,
    delimiter: &str,
    mut mapping: Option<&mut LoweringMapping>,
) -> StatusResult<()> {
    let body = m.body.ok_or_else(|| Status::Internal("module has no body".to_string()))?;
    valid_walk(m, body, info, delimiter, &mut mapping)
}

// -- Pass 4: name reference elimination.

fn name_ref_walk(
    m: &mut Module,
    id: AstId,
    info: &mut NameRefLoweringInfo,
    mapping: &mut Option<&mut LoweringMapping>,
) -> StatusResult<()> {
    if let AstNode::NameRef { name, annotation } = m.kind(id) {
        let name = name.clone();
        let anno = match annotation {
            Some(a) => *a,
            None => {
                log::warn!("name reference '{}' has no annotation", name);
                log::warn!("defaulting to a global variable of width 32");
                crate::ast::NameAnnotation {
                    width: 32,
                    is_global: true,
                }
            }
        };
        let parent = m.parent(id);
        let var_def = m.add_fake_var_def(&name, Some(anno.width));
        m.set_def_is_global(var_def, anno.is_global);
        let var_ref = m.add_var_ref(var_def);
        if !m.replace_child(parent, id, var_ref) {
            return Err(Status::Internal(format!(
                "failed to replace name reference '{}'",
                name
            )));
        }
        info.name_refs.insert(id);
        info.defs.insert(var_def);
        info.name_ref_map.insert(id, var_ref);
        record_lowering(mapping, var_ref, id);
        return Ok(());
    }
    // TypeAnnotation identifiers are type names, not variable references.
    if matches!(m.kind(id), AstNode::TypeAnnotation { .. }) {
        return Ok(());
    }
    for child in m.children(id) {
        name_ref_walk(m, child, info, mapping)?;
    }
    Ok(())
}

pub fn eliminate_name_refs(
    m: &mut Module,
    info: &mut NameRefLoweringInfo,
    mut mapping: Option<&mut LoweringMapping>,
) -> StatusResult<()> {
    let body = m.body.ok_or_else(|| Status::Internal("module has no body".to_string()))?;
    name_ref_walk(m, body, info, &mut mapping)
}

// -- Pass 5: useless block unrolling (fixed point).

/// Finds a block whose parent is also a block and splices it into the
/// parent. Returns true when a rewrite happened.
fn unroll_one_useless_block(m: &mut Module, id: AstId) -> StatusResult<bool> {
    if matches!(m.kind(id), AstNode::StmtBlock { .. }) {
        if let Some(parent) = m.parent(id) {
            if matches!(m.kind(parent), AstNode::StmtBlock { .. }) {
                log::info!(
                    "unrolling useless block into its parent:\n{}",
                    m.to_string_indented(id, 2, 0)
                );
                let inner_stmts = m.children(id);
                let mut stmts = Vec::new();
                let mut occurred = false;
                for s in m.children(parent) {
                    if s == id {
                        occurred = true;
                        stmts.extend(inner_stmts.iter().copied());
                    } else {
                        stmts.push(s);
                    }
                }
                if !occurred {
                    return Err(Status::Internal(
                        "block not found among its parent's statements".to_string(),
                    ));
                }
                let grandparent = m.parent(parent);
                let new_block = m.add_stmt_block("manually_added", stmts);
                if !m.replace_child(grandparent, parent, new_block) {
                    return Err(Status::Internal(
                        "failed to replace block parent".to_string(),
                    ));
                }
                return Ok(true);
            }
        }
    }
    for child in m.children(id) {
        if unroll_one_useless_block(m, child)? {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn unroll_useless_blocks(m: &mut Module) -> StatusResult<()> {
    loop {
        let body = m.body.ok_or_else(|| Status::Internal("module has no body".to_string()))?;
        if !unroll_one_useless_block(m, body)? {
            return Ok(());
        }
    }
}

// -- Pass 6: nested if merge (fixed point).

/// Merges `if(e1){ if(e2){S} }` into `if(e1 && e2){S}` when the inner if is
/// the whole body of the outer one.
fn merge_one_nested_if(m: &mut Module, id: AstId) -> StatusResult<bool> {
    if let AstNode::IfStmt { cond, then_blk } = m.kind(id) {
        let (inner_cond, inner_then) = (*cond, *then_blk);
        if let Some(parent) = m.parent(id) {
            if let AstNode::IfStmt {
                cond: outer_cond,
                then_blk: outer_then,
            } = m.kind(parent)
            {
                if *outer_then == id {
                    log::info!(
                        "merging nested if statements:\n{}",
                        m.to_string_indented(parent, 2, 0)
                    );
                    let outer_cond = *outer_cond;
                    let grandparent = m.parent(parent);
                    let conjunction = m.add_binary_op(OpKind::LogicalAnd, outer_cond, inner_cond);
                    let new_if = m.add_if_stmt(conjunction, inner_then);
                    if !m.replace_child(grandparent, parent, new_if) {
                        return Err(Status::Internal(
                            "failed to replace merged if statement".to_string(),
                        ));
                    }
                    return Ok(true);
                }
            }
        }
    }
    for child in m.children(id) {
        if merge_one_nested_if(m, child)? {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn merge_nested_ifs(m: &mut Module) -> StatusResult<()> {
    loop {
        let body = m.body.ok_or_else(|| Status::Internal("module has no body".to_string()))?;
        if !merge_one_nested_if(m, body)? {
            return Ok(());
        }
    }
}

// -- Pass 7: nested bit-slice flattening (fixed point).

/// Reduces `a[h1:l1][h2:l2]` to `a[l1+h2 : l1+l2]`. Precondition:
/// `h2-l2+1 <= h1-l1+1` and `h2 < h1-l1+1`.
fn flatten_one_nested_slice(
    m: &mut Module,
    id: AstId,
    info: &mut NestedSliceLoweringInfo,
    mapping: &mut Option<&mut LoweringMapping>,
) -> StatusResult<bool> {
    if let AstNode::BitSlice {
        target,
        max_bit: outer_max,
        min_bit: outer_min,
    } = m.kind(id)
    {
        let (target, outer_max, outer_min) = (*target, *outer_max, *outer_min);
        if let AstNode::BitSlice {
            target: inner_target,
            max_bit: inner_max,
            min_bit: inner_min,
        } = m.kind(target)
        {
            let (inner_target, inner_max, inner_min) = (*inner_target, *inner_max, *inner_min);
            let inner_size = inner_max - inner_min + 1;
            let outer_size = outer_max - outer_min + 1;
            if !(outer_size <= inner_size && outer_max < inner_size) {
                return Err(Status::InvalidArgument(format!(
                    "nested slice [{}:{}] exceeds its target slice [{}:{}]",
                    outer_max, outer_min, inner_max, inner_min
                )));
            }
            let parent = m.parent(id);
            let new_slice =
                m.add_bit_slice(inner_target, inner_min + outer_max, inner_min + outer_min);
            if !m.replace_child(parent, id, new_slice) {
                return Err(Status::Internal(
                    "failed to replace nested slice".to_string(),
                ));
            }
            info.nested_slices.insert(id);
            info.nested_slice_map.insert(id, new_slice);
            record_lowering(mapping, new_slice, id);
            return Ok(true);
        }
    }
    for child in m.children(id) {
        if flatten_one_nested_slice(m, child, info, mapping)? {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn flatten_nested_slices(
    m: &mut Module,
    info: &mut NestedSliceLoweringInfo,
    mut mapping: Option<&mut LoweringMapping>,
) -> StatusResult<()> {
    loop {
        let body = m.body.ok_or_else(|| Status::Internal("module has no body".to_string()))?;
        if !flatten_one_nested_slice(m, body, info, &mut mapping)? {
            return Ok(());
        }
    }
}

// -- Verification.

fn verify_walk(m: &Module, id: AstId) -> StatusResult<()> {
    match m.kind(id) {
        AstNode::FieldAccess { .. } => {
            return Err(Status::Internal(format!(
                "field access survived lowering: {}",
                m.expr_to_string(id)
            )))
        }
        AstNode::ArrIndex { .. } => {
            return Err(Status::Internal(format!(
                "array index survived lowering: {}",
                m.expr_to_string(id)
            )))
        }
        AstNode::NameRef { name, .. } => {
            return Err(Status::Internal(format!(
                "name reference '{}' survived lowering",
                name
            )))
        }
        AstNode::BuiltinCall { callee, .. } if callee == "_valid" || callee == "_valid_set" => {
            return Err(Status::Internal(format!(
                "validity intrinsic '{}' survived lowering",
                callee
            )))
        }
        AstNode::StmtBlock { .. } => {
            if let Some(parent) = m.parent(id) {
                if matches!(m.kind(parent), AstNode::StmtBlock { .. }) {
                    return Err(Status::Internal(
                        "nested statement block survived lowering".to_string(),
                    ));
                }
            }
        }
        AstNode::IfStmt { then_blk, .. } => {
            if matches!(m.kind(*then_blk), AstNode::IfStmt { .. }) {
                return Err(Status::Internal(
                    "nested if statement survived lowering".to_string(),
                ));
            }
        }
        AstNode::BitSlice { target, .. } => {
            if matches!(m.kind(*target), AstNode::BitSlice { .. }) {
                return Err(Status::Internal(
                    "nested bit slice survived lowering".to_string(),
                ));
            }
            if !matches!(m.kind(*target), AstNode::VarRef { .. }) {
                return Err(Status::Internal(
                    "bit slice target must be a variable reference after lowering".to_string(),
                ));
            }
        }
        _ => {}
    }
    for child in m.children(id) {
        verify_walk(m, child)?;
    }
    Ok(())
}

/// Asserts the post-lowering invariants on the whole module.
pub fn verify_lowered(m: &Module, info: &LoweringInfo) -> StatusResult<()> {
    let body = m.body.ok_or_else(|| Status::Internal("module has no body".to_string()))?;
    verify_walk(m, body)?;

    let def_sets = [
        &info.field_access.defs,
        &info.arr_idx.defs,
        &info.valid_bit.defs,
        &info.name_ref.defs,
    ];
    for defs in def_sets {
        for def in defs.iter() {
            if m.def_width(*def).is_none() {
                return Err(Status::Internal(format!(
                    "variable '{}' has no resolved width after lowering",
                    m.def_name(*def)
                )));
            }
        }
    }
    Ok(())
}

/// Runs the whole lowering sequence.
///
/// The pass order is part of the contract; later passes assume earlier ones
/// have run.
pub fn lowering_transform(
    info: &mut LoweringInfo,
    m: &mut Module,
    delimiter: &str,
    need_verify: bool,
    mut mapping: Option<&mut LoweringMapping>,
) -> StatusResult<()> {
    eliminate_field_accesses(m, &mut info.field_access, delimiter, mapping.as_deref_mut())?;
    eliminate_array_indexes(m, &mut info.arr_idx, delimiter, mapping.as_deref_mut())?;
    eliminate_validity_intrinsics(m, &mut info.valid_bit, delimiter, mapping.as_deref_mut())?;
    eliminate_name_refs(m, &mut info.name_ref, mapping.as_deref_mut())?;
    unroll_useless_blocks(m)?;
    merge_nested_ifs(m)?;
    flatten_nested_slices(m, &mut info.nested_slice, mapping.as_deref_mut())?;

    if need_verify {
        verify_lowered(m, info)?;
    }
    Ok(())
}
