// SPDX-License-Identifier: Apache-2.0

//! Parses the serialized action-tree JSON into an AST module.
//!
//! Every JSON node carries a `TYNAME` tag; payloads use `OP0..OPn`, `STRING`,
//! `INT`, `VALUES`, `SIZE`, `GLOBAL`, `STRUCT`, `OFFSET`, `TYPESIZE`,
//! `VALUE`. Integer literals are character-reversed decimal strings. An
//! empty-`OP1` `BLOCK` denotes an empty statement block; a `SLICE` with
//! non-integer bounds denotes the full slice and is elided here.

use actsynth_common::status::{Status, StatusResult};
use serde_json::Value;

use crate::ast::{AstId, FieldAnnotation, Module, NameAnnotation};
use crate::mapping::LoweringMapping;
use crate::ops::str_to_op_kind;

fn invalid(what: &str, json: &Value) -> Status {
    log::warn!("invalid json to parse a `{}`, content: {}", what, json);
    Status::InvalidArgument(format!(
        "failed to parse a `{}` from json, content: {}",
        what, json
    ))
}

fn tyname(json: &Value) -> Option<&str> {
    json.get("TYNAME").and_then(|v| v.as_str())
}

fn is_tag(json: &Value, tag: &str) -> bool {
    tyname(json) == Some(tag)
}

/// The literal encoding reverses the decimal digit string.
fn reversed_int_value(json: &Value) -> StatusResult<u64> {
    let s = json
        .as_str()
        .ok_or_else(|| invalid("reversed integer", json))?;
    let forward: String = s.chars().rev().collect();
    forward
        .parse::<u64>()
        .map_err(|e| Status::InvalidArgument(format!("bad integer literal '{}': {}", s, e)))
}

/// A block with no `OP1`, or an `OP1` LIST with no values, is an empty
/// statement block.
fn is_empty_block(json: &Value) -> bool {
    if !json.is_object() || !is_tag(json, "BLOCK") {
        return false;
    }
    match json.get("OP1") {
        None => true,
        Some(op1) => {
            is_tag(op1, "LIST")
                && op1
                    .get("VALUES")
                    .and_then(|v| v.as_array())
                    .is_some_and(|v| v.is_empty())
        }
    }
}

fn is_single_element_block(json: &Value) -> bool {
    if !json.is_object() || !is_tag(json, "BLOCK") {
        return false;
    }
    match json.get("OP1") {
        Some(op1) if is_tag(op1, "LIST") => op1
            .get("VALUES")
            .and_then(|v| v.as_array())
            .is_some_and(|v| v.len() == 1),
        Some(_) => true,
        None => false,
    }
}

fn single_element(json: &Value) -> &Value {
    &json["OP1"]["VALUES"][0]
}

/// True when a `SLICE` carries no integer bound on either side, i.e.
/// `expr[:]`, which is just the expression itself.
fn is_full_slice(json: &Value) -> bool {
    !(json["OP1"].get("INT").is_some() || json["OP2"].get("INT").is_some())
}

pub struct JsonAstParser<'m> {
    mapping: Option<&'m mut LoweringMapping>,
}

impl<'m> JsonAstParser<'m> {
    pub fn new(mapping: Option<&'m mut LoweringMapping>) -> Self {
        JsonAstParser { mapping }
    }

    fn record(&mut self, id: AstId, json: &Value) {
        if let Some(mapping) = self.mapping.as_deref_mut() {
            mapping.ast2json.insert(id, json.clone());
        }
    }

    /// Parses a whole module; the root must be a `BLOCK`.
    pub fn parse(&mut self, json: &Value) -> StatusResult<Module> {
        if !(json.is_object()
            && is_tag(json, "BLOCK")
            && json.get("OP0").is_some()
            && json.get("OP1").is_some())
        {
            return Err(invalid("Module", json));
        }
        let mut module = Module::new();
        let body = self.parse_stmt_block(json, &mut module)?;
        module.body = Some(body);
        Ok(module)
    }

    fn parse_stmt_block(&mut self, json: &Value, module: &mut Module) -> StatusResult<AstId> {
        if !(json.is_object() && is_tag(json, "BLOCK") && json.get("OP0").is_some()) {
            return Err(invalid("StmtBlock", json));
        }
        if let Some(op1) = json.get("OP1") {
            if is_tag(op1, "BLOCK") {
                // An inner nested block stands in for the whole block.
                return self.parse_stmt_block(op1, module);
            }
        }
        let name = json["OP0"]["STRING"]
            .as_str()
            .ok_or_else(|| invalid("StmtBlock", json))?
            .to_string();
        let mut stmts = Vec::new();
        if let Some(op1) = json.get("OP1") {
            if !is_tag(op1, "LIST") {
                return Err(invalid("StmtBlock", json));
            }
            for elem in op1["VALUES"].as_array().unwrap_or(&Vec::new()) {
                if is_empty_block(elem) {
                    continue;
                }
                stmts.push(self.parse_stmt(elem, module)?);
            }
        }
        let id = module.add_stmt_block(&name, stmts);
        self.record(id, json);
        Ok(id)
    }

    fn parse_stmt(&mut self, json: &Value, module: &mut Module) -> StatusResult<AstId> {
        let Some(type_name) = tyname(json) else {
            return Err(invalid("Stmt", json));
        };
        let result = match type_name {
            "IF" => {
                let has_else = json
                    .get("OP2")
                    .is_some_and(|op2| !is_empty_block(op2));
                if has_else {
                    self.parse_if_else_stmt(json, module)
                } else {
                    self.parse_if_stmt(json, module)
                }
            }
            "ASSIGN" => self.parse_assign_stmt(json, module),
            "RETURN" => Ok(module.add_return_stmt()),
            "NOP" => Ok(module.add_nop_stmt()),
            "BLOCK" => {
                if is_single_element_block(json) {
                    self.parse_stmt(single_element(json), module)
                } else {
                    self.parse_stmt_block(json, module)
                }
            }
            "FUNCTION_CALL" => {
                let call = self.parse_builtin_call(json, module)?;
                Ok(module.add_expr_eval_stmt(call))
            }
            _ => Err(invalid("Stmt", json)),
        }?;
        self.record(result, json);
        Ok(result)
    }

    fn parse_assign_stmt(&mut self, json: &Value, module: &mut Module) -> StatusResult<AstId> {
        if json.get("OP0").is_none() || json.get("OP1").is_none() {
            return Err(invalid("AssignStmt", json));
        }
        let lhs = self.parse_lvalue(&json["OP0"], module)?;
        let rhs = self.parse_expr(&json["OP1"], module)?;
        Ok(module.add_assign_stmt(lhs, rhs))
    }

    fn parse_if_stmt(&mut self, json: &Value, module: &mut Module) -> StatusResult<AstId> {
        if json.get("OP0").is_none() || json.get("OP1").is_none() {
            return Err(invalid("IfStmt", json));
        }
        let cond = self.parse_expr(&json["OP0"], module)?;
        let then_blk = self.parse_stmt(&json["OP1"], module)?;
        Ok(module.add_if_stmt(cond, then_blk))
    }

    fn parse_if_else_stmt(&mut self, json: &Value, module: &mut Module) -> StatusResult<AstId> {
        if json.get("OP0").is_none() || json.get("OP1").is_none() || json.get("OP2").is_none() {
            return Err(invalid("IfElseStmt", json));
        }
        let cond = self.parse_expr(&json["OP0"], module)?;
        let then_blk = self.parse_stmt(&json["OP1"], module)?;
        let else_blk = self.parse_stmt(&json["OP2"], module)?;
        Ok(module.add_if_else_stmt(cond, then_blk, else_blk))
    }

    fn parse_expr(&mut self, json: &Value, module: &mut Module) -> StatusResult<AstId> {
        let Some(type_name) = tyname(json) else {
            return Err(invalid("Expr", json));
        };
        let result = match type_name {
            "IDENT" => {
                if json.get("VALUE").is_some() {
                    self.parse_named_constant(json, module)
                } else {
                    self.parse_name_ref(json, module)
                }
            }
            "DOT" => self.parse_field_access(json, module),
            "SLICE" => {
                if is_full_slice(json) {
                    // expr[:] <=> expr
                    self.parse_expr(&json["OP0"], module)
                } else {
                    self.parse_slice(json, module)
                }
            }
            "INT_LIT" => self.parse_int_literal(json, module),
            "FUNCTION_CALL" => self.parse_builtin_call(json, module),
            "CAST" => self.parse_cast(json, module),
            "INDEX" => self.parse_arr_index(json, module),
            "LIST" => self.parse_long_int_literal(json, module),
            tag => match str_to_op_kind(tag) {
                Some(op) if crate::ops::is_binary_operator(op) => {
                    if json.get("OP0").is_none() || json.get("OP1").is_none() {
                        return Err(invalid("BinaryOpExpr", json));
                    }
                    let lhs = self.parse_expr(&json["OP0"], module)?;
                    let rhs = self.parse_expr(&json["OP1"], module)?;
                    Ok(module.add_binary_op(op, lhs, rhs))
                }
                Some(op) => {
                    if json.get("OP0").is_none() {
                        return Err(invalid("UnaryOpExpr", json));
                    }
                    let operand = self.parse_expr(&json["OP0"], module)?;
                    Ok(module.add_unary_op(op, operand))
                }
                None => Err(invalid("Expr", json)),
            },
        }?;
        self.record(result, json);
        Ok(result)
    }

    fn parse_lvalue(&mut self, json: &Value, module: &mut Module) -> StatusResult<AstId> {
        let Some(type_name) = tyname(json) else {
            return Err(invalid("Lvalue", json));
        };
        let result = match type_name {
            "IDENT" => self.parse_name_ref(json, module),
            "DOT" => self.parse_field_access(json, module),
            "SLICE" => {
                if is_full_slice(json) {
                    self.parse_lvalue(&json["OP0"], module)
                } else {
                    self.parse_slice(json, module)
                }
            }
            "INDEX" => self.parse_arr_index(json, module),
            _ => Err(invalid("Lvalue", json)),
        }?;
        self.record(result, json);
        Ok(result)
    }

    /// `IDENT` without `VALUE`. `SIZE` and `GLOBAL` appear together or not at
    /// all.
    fn parse_name_ref(&mut self, json: &Value, module: &mut Module) -> StatusResult<AstId> {
        let Some(name) = json.get("STRING").and_then(|v| v.as_str()) else {
            return Err(invalid("NameRefExpr", json));
        };
        if json.get("VALUE").is_some() {
            return Err(invalid("NameRefExpr", json));
        }
        let has_size = json.get("SIZE").is_some();
        let has_global = json.get("GLOBAL").is_some();
        if has_size != has_global {
            return Err(invalid("NameRefExpr", json));
        }
        let id = module.add_name_ref(name);
        if has_size {
            let width = json["SIZE"]
                .as_u64()
                .ok_or_else(|| invalid("NameRefExpr", json))? as u32;
            let is_global = json["GLOBAL"] == 1;
            module.annotate_name_ref(id, NameAnnotation { width, is_global });
        }
        Ok(id)
    }

    /// `IDENT` with a `VALUE`: an enum member or `true`/`false`.
    fn parse_named_constant(&mut self, json: &Value, module: &mut Module) -> StatusResult<AstId> {
        let (Some(name), Some(value)) = (
            json.get("STRING").and_then(|v| v.as_str()),
            json.get("VALUE").and_then(|v| v.as_u64()),
        ) else {
            return Err(invalid("NamedConstantExpr", json));
        };
        let width = if name == "true" || name == "false" { 1 } else { 64 };
        Ok(module.add_int_literal(value, width, Some(name)))
    }

    fn parse_field_access(&mut self, json: &Value, module: &mut Module) -> StatusResult<AstId> {
        if json.get("OP0").is_none() || json.get("OP1").is_none() {
            return Err(invalid("FieldAccessExpr", json));
        }
        let Some(field_name) = json["OP1"].get("STRING").and_then(|v| v.as_str()) else {
            return Err(invalid("FieldAccessExpr", json));
        };
        let field_name = field_name.to_string();
        let source = self.parse_lvalue(&json["OP0"], module)?;
        let id = module.add_field_access(source, &field_name);

        let has = |k: &str| json.get(k).is_some();
        let has_all = has("SIZE") && has("GLOBAL") && has("STRUCT") && has("OFFSET");
        let has_none = !(has("SIZE") || has("GLOBAL") || has("STRUCT") || has("OFFSET"));
        if !(has_all || has_none) {
            return Err(invalid("FieldAccessExpr", json));
        }
        if has_all {
            module.annotate_field_access(
                id,
                FieldAnnotation {
                    width: json["SIZE"].as_u64().ok_or_else(|| invalid("FieldAccessExpr", json))?
                        as u32,
                    is_global: json["GLOBAL"] == 1,
                    struct_var_name: json["STRUCT"]
                        .as_str()
                        .ok_or_else(|| invalid("FieldAccessExpr", json))?
                        .to_string(),
                    offset: json["OFFSET"]
                        .as_u64()
                        .ok_or_else(|| invalid("FieldAccessExpr", json))?
                        as u32,
                },
            );
        }
        Ok(id)
    }

    fn parse_slice(&mut self, json: &Value, module: &mut Module) -> StatusResult<AstId> {
        if json.get("OP0").is_none() || json.get("OP1").is_none() || json.get("OP2").is_none() {
            return Err(invalid("BitSliceExpr", json));
        }
        let target = self.parse_expr(&json["OP0"], module)?;
        let max_bit = match json["OP1"].get("INT") {
            Some(v) => reversed_int_value(v)? as u32,
            None => 0,
        };
        let min_bit = match json["OP2"].get("INT") {
            Some(v) => reversed_int_value(v)? as u32,
            None => 0,
        };
        if max_bit < min_bit {
            return Err(invalid("BitSliceExpr", json));
        }
        Ok(module.add_bit_slice(target, max_bit, min_bit))
    }

    fn parse_cast(&mut self, json: &Value, module: &mut Module) -> StatusResult<AstId> {
        if json.get("OP0").is_none() || json.get("OP1").is_none() {
            return Err(invalid("CastExpr", json));
        }
        let expr = self.parse_expr(&json["OP0"], module)?;
        let cast_to = self.parse_type_annotation(&json["OP1"], module)?;
        Ok(module.add_cast(expr, cast_to))
    }

    fn parse_type_annotation(&mut self, json: &Value, module: &mut Module) -> StatusResult<AstId> {
        if !(is_tag(json, "IDENT") && json.get("TYPESIZE").is_some()) {
            return Err(invalid("TypeAnnotation", json));
        }
        let width = json["TYPESIZE"]
            .as_u64()
            .ok_or_else(|| invalid("TypeAnnotation", json))? as u32;
        let name = json["STRING"]
            .as_str()
            .ok_or_else(|| invalid("TypeAnnotation", json))?;
        Ok(module.add_type_annotation(width, name))
    }

    fn parse_builtin_call(&mut self, json: &Value, module: &mut Module) -> StatusResult<AstId> {
        if json.get("OP0").is_none() || json.get("OP1").is_none() {
            return Err(invalid("BuiltinCallExpr", json));
        }
        let Some(name) = json["OP0"].get("STRING").and_then(|v| v.as_str()) else {
            return Err(invalid("BuiltinCallExpr", json));
        };
        let name = name.to_string();
        let mut args = Vec::new();
        for arg in json["OP1"]["VALUES"].as_array().unwrap_or(&Vec::new()) {
            args.push(self.parse_expr(arg, module)?);
        }
        Ok(module.add_builtin_call(&name, args))
    }

    fn parse_int_literal(&mut self, json: &Value, module: &mut Module) -> StatusResult<AstId> {
        if !is_tag(json, "INT_LIT") {
            return Err(invalid("IntLiteralExpr", json));
        }
        let value = match json.get("INT") {
            Some(v) => reversed_int_value(v)?,
            None => 0,
        };
        Ok(module.add_int_literal(value, 64, Some("int_lit")))
    }

    fn parse_long_int_literal(&mut self, json: &Value, module: &mut Module) -> StatusResult<AstId> {
        if !(is_tag(json, "LIST") && json.get("VALUES").is_some()) {
            return Err(invalid("LongIntLiteralExpr", json));
        }
        let mut words = Vec::new();
        for u64_json in json["VALUES"].as_array().unwrap_or(&Vec::new()) {
            if !is_tag(u64_json, "INT_LIT") {
                return Err(invalid("LongIntLiteralExpr", json));
            }
            let value = match u64_json.get("INT") {
                Some(v) => reversed_int_value(v)?,
                None => 0,
            };
            words.push(value);
        }
        Ok(module.add_long_int_literal(words))
    }

    fn parse_arr_index(&mut self, json: &Value, module: &mut Module) -> StatusResult<AstId> {
        if !(json.get("OP0").is_some()
            && json.get("OP1").is_some()
            && is_tag(&json["OP1"], "INT_LIT"))
        {
            return Err(invalid("ArrIndexExpr", json));
        }
        let idx = match json["OP1"].get("INT") {
            Some(v) => reversed_int_value(v)? as u32,
            None => 0,
        };
        let source = self.parse_lvalue(&json["OP0"], module)?;
        Ok(module.add_arr_index(source, idx))
    }
}

/// Parses an AST module from JSON, recording provenance when a mapping is
/// supplied.
pub fn parse_module_from_json(
    json: &Value,
    mapping: Option<&mut LoweringMapping>,
) -> StatusResult<Module> {
    JsonAstParser::new(mapping).parse(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AstNode;
    use serde_json::json;

    fn block(name: &str, stmts: Vec<Value>) -> Value {
        json!({
            "TYNAME": "BLOCK",
            "OP0": { "TYNAME": "IDENT", "STRING": name },
            "OP1": { "TYNAME": "LIST", "VALUES": stmts },
        })
    }

    fn ident(name: &str, size: u64, global: u64) -> Value {
        json!({ "TYNAME": "IDENT", "STRING": name, "SIZE": size, "GLOBAL": global })
    }

    #[test]
    fn parses_assignment() {
        let j = block(
            "body",
            vec![json!({
                "TYNAME": "ASSIGN",
                "OP0": ident("out", 32, 1),
                "OP1": ident("in", 32, 1),
            })],
        );
        let m = parse_module_from_json(&j, None).unwrap();
        let body = m.body.unwrap();
        let stmts = match m.kind(body) {
            AstNode::StmtBlock { stmts, .. } => stmts.clone(),
            _ => panic!(),
        };
        assert_eq!(stmts.len(), 1);
        assert!(matches!(m.kind(stmts[0]), AstNode::AssignStmt { .. }));
    }

    #[test]
    fn reversed_literals_decode() {
        let j = block(
            "body",
            vec![json!({
                "TYNAME": "ASSIGN",
                "OP0": ident("x", 64, 1),
                "OP1": { "TYNAME": "INT_LIT", "INT": "321" },
            })],
        );
        let m = parse_module_from_json(&j, None).unwrap();
        let body = m.body.unwrap();
        let assign = m.children(body)[0];
        let rhs = m.children(assign)[1];
        match m.kind(rhs) {
            AstNode::IntLiteral { value, .. } => assert_eq!(*value, 123),
            other => panic!("expected literal, got {:?}", other),
        }
    }

    #[test]
    fn empty_block_statements_are_elided() {
        let j = block(
            "body",
            vec![
                json!({ "TYNAME": "BLOCK", "OP0": { "TYNAME": "IDENT", "STRING": "e" } }),
                json!({ "TYNAME": "RETURN" }),
            ],
        );
        let m = parse_module_from_json(&j, None).unwrap();
        let body = m.body.unwrap();
        assert_eq!(m.children(body).len(), 1);
    }

    #[test]
    fn if_with_empty_else_parses_as_plain_if() {
        let then_blk = block("t", vec![json!({ "TYNAME": "NOP" })]);
        let j = block(
            "body",
            vec![json!({
                "TYNAME": "IF",
                "OP0": ident("c", 1, 1),
                "OP1": then_blk,
                "OP2": { "TYNAME": "BLOCK", "OP0": { "TYNAME": "IDENT", "STRING": "e" } },
            })],
        );
        let m = parse_module_from_json(&j, None).unwrap();
        let stmt = m.children(m.body.unwrap())[0];
        assert!(matches!(m.kind(stmt), AstNode::IfStmt { .. }));
    }

    #[test]
    fn full_slice_is_elided() {
        let j = block(
            "body",
            vec![json!({
                "TYNAME": "ASSIGN",
                "OP0": ident("x", 8, 1),
                "OP1": {
                    "TYNAME": "SLICE",
                    "OP0": ident("y", 8, 1),
                    "OP1": { "TYNAME": "IDENT", "STRING": "none" },
                    "OP2": { "TYNAME": "IDENT", "STRING": "none" },
                },
            })],
        );
        let m = parse_module_from_json(&j, None).unwrap();
        let assign = m.children(m.body.unwrap())[0];
        let rhs = m.children(assign)[1];
        assert!(matches!(m.kind(rhs), AstNode::NameRef { name, .. } if name == "y"));
    }

    #[test]
    fn true_false_become_one_bit_literals() {
        let j = block(
            "body",
            vec![json!({
                "TYNAME": "ASSIGN",
                "OP0": ident("x", 1, 1),
                "OP1": { "TYNAME": "IDENT", "STRING": "true", "VALUE": 1 },
            })],
        );
        let m = parse_module_from_json(&j, None).unwrap();
        let assign = m.children(m.body.unwrap())[0];
        let rhs = m.children(assign)[1];
        match m.kind(rhs) {
            AstNode::IntLiteral { value, width, name } => {
                assert_eq!(*value, 1);
                assert_eq!(*width, 1);
                assert_eq!(name.as_deref(), Some("true"));
            }
            other => panic!("expected literal, got {:?}", other),
        }
    }

    #[test]
    fn round_trip_preserves_structure() {
        let j = block(
            "body",
            vec![
                json!({
                    "TYNAME": "ASSIGN",
                    "OP0": ident("x", 8, 1),
                    "OP1": {
                        "TYNAME": "PLUS",
                        "OP0": ident("a", 8, 1),
                        "OP1": { "TYNAME": "INT_LIT", "INT": "7" },
                    },
                }),
                json!({ "TYNAME": "RETURN" }),
            ],
        );
        let m = parse_module_from_json(&j, None).unwrap();
        let dumped = m.to_json(m.body.unwrap());
        let reparsed = parse_module_from_json(&dumped, None).unwrap();
        let redumped = reparsed.to_json(reparsed.body.unwrap());
        assert_eq!(dumped, redumped);
    }

    #[test]
    fn malformed_json_is_invalid_argument() {
        let err = parse_module_from_json(&json!({ "TYNAME": "WAT" }), None).unwrap_err();
        assert!(matches!(err, Status::InvalidArgument(_)));
    }
}
