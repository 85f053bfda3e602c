// SPDX-License-Identifier: Apache-2.0

//! Action-tree frontend: JSON AST parsing, lowering to canonical form, AST
//! analyses, conversion to the dataflow IR, and the mutation/benchmark
//! harnesses built on top of them.

pub mod analysis;
pub mod ast;
pub mod ast_mutation;
pub mod benchmark;
pub mod ir_convert;
pub mod json_ast_parser;
pub mod lowering;
pub mod mapping;
pub mod ops;
