// SPDX-License-Identifier: Apache-2.0

//! Provenance maps threaded through parsing, lowering, and IR conversion.

use std::collections::HashMap;

use crate::ast::AstId;
use actsynth_ir::ir::NodeRef;

/// Records, for every lowered or IR node, where it came from. All maps are
/// optional diagnostics state; passes fill them only when a mapping is
/// supplied.
#[derive(Default)]
pub struct LoweringMapping {
    /// Lowered AST node -> the original AST node it replaced.
    pub ast2lowering: HashMap<AstId, AstId>,
    /// AST node -> the source JSON it was parsed from.
    pub ast2json: HashMap<AstId, serde_json::Value>,
    /// IR node -> the AST node that produced it.
    pub node2ast: HashMap<NodeRef, AstId>,
}

impl LoweringMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walks lowered-to-original links to the earliest recorded ancestor.
    pub fn original_of(&self, mut id: AstId) -> AstId {
        while let Some(&prev) = self.ast2lowering.get(&id) {
            if prev == id {
                break;
            }
            id = prev;
        }
        id
    }

    /// Source JSON for an AST node, following lowering provenance when the
    /// node itself was synthesized.
    pub fn source_json(&self, id: AstId) -> Option<&serde_json::Value> {
        self.ast2json
            .get(&id)
            .or_else(|| self.ast2json.get(&self.original_of(id)))
    }
}
