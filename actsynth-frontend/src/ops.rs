// SPDX-License-Identifier: Apache-2.0

//! Operator kinds of the action-tree language and their JSON tag spellings.

/// Binary and unary operator kinds. Arity is fixed by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    // logical
    LogicalAnd,
    LogicalOr,
    // relational
    Equal,
    NotEqual,
    LessEqual,
    LessThan,
    GreaterEqual,
    GreaterThan,
    // bitwise
    BitwiseAnd,
    BitwiseOr,
    LeftShift,
    RightShift,
    // arithmetic
    Plus,
    Minus,
    Mul,
    Div,
    // unary
    LogicalNot,
    BitwiseNot,
}

pub const BINARY_OP_TAGS: &[(&str, OpKind)] = &[
    ("LAND", OpKind::LogicalAnd),
    ("LOR", OpKind::LogicalOr),
    ("EQ", OpKind::Equal),
    ("NE", OpKind::NotEqual),
    ("LE", OpKind::LessEqual),
    ("LT", OpKind::LessThan),
    ("GE", OpKind::GreaterEqual),
    ("GT", OpKind::GreaterThan),
    ("AND", OpKind::BitwiseAnd),
    ("OR", OpKind::BitwiseOr),
    ("LSHIFT", OpKind::LeftShift),
    ("RSHIFT", OpKind::RightShift),
    ("PLUS", OpKind::Plus),
    ("MINUS", OpKind::Minus),
    ("MUL", OpKind::Mul),
    ("DIVIDE", OpKind::Div),
];

pub const UNARY_OP_TAGS: &[(&str, OpKind)] = &[
    ("LNOT", OpKind::LogicalNot),
    ("NOT", OpKind::BitwiseNot),
];

pub fn is_binary_operator(kind: OpKind) -> bool {
    !is_unary_operator(kind)
}

pub fn is_unary_operator(kind: OpKind) -> bool {
    matches!(kind, OpKind::LogicalNot | OpKind::BitwiseNot)
}

/// Maps a JSON `TYNAME` tag to an operator kind.
pub fn str_to_op_kind(s: &str) -> Option<OpKind> {
    BINARY_OP_TAGS
        .iter()
        .chain(UNARY_OP_TAGS.iter())
        .find(|(tag, _)| *tag == s)
        .map(|(_, kind)| *kind)
}

/// Maps an operator kind back to its JSON `TYNAME` tag.
pub fn op_kind_to_tag(kind: OpKind) -> &'static str {
    BINARY_OP_TAGS
        .iter()
        .chain(UNARY_OP_TAGS.iter())
        .find(|(_, k)| *k == kind)
        .map(|(tag, _)| *tag)
        .expect("every OpKind has a tag")
}

/// Source-syntax spelling, used by the AST pretty printer.
pub fn op_kind_to_symbol(kind: OpKind) -> &'static str {
    match kind {
        OpKind::LogicalAnd => "&&",
        OpKind::LogicalOr => "||",
        OpKind::Equal => "==",
        OpKind::NotEqual => "!=",
        OpKind::LessEqual => "<=",
        OpKind::LessThan => "<",
        OpKind::GreaterEqual => ">=",
        OpKind::GreaterThan => ">",
        OpKind::BitwiseAnd => "&",
        OpKind::BitwiseOr => "|",
        OpKind::LeftShift => "<<",
        OpKind::RightShift => ">>",
        OpKind::Plus => "+",
        OpKind::Minus => "-",
        OpKind::Mul => "*",
        OpKind::Div => "/",
        OpKind::LogicalNot => "!",
        OpKind::BitwiseNot => "~",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        for (tag, kind) in BINARY_OP_TAGS.iter().chain(UNARY_OP_TAGS.iter()) {
            assert_eq!(str_to_op_kind(tag), Some(*kind));
            assert_eq!(op_kind_to_tag(*kind), *tag);
        }
        assert_eq!(str_to_op_kind("BOGUS"), None);
    }

    #[test]
    fn arity_classification() {
        assert!(is_binary_operator(OpKind::Plus));
        assert!(is_unary_operator(OpKind::LogicalNot));
        assert!(!is_binary_operator(OpKind::BitwiseNot));
    }
}
