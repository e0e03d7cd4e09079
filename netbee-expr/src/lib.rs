//! NetPDL expression grammar and typed AST
//!
//! NetPDL elements carry small expression strings in their attributes
//! (`expr`, `size`, `when`, `match`, offsets). This crate turns those
//! strings into typed trees: every node knows its return kind, alias
//! references are expanded at parse time and name references are resolved
//! against a caller-supplied [`SymbolScope`]. Evaluation lives upstream,
//! next to the packet cursor; here we only parse and type-check.

use thiserror::Error;

mod ast;
mod kind;
mod parser;
mod pattern;
mod token;

pub use ast::{BinaryOp, Builtin, Expr, FieldSource, Slice, UnaryOp};
pub use kind::{ColumnKind, ExpectedKind, ExprKind, VariableKind};
pub use parser::{parse, SymbolScope};
pub use pattern::Pattern;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("syntax error in expression at byte {position}: {reason}")]
    Syntax { position: usize, reason: String },

    #[error("unknown name '{0}' in expression")]
    UnknownName(String),

    #[error("expression returns {found} but the element requires {expected}")]
    TypeMismatch {
        expected: ExpectedKind,
        found: ExprKind,
    },

    #[error("alias expansion loop involving '{0}'")]
    AliasCycle(String),

    #[error("pattern contains a NUL byte escape; use \\0 instead of \\x00")]
    RegexInvalidNul,

    #[error("cannot compile regular expression: {0}")]
    RegexCompile(#[from] regex::Error),
}

impl ExprError {
    pub(crate) fn syntax(position: usize, reason: impl Into<String>) -> Self {
        ExprError::Syntax {
            position,
            reason: reason.into(),
        }
    }
}
