use crate::{ExprKind, Pattern, VariableKind};

/// Optional `[start:len]` slice on a buffer-valued operand. Both bounds
/// are number expressions evaluated against the packet being decoded.
#[derive(Debug, Clone)]
pub struct Slice {
    pub start: Box<Expr>,
    pub len: Box<Expr>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    BitNot,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

/// Which protocol scope a `proto.field` reference selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSource {
    /// `this.field`, resolved against the protocol being decoded.
    This,
    /// `name.field`, restricted to fields emitted by that protocol.
    Proto(String),
}

/// A typed expression node. The kind is computed while parsing and stored
/// so downstream consumers never re-infer it.
#[derive(Debug, Clone)]
pub enum Expr {
    Number(u32),
    Bytes(Vec<u8>),
    Boolean(bool),

    /// `$name` with its declared kind, optionally sliced.
    Variable {
        name: String,
        kind: VariableKind,
        slice: Option<Slice>,
    },

    /// `table.column` read of the row bound by the last lookup hit.
    LookupCell {
        table: String,
        column: String,
        kind: ExprKind,
        slice: Option<Slice>,
    },

    /// Reference to an already decoded field; always buffer-kinded.
    FieldRef {
        source: FieldSource,
        field: String,
        slice: Option<Slice>,
    },

    /// `#name`; the organizer writes the resolved protocol index.
    ProtoRef {
        name: String,
        resolved: Option<u32>,
    },

    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },

    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        kind: ExprKind,
    },

    Call(Builtin),
}

/// The built-in function set of the expression language.
#[derive(Debug, Clone)]
pub enum Builtin {
    /// Big-endian read of up to 4 bytes into a number.
    Buf2Int(Box<Expr>),
    /// Fixed-width big-endian buffer from a number.
    Int2Buf { value: Box<Expr>, width: u32 },
    /// Parse decimal ASCII text into a number.
    Ascii2Int(Box<Expr>),
    /// Reverse the bytes of a buffer.
    ChangeByteOrder(Box<Expr>),
    /// 1 iff a field with that name has been decoded so far.
    IsPresent { source: FieldSource, field: String },
    HasString {
        haystack: Box<Expr>,
        pattern: Pattern,
    },
    ExtractString {
        haystack: Box<Expr>,
        pattern: Pattern,
        /// 1-based index of the capture to return.
        occurrence: u32,
    },
    IsAsn1Type {
        buffer: Box<Expr>,
        class: u32,
        tag: u32,
    },
    CheckLookup {
        table: String,
        keys: Vec<Expr>,
    },
    UpdateLookup {
        table: String,
        keys: Vec<Expr>,
        data: Vec<Expr>,
    },
}

impl Builtin {
    pub fn kind(&self) -> ExprKind {
        match self {
            Builtin::Buf2Int(_) | Builtin::Ascii2Int(_) => ExprKind::Number,
            Builtin::Int2Buf { .. } | Builtin::ChangeByteOrder(_) => ExprKind::Buffer,
            Builtin::ExtractString { .. } => ExprKind::Buffer,
            Builtin::IsPresent { .. }
            | Builtin::HasString { .. }
            | Builtin::IsAsn1Type { .. }
            | Builtin::CheckLookup { .. }
            | Builtin::UpdateLookup { .. } => ExprKind::Number,
        }
    }
}

impl Expr {
    /// The return kind stored on this node.
    pub fn kind(&self) -> ExprKind {
        match self {
            Expr::Number(_) => ExprKind::Number,
            Expr::Bytes(_) => ExprKind::Buffer,
            Expr::Boolean(_) => ExprKind::Boolean,
            Expr::Variable { kind, slice, .. } => {
                if slice.is_some() {
                    ExprKind::Buffer
                } else {
                    kind.expr_kind()
                }
            }
            Expr::LookupCell { kind, .. } => *kind,
            Expr::FieldRef { .. } => ExprKind::Buffer,
            Expr::ProtoRef { .. } => ExprKind::Number,
            Expr::Unary { op, .. } => match op {
                UnaryOp::Not => ExprKind::Boolean,
                UnaryOp::BitNot => ExprKind::Number,
            },
            Expr::Binary { kind, .. } => *kind,
            Expr::Call(builtin) => builtin.kind(),
        }
    }

    /// Walk the tree, visiting every node (children after parents).
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expr)) {
        visit(self);
        match self {
            Expr::Unary { operand, .. } => operand.walk(visit),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.walk(visit);
                rhs.walk(visit);
            }
            Expr::Variable { slice, .. }
            | Expr::LookupCell { slice, .. }
            | Expr::FieldRef { slice, .. } => {
                if let Some(slice) = slice {
                    slice.start.walk(visit);
                    slice.len.walk(visit);
                }
            }
            Expr::Call(builtin) => match builtin {
                Builtin::Buf2Int(e)
                | Builtin::Ascii2Int(e)
                | Builtin::ChangeByteOrder(e)
                | Builtin::Int2Buf { value: e, .. } => e.walk(visit),
                Builtin::HasString { haystack, .. }
                | Builtin::ExtractString { haystack, .. } => haystack.walk(visit),
                Builtin::IsAsn1Type { buffer, .. } => buffer.walk(visit),
                Builtin::CheckLookup { keys, .. } => {
                    for k in keys {
                        k.walk(visit);
                    }
                }
                Builtin::UpdateLookup { keys, data, .. } => {
                    for e in keys.iter().chain(data) {
                        e.walk(visit);
                    }
                }
                Builtin::IsPresent { .. } => {}
            },
            _ => {}
        }
    }

    /// Walk mutably; used by the organizer to bind protocol references.
    pub fn walk_mut(&mut self, visit: &mut dyn FnMut(&mut Expr)) {
        visit(self);
        match self {
            Expr::Unary { operand, .. } => operand.walk_mut(visit),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.walk_mut(visit);
                rhs.walk_mut(visit);
            }
            Expr::Variable { slice, .. }
            | Expr::LookupCell { slice, .. }
            | Expr::FieldRef { slice, .. } => {
                if let Some(slice) = slice {
                    slice.start.walk_mut(visit);
                    slice.len.walk_mut(visit);
                }
            }
            Expr::Call(builtin) => match builtin {
                Builtin::Buf2Int(e)
                | Builtin::Ascii2Int(e)
                | Builtin::ChangeByteOrder(e)
                | Builtin::Int2Buf { value: e, .. } => e.walk_mut(visit),
                Builtin::HasString { haystack, .. }
                | Builtin::ExtractString { haystack, .. } => haystack.walk_mut(visit),
                Builtin::IsAsn1Type { buffer, .. } => buffer.walk_mut(visit),
                Builtin::CheckLookup { keys, .. } => {
                    for k in keys {
                        k.walk_mut(visit);
                    }
                }
                Builtin::UpdateLookup { keys, data, .. } => {
                    for e in keys.iter_mut().chain(data.iter_mut()) {
                        e.walk_mut(visit);
                    }
                }
                Builtin::IsPresent { .. } => {}
            },
            _ => {}
        }
    }
}
