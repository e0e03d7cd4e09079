use std::fmt;

/// Return kind carried by every expression node.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExprKind {
    Number,
    Buffer,
    Boolean,
    /// Placeholder for nodes whose kind is irrelevant (e.g. the operator
    /// slot of a partially built tree). Never escapes a finished parse.
    DontMind,
}

impl fmt::Display for ExprKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprKind::Number => write!(f, "number"),
            ExprKind::Buffer => write!(f, "buffer"),
            ExprKind::Boolean => write!(f, "boolean"),
            ExprKind::DontMind => write!(f, "any"),
        }
    }
}

/// What the element hosting the expression is willing to accept.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedKind {
    NumberOnly,
    BufferOnly,
    BooleanOnly,
    Any,
}

impl ExpectedKind {
    pub fn accepts(&self, kind: ExprKind) -> bool {
        match self {
            ExpectedKind::NumberOnly => kind == ExprKind::Number,
            ExpectedKind::BufferOnly => kind == ExprKind::Buffer,
            ExpectedKind::BooleanOnly => kind == ExprKind::Boolean,
            ExpectedKind::Any => true,
        }
    }
}

impl fmt::Display for ExpectedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedKind::NumberOnly => write!(f, "number"),
            ExpectedKind::BufferOnly => write!(f, "buffer"),
            ExpectedKind::BooleanOnly => write!(f, "boolean"),
            ExpectedKind::Any => write!(f, "any kind"),
        }
    }
}

/// Kind of a run-time variable declaration, as seen by the parser when it
/// resolves a `$name` reference.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VariableKind {
    Number,
    Buffer,
    /// Buffer view aliasing a slice of the current packet.
    RefBuffer,
    /// Holds a protocol index; reads as a number.
    Protocol,
}

impl VariableKind {
    pub fn expr_kind(&self) -> ExprKind {
        match self {
            VariableKind::Number | VariableKind::Protocol => ExprKind::Number,
            VariableKind::Buffer | VariableKind::RefBuffer => ExprKind::Buffer,
        }
    }
}

/// Declared kind of a lookup-table key or data column.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ColumnKind {
    Number,
    Buffer,
    Protocol,
}

impl ColumnKind {
    pub fn expr_kind(&self) -> ExprKind {
        match self {
            ColumnKind::Number | ColumnKind::Protocol => ExprKind::Number,
            ColumnKind::Buffer => ExprKind::Buffer,
        }
    }
}
