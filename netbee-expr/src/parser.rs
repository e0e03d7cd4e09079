use crate::ast::{BinaryOp, Builtin, Expr, FieldSource, Slice, UnaryOp};
use crate::kind::{ColumnKind, ExpectedKind, ExprKind, VariableKind};
use crate::token::{tokenize, Spanned, Tok};
use crate::{ExprError, Pattern};

/// Name resolution supplied by the protocol database while it is being
/// loaded. The parser never sees the database itself, only this seam.
pub trait SymbolScope {
    /// Replacement payload of an alias declaration, if `name` is one.
    fn alias(&self, name: &str) -> Option<&str>;

    /// Declared kind of the `$name` run-time variable.
    fn variable_kind(&self, name: &str) -> Option<VariableKind>;

    /// Whether `name` names a lookup table (disambiguates `a.b` between
    /// a table cell and a protocol field reference).
    fn is_lookup_table(&self, name: &str) -> bool;

    /// Declared kind of a lookup-table column, keys and data alike.
    fn lookup_column_kind(&self, table: &str, column: &str) -> Option<ColumnKind>;

    /// Number of key columns in a lookup table; used to split the
    /// argument list of `updatelookuptable` into keys and data.
    fn lookup_key_count(&self, table: &str) -> Option<usize>;
}

/// Parse one attribute string into a typed tree, enforcing the kind the
/// hosting element requires.
pub fn parse(
    input: &str,
    expected: ExpectedKind,
    scope: &dyn SymbolScope,
) -> Result<Expr, ExprError> {
    if input.trim().is_empty() {
        return Err(ExprError::syntax(0, "expression string empty"));
    }

    let toks = tokenize(input)?;
    let mut active = Vec::new();
    let toks = expand_aliases(toks, scope, &mut active)?;

    let mut parser = Parser {
        toks,
        pos: 0,
        scope,
    };
    let expr = parser.parse_or()?;
    if let Some(stray) = parser.peek() {
        return Err(ExprError::syntax(
            stray.pos,
            "trailing input after expression",
        ));
    }

    let found = expr.kind();
    if !expected.accepts(found) {
        return Err(ExprError::TypeMismatch { expected, found });
    }

    Ok(expr)
}

/// Aliases substitute as fresh token streams, recursively; a name that is
/// already being expanded means the declarations form a loop.
fn expand_aliases(
    toks: Vec<Spanned>,
    scope: &dyn SymbolScope,
    active: &mut Vec<String>,
) -> Result<Vec<Spanned>, ExprError> {
    let mut out = Vec::with_capacity(toks.len());

    for spanned in toks {
        let name = match &spanned.tok {
            Tok::Ident(name) => name.clone(),
            _ => {
                out.push(spanned);
                continue;
            }
        };

        match scope.alias(&name) {
            Some(payload) => {
                if active.iter().any(|a| a == &name) {
                    return Err(ExprError::AliasCycle(name));
                }
                active.push(name);
                let inner = tokenize(payload)?;
                let inner = expand_aliases(inner, scope, active)?;
                active.pop();
                out.extend(inner);
            }
            None => out.push(spanned),
        }
    }

    Ok(out)
}

struct Parser<'a> {
    toks: Vec<Spanned>,
    pos: usize,
    scope: &'a dyn SymbolScope,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Spanned> {
        self.toks.get(self.pos)
    }

    fn bump(&mut self) -> Option<Spanned> {
        let tok = self.toks.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn here(&self) -> usize {
        self.peek().map(|s| s.pos).unwrap_or(usize::MAX)
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek().map(|s| &s.tok) == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<(), ExprError> {
        let pos = self.here();
        if self.eat(&tok) {
            Ok(())
        } else {
            Err(ExprError::syntax(pos, format!("expected {what}")))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Tok::Or) {
            let rhs = self.parse_and()?;
            lhs = logical(BinaryOp::Or, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_not()?;
        while self.eat(&Tok::And) {
            let rhs = self.parse_not()?;
            lhs = logical(BinaryOp::And, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Tok::Not) {
            let operand = self.parse_not()?;
            truthy_operand(&operand)?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_bitor()?;

        let op = match self.peek().map(|s| &s.tok) {
            Some(Tok::Eq) => BinaryOp::Eq,
            Some(Tok::Ne) => BinaryOp::Ne,
            Some(Tok::Lt) => BinaryOp::Lt,
            Some(Tok::Le) => BinaryOp::Le,
            Some(Tok::Gt) => BinaryOp::Gt,
            Some(Tok::Ge) => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;

        let rhs = self.parse_bitor()?;
        comparison(op, lhs, rhs)
    }

    fn parse_bitor(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_bitand()?;
        while self.eat(&Tok::BitOr) {
            let rhs = self.parse_bitand()?;
            lhs = numeric(BinaryOp::BitOr, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn parse_bitand(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_additive()?;
        while self.eat(&Tok::BitAnd) {
            let rhs = self.parse_additive()?;
            lhs = numeric(BinaryOp::BitAnd, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().map(|s| &s.tok) {
                Some(Tok::Plus) => BinaryOp::Add,
                Some(Tok::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = numeric(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek().map(|s| &s.tok) {
                Some(Tok::Star) => BinaryOp::Mul,
                Some(Tok::Slash) => BinaryOp::Div,
                Some(Tok::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = numeric(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Tok::BitNot) {
            let operand = self.parse_unary()?;
            if operand.kind() != ExprKind::Number {
                return Err(ExprError::TypeMismatch {
                    expected: ExpectedKind::NumberOnly,
                    found: operand.kind(),
                });
            }
            return Ok(Expr::Unary {
                op: UnaryOp::BitNot,
                operand: Box::new(operand),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let spanned = self
            .bump()
            .ok_or_else(|| ExprError::syntax(usize::MAX, "unexpected end of expression"))?;
        let pos = spanned.pos;

        match spanned.tok {
            Tok::Number(n) => Ok(Expr::Number(n)),
            Tok::Str { bytes, .. } => Ok(Expr::Bytes(bytes)),
            Tok::True => Ok(Expr::Boolean(true)),
            Tok::False => Ok(Expr::Boolean(false)),
            Tok::LParen => {
                let inner = self.parse_or()?;
                self.expect(Tok::RParen, "closing parenthesis")?;
                Ok(inner)
            }
            Tok::ProtoRef(name) => Ok(Expr::ProtoRef {
                name,
                resolved: None,
            }),
            Tok::Variable(name) => {
                let kind = self
                    .scope
                    .variable_kind(&name)
                    .ok_or_else(|| ExprError::UnknownName(format!("${name}")))?;
                let slice = self.parse_slice()?;
                if slice.is_some() && kind.expr_kind() != ExprKind::Buffer {
                    return Err(ExprError::TypeMismatch {
                        expected: ExpectedKind::BufferOnly,
                        found: kind.expr_kind(),
                    });
                }
                Ok(Expr::Variable { name, kind, slice })
            }
            Tok::Ident(name) => self.parse_named(name, pos),
            other => Err(ExprError::syntax(
                pos,
                format!("unexpected token {other:?}"),
            )),
        }
    }

    /// A bare identifier: a function call, `this.field`, `proto.field`
    /// or `table.column`.
    fn parse_named(&mut self, name: String, pos: usize) -> Result<Expr, ExprError> {
        if self.peek().map(|s| &s.tok) == Some(&Tok::LParen) {
            return self.parse_call(&name, pos);
        }

        if !self.eat(&Tok::Dot) {
            return Err(ExprError::UnknownName(name));
        }

        let member = match self.bump() {
            Some(Spanned {
                tok: Tok::Ident(member),
                ..
            }) => member,
            _ => return Err(ExprError::syntax(pos, "expected a member name after '.'")),
        };

        if name == "this" {
            let slice = self.parse_slice()?;
            return Ok(Expr::FieldRef {
                source: FieldSource::This,
                field: member,
                slice,
            });
        }

        if self.scope.is_lookup_table(&name) {
            let kind = self
                .scope
                .lookup_column_kind(&name, &member)
                .ok_or_else(|| ExprError::UnknownName(format!("{name}.{member}")))?;
            let slice = self.parse_slice()?;
            if slice.is_some() && kind != ColumnKind::Buffer {
                return Err(ExprError::TypeMismatch {
                    expected: ExpectedKind::BufferOnly,
                    found: kind.expr_kind(),
                });
            }
            return Ok(Expr::LookupCell {
                table: name,
                column: member,
                kind: kind.expr_kind(),
                slice,
            });
        }

        let slice = self.parse_slice()?;
        Ok(Expr::FieldRef {
            source: FieldSource::Proto(name),
            field: member,
            slice,
        })
    }

    fn parse_slice(&mut self) -> Result<Option<Slice>, ExprError> {
        if !self.eat(&Tok::LBracket) {
            return Ok(None);
        }

        let start = self.parse_or()?;
        self.expect(Tok::Colon, "':' inside slice")?;
        let len = self.parse_or()?;
        self.expect(Tok::RBracket, "closing ']'")?;

        for bound in [&start, &len] {
            if bound.kind() != ExprKind::Number {
                return Err(ExprError::TypeMismatch {
                    expected: ExpectedKind::NumberOnly,
                    found: bound.kind(),
                });
            }
        }

        Ok(Some(Slice {
            start: Box::new(start),
            len: Box::new(len),
        }))
    }

    fn parse_call(&mut self, name: &str, pos: usize) -> Result<Expr, ExprError> {
        self.expect(Tok::LParen, "'('")?;

        let builtin = match name {
            "buf2int" => {
                let arg = self.buffer_arg()?;
                Builtin::Buf2Int(Box::new(arg))
            }
            "ascii2int" => {
                let arg = self.buffer_arg()?;
                Builtin::Ascii2Int(Box::new(arg))
            }
            "changebyteorder" => {
                let arg = self.buffer_arg()?;
                Builtin::ChangeByteOrder(Box::new(arg))
            }
            "int2buf" => {
                let value = self.parse_or()?;
                if value.kind() != ExprKind::Number {
                    return Err(ExprError::TypeMismatch {
                        expected: ExpectedKind::NumberOnly,
                        found: value.kind(),
                    });
                }
                self.expect(Tok::Comma, "','")?;
                let width = self.literal_number("int2buf width")?;
                Builtin::Int2Buf {
                    value: Box::new(value),
                    width,
                }
            }
            "ispresent" => {
                let arg = self.parse_primary()?;
                match arg {
                    Expr::FieldRef {
                        source,
                        field,
                        slice: None,
                    } => Builtin::IsPresent { source, field },
                    _ => {
                        return Err(ExprError::syntax(
                            pos,
                            "ispresent takes a plain field reference",
                        ))
                    }
                }
            }
            "hasstring" | "extractstring" => {
                let haystack = self.buffer_arg()?;
                self.expect(Tok::Comma, "','")?;
                let raw = self.literal_string(name)?;
                let case_sensitive = if self.eat(&Tok::Comma) {
                    self.literal_number("case-sensitivity flag")? != 0
                } else {
                    true
                };

                if name == "hasstring" {
                    Builtin::HasString {
                        haystack: Box::new(haystack),
                        pattern: Pattern::compile(&raw, case_sensitive)?,
                    }
                } else {
                    let occurrence = if self.eat(&Tok::Comma) {
                        self.literal_number("match index")?
                    } else {
                        1
                    };
                    Builtin::ExtractString {
                        haystack: Box::new(haystack),
                        pattern: Pattern::compile(&raw, case_sensitive)?,
                        occurrence,
                    }
                }
            }
            "isasn1type" => {
                let buffer = self.buffer_arg()?;
                self.expect(Tok::Comma, "','")?;
                let class = self.literal_number("ASN.1 class")?;
                self.expect(Tok::Comma, "','")?;
                let tag = self.literal_number("ASN.1 tag")?;
                Builtin::IsAsn1Type {
                    buffer: Box::new(buffer),
                    class,
                    tag,
                }
            }
            "checklookuptable" | "updatelookuptable" => {
                let table = match self.bump() {
                    Some(Spanned {
                        tok: Tok::Ident(table),
                        ..
                    }) => table,
                    _ => return Err(ExprError::syntax(pos, "expected a lookup-table name")),
                };
                if !self.scope.is_lookup_table(&table) {
                    return Err(ExprError::UnknownName(table));
                }
                let key_count = self
                    .scope
                    .lookup_key_count(&table)
                    .ok_or_else(|| ExprError::UnknownName(table.clone()))?;

                let mut args = Vec::new();
                while self.eat(&Tok::Comma) {
                    args.push(self.parse_or()?);
                }

                if name == "checklookuptable" {
                    if args.len() != key_count {
                        return Err(ExprError::syntax(
                            pos,
                            format!(
                                "table '{table}' has {key_count} keys, {} given",
                                args.len()
                            ),
                        ));
                    }
                    Builtin::CheckLookup { table, keys: args }
                } else {
                    if args.len() < key_count {
                        return Err(ExprError::syntax(
                            pos,
                            format!(
                                "table '{table}' has {key_count} keys, {} arguments given",
                                args.len()
                            ),
                        ));
                    }
                    let data = args.split_off(key_count);
                    Builtin::UpdateLookup {
                        table,
                        keys: args,
                        data,
                    }
                }
            }
            _ => {
                return Err(ExprError::UnknownName(name.to_string()));
            }
        };

        self.expect(Tok::RParen, "closing ')'")?;
        Ok(Expr::Call(builtin))
    }

    fn buffer_arg(&mut self) -> Result<Expr, ExprError> {
        let arg = self.parse_or()?;
        if arg.kind() != ExprKind::Buffer {
            return Err(ExprError::TypeMismatch {
                expected: ExpectedKind::BufferOnly,
                found: arg.kind(),
            });
        }
        Ok(arg)
    }

    fn literal_number(&mut self, what: &str) -> Result<u32, ExprError> {
        let pos = self.here();
        match self.bump() {
            Some(Spanned {
                tok: Tok::Number(n),
                ..
            }) => Ok(n),
            _ => Err(ExprError::syntax(pos, format!("{what} must be a literal number"))),
        }
    }

    /// Raw text of a quoted literal, as written (escapes untouched).
    fn literal_string(&mut self, what: &str) -> Result<String, ExprError> {
        let pos = self.here();
        match self.bump() {
            Some(Spanned {
                tok: Tok::Str { raw, .. },
                ..
            }) => Ok(raw),
            _ => Err(ExprError::syntax(
                pos,
                format!("{what} takes a quoted pattern"),
            )),
        }
    }
}

fn truthy_operand(expr: &Expr) -> Result<(), ExprError> {
    match expr.kind() {
        ExprKind::Number | ExprKind::Boolean => Ok(()),
        found => Err(ExprError::TypeMismatch {
            expected: ExpectedKind::BooleanOnly,
            found,
        }),
    }
}

fn logical(op: BinaryOp, lhs: Expr, rhs: Expr) -> Result<Expr, ExprError> {
    truthy_operand(&lhs)?;
    truthy_operand(&rhs)?;
    Ok(Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        kind: ExprKind::Boolean,
    })
}

fn comparison(op: BinaryOp, lhs: Expr, rhs: Expr) -> Result<Expr, ExprError> {
    let (lk, rk) = (lhs.kind(), rhs.kind());

    let ok = match (lk, rk) {
        (ExprKind::Number, ExprKind::Number) => true,
        // Buffers compare for equality only; they have no ordering.
        (ExprKind::Buffer, ExprKind::Buffer) => matches!(op, BinaryOp::Eq | BinaryOp::Ne),
        (ExprKind::Boolean, ExprKind::Boolean) => matches!(op, BinaryOp::Eq | BinaryOp::Ne),
        _ => false,
    };

    if !ok {
        return Err(ExprError::TypeMismatch {
            expected: match lk {
                ExprKind::Buffer => ExpectedKind::BufferOnly,
                _ => ExpectedKind::NumberOnly,
            },
            found: rk,
        });
    }

    Ok(Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        kind: ExprKind::Boolean,
    })
}

fn numeric(op: BinaryOp, lhs: Expr, rhs: Expr) -> Result<Expr, ExprError> {
    for side in [&lhs, &rhs] {
        if side.kind() != ExprKind::Number {
            return Err(ExprError::TypeMismatch {
                expected: ExpectedKind::NumberOnly,
                found: side.kind(),
            });
        }
    }
    Ok(Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        kind: ExprKind::Number,
    })
}
