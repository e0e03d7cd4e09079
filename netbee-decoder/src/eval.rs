//! Expression evaluation against the packet and the run-time state.

use thiserror::Error;

use netbee_expr::{BinaryOp, Builtin, Expr, FieldSource, Slice, UnaryOp};

use crate::asn1;
use crate::state::VariableStore;
use crate::tree::DecodedPacket;
use crate::LookupStore;

/// A value produced by evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Number(u32),
    Bytes(Vec<u8>),
    Boolean(bool),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Number(n) => *n != 0,
            Value::Boolean(b) => *b,
            Value::Bytes(bytes) => !bytes.is_empty(),
        }
    }

    pub fn as_number(&self) -> Result<u32, EvalError> {
        match self {
            Value::Number(n) => Ok(*n),
            Value::Boolean(b) => Ok(*b as u32),
            Value::Bytes(_) => Err(EvalError::KindMismatch),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8], EvalError> {
        match self {
            Value::Bytes(bytes) => Ok(bytes),
            _ => Err(EvalError::KindMismatch),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, EvalError> {
        match self {
            Value::Bytes(bytes) => Ok(bytes),
            _ => Err(EvalError::KindMismatch),
        }
    }
}

/// Run-time evaluation failures. These abort the current protocol, not
/// the decoder.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("division by zero")]
    DivisionByZero,

    #[error("variable '{0}' is not declared")]
    UnknownVariable(String),

    #[error("lookup table '{0}' is not declared")]
    UnknownTable(String),

    #[error("lookup table '{table}' has no column '{column}'")]
    UnknownColumn { table: String, column: String },

    #[error("no row is bound for lookup table '{0}'")]
    NoBoundRow(String),

    #[error("lookup table '{table}' takes {expected} keys, {given} given")]
    KeyArity {
        table: String,
        expected: usize,
        given: usize,
    },

    #[error("lookup table '{0}' is full")]
    TableFull(String),

    #[error("lookup table '{0}' does not allow dynamic entries")]
    StaticTable(String),

    #[error("field '{0}' has not been decoded in this packet")]
    UnknownField(String),

    #[error("buffer of {0} bytes does not fit in a 32-bit number")]
    BufferTooWide(usize),

    #[error("slice [{start}:{len}] exceeds the buffer")]
    SliceOutOfRange { start: u32, len: u32 },

    #[error("operand kind mismatch at evaluation time")]
    KindMismatch,

    #[error("protocol reference '#{0}' was never resolved")]
    UnresolvedProto(String),
}

/// Everything an expression can read or touch while evaluating.
pub struct EvalCtx<'a> {
    pub tree: &'a DecodedPacket,
    pub vars: &'a VariableStore,
    pub tables: &'a mut LookupStore,
    /// Ordinal (within this packet) of the protocol being decoded.
    pub current_proto: Option<usize>,
    /// Packet timestamp, seconds; drives table lifetimes.
    pub now: u64,
}

impl<'a> EvalCtx<'a> {
    /// Bytes of the referenced field: the most recently decoded field
    /// with that name in the requested scope.
    fn field_bytes(&self, source: &FieldSource, name: &str) -> Result<Vec<u8>, EvalError> {
        let mut found: Option<&[u8]> = None;
        for field in self.tree.fields() {
            if field.name != name {
                continue;
            }
            let in_scope = match source {
                FieldSource::This => Some(field.proto) == self.current_proto,
                FieldSource::Proto(proto) => self
                    .tree
                    .protos()
                    .get(field.proto)
                    .map(|p| p.name == *proto)
                    .unwrap_or(false),
            };
            if in_scope {
                found = Some(&field.value);
            }
        }
        found
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| EvalError::UnknownField(name.to_string()))
    }

    fn field_present(&self, source: &FieldSource, name: &str) -> bool {
        self.field_bytes(source, name).is_ok()
    }
}

pub fn eval(ctx: &mut EvalCtx<'_>, expr: &Expr) -> Result<Value, EvalError> {
    match expr {
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Bytes(bytes) => Ok(Value::Bytes(bytes.clone())),
        Expr::Boolean(b) => Ok(Value::Boolean(*b)),

        Expr::Variable { name, slice, .. } => {
            let value = ctx.vars.get(name)?.clone();
            apply_slice(ctx, value, slice.as_ref())
        }

        Expr::LookupCell {
            table,
            column,
            slice,
            ..
        } => {
            let value = ctx.tables.table(table)?.bound_column(column)?;
            apply_slice(ctx, value, slice.as_ref())
        }

        Expr::FieldRef {
            source,
            field,
            slice,
        } => {
            let bytes = ctx.field_bytes(source, field)?;
            apply_slice(ctx, Value::Bytes(bytes), slice.as_ref())
        }

        Expr::ProtoRef { name, resolved } => resolved
            .map(Value::Number)
            .ok_or_else(|| EvalError::UnresolvedProto(name.clone())),

        Expr::Unary { op, operand } => {
            let value = eval(ctx, operand)?;
            match op {
                UnaryOp::Not => Ok(Value::Boolean(!value.truthy())),
                UnaryOp::BitNot => Ok(Value::Number(!value.as_number()?)),
            }
        }

        Expr::Binary { op, lhs, rhs, .. } => {
            // Logical operators short-circuit.
            match op {
                BinaryOp::And => {
                    let lhs = eval(ctx, lhs)?;
                    if !lhs.truthy() {
                        return Ok(Value::Boolean(false));
                    }
                    return Ok(Value::Boolean(eval(ctx, rhs)?.truthy()));
                }
                BinaryOp::Or => {
                    let lhs = eval(ctx, lhs)?;
                    if lhs.truthy() {
                        return Ok(Value::Boolean(true));
                    }
                    return Ok(Value::Boolean(eval(ctx, rhs)?.truthy()));
                }
                _ => {}
            }

            let lhs = eval(ctx, lhs)?;
            let rhs = eval(ctx, rhs)?;
            binary(*op, lhs, rhs)
        }

        Expr::Call(builtin) => call(ctx, builtin),
    }
}

pub fn eval_number(ctx: &mut EvalCtx<'_>, expr: &Expr) -> Result<u32, EvalError> {
    eval(ctx, expr)?.as_number()
}

pub fn eval_truthy(ctx: &mut EvalCtx<'_>, expr: &Expr) -> Result<bool, EvalError> {
    Ok(eval(ctx, expr)?.truthy())
}

pub fn eval_bytes(ctx: &mut EvalCtx<'_>, expr: &Expr) -> Result<Vec<u8>, EvalError> {
    eval(ctx, expr)?.into_bytes()
}

fn apply_slice(
    ctx: &mut EvalCtx<'_>,
    value: Value,
    slice: Option<&Slice>,
) -> Result<Value, EvalError> {
    let slice = match slice {
        None => return Ok(value),
        Some(slice) => slice,
    };

    let bytes = value.into_bytes()?;
    let start = eval_number(ctx, &slice.start)?;
    let len = eval_number(ctx, &slice.len)?;
    let end = start as usize + len as usize;
    if end > bytes.len() {
        return Err(EvalError::SliceOutOfRange { start, len });
    }
    Ok(Value::Bytes(bytes[start as usize..end].to_vec()))
}

/// Arithmetic is 32-bit and wraps; buffers compare byte-wise and only
/// for equality.
fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, EvalError> {
    use BinaryOp::*;

    if op.is_comparison() {
        return match (&lhs, &rhs) {
            (Value::Bytes(a), Value::Bytes(b)) => {
                let eq = a == b;
                match op {
                    Eq => Ok(Value::Boolean(eq)),
                    Ne => Ok(Value::Boolean(!eq)),
                    _ => Err(EvalError::KindMismatch),
                }
            }
            _ => {
                let a = lhs.as_number()?;
                let b = rhs.as_number()?;
                let result = match op {
                    Eq => a == b,
                    Ne => a != b,
                    Lt => a < b,
                    Le => a <= b,
                    Gt => a > b,
                    Ge => a >= b,
                    _ => unreachable!(),
                };
                Ok(Value::Boolean(result))
            }
        };
    }

    let a = lhs.as_number()?;
    let b = rhs.as_number()?;
    let result = match op {
        Add => a.wrapping_add(b),
        Sub => a.wrapping_sub(b),
        Mul => a.wrapping_mul(b),
        Div => a.checked_div(b).ok_or(EvalError::DivisionByZero)?,
        Mod => a.checked_rem(b).ok_or(EvalError::DivisionByZero)?,
        BitAnd => a & b,
        BitOr => a | b,
        _ => return Err(EvalError::KindMismatch),
    };
    Ok(Value::Number(result))
}

/// Big-endian read of up to four bytes.
pub fn buf_to_int(bytes: &[u8]) -> Result<u32, EvalError> {
    if bytes.len() > 4 {
        return Err(EvalError::BufferTooWide(bytes.len()));
    }
    Ok(bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}

/// Fixed-width big-endian buffer; widths over four zero-pad on the left.
pub fn int_to_buf(value: u32, width: u32) -> Vec<u8> {
    let width = width as usize;
    let mut out = vec![0u8; width];
    let be = value.to_be_bytes();
    let n = width.min(4);
    out[width - n..].copy_from_slice(&be[4 - n..]);
    out
}

/// Decimal ASCII prefix of the buffer, 32-bit wrapping.
fn ascii_to_int(bytes: &[u8]) -> u32 {
    let mut value = 0u32;
    for b in bytes.iter().skip_while(|b| b.is_ascii_whitespace()) {
        match b {
            b'0'..=b'9' => value = value.wrapping_mul(10).wrapping_add((b - b'0') as u32),
            _ => break,
        }
    }
    value
}

fn call(ctx: &mut EvalCtx<'_>, builtin: &Builtin) -> Result<Value, EvalError> {
    match builtin {
        Builtin::Buf2Int(arg) => {
            let bytes = eval_bytes(ctx, arg)?;
            Ok(Value::Number(buf_to_int(&bytes)?))
        }

        Builtin::Int2Buf { value, width } => {
            let value = eval_number(ctx, value)?;
            Ok(Value::Bytes(int_to_buf(value, *width)))
        }

        Builtin::Ascii2Int(arg) => {
            let bytes = eval_bytes(ctx, arg)?;
            Ok(Value::Number(ascii_to_int(&bytes)))
        }

        Builtin::ChangeByteOrder(arg) => {
            let mut bytes = eval_bytes(ctx, arg)?;
            bytes.reverse();
            Ok(Value::Bytes(bytes))
        }

        Builtin::IsPresent { source, field } => {
            Ok(Value::Number(ctx.field_present(source, field) as u32))
        }

        Builtin::HasString { haystack, pattern } => {
            let bytes = eval_bytes(ctx, haystack)?;
            Ok(Value::Number(pattern.is_match(&bytes) as u32))
        }

        Builtin::ExtractString {
            haystack,
            pattern,
            occurrence,
        } => {
            let bytes = eval_bytes(ctx, haystack)?;
            let captured = pattern
                .regex()
                .captures(&bytes)
                .and_then(|caps| caps.get(*occurrence as usize))
                .map(|m| m.as_bytes().to_vec())
                .unwrap_or_default();
            Ok(Value::Bytes(captured))
        }

        Builtin::IsAsn1Type { buffer, class, tag } => {
            let bytes = eval_bytes(ctx, buffer)?;
            let matches = asn1::identifier(&bytes)
                .map(|id| id.class == *class as u8 && id.tag == *tag)
                .unwrap_or(false);
            Ok(Value::Number(matches as u32))
        }

        Builtin::CheckLookup { table, keys } => {
            let mut key_values = Vec::with_capacity(keys.len());
            for key in keys {
                key_values.push(eval(ctx, key)?);
            }
            let now = ctx.now;
            let hit = ctx.tables.table_mut(table)?.check(&key_values, now)?;
            Ok(Value::Number(hit as u32))
        }

        Builtin::UpdateLookup { table, keys, data } => {
            let mut key_values = Vec::with_capacity(keys.len());
            for key in keys {
                key_values.push(eval(ctx, key)?);
            }
            let mut data_values = Vec::with_capacity(data.len());
            for item in data {
                data_values.push(eval(ctx, item)?);
            }
            let masks = vec![None; key_values.len()];
            let now = ctx.now;
            ctx.tables.table_mut(table)?.update(
                &key_values,
                &masks,
                data_values,
                netbee_protodb::EntryPolicy::KeepForever,
                0,
                0,
                0,
                now,
            )?;
            Ok(Value::Number(1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buf2int_round_trips_int2buf() {
        for (n, w) in [(0u32, 1u32), (255, 1), (0xABCD, 2), (0xDEADBEEF, 4)] {
            assert_eq!(buf_to_int(&int_to_buf(n, w)).unwrap(), n);
        }
    }

    #[test]
    fn buf2int_rejects_wide_buffers() {
        assert!(buf_to_int(&[0; 5]).is_err());
    }

    #[test]
    fn ascii2int_reads_a_decimal_prefix() {
        assert_eq!(ascii_to_int(b"  1234x"), 1234);
        assert_eq!(ascii_to_int(b"nope"), 0);
    }
}
