//! Operator semantics: arithmetic with checked integers, elementwise
//! tensor arithmetic, comparisons and membership.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::sandbox::syntax::ast::{BinOp, CmpOp, UnaryOp};

use super::value::{Number, Value, MAX_SEQUENCE_LEN};
use super::RuntimeError;

pub fn binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return numeric(op, a, b);
    }

    match (left, right) {
        (Value::Tensor(a), Value::Tensor(b)) => {
            if op == BinOp::MatMul {
                return dot(a, b);
            }
            if a.len() != b.len() {
                return Err(RuntimeError::Value(format!(
                    "tensor length mismatch for {}: {} and {}",
                    op.symbol(),
                    a.len(),
                    b.len()
                )));
            }
            let values = a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| float_elementwise(op, *x, *y))
                .collect::<Option<Vec<_>>>();
            values
                .map(Value::tensor)
                .ok_or_else(|| unsupported(op, left, right))
        }
        (Value::Tensor(a), other) if other.as_number().is_some() => {
            let y = other.as_f64().unwrap_or_default();
            broadcast(op, a, |x| float_elementwise(op, x, y), left, right)
        }
        (other, Value::Tensor(b)) if other.as_number().is_some() => {
            let x = other.as_f64().unwrap_or_default();
            broadcast(op, b, |y| float_elementwise(op, x, y), left, right)
        }
        (Value::Str(a), Value::Str(b)) if op == BinOp::Add => {
            Ok(Value::Str(Arc::from(format!("{a}{b}"))))
        }
        (Value::List(a), Value::List(b)) if op == BinOp::Add => {
            Ok(Value::list(a.iter().chain(b.iter()).cloned().collect()))
        }
        (Value::Tuple(a), Value::Tuple(b)) if op == BinOp::Add => {
            Ok(Value::tuple(a.iter().chain(b.iter()).cloned().collect()))
        }
        (sequence, Value::Int(count)) | (Value::Int(count), sequence) if op == BinOp::Mul => {
            repeat(sequence, *count).ok_or_else(|| unsupported(op, left, right))?
        }
        _ => Err(unsupported(op, left, right)),
    }
}

fn unsupported(op: BinOp, left: &Value, right: &Value) -> RuntimeError {
    RuntimeError::Type(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

fn broadcast(
    op: BinOp,
    values: &[f64],
    apply: impl Fn(f64) -> Option<f64>,
    left: &Value,
    right: &Value,
) -> Result<Value, RuntimeError> {
    values
        .iter()
        .map(|value| apply(*value))
        .collect::<Option<Vec<_>>>()
        .map(Value::tensor)
        .ok_or_else(|| unsupported(op, left, right))
}

fn dot(a: &[f64], b: &[f64]) -> Result<Value, RuntimeError> {
    if a.len() != b.len() {
        return Err(RuntimeError::Value(format!(
            "inconsistent tensor size for @: {} and {}",
            a.len(),
            b.len()
        )));
    }
    Ok(Value::Float(a.iter().zip(b).map(|(x, y)| x * y).sum()))
}

fn repeat(sequence: &Value, count: i64) -> Option<Result<Value, RuntimeError>> {
    let count = count.max(0) as usize;
    let len = match sequence {
        Value::Str(text) => text.len(),
        Value::List(items) | Value::Tuple(items) => items.len(),
        _ => return None,
    };
    if len.saturating_mul(count) > MAX_SEQUENCE_LEN {
        return Some(Err(RuntimeError::Overflow));
    }
    let repeated = |items: &Arc<Vec<Value>>| {
        items
            .iter()
            .cloned()
            .cycle()
            .take(items.len() * count)
            .collect::<Vec<_>>()
    };
    Some(Ok(match sequence {
        Value::Str(text) => Value::Str(Arc::from(text.repeat(count))),
        Value::List(items) => Value::list(repeated(items)),
        Value::Tuple(items) => Value::tuple(repeated(items)),
        _ => return None,
    }))
}

/// Elementwise float arithmetic as tensors do it: division by zero yields
/// infinities rather than an error. `None` for non-arithmetic operators.
fn float_elementwise(op: BinOp, x: f64, y: f64) -> Option<f64> {
    Some(match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => x / y,
        BinOp::FloorDiv => (x / y).floor(),
        BinOp::Mod => x - y * (x / y).floor(),
        BinOp::Pow => x.powf(y),
        _ => return None,
    })
}

fn numeric(op: BinOp, a: Number, b: Number) -> Result<Value, RuntimeError> {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => int_arithmetic(op, x, y),
        _ => float_arithmetic(op, a.to_f64(), b.to_f64()),
    }
}

fn int_arithmetic(op: BinOp, x: i64, y: i64) -> Result<Value, RuntimeError> {
    let checked = |value: Option<i64>| value.map(Value::Int).ok_or(RuntimeError::Overflow);
    match op {
        BinOp::Add => checked(x.checked_add(y)),
        BinOp::Sub => checked(x.checked_sub(y)),
        BinOp::Mul => checked(x.checked_mul(y)),
        BinOp::Div => {
            if y == 0 {
                return Err(RuntimeError::ZeroDivision);
            }
            Ok(Value::Float(x as f64 / y as f64))
        }
        BinOp::FloorDiv => {
            if y == 0 {
                return Err(RuntimeError::ZeroDivision);
            }
            let quotient = x.checked_div(y).ok_or(RuntimeError::Overflow)?;
            if x % y != 0 && ((x < 0) != (y < 0)) {
                Ok(Value::Int(quotient - 1))
            } else {
                Ok(Value::Int(quotient))
            }
        }
        BinOp::Mod => {
            if y == 0 {
                return Err(RuntimeError::ZeroDivision);
            }
            let remainder = x.checked_rem(y).ok_or(RuntimeError::Overflow)?;
            if remainder != 0 && ((remainder < 0) != (y < 0)) {
                Ok(Value::Int(remainder + y))
            } else {
                Ok(Value::Int(remainder))
            }
        }
        BinOp::Pow => {
            if y < 0 {
                return float_arithmetic(op, x as f64, y as f64);
            }
            let exponent = u32::try_from(y).map_err(|_| RuntimeError::Overflow)?;
            checked(x.checked_pow(exponent))
        }
        BinOp::BitAnd => Ok(Value::Int(x & y)),
        BinOp::BitOr => Ok(Value::Int(x | y)),
        BinOp::BitXor => Ok(Value::Int(x ^ y)),
        BinOp::LShift => {
            if y < 0 {
                return Err(RuntimeError::Value("negative shift count".into()));
            }
            if x == 0 {
                return Ok(Value::Int(0));
            }
            if y >= 63 {
                return Err(RuntimeError::Overflow);
            }
            let shifted = x << y;
            if shifted >> y != x {
                return Err(RuntimeError::Overflow);
            }
            Ok(Value::Int(shifted))
        }
        BinOp::RShift => {
            if y < 0 {
                return Err(RuntimeError::Value("negative shift count".into()));
            }
            Ok(Value::Int(if y >= 64 { if x < 0 { -1 } else { 0 } } else { x >> y }))
        }
        BinOp::MatMul => Err(RuntimeError::Type(
            "unsupported operand type(s) for @: 'int' and 'int'".into(),
        )),
    }
}

fn float_arithmetic(op: BinOp, x: f64, y: f64) -> Result<Value, RuntimeError> {
    let value = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div | BinOp::FloorDiv | BinOp::Mod if y == 0.0 => {
            return Err(RuntimeError::ZeroDivision)
        }
        BinOp::Div => x / y,
        BinOp::FloorDiv => (x / y).floor(),
        BinOp::Mod => {
            let remainder = x % y;
            if remainder != 0.0 && ((remainder < 0.0) != (y < 0.0)) {
                remainder + y
            } else {
                remainder
            }
        }
        BinOp::Pow => {
            if x == 0.0 && y < 0.0 {
                return Err(RuntimeError::ZeroDivision);
            }
            if x < 0.0 && y.fract() != 0.0 {
                return Err(RuntimeError::Value(
                    "negative number cannot be raised to a fractional power".into(),
                ));
            }
            let value = x.powf(y);
            if value.is_infinite() && x.is_finite() && y.is_finite() {
                return Err(RuntimeError::Overflow);
            }
            value
        }
        _ => {
            return Err(RuntimeError::Type(format!(
                "unsupported operand type(s) for {}: 'float' and 'float'",
                op.symbol()
            )))
        }
    };
    Ok(Value::Float(value))
}

pub fn unary(op: UnaryOp, operand: &Value) -> Result<Value, RuntimeError> {
    match (op, operand) {
        (UnaryOp::Not, value) => Ok(Value::Bool(!truthy(value)?)),
        (UnaryOp::Neg, Value::Tensor(values)) => {
            Ok(Value::tensor(values.iter().map(|value| -value).collect()))
        }
        (UnaryOp::Pos, Value::Tensor(_)) => Ok(operand.clone()),
        (op, value) => match (op, value.as_number()) {
            (UnaryOp::Neg, Some(Number::Int(x))) => {
                x.checked_neg().map(Value::Int).ok_or(RuntimeError::Overflow)
            }
            (UnaryOp::Neg, Some(Number::Float(x))) => Ok(Value::Float(-x)),
            (UnaryOp::Pos, Some(Number::Int(x))) => Ok(Value::Int(x)),
            (UnaryOp::Pos, Some(Number::Float(x))) => Ok(Value::Float(x)),
            (UnaryOp::Invert, Some(Number::Int(x))) => Ok(Value::Int(!x)),
            _ => Err(RuntimeError::Type(format!(
                "bad operand type for unary {}: '{}'",
                match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Pos => "+",
                    UnaryOp::Invert => "~",
                    UnaryOp::Not => "not",
                },
                value.type_name()
            ))),
        },
    }
}

pub fn truthy(value: &Value) -> Result<bool, RuntimeError> {
    Ok(match value {
        Value::None => false,
        Value::Bool(value) => *value,
        Value::Int(value) => *value != 0,
        Value::Float(value) => *value != 0.0,
        Value::Str(text) => !text.is_empty(),
        Value::Tuple(items) | Value::List(items) => !items.is_empty(),
        Value::Dict(entries) => !entries.is_empty(),
        Value::Range(range) => range.len() > 0,
        Value::Tensor(values) if values.len() == 1 => values[0] != 0.0,
        Value::Tensor(values) => {
            return Err(RuntimeError::Value(format!(
                "the truth value of a tensor with {} elements is ambiguous",
                values.len()
            )))
        }
        _ => true,
    })
}

pub fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    if let Some(mask) = tensor_mask(op, left, right)? {
        return Ok(mask);
    }
    let result = match op {
        CmpOp::Eq => equals(left, right),
        CmpOp::NotEq => !equals(left, right),
        CmpOp::Lt => order(left, right, op)? == Ordering::Less,
        CmpOp::LtE => order(left, right, op)? != Ordering::Greater,
        CmpOp::Gt => order(left, right, op)? == Ordering::Greater,
        CmpOp::GtE => order(left, right, op)? != Ordering::Less,
        CmpOp::In => contains(right, left)?,
        CmpOp::NotIn => !contains(right, left)?,
        CmpOp::Is => identical(left, right),
        CmpOp::IsNot => !identical(left, right),
    };
    Ok(Value::Bool(result))
}

/// Comparisons involving a tensor and a number or equal-length tensor
/// yield a 0/1 mask.
fn tensor_mask(op: CmpOp, left: &Value, right: &Value) -> Result<Option<Value>, RuntimeError> {
    let test = |x: f64, y: f64| match op {
        CmpOp::Eq => Some(x == y),
        CmpOp::NotEq => Some(x != y),
        CmpOp::Lt => Some(x < y),
        CmpOp::LtE => Some(x <= y),
        CmpOp::Gt => Some(x > y),
        CmpOp::GtE => Some(x >= y),
        _ => None,
    };
    let mask = |bits: Option<Vec<bool>>| {
        bits.map(|bits| Value::tensor(bits.into_iter().map(|bit| bit as u8 as f64).collect()))
    };
    let pairs: Vec<(f64, f64)> = match (left, right) {
        (Value::Tensor(a), Value::Tensor(b)) => {
            if a.len() != b.len() {
                return Err(RuntimeError::Value(format!(
                    "tensor length mismatch for {}: {} and {}",
                    op.symbol(),
                    a.len(),
                    b.len()
                )));
            }
            a.iter().copied().zip(b.iter().copied()).collect()
        }
        (Value::Tensor(a), other) => match other.as_f64() {
            Some(y) => a.iter().map(|x| (*x, y)).collect(),
            None => return Ok(None),
        },
        (other, Value::Tensor(b)) => match other.as_f64() {
            Some(x) => b.iter().map(|y| (x, *y)).collect(),
            None => return Ok(None),
        },
        _ => return Ok(None),
    };
    Ok(mask(pairs.into_iter().map(|(x, y)| test(x, y)).collect()))
}

pub fn equals(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return match (a, b) {
            (Number::Int(x), Number::Int(y)) => x == y,
            _ => a.to_f64() == b.to_f64(),
        };
    }
    match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Tuple(a), Value::Tuple(b)) | (Value::List(a), Value::List(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| equals(x, y))
        }
        (Value::Dict(a), Value::Dict(b)) => {
            a.len() == b.len()
                && a.iter().all(|(key, value)| {
                    b.iter()
                        .find(|(other, _)| equals(key, other))
                        .is_some_and(|(_, other)| equals(value, other))
                })
        }
        (Value::Range(a), Value::Range(b)) => a == b,
        (Value::Slice(a), Value::Slice(b)) => a == b,
        (Value::Tensor(a), Value::Tensor(b)) => a == b,
        (Value::Marker(a), Value::Marker(b)) => a == b,
        (Value::NoGrad, Value::NoGrad) => true,
        _ => identical(left, right),
    }
}

fn identical(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::None, Value::None) | (Value::NoGrad, Value::NoGrad) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
        (Value::Str(a), Value::Str(b)) => Arc::ptr_eq(a, b) || a == b,
        (Value::Tuple(a), Value::Tuple(b)) | (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
        (Value::Dict(a), Value::Dict(b)) => Arc::ptr_eq(a, b),
        (Value::Tensor(a), Value::Tensor(b)) => Arc::ptr_eq(a, b),
        (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
        (Value::Capability(a), Value::Capability(b)) => Arc::ptr_eq(a, b),
        (Value::Builtin(a), Value::Builtin(b)) => a.name == b.name,
        (Value::Marker(a), Value::Marker(b)) => a == b,
        _ => false,
    }
}

/// Total order for `<`-style comparisons, `sorted`, `min` and `max`.
pub fn order(left: &Value, right: &Value, op: CmpOp) -> Result<Ordering, RuntimeError> {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        let ordering = match (a, b) {
            (Number::Int(x), Number::Int(y)) => Some(x.cmp(&y)),
            _ => a.to_f64().partial_cmp(&b.to_f64()),
        };
        // NaN compares false both ways; treat it as equal so every
        // ordering operator returns false except the inclusive ones.
        return Ok(ordering.unwrap_or(Ordering::Equal));
    }
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        (Value::Tuple(a), Value::Tuple(b)) | (Value::List(a), Value::List(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                if !equals(x, y) {
                    return order(x, y, op);
                }
            }
            Ok(a.len().cmp(&b.len()))
        }
        _ => Err(RuntimeError::Type(format!(
            "'{}' not supported between instances of '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))),
    }
}

pub fn contains(container: &Value, item: &Value) -> Result<bool, RuntimeError> {
    match container {
        Value::Str(text) => match item {
            Value::Str(needle) => Ok(text.contains(needle.as_ref())),
            other => Err(RuntimeError::Type(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::Tuple(items) | Value::List(items) => Ok(items.iter().any(|x| equals(x, item))),
        Value::Dict(entries) => Ok(entries.iter().any(|(key, _)| equals(key, item))),
        Value::Range(range) => Ok(match item.as_number() {
            Some(Number::Int(value)) => range.contains(value),
            Some(Number::Float(value)) => {
                value.fract() == 0.0
                    && value >= i64::MIN as f64
                    && value < i64::MAX as f64
                    && range.contains(value as i64)
            }
            None => false,
        }),
        Value::Tensor(values) => Ok(item
            .as_f64()
            .is_some_and(|needle| values.iter().any(|value| *value == needle))),
        other => Err(RuntimeError::Type(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}
