//! The safe primitive functions bound in every restricted namespace.
//!
//! All of them are pure: no I/O, no reflection, no access to the
//! namespace they are called from.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::sandbox::syntax::ast::{BinOp, CmpOp};

use super::ops;
use super::value::{Number, Range, Slice, Value, MAX_SEQUENCE_LEN};
use super::RuntimeError;

pub type BuiltinFn = fn(&[Value]) -> Result<Value, RuntimeError>;

#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFn,
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Builtin({})", self.name)
    }
}

macro_rules! builtins {
    ($($name:ident),* $(,)?) => {
        /// Every primitive, in namespace order.
        pub const BUILTINS: &[Builtin] = &[
            $(Builtin { name: stringify!($name), func: $name },)*
        ];
    };
}

builtins!(
    abs, all, any, bool, callable, chr, dict, enumerate, float, int, len, list, max, min, pow,
    range, str, sum, tuple, zip, sorted, reversed, slice,
);

/// Expands an iterable into its items.
pub fn iterate(value: &Value) -> Result<Vec<Value>, RuntimeError> {
    match value {
        Value::Tuple(items) | Value::List(items) => Ok(items.as_ref().clone()),
        Value::Str(text) => Ok(text.chars().map(|c| Value::str(c.encode_utf8(&mut [0; 4]))).collect()),
        Value::Dict(entries) => Ok(entries.iter().map(|(key, _)| key.clone()).collect()),
        Value::Range(range) => {
            if range.len() > MAX_SEQUENCE_LEN {
                return Err(RuntimeError::Value(format!(
                    "range of {} items is too large to materialize",
                    range.len()
                )));
            }
            Ok(range.iter().map(Value::Int).collect())
        }
        Value::Tensor(values) => Ok(values.iter().copied().map(Value::Float).collect()),
        other => Err(RuntimeError::Type(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), RuntimeError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("exactly {min}")
        } else {
            format!("between {min} and {max}")
        };
        return Err(RuntimeError::Type(format!(
            "{name}() takes {expected} arguments ({} given)",
            args.len()
        )));
    }
    Ok(())
}

fn integer(name: &str, value: &Value) -> Result<i64, RuntimeError> {
    match value.as_number() {
        Some(Number::Int(value)) => Ok(value),
        _ => Err(RuntimeError::Type(format!(
            "{name}(): '{}' object cannot be interpreted as an integer",
            value.type_name()
        ))),
    }
}

fn abs(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("abs", args, 1, 1)?;
    match &args[0] {
        Value::Tensor(values) => Ok(Value::tensor(values.iter().map(|v| v.abs()).collect())),
        value => match value.as_number() {
            Some(Number::Int(x)) => x.checked_abs().map(Value::Int).ok_or(RuntimeError::Overflow),
            Some(Number::Float(x)) => Ok(Value::Float(x.abs())),
            None => Err(RuntimeError::Type(format!(
                "bad operand type for abs(): '{}'",
                value.type_name()
            ))),
        },
    }
}

fn all(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("all", args, 1, 1)?;
    for item in iterate(&args[0])? {
        if !ops::truthy(&item)? {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn any(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("any", args, 1, 1)?;
    for item in iterate(&args[0])? {
        if ops::truthy(&item)? {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn bool(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("bool", args, 0, 1)?;
    match args.first() {
        Some(value) => Ok(Value::Bool(ops::truthy(value)?)),
        None => Ok(Value::Bool(false)),
    }
}

fn callable(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("callable", args, 1, 1)?;
    Ok(Value::Bool(args[0].is_callable()))
}

fn chr(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("chr", args, 1, 1)?;
    let code = integer("chr", &args[0])?;
    u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .map(|c| Value::str(c.encode_utf8(&mut [0; 4])))
        .ok_or_else(|| RuntimeError::Value(format!("chr() arg not in range: {code}")))
}

fn dict(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("dict", args, 0, 1)?;
    let Some(source) = args.first() else {
        return Ok(Value::Dict(Arc::new(Vec::new())));
    };
    if let Value::Dict(entries) = source {
        return Ok(Value::Dict(entries.clone()));
    }
    let mut entries: Vec<(Value, Value)> = Vec::new();
    for item in iterate(source)? {
        let pair = iterate(&item)?;
        let [key, value] = <[Value; 2]>::try_from(pair).map_err(|pair| {
            RuntimeError::Value(format!(
                "dictionary update sequence element has length {}; 2 is required",
                pair.len()
            ))
        })?;
        match entries.iter_mut().find(|(existing, _)| ops::equals(existing, &key)) {
            Some(entry) => entry.1 = value,
            None => entries.push((key, value)),
        }
    }
    Ok(Value::Dict(Arc::new(entries)))
}

fn enumerate(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("enumerate", args, 1, 2)?;
    let start = match args.get(1) {
        Some(start) => integer("enumerate", start)?,
        None => 0,
    };
    iterate(&args[0])?
        .into_iter()
        .enumerate()
        .map(|(index, item)| -> Result<Value, RuntimeError> {
            let index = start
                .checked_add(index as i64)
                .ok_or(RuntimeError::Overflow)?;
            Ok(Value::tuple(vec![Value::Int(index), item]))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Value::list)
}

fn float(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("float", args, 0, 1)?;
    match args.first() {
        None => Ok(Value::Float(0.0)),
        Some(Value::Str(text)) => text
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| RuntimeError::Value(format!("could not convert string to float: '{text}'"))),
        Some(Value::Tensor(values)) if values.len() == 1 => Ok(Value::Float(values[0])),
        Some(value) => value.as_f64().map(Value::Float).ok_or_else(|| {
            RuntimeError::Type(format!(
                "float() argument must be a string or a number, not '{}'",
                value.type_name()
            ))
        }),
    }
}

fn int(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("int", args, 0, 1)?;
    let from_float = |x: f64| {
        if x.is_nan() {
            return Err(RuntimeError::Value("cannot convert float NaN to integer".into()));
        }
        let truncated = x.trunc();
        if truncated < i64::MIN as f64 || truncated >= i64::MAX as f64 {
            return Err(RuntimeError::Overflow);
        }
        Ok(Value::Int(truncated as i64))
    };
    match args.first() {
        None => Ok(Value::Int(0)),
        Some(Value::Str(text)) => text
            .trim()
            .replace('_', "")
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| RuntimeError::Value(format!("invalid literal for int(): '{text}'"))),
        Some(Value::Tensor(values)) if values.len() == 1 => from_float(values[0]),
        Some(value) => match value.as_number() {
            Some(Number::Int(x)) => Ok(Value::Int(x)),
            Some(Number::Float(x)) => from_float(x),
            None => Err(RuntimeError::Type(format!(
                "int() argument must be a string or a number, not '{}'",
                value.type_name()
            ))),
        },
    }
}

fn len(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("len", args, 1, 1)?;
    let len = match &args[0] {
        Value::Str(text) => text.chars().count(),
        Value::Tuple(items) | Value::List(items) => items.len(),
        Value::Dict(entries) => entries.len(),
        Value::Range(range) => range.len(),
        Value::Tensor(values) => values.len(),
        other => {
            return Err(RuntimeError::Type(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )))
        }
    };
    Ok(Value::Int(len as i64))
}

fn list(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("list", args, 0, 1)?;
    match args.first() {
        Some(value) => Ok(Value::list(iterate(value)?)),
        None => Ok(Value::list(Vec::new())),
    }
}

fn extremum(name: &str, args: &[Value], keep: Ordering) -> Result<Value, RuntimeError> {
    if args.is_empty() {
        return Err(RuntimeError::Type(format!(
            "{name} expected at least 1 argument, got 0"
        )));
    }
    let items = if args.len() == 1 {
        iterate(&args[0])?
    } else {
        args.to_vec()
    };
    let mut items = items.into_iter();
    let mut best = items
        .next()
        .ok_or_else(|| RuntimeError::Value(format!("{name}() arg is an empty sequence")))?;
    for item in items {
        if ops::order(&item, &best, CmpOp::Lt)? == keep {
            best = item;
        }
    }
    Ok(best)
}

fn max(args: &[Value]) -> Result<Value, RuntimeError> {
    extremum("max", args, Ordering::Greater)
}

fn min(args: &[Value]) -> Result<Value, RuntimeError> {
    extremum("min", args, Ordering::Less)
}

fn pow(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("pow", args, 2, 3)?;
    let Some(modulus) = args.get(2) else {
        return ops::binary(BinOp::Pow, &args[0], &args[1]);
    };
    let base = integer("pow", &args[0])?;
    let exponent = integer("pow", &args[1])?;
    let modulus = integer("pow", modulus)?;
    if modulus == 0 {
        return Err(RuntimeError::Value("pow() 3rd argument cannot be 0".into()));
    }
    if exponent < 0 {
        return Err(RuntimeError::Value(
            "pow() negative exponent is not supported with a modulus".into(),
        ));
    }
    let modulus = modulus as i128;
    let mut result: i128 = 1;
    let mut base = (base as i128).rem_euclid(modulus);
    let mut exponent = exponent;
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = result * base % modulus;
        }
        base = base * base % modulus;
        exponent >>= 1;
    }
    // Result takes the sign of the modulus.
    let result = result.rem_euclid(modulus.abs());
    let result = if modulus < 0 && result != 0 { result + modulus } else { result };
    Ok(Value::Int(result as i64))
}

fn range(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("range", args, 1, 3)?;
    let bounds = args
        .iter()
        .map(|arg| integer("range", arg))
        .collect::<Result<Vec<_>, _>>()?;
    let (start, stop, step) = match bounds.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(RuntimeError::Type("range expected at most 3 arguments".into())),
    };
    if step == 0 {
        return Err(RuntimeError::Value("range() arg 3 must not be zero".into()));
    }
    Ok(Value::Range(Range { start, stop, step }))
}

fn str(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("str", args, 0, 1)?;
    match args.first() {
        Some(Value::Str(text)) => Ok(Value::Str(text.clone())),
        Some(value) => Ok(Value::str(&value.to_string())),
        None => Ok(Value::str("")),
    }
}

fn sum(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("sum", args, 1, 2)?;
    let start = args.get(1).cloned().unwrap_or(Value::Int(0));
    if matches!(start, Value::Str(_)) {
        return Err(RuntimeError::Type(
            "sum() can't sum strings [use ''.join(seq) instead]".into(),
        ));
    }
    iterate(&args[0])?
        .iter()
        .try_fold(start, |total, item| ops::binary(BinOp::Add, &total, item))
}

fn tuple(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("tuple", args, 0, 1)?;
    match args.first() {
        Some(Value::Tuple(items)) => Ok(Value::Tuple(items.clone())),
        Some(value) => Ok(Value::tuple(iterate(value)?)),
        None => Ok(Value::tuple(Vec::new())),
    }
}

fn zip(args: &[Value]) -> Result<Value, RuntimeError> {
    let columns = args.iter().map(iterate).collect::<Result<Vec<_>, _>>()?;
    let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
    Ok(Value::list(
        (0..rows)
            .map(|row| Value::tuple(columns.iter().map(|column| column[row].clone()).collect()))
            .collect(),
    ))
}

fn sorted(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("sorted", args, 1, 1)?;
    let mut items = iterate(&args[0])?;
    let mut failure = None;
    items.sort_by(|a, b| match ops::order(a, b, CmpOp::Lt) {
        Ok(ordering) => ordering,
        Err(err) => {
            failure.get_or_insert(err);
            Ordering::Equal
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(Value::list(items)),
    }
}

fn reversed(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("reversed", args, 1, 1)?;
    if let Value::Dict(_) = &args[0] {
        return Err(RuntimeError::Type("'dict' object is not reversible".into()));
    }
    let mut items = iterate(&args[0])?;
    items.reverse();
    Ok(Value::list(items))
}

fn slice(args: &[Value]) -> Result<Value, RuntimeError> {
    arity("slice", args, 1, 3)?;
    let bound = |value: &Value| match value {
        Value::None => Ok(None),
        other => integer("slice", other).map(Some),
    };
    let slice = match args {
        [upper] => Slice {
            lower: None,
            upper: bound(upper)?,
            step: None,
        },
        [lower, upper] => Slice {
            lower: bound(lower)?,
            upper: bound(upper)?,
            step: None,
        },
        [lower, upper, step] => Slice {
            lower: bound(lower)?,
            upper: bound(upper)?,
            step: bound(step)?,
        },
        _ => return Err(RuntimeError::Type("slice expected at most 3 arguments".into())),
    };
    Ok(Value::Slice(slice))
}
