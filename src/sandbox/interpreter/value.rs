use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::capabilities::Capability;
use crate::sandbox::syntax::ast::{FunctionDef, Lambda};

use super::builtins::Builtin;
use super::RuntimeError;

/// Upper bound on materialized sequences (ranges, repetitions).
pub const MAX_SEQUENCE_LEN: usize = 1 << 24;

/// A runtime value of the restricted evaluator.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Tuple(Arc<Vec<Value>>),
    List(Arc<Vec<Value>>),
    /// Insertion ordered; keys compared with `==` semantics.
    Dict(Arc<Vec<(Value, Value)>>),
    Range(Range),
    Slice(Slice),
    /// One-dimensional float tensor.
    Tensor(Arc<Vec<f64>>),
    Function(Arc<Closure>),
    Builtin(Builtin),
    Capability(Arc<dyn Capability>),
    BoundMethod(Arc<BoundMethod>),
    /// Annotation-only global such as `State`.
    Marker(&'static str),
    /// The `torch.no_grad()` context object.
    NoGrad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Range {
    pub fn len(&self) -> usize {
        let span = if self.step > 0 {
            (self.stop as i128 - self.start as i128 + self.step as i128 - 1) / self.step as i128
        } else {
            (self.start as i128 - self.stop as i128 - self.step as i128 - 1) / -(self.step as i128)
        };
        span.max(0) as usize
    }

    /// Element at `index`, which must be below `len()`; the result then
    /// lies between `start` and `stop`.
    pub fn get(&self, index: usize) -> i64 {
        (self.start as i128 + self.step as i128 * index as i128) as i64
    }

    pub fn contains(&self, value: i64) -> bool {
        let (value, start, stop, step) = (
            value as i128,
            self.start as i128,
            self.stop as i128,
            self.step as i128,
        );
        let inside = if step > 0 {
            start <= value && value < stop
        } else {
            stop < value && value <= start
        };
        inside && (value - start) % step == 0
    }

    pub fn iter(self) -> impl Iterator<Item = i64> {
        (0..self.len()).map(move |index| self.get(index))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub lower: Option<i64>,
    pub upper: Option<i64>,
    pub step: Option<i64>,
}

impl Slice {
    /// Resolves the slice against a sequence of `len` items, following
    /// the usual clamping rules for out-of-range and negative bounds.
    pub fn indices(&self, len: usize) -> Result<Vec<usize>, RuntimeError> {
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Err(RuntimeError::Value("slice step cannot be zero".into()));
        }
        let len = len as i64;
        let mut indices = Vec::new();

        if step > 0 {
            let clamp = |bound: i64| {
                if bound < 0 {
                    (bound + len).max(0)
                } else {
                    bound.min(len)
                }
            };
            let mut index = self.lower.map(clamp).unwrap_or(0);
            let upper = self.upper.map(clamp).unwrap_or(len);
            while index < upper {
                indices.push(index as usize);
                match index.checked_add(step) {
                    Some(next) => index = next,
                    None => break,
                }
            }
        } else {
            let clamp = |bound: i64| {
                if bound < 0 {
                    (bound + len).max(-1)
                } else {
                    bound.min(len - 1)
                }
            };
            let mut index = self.lower.map(clamp).unwrap_or(len - 1);
            let upper = self.upper.map(clamp).unwrap_or(-1);
            while index > upper {
                indices.push(index as usize);
                match index.checked_add(step) {
                    Some(next) => index = next,
                    None => break,
                }
            }
        }
        Ok(indices)
    }
}

/// A user-defined function or lambda.
pub struct Closure {
    pub name: Arc<str>,
    pub params: Vec<String>,
    /// Default values of the trailing parameters, evaluated at definition.
    pub defaults: Vec<Value>,
    pub body: ClosureBody,
    /// Parameters and names the body assigns; these resolve locally only.
    pub local_names: Arc<HashSet<String>>,
    /// Snapshot of the enclosing function's locals; empty at module level.
    pub captured: Arc<HashMap<String, Value>>,
}

pub enum ClosureBody {
    Function(Arc<FunctionDef>),
    Lambda(Arc<Lambda>),
}

/// `receiver.method` waiting to be called.
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Arc<str>,
}

impl Value {
    pub fn str(text: &str) -> Self {
        Value::Str(Arc::from(text))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Arc::new(items))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(items))
    }

    pub fn tensor(values: Vec<f64>) -> Self {
        Value::Tensor(Arc::new(values))
    }

    pub fn type_name(&self) -> &str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Range(_) => "range",
            Value::Slice(_) => "slice",
            Value::Tensor(_) => "tensor",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Capability(capability) => capability.name(),
            Value::BoundMethod(_) => "method",
            Value::Marker(name) => name,
            Value::NoGrad => "no_grad",
        }
    }

    /// Numeric view used by arithmetic: bools count as ints.
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Bool(value) => Some(Number::Int(*value as i64)),
            Value::Int(value) => Some(Number::Int(*value)),
            Value::Float(value) => Some(Number::Float(*value)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_number().map(Number::to_f64)
    }

    /// Flattens a tensor, a sequence of numbers or a single number into
    /// floats. Fails with a type error naming `context` otherwise.
    pub fn to_floats(&self, context: &str) -> Result<Vec<f64>, RuntimeError> {
        let not_numeric = || {
            RuntimeError::Type(format!(
                "{context}: expected a tensor or a sequence of numbers, got '{}'",
                self.type_name()
            ))
        };
        match self {
            Value::Tensor(values) => Ok(values.as_ref().clone()),
            Value::Tuple(items) | Value::List(items) => items
                .iter()
                .map(|item| match item {
                    Value::Tensor(values) if values.len() == 1 => Ok(values[0]),
                    other => other.as_f64().ok_or_else(not_numeric),
                })
                .collect(),
            Value::Range(range) => Ok(range.iter().map(|value| value as f64).collect()),
            other => other.as_f64().map(|value| vec![value]).ok_or_else(not_numeric),
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Function(_) | Value::Builtin(_) | Value::BoundMethod(_)
        )
    }

    /// Representation used inside containers and in diagnostics.
    pub fn repr(&self) -> String {
        match self {
            Value::Str(text) => format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'")),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |items: &[Value]| items.iter().map(Value::repr).collect::<Vec<_>>().join(", ");
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => f.write_str(&format_float(*value)),
            Value::Str(text) => f.write_str(text),
            Value::Tuple(items) if items.len() == 1 => write!(f, "({},)", items[0].repr()),
            Value::Tuple(items) => write!(f, "({})", join(items)),
            Value::List(items) => write!(f, "[{}]", join(items)),
            Value::Dict(entries) => {
                let entries: Vec<String> = entries
                    .iter()
                    .map(|(key, value)| format!("{}: {}", key.repr(), value.repr()))
                    .collect();
                write!(f, "{{{}}}", entries.join(", "))
            }
            Value::Range(range) if range.step == 1 => {
                write!(f, "range({}, {})", range.start, range.stop)
            }
            Value::Range(range) => {
                write!(f, "range({}, {}, {})", range.start, range.stop, range.step)
            }
            Value::Slice(slice) => {
                let bound = |bound: Option<i64>| bound.map_or("None".to_string(), |b| b.to_string());
                write!(
                    f,
                    "slice({}, {}, {})",
                    bound(slice.lower),
                    bound(slice.upper),
                    bound(slice.step)
                )
            }
            Value::Tensor(values) => {
                let values: Vec<String> = values.iter().map(|v| format_float(*v)).collect();
                write!(f, "tensor([{}])", values.join(", "))
            }
            Value::Function(closure) => write!(f, "<function {}>", closure.name),
            Value::Builtin(builtin) => write!(f, "<built-in function {}>", builtin.name),
            Value::Capability(capability) => write!(f, "<capability {}>", capability.name()),
            Value::BoundMethod(method) => {
                write!(f, "<method {} of {}>", method.method, method.receiver.type_name())
            }
            Value::Marker(name) => write!(f, "<class '{name}'>"),
            Value::NoGrad => f.write_str("<torch.no_grad>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

fn format_float(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if value == value.trunc() && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

/// Int or float operand after bool promotion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn to_f64(self) -> f64 {
        match self {
            Number::Int(value) => value as f64,
            Number::Float(value) => value,
        }
    }
}
