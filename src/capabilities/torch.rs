/// The `torch` namespace object and tensor methods.
///
/// Tensors are one-dimensional float vectors. Reductions return plain
/// floats, elementwise functions return tensors.
use std::sync::Arc;

use crate::sandbox::interpreter::{RuntimeError, Value};

use super::registry::TORCH_MEMBERS;
use super::{expect_args, Capability};

/// Methods callable on a tensor value, e.g. `args["x"].sum()`.
pub const TENSOR_METHODS: &[&str] = &[
    "sum", "mean", "max", "min", "numel", "sqrt", "abs", "exp", "log", "item", "tolist",
];

pub struct Torch;

impl Capability for Torch {
    fn name(&self) -> &str {
        "torch"
    }

    fn methods(&self) -> &[&'static str] {
        TORCH_MEMBERS
    }

    fn call_method(&self, method: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        call(method, args)
    }
}

fn floats(method: &str, value: &Value) -> Result<Vec<f64>, RuntimeError> {
    value.to_floats(&format!("torch.{method}"))
}

fn call(method: &str, args: &[Value]) -> Result<Value, RuntimeError> {
    match method {
        "tensor" => {
            expect_args("torch", method, args, 1)?;
            Ok(Value::tensor(floats(method, &args[0])?))
        }
        "sum" => {
            expect_args("torch", method, args, 1)?;
            Ok(Value::Float(floats(method, &args[0])?.iter().sum()))
        }
        "mean" => {
            expect_args("torch", method, args, 1)?;
            let values = floats(method, &args[0])?;
            Ok(Value::Float(values.iter().sum::<f64>() / values.len() as f64))
        }
        "max" | "min" => extremum(method, args),
        "numel" => {
            expect_args("torch", method, args, 1)?;
            Ok(Value::Int(floats(method, &args[0])?.len() as i64))
        }
        "sqrt" => elementwise(method, args, f64::sqrt),
        "abs" => elementwise(method, args, f64::abs),
        "exp" => elementwise(method, args, f64::exp),
        "log" => elementwise(method, args, f64::ln),
        "no_grad" => {
            expect_args("torch", method, args, 0)?;
            Ok(Value::NoGrad)
        }
        _ => Err(RuntimeError::Attribute {
            receiver: "torch".into(),
            member: method.into(),
        }),
    }
}

fn elementwise(method: &str, args: &[Value], apply: fn(f64) -> f64) -> Result<Value, RuntimeError> {
    expect_args("torch", method, args, 1)?;
    match &args[0] {
        Value::Tensor(values) => Ok(Value::tensor(values.iter().copied().map(apply).collect())),
        other => match other.as_f64() {
            Some(value) => Ok(Value::Float(apply(value))),
            None => Ok(Value::tensor(floats(method, other)?.into_iter().map(apply).collect())),
        },
    }
}

/// `torch.max(t)` reduces; `torch.max(a, b)` compares elementwise.
fn extremum(method: &str, args: &[Value]) -> Result<Value, RuntimeError> {
    let pick = |a: f64, b: f64| if method == "max" { a.max(b) } else { a.min(b) };
    match args {
        [single] => floats(method, single)?
            .into_iter()
            .reduce(pick)
            .map(Value::Float)
            .ok_or_else(|| {
                RuntimeError::Value(format!("torch.{method}() of an empty tensor"))
            }),
        [left, right] => {
            let a = floats(method, left)?;
            let b = floats(method, right)?;
            let values = match (a.len(), b.len()) {
                (x, y) if x == y => a.iter().zip(&b).map(|(x, y)| pick(*x, *y)).collect(),
                (_, 1) => a.iter().map(|x| pick(*x, b[0])).collect(),
                (1, _) => b.iter().map(|y| pick(a[0], *y)).collect(),
                (x, y) => {
                    return Err(RuntimeError::Value(format!(
                        "torch.{method}(): tensor length mismatch {x} and {y}"
                    )))
                }
            };
            Ok(Value::tensor(values))
        }
        _ => expect_args("torch", method, args, 1).map(|_| Value::None),
    }
}

/// Dispatches `tensor.method(...)` to the matching `torch` function with
/// the tensor as first argument.
pub fn tensor_method(values: &Arc<Vec<f64>>, method: &str, args: &[Value]) -> Result<Value, RuntimeError> {
    match method {
        "item" => {
            expect_args("tensor", method, args, 0)?;
            match values.as_slice() {
                [value] => Ok(Value::Float(*value)),
                _ => Err(RuntimeError::Value(format!(
                    "a tensor with {} elements cannot be converted to a scalar",
                    values.len()
                ))),
            }
        }
        "tolist" => {
            expect_args("tensor", method, args, 0)?;
            Ok(Value::list(values.iter().copied().map(Value::Float).collect()))
        }
        _ if TENSOR_METHODS.contains(&method) => {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(Value::Tensor(values.clone()));
            full.extend_from_slice(args);
            call(method, &full)
        }
        _ => Err(RuntimeError::Attribute {
            receiver: "tensor".into(),
            member: method.into(),
        }),
    }
}
