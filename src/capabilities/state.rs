/// The `state` capability: statistical operations over input columns.
///
/// Semantics follow the usual sample/population conventions: `variance`
/// and `stdev` divide by `n - 1`, their `p` variants by `n`. Every
/// successful call is appended to the operation trace, which is what the
/// downstream circuit builder consumes.
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::sandbox::interpreter::{RuntimeError, Value};

use super::{expect_args, failure, Capability};

pub const STATE_METHODS: &[&str] = &[
    "mean",
    "median",
    "geometric_mean",
    "harmonic_mean",
    "mode",
    "pstdev",
    "pvariance",
    "stdev",
    "variance",
    "covariance",
    "correlation",
    "linear_regression",
    "where",
];

/// One recorded `state.<method>(...)` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    pub method: String,
    /// Number of data points in each argument.
    pub input_lengths: Vec<usize>,
}

#[derive(Default)]
pub struct StateCapability {
    trace: Mutex<Vec<Operation>>,
}

impl StateCapability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations recorded so far, in call order.
    pub fn operations(&self) -> Vec<Operation> {
        self.trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, method: &str, inputs: &[Vec<f64>]) {
        self.trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Operation {
                method: method.to_string(),
                input_lengths: inputs.iter().map(Vec::len).collect(),
            });
    }
}

impl Capability for StateCapability {
    fn name(&self) -> &str {
        "state"
    }

    fn methods(&self) -> &[&'static str] {
        STATE_METHODS
    }

    fn call_method(&self, method: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        if !STATE_METHODS.contains(&method) {
            return Err(RuntimeError::Attribute {
                receiver: "state".into(),
                member: method.into(),
            });
        }
        let arity = match method {
            "covariance" | "correlation" | "linear_regression" | "where" => 2,
            _ => 1,
        };
        expect_args("state", method, args, arity)?;
        let inputs = args
            .iter()
            .map(|arg| arg.to_floats(&format!("state.{method}")))
            .collect::<Result<Vec<_>, _>>()?;

        let result = match (method, inputs.as_slice()) {
            ("mean", [xs]) => mean(xs).map(Value::Float),
            ("median", [xs]) => median(xs).map(Value::Float),
            ("geometric_mean", [xs]) => geometric_mean(xs).map(Value::Float),
            ("harmonic_mean", [xs]) => harmonic_mean(xs).map(Value::Float),
            ("mode", [xs]) => mode(xs).map(Value::Float),
            ("pvariance", [xs]) => pvariance(xs).map(Value::Float),
            ("pstdev", [xs]) => pvariance(xs).map(|v| Value::Float(v.sqrt())),
            ("variance", [xs]) => variance(xs).map(Value::Float),
            ("stdev", [xs]) => variance(xs).map(|v| Value::Float(v.sqrt())),
            ("covariance", [xs, ys]) => covariance(xs, ys).map(Value::Float),
            ("correlation", [xs, ys]) => correlation(xs, ys).map(Value::Float),
            ("linear_regression", [xs, ys]) => linear_regression(xs, ys)
                .map(|(slope, intercept)| Value::tuple(vec![Value::Float(slope), Value::Float(intercept)])),
            ("where", [mask, xs]) => filter(mask, xs).map(Value::tensor),
            _ => Err(format!("unsupported call to {method}")),
        }
        .map_err(|message| failure("state", message))?;

        self.record(method, &inputs);
        Ok(result)
    }
}

// ── Statistics ───────────────────────────────────────────

fn mean(xs: &[f64]) -> Result<f64, String> {
    if xs.is_empty() {
        return Err("mean requires at least one data point".into());
    }
    Ok(xs.iter().sum::<f64>() / xs.len() as f64)
}

fn median(xs: &[f64]) -> Result<f64, String> {
    if xs.is_empty() {
        return Err("no median for empty data".into());
    }
    let mut sorted = xs.to_vec();
    sorted.sort_by(f64::total_cmp);
    let middle = sorted.len() / 2;
    Ok(if sorted.len() % 2 == 1 {
        sorted[middle]
    } else {
        (sorted[middle - 1] + sorted[middle]) / 2.0
    })
}

fn geometric_mean(xs: &[f64]) -> Result<f64, String> {
    if xs.is_empty() || xs.iter().any(|x| *x <= 0.0) {
        return Err(
            "geometric mean requires a non-empty dataset containing positive numbers".into(),
        );
    }
    Ok((xs.iter().map(|x| x.ln()).sum::<f64>() / xs.len() as f64).exp())
}

fn harmonic_mean(xs: &[f64]) -> Result<f64, String> {
    if xs.is_empty() {
        return Err("harmonic_mean requires at least one data point".into());
    }
    if xs.iter().any(|x| *x < 0.0) {
        return Err("harmonic mean does not support negative values".into());
    }
    if xs.iter().any(|x| *x == 0.0) {
        return Ok(0.0);
    }
    Ok(xs.len() as f64 / xs.iter().map(|x| 1.0 / x).sum::<f64>())
}

/// First of the most common values.
fn mode(xs: &[f64]) -> Result<f64, String> {
    let mut counts: Vec<(f64, usize)> = Vec::new();
    for x in xs {
        match counts.iter_mut().find(|(value, _)| value == x) {
            Some((_, count)) => *count += 1,
            None => counts.push((*x, 1)),
        }
    }
    let mut best: Option<(f64, usize)> = None;
    for (value, count) in counts {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value)
        .ok_or_else(|| "no mode for empty data".to_string())
}

fn sum_of_squares(xs: &[f64]) -> f64 {
    let m = xs.iter().sum::<f64>() / xs.len() as f64;
    xs.iter().map(|x| (x - m) * (x - m)).sum()
}

fn pvariance(xs: &[f64]) -> Result<f64, String> {
    if xs.is_empty() {
        return Err("pvariance requires at least one data point".into());
    }
    Ok(sum_of_squares(xs) / xs.len() as f64)
}

fn variance(xs: &[f64]) -> Result<f64, String> {
    if xs.len() < 2 {
        return Err("variance requires at least two data points".into());
    }
    Ok(sum_of_squares(xs) / (xs.len() - 1) as f64)
}

/// Centered sums `(sxx, syy, sxy)` of a pair of equal-length series.
fn co_sums(name: &str, xs: &[f64], ys: &[f64]) -> Result<(f64, f64, f64), String> {
    if xs.len() != ys.len() {
        return Err(format!(
            "{name} requires that both inputs have same number of data points"
        ));
    }
    if xs.len() < 2 {
        return Err(format!("{name} requires at least two data points"));
    }
    let n = xs.len() as f64;
    let xm = xs.iter().sum::<f64>() / n;
    let ym = ys.iter().sum::<f64>() / n;
    let mut sums = (0.0, 0.0, 0.0);
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - xm;
        let dy = y - ym;
        sums.0 += dx * dx;
        sums.1 += dy * dy;
        sums.2 += dx * dy;
    }
    Ok(sums)
}

fn covariance(xs: &[f64], ys: &[f64]) -> Result<f64, String> {
    let (_, _, sxy) = co_sums("covariance", xs, ys)?;
    Ok(sxy / (xs.len() - 1) as f64)
}

fn correlation(xs: &[f64], ys: &[f64]) -> Result<f64, String> {
    let (sxx, syy, sxy) = co_sums("correlation", xs, ys)?;
    if sxx == 0.0 || syy == 0.0 {
        return Err("at least one of the inputs is constant".into());
    }
    Ok(sxy / (sxx * syy).sqrt())
}

fn linear_regression(xs: &[f64], ys: &[f64]) -> Result<(f64, f64), String> {
    let (sxx, _, sxy) = co_sums("linear_regression", xs, ys)?;
    if sxx == 0.0 {
        return Err("x is constant".into());
    }
    let slope = sxy / sxx;
    let n = xs.len() as f64;
    let intercept = ys.iter().sum::<f64>() / n - slope * xs.iter().sum::<f64>() / n;
    Ok((slope, intercept))
}

/// Keeps the elements of `xs` whose mask entry is non-zero.
fn filter(mask: &[f64], xs: &[f64]) -> Result<Vec<f64>, String> {
    if mask.len() != xs.len() {
        return Err(format!(
            "where requires a mask of the same length as the data ({} and {})",
            mask.len(),
            xs.len()
        ));
    }
    Ok(xs
        .iter()
        .zip(mask)
        .filter(|(_, keep)| **keep != 0.0)
        .map(|(x, _)| *x)
        .collect())
}
