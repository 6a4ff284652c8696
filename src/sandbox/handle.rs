use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::capabilities::Capability;
use crate::sandbox::interpreter::{Interpreter, RuntimeError, Value};
use crate::sandbox::loader::{CompiledUnit, UnitId};

/// Result of a computation: a number or a tuple of numbers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Output {
    Scalar(f64),
    Tuple(Vec<f64>),
}

impl Output {
    pub fn from_value(value: &Value) -> Result<Self, RuntimeError> {
        match value {
            Value::Tuple(items) | Value::List(items) => items
                .iter()
                .map(scalar)
                .collect::<Result<Vec<_>, _>>()
                .map(Output::Tuple),
            other => scalar(other).map(Output::Scalar),
        }
    }
}

/// Numbers and one-element tensors.
fn scalar(value: &Value) -> Result<f64, RuntimeError> {
    match value {
        Value::Tensor(values) if values.len() == 1 => Ok(values[0]),
        other => other.as_f64().ok_or_else(|| {
            RuntimeError::Type(format!(
                "a computation must return numbers or a tuple of numbers, not '{}'",
                other.type_name()
            ))
        }),
    }
}

/// An extracted computation, ready to be invoked any number of times.
#[derive(Debug, Clone)]
pub struct ComputationHandle {
    unit: Arc<CompiledUnit>,
}

impl ComputationHandle {
    pub(super) fn new(unit: Arc<CompiledUnit>) -> Self {
        Self { unit }
    }

    /// Calls the entry function with the two capabilities. Every call starts
    /// from the namespace left by the module body; runtime errors are
    /// returned as raised.
    pub fn invoke(
        &self,
        state: Arc<dyn Capability>,
        args: Arc<dyn Capability>,
    ) -> Result<Output, RuntimeError> {
        let mut interpreter =
            Interpreter::new(self.unit.namespace.clone(), self.unit.max_call_depth)
                .with_cancellation(self.unit.cancellation.clone());
        let result = interpreter.call(
            &Value::Function(self.unit.entry.clone()),
            vec![Value::Capability(state), Value::Capability(args)],
        )?;
        Output::from_value(&result)
    }

    pub fn unit_id(&self) -> UnitId {
        self.unit.id
    }

    pub fn source_path(&self) -> &Path {
        &self.unit.source_path
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.unit.loaded_at
    }

    pub fn entry_name(&self) -> &str {
        &self.unit.entry_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{ArgsCapability, StateCapability};
    use crate::sandbox::loader::{load, LoadOptions, UnitArena};
    use crate::sandbox::validator::{validate_source, ValidationPolicy};

    fn handle(body: &str) -> (tempfile::TempDir, ComputationHandle) {
        let dir = tempfile::tempdir().unwrap();
        let source = validate_source(body, &ValidationPolicy::default()).unwrap();
        let handle = load(
            &source,
            &dir.path().join("computation.py"),
            &UnitArena::new(),
            &LoadOptions::default(),
        )
        .unwrap();
        (dir, handle)
    }

    fn capabilities() -> (Arc<dyn Capability>, Arc<dyn Capability>) {
        let args = ArgsCapability::new([("x".to_string(), vec![1.0, 2.0, 6.0])]);
        (Arc::new(StateCapability::new()), Arc::new(args))
    }

    #[test]
    fn test_output_conversion() {
        assert_eq!(Output::from_value(&Value::Int(3)).unwrap(), Output::Scalar(3.0));
        assert_eq!(
            Output::from_value(&Value::tensor(vec![2.5])).unwrap(),
            Output::Scalar(2.5)
        );
        assert_eq!(
            Output::from_value(&Value::tuple(vec![Value::Float(1.5), Value::Bool(true)])).unwrap(),
            Output::Tuple(vec![1.5, 1.0])
        );
        assert!(Output::from_value(&Value::tensor(vec![1.0, 2.0])).is_err());
        assert!(Output::from_value(&Value::str("x")).is_err());
    }

    #[test]
    fn test_output_serialization() {
        assert_eq!(serde_json::to_string(&Output::Scalar(1.5)).unwrap(), "1.5");
        assert_eq!(
            serde_json::to_string(&Output::Tuple(vec![1.0, 2.0])).unwrap(),
            "[1.0,2.0]"
        );
    }

    #[test]
    fn test_invoke() {
        let (_dir, handle) = handle("def computation(state, args):\n    return state.mean(args['x'])\n");
        let (state, args) = capabilities();
        assert_eq!(handle.invoke(state, args).unwrap(), Output::Scalar(3.0));
    }

    #[test]
    fn test_repeated_invocations() {
        let (_dir, handle) = handle(
            "offset = 1\ndef computation(state, args):\n    total = offset + 1\n    return total\n",
        );
        for _ in 0..2 {
            let (state, args) = capabilities();
            assert_eq!(handle.invoke(state, args).unwrap(), Output::Scalar(2.0));
        }
    }

    #[test]
    fn test_rebinding_module_name_is_unbound_local() {
        let (_dir, handle) = handle(
            "offset = 1\ndef computation(state, args):\n    offset = offset + 1\n    return offset\n",
        );
        let (state, args) = capabilities();
        assert_eq!(
            handle.invoke(state, args).unwrap_err(),
            RuntimeError::UnboundLocal {
                name: "offset".to_string()
            }
        );
    }

    #[test]
    fn test_deep_expression_in_recursion_fails_cleanly() {
        let source = format!(
            "def f(n):\n    if n == 0:\n        return 0\n    return {}f(n - 1)\n\
             def computation(state, args):\n    return f(60)\n",
            "-".repeat(45)
        );
        let (_dir, handle) = handle(&source);
        let (state, args) = capabilities();
        assert!(matches!(
            handle.invoke(state, args),
            Err(RuntimeError::NestingLimit(_))
        ));
    }

    #[test]
    fn test_huge_step_slice_and_range() {
        let (_dir, handle) = handle(
            "def computation(state, args):\n    return state.mean(args['x'][1::9223372036854775807])\n",
        );
        let (state, args) = capabilities();
        assert_eq!(handle.invoke(state, args).unwrap(), Output::Scalar(2.0));

        let (_dir, handle) = self::handle(
            "def computation(state, args):\n    count = 0\n    \
             for i in range(-9000000000000000000, 9000000000000000000, 6000000000000000000):\n        \
             count = count + 1\n    return count\n",
        );
        let (state, args) = capabilities();
        assert_eq!(handle.invoke(state, args).unwrap(), Output::Scalar(3.0));
    }

    #[test]
    fn test_provenance() {
        let (dir, handle) = handle("def computation(state, args):\n    return 0\n");
        assert_eq!(handle.source_path(), dir.path().join("computation.py"));
        assert_eq!(handle.entry_name(), "computation");
        assert!(handle.loaded_at() <= Utc::now());
    }

    #[test]
    fn test_runtime_errors_are_not_normalized() {
        let (_dir, handle) = handle("def computation(state, args):\n    return args['missing']\n");
        let (state, args) = capabilities();
        assert!(matches!(handle.invoke(state, args), Err(RuntimeError::Key(_))));
    }
}
