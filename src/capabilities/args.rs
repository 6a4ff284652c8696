/// The `args` capability: read access to the input columns.
///
/// Columns are addressed by name (`args["x"]`) or by position in sorted
/// name order (`args[0]`). Every access is remembered so the caller can
/// report which columns the computation selected.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::sandbox::interpreter::{RuntimeError, Value};

use super::Capability;

pub struct ArgsCapability {
    columns: BTreeMap<String, Arc<Vec<f64>>>,
    selected: Mutex<Vec<String>>,
}

impl ArgsCapability {
    pub fn new(columns: impl IntoIterator<Item = (String, Vec<f64>)>) -> Self {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, values)| (name, Arc::new(values)))
                .collect(),
            selected: Mutex::new(Vec::new()),
        }
    }

    /// Accessed columns in first-access order.
    pub fn selected_columns(&self) -> Vec<String> {
        self.selected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn select(&self, name: &str, values: &Arc<Vec<f64>>) -> Value {
        let mut selected = self.selected.lock().unwrap_or_else(PoisonError::into_inner);
        if !selected.iter().any(|column| column == name) {
            selected.push(name.to_string());
        }
        Value::Tensor(values.clone())
    }
}

impl Capability for ArgsCapability {
    fn name(&self) -> &str {
        "args"
    }

    fn methods(&self) -> &[&'static str] {
        &[]
    }

    fn call_method(&self, method: &str, _args: &[Value]) -> Result<Value, RuntimeError> {
        Err(RuntimeError::Attribute {
            receiver: "args".into(),
            member: method.into(),
        })
    }

    fn get_item(&self, key: &Value) -> Result<Value, RuntimeError> {
        match key {
            Value::Str(name) => self
                .columns
                .get(name.as_ref())
                .map(|values| self.select(name, values))
                .ok_or_else(|| RuntimeError::Key(key.repr())),
            Value::Int(position) => {
                let len = self.columns.len() as i64;
                let resolved = if *position < 0 { position + len } else { *position };
                usize::try_from(resolved)
                    .ok()
                    .and_then(|index| self.columns.iter().nth(index))
                    .map(|(name, values)| self.select(name, values))
                    .ok_or_else(|| {
                        RuntimeError::Index(format!(
                            "input position {position} is out of range for {len} columns"
                        ))
                    })
            }
            other => Err(RuntimeError::Type(format!(
                "args indices must be column names or positions, not '{}'",
                other.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> ArgsCapability {
        ArgsCapability::new([
            ("y".to_string(), vec![4.0, 5.0]),
            ("x".to_string(), vec![1.0, 2.0]),
        ])
    }

    #[test]
    fn test_named_access() {
        let args = args();
        let x = args.get_item(&Value::str("x")).unwrap();
        assert_eq!(x.to_string(), "tensor([1.0, 2.0])");
        assert!(matches!(
            args.get_item(&Value::str("z")),
            Err(RuntimeError::Key(_))
        ));
    }

    #[test]
    fn test_positional_access_uses_sorted_names() {
        let args = args();
        assert_eq!(args.get_item(&Value::Int(0)).unwrap().to_string(), "tensor([1.0, 2.0])");
        assert_eq!(args.get_item(&Value::Int(-1)).unwrap().to_string(), "tensor([4.0, 5.0])");
        assert!(matches!(
            args.get_item(&Value::Int(2)),
            Err(RuntimeError::Index(_))
        ));
    }

    #[test]
    fn test_selection_order() {
        let args = args();
        args.get_item(&Value::str("y")).unwrap();
        args.get_item(&Value::str("x")).unwrap();
        args.get_item(&Value::str("y")).unwrap();
        assert_eq!(args.selected_columns(), vec!["y", "x"]);
    }

    #[test]
    fn test_no_methods() {
        assert!(matches!(
            args().call_method("keys", &[]),
            Err(RuntimeError::Attribute { .. })
        ));
    }
}
