//! Capability objects: the only host functionality reachable from a
//! submitted computation.
//!
//! `state` and `args` are passed to the entry function, `torch` is bound
//! in the namespace. Which members untrusted code may name is decided by
//! the [`registry`]; the objects here decide what those members do.

pub mod args;
pub mod registry;
pub mod state;
pub mod torch;

use crate::sandbox::interpreter::{RuntimeError, Value};

pub use args::ArgsCapability;
pub use state::{Operation, StateCapability};

/// A host object exposed to the restricted evaluator.
///
/// Implementations must be pure with respect to the host: no I/O, no
/// process access. Interior bookkeeping (traces, selections) is allowed.
pub trait Capability: Send + Sync {
    /// Receiver name as seen by untrusted code.
    fn name(&self) -> &str;

    /// Members callable as `receiver.method(...)`.
    fn methods(&self) -> &[&'static str];

    fn call_method(&self, method: &str, args: &[Value]) -> Result<Value, RuntimeError>;

    /// `receiver[key]`. Not subscriptable unless overridden.
    fn get_item(&self, key: &Value) -> Result<Value, RuntimeError> {
        let _ = key;
        Err(RuntimeError::Type(format!(
            "'{}' object is not subscriptable",
            self.name()
        )))
    }
}

/// Shorthand for a capability-level failure.
pub(crate) fn failure(capability: &str, message: impl Into<String>) -> RuntimeError {
    RuntimeError::Capability {
        capability: capability.to_string(),
        message: message.into(),
    }
}

/// Checks the argument count of a capability method.
pub(crate) fn expect_args(
    capability: &str,
    method: &str,
    args: &[Value],
    count: usize,
) -> Result<(), RuntimeError> {
    if args.len() != count {
        return Err(RuntimeError::Type(format!(
            "{capability}.{method}() takes {count} argument{} ({} given)",
            if count == 1 { "" } else { "s" },
            args.len()
        )));
    }
    Ok(())
}
