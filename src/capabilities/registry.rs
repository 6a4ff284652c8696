/// Capability registry.
///
/// The single declaration of every receiver untrusted code may reference.
/// The validator reads the allow-list rules from it; the loader builds the
/// namespace from its `Global` entries. Nothing here changes at runtime.
use std::sync::Arc;

use crate::sandbox::interpreter::Value;

use super::torch::Torch;

/// Members permitted on a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowListRule {
    /// Any attribute, method or subscript.
    AllowAll,
    /// Only the listed attributes and methods; no subscripts.
    AllowedMembers(&'static [&'static str]),
}

impl AllowListRule {
    pub fn permits(&self, member: &str) -> bool {
        match self {
            AllowListRule::AllowAll => true,
            AllowListRule::AllowedMembers(members) => members.contains(&member),
        }
    }

    pub fn permits_subscript(&self) -> bool {
        matches!(self, AllowListRule::AllowAll)
    }
}

/// How a registered receiver reaches executed code.
#[derive(Debug, Clone, Copy)]
pub enum Binding {
    /// Positional parameter of the entry function.
    Parameter(usize),
    /// Namespace global, built fresh for every load.
    Global(fn() -> Value),
}

#[derive(Debug)]
pub struct CapabilityDecl {
    pub receiver: &'static str,
    pub rule: AllowListRule,
    pub binding: Binding,
}

pub const TORCH_MEMBERS: &[&str] = &[
    "tensor", "sum", "mean", "sqrt", "abs", "exp", "log", "max", "min", "numel", "no_grad",
];

pub static CAPABILITIES: &[CapabilityDecl] = &[
    CapabilityDecl {
        receiver: "state",
        rule: AllowListRule::AllowAll,
        binding: Binding::Parameter(0),
    },
    CapabilityDecl {
        receiver: "args",
        rule: AllowListRule::AllowAll,
        binding: Binding::Parameter(1),
    },
    CapabilityDecl {
        receiver: "torch",
        rule: AllowListRule::AllowedMembers(TORCH_MEMBERS),
        binding: Binding::Global(torch),
    },
    CapabilityDecl {
        receiver: "State",
        rule: AllowListRule::AllowedMembers(&[]),
        binding: Binding::Global(state_marker),
    },
    CapabilityDecl {
        receiver: "Args",
        rule: AllowListRule::AllowedMembers(&[]),
        binding: Binding::Global(args_marker),
    },
];

fn torch() -> Value {
    Value::Capability(Arc::new(Torch))
}

fn state_marker() -> Value {
    Value::Marker("State")
}

fn args_marker() -> Value {
    Value::Marker("Args")
}

pub fn lookup(receiver: &str) -> Option<&'static CapabilityDecl> {
    CAPABILITIES.iter().find(|decl| decl.receiver == receiver)
}

/// Namespace entries for every `Global` capability.
pub fn global_bindings() -> impl Iterator<Item = (&'static str, Value)> {
    CAPABILITIES.iter().filter_map(|decl| match decl.binding {
        Binding::Global(build) => Some((decl.receiver, build())),
        Binding::Parameter(_) => None,
    })
}

/// Receivers passed to the entry function, in parameter order.
pub fn parameter_receivers() -> Vec<&'static str> {
    let mut parameters: Vec<(usize, &'static str)> = CAPABILITIES
        .iter()
        .filter_map(|decl| match decl.binding {
            Binding::Parameter(position) => Some((position, decl.receiver)),
            Binding::Global(_) => None,
        })
        .collect();
    parameters.sort_unstable();
    parameters.into_iter().map(|(_, receiver)| receiver).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_lookup() {
        assert_eq!(lookup("state").unwrap().rule, AllowListRule::AllowAll);
        assert!(lookup("torch").unwrap().rule.permits("mean"));
        assert!(!lookup("torch").unwrap().rule.permits("load"));
        assert!(lookup("os").is_none());
        assert!(lookup("Torch").is_none());
    }

    #[test]
    fn test_subscripts_only_on_allow_all() {
        assert!(lookup("args").unwrap().rule.permits_subscript());
        assert!(!lookup("torch").unwrap().rule.permits_subscript());
        assert!(!lookup("State").unwrap().rule.permits("anything"));
    }

    #[test]
    fn test_receivers_are_unique() {
        let receivers: HashSet<_> = CAPABILITIES.iter().map(|decl| decl.receiver).collect();
        assert_eq!(receivers.len(), CAPABILITIES.len());
    }

    #[test]
    fn test_parameters_in_order() {
        assert_eq!(parameter_receivers(), vec!["state", "args"]);
    }

    #[test]
    fn test_global_bindings() {
        let globals: Vec<_> = global_bindings().collect();
        let names: Vec<_> = globals.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["torch", "State", "Args"]);
        assert!(matches!(globals[0].1, Value::Capability(_)));
        assert!(matches!(globals[1].1, Value::Marker("State")));
    }
}
