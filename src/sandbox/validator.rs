/// Grammar validator.
///
/// Walks the syntax tree in source order and accepts it only if every node
/// is of an allow-listed kind and every attribute, subscript and method
/// call resolves to a capability registry entry that permits it. The first
/// violation ends the walk.
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::capabilities::registry;
use crate::sandbox::syntax::ast::*;
use crate::sandbox::syntax::{self, SyntaxError};

/// Names refused at validation time when `reject_dynamic_eval` is set.
pub const DYNAMIC_EVAL: &[&str] = &["eval", "exec", "compile", "__import__"];

#[derive(Debug, Clone, Default)]
pub struct ValidationPolicy {
    /// Refuse bare calls to dynamic-evaluation names instead of letting
    /// them fail as unbound identifiers at invocation.
    pub reject_dynamic_eval: bool,
}

/// A refused construct.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct PolicyViolation {
    pub reason: String,
    /// Kind and position of the offending node, e.g. `Import at line 1, column 1`.
    pub node: String,
}

/// Why a source was not accepted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("syntax error: {0}")]
    Syntax(#[from] SyntaxError),
    #[error("{0}")]
    Policy(#[from] PolicyViolation),
}

pub type ValidationResult = Result<ValidatedSource, Rejection>;

/// Source text together with its tree, proven to satisfy the policy.
///
/// Only [`validate_source`] constructs it, so holding one means the text
/// was accepted.
#[derive(Debug, Clone)]
pub struct ValidatedSource {
    text: Arc<str>,
    module: Arc<Module>,
}

impl ValidatedSource {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }
}

/// Parses and validates `text`.
pub fn validate_source(text: &str, policy: &ValidationPolicy) -> ValidationResult {
    let module = syntax::parse(text)?;
    match validate(&module, policy) {
        Ok(()) => {
            debug!("Source accepted ({} bytes)", text.len());
            Ok(ValidatedSource {
                text: Arc::from(text),
                module: Arc::new(module),
            })
        }
        Err(violation) => {
            debug!("Source rejected: {} [{}]", violation.reason, violation.node);
            Err(violation.into())
        }
    }
}

/// Checks a parsed module against the allow-list. Deterministic and free of
/// side effects.
pub fn validate(module: &Module, policy: &ValidationPolicy) -> Result<(), PolicyViolation> {
    Validator { policy }.block(&module.body)
}

struct Validator<'p> {
    policy: &'p ValidationPolicy,
}

/// First access applied to the root of a receiver chain.
enum Access<'a> {
    Attr(&'a str),
    Item,
    Call,
}

#[derive(Clone, Copy)]
enum Context {
    Attribute,
    Subscript,
    Call,
}

/// Follows attribute, subscript and call links down to the root name.
fn chain(expr: &Expr) -> Option<(&str, Option<Access<'_>>)> {
    let mut current = expr;
    let mut first = None;
    loop {
        match &current.kind {
            ExprKind::Name(name) => return Some((name, first)),
            ExprKind::Attribute { value, attr } => {
                first = Some(Access::Attr(attr));
                current = value;
            }
            ExprKind::Subscript { value, .. } => {
                first = Some(Access::Item);
                current = value;
            }
            ExprKind::Call { func, .. } => {
                first = Some(Access::Call);
                current = func;
            }
            _ => return None,
        }
    }
}

fn describe(kind: &str, location: Location) -> String {
    format!("{kind} at {location}")
}

impl Validator<'_> {
    fn violation(&self, reason: impl Into<String>, kind: &str, location: Location) -> PolicyViolation {
        PolicyViolation {
            reason: reason.into(),
            node: describe(kind, location),
        }
    }

    fn disallowed(&self, kind: &str, location: Location) -> PolicyViolation {
        self.violation(format!("Disallowed node type: {kind}"), kind, location)
    }

    // ── Statements ───────────────────────────────────────

    fn block(&self, body: &[Stmt]) -> Result<(), PolicyViolation> {
        body.iter().try_for_each(|stmt| self.stmt(stmt))
    }

    fn stmt(&self, stmt: &Stmt) -> Result<(), PolicyViolation> {
        match &stmt.kind {
            StmtKind::Import | StmtKind::ImportFrom => Err(self.violation(
                "Import statements are not allowed.",
                stmt.kind.name(),
                stmt.location,
            )),
            StmtKind::FunctionDef(def) => {
                self.parameters(&def.params, def.location)?;
                self.block(&def.body)?;
                self.optional(def.returns.as_ref())
            }
            StmtKind::Return(value) => self.optional(value.as_ref()),
            StmtKind::Assign { targets, value } => {
                targets.iter().try_for_each(|target| self.expr(target))?;
                self.expr(value)
            }
            StmtKind::Expr(expr) => self.expr(expr),
            StmtKind::If { test, body, orelse } | StmtKind::While { test, body, orelse } => {
                self.expr(test)?;
                self.block(body)?;
                self.block(orelse)
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                self.expr(target)?;
                self.expr(iter)?;
                self.block(body)?;
                self.block(orelse)
            }
            StmtKind::With { items, body } => {
                for item in items {
                    self.expr(&item.context)?;
                    self.optional(item.target.as_ref())?;
                }
                self.block(body)
            }
            StmtKind::Pass => Ok(()),
            StmtKind::AugAssign
            | StmtKind::ClassDef
            | StmtKind::Global
            | StmtKind::Nonlocal
            | StmtKind::Delete
            | StmtKind::Raise
            | StmtKind::Try
            | StmtKind::Assert
            | StmtKind::Break
            | StmtKind::Continue => Err(self.disallowed(stmt.kind.name(), stmt.location)),
        }
    }

    fn parameters(&self, params: &Parameters, location: Location) -> Result<(), PolicyViolation> {
        for param in &params.params {
            self.optional(param.annotation.as_ref())?;
            self.optional(param.default.as_ref())?;
        }
        if params.vararg {
            return Err(self.disallowed("vararg", location));
        }
        if params.kwarg {
            return Err(self.disallowed("kwarg", location));
        }
        Ok(())
    }

    // ── Expressions ──────────────────────────────────────

    fn optional(&self, expr: Option<&Expr>) -> Result<(), PolicyViolation> {
        expr.map_or(Ok(()), |expr| self.expr(expr))
    }

    fn expr(&self, expr: &Expr) -> Result<(), PolicyViolation> {
        match &expr.kind {
            ExprKind::Name(_) | ExprKind::Constant(_) => Ok(()),
            ExprKind::Attribute { value, attr } => {
                self.receiver(expr, expr, Context::Attribute, || {
                    format!(
                        "Disallowed attribute access: '{attr}' on '{}'",
                        receiver_path(value)
                    )
                })?;
                self.expr(value)
            }
            ExprKind::Subscript { value, index } => {
                self.receiver(expr, expr, Context::Subscript, || {
                    format!("Subscript access is not allowed on '{}'", receiver_path(value))
                })?;
                self.expr(value)?;
                self.expr(index)
            }
            ExprKind::Slice { lower, upper, step } => {
                self.optional(lower.as_deref())?;
                self.optional(upper.as_deref())?;
                self.optional(step.as_deref())
            }
            ExprKind::Call {
                func,
                args,
                has_keywords,
            } => {
                if *has_keywords {
                    return Err(self.disallowed("keyword", expr.location));
                }
                self.call(expr, func)?;
                self.expr(func)?;
                args.iter().try_for_each(|arg| self.expr(arg))
            }
            ExprKind::BinOp { left, right, .. } => {
                self.expr(left)?;
                self.expr(right)
            }
            ExprKind::UnaryOp { operand, .. } => self.expr(operand),
            ExprKind::BoolOp { values, .. } => values.iter().try_for_each(|value| self.expr(value)),
            ExprKind::Compare {
                left, comparators, ..
            } => {
                self.expr(left)?;
                comparators.iter().try_for_each(|value| self.expr(value))
            }
            ExprKind::IfExp { test, body, orelse } => {
                self.expr(test)?;
                self.expr(body)?;
                self.expr(orelse)
            }
            ExprKind::Lambda(lambda) => {
                self.parameters(&lambda.params, expr.location)?;
                self.expr(&lambda.body)
            }
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                items.iter().try_for_each(|item| self.expr(item))
            }
            ExprKind::Dict(entries) => entries.iter().try_for_each(|(key, value)| {
                self.expr(key)?;
                self.expr(value)
            }),
            ExprKind::Set
            | ExprKind::Comprehension(_)
            | ExprKind::Starred
            | ExprKind::NamedExpr
            | ExprKind::Yield
            | ExprKind::Await => Err(self.disallowed(expr.kind.name(), expr.location)),
        }
    }

    fn call(&self, node: &Expr, func: &Expr) -> Result<(), PolicyViolation> {
        match &func.kind {
            // Bare names resolve against the namespace at execution time.
            ExprKind::Name(name) => {
                if self.policy.reject_dynamic_eval && DYNAMIC_EVAL.contains(&name.as_str()) {
                    return Err(self.violation(
                        format!("Use of {name}() is not allowed."),
                        node.kind.name(),
                        node.location,
                    ));
                }
                Ok(())
            }
            ExprKind::Attribute { value, attr } => {
                self.receiver(func, node, Context::Call, || {
                    format!(
                        "Disallowed function call: '{attr}' on '{}'",
                        receiver_path(value)
                    )
                })
            }
            ExprKind::Subscript { .. } | ExprKind::Call { .. } => {
                self.receiver(func, node, Context::Call, || {
                    format!("Disallowed function call: '{}'", receiver_path(func))
                })
            }
            other => Err(self.violation(
                format!(
                    "Disallowed function call: {}",
                    describe(other.name(), func.location)
                ),
                node.kind.name(),
                node.location,
            )),
        }
    }

    /// Resolves the receiver chain of `target` and checks its root and the
    /// first member applied to it against the registry.
    fn receiver(
        &self,
        target: &Expr,
        node: &Expr,
        context: Context,
        unregistered: impl FnOnce() -> String,
    ) -> Result<(), PolicyViolation> {
        let reject = |reason: String| Err(self.violation(reason, node.kind.name(), node.location));

        let Some((root, first)) = chain(target) else {
            return reject(unregistered());
        };
        let Some(decl) = registry::lookup(root) else {
            return reject(unregistered());
        };
        match first {
            Some(Access::Attr(member)) if !decl.rule.permits(member) => reject(match context {
                Context::Call => format!("Disallowed function call: '{member}' on '{root}'"),
                Context::Attribute | Context::Subscript => {
                    format!("Disallowed attribute access: '{member}' on '{root}'")
                }
            }),
            Some(Access::Item) if !decl.rule.permits_subscript() => {
                reject(format!("Subscript access is not allowed on '{root}'"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEAN: &str = "\
def computation(state: State, args: Args):
    x = args[\"x\"]
    y = args[\"y\"]
    return state.mean(x), state.mean(y)
";

    fn reason(source: &str) -> String {
        reason_with(source, &ValidationPolicy::default())
    }

    fn reason_with(source: &str, policy: &ValidationPolicy) -> String {
        match validate_source(source, policy) {
            Err(Rejection::Policy(violation)) => violation.reason,
            Err(Rejection::Syntax(err)) => panic!("unexpected syntax error: {err}"),
            Ok(_) => panic!("source was accepted:\n{source}"),
        }
    }

    fn accepted(source: &str) -> bool {
        validate_source(source, &ValidationPolicy::default()).is_ok()
    }

    fn wrap(body: &str) -> String {
        format!("def computation(state, args):\n    {body}\n")
    }

    #[test]
    fn test_accepts_registered_access() {
        let validated = validate_source(MEAN, &ValidationPolicy::default()).unwrap();
        assert_eq!(validated.text(), MEAN);
        assert_eq!(validated.module().body.len(), 1);

        assert!(accepted(&wrap("return torch.tensor([1, 2]).sum()")));
        assert!(accepted(&wrap("return state.where(args[0] > 1, args[0])")));
        assert!(accepted(&wrap("return args['x'][1:3]")));
        assert!(accepted(&wrap(
            "return state.mean(args['x']) * 2 + 1 > 0 and not False"
        )));
        assert!(accepted(
            "def computation(state, args):\n    with torch.no_grad():\n        m = 2 if False else 3\n    return len([m])"
        ));
    }

    #[test]
    fn test_imports() {
        assert_eq!(reason("import os"), "Import statements are not allowed.");
        assert_eq!(reason("from os import path"), "Import statements are not allowed.");
        assert_eq!(
            reason(&wrap("import subprocess")),
            "Import statements are not allowed."
        );
    }

    #[test]
    fn test_disallowed_node_kinds() {
        assert_eq!(reason("class A:\n    pass"), "Disallowed node type: ClassDef");
        assert_eq!(
            reason(&wrap("return [v for v in args['x']]")),
            "Disallowed node type: ListComp"
        );
        assert_eq!(reason(&wrap("return torch.sum(args['x'], dim=0)")), "Disallowed node type: keyword");
        assert_eq!(reason("x = 1\nx += 1"), "Disallowed node type: AugAssign");
        assert_eq!(
            reason("def computation(state, *rest):\n    pass"),
            "Disallowed node type: vararg"
        );
        assert_eq!(reason(&wrap("return {1, 2}")), "Disallowed node type: Set");
        assert_eq!(
            reason("try:\n    pass\nexcept:\n    pass"),
            "Disallowed node type: Try"
        );
    }

    #[test]
    fn test_unregistered_receivers() {
        assert_eq!(
            reason(&wrap("return os.getcwd()")),
            "Disallowed function call: 'getcwd' on 'os'"
        );
        assert_eq!(
            reason(&wrap("return os.path.join('a', 'b')")),
            "Disallowed function call: 'join' on 'os.path'"
        );
        assert_eq!(
            reason(&wrap("p = os.environ")),
            "Disallowed attribute access: 'environ' on 'os'"
        );
        assert_eq!(
            reason(&wrap("x = globals()['x']")),
            "Subscript access is not allowed on 'globals()'"
        );
        assert_eq!(
            reason(&wrap("xs = [1]\n    return xs[0]")),
            "Subscript access is not allowed on 'xs'"
        );
    }

    #[test]
    fn test_registered_receiver_members() {
        assert_eq!(
            reason(&wrap("return torch.load('weights')")),
            "Disallowed function call: 'load' on 'torch'"
        );
        assert_eq!(
            reason(&wrap("return torch.nn")),
            "Disallowed attribute access: 'nn' on 'torch'"
        );
        assert_eq!(
            reason(&wrap("return torch['x']")),
            "Subscript access is not allowed on 'torch'"
        );
        assert_eq!(
            reason("def computation(state: State.x, args):\n    pass"),
            "Disallowed attribute access: 'x' on 'State'"
        );
    }

    #[test]
    fn test_call_on_expression_callee() {
        let reason = reason(&wrap("return (lambda v: v)(1)"));
        assert!(reason.starts_with("Disallowed function call: Lambda"), "{reason}");
    }

    #[test]
    fn test_dynamic_eval() {
        let source = wrap("return eval('1 + 1')");
        assert!(accepted(&source));

        let strict = ValidationPolicy {
            reject_dynamic_eval: true,
        };
        assert_eq!(reason_with(&source, &strict), "Use of eval() is not allowed.");
        assert_eq!(
            reason_with(&wrap("exec('x = 1')"), &strict),
            "Use of exec() is not allowed."
        );
    }

    #[test]
    fn test_first_violation_wins() {
        assert_eq!(
            reason("class A:\n    pass\nimport os"),
            "Disallowed node type: ClassDef"
        );
        assert_eq!(
            reason(&wrap("return os.getcwd() + [v for v in args]")),
            "Disallowed function call: 'getcwd' on 'os'"
        );
    }

    #[test]
    fn test_validation_is_idempotent() {
        let source = wrap("return os.getcwd()");
        let first = validate_source(&source, &ValidationPolicy::default()).unwrap_err();
        let second = validate_source(&source, &ValidationPolicy::default()).unwrap_err();
        assert_eq!(first, second);
    }

    #[test]
    fn test_node_description() {
        let Err(Rejection::Policy(violation)) =
            validate_source("x = 1\nimport os", &ValidationPolicy::default())
        else {
            panic!("expected a policy violation");
        };
        assert_eq!(violation.node, "Import at line 2, column 1");
    }

    #[test]
    fn test_syntax_errors_are_rejections() {
        let err = validate_source("def (", &ValidationPolicy::default()).unwrap_err();
        assert!(matches!(err, Rejection::Syntax(_)));
    }
}
