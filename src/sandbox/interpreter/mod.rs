//! Tree-walking evaluator for validated computations.
//!
//! This is the only way submitted code ever runs: there is no host
//! reflection and no dynamic evaluation. Every name resolves through the
//! frame chain `locals → captured → module namespace`, and the module
//! namespace starts out holding only capability objects and the safe
//! primitives.

mod builtins;
mod ops;
mod value;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::capabilities::torch;
use crate::sandbox::syntax::ast::{
    BinOp, BoolOp, CmpOp, Constant, Expr, ExprKind, Parameters, Stmt, StmtKind,
};

use builtins::iterate;
use value::{BoundMethod, ClosureBody, Slice};

pub use builtins::BUILTINS;
pub use value::{Closure, Value};

/// Bindings visible to executed code.
pub type Namespace = HashMap<String, Value>;

/// Maximum number of statements and expressions being evaluated at once,
/// counted across calls. Bounds the evaluator's own stack use.
pub const MAX_EVAL_DEPTH: usize = 400;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("name '{name}' is not defined")]
    UnboundIdentifier { name: String },
    #[error("local variable '{name}' referenced before assignment")]
    UnboundLocal { name: String },
    #[error("type error: {0}")]
    Type(String),
    #[error("'{receiver}' object has no attribute '{member}'")]
    Attribute { receiver: String, member: String },
    #[error("index error: {0}")]
    Index(String),
    #[error("key error: {0}")]
    Key(String),
    #[error("value error: {0}")]
    Value(String),
    #[error("division by zero")]
    ZeroDivision,
    #[error("integer overflow")]
    Overflow,
    #[error("maximum call depth of {0} exceeded")]
    RecursionLimit(usize),
    #[error("maximum evaluation depth of {0} exceeded")]
    NestingLimit(usize),
    #[error("evaluation cancelled")]
    Cancelled,
    #[error("{capability}: {message}")]
    Capability { capability: String, message: String },
}

/// Shared stop flag. Once cancelled, every interpreter holding a clone
/// fails at its next statement or expression with
/// [`RuntimeError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

enum Flow {
    Normal,
    Return(Value),
}

struct Frame {
    locals: HashMap<String, Value>,
    /// Names the function body assigns. They never fall through to
    /// captured or module bindings.
    local_names: Arc<HashSet<String>>,
    captured: Arc<HashMap<String, Value>>,
    /// Module-level code binds straight into the namespace.
    module_level: bool,
}

impl Frame {
    fn module() -> Self {
        Self {
            locals: HashMap::new(),
            local_names: Arc::default(),
            captured: Arc::default(),
            module_level: true,
        }
    }
}

pub struct Interpreter {
    namespace: Namespace,
    max_call_depth: usize,
    depth: usize,
    nesting: usize,
    cancellation: Cancellation,
}

impl Interpreter {
    pub fn new(namespace: Namespace, max_call_depth: usize) -> Self {
        Self {
            namespace,
            max_call_depth,
            depth: 0,
            nesting: 0,
            cancellation: Cancellation::new(),
        }
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Runs module-level statements once; `def` binds into the namespace.
    pub fn exec_module(&mut self, body: &[Stmt]) -> Result<(), RuntimeError> {
        let mut frame = Frame::module();
        self.exec_block(&mut frame, body)?;
        Ok(())
    }

    pub fn into_namespace(self) -> Namespace {
        self.namespace
    }

    /// Calls any callable value with positional arguments.
    pub fn call(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, RuntimeError> {
        match callee {
            Value::Function(closure) => self.call_closure(closure, args),
            Value::Builtin(builtin) => (builtin.func)(&args),
            Value::BoundMethod(bound) => match &bound.receiver {
                Value::Capability(capability) => capability.call_method(&bound.method, &args),
                Value::Tensor(values) => torch::tensor_method(values, &bound.method, &args),
                other => Err(RuntimeError::Attribute {
                    receiver: other.type_name().to_string(),
                    member: bound.method.to_string(),
                }),
            },
            other => Err(RuntimeError::Type(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_closure(&mut self, closure: &Arc<Closure>, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let total = closure.params.len();
        let required = total - closure.defaults.len();
        if args.len() > total {
            return Err(RuntimeError::Type(format!(
                "{}() takes {total} positional arguments but {} were given",
                closure.name,
                args.len()
            )));
        }
        if args.len() < required {
            return Err(RuntimeError::Type(format!(
                "{}() missing {} required positional argument(s)",
                closure.name,
                required - args.len()
            )));
        }
        if self.depth >= self.max_call_depth {
            return Err(RuntimeError::RecursionLimit(self.max_call_depth));
        }

        let given = args.len();
        let mut locals: HashMap<String, Value> = closure.params.iter().cloned().zip(args).collect();
        for (index, name) in closure.params.iter().enumerate().skip(given) {
            locals.insert(name.clone(), closure.defaults[index - required].clone());
        }
        let mut frame = Frame {
            locals,
            local_names: closure.local_names.clone(),
            captured: closure.captured.clone(),
            module_level: false,
        };

        self.depth += 1;
        let result = match &closure.body {
            ClosureBody::Function(def) => self
                .exec_block(&mut frame, &def.body)
                .map(|flow| match flow {
                    Flow::Return(value) => value,
                    Flow::Normal => Value::None,
                }),
            ClosureBody::Lambda(lambda) => self.eval(&mut frame, &lambda.body),
        };
        self.depth -= 1;
        result
    }

    /// Accounts for one more statement or expression in progress.
    fn enter(&mut self) -> Result<(), RuntimeError> {
        if self.cancellation.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        if self.nesting >= MAX_EVAL_DEPTH {
            return Err(RuntimeError::NestingLimit(MAX_EVAL_DEPTH));
        }
        self.nesting += 1;
        Ok(())
    }

    // ── Statements ───────────────────────────────────────

    fn exec_block(&mut self, frame: &mut Frame, body: &[Stmt]) -> Result<Flow, RuntimeError> {
        for stmt in body {
            if let Flow::Return(value) = self.exec(frame, stmt)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, frame: &mut Frame, stmt: &Stmt) -> Result<Flow, RuntimeError> {
        self.enter()?;
        let flow = self.exec_kind(frame, stmt);
        self.nesting -= 1;
        flow
    }

    // Arms stay thin so a nested evaluation costs little stack.
    fn exec_kind(&mut self, frame: &mut Frame, stmt: &Stmt) -> Result<Flow, RuntimeError> {
        match &stmt.kind {
            StmtKind::FunctionDef(def) => {
                let local_names = assigned_names(&def.params, &def.body);
                let function = self.closure(
                    frame,
                    &def.name,
                    &def.params,
                    local_names,
                    ClosureBody::Function(def.clone()),
                )?;
                self.bind(frame, &def.name, function);
                Ok(Flow::Normal)
            }
            StmtKind::Return(value) => self.exec_return(frame, value.as_ref()),
            StmtKind::Assign { targets, value } => self.exec_assign(frame, targets, value),
            StmtKind::Expr(expr) => self.eval(frame, expr).map(|_| Flow::Normal),
            StmtKind::If { test, body, orelse } => self.exec_if(frame, test, body, orelse),
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => self.exec_for(frame, target, iter, body, orelse),
            StmtKind::While { test, body, orelse } => self.exec_while(frame, test, body, orelse),
            StmtKind::With { items, body } => {
                for item in items {
                    self.enter_context(frame, &item.context, item.target.as_ref())?;
                }
                self.exec_block(frame, body)
            }
            StmtKind::Pass => Ok(Flow::Normal),
            StmtKind::AugAssign
            | StmtKind::Import
            | StmtKind::ImportFrom
            | StmtKind::ClassDef
            | StmtKind::Global
            | StmtKind::Nonlocal
            | StmtKind::Delete
            | StmtKind::Raise
            | StmtKind::Try
            | StmtKind::Assert
            | StmtKind::Break
            | StmtKind::Continue => Err(RuntimeError::Type(format!(
                "'{}' statements are not supported",
                stmt.kind.name()
            ))),
        }
    }

    fn exec_return(&mut self, frame: &mut Frame, value: Option<&Expr>) -> Result<Flow, RuntimeError> {
        let value = match value {
            Some(expr) => self.eval(frame, expr)?,
            None => Value::None,
        };
        Ok(Flow::Return(value))
    }

    fn exec_assign(&mut self, frame: &mut Frame, targets: &[Expr], value: &Expr) -> Result<Flow, RuntimeError> {
        let value = self.eval(frame, value)?;
        for target in targets {
            self.assign(frame, target, value.clone())?;
        }
        Ok(Flow::Normal)
    }

    fn exec_if(
        &mut self,
        frame: &mut Frame,
        test: &Expr,
        body: &[Stmt],
        orelse: &[Stmt],
    ) -> Result<Flow, RuntimeError> {
        let test = self.eval(frame, test)?;
        let branch = if ops::truthy(&test)? { body } else { orelse };
        self.exec_block(frame, branch)
    }

    fn exec_for(
        &mut self,
        frame: &mut Frame,
        target: &Expr,
        iter: &Expr,
        body: &[Stmt],
        orelse: &[Stmt],
    ) -> Result<Flow, RuntimeError> {
        let iterable = self.eval(frame, iter)?;
        let items: Box<dyn Iterator<Item = Value>> = match iterable {
            Value::Range(range) => Box::new(range.iter().map(Value::Int)),
            other => Box::new(iterate(&other)?.into_iter()),
        };
        for item in items {
            self.assign(frame, target, item)?;
            if let Flow::Return(value) = self.exec_block(frame, body)? {
                return Ok(Flow::Return(value));
            }
        }
        self.exec_block(frame, orelse)
    }

    fn exec_while(
        &mut self,
        frame: &mut Frame,
        test: &Expr,
        body: &[Stmt],
        orelse: &[Stmt],
    ) -> Result<Flow, RuntimeError> {
        loop {
            let test = self.eval(frame, test)?;
            if !ops::truthy(&test)? {
                break;
            }
            if let Flow::Return(value) = self.exec_block(frame, body)? {
                return Ok(Flow::Return(value));
            }
        }
        self.exec_block(frame, orelse)
    }

    fn enter_context(
        &mut self,
        frame: &mut Frame,
        context: &Expr,
        target: Option<&Expr>,
    ) -> Result<(), RuntimeError> {
        let context = self.eval(frame, context)?;
        if !matches!(context, Value::NoGrad) {
            return Err(RuntimeError::Type(format!(
                "'{}' object does not support the context manager protocol",
                context.type_name()
            )));
        }
        match target {
            Some(target) => self.assign(frame, target, context),
            None => Ok(()),
        }
    }

    fn bind(&mut self, frame: &mut Frame, name: &str, value: Value) {
        if frame.module_level {
            self.namespace.insert(name.to_string(), value);
        } else {
            frame.locals.insert(name.to_string(), value);
        }
    }

    fn assign(&mut self, frame: &mut Frame, target: &Expr, value: Value) -> Result<(), RuntimeError> {
        match &target.kind {
            ExprKind::Name(name) => {
                self.bind(frame, name, value);
                Ok(())
            }
            ExprKind::Tuple(targets) | ExprKind::List(targets) => {
                let items = iterate(&value)?;
                if items.len() != targets.len() {
                    return Err(RuntimeError::Value(if items.len() > targets.len() {
                        format!("too many values to unpack (expected {})", targets.len())
                    } else {
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            items.len()
                        )
                    }));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(frame, target, item)?;
                }
                Ok(())
            }
            other => Err(RuntimeError::Type(format!(
                "assignment to {} is not supported",
                other.name()
            ))),
        }
    }

    fn closure(
        &mut self,
        frame: &mut Frame,
        name: &str,
        params: &Parameters,
        local_names: HashSet<String>,
        body: ClosureBody,
    ) -> Result<Value, RuntimeError> {
        let mut defaults = Vec::new();
        for param in &params.params {
            if let Some(default) = &param.default {
                defaults.push(self.eval(frame, default)?);
            }
        }
        let captured = if frame.module_level {
            Arc::default()
        } else {
            let mut snapshot = frame.captured.as_ref().clone();
            snapshot.extend(frame.locals.iter().map(|(k, v)| (k.clone(), v.clone())));
            Arc::new(snapshot)
        };
        Ok(Value::Function(Arc::new(Closure {
            name: Arc::from(name),
            params: params.params.iter().map(|param| param.name.clone()).collect(),
            defaults,
            body,
            local_names: Arc::new(local_names),
            captured,
        })))
    }

    // ── Expressions ──────────────────────────────────────

    fn lookup(&self, frame: &Frame, name: &str) -> Result<Value, RuntimeError> {
        if frame.local_names.contains(name) {
            return frame
                .locals
                .get(name)
                .cloned()
                .ok_or_else(|| RuntimeError::UnboundLocal {
                    name: name.to_string(),
                });
        }
        frame
            .locals
            .get(name)
            .or_else(|| frame.captured.get(name))
            .or_else(|| self.namespace.get(name))
            .cloned()
            .ok_or_else(|| RuntimeError::UnboundIdentifier {
                name: name.to_string(),
            })
    }

    fn eval(&mut self, frame: &mut Frame, expr: &Expr) -> Result<Value, RuntimeError> {
        self.enter()?;
        let value = self.eval_kind(frame, expr);
        self.nesting -= 1;
        value
    }

    // Arms stay thin so a nested evaluation costs little stack.
    fn eval_kind(&mut self, frame: &mut Frame, expr: &Expr) -> Result<Value, RuntimeError> {
        match &expr.kind {
            ExprKind::Name(name) => self.lookup(frame, name),
            ExprKind::Constant(constant) => Ok(constant_value(constant)),
            ExprKind::Attribute { value, attr } => {
                let receiver = self.eval(frame, value)?;
                attribute(receiver, attr)
            }
            ExprKind::Subscript { value, index } => self.eval_subscript(frame, value, index),
            ExprKind::Slice { lower, upper, step } => Ok(Value::Slice(Slice {
                lower: self.slice_bound(frame, lower.as_deref())?,
                upper: self.slice_bound(frame, upper.as_deref())?,
                step: self.slice_bound(frame, step.as_deref())?,
            })),
            ExprKind::Call {
                func,
                args,
                has_keywords,
            } => {
                if *has_keywords {
                    return Err(RuntimeError::Type("keyword arguments are not supported".into()));
                }
                self.eval_call(frame, func, args)
            }
            ExprKind::BinOp { left, op, right } => self.eval_binary(frame, *op, left, right),
            ExprKind::UnaryOp { op, operand } => {
                let operand = self.eval(frame, operand)?;
                ops::unary(*op, &operand)
            }
            ExprKind::BoolOp { op, values } => self.eval_bool(frame, *op, values),
            ExprKind::Compare {
                left,
                ops: operators,
                comparators,
            } => self.eval_compare(frame, left, operators, comparators),
            ExprKind::IfExp { test, body, orelse } => {
                let test = self.eval(frame, test)?;
                let branch = if ops::truthy(&test)? { body } else { orelse };
                self.eval(frame, branch)
            }
            ExprKind::Lambda(lambda) => self.closure(
                frame,
                "<lambda>",
                &lambda.params,
                parameter_names(&lambda.params),
                ClosureBody::Lambda(lambda.clone()),
            ),
            ExprKind::Tuple(items) => Ok(Value::tuple(self.eval_all(frame, items)?)),
            ExprKind::List(items) => Ok(Value::list(self.eval_all(frame, items)?)),
            ExprKind::Dict(pairs) => self.eval_dict(frame, pairs),
            ExprKind::Set
            | ExprKind::Comprehension(_)
            | ExprKind::Starred
            | ExprKind::NamedExpr
            | ExprKind::Yield
            | ExprKind::Await => Err(RuntimeError::Type(format!(
                "'{}' expressions are not supported",
                expr.kind.name()
            ))),
        }
    }

    fn eval_subscript(&mut self, frame: &mut Frame, value: &Expr, index: &Expr) -> Result<Value, RuntimeError> {
        let container = self.eval(frame, value)?;
        let index = self.eval(frame, index)?;
        subscript(&container, &index)
    }

    fn slice_bound(&mut self, frame: &mut Frame, bound: Option<&Expr>) -> Result<Option<i64>, RuntimeError> {
        let Some(expr) = bound else {
            return Ok(None);
        };
        match self.eval(frame, expr)? {
            Value::None => Ok(None),
            Value::Int(value) => Ok(Some(value)),
            Value::Bool(value) => Ok(Some(value as i64)),
            other => Err(RuntimeError::Type(format!(
                "slice indices must be integers or None, not '{}'",
                other.type_name()
            ))),
        }
    }

    fn eval_call(&mut self, frame: &mut Frame, func: &Expr, args: &[Expr]) -> Result<Value, RuntimeError> {
        let callee = self.eval(frame, func)?;
        let args = self.eval_all(frame, args)?;
        self.call(&callee, args)
    }

    fn eval_binary(
        &mut self,
        frame: &mut Frame,
        op: BinOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<Value, RuntimeError> {
        let left = self.eval(frame, left)?;
        let right = self.eval(frame, right)?;
        ops::binary(op, &left, &right)
    }

    fn eval_bool(&mut self, frame: &mut Frame, op: BoolOp, values: &[Expr]) -> Result<Value, RuntimeError> {
        let mut last = Value::None;
        for value in values {
            last = self.eval(frame, value)?;
            let truth = ops::truthy(&last)?;
            match op {
                BoolOp::And if !truth => return Ok(last),
                BoolOp::Or if truth => return Ok(last),
                _ => {}
            }
        }
        Ok(last)
    }

    fn eval_compare(
        &mut self,
        frame: &mut Frame,
        left: &Expr,
        operators: &[CmpOp],
        comparators: &[Expr],
    ) -> Result<Value, RuntimeError> {
        let mut left = self.eval(frame, left)?;
        let mut result = Value::Bool(true);
        for (op, right) in operators.iter().zip(comparators) {
            let right = self.eval(frame, right)?;
            result = ops::compare(*op, &left, &right)?;
            if operators.len() > 1 && !ops::truthy(&result)? {
                return Ok(result);
            }
            left = right;
        }
        Ok(result)
    }

    fn eval_dict(&mut self, frame: &mut Frame, pairs: &[(Expr, Expr)]) -> Result<Value, RuntimeError> {
        let mut entries: Vec<(Value, Value)> = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let key = self.eval(frame, key)?;
            let value = self.eval(frame, value)?;
            match entries.iter_mut().find(|(existing, _)| ops::equals(existing, &key)) {
                Some(entry) => entry.1 = value,
                None => entries.push((key, value)),
            }
        }
        Ok(Value::Dict(Arc::new(entries)))
    }

    fn eval_all(&mut self, frame: &mut Frame, items: &[Expr]) -> Result<Vec<Value>, RuntimeError> {
        items.iter().map(|item| self.eval(frame, item)).collect()
    }
}

fn constant_value(constant: &Constant) -> Value {
    match constant {
        Constant::None => Value::None,
        Constant::Bool(value) => Value::Bool(*value),
        Constant::Int(value) => Value::Int(*value),
        Constant::Float(value) => Value::Float(*value),
        Constant::Str(text) => Value::str(text),
    }
}

fn parameter_names(params: &Parameters) -> HashSet<String> {
    params.params.iter().map(|param| param.name.clone()).collect()
}

/// Parameters plus every name the body binds outside nested functions.
fn assigned_names(params: &Parameters, body: &[Stmt]) -> HashSet<String> {
    let mut names = parameter_names(params);
    collect_assigned(body, &mut names);
    names
}

fn collect_assigned(body: &[Stmt], names: &mut HashSet<String>) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::FunctionDef(def) => {
                names.insert(def.name.clone());
            }
            StmtKind::Assign { targets, .. } => {
                targets.iter().for_each(|target| collect_target(target, names));
            }
            StmtKind::For {
                target,
                body,
                orelse,
                ..
            } => {
                collect_target(target, names);
                collect_assigned(body, names);
                collect_assigned(orelse, names);
            }
            StmtKind::If { body, orelse, .. } | StmtKind::While { body, orelse, .. } => {
                collect_assigned(body, names);
                collect_assigned(orelse, names);
            }
            StmtKind::With { items, body } => {
                items
                    .iter()
                    .filter_map(|item| item.target.as_ref())
                    .for_each(|target| collect_target(target, names));
                collect_assigned(body, names);
            }
            _ => {}
        }
    }
}

fn collect_target(target: &Expr, names: &mut HashSet<String>) {
    match &target.kind {
        ExprKind::Name(name) => {
            names.insert(name.clone());
        }
        ExprKind::Tuple(items) | ExprKind::List(items) => {
            items.iter().for_each(|item| collect_target(item, names));
        }
        _ => {}
    }
}

fn attribute(receiver: Value, attr: &str) -> Result<Value, RuntimeError> {
    let bound = match &receiver {
        Value::Capability(capability) => capability.methods().contains(&attr),
        Value::Tensor(_) => torch::TENSOR_METHODS.contains(&attr),
        _ => false,
    };
    if !bound {
        return Err(RuntimeError::Attribute {
            receiver: receiver.type_name().to_string(),
            member: attr.to_string(),
        });
    }
    Ok(Value::BoundMethod(Arc::new(BoundMethod {
        receiver,
        method: Arc::from(attr),
    })))
}


fn normalize_index(index: i64, len: usize) -> Result<usize, RuntimeError> {
    let resolved = if index < 0 { index + len as i64 } else { index };
    if resolved < 0 || resolved >= len as i64 {
        return Err(RuntimeError::Index(format!(
            "index {index} is out of range for length {len}"
        )));
    }
    Ok(resolved as usize)
}

fn subscript(container: &Value, index: &Value) -> Result<Value, RuntimeError> {
    if let Value::Capability(capability) = container {
        return capability.get_item(index);
    }
    if let Value::Dict(entries) = container {
        return entries
            .iter()
            .find(|(key, _)| ops::equals(key, index))
            .map(|(_, value)| value.clone())
            .ok_or_else(|| RuntimeError::Key(index.repr()));
    }

    if let Value::Slice(slice) = index {
        return match container {
            Value::Tuple(items) | Value::List(items) => {
                let picked = slice.indices(items.len())?.into_iter().map(|i| items[i].clone()).collect();
                Ok(if matches!(container, Value::Tuple(_)) {
                    Value::tuple(picked)
                } else {
                    Value::list(picked)
                })
            }
            Value::Str(text) => {
                let chars: Vec<char> = text.chars().collect();
                let picked: String = slice.indices(chars.len())?.into_iter().map(|i| chars[i]).collect();
                Ok(Value::str(&picked))
            }
            Value::Tensor(values) => Ok(Value::tensor(
                slice.indices(values.len())?.into_iter().map(|i| values[i]).collect(),
            )),
            other => Err(not_subscriptable(other)),
        };
    }

    let position = match index.as_number() {
        Some(value::Number::Int(position)) => position,
        _ => {
            return Err(RuntimeError::Type(format!(
                "{} indices must be integers or slices, not {}",
                container.type_name(),
                index.type_name()
            )))
        }
    };
    match container {
        Value::Tuple(items) | Value::List(items) => {
            Ok(items[normalize_index(position, items.len())?].clone())
        }
        Value::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            let c = chars[normalize_index(position, chars.len())?];
            Ok(Value::str(c.encode_utf8(&mut [0; 4])))
        }
        Value::Tensor(values) => Ok(Value::Float(values[normalize_index(position, values.len())?])),
        Value::Range(range) => Ok(Value::Int(range.get(normalize_index(position, range.len())?))),
        other => Err(not_subscriptable(other)),
    }
}

fn not_subscriptable(value: &Value) -> RuntimeError {
    RuntimeError::Type(format!("'{}' object is not subscriptable", value.type_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::syntax::parse;

    fn base_namespace() -> Namespace {
        BUILTINS
            .iter()
            .map(|builtin| (builtin.name.to_string(), Value::Builtin(*builtin)))
            .collect()
    }

    fn run_with(namespace: Namespace, source: &str, depth: usize) -> Result<Namespace, RuntimeError> {
        let module = parse(source).unwrap();
        let mut interpreter = Interpreter::new(namespace, depth);
        interpreter.exec_module(&module.body)?;
        Ok(interpreter.into_namespace())
    }

    fn result_of(source: &str) -> Result<Value, RuntimeError> {
        let namespace = run_with(base_namespace(), source, 64)?;
        Ok(namespace.get("result").cloned().unwrap_or(Value::None))
    }

    fn int_result(source: &str) -> i64 {
        match result_of(source).unwrap() {
            Value::Int(value) => value,
            other => panic!("expected int, got {other:?}"),
        }
    }

    // ── Functions and scoping ────────────────────────────

    #[test]
    fn test_function_with_default() {
        assert_eq!(int_result("def f(a, b=2):\n    return a * b\nresult = f(3)"), 6);
        assert_eq!(int_result("def f(a, b=2):\n    return a * b\nresult = f(3, 3)"), 9);
    }

    #[test]
    fn test_closure_captures_enclosing_locals() {
        let source = "\
def outer(n):
    def inner(x):
        return x + n
    return inner
result = outer(10)(5)
";
        assert_eq!(int_result(source), 15);
    }

    #[test]
    fn test_module_functions_see_each_other() {
        let source = "\
def fact(n):
    if n <= 1:
        return 1
    return n * fact(n - 1)
result = fact(10)
";
        assert_eq!(int_result(source), 3_628_800);
    }

    #[test]
    fn test_recursion_limit() {
        let source = "def f(n):\n    return f(n + 1)\nresult = f(0)";
        let namespace = base_namespace();
        let err = run_with(namespace, source, 16).unwrap_err();
        assert_eq!(err, RuntimeError::RecursionLimit(16));
    }

    #[test]
    fn test_unknown_name_is_unbound() {
        let err = result_of("result = eval('1 + 1')").unwrap_err();
        assert_eq!(
            err,
            RuntimeError::UnboundIdentifier {
                name: "eval".into()
            }
        );
    }

    #[test]
    fn test_wrong_arity() {
        let err = result_of("def f(a):\n    return a\nresult = f(1, 2)").unwrap_err();
        assert!(matches!(err, RuntimeError::Type(message) if message.contains("takes 1")));
        let err = result_of("def f(a):\n    return a\nresult = f()").unwrap_err();
        assert!(matches!(err, RuntimeError::Type(message) if message.contains("missing")));
    }

    #[test]
    fn test_assigned_name_is_local() {
        let source = "\
offset = 1
def bump():
    offset = offset + 1
    return offset
result = bump()
";
        assert_eq!(
            result_of(source).unwrap_err(),
            RuntimeError::UnboundLocal {
                name: "offset".into()
            }
        );
    }

    #[test]
    fn test_read_only_name_falls_through_to_module() {
        let source = "\
offset = 1
def bump():
    total = offset + 1
    return total
result = bump() + bump()
";
        assert_eq!(int_result(source), 4);
    }

    #[test]
    fn test_local_assigned_in_branch_not_taken() {
        let source = "\
x = 5
def f(flag):
    if flag:
        x = 1
    return x
result = f(False)
";
        assert!(matches!(
            result_of(source).unwrap_err(),
            RuntimeError::UnboundLocal { name } if name == "x"
        ));
    }

    #[test]
    fn test_loop_and_unpack_targets_are_local() {
        let source = "\
i = 100
def f(xs):
    total = 0
    for i in xs:
        total = total + i
    a, b = total, i
    return a + b
result = f([1, 2, 3])
";
        assert_eq!(int_result(source), 9);
    }

    #[test]
    fn test_lambda() {
        assert_eq!(int_result("double = lambda x: x * 2\nresult = double(4)"), 8);
    }

    // ── Limits ───────────────────────────────────────────

    #[test]
    fn test_nested_operators_inside_recursion() {
        let operand = format!("{}f(n - 1)", "-".repeat(45));
        let source = format!(
            "def f(n):\n    if n == 0:\n        return 0\n    return {operand}\nresult = f(60)"
        );
        let err = run_with(base_namespace(), &source, 64).unwrap_err();
        assert_eq!(err, RuntimeError::NestingLimit(MAX_EVAL_DEPTH));
    }

    #[test]
    fn test_evaluation_depth_resets_after_error() {
        let source = format!(
            "def f(n):\n    if n == 0:\n        return 0\n    return {}f(n - 1)\n",
            "-".repeat(45)
        );
        let module = parse(&source).unwrap();
        let mut interpreter = Interpreter::new(base_namespace(), 64);
        interpreter.exec_module(&module.body).unwrap();
        let f = interpreter.namespace.get("f").cloned().unwrap();
        assert!(interpreter.call(&f, vec![Value::Int(60)]).is_err());
        assert!(matches!(interpreter.call(&f, vec![Value::Int(2)]), Ok(Value::Int(0))));
    }

    #[test]
    fn test_cancelled_loop_stops() {
        let module = parse("while True:\n    pass").unwrap();
        let cancellation = Cancellation::new();
        let mut interpreter = Interpreter::new(base_namespace(), 8).with_cancellation(cancellation.clone());
        cancellation.cancel();
        assert_eq!(interpreter.exec_module(&module.body), Err(RuntimeError::Cancelled));
    }

    #[test]
    fn test_cancellation_from_another_thread() {
        let module = parse("n = 0\nwhile True:\n    n = n + 1").unwrap();
        let cancellation = Cancellation::new();
        let worker = {
            let cancellation = cancellation.clone();
            std::thread::spawn(move || {
                let mut interpreter = Interpreter::new(base_namespace(), 8).with_cancellation(cancellation);
                interpreter.exec_module(&module.body)
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        cancellation.cancel();
        assert_eq!(worker.join().unwrap(), Err(RuntimeError::Cancelled));
    }

    // ── Control flow ─────────────────────────────────────

    #[test]
    fn test_loops() {
        let source = "\
total = 0
for i in range(5):
    total = total + i
n = 0
while n < 3:
    n = n + 1
result = total * 10 + n
";
        assert_eq!(int_result(source), 103);
    }

    #[test]
    fn test_return_from_inside_loop() {
        let source = "\
def first_even(xs):
    for x in xs:
        if x % 2 == 0:
            return x
    return -1
result = first_even([3, 5, 6, 8])
";
        assert_eq!(int_result(source), 6);
    }

    #[test]
    fn test_with_requires_context_object() {
        let err = result_of("with 1:\n    pass").unwrap_err();
        assert!(matches!(err, RuntimeError::Type(_)));

        let mut namespace = base_namespace();
        namespace.insert("ctx".into(), Value::NoGrad);
        let namespace = run_with(namespace, "with ctx as c:\n    result = 1", 8).unwrap();
        assert!(matches!(namespace.get("result"), Some(Value::Int(1))));
        assert!(matches!(namespace.get("c"), Some(Value::NoGrad)));
    }

    // ── Expressions ──────────────────────────────────────

    #[test]
    fn test_unpacking() {
        assert_eq!(int_result("a, b = 1, 2\nresult = a - b"), -1);
        let err = result_of("a, b = 1, 2, 3").unwrap_err();
        assert!(matches!(err, RuntimeError::Value(_)));
    }

    #[test]
    fn test_boolean_operators_return_operands() {
        assert_eq!(result_of("result = 0 or 'x'").unwrap().to_string(), "x");
        assert!(matches!(result_of("result = 1 and 0").unwrap(), Value::Int(0)));
    }

    #[test]
    fn test_chained_comparison() {
        assert!(matches!(result_of("result = 1 < 2 < 3").unwrap(), Value::Bool(true)));
        assert!(matches!(result_of("result = 1 < 3 < 2").unwrap(), Value::Bool(false)));
    }

    #[test]
    fn test_indexing_and_slicing() {
        assert_eq!(int_result("xs = [1, 2, 3, 4]\nresult = xs[-1] + xs[1:3][0]"), 6);
        assert_eq!(result_of("result = 'hello'[::-1]").unwrap().to_string(), "olleh");
        let err = result_of("result = [1][3]").unwrap_err();
        assert!(matches!(err, RuntimeError::Index(_)));
    }

    #[test]
    fn test_dict_literal() {
        assert_eq!(int_result("d = {'a': 1, 'a': 2}\nresult = d['a']"), 2);
        let err = result_of("result = {'a': 1}['b']").unwrap_err();
        assert!(matches!(err, RuntimeError::Key(_)));
    }

    #[test]
    fn test_attribute_on_plain_value() {
        let err = result_of("result = (1).real").unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Attribute {
                receiver: "int".into(),
                member: "real".into()
            }
        );
    }

    #[test]
    fn test_tensor_methods() {
        let mut namespace = base_namespace();
        namespace.insert("t".into(), Value::tensor(vec![1.0, 2.0, 3.0]));
        let namespace = run_with(namespace, "result = t.sum() + t[0]", 8).unwrap();
        assert!(matches!(namespace.get("result"), Some(Value::Float(x)) if *x == 7.0));
    }
}
