//! Front end for submitted computations: tokenizer, parser and the
//! closed syntax tree the validator and the evaluator work on.

pub mod ast;
mod lexer;
mod parser;

use std::fmt;
use std::iter;

use chumsky::error::RichReason;
use chumsky::prelude::*;
use thiserror::Error;

use ast::{Expr, ExprKind, Stmt, StmtKind};
pub use ast::{Location, Module};

/// Maximum nesting of brackets and blocks, and of consecutive unary
/// operators, accepted by the tokenizer.
pub const MAX_NESTING: usize = 100;

/// Maximum depth of a parsed tree. Every later pass over the tree recurses,
/// so deeper input is refused here.
pub const MAX_DEPTH: usize = 200;

pub(crate) type Span = SimpleSpan;
pub(crate) type ParseError<'src, T> = Rich<'src, T, Span>;
pub(crate) type Spanned<T> = (T, Span);

/// Source text does not parse.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} ({location})")]
pub struct SyntaxError {
    pub message: String,
    pub location: Location,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, location: Location) -> Self {
        Self {
            message: message.into(),
            location,
        }
    }

    fn from_rich<T: fmt::Display>(error: &ParseError<'_, T>, lines: &LineIndex<'_>) -> Self {
        let message = match error.reason() {
            RichReason::Custom(message) => message.clone(),
            _ => match error.found() {
                Some(found) => format!("invalid syntax: unexpected {found}"),
                None => "invalid syntax: unexpected end of input".to_string(),
            },
        };
        Self::new(message, lines.locate(error.span().start))
    }
}

/// Maps byte offsets of the source to 1-based lines and columns.
pub(crate) struct LineIndex<'src> {
    source: &'src str,
    starts: Vec<usize>,
}

impl<'src> LineIndex<'src> {
    pub fn new(source: &'src str) -> Self {
        let starts = iter::once(0)
            .chain(source.match_indices('\n').map(|(offset, _)| offset + 1))
            .collect();
        Self { source, starts }
    }

    fn line_of(&self, offset: usize) -> (usize, usize) {
        let line = self.starts.partition_point(|&start| start <= offset).saturating_sub(1);
        (line, self.starts.get(line).copied().unwrap_or(0))
    }

    pub fn locate(&self, offset: usize) -> Location {
        let (line, start) = self.line_of(offset);
        let column = self
            .source
            .get(start..offset)
            .map_or(0, |text| text.chars().count());
        Location {
            line: line + 1,
            column: column + 1,
        }
    }

    /// Indentation width of the line holding `offset`, up to `offset`.
    pub fn indentation(&self, offset: usize) -> usize {
        let (_, start) = self.line_of(offset);
        let prefix = self.source.get(start..offset).unwrap_or("");
        prefix.chars().fold(0, |width, c| match c {
            '\t' => (width / 8 + 1) * 8,
            '\x0c' => 0,
            _ => width + 1,
        })
    }

    pub fn end(&self) -> usize {
        self.source.len()
    }
}

/// Parses `source` into a module.
pub fn parse(source: &str) -> Result<Module, SyntaxError> {
    let lines = LineIndex::new(source);
    let tokens = lexer::tokenize(source, &lines)?;
    let end = Span::from(source.len()..source.len());
    let (module, errors) = parser::parser(&lines)
        .parse(tokens.as_slice().map(end, |(token, span)| (token, span)))
        .into_output_errors();
    if let Some(error) = errors.first() {
        return Err(SyntaxError::from_rich(error, &lines));
    }
    let module = module
        .ok_or_else(|| SyntaxError::new("invalid syntax", lines.locate(source.len())))?;
    check_block(&module.body, 0, false)?;
    Ok(module)
}

// ── tree checks ─────────────────────────────────────────

fn too_deep(location: Location) -> SyntaxError {
    SyntaxError::new("too many nested blocks or expressions", location)
}

fn check_block(body: &[Stmt], depth: usize, in_function: bool) -> Result<(), SyntaxError> {
    body.iter()
        .try_for_each(|stmt| check_stmt(stmt, depth, in_function))
}

fn check_stmt(stmt: &Stmt, depth: usize, in_function: bool) -> Result<(), SyntaxError> {
    if depth > MAX_DEPTH {
        return Err(too_deep(stmt.location));
    }
    let next = depth + 1;
    match &stmt.kind {
        StmtKind::FunctionDef(def) => {
            for param in &def.params.params {
                check_all(param.annotation.iter().chain(&param.default), next)?;
            }
            check_all(def.returns.iter(), next)?;
            check_block(&def.body, next, true)
        }
        StmtKind::Return(value) => {
            if !in_function {
                return Err(SyntaxError::new("'return' outside function", stmt.location));
            }
            check_all(value.iter(), next)
        }
        StmtKind::Assign { targets, value } => {
            check_all(targets.iter().chain(iter::once(value)), next)
        }
        StmtKind::Expr(value) => check_expr(value, next),
        StmtKind::If { test, body, orelse } | StmtKind::While { test, body, orelse } => {
            check_expr(test, next)?;
            check_block(body, next, in_function)?;
            check_block(orelse, next, in_function)
        }
        StmtKind::For {
            target,
            iter,
            body,
            orelse,
        } => {
            check_expr(target, next)?;
            check_expr(iter, next)?;
            check_block(body, next, in_function)?;
            check_block(orelse, next, in_function)
        }
        StmtKind::With { items, body } => {
            for item in items {
                check_all(iter::once(&item.context).chain(&item.target), next)?;
            }
            check_block(body, next, in_function)
        }
        StmtKind::Pass
        | StmtKind::AugAssign
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
        | StmtKind::Continue => Ok(()),
    }
}

fn check_all<'a>(
    exprs: impl IntoIterator<Item = &'a Expr>,
    depth: usize,
) -> Result<(), SyntaxError> {
    exprs.into_iter().try_for_each(|expr| check_expr(expr, depth))
}

fn check_expr(expr: &Expr, depth: usize) -> Result<(), SyntaxError> {
    if depth > MAX_DEPTH {
        return Err(too_deep(expr.location));
    }
    let next = depth + 1;
    match &expr.kind {
        ExprKind::Attribute { value, .. } => check_expr(value, next),
        ExprKind::Subscript { value, index } => check_all([&**value, &**index].into_iter(), next),
        ExprKind::Slice { lower, upper, step } => {
            check_all(lower.iter().chain(upper).chain(step).map(|e| &**e), next)
        }
        ExprKind::Call { func, args, .. } => check_all(iter::once(&**func).chain(args), next),
        ExprKind::BinOp { left, right, .. } => check_all([&**left, &**right].into_iter(), next),
        ExprKind::UnaryOp { operand, .. } => check_expr(operand, next),
        ExprKind::BoolOp { values, .. } => check_all(values.iter(), next),
        ExprKind::Compare {
            left, comparators, ..
        } => check_all(iter::once(&**left).chain(comparators), next),
        ExprKind::IfExp { test, body, orelse } => {
            check_all([&**test, &**body, &**orelse].into_iter(), next)
        }
        ExprKind::Lambda(lambda) => check_all(
            lambda
                .params
                .params
                .iter()
                .filter_map(|param| param.default.as_ref())
                .chain(iter::once(&lambda.body)),
            next,
        ),
        ExprKind::Tuple(items) | ExprKind::List(items) => check_all(items.iter(), next),
        ExprKind::Dict(entries) => check_all(entries.iter().flat_map(|(k, v)| [k, v]), next),
        ExprKind::Name(_)
        | ExprKind::Constant(_)
        | ExprKind::Set
        | ExprKind::Comprehension(_)
        | ExprKind::Starred
        | ExprKind::NamedExpr
        | ExprKind::Yield
        | ExprKind::Await => Ok(()),
    }
}
