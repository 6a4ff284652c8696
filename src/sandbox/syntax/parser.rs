//! Token parser for the computation grammar.
//!
//! Binary and unary arithmetic go through a Pratt table; comparisons,
//! boolean operators and statements are plain combinators. Constructs the
//! validator refuses are still recognized and reduced to their node kind.
//! Checks that need a whole construct (duplicate parameters, assignment
//! targets) are emitted as errors without stopping the parse.
use std::sync::Arc;

use chumsky::{input::ValueInput, pratt::*, prelude::*};

use super::ast::*;
use super::lexer::Token;
use super::{LineIndex, ParseError, Span};

type Extra<'src> = extra::Err<ParseError<'src, Token>>;

#[derive(Debug, Clone)]
enum Argument {
    Positional(Expr),
    Keyword,
}

#[derive(Debug, Clone)]
enum ParamItem {
    Plain(Param),
    VarArg,
    KwArg,
    /// Bare `*` introducing keyword-only parameters.
    Bare,
}

/// What follows the first item of a bracketed display.
#[derive(Debug, Clone)]
enum Tail {
    Single,
    Items(Vec<Expr>),
    Comprehension,
}

#[derive(Debug, Clone)]
enum Trailer {
    Call(Vec<Argument>),
    Subscript(Expr),
    Attribute(String),
}

#[derive(Debug, Clone)]
enum AssignTail {
    None,
    Augmented,
    Assign(Vec<Expr>),
}

fn node(kind: ExprKind, location: Location) -> Expr {
    Expr { kind, location }
}

fn binary(left: Expr, op: BinOp, right: Expr, location: Location) -> Expr {
    node(
        ExprKind::BinOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        },
        location,
    )
}

fn unary(op: UnaryOp, operand: Expr, location: Location) -> Expr {
    node(
        ExprKind::UnaryOp {
            op,
            operand: Box::new(operand),
        },
        location,
    )
}

fn prepend<T>(first: T, rest: Vec<T>) -> Vec<T> {
    let mut items = Vec::with_capacity(rest.len() + 1);
    items.push(first);
    items.extend(rest);
    items
}

fn apply_trailer(value: Expr, trailer: Trailer) -> Expr {
    let location = value.location;
    let kind = match trailer {
        Trailer::Call(arguments) => {
            let has_keywords = arguments.iter().any(|a| matches!(a, Argument::Keyword));
            let args = arguments
                .into_iter()
                .filter_map(|argument| match argument {
                    Argument::Positional(expr) => Some(expr),
                    Argument::Keyword => None,
                })
                .collect();
            ExprKind::Call {
                func: Box::new(value),
                args,
                has_keywords,
            }
        }
        Trailer::Subscript(index) => ExprKind::Subscript {
            value: Box::new(value),
            index: Box::new(index),
        },
        Trailer::Attribute(attr) => ExprKind::Attribute {
            value: Box::new(value),
            attr,
        },
    };
    node(kind, location)
}

fn check_target(target: &Expr) -> Result<(), String> {
    match &target.kind {
        ExprKind::Name(_)
        | ExprKind::Attribute { .. }
        | ExprKind::Subscript { .. }
        | ExprKind::Starred => Ok(()),
        ExprKind::Tuple(items) | ExprKind::List(items) => items.iter().try_for_each(check_target),
        other => Err(format!("cannot assign to {}", other.name())),
    }
}

fn parameters(items: Vec<ParamItem>) -> Result<Parameters, String> {
    let mut parameters = Parameters::default();
    let mut seen_default = false;
    for item in items {
        if parameters.kwarg {
            return Err("arguments cannot follow var-keyword argument".into());
        }
        match item {
            ParamItem::Plain(param) => {
                if parameters.vararg {
                    return Err("keyword-only parameters are not supported".into());
                }
                if parameters.params.iter().any(|p| p.name == param.name) {
                    return Err(format!(
                        "duplicate argument '{}' in function definition",
                        param.name
                    ));
                }
                if param.default.is_some() {
                    seen_default = true;
                } else if seen_default {
                    return Err("non-default argument follows default argument".into());
                }
                parameters.params.push(param);
            }
            ParamItem::VarArg => parameters.vararg = true,
            ParamItem::KwArg => parameters.kwarg = true,
            ParamItem::Bare => return Err("keyword-only parameters are not supported".into()),
        }
    }
    Ok(parameters)
}

/// `item (',' item)* [',']`; a single item without a comma stays bare.
fn sequence<'src, I, P>(
    item: P,
    lines: &'src LineIndex<'src>,
) -> impl Parser<'src, I, Expr, Extra<'src>> + Clone
where
    I: ValueInput<'src, Token = Token, Span = Span>,
    P: Parser<'src, I, Expr, Extra<'src>> + Clone,
{
    item.separated_by(just(Token::Comma))
        .at_least(1)
        .collect::<Vec<_>>()
        .then(just(Token::Comma).or_not())
        .map_with(move |(mut items, trailing), e| {
            if items.len() == 1 && trailing.is_none() {
                if let Some(single) = items.pop() {
                    return single;
                }
            }
            node(ExprKind::Tuple(items), lines.locate(e.span().start))
        })
}

/// `operand (keyword operand)*` folded into one flat boolean node.
fn boolean<'src, I, P>(
    operand: P,
    keyword: Token,
    op: BoolOp,
) -> impl Parser<'src, I, Expr, Extra<'src>> + Clone
where
    I: ValueInput<'src, Token = Token, Span = Span>,
    P: Parser<'src, I, Expr, Extra<'src>> + Clone,
{
    operand
        .separated_by(just(keyword))
        .at_least(1)
        .collect::<Vec<_>>()
        .map(move |mut values| {
            if values.len() == 1 {
                if let Some(single) = values.pop() {
                    return single;
                }
            }
            let location = values.first().map(|v| v.location).unwrap_or_default();
            node(ExprKind::BoolOp { op, values }, location)
        })
}

/// Reports `message` when `target` cannot be assigned to.
fn assignable<'src, I, P>(target: P) -> impl Parser<'src, I, Expr, Extra<'src>> + Clone
where
    I: ValueInput<'src, Token = Token, Span = Span>,
    P: Parser<'src, I, Expr, Extra<'src>> + Clone,
{
    target.validate(|target, e, emitter| {
        if let Err(message) = check_target(&target) {
            emitter.emit(ParseError::custom(e.span(), message));
        }
        target
    })
}

pub fn parser<'src, I>(lines: &'src LineIndex<'src>) -> impl Parser<'src, I, Module, Extra<'src>>
where
    I: ValueInput<'src, Token = Token, Span = Span>,
{
    let at = move |span: Span| lines.locate(span.start);

    let mut test = Recursive::declare();
    let mut or_test = Recursive::declare();
    let mut bitwise_or = Recursive::declare();
    let mut statement = Recursive::declare();

    let name = select! { Token::Name(name) => name };
    let comma = just(Token::Comma);

    // ── expressions ─────────────────────────────────────

    let starred = just(Token::Star)
        .ignore_then(bitwise_or.clone())
        .map_with(move |_, e| node(ExprKind::Starred, at(e.span())));

    let named_test = name
        .then_ignore(just(Token::ColonAssign))
        .then_ignore(test.clone())
        .map_with(move |_, e| node(ExprKind::NamedExpr, at(e.span())))
        .or(test.clone())
        .boxed();

    let star_or_named = starred.clone().or(named_test.clone());
    let star_or_test = starred.clone().or(test.clone());
    let target_item = starred.clone().or(bitwise_or.clone());
    let target_list = assignable(sequence(target_item.clone(), lines)).boxed();
    let expression_list = sequence(star_or_test, lines).boxed();

    let yield_expr = just(Token::Yield)
        .ignore_then(
            choice((
                just(Token::From).ignore_then(test.clone()),
                expression_list.clone(),
            ))
            .or_not(),
        )
        .map_with(move |_, e| node(ExprKind::Yield, at(e.span())))
        .boxed();

    let comp_for = just(Token::Async)
        .or_not()
        .then(just(Token::For))
        .then(target_list.clone())
        .then(just(Token::In))
        .then(or_test.clone())
        .then(
            just(Token::If)
                .ignore_then(or_test.clone())
                .repeated()
                .collect::<Vec<_>>(),
        )
        .repeated()
        .at_least(1)
        .collect::<Vec<_>>()
        .ignored()
        .boxed();

    let tail = choice((
        comp_for.clone().to(Tail::Comprehension),
        comma
            .clone()
            .ignore_then(
                star_or_named
                    .clone()
                    .separated_by(comma.clone())
                    .allow_trailing()
                    .collect::<Vec<_>>(),
            )
            .map(Tail::Items),
        empty().to(Tail::Single),
    ));
    let display = star_or_named.clone().then(tail).boxed();

    let constant = select! {
        Token::Int(value) => Constant::Int(value),
        Token::Float(value) => Constant::Float(value),
        Token::None => Constant::None,
        Token::True => Constant::Bool(true),
        Token::False => Constant::Bool(false),
    }
    .or(select! { Token::Str(text) => text }
        .repeated()
        .at_least(1)
        .collect::<Vec<_>>()
        .map(|parts| Constant::Str(parts.concat())))
    .map_with(move |constant, e| node(ExprKind::Constant(constant), at(e.span())));

    let parenthesized = choice((
        yield_expr.clone(),
        display.clone().map_with(move |(first, tail), e| match tail {
            Tail::Single => first,
            Tail::Items(rest) => node(ExprKind::Tuple(prepend(first, rest)), at(e.span())),
            Tail::Comprehension => node(
                ExprKind::Comprehension(ComprehensionKind::Generator),
                at(e.span()),
            ),
        }),
        empty().map_with(move |_, e| node(ExprKind::Tuple(Vec::new()), at(e.span()))),
    ))
    .delimited_by(just(Token::ParenOpen), just(Token::ParenClose));

    let list = display
        .clone()
        .or_not()
        .delimited_by(just(Token::BracketOpen), just(Token::BracketClose))
        .map_with(move |display, e| {
            let kind = match display {
                None => ExprKind::List(Vec::new()),
                Some((_, Tail::Comprehension)) => ExprKind::Comprehension(ComprehensionKind::List),
                Some((first, Tail::Single)) => ExprKind::List(vec![first]),
                Some((first, Tail::Items(rest))) => ExprKind::List(prepend(first, rest)),
            };
            node(kind, at(e.span()))
        });

    let dict_entry = test
        .clone()
        .then_ignore(just(Token::Colon))
        .then(test.clone());
    let dict = dict_entry
        .clone()
        .then(choice((
            comp_for.clone().to(None),
            comma
                .clone()
                .ignore_then(
                    dict_entry
                        .separated_by(comma.clone())
                        .allow_trailing()
                        .collect::<Vec<_>>(),
                )
                .map(Some),
            empty().to(Some(Vec::new())),
        )))
        .map(|(first, rest)| match rest {
            None => ExprKind::Comprehension(ComprehensionKind::Dict),
            Some(rest) => ExprKind::Dict(prepend(first, rest)),
        });
    let braced = choice((
        dict,
        display.clone().map(|(_, tail)| match tail {
            Tail::Comprehension => ExprKind::Comprehension(ComprehensionKind::Set),
            Tail::Single | Tail::Items(_) => ExprKind::Set,
        }),
        empty().to(ExprKind::Dict(Vec::new())),
    ))
    .delimited_by(just(Token::BraceOpen), just(Token::BraceClose))
    .map_with(move |kind, e| node(kind, at(e.span())));

    let atom = choice((
        name.map_with(move |name, e| node(ExprKind::Name(name), at(e.span()))),
        constant,
        parenthesized,
        list,
        braced,
    ));

    let argument = choice((
        just(Token::DoubleStar)
            .ignore_then(test.clone())
            .to(Argument::Keyword),
        name.then_ignore(just(Token::Assign))
            .then_ignore(test.clone())
            .to(Argument::Keyword),
        starred.clone().map(Argument::Positional),
        named_test
            .clone()
            .then(comp_for.clone().or_not())
            .map_with(move |(value, generator), e| match generator {
                Some(()) => Argument::Positional(node(
                    ExprKind::Comprehension(ComprehensionKind::Generator),
                    at(e.span()),
                )),
                None => Argument::Positional(value),
            }),
    ));
    let arguments = argument
        .separated_by(comma.clone())
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(just(Token::ParenOpen), just(Token::ParenClose))
        .boxed();

    let slice = test
        .clone()
        .or_not()
        .then_ignore(just(Token::Colon))
        .then(test.clone().or_not())
        .then(just(Token::Colon).ignore_then(test.clone().or_not()).or_not())
        .map_with(move |((lower, upper), step), e| {
            node(
                ExprKind::Slice {
                    lower: lower.map(Box::new),
                    upper: upper.map(Box::new),
                    step: step.flatten().map(Box::new),
                },
                at(e.span()),
            )
        });
    let subscript = sequence(slice.or(named_test.clone()), lines)
        .delimited_by(just(Token::BracketOpen), just(Token::BracketClose));

    let trailer = choice((
        arguments.clone().map(Trailer::Call),
        subscript.map(Trailer::Subscript),
        just(Token::Dot).ignore_then(name).map(Trailer::Attribute),
    ));
    let primary = atom.foldl(trailer.repeated(), apply_trailer).boxed();
    let await_primary = just(Token::Await)
        .ignore_then(primary.clone())
        .map_with(move |_, e| node(ExprKind::Await, at(e.span())))
        .or(primary);

    let arithmetic = await_primary.pratt((
        infix(right(13), just(Token::DoubleStar), move |l, _, r, e| {
            binary(l, BinOp::Pow, r, at(e.span()))
        }),
        prefix(
            12,
            select! {
                Token::Minus => UnaryOp::Neg,
                Token::Plus => UnaryOp::Pos,
                Token::Tilde => UnaryOp::Invert,
            },
            move |op, operand, e| unary(op, operand, at(e.span())),
        ),
        infix(
            left(11),
            select! {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::DoubleSlash => BinOp::FloorDiv,
                Token::Percent => BinOp::Mod,
                Token::At => BinOp::MatMul,
            },
            move |l, op, r, e| binary(l, op, r, at(e.span())),
        ),
        infix(
            left(10),
            select! { Token::Plus => BinOp::Add, Token::Minus => BinOp::Sub },
            move |l, op, r, e| binary(l, op, r, at(e.span())),
        ),
        infix(
            left(9),
            select! { Token::ShiftLeft => BinOp::LShift, Token::ShiftRight => BinOp::RShift },
            move |l, op, r, e| binary(l, op, r, at(e.span())),
        ),
        infix(left(8), just(Token::Ampersand), move |l, _, r, e| {
            binary(l, BinOp::BitAnd, r, at(e.span()))
        }),
        infix(left(7), just(Token::Caret), move |l, _, r, e| {
            binary(l, BinOp::BitXor, r, at(e.span()))
        }),
        infix(left(6), just(Token::Pipe), move |l, _, r, e| {
            binary(l, BinOp::BitOr, r, at(e.span()))
        }),
    ));
    bitwise_or.define(arithmetic);

    let comparison_operator = choice((
        just(Token::Not).then(just(Token::In)).to(CmpOp::NotIn),
        just(Token::Is).then(just(Token::Not)).to(CmpOp::IsNot),
        select! {
            Token::Equal => CmpOp::Eq,
            Token::NotEqual => CmpOp::NotEq,
            Token::Less => CmpOp::Lt,
            Token::LessEqual => CmpOp::LtE,
            Token::Greater => CmpOp::Gt,
            Token::GreaterEqual => CmpOp::GtE,
            Token::In => CmpOp::In,
            Token::Is => CmpOp::Is,
        },
    ));
    let comparison = bitwise_or
        .clone()
        .then(
            comparison_operator
                .then(bitwise_or.clone())
                .repeated()
                .collect::<Vec<_>>(),
        )
        .map(|(left, rest)| {
            if rest.is_empty() {
                return left;
            }
            let location = left.location;
            let (ops, comparators) = rest.into_iter().unzip();
            node(
                ExprKind::Compare {
                    left: Box::new(left),
                    ops,
                    comparators,
                },
                location,
            )
        });

    let not_test = recursive(|not_test| {
        just(Token::Not)
            .ignore_then(not_test)
            .map_with(move |operand, e| unary(UnaryOp::Not, operand, at(e.span())))
            .or(comparison)
    });
    let and_test = boolean(not_test, Token::And, BoolOp::And);
    or_test.define(boolean(and_test, Token::Or, BoolOp::Or));

    let lambda_param = name
        .then(just(Token::Assign).ignore_then(test.clone()).or_not())
        .map(|(name, default)| {
            ParamItem::Plain(Param {
                name,
                annotation: None,
                default,
            })
        });
    let lambda_params = choice((
        just(Token::DoubleStar).ignore_then(name).to(ParamItem::KwArg),
        just(Token::Star).ignore_then(name).to(ParamItem::VarArg),
        just(Token::Star).to(ParamItem::Bare),
        lambda_param,
    ))
    .separated_by(comma.clone())
    .allow_trailing()
    .collect::<Vec<_>>()
    .validate(|items, e, emitter| {
        parameters(items).unwrap_or_else(|message| {
            emitter.emit(ParseError::custom(e.span(), message));
            Parameters::default()
        })
    });
    let lambda = just(Token::Lambda)
        .ignore_then(lambda_params)
        .then_ignore(just(Token::Colon))
        .then(test.clone())
        .map_with(move |(params, body), e| {
            node(
                ExprKind::Lambda(Arc::new(Lambda { params, body })),
                at(e.span()),
            )
        });

    let conditional = or_test
        .clone()
        .then(
            just(Token::If)
                .ignore_then(or_test.clone())
                .then_ignore(just(Token::Else))
                .then(test.clone())
                .or_not(),
        )
        .map(|(body, rest)| match rest {
            None => body,
            Some((test, orelse)) => {
                let location = body.location;
                node(
                    ExprKind::IfExp {
                        test: Box::new(test),
                        body: Box::new(body),
                        orelse: Box::new(orelse),
                    },
                    location,
                )
            }
        });
    test.define(lambda.or(conditional));

    // ── statements ──────────────────────────────────────

    let small = {
        let dotted = name
            .separated_by(just(Token::Dot))
            .at_least(1)
            .collect::<Vec<_>>();
        let alias = just(Token::As).then(name).or_not();
        let import_names = name
            .then(alias.clone())
            .separated_by(comma.clone())
            .at_least(1)
            .allow_trailing()
            .collect::<Vec<_>>();

        let import = just(Token::Import)
            .ignore_then(
                dotted
                    .clone()
                    .then(alias)
                    .separated_by(comma.clone())
                    .at_least(1)
                    .collect::<Vec<_>>(),
            )
            .to(StmtKind::Import);
        let import_from = just(Token::From)
            .ignore_then(just(Token::Dot).repeated().collect::<Vec<_>>())
            .ignore_then(dotted.or_not())
            .ignore_then(just(Token::Import))
            .ignore_then(choice((
                just(Token::Star).to(Vec::new()),
                import_names
                    .clone()
                    .delimited_by(just(Token::ParenOpen), just(Token::ParenClose)),
                import_names,
            )))
            .to(StmtKind::ImportFrom);
        let names = name
            .separated_by(comma.clone())
            .at_least(1)
            .collect::<Vec<_>>();

        let source_value = yield_expr.clone().or(expression_list.clone());
        let expression_statement = source_value
            .clone()
            .then(choice((
                select! { Token::AugAssign(op) => op }
                    .then(source_value.clone())
                    .to(AssignTail::Augmented),
                just(Token::Assign)
                    .ignore_then(source_value)
                    .repeated()
                    .at_least(1)
                    .collect::<Vec<_>>()
                    .map(AssignTail::Assign),
                empty().to(AssignTail::None),
            )))
            .validate(|(first, tail), e, emitter| match tail {
                AssignTail::None => StmtKind::Expr(first),
                AssignTail::Augmented => {
                    if !matches!(
                        first.kind,
                        ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. }
                    ) {
                        emitter.emit(ParseError::custom(
                            e.span(),
                            format!(
                                "'{}' is an illegal expression for augmented assignment",
                                first.kind.name()
                            ),
                        ));
                    }
                    StmtKind::AugAssign
                }
                AssignTail::Assign(mut values) => {
                    let Some(value) = values.pop() else {
                        return StmtKind::Expr(first);
                    };
                    let targets = prepend(first, values);
                    for target in &targets {
                        if let Err(message) = check_target(target) {
                            emitter.emit(ParseError::custom(e.span(), message));
                        }
                    }
                    StmtKind::Assign { targets, value }
                }
            });

        choice((
            just(Token::Pass).to(StmtKind::Pass),
            just(Token::Break).to(StmtKind::Break),
            just(Token::Continue).to(StmtKind::Continue),
            just(Token::Return)
                .ignore_then(expression_list.clone().or_not())
                .map(StmtKind::Return),
            import,
            import_from,
            just(Token::Global).ignore_then(names.clone()).to(StmtKind::Global),
            just(Token::Nonlocal).ignore_then(names).to(StmtKind::Nonlocal),
            just(Token::Del).ignore_then(target_list.clone()).to(StmtKind::Delete),
            just(Token::Raise)
                .ignore_then(
                    test.clone()
                        .then(just(Token::From).ignore_then(test.clone()).or_not())
                        .or_not(),
                )
                .to(StmtKind::Raise),
            just(Token::Assert)
                .ignore_then(test.clone())
                .then(comma.clone().ignore_then(test.clone()).or_not())
                .to(StmtKind::Assert),
            expression_statement,
        ))
        .map_with(move |kind, e| Stmt {
            kind,
            location: at(e.span()),
        })
    };

    let simple_statements = small
        .separated_by(just(Token::Semicolon))
        .at_least(1)
        .allow_trailing()
        .collect::<Vec<_>>()
        .then_ignore(just(Token::Newline))
        .boxed();

    let block = just(Token::Colon)
        .ignore_then(choice((
            simple_statements.clone(),
            just(Token::Newline)
                .ignore_then(just(Token::Indent))
                .ignore_then(
                    statement
                        .clone()
                        .repeated()
                        .at_least(1)
                        .collect::<Vec<Vec<Stmt>>>(),
                )
                .then_ignore(just(Token::Dedent))
                .map(|statements| statements.into_iter().flatten().collect()),
        )))
        .boxed();
    let else_block = just(Token::Else)
        .ignore_then(block.clone())
        .or_not()
        .map(Option::unwrap_or_default);

    let def_param = choice((
        just(Token::DoubleStar).ignore_then(name).to(ParamItem::KwArg),
        just(Token::Star)
            .ignore_then(name)
            .then(just(Token::Colon).ignore_then(test.clone()).or_not())
            .to(ParamItem::VarArg),
        just(Token::Star).to(ParamItem::Bare),
        name.then(just(Token::Colon).ignore_then(test.clone()).or_not())
            .then(just(Token::Assign).ignore_then(test.clone()).or_not())
            .map(|((name, annotation), default)| {
                ParamItem::Plain(Param {
                    name,
                    annotation,
                    default,
                })
            }),
    ));
    let def_params = def_param
        .separated_by(comma.clone())
        .allow_trailing()
        .collect::<Vec<_>>()
        .validate(|items, e, emitter| {
            parameters(items).unwrap_or_else(|message| {
                emitter.emit(ParseError::custom(e.span(), message));
                Parameters::default()
            })
        })
        .delimited_by(just(Token::ParenOpen), just(Token::ParenClose));

    let function_def = just(Token::Def)
        .ignore_then(name)
        .then(def_params)
        .then(just(Token::Arrow).ignore_then(test.clone()).or_not())
        .then(block.clone())
        .map_with(move |(((name, params), returns), body), e| {
            StmtKind::FunctionDef(Arc::new(FunctionDef {
                name,
                params,
                returns,
                body,
                location: at(e.span()),
            }))
        })
        .boxed();

    let class_def = just(Token::Class)
        .ignore_then(name)
        .then(arguments.or_not())
        .then(block.clone())
        .to(StmtKind::ClassDef)
        .boxed();

    let elif = just(Token::Elif)
        .ignore_then(named_test.clone())
        .then(block.clone())
        .map_with(move |(test, body), e| (test, body, at(e.span())));
    let if_stmt = just(Token::If)
        .ignore_then(named_test.clone())
        .then(block.clone())
        .then(elif.repeated().collect::<Vec<_>>())
        .then(else_block.clone())
        .map(|(((test, body), elifs), orelse)| {
            let orelse = elifs.into_iter().rev().fold(orelse, |orelse, (test, body, location)| {
                vec![Stmt {
                    kind: StmtKind::If { test, body, orelse },
                    location,
                }]
            });
            StmtKind::If { test, body, orelse }
        });

    let for_stmt = just(Token::For)
        .ignore_then(target_list.clone())
        .then_ignore(just(Token::In))
        .then(expression_list.clone())
        .then(block.clone())
        .then(else_block.clone())
        .map(|(((target, iter), body), orelse)| StmtKind::For {
            target,
            iter,
            body,
            orelse,
        })
        .boxed();

    let while_stmt = just(Token::While)
        .ignore_then(named_test.clone())
        .then(block.clone())
        .then(else_block.clone())
        .map(|((test, body), orelse)| StmtKind::While { test, body, orelse });

    let with_item = test
        .clone()
        .then(just(Token::As).ignore_then(assignable(target_item)).or_not())
        .map(|(context, target)| WithItem { context, target });
    let with_stmt = just(Token::With)
        .ignore_then(
            with_item
                .separated_by(comma.clone())
                .at_least(1)
                .collect::<Vec<_>>(),
        )
        .then(block.clone())
        .map(|(items, body)| StmtKind::With { items, body })
        .boxed();

    let handler = just(Token::Except)
        .ignore_then(
            test.clone()
                .then(just(Token::As).ignore_then(name).or_not())
                .or_not(),
        )
        .then(block.clone());
    let try_stmt = just(Token::Try)
        .ignore_then(block.clone())
        .ignore_then(handler.repeated().collect::<Vec<_>>())
        .then_ignore(else_block)
        .then(just(Token::Finally).ignore_then(block).or_not())
        .validate(|(handlers, finally), e, emitter| {
            if handlers.is_empty() && finally.is_none() {
                emitter.emit(ParseError::custom(
                    e.span(),
                    "expected 'except' or 'finally' block",
                ));
            }
            StmtKind::Try
        });

    let async_stmt = just(Token::Async)
        .ignore_then(choice((
            function_def.clone(),
            for_stmt.clone(),
            with_stmt.clone(),
        )))
        .validate(|kind, e, emitter| {
            emitter.emit(ParseError::custom(e.span(), "async constructs are not supported"));
            kind
        });

    let decorated = just(Token::At)
        .ignore_then(named_test)
        .then_ignore(just(Token::Newline))
        .repeated()
        .at_least(1)
        .collect::<Vec<_>>()
        .ignore_then(choice((function_def.clone(), class_def.clone())))
        .validate(|kind, e, emitter| {
            emitter.emit(ParseError::custom(e.span(), "decorators are not supported"));
            kind
        });

    let compound = choice((
        function_def,
        if_stmt,
        for_stmt,
        while_stmt,
        with_stmt,
        class_def,
        try_stmt,
        async_stmt,
        decorated,
    ))
    .map_with(move |kind, e| {
        vec![Stmt {
            kind,
            location: at(e.span()),
        }]
    });
    statement.define(compound.or(simple_statements));

    statement
        .repeated()
        .collect::<Vec<Vec<Stmt>>>()
        .then_ignore(end())
        .map(|statements| Module {
            body: statements.into_iter().flatten().collect(),
        })
}

#[cfg(test)]
mod tests {
    use super::super::{parse, MAX_NESTING};
    use super::*;

    fn body(source: &str) -> Vec<Stmt> {
        parse(source).unwrap().body
    }

    fn expression(source: &str) -> Expr {
        match body(source).remove(0).kind {
            StmtKind::Expr(expr) => expr,
            other => panic!("expected expression statement, got {}", other.name()),
        }
    }

    // ── statements ──────────────────────────────────────

    #[test]
    fn test_parse_computation() {
        let source = "\
def computation(state: State, args: Args):
    x = args[\"x\"]
    y = args[\"y\"]
    return state.mean(x), state.mean(y)
";
        let statements = body(source);
        assert_eq!(statements.len(), 1);
        let StmtKind::FunctionDef(def) = &statements[0].kind else {
            panic!("expected a function definition");
        };
        assert_eq!(def.name, "computation");
        assert_eq!(def.params.params.len(), 2);
        assert!(def.params.params[0].annotation.is_some());
        assert_eq!(def.body.len(), 3);
        assert_eq!(def.body[1].location, Location { line: 3, column: 5 });
        assert!(matches!(
            &def.body[2].kind,
            StmtKind::Return(Some(Expr { kind: ExprKind::Tuple(items), .. })) if items.len() == 2
        ));
    }

    #[test]
    fn test_if_elif_else_chain() {
        let statements = body("if a:\n    pass\nelif b:\n    pass\nelse:\n    x = 1\n");
        let StmtKind::If { orelse, .. } = &statements[0].kind else {
            panic!("expected if");
        };
        let StmtKind::If { orelse: inner, .. } = &orelse[0].kind else {
            panic!("expected nested if for elif");
        };
        assert_eq!(orelse[0].location.line, 3);
        assert!(matches!(inner[0].kind, StmtKind::Assign { .. }));
    }

    #[test]
    fn test_semicolons_and_inline_blocks() {
        let statements = body("x = 1; y = 2\nif x: y = 3\n");
        assert_eq!(statements.len(), 3);
    }

    #[test]
    fn test_chained_assignment_and_unpacking() {
        let statements = body("a = b = 1\nx, *rest = items\n");
        assert!(matches!(&statements[0].kind, StmtKind::Assign { targets, .. } if targets.len() == 2));
        let StmtKind::Assign { targets, .. } = &statements[1].kind else {
            panic!("expected assignment");
        };
        assert!(matches!(&targets[0].kind, ExprKind::Tuple(items) if items.len() == 2));
    }

    #[test]
    fn test_for_while_with() {
        let source = "\
for i, v in pairs:
    pass
else:
    pass
while x:
    x = x - 1
with ctx() as c, other():
    pass
";
        let names: Vec<_> = body(source).iter().map(|s| s.kind.name()).collect();
        assert_eq!(names, vec!["For", "While", "With"]);
    }

    #[test]
    fn test_refused_constructs_still_parse() {
        let source = "\
import os.path as p
from . import x
from os import (path, sep,)
class A(object):
    pass
try:
    pass
except ValueError as e:
    pass
finally:
    pass
global g
del g
x += 1
";
        let names: Vec<_> = body(source).iter().map(|s| s.kind.name()).collect();
        assert_eq!(
            names,
            vec!["Import", "ImportFrom", "ImportFrom", "ClassDef", "Try", "Global", "Delete", "AugAssign"]
        );

        assert_eq!(expression("[x for x in y if x]").kind.name(), "ListComp");
        assert_eq!(expression("{k: v for k, v in y}").kind.name(), "DictComp");
        assert_eq!(expression("sum(x for x in y)").kind.name(), "Call");
        assert_eq!(expression("{1, 2}").kind.name(), "Set");
        assert_eq!(expression("(y := 2)").kind.name(), "NamedExpr");
        assert_eq!(expression("await f()").kind.name(), "Await");
        assert_eq!(expression("f(*a)").kind.name(), "Call");
    }

    // ── expressions ─────────────────────────────────────

    #[test]
    fn test_precedence() {
        let expr = expression("1 + 2 * 3 ** 2");
        let ExprKind::BinOp { op: BinOp::Add, right, .. } = expr.kind else {
            panic!("expected addition at the root");
        };
        let ExprKind::BinOp { op: BinOp::Mul, right, .. } = right.kind else {
            panic!("expected multiplication");
        };
        assert!(matches!(right.kind, ExprKind::BinOp { op: BinOp::Pow, .. }));
    }

    #[test]
    fn test_bitwise_ladder_and_associativity() {
        let expr = expression("a | b ^ c & d << 1");
        let ExprKind::BinOp { op: BinOp::BitOr, right, .. } = expr.kind else {
            panic!("expected | at the root");
        };
        assert!(matches!(right.kind, ExprKind::BinOp { op: BinOp::BitXor, .. }));

        let ExprKind::BinOp { left, .. } = expression("a - b - c").kind else {
            panic!("expected subtraction");
        };
        assert!(matches!(left.kind, ExprKind::BinOp { op: BinOp::Sub, .. }));

        let ExprKind::BinOp { right, .. } = expression("2 ** 3 ** 2").kind else {
            panic!("expected power");
        };
        assert!(matches!(right.kind, ExprKind::BinOp { op: BinOp::Pow, .. }));
    }

    #[test]
    fn test_power_binds_tighter_than_unary_minus() {
        let expr = expression("-2 ** 2");
        let ExprKind::UnaryOp { op: UnaryOp::Neg, operand } = expr.kind else {
            panic!("expected negation at the root");
        };
        assert!(matches!(operand.kind, ExprKind::BinOp { op: BinOp::Pow, .. }));

        let ExprKind::BinOp { right, .. } = expression("2 ** -1").kind else {
            panic!("expected power");
        };
        assert!(matches!(right.kind, ExprKind::UnaryOp { op: UnaryOp::Neg, .. }));
    }

    #[test]
    fn test_chained_comparison_and_membership() {
        let expr = expression("a < b <= c not in d is not e");
        let ExprKind::Compare { ops, .. } = expr.kind else {
            panic!("expected comparison");
        };
        assert_eq!(ops, vec![CmpOp::Lt, CmpOp::LtE, CmpOp::NotIn, CmpOp::IsNot]);
    }

    #[test]
    fn test_boolean_operators_flatten() {
        let ExprKind::BoolOp { op: BoolOp::Or, values } = expression("a or b and c or not d").kind
        else {
            panic!("expected or");
        };
        assert_eq!(values.len(), 3);
        assert!(matches!(values[1].kind, ExprKind::BoolOp { op: BoolOp::And, .. }));
        assert!(matches!(values[2].kind, ExprKind::UnaryOp { op: UnaryOp::Not, .. }));
    }

    #[test]
    fn test_slices() {
        let expr = expression("x[1:2, ::3]");
        let ExprKind::Subscript { index, .. } = expr.kind else {
            panic!("expected subscript");
        };
        let ExprKind::Tuple(items) = index.kind else {
            panic!("expected tuple index");
        };
        assert!(matches!(items[0].kind, ExprKind::Slice { lower: Some(_), upper: Some(_), step: None }));
        assert!(matches!(items[1].kind, ExprKind::Slice { lower: None, upper: None, step: Some(_) }));
    }

    #[test]
    fn test_keyword_arguments_are_flagged() {
        let ExprKind::Call { args, has_keywords, .. } = expression("f(1, dim=0)").kind else {
            panic!("expected call");
        };
        assert_eq!(args.len(), 1);
        assert!(has_keywords);
    }

    #[test]
    fn test_trailers_chain_left_to_right() {
        let expr = expression("state.mean(args['x'])[0]");
        let ExprKind::Subscript { value, .. } = expr.kind else {
            panic!("expected subscript");
        };
        assert_eq!(receiver_path(&value), "state.mean()");
    }

    #[test]
    fn test_lambda_and_conditional_expression() {
        let ExprKind::Lambda(lambda) = expression("lambda a, b=1: a if a > b else b").kind else {
            panic!("expected lambda");
        };
        assert_eq!(lambda.params.params.len(), 2);
        assert!(matches!(lambda.body.kind, ExprKind::IfExp { .. }));
    }

    #[test]
    fn test_displays() {
        assert!(matches!(expression("()").kind, ExprKind::Tuple(items) if items.is_empty()));
        assert!(matches!(expression("(1,)").kind, ExprKind::Tuple(items) if items.len() == 1));
        assert!(matches!(expression("(1)").kind, ExprKind::Constant(Constant::Int(1))));
        assert!(matches!(expression("[1, 2,]").kind, ExprKind::List(items) if items.len() == 2));
        assert!(matches!(expression("{}").kind, ExprKind::Dict(items) if items.is_empty()));
        assert!(matches!(expression("{'a': 1}").kind, ExprKind::Dict(items) if items.len() == 1));
        assert!(matches!(
            expression("'a' 'b'").kind,
            ExprKind::Constant(Constant::Str(text)) if text == "ab"
        ));
    }

    // ── errors ──────────────────────────────────────────

    #[test]
    fn test_syntax_errors() {
        assert!(parse("return 1").is_err());
        assert!(parse("  x = 1").is_err());
        assert!(parse("def f(:\n    pass").is_err());
        assert!(parse("x = = 1").is_err());
        assert!(parse("1 = x").is_err());
        assert!(parse("f() += 1").is_err());
        assert!(parse("def f(a, a):\n    pass").is_err());
        assert!(parse("def f():\nreturn 1").is_err());
        assert!(parse("x: int = 1").is_err());
        assert!(parse("@decorator\ndef f():\n    pass").is_err());
        assert!(parse("async def f():\n    pass").is_err());
        assert!(parse("x = ...").is_err());
        assert!(parse("x = {**a}").is_err());
        assert!(parse("try:\n    pass\n").is_err());
    }

    #[test]
    fn test_parameter_errors_are_reported() {
        let err = parse("def f(a=1, b):\n    pass").unwrap_err();
        assert!(err.message.contains("non-default argument"));
        let err = parse("def f(*, a):\n    pass").unwrap_err();
        assert!(err.message.contains("keyword-only"));
        let err = parse("def f(a, a):\n    pass").unwrap_err();
        assert!(err.message.contains("duplicate argument 'a'"));
    }

    #[test]
    fn test_return_outside_function() {
        let err = parse("if x:\n    return 1\n").unwrap_err();
        assert!(err.message.contains("'return' outside function"));
        assert_eq!(err.location.line, 2);
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("x = {}1{}", "(".repeat(MAX_NESTING + 5), ")".repeat(MAX_NESTING + 5));
        let err = parse(&deep).unwrap_err();
        assert!(err.message.contains("nested"));

        let shallow = format!("x = {}1{}", "(".repeat(20), ")".repeat(20));
        assert!(parse(&shallow).is_ok());
    }

    #[test]
    fn test_deep_operator_chains_are_rejected() {
        let long = format!("x = 1{}", " + 1".repeat(400));
        assert!(parse(&long).unwrap_err().message.contains("nested"));
        let moderate = format!("x = 1{}", " + 1".repeat(50));
        assert!(parse(&moderate).is_ok());
    }
}
