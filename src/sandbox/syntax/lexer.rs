//! Tokens of the computation grammar.
//!
//! Characters are scanned by a chumsky lexer. A second pass over the
//! token stream ([`layout`]) applies the off-side rule: it drops newlines
//! inside brackets and blank lines, and turns changes of indentation into
//! `Indent`/`Dedent` tokens.
use std::fmt;

use chumsky::prelude::*;

use super::ast::BinOp;
use super::{LineIndex, ParseError, Span, Spanned, SyntaxError, MAX_NESTING};

type LexExtra<'src> = extra::Err<ParseError<'src, char>>;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Newline,
    Indent,
    Dedent,

    Def,
    Return,
    If,
    Elif,
    Else,
    For,
    In,
    While,
    With,
    As,
    Pass,
    Lambda,
    And,
    Or,
    Not,
    Is,
    None,
    True,
    False,
    Import,
    From,
    Class,
    Global,
    Nonlocal,
    Del,
    Raise,
    Try,
    Except,
    Finally,
    Assert,
    Break,
    Continue,
    Yield,
    Await,
    Async,

    ParenOpen,
    ParenClose,
    BracketOpen,
    BracketClose,
    BraceOpen,
    BraceClose,

    Comma,
    Colon,
    Semicolon,
    Dot,
    Arrow,
    Assign,
    ColonAssign,
    AugAssign(BinOp),
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    At,
    Ampersand,
    Pipe,
    Caret,
    Tilde,
    ShiftLeft,
    ShiftRight,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl Token {
    fn keyword(word: &str) -> Option<Token> {
        let token = match word {
            "def" => Token::Def,
            "return" => Token::Return,
            "if" => Token::If,
            "elif" => Token::Elif,
            "else" => Token::Else,
            "for" => Token::For,
            "in" => Token::In,
            "while" => Token::While,
            "with" => Token::With,
            "as" => Token::As,
            "pass" => Token::Pass,
            "lambda" => Token::Lambda,
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "is" => Token::Is,
            "None" => Token::None,
            "True" => Token::True,
            "False" => Token::False,
            "import" => Token::Import,
            "from" => Token::From,
            "class" => Token::Class,
            "global" => Token::Global,
            "nonlocal" => Token::Nonlocal,
            "del" => Token::Del,
            "raise" => Token::Raise,
            "try" => Token::Try,
            "except" => Token::Except,
            "finally" => Token::Finally,
            "assert" => Token::Assert,
            "break" => Token::Break,
            "continue" => Token::Continue,
            "yield" => Token::Yield,
            "await" => Token::Await,
            "async" => Token::Async,
            _ => return None,
        };
        Some(token)
    }

    /// Source text of a fixed token; empty for names, literals and layout.
    fn symbol(&self) -> &'static str {
        match self {
            Token::Name(_)
            | Token::Int(_)
            | Token::Float(_)
            | Token::Str(_)
            | Token::Newline
            | Token::Indent
            | Token::Dedent
            | Token::AugAssign(_) => "",
            Token::Def => "def",
            Token::Return => "return",
            Token::If => "if",
            Token::Elif => "elif",
            Token::Else => "else",
            Token::For => "for",
            Token::In => "in",
            Token::While => "while",
            Token::With => "with",
            Token::As => "as",
            Token::Pass => "pass",
            Token::Lambda => "lambda",
            Token::And => "and",
            Token::Or => "or",
            Token::Not => "not",
            Token::Is => "is",
            Token::None => "None",
            Token::True => "True",
            Token::False => "False",
            Token::Import => "import",
            Token::From => "from",
            Token::Class => "class",
            Token::Global => "global",
            Token::Nonlocal => "nonlocal",
            Token::Del => "del",
            Token::Raise => "raise",
            Token::Try => "try",
            Token::Except => "except",
            Token::Finally => "finally",
            Token::Assert => "assert",
            Token::Break => "break",
            Token::Continue => "continue",
            Token::Yield => "yield",
            Token::Await => "await",
            Token::Async => "async",
            Token::ParenOpen => "(",
            Token::ParenClose => ")",
            Token::BracketOpen => "[",
            Token::BracketClose => "]",
            Token::BraceOpen => "{",
            Token::BraceClose => "}",
            Token::Comma => ",",
            Token::Colon => ":",
            Token::Semicolon => ";",
            Token::Dot => ".",
            Token::Arrow => "->",
            Token::Assign => "=",
            Token::ColonAssign => ":=",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::DoubleStar => "**",
            Token::Slash => "/",
            Token::DoubleSlash => "//",
            Token::Percent => "%",
            Token::At => "@",
            Token::Ampersand => "&",
            Token::Pipe => "|",
            Token::Caret => "^",
            Token::Tilde => "~",
            Token::ShiftLeft => "<<",
            Token::ShiftRight => ">>",
            Token::Equal => "==",
            Token::NotEqual => "!=",
            Token::Less => "<",
            Token::LessEqual => "<=",
            Token::Greater => ">",
            Token::GreaterEqual => ">=",
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Name(name) => write!(f, "name '{name}'"),
            Token::Int(value) => write!(f, "number {value}"),
            Token::Float(value) => write!(f, "number {value}"),
            Token::Str(_) => f.write_str("string literal"),
            Token::Newline => f.write_str("end of line"),
            Token::Indent => f.write_str("indent"),
            Token::Dedent => f.write_str("dedent"),
            Token::AugAssign(op) => write!(f, "'{}='", op.symbol()),
            other => write!(f, "'{}'", other.symbol()),
        }
    }
}

/// Character-level lexer. Newlines are kept as tokens; indentation is
/// left to [`layout`].
pub fn lexer<'src>() -> impl Parser<'src, &'src str, Vec<Spanned<Token>>, LexExtra<'src>> {
    let digits = any()
        .filter(char::is_ascii_digit)
        .then(any().filter(|c: &char| c.is_ascii_digit() || *c == '_').repeated());
    let exponent = one_of("eE").then(one_of("+-").or_not()).then(digits.clone());

    let decimal = choice((
        digits
            .clone()
            .then(just('.').then(digits.clone().or_not()).or_not())
            .then(exponent.clone().or_not())
            .to_slice(),
        just('.').then(digits.clone()).then(exponent.or_not()).to_slice(),
    ))
    .try_map(|literal: &str, span| {
        decimal_literal(literal)
            .ok_or_else(|| ParseError::custom(span, format!("invalid number literal '{literal}'")))
    });

    let radix = just('0')
        .ignore_then(one_of("xXoObB"))
        .then(
            any()
                .filter(|c: &char| c.is_ascii_alphanumeric() || *c == '_')
                .repeated()
                .at_least(1)
                .to_slice(),
        )
        .try_map(|(marker, digits): (char, &str), span| {
            let radix = match marker.to_ascii_lowercase() {
                'x' => 16,
                'o' => 8,
                _ => 2,
            };
            i64::from_str_radix(&digits.replace('_', ""), radix)
                .map(Token::Int)
                .map_err(|_| ParseError::custom(span, format!("invalid number literal '0{marker}{digits}'")))
        });

    let string = choice((
        one_of("rR").ignore_then(quoted(true)),
        one_of("uU").or_not().ignore_then(quoted(false)),
    ))
    .map(Token::Str);

    // f-strings and bytes are scanned so the rest of the line still lexes.
    let unsupported_string = choice((
        one_of("fFbB").then(one_of("rR").or_not()).to_slice(),
        one_of("rR").then(one_of("fFbB")).to_slice(),
    ))
    .then(quoted(true))
    .validate(|(prefix, _): (&str, String), e, emitter| {
        emitter.emit(ParseError::custom(
            e.span(),
            format!("'{prefix}' string literals are not supported"),
        ));
        Token::Str(String::new())
    });

    let word = any()
        .filter(|c: &char| c.is_alphabetic() || *c == '_')
        .then(any().filter(|c: &char| c.is_alphanumeric() || *c == '_').repeated())
        .to_slice()
        .map(|word: &str| Token::keyword(word).unwrap_or_else(|| Token::Name(word.to_string())));

    let augmented = choice((
        just("**=").to(BinOp::Pow),
        just("//=").to(BinOp::FloorDiv),
        just("<<=").to(BinOp::LShift),
        just(">>=").to(BinOp::RShift),
        just("+=").to(BinOp::Add),
        just("-=").to(BinOp::Sub),
        just("*=").to(BinOp::Mul),
        just("/=").to(BinOp::Div),
        just("%=").to(BinOp::Mod),
        just("@=").to(BinOp::MatMul),
        just("&=").to(BinOp::BitAnd),
        just("|=").to(BinOp::BitOr),
        just("^=").to(BinOp::BitXor),
    ))
    .map(Token::AugAssign);

    let compound = choice((
        just("**").to(Token::DoubleStar),
        just("//").to(Token::DoubleSlash),
        just("<<").to(Token::ShiftLeft),
        just(">>").to(Token::ShiftRight),
        just("==").to(Token::Equal),
        just("!=").to(Token::NotEqual),
        just("<=").to(Token::LessEqual),
        just(">=").to(Token::GreaterEqual),
        just("->").to(Token::Arrow),
        just(":=").to(Token::ColonAssign),
    ));

    let bracket = choice((
        just('(').to(Token::ParenOpen),
        just(')').to(Token::ParenClose),
        just('[').to(Token::BracketOpen),
        just(']').to(Token::BracketClose),
        just('{').to(Token::BraceOpen),
        just('}').to(Token::BraceClose),
    ));

    let single = choice((
        just(',').to(Token::Comma),
        just(':').to(Token::Colon),
        just(';').to(Token::Semicolon),
        just('.').to(Token::Dot),
        just('=').to(Token::Assign),
        just('+').to(Token::Plus),
        just('-').to(Token::Minus),
        just('*').to(Token::Star),
        just('/').to(Token::Slash),
        just('%').to(Token::Percent),
        just('@').to(Token::At),
        just('&').to(Token::Ampersand),
        just('|').to(Token::Pipe),
        just('^').to(Token::Caret),
        just('~').to(Token::Tilde),
        just('<').to(Token::Less),
        just('>').to(Token::Greater),
    ));

    let comment = just('#').then(none_of('\n').repeated());
    let continuation = just('\\').then(just('\r').or_not()).then(just('\n'));
    let blank = choice((
        one_of(" \t\x0c\r").ignored(),
        comment.ignored(),
        continuation.ignored(),
    ))
    .repeated();

    let token = choice((
        unsupported_string,
        string,
        radix,
        decimal,
        word,
        just('\n').to(Token::Newline),
        augmented,
        compound,
        bracket,
        single,
    ));

    token
        .map_with(|token, e| (token, e.span()))
        .padded_by(blank.clone())
        .recover_with(skip_then_retry_until(any().ignored(), end()))
        .repeated()
        .collect()
        .padded_by(blank)
}

/// A string literal in any of its four quotings.
fn quoted<'src>(raw: bool) -> impl Parser<'src, &'src str, String, LexExtra<'src>> + Clone {
    choice((
        string_body("\"\"\"", raw),
        string_body("'''", raw),
        string_body("\"", raw),
        string_body("'", raw),
    ))
}

fn string_body<'src>(
    delimiter: &'static str,
    raw: bool,
) -> impl Parser<'src, &'src str, String, LexExtra<'src>> + Clone {
    let multiline = delimiter.len() == 3;

    let hex = just("\\x")
        .filter(move |_| !raw)
        .ignore_then(any().filter(char::is_ascii_hexdigit).repeated().exactly(2).to_slice())
        .try_map(|digits: &str, span| {
            u32::from_str_radix(digits, 16)
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .ok_or_else(|| ParseError::custom(span, "invalid \\x escape"))
        });

    let escape = just('\\').ignore_then(any()).map(move |escaped: char| {
        if raw {
            return format!("\\{escaped}");
        }
        match escaped {
            '\n' => String::new(),
            'n' => "\n".to_string(),
            't' => "\t".to_string(),
            'r' => "\r".to_string(),
            '0' => "\0".to_string(),
            '\\' | '\'' | '"' => escaped.to_string(),
            other => format!("\\{other}"),
        }
    });

    let plain = any()
        .and_is(just(delimiter).not())
        .filter(move |c: &char| *c != '\\' && (multiline || *c != '\n'))
        .map(String::from);

    choice((hex, escape, plain))
        .repeated()
        .collect::<Vec<String>>()
        .map(|parts| parts.concat())
        .delimited_by(just(delimiter), just(delimiter))
}

fn decimal_literal(literal: &str) -> Option<Token> {
    let cleaned: String = literal.chars().filter(|c| *c != '_').collect();
    if cleaned.contains(['.', 'e', 'E']) {
        cleaned.parse().ok().map(Token::Float)
    } else {
        cleaned.parse().ok().map(Token::Int)
    }
}

/// Scans `source` and applies the layout pass.
pub fn tokenize(source: &str, lines: &LineIndex<'_>) -> Result<Vec<Spanned<Token>>, SyntaxError> {
    let (tokens, errors) = lexer().parse(source).into_output_errors();
    if let Some(error) = errors.first() {
        return Err(match (error.reason(), error.found()) {
            (chumsky::error::RichReason::ExpectedFound { .. }, Some(found)) => SyntaxError::new(
                format!("invalid character '{found}'"),
                lines.locate(error.span().start),
            ),
            _ => SyntaxError::from_rich(error, lines),
        });
    }
    layout(tokens.unwrap_or_default(), lines)
}

fn point(offset: usize) -> Span {
    Span::from(offset..offset)
}

fn closes(open: &Token, close: &Token) -> bool {
    matches!(
        (open, close),
        (Token::ParenOpen, Token::ParenClose)
            | (Token::BracketOpen, Token::BracketClose)
            | (Token::BraceOpen, Token::BraceClose)
    )
}

fn too_deep(lines: &LineIndex<'_>, offset: usize) -> SyntaxError {
    SyntaxError::new("too many nested blocks or expressions", lines.locate(offset))
}

/// Off-side rule over raw tokens.
///
/// A `Newline` survives only when it ends a logical line outside brackets.
/// The first token of each logical line is compared with the indentation
/// stack (tabs advance to the next multiple of eight). Bracket depth plus
/// block depth, and runs of unary operators, are bounded by `MAX_NESTING`.
pub fn layout(
    tokens: Vec<Spanned<Token>>,
    lines: &LineIndex<'_>,
) -> Result<Vec<Spanned<Token>>, SyntaxError> {
    let mut output = Vec::with_capacity(tokens.len() + 8);
    let mut indents = vec![0usize];
    let mut brackets: Vec<Spanned<Token>> = Vec::new();
    let mut line_start = true;
    let mut unary_run = 0usize;

    for (token, span) in tokens {
        if token == Token::Newline {
            if brackets.is_empty() && !line_start {
                output.push((Token::Newline, span));
                line_start = true;
            }
            continue;
        }

        if line_start {
            let width = lines.indentation(span.start);
            let current = indents.last().copied().unwrap_or(0);
            if width > current {
                indents.push(width);
                if indents.len() - 1 > MAX_NESTING {
                    return Err(too_deep(lines, span.start));
                }
                output.push((Token::Indent, point(span.start)));
            } else {
                while width < indents.last().copied().unwrap_or(0) {
                    indents.pop();
                    output.push((Token::Dedent, point(span.start)));
                }
                if width != indents.last().copied().unwrap_or(0) {
                    return Err(SyntaxError::new(
                        "unindent does not match any outer indentation level",
                        lines.locate(span.start),
                    ));
                }
            }
            line_start = false;
        }

        match token {
            Token::ParenOpen | Token::BracketOpen | Token::BraceOpen => {
                brackets.push((token.clone(), span));
                if brackets.len() + indents.len() - 1 > MAX_NESTING {
                    return Err(too_deep(lines, span.start));
                }
            }
            Token::ParenClose | Token::BracketClose | Token::BraceClose => match brackets.pop() {
                Some((open, _)) if closes(&open, &token) => {}
                Some((open, _)) => {
                    return Err(SyntaxError::new(
                        format!("closing parenthesis {token} does not match opening parenthesis {open}"),
                        lines.locate(span.start),
                    ));
                }
                None => {
                    return Err(SyntaxError::new(format!("unmatched {token}"), lines.locate(span.start)));
                }
            },
            _ => {}
        }

        if matches!(token, Token::Plus | Token::Minus | Token::Tilde | Token::Not) {
            unary_run += 1;
            if unary_run > MAX_NESTING {
                return Err(too_deep(lines, span.start));
            }
        } else {
            unary_run = 0;
        }

        output.push((token, span));
    }

    if let Some((open, span)) = brackets.pop() {
        return Err(SyntaxError::new(format!("{open} was never closed"), lines.locate(span.start)));
    }
    let end = point(lines.end());
    if !line_start {
        output.push((Token::Newline, end));
    }
    for _ in 1..indents.len() {
        output.push((Token::Dedent, end));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str) -> Result<Vec<Token>, SyntaxError> {
        let lines = LineIndex::new(source);
        let tokens = tokenize(source, &lines)?;
        Ok(tokens.into_iter().map(|(token, _)| token).collect())
    }

    fn kinds(source: &str) -> Vec<Token> {
        scan(source).unwrap()
    }

    // ── layout ──────────────────────────────────────────

    #[test]
    fn test_indent_and_dedent() {
        let tokens = kinds("def f(a):\n    return a\nx = 1\n");
        assert_eq!(
            tokens,
            vec![
                Token::Def,
                Token::Name("f".into()),
                Token::ParenOpen,
                Token::Name("a".into()),
                Token::ParenClose,
                Token::Colon,
                Token::Newline,
                Token::Indent,
                Token::Return,
                Token::Name("a".into()),
                Token::Newline,
                Token::Dedent,
                Token::Name("x".into()),
                Token::Assign,
                Token::Int(1),
                Token::Newline,
            ]
        );
    }

    #[test]
    fn test_open_blocks_close_at_end_of_input() {
        let tokens = kinds("if x:\n    if y:\n        z = 1");
        assert!(tokens.ends_with(&[Token::Newline, Token::Dedent, Token::Dedent]));
    }

    #[test]
    fn test_blank_and_comment_lines_are_ignored() {
        let tokens = kinds("\n\n# comment\n  \nx = 1  # trailing\n");
        assert_eq!(
            tokens,
            vec![Token::Name("x".into()), Token::Assign, Token::Int(1), Token::Newline]
        );
        assert!(kinds("# only a comment").is_empty());
    }

    #[test]
    fn test_newlines_inside_brackets_are_joined() {
        let tokens = kinds("x = (1,\n     2)\n");
        assert_eq!(tokens.iter().filter(|t| **t == Token::Newline).count(), 1);
        assert!(!tokens.contains(&Token::Indent));
    }

    #[test]
    fn test_backslash_continuation_and_tabs() {
        let tokens = kinds("x = 1 + \\\n    2\n");
        assert!(!tokens.contains(&Token::Indent));
        let tokens = kinds("if x:\n\ty = 1\n        z = 2\n");
        assert_eq!(tokens.iter().filter(|t| **t == Token::Indent).count(), 1);
    }

    // ── literals ────────────────────────────────────────

    #[test]
    fn test_numbers() {
        assert_eq!(kinds("1_000")[0], Token::Int(1000));
        assert_eq!(kinds("0x1f")[0], Token::Int(31));
        assert_eq!(kinds("0b101")[0], Token::Int(5));
        assert_eq!(kinds("2.5")[0], Token::Float(2.5));
        assert_eq!(kinds(".5")[0], Token::Float(0.5));
        assert_eq!(kinds("1e3")[0], Token::Float(1000.0));
        assert_eq!(kinds("x.y")[1], Token::Dot);
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(kinds("'a\\nb'")[0], Token::Str("a\nb".into()));
        assert_eq!(kinds("r'a\\nb'")[0], Token::Str("a\\nb".into()));
        assert_eq!(kinds("'\\x41'")[0], Token::Str("A".into()));
        assert_eq!(kinds("\"\"\"x\ny\"\"\"")[0], Token::Str("x\ny".into()));
        assert_eq!(
            kinds("'a' \"b\""),
            vec![Token::Str("a".into()), Token::Str("b".into()), Token::Newline]
        );
    }

    #[test]
    fn test_keywords_and_names() {
        assert_eq!(
            kinds("not_a in None"),
            vec![Token::Name("not_a".into()), Token::In, Token::None, Token::Newline]
        );
    }

    #[test]
    fn test_longest_operator_wins() {
        assert_eq!(kinds("a **= 2")[1], Token::AugAssign(BinOp::Pow));
        assert_eq!(kinds("a // 2")[1], Token::DoubleSlash);
        assert_eq!(kinds("a != 2")[1], Token::NotEqual);
        assert_eq!(kinds("a := 2")[1], Token::ColonAssign);
    }

    // ── errors ──────────────────────────────────────────

    #[test]
    fn test_errors() {
        assert!(scan("x = 'open").is_err());
        assert!(scan("x = (1, 2").is_err());
        assert!(scan("x = 1)").is_err());
        assert!(scan("x = (1]").is_err());
        assert!(scan("x = f'{y}'").is_err());
        assert!(scan("x = b'raw'").is_err());
        assert!(scan("x = $").is_err());
        let err = scan("if x:\n    y = 1\n  z = 2\n").unwrap_err();
        assert!(err.message.contains("unindent"));
    }

    #[test]
    fn test_error_location() {
        let err = scan("x = 1\ny = $\n").unwrap_err();
        assert_eq!(err.location.line, 2);
        assert_eq!(err.location.column, 5);
    }

    #[test]
    fn test_unary_runs_are_bounded() {
        let deep = format!("x = {}1", "-".repeat(MAX_NESTING + 1));
        assert!(scan(&deep).unwrap_err().message.contains("nested"));
        let shallow = format!("x = {}1", "- ".repeat(10));
        assert!(scan(&shallow).is_ok());
    }
}
