/// Syntax tree for submitted computations.
///
/// The tree is closed: every construct the parser recognizes has its own
/// variant, including the ones the validator must refuse (imports, classes,
/// comprehensions, ...). Refusals are therefore policy decisions made by an
/// exhaustive `match`, never parse failures.
use std::fmt;
use std::sync::Arc;

/// A parsed source file.
#[derive(Debug, Clone)]
pub struct Module {
    pub body: Vec<Stmt>,
}

/// 1-based source position of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

// ── Statements ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub location: Location,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    FunctionDef(Arc<FunctionDef>),
    Return(Option<Expr>),
    Assign { targets: Vec<Expr>, value: Expr },
    Expr(Expr),
    If { test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },
    For { target: Expr, iter: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },
    While { test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },
    With { items: Vec<WithItem>, body: Vec<Stmt> },
    Pass,

    // Parsed so they can be refused by name; their contents are dropped.
    AugAssign,
    Import,
    ImportFrom,
    ClassDef,
    Global,
    Nonlocal,
    Delete,
    Raise,
    Try,
    Assert,
    Break,
    Continue,
}

impl StmtKind {
    /// Node kind name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            StmtKind::FunctionDef(_) => "FunctionDef",
            StmtKind::Return(_) => "Return",
            StmtKind::Assign { .. } => "Assign",
            StmtKind::Expr(_) => "Expr",
            StmtKind::If { .. } => "If",
            StmtKind::For { .. } => "For",
            StmtKind::While { .. } => "While",
            StmtKind::With { .. } => "With",
            StmtKind::Pass => "Pass",
            StmtKind::AugAssign => "AugAssign",
            StmtKind::Import => "Import",
            StmtKind::ImportFrom => "ImportFrom",
            StmtKind::ClassDef => "ClassDef",
            StmtKind::Global => "Global",
            StmtKind::Nonlocal => "Nonlocal",
            StmtKind::Delete => "Delete",
            StmtKind::Raise => "Raise",
            StmtKind::Try => "Try",
            StmtKind::Assert => "Assert",
            StmtKind::Break => "Break",
            StmtKind::Continue => "Continue",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub params: Parameters,
    pub returns: Option<Expr>,
    pub body: Vec<Stmt>,
    pub location: Location,
}

/// Parameter list of a `def` or `lambda`.
#[derive(Debug, Clone, Default)]
pub struct Parameters {
    pub params: Vec<Param>,
    /// `*name` present, refused by the validator.
    pub vararg: bool,
    /// `**name` present, refused by the validator.
    pub kwarg: bool,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub annotation: Option<Expr>,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct WithItem {
    pub context: Expr,
    pub target: Option<Expr>,
}

// ── Expressions ──────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub location: Location,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Name(String),
    Constant(Constant),
    Attribute { value: Box<Expr>, attr: String },
    Subscript { value: Box<Expr>, index: Box<Expr> },
    Slice { lower: Option<Box<Expr>>, upper: Option<Box<Expr>>, step: Option<Box<Expr>> },
    /// Keyword arguments are only recorded as present; they are refused.
    Call { func: Box<Expr>, args: Vec<Expr>, has_keywords: bool },
    BinOp { left: Box<Expr>, op: BinOp, right: Box<Expr> },
    UnaryOp { op: UnaryOp, operand: Box<Expr> },
    BoolOp { op: BoolOp, values: Vec<Expr> },
    Compare { left: Box<Expr>, ops: Vec<CmpOp>, comparators: Vec<Expr> },
    IfExp { test: Box<Expr>, body: Box<Expr>, orelse: Box<Expr> },
    Lambda(Arc<Lambda>),
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),

    // Parsed so they can be refused by name; their contents are dropped.
    Set,
    Comprehension(ComprehensionKind),
    Starred,
    NamedExpr,
    Yield,
    Await,
}

impl ExprKind {
    pub fn name(&self) -> &'static str {
        match self {
            ExprKind::Name(_) => "Name",
            ExprKind::Constant(_) => "Constant",
            ExprKind::Attribute { .. } => "Attribute",
            ExprKind::Subscript { .. } => "Subscript",
            ExprKind::Slice { .. } => "Slice",
            ExprKind::Call { .. } => "Call",
            ExprKind::BinOp { .. } => "BinOp",
            ExprKind::UnaryOp { .. } => "UnaryOp",
            ExprKind::BoolOp { .. } => "BoolOp",
            ExprKind::Compare { .. } => "Compare",
            ExprKind::IfExp { .. } => "IfExp",
            ExprKind::Lambda(_) => "Lambda",
            ExprKind::Tuple(_) => "Tuple",
            ExprKind::List(_) => "List",
            ExprKind::Dict(_) => "Dict",
            ExprKind::Set => "Set",
            ExprKind::Comprehension(kind) => kind.name(),
            ExprKind::Starred => "Starred",
            ExprKind::NamedExpr => "NamedExpr",
            ExprKind::Yield => "Yield",
            ExprKind::Await => "Await",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone)]
pub struct Lambda {
    pub params: Parameters,
    pub body: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComprehensionKind {
    List,
    Set,
    Dict,
    Generator,
}

impl ComprehensionKind {
    pub fn name(self) -> &'static str {
        match self {
            ComprehensionKind::List => "ListComp",
            ComprehensionKind::Set => "SetComp",
            ComprehensionKind::Dict => "DictComp",
            ComprehensionKind::Generator => "GeneratorExp",
        }
    }
}

// ── Operators ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    MatMul,
    BitAnd,
    BitOr,
    BitXor,
    LShift,
    RShift,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::MatMul => "@",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::LShift => "<<",
            BinOp::RShift => ">>",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
    Is,
    IsNot,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::NotEq => "!=",
            CmpOp::Lt => "<",
            CmpOp::LtE => "<=",
            CmpOp::Gt => ">",
            CmpOp::GtE => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
            CmpOp::Is => "is",
            CmpOp::IsNot => "is not",
        }
    }
}

/// Renders the dotted receiver path of an expression, e.g. `os.path`,
/// `args[x]` or `globals()`. Expressions without a path render empty.
pub fn receiver_path(expr: &Expr) -> String {
    match &expr.kind {
        ExprKind::Name(name) => name.clone(),
        ExprKind::Attribute { value, attr } => format!("{}.{attr}", receiver_path(value)),
        ExprKind::Subscript { value, index } => {
            format!("{}[{}]", receiver_path(value), receiver_path(index))
        }
        ExprKind::Call { func, .. } => format!("{}()", receiver_path(func)),
        ExprKind::Constant(Constant::Str(text)) => text.clone(),
        ExprKind::Constant(Constant::Int(number)) => number.to_string(),
        _ => String::new(),
    }
}
