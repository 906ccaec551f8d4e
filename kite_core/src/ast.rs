//! Abstract syntax tree consumed by the compiler.
//!
//! The tree is produced by an external front end; this crate only defines its
//! shape. Every statement and expression carries the source line it starts on
//! (`0` means "no line information").
//!
//! Small constructor helpers are provided because trees are frequently built
//! by hand (tests, embedders, code generators):
//!
//! ```
//! use kite_core::ast::{Expr, Stmt};
//!
//! // x = a + 1
//! let stmt = Stmt::assign(Expr::name("x"), Expr::name("a").add(Expr::int(1))).at(1);
//! assert_eq!(stmt.line, 1);
//! ```

// =============================================================================
// Module
// =============================================================================

/// A whole compilation input.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    /// Top-level statements.
    pub body: Vec<Stmt>,
}

impl Module {
    /// Create a module from its statements.
    pub fn new(body: Vec<Stmt>) -> Self {
        Self { body }
    }
}

// =============================================================================
// Statements
// =============================================================================

/// A statement with its source line.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    /// Statement payload.
    pub kind: StmtKind,
    /// First source line of the statement.
    pub line: u32,
}

/// Function definition payload, shared by `def` and the symbol table.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    /// Bound name.
    pub name: String,
    /// Parameters.
    pub args: Arguments,
    /// Body statements.
    pub body: Vec<Stmt>,
    /// Decorators, outermost first.
    pub decorators: Vec<Expr>,
}

/// Class definition payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    /// Bound name.
    pub name: String,
    /// Base class expressions.
    pub bases: Vec<Expr>,
    /// Class body.
    pub body: Vec<Stmt>,
    /// Decorators, outermost first.
    pub decorators: Vec<Expr>,
}

/// Statement kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `def name(args): body`
    FunctionDef(Box<FunctionDef>),
    /// `class name(bases): body`
    ClassDef(Box<ClassDef>),
    /// `return [value]`
    Return(Option<Expr>),
    /// `del targets`
    Delete(Vec<Expr>),
    /// `t1 = t2 = ... = value`
    Assign {
        /// Targets, assigned left to right.
        targets: Vec<Expr>,
        /// Assigned value.
        value: Expr,
    },
    /// `target op= value`
    AugAssign {
        /// Name, attribute or subscript target.
        target: Expr,
        /// In-place operator.
        op: BinOp,
        /// Right-hand side.
        value: Expr,
    },
    /// `for target in iter: body else: orelse`
    For {
        /// Loop target.
        target: Expr,
        /// Iterated expression.
        iter: Expr,
        /// Loop body.
        body: Vec<Stmt>,
        /// Runs when the loop finishes without `break`.
        orelse: Vec<Stmt>,
    },
    /// `while test: body else: orelse`
    While {
        /// Loop condition.
        test: Expr,
        /// Loop body.
        body: Vec<Stmt>,
        /// Runs when the condition becomes false.
        orelse: Vec<Stmt>,
    },
    /// `if test: body else: orelse`
    If {
        /// Condition.
        test: Expr,
        /// Taken branch.
        body: Vec<Stmt>,
        /// Not-taken branch (`elif` chains nest here).
        orelse: Vec<Stmt>,
    },
    /// `with context [as target]: body`
    With {
        /// Context manager expression.
        context: Expr,
        /// Optional binding target for `__enter__`'s result.
        target: Option<Expr>,
        /// Protected body.
        body: Vec<Stmt>,
    },
    /// `raise [exc [, value [, traceback]]]`
    Raise {
        /// Exception type or instance.
        exc: Option<Expr>,
        /// Exception value.
        value: Option<Expr>,
        /// Traceback.
        traceback: Option<Expr>,
    },
    /// `try: body except ...: ... else: orelse`
    TryExcept {
        /// Protected body.
        body: Vec<Stmt>,
        /// Handlers, tried in order.
        handlers: Vec<ExceptHandler>,
        /// Runs when the body completes without raising.
        orelse: Vec<Stmt>,
    },
    /// `try: body finally: finalbody`
    TryFinally {
        /// Protected body.
        body: Vec<Stmt>,
        /// Cleanup that always runs.
        finalbody: Vec<Stmt>,
    },
    /// `assert test [, msg]`
    Assert {
        /// Asserted condition.
        test: Expr,
        /// Optional message.
        msg: Option<Expr>,
    },
    /// `exec body [in globals [, locals]]`
    Exec {
        /// Code object expression.
        body: Expr,
        /// Globals mapping.
        globals: Option<Expr>,
        /// Locals mapping.
        locals: Option<Expr>,
    },
    /// `global names`
    Global(Vec<String>),
    /// Expression evaluated for its side effects.
    Expr(Expr),
    /// `pass`
    Pass,
    /// `break`
    Break,
    /// `continue`
    Continue,
}

/// One `except` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptHandler {
    /// Matched type; `None` for a bare `except:`.
    pub typ: Option<Expr>,
    /// Binding target for the exception value.
    pub name: Option<Expr>,
    /// Handler body.
    pub body: Vec<Stmt>,
    /// Line of the `except` keyword.
    pub line: u32,
}

/// Function parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Arguments {
    /// Positional parameter names.
    pub args: Vec<String>,
    /// `*name` parameter.
    pub vararg: Option<String>,
    /// `**name` parameter.
    pub kwarg: Option<String>,
    /// Defaults for the trailing positional parameters.
    pub defaults: Vec<Expr>,
}

impl Arguments {
    /// Plain positional parameters without defaults.
    pub fn positional(names: &[&str]) -> Self {
        Self {
            args: names.iter().map(|n| (*n).to_string()).collect(),
            ..Self::default()
        }
    }
}

// =============================================================================
// Expressions
// =============================================================================

/// An expression with its source line.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    /// Expression payload.
    pub kind: ExprKind,
    /// Source line (0 if unknown).
    pub line: u32,
}

/// Literal values.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// `None`
    None,
    /// `True` / `False`
    Bool(bool),
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// String literal.
    Str(String),
}

/// Expression kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// `a and b and c` / `a or b or c`
    BoolOp {
        /// Operator.
        op: BoolOp,
        /// Two or more operands.
        values: Vec<Expr>,
    },
    /// `left op right`
    BinOp {
        /// Left operand.
        left: Box<Expr>,
        /// Operator.
        op: BinOp,
        /// Right operand.
        right: Box<Expr>,
    },
    /// `op operand`
    UnaryOp {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        operand: Box<Expr>,
    },
    /// `lambda args: body`
    Lambda {
        /// Parameters.
        args: Box<Arguments>,
        /// Result expression.
        body: Box<Expr>,
    },
    /// `body if test else orelse`
    IfExp {
        /// Condition.
        test: Box<Expr>,
        /// Value when true.
        body: Box<Expr>,
        /// Value when false.
        orelse: Box<Expr>,
    },
    /// `{k: v, ...}`
    Dict {
        /// Keys.
        keys: Vec<Expr>,
        /// Values, parallel to `keys`.
        values: Vec<Expr>,
    },
    /// `[elt for ...]`
    ListComp {
        /// Produced element.
        elt: Box<Expr>,
        /// `for`/`if` clauses, outermost first.
        generators: Vec<Comprehension>,
    },
    /// `(elt for ...)`
    GeneratorExp {
        /// Produced element.
        elt: Box<Expr>,
        /// `for`/`if` clauses, outermost first.
        generators: Vec<Comprehension>,
    },
    /// `yield [value]`
    Yield(Option<Box<Expr>>),
    /// `left op1 c1 op2 c2 ...`
    Compare {
        /// Leftmost operand.
        left: Box<Expr>,
        /// Operators.
        ops: Vec<CmpOp>,
        /// Right-hand operands, parallel to `ops`.
        comparators: Vec<Expr>,
    },
    /// `func(args, kw=v, *starargs, **kwargs)`
    Call {
        /// Callee.
        func: Box<Expr>,
        /// Positional arguments.
        args: Vec<Expr>,
        /// Keyword arguments.
        keywords: Vec<Keyword>,
        /// `*expr` argument.
        starargs: Option<Box<Expr>>,
        /// `**expr` argument.
        kwargs: Option<Box<Expr>>,
    },
    /// Literal.
    Constant(Literal),
    /// `value.attr`
    Attribute {
        /// Object.
        value: Box<Expr>,
        /// Attribute name.
        attr: String,
    },
    /// `value[slice]`
    Subscript {
        /// Container.
        value: Box<Expr>,
        /// Index or slice.
        slice: Box<Slice>,
    },
    /// Identifier.
    Name(String),
    /// `[a, b]`
    List(Vec<Expr>),
    /// `(a, b)`
    Tuple(Vec<Expr>),
}

/// Subscript payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Slice {
    /// `x[i]`
    Index(Expr),
    /// `x[lower:upper:step]`
    Slice {
        /// Lower bound.
        lower: Option<Expr>,
        /// Upper bound.
        upper: Option<Expr>,
        /// Step.
        step: Option<Expr>,
    },
}

/// One `for target in iter if cond...` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Comprehension {
    /// Loop target.
    pub target: Expr,
    /// Iterated expression.
    pub iter: Expr,
    /// Filters.
    pub ifs: Vec<Expr>,
}

/// `name=value` call argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    /// Parameter name.
    pub arg: String,
    /// Value.
    pub value: Expr,
}

/// Short-circuit operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoolOp {
    /// `and`
    And,
    /// `or`
    Or,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitOr,
    BitXor,
    BitAnd,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum UnaryOp {
    Not,
    Invert,
    UAdd,
    USub,
}

/// Comparison operators.
///
/// The discriminant is the `COMPARE_OP` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum CmpOp {
    Lt = 0,
    LtE = 1,
    Eq = 2,
    NotEq = 3,
    Gt = 4,
    GtE = 5,
    In = 6,
    NotIn = 7,
    Is = 8,
    IsNot = 9,
}

impl CmpOp {
    /// All operators in discriminant order.
    pub const ALL: [CmpOp; 10] = [
        CmpOp::Lt,
        CmpOp::LtE,
        CmpOp::Eq,
        CmpOp::NotEq,
        CmpOp::Gt,
        CmpOp::GtE,
        CmpOp::In,
        CmpOp::NotIn,
        CmpOp::Is,
        CmpOp::IsNot,
    ];

    /// Decode a `COMPARE_OP` argument.
    pub fn from_arg(arg: u32) -> Option<Self> {
        Self::ALL.get(arg as usize).copied()
    }

    /// Operator spelling.
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::LtE => "<=",
            CmpOp::Eq => "==",
            CmpOp::NotEq => "!=",
            CmpOp::Gt => ">",
            CmpOp::GtE => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
            CmpOp::Is => "is",
            CmpOp::IsNot => "is not",
        }
    }
}

// =============================================================================
// Constructors
// =============================================================================

impl Stmt {
    /// Wrap a kind with no line information.
    pub fn new(kind: StmtKind) -> Self {
        Self { kind, line: 0 }
    }

    /// Set the source line.
    pub fn at(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    /// `target = value`
    pub fn assign(target: Expr, value: Expr) -> Self {
        Self::new(StmtKind::Assign {
            targets: vec![target],
            value,
        })
    }

    /// Expression statement.
    pub fn expr(value: Expr) -> Self {
        Self::new(StmtKind::Expr(value))
    }

    /// `return value`
    pub fn ret(value: Option<Expr>) -> Self {
        Self::new(StmtKind::Return(value))
    }

    /// `if test: body else: orelse`
    pub fn if_(test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt>) -> Self {
        Self::new(StmtKind::If { test, body, orelse })
    }

    /// `while test: body`
    pub fn while_(test: Expr, body: Vec<Stmt>) -> Self {
        Self::new(StmtKind::While {
            test,
            body,
            orelse: Vec::new(),
        })
    }

    /// `for target in iter: body`
    pub fn for_(target: Expr, iter: Expr, body: Vec<Stmt>) -> Self {
        Self::new(StmtKind::For {
            target,
            iter,
            body,
            orelse: Vec::new(),
        })
    }

    /// `def name(params): body`
    pub fn def(name: &str, params: &[&str], body: Vec<Stmt>) -> Self {
        Self::new(StmtKind::FunctionDef(Box::new(FunctionDef {
            name: name.to_string(),
            args: Arguments::positional(params),
            body,
            decorators: Vec::new(),
        })))
    }

    /// `pass`
    pub fn pass() -> Self {
        Self::new(StmtKind::Pass)
    }
}

impl Expr {
    /// Wrap a kind with no line information.
    pub fn new(kind: ExprKind) -> Self {
        Self { kind, line: 0 }
    }

    /// Set the source line.
    pub fn at(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    /// Identifier reference.
    pub fn name(id: &str) -> Self {
        Self::new(ExprKind::Name(id.to_string()))
    }

    /// Integer literal.
    pub fn int(value: i64) -> Self {
        Self::new(ExprKind::Constant(Literal::Int(value)))
    }

    /// Float literal.
    pub fn float(value: f64) -> Self {
        Self::new(ExprKind::Constant(Literal::Float(value)))
    }

    /// String literal.
    pub fn str(value: &str) -> Self {
        Self::new(ExprKind::Constant(Literal::Str(value.to_string())))
    }

    /// Boolean literal.
    pub fn bool(value: bool) -> Self {
        Self::new(ExprKind::Constant(Literal::Bool(value)))
    }

    /// `None`
    pub fn none() -> Self {
        Self::new(ExprKind::Constant(Literal::None))
    }

    /// `self op right`
    pub fn binop(self, op: BinOp, right: Expr) -> Self {
        let line = self.line;
        Self {
            kind: ExprKind::BinOp {
                left: Box::new(self),
                op,
                right: Box::new(right),
            },
            line,
        }
    }

    /// `self + right`
    #[allow(clippy::should_implement_trait)]
    pub fn add(self, right: Expr) -> Self {
        self.binop(BinOp::Add, right)
    }

    /// `self op right`
    pub fn compare(self, op: CmpOp, right: Expr) -> Self {
        let line = self.line;
        Self {
            kind: ExprKind::Compare {
                left: Box::new(self),
                ops: vec![op],
                comparators: vec![right],
            },
            line,
        }
    }

    /// `self(args)`
    pub fn call(self, args: Vec<Expr>) -> Self {
        let line = self.line;
        Self {
            kind: ExprKind::Call {
                func: Box::new(self),
                args,
                keywords: Vec::new(),
                starargs: None,
                kwargs: None,
            },
            line,
        }
    }

    /// `self.attr`
    pub fn attr(self, attr: &str) -> Self {
        let line = self.line;
        Self {
            kind: ExprKind::Attribute {
                value: Box::new(self),
                attr: attr.to_string(),
            },
            line,
        }
    }

    /// `self[index]`
    pub fn index(self, index: Expr) -> Self {
        let line = self.line;
        Self {
            kind: ExprKind::Subscript {
                value: Box::new(self),
                slice: Box::new(Slice::Index(index)),
            },
            line,
        }
    }

    /// `a op b op c ...`
    pub fn boolop(op: BoolOp, values: Vec<Expr>) -> Self {
        Self::new(ExprKind::BoolOp { op, values })
    }

    /// Tuple display.
    pub fn tuple(elts: Vec<Expr>) -> Self {
        Self::new(ExprKind::Tuple(elts))
    }

    /// List display.
    pub fn list(elts: Vec<Expr>) -> Self {
        Self::new(ExprKind::List(elts))
    }

    /// Returns the identifier if this is a plain name.
    pub fn as_name(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Name(id) => Some(id),
            _ => None,
        }
    }
}
