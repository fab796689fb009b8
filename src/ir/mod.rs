use serde::{Deserialize, Serialize};

// ---- Resolved IR ----
//
// Handed over by the semantic builder: names are already resolved to
// value-stack offsets (0 = most recent binding) and patterns carry field
// offsets and type identities.

/// A whole compilation unit as produced by the builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    #[serde(default)]
    pub types: Vec<StructDecl>,
    pub body: Ir,
}

/// Struct layout registered by the builder before any code references it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<String>,
}

/// Source location attached to a call site for error traces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loc {
    pub file: String,
    pub line: u32,
}

impl std::fmt::Display for Loc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Const {
    Nil,
    Bool(bool),
    Num(f64),
    Str(String),
    /// An undefined sentinel with the given error tag (explicit raise).
    Undefined(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Cons,
}

impl BinOp {
    pub fn is_ordering(self) -> bool {
        matches!(self, BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Cons => "::",
        }
    }
}

/// Type identity used by patterns and by the emitter's static type tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ty {
    Cons,
    Undefined,
    Struct(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Pattern {
    /// Bind the value at this position as a new variable.
    Bind,
    /// Match anything, bind nothing.
    Ignore,
    Unpack { ty: Ty, fields: Vec<(usize, Pattern)> },
}

impl Pattern {
    /// Nesting depth counted in `Unpack` levels.
    pub fn depth(&self) -> usize {
        match self {
            Pattern::Bind | Pattern::Ignore => 0,
            Pattern::Unpack { fields, .. } => {
                1 + fields.iter().map(|(_, p)| p.depth()).max().unwrap_or(0)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub value: Ir,
    #[serde(default)]
    pub mutable: bool,
}

/// A function literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FnLit {
    pub arity: usize,
    /// Offsets of captured variables in the enclosing value-stack.
    #[serde(default)]
    pub captures: Vec<usize>,
    pub body: Box<Ir>,
    #[serde(default)]
    pub name: Option<String>,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Ir {
    Const(Const),
    Var {
        offset: usize,
        #[serde(default)]
        mutable: bool,
    },
    Apply {
        callee: Box<Ir>,
        args: Vec<Ir>,
        /// When false the call site is not error-transparent: an undefined
        /// result flows on as an ordinary value.
        #[serde(default = "yes")]
        guard: bool,
        #[serde(default)]
        loc: Option<Loc>,
    },
    Binop {
        op: BinOp,
        lhs: Box<Ir>,
        rhs: Box<Ir>,
    },
    Fn(FnLit),
    Let {
        binds: Vec<Binding>,
        /// Without a body the bindings extend to the rest of the enclosing block.
        #[serde(default)]
        body: Option<Box<Ir>>,
    },
    Fix {
        fns: Vec<Ir>,
        #[serde(default)]
        body: Option<Box<Ir>>,
    },
    If {
        test: Box<Ir>,
        then: Box<Ir>,
        #[serde(rename = "else")]
        else_: Box<Ir>,
    },
    Match {
        pattern: Pattern,
        value: Box<Ir>,
        then: Box<Ir>,
        #[serde(default, rename = "else")]
        else_: Option<Box<Ir>>,
    },
    Block {
        exprs: Vec<Ir>,
        /// Keep the block's bindings visible after it ends (namespaces, modules).
        #[serde(default)]
        keep: bool,
    },
    Return(Box<Ir>),
    SetRef {
        offset: usize,
        value: Box<Ir>,
    },
    Yield(Box<Ir>),
    Struct {
        ty: u32,
        fields: Vec<Ir>,
    },
}

impl Ir {
    pub fn nil() -> Ir {
        Ir::Const(Const::Nil)
    }

    pub fn num(n: f64) -> Ir {
        Ir::Const(Const::Num(n))
    }

    pub fn str(s: impl Into<String>) -> Ir {
        Ir::Const(Const::Str(s.into()))
    }

    pub fn var(offset: usize) -> Ir {
        Ir::Var { offset, mutable: false }
    }

    pub fn binop(op: BinOp, lhs: Ir, rhs: Ir) -> Ir {
        Ir::Binop { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    pub fn apply(callee: Ir, args: Vec<Ir>) -> Ir {
        Ir::Apply { callee: Box::new(callee), args, guard: true, loc: None }
    }

    pub fn func(arity: usize, captures: Vec<usize>, body: Ir) -> Ir {
        Ir::Fn(FnLit { arity, captures, body: Box::new(body), name: None })
    }

    pub fn let_in(values: Vec<Ir>, body: Ir) -> Ir {
        Ir::Let {
            binds: values.into_iter().map(|value| Binding { value, mutable: false }).collect(),
            body: Some(Box::new(body)),
        }
    }

    pub fn if_(test: Ir, then: Ir, else_: Ir) -> Ir {
        Ir::If { test: Box::new(test), then: Box::new(then), else_: Box::new(else_) }
    }

    /// Number of nodes, used as the inlining size measure.
    pub fn size(&self) -> usize {
        1 + match self {
            Ir::Const(_) | Ir::Var { .. } => 0,
            Ir::Apply { callee, args, .. } => callee.size() + args.iter().map(Ir::size).sum::<usize>(),
            Ir::Binop { lhs, rhs, .. } => lhs.size() + rhs.size(),
            Ir::Fn(f) => f.body.size(),
            Ir::Let { binds, body } => {
                binds.iter().map(|b| b.value.size()).sum::<usize>()
                    + body.as_ref().map_or(0, |b| b.size())
            }
            Ir::Fix { fns, body } => {
                fns.iter().map(Ir::size).sum::<usize>() + body.as_ref().map_or(0, |b| b.size())
            }
            Ir::If { test, then, else_ } => test.size() + then.size() + else_.size(),
            Ir::Match { value, then, else_, .. } => {
                value.size() + then.size() + else_.as_ref().map_or(0, |e| e.size())
            }
            Ir::Block { exprs, .. } => exprs.iter().map(Ir::size).sum(),
            Ir::Return(e) | Ir::Yield(e) => e.size(),
            Ir::SetRef { value, .. } => value.size(),
            Ir::Struct { fields, .. } => fields.iter().map(Ir::size).sum(),
        }
    }

    /// True if the node (outside nested function literals) returns or yields
    /// from the enclosing function. Such bodies cannot be inlined.
    pub fn escapes_frame(&self) -> bool {
        match self {
            Ir::Return(_) | Ir::Yield(_) => true,
            Ir::Const(_) | Ir::Var { .. } | Ir::Fn(_) => false,
            Ir::Apply { callee, args, .. } => {
                callee.escapes_frame() || args.iter().any(Ir::escapes_frame)
            }
            Ir::Binop { lhs, rhs, .. } => lhs.escapes_frame() || rhs.escapes_frame(),
            Ir::Let { binds, body } => {
                binds.iter().any(|b| b.value.escapes_frame())
                    || body.as_ref().is_some_and(|b| b.escapes_frame())
            }
            Ir::Fix { body, .. } => body.as_ref().is_some_and(|b| b.escapes_frame()),
            Ir::If { test, then, else_ } => {
                test.escapes_frame() || then.escapes_frame() || else_.escapes_frame()
            }
            Ir::Match { value, then, else_, .. } => {
                value.escapes_frame()
                    || then.escapes_frame()
                    || else_.as_ref().is_some_and(|e| e.escapes_frame())
            }
            Ir::Block { exprs, .. } => exprs.iter().any(Ir::escapes_frame),
            Ir::SetRef { value, .. } => value.escapes_frame(),
            Ir::Struct { fields, .. } => fields.iter().any(Ir::escapes_frame),
        }
    }
}
