//! The abstract syntax tree handed to the code generator.
//!
//! Lexing and parsing live outside this crate; an embedding front end builds
//! these nodes and passes them to [`crate::il::compile`]. The node set is a
//! closed sum type, so an unhandled construct is a compile-time hole in the
//! generator rather than a run-time surprise.

use std::fmt::{self, Display, Formatter};

/// A statement node.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// A sequence of statements.
    Block(Vec<Stmt>),
    /// An expression evaluated for its effect.
    Expr(Expr),
    /// `if cond then ... [else ...]`.
    If(Expr, Box<Stmt>, Option<Box<Stmt>>),
    /// `while cond do ...`.
    While(Expr, Box<Stmt>),
    /// `break` out of the innermost loop.
    Break,
    /// `return [value]`.
    Return(Option<Expr>),
    /// `def name(params) body end`.
    Defun(String, Vec<String>, Box<Stmt>),
}

impl Stmt {
    pub fn block(stmts: Vec<Stmt>) -> Self {
        Self::Block(stmts)
    }

    pub fn expr(expr: Expr) -> Self {
        Self::Expr(expr)
    }

    pub fn if_(cond: Expr, then: Stmt) -> Self {
        Self::If(cond, Box::new(then), None)
    }

    pub fn if_else(cond: Expr, then: Stmt, els: Stmt) -> Self {
        Self::If(cond, Box::new(then), Some(Box::new(els)))
    }

    pub fn while_(cond: Expr, body: Stmt) -> Self {
        Self::While(cond, Box::new(body))
    }

    pub fn break_() -> Self {
        Self::Break
    }

    pub fn ret(value: Expr) -> Self {
        Self::Return(Some(value))
    }

    pub fn ret_none() -> Self {
        Self::Return(None)
    }

    pub fn defun(name: &str, params: &[&str], body: Stmt) -> Self {
        Self::Defun(
            name.to_string(),
            params.iter().map(|p| p.to_string()).collect(),
            Box::new(body),
        )
    }
}

/// An expression node. Assignment is an expression whose value is the
/// assigned variable, as in the source language.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// An integer literal.
    Int(i64),
    /// A variable reference.
    Var(String),
    /// `lvalue = rvalue`.
    Assign(String, Box<Expr>),
    /// A binary arithmetic expression.
    Bin(BinOp, Box<Expr>, Box<Expr>),
    /// A comparison. Only valid as a branch condition.
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    /// Unary negation.
    Neg(Box<Expr>),
    /// A function call.
    Call(String, Vec<Expr>),
}

impl Expr {
    pub fn int(value: i64) -> Self {
        Self::Int(value)
    }

    pub fn var(name: &str) -> Self {
        Self::Var(name.to_string())
    }

    pub fn assign(name: &str, value: Expr) -> Self {
        Self::Assign(name.to_string(), Box::new(value))
    }

    pub fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Self::Bin(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn cmp(op: CmpOp, lhs: Expr, rhs: Expr) -> Self {
        Self::Cmp(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn neg(operand: Expr) -> Self {
        Self::Neg(Box::new(operand))
    }

    pub fn call(name: &str, args: Vec<Expr>) -> Self {
        Self::Call(name.to_string(), args)
    }
}

/// A binary arithmetic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinOp {
    /// Apply the operator to two constants. Division truncates toward
    /// negative infinity and the sign of a modulo result follows the
    /// divisor, matching the source language. A zero divisor yields `None`;
    /// the caller decides whether that is a deferred fold or a run-time
    /// error.
    pub fn apply(self, lhs: i64, rhs: i64) -> Option<i64> {
        match self {
            Self::Add => Some(lhs.wrapping_add(rhs)),
            Self::Sub => Some(lhs.wrapping_sub(rhs)),
            Self::Mul => Some(lhs.wrapping_mul(rhs)),
            Self::Div => {
                if rhs == 0 {
                    return None;
                }
                let quot = lhs / rhs;
                let rem = lhs % rhs;
                if rem != 0 && (rem < 0) != (rhs < 0) {
                    Some(quot - 1)
                } else {
                    Some(quot)
                }
            }
            Self::Mod => {
                if rhs == 0 {
                    return None;
                }
                let rem = lhs % rhs;
                if rem != 0 && (rem < 0) != (rhs < 0) {
                    Some(rem + rhs)
                } else {
                    Some(rem)
                }
            }
        }
    }
}

impl Display for BinOp {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "ADD",
            Self::Sub => "SUB",
            Self::Mul => "MUL",
            Self::Div => "DIV",
            Self::Mod => "MOD",
        })
    }
}

/// A comparison operator, evaluated against the VM's comparison flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// The negated comparator, used to jump to the false branch.
    pub fn flip(self) -> Self {
        match self {
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
            Self::Lt => Self::Ge,
            Self::Ge => Self::Lt,
            Self::Le => Self::Gt,
            Self::Gt => Self::Le,
        }
    }

    /// Whether a comparison flag (`lhs - rhs`) satisfies this relation.
    pub fn holds(self, flag: i64) -> bool {
        match self {
            Self::Eq => flag == 0,
            Self::Ne => flag != 0,
            Self::Lt => flag < 0,
            Self::Le => flag <= 0,
            Self::Gt => flag > 0,
            Self::Ge => flag >= 0,
        }
    }
}

impl Display for CmpOp {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        })
    }
}
