//! Error taxonomy for compilation and execution.
//!
//! Both kinds are fatal: a structural error aborts compilation, a runtime
//! error aborts the current run. Internal invariant violations (an unbound
//! register at run time, a phi without predecessor data) are implementation
//! defects and panic instead of surfacing here.

use thiserror::Error;

/// A malformed construct detected while generating code from the AST.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StructuralError {
    #[error("`break` used outside of a loop")]
    BreakOutsideLoop,
    #[error("branch condition must be a comparison")]
    InvalidCondition,
    #[error("comparison `{0}` used in value position")]
    ComparisonAsValue(String),
}

/// A fatal error raised while executing a compiled program.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("call to undefined function `{0}`")]
    UndefinedFunction(String),
    #[error("division or modulo by zero")]
    DivisionByZero,
}
