//! A miniature compiler middle end and interpreter.
//!
//! Programs are built as ASTs ([`ast`]), lowered to basic blocks of
//! three-address instructions, brought into SSA form and optimised
//! ([`il`]), then executed on a register interpreter ([`vm`]).
//!
//! ```
//! use tinyssa::ast::{BinOp, Expr, Stmt};
//! use tinyssa::{il, vm::Vm};
//!
//! let ast = Stmt::block(vec![
//!     Stmt::expr(Expr::assign("a", Expr::int(40))),
//!     Stmt::ret(Expr::bin(BinOp::Add, Expr::var("a"), Expr::int(2))),
//! ]);
//! let program = il::compile(&ast).unwrap();
//! assert_eq!(Vm::new(&program).run(), Ok(Some(42)));
//! ```

pub mod ast;
pub mod error;
pub mod ext;
pub mod il;
pub mod vm;

pub use il::{compile, compile_unoptimised};
