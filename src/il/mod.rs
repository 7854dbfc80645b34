//! The intermediate language: three-address instructions in basic blocks,
//! lifted to SSA form and optionally optimised.

pub mod block;
pub mod flow;
pub mod generator;
pub mod optimiser;
pub mod tac;

pub use block::{BasicBlock, FlowGraph, Function, Program};
pub use tac::{BlockId, FuncId, Instr, Name, Reg, Value};

use crate::ast::Stmt;
use crate::error::StructuralError;

/// Lower a program to analysed, optimised IL, ready to execute.
pub fn compile(ast: &Stmt) -> Result<Program, StructuralError> {
    let mut program = compile_unoptimised(ast)?;
    optimiser::optimise(&mut program.top, &[]);
    for func in &mut program.funcs {
        optimiser::optimise(&mut func.graph, &func.params);
    }
    Ok(program)
}

/// Lower a program and run flow analysis, but skip the optimiser. The
/// result still carries phi functions at merge points, so it is mainly
/// useful for inspection and for straight-line programs.
pub fn compile_unoptimised(ast: &Stmt) -> Result<Program, StructuralError> {
    let mut program = generator::generate(ast)?;
    for graph in program.graphs_mut() {
        flow::analyse(graph);
    }
    Ok(program)
}
