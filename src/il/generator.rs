//! Code generation: AST to basic blocks of three-address instructions.

use crate::{
    ast::{BinOp, Expr, Stmt},
    error::StructuralError,
};

use super::{
    block::{FlowGraph, Function, Program},
    tac::{BlockId, Instr, Name, Reg, Value},
};

/// Generate an (unanalysed) program from an AST.
pub fn generate(ast: &Stmt) -> Result<Program, StructuralError> {
    let mut funcs = Vec::new();
    let top = {
        let mut gen = Generator::new(&mut funcs, &[]);
        gen.gen_stmt(ast)?;
        gen.finish()
    };
    Ok(Program { top, funcs })
}

/// Walks the AST with a "current block" cursor, splitting blocks at
/// branches, loops and breaks. Function definitions recurse with a fresh
/// nested generator that appends to the shared function table.
struct Generator<'f> {
    funcs: &'f mut Vec<Function>,
    graph: FlowGraph,
    cur: BlockId,
    /// The single shared return block; all return paths jump here. Linked
    /// as the fallthrough tail of the chain by [`Self::finish`].
    ret_bb: BlockId,
    vreg_count: usize,
    break_targets: Vec<BlockId>,
}

impl<'f> Generator<'f> {
    fn new(funcs: &'f mut Vec<Function>, params: &[String]) -> Self {
        let mut graph = FlowGraph::default();
        let entry = graph.new_block();
        let ret_bb = graph.new_block();
        for param in params {
            graph
                .block_mut(entry)
                .in_regs
                .insert(Name::Var(param.clone()), Some(0));
        }
        Self {
            funcs,
            graph,
            cur: entry,
            ret_bb,
            vreg_count: 0,
            break_targets: Vec::new(),
        }
    }

    /// Link the shared return block as the end of the fallthrough chain and
    /// hand the finished graph back.
    fn finish(self) -> FlowGraph {
        let mut graph = self.graph;
        assert!(
            graph.block(self.cur).next_bb.is_none(),
            "generator finished mid-chain"
        );
        graph.block_mut(self.cur).next_bb = Some(self.ret_bb);
        graph
    }

    fn gen_stmt(&mut self, stmt: &Stmt) -> Result<(), StructuralError> {
        match stmt {
            Stmt::Block(stmts) => {
                for sub in stmts {
                    self.gen_stmt(sub)?;
                }
                Ok(())
            }
            Stmt::Expr(expr) => self.gen_expr(expr).map(|_| ()),
            Stmt::If(cond, then, els) => self.gen_if(cond, then, els.as_deref()),
            Stmt::While(cond, body) => self.gen_while(cond, body),
            Stmt::Break => self.gen_break(),
            Stmt::Return(value) => self.gen_return(value.as_ref()),
            Stmt::Defun(name, params, body) => self.gen_defun(name, params, body),
        }
    }

    fn gen_if(
        &mut self,
        cond: &Expr,
        then: &Stmt,
        els: Option<&Stmt>,
    ) -> Result<(), StructuralError> {
        let tbb = self.bb_split(self.cur);
        let fbb = self.bb_split(tbb);
        self.gen_cond_jmp(cond, false, fbb)?;
        self.set_curbb(tbb);
        self.gen_stmt(then)?;
        if let Some(els) = els {
            let nbb = self.bb_split(fbb);
            self.emit(Instr::Jmp(None, nbb));
            self.set_curbb(fbb);
            self.gen_stmt(els)?;
            self.set_curbb(nbb);
        } else {
            self.set_curbb(fbb);
        }
        Ok(())
    }

    fn gen_while(&mut self, cond: &Expr, body: &Stmt) -> Result<(), StructuralError> {
        let cond_bb = self.bb_split(self.cur);
        let body_bb = self.bb_split(cond_bb);
        let next_bb = self.bb_split(body_bb);

        self.emit(Instr::Jmp(None, cond_bb));
        self.set_curbb(cond_bb);
        self.gen_cond_jmp(cond, false, next_bb)?;

        self.set_curbb(body_bb);
        self.break_targets.push(next_bb);
        self.gen_stmt(body)?;
        self.break_targets.pop();
        self.emit(Instr::Jmp(None, cond_bb));

        self.set_curbb(next_bb);
        Ok(())
    }

    fn gen_break(&mut self) -> Result<(), StructuralError> {
        let target = *self
            .break_targets
            .last()
            .ok_or(StructuralError::BreakOutsideLoop)?;
        self.emit(Instr::Jmp(None, target));
        let cont = self.bb_split(self.cur);
        self.set_curbb(cont);
        Ok(())
    }

    fn gen_return(&mut self, value: Option<&Expr>) -> Result<(), StructuralError> {
        if let Some(value) = value {
            let value = self.gen_expr(value)?;
            self.emit(Instr::Result(value));
        }
        self.emit(Instr::Jmp(None, self.ret_bb));
        let cont = self.bb_split(self.cur);
        self.set_curbb(cont);
        Ok(())
    }

    fn gen_defun(
        &mut self,
        name: &str,
        params: &[String],
        body: &Stmt,
    ) -> Result<(), StructuralError> {
        let graph = {
            let mut sub = Generator::new(&mut *self.funcs, params);
            sub.gen_stmt(body)?;
            sub.finish()
        };
        let index = self.funcs.len();
        self.funcs.push(Function {
            params: params.to_vec(),
            graph,
        });
        self.emit(Instr::Defun(name.to_string(), index));
        Ok(())
    }

    /// Emit a comparison and a jump taken when the condition evaluates to
    /// `tf`; jumping to the false branch uses the flipped comparator.
    fn gen_cond_jmp(
        &mut self,
        cond: &Expr,
        tf: bool,
        target: BlockId,
    ) -> Result<(), StructuralError> {
        match cond {
            Expr::Cmp(op, lhs, rhs) => {
                let op = if tf { *op } else { op.flip() };
                let lhs = self.gen_expr(lhs)?;
                let rhs = self.gen_expr(rhs)?;
                self.emit(Instr::Cmp(lhs, rhs));
                self.emit(Instr::Jmp(Some(op), target));
                Ok(())
            }
            _ => Err(StructuralError::InvalidCondition),
        }
    }

    fn gen_expr(&mut self, expr: &Expr) -> Result<Value, StructuralError> {
        match expr {
            Expr::Int(value) => Ok(Value::Const(*value)),
            Expr::Var(name) => Ok(Value::Reg(Reg::var(name))),
            Expr::Assign(name, value) => {
                let src = self.gen_expr(value)?;
                let dst = Reg::var(name);
                self.emit(Instr::Mov(dst.clone(), src));
                Ok(Value::Reg(dst))
            }
            Expr::Bin(op, lhs, rhs) => {
                let lhs = self.gen_expr(lhs)?;
                let rhs = self.gen_expr(rhs)?;
                let dst = self.new_vreg();
                self.emit(Instr::Bin(*op, dst.clone(), lhs, rhs));
                Ok(Value::Reg(dst))
            }
            // Negation is rewritten as `0 - x`.
            Expr::Neg(operand) => {
                let operand = self.gen_expr(operand)?;
                let dst = self.new_vreg();
                self.emit(Instr::Bin(BinOp::Sub, dst.clone(), Value::Const(0), operand));
                Ok(Value::Reg(dst))
            }
            Expr::Cmp(op, _, _) => Err(StructuralError::ComparisonAsValue(op.to_string())),
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|arg| self.gen_expr(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                let dst = self.new_vreg();
                self.emit(Instr::Call(Some(dst.clone()), name.clone(), args));
                Ok(Value::Reg(dst))
            }
        }
    }

    fn new_vreg(&mut self) -> Reg {
        self.vreg_count += 1;
        Reg::temp(self.vreg_count)
    }

    /// Allocate a block and splice it into the fallthrough chain right
    /// after `bb`.
    fn bb_split(&mut self, bb: BlockId) -> BlockId {
        let new = self.graph.new_block();
        self.graph.block_mut(new).next_bb = self.graph.block(bb).next_bb;
        self.graph.block_mut(bb).next_bb = Some(new);
        new
    }

    fn set_curbb(&mut self, bb: BlockId) {
        self.cur = bb;
    }

    fn emit(&mut self, instr: Instr) {
        self.graph.block_mut(self.cur).push(instr);
    }
}
