//! A register interpreter for analysed IL.
//!
//! Executes one flow graph at a time, with a frame stack for user function
//! calls. Registers live in a per-frame map keyed by SSA name, the
//! comparison flag holds the last CMP's signed difference, and function
//! bindings are looked up by name at call time, so a DEFUN only has to
//! execute before the first call, not before the callee's own lowering.
//!
//! Phi functions are not executable; run graphs through the optimiser (or
//! keep them merge-free) first.

use std::collections::HashMap;
use std::mem;

use log::trace;

use crate::error::RuntimeError;
use crate::il::{BlockId, FuncId, Instr, Program, Reg, Value};

pub type NativeFn = Box<dyn Fn(&[i64]) -> Option<i64>>;

enum Binding {
    Native(NativeFn),
    Func(FuncId),
}

/// The function namespace. Natives are registered up front by the host;
/// user functions are bound as their DEFUN instructions execute, and a
/// later DEFUN with the same name shadows the earlier one.
#[derive(Default)]
pub struct Env {
    bindings: HashMap<String, Binding>,
}

impl Env {
    fn lookup(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    fn define(&mut self, name: String, func: FuncId) {
        self.bindings.insert(name, Binding::Func(func));
    }

    fn register_native(&mut self, name: &str, f: NativeFn) {
        self.bindings.insert(name.to_string(), Binding::Native(f));
    }
}

struct Frame {
    func: Option<FuncId>,
    bb: BlockId,
    ip: usize,
    regs: HashMap<Reg, i64>,
    dst: Option<Reg>,
    result: Option<i64>,
}

pub struct Vm<'p> {
    program: &'p Program,
    env: Env,
    regs: HashMap<Reg, i64>,
    /// Signed difference left behind by the last CMP.
    flag: i64,
    frames: Vec<Frame>,
    /// `None` while executing the top-level graph.
    cur_func: Option<FuncId>,
    bb: BlockId,
    ip: usize,
    result: Option<i64>,
}

impl<'p> Vm<'p> {
    pub fn new(program: &'p Program) -> Self {
        Vm {
            program,
            env: Env::default(),
            regs: HashMap::new(),
            flag: 0,
            frames: Vec::new(),
            cur_func: None,
            bb: 0,
            ip: 0,
            result: None,
        }
    }

    pub fn register_native(&mut self, name: &str, f: NativeFn) {
        self.env.register_native(name, f);
    }

    /// Run to completion and return the top-level RESULT, if any.
    pub fn run(&mut self) -> Result<Option<i64>, RuntimeError> {
        let program = self.program;
        loop {
            let graph = match self.cur_func {
                None => &program.top,
                Some(func) => &program.funcs[func].graph,
            };
            let bb = graph.block(self.bb);
            if self.ip >= bb.irs.len() {
                match bb.next_bb {
                    Some(next) => {
                        self.bb = next;
                        self.ip = 0;
                    }
                    None => {
                        if !self.pop_frame() {
                            return Ok(self.result.take());
                        }
                    }
                }
                continue;
            }
            let ir = &bb.irs[self.ip];
            self.ip += 1;
            trace!("bb{}: {}", bb.index, ir);
            match ir {
                Instr::Nop => {}
                Instr::Mov(dst, src) => {
                    let value = self.value(src);
                    self.regs.insert(dst.clone(), value);
                }
                Instr::Bin(op, dst, lhs, rhs) => {
                    let lhs = self.value(lhs);
                    let rhs = self.value(rhs);
                    let value = op.apply(lhs, rhs).ok_or(RuntimeError::DivisionByZero)?;
                    self.regs.insert(dst.clone(), value);
                }
                Instr::Cmp(lhs, rhs) => {
                    self.flag = self.value(lhs).wrapping_sub(self.value(rhs));
                }
                Instr::Jmp(cond, target) => {
                    let taken = match cond {
                        Some(cond) => cond.holds(self.flag),
                        None => true,
                    };
                    if taken {
                        self.bb = *target;
                        self.ip = 0;
                    }
                }
                Instr::Result(value) => {
                    self.result = Some(self.value(value));
                }
                Instr::Call(dst, name, args) => self.call(dst, name, args)?,
                Instr::Defun(name, func) => self.env.define(name.clone(), *func),
                Instr::Phi(dst, _) => panic!("phi {} reached the interpreter", dst),
            }
        }
    }

    fn value(&self, value: &Value) -> i64 {
        match value {
            Value::Const(n) => *n,
            Value::Reg(reg) => match self.regs.get(reg) {
                Some(n) => *n,
                None => panic!("read of unbound register {}", reg),
            },
        }
    }

    fn call(
        &mut self,
        dst: &Option<Reg>,
        name: &str,
        args: &[Value],
    ) -> Result<(), RuntimeError> {
        let values: Vec<i64> = args.iter().map(|a| self.value(a)).collect();
        match self.env.lookup(name) {
            None => Err(RuntimeError::UndefinedFunction(name.to_string())),
            Some(Binding::Native(f)) => {
                let ret = f(&values);
                if let (Some(dst), Some(ret)) = (dst, ret) {
                    self.regs.insert(dst.clone(), ret);
                }
                Ok(())
            }
            Some(Binding::Func(func)) => {
                let func = *func;
                self.frames.push(Frame {
                    func: self.cur_func,
                    bb: self.bb,
                    ip: self.ip,
                    regs: mem::take(&mut self.regs),
                    dst: dst.clone(),
                    result: self.result.take(),
                });
                self.cur_func = Some(func);
                self.bb = 0;
                self.ip = 0;
                let params = self.program.funcs[func].param_regs();
                for (reg, value) in params.into_iter().zip(values) {
                    self.regs.insert(reg, value);
                }
                Ok(())
            }
        }
    }

    /// Return to the caller's frame, binding its destination register if
    /// the callee produced a result. Returns false at the bottom of the
    /// stack.
    fn pop_frame(&mut self) -> bool {
        let frame = match self.frames.pop() {
            Some(frame) => frame,
            None => return false,
        };
        let ret = self.result.take();
        self.cur_func = frame.func;
        self.bb = frame.bb;
        self.ip = frame.ip;
        self.regs = frame.regs;
        self.result = frame.result;
        if let (Some(dst), Some(ret)) = (frame.dst, ret) {
            self.regs.insert(dst, ret);
        }
        true
    }
}
