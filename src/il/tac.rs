//! Three-address instructions and the values they operate on.

use std::fmt::{self, Display, Formatter};

use crate::ast::{BinOp, CmpOp};

/// Index of a basic block within its function's arena.
pub type BlockId = usize;

/// Index of a compiled function in the program's function table.
pub type FuncId = usize;

/// A symbolic register name: a source variable or a generated temporary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Name {
    Var(String),
    Temp(usize),
}

impl Display for Name {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Var(name) => write!(f, "{}", name),
            Self::Temp(index) => write!(f, "~{}", index),
        }
    }
}

/// A virtual register: one SSA generation of a name.
///
/// The generator emits registers without a generation; SSA renaming fills
/// them in. Each `(name, generation)` pair is written by exactly one
/// instruction until phi resolution lowers phis back into moves.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reg {
    pub name: Name,
    pub gen: Option<usize>,
}

impl Reg {
    pub fn var(name: &str) -> Self {
        Self {
            name: Name::Var(name.to_string()),
            gen: None,
        }
    }

    pub fn temp(index: usize) -> Self {
        Self {
            name: Name::Temp(index),
            gen: None,
        }
    }

    pub fn with_gen(name: Name, gen: usize) -> Self {
        Self {
            name,
            gen: Some(gen),
        }
    }
}

impl Display for Reg {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.gen {
            Some(gen) => write!(f, "%{}:{}", self.name, gen),
            None => write!(f, "%{}", self.name),
        }
    }
}

/// An operand: an inlined constant or a virtual register.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Const(i64),
    Reg(Reg),
}

impl Value {
    pub fn as_reg(&self) -> Option<&Reg> {
        match self {
            Self::Reg(reg) => Some(reg),
            Self::Const(_) => None,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Self::Const(_))
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Const(value) => write!(f, "{}", value),
            Self::Reg(reg) => write!(f, "{}", reg),
        }
    }
}

impl From<Reg> for Value {
    fn from(reg: Reg) -> Self {
        Self::Reg(reg)
    }
}

/// A single three-address instruction.
///
/// Optimiser passes mutate instructions in place and delete them by clearing
/// to [`Instr::Nop`]; the trim pass compacts the nops away at the end.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    /// Deleted or not-yet-filled slot.
    Nop,
    /// Copy a value into a register.
    Mov(Reg, Value),
    /// Binary arithmetic: ADD, SUB, MUL, DIV, MOD.
    Bin(BinOp, Reg, Value, Value),
    /// Set the comparison flag to `lhs - rhs`.
    Cmp(Value, Value),
    /// Jump to a block, unconditionally or if the flag satisfies the
    /// comparator.
    Jmp(Option<CmpOp>, BlockId),
    /// Store the frame's pending return value.
    Result(Value),
    /// Call a function by name. The destination is dropped (but the call
    /// kept) when the result is never read.
    Call(Option<Reg>, String, Vec<Value>),
    /// Register a compiled function in the global environment.
    Defun(String, FuncId),
    /// Merge-point pseudo-instruction: one incoming value per predecessor,
    /// in predecessor-list order.
    Phi(Reg, Vec<Value>),
}

impl Instr {
    /// All operand slots read by this instruction, including call arguments
    /// and phi incoming values.
    pub fn operands(&self) -> Vec<&Value> {
        match self {
            Self::Nop | Self::Jmp(_, _) | Self::Defun(_, _) => vec![],
            Self::Mov(_, src) => vec![src],
            Self::Bin(_, _, lhs, rhs) => vec![lhs, rhs],
            Self::Cmp(lhs, rhs) => vec![lhs, rhs],
            Self::Result(value) => vec![value],
            Self::Call(_, _, args) => args.iter().collect(),
            Self::Phi(_, incoming) => incoming.iter().collect(),
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut Value> {
        match self {
            Self::Nop | Self::Jmp(_, _) | Self::Defun(_, _) => vec![],
            Self::Mov(_, src) => vec![src],
            Self::Bin(_, _, lhs, rhs) => vec![lhs, rhs],
            Self::Cmp(lhs, rhs) => vec![lhs, rhs],
            Self::Result(value) => vec![value],
            Self::Call(_, _, args) => args.iter_mut().collect(),
            Self::Phi(_, incoming) => incoming.iter_mut().collect(),
        }
    }

    /// The register this instruction writes, if any.
    pub fn dest(&self) -> Option<&Reg> {
        match self {
            Self::Mov(dst, _) | Self::Bin(_, dst, _, _) | Self::Phi(dst, _) => Some(dst),
            Self::Call(dst, _, _) => dst.as_ref(),
            _ => None,
        }
    }

    pub fn dest_mut(&mut self) -> Option<&mut Reg> {
        match self {
            Self::Mov(dst, _) | Self::Bin(_, dst, _, _) | Self::Phi(dst, _) => Some(dst),
            Self::Call(dst, _, _) => dst.as_mut(),
            _ => None,
        }
    }

    /// Logically delete this instruction.
    pub fn clear(&mut self) {
        *self = Self::Nop;
    }

    pub fn is_nop(&self) -> bool {
        matches!(self, Self::Nop)
    }

    /// Whether the last instruction of a block transfers control
    /// unconditionally, cutting off the fallthrough edge.
    pub fn is_unconditional_jmp(&self) -> bool {
        matches!(self, Self::Jmp(None, _))
    }

    pub fn as_phi(&self) -> Option<(&Reg, &Vec<Value>)> {
        match self {
            Self::Phi(dst, incoming) => Some((dst, incoming)),
            _ => None,
        }
    }
}

impl Display for Instr {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Nop => f.write_str("NOP"),
            Self::Mov(dst, src) => write!(f, "MOV  {}, {}", dst, src),
            Self::Bin(op, dst, lhs, rhs) => write!(f, "{}  {}, {}, {}", op, dst, lhs, rhs),
            Self::Cmp(lhs, rhs) => write!(f, "CMP  {}, {}", lhs, rhs),
            Self::Jmp(None, target) => write!(f, "JMP  bb{}", target),
            Self::Jmp(Some(cond), target) => write!(f, "J{}  bb{}", cond, target),
            Self::Result(value) => write!(f, "RESULT  {}", value),
            Self::Call(Some(dst), name, args) => {
                write!(f, "CALL  {}, {}({})", dst, name, join(args))
            }
            Self::Call(None, name, args) => write!(f, "CALL  {}({})", name, join(args)),
            Self::Defun(name, index) => write!(f, "DEFUN  {}, #{}", name, index),
            Self::Phi(dst, incoming) => write!(f, "PHI  {} <= [{}]", dst, join(incoming)),
        }
    }
}

fn join(values: &[Value]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_display_with_and_without_generation() {
        assert_eq!(Reg::var("acc").to_string(), "%acc");
        assert_eq!(Reg::with_gen(Name::Var("acc".into()), 2).to_string(), "%acc:2");
        assert_eq!(Reg::temp(1).to_string(), "%~1");
    }

    #[test]
    fn instructions_display_in_dump_format() {
        let mov = Instr::Mov(Reg::var("a"), Value::Const(10));
        assert_eq!(mov.to_string(), "MOV  %a, 10");

        let add = Instr::Bin(
            BinOp::Add,
            Reg::temp(1),
            Value::Reg(Reg::var("a")),
            Value::Const(1),
        );
        assert_eq!(add.to_string(), "ADD  %~1, %a, 1");

        assert_eq!(Instr::Jmp(None, 2).to_string(), "JMP  bb2");
        assert_eq!(Instr::Jmp(Some(CmpOp::Le), 4).to_string(), "J<=  bb4");

        let phi = Instr::Phi(
            Reg::with_gen(Name::Var("x".into()), 2),
            vec![
                Value::Reg(Reg::with_gen(Name::Var("x".into()), 0)),
                Value::Reg(Reg::with_gen(Name::Var("x".into()), 1)),
            ],
        );
        assert_eq!(phi.to_string(), "PHI  %x:2 <= [%x:0, %x:1]");
    }

    #[test]
    fn dest_covers_every_writing_instruction() {
        let call = Instr::Call(Some(Reg::temp(1)), "f".into(), vec![]);
        assert_eq!(call.dest(), Some(&Reg::temp(1)));

        let dropped = Instr::Call(None, "f".into(), vec![]);
        assert_eq!(dropped.dest(), None);

        assert_eq!(Instr::Cmp(Value::Const(1), Value::Const(2)).dest(), None);
    }
}
