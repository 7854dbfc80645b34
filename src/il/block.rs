//! Basic blocks and the per-function block arena.

use std::fmt::{self, Display, Formatter};

use crate::ext::ordered_map::OrderedMap;

use super::tac::{BlockId, Instr, Name};

/// Per-block register map: name to SSA generation. Generations are `None`
/// until SSA renaming runs. Insertion-ordered so that generation numbering
/// and phi emission are deterministic.
pub type RegMap = OrderedMap<Name, Option<usize>>;

/// A maximal straight-line run of instructions with one entry and explicit
/// exit edges.
///
/// Blocks live in a [`FlowGraph`] arena and refer to each other by index,
/// so optimiser passes can mutate one block while holding indices into
/// others. Unreachable blocks are marked dead rather than removed, keeping
/// every index stable.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub index: BlockId,
    pub irs: Vec<Instr>,
    /// Fallthrough successor, set when this block was split from another.
    pub next_bb: Option<BlockId>,
    /// Successor blocks, computed by flow analysis.
    pub to_bbs: Vec<BlockId>,
    /// Predecessor blocks, computed by flow analysis.
    pub from_bbs: Vec<BlockId>,
    /// Live-in variables, mapped to their entry generation.
    pub in_regs: RegMap,
    /// Live-out variables, mapped to their exit generation.
    pub out_regs: RegMap,
    /// Variables written locally.
    pub assigned_regs: RegMap,
    pub reachable: bool,
}

impl BasicBlock {
    pub fn new(index: BlockId) -> Self {
        Self {
            index,
            irs: Vec::new(),
            next_bb: None,
            to_bbs: Vec::new(),
            from_bbs: Vec::new(),
            in_regs: RegMap::new(),
            out_regs: RegMap::new(),
            assigned_regs: RegMap::new(),
            reachable: true,
        }
    }

    pub fn push(&mut self, instr: Instr) {
        self.irs.push(instr);
    }

    /// Exit edges per the block invariant: the fallthrough successor unless
    /// the last instruction is an unconditional jump, plus the target of a
    /// trailing jump.
    pub fn compute_exits(&mut self) {
        let mut to_bbs = Vec::new();
        if let Some(next) = self.next_bb {
            to_bbs.push(next);
        }
        if let Some(Instr::Jmp(cond, target)) = self.irs.last() {
            if cond.is_none() {
                to_bbs.clear();
            }
            to_bbs.push(*target);
        }
        self.to_bbs = to_bbs;
    }

    /// Insert an instruction just before the trailing jump, or at the end
    /// if the block does not end in one.
    pub fn insert_before_jmp(&mut self, instr: Instr) {
        let mut pos = self.irs.len();
        if matches!(self.irs.last(), Some(Instr::Jmp(_, _))) {
            pos -= 1;
        }
        self.irs.insert(pos, instr);
    }

    /// Compact logically deleted instructions out of the block.
    pub fn trim(&mut self) {
        self.irs.retain(|ir| !ir.is_nop());
    }
}

impl Display for BasicBlock {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "### BB {}: to={:?}, from={:?}, in={}, out={}",
            self.index,
            self.to_bbs,
            self.from_bbs,
            fmt_regs(&self.in_regs),
            fmt_regs(&self.out_regs),
        )?;
        if !self.reachable {
            write!(f, " (unreachable)")?;
        }
        for ir in &self.irs {
            write!(f, "\n  {}", ir)?;
        }
        Ok(())
    }
}

fn fmt_regs(regs: &RegMap) -> String {
    let entries: Vec<_> = regs
        .iter()
        .map(|(name, gen)| match gen {
            Some(gen) => format!("{}:{}", name, gen),
            None => name.to_string(),
        })
        .collect();
    format!("{{{}}}", entries.join(", "))
}

/// The control-flow graph of one function body: an arena of basic blocks
/// addressed by stable index. Block 0 is the entry.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    pub blocks: Vec<BasicBlock>,
}

impl FlowGraph {
    pub fn new_block(&mut self) -> BlockId {
        let index = self.blocks.len();
        self.blocks.push(BasicBlock::new(index));
        index
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id]
    }

    /// Indices of reachable blocks, in index order.
    pub fn reachable_ids(&self) -> Vec<BlockId> {
        self.blocks
            .iter()
            .filter(|bb| bb.reachable)
            .map(|bb| bb.index)
            .collect()
    }
}

impl Display for FlowGraph {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        for bb in self.blocks.iter().filter(|bb| bb.reachable) {
            writeln!(f, "{}", bb)?;
        }
        Ok(())
    }
}

/// A compiled user function: its parameter list plus its block graph.
#[derive(Debug, Clone)]
pub struct Function {
    pub params: Vec<String>,
    pub graph: FlowGraph,
}

impl Function {
    /// The registers the VM binds the arguments to: one generation-0
    /// register per declared parameter.
    pub fn param_regs(&self) -> Vec<super::tac::Reg> {
        self.params
            .iter()
            .map(|p| {
                let name = Name::Var(p.clone());
                let gen = self.graph.block(0).in_regs.get(&name).copied().flatten();
                super::tac::Reg { name, gen }
            })
            .collect()
    }
}

/// A whole compiled program: the top-level graph plus the function table
/// populated by nested generators and referenced by `DEFUN` instructions.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub top: FlowGraph,
    pub funcs: Vec<Function>,
}

impl Program {
    pub fn graphs_mut(&mut self) -> impl Iterator<Item = &mut FlowGraph> {
        std::iter::once(&mut self.top).chain(self.funcs.iter_mut().map(|f| &mut f.graph))
    }
}

impl Display for Program {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "function main")?;
        write!(f, "{}", self.top)?;
        for (index, func) in self.funcs.iter().enumerate() {
            writeln!(f, "function #{}({})", index, func.params.join(", "))?;
            write!(f, "{}", func.graph)?;
        }
        Ok(())
    }
}
