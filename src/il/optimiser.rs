//! Optimisation passes over an analysed flow graph.
//!
//! The passes run once, in a fixed order: phi minimisation, constant
//! propagation with folding and common subexpression elimination, dead
//! code elimination, phi resolution, and a final trim that drops the NOPs
//! the earlier passes left behind. Instructions are never removed
//! mid-pass; they are overwritten with NOP so that block-relative
//! positions stay stable until the trim.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::ast::BinOp;

use super::{
    block::FlowGraph,
    tac::{BlockId, Instr, Name, Reg, Value},
};

pub fn optimise(graph: &mut FlowGraph, params: &[String]) {
    Optimiser::new().run(graph, params);
}

struct Optimiser {
    /// Registers whose single definition has been folded away, mapped to
    /// the value that replaces them. Chains are possible and are followed
    /// by [`Self::resolve`].
    aliases: HashMap<Reg, Value>,
}

impl Optimiser {
    fn new() -> Self {
        Optimiser {
            aliases: HashMap::new(),
        }
    }

    fn run(&mut self, graph: &mut FlowGraph, params: &[String]) {
        self.minimise_phis(graph);
        self.propagate_consts(graph);
        self.eliminate_dead(graph);
        let bound = entry_bound_regs(graph, params);
        self.resolve_phis(graph, &bound);
        for bb in &mut graph.blocks {
            bb.trim();
        }
    }

    /// Follow alias chains until hitting a constant or an unaliased
    /// register.
    fn resolve(&self, mut value: Value) -> Value {
        while let Value::Reg(reg) = &value {
            match self.aliases.get(reg) {
                Some(next) => value = next.clone(),
                None => break,
            }
        }
        value
    }

    /// Collapse phi functions whose incoming values, once resolved and
    /// with self-references dropped, are all the same. Collapsing one phi
    /// can expose another, so this iterates to a fixpoint.
    fn minimise_phis(&mut self, graph: &mut FlowGraph) {
        loop {
            let mut changed = false;
            for id in graph.reachable_ids() {
                for i in 0..graph.block(id).irs.len() {
                    let (dst, incoming) = match graph.block(id).irs[i].as_phi() {
                        Some((dst, incoming)) => (dst.clone(), incoming.clone()),
                        None => continue,
                    };
                    let mut distinct: Vec<Value> = Vec::new();
                    for value in incoming {
                        let value = self.resolve(value);
                        if value == Value::Reg(dst.clone()) {
                            continue;
                        }
                        if !distinct.contains(&value) {
                            distinct.push(value);
                        }
                    }
                    if let [replacement] = &distinct[..] {
                        debug!("bb{}: collapsing redundant phi {}", id, dst);
                        self.aliases.insert(dst, replacement.clone());
                        graph.block_mut(id).irs[i].clear();
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Substitute known values into every operand, fold constant binary
    /// operations, and deduplicate repeated computations. A definition is
    /// only folded away when it is the register's sole write; registers
    /// written more than once (phi resolution produces those) keep their
    /// instructions, which makes a second run of the optimiser a no-op.
    fn propagate_consts(&mut self, graph: &mut FlowGraph) {
        let mut def_counts: HashMap<Reg, usize> = HashMap::new();
        for id in graph.reachable_ids() {
            for ir in &graph.block(id).irs {
                if let Some(dst) = ir.dest() {
                    *def_counts.entry(dst.clone()).or_insert(0) += 1;
                }
            }
        }

        // One computed-expression table per block. A block with a single
        // predecessor extends that predecessor's table, since the
        // predecessor lies on every path to it; merge blocks and the
        // entry start from scratch. Sibling branches therefore never see
        // each other's computations.
        let mut tables: HashMap<BlockId, HashMap<(BinOp, Value, Value), Reg>> = HashMap::new();
        for id in graph.reachable_ids() {
            let mut seen = match graph.block(id).from_bbs.as_slice() {
                &[pred] => tables.get(&pred).cloned().unwrap_or_default(),
                _ => HashMap::new(),
            };
            for i in 0..graph.block(id).irs.len() {
                let ir = &mut graph.block_mut(id).irs[i];
                for value in ir.operands_mut() {
                    *value = self.resolve(value.clone());
                }
                match ir {
                    Instr::Mov(dst, value @ Value::Const(_)) => {
                        if def_counts[dst] == 1 {
                            self.aliases.insert(dst.clone(), value.clone());
                            ir.clear();
                        }
                    }
                    Instr::Bin(op, dst, Value::Const(lhs), Value::Const(rhs)) => {
                        // A zero divisor stays in place and traps at
                        // runtime, if the block ever executes.
                        if let Some(folded) = op.apply(*lhs, *rhs) {
                            if def_counts[dst] == 1 {
                                self.aliases.insert(dst.clone(), Value::Const(folded));
                                ir.clear();
                            }
                        }
                    }
                    Instr::Bin(op, dst, lhs, rhs) => {
                        let key = cse_key(*op, lhs.clone(), rhs.clone());
                        match seen.get(&key) {
                            Some(prev) if def_counts[dst] == 1 => {
                                debug!("bb{}: reusing {} for {}", id, prev, dst);
                                self.aliases.insert(dst.clone(), Value::Reg(prev.clone()));
                                ir.clear();
                            }
                            Some(_) => {}
                            None => {
                                seen.insert(key, dst.clone());
                            }
                        }
                    }
                    _ => {}
                }
            }
            tables.insert(id, seen);
        }
    }

    /// Blank out definitions nobody reads. A register counts as read if it
    /// appears as an operand, sits in a block's entry or exit map, or is
    /// the target of an alias. Calls with an unread result keep running
    /// for their side effects, with the destination dropped.
    fn eliminate_dead(&mut self, graph: &mut FlowGraph) {
        loop {
            let mut used: HashSet<Reg> = HashSet::new();
            for id in graph.reachable_ids() {
                let bb = graph.block(id);
                for ir in &bb.irs {
                    for value in ir.operands() {
                        if let Value::Reg(reg) = value {
                            used.insert(reg.clone());
                        }
                    }
                }
                for (name, gen) in bb.in_regs.iter().chain(bb.out_regs.iter()) {
                    if let Some(gen) = gen {
                        used.insert(Reg::with_gen(name.clone(), *gen));
                    }
                }
            }
            for value in self.aliases.values() {
                if let Value::Reg(reg) = value {
                    used.insert(reg.clone());
                }
            }

            let mut changed = false;
            for id in graph.reachable_ids() {
                for i in 0..graph.block(id).irs.len() {
                    let ir = &mut graph.block_mut(id).irs[i];
                    let dst = match ir.dest() {
                        Some(dst) if !used.contains(dst) => dst.clone(),
                        _ => continue,
                    };
                    debug!("bb{}: removing dead definition of {}", id, dst);
                    if let Instr::Call(call_dst, _, _) = ir {
                        *call_dst = None;
                    } else {
                        ir.clear();
                    }
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Replace the remaining phi functions with per-edge assignments in
    /// the predecessors. Where the incoming register's defining
    /// instruction sits in the predecessor and the register has no other
    /// reader, the definition is retargeted at the phi destination
    /// instead of inserting a copy.
    fn resolve_phis(&mut self, graph: &mut FlowGraph, bound: &HashSet<Reg>) {
        let mut defined: HashSet<Reg> = HashSet::new();
        for id in graph.reachable_ids() {
            for ir in &graph.block(id).irs {
                if let Some(dst) = ir.dest() {
                    defined.insert(dst.clone());
                }
            }
        }
        for id in graph.reachable_ids() {
            let preds = graph.block(id).from_bbs.clone();
            let phis: Vec<(usize, Reg, Vec<Value>)> = graph
                .block(id)
                .irs
                .iter()
                .enumerate()
                .filter_map(|(i, ir)| {
                    ir.as_phi()
                        .map(|(dst, incoming)| (i, dst.clone(), incoming.clone()))
                })
                .collect();
            for (slot, dst, incoming) in phis {
                graph.block_mut(id).irs[slot].clear();
                for (value, &pred) in incoming.into_iter().zip(&preds) {
                    let value = self.resolve(value);
                    if value == Value::Reg(dst.clone()) {
                        continue;
                    }
                    match value.as_reg() {
                        Some(src) if self.can_retarget(graph, pred, src) => {
                            self.retarget(graph, pred, src.clone(), dst.clone());
                        }
                        // No instruction writes the register and no
                        // caller binds it: the variable is undefined on
                        // this edge, and the phi destination is only
                        // read after a defining edge has run. A copy
                        // here would read an unbound register.
                        Some(src) if !defined.contains(src) && !bound.contains(src) => {
                            debug!("bb{}: dropping undefined {} on edge from bb{}", id, src, pred);
                        }
                        _ => {
                            graph
                                .block_mut(pred)
                                .insert_before_jmp(Instr::Mov(dst.clone(), value));
                            let gen = dst.gen;
                            graph.block_mut(pred).out_regs.insert(dst.name.clone(), gen);
                        }
                    }
                }
            }
        }
    }

    /// An incoming value can absorb the phi destination when it is
    /// defined in the predecessor itself and nothing else observes it:
    /// no operand anywhere reads it, no alias points at it, and no block
    /// map mentions it apart from the predecessor's own exit entry.
    fn can_retarget(&self, graph: &FlowGraph, pred: usize, src: &Reg) -> bool {
        let defined_here = graph
            .block(pred)
            .irs
            .iter()
            .any(|ir| ir.dest() == Some(src));
        if !defined_here {
            return false;
        }
        if self
            .aliases
            .values()
            .any(|v| v.as_reg() == Some(src))
        {
            return false;
        }
        for id in graph.reachable_ids() {
            let bb = graph.block(id);
            for ir in &bb.irs {
                if ir.operands().into_iter().any(|v| v.as_reg() == Some(src)) {
                    return false;
                }
            }
            if bb.in_regs.get(&src.name).copied().flatten() == src.gen {
                return false;
            }
            if id != pred && bb.out_regs.get(&src.name).copied().flatten() == src.gen {
                return false;
            }
        }
        true
    }

    fn retarget(&mut self, graph: &mut FlowGraph, pred: usize, src: Reg, dst: Reg) {
        debug!("bb{}: retargeting {} at {}", pred, src, dst);
        let gen = dst.gen;
        let bb = graph.block_mut(pred);
        for ir in bb.irs.iter_mut() {
            if let Some(d) = ir.dest_mut() {
                if *d == src {
                    *d = dst.clone();
                }
            }
        }
        bb.out_regs.insert(dst.name, gen);
    }
}

/// Registers bound by the caller rather than by an instruction: the
/// generation-0 entry register of each declared parameter.
fn entry_bound_regs(graph: &FlowGraph, params: &[String]) -> HashSet<Reg> {
    params
        .iter()
        .map(|p| {
            let name = Name::Var(p.clone());
            let gen = graph.block(0).in_regs.get(&name).copied().flatten();
            Reg { name, gen }
        })
        .collect()
}

/// CSE lookup key. Commutative operations are stored with their operands
/// in a canonical order (registers before constants) so that `a + 1` and
/// `1 + a` collide.
fn cse_key(op: BinOp, lhs: Value, rhs: Value) -> (BinOp, Value, Value) {
    let commutative = matches!(op, BinOp::Add | BinOp::Mul);
    if !commutative {
        return (op, lhs, rhs);
    }
    let swap = match (&lhs, &rhs) {
        (Value::Const(_), Value::Reg(_)) => true,
        _ => lhs > rhs,
    };
    if swap {
        (op, rhs, lhs)
    } else {
        (op, lhs, rhs)
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::{BinOp, CmpOp, Expr, Stmt};
    use crate::il::{flow::analyse, generator::generate};

    use super::*;

    fn optimised_top(ast: &Stmt) -> FlowGraph {
        let mut program = generate(ast).unwrap();
        analyse(&mut program.top);
        optimise(&mut program.top, &[]);
        program.top
    }

    fn block_strings(graph: &FlowGraph, id: usize) -> Vec<String> {
        graph
            .block(id)
            .irs
            .iter()
            .map(|ir| ir.to_string())
            .collect()
    }

    macro_rules! assert_optimises {
        ($ast:expr, $block:expr, $expected:expr) => {
            let graph = optimised_top(&$ast);
            let actual = block_strings(&graph, $block);
            assert_eq!(actual, $expected as &[&str]);
        };
    }

    #[test]
    fn straight_line_code_folds_to_a_result() {
        let ast = Stmt::block(vec![
            Stmt::expr(Expr::assign("a", Expr::int(1))),
            Stmt::expr(Expr::assign("b", Expr::int(22))),
            Stmt::ret(Expr::bin(BinOp::Add, Expr::var("a"), Expr::var("b"))),
        ]);
        assert_optimises!(ast, 0, &["RESULT  23", "JMP  bb1"]);
    }

    #[test]
    fn repeated_subexpressions_are_computed_once() {
        // b + c, computed twice with the operands swapped the second
        // time; the second temporary reuses the first.
        let ast = Stmt::block(vec![
            Stmt::expr(Expr::assign("b", Expr::call("read", vec![]))),
            Stmt::expr(Expr::assign("c", Expr::call("read", vec![]))),
            Stmt::expr(Expr::assign(
                "x",
                Expr::bin(BinOp::Add, Expr::var("b"), Expr::var("c")),
            )),
            Stmt::expr(Expr::assign(
                "y",
                Expr::bin(BinOp::Add, Expr::var("c"), Expr::var("b")),
            )),
            Stmt::ret(Expr::bin(BinOp::Mul, Expr::var("x"), Expr::var("y"))),
        ]);
        assert_optimises!(
            ast,
            0,
            &[
                "CALL  %~1:0, read()",
                "MOV  %b:0, %~1:0",
                "CALL  %~2:0, read()",
                "MOV  %c:0, %~2:0",
                "ADD  %~3:0, %b:0, %c:0",
                "MOV  %x:0, %~3:0",
                "MOV  %y:0, %~3:0",
                "MUL  %~5:0, %x:0, %y:0",
                "RESULT  %~5:0",
                "JMP  bb1"
            ]
        );
    }

    #[test]
    fn division_by_constant_zero_is_left_for_runtime() {
        let ast = Stmt::block(vec![
            Stmt::expr(Expr::assign(
                "x",
                Expr::bin(BinOp::Div, Expr::int(5), Expr::int(0)),
            )),
            Stmt::ret(Expr::var("x")),
        ]);
        assert_optimises!(
            ast,
            0,
            &[
                "DIV  %~1:0, 5, 0",
                "MOV  %x:0, %~1:0",
                "RESULT  %x:0",
                "JMP  bb1"
            ]
        );
    }

    #[test]
    fn unread_definitions_disappear() {
        let ast = Stmt::block(vec![
            Stmt::expr(Expr::assign("unused", Expr::call("read", vec![]))),
            Stmt::ret(Expr::int(7)),
        ]);
        // The call itself survives for its side effects.
        assert_optimises!(ast, 0, &["CALL  read()", "RESULT  7", "JMP  bb1"]);
    }

    #[test]
    fn loop_phis_become_edge_assignments() {
        let ast = Stmt::block(vec![
            Stmt::expr(Expr::assign("acc", Expr::int(0))),
            Stmt::expr(Expr::assign("i", Expr::int(1))),
            Stmt::while_(
                Expr::cmp(CmpOp::Le, Expr::var("i"), Expr::int(10)),
                Stmt::block(vec![
                    Stmt::expr(Expr::assign(
                        "acc",
                        Expr::bin(BinOp::Add, Expr::var("acc"), Expr::var("i")),
                    )),
                    Stmt::expr(Expr::assign(
                        "i",
                        Expr::bin(BinOp::Add, Expr::var("i"), Expr::int(1)),
                    )),
                ]),
            ),
            Stmt::ret(Expr::var("acc")),
        ]);
        let graph = optimised_top(&ast);
        assert_eq!(
            block_strings(&graph, 0),
            &["MOV  %i:1, 1", "MOV  %acc:1, 0", "JMP  bb2"]
        );
        assert_eq!(block_strings(&graph, 2), &["CMP  %i:1, 10", "J>  bb4"]);
        assert_eq!(
            block_strings(&graph, 3),
            &[
                "ADD  %~1:0, %acc:1, %i:1",
                "MOV  %acc:1, %~1:0",
                "ADD  %~2:0, %i:1, 1",
                "MOV  %i:1, %~2:0",
                "JMP  bb2"
            ]
        );
        assert_eq!(block_strings(&graph, 4), &["RESULT  %acc:1", "JMP  bb1"]);
    }

    #[test]
    fn branch_phi_resolves_to_edge_copies() {
        let ast = Stmt::block(vec![
            Stmt::expr(Expr::assign("c", Expr::call("read", vec![]))),
            Stmt::if_else(
                Expr::cmp(CmpOp::Gt, Expr::var("c"), Expr::int(0)),
                Stmt::expr(Expr::assign("x", Expr::int(5))),
                Stmt::expr(Expr::assign("x", Expr::int(6))),
            ),
            Stmt::ret(Expr::var("x")),
        ]);
        let graph = optimised_top(&ast);
        assert_eq!(block_strings(&graph, 2), &["MOV  %x:2, 5", "JMP  bb4"]);
        assert_eq!(block_strings(&graph, 3), &["MOV  %x:2, 6"]);
        assert_eq!(block_strings(&graph, 4), &["RESULT  %x:2", "JMP  bb1"]);
    }

    #[test]
    fn loop_invariant_phi_is_minimised_away() {
        // acc never changes inside the loop, so its phi has a single
        // non-self incoming value and disappears entirely.
        let ast = Stmt::block(vec![
            Stmt::expr(Expr::assign("acc", Expr::int(0))),
            Stmt::expr(Expr::assign("i", Expr::int(1))),
            Stmt::while_(
                Expr::cmp(CmpOp::Le, Expr::var("i"), Expr::int(3)),
                Stmt::expr(Expr::assign(
                    "i",
                    Expr::bin(BinOp::Add, Expr::var("i"), Expr::int(1)),
                )),
            ),
            Stmt::ret(Expr::bin(BinOp::Add, Expr::var("acc"), Expr::var("i"))),
        ]);
        let graph = optimised_top(&ast);
        assert_eq!(block_strings(&graph, 0), &["MOV  %i:1, 1", "JMP  bb2"]);
        assert_eq!(block_strings(&graph, 2), &["CMP  %i:1, 3", "J>  bb4"]);
        assert_eq!(
            block_strings(&graph, 4),
            &["ADD  %~2:0, 0, %i:1", "RESULT  %~2:0", "JMP  bb1"]
        );
    }

    #[test]
    fn optimising_twice_is_a_fixpoint() {
        let ast = Stmt::block(vec![
            Stmt::expr(Expr::assign("n", Expr::int(0))),
            Stmt::while_(
                Expr::cmp(CmpOp::Lt, Expr::var("n"), Expr::int(5)),
                Stmt::block(vec![
                    Stmt::expr(Expr::assign(
                        "n",
                        Expr::bin(BinOp::Add, Expr::var("n"), Expr::int(1)),
                    )),
                    Stmt::if_(
                        Expr::cmp(CmpOp::Eq, Expr::var("n"), Expr::int(3)),
                        Stmt::break_(),
                    ),
                ]),
            ),
            Stmt::ret(Expr::var("n")),
        ]);
        let mut program = generate(&ast).unwrap();
        analyse(&mut program.top);
        optimise(&mut program.top, &[]);
        let once = program.top.to_string();
        optimise(&mut program.top, &[]);
        assert_eq!(program.top.to_string(), once);
    }

    #[test]
    fn sibling_branches_do_not_share_expressions() {
        // Both branches compute c + 1 from the same operand generation.
        // Neither branch dominates the other, so each must keep its own
        // temporary.
        let ast = Stmt::defun(
            "pick",
            &["c"],
            Stmt::if_else(
                Expr::cmp(CmpOp::Gt, Expr::var("c"), Expr::int(0)),
                Stmt::block(vec![
                    Stmt::expr(Expr::assign(
                        "x",
                        Expr::bin(BinOp::Add, Expr::var("c"), Expr::int(1)),
                    )),
                    Stmt::ret(Expr::var("x")),
                ]),
                Stmt::block(vec![
                    Stmt::expr(Expr::assign(
                        "y",
                        Expr::bin(BinOp::Add, Expr::var("c"), Expr::int(1)),
                    )),
                    Stmt::ret(Expr::var("y")),
                ]),
            ),
        );
        let mut program = generate(&ast).unwrap();
        analyse(&mut program.funcs[0].graph);
        let params = program.funcs[0].params.clone();
        optimise(&mut program.funcs[0].graph, &params);
        let graph = &program.funcs[0].graph;
        assert_eq!(
            block_strings(graph, 2),
            &[
                "ADD  %~1:0, %c:0, 1",
                "MOV  %x:0, %~1:0",
                "RESULT  %x:0",
                "JMP  bb1"
            ]
        );
        assert_eq!(
            block_strings(graph, 3),
            &[
                "ADD  %~2:0, %c:0, 1",
                "MOV  %y:0, %~2:0",
                "RESULT  %y:0",
                "JMP  bb1"
            ]
        );
    }

    #[test]
    fn loop_assigned_variable_gets_no_entry_copy() {
        // j is only written inside the loop. Liveness carries it all the
        // way to the entry block, but no copy of the unwritten
        // generation may appear on the entry edge.
        let ast = Stmt::block(vec![
            Stmt::expr(Expr::assign("i", Expr::int(1))),
            Stmt::while_(
                Expr::cmp(CmpOp::Le, Expr::var("i"), Expr::int(3)),
                Stmt::block(vec![
                    Stmt::expr(Expr::assign("j", Expr::var("i"))),
                    Stmt::expr(Expr::assign(
                        "i",
                        Expr::bin(BinOp::Add, Expr::var("i"), Expr::int(1)),
                    )),
                ]),
            ),
            Stmt::ret(Expr::var("j")),
        ]);
        let graph = optimised_top(&ast);
        assert_eq!(block_strings(&graph, 0), &["MOV  %i:1, 1", "JMP  bb2"]);
        assert_eq!(
            block_strings(&graph, 3),
            &[
                "MOV  %j:1, %i:1",
                "ADD  %~1:0, %i:1, 1",
                "MOV  %i:1, %~1:0",
                "JMP  bb2"
            ]
        );
        assert_eq!(block_strings(&graph, 4), &["RESULT  %j:1", "JMP  bb1"]);
    }

    #[test]
    fn parameter_still_seeds_a_loop_header() {
        // A parameter has no defining instruction either, but the caller
        // binds it, so the entry edge keeps its copy.
        let ast = Stmt::defun(
            "count",
            &["n"],
            Stmt::block(vec![
                Stmt::while_(
                    Expr::cmp(CmpOp::Lt, Expr::var("n"), Expr::int(3)),
                    Stmt::expr(Expr::assign(
                        "n",
                        Expr::bin(BinOp::Add, Expr::var("n"), Expr::int(1)),
                    )),
                ),
                Stmt::ret(Expr::var("n")),
            ]),
        );
        let mut program = generate(&ast).unwrap();
        analyse(&mut program.funcs[0].graph);
        let params = program.funcs[0].params.clone();
        optimise(&mut program.funcs[0].graph, &params);
        let graph = &program.funcs[0].graph;
        assert_eq!(block_strings(graph, 0), &["MOV  %n:1, %n:0", "JMP  bb2"]);
    }
}
