//! Flow analysis and SSA construction.
//!
//! Runs in four stages over one function graph: edge linking, unreachable
//! pruning, a backward live-in fixpoint, and SSA renaming with phi
//! insertion. The renaming deliberately avoids dominance analysis: the
//! generator always emits a block's definitions before its non-loop
//! successors, so processing blocks in index order and filling phi incoming
//! lists from predecessor exit maps afterwards is sufficient for the
//! structured control flow it produces.

use std::collections::HashMap;

use log::{debug, trace};

use super::{
    block::FlowGraph,
    tac::{Instr, Name, Reg, Value},
};

pub fn analyse(graph: &mut FlowGraph) {
    link_edges(graph);
    prune_unreachable(graph);
    compute_liveness(graph);
    rename_to_ssa(graph);
    fill_phis(graph);
}

/// Compute successor/predecessor lists from fallthrough pointers and
/// trailing jumps.
fn link_edges(graph: &mut FlowGraph) {
    for id in 0..graph.blocks.len() {
        graph.block_mut(id).compute_exits();
    }
    for id in 0..graph.blocks.len() {
        for target in graph.block(id).to_bbs.clone() {
            graph.block_mut(target).from_bbs.push(id);
        }
    }
}

/// Mark predecessor-less blocks (other than the entry) dead and drop their
/// outgoing edges, repeating until stable. Such blocks arise from the
/// fresh continuation blocks the generator opens after `break` and
/// `return`.
fn prune_unreachable(graph: &mut FlowGraph) {
    let mut changed = true;
    while changed {
        changed = false;
        for id in 1..graph.blocks.len() {
            let bb = graph.block(id);
            if !bb.reachable || !bb.from_bbs.is_empty() {
                continue;
            }
            debug!("pruning unreachable bb{}", id);
            let targets = graph.block(id).to_bbs.clone();
            let bb = graph.block_mut(id);
            bb.reachable = false;
            bb.irs.clear();
            for target in targets {
                graph.block_mut(target).from_bbs.retain(|&p| p != id);
            }
            changed = true;
        }
    }
}

/// Seed per-block use/def sets, then propagate live-in variables backward
/// across edges until no block changes. The sets only grow within a finite
/// variable universe, so the fixpoint terminates.
fn compute_liveness(graph: &mut FlowGraph) {
    let reachable = graph.reachable_ids();

    for &id in &reachable {
        let bb = graph.block_mut(id);
        for i in 0..bb.irs.len() {
            for value in bb.irs[i].operands() {
                if let Value::Reg(reg) = value {
                    if !bb.in_regs.contains_key(&reg.name)
                        && !bb.assigned_regs.contains_key(&reg.name)
                    {
                        bb.in_regs.insert(reg.name.clone(), None);
                    }
                }
            }
            if let Some(dst) = bb.irs[i].dest() {
                if !bb.assigned_regs.contains_key(&dst.name) {
                    bb.assigned_regs.insert(dst.name.clone(), None);
                }
            }
        }
    }

    loop {
        let mut changed = false;
        for &id in &reachable {
            for succ in graph.block(id).to_bbs.clone() {
                let live_in: Vec<Name> = graph.block(succ).in_regs.keys().cloned().collect();
                let bb = graph.block_mut(id);
                for name in live_in {
                    if !bb.out_regs.contains_key(&name) {
                        bb.out_regs.insert(name.clone(), None);
                    }
                    if bb.assigned_regs.contains_key(&name) || bb.in_regs.contains_key(&name) {
                        continue;
                    }
                    bb.in_regs.insert(name, None);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
}

/// Rename registers into SSA form, in block index order.
///
/// A block with one predecessor reuses that predecessor's exit
/// generations; the entry block binds its live-ins (the formal parameters)
/// to generation 0; a merge block allocates fresh generations and a phi
/// placeholder per live-in variable. Every local write allocates a new
/// generation.
fn rename_to_ssa(graph: &mut FlowGraph) {
    let mut gens = Generations::default();

    for id in graph.reachable_ids() {
        let preds = graph.block(id).from_bbs.clone();
        let live_in: Vec<Name> = graph.block(id).in_regs.keys().cloned().collect();

        match preds.len() {
            0 => {
                for name in live_in {
                    gens.bind(name.clone(), 0);
                    graph.block_mut(id).in_regs.insert(name, Some(0));
                }
            }
            1 => {
                for name in live_in {
                    let gen = graph
                        .block(preds[0])
                        .out_regs
                        .get(&name)
                        .copied()
                        .flatten()
                        .expect("predecessor exit generation missing");
                    gens.enter(name.clone(), gen);
                    graph.block_mut(id).in_regs.insert(name, Some(gen));
                }
            }
            _ => {
                let mut phis = Vec::with_capacity(live_in.len());
                for name in live_in {
                    let gen = gens.fresh(&name);
                    graph.block_mut(id).in_regs.insert(name.clone(), Some(gen));
                    phis.push(Instr::Phi(Reg::with_gen(name, gen), Vec::new()));
                }
                trace!("bb{}: inserting {} phi(s)", id, phis.len());
                graph.block_mut(id).irs.splice(0..0, phis);
            }
        }

        let bb = graph.block_mut(id);
        for ir in bb.irs.iter_mut() {
            for value in ir.operands_mut() {
                if let Value::Reg(reg) = value {
                    if reg.gen.is_none() {
                        reg.gen = Some(gens.current(&reg.name));
                    }
                }
            }
            if let Some(dst) = ir.dest_mut() {
                if dst.gen.is_none() {
                    dst.gen = Some(gens.fresh(&dst.name));
                }
            }
        }

        let exits: Vec<Name> = bb.out_regs.keys().cloned().collect();
        for name in exits {
            let gen = gens.current(&name);
            bb.out_regs.insert(name, Some(gen));
        }
    }
}

/// Generation bookkeeping during renaming.
///
/// `cur` is the generation visible to reads in the block being processed;
/// entering a single-predecessor block rolls it back to the predecessor's
/// exit generation. `max` only ever grows, so a fresh generation never
/// collides with one allocated earlier on a different path.
#[derive(Default)]
struct Generations {
    cur: HashMap<Name, usize>,
    max: HashMap<Name, usize>,
}

impl Generations {
    fn bind(&mut self, name: Name, gen: usize) {
        self.cur.insert(name.clone(), gen);
        let max = self.max.entry(name).or_insert(gen);
        *max = (*max).max(gen);
    }

    fn enter(&mut self, name: Name, gen: usize) {
        self.cur.insert(name, gen);
    }

    fn fresh(&mut self, name: &Name) -> usize {
        let gen = self.max.get(name).map(|g| g + 1).unwrap_or(0);
        self.bind(name.clone(), gen);
        gen
    }

    fn current(&self, name: &Name) -> usize {
        match self.cur.get(name) {
            Some(gen) => *gen,
            None => panic!("register %{} read before any definition", name),
        }
    }
}

/// Fill phi incoming lists from each predecessor's final exit map: one
/// value per predecessor, in predecessor-list order. Runs after renaming so
/// loop back-edges see their body's last generation.
fn fill_phis(graph: &mut FlowGraph) {
    for id in graph.reachable_ids() {
        let preds = graph.block(id).from_bbs.clone();
        if preds.len() < 2 {
            continue;
        }
        let phi_slots: Vec<(usize, Name)> = graph
            .block(id)
            .irs
            .iter()
            .enumerate()
            .filter_map(|(i, ir)| ir.as_phi().map(|(dst, _)| (i, dst.name.clone())))
            .collect();
        for (slot, name) in phi_slots {
            let incoming: Vec<Value> = preds
                .iter()
                .map(|&p| {
                    let gen = graph
                        .block(p)
                        .out_regs
                        .get(&name)
                        .copied()
                        .flatten()
                        .expect("missing predecessor data for phi");
                    Value::Reg(Reg::with_gen(name.clone(), gen))
                })
                .collect();
            if let Instr::Phi(_, slots) = &mut graph.block_mut(id).irs[slot] {
                *slots = incoming;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crate::ast::{BinOp, CmpOp, Expr, Stmt};

    use super::super::generator::generate;
    use super::*;

    fn analysed_top(ast: &Stmt) -> FlowGraph {
        let mut program = generate(ast).unwrap();
        analyse(&mut program.top);
        program.top
    }

    fn loop_sum_ast() -> Stmt {
        Stmt::block(vec![
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
        ])
    }

    #[test]
    fn continuation_after_return_is_pruned() {
        let ast = Stmt::block(vec![
            Stmt::ret(Expr::int(1)),
            Stmt::expr(Expr::assign("x", Expr::int(2))),
        ]);
        let graph = analysed_top(&ast);
        assert!(graph.block(0).reachable);
        assert!(graph.block(1).reachable, "shared return block stays live");
        assert!(!graph.block(2).reachable);
    }

    #[test]
    fn loop_header_is_live_in_for_loop_carried_variables() {
        let graph = analysed_top(&loop_sum_ast());
        let header = graph.block(2);
        assert!(header.in_regs.contains_key(&Name::Var("i".into())));
        assert!(header.in_regs.contains_key(&Name::Var("acc".into())));
        // The body both reads and rewrites them.
        let body = graph.block(3);
        assert!(body.assigned_regs.contains_key(&Name::Var("acc".into())));
        assert!(body.out_regs.contains_key(&Name::Var("i".into())));
    }

    #[test]
    fn loop_header_receives_phis_for_both_edges() {
        let graph = analysed_top(&loop_sum_ast());
        let header = graph.block(2);
        assert_eq!(header.from_bbs, [0, 3]);
        assert_eq!(header.irs[0].to_string(), "PHI  %i:1 <= [%i:0, %i:2]");
        assert_eq!(header.irs[1].to_string(), "PHI  %acc:1 <= [%acc:0, %acc:2]");
    }

    #[test]
    fn phi_shape_matches_predecessors() {
        let graph = analysed_top(&loop_sum_ast());
        for id in graph.reachable_ids() {
            let bb = graph.block(id);
            for ir in &bb.irs {
                if let Some((dst, incoming)) = ir.as_phi() {
                    assert_eq!(incoming.len(), bb.from_bbs.len());
                    for (value, &pred) in incoming.iter().zip(&bb.from_bbs) {
                        let gen = graph.block(pred).out_regs.get(&dst.name).copied().flatten();
                        assert_eq!(value, &Value::Reg(Reg::with_gen(dst.name.clone(), gen.unwrap())));
                    }
                }
            }
        }
    }

    #[test]
    fn every_register_is_written_exactly_once() {
        let ast = Stmt::block(vec![
            Stmt::expr(Expr::assign("x", Expr::int(0))),
            Stmt::if_else(
                Expr::cmp(CmpOp::Gt, Expr::var("x"), Expr::int(0)),
                Stmt::expr(Expr::assign("x", Expr::int(1))),
                Stmt::expr(Expr::assign("x", Expr::int(2))),
            ),
            Stmt::ret(Expr::var("x")),
        ]);
        let graph = analysed_top(&ast);
        let mut seen = HashSet::new();
        for id in graph.reachable_ids() {
            for ir in &graph.block(id).irs {
                if let Some(dst) = ir.dest() {
                    assert!(seen.insert(dst.clone()), "register {} written twice", dst);
                }
            }
        }
    }

    #[test]
    fn function_entry_binds_parameters_at_generation_zero() {
        let ast = Stmt::defun("id", &["n"], Stmt::ret(Expr::var("n")));
        let mut program = generate(&ast).unwrap();
        analyse(&mut program.funcs[0].graph);
        let regs = program.funcs[0].param_regs();
        assert_eq!(regs.len(), 1);
        assert_eq!(regs[0], Reg::with_gen(Name::Var("n".into()), 0));
    }
}
