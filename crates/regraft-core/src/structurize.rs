//! Structured control flow reconstruction.
//!
//! Takes a reducible CFG in the node pool and rewrites it until every
//! multi-successor block can designate a merge block (and, for loops, a
//! continue block) the way a SPIR-V-style target requires: merge blocks
//! dominated by their headers, constructs strictly nested, only forward
//! edges between construct boundaries.
//!
//! The pipeline is a fixed sequence of synchronous passes:
//! DFS (back edges canonicalized into their slots) → immediate
//! dominators → merge-scope splitting → two structurize passes (loop,
//! switch and selection discovery plus fixups; pass 0 also splits merge
//! blocks claimed by several constructs) → φ repair → validation.
//!
//! Advisory diagnostics go through `log` and are not part of the
//! contract; malformed or unsupported input (irreducible graphs,
//! multiple back edges per header) surfaces as [`StructurizeError`].

use std::collections::HashSet;

use crate::error::StructurizeError;
use crate::graph::{NodeId, NodePool};
use crate::ir::{BlockEmission, IncomingValue, IrBuilder, MergeType, PhiNode, Terminator};

/// How a boundary block found during loop analysis relates to the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExitType {
    /// Dominated by the header and on the way to every reachable exit.
    Exit,
    /// Dominated by the header; a legal loop merge edge exists.
    Merge,
    /// Cannot be merged to directly; needs a ladder, or belongs to an
    /// outer scope entirely.
    Escape,
    /// Owned by a nested loop.
    InnerLoopExit,
    InnerLoopMerge,
}

/// The structurizer. Borrows the node pool for the duration of one
/// compilation; helper blocks it synthesizes live in the same pool.
pub struct Structurizer<'a, B: IrBuilder> {
    pool: &'a mut NodePool,
    builder: &'a mut B,
    entry_block: NodeId,
    post_visit_order: Vec<NodeId>,
}

impl<'a, B: IrBuilder> Structurizer<'a, B> {
    pub fn new(entry_block: NodeId, pool: &'a mut NodePool, builder: &'a mut B) -> Self {
        Structurizer {
            pool,
            builder,
            entry_block,
            post_visit_order: Vec::new(),
        }
    }

    /// The entry block, possibly reassigned after a helper predecessor
    /// was inserted at the root.
    pub fn entry_block(&self) -> NodeId {
        self.entry_block
    }

    /// Run the full pipeline. On success the graph satisfies the
    /// structural constraints checked by `validate_structured`.
    pub fn run(&mut self) -> Result<(), StructurizeError> {
        self.recompute_cfg()?;

        self.split_merge_scopes()?;

        log::debug!("structurize pass 0");
        self.structurize(0);

        self.recompute_cfg()?;

        log::debug!("structurize pass 1");
        self.structurize(1);

        self.insert_phi();

        self.validate_structured();
        Ok(())
    }

    fn structurize(&mut self, pass: u32) {
        self.find_loops();
        self.find_switch_blocks();
        self.find_selection_merges(pass);
        self.fixup_broken_selection_merges(pass);
        if pass == 0 {
            self.split_merge_blocks();
        }
    }

    // ---------------------------------------------------------------------
    // Traversal
    // ---------------------------------------------------------------------

    fn recompute_cfg(&mut self) -> Result<(), StructurizeError> {
        self.reset_traversal();
        self.visit(self.entry_block)?;
        self.build_immediate_dominators()
    }

    /// Clear visit flags and non-frozen merge state, and re-attach the
    /// stripped back edges so the next DFS can classify them again.
    fn reset_traversal(&mut self) {
        self.post_visit_order.clear();
        for node in self.pool.values_mut() {
            node.visited = false;
            node.traversing = false;
            node.immediate_dominator = None;

            if !node.freeze_structured_analysis {
                node.headers.clear();
                node.merge = MergeType::None;
                node.loop_merge_block = None;
                node.loop_ladder_block = None;
                node.selection_merge_block = None;
            }

            if let Some(succ) = node.succ_back_edge.take() {
                if !node.succ.contains(&succ) {
                    node.succ.push(succ);
                }
            }
            if let Some(pred) = node.pred_back_edge.take() {
                if !node.pred.contains(&pred) {
                    node.pred.push(pred);
                }
            }
        }
    }

    /// Pre-order DFS from the entry. An edge into a block still being
    /// traversed is a back edge; it is recorded in the back-edge slots
    /// of both endpoints and removed from the forward adjacency, so all
    /// later analyses run on an acyclic graph.
    fn visit(&mut self, entry: NodeId) -> Result<(), StructurizeError> {
        let mut stack: Vec<(NodeId, usize)> = Vec::new();
        self.pool[entry].visited = true;
        self.pool[entry].traversing = true;
        stack.push((entry, 0));

        while let Some(&(node, index)) = stack.last() {
            if index < self.pool[node].succ.len() {
                stack.last_mut().expect("stack is non-empty").1 += 1;
                let succ = self.pool[node].succ[index];
                if self.pool[succ].traversing {
                    // Only one back edge per block is supported.
                    if self.pool[node].succ_back_edge.is_some_and(|b| b != succ) {
                        return Err(StructurizeError::MultipleBackEdges {
                            block: self.pool[node].name.clone(),
                        });
                    }
                    self.pool[node].succ_back_edge = Some(succ);

                    if self.pool[succ].pred_back_edge.is_some_and(|b| b != node) {
                        return Err(StructurizeError::MultipleBackEdges {
                            block: self.pool[succ].name.clone(),
                        });
                    }
                    self.pool[succ].pred_back_edge = Some(node);
                } else if !self.pool[succ].visited {
                    self.pool[succ].visited = true;
                    self.pool[succ].traversing = true;
                    stack.push((succ, 0));
                }
            } else {
                stack.pop();
                // Keep only forward edges in the adjacency lists.
                if let Some(back) = self.pool[node].succ_back_edge {
                    self.pool[node].succ.retain(|&s| s != back);
                }
                if let Some(back) = self.pool[node].pred_back_edge {
                    self.pool[node].pred.retain(|&p| p != back);
                }
                self.pool[node].traversing = false;
                self.pool[node].visit_order = self.post_visit_order.len();
                self.post_visit_order.push(node);
            }
        }

        // Should be fed by the producer instead.
        for i in 0..self.post_visit_order.len() {
            let n = self.post_visit_order[i];
            self.pool[n].is_switch = self.pool[n].succ.len() > 2;
        }
        Ok(())
    }

    /// Reverse post-order sweep; each node's idom is the intersection of
    /// its forward predecessors' idoms. A single pass is exact on the
    /// forward DAG of a reducible graph.
    fn build_immediate_dominators(&mut self) -> Result<(), StructurizeError> {
        for i in (0..self.post_visit_order.len()).rev() {
            let node = self.post_visit_order[i];
            self.pool.recompute_immediate_dominator(node);
        }

        // Reducibility: every retreating edge must target a dominator.
        for i in 0..self.post_visit_order.len() {
            let node = self.post_visit_order[i];
            if let Some(header) = self.pool[node].succ_back_edge {
                if !self.pool.dominates(header, node) {
                    return Err(StructurizeError::Irreducible {
                        from: self.pool[node].name.clone(),
                        to: self.pool[header].name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn compute_dominance_frontier(&mut self) {
        for i in 0..self.post_visit_order.len() {
            let node = self.post_visit_order[i];
            self.pool.recompute_dominance_frontier(node);
        }
    }

    // ---------------------------------------------------------------------
    // Merge scope splitting
    // ---------------------------------------------------------------------

    /// Declare a preliminary selection scope at the idom of every join
    /// point, then serialize "onion" breaks so each nesting layer gets a
    /// merge block of its own.
    fn split_merge_scopes(&mut self) -> Result<(), StructurizeError> {
        for i in 0..self.post_visit_order.len() {
            let node = self.post_visit_order[i];
            if self.pool[node].num_forward_preds() <= 1 {
                continue;
            }

            // The idom is the natural header block.
            let idom = self.pool[node]
                .immediate_dominator
                .expect("join point has a dominator");
            debug_assert!(self.pool[idom].succ.len() >= 2);

            if self.pool[idom].merge == MergeType::None {
                self.pool[idom].merge = MergeType::Selection;
                self.pool[idom].selection_merge_block = Some(node);
            }
            self.pool[node].headers.push(idom);
        }

        for i in 0..self.post_visit_order.len() {
            let node = self.post_visit_order[i];
            if self.pool[node].num_forward_preds() <= 1 {
                continue;
            }
            // Continue blocks can be branched to from any scope; leave
            // them alone.
            if self.pool[node].succ_back_edge.is_some() {
                continue;
            }

            let idom = self.pool[node]
                .immediate_dominator
                .expect("join point has a dominator");
            debug_assert!(self.pool[idom].succ.len() >= 2);

            // A pattern like A -> B -> C -> D -> M with shortcut edges
            // from every level to M uses one merge block as a break
            // target for several nested selections. Each layer gets a
            // ladder block so the merges nest strictly.
            self.rewrite_selection_breaks(idom, node);
        }

        self.recompute_cfg()
    }

    /// Give every inner selection construct under `header` its own
    /// ladder toward `ladder_to`, rewriting break edges layer by layer.
    fn rewrite_selection_breaks(&mut self, header: NodeId, ladder_to: NodeId) {
        // Loops and switch blocks are not rewritten here.
        if self.pool[header].pred_back_edge.is_some() {
            return;
        }
        if self.pool[header].is_switch {
            return;
        }

        let mut construct: Vec<NodeId> = Vec::new();
        {
            let pool = &*self.pool;
            let mut nodes: HashSet<NodeId> = HashSet::new();
            pool.traverse_dominated_blocks(header, &mut |n| {
                if nodes.insert(n) {
                    if pool[n].succ.len() >= 2 && pool.outer_selection_dominator(n) == Some(header)
                    {
                        construct.push(n);
                    }
                    true
                } else {
                    false
                }
            });
        }
        construct.sort_by_key(|&n| std::cmp::Reverse(self.pool[n].visit_order));

        for inner_block in construct {
            log::debug!(
                "rewriting branches {} -> {} through a ladder",
                self.pool[inner_block].name,
                self.pool[ladder_to].name
            );

            let ladder = self.pool.create_node(format!(
                "{}.{}.ladder",
                self.pool[ladder_to].name, self.pool[inner_block].name
            ));
            self.pool.add_branch(ladder, ladder_to);
            self.pool[ladder].ir.terminator = Terminator::Branch { target: ladder_to };

            // Stop rewriting once we hit the inner construct's merge.
            self.pool.traverse_dominated_blocks_and_rewrite_branch_masked(
                inner_block,
                ladder_to,
                ladder,
                &mut move |pool, n| pool[inner_block].selection_merge_block != Some(n),
            );
            self.rewrite_selection_breaks(inner_block, ladder);
        }
    }

    // ---------------------------------------------------------------------
    // Construct discovery
    // ---------------------------------------------------------------------

    /// Blocks in the natural loop of `header`: everything on a
    /// predecessor chain from the latch that stops at the header.
    fn backtrace_loop_body(&self, header: NodeId, latch: NodeId) -> HashSet<NodeId> {
        let mut traced = HashSet::new();
        traced.insert(header);
        let mut stack = vec![latch];
        while let Some(b) = stack.pop() {
            if b == header {
                continue;
            }
            if traced.insert(b) {
                stack.extend(self.pool[b].pred.iter().copied());
            }
        }
        traced
    }

    /// Forward-trace from the header; the first blocks outside the loop
    /// body are the exit candidates.
    fn trace_loop_exits(&self, header: NodeId, body: &HashSet<NodeId>) -> Vec<NodeId> {
        let mut exits = HashSet::new();
        let mut traced = HashSet::new();
        let mut stack = vec![header];
        while let Some(n) = stack.pop() {
            if !body.contains(&n) {
                exits.insert(n);
                continue;
            }
            for &s in &self.pool[n].succ {
                if traced.insert(s) {
                    stack.push(s);
                }
            }
        }
        let mut exits: Vec<NodeId> = exits.into_iter().collect();
        exits.sort_by_key(|&e| std::cmp::Reverse(self.pool[e].visit_order));
        exits
    }

    fn get_loop_exit_type(&self, header: NodeId, node: NodeId) -> LoopExitType {
        // An exit owned by an inner loop is that loop's business.
        let is_innermost = self.pool.is_innermost_loop_header_for(header, node);

        if self.pool.dominates(header, node) && self.pool.dominates_all_reachable_exits(node) {
            return if is_innermost {
                LoopExitType::Exit
            } else {
                LoopExitType::InnerLoopExit
            };
        }

        if self.pool.dominates(header, node) {
            if is_innermost {
                // Even a dominated exit might not be mergeable to.
                if !self.pool.can_loop_merge_to(header, node) {
                    LoopExitType::Escape
                } else {
                    LoopExitType::Merge
                }
            } else {
                LoopExitType::InnerLoopMerge
            }
        } else {
            LoopExitType::Escape
        }
    }

    /// Classify every loop header and pick its merge block, and, when
    /// the merge cannot be branched to directly, the ladder block that
    /// `split_merge_blocks` will build on.
    fn find_loops(&mut self) {
        // Reverse order resolves outer loops first, which lets us detect
        // ladder-breaking loops.
        for index in (0..self.post_visit_order.len()).rev() {
            let node = self.post_visit_order[index];

            if self.pool[node].freeze_structured_analysis
                && self.pool[node].merge == MergeType::Loop
            {
                // Pre-built shell for ladder breaking; just propagate
                // the header information.
                if let Some(merge) = self.pool[node].loop_merge_block {
                    self.pool[merge].headers.push(node);
                }
                continue;
            }

            if self.pool[node].pred_back_edge.is_none() {
                continue;
            }

            // A back edge lands here; this is a loop header.
            self.pool[node].merge = MergeType::Loop;

            let latch = self.pool[node]
                .pred_back_edge
                .expect("loop header has a latch");
            let body = self.backtrace_loop_body(node, latch);
            let exits = self.trace_loop_exits(node, &body);

            let mut direct_exits = Vec::new();
            let mut dominated_exit = Vec::new();
            let mut inner_dominated_exit = Vec::new();
            let mut non_dominated_exit = Vec::new();

            for exit in exits {
                match self.get_loop_exit_type(node, exit) {
                    LoopExitType::Exit => direct_exits.push(exit),
                    // Not an exit for us, but for the inner loop.
                    LoopExitType::InnerLoopExit => {}
                    LoopExitType::Merge => dominated_exit.push(exit),
                    LoopExitType::InnerLoopMerge => inner_dominated_exit.push(exit),
                    LoopExitType::Escape => non_dominated_exit.push(exit),
                }
            }

            // A single direct exit is our merge block; file it under
            // dominated or escaping.
            if direct_exits.len() == 1 && dominated_exit.is_empty() && non_dominated_exit.is_empty()
            {
                if self.pool.dominates(node, direct_exits[0]) {
                    std::mem::swap(&mut dominated_exit, &mut direct_exits);
                } else {
                    std::mem::swap(&mut non_dominated_exit, &mut direct_exits);
                }
            }

            if dominated_exit.len() >= 2 {
                // Multiple clean break blocks may still reconvene at one
                // of them; collapse if so.
                let post_dominator = self.find_common_post_dominator(dominated_exit.clone());
                if let Some(post_dominator) = post_dominator {
                    if dominated_exit.contains(&post_dominator) {
                        dominated_exit.clear();
                        dominated_exit.push(post_dominator);
                    }
                }
            }

            if dominated_exit.is_empty() && non_dominated_exit.is_empty() {
                // Infinite loop; a merge block is invented at validation
                // time and declared unreachable.
                self.pool[node].loop_merge_block = None;
                log::debug!("loop without merge: {}", self.pool[node].name);
            } else if dominated_exit.len() == 1
                && non_dominated_exit.is_empty()
                && inner_dominated_exit.is_empty()
            {
                // Clean merge; there can be no other candidate.
                let merge = dominated_exit[0];
                self.pool[node].loop_merge_block = Some(merge);
                self.pool.add_unique_header(merge, node);
                log::debug!(
                    "loop with simple merge: {} -> {}",
                    self.pool[node].name,
                    self.pool[merge].name
                );
            } else if dominated_exit.is_empty()
                && inner_dominated_exit.is_empty()
                && non_dominated_exit.len() == 1
            {
                // Unique escape; workarounds come later.
                let merge = non_dominated_exit[0];
                self.pool[node].loop_merge_block = Some(merge);
                self.pool.add_unique_header(merge, node);
                log::debug!(
                    "loop with ladder merge: {} -> {}",
                    self.pool[node].name,
                    self.pool[merge].name
                );
            } else {
                // Several merge candidates; figure out where execution
                // reconvenes.
                let mut merges = Vec::with_capacity(
                    inner_dominated_exit.len() + dominated_exit.len() + non_dominated_exit.len(),
                );
                merges.extend_from_slice(&inner_dominated_exit);
                merges.extend_from_slice(&dominated_exit);
                merges.extend_from_slice(&non_dominated_exit);
                let merge = self.find_common_post_dominator(merges);

                let mut dominated_merge = if dominated_exit.len() > 1 {
                    // Some dominated exits may turn out to be break
                    // blocks; they must not drag the ladder outward.
                    let non_breaking_exits: Vec<NodeId> = dominated_exit
                        .iter()
                        .copied()
                        .filter(|&exit| match merge {
                            Some(m) => !self.control_flow_is_escaping(node, exit, m),
                            None => true,
                        })
                        .collect();
                    self.find_common_post_dominator(non_breaking_exits)
                } else {
                    self.find_common_post_dominator(dominated_exit.clone())
                };

                if dominated_merge.is_none() {
                    log::debug!("no candidate for ladder merging");
                }
                if let Some(dm) = dominated_merge {
                    if !self.pool.dominates(node, dm) {
                        log::debug!(
                            "loop header {} does not dominate merge candidate {}",
                            self.pool[node].name,
                            self.pool[dm].name
                        );
                        dominated_merge = None;
                    }
                }

                match merge {
                    None => {
                        log::warn!(
                            "cannot find a common merge point for loop {}",
                            self.pool[node].name
                        );
                    }
                    Some(merge) => {
                        self.pool[node].loop_merge_block = Some(merge);
                        self.pool.add_unique_header(merge, node);

                        if self.pool.can_loop_merge_to(node, merge) {
                            log::debug!(
                                "loop with simple multi-exit merge: {} -> {}",
                                self.pool[node].name,
                                self.pool[merge].name
                            );
                        } else {
                            log::debug!(
                                "loop with ladder multi-exit merge: {} -> {}",
                                self.pool[node].name,
                                self.pool[merge].name
                            );
                            if let Some(dm) = dominated_merge {
                                log::debug!("    ladder block: {}", self.pool[dm].name);
                            }
                            self.pool[node].loop_ladder_block = dominated_merge;
                        }
                    }
                }
            }
        }
    }

    fn find_switch_blocks(&mut self) {
        for index in (0..self.post_visit_order.len()).rev() {
            let node = self.post_visit_order[index];
            if !self.pool[node].is_switch {
                continue;
            }

            let succ = self.pool[node].succ.clone();
            let Some(merge) = self.find_common_post_dominator(succ.clone()) else {
                log::warn!(
                    "cannot find a merge target for switch block {}",
                    self.pool[node].name
                );
                continue;
            };

            if self.pool.dominates(node, merge) {
                log::debug!(
                    "switch merge: {} -> {}",
                    self.pool[node].name,
                    self.pool[merge].name
                );
                self.pool[node].merge = MergeType::Selection;
                self.pool[node].selection_merge_block = Some(merge);
                self.pool.add_unique_header(merge, node);
            } else {
                // Some case is escaping the switch. Same idea as for
                // loops: find a post-dominator while ignoring the
                // escaping branch to get the dominated interior merge.
                let dominated_merge_target =
                    self.find_common_post_dominator_with_ignored_break(succ, Some(merge));
                if let Some(target) = dominated_merge_target {
                    if self.pool.dominates(node, target) {
                        self.pool[node].merge = MergeType::Selection;
                        self.pool[node].selection_merge_block = Some(merge);
                        self.pool.add_unique_header(target, node);
                        self.pool.add_unique_header(merge, node);
                    }
                }
            }
        }
    }

    fn find_selection_merges(&mut self, pass: u32) {
        for i in 0..self.post_visit_order.len() {
            let node = self.post_visit_order[i];
            if self.pool[node].num_forward_preds() <= 1 {
                continue;
            }

            // Two or more pred edges; try to merge execution here. The
            // idom is the natural header block.
            let mut idom = self.pool[node]
                .immediate_dominator
                .expect("join point has a dominator");

            // A join fed by a switch header or its declared merge is a
            // case fallthrough, not a merge scenario.
            if let Some(inner_header) = self.pool.outer_selection_dominator(node) {
                if self.pool[inner_header].is_switch {
                    if self.pool[inner_header].selection_merge_block == Some(node) {
                        continue;
                    }
                    if self.pool[inner_header].succ.contains(&node) {
                        continue;
                    }
                }
            }

            // A header already associated with this block overrides the
            // idom; loops containing selections need this.
            let headers = self.pool[node].headers.clone();
            for header in headers {
                if self.pool[header].visit_order > self.pool[idom].visit_order {
                    idom = header;
                }
            }

            match self.pool[idom].merge {
                MergeType::None | MergeType::Selection => {
                    // Switch blocks were already handled.
                    if self.pool[idom].is_switch {
                        continue;
                    }

                    if self.pool[idom].merge == MergeType::Selection {
                        // The idom already heads a selection, so some
                        // breaking construct inside it fooled us into
                        // claiming a merge target at the break target.
                        // Rewrite the outer construct as a fixed loop.
                        if pass == 0 {
                            self.pool[idom].merge = MergeType::Loop;
                            let prev = self.pool[idom]
                                .selection_merge_block
                                .expect("selection header has a merge block");
                            self.pool[idom].loop_merge_block = Some(prev);
                            self.pool[idom].selection_merge_block = None;
                            self.pool[idom].freeze_structured_analysis = true;
                            idom = self.create_helper_succ_block(idom);
                        } else {
                            log::warn!(
                                "mismatched construct headers for {} in pass 1",
                                self.pool[node].name
                            );
                        }
                    }

                    self.pool[idom].merge = MergeType::Selection;
                    self.pool.add_unique_header(node, idom);
                    self.pool[idom].selection_merge_block = Some(node);
                    log::debug!(
                        "selection merge: {} -> {}",
                        self.pool[idom].name,
                        self.pool[node].name
                    );
                }
                MergeType::Loop => {
                    if self.pool[idom].loop_merge_block == Some(node)
                        && self.pool[idom].loop_ladder_block.is_some()
                    {
                        // The loop must ladder-break to this block;
                        // give the header an outer shell to break from.
                        let outer = self.create_helper_pred_block(idom);
                        self.pool[outer].merge = MergeType::Loop;
                        self.pool[outer].loop_merge_block = Some(node);
                        self.pool[outer].freeze_structured_analysis = true;
                        self.pool.add_unique_header(node, outer);
                        log::debug!(
                            "loop merge: {} -> {}",
                            self.pool[outer].name,
                            self.pool[node].name
                        );
                    } else if self.pool[idom].loop_merge_block != Some(node) {
                        // A join inside the loop. Splitting the header
                        // into loop header -> selection header lets the
                        // selection merge into e.g. a continue block.
                        let selection_idom = self.create_helper_succ_block(idom);
                        self.pool[selection_idom].merge = MergeType::Selection;
                        self.pool[selection_idom].selection_merge_block = Some(node);
                        self.pool.add_unique_header(node, selection_idom);
                        log::debug!(
                            "selection merge: {} -> {}",
                            self.pool[selection_idom].name,
                            self.pool[node].name
                        );
                    }
                }
            }
        }
    }

    /// Second chance for two-successor blocks without a merge: one side
    /// typically breaks while the other continues, common around ladder
    /// blocks whose merge block has a single predecessor.
    fn fixup_broken_selection_merges(&mut self, pass: u32) {
        for i in 0..self.post_visit_order.len() {
            let node = self.post_visit_order[i];
            if self.pool[node].succ.len() != 2 {
                continue;
            }
            if self.pool[node].merge != MergeType::None {
                continue;
            }
            // A continue block never needs to merge execution.
            if self.pool[node].succ_back_edge.is_some() {
                continue;
            }

            let a = self.pool[node].succ[0];
            let b = self.pool[node].succ[1];
            let dominates_a = self.pool.dominates(node, a);
            let dominates_b = self.pool.dominates(node, b);
            let a_has_header = !self.pool[a].headers.is_empty();
            let b_has_header = !self.pool[b].headers.is_empty();

            if dominates_a && !dominates_b && !a_has_header {
                // A is the obvious candidate; B is a break or continue
                // target.
                self.merge_to_succ(node, 0);
            } else if dominates_b && !dominates_a && !b_has_header {
                self.merge_to_succ(node, 1);
            } else if dominates_a && dominates_b && !a_has_header && b_has_header {
                // One path hits a continue block, the other a ladder
                // merge block; a do/while-style body may dominate its
                // merge block.
                self.merge_to_succ(node, 0);
            } else if dominates_a && dominates_b && !b_has_header && a_has_header {
                self.merge_to_succ(node, 1);
            } else if dominates_a && dominates_b && !a_has_header && !b_has_header {
                // We could merge to both; find where execution actually
                // reconvenes. A break construct inside a selection means
                // we do not dominate the merge block; pass 0 fixes that
                // up with ladders, pass 1 sees the laddered graph.
                let merge = self.find_common_post_dominator(vec![a, b]);
                if let Some(merge) = merge {
                    let dominates_merge = self.pool.dominates(node, merge);
                    let merges_to_continue = self.pool[merge].succ_back_edge.is_some();

                    if dominates_merge && !self.pool[merge].headers.is_empty() {
                        // Likely one clean break out of a loop while the
                        // other path continues and breaks later.
                        let a_breaks = self.control_flow_is_escaping(node, a, merge);
                        let b_breaks = self.control_flow_is_escaping(node, b, merge);
                        if a_breaks && b_breaks {
                            // Both paths break; we never merge.
                            self.pool[node].merge = MergeType::Selection;
                            self.pool[node].selection_merge_block = None;
                            log::debug!("merging {} -> unreachable", self.pool[node].name);
                        } else if b_breaks {
                            self.merge_to_succ(node, 0);
                        } else {
                            self.merge_to_succ(node, 1);
                        }
                    } else if !merges_to_continue
                        && (self.pool[merge].headers.is_empty() || pass == 0)
                    {
                        // Pass 0: blocks will be split anyway, register
                        // the merge target where we want it.
                        self.pool[node].selection_merge_block = Some(merge);
                        self.pool[node].merge = MergeType::Selection;
                        self.pool[merge].headers.push(node);
                        log::debug!(
                            "merging {} -> {}",
                            self.pool[node].name,
                            self.pool[merge].name
                        );
                    } else {
                        // We do not dominate the merge block in pass 1
                        // and cannot split blocks anymore. A path that
                        // reaches the merge target without going through
                        // a ladder belongs to an outer scope.
                        let a_breaks = self.control_flow_is_escaping(node, a, merge);
                        let b_breaks = self.control_flow_is_escaping(node, b, merge);
                        if a_breaks && b_breaks {
                            self.pool[node].merge = MergeType::Selection;
                            let name = format!("{}.unreachable", self.pool[node].name);
                            let dummy = self.pool.create_node(name);
                            self.pool[node].selection_merge_block = Some(dummy);
                            log::debug!("merging {} -> unreachable", self.pool[node].name);
                        } else if b_breaks {
                            self.merge_to_succ(node, 0);
                        } else {
                            self.merge_to_succ(node, 1);
                        }
                    }
                } else {
                    // One side of the branch took an exit; there is no
                    // common post-dominator. The side that does not
                    // dominate all exits is the real body.
                    let a_dominates_exit = self.pool.dominates_all_reachable_exits(a);
                    let b_dominates_exit = self.pool.dominates_all_reachable_exits(b);
                    if !a_dominates_exit && b_dominates_exit {
                        self.merge_to_succ(node, 0);
                    } else if !b_dominates_exit && a_dominates_exit {
                        self.merge_to_succ(node, 1);
                    } else {
                        // Both paths lead to an exit; merge to an
                        // unreachable node.
                        self.pool[node].merge = MergeType::Selection;
                        let name = format!("{}.unreachable", self.pool[node].name);
                        let dummy = self.pool.create_node(name);
                        self.pool[node].selection_merge_block = Some(dummy);
                    }
                }
            } else if pass == 0 {
                // No obvious merge target; pick whatever reconvenes so a
                // proper ladder break can be set up if we are escaping.
                let merge = self.find_common_post_dominator(vec![a, b]);
                if let Some(merge) = merge {
                    // Don't merge to our own switch block's merge.
                    let inner_header = self.pool.outer_header_dominator(node);
                    let conditional_switch_break = inner_header.is_some_and(|h| {
                        self.pool[h].merge == MergeType::Selection
                            && self.pool[h].selection_merge_block == Some(merge)
                    });

                    if !conditional_switch_break {
                        self.pool[node].selection_merge_block = Some(merge);
                        self.pool[node].merge = MergeType::Selection;
                        self.pool[merge].headers.push(node);
                        log::debug!(
                            "merging {} -> {}",
                            self.pool[node].name,
                            self.pool[merge].name
                        );
                    }
                } else {
                    log::warn!(
                        "cannot find a merge target for block {}",
                        self.pool[node].name
                    );
                }
            }
        }
    }

    fn merge_to_succ(&mut self, node: NodeId, index: usize) {
        let succ = self.pool[node].succ[index];
        self.pool[succ].headers.push(node);
        self.pool[node].selection_merge_block = Some(succ);
        self.pool[node].merge = MergeType::Selection;
        log::debug!(
            "fixup selection merge: {} -> {}",
            self.pool[node].name,
            self.pool[succ].name
        );
    }

    /// Does any path from `node` reach `merge` while staying outside the
    /// construct's own exit, i.e. is this a "breaking" branch? Exits via
    /// a continue block do not count.
    fn control_flow_is_escaping(&self, header: NodeId, node: NodeId, merge: NodeId) -> bool {
        if node == merge {
            return false;
        }
        if self.pool[node].succ_back_edge.is_some() {
            return false;
        }

        let mut seen = HashSet::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            if !seen.insert(n) {
                continue;
            }
            if self.pool[n].succ_back_edge.is_some() {
                continue;
            }
            for &s in &self.pool[n].succ {
                if s == merge {
                    return true;
                }
                if self.pool.dominates(header, s) {
                    stack.push(s);
                }
            }
        }
        false
    }

    // ---------------------------------------------------------------------
    // Common post-dominator search
    // ---------------------------------------------------------------------

    fn find_common_post_dominator(&self, candidates: Vec<NodeId>) -> Option<NodeId> {
        self.find_common_post_dominator_with_ignored_break(candidates, None)
    }

    /// Iteratively expand the earliest candidate (highest `visit_order`)
    /// into its successors until one candidate remains. `ignored` edges
    /// are dropped, which lets callers skip a known escape path. Returns
    /// `None` when an exit is reached without execution reconvening.
    fn find_common_post_dominator_with_ignored_break(
        &self,
        mut candidates: Vec<NodeId>,
        ignored: Option<NodeId>,
    ) -> Option<NodeId> {
        if candidates.is_empty() {
            return None;
        }

        let pool = &*self.pool;
        let mut next_nodes: Vec<NodeId> = Vec::new();
        while candidates.len() != 1 {
            candidates.sort_by_key(|&n| std::cmp::Reverse(pool[n].visit_order));

            // Reached an exit without merging execution.
            if pool[candidates[0]].succ.is_empty() {
                return None;
            }

            {
                let mut add_unique_next_node = |n: NodeId| {
                    if Some(n) != ignored && !next_nodes.contains(&n) {
                        next_nodes.push(n);
                    }
                };
                for &s in &pool[candidates[0]].succ {
                    add_unique_next_node(s);
                }
                for &c in &candidates[1..] {
                    add_unique_next_node(c);
                }
            }

            std::mem::swap(&mut candidates, &mut next_nodes);
            next_nodes.clear();
        }

        candidates.first().copied()
    }

    // ---------------------------------------------------------------------
    // Helper-block synthesis
    // ---------------------------------------------------------------------

    /// Insert a helper in front of `node`: the helper takes over all
    /// forward predecessors (back edges stay put) and branches to
    /// `node`. Becomes the new entry block if `node` was the entry.
    fn create_helper_pred_block(&mut self, node: NodeId) -> NodeId {
        let name = format!("{}.pred", self.pool[node].name);
        let pred_node = self.pool.create_node(name);
        log::debug!(
            "creating helper pred block {} for {}",
            self.pool[pred_node].name,
            self.pool[node].name
        );

        // Visit order is fixed up on the next traversal.
        self.pool[pred_node].visit_order = self.pool[node].visit_order;

        let preds = std::mem::take(&mut self.pool[node].pred);
        self.pool[pred_node].pred = preds;

        self.pool[pred_node].immediate_dominator = self.pool[node].immediate_dominator;
        self.pool[node].immediate_dominator = Some(pred_node);

        self.pool.retarget_pred_from(pred_node, node);
        self.pool.add_branch(pred_node, node);

        if node == self.entry_block {
            self.entry_block = pred_node;
        }

        self.pool[pred_node].ir.terminator = Terminator::Branch { target: node };
        pred_node
    }

    /// Insert a helper behind `node`: the helper takes over all forward
    /// successors and the old terminator; `node` branches to the helper.
    fn create_helper_succ_block(&mut self, node: NodeId) -> NodeId {
        let name = format!("{}.succ", self.pool[node].name);
        let succ_node = self.pool.create_node(name);
        log::debug!(
            "creating helper succ block {} for {}",
            self.pool[succ_node].name,
            self.pool[node].name
        );

        // Visit order is fixed up on the next traversal.
        self.pool[succ_node].visit_order = self.pool[node].visit_order;

        // Only forward edges move; back edges stay on the original.
        let succs = std::mem::take(&mut self.pool[node].succ);
        self.pool[succ_node].succ = succs;

        self.pool[succ_node].ir.terminator = self.pool[node].ir.terminator.clone();
        self.pool[node].ir.terminator = Terminator::Branch { target: succ_node };

        self.pool.retarget_succ_from(succ_node, node);
        self.pool[succ_node].immediate_dominator = Some(node);

        self.pool.add_branch(node, succ_node);
        succ_node
    }

    // ---------------------------------------------------------------------
    // Merge block splitting
    // ---------------------------------------------------------------------

    /// A block claimed as merge target by several constructs must be
    /// split: the target IR allows one construct per merge block. Inner
    /// scopes get ladder blocks which break to the outer scope, so the
    /// shared block ends up with exactly one header.
    fn split_merge_blocks(&mut self) {
        for i in 0..self.post_visit_order.len() {
            let mut node = self.post_visit_order[i];
            if self.pool[node].headers.len() <= 1 {
                continue;
            }

            // Sort headers outer-first: outer constructs dominate inner
            // ones. Helpers synthesized mid-pass share their sibling's
            // visit order, so dominance is the only reliable key here.
            let mut sorted = self.pool[node].headers.clone();
            sorted.sort_by(|&a, &b| {
                if a == b {
                    std::cmp::Ordering::Equal
                } else if self.pool.dominates(a, b) {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Greater
                }
            });
            for w in sorted.windows(2) {
                if !self.pool.dominates(w[0], w[1]) {
                    log::warn!("merge scopes for {} are not nested", self.pool[node].name);
                }
            }
            if self.pool[sorted[0]].loop_ladder_block.is_some() {
                log::warn!(
                    "outer loop header {} needs a ladder break",
                    self.pool[sorted[0]].name
                );
            }
            self.pool[node].headers = sorted;

            let mut full_break_target: Option<NodeId> = None;
            let header_count = self.pool[node].headers.len();

            // Innermost scope first: rewrite its escape branches onto a
            // merge block its own header dominates; the ladder in front
            // of the old merge block breaks to the outer scope or keeps
            // executing the old merge block.
            for i in (1..header_count).rev() {
                let headers = self.pool[node].headers.clone();
                let hdr = headers[i];

                // Innermost enclosing loop scope we can break to.
                let target_header = headers[..i]
                    .iter()
                    .rev()
                    .copied()
                    .find(|&h| self.pool[h].merge == MergeType::Loop);

                match self.pool[hdr].merge {
                    MergeType::Loop => {
                        let Some(loop_ladder) = self.pool[hdr].loop_ladder_block else {
                            log::warn!(
                                "no ladder break candidate for loop header {}",
                                self.pool[hdr].name
                            );
                            continue;
                        };

                        if let Some(target_header) = target_header {
                            self.build_breaking_ladder(node, hdr, loop_ladder, target_header);
                        } else if self.pool[loop_ladder].succ.len() == 1
                            && self.pool[loop_ladder].succ[0] == node
                        {
                            self.build_pass_through_ladder(loop_ladder);
                        } else if let Some(full_break_target) = full_break_target {
                            self.pool.traverse_dominated_blocks_and_rewrite_branch(
                                hdr,
                                node,
                                full_break_target,
                            );
                        } else {
                            let (new_node, target) = self.install_full_break_target(node, hdr);
                            node = new_node;
                            full_break_target = Some(target);
                        }
                    }
                    MergeType::Selection => {
                        if let Some(target_header) = target_header {
                            // Break out to the outer loop scope.
                            let target = self.pool[target_header]
                                .loop_ladder_block
                                .or(self.pool[target_header].loop_merge_block);
                            match target {
                                Some(target) => {
                                    self.pool.traverse_dominated_blocks_and_rewrite_branch(
                                        hdr, node, target,
                                    );
                                }
                                None => log::warn!(
                                    "loop header {} has no merge block",
                                    self.pool[target_header].name
                                ),
                            }
                        } else if let Some(full_break_target) = full_break_target {
                            self.pool.traverse_dominated_blocks_and_rewrite_branch(
                                hdr,
                                node,
                                full_break_target,
                            );
                        } else {
                            let (new_node, target) = self.install_full_break_target(node, hdr);
                            node = new_node;
                            full_break_target = Some(target);
                        }
                    }
                    MergeType::None => {
                        log::warn!("invalid merge type on header {}", self.pool[hdr].name);
                    }
                }
            }
        }
    }

    /// Ladder in front of `loop_ladder`, merge target for `hdr`'s
    /// breaks. A bool φ distinguishes escape predecessors from normal
    /// ones: escapes continue breaking into `target_header`'s scope,
    /// normal merges keep executing the old ladder block.
    fn build_breaking_ladder(
        &mut self,
        node: NodeId,
        hdr: NodeId,
        loop_ladder: NodeId,
        target_header: NodeId,
    ) {
        let ladder = self.create_helper_pred_block(loop_ladder);
        self.pool[ladder].is_ladder = true;

        let normal_preds: HashSet<NodeId> = self.pool[ladder]
            .pred
            .iter()
            .copied()
            .filter(|&p| !self.pool[p].is_ladder)
            .collect();

        // Merge to the ladder instead.
        self.pool
            .traverse_dominated_blocks_and_rewrite_branch(hdr, node, ladder);

        // Ladder breaks out to the outer scope.
        let true_block = self.pool[target_header]
            .loop_ladder_block
            .or(self.pool[target_header].loop_merge_block);
        let Some(true_block) = true_block else {
            log::warn!(
                "loop header {} has no merge block",
                self.pool[target_header].name
            );
            return;
        };

        let cond = self.builder.allocate_id();
        let type_id = self.builder.make_bool_type();
        let mut phi = PhiNode {
            id: cond,
            type_id,
            incoming: Vec::new(),
        };
        for pred in self.pool[ladder].pred.clone() {
            let id = self.builder.make_bool_constant(!normal_preds.contains(&pred));
            phi.incoming.push(IncomingValue {
                block: pred,
                id: Some(id),
            });
        }
        self.pool[ladder].ir.phi.push(phi);

        self.pool[ladder].ir.terminator = Terminator::Condition {
            cond,
            true_block,
            false_block: loop_ladder,
        };
        self.pool.add_branch(ladder, true_block);
    }

    /// The loop ladder trivially falls into the shared merge block, and
    /// a selection construct cannot be broken out of directly, so the
    /// ladder becomes a pre/post pair:
    ///
    /// ```text
    /// ladder-pre -> old ladder -> ladder-post -> selection merge
    ///      \----------------------/
    /// ```
    fn build_pass_through_ladder(&mut self, loop_ladder: NodeId) {
        let ladder_pre = self.create_helper_pred_block(loop_ladder);
        let ladder_post = self.create_helper_succ_block(loop_ladder);
        self.pool.add_branch(ladder_pre, ladder_post);
        self.pool[ladder_pre].is_ladder = true;

        let cond = self.builder.allocate_id();
        let type_id = self.builder.make_bool_type();
        let mut phi = PhiNode {
            id: cond,
            type_id,
            incoming: Vec::new(),
        };
        for pred in self.pool[ladder_pre].pred.clone() {
            let id = self.builder.make_bool_constant(self.pool[pred].is_ladder);
            phi.incoming.push(IncomingValue {
                block: pred,
                id: Some(id),
            });
        }
        self.pool[ladder_pre].ir.phi.push(phi);

        self.pool[ladder_pre].ir.terminator = Terminator::Condition {
            cond,
            true_block: ladder_post,
            false_block: loop_ladder,
        };
    }

    /// No outer loop scope exists to break to: invent one. The shared
    /// merge block becomes the merge of a frozen synthetic loop wrapped
    /// around the outermost header, whose selection now merges to a new
    /// dummy block in front of it. Returns the dummy (which takes over
    /// the shared block's role in further processing) and the fallback
    /// break target.
    fn install_full_break_target(&mut self, node: NodeId, hdr: NodeId) -> (NodeId, NodeId) {
        let new_selection_merge = self.create_helper_pred_block(node);
        self.pool[new_selection_merge].headers = self.pool[node].headers.clone();

        let full_break_target = node;

        let outer_header = self.pool[node].headers[0];
        let outer_loop = self.create_helper_pred_block(outer_header);

        debug_assert!(self.pool[outer_header].merge == MergeType::Selection);
        self.pool[outer_header].selection_merge_block = Some(new_selection_merge);
        self.pool[node].headers[0] = outer_loop;

        self.pool[outer_loop].merge = MergeType::Loop;
        self.pool[outer_loop].loop_merge_block = Some(node);
        self.pool[outer_loop].freeze_structured_analysis = true;

        self.pool
            .traverse_dominated_blocks_and_rewrite_branch(hdr, new_selection_merge, node);

        (new_selection_merge, full_break_target)
    }

    // ---------------------------------------------------------------------
    // φ repair
    // ---------------------------------------------------------------------

    /// Restore the meaning of every φ after rewriting. Resolved top-down
    /// since later φ's may feed earlier ones.
    fn insert_phi(&mut self) {
        self.compute_dominance_frontier();

        let mut phi_nodes: Vec<(NodeId, usize)> = Vec::new();
        for i in 0..self.post_visit_order.len() {
            let node = self.post_visit_order[i];
            for phi_index in 0..self.pool[node].ir.phi.len() {
                phi_nodes.push((node, phi_index));
            }
        }
        phi_nodes.sort_by_key(|&(block, _)| std::cmp::Reverse(self.pool[block].visit_order));

        for (block, phi_index) in phi_nodes {
            self.insert_phi_for(block, phi_index);
        }
    }

    /// The incoming blocks used to branch to the φ's owner, but the
    /// structurizer may have re-routed them (ladders, most of all).
    /// Follow control flow from the incoming values and merge them at
    /// shared dominance frontiers until every incoming is a direct
    /// predecessor again.
    fn insert_phi_for(&mut self, owner: NodeId, phi_index: usize) {
        let mut incoming = std::mem::take(&mut self.pool[owner].ir.phi[phi_index].incoming);

        // The subset of the CFG reachable from the incoming values.
        let mut cfg_subset: HashSet<NodeId> = HashSet::new();
        for value in &incoming {
            self.pool.walk_cfg_from(value.block, &mut |n| {
                if cfg_subset.contains(&n) || n == owner {
                    false
                } else {
                    cfg_subset.insert(n);
                    true
                }
            });
        }

        loop {
            // Advance each input as close to a dominance frontier as it
            // gets along dominated single-successor chains.
            for value in &mut incoming {
                loop {
                    let b = value.block;
                    if self.pool[b].succ.len() == 1 && self.pool.dominates(b, self.pool[b].succ[0])
                    {
                        value.block = self.pool[b].succ[0];
                    } else {
                        break;
                    }
                }
            }

            // All inputs direct branches? Then the φ is complete.
            let preds = &self.pool[owner].pred;
            if incoming.iter().all(|value| preds.contains(&value.block)) {
                log::debug!("resolved phi inputs for {}", self.pool[owner].name);
                break;
            }

            // Pick the latest dominance frontier in the subset; merging
            // goes top to bottom.
            let mut frontier: Option<NodeId> = None;
            for value in &incoming {
                for i in 0..self.pool[value.block].dominance_frontier.len() {
                    let candidate = self.pool[value.block].dominance_frontier[i];
                    if cfg_subset.contains(&candidate)
                        && frontier
                            .is_none_or(|f| {
                                self.pool[candidate].visit_order > self.pool[f].visit_order
                            })
                    {
                        frontier = Some(candidate);
                    }
                }
            }
            let frontier = frontier.expect("phi repair finds a dominance frontier candidate");
            log::debug!("merging phi values at frontier {}", self.pool[frontier].name);

            // Remove inputs the frontier subsumes. An input still
            // reaching the owner on a path around the frontier must be
            // kept; it is used somewhere else.
            for input in self.pool[frontier].pred.clone() {
                let Some(index) = self.find_incoming_value(input, &incoming) else {
                    continue;
                };
                let block = incoming[index].block;
                if self.pool.exists_path_without(block, owner, frontier) {
                    log::debug!("keeping phi input in {}", self.pool[block].name);
                } else {
                    log::debug!("removing phi input in {}", self.pool[block].name);
                    incoming.remove(index);
                }
            }

            // The frontier now carries a φ of its own; its id is
            // allocated when the block is emitted.
            cfg_subset.remove(&frontier);
            incoming.push(IncomingValue {
                block: frontier,
                id: None,
            });
        }

        self.pool[owner].ir.phi[phi_index].incoming = incoming;
    }

    /// The incoming block dominating `frontier_pred` with the lowest
    /// post visit order — several inputs may dominate, the most
    /// immediate dominator wins.
    fn find_incoming_value(&self, frontier_pred: NodeId, incoming: &[IncomingValue]) -> Option<usize> {
        let mut candidate: Option<usize> = None;
        for (i, value) in incoming.iter().enumerate() {
            if self.pool.dominates(value.block, frontier_pred) {
                let better = match candidate {
                    None => true,
                    Some(c) => {
                        self.pool[value.block].visit_order
                            < self.pool[incoming[c].block].visit_order
                    }
                };
                if better {
                    candidate = Some(i);
                }
            }
        }
        candidate
    }

    // ---------------------------------------------------------------------
    // Validation and emission
    // ---------------------------------------------------------------------

    /// Check the structural invariants the emitter depends on, reporting
    /// violations as warnings; the downstream IR validator has the final
    /// word. Merge blocks that were never found (infinite loops,
    /// never-merging selections) are synthesized here as unreachable
    /// nodes so emitted merge info is always complete.
    fn validate_structured(&mut self) {
        for i in 0..self.post_visit_order.len() {
            let node = self.post_visit_order[i];

            if self.pool[node].headers.len() > 1 {
                log::warn!(
                    "block {} is the merge target of {} constructs",
                    self.pool[node].name,
                    self.pool[node].headers.len()
                );
            }

            match self.pool[node].merge {
                MergeType::Loop => {
                    let merge = match self.pool[node].loop_merge_block {
                        Some(merge) => merge,
                        None => {
                            log::debug!("loop {} has no merge block", self.pool[node].name);
                            let name = format!("{}.unreachable", self.pool[node].name);
                            let dummy = self.pool.create_node(name);
                            self.pool[node].loop_merge_block = Some(dummy);
                            dummy
                        }
                    };
                    if !self.pool.dominates(node, merge) && !self.pool[merge].pred.is_empty() {
                        log::warn!(
                            "loop header {} does not dominate its merge block {}",
                            self.pool[node].name,
                            self.pool[merge].name
                        );
                    }
                }
                MergeType::Selection => {
                    let merge = match self.pool[node].selection_merge_block {
                        Some(merge) => merge,
                        None => {
                            log::debug!("selection {} has no merge block", self.pool[node].name);
                            let name = format!("{}.unreachable", self.pool[node].name);
                            let dummy = self.pool.create_node(name);
                            self.pool[node].selection_merge_block = Some(dummy);
                            dummy
                        }
                    };
                    if !self.pool.dominates(node, merge) && !self.pool[merge].pred.is_empty() {
                        log::warn!(
                            "selection header {} does not dominate its merge block {}",
                            self.pool[node].name,
                            self.pool[merge].name
                        );
                    }
                }
                MergeType::None => {}
            }

            if self.pool[node].succ.len() >= 2 && self.pool[node].merge == MergeType::None {
                // Not necessarily fatal; the downstream validator has
                // the final word.
                log::warn!(
                    "block {} has {} successors but no merge annotation",
                    self.pool[node].name,
                    self.pool[node].succ.len()
                );
            }

            // Every forward edge must be backed by a terminator target.
            let targets = self.pool[node].ir.terminator.targets();
            for i in 0..self.pool[node].succ.len() {
                let succ = self.pool[node].succ[i];
                if !targets.contains(&succ) {
                    log::warn!(
                        "block {} branches to {} without a terminator target",
                        self.pool[node].name,
                        self.pool[succ].name
                    );
                }
            }
        }
        log::debug!("CFG validation finished");
    }

    /// Hand every reachable block to the emitter. All blocks are
    /// registered first; emission runs in reverse post-order so
    /// dominating blocks come before dominated ones, with each block's
    /// merge annotation populated just before it is emitted.
    pub fn traverse(&mut self, iface: &mut dyn BlockEmission) {
        for i in 0..self.post_visit_order.len() {
            iface.register_block(self.pool, self.post_visit_order[i]);
        }

        for index in (0..self.post_visit_order.len()).rev() {
            let block = self.post_visit_order[index];
            match self.pool[block].merge {
                MergeType::Selection => {
                    let merge_block = self.pool[block].selection_merge_block;
                    self.pool[block].ir.merge_info.merge_type = MergeType::Selection;
                    self.pool[block].ir.merge_info.merge_block = merge_block;
                    if let Some(merge) = merge_block {
                        iface.register_block(self.pool, merge);
                    }
                    iface.emit_basic_block(self.pool, block);
                }
                MergeType::Loop => {
                    let merge_block = self.pool[block].loop_merge_block;
                    let continue_block = self.pool[block].pred_back_edge;
                    self.pool[block].ir.merge_info.merge_type = MergeType::Loop;
                    self.pool[block].ir.merge_info.merge_block = merge_block;
                    self.pool[block].ir.merge_info.continue_block = continue_block;
                    if let Some(merge) = merge_block {
                        iface.register_block(self.pool, merge);
                    }
                    if let Some(cont) = continue_block {
                        iface.register_block(self.pool, cont);
                    }
                    iface.emit_basic_block(self.pool, block);
                }
                MergeType::None => {
                    iface.emit_basic_block(self.pool, block);
                }
            }
        }
    }
}

// -------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use super::*;
    use crate::entity::EntityRef;
    use crate::ir::{MergeInfo, SwitchCase, TypeId, ValueId};

    /// Counter-based stand-in for the target module builder.
    #[derive(Default)]
    struct TestBuilder {
        next_id: u32,
        names: HashMap<u32, String>,
        bool_constants: HashMap<u32, bool>,
    }

    impl IrBuilder for TestBuilder {
        fn allocate_id(&mut self) -> ValueId {
            let id = ValueId::new(self.next_id);
            self.next_id += 1;
            id
        }

        fn make_bool_type(&mut self) -> TypeId {
            TypeId::new(1)
        }

        fn make_bool_constant(&mut self, value: bool) -> ValueId {
            let id = self.allocate_id();
            self.bool_constants.insert(id.index(), value);
            id
        }

        fn make_uint_type(&mut self, _width: u32) -> TypeId {
            TypeId::new(2)
        }

        fn add_name(&mut self, id: ValueId, name: &str) {
            self.names.insert(id.index(), name.to_string());
        }
    }

    /// Test graph builder: blocks come into existence on first mention,
    /// defaulting to a Return terminator.
    #[derive(Default)]
    struct Graph {
        pool: NodePool,
        blocks: HashMap<String, NodeId>,
        builder: TestBuilder,
    }

    impl Graph {
        fn get(&mut self, name: &str) -> NodeId {
            if let Some(&id) = self.blocks.get(name) {
                return id;
            }
            let id = self.pool.create_node(name);
            self.pool[id].ir.terminator = Terminator::Return;
            self.blocks.insert(name.to_string(), id);
            id
        }

        fn branch(&mut self, from: &str, to: &str) {
            let f = self.get(from);
            let t = self.get(to);
            self.pool.add_branch(f, t);
            self.pool[f].ir.terminator = Terminator::Branch { target: t };
        }

        fn selection(&mut self, from: &str, on_true: &str, on_false: &str) {
            let f = self.get(from);
            let t = self.get(on_true);
            let e = self.get(on_false);
            self.pool.add_branch(f, t);
            self.pool.add_branch(f, e);
            let cond = self.builder.allocate_id();
            self.builder.add_name(cond, &format!("{from}_sel"));
            self.pool[f].ir.terminator = Terminator::Condition {
                cond,
                true_block: t,
                false_block: e,
            };
        }

        fn switch_block(&mut self, from: &str, cases: &[&str], default: &str) {
            let f = self.get(from);
            let mut case_list = Vec::new();
            for (i, case) in cases.iter().enumerate() {
                let c = self.get(case);
                self.pool.add_branch(f, c);
                case_list.push(SwitchCase {
                    value: i as u32,
                    block: c,
                });
            }
            let d = self.get(default);
            self.pool.add_branch(f, d);
            let cond = self.builder.allocate_id();
            self.pool[f].ir.terminator = Terminator::Switch {
                cond,
                cases: case_list,
                default_block: d,
            };
        }

        fn phi(&mut self, at: &str, from: &[&str]) {
            let p = self.get(at);
            let id = self.builder.allocate_id();
            let type_id = self.builder.make_uint_type(32);
            let mut incoming = Vec::new();
            for name in from {
                let block = self.get(name);
                let value = self.builder.allocate_id();
                incoming.push(IncomingValue {
                    block,
                    id: Some(value),
                });
            }
            self.pool[p].ir.phi.push(PhiNode {
                id,
                type_id,
                incoming,
            });
        }

        /// Run the structurizer and return the (possibly reassigned)
        /// entry block.
        fn run(&mut self, entry: &str) -> Result<NodeId, StructurizeError> {
            let entry = self.get(entry);
            let mut structurizer = Structurizer::new(entry, &mut self.pool, &mut self.builder);
            structurizer.run()?;
            Ok(structurizer.entry_block())
        }
    }

    /// Records registration ids and emission order.
    #[derive(Default)]
    struct RecordingEmitter {
        next_id: u32,
        emitted: Vec<NodeId>,
        merges: Vec<(NodeId, MergeInfo)>,
    }

    impl BlockEmission for RecordingEmitter {
        fn register_block(&mut self, pool: &mut NodePool, node: NodeId) {
            if pool[node].id.is_none() {
                self.next_id += 1;
                pool[node].id = Some(ValueId::new(self.next_id));
            }
        }

        fn emit_basic_block(&mut self, pool: &NodePool, node: NodeId) {
            self.emitted.push(node);
            self.merges.push((node, pool[node].ir.merge_info));
        }
    }

    fn assert_phi_inputs_are_preds(pool: &NodePool) {
        for (id, node) in pool.iter() {
            for phi in &node.ir.phi {
                for value in &phi.incoming {
                    assert!(
                        node.pred.contains(&value.block),
                        "phi input {} is not a predecessor of {}",
                        pool[value.block].name,
                        pool[id].name
                    );
                }
            }
        }
    }

    fn assert_single_headers(pool: &NodePool) {
        for (_, node) in pool.iter() {
            assert!(
                node.headers.len() <= 1,
                "{} is claimed by {} constructs",
                node.name,
                node.headers.len()
            );
        }
    }

    fn assert_back_edges_stripped(pool: &NodePool) {
        for (_, node) in pool.iter() {
            if let Some(back) = node.succ_back_edge {
                assert!(!node.succ.contains(&back));
            }
            if let Some(back) = node.pred_back_edge {
                assert!(!node.pred.contains(&back));
            }
        }
    }

    #[test]
    fn test_dominators() {
        //   entry -> a, b
        //   a -> merge
        //   b -> merge
        let mut g = Graph::default();
        g.selection("entry", "a", "b");
        g.branch("a", "merge");
        g.branch("b", "merge");

        let entry = g.get("entry");
        let a = g.get("a");
        let b = g.get("b");
        let merge = g.get("merge");

        let mut s = Structurizer::new(entry, &mut g.pool, &mut g.builder);
        s.recompute_cfg().unwrap();

        assert!(s.pool.dominates(entry, a));
        assert!(s.pool.dominates(entry, b));
        assert!(s.pool.dominates(entry, merge));
        assert!(!s.pool.dominates(a, merge));
        assert!(!s.pool.dominates(b, merge));
        assert_eq!(s.pool[merge].immediate_dominator, Some(entry));
        assert_eq!(s.pool[entry].immediate_dominator, None);
    }

    #[test]
    fn test_post_order_is_topological() {
        let mut g = Graph::default();
        g.selection("entry", "b0", "exit");
        g.selection("b0", "inner", "merge");
        g.selection("inner", "exit", "merge");
        g.branch("merge", "exit");

        let entry = g.get("entry");
        let mut s = Structurizer::new(entry, &mut g.pool, &mut g.builder);
        s.recompute_cfg().unwrap();

        // Post-order is a permutation of reachable nodes.
        assert_eq!(s.post_visit_order.len(), s.pool.len());
        for (i, &n) in s.post_visit_order.iter().enumerate() {
            assert_eq!(s.pool[n].visit_order, i);
        }
        // Forward edges strictly decrease in post-visit order.
        for (_, node) in s.pool.iter() {
            for &succ in &node.succ {
                assert!(node.visit_order > s.pool[succ].visit_order);
            }
        }
    }

    #[test]
    fn test_diamond_selection_merge() {
        let mut g = Graph::default();
        g.selection("entry", "b1", "b2");
        g.branch("b1", "exit");
        g.branch("b2", "exit");

        let entry = g.get("entry");
        let exit = g.get("exit");
        g.run("entry").unwrap();

        let pool = &g.pool;
        assert_eq!(pool[entry].merge, MergeType::Selection);
        assert_eq!(pool[entry].selection_merge_block, Some(exit));
        assert_eq!(pool[exit].headers, vec![entry]);
        // No helpers needed for a plain diamond.
        assert_eq!(pool.len(), 4);
        assert_phi_inputs_are_preds(pool);
        assert_single_headers(pool);
    }

    #[test]
    fn test_simple_loop() {
        //   entry -> header -> { body -> header (back edge), exit }
        let mut g = Graph::default();
        g.branch("entry", "header");
        g.selection("header", "body", "exit");
        g.branch("body", "header");

        let header = g.get("header");
        let body = g.get("body");
        let exit = g.get("exit");
        g.run("entry").unwrap();

        let pool = &g.pool;
        assert_eq!(pool[header].merge, MergeType::Loop);
        assert_eq!(pool[header].loop_merge_block, Some(exit));
        // The back edge lives in the dedicated slots only.
        assert_eq!(pool[header].pred_back_edge, Some(body));
        assert_eq!(pool[body].succ_back_edge, Some(header));
        assert!(pool[body].succ.is_empty());
        assert!(!pool[header].pred.contains(&body));
        assert_back_edges_stripped(pool);
        assert_single_headers(pool);
    }

    #[test]
    fn test_traverse_emission() {
        let mut g = Graph::default();
        g.branch("entry", "header");
        g.selection("header", "body", "exit");
        g.branch("body", "header");

        let entry = g.get("entry");
        let header = g.get("header");
        let body = g.get("body");
        let exit = g.get("exit");

        let mut s = Structurizer::new(entry, &mut g.pool, &mut g.builder);
        s.run().unwrap();

        let mut emitter = RecordingEmitter::default();
        s.traverse(&mut emitter);

        // Every reachable block exactly once, dominators first.
        assert_eq!(emitter.emitted.len(), 4);
        assert_eq!(emitter.emitted[0], entry);
        let unique: HashSet<NodeId> = emitter.emitted.iter().copied().collect();
        assert_eq!(unique.len(), 4);
        for &n in &emitter.emitted {
            assert!(s.pool[n].id.is_some());
        }

        let (_, info) = emitter
            .merges
            .iter()
            .find(|(n, _)| *n == header)
            .expect("loop header was emitted");
        assert_eq!(info.merge_type, MergeType::Loop);
        assert_eq!(info.merge_block, Some(exit));
        assert_eq!(info.continue_block, Some(body));

        let (_, info) = emitter.merges.iter().find(|(n, _)| *n == body).unwrap();
        assert_eq!(info.merge_type, MergeType::None);
    }

    #[test]
    fn test_infinite_loop_gets_unreachable_merge() {
        let mut g = Graph::default();
        g.branch("entry", "header");
        g.branch("header", "body");
        g.branch("body", "header");

        let header = g.get("header");
        g.run("entry").unwrap();

        let pool = &g.pool;
        assert_eq!(pool[header].merge, MergeType::Loop);
        let merge = pool[header].loop_merge_block.expect("synthesized merge");
        assert!(pool[merge].pred.is_empty());
        assert!(matches!(pool[merge].ir.terminator, Terminator::Unreachable));
    }

    #[test]
    fn test_break_out_of_selection() {
        //   entry -> { b0, exit }
        //   b0    -> { inner, merge }
        //   inner -> { exit, merge }      breaks past its own construct
        //   merge -> exit
        let mut g = Graph::default();
        g.selection("entry", "b0", "exit");
        g.selection("b0", "inner", "merge");
        g.selection("inner", "exit", "merge");
        g.branch("merge", "exit");

        let entry = g.get("entry");
        let b0 = g.get("b0");
        let new_entry = g.run("entry").unwrap();

        let pool = &g.pool;
        // The outermost header was wrapped in a synthetic loop shell so
        // the break has somewhere legal to land.
        assert_ne!(new_entry, entry);
        assert!(pool
            .iter()
            .any(|(_, n)| n.freeze_structured_analysis && n.merge == MergeType::Loop));

        assert_eq!(pool[b0].merge, MergeType::Selection);
        let b0_merge = pool[b0].selection_merge_block.unwrap();
        assert!(pool.dominates(b0, b0_merge));

        assert_eq!(pool[entry].merge, MergeType::Selection);
        let entry_merge = pool[entry].selection_merge_block.unwrap();
        assert!(pool.dominates(entry, entry_merge));

        // Every multi-way branch got a merge annotation.
        for (_, n) in pool.iter() {
            if n.succ.len() >= 2 {
                assert_ne!(n.merge, MergeType::None, "{} has no merge", n.name);
            }
        }
        assert_single_headers(pool);
        assert_back_edges_stripped(pool);
    }

    #[test]
    fn test_nested_multi_break() {
        //   entry -> a -> b -> c -> d -> m
        //   with shortcuts a -> m, b -> m, c -> m, d -> m.
        //   Each layer of the onion gets its own ladder merge.
        let mut g = Graph::default();
        g.branch("entry", "a");
        g.selection("a", "b", "m");
        g.selection("b", "c", "m");
        g.selection("c", "d", "m");
        g.branch("d", "m");

        let a = g.get("a");
        let b = g.get("b");
        let c = g.get("c");
        let m = g.get("m");
        g.run("entry").unwrap();

        let pool = &g.pool;
        // One ladder per inner nesting layer.
        assert_eq!(pool.len(), 8);

        assert_eq!(pool[a].merge, MergeType::Selection);
        assert_eq!(pool[a].selection_merge_block, Some(m));

        let b_merge = pool[b].selection_merge_block.unwrap();
        let c_merge = pool[c].selection_merge_block.unwrap();
        assert_ne!(b_merge, m);
        assert_ne!(c_merge, m);
        assert_ne!(b_merge, c_merge);
        assert!(pool.dominates(b, b_merge));
        assert!(pool.dominates(c, c_merge));

        // The only escapes into m are the header's own edge and the
        // outermost ladder.
        assert_eq!(pool[m].pred.len(), 2);
        assert!(pool[m].pred.contains(&a));
        assert_single_headers(pool);
    }

    #[test]
    fn test_loop_with_two_exits() {
        //   header -> { body1 -> { header (back edge), exit_a },
        //               body2 -> exit_b }
        //   exit_a -> merge, exit_b -> merge
        let mut g = Graph::default();
        g.branch("entry", "header");
        g.selection("header", "body1", "body2");
        g.selection("body1", "header", "exit_a");
        g.branch("body2", "exit_b");
        g.branch("exit_a", "merge");
        g.branch("exit_b", "merge");

        let header = g.get("header");
        let body1 = g.get("body1");
        g.run("entry").unwrap();

        let pool = &g.pool;
        assert_eq!(pool[header].merge, MergeType::Loop);
        assert_eq!(pool[header].pred_back_edge, Some(body1));

        // The escaping exit is serialized through a ladder whose bool φ
        // discriminates the exit_a and exit_b paths.
        let ladder = pool
            .iter()
            .find(|(_, n)| n.is_ladder && !n.ir.phi.is_empty())
            .map(|(id, _)| id)
            .expect("ladder block with a discriminator phi");
        assert!(matches!(
            pool[ladder].ir.terminator,
            Terminator::Condition { .. }
        ));
        let phi = &pool[ladder].ir.phi[0];
        let values: Vec<bool> = phi
            .incoming
            .iter()
            .map(|v| g.builder.bool_constants[&v.id.unwrap().index()])
            .collect();
        assert!(values.contains(&true));
        assert!(values.contains(&false));

        // The loop grew a frozen outer shell to break from.
        assert!(pool
            .iter()
            .any(|(_, n)| n.freeze_structured_analysis && n.merge == MergeType::Loop));
        assert_phi_inputs_are_preds(pool);
        assert_back_edges_stripped(pool);
    }

    #[test]
    fn test_rerun_keeps_frozen_analysis() {
        let mut g = Graph::default();
        g.branch("entry", "header");
        g.selection("header", "body1", "body2");
        g.selection("body1", "header", "exit_a");
        g.branch("body2", "exit_b");
        g.branch("exit_a", "merge");
        g.branch("exit_b", "merge");

        let entry_after_first = g.run("entry").unwrap();
        let frozen: Vec<(NodeId, Option<NodeId>)> = g
            .pool
            .iter()
            .filter(|(_, n)| n.freeze_structured_analysis)
            .map(|(id, n)| (id, n.loop_merge_block))
            .collect();
        assert!(!frozen.is_empty());

        let mut s = Structurizer::new(entry_after_first, &mut g.pool, &mut g.builder);
        s.run().unwrap();

        for (id, loop_merge_block) in frozen {
            assert!(g.pool[id].freeze_structured_analysis);
            assert_eq!(g.pool[id].merge, MergeType::Loop);
            assert_eq!(g.pool[id].loop_merge_block, loop_merge_block);
        }
    }

    #[test]
    fn test_switch_merge() {
        let mut g = Graph::default();
        g.branch("entry", "sw");
        g.switch_block("sw", &["case0", "case1", "case2"], "m");
        g.branch("case0", "m");
        g.branch("case1", "m");
        g.branch("case2", "m");

        let sw = g.get("sw");
        let m = g.get("m");
        g.run("entry").unwrap();

        let pool = &g.pool;
        assert!(pool[sw].is_switch);
        assert_eq!(pool[sw].merge, MergeType::Selection);
        assert_eq!(pool[sw].selection_merge_block, Some(m));
        assert_eq!(pool[m].headers, vec![sw]);
    }

    #[test]
    fn test_switch_fallthrough() {
        //   case0 falls through into case1; the join at case1 must not
        //   be treated as a merge scenario.
        let mut g = Graph::default();
        g.branch("entry", "sw");
        g.switch_block("sw", &["case0", "case1"], "m");
        g.selection("case0", "m", "case1");
        g.branch("case1", "m");

        let sw = g.get("sw");
        let m = g.get("m");
        let case0 = g.get("case0");
        let case1 = g.get("case1");
        g.run("entry").unwrap();

        let pool = &g.pool;
        assert_eq!(pool[sw].merge, MergeType::Selection);
        assert_eq!(pool[sw].selection_merge_block, Some(m));
        // The fallthrough join carries no construct of its own, and the
        // conditional case break is not merged to the switch merge.
        assert!(pool[case1].headers.is_empty());
        assert_eq!(pool[case0].merge, MergeType::None);
    }

    #[test]
    fn test_phi_direct_preds_untouched() {
        let mut g = Graph::default();
        g.selection("entry", "b1", "b2");
        g.branch("b1", "exit");
        g.branch("b2", "exit");
        g.phi("exit", &["b1", "b2"]);

        let b1 = g.get("b1");
        let b2 = g.get("b2");
        let exit = g.get("exit");
        g.run("entry").unwrap();

        let pool = &g.pool;
        let phi = &pool[exit].ir.phi[0];
        assert_eq!(phi.incoming.len(), 2);
        let blocks: HashSet<NodeId> = phi.incoming.iter().map(|v| v.block).collect();
        assert_eq!(blocks, HashSet::from([b1, b2]));
        assert!(phi.incoming.iter().all(|v| v.id.is_some()));
    }

    #[test]
    fn test_phi_through_ladder() {
        //   Two nested loops; l1.cond escapes both straight to b0.exit.
        //   The φ at b0.exit must be rewritten against the laddered
        //   predecessor set.
        let mut g = Graph::default();
        g.branch("entry", "b0");
        g.selection("b0", "l0", "b0.exit");
        g.selection("l0", "l1", "c0");
        g.branch("l1", "l1.cond");
        g.selection("l1.cond", "b0.exit", "c1");
        g.selection("c1", "l1", "m1");
        g.branch("m1", "c0");
        g.selection("c0", "l0", "l0.exit");
        g.branch("l0.exit", "b0.exit");
        g.phi("b0.exit", &["b0", "l1.cond", "l0.exit"]);

        let b0_exit = g.get("b0.exit");
        let l0 = g.get("l0");
        let l1 = g.get("l1");
        let c0 = g.get("c0");
        let c1 = g.get("c1");
        g.run("entry").unwrap();

        let pool = &g.pool;
        // Both loops discovered, with their latches in the back-edge
        // slots.
        assert_eq!(pool[l0].merge, MergeType::Loop);
        assert_eq!(pool[l1].merge, MergeType::Loop);
        assert_eq!(pool[l0].pred_back_edge, Some(c0));
        assert_eq!(pool[l1].pred_back_edge, Some(c1));

        let phi = &pool[b0_exit].ir.phi[0];
        assert!(!phi.incoming.is_empty());
        for value in &phi.incoming {
            assert!(pool[b0_exit].pred.contains(&value.block));
        }
        assert_phi_inputs_are_preds(pool);
        assert_back_edges_stripped(pool);
    }

    #[test]
    fn test_helper_blocks_preserve_edges() {
        let mut g = Graph::default();
        g.branch("entry", "a");
        g.branch("a", "b");

        let entry = g.get("entry");
        let a = g.get("a");
        let b = g.get("b");

        let mut s = Structurizer::new(entry, &mut g.pool, &mut g.builder);
        s.recompute_cfg().unwrap();

        let pred = s.create_helper_pred_block(a);
        let succ = s.create_helper_succ_block(a);

        // The externally observed chain is entry -> pred -> a -> succ -> b.
        assert_eq!(s.pool[entry].succ, vec![pred]);
        assert_eq!(s.pool[pred].succ, vec![a]);
        assert_eq!(s.pool[a].succ, vec![succ]);
        assert_eq!(s.pool[succ].succ, vec![b]);
        assert_eq!(s.pool[b].pred, vec![succ]);
        assert_eq!(s.pool[entry].ir.terminator, Terminator::Branch { target: pred });
        assert_eq!(s.pool[succ].ir.terminator, Terminator::Branch { target: b });
        assert_eq!(s.entry_block(), entry);

        // Wrapping the entry reassigns it.
        let new_entry = s.create_helper_pred_block(entry);
        assert_eq!(s.entry_block(), new_entry);
    }

    #[test]
    fn test_multiple_back_edges_rejected() {
        let mut g = Graph::default();
        g.branch("entry", "header");
        g.selection("header", "b1", "b2");
        g.branch("b1", "header");
        g.branch("b2", "header");

        let err = g.run("entry").unwrap_err();
        assert!(matches!(err, StructurizeError::MultipleBackEdges { .. }));
    }

    #[test]
    fn test_irreducible_rejected() {
        let mut g = Graph::default();
        g.selection("entry", "a", "b");
        g.branch("a", "b");
        g.branch("b", "a");

        let err = g.run("entry").unwrap_err();
        assert!(matches!(err, StructurizeError::Irreducible { .. }));
    }
}
