//! CFG node arena and graph-level queries.
//!
//! Nodes are owned by a [`NodePool`] and referenced by [`NodeId`]
//! everywhere else. Back edges never appear in the `pred`/`succ` lists;
//! after a DFS they live only in the dedicated back-edge slots, so every
//! query here runs on a forward DAG and needs no cycle handling.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::define_entity;
use crate::entity::PrimaryMap;
use crate::ir::{MergeInfo, MergeType, PhiNode, Terminator, ValueId};

define_entity!(NodeId);

/// IR payload of a block: terminator, φ-nodes, and the merge annotation
/// filled in for the emitter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeIr {
    pub terminator: Terminator,
    pub phi: Vec<PhiNode>,
    pub merge_info: MergeInfo,
}

/// A basic block in the CFG under structurization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Debug name. Synthesized blocks derive theirs from a neighbor.
    pub name: String,
    /// Backend id, assigned by the emitter on registration.
    pub id: Option<ValueId>,

    /// Forward predecessors/successors only.
    pub pred: Vec<NodeId>,
    pub succ: Vec<NodeId>,
    /// The single retreating edge this node closes (as latch) or opens
    /// (as loop header). At most one each; more is unsupported input.
    pub pred_back_edge: Option<NodeId>,
    pub succ_back_edge: Option<NodeId>,

    /// Post-order position from the most recent DFS.
    pub visit_order: usize,
    /// `None` only for the entry block.
    pub immediate_dominator: Option<NodeId>,
    pub dominance_frontier: Vec<NodeId>,

    /// Construct headers claiming this block as their merge target.
    /// More than one triggers block splitting.
    pub headers: Vec<NodeId>,
    pub merge: MergeType,
    pub selection_merge_block: Option<NodeId>,
    pub loop_merge_block: Option<NodeId>,
    pub loop_ladder_block: Option<NodeId>,

    /// More than two forward successors after back-edge stripping.
    pub is_switch: bool,
    pub is_ladder: bool,
    /// Keeps merge state across traversal resets. Set on synthesized
    /// construct shells whose structural role must not be re-analyzed.
    pub freeze_structured_analysis: bool,

    #[serde(skip)]
    pub visited: bool,
    #[serde(skip)]
    pub traversing: bool,

    pub ir: NodeIr,
}

impl Node {
    fn new(name: String) -> Self {
        Node {
            name,
            id: None,
            pred: Vec::new(),
            succ: Vec::new(),
            pred_back_edge: None,
            succ_back_edge: None,
            visit_order: 0,
            immediate_dominator: None,
            dominance_frontier: Vec::new(),
            headers: Vec::new(),
            merge: MergeType::None,
            selection_merge_block: None,
            loop_merge_block: None,
            loop_ladder_block: None,
            is_switch: false,
            is_ladder: false,
            freeze_structured_analysis: false,
            visited: false,
            traversing: false,
            ir: NodeIr::default(),
        }
    }

    pub fn num_forward_preds(&self) -> usize {
        self.pred.len()
    }
}

/// Arena owning every CFG node, including helpers synthesized mid-pass.
/// Nodes are never destroyed; the pool is dropped wholesale when
/// compilation of the function finishes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePool {
    nodes: PrimaryMap<NodeId, Node>,
}

impl std::ops::Index<NodeId> for NodePool {
    type Output = Node;
    fn index(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }
}

impl std::ops::IndexMut<NodeId> for NodePool {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }
}

impl NodePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_node(&mut self, name: impl Into<String>) -> NodeId {
        self.nodes.push(Node::new(name.into()))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    // ---------------------------------------------------------------------
    // Edge mutation
    // ---------------------------------------------------------------------

    /// Add a forward edge `from -> to`. Both directions are kept unique;
    /// the terminator is the caller's responsibility.
    pub fn add_branch(&mut self, from: NodeId, to: NodeId) {
        if !self[from].succ.contains(&to) {
            self[from].succ.push(to);
        }
        if !self[to].pred.contains(&from) {
            self[to].pred.push(from);
        }
    }

    /// Record `header` as a construct claiming `node` as merge target.
    pub fn add_unique_header(&mut self, node: NodeId, header: NodeId) {
        if !self[node].headers.contains(&header) {
            self[node].headers.push(header);
        }
    }

    /// Rewrite the edge `node -> from` into `node -> to`, updating pred
    /// lists and the terminator. φ incoming entries in `from` are left
    /// alone; φ repair reconciles them after all rewriting is done.
    pub fn retarget_branch(&mut self, node: NodeId, from: NodeId, to: NodeId) {
        if from == to {
            return;
        }
        log::debug!(
            "retarget branch {} -> {} to {} -> {}",
            self[node].name,
            self[from].name,
            self[node].name,
            self[to].name
        );

        self[from].pred.retain(|&p| p != node);
        if self[node].succ.contains(&to) {
            self[node].succ.retain(|&s| s != from);
        } else {
            for s in self[node].succ.iter_mut() {
                if *s == from {
                    *s = to;
                }
            }
        }
        if !self[to].pred.contains(&node) {
            self[to].pred.push(node);
        }
        self[node].ir.terminator.retarget(from, to);
    }

    /// After `new_pred` has taken over `old`'s predecessor list, point
    /// every one of those predecessors (edges and terminators) at
    /// `new_pred` instead of `old`.
    pub fn retarget_pred_from(&mut self, new_pred: NodeId, old: NodeId) {
        let preds = self[new_pred].pred.clone();
        for p in preds {
            for s in self[p].succ.iter_mut() {
                if *s == old {
                    *s = new_pred;
                }
            }
            self[p].ir.terminator.retarget(old, new_pred);
        }
    }

    /// After `new_succ` has taken over `old`'s successor list, point
    /// every one of those successors' pred lists at `new_succ`.
    pub fn retarget_succ_from(&mut self, new_succ: NodeId, old: NodeId) {
        let succs = self[new_succ].succ.clone();
        for s in succs {
            for p in self[s].pred.iter_mut() {
                if *p == old {
                    *p = new_succ;
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Dominator queries
    // ---------------------------------------------------------------------

    /// Check if `a` dominates `b` by walking `b`'s idom chain.
    pub fn dominates(&self, a: NodeId, b: NodeId) -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self[cur].immediate_dominator {
                Some(parent) if parent != cur => cur = parent,
                _ => return false,
            }
        }
    }

    /// Nearest common dominator of two nodes, walking by `visit_order`.
    /// Both nodes must already have immediate dominators (reverse
    /// post-order construction guarantees this for forward preds).
    pub fn common_dominator(&self, mut a: NodeId, mut b: NodeId) -> NodeId {
        while a != b {
            if self[a].visit_order < self[b].visit_order {
                a = self[a]
                    .immediate_dominator
                    .expect("idom chain must reach the entry block");
            } else {
                b = self[b]
                    .immediate_dominator
                    .expect("idom chain must reach the entry block");
            }
        }
        a
    }

    /// Recompute a node's immediate dominator as the intersection over
    /// its forward predecessors. Predecessors outside the current DFS
    /// (stale edges from unreachable helpers) are ignored.
    pub fn recompute_immediate_dominator(&mut self, node: NodeId) {
        let mut idom: Option<NodeId> = None;
        let preds = self[node].pred.clone();
        for p in preds {
            if !self[p].visited {
                continue;
            }
            idom = Some(match idom {
                None => p,
                Some(current) => self.common_dominator(current, p),
            });
        }
        self[node].immediate_dominator = idom;
    }

    /// Recompute the dominance frontier of `header`: successors leaving
    /// its dominated region, discovered by a forward walk within it.
    pub fn recompute_dominance_frontier(&mut self, header: NodeId) {
        self[header].dominance_frontier.clear();
        let mut traversed = HashSet::new();
        let mut stack = vec![header];
        let mut frontier = Vec::new();
        while let Some(n) = stack.pop() {
            if !traversed.insert(n) {
                continue;
            }
            for i in 0..self[n].succ.len() {
                let s = self[n].succ[i];
                if self.dominates(header, s) {
                    stack.push(s);
                } else if !frontier.contains(&s) {
                    frontier.push(s);
                }
            }
        }
        self[header].dominance_frontier = frontier;
    }

    // ---------------------------------------------------------------------
    // Reachability and structural classification
    // ---------------------------------------------------------------------

    /// Every node reachable forward from `node` is dominated by it and
    /// carries no outgoing back edge — i.e. `node` stands between the
    /// construct and all terminal blocks it can reach.
    pub fn dominates_all_reachable_exits(&self, node: NodeId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            if !seen.insert(n) {
                continue;
            }
            if self[n].succ_back_edge.is_some() {
                return false;
            }
            for &s in &self[n].succ {
                if !self.dominates(node, s) {
                    return false;
                }
                stack.push(s);
            }
        }
        true
    }

    /// A loop header may merge to `candidate` only if its continue block
    /// either has no forward successors or branches directly to the
    /// candidate; otherwise the latch would exit the loop somewhere the
    /// merge cannot see, and a ladder is required.
    pub fn can_loop_merge_to(&self, header: NodeId, candidate: NodeId) -> bool {
        let Some(cont) = self[header].pred_back_edge else {
            return true;
        };
        let cont_succ = &self[cont].succ;
        cont_succ.is_empty() || cont_succ.contains(&candidate)
    }

    /// No other loop header sits on the idom chain between `other` and
    /// `header`.
    pub fn is_innermost_loop_header_for(&self, header: NodeId, other: NodeId) -> bool {
        let mut node = other;
        while node != header {
            if self[node].pred_back_edge.is_some() {
                return false;
            }
            match self[node].immediate_dominator {
                Some(idom) if idom != node => node = idom,
                _ => return true,
            }
        }
        true
    }

    /// Nearest strict dominator with two or more forward successors.
    pub fn outer_selection_dominator(&self, node: NodeId) -> Option<NodeId> {
        let mut cur = self[node].immediate_dominator?;
        loop {
            if self[cur].succ.len() >= 2 {
                return Some(cur);
            }
            let next = self[cur].immediate_dominator?;
            if next == cur {
                return None;
            }
            cur = next;
        }
    }

    /// Nearest strict dominator that heads a construct: two or more
    /// forward successors, or an incoming back edge.
    pub fn outer_header_dominator(&self, node: NodeId) -> Option<NodeId> {
        let mut cur = self[node].immediate_dominator?;
        loop {
            if self[cur].succ.len() >= 2 || self[cur].pred_back_edge.is_some() {
                return Some(cur);
            }
            let next = self[cur].immediate_dominator?;
            if next == cur {
                return None;
            }
            cur = next;
        }
    }

    /// Walk forward from `from` (the start node itself is not reported).
    /// `op` returns whether to keep descending past the reported node;
    /// the callback is responsible for deduplication.
    pub fn walk_cfg_from(&self, from: NodeId, op: &mut dyn FnMut(NodeId) -> bool) {
        let mut stack: Vec<NodeId> = self[from].succ.clone();
        while let Some(n) = stack.pop() {
            if op(n) {
                stack.extend(self[n].succ.iter().copied());
            }
        }
    }

    /// Is there a forward path `from -> .. -> to` that never touches
    /// `without`?
    pub fn exists_path_without(&self, from: NodeId, to: NodeId, without: NodeId) -> bool {
        if from == without {
            return false;
        }
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(n) = stack.pop() {
            if n == to {
                return true;
            }
            if !seen.insert(n) {
                continue;
            }
            for &s in &self[n].succ {
                if s != without {
                    stack.push(s);
                }
            }
        }
        false
    }

    /// Visit blocks dominated by `header`, forward-reachable from it.
    /// `op` returns whether to descend past the visited node; the
    /// callback is responsible for deduplication.
    pub fn traverse_dominated_blocks(&self, header: NodeId, op: &mut dyn FnMut(NodeId) -> bool) {
        let mut stack: Vec<NodeId> = self[header].succ.clone();
        while let Some(n) = stack.pop() {
            if self.dominates(header, n) && op(n) {
                stack.extend(self[n].succ.iter().copied());
            }
        }
    }

    /// Within `header`'s dominated subtree, rewrite every branch that
    /// targets `from` to target `to` instead. `mask` gates which nodes
    /// the walk may descend through (used to stop at an inner construct's
    /// own merge block). Edges whose rewrite would branch into a
    /// dominator (creating a cycle) are left alone.
    pub fn traverse_dominated_blocks_and_rewrite_branch_masked(
        &mut self,
        header: NodeId,
        from: NodeId,
        to: NodeId,
        mask: &mut dyn FnMut(&NodePool, NodeId) -> bool,
    ) {
        if from == to {
            return;
        }
        let mut visited = HashSet::new();
        let mut stack = vec![header];
        while let Some(n) = stack.pop() {
            if !visited.insert(n) {
                continue;
            }
            let succs = self[n].succ.clone();
            for s in succs {
                if s == from {
                    if !self.dominates(to, n) {
                        self.retarget_branch(n, from, to);
                    }
                } else if self.dominates(header, s) && mask(self, s) {
                    stack.push(s);
                }
            }
        }
    }

    pub fn traverse_dominated_blocks_and_rewrite_branch(
        &mut self,
        header: NodeId,
        from: NodeId,
        to: NodeId,
    ) {
        self.traverse_dominated_blocks_and_rewrite_branch_masked(header, from, to, &mut |_, _| true);
    }
}
