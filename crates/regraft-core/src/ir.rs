use serde::{Deserialize, Serialize};

use crate::define_entity;
use crate::graph::{NodeId, NodePool};

define_entity!(ValueId);
define_entity!(TypeId);

/// One arm of a `Switch` terminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub value: u32,
    pub block: NodeId,
}

/// Block terminator. Kept consistent with the owning node's `succ` list
/// at all times — edge rewrites go through `NodePool` so both stay in
/// sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terminator {
    Return,
    #[default]
    Unreachable,
    Branch {
        target: NodeId,
    },
    Condition {
        cond: ValueId,
        true_block: NodeId,
        false_block: NodeId,
    },
    Switch {
        cond: ValueId,
        cases: Vec<SwitchCase>,
        default_block: NodeId,
    },
}

impl Terminator {
    /// Branch targets, in terminator order.
    pub fn targets(&self) -> Vec<NodeId> {
        match self {
            Terminator::Return | Terminator::Unreachable => vec![],
            Terminator::Branch { target } => vec![*target],
            Terminator::Condition {
                true_block,
                false_block,
                ..
            } => vec![*true_block, *false_block],
            Terminator::Switch {
                cases,
                default_block,
                ..
            } => {
                let mut targets: Vec<NodeId> = cases.iter().map(|c| c.block).collect();
                targets.push(*default_block);
                targets
            }
        }
    }

    /// Replace every occurrence of `from` among the targets with `to`.
    pub fn retarget(&mut self, from: NodeId, to: NodeId) {
        let sub = |t: &mut NodeId| {
            if *t == from {
                *t = to;
            }
        };
        match self {
            Terminator::Return | Terminator::Unreachable => {}
            Terminator::Branch { target } => sub(target),
            Terminator::Condition {
                true_block,
                false_block,
                ..
            } => {
                sub(true_block);
                sub(false_block);
            }
            Terminator::Switch {
                cases,
                default_block,
                ..
            } => {
                for case in cases {
                    sub(&mut case.block);
                }
                sub(default_block);
            }
        }
    }
}

/// One incoming edge of a φ-node.
///
/// `id` is `None` for a φ placeholder synthesized at a dominance
/// frontier during repair; the concrete value id is allocated when the
/// frontier block is emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingValue {
    pub block: NodeId,
    pub id: Option<ValueId>,
}

/// A φ-node: one value per incoming predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhiNode {
    pub id: ValueId,
    pub type_id: TypeId,
    pub incoming: Vec<IncomingValue>,
}

/// Which construct a block heads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeType {
    #[default]
    None,
    Selection,
    Loop,
}

/// Merge annotation handed to the emitter for each block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeInfo {
    pub merge_type: MergeType,
    pub merge_block: Option<NodeId>,
    pub continue_block: Option<NodeId>,
}

/// Facade over the target IR module builder.
///
/// The structurizer only needs fresh ids, a bool type, bool constants
/// (for ladder φ discriminators), a uint type, and debug names. It never
/// sees the builder's concrete type.
pub trait IrBuilder {
    fn allocate_id(&mut self) -> ValueId;
    fn make_bool_type(&mut self) -> TypeId;
    fn make_bool_constant(&mut self, value: bool) -> ValueId;
    fn make_uint_type(&mut self, width: u32) -> TypeId;
    fn add_name(&mut self, id: ValueId, name: &str);
}

/// Block emission interface consumed by `Structurizer::traverse`.
///
/// `register_block` is called for every block before any emission and
/// must assign a stable id if the node has none. `emit_basic_block` is
/// called exactly once per reachable node, in reverse post-order, after
/// the node's merge info has been populated.
pub trait BlockEmission {
    fn register_block(&mut self, pool: &mut NodePool, node: NodeId);
    fn emit_basic_block(&mut self, pool: &NodePool, node: NodeId);
}
