//! regraft-core — structured control flow reconstruction.
//!
//! Converts an arbitrary reducible CFG, as produced by an SSA-style
//! shader IR, into a structured CFG that satisfies the constraints of a
//! SPIR-V-style target: every multi-successor block designates a unique
//! merge block (and, for loops, a continue block), merge blocks are
//! dominated by their headers, and only forward edges cross construct
//! boundaries.
//!
//! The producer fills a [`NodePool`] with blocks (edges, terminators,
//! φ-nodes), hands the entry block to a [`Structurizer`], and after
//! [`Structurizer::run`] walks the result through a [`BlockEmission`]
//! implementation. Parsing the source IR and emitting the target binary
//! are the caller's business.

pub mod entity;
pub mod error;
pub mod graph;
pub mod ir;
pub mod structurize;

pub use error::StructurizeError;
pub use graph::{Node, NodeId, NodeIr, NodePool};
pub use ir::{
    BlockEmission, IncomingValue, IrBuilder, MergeInfo, MergeType, PhiNode, SwitchCase,
    Terminator, TypeId, ValueId,
};
pub use structurize::Structurizer;
