/// Core error type for the structurizer.
///
/// Only unsupported input becomes an error: graphs the structurizer
/// cannot restructure at all. Structural validation after the passes
/// reports through `log` instead — the structurizer tries to produce a
/// well-formed CFG but the downstream IR validator has the final word
/// on pathological inputs.
#[derive(Debug, thiserror::Error)]
pub enum StructurizeError {
    #[error("block {block} has multiple back edges")]
    MultipleBackEdges { block: String },

    #[error("irreducible control flow: back edge {from} -> {to} where {to} does not dominate {from}")]
    Irreducible { from: String, to: String },
}
