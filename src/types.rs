//! Shared identifiers and the error type of the consensus stack.

use thiserror::Error;

/// Dense participant identifier in `[0, n)`. The participant set is fixed
/// for the lifetime of a consensus instance.
pub type ParticipantId = usize;

/// Height of a block in the chain, also used to scope all messages of the
/// multi-valued agreement deciding that block.
pub type BlockId = u64;

/// Index of a binary consensus instance inside one block's agreement; equal
/// to the proposer index it votes on.
pub type BinConsensusId = usize;

/// Round counter of a binary consensus instance.
pub type Round = u32;

#[derive(Debug, Error, PartialEq)]
pub enum ConsensusError {
    #[error("transaction pool exhausted while assembling a proposal of {0} transactions")]
    PoolExhausted(usize),
    // An error internal to this node, as opposed to bad input from peers
    // (which is silently ignored).
    #[error("{0}")]
    InternalInconsistency(String),
}
