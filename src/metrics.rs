//! Metric definitions and per-instance result records.

use metrics::{describe_counter, describe_gauge};

use crate::types::Round;

pub const CONSENSUS_CHAIN_HEIGHT: &str = "consensus_chain_height";
pub const CONSENSUS_BLOCKS_COMMITTED: &str = "consensus_blocks_committed";
pub const CONSENSUS_BIN_DECISIONS: &str = "consensus_bin_decisions";
pub const CONSENSUS_PROPOSALS_DELIVERED: &str = "consensus_proposals_delivered";
pub const CONSENSUS_FORCED_ZERO_PROPOSALS: &str = "consensus_forced_zero_proposals";
pub const CONSENSUS_STALE_MESSAGES_DROPPED: &str = "consensus_stale_messages_dropped";

/// Describe all metrics with the installed recorder.
pub fn register_metrics() {
    describe_gauge!(CONSENSUS_CHAIN_HEIGHT, "The local chain height");
    describe_counter!(CONSENSUS_BLOCKS_COMMITTED, "The total number of blocks committed");
    describe_counter!(
        CONSENSUS_BIN_DECISIONS,
        "The total number of binary consensus instances that decided"
    );
    describe_counter!(
        CONSENSUS_PROPOSALS_DELIVERED,
        "The total number of reliably delivered proposals"
    );
    describe_counter!(
        CONSENSUS_FORCED_ZERO_PROPOSALS,
        "The number of binary instances force-proposed to 0"
    );
    describe_counter!(
        CONSENSUS_STALE_MESSAGES_DROPPED,
        "The number of messages dropped for addressing an already committed block"
    );
}

/// Result of a single binary consensus instance.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BinConsensusStats {
    /// The agreed binary value.
    pub decision: bool,
    /// The round in which this participant decided.
    pub rounds: Round,
}

/// Result of one block's multi-valued agreement.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DbftStats {
    /// Transactions selected into the block before conflict filtering.
    pub block_size: usize,
    /// Highest deciding round across the block's binary instances.
    pub rounds: Round,
}
