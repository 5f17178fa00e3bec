//! Configuration for the consensus stack.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::binary_consensus::BcVariant;
use crate::types::Round;

/// Top-level consensus configuration.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ConsensusConfig {
    /// Transactions fetched from the local pool per proposal.
    pub batch_size: usize,
    /// Number of blocks to produce before the node stops.
    pub max_blocks: u64,
    /// Binary consensus variant.
    pub variant: BcVariant,
    /// Per-round timer schedule for the partially synchronous variant.
    pub round_timer: RoundTimerConfig,
    /// Capacity of each participant's delivery queue. Overflow is fatal:
    /// the protocol is not flow controlled.
    pub channel_capacity: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_blocks: 1,
            variant: BcVariant::default(),
            round_timer: RoundTimerConfig::default(),
            channel_capacity: 1 << 17,
        }
    }
}

/// Timer schedule for the partially synchronous variant: round `r` waits
/// `base + step * (r + 1)` for the coordinator value before moving on. The
/// growing schedule guarantees that some round's timer eventually exceeds
/// the real network delay.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub struct RoundTimerConfig {
    /// Fixed portion of every round timer.
    pub base: Duration,
    /// Additional wait per elapsed round.
    pub step: Duration,
}

impl RoundTimerConfig {
    /// The timer duration for `round`.
    pub fn round_timeout(&self, round: Round) -> Duration {
        self.base + self.step * (round + 1)
    }
}

impl Default for RoundTimerConfig {
    fn default() -> Self {
        Self { base: Duration::from_micros(10_000), step: Duration::from_micros(500) }
    }
}
