//! Binary value broadcast.
//!
//! Per round, filters the binary values fed to the consensus state machine:
//! a value is delivered only once `2f + 1` distinct senders vouched for it,
//! which means at least one correct participant proposed it. A value backed
//! by `f + 1` senders is echoed, so every correct participant eventually
//! reaches the delivery quorum for it.

#[cfg(test)]
#[path = "binary_value_broadcast_test.rs"]
mod binary_value_broadcast_test;

use std::collections::HashSet;

use crate::quorum::Quorum;
use crate::types::{ParticipantId, Round};

#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd)]
enum BvState {
    #[default]
    Init,
    Broadcast,
    Delivered,
}

#[derive(Debug, Default)]
struct BvRound {
    senders: [HashSet<ParticipantId>; 2],
    states: [BvState; 2],
}

/// A step the caller must execute for the BV layer.
#[derive(Debug, PartialEq)]
pub enum BvOutput {
    /// Send `value` for `round` to every participant.
    Broadcast {
        /// Round the vote belongs to.
        round: Round,
        /// The vouched-for binary value.
        value: bool,
    },
    /// `value` is backed by `2f + 1` senders in `round`; emitted at most
    /// once per `(round, value)`.
    Deliver {
        /// Round the delivery belongs to.
        round: Round,
        /// The delivered binary value.
        value: bool,
    },
}

/// One consensus instance's BV state across all its rounds. Rounds are kept
/// for the lifetime of the instance so late traffic indexes trivially.
pub struct BinaryValueBroadcast {
    quorum: Quorum,
    rounds: Vec<BvRound>,
}

impl BinaryValueBroadcast {
    /// A BV layer for the given participant set.
    pub fn new(quorum: Quorum) -> Self {
        Self { quorum, rounds: Vec::new() }
    }

    /// Broadcast own `value` for `round`. Idempotent per `(round, value)`.
    pub fn broadcast(&mut self, round: Round, value: bool) -> Option<BvOutput> {
        let entry = self.round_mut(round);
        let slot = usize::from(value);
        if entry.states[slot] >= BvState::Broadcast {
            return None;
        }
        entry.states[slot] = BvState::Broadcast;
        Some(BvOutput::Broadcast { round, value })
    }

    /// Count a received vote for `(round, value)` from `from`. Staleness
    /// with respect to the owning consensus round is the caller's concern.
    pub fn process(&mut self, from: ParticipantId, round: Round, value: bool) -> Vec<BvOutput> {
        let quorum = self.quorum;
        let entry = self.round_mut(round);
        let slot = usize::from(value);
        if entry.states[slot] == BvState::Delivered {
            return Vec::new();
        }

        entry.senders[slot].insert(from);
        let mut output = Vec::new();
        // f + 1 senders prove a correct participant vouches for the value.
        if entry.senders[slot].len() >= quorum.one_correct()
            && entry.states[slot] < BvState::Broadcast
        {
            entry.states[slot] = BvState::Broadcast;
            output.push(BvOutput::Broadcast { round, value });
        }
        if entry.senders[slot].len() >= quorum.correct_majority() {
            entry.states[slot] = BvState::Delivered;
            output.push(BvOutput::Deliver { round, value });
        }
        output
    }

    fn round_mut(&mut self, round: Round) -> &mut BvRound {
        let index = usize::try_from(round).expect("round fits in usize");
        if self.rounds.len() <= index {
            self.rounds.resize_with(index + 1, BvRound::default);
        }
        &mut self.rounds[index]
    }
}
