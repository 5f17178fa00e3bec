//! Randomized binary Byzantine agreement.
//!
//! Each instance agrees on one bit. A round BV-broadcasts the current
//! estimate, exchanges AUX votes over the BV-delivered value set, and
//! either decides (the surviving value matches the round's deterministic
//! coin) or carries a new estimate into the next round.
//!
//! Two variants share the state machine:
//! - [`BcVariant::Async`] is the fully asynchronous protocol. With the
//!   deterministic per-round coin used here it terminates with probability
//!   1 under a fair scheduler; adversarial schedulers require substituting
//!   a common coin.
//! - [`BcVariant::PSync`] adds a rotating coordinator and a growing
//!   per-round timer: once a round's timer outlives the real network delay
//!   and its coordinator is correct, every correct participant adopts the
//!   coordinator's value and the instance decides deterministically.
//!
//! Handlers mutate local state and return the broadcasts and timers for the
//! caller to execute; the instance itself performs no IO.

#[cfg(test)]
#[path = "binary_consensus_test.rs"]
mod binary_consensus_test;

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{debug, info, trace, warn};

use crate::bin_values::BinValues;
use crate::binary_value_broadcast::{BinaryValueBroadcast, BvOutput};
use crate::config::RoundTimerConfig;
use crate::metrics::{BinConsensusStats, CONSENSUS_BIN_DECISIONS};
use crate::quorum::Quorum;
use crate::types::{ParticipantId, Round};

/// Protocol variant of a binary consensus instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BcVariant {
    /// Fully asynchronous rounds; probabilistic termination.
    Async,
    /// Rotating coordinator plus per-round timers; deterministic
    /// termination after the timers cover the network delay.
    #[default]
    PSync,
}

/// Instance state; monotone non-decreasing.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
enum BcState {
    Uninvoked,
    Init,
    BvBroadcast,
    Broadcast,
    Consensus,
}

/// A step the caller must execute for a consensus instance.
#[derive(Debug, PartialEq)]
pub enum BcRequest {
    /// Send to every participant, this one included.
    Broadcast(BcCast),
    /// Arm a timer: report a round timeout for `round` after `after`.
    StartTimer {
        /// The round the timer is armed for.
        round: Round,
        /// The timer duration.
        after: Duration,
    },
}

/// An outbound message body; the caller scopes it to this instance.
#[derive(Debug, PartialEq)]
pub enum BcCast {
    /// A BV vote for `value`.
    Bv {
        /// Round of the vote.
        round: Round,
        /// The vouched-for binary value.
        value: bool,
    },
    /// An AUX vote carrying the sender's view of the round's values.
    Aux {
        /// Round of the vote.
        round: Round,
        /// The reported value set; never empty.
        binvalues: BinValues,
    },
    /// The round coordinator's value proposal.
    Coord {
        /// Round being coordinated.
        round: Round,
        /// The coordinator's value set.
        binvalues: BinValues,
    },
}

/// Everything a round accumulates. Past rounds are kept so late traffic
/// indexes trivially; only the current round can change the outcome.
#[derive(Debug, Default)]
struct RoundData {
    bin_values: BinValues,
    // AUX tallies keyed by the exact reported bitmask.
    aux_counts: [usize; 4],
    aux_senders: HashSet<ParticipantId>,
    coord: BinValues,
    timer_expired: bool,
}

/// One participant's binary consensus instance.
pub struct BinConsensus {
    id: ParticipantId,
    quorum: Quorum,
    variant: BcVariant,
    timers: RoundTimerConfig,
    bv: BinaryValueBroadcast,
    state: BcState,
    round: Round,
    est: bool,
    rounds: Vec<RoundData>,
    decided: bool,
    stats: BinConsensusStats,
}

impl BinConsensus {
    /// A fresh, uninvoked instance owned by participant `id`.
    pub fn new(
        id: ParticipantId,
        quorum: Quorum,
        variant: BcVariant,
        timers: RoundTimerConfig,
    ) -> Self {
        Self {
            id,
            quorum,
            variant,
            timers,
            bv: BinaryValueBroadcast::new(quorum),
            state: BcState::Uninvoked,
            round: 0,
            est: false,
            rounds: Vec::new(),
            decided: false,
            stats: BinConsensusStats::default(),
        }
    }

    /// Whether the instance has terminated.
    pub fn reached_consensus(&self) -> bool {
        self.state == BcState::Consensus
    }

    /// The agreed value, once this participant has decided. The instance
    /// keeps running for two further rounds after the decision so peers
    /// reach their own quorums.
    pub fn decision(&self) -> Option<bool> {
        self.decided.then_some(self.stats.decision)
    }

    /// Decision and deciding round; meaningful once decided.
    pub fn stats(&self) -> BinConsensusStats {
        self.stats
    }

    /// Current round, for staleness decisions by the caller.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Invoke the instance with this participant's proposal. Only the
    /// first invocation takes effect.
    pub fn bin_propose(&mut self, value: bool) -> VecDeque<BcRequest> {
        let mut out = VecDeque::new();
        if self.state != BcState::Uninvoked {
            return out;
        }
        self.state = BcState::Init;
        self.round = 0;
        self.est = value;
        self.ensure_round(0);
        self.phase_1(&mut out);
        out
    }

    /// A BV vote from `from`. Out-of-range values and votes for past
    /// rounds are dropped.
    pub fn handle_bv(&mut self, from: ParticipantId, round: Round, value: u8) -> VecDeque<BcRequest> {
        let mut out = VecDeque::new();
        if self.state == BcState::Consensus {
            return out;
        }
        if value & 1 != value {
            debug!(from, round, value, "dropping BV vote with non-binary value");
            return out;
        }
        if round < self.round {
            trace!(from, round, "dropping stale BV vote");
            return out;
        }

        let value = value == 1;
        for step in self.bv.process(from, round, value) {
            match step {
                BvOutput::Broadcast { round, value } => {
                    out.push_back(BcRequest::Broadcast(BcCast::Bv { round, value }));
                }
                BvOutput::Deliver { round, value } => {
                    self.add_bin_value(round, value);
                }
            }
        }
        self.continue_if_ready(&mut out);
        out
    }

    /// An AUX vote from `from`. Each sender contributes once per round;
    /// malformed value sets and votes for past rounds are dropped.
    pub fn handle_aux(
        &mut self,
        from: ParticipantId,
        round: Round,
        binvalues: u8,
    ) -> VecDeque<BcRequest> {
        let mut out = VecDeque::new();
        if self.state == BcState::Consensus {
            return out;
        }
        let Ok(binvalues) = BinValues::try_from(binvalues) else {
            debug!(from, round, binvalues, "dropping AUX vote with malformed value set");
            return out;
        };
        if binvalues.is_empty() {
            debug!(from, round, "dropping AUX vote with an empty value set");
            return out;
        }
        if round < self.round {
            trace!(from, round, "dropping stale AUX vote");
            return out;
        }

        self.ensure_round(round);
        let data = &mut self.rounds[round_index(round)];
        if data.aux_senders.insert(from) {
            data.aux_counts[usize::from(binvalues.bits())] += 1;
            if !binvalues.is_subset_of(data.bin_values) {
                // A correct sender only reports values it BV-delivered, so
                // this set should trail our own. Quorum intersection keeps
                // agreement safe regardless, so the vote still counts.
                warn!(from, round, %binvalues, "AUX vote not entailed by delivered values");
            }
        }
        self.continue_if_ready(&mut out);
        out
    }

    /// The round coordinator's value proposal. Only the true coordinator
    /// of the round is accepted, only singletons, and only the first one.
    pub fn handle_coord(
        &mut self,
        from: ParticipantId,
        round: Round,
        binvalues: u8,
    ) -> VecDeque<BcRequest> {
        let mut out = VecDeque::new();
        if self.state == BcState::Consensus || self.variant != BcVariant::PSync {
            return out;
        }
        if round < self.round {
            trace!(from, round, "dropping stale coordinator value");
            return out;
        }
        if from != self.quorum.coordinator(round) {
            debug!(from, round, "dropping coordinator value from non-coordinator");
            return out;
        }
        let Ok(binvalues) = BinValues::try_from(binvalues) else {
            debug!(from, round, binvalues, "dropping malformed coordinator value");
            return out;
        };

        self.ensure_round(round);
        let data = &mut self.rounds[round_index(round)];
        if data.coord.is_empty() && binvalues.as_singleton().is_some() {
            data.coord = binvalues;
        }
        self.continue_if_ready(&mut out);
        out
    }

    /// The timer armed for `round` fired. A no-op when the instance has
    /// since moved past that round.
    pub fn handle_round_timeout(&mut self, round: Round) -> VecDeque<BcRequest> {
        let mut out = VecDeque::new();
        if self.state == BcState::Consensus || round != self.round {
            return out;
        }
        self.ensure_round(round);
        self.rounds[round_index(round)].timer_expired = true;
        self.continue_if_ready(&mut out);
        out
    }

    fn ensure_round(&mut self, round: Round) {
        let needed = round_index(round) + 1;
        if self.rounds.len() < needed {
            self.rounds.resize_with(needed, RoundData::default);
        }
    }

    fn add_bin_value(&mut self, round: Round, value: bool) {
        self.ensure_round(round);
        let data = &mut self.rounds[round_index(round)];
        if data.bin_values.insert(value) {
            trace!(round, value, bin_values = %data.bin_values, "value delivered into round");
        }
    }

    /// Start the current round: BV-broadcast the estimate and, in the
    /// partially synchronous variant, arm the round timer.
    fn phase_1(&mut self, out: &mut VecDeque<BcRequest>) {
        trace!(round = self.round, est = self.est, "starting round");
        if let Some(BvOutput::Broadcast { round, value }) = self.bv.broadcast(self.round, self.est)
        {
            out.push_back(BcRequest::Broadcast(BcCast::Bv { round, value }));
        }
        self.state = BcState::BvBroadcast;

        if self.decided {
            // Helper rounds after the decision never stall: the estimate is
            // final, so seed it and skip the timer gate.
            self.add_bin_value(self.round, self.est);
            self.rounds[round_index(self.round)].timer_expired = true;
        } else if self.variant == BcVariant::PSync {
            out.push_back(BcRequest::StartTimer {
                round: self.round,
                after: self.timers.round_timeout(self.round),
            });
        }
        self.continue_if_ready(out);
    }

    /// Coordinator side of the partially synchronous variant: broadcast
    /// this round's value set, once.
    fn phase_coord(&mut self, out: &mut VecDeque<BcRequest>) {
        if self.id != self.quorum.coordinator(self.round) {
            return;
        }
        let round = self.round;
        let data = &mut self.rounds[round_index(round)];
        if !data.coord.is_empty() {
            return;
        }
        data.coord = data.bin_values;
        let binvalues = data.coord;
        debug!(round, %binvalues, "broadcasting coordinator value");
        out.push_back(BcRequest::Broadcast(BcCast::Coord { round, binvalues }));
    }

    /// Broadcast the AUX vote for the current round.
    fn phase_2(&mut self, out: &mut VecDeque<BcRequest>) {
        let round = self.round;
        let data = &self.rounds[round_index(round)];
        let mut binvalues = data.bin_values;
        if self.variant == BcVariant::PSync && !self.decided {
            let coord = data.coord;
            if !coord.is_empty() && coord.is_subset_of(data.bin_values) {
                binvalues = coord;
            }
        }
        debug!(round, %binvalues, "broadcasting AUX vote");
        out.push_back(BcRequest::Broadcast(BcCast::Aux { round, binvalues }));
        self.state = BcState::Broadcast;

        if self.decided {
            // Helper rounds do not wait for the AUX quorum.
            let values = self.rounds[round_index(round)].bin_values;
            self.phase_3(values, out);
        } else {
            self.continue_if_ready(out);
        }
    }

    /// Close the round over the AUX-surviving `values` and either decide,
    /// terminate, or start the next round.
    fn phase_3(&mut self, values: BinValues, out: &mut VecDeque<BcRequest>) {
        let closing_round = self.round;
        // The deterministic per-round coin. Safe under the partially
        // synchronous variant; the async variant substitutes a common coin
        // here for liveness against adversarial schedulers.
        let coin = (closing_round + 1) % 2 == 1;
        debug!(round = closing_round, %values, coin, "closing round");

        match values.as_singleton() {
            Some(value) => {
                self.inc_round(value);
                if !self.decided && value == coin {
                    self.set_decision(value, closing_round);
                }
            }
            None => self.inc_round(coin),
        }

        if self.decided && self.round >= self.stats.rounds + 2 {
            self.state = BcState::Consensus;
            info!(
                id = self.id,
                decision = self.stats.decision,
                rounds = self.stats.rounds,
                "BIN_CONSENSUS: instance terminated"
            );
            return;
        }
        self.phase_1(out);
    }

    fn inc_round(&mut self, new_est: bool) {
        self.round += 1;
        self.est = new_est;
        self.ensure_round(self.round);
    }

    fn set_decision(&mut self, value: bool, round: Round) {
        assert!(!self.decided, "a decision never changes");
        self.decided = true;
        self.stats.decision = value;
        self.stats.rounds = round;
        counter!(CONSENSUS_BIN_DECISIONS).increment(1);
        debug!(id = self.id, decision = value, round, "decided");
    }

    /// Evaluate the current round's gates after every state or tally
    /// change, advancing as far as the accumulated messages allow.
    fn continue_if_ready(&mut self, out: &mut VecDeque<BcRequest>) {
        if self.state != BcState::BvBroadcast && self.state != BcState::Broadcast {
            return;
        }
        self.ensure_round(self.round);

        if self.state == BcState::BvBroadcast {
            if self.rounds[round_index(self.round)].bin_values.is_empty() {
                return;
            }
            match self.variant {
                BcVariant::Async => self.phase_2(out),
                BcVariant::PSync => {
                    self.phase_coord(out);
                    if self.rounds[round_index(self.round)].timer_expired {
                        self.phase_2(out);
                    }
                }
            }
            return;
        }

        // state == Broadcast: wait for the AUX quorum.
        let data = &self.rounds[round_index(self.round)];
        if data.aux_senders.len() < self.quorum.supermajority() {
            return;
        }
        let values = if data.bin_values.as_singleton().is_some() {
            let tally = data.aux_counts[usize::from(data.bin_values.bits())];
            if tally < self.quorum.supermajority() {
                return;
            }
            data.bin_values
        } else {
            // bin_values is {0,1}: every received AUX reports a subset of
            // it, so the union of non-empty tallies survives the quorum.
            let mut union = BinValues::NONE;
            for (bits, set) in [(1, BinValues::ZERO), (2, BinValues::ONE), (3, BinValues::BOTH)] {
                if data.aux_counts[bits] > 0 {
                    union = union.union(set);
                }
            }
            union
        };
        self.phase_3(values, out);
    }
}

fn round_index(round: Round) -> usize {
    usize::try_from(round).expect("round fits in usize")
}
