//! Multi-valued agreement for one block.
//!
//! Runs one reliable broadcast and one binary consensus per proposer. A
//! proposal that is delivered in time gets its binary instance invoked with
//! 1; once `n - f` instances have terminated, the remaining ones are forced
//! to 0 so a handful of slow or silent proposers cannot stall the block.
//! The block is the conflict-filtered union of the proposals whose
//! instances decided 1, in proposer-index order.

#[cfg(test)]
#[path = "dbft_test.rs"]
mod dbft_test;

use std::collections::VecDeque;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, info, trace, warn};

use crate::binary_consensus::{BcCast, BcRequest, BcVariant, BinConsensus};
use crate::chain::{Block, Chain, Transaction, TransactionPool};
use crate::config::RoundTimerConfig;
use crate::message::{
    AuxPayload,
    BvPayload,
    CoordPayload,
    Message,
    MessageBody,
    ProposalPayload,
    TimeoutPayload,
};
use crate::metrics::{
    DbftStats,
    CONSENSUS_FORCED_ZERO_PROPOSALS,
    CONSENSUS_PROPOSALS_DELIVERED,
};
use crate::quorum::Quorum;
use crate::reliable_broadcast::{RbOutput, RbPhase, ReliableBroadcast};
use crate::types::{BinConsensusId, BlockId, ConsensusError, ParticipantId};

#[derive(Clone, Copy, Debug, PartialEq)]
enum DbftState {
    AwaitProposals,
    AwaitBinCons,
    Consensus,
}

/// A side effect the orchestrator must execute for a DBFT instance.
#[derive(Debug, PartialEq)]
pub enum DbftRequest {
    /// Broadcast to every participant; the transport stamps the sender.
    Broadcast(MessageBody),
    /// Deliver `body` back to this participant after `after` elapses.
    SetTimer {
        /// The timer duration.
        after: Duration,
        /// The body to self-deliver on expiry.
        body: MessageBody,
    },
}

/// One participant's agreement instance for a single block.
pub struct Dbft {
    block_id: BlockId,
    id: ParticipantId,
    quorum: Quorum,
    batch_size: usize,
    state: DbftState,
    rb: ReliableBroadcast,
    bin_cons: Vec<BinConsensus>,
    proposals: Vec<Option<Vec<Transaction>>>,
    invoked: Vec<bool>,
    ready: Vec<bool>,
    decision: Vec<bool>,
    stats: DbftStats,
}

impl Dbft {
    /// A fresh instance for `block_id` owned by participant `id`.
    pub fn new(
        block_id: BlockId,
        id: ParticipantId,
        quorum: Quorum,
        variant: BcVariant,
        timers: RoundTimerConfig,
        batch_size: usize,
    ) -> Self {
        let n = quorum.participants();
        Self {
            block_id,
            id,
            quorum,
            batch_size,
            state: DbftState::AwaitProposals,
            rb: ReliableBroadcast::new(quorum),
            bin_cons: (0..n).map(|_| BinConsensus::new(id, quorum, variant, timers)).collect(),
            proposals: vec![None; n],
            invoked: vec![false; n],
            ready: vec![false; n],
            decision: vec![false; n],
            stats: DbftStats::default(),
        }
    }

    /// The block height this instance agrees on.
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Whether the block's content is fully agreed.
    pub fn reached_consensus(&self) -> bool {
        self.state == DbftState::Consensus
    }

    /// The per-proposer decisions; meaningful once consensus is reached.
    pub fn decisions(&self) -> &[bool] {
        &self.decision
    }

    /// Block size and round count; meaningful once consensus is reached.
    pub fn stats(&self) -> DbftStats {
        self.stats
    }

    /// Fetch this participant's batch from the pool and reliably broadcast
    /// it as its proposal.
    pub fn start(
        &mut self,
        pool: &mut TransactionPool,
    ) -> Result<VecDeque<DbftRequest>, ConsensusError> {
        let mut batch = Vec::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            batch.push(pool.get_tx().ok_or(ConsensusError::PoolExhausted(self.batch_size))?);
        }
        let payload =
            ProposalPayload { block_id: self.block_id, transactions: batch, index: self.id };
        debug!(block_id = self.block_id, batch = payload.transactions.len(), "proposing batch");

        let mut out = VecDeque::new();
        let steps = self.rb.broadcast(payload);
        self.apply_rb_outputs(steps, &mut out);
        Ok(out)
    }

    /// Route one delivered message to the proposal phase or the addressed
    /// binary instance.
    pub fn handle_message(&mut self, msg: Message) -> VecDeque<DbftRequest> {
        let mut out = VecDeque::new();
        if self.state == DbftState::Consensus || msg.body.block_id() != self.block_id {
            return out;
        }

        match msg.body {
            MessageBody::RbInit(payload) => {
                self.handle_rb(msg.from, RbPhase::Init, payload, &mut out)
            }
            MessageBody::RbEcho(payload) => {
                self.handle_rb(msg.from, RbPhase::Echo, payload, &mut out)
            }
            MessageBody::RbReady(payload) => {
                self.handle_rb(msg.from, RbPhase::Ready, payload, &mut out)
            }
            MessageBody::Bv(BvPayload { bin_con_id, round, value, .. }) => {
                self.handle_bin_con(bin_con_id, &mut out, |bc| bc.handle_bv(msg.from, round, value))
            }
            MessageBody::Aux(AuxPayload { bin_con_id, round, binvalues, .. }) => self
                .handle_bin_con(bin_con_id, &mut out, |bc| {
                    bc.handle_aux(msg.from, round, binvalues)
                }),
            MessageBody::Coord(CoordPayload { bin_con_id, round, binvalues, .. }) => self
                .handle_bin_con(bin_con_id, &mut out, |bc| {
                    bc.handle_coord(msg.from, round, binvalues)
                }),
            MessageBody::RoundTimeout(TimeoutPayload { bin_con_id, round, .. }) => {
                self.handle_bin_con(bin_con_id, &mut out, |bc| bc.handle_round_timeout(round))
            }
        }
        out
    }

    /// Assemble the agreed block: proposals with a 1-decision, in proposer
    /// order, filtered by the block's and the chain's conflict checks.
    ///
    /// Panics if consensus has not been reached yet.
    pub fn get_block(&self, chain: &Chain) -> Block {
        assert!(self.reached_consensus(), "block requested before consensus");

        let mut block = Block::new(self.block_id);
        for index in 0..self.bin_cons.len() {
            if !self.decision[index] {
                continue;
            }
            let batch =
                self.proposals[index].as_ref().expect("a 1-decided slot holds its proposal");
            for tx in batch {
                if !block.conflicts(tx, chain.rule()) && !chain.conflicts(tx) {
                    block.push(*tx);
                }
            }
        }
        block
    }

    fn handle_rb(
        &mut self,
        from: ParticipantId,
        phase: RbPhase,
        payload: ProposalPayload,
        out: &mut VecDeque<DbftRequest>,
    ) {
        let steps = self.rb.process(from, phase, payload);
        self.apply_rb_outputs(steps, out);
    }

    fn apply_rb_outputs(
        &mut self,
        steps: Vec<RbOutput<ProposalPayload>>,
        out: &mut VecDeque<DbftRequest>,
    ) {
        for step in steps {
            match step {
                RbOutput::Broadcast(phase, payload) => {
                    let body = match phase {
                        RbPhase::Init => MessageBody::RbInit(payload),
                        RbPhase::Echo => MessageBody::RbEcho(payload),
                        RbPhase::Ready => MessageBody::RbReady(payload),
                    };
                    out.push_back(DbftRequest::Broadcast(body));
                }
                RbOutput::Deliver(payload) => self.on_proposal_delivered(payload, out),
            }
        }
    }

    fn on_proposal_delivered(&mut self, payload: ProposalPayload, out: &mut VecDeque<DbftRequest>) {
        if payload.block_id != self.block_id || payload.transactions.is_empty() {
            debug!(block_id = payload.block_id, "dropping malformed proposal");
            return;
        }
        let index = payload.index;
        if !self.quorum.is_participant(index) {
            warn!(index, "dropping proposal with out-of-range proposer index");
            return;
        }
        let occupied = match &self.proposals[index] {
            Some(existing) => {
                if *existing != payload.transactions {
                    warn!(index, "conflicting proposal for an occupied slot; keeping the first");
                    return;
                }
                true
            }
            None => false,
        };
        if !occupied {
            trace!(block_id = self.block_id, index, "proposal delivered");
            counter!(CONSENSUS_PROPOSALS_DELIVERED).increment(1);
            self.proposals[index] = Some(payload.transactions);
        }

        if !self.invoked[index] {
            self.invoked[index] = true;
            let requests = self.bin_cons[index].bin_propose(true);
            self.apply_bc_requests(index, requests, out);
            if self.bin_cons[index].reached_consensus() && !self.ready[index] {
                self.on_bin_con_terminated(index, out);
            }
        }

        if self.state == DbftState::AwaitProposals
            && self.ready_count() >= self.quorum.supermajority()
        {
            self.force_remaining_to_zero(out);
            self.state = DbftState::AwaitBinCons;
        }
        self.check_if_consensus();
    }

    fn handle_bin_con<F>(
        &mut self,
        index: BinConsensusId,
        out: &mut VecDeque<DbftRequest>,
        handler: F,
    ) where
        F: FnOnce(&mut BinConsensus) -> VecDeque<BcRequest>,
    {
        if !self.quorum.is_participant(index) {
            warn!(index, "dropping message with out-of-range instance index");
            return;
        }
        if self.ready[index] {
            // The instance already terminated; nothing can change.
            return;
        }
        let requests = handler(&mut self.bin_cons[index]);
        self.apply_bc_requests(index, requests, out);
        if self.bin_cons[index].reached_consensus() {
            self.on_bin_con_terminated(index, out);
        }
    }

    fn on_bin_con_terminated(&mut self, index: BinConsensusId, out: &mut VecDeque<DbftRequest>) {
        self.ready[index] = true;
        self.decision[index] =
            self.bin_cons[index].decision().expect("a terminated instance has decided");
        debug!(
            block_id = self.block_id,
            index,
            decision = self.decision[index],
            ready = self.ready_count(),
            "binary instance terminated"
        );

        if !self.invoked.iter().all(|&invoked| invoked)
            && self.ready_count() >= self.quorum.supermajority()
        {
            self.force_remaining_to_zero(out);
        }
        self.check_if_consensus();
    }

    // Once n - f instances terminated, enough proposals are in that the
    // block cannot miss an honest value; vote the stragglers down so the
    // block closes.
    fn force_remaining_to_zero(&mut self, out: &mut VecDeque<DbftRequest>) {
        for index in 0..self.bin_cons.len() {
            if self.invoked[index] {
                continue;
            }
            self.invoked[index] = true;
            counter!(CONSENSUS_FORCED_ZERO_PROPOSALS).increment(1);
            debug!(block_id = self.block_id, index, "forcing undelivered proposal to 0");
            let requests = self.bin_cons[index].bin_propose(false);
            self.apply_bc_requests(index, requests, out);
            if self.bin_cons[index].reached_consensus() && !self.ready[index] {
                self.on_bin_con_terminated(index, out);
            }
        }
    }

    fn apply_bc_requests(
        &mut self,
        index: BinConsensusId,
        requests: VecDeque<BcRequest>,
        out: &mut VecDeque<DbftRequest>,
    ) {
        for request in requests {
            match request {
                BcRequest::Broadcast(cast) => {
                    out.push_back(DbftRequest::Broadcast(self.wrap_cast(index, cast)));
                }
                BcRequest::StartTimer { round, after } => {
                    out.push_back(DbftRequest::SetTimer {
                        after,
                        body: MessageBody::RoundTimeout(TimeoutPayload {
                            block_id: self.block_id,
                            bin_con_id: index,
                            round,
                        }),
                    });
                }
            }
        }
    }

    fn wrap_cast(&self, index: BinConsensusId, cast: BcCast) -> MessageBody {
        match cast {
            BcCast::Bv { round, value } => MessageBody::Bv(BvPayload {
                block_id: self.block_id,
                bin_con_id: index,
                round,
                value: u8::from(value),
            }),
            BcCast::Aux { round, binvalues } => MessageBody::Aux(AuxPayload {
                block_id: self.block_id,
                bin_con_id: index,
                round,
                binvalues: binvalues.bits(),
            }),
            BcCast::Coord { round, binvalues } => MessageBody::Coord(CoordPayload {
                block_id: self.block_id,
                bin_con_id: index,
                round,
                binvalues: binvalues.bits(),
            }),
        }
    }

    fn ready_count(&self) -> usize {
        self.ready.iter().filter(|&&ready| ready).count()
    }

    fn check_if_consensus(&mut self) {
        if self.state == DbftState::Consensus {
            return;
        }
        if !self.ready.iter().all(|&ready| ready) {
            return;
        }
        // Every selected proposal must have arrived; a 1-decision without
        // its payload means some reliable delivery is still in flight.
        for index in 0..self.bin_cons.len() {
            if self.decision[index] && self.proposals[index].is_none() {
                return;
            }
        }
        self.state = DbftState::Consensus;
        let selected = self.decision.iter().filter(|&&d| d).count();
        self.stats.block_size = selected * self.batch_size;
        self.stats.rounds = self
            .bin_cons
            .iter()
            .map(|bc| bc.stats().rounds)
            .max()
            .unwrap_or_default();
        info!(
            block_id = self.block_id,
            selected,
            rounds = self.stats.rounds,
            "DBFT_CONSENSUS: block content agreed"
        );
    }
}
