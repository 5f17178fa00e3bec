//! Per-participant orchestrator.
//!
//! A [`Node`] owns the transaction pool, the chain, and one agreement
//! instance per in-flight block height. It routes every delivered message
//! by block id, executes the requests the protocol layers return, and
//! appends blocks as their heights reach consensus. All state is mutated
//! from the single context that feeds [`Node::handle_message`].

#[cfg(test)]
#[path = "node_test.rs"]
mod node_test;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::chain::{Chain, ConflictRule, TransactionPool};
use crate::config::ConsensusConfig;
use crate::dbft::{Dbft, DbftRequest};
use crate::message::Message;
use crate::metrics::{
    DbftStats,
    CONSENSUS_BLOCKS_COMMITTED,
    CONSENSUS_CHAIN_HEIGHT,
    CONSENSUS_STALE_MESSAGES_DROPPED,
};
use crate::network::NetManager;
use crate::quorum::Quorum;
use crate::types::{BlockId, ConsensusError, ParticipantId};

/// One participant of the replicated log.
pub struct Node<N: NetManager> {
    id: ParticipantId,
    net: N,
    config: ConsensusConfig,
    quorum: Quorum,
    pool: TransactionPool,
    chain: Chain,
    instances: HashMap<BlockId, Dbft>,
    committed: Vec<DbftStats>,
}

impl<N: NetManager> Node<N> {
    /// A node over the given transport, filtering blocks with `rule`.
    pub fn new(net: N, config: ConsensusConfig, rule: Arc<dyn ConflictRule>) -> Self {
        let quorum = Quorum::new(net.num_participants());
        Self {
            id: net.id(),
            net,
            config,
            quorum,
            pool: TransactionPool::default(),
            chain: Chain::new(rule),
            instances: HashMap::new(),
            committed: Vec::new(),
        }
    }

    /// This participant's id.
    pub fn id(&self) -> ParticipantId {
        self.id
    }

    /// The pending-transaction pool; prime it before starting.
    pub fn pool_mut(&mut self) -> &mut TransactionPool {
        &mut self.pool
    }

    /// The committed chain.
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Stats of every committed block, in height order.
    pub fn committed_stats(&self) -> &[DbftStats] {
        &self.committed
    }

    /// Consume the node, releasing its chain and per-block stats.
    pub fn finish(self) -> (Chain, Vec<DbftStats>) {
        (self.chain, self.committed)
    }

    /// Begin block production: create the height-0 instance and broadcast
    /// its proposal.
    pub fn start(&mut self) -> Result<(), ConsensusError> {
        let requests = self.create_instance(0)?;
        self.execute(requests);
        Ok(())
    }

    /// Handle one delivered message. Returns `true` once the chain reached
    /// the configured number of blocks and the node stopped.
    pub fn handle_message(&mut self, msg: Message) -> Result<bool, ConsensusError> {
        let block_id = msg.body.block_id();
        if block_id < self.chain.height() {
            trace!(block_id, "dropping message for a committed height");
            counter!(CONSENSUS_STALE_MESSAGES_DROPPED).increment(1);
            return Ok(false);
        }
        if !self.instances.contains_key(&block_id) {
            let requests = self.create_instance(block_id)?;
            self.execute(requests);
        }

        let instance = self.instances.get_mut(&block_id).expect("instance exists");
        let requests = instance.handle_message(msg);
        let agreed = instance.reached_consensus();
        self.execute(requests);
        if !agreed {
            return Ok(false);
        }

        let instance = self.instances.get(&block_id).expect("instance exists");
        let block = instance.get_block(&self.chain);
        self.committed.push(instance.stats());
        info!(
            block_id,
            transactions = block.len(),
            "BLOCK_COMMITTED: appending agreed block"
        );
        self.chain.add_block(block);
        counter!(CONSENSUS_BLOCKS_COMMITTED).increment(1);
        gauge!(CONSENSUS_CHAIN_HEIGHT).set(self.chain.height() as f64);

        if self.chain.height() >= self.config.max_blocks {
            debug!(height = self.chain.height(), "target height reached, stopping");
            self.net.stop();
            return Ok(true);
        }
        let next = block_id + 1;
        if !self.instances.contains_key(&next) {
            let requests = self.create_instance(next)?;
            self.execute(requests);
        }
        Ok(false)
    }

    fn create_instance(&mut self, block_id: BlockId) -> Result<VecDeque<DbftRequest>, ConsensusError> {
        debug!(block_id, "creating agreement instance");
        let mut instance = Dbft::new(
            block_id,
            self.id,
            self.quorum,
            self.config.variant,
            self.config.round_timer,
            self.config.batch_size,
        );
        let requests = instance.start(&mut self.pool)?;
        self.instances.insert(block_id, instance);
        Ok(requests)
    }

    fn execute(&mut self, requests: VecDeque<DbftRequest>) {
        for request in requests {
            match request {
                DbftRequest::Broadcast(body) => self.net.broadcast(body),
                DbftRequest::SetTimer { after, body } => self.net.set_timer(after, body),
            }
        }
    }
}

/// Drive a node over its inbox until it reaches the configured height or
/// the inbox closes. Returns the node for inspection.
pub async fn run_node<N: NetManager>(
    mut node: Node<N>,
    mut inbox: mpsc::Receiver<Message>,
) -> Result<Node<N>, ConsensusError> {
    node.start()?;
    while let Some(msg) = inbox.recv().await {
        if node.handle_message(msg)? {
            break;
        }
    }
    Ok(node)
}
