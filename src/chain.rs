//! Transactions, the pending-transaction pool, and the replicated chain.
//!
//! The consensus core treats transactions as opaque identifiers; everything
//! application specific enters through the caller's [`ConflictRule`].

#[cfg(test)]
#[path = "chain_test.rs"]
mod chain_test;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::BlockId;

/// Opaque transaction identifier.
pub type Transaction = u64;

/// Decides whether a candidate transaction conflicts with an already
/// accepted one. Supplied by the embedding application; must be
/// deterministic so every participant filters identically.
pub trait ConflictRule: Send + Sync {
    /// Whether `candidate` conflicts with `accepted`.
    fn conflicts(&self, candidate: &Transaction, accepted: &Transaction) -> bool;
}

/// Only exact duplicates conflict.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExactDuplicate;

impl ConflictRule for ExactDuplicate {
    fn conflicts(&self, candidate: &Transaction, accepted: &Transaction) -> bool {
        candidate == accepted
    }
}

/// Transactions collide when they agree modulo a fixed divisor. Stands in
/// for application-level conflict detection in simulations.
#[derive(Clone, Copy, Debug)]
pub struct ModuloCollision(pub u64);

impl ConflictRule for ModuloCollision {
    fn conflicts(&self, candidate: &Transaction, accepted: &Transaction) -> bool {
        candidate == accepted || candidate % self.0 == accepted % self.0
    }
}

/// FIFO pool of transactions waiting to be proposed. The caller primes it
/// before starting a block; fetching from an empty pool is an error
/// surfaced by the consensus layer.
#[derive(Debug, Default)]
pub struct TransactionPool {
    pending: VecDeque<Transaction>,
}

impl TransactionPool {
    /// Queue a transaction for a future proposal.
    pub fn add_tx(&mut self, tx: Transaction) {
        self.pending.push_back(tx);
    }

    /// Take the oldest pending transaction.
    pub fn get_tx(&mut self) -> Option<Transaction> {
        self.pending.pop_front()
    }

    /// Put a transaction back at the front, e.g. when its proposal was not
    /// agreed on.
    pub fn return_tx(&mut self, tx: Transaction) {
        self.pending.push_front(tx);
    }

    /// Number of pending transactions.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// An agreed block: the conflict-filtered union of the selected proposals,
/// in proposer-index order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Height of this block.
    pub block_id: BlockId,
    /// Ordered transactions.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// An empty block at `block_id`.
    pub fn new(block_id: BlockId) -> Self {
        Self { block_id, transactions: Vec::new() }
    }

    /// Number of transactions in the block.
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Whether the block carries no transactions.
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Whether `tx` conflicts with a transaction already in this block.
    pub fn conflicts(&self, tx: &Transaction, rule: &dyn ConflictRule) -> bool {
        self.transactions.iter().any(|accepted| rule.conflicts(tx, accepted))
    }

    /// Append a transaction.
    pub fn push(&mut self, tx: Transaction) {
        self.transactions.push(tx);
    }
}

/// Append-only sequence of agreed blocks plus a membership index over every
/// committed transaction.
pub struct Chain {
    rule: Arc<dyn ConflictRule>,
    blocks: Vec<Block>,
    committed: HashSet<Transaction>,
}

impl Chain {
    /// An empty chain filtering with `rule`.
    pub fn new(rule: Arc<dyn ConflictRule>) -> Self {
        Self { rule, blocks: Vec::new(), committed: HashSet::new() }
    }

    /// The conflict rule blocks are filtered with.
    pub fn rule(&self) -> &dyn ConflictRule {
        self.rule.as_ref()
    }

    /// Number of committed blocks.
    pub fn height(&self) -> u64 {
        u64::try_from(self.blocks.len()).expect("chain height fits in u64")
    }

    /// Whether `tx` was already committed in some block.
    pub fn conflicts(&self, tx: &Transaction) -> bool {
        self.committed.contains(tx)
    }

    /// Append an agreed block.
    pub fn add_block(&mut self, block: Block) {
        self.committed.extend(block.transactions.iter().copied());
        self.blocks.push(block);
    }

    /// The block at height `id`, if committed.
    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(usize::try_from(id).expect("block id fits in usize"))
    }

    /// All committed blocks in order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }
}
