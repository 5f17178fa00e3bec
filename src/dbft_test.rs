use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use test_case::test_case;

use crate::binary_consensus::BcVariant;
use crate::chain::{Block, Chain, ExactDuplicate, ModuloCollision, Transaction, TransactionPool};
use crate::config::RoundTimerConfig;
use crate::dbft::{Dbft, DbftRequest};
use crate::message::{BvPayload, Message, MessageBody};
use crate::quorum::Quorum;
use crate::types::ParticipantId;

const MAX_STEPS: usize = 1_000_000;

/// A delivery scheduled for after the in-flight messages, ordered by
/// expiry (earliest first out of the heap).
#[derive(Debug)]
struct TimedDelivery {
    at: u128,
    seq: u64,
    to: ParticipantId,
    body: MessageBody,
}

impl PartialEq for TimedDelivery {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimedDelivery {}

impl PartialOrd for TimedDelivery {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedDelivery {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

/// Drives `n` agreement instances for one block over an in-memory bus.
/// Messages are FIFO; timers fire only when nothing is in flight.
struct DbftCluster {
    nodes: Vec<Option<Dbft>>,
    bus: VecDeque<(ParticipantId, MessageBody)>,
    timers: BinaryHeap<TimedDelivery>,
    now: u128,
    seq: u64,
}

impl DbftCluster {
    fn new(n: usize, variant: BcVariant, batch_size: usize) -> Self {
        let quorum = Quorum::new(n);
        let nodes = (0..n)
            .map(|id| {
                Some(Dbft::new(0, id, quorum, variant, RoundTimerConfig::default(), batch_size))
            })
            .collect();
        Self { nodes, bus: VecDeque::new(), timers: BinaryHeap::new(), now: 0, seq: 0 }
    }

    fn silence(&mut self, id: ParticipantId) {
        self.nodes[id] = None;
    }

    fn start(&mut self, id: ParticipantId, batch: &[Transaction]) {
        let mut pool = TransactionPool::default();
        for tx in batch {
            pool.add_tx(*tx);
        }
        let requests = self.nodes[id]
            .as_mut()
            .expect("silenced node cannot start")
            .start(&mut pool)
            .expect("pool primed with a full batch");
        self.enqueue(id, requests);
    }

    fn enqueue(&mut self, from: ParticipantId, requests: VecDeque<DbftRequest>) {
        for request in requests {
            match request {
                DbftRequest::Broadcast(body) => self.bus.push_back((from, body)),
                DbftRequest::SetTimer { after, body } => {
                    self.seq += 1;
                    self.timers.push(TimedDelivery {
                        at: self.now + after.as_micros(),
                        seq: self.seq,
                        to: from,
                        body,
                    });
                }
            }
        }
    }

    fn run(&mut self) {
        for _ in 0..MAX_STEPS {
            if let Some((from, body)) = self.bus.pop_front() {
                for to in 0..self.nodes.len() {
                    let Some(node) = self.nodes[to].as_mut() else {
                        continue;
                    };
                    let requests = node.handle_message(Message { from, body: body.clone() });
                    self.enqueue(to, requests);
                }
            } else if let Some(TimedDelivery { at, to, body, .. }) = self.timers.pop() {
                self.now = self.now.max(at);
                if let Some(node) = self.nodes[to].as_mut() {
                    let requests = node.handle_message(Message { from: to, body });
                    self.enqueue(to, requests);
                }
            } else {
                return;
            }
        }
        panic!("cluster did not converge within {MAX_STEPS} steps");
    }

    fn blocks(&self) -> Vec<Block> {
        self.nodes
            .iter()
            .flatten()
            .map(|node| {
                assert!(node.reached_consensus(), "an instance did not reach consensus");
                node.get_block(&Chain::new(Arc::new(ExactDuplicate)))
            })
            .collect()
    }
}

#[test_case(BcVariant::Async)]
#[test_case(BcVariant::PSync)]
fn all_honest_agree_on_the_full_batch(variant: BcVariant) {
    // Four proposers with five distinct transactions each: the block is
    // the concatenation of all batches in proposer order.
    let mut cluster = DbftCluster::new(4, variant, 5);
    for id in 0..4 {
        let batch: Vec<Transaction> =
            (1..=5).map(|k| u64::try_from(id).unwrap() * 5 + k).collect();
        cluster.start(id, &batch);
    }
    cluster.run();

    let blocks = cluster.blocks();
    let expected: Vec<Transaction> = (1..=20).collect();
    for block in &blocks {
        assert_eq!(block.transactions, expected);
    }
}

#[test_case(BcVariant::Async)]
#[test_case(BcVariant::PSync)]
fn fail_stop_proposers_are_voted_down(variant: BcVariant) {
    // n = 7, f = 2; participants 5 and 6 never say a word.
    let mut cluster = DbftCluster::new(7, variant, 2);
    cluster.silence(5);
    cluster.silence(6);
    for id in 0..5 {
        let base = u64::try_from(id).unwrap() * 2;
        cluster.start(id, &[base + 1, base + 2]);
    }
    cluster.run();

    let expected: Vec<Transaction> = (1..=10).collect();
    for node in cluster.nodes.iter().flatten() {
        assert!(node.reached_consensus());
        let decisions = node.decisions();
        assert!(decisions[0..5].iter().all(|&d| d), "live proposals must be selected");
        assert!(!decisions[5] && !decisions[6], "silent proposers must be voted down");
    }
    for block in cluster.blocks() {
        assert_eq!(block.transactions, expected);
    }
}

#[test]
fn conflicting_transactions_are_filtered_in_proposer_order() {
    let mut cluster = DbftCluster::new(4, BcVariant::PSync, 2);
    cluster.start(0, &[1, 2]);
    // 74 collides with 1 modulo 73 and is dropped; 2 is an exact duplicate.
    cluster.start(1, &[74, 3]);
    cluster.start(2, &[4, 5]);
    cluster.start(3, &[2, 6]);
    cluster.run();

    let chain = Chain::new(Arc::new(ModuloCollision(73)));
    for node in cluster.nodes.iter().flatten() {
        let block = node.get_block(&chain);
        assert_eq!(block.transactions, vec![1, 2, 3, 4, 5, 6]);
    }
}

#[test]
fn committed_transactions_never_reenter() {
    let mut cluster = DbftCluster::new(4, BcVariant::PSync, 1);
    cluster.start(0, &[10]);
    cluster.start(1, &[11]);
    cluster.start(2, &[12]);
    cluster.start(3, &[13]);
    cluster.run();

    let mut chain = Chain::new(Arc::new(ExactDuplicate));
    let mut prior = Block::new(0);
    prior.push(10);
    prior.push(12);
    chain.add_block(prior);

    let node = cluster.nodes[0].as_ref().expect("live node");
    let block = node.get_block(&chain);
    assert_eq!(block.transactions, vec![11, 13]);
}

#[test]
fn block_stats_count_selected_batches() {
    let mut cluster = DbftCluster::new(4, BcVariant::Async, 3);
    for id in 0..4 {
        let base = u64::try_from(id).unwrap() * 3;
        cluster.start(id, &[base + 1, base + 2, base + 3]);
    }
    cluster.run();

    for node in cluster.nodes.iter().flatten() {
        let stats = node.stats();
        assert_eq!(stats.block_size, 12);
    }
}

#[test]
fn terminated_instances_ignore_replays() {
    let mut cluster = DbftCluster::new(4, BcVariant::Async, 1);
    for id in 0..4 {
        cluster.start(id, &[u64::try_from(id).unwrap() + 1]);
    }
    cluster.run();

    let node = cluster.nodes[0].as_mut().expect("live node");
    assert!(node.reached_consensus());
    let replay = Message {
        from: 1,
        body: MessageBody::Bv(BvPayload { block_id: 0, bin_con_id: 0, round: 0, value: 1 }),
    };
    assert!(node.handle_message(replay).is_empty());
}

#[test]
fn messages_for_other_blocks_are_ignored() {
    let quorum = Quorum::new(4);
    let mut dbft =
        Dbft::new(3, 0, quorum, BcVariant::PSync, RoundTimerConfig::default(), 1);
    let mut pool = TransactionPool::default();
    pool.add_tx(1);
    dbft.start(&mut pool).expect("primed pool");

    let foreign = Message {
        from: 1,
        body: MessageBody::Bv(BvPayload { block_id: 9, bin_con_id: 0, round: 0, value: 1 }),
    };
    assert!(dbft.handle_message(foreign).is_empty());
}

#[test]
fn starting_with_an_empty_pool_fails() {
    let quorum = Quorum::new(4);
    let mut dbft =
        Dbft::new(0, 0, quorum, BcVariant::PSync, RoundTimerConfig::default(), 2);
    let mut pool = TransactionPool::default();
    pool.add_tx(1);
    let err = dbft.start(&mut pool).expect_err("one transaction cannot fill a batch of two");
    assert_eq!(err, crate::types::ConsensusError::PoolExhausted(2));
}
