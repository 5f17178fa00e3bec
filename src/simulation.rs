//! Multi-node simulation harness.
//!
//! Builds a network of [`Node`]s, a share of which may be faulty, primes
//! their pools from a shared transaction supply, runs everyone to the
//! configured height, and reports the honest chains plus one CSV row of
//! runtime statistics per run.

#[cfg(test)]
#[path = "simulation_test.rs"]
mod simulation_test;

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use strum::{Display, EnumString};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::chain::{Chain, ConflictRule, Transaction};
use crate::config::ConsensusConfig;
use crate::message::{
    AuxPayload,
    BvPayload,
    CoordPayload,
    Message,
    MessageBody,
    ProposalPayload,
};
use crate::metrics::DbftStats;
use crate::network::{DeliveryJitter, NetManager, SimNetManager, SimNetwork};
use crate::node::{run_node, Node};
use crate::types::{BlockId, ConsensusError, ParticipantId, Round};

// How many rounds of garbage a flooding participant emits per instance.
const FLOOD_ROUNDS: Round = 10;

/// Behavior assigned to a simulated participant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum Role {
    /// Follows the protocol.
    #[default]
    Fair,
    /// Joins the network and never sends a message.
    FailStop,
    /// Proposes, then floods votes against every proposal.
    TxRejector,
    /// Proposes, then floods contradictory vote traffic.
    BinConCrasher,
}

/// Scenario description for one simulation run.
#[derive(Clone, Debug)]
pub struct SimulationConfig {
    /// Scenario label for the result rows.
    pub scenario: String,
    /// Total participant count.
    pub participants: usize,
    /// How many participants are faulty.
    pub faulty: usize,
    /// The behavior of the faulty participants.
    pub fault_role: Role,
    /// Shuffle role assignment across participant ids.
    pub shuffle_roles: bool,
    /// Seed for role shuffling, transaction generation, and jitter.
    pub seed: u64,
    /// Optional delivery jitter applied to every message.
    pub jitter: Option<Duration>,
    /// The consensus parameters every node runs with.
    pub consensus: ConsensusConfig,
}

/// Everything a completed honest node reports.
pub struct NodeOutcome {
    /// The participant id.
    pub id: ParticipantId,
    /// Its committed chain.
    pub chain: Chain,
    /// Wall-clock time from start to the target height.
    pub runtime: Duration,
    /// Per-block agreement stats, in height order.
    pub blocks: Vec<DbftStats>,
}

/// The honest outcomes of one simulation run, in participant-id order.
pub struct SimulationRun {
    /// One entry per honest participant.
    pub nodes: Vec<NodeOutcome>,
}

impl SimulationRun {
    /// Mean runtime across the honest participants, in seconds.
    pub fn average_runtime_secs(&self) -> f64 {
        let total: f64 = self.nodes.iter().map(|node| node.runtime.as_secs_f64()).sum();
        total / self.nodes.len() as f64
    }

    /// The highest deciding round observed by any honest participant.
    pub fn max_rounds(&self) -> Round {
        self.nodes
            .iter()
            .flat_map(|node| node.blocks.iter().map(|stats| stats.rounds))
            .max()
            .unwrap_or_default()
    }

    /// Size of the first committed block, as reported by the first honest
    /// participant.
    pub fn block_size(&self) -> usize {
        self.nodes
            .first()
            .and_then(|node| node.blocks.first())
            .map(|stats| stats.block_size)
            .unwrap_or_default()
    }
}

/// A runnable scenario: a role per participant plus the shared parameters.
pub struct Simulation {
    config: SimulationConfig,
    rule: Arc<dyn ConflictRule>,
    roles: Vec<Role>,
}

impl Simulation {
    /// Lay out the scenario. Faulty participants take the low ids unless
    /// `shuffle_roles` is set.
    ///
    /// Panics unless `3 * faulty < participants`.
    pub fn new(config: SimulationConfig, rule: Arc<dyn ConflictRule>) -> Self {
        assert!(
            3 * config.faulty < config.participants,
            "cannot tolerate {} faults among {} participants",
            config.faulty,
            config.participants
        );
        let mut roles = vec![Role::Fair; config.participants];
        for role in roles.iter_mut().take(config.faulty) {
            *role = config.fault_role;
        }
        if config.shuffle_roles {
            roles.shuffle(&mut StdRng::seed_from_u64(config.seed));
        }
        Self { config, rule, roles }
    }

    /// The role of each participant id.
    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    /// Run every node to the configured height and collect the honest
    /// chains.
    pub async fn run(&self) -> Result<SimulationRun, ConsensusError> {
        let config = &self.config;
        let n = config.participants;
        info!(
            scenario = %config.scenario,
            n,
            faulty = config.faulty,
            role = %config.fault_role,
            "starting simulation"
        );

        let mut network = SimNetwork::new(n, config.consensus.channel_capacity);
        if let Some(max_delay) = config.jitter {
            network = network.with_jitter(DeliveryJitter { seed: config.seed, max_delay });
        }

        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
        let mut pools = generate_transactions(
            &mut rng,
            n,
            (config.participants - 1) / 3,
            batch_demand(&config.consensus),
        );

        let mut handles: Vec<JoinHandle<(ParticipantId, Duration, Result<Node<SimNetManager>, ConsensusError>)>> =
            Vec::new();
        for (id, role) in self.roles.iter().enumerate() {
            let (net, inbox) = network.connect(id);
            match role {
                Role::Fair => {
                    let mut node = Node::new(net, config.consensus.clone(), Arc::clone(&self.rule));
                    for tx in pools[id].drain(..) {
                        node.pool_mut().add_tx(tx);
                    }
                    handles.push(tokio::spawn(async move {
                        let started = Instant::now();
                        let result = run_node(node, inbox).await;
                        (id, started.elapsed(), result)
                    }));
                }
                faulty => {
                    debug!(id, role = %faulty, "spawning faulty participant");
                    let role = *faulty;
                    let batches = faulty_batches(&mut rng, &config.consensus);
                    // Detached: the task drains its inbox until the honest
                    // participants hang up.
                    tokio::spawn(run_faulty(role, net, inbox, n, batches));
                }
            }
        }

        let mut nodes = Vec::new();
        for joined in join_all(handles).await {
            let (id, runtime, result) = joined.expect("node task must not panic");
            let (chain, blocks) = result?.finish();
            nodes.push(NodeOutcome { id, chain, runtime, blocks });
        }
        nodes.sort_by_key(|outcome| outcome.id);
        info!(scenario = %config.scenario, honest = nodes.len(), "simulation finished");
        Ok(SimulationRun { nodes })
    }
}

/// Append one CSV result row for a completed run.
pub fn write_results<W: io::Write>(
    writer: &mut csv::Writer<W>,
    config: &SimulationConfig,
    run_id: usize,
    run: &SimulationRun,
) -> csv::Result<()> {
    writer.write_record([
        "DBFT".to_string(),
        config.scenario.clone(),
        run_id.to_string(),
        config.participants.to_string(),
        config.faulty.to_string(),
        format!("{:.6}", run.average_runtime_secs()),
        config.consensus.batch_size.to_string(),
        run.max_rounds().to_string(),
        run.block_size().to_string(),
    ])?;
    writer.flush()?;
    Ok(())
}

// Transactions a node may consume: one batch per produced block, plus one
// batch of slack for a pre-created instance.
fn batch_demand(consensus: &ConsensusConfig) -> usize {
    let blocks = usize::try_from(consensus.max_blocks).expect("block target fits in usize");
    (blocks + 1) * consensus.batch_size
}

/// Seed every participant's pool. Each generated transaction is replicated
/// into `f + 1` successive pools so at least one correct participant can
/// propose it; short pools are topped up so no node starves.
fn generate_transactions(
    rng: &mut StdRng,
    n: usize,
    f: usize,
    per_node: usize,
) -> Vec<Vec<Transaction>> {
    let mut pools = vec![Vec::new(); n];
    let shared = per_node * n / (f + 1);
    for _ in 0..shared {
        let tx: Transaction = rng.gen_range(1..Transaction::MAX);
        let mut node = usize::try_from(tx % n as u64).expect("participant index fits in usize");
        for _ in 0..=f {
            pools[node].push(tx);
            node = (node + 1) % n;
        }
    }
    for pool in &mut pools {
        while pool.len() < per_node {
            pool.push(rng.gen_range(1..Transaction::MAX));
        }
    }
    pools
}

// Batches a flooding participant proposes, one per block height.
fn faulty_batches(rng: &mut StdRng, consensus: &ConsensusConfig) -> Vec<Vec<Transaction>> {
    (0..consensus.max_blocks)
        .map(|_| (0..consensus.batch_size).map(|_| rng.gen_range(1..Transaction::MAX)).collect())
        .collect()
}

/// The faulty participant's main loop: emit the role's traffic, then drain
/// the inbox so honest senders never block on a full queue.
async fn run_faulty(
    role: Role,
    mut net: SimNetManager,
    mut inbox: mpsc::Receiver<Message>,
    n: usize,
    batches: Vec<Vec<Transaction>>,
) {
    let id = net.id();
    match role {
        Role::Fair => unreachable!("fair participants run real nodes"),
        Role::FailStop => {}
        Role::TxRejector | Role::BinConCrasher => {
            for (block_id, batch) in batches.into_iter().enumerate() {
                let block_id = block_id as BlockId;
                net.broadcast(MessageBody::RbInit(ProposalPayload {
                    block_id,
                    transactions: batch,
                    index: id,
                }));
                for bin_con_id in 0..n {
                    for round in 0..FLOOD_ROUNDS {
                        flood_round(role, &mut net, block_id, bin_con_id, round);
                    }
                }
            }
        }
    }
    // Senders to this participant hang up once the honest nodes stop.
    drop(net);
    while inbox.recv().await.is_some() {}
}

fn flood_round(
    role: Role,
    net: &mut SimNetManager,
    block_id: BlockId,
    bin_con_id: usize,
    round: Round,
) {
    use crate::bin_values::BinValues;

    match role {
        Role::TxRejector => {
            net.broadcast(MessageBody::Bv(BvPayload { block_id, bin_con_id, round, value: 0 }));
            net.broadcast(MessageBody::Aux(AuxPayload {
                block_id,
                bin_con_id,
                round,
                binvalues: BinValues::ZERO.bits(),
            }));
            net.broadcast(MessageBody::Coord(CoordPayload {
                block_id,
                bin_con_id,
                round,
                binvalues: BinValues::ZERO.bits(),
            }));
        }
        Role::BinConCrasher => {
            for value in [0, 1] {
                net.broadcast(MessageBody::Bv(BvPayload { block_id, bin_con_id, round, value }));
            }
            net.broadcast(MessageBody::Aux(AuxPayload {
                block_id,
                bin_con_id,
                round,
                binvalues: BinValues::BOTH.bits(),
            }));
            for binvalues in [BinValues::ZERO, BinValues::ONE] {
                net.broadcast(MessageBody::Coord(CoordPayload {
                    block_id,
                    bin_con_id,
                    round,
                    binvalues: binvalues.bits(),
                }));
            }
        }
        Role::Fair | Role::FailStop => unreachable!("only flooding roles emit traffic"),
    }
}
