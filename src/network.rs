//! Transport facade and the in-memory simulation network.
//!
//! The protocol layers never touch the transport; the node orchestrator
//! executes their requests through [`NetManager`]. Timers are modelled as a
//! message the transport posts back to the owning participant after the
//! delay, so the expiry runs in the same serialized context as every other
//! delivery.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

use crate::message::{Message, MessageBody};
use crate::types::ParticipantId;

/// What the consensus core asks of the transport.
///
/// The contract is weak on purpose: delivery between correct online
/// participants is eventual, duplicates are possible, ordering is
/// arbitrary. `from` is stamped by the sending side.
pub trait NetManager {
    /// This participant's id.
    fn id(&self) -> ParticipantId;
    /// Size of the participant set.
    fn num_participants(&self) -> usize;
    /// Send `body` to every participant, this one included.
    fn broadcast(&mut self, body: MessageBody);
    /// Send `body` to a single participant.
    fn send(&mut self, to: ParticipantId, body: MessageBody);
    /// Deliver `body` back to this participant after `after` elapses.
    fn set_timer(&mut self, after: Duration, body: MessageBody);
    /// Stop sending; pending deliveries to this participant are dropped by
    /// the receiver going away.
    fn stop(&mut self);
}

/// Seeded per-message delivery delay. Reorders traffic without breaking
/// the eventual-delivery contract.
#[derive(Clone, Copy, Debug)]
pub struct DeliveryJitter {
    /// Seed for the per-sender delay sequence.
    pub seed: u64,
    /// Upper bound on the added delay.
    pub max_delay: Duration,
}

/// An in-memory network: one bounded queue per participant.
///
/// Queue overflow is fatal by design; the protocol is not flow controlled
/// and an overflow means the simulation is misconfigured.
pub struct SimNetwork {
    senders: Vec<mpsc::Sender<Message>>,
    receivers: Vec<Option<mpsc::Receiver<Message>>>,
    jitter: Option<DeliveryJitter>,
}

impl SimNetwork {
    /// A network of `n` participants with per-participant queue `capacity`.
    pub fn new(n: usize, capacity: usize) -> Self {
        let (senders, receivers) = (0..n)
            .map(|_| {
                let (sender, receiver) = mpsc::channel(capacity);
                (sender, Some(receiver))
            })
            .unzip();
        Self { senders, receivers, jitter: None }
    }

    /// Apply seeded random delivery delays to every message.
    pub fn with_jitter(mut self, jitter: DeliveryJitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Hand out participant `id`'s transport handle and inbox. Each
    /// participant connects exactly once.
    pub fn connect(&mut self, id: ParticipantId) -> (SimNetManager, mpsc::Receiver<Message>) {
        let receiver = self.receivers[id].take().expect("participant connected twice");
        let jitter = self
            .jitter
            .map(|jitter| Jitter {
                rng: StdRng::seed_from_u64(jitter.seed.wrapping_add(id as u64)),
                max_delay: jitter.max_delay,
            });
        let manager =
            SimNetManager { id, peers: self.senders.clone(), jitter, stopped: false };
        (manager, receiver)
    }
}

struct Jitter {
    rng: StdRng,
    max_delay: Duration,
}

/// One participant's handle into a [`SimNetwork`].
pub struct SimNetManager {
    id: ParticipantId,
    peers: Vec<mpsc::Sender<Message>>,
    jitter: Option<Jitter>,
    stopped: bool,
}

impl SimNetManager {
    fn deliver(&mut self, to: ParticipantId, msg: Message) {
        let delay = self.jitter.as_mut().map(|jitter| {
            Duration::from_micros(
                jitter.rng.gen_range(0..=u64::try_from(jitter.max_delay.as_micros()).expect(
                    "jitter delay fits in u64",
                )),
            )
        });
        match delay {
            None => enqueue(&self.peers[to], msg),
            Some(delay) => {
                let sender = self.peers[to].clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    enqueue(&sender, msg);
                });
            }
        }
    }
}

fn enqueue(sender: &mpsc::Sender<Message>, msg: Message) {
    match sender.try_send(msg) {
        Ok(()) => {}
        // The receiver stopped; late traffic to it is dropped.
        Err(TrySendError::Closed(msg)) => trace!(?msg, "dropping delivery to a stopped node"),
        Err(TrySendError::Full(msg)) => {
            panic!("delivery queue overflow, the simulation is misconfigured: {msg:?}")
        }
    }
}

impl NetManager for SimNetManager {
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn num_participants(&self) -> usize {
        self.peers.len()
    }

    fn broadcast(&mut self, body: MessageBody) {
        if self.stopped {
            return;
        }
        let msg = Message { from: self.id, body };
        for to in 0..self.peers.len() {
            self.deliver(to, msg.clone());
        }
    }

    fn send(&mut self, to: ParticipantId, body: MessageBody) {
        if self.stopped {
            return;
        }
        self.deliver(to, Message { from: self.id, body });
    }

    fn set_timer(&mut self, after: Duration, body: MessageBody) {
        if self.stopped {
            return;
        }
        let sender = self.peers[self.id].clone();
        let msg = Message { from: self.id, body };
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            enqueue(&sender, msg);
        });
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}
