//! Bracha reliable broadcast.
//!
//! Disseminates an arbitrary payload so that all correct participants
//! deliver the same payloads (integrity) and deliver a payload whenever any
//! correct participant does (totality). Instances are content addressed: a
//! payload's digest identifies its broadcast, so the layer carries no
//! originator bookkeeping and the three phases of concurrent broadcasts
//! interleave freely.
//!
//! The layer performs no IO: `broadcast` and `process` return the phase
//! messages to send and the delivery, if one completed.

#[cfg(test)]
#[path = "reliable_broadcast_test.rs"]
mod reliable_broadcast_test;

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::trace;

use crate::message::{payload_digest, PayloadDigest};
use crate::quorum::Quorum;
use crate::types::ParticipantId;

/// The three message phases, in protocol order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RbPhase {
    /// The originator announcing its payload.
    Init,
    /// A witness vouching it saw the announcement.
    Echo,
    /// A witness vouching delivery is safe.
    Ready,
}

/// Per-instance state; monotone non-decreasing.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd)]
enum RbState {
    #[default]
    Init,
    Echo,
    Ready,
    Delivered,
}

/// A step the caller must execute on behalf of the broadcast layer.
#[derive(Debug, PartialEq)]
pub enum RbOutput<P> {
    /// Send the given phase message to every participant.
    Broadcast(RbPhase, P),
    /// The payload completed totality; emitted exactly once per instance.
    Deliver(P),
}

#[derive(Debug, Default)]
struct RbInstance {
    state: RbState,
    echo_senders: HashSet<ParticipantId>,
    ready_senders: HashSet<ParticipantId>,
}

/// One participant's view over any number of concurrent broadcasts.
pub struct ReliableBroadcast {
    quorum: Quorum,
    instances: HashMap<PayloadDigest, RbInstance>,
}

impl ReliableBroadcast {
    /// A broadcast layer for the given participant set.
    pub fn new(quorum: Quorum) -> Self {
        Self { quorum, instances: HashMap::new() }
    }

    /// Originate a broadcast of `payload`.
    pub fn broadcast<P: Serialize + Clone>(&mut self, payload: P) -> Vec<RbOutput<P>> {
        let digest = payload_digest(&payload);
        self.instances.entry(digest).or_default();
        vec![RbOutput::Broadcast(RbPhase::Init, payload)]
    }

    /// Feed one received phase message.
    ///
    /// Stale and duplicate input falls out: sender sets deduplicate, and a
    /// delivered instance ignores everything.
    pub fn process<P: Serialize + Clone>(
        &mut self,
        from: ParticipantId,
        phase: RbPhase,
        payload: P,
    ) -> Vec<RbOutput<P>> {
        let digest = payload_digest(&payload);
        let instance = self.instances.entry(digest).or_default();
        if instance.state == RbState::Delivered {
            return Vec::new();
        }

        let mut output = Vec::new();
        match phase {
            RbPhase::Init => {
                if instance.state == RbState::Init {
                    instance.state = RbState::Echo;
                    output.push(RbOutput::Broadcast(RbPhase::Echo, payload));
                }
            }
            RbPhase::Echo => {
                instance.echo_senders.insert(from);
                if instance.state < RbState::Ready
                    && instance.echo_senders.len() >= self.quorum.supermajority()
                {
                    instance.state = RbState::Ready;
                    output.push(RbOutput::Broadcast(RbPhase::Ready, payload));
                }
            }
            RbPhase::Ready => {
                instance.ready_senders.insert(from);
                if instance.state < RbState::Ready
                    && instance.ready_senders.len() >= self.quorum.one_correct()
                {
                    // f + 1 readies prove a correct participant saw the echo
                    // quorum; amplify so everyone reaches delivery.
                    instance.state = RbState::Ready;
                    output.push(RbOutput::Broadcast(RbPhase::Ready, payload.clone()));
                }
                if instance.ready_senders.len() >= self.quorum.supermajority() {
                    instance.state = RbState::Delivered;
                    trace!(readies = instance.ready_senders.len(), "rb delivery");
                    output.push(RbOutput::Deliver(payload));
                }
            }
        }
        output
    }

    /// Whether `payload` has been delivered by this participant.
    pub fn is_delivered<P: Serialize>(&self, payload: &P) -> bool {
        self.instances
            .get(&payload_digest(payload))
            .is_some_and(|instance| instance.state == RbState::Delivered)
    }
}
