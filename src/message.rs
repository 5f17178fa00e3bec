//! Wire messages exchanged by the consensus stack.
//!
//! `binvalues` fields carry the two-bit mask of [`crate::bin_values`] as a
//! raw byte and `value` fields a raw 0/1 byte: Byzantine senders can put
//! anything there, so validation happens in the handlers, not in the type.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chain::Transaction;
use crate::types::{BinConsensusId, BlockId, ParticipantId, Round};

/// A message as delivered by the transport. `from` is stamped by the
/// sender's transport and never read from the payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub from: ParticipantId,
    pub body: MessageBody,
}

/// The closed set of message bodies understood by the stack.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    RbInit(ProposalPayload),
    RbEcho(ProposalPayload),
    RbReady(ProposalPayload),
    Bv(BvPayload),
    Aux(AuxPayload),
    Coord(CoordPayload),
    /// Local only: a round timer armed through the transport fired.
    RoundTimeout(TimeoutPayload),
}

impl MessageBody {
    /// The block height this message is scoped to.
    pub fn block_id(&self) -> BlockId {
        match self {
            MessageBody::RbInit(p) | MessageBody::RbEcho(p) | MessageBody::RbReady(p) => p.block_id,
            MessageBody::Bv(p) => p.block_id,
            MessageBody::Aux(p) => p.block_id,
            MessageBody::Coord(p) => p.block_id,
            MessageBody::RoundTimeout(p) => p.block_id,
        }
    }
}

/// One participant's proposal for a block: its batch of transactions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalPayload {
    pub block_id: BlockId,
    pub transactions: Vec<Transaction>,
    pub index: ParticipantId,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BvPayload {
    pub block_id: BlockId,
    pub bin_con_id: BinConsensusId,
    pub round: Round,
    pub value: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuxPayload {
    pub block_id: BlockId,
    pub bin_con_id: BinConsensusId,
    pub round: Round,
    pub binvalues: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoordPayload {
    pub block_id: BlockId,
    pub bin_con_id: BinConsensusId,
    pub round: Round,
    pub binvalues: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPayload {
    pub block_id: BlockId,
    pub bin_con_id: BinConsensusId,
    pub round: Round,
}

/// Content address of a reliable-broadcast payload: the SHA-256 digest of
/// its canonical JSON encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PayloadDigest([u8; 32]);

/// Digest used to key reliable-broadcast instances by content.
pub fn payload_digest<P: Serialize>(payload: &P) -> PayloadDigest {
    let encoded = serde_json::to_vec(payload).expect("payload encoding is infallible");
    PayloadDigest(Sha256::digest(&encoded).into())
}
