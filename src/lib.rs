#![warn(missing_docs)]
//! Leaderless Byzantine fault tolerant consensus over a replicated
//! transaction log.
//!
//! Every participant proposes a batch of transactions per block; the stack
//! agrees on which proposals enter the block even with up to `f` Byzantine
//! participants among `n >= 3f + 1`. Three layers do the work:
//! 1. Bracha reliable broadcast disseminates every proposal.
//! 2. Binary value broadcast plus binary consensus decide, per proposer,
//!    whether its proposal arrived in time. Two interchangeable variants: a
//!    fully asynchronous one and a partially synchronous one with a
//!    rotating coordinator and per-round timers.
//! 3. The multi-valued layer runs `n` binary instances in parallel and
//!    assembles the block from the proposals that decided 1, filtered by
//!    the caller's conflict rule.
//!
//! The protocol layers are pure state machines: handlers mutate local state
//! and return the broadcasts, deliveries, and timers for the caller to
//! execute. The node orchestrator is the only component that touches the
//! transport, so a participant's entire protocol state is mutated from one
//! serialized context and needs no locks.

pub mod bin_values;
pub mod binary_consensus;
pub mod binary_value_broadcast;
pub mod chain;
pub mod config;
pub mod dbft;
#[allow(missing_docs)]
pub mod message;
#[allow(missing_docs)]
pub mod metrics;
pub mod network;
pub mod node;
pub mod quorum;
pub mod reliable_broadcast;
pub mod simulation;
#[allow(missing_docs)]
pub mod types;
