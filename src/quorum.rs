//! Quorum arithmetic for a participant set of size `n` tolerating up to
//! `f = (n - 1) / 3` Byzantine faults.

#[cfg(test)]
#[path = "quorum_test.rs"]
mod quorum_test;

use serde::{Deserialize, Serialize};

use crate::types::{ParticipantId, Round};

/// The three thresholds every layer of the stack gates on, derived once
/// from `n`. Note that if the set is too small to tolerate a fault
/// (`n < 4`), construction fails.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quorum {
    n: usize,
    f: usize,
}

impl Quorum {
    /// Thresholds for `n` participants.
    ///
    /// Panics if `n < 4`; smaller sets cannot tolerate a single fault.
    pub fn new(n: usize) -> Self {
        assert!(n >= 4, "at least 4 participants are required, got {n}");
        Self { n, f: (n - 1) / 3 }
    }

    /// Total participant count.
    pub fn participants(&self) -> usize {
        self.n
    }

    /// Maximum number of Byzantine participants tolerated.
    pub fn max_faulty(&self) -> usize {
        self.f
    }

    /// `n - f`: any two sets of this size intersect in at least one correct
    /// participant.
    pub fn supermajority(&self) -> usize {
        self.n - self.f
    }

    /// `f + 1`: a set of this size contains at least one correct
    /// participant.
    pub fn one_correct(&self) -> usize {
        self.f + 1
    }

    /// `2f + 1`: a set of this size contains a majority of correct
    /// participants.
    pub fn correct_majority(&self) -> usize {
        2 * self.f + 1
    }

    /// Whether `id` belongs to the participant set.
    pub fn is_participant(&self, id: ParticipantId) -> bool {
        id < self.n
    }

    /// The round-robin coordinator of `round`.
    pub fn coordinator(&self, round: Round) -> ParticipantId {
        usize::try_from(round).expect("round fits in usize") % self.n
    }
}
