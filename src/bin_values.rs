//! The set of binary values validated within one consensus round.
//!
//! Encoded as a two-bit mask (bit 0 for the value 0, bit 1 for the value 1)
//! so it travels on the wire unchanged.

#[cfg(test)]
#[path = "bin_values_test.rs"]
mod bin_values_test;

use std::fmt;

use serde::{Deserialize, Serialize};

/// A subset of `{0, 1}`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct BinValues(u8);

impl BinValues {
    /// The empty set.
    pub const NONE: Self = Self(0);
    /// `{0}`.
    pub const ZERO: Self = Self(0b01);
    /// `{1}`.
    pub const ONE: Self = Self(0b10);
    /// `{0, 1}`.
    pub const BOTH: Self = Self(0b11);

    /// The singleton containing `value`.
    pub fn single(value: bool) -> Self {
        if value {
            Self::ONE
        } else {
            Self::ZERO
        }
    }

    /// The raw two-bit mask.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether `value` is in the set.
    pub fn contains(self, value: bool) -> bool {
        self.0 & Self::single(value).0 != 0
    }

    /// Adds `value`; returns whether the set changed.
    pub fn insert(&mut self, value: bool) -> bool {
        let updated = self.union(Self::single(value));
        let changed = updated != *self;
        *self = updated;
        changed
    }

    /// Set union.
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether every element of `self` is in `other`.
    pub fn is_subset_of(self, other: Self) -> bool {
        self.0 & other.0 == self.0
    }

    /// The contained value, if the set is a singleton.
    pub fn as_singleton(self) -> Option<bool> {
        match self {
            Self::ZERO => Some(false),
            Self::ONE => Some(true),
            _ => None,
        }
    }
}

impl fmt::Display for BinValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => write!(f, "{{}}"),
            Self::ZERO => write!(f, "{{0}}"),
            Self::ONE => write!(f, "{{1}}"),
            _ => write!(f, "{{0,1}}"),
        }
    }
}

/// A wire byte that does not encode a subset of `{0, 1}`.
#[derive(Debug, PartialEq)]
pub struct InvalidBinValues(pub u8);

impl fmt::Display for InvalidBinValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid binary value set encoding: {}", self.0)
    }
}

impl std::error::Error for InvalidBinValues {}

impl TryFrom<u8> for BinValues {
    type Error = InvalidBinValues;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        if bits > Self::BOTH.0 {
            return Err(InvalidBinValues(bits));
        }
        Ok(Self(bits))
    }
}

impl From<BinValues> for u8 {
    fn from(values: BinValues) -> u8 {
        values.0
    }
}
